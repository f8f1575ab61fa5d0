//! In-memory store implementation for tests and embedding.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Locks are never held
//! across an `.await`.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{Connection, FetchedTable, Snapshot, SyncWatermark};

use super::{ConnectionStore, WatermarkStore};

/// In-memory implementation of both store traits.
#[derive(Default)]
pub struct InMemoryStore {
    connections: RwLock<Vec<Connection>>,
    snapshots: RwLock<HashMap<String, Snapshot>>,
    watermarks: RwLock<HashMap<(String, String), SyncWatermark>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl ConnectionStore for InMemoryStore {
    async fn insert_connection(&self, connection: &Connection) -> Result<()> {
        let mut connections = self.connections.write().map_err(poisoned)?;
        if connections.iter().any(|c| c.id == connection.id) {
            bail!("connection '{}' already exists", connection.id);
        }
        connections.push(connection.clone());
        Ok(())
    }

    async fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        let connections = self.connections.read().map_err(poisoned)?;
        Ok(connections.iter().find(|c| c.id == id).cloned())
    }

    async fn list_connections(&self) -> Result<Vec<Connection>> {
        Ok(self.connections.read().map_err(poisoned)?.clone())
    }

    async fn delete_connection(&self, id: &str) -> Result<bool> {
        let existed = {
            let mut connections = self.connections.write().map_err(poisoned)?;
            let before = connections.len();
            connections.retain(|c| c.id != id);
            connections.len() != before
        };
        self.snapshots.write().map_err(poisoned)?.remove(id);
        self.watermarks
            .write()
            .map_err(poisoned)?
            .retain(|(conn, _), _| conn != id);
        Ok(existed)
    }

    async fn load_snapshot(&self, connection_id: &str) -> Result<Snapshot> {
        let snapshots = self.snapshots.read().map_err(poisoned)?;
        Ok(snapshots.get(connection_id).cloned().unwrap_or_default())
    }

    async fn upsert_tables(&self, connection_id: &str, tables: &[FetchedTable]) -> Result<()> {
        let mut snapshots = self.snapshots.write().map_err(poisoned)?;
        snapshots
            .entry(connection_id.to_string())
            .or_default()
            .merge(tables);
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for InMemoryStore {
    async fn get_watermark(
        &self,
        connection_id: &str,
        table_name: &str,
    ) -> Result<Option<SyncWatermark>> {
        let watermarks = self.watermarks.read().map_err(poisoned)?;
        Ok(watermarks
            .get(&(connection_id.to_string(), table_name.to_string()))
            .cloned())
    }

    async fn list_watermarks(&self, connection_id: &str) -> Result<Vec<SyncWatermark>> {
        let watermarks = self.watermarks.read().map_err(poisoned)?;
        let mut list: Vec<_> = watermarks
            .values()
            .filter(|w| w.connection_id == connection_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.table_name.cmp(&b.table_name));
        Ok(list)
    }

    async fn upsert_watermark(&self, watermark: &SyncWatermark) -> Result<()> {
        self.watermarks.write().map_err(poisoned)?.insert(
            (
                watermark.connection_id.clone(),
                watermark.table_name.clone(),
            ),
            watermark.clone(),
        );
        Ok(())
    }
}
