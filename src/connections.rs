//! Connection lifecycle: establish and delete.
//!
//! Establishing a connection proves the credentials work before anything is
//! stored: the pool is opened through the strategy ladder, the whole schema
//! is introspected, and only then are the connection, its snapshot and its
//! initial watermarks persisted. Seeding watermarks from the introspection
//! counts means the first sync only re-fetches tables that grew since.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use dbgate_core::models::{Connection, Dialect, PipelineMode, SyncWatermark, TableUpdate};
use dbgate_core::store::{ConnectionStore, WatermarkStore};

use crate::index::{HandoffReport, IndexHandoff};
use crate::introspect::{describe_schema, Introspection, IntrospectOptions};
use crate::pool::PoolRegistry;
use crate::strategy::redact_uri;

/// Input for [`ConnectionService::establish`].
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub owner_id: String,
    pub display_name: String,
    pub dialect: Dialect,
    pub credentials_uri: String,
    pub pipeline_mode: PipelineMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct EstablishReport {
    pub connection_id: String,
    pub tables: usize,
    pub failed_tables: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff: Option<HandoffReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff_error: Option<String>,
}

pub struct ConnectionService {
    registry: Arc<PoolRegistry>,
    connections: Arc<dyn ConnectionStore>,
    watermarks: Arc<dyn WatermarkStore>,
    handoff: Arc<IndexHandoff>,
    options: IntrospectOptions,
}

impl ConnectionService {
    pub fn new(
        registry: Arc<PoolRegistry>,
        connections: Arc<dyn ConnectionStore>,
        watermarks: Arc<dyn WatermarkStore>,
        handoff: Arc<IndexHandoff>,
        options: IntrospectOptions,
    ) -> Self {
        Self {
            registry,
            connections,
            watermarks,
            handoff,
            options,
        }
    }

    pub async fn establish(&self, new: NewConnection) -> Result<EstablishReport> {
        let connection = Connection {
            id: Uuid::new_v4().to_string(),
            owner_id: new.owner_id,
            display_name: new.display_name,
            dialect: new.dialect,
            credentials_uri: new.credentials_uri,
            pipeline_mode: new.pipeline_mode,
            created_at: Utc::now(),
        };
        info!(
            connection_id = %connection.id,
            dialect = %connection.dialect,
            uri = %redact_uri(&connection.credentials_uri),
            "establishing connection"
        );

        let pool = self
            .registry
            .acquire(&connection.id, connection.dialect, &connection.credentials_uri)
            .await?;

        let introspection = match describe_schema(pool.as_ref(), self.options).await {
            Ok(i) => i,
            Err(e) => {
                self.registry.release(&connection.id).await;
                return Err(e.context("schema introspection failed"));
            }
        };

        if let Err(e) = self.persist(&connection, &introspection).await {
            // Leave nothing behind: the cascade removes any partial rows.
            if let Err(cleanup) = self.connections.delete_connection(&connection.id).await {
                warn!(connection_id = %connection.id, error = %cleanup, "cleanup after failed persist");
            }
            self.registry.release(&connection.id).await;
            return Err(e);
        }

        let failed_tables: Vec<String> = introspection
            .failed()
            .map(|t| t.descriptor.table_name.clone())
            .collect();
        let mut report = EstablishReport {
            connection_id: connection.id.clone(),
            tables: introspection.tables.len(),
            failed_tables,
            handoff: None,
            handoff_error: None,
        };

        if connection.pipeline_mode == PipelineMode::Indexed {
            let updates: Vec<TableUpdate> = introspection.healthy().map(TableUpdate::from).collect();
            match self.handoff.deliver(&connection.id, &updates).await {
                Ok(handoff) => report.handoff = Some(handoff),
                Err(e) => {
                    warn!(connection_id = %connection.id, error = %format!("{:#}", e), "index hand-off failed");
                    report.handoff_error = Some(format!("{:#}", e));
                }
            }
        }

        info!(
            connection_id = %connection.id,
            tables = report.tables,
            failed = report.failed_tables.len(),
            "connection established"
        );
        Ok(report)
    }

    async fn persist(&self, connection: &Connection, introspection: &Introspection) -> Result<()> {
        self.connections
            .insert_connection(connection)
            .await
            .context("failed to store connection")?;
        self.connections
            .upsert_tables(&connection.id, &introspection.tables)
            .await
            .context("failed to store snapshot")?;

        let now = Utc::now();
        for table in introspection.healthy() {
            let name = &table.descriptor.table_name;
            let Some(count) = introspection.counts.get(name) else {
                continue;
            };
            self.watermarks
                .upsert_watermark(&SyncWatermark {
                    connection_id: connection.id.clone(),
                    table_name: name.clone(),
                    last_row_count: *count,
                    last_synced_at: now,
                    dialect: connection.dialect,
                })
                .await
                .with_context(|| format!("failed to seed watermark for '{}'", name))?;
        }
        Ok(())
    }

    /// Close the connection's pools and delete it with everything stored
    /// for it. Returns whether the connection existed.
    pub async fn delete(&self, connection_id: &str) -> Result<bool> {
        let closed = self.registry.release(connection_id).await;
        let existed = self.connections.delete_connection(connection_id).await?;
        info!(connection_id, pools_closed = closed, existed, "connection deleted");
        Ok(existed)
    }
}
