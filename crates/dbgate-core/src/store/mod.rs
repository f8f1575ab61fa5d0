//! Storage abstraction for connection descriptors, snapshots and
//! sync watermarks.
//!
//! The gateway treats both stores as external collaborators: they hold no
//! business logic, only reads and upserts. [`ConnectionStore`] owns the
//! connection descriptors with their schema and data snapshots;
//! [`WatermarkStore`] owns the per-table row-count watermarks.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Connection, FetchedTable, Snapshot, SyncWatermark};

/// Persisted connection descriptors and their snapshots.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_connection`](ConnectionStore::insert_connection) | Register a new connection |
/// | [`get_connection`](ConnectionStore::get_connection) | Look up a connection by id |
/// | [`list_connections`](ConnectionStore::list_connections) | All connections, oldest first |
/// | [`delete_connection`](ConnectionStore::delete_connection) | Remove a connection and everything hanging off it |
/// | [`load_snapshot`](ConnectionStore::load_snapshot) | Schema + data snapshot for a connection |
/// | [`upsert_tables`](ConnectionStore::upsert_tables) | Merge fetched tables by name |
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Insert a connection. Fails if the id already exists.
    async fn insert_connection(&self, connection: &Connection) -> Result<()>;

    async fn get_connection(&self, id: &str) -> Result<Option<Connection>>;

    async fn list_connections(&self) -> Result<Vec<Connection>>;

    /// Delete a connection, cascading to its snapshot and watermarks.
    ///
    /// Returns `false` when the connection did not exist.
    async fn delete_connection(&self, id: &str) -> Result<bool>;

    /// Load the snapshot for a connection. Unknown ids yield an empty one.
    async fn load_snapshot(&self, connection_id: &str) -> Result<Snapshot>;

    /// Upsert tables into the snapshot by table name. Tables not listed
    /// are left untouched; new tables are appended after existing ones.
    async fn upsert_tables(&self, connection_id: &str, tables: &[FetchedTable]) -> Result<()>;
}

/// Persisted `(connection, table) → watermark` mapping.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get_watermark(
        &self,
        connection_id: &str,
        table_name: &str,
    ) -> Result<Option<SyncWatermark>>;

    async fn list_watermarks(&self, connection_id: &str) -> Result<Vec<SyncWatermark>>;

    /// Insert the watermark, or overwrite the existing one for the same
    /// `(connection_id, table_name)`.
    async fn upsert_watermark(&self, watermark: &SyncWatermark) -> Result<()>;
}
