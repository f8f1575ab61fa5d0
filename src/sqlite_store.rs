//! SQLite-backed [`ConnectionStore`] and [`WatermarkStore`].
//!
//! Snapshots are stored one row per table (`snapshot_tables`), so a sync
//! that touches three tables rewrites three rows rather than the whole
//! snapshot. Timestamps are stored as Unix milliseconds.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use dbgate_core::models::{
    Connection, Dialect, FetchedTable, PipelineMode, Record, Snapshot, SyncWatermark,
    TableDescriptor,
};
use dbgate_core::store::{ConnectionStore, WatermarkStore};

/// SQLite implementation of both store traits.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn connection_from_row(row: &SqliteRow) -> Result<Connection> {
    let dialect: String = row.try_get("dialect")?;
    let pipeline_mode: String = row.try_get("pipeline_mode")?;
    Ok(Connection {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        display_name: row.try_get("display_name")?,
        dialect: dialect.parse()?,
        credentials_uri: row.try_get("credentials_uri")?,
        pipeline_mode: pipeline_mode.parse()?,
        created_at: from_millis(row.try_get("created_at")?),
    })
}

fn watermark_from_row(row: &SqliteRow) -> Result<SyncWatermark> {
    let dialect: String = row.try_get("dialect")?;
    let count: i64 = row.try_get("last_row_count")?;
    Ok(SyncWatermark {
        connection_id: row.try_get("connection_id")?,
        table_name: row.try_get("table_name")?,
        last_row_count: u64::try_from(count).unwrap_or(0),
        last_synced_at: from_millis(row.try_get("last_synced_at")?),
        dialect: dialect.parse::<Dialect>()?,
    })
}

#[async_trait]
impl ConnectionStore for SqliteStore {
    async fn insert_connection(&self, connection: &Connection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO connections (id, owner_id, display_name, dialect, credentials_uri, pipeline_mode, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&connection.id)
        .bind(&connection.owner_id)
        .bind(&connection.display_name)
        .bind(connection.dialect.as_str())
        .bind(&connection.credentials_uri)
        .bind(connection.pipeline_mode.as_str())
        .bind(connection.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert connection '{}'", connection.id))?;
        Ok(())
    }

    async fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        let row = sqlx::query("SELECT * FROM connections WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(connection_from_row).transpose()
    }

    async fn list_connections(&self) -> Result<Vec<Connection>> {
        let rows = sqlx::query("SELECT * FROM connections ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(connection_from_row).collect()
    }

    async fn delete_connection(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM sync_watermarks WHERE connection_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM snapshot_tables WHERE connection_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM connections WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn load_snapshot(&self, connection_id: &str) -> Result<Snapshot> {
        let rows = sqlx::query(
            "SELECT table_name, descriptor_json, rows_json FROM snapshot_tables WHERE connection_id = ? ORDER BY position",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = Snapshot::default();
        for row in &rows {
            let table_name: String = row.try_get("table_name")?;
            let descriptor_json: String = row.try_get("descriptor_json")?;
            let rows_json: String = row.try_get("rows_json")?;

            let descriptor: TableDescriptor = serde_json::from_str(&descriptor_json)
                .with_context(|| format!("corrupt descriptor for table '{}'", table_name))?;
            let records: Vec<Record> = serde_json::from_str(&rows_json)
                .with_context(|| format!("corrupt sample rows for table '{}'", table_name))?;

            snapshot.schema.tables.push(descriptor);
            snapshot.data.replace(table_name, records);
        }
        Ok(snapshot)
    }

    async fn upsert_tables(&self, connection_id: &str, tables: &[FetchedTable]) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for table in tables {
            let descriptor_json = serde_json::to_string(&table.descriptor)?;
            let rows_json = serde_json::to_string(&table.rows)?;
            sqlx::query(
                r#"
                INSERT INTO snapshot_tables (connection_id, table_name, position, descriptor_json, rows_json, updated_at)
                VALUES (?, ?, COALESCE((SELECT MAX(position) + 1 FROM snapshot_tables WHERE connection_id = ?), 0), ?, ?, ?)
                ON CONFLICT(connection_id, table_name) DO UPDATE SET
                    descriptor_json = excluded.descriptor_json,
                    rows_json = excluded.rows_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(connection_id)
            .bind(&table.descriptor.table_name)
            .bind(connection_id)
            .bind(&descriptor_json)
            .bind(&rows_json)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for SqliteStore {
    async fn get_watermark(
        &self,
        connection_id: &str,
        table_name: &str,
    ) -> Result<Option<SyncWatermark>> {
        let row = sqlx::query(
            "SELECT * FROM sync_watermarks WHERE connection_id = ? AND table_name = ?",
        )
        .bind(connection_id)
        .bind(table_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(watermark_from_row).transpose()
    }

    async fn list_watermarks(&self, connection_id: &str) -> Result<Vec<SyncWatermark>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_watermarks WHERE connection_id = ? ORDER BY table_name",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(watermark_from_row).collect()
    }

    async fn upsert_watermark(&self, watermark: &SyncWatermark) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_watermarks (connection_id, table_name, last_row_count, last_synced_at, dialect)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, table_name) DO UPDATE SET
                last_row_count = excluded.last_row_count,
                last_synced_at = excluded.last_synced_at,
                dialect = excluded.dialect
            "#,
        )
        .bind(&watermark.connection_id)
        .bind(&watermark.table_name)
        .bind(i64::try_from(watermark.last_row_count).unwrap_or(i64::MAX))
        .bind(watermark.last_synced_at.timestamp_millis())
        .bind(watermark.dialect.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
