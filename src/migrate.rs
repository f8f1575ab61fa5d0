use anyhow::Result;
use sqlx::SqlitePool;

/// Create the store schema. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connections (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            dialect TEXT NOT NULL,
            credentials_uri TEXT NOT NULL,
            pipeline_mode TEXT NOT NULL DEFAULT 'indexed',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per (connection, table); position keeps schema order stable.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshot_tables (
            connection_id TEXT NOT NULL,
            table_name TEXT NOT NULL,
            position INTEGER NOT NULL,
            descriptor_json TEXT NOT NULL,
            rows_json TEXT NOT NULL DEFAULT '[]',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (connection_id, table_name),
            FOREIGN KEY (connection_id) REFERENCES connections(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_watermarks (
            connection_id TEXT NOT NULL,
            table_name TEXT NOT NULL,
            last_row_count INTEGER NOT NULL,
            last_synced_at INTEGER NOT NULL,
            dialect TEXT NOT NULL,
            PRIMARY KEY (connection_id, table_name),
            FOREIGN KEY (connection_id) REFERENCES connections(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_snapshot_tables_position ON snapshot_tables(connection_id, position)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
