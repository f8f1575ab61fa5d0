//! Store statistics and sync overview.
//!
//! Summarizes what the gateway is tracking: connections, snapshot tables,
//! watermarked row counts and when each connection last synced. Used by
//! `dbgate stats` to confirm syncs are advancing.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::progress::format_number;

/// Per-connection breakdown.
struct ConnectionStats {
    name: String,
    dialect: String,
    table_count: i64,
    failed_count: i64,
    tracked_rows: i64,
    last_sync_ms: Option<i64>,
}

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_connections: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM connections")
        .fetch_one(&pool)
        .await?;

    let total_tables: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshot_tables")
        .fetch_one(&pool)
        .await?;

    let total_watermarks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_watermarks")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("dbgate — Store Stats");
    println!("====================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  Connections:  {}", total_connections);
    println!("  Tables:       {}", total_tables);
    println!("  Watermarks:   {}", total_watermarks);

    let rows = sqlx::query(
        r#"
        SELECT
            c.display_name,
            c.dialect,
            (SELECT COUNT(*) FROM snapshot_tables s WHERE s.connection_id = c.id) AS table_count,
            (SELECT COUNT(*) FROM snapshot_tables s
                WHERE s.connection_id = c.id
                AND json_extract(s.descriptor_json, '$.error') IS NOT NULL) AS failed_count,
            (SELECT COALESCE(SUM(w.last_row_count), 0) FROM sync_watermarks w
                WHERE w.connection_id = c.id) AS tracked_rows,
            (SELECT MAX(w.last_synced_at) FROM sync_watermarks w
                WHERE w.connection_id = c.id) AS last_sync_ms
        FROM connections c
        ORDER BY c.created_at
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let mut stats: Vec<ConnectionStats> = Vec::new();
    for row in &rows {
        stats.push(ConnectionStats {
            name: row.try_get("display_name")?,
            dialect: row.try_get("dialect")?,
            table_count: row.try_get("table_count")?,
            failed_count: row.try_get("failed_count")?,
            tracked_rows: row.try_get("tracked_rows")?,
            last_sync_ms: row.try_get("last_sync_ms")?,
        });
    }

    if !stats.is_empty() {
        println!();
        println!("  By connection:");
        println!(
            "  {:<24} {:<8} {:>6} {:>6} {:>12}   {}",
            "CONNECTION", "DIALECT", "TABLES", "FAILED", "ROWS", "LAST SYNC"
        );
        println!("  {}", "-".repeat(80));

        for s in &stats {
            let sync_display = match s.last_sync_ms {
                Some(ms) => format_ts_relative(ms / 1000),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:<8} {:>6} {:>6} {:>12}   {}",
                s.name,
                s.dialect,
                s.table_count,
                s.failed_count,
                format_number(u64::try_from(s.tracked_rows).unwrap_or(0)),
                sync_display
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp (seconds) as a relative time string.
pub(crate) fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
