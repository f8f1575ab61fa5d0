//! Incremental sync engine.
//!
//! A sync pass compares each table's current row count against its stored
//! watermark and re-fetches only the tables that grew:
//!
//! ```text
//! probe ──▶ enumerate ──▶ compare (batches) ──▶ fetch dirty (batches)
//!                                                   │ per table:
//!                                                   │ merge ─▶ watermark
//!                                                   ▼
//!                                             hand off to index
//! ```
//!
//! A table is dirty when `current > last_row_count`; a table with no
//! watermark counts as `0`. Equal or lower counts are "no new data", even
//! if rows were replaced or deleted in place. That blind spot is accepted:
//! counting is cheap, change-data-capture is not.
//!
//! Source failures never surface as `Err`. Probe and enumerate failures end
//! the pass with [`SyncOutcome::Failed`]; per-table failures are recorded
//! in [`SyncReport::skipped`] and retried on the next pass.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use dbgate_core::models::{Connection, FetchedTable, PipelineMode, SyncWatermark, TableUpdate};
use dbgate_core::store::{ConnectionStore, WatermarkStore};

use crate::driver::SourcePool;
use crate::index::{HandoffReport, IndexHandoff};
use crate::introspect::{fetch_table, IntrospectOptions};
use crate::pool::PoolRegistry;
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};

/// Where in the pass something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Probe,
    Enumerate,
    Count,
    Fetch,
    Merge,
    Watermark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced,
    NoChange,
    Failed { stage: SyncStage, message: String },
}

/// A table whose snapshot and watermark were updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableChange {
    pub table: String,
    pub previous_count: Option<u64>,
    pub current_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTable {
    pub table: String,
    pub stage: SyncStage,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub connection_id: String,
    pub outcome: SyncOutcome,
    pub updated: Vec<TableChange>,
    pub unchanged: usize,
    pub skipped: Vec<SkippedTable>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff: Option<HandoffReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff_error: Option<String>,
    pub duration_ms: u64,
}

impl SyncReport {
    fn new(connection_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            outcome: SyncOutcome::NoChange,
            updated: Vec::new(),
            unchanged: 0,
            skipped: Vec::new(),
            handoff: None,
            handoff_error: None,
            duration_ms: 0,
        }
    }

    fn skip(&mut self, table: &str, stage: SyncStage, reason: String) {
        warn!(connection_id = %self.connection_id, table, ?stage, reason = %reason, "table skipped");
        self.skipped.push(SkippedTable {
            table: table.to_string(),
            stage,
            reason,
        });
    }
}

enum Comparison {
    Dirty(TableChange),
    Unchanged,
    Skipped(SkippedTable),
}

pub struct SyncEngine {
    registry: Arc<PoolRegistry>,
    connections: Arc<dyn ConnectionStore>,
    watermarks: Arc<dyn WatermarkStore>,
    handoff: Arc<IndexHandoff>,
    options: IntrospectOptions,
}

impl SyncEngine {
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

    pub async fn sync(&self, connection_id: &str) -> SyncReport {
        self.sync_with_progress(connection_id, &NoProgress).await
    }

    /// Sync every stored connection, one after another.
    pub async fn sync_all(&self, progress: &dyn SyncProgressReporter) -> Result<Vec<SyncReport>> {
        let connections = self.connections.list_connections().await?;
        let mut reports = Vec::with_capacity(connections.len());
        for connection in connections {
            reports.push(self.sync_with_progress(&connection.id, progress).await);
        }
        Ok(reports)
    }

    pub async fn sync_with_progress(
        &self,
        connection_id: &str,
        progress: &dyn SyncProgressReporter,
    ) -> SyncReport {
        let started = Instant::now();
        let mut report = SyncReport::new(connection_id);
        let outcome = self.run(connection_id, progress, &mut report).await;
        report.outcome = outcome;
        report.duration_ms = started.elapsed().as_millis() as u64;

        match &report.outcome {
            SyncOutcome::Failed { stage, message } => {
                warn!(connection_id, ?stage, error = %message, "sync failed")
            }
            outcome => info!(
                connection_id,
                ?outcome,
                updated = report.updated.len(),
                unchanged = report.unchanged,
                skipped = report.skipped.len(),
                "sync finished"
            ),
        }
        report
    }

    async fn run(
        &self,
        connection_id: &str,
        progress: &dyn SyncProgressReporter,
        report: &mut SyncReport,
    ) -> SyncOutcome {
        progress.report(SyncProgressEvent::Probing {
            connection: connection_id.to_string(),
        });

        let connection = match self.connections.get_connection(connection_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                return failed(SyncStage::Probe, format!("connection '{}' not found", connection_id))
            }
            Err(e) => return failed(SyncStage::Probe, format!("{:#}", e)),
        };

        let pool = match self
            .registry
            .acquire(&connection.id, connection.dialect, &connection.credentials_uri)
            .await
        {
            Ok(pool) => pool,
            Err(e) => return failed(SyncStage::Probe, e.to_string()),
        };

        let tables = match pool.list_tables().await {
            Ok(tables) => tables,
            Err(e) => return failed(SyncStage::Enumerate, format!("{:#}", e)),
        };

        let dirty = self
            .compare_tables(&connection, pool.as_ref(), &tables, progress, report)
            .await;
        if dirty.is_empty() {
            return SyncOutcome::NoChange;
        }

        let fetched = self
            .refresh_tables(&connection, pool.as_ref(), dirty, progress, report)
            .await;
        if fetched.is_empty() {
            return SyncOutcome::NoChange;
        }

        if connection.pipeline_mode == PipelineMode::Indexed {
            let updates: Vec<TableUpdate> = fetched.iter().map(TableUpdate::from).collect();
            match self.handoff.deliver(&connection.id, &updates).await {
                Ok(handoff) => report.handoff = Some(handoff),
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!(connection_id, error = %message, "index hand-off failed");
                    report.handoff_error = Some(message);
                }
            }
        }
        SyncOutcome::Synced
    }

    /// Count every table against its watermark; return the dirty ones.
    async fn compare_tables(
        &self,
        connection: &Connection,
        pool: &dyn SourcePool,
        tables: &[String],
        progress: &dyn SyncProgressReporter,
        report: &mut SyncReport,
    ) -> Vec<TableChange> {
        let total = tables.len() as u64;
        let mut compared = 0u64;
        let mut dirty = Vec::new();

        for batch in tables.chunks(self.options.batch_size.max(1)) {
            let results = join_all(
                batch
                    .iter()
                    .map(|table| self.compare_table(&connection.id, pool, table)),
            )
            .await;

            for result in results {
                match result {
                    Comparison::Dirty(change) => dirty.push(change),
                    Comparison::Unchanged => report.unchanged += 1,
                    Comparison::Skipped(s) => report.skip(&s.table, s.stage, s.reason),
                }
            }
            compared += batch.len() as u64;
            progress.report(SyncProgressEvent::Comparing {
                connection: connection.display_name.clone(),
                n: compared,
                total,
            });
        }
        dirty
    }

    async fn compare_table(&self, connection_id: &str, pool: &dyn SourcePool, table: &str) -> Comparison {
        let (count, watermark) = tokio::join!(
            pool.count_rows(table),
            self.watermarks.get_watermark(connection_id, table)
        );

        let skipped = |reason: String| {
            Comparison::Skipped(SkippedTable {
                table: table.to_string(),
                stage: SyncStage::Count,
                reason,
            })
        };
        let current = match count {
            Ok(n) => n,
            Err(e) => return skipped(format!("{:#}", e)),
        };
        let previous = match watermark {
            Ok(w) => w.map(|w| w.last_row_count),
            Err(e) => return skipped(format!("watermark lookup failed: {:#}", e)),
        };

        if current > previous.unwrap_or(0) {
            debug!(connection_id, table, current, previous = ?previous, "table is dirty");
            Comparison::Dirty(TableChange {
                table: table.to_string(),
                previous_count: previous,
                current_count: current,
            })
        } else {
            Comparison::Unchanged
        }
    }

    /// Fetch, merge and advance the watermark for each dirty table.
    async fn refresh_tables(
        &self,
        connection: &Connection,
        pool: &dyn SourcePool,
        dirty: Vec<TableChange>,
        progress: &dyn SyncProgressReporter,
        report: &mut SyncReport,
    ) -> Vec<FetchedTable> {
        let total = dirty.len() as u64;
        let mut done = 0u64;
        let mut fetched_tables = Vec::new();

        for batch in dirty.chunks(self.options.batch_size.max(1)) {
            let results = join_all(
                batch
                    .iter()
                    .map(|change| self.refresh_table(connection, pool, change)),
            )
            .await;

            for (change, result) in batch.iter().zip(results) {
                match result {
                    Ok(fetched) => {
                        report.updated.push(change.clone());
                        fetched_tables.push(fetched);
                    }
                    Err(s) => report.skip(&s.table, s.stage, s.reason),
                }
            }
            done += batch.len() as u64;
            progress.report(SyncProgressEvent::Fetching {
                connection: connection.display_name.clone(),
                n: done,
                total,
            });
        }
        fetched_tables
    }

    async fn refresh_table(
        &self,
        connection: &Connection,
        pool: &dyn SourcePool,
        change: &TableChange,
    ) -> std::result::Result<FetchedTable, SkippedTable> {
        let skipped = |stage: SyncStage, e: anyhow::Error| SkippedTable {
            table: change.table.clone(),
            stage,
            reason: format!("{:#}", e),
        };

        let fetched = fetch_table(pool, &change.table, self.options.sample_rows)
            .await
            .map_err(|e| skipped(SyncStage::Fetch, e))?;

        self.connections
            .upsert_tables(&connection.id, std::slice::from_ref(&fetched))
            .await
            .map_err(|e| skipped(SyncStage::Merge, e))?;

        self.watermarks
            .upsert_watermark(&SyncWatermark {
                connection_id: connection.id.clone(),
                table_name: change.table.clone(),
                last_row_count: change.current_count,
                last_synced_at: Utc::now(),
                dialect: connection.dialect,
            })
            .await
            .map_err(|e| skipped(SyncStage::Watermark, e))?;

        Ok(fetched)
    }
}

fn failed(stage: SyncStage, message: String) -> SyncOutcome {
    SyncOutcome::Failed { stage, message }
}
