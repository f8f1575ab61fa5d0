//! Hand-off of updated tables to the downstream indexer.
//!
//! Each updated table's sampled rows are chunked with
//! [`dbgate_core::chunk::chunk_rows`]; every resulting group becomes one
//! [`IndexEntry`]. Entries are written in batches through an
//! [`IndexWriter`]. Entry ids are derived from
//! `(connection, table, chunk index)`, so re-syncing a table overwrites
//! its previous entries in any writer that upserts by id.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use dbgate_core::chunk::chunk_rows;
use dbgate_core::models::{IndexEntry, IndexMetadata, TableUpdate};

use crate::config::Config;

/// Sink for index entries.
#[async_trait]
pub trait IndexWriter: Send + Sync {
    async fn write_batch(&self, entries: &[IndexEntry]) -> Result<()>;
}

/// Discards everything. Used when no index output is configured.
pub struct NullIndexWriter;

#[async_trait]
impl IndexWriter for NullIndexWriter {
    async fn write_batch(&self, _entries: &[IndexEntry]) -> Result<()> {
        Ok(())
    }
}

/// Appends entries to a JSON Lines file, one entry per line.
pub struct JsonlIndexWriter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlIndexWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl IndexWriter for JsonlIndexWriter {
    async fn write_batch(&self, entries: &[IndexEntry]) -> Result<()> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open index output {}", self.path.display()))?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Summary of one delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HandoffReport {
    pub tables: usize,
    pub entries: usize,
    pub batches: usize,
}

pub struct IndexHandoff {
    writer: Arc<dyn IndexWriter>,
    max_bytes: usize,
    batch_size: usize,
}

impl IndexHandoff {
    pub fn new(writer: Arc<dyn IndexWriter>, max_bytes: usize, batch_size: usize) -> Self {
        Self {
            writer,
            max_bytes,
            batch_size: batch_size.max(1),
        }
    }

    /// JSONL output when `[index].output` is set, otherwise discard.
    pub fn from_config(config: &Config) -> Self {
        let writer: Arc<dyn IndexWriter> = match &config.index.output {
            Some(path) => Arc::new(JsonlIndexWriter::new(path)),
            None => Arc::new(NullIndexWriter),
        };
        Self::new(writer, config.chunking.max_bytes, config.index.batch_size)
    }

    /// Chunk one table into addressed entries.
    pub fn entries(
        &self,
        connection_id: &str,
        update: &TableUpdate,
        timestamp: DateTime<Utc>,
    ) -> Vec<IndexEntry> {
        let plan = chunk_rows(&update.sample_rows, self.max_bytes);
        debug!(
            table = %update.table_name,
            strategy = ?plan.strategy,
            groups = plan.groups.len(),
            "chunked table"
        );
        plan.groups
            .into_iter()
            .enumerate()
            .map(|(chunk_index, payload)| IndexEntry {
                id: entry_id(connection_id, &update.table_name, chunk_index),
                payload,
                metadata: IndexMetadata {
                    connection_id: connection_id.to_string(),
                    table_name: update.table_name.clone(),
                    chunk_index,
                    timestamp,
                },
            })
            .collect()
    }

    /// Chunk every update and write the entries in batches.
    pub async fn deliver(&self, connection_id: &str, updates: &[TableUpdate]) -> Result<HandoffReport> {
        let timestamp = Utc::now();
        let entries: Vec<IndexEntry> = updates
            .iter()
            .flat_map(|u| self.entries(connection_id, u, timestamp))
            .collect();

        let mut report = HandoffReport {
            tables: updates.len(),
            ..Default::default()
        };
        for batch in entries.chunks(self.batch_size) {
            self.writer
                .write_batch(batch)
                .await
                .with_context(|| format!("index write failed after {} entries", report.entries))?;
            report.entries += batch.len();
            report.batches += 1;
        }

        info!(
            connection_id,
            tables = report.tables,
            entries = report.entries,
            batches = report.batches,
            "handed off to index"
        );
        Ok(report)
    }
}

fn entry_id(connection_id: &str, table: &str, chunk_index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(connection_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(table.as_bytes());
    hasher.update([0u8]);
    hasher.update(chunk_index.to_le_bytes());
    format!("{:x}", hasher.finalize())
}
