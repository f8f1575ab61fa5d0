//! Schema and data introspection.
//!
//! Tables are processed in fixed-size batches; tables within a batch run
//! concurrently and a batch finishes before the next starts. A table whose
//! describe or sample fails is recorded with an `error` and empty columns
//! rather than failing the whole introspection.

use std::collections::BTreeMap;

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, warn};

use dbgate_core::models::{FetchedTable, Snapshot, TableDescriptor};

use crate::config::SyncConfig;
use crate::driver::SourcePool;

#[derive(Debug, Clone, Copy)]
pub struct IntrospectOptions {
    pub batch_size: usize,
    pub sample_rows: u32,
}

impl Default for IntrospectOptions {
    fn default() -> Self {
        Self {
            batch_size: 5,
            sample_rows: 1000,
        }
    }
}

impl From<&SyncConfig> for IntrospectOptions {
    fn from(cfg: &SyncConfig) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            sample_rows: cfg.sample_rows,
        }
    }
}

/// Result of a full introspection.
#[derive(Debug, Clone, Default)]
pub struct Introspection {
    /// Every listed table, in listing order; failed ones carry an error.
    pub tables: Vec<FetchedTable>,
    /// Row counts for tables whose count succeeded.
    pub counts: BTreeMap<String, u64>,
}

impl Introspection {
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.merge(&self.tables);
        snapshot
    }

    /// Tables that introspected cleanly.
    pub fn healthy(&self) -> impl Iterator<Item = &FetchedTable> {
        self.tables.iter().filter(|t| t.descriptor.error.is_none())
    }

    pub fn failed(&self) -> impl Iterator<Item = &FetchedTable> {
        self.tables.iter().filter(|t| t.descriptor.error.is_some())
    }
}

/// Describe one table and sample its rows.
pub async fn fetch_table(pool: &dyn SourcePool, table: &str, sample_rows: u32) -> Result<FetchedTable> {
    let (columns, rows) = futures::try_join!(
        pool.describe_columns(table),
        pool.sample_rows(table, sample_rows)
    )?;
    Ok(FetchedTable {
        descriptor: TableDescriptor {
            table_name: table.to_string(),
            columns,
            error: None,
        },
        rows,
    })
}

/// Introspect every table of `pool`. Fails only if tables cannot be
/// listed at all.
pub async fn describe_schema(pool: &dyn SourcePool, options: IntrospectOptions) -> Result<Introspection> {
    let tables = pool.list_tables().await?;
    debug!(tables = tables.len(), dialect = %pool.dialect(), "introspecting");

    let mut out = Introspection::default();
    for batch in tables.chunks(options.batch_size.max(1)) {
        let results = join_all(batch.iter().map(|table| async move {
            let (fetched, count) = tokio::join!(
                fetch_table(pool, table, options.sample_rows),
                pool.count_rows(table)
            );
            (table, fetched, count)
        }))
        .await;

        for (table, fetched, count) in results {
            match fetched {
                Ok(fetched) => out.tables.push(fetched),
                Err(e) => {
                    warn!(table = %table, error = %format!("{:#}", e), "table introspection failed");
                    out.tables.push(FetchedTable {
                        descriptor: TableDescriptor::failed(table.as_str(), format!("{:#}", e)),
                        rows: Vec::new(),
                    });
                }
            }
            match count {
                Ok(n) => {
                    out.counts.insert(table.clone(), n);
                }
                Err(e) => warn!(table = %table, error = %format!("{:#}", e), "row count failed"),
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::QueryOutput;
    use anyhow::bail;
    use async_trait::async_trait;
    use dbgate_core::models::{ColumnDescriptor, Dialect, Record};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Source {
        tables: Vec<String>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SourcePool for Source {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn list_tables(&self) -> Result<Vec<String>> {
            Ok(self.tables.clone())
        }
        async fn describe_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if table.starts_with("bad") {
                bail!("permission denied for table {}", table);
            }
            Ok(vec![ColumnDescriptor::new("id", "integer")])
        }
        async fn sample_rows(&self, _table: &str, limit: u32) -> Result<Vec<Record>> {
            Ok((0..limit.min(3))
                .map(|i| json!({ "id": i }).as_object().cloned().unwrap())
                .collect())
        }
        async fn count_rows(&self, table: &str) -> Result<u64> {
            if table == "uncountable" {
                bail!("timeout");
            }
            Ok(3)
        }
        async fn run_query(&self, _query: &str) -> Result<QueryOutput> {
            Ok(QueryOutput::default())
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_table() {
        let source = Source {
            tables: vec!["orders".into(), "bad_table".into(), "uncountable".into()],
            ..Default::default()
        };
        let result = describe_schema(&source, IntrospectOptions::default())
            .await
            .unwrap();

        assert_eq!(result.tables.len(), 3);
        assert_eq!(result.healthy().count(), 2);
        let failed: Vec<_> = result.failed().collect();
        assert_eq!(failed[0].descriptor.table_name, "bad_table");
        assert!(failed[0].descriptor.columns.is_empty());
        assert!(failed[0]
            .descriptor
            .error
            .as_deref()
            .unwrap()
            .contains("permission denied"));

        assert_eq!(result.counts.get("orders"), Some(&3));
        assert!(!result.counts.contains_key("uncountable"));
        assert_eq!(result.snapshot().schema.tables.len(), 3);
    }

    #[tokio::test]
    async fn test_batches_bound_concurrency() {
        let source = Source {
            tables: (0..12).map(|i| format!("t{}", i)).collect(),
            ..Default::default()
        };
        let options = IntrospectOptions {
            batch_size: 5,
            sample_rows: 2,
        };
        let result = describe_schema(&source, options).await.unwrap();

        assert_eq!(result.tables.len(), 12);
        assert!(source.peak.load(Ordering::SeqCst) <= 5);
        assert!(result.tables.iter().all(|t| t.rows.len() == 2));
        let names: Vec<_> = result.tables.iter().map(|t| t.descriptor.table_name.clone()).collect();
        assert_eq!(names[0], "t0");
        assert_eq!(names[11], "t11");
    }
}
