//! Scriptable fake driver and source shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use dbgate::app::App;
use dbgate::config::Config;
use dbgate::driver::{Driver, Drivers, PoolHandle, PoolSettings, QueryOutput, SourcePool};
use dbgate::index::{IndexHandoff, IndexWriter};
use dbgate::models::{
    ColumnDescriptor, Connection, Dialect, IndexEntry, PipelineMode, Record,
};
use dbgate::pool::PoolRegistry;
use dbgate::store::memory::InMemoryStore;
use dbgate::store::ConnectionStore;

pub fn rows(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            json!({ "id": i + 1, "name": format!("row-{}", i + 1), "score": i * 10 })
                .as_object()
                .cloned()
                .unwrap()
        })
        .collect()
}

/// In-memory tables with switchable failures.
pub struct FakeSource {
    dialect: Dialect,
    tables: Mutex<BTreeMap<String, Vec<Record>>>,
    failing_counts: Mutex<HashSet<String>>,
    failing_fetches: Mutex<HashSet<String>>,
    queries: Mutex<Vec<String>>,
    query_result: Mutex<std::result::Result<QueryOutput, String>>,
    pub closed: AtomicUsize,
}

impl FakeSource {
    pub fn new(dialect: Dialect) -> Arc<Self> {
        Arc::new(Self {
            dialect,
            tables: Mutex::new(BTreeMap::new()),
            failing_counts: Mutex::new(HashSet::new()),
            failing_fetches: Mutex::new(HashSet::new()),
            queries: Mutex::new(Vec::new()),
            query_result: Mutex::new(Ok(QueryOutput::default())),
            closed: AtomicUsize::new(0),
        })
    }

    pub fn set_rows(&self, table: &str, n: usize) {
        self.tables.lock().unwrap().insert(table.to_string(), rows(n));
    }

    pub fn fail_count(&self, table: &str) {
        self.failing_counts.lock().unwrap().insert(table.to_string());
    }

    pub fn fail_fetch(&self, table: &str) {
        self.failing_fetches.lock().unwrap().insert(table.to_string());
    }

    pub fn respond_with(&self, result: std::result::Result<QueryOutput, String>) {
        *self.query_result.lock().unwrap() = result;
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    fn table_rows(&self, table: &str) -> Result<Vec<Record>> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .ok_or_else(|| anyhow!("relation \"{}\" does not exist", table))
    }
}

#[async_trait]
impl SourcePool for FakeSource {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.lock().unwrap().keys().cloned().collect())
    }

    async fn describe_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        if self.failing_fetches.lock().unwrap().contains(table) {
            bail!("permission denied for table {}", table);
        }
        let rows = self.table_rows(table)?;
        Ok(rows
            .first()
            .map(|r| {
                r.keys()
                    .map(|k| ColumnDescriptor::new(k.as_str(), "integer"))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn sample_rows(&self, table: &str, limit: u32) -> Result<Vec<Record>> {
        let mut rows = self.table_rows(table)?;
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        if self.failing_counts.lock().unwrap().contains(table) {
            bail!("canceling statement due to statement timeout");
        }
        Ok(self.table_rows(table)?.len() as u64)
    }

    async fn run_query(&self, query: &str) -> Result<QueryOutput> {
        self.queries.lock().unwrap().push(query.to_string());
        self.query_result
            .lock()
            .unwrap()
            .clone()
            .map_err(|e| anyhow!(e))
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Driver handing out one shared [`FakeSource`]. The first `fail_first`
/// connect attempts fail with an error quoting the URI.
pub struct FakeDriver {
    dialect: Dialect,
    source: Arc<FakeSource>,
    fail_first: usize,
    delay: Duration,
    pub connects: AtomicUsize,
    pub uris: Mutex<Vec<String>>,
}

impl FakeDriver {
    pub fn new(source: Arc<FakeSource>) -> Self {
        Self {
            dialect: source.dialect,
            source,
            fail_first: 0,
            delay: Duration::ZERO,
            connects: AtomicUsize::new(0),
            uris: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn uris(&self) -> Vec<String> {
        self.uris.lock().unwrap().clone()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn permissive_tls_params(&self) -> &'static [(&'static str, &'static str)] {
        &[("sslmode", "require")]
    }

    async fn connect(&self, uri: &str, _settings: &PoolSettings) -> Result<PoolHandle> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
        self.uris.lock().unwrap().push(uri.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if attempt < self.fail_first {
            bail!("server requires encryption (dialing {})", uri);
        }
        let handle: PoolHandle = self.source.clone();
        Ok(handle)
    }
}

/// Index writer that keeps every batch it receives.
#[derive(Default)]
pub struct RecordingWriter {
    pub batches: Mutex<Vec<Vec<IndexEntry>>>,
}

impl RecordingWriter {
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(|b| b.len()).collect()
    }

    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|e| e.metadata.table_name.clone())
            .collect();
        tables.dedup();
        tables
    }
}

#[async_trait]
impl IndexWriter for RecordingWriter {
    async fn write_batch(&self, entries: &[IndexEntry]) -> Result<()> {
        self.batches.lock().unwrap().push(entries.to_vec());
        Ok(())
    }
}

pub fn registry(drivers: Vec<Arc<FakeDriver>>) -> Arc<PoolRegistry> {
    let mut set = Drivers::new();
    for driver in drivers {
        set.register(driver);
    }
    Arc::new(PoolRegistry::new(
        set,
        PoolSettings::default(),
        Duration::from_secs(60),
    ))
}

pub struct Harness {
    pub app: App,
    pub store: Arc<InMemoryStore>,
    pub writer: Arc<RecordingWriter>,
}

pub fn harness(drivers: Vec<Arc<FakeDriver>>) -> Harness {
    let config = Config::with_db_path("unused.sqlite");
    let store = Arc::new(InMemoryStore::new());
    let writer = Arc::new(RecordingWriter::default());
    let handoff = Arc::new(IndexHandoff::new(writer.clone(), 160, 10));
    let app = App::assemble(
        &config,
        registry(drivers),
        store.clone(),
        store.clone(),
        handoff,
    );
    Harness { app, store, writer }
}

pub async fn seed_connection(
    store: &InMemoryStore,
    id: &str,
    dialect: Dialect,
    pipeline_mode: PipelineMode,
) -> Connection {
    let connection = Connection {
        id: id.to_string(),
        owner_id: "owner".to_string(),
        display_name: format!("{}-db", id),
        dialect,
        credentials_uri: format!("{}://app:s3cret@db.internal/shop", dialect),
        pipeline_mode,
        created_at: Utc::now(),
    };
    store.insert_connection(&connection).await.unwrap();
    connection
}
