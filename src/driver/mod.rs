//! Dialect drivers.
//!
//! Every backend is reached through two traits:
//!
//! - [`Driver`]: a factory that opens a pool from a URI. One instance per
//!   dialect is registered in [`Drivers`].
//! - [`SourcePool`]: a live, shared pool handle with the capability set
//!   the gateway needs: list tables, describe columns, sample and count
//!   rows, run caller-supplied queries, ping, and close.
//!
//! The sync engine, introspector and query gateway only ever talk to these
//! traits; all dialect-specific SQL and wire handling lives in the
//! submodules.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  Drivers                     │
//! │  ┌──────────┐  ┌──────────┐  ┌────────────┐  │
//! │  │ Postgres │  │  MySQL   │  │  MongoDB   │  │
//! │  │  (sqlx)  │  │  (sqlx)  │  │ (mongodb)  │  │
//! │  └──────────┘  └──────────┘  └────────────┘  │
//! └──────────────┬───────────────────────────────┘
//!                ▼
//!      PoolRegistry::acquire() → PoolHandle
//! ```

pub mod mongo;
pub mod mysql;
pub mod postgres;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{Number, Value};

use dbgate_core::models::{ColumnDescriptor, Dialect, Record};

use crate::config::Config;

/// Shared handle to a live pool.
pub type PoolHandle = Arc<dyn SourcePool>;

/// Pool sizing and timeout policy, identical for every dialect.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            statement_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&crate::config::PoolConfig> for PoolSettings {
    fn from(cfg: &crate::config::PoolConfig) -> Self {
        Self {
            max_connections: cfg.max_connections,
            idle_timeout: Duration::from_secs(cfg.idle_timeout_secs),
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            statement_timeout: Duration::from_secs(cfg.statement_timeout_secs),
        }
    }
}

/// Rows returned by a statement, or the number of rows it affected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub rows: Vec<Record>,
    pub rows_affected: u64,
}

impl QueryOutput {
    /// Row count for the normalized result: returned rows when there are
    /// any, affected rows otherwise.
    pub fn row_count(&self) -> u64 {
        if self.rows.is_empty() {
            self.rows_affected
        } else {
            self.rows.len() as u64
        }
    }
}

/// Factory for pools of one dialect.
#[async_trait]
pub trait Driver: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Query parameters that request encryption without certificate
    /// verification. Used by the connection strategy ladder.
    fn permissive_tls_params(&self) -> &'static [(&'static str, &'static str)];

    /// Open a pool and verify it with one round trip.
    ///
    /// On error, anything partially built must already be closed.
    async fn connect(&self, uri: &str, settings: &PoolSettings) -> Result<PoolHandle>;
}

/// A live pool to one external database.
#[async_trait]
pub trait SourcePool: Send + Sync {
    fn dialect(&self) -> Dialect;

    async fn ping(&self) -> Result<()>;

    /// User tables (or collections) in the default schema / database.
    async fn list_tables(&self) -> Result<Vec<String>>;

    async fn describe_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>>;

    async fn sample_rows(&self, table: &str, limit: u32) -> Result<Vec<Record>>;

    async fn count_rows(&self, table: &str) -> Result<u64>;

    /// Run caller-supplied query text. Never retried.
    async fn run_query(&self, query: &str) -> Result<QueryOutput>;

    async fn close(&self);
}

/// One driver per dialect.
///
/// [`Drivers::builtin`] registers PostgreSQL, MySQL and MongoDB; tests and
/// embedding applications can [`register`](Drivers::register) their own.
#[derive(Clone, Default)]
pub struct Drivers {
    drivers: HashMap<Dialect, Arc<dyn Driver>>,
}

impl Drivers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in drivers configured from `[sync]`.
    pub fn builtin(config: &Config) -> Self {
        let mut drivers = Self::new();
        drivers.register(Arc::new(postgres::PostgresDriver));
        drivers.register(Arc::new(mysql::MySqlDriver));
        drivers.register(Arc::new(mongo::MongoDriver::new(
            config.sync.inference,
            config.sync.document_sample,
        )));
        drivers
    }

    /// Register a driver, replacing any existing one for the same dialect.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.dialect(), driver);
    }

    pub fn get(&self, dialect: Dialect) -> Option<Arc<dyn Driver>> {
        self.drivers.get(&dialect).cloned()
    }
}

/// Run `fut` under `limit`, turning expiry into an error naming `what`.
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => bail!("{} timed out after {:?}", what, limit),
    }
}

pub(crate) fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

pub(crate) fn decimal_value(d: rust_decimal::Decimal) -> Value {
    let text = d.to_string();
    text.parse::<Number>()
        .map(Value::Number)
        .unwrap_or(Value::String(text))
}

pub(crate) fn bytes_value(bytes: &[u8]) -> Value {
    Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
}
