//! TOML configuration.
//!
//! Only `[db]` is required; every other section falls back to defaults
//! that match the gateway's documented limits (5-way batches, 1000-row
//! samples, 4000-byte chunk groups, index batches of 10).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dbgate_core::infer::InferenceMode;

use crate::logging::LogFormat;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local SQLite store holding connections, snapshots and watermarks.
#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            statement_timeout_secs: default_statement_timeout_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
        }
    }
}

impl PoolConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

fn default_max_connections() -> u32 {
    10
}
fn default_idle_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_statement_timeout_secs() -> u64 {
    30
}
fn default_health_check_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Tables processed concurrently per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Row cap for each table's data sample.
    #[serde(default = "default_sample_rows")]
    pub sample_rows: u32,
    /// Documents sampled per collection for schema inference.
    #[serde(default = "default_document_sample")]
    pub document_sample: u32,
    #[serde(default)]
    pub inference: InferenceMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sample_rows: default_sample_rows(),
            document_sample: default_document_sample(),
            inference: InferenceMode::default(),
        }
    }
}

fn default_batch_size() -> usize {
    5
}
fn default_sample_rows() -> u32 {
    1000
}
fn default_document_sample() -> u32 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_max_bytes() -> usize {
    dbgate_core::chunk::DEFAULT_MAX_BYTES
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_batch_size")]
    pub batch_size: usize,
    /// JSONL file receiving index entries. Hand-off is discarded when unset.
    #[serde(default)]
    pub output: Option<PathBuf>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: default_index_batch_size(),
            output: None,
        }
    }
}

fn default_index_batch_size() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Config pointing at `db_path` with every other section defaulted.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            pool: PoolConfig::default(),
            sync: SyncConfig::default(),
            chunking: ChunkingConfig::default(),
            index: IndexConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.pool.max_connections == 0 {
        anyhow::bail!("pool.max_connections must be > 0");
    }
    if config.pool.connect_timeout_secs == 0 || config.pool.statement_timeout_secs == 0 {
        anyhow::bail!("pool timeouts must be > 0");
    }
    if config.pool.health_check_interval_secs == 0 {
        anyhow::bail!("pool.health_check_interval_secs must be > 0");
    }
    if config.sync.batch_size == 0 {
        anyhow::bail!("sync.batch_size must be > 0");
    }
    if config.sync.sample_rows == 0 || config.sync.document_sample == 0 {
        anyhow::bail!("sync sample sizes must be > 0");
    }
    if config.chunking.max_bytes == 0 {
        anyhow::bail!("chunking.max_bytes must be > 0");
    }
    if config.index.batch_size == 0 {
        anyhow::bail!("index.batch_size must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.sync.batch_size, 5);
        assert_eq!(config.sync.sample_rows, 1000);
        assert_eq!(config.sync.document_sample, 100);
        assert_eq!(config.sync.inference, InferenceMode::FirstDocument);
        assert_eq!(config.chunking.max_bytes, 4000);
        assert_eq!(config.index.batch_size, 10);
        assert!(config.index.output.is_none());
    }

    #[test]
    fn test_overrides_and_validation() {
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "/tmp/x.sqlite"

            [sync]
            batch_size = 2
            inference = "union"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.batch_size, 2);
        assert_eq!(config.sync.inference, InferenceMode::Union);
        assert_eq!(config.logging.format, LogFormat::Json);

        let bad: Config =
            toml::from_str("[db]\npath = \"/tmp/x\"\n[chunking]\nmax_bytes = 0\n").unwrap();
        assert!(validate(&bad).is_err());
    }
}
