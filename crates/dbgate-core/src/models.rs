//! Core data models shared by the gateway, the sync engine, and the stores.
//!
//! These types describe connections, the schema and data snapshots kept for
//! each connection, sync watermarks, the query boundary, and the units
//! handed to the downstream indexing collaborator.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One row or document, keyed by column / field name.
pub type Record = Map<String, Value>;

/// Backend family of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL (double-quoted identifiers).
    Postgres,
    /// MySQL / MariaDB (backtick-quoted identifiers).
    #[serde(rename = "mysql")]
    MySql,
    /// MongoDB document store.
    #[serde(rename = "mongodb")]
    Mongo,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Mongo => "mongodb",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "mongodb" | "mongo" => Ok(Dialect::Mongo),
            other => anyhow::bail!(
                "Unknown dialect: '{}'. Must be postgres, mysql, or mongodb.",
                other
            ),
        }
    }
}

/// Whether synced tables are handed to the indexing collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Updated tables are chunked and delivered to the index writer.
    #[default]
    Indexed,
    /// Snapshots are kept for query generation only.
    Direct,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::Indexed => "indexed",
            PipelineMode::Direct => "direct",
        }
    }
}

impl FromStr for PipelineMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "indexed" => Ok(PipelineMode::Indexed),
            "direct" => Ok(PipelineMode::Direct),
            other => anyhow::bail!(
                "Unknown pipeline mode: '{}'. Must be indexed or direct.",
                other
            ),
        }
    }
}

/// A user-supplied database registered with the gateway.
///
/// `credentials_uri` is fixed at creation; stores expose no way to
/// change it short of deleting the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub owner_id: String,
    pub display_name: String,
    pub dialect: Dialect,
    pub credentials_uri: String,
    pub pipeline_mode: PipelineMode,
    pub created_at: DateTime<Utc>,
}

/// Column (or inferred document field) metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: None,
            default: None,
        }
    }
}

/// One table or collection in a [`SchemaSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub table_name: String,
    pub columns: Vec<ColumnDescriptor>,
    /// Set when introspecting this entry failed; `columns` is then empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableDescriptor {
    pub fn failed(table_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            columns: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Ordered list of table descriptors for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableDescriptor>,
}

impl SchemaSnapshot {
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.table_name == name)
    }

    /// Insert or replace a table by name. Existing entries keep their
    /// position; new entries are appended.
    pub fn upsert(&mut self, table: TableDescriptor) {
        match self
            .tables
            .iter_mut()
            .find(|t| t.table_name == table.table_name)
        {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
    }
}

/// Bounded row samples per table, captured at the last (re)sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    pub tables: BTreeMap<String, Vec<Record>>,
}

impl DataSnapshot {
    pub fn rows(&self, table: &str) -> Option<&[Record]> {
        self.tables.get(table).map(|r| r.as_slice())
    }

    /// Replace a table's rows wholesale.
    pub fn replace(&mut self, table: impl Into<String>, rows: Vec<Record>) {
        self.tables.insert(table.into(), rows);
    }
}

/// Schema and data snapshot persisted together for a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema: SchemaSnapshot,
    pub data: DataSnapshot,
}

/// A freshly fetched table, ready to be merged into a [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedTable {
    pub descriptor: TableDescriptor,
    pub rows: Vec<Record>,
}

impl Snapshot {
    /// Upsert fetched tables by name. Tables not listed are left untouched.
    pub fn merge(&mut self, fetched: &[FetchedTable]) {
        for table in fetched {
            self.schema.upsert(table.descriptor.clone());
            self.data
                .replace(table.descriptor.table_name.clone(), table.rows.clone());
        }
    }
}

/// Last observed row count for one (connection, table) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub connection_id: String,
    pub table_name: String,
    pub last_row_count: u64,
    pub last_synced_at: DateTime<Utc>,
    pub dialect: Dialect,
}

/// Request accepted by the query execution boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub connection_id: String,
    pub query_text: String,
}

/// Class of a failed query, distinguishing pre-dispatch rejections from
/// runtime failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Connection,
    Execution,
    /// The gateway's own store failed before dispatch.
    Internal,
}

/// Normalized result of a query, identical in shape for every dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl QueryResponse {
    pub fn ok(rows: Vec<Record>, row_count: u64) -> Self {
        Self {
            success: true,
            rows: Some(rows),
            row_count: Some(row_count),
            error: None,
            error_kind: None,
        }
    }

    pub fn failure(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            rows: None,
            row_count: None,
            error: Some(error.into()),
            error_kind: Some(kind),
        }
    }
}

/// Column name and type as handed to the indexing collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

/// One updated table handed to the ingestion path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableUpdate {
    pub table_name: String,
    pub columns: Vec<ColumnSummary>,
    pub sample_rows: Vec<Record>,
}

impl From<&FetchedTable> for TableUpdate {
    fn from(table: &FetchedTable) -> Self {
        Self {
            table_name: table.descriptor.table_name.clone(),
            columns: table
                .descriptor
                .columns
                .iter()
                .map(|c| ColumnSummary {
                    name: c.name.clone(),
                    data_type: c.data_type.clone(),
                })
                .collect(),
            sample_rows: table.rows.clone(),
        }
    }
}

/// Metadata attached to every [`IndexEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    pub connection_id: String,
    pub table_name: String,
    pub chunk_index: usize,
    pub timestamp: DateTime<Utc>,
}

/// A chunk group addressed for the external index writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub payload: crate::chunk::ChunkGroup,
    pub metadata: IndexMetadata,
}
