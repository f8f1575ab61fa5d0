//! MongoDB driver.
//!
//! Collections stand in for tables and documents for rows. Documents leave
//! this module as relaxed Extended JSON, so ObjectIds and dates arrive as
//! `{"$oid": ..}` / `{"$date": ..}` objects that the inference module
//! recognises.
//!
//! Queries are database command documents written as JSON, e.g.
//! `{"find": "users", "filter": {"active": true}, "limit": 20}`.
//! Cursor-producing commands are drained; write commands report their
//! affected count; anything else returns the reply as a single row.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use serde_json::Value;

use dbgate_core::infer::{infer_columns, InferenceMode};
use dbgate_core::models::{ColumnDescriptor, Dialect, Record};

use super::{with_timeout, Driver, PoolHandle, PoolSettings, QueryOutput, SourcePool};

const CURSOR_COMMANDS: &[&str] = &["find", "aggregate", "listCollections", "listIndexes"];
const WRITE_COMMANDS: &[&str] = &["insert", "update", "delete", "findAndModify"];

pub struct MongoDriver {
    inference: InferenceMode,
    document_sample: u32,
}

impl MongoDriver {
    pub fn new(inference: InferenceMode, document_sample: u32) -> Self {
        Self {
            inference,
            document_sample,
        }
    }
}

#[async_trait]
impl Driver for MongoDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Mongo
    }

    fn permissive_tls_params(&self) -> &'static [(&'static str, &'static str)] {
        &[("tls", "true"), ("tlsAllowInvalidCertificates", "true")]
    }

    async fn connect(&self, uri: &str, settings: &PoolSettings) -> Result<PoolHandle> {
        // SRV URIs resolve DNS while parsing.
        let mut options = with_timeout(settings.connect_timeout, "parse URI", async {
            Ok(ClientOptions::parse(uri).await?)
        })
        .await?;
        options.max_pool_size = Some(settings.max_connections);
        options.max_idle_time = Some(settings.idle_timeout);
        options.connect_timeout = Some(settings.connect_timeout);
        options.server_selection_timeout = Some(settings.connect_timeout);

        let client = Client::with_options(options)?;
        let Some(db) = client.default_database() else {
            client.shutdown().await;
            bail!("MongoDB URI must name a database");
        };

        let ping = with_timeout(settings.connect_timeout, "connect", async {
            db.run_command(doc! { "ping": 1 }).await?;
            Ok(())
        })
        .await;
        if let Err(e) = ping {
            client.shutdown().await;
            return Err(e);
        }

        Ok(Arc::new(MongoPool {
            client,
            db,
            statement_timeout: settings.statement_timeout,
            inference: self.inference,
            document_sample: self.document_sample,
        }))
    }
}

pub struct MongoPool {
    client: Client,
    db: Database,
    statement_timeout: Duration,
    inference: InferenceMode,
    document_sample: u32,
}

impl MongoPool {
    async fn find_documents(&self, collection: &str, limit: u32) -> Result<Vec<Document>> {
        let cursor = self
            .db
            .collection::<Document>(collection)
            .find(doc! {})
            .limit(i64::from(limit))
            .await?;
        Ok(cursor.try_collect().await?)
    }
}

#[async_trait]
impl SourcePool for MongoPool {
    fn dialect(&self) -> Dialect {
        Dialect::Mongo
    }

    async fn ping(&self) -> Result<()> {
        with_timeout(self.statement_timeout, "ping", async {
            self.db.run_command(doc! { "ping": 1 }).await?;
            Ok(())
        })
        .await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        with_timeout(self.statement_timeout, "list collections", async {
            let mut names: Vec<String> = self
                .db
                .list_collection_names()
                .await?
                .into_iter()
                .filter(|name| !name.starts_with("system."))
                .collect();
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn describe_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        with_timeout(self.statement_timeout, "infer schema", async {
            let docs = self.find_documents(table, self.document_sample).await?;
            let values: Vec<Value> = docs.into_iter().map(document_value).collect();
            Ok(infer_columns(&values, self.inference))
        })
        .await
    }

    async fn sample_rows(&self, table: &str, limit: u32) -> Result<Vec<Record>> {
        with_timeout(self.statement_timeout, "sample documents", async {
            let docs = self.find_documents(table, limit).await?;
            Ok(docs.into_iter().map(document_record).collect())
        })
        .await
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        with_timeout(self.statement_timeout, "count documents", async {
            Ok(self
                .db
                .collection::<Document>(table)
                .estimated_document_count()
                .await?)
        })
        .await
    }

    async fn run_query(&self, query: &str) -> Result<QueryOutput> {
        let command = parse_command(query)?;
        let name = command_name(&command)?;

        with_timeout(self.statement_timeout, "query", async {
            if CURSOR_COMMANDS.contains(&name.as_str()) {
                let cursor = self.db.run_cursor_command(command).await?;
                let docs: Vec<Document> = cursor.try_collect().await?;
                let rows: Vec<Record> = docs.into_iter().map(document_record).collect();
                return Ok(QueryOutput {
                    rows,
                    rows_affected: 0,
                });
            }
            let reply = self.db.run_command(command).await?;
            Ok(normalize_reply(&name, reply))
        })
        .await
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

/// Parse JSON command text into a BSON document. Extended JSON
/// (`{"$oid": ..}`) is honoured.
pub(crate) fn parse_command(query: &str) -> Result<Document> {
    let json: Value = serde_json::from_str(query)
        .map_err(|e| anyhow!("query must be a JSON command document: {}", e))?;
    match Bson::try_from(json)? {
        Bson::Document(doc) => Ok(doc),
        _ => bail!("query must be a JSON object"),
    }
}

fn command_name(command: &Document) -> Result<String> {
    command
        .keys()
        .next()
        .cloned()
        .ok_or_else(|| anyhow!("command document is empty"))
}

fn normalize_reply(name: &str, mut reply: Document) -> QueryOutput {
    if WRITE_COMMANDS.contains(&name) {
        let affected = count_field(&reply, "nModified")
            .filter(|n| *n > 0)
            .or_else(|| count_field(&reply, "n"))
            .unwrap_or(0);
        return QueryOutput {
            rows: Vec::new(),
            rows_affected: affected,
        };
    }

    // Cluster gossip, not part of the answer.
    reply.remove("$clusterTime");
    reply.remove("operationTime");
    QueryOutput {
        rows: vec![document_record(reply)],
        rows_affected: 0,
    }
}

fn count_field(doc: &Document, key: &str) -> Option<u64> {
    match doc.get(key)? {
        Bson::Int32(n) => u64::try_from(*n).ok(),
        Bson::Int64(n) => u64::try_from(*n).ok(),
        Bson::Double(n) if *n >= 0.0 => Some(*n as u64),
        _ => None,
    }
}

fn document_value(doc: Document) -> Value {
    Bson::Document(doc).into_relaxed_extjson()
}

fn document_record(doc: Document) -> Record {
    match document_value(doc) {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}
