//! PostgreSQL driver (double-quoted identifiers).

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Decode, Either, Postgres, Row, Type, TypeInfo};
use std::sync::Arc;

use dbgate_core::models::{ColumnDescriptor, Dialect, Record};

use super::{
    bytes_value, decimal_value, float_value, with_timeout, Driver, PoolHandle, PoolSettings,
    QueryOutput, SourcePool,
};

pub struct PostgresDriver;

#[async_trait]
impl Driver for PostgresDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn permissive_tls_params(&self) -> &'static [(&'static str, &'static str)] {
        &[("sslmode", "require")]
    }

    async fn connect(&self, uri: &str, settings: &PoolSettings) -> Result<PoolHandle> {
        let options = PgConnectOptions::from_str(uri).context("invalid PostgreSQL URI")?;
        let pool = with_timeout(settings.connect_timeout, "connect", async {
            Ok(PgPoolOptions::new()
                .max_connections(settings.max_connections)
                .idle_timeout(Some(settings.idle_timeout))
                .acquire_timeout(settings.connect_timeout)
                .connect_with(options)
                .await?)
        })
        .await?;

        Ok(Arc::new(PostgresPool {
            pool,
            statement_timeout: settings.statement_timeout,
        }))
    }
}

pub struct PostgresPool {
    pool: PgPool,
    statement_timeout: Duration,
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl SourcePool for PostgresPool {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn ping(&self) -> Result<()> {
        with_timeout(self.statement_timeout, "ping", async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        with_timeout(self.statement_timeout, "list tables", async {
            let names = sqlx::query_scalar::<_, String>(
                r#"
                SELECT table_name::text
                FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_type = 'BASE TABLE'
                ORDER BY table_name
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(names)
        })
        .await
    }

    async fn describe_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        with_timeout(self.statement_timeout, "describe columns", async {
            let rows = sqlx::query(
                r#"
                SELECT column_name::text AS name,
                       data_type::text AS data_type,
                       (is_nullable = 'YES') AS nullable,
                       column_default::text AS column_default
                FROM information_schema.columns
                WHERE table_schema = current_schema() AND table_name = $1
                ORDER BY ordinal_position
                "#,
            )
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

            rows.iter()
                .map(|row| -> Result<ColumnDescriptor> {
                    Ok(ColumnDescriptor {
                        name: row.try_get("name")?,
                        data_type: row.try_get("data_type")?,
                        nullable: row.try_get("nullable")?,
                        default: row.try_get("column_default")?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn sample_rows(&self, table: &str, limit: u32) -> Result<Vec<Record>> {
        let sql = format!("SELECT * FROM {} LIMIT {}", quote_ident(table), limit);
        with_timeout(self.statement_timeout, "sample rows", async {
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
            Ok(rows.iter().map(row_to_record).collect())
        })
        .await
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        with_timeout(self.statement_timeout, "count rows", async {
            let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn run_query(&self, query: &str) -> Result<QueryOutput> {
        with_timeout(self.statement_timeout, "query", async {
            let mut out = QueryOutput::default();
            let mut results = sqlx::raw_sql(query).fetch_many(&self.pool);
            while let Some(item) = results.try_next().await? {
                match item {
                    Either::Left(done) => out.rows_affected += done.rows_affected(),
                    Either::Right(row) => out.rows.push(row_to_record(&row)),
                }
            }
            Ok(out)
        })
        .await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_record(row: &PgRow) -> Record {
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), cell(row, col.ordinal())))
        .collect()
}

/// Decode as `T`; `None` when the value does not decode as `T`.
fn typed<'r, T, F>(row: &'r PgRow, idx: usize, f: F) -> Option<Value>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
    F: FnOnce(T) -> Value,
{
    match row.try_get::<Option<T>, _>(idx) {
        Ok(v) => Some(v.map(f).unwrap_or(Value::Null)),
        Err(_) => None,
    }
}

fn cell(row: &PgRow, idx: usize) -> Value {
    let decoded = match row.column(idx).type_info().name() {
        "BOOL" => typed(row, idx, Value::Bool),
        "INT2" => typed::<i16, _>(row, idx, Value::from),
        "INT4" => typed::<i32, _>(row, idx, Value::from),
        "INT8" => typed::<i64, _>(row, idx, Value::from),
        "FLOAT4" => typed::<f32, _>(row, idx, |f| float_value(f as f64)),
        "FLOAT8" => typed::<f64, _>(row, idx, float_value),
        "NUMERIC" => typed::<rust_decimal::Decimal, _>(row, idx, decimal_value),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            typed::<String, _>(row, idx, Value::String)
        }
        "JSON" | "JSONB" => typed::<Value, _>(row, idx, |v| v),
        "UUID" => typed::<uuid::Uuid, _>(row, idx, |u| Value::String(u.to_string())),
        "TIMESTAMPTZ" => {
            typed::<DateTime<Utc>, _>(row, idx, |t| Value::String(t.to_rfc3339()))
        }
        "TIMESTAMP" => typed::<NaiveDateTime, _>(row, idx, |t| Value::String(t.to_string())),
        "DATE" => typed::<NaiveDate, _>(row, idx, |d| Value::String(d.to_string())),
        "TIME" => typed::<NaiveTime, _>(row, idx, |t| Value::String(t.to_string())),
        "BYTEA" => typed::<Vec<u8>, _>(row, idx, |b| bytes_value(&b)),
        "TEXT[]" | "VARCHAR[]" => typed::<Vec<String>, _>(row, idx, Value::from),
        "INT4[]" => typed::<Vec<i32>, _>(row, idx, Value::from),
        "INT8[]" => typed::<Vec<i64>, _>(row, idx, Value::from),
        _ => None,
    };
    decoded.unwrap_or_else(|| text_fallback(row, idx))
}

// Enums, domains, ranges and the like: take the server's text form.
fn text_fallback(row: &PgRow, idx: usize) -> Value {
    match row.try_get_unchecked::<Option<String>, _>(idx) {
        Ok(Some(s)) => Value::String(s),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_permissive_params() {
        assert_eq!(
            PostgresDriver.permissive_tls_params(),
            &[("sslmode", "require")]
        );
    }
}
