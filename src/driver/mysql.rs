//! MySQL / MariaDB driver (backtick-quoted identifiers).
//!
//! `information_schema` columns are cast to `CHAR` because some server
//! versions report them as binary strings.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Decode, Either, MySql, Row, Type, TypeInfo};

use dbgate_core::models::{ColumnDescriptor, Dialect, Record};

use super::{
    bytes_value, decimal_value, float_value, with_timeout, Driver, PoolHandle, PoolSettings,
    QueryOutput, SourcePool,
};

pub struct MySqlDriver;

#[async_trait]
impl Driver for MySqlDriver {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn permissive_tls_params(&self) -> &'static [(&'static str, &'static str)] {
        &[("ssl-mode", "required")]
    }

    async fn connect(&self, uri: &str, settings: &PoolSettings) -> Result<PoolHandle> {
        let options = MySqlConnectOptions::from_str(uri).context("invalid MySQL URI")?;
        let pool = with_timeout(settings.connect_timeout, "connect", async {
            Ok(MySqlPoolOptions::new()
                .max_connections(settings.max_connections)
                .idle_timeout(Some(settings.idle_timeout))
                .acquire_timeout(settings.connect_timeout)
                .connect_with(options)
                .await?)
        })
        .await?;

        Ok(Arc::new(MySqlSourcePool {
            pool,
            statement_timeout: settings.statement_timeout,
        }))
    }
}

pub struct MySqlSourcePool {
    pool: MySqlPool,
    statement_timeout: Duration,
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[async_trait]
impl SourcePool for MySqlSourcePool {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
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
                SELECT CAST(TABLE_NAME AS CHAR)
                FROM information_schema.TABLES
                WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE'
                ORDER BY TABLE_NAME
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
                SELECT CAST(COLUMN_NAME AS CHAR) AS name,
                       CAST(DATA_TYPE AS CHAR) AS data_type,
                       CAST(IS_NULLABLE AS CHAR) AS nullable,
                       CAST(COLUMN_DEFAULT AS CHAR) AS column_default
                FROM information_schema.COLUMNS
                WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
                ORDER BY ORDINAL_POSITION
                "#,
            )
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

            rows.iter()
                .map(|row| -> Result<ColumnDescriptor> {
                    let nullable: Option<String> = row.try_get("nullable")?;
                    Ok(ColumnDescriptor {
                        name: row.try_get("name")?,
                        data_type: row.try_get("data_type")?,
                        nullable: nullable.map(|n| n.eq_ignore_ascii_case("YES")),
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

fn row_to_record(row: &MySqlRow) -> Record {
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), cell(row, col.ordinal())))
        .collect()
}

fn typed<'r, T, F>(row: &'r MySqlRow, idx: usize, f: F) -> Option<Value>
where
    T: Decode<'r, MySql> + Type<MySql>,
    F: FnOnce(T) -> Value,
{
    match row.try_get::<Option<T>, _>(idx) {
        Ok(v) => Some(v.map(f).unwrap_or(Value::Null)),
        Err(_) => None,
    }
}

fn cell(row: &MySqlRow, idx: usize) -> Value {
    let decoded = match row.column(idx).type_info().name() {
        "BOOLEAN" => typed(row, idx, Value::Bool),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            typed::<i64, _>(row, idx, Value::from)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => typed::<u64, _>(row, idx, Value::from),
        "FLOAT" => typed::<f32, _>(row, idx, |f| float_value(f as f64)),
        "DOUBLE" => typed::<f64, _>(row, idx, float_value),
        "DECIMAL" => typed::<rust_decimal::Decimal, _>(row, idx, decimal_value),
        "JSON" => typed::<Value, _>(row, idx, |v| v),
        "TIMESTAMP" => {
            typed::<DateTime<Utc>, _>(row, idx, |t| Value::String(t.to_rfc3339()))
        }
        "DATETIME" => typed::<NaiveDateTime, _>(row, idx, |t| Value::String(t.to_string())),
        "DATE" => typed::<NaiveDate, _>(row, idx, |d| Value::String(d.to_string())),
        "TIME" => typed::<NaiveTime, _>(row, idx, |t| Value::String(t.to_string())),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            typed::<Vec<u8>, _>(row, idx, |b| match String::from_utf8(b) {
                Ok(s) => Value::String(s),
                Err(e) => bytes_value(e.as_bytes()),
            })
        }
        _ => None,
    };
    decoded.unwrap_or_else(|| text_fallback(row, idx))
}

fn text_fallback(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get_unchecked::<Option<String>, _>(idx) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    match row.try_get_unchecked::<Option<Vec<u8>>, _>(idx) {
        Ok(Some(b)) => bytes_value(&b),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_backticks() {
        assert_eq!(quote_ident("orders"), "`orders`");
        assert_eq!(quote_ident("a`b"), "`a``b`");
    }
}
