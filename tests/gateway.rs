//! Query gateway: validation before dispatch, normalized results and
//! error classification.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{harness, rows, seed_connection, FakeDriver, FakeSource};
use dbgate::driver::QueryOutput;
use dbgate::models::{Dialect, ErrorKind, PipelineMode, QueryRequest};

fn request(id: &str, text: &str) -> QueryRequest {
    QueryRequest {
        connection_id: id.to_string(),
        query_text: text.to_string(),
    }
}

#[tokio::test]
async fn test_mysql_rejects_double_quoted_identifiers_before_connecting() {
    let source = FakeSource::new(Dialect::MySql);
    let driver = Arc::new(FakeDriver::new(source.clone()));
    let h = harness(vec![driver.clone()]);
    seed_connection(&h.store, "c1", Dialect::MySql, PipelineMode::Direct).await;

    let response = h
        .app
        .gateway
        .execute(&request("c1", r#"SELECT * FROM "users""#))
        .await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::Validation));
    assert!(response.rows.is_none());
    assert_eq!(driver.connect_count(), 0);
    assert!(source.queries().is_empty());
}

#[tokio::test]
async fn test_destructive_statement_is_rejected() {
    let source = FakeSource::new(Dialect::Postgres);
    let driver = Arc::new(FakeDriver::new(source.clone()));
    let h = harness(vec![driver.clone()]);
    seed_connection(&h.store, "c1", Dialect::Postgres, PipelineMode::Direct).await;

    let response = h.app.gateway.execute(&request("c1", "drop database prod")).await;

    assert_eq!(response.error_kind, Some(ErrorKind::Validation));
    assert_eq!(driver.connect_count(), 0);
}

#[tokio::test]
async fn test_unknown_connection_is_not_found() {
    let h = harness(vec![]);

    let response = h.app.gateway.execute(&request("nope", "SELECT 1")).await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::NotFound));
    assert!(response.error.unwrap().contains("nope"));
}

#[tokio::test]
async fn test_rows_are_returned_with_row_count() {
    let source = FakeSource::new(Dialect::Postgres);
    source.respond_with(Ok(QueryOutput {
        rows: rows(3),
        rows_affected: 0,
    }));
    let h = harness(vec![Arc::new(FakeDriver::new(source.clone()))]);
    seed_connection(&h.store, "c1", Dialect::Postgres, PipelineMode::Direct).await;

    let response = h
        .app
        .gateway
        .execute(&request("c1", r#"SELECT * FROM "users" LIMIT 3"#))
        .await;

    assert!(response.success);
    assert_eq!(response.row_count, Some(3));
    let returned = response.rows.unwrap();
    assert_eq!(returned.len(), 3);
    assert_eq!(returned[0].get("name"), Some(&json!("row-1")));
    assert_eq!(source.queries(), vec![r#"SELECT * FROM "users" LIMIT 3"#]);
}

#[tokio::test]
async fn test_write_reports_affected_rows() {
    let source = FakeSource::new(Dialect::MySql);
    source.respond_with(Ok(QueryOutput {
        rows: Vec::new(),
        rows_affected: 7,
    }));
    let h = harness(vec![Arc::new(FakeDriver::new(source))]);
    seed_connection(&h.store, "c1", Dialect::MySql, PipelineMode::Direct).await;

    let response = h
        .app
        .gateway
        .execute(&request("c1", "UPDATE `orders` SET status = 'shipped'"))
        .await;

    assert!(response.success);
    assert_eq!(response.row_count, Some(7));
    assert_eq!(response.rows, Some(Vec::new()));
}

#[tokio::test]
async fn test_execution_error_text_is_passed_through_once() {
    let source = FakeSource::new(Dialect::Postgres);
    source.respond_with(Err(r#"relation "ghosts" does not exist"#.to_string()));
    let h = harness(vec![Arc::new(FakeDriver::new(source.clone()))]);
    seed_connection(&h.store, "c1", Dialect::Postgres, PipelineMode::Direct).await;

    let response = h
        .app
        .gateway
        .execute(&request("c1", r#"SELECT * FROM "ghosts""#))
        .await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::Execution));
    assert_eq!(response.error.as_deref(), Some(r#"relation "ghosts" does not exist"#));
    // Not retried.
    assert_eq!(source.queries().len(), 1);
}

#[tokio::test]
async fn test_unreachable_database_is_a_connection_error() {
    let source = FakeSource::new(Dialect::Postgres);
    let driver = Arc::new(FakeDriver::new(source.clone()).failing_first(usize::MAX));
    let h = harness(vec![driver]);
    seed_connection(&h.store, "c1", Dialect::Postgres, PipelineMode::Direct).await;

    let response = h.app.gateway.execute(&request("c1", "SELECT 1")).await;

    assert_eq!(response.error_kind, Some(ErrorKind::Connection));
    assert!(!response.error.unwrap().contains("s3cret"));
    assert!(source.queries().is_empty());
}

#[tokio::test]
async fn test_mongo_command_documents_reach_the_pool() {
    let source = FakeSource::new(Dialect::Mongo);
    source.respond_with(Ok(QueryOutput {
        rows: rows(2),
        rows_affected: 0,
    }));
    let h = harness(vec![Arc::new(FakeDriver::new(source.clone()))]);
    seed_connection(&h.store, "c1", Dialect::Mongo, PipelineMode::Direct).await;

    let command = r#"{"find": "users", "limit": 2}"#;
    let response = h.app.gateway.execute(&request("c1", command)).await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.row_count, Some(2));
    assert_eq!(source.queries(), vec![command]);
}
