//! # dbgate
//!
//! A gateway to user-supplied databases with incremental, count-based sync.
//!
//! dbgate keeps one pool per connection for PostgreSQL, MySQL and MongoDB,
//! snapshots each connection's schema and a bounded sample of its data,
//! re-fetches only tables whose row count grew, and runs read/write queries
//! through a single validated, dialect-agnostic boundary. Updated tables are
//! chunked by primary key and handed to an external indexer.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌─────────────┐
//! │  Drivers   │◀──│ PoolRegistry │◀──│ SyncEngine  │──▶ IndexWriter
//! │ PG/MySQL/  │   │ TLS ladder + │   │ QueryGateway│
//! │  MongoDB   │   │ health tasks │   │ Connections │
//! └────────────┘   └──────────────┘   └──────┬──────┘
//!                                            ▼
//!                                      ┌──────────┐
//!                                      │  SQLite  │
//!                                      │  store   │
//!                                      └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dbgate init
//! dbgate connect --name shop --dialect postgres --uri postgres://app:pw@db/shop
//! dbgate sync all
//! dbgate query <id> "SELECT count(*) FROM orders"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`driver`] | Dialect drivers behind `Driver` / `SourcePool` |
//! | [`strategy`] | Connection strategy ladder and URI redaction |
//! | [`pool`] | Per-connection pool registry |
//! | [`introspect`] | Batched schema and data introspection |
//! | [`sync`] | Incremental, watermark-driven sync |
//! | [`gateway`] | Validated query execution |
//! | [`index`] | Chunking hand-off to the indexer |
//! | [`connections`] | Establish / delete lifecycle |
//! | [`sqlite_store`] | SQLite connection and watermark store |
//! | [`db`] | Local database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod config;
pub mod connections;
pub mod db;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod index;
pub mod introspect;
pub mod logging;
pub mod migrate;
pub mod pool;
pub mod progress;
pub mod sqlite_store;
pub mod stats;
pub mod strategy;
pub mod sync;

pub use dbgate_core::{chunk, infer, models, store, validate};
