//! # dbgate core
//!
//! Backend-independent logic for dbgate: data models, the row chunker,
//! document schema inference, query validation, and the store traits.
//!
//! This crate contains no tokio, sqlx, database drivers, or filesystem
//! I/O. Everything here can be tested without a running database.

pub mod chunk;
pub mod infer;
pub mod models;
pub mod store;
pub mod validate;
