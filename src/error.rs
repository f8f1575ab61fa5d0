//! Typed errors at the pool and query boundaries.
//!
//! Everything else in the crate propagates `anyhow::Error`; these two
//! types exist because callers branch on them: the query gateway maps
//! each variant to an [`ErrorKind`], and connection setup reports every
//! failed strategy attempt.

use thiserror::Error;

use dbgate_core::models::{Dialect, ErrorKind, QueryResponse};
use dbgate_core::validate::ValidationError;

use crate::strategy::ConnectStrategy;

/// One failed rung of the strategy ladder. `message` has the password
/// already masked.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub strategy: ConnectStrategy,
    pub message: String,
}

fn summarize(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(|a| format!("[{}] {}", a.strategy, a.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no driver registered for dialect '{0}'")]
    UnsupportedDialect(Dialect),

    #[error("pool registry is shut down")]
    ShutDown,

    #[error("could not connect '{connection_id}' after {} attempt(s): {}", .attempts.len(), summarize(.attempts))]
    Exhausted {
        connection_id: String,
        attempts: Vec<AttemptFailure>,
    },

    #[error("pool registry state is poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("connection '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Connection(#[from] ConnectError),

    /// Driver error text, passed through unmodified.
    #[error("{0}")]
    Execution(String),

    #[error("connection store error: {0:#}")]
    Store(anyhow::Error),
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::NotFound(_) => ErrorKind::NotFound,
            QueryError::Validation(_) => ErrorKind::Validation,
            QueryError::Connection(_) => ErrorKind::Connection,
            QueryError::Execution(_) => ErrorKind::Execution,
            QueryError::Store(_) => ErrorKind::Internal,
        }
    }
}

impl From<QueryError> for QueryResponse {
    fn from(err: QueryError) -> Self {
        QueryResponse::failure(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_lists_every_attempt() {
        let err = ConnectError::Exhausted {
            connection_id: "c1".into(),
            attempts: vec![
                AttemptFailure {
                    strategy: ConnectStrategy::AsGiven,
                    message: "tls required".into(),
                },
                AttemptFailure {
                    strategy: ConnectStrategy::PermissiveTls,
                    message: "timed out".into(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("after 2 attempt(s)"));
        assert!(text.contains("[initial] tls required"));
        assert!(text.contains("[permissive-tls] timed out"));
    }

    #[test]
    fn test_query_error_maps_to_response() {
        let resp: QueryResponse = QueryError::NotFound("c9".into()).into();
        assert!(!resp.success);
        assert_eq!(resp.error_kind, Some(ErrorKind::NotFound));
        assert_eq!(resp.error.as_deref(), Some("connection 'c9' not found"));

        let resp: QueryResponse = QueryError::Validation(ValidationError::Empty).into();
        assert_eq!(resp.error_kind, Some(ErrorKind::Validation));
    }
}
