//! Query execution gateway.
//!
//! Resolves the connection, rejects queries that fail validation before
//! any network call, runs the query once on the connection's pool and
//! returns a [`QueryResponse`] in the same shape for every dialect.
//! Failures are values, never `Err`.

use std::sync::Arc;

use tracing::{debug, warn};

use dbgate_core::models::{QueryRequest, QueryResponse};
use dbgate_core::store::ConnectionStore;
use dbgate_core::validate::validate_query;

use crate::error::QueryError;
use crate::pool::PoolRegistry;

pub struct QueryGateway {
    registry: Arc<PoolRegistry>,
    connections: Arc<dyn ConnectionStore>,
}

impl QueryGateway {
    pub fn new(registry: Arc<PoolRegistry>, connections: Arc<dyn ConnectionStore>) -> Self {
        Self {
            registry,
            connections,
        }
    }

    pub async fn execute(&self, request: &QueryRequest) -> QueryResponse {
        match self.try_execute(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    connection_id = %request.connection_id,
                    kind = ?e.kind(),
                    error = %e,
                    "query rejected"
                );
                e.into()
            }
        }
    }

    async fn try_execute(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let connection = self
            .connections
            .get_connection(&request.connection_id)
            .await
            .map_err(QueryError::Store)?
            .ok_or_else(|| QueryError::NotFound(request.connection_id.clone()))?;

        validate_query(connection.dialect, &request.query_text)?;

        let pool = self
            .registry
            .acquire(&connection.id, connection.dialect, &connection.credentials_uri)
            .await?;

        let output = pool
            .run_query(&request.query_text)
            .await
            .map_err(|e| QueryError::Execution(format!("{:#}", e)))?;

        let row_count = output.row_count();
        debug!(
            connection_id = %connection.id,
            dialect = %connection.dialect,
            rows = output.rows.len(),
            row_count,
            "query executed"
        );
        Ok(QueryResponse::ok(output.rows, row_count))
    }
}
