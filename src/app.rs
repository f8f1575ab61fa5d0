//! Component wiring.
//!
//! [`App`] owns one pool registry and the stores, and builds the connection
//! service, sync engine and query gateway on top of them so they all share
//! the same pools.

use std::sync::Arc;

use anyhow::Result;

use dbgate_core::store::{ConnectionStore, WatermarkStore};

use crate::config::Config;
use crate::connections::ConnectionService;
use crate::gateway::QueryGateway;
use crate::index::IndexHandoff;
use crate::introspect::IntrospectOptions;
use crate::pool::PoolRegistry;
use crate::sqlite_store::SqliteStore;
use crate::sync::SyncEngine;
use crate::{db, migrate};

pub struct App {
    pub registry: Arc<PoolRegistry>,
    pub connections: Arc<dyn ConnectionStore>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub service: ConnectionService,
    pub sync: SyncEngine,
    pub gateway: QueryGateway,
    sqlite: Option<SqliteStore>,
}

impl App {
    /// Open the SQLite store (migrating it) and the built-in drivers.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        let store = SqliteStore::new(pool);
        let shared = Arc::new(store.clone());

        let mut app = Self::assemble(
            config,
            Arc::new(PoolRegistry::from_config(config)),
            shared.clone(),
            shared,
            Arc::new(IndexHandoff::from_config(config)),
        );
        app.sqlite = Some(store);
        Ok(app)
    }

    /// Wire components over caller-supplied parts.
    pub fn assemble(
        config: &Config,
        registry: Arc<PoolRegistry>,
        connections: Arc<dyn ConnectionStore>,
        watermarks: Arc<dyn WatermarkStore>,
        handoff: Arc<IndexHandoff>,
    ) -> Self {
        let options = IntrospectOptions::from(&config.sync);
        Self {
            service: ConnectionService::new(
                registry.clone(),
                connections.clone(),
                watermarks.clone(),
                handoff.clone(),
                options,
            ),
            sync: SyncEngine::new(
                registry.clone(),
                connections.clone(),
                watermarks.clone(),
                handoff,
                options,
            ),
            gateway: QueryGateway::new(registry.clone(), connections.clone()),
            registry,
            connections,
            watermarks,
            sqlite: None,
        }
    }

    /// Close every source pool and the local store. Idempotent.
    pub async fn shutdown(&self) {
        self.registry.release_all().await;
        if let Some(store) = &self.sqlite {
            store.close().await;
        }
    }
}
