//! Pool registry.
//!
//! At most one live pool exists per `(connection id, dialect)`. Concurrent
//! first callers for the same key share a single creation attempt: the
//! registry map only hands out a per-key [`OnceCell`], and the strategy
//! ladder runs inside that cell's initializer. Nothing holds the map lock
//! across an `await`.
//!
//! Each pool gets a background health task that pings it on an interval.
//! A failed ping is treated as fatal: the pool is evicted, closed and a
//! [`PoolEvent::Fatal`] is published. The next acquire builds a fresh pool.
//!
//! [`PoolRegistry::release_all`] drains every pool exactly once, however
//! often it is called.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use dbgate_core::models::Dialect;

use crate::config::Config;
use crate::driver::{Drivers, PoolHandle, PoolSettings};
use crate::error::{AttemptFailure, ConnectError};
use crate::strategy::{redact_message, ConnectStrategy};

type PoolKey = (String, Dialect);

/// Lifecycle notifications published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Opened {
        connection_id: String,
        dialect: Dialect,
        strategy: ConnectStrategy,
    },
    /// The pool failed its health check and was evicted.
    Fatal {
        connection_id: String,
        dialect: Dialect,
        message: String,
    },
    Closed {
        connection_id: String,
        dialect: Dialect,
    },
}

#[derive(Default)]
struct PoolSlot {
    cell: OnceCell<PoolHandle>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PoolSlot {
    fn stop_monitor(&self) {
        if let Ok(mut monitor) = self.monitor.lock() {
            if let Some(task) = monitor.take() {
                task.abort();
            }
        }
    }

    /// Stop the monitor and close the pool if one was built. Only the
    /// first caller closes; returns whether this call did.
    async fn retire(&self) -> bool {
        self.stop_monitor();
        let Some(handle) = self.cell.get() else {
            return false;
        };
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        handle.close().await;
        true
    }
}

type SlotMap = Arc<Mutex<HashMap<PoolKey, Arc<PoolSlot>>>>;

pub struct PoolRegistry {
    drivers: Drivers,
    settings: PoolSettings,
    health_check_interval: Duration,
    slots: SlotMap,
    events: broadcast::Sender<PoolEvent>,
    shut_down: AtomicBool,
}

impl PoolRegistry {
    pub fn new(drivers: Drivers, settings: PoolSettings, health_check_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            drivers,
            settings,
            health_check_interval,
            slots: Arc::new(Mutex::new(HashMap::new())),
            events,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Registry with the built-in drivers and `[pool]` settings.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Drivers::builtin(config),
            PoolSettings::from(&config.pool),
            config.pool.health_check_interval(),
        )
    }

    /// Subscribe to pool lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Number of live pools.
    pub fn pool_count(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.values().filter(|s| s.cell.initialized()).count())
            .unwrap_or(0)
    }

    /// Return the pool for `(connection_id, dialect)`, creating it on
    /// first use.
    ///
    /// A pool built while its slot was released is closed instead of
    /// handed out; after `release` the caller retries on a fresh slot,
    /// after `release_all` it gets [`ConnectError::ShutDown`].
    pub async fn acquire(
        &self,
        connection_id: &str,
        dialect: Dialect,
        uri: &str,
    ) -> Result<PoolHandle, ConnectError> {
        let key: PoolKey = (connection_id.to_string(), dialect);
        loop {
            if self.shut_down.load(Ordering::SeqCst) {
                return Err(ConnectError::ShutDown);
            }

            let slot = {
                let mut slots = self.slots.lock().map_err(|_| ConnectError::Poisoned)?;
                Arc::clone(slots.entry(key.clone()).or_default())
            };

            let initialized = slot
                .cell
                .get_or_try_init(|| async {
                    let handle = self.open(connection_id, dialect, uri).await?;
                    let monitor =
                        self.spawn_monitor(key.clone(), handle.clone(), Arc::downgrade(&slot));
                    if let Ok(mut guard) = slot.monitor.lock() {
                        *guard = Some(monitor);
                    }
                    Ok::<_, ConnectError>(handle)
                })
                .await;

            let handle = match initialized {
                Ok(handle) => Arc::clone(handle),
                Err(e) => {
                    self.forget_empty_slot(&key, &slot);
                    return Err(e);
                }
            };

            if !self.shut_down.load(Ordering::SeqCst) && self.is_current(&key, &slot) {
                return Ok(handle);
            }

            // Released while the pool was being built.
            if slot.retire().await {
                debug!(connection_id, %dialect, "closed pool built during release");
                let _ = self.events.send(PoolEvent::Closed {
                    connection_id: connection_id.to_string(),
                    dialect,
                });
            }
        }
    }

    fn is_current(&self, key: &PoolKey, slot: &Arc<PoolSlot>) -> bool {
        self.slots
            .lock()
            .map(|map| map.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)))
            .unwrap_or(false)
    }

    /// Drop a slot whose pool could not be built, unless another caller
    /// has since filled or replaced it.
    fn forget_empty_slot(&self, key: &PoolKey, slot: &Arc<PoolSlot>) {
        if let Ok(mut map) = self.slots.lock() {
            let stale = map
                .get(key)
                .is_some_and(|s| Arc::ptr_eq(s, slot) && !s.cell.initialized());
            if stale {
                map.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    async fn open(
        &self,
        connection_id: &str,
        dialect: Dialect,
        uri: &str,
    ) -> Result<PoolHandle, ConnectError> {
        let driver = self
            .drivers
            .get(dialect)
            .ok_or(ConnectError::UnsupportedDialect(dialect))?;

        let mut attempts: Vec<AttemptFailure> = Vec::new();
        let mut tried: Vec<String> = Vec::new();

        for strategy in ConnectStrategy::LADDER {
            let candidate = strategy.apply(uri, driver.permissive_tls_params());
            if tried.contains(&candidate) {
                debug!(connection_id, %strategy, "strategy yields an already-tried URI, skipping");
                continue;
            }

            match driver.connect(&candidate, &self.settings).await {
                Ok(handle) => {
                    info!(
                        connection_id,
                        %dialect,
                        %strategy,
                        attempts = attempts.len() + 1,
                        "pool opened"
                    );
                    let _ = self.events.send(PoolEvent::Opened {
                        connection_id: connection_id.to_string(),
                        dialect,
                        strategy,
                    });
                    return Ok(handle);
                }
                Err(e) => {
                    let message = redact_message(&format!("{:#}", e), uri);
                    warn!(connection_id, %dialect, %strategy, error = %message, "connect attempt failed");
                    attempts.push(AttemptFailure { strategy, message });
                    tried.push(candidate);
                }
            }
        }

        Err(ConnectError::Exhausted {
            connection_id: connection_id.to_string(),
            attempts,
        })
    }

    fn spawn_monitor(&self, key: PoolKey, handle: PoolHandle, slot: Weak<PoolSlot>) -> JoinHandle<()> {
        let slots = Arc::clone(&self.slots);
        let events = self.events.clone();
        let every = self.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately; the pool was just verified.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Err(e) = handle.ping().await else {
                    continue;
                };

                let evicted = match slots.lock() {
                    Ok(mut map) => {
                        let current = map
                            .get(&key)
                            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), slot.as_ptr()));
                        current && map.remove(&key).is_some()
                    }
                    Err(_) => false,
                };

                let message = format!("{:#}", e);
                error!(connection_id = %key.0, dialect = %key.1, error = %message, "pool failed health check");
                let _ = events.send(PoolEvent::Fatal {
                    connection_id: key.0.clone(),
                    dialect: key.1,
                    message,
                });
                let first_close = slot
                    .upgrade()
                    .map_or(true, |s| !s.closed.swap(true, Ordering::SeqCst));
                if evicted && first_close {
                    handle.close().await;
                    let _ = events.send(PoolEvent::Closed {
                        connection_id: key.0.clone(),
                        dialect: key.1,
                    });
                }
                break;
            }
        })
    }

    /// Close every pool belonging to `connection_id`. Returns how many
    /// pools were closed.
    pub async fn release(&self, connection_id: &str) -> usize {
        let removed: Vec<(PoolKey, Arc<PoolSlot>)> = match self.slots.lock() {
            Ok(mut map) => {
                let keys: Vec<PoolKey> = map
                    .keys()
                    .filter(|(id, _)| id == connection_id)
                    .cloned()
                    .collect();
                keys.into_iter()
                    .filter_map(|k| map.remove(&k).map(|slot| (k, slot)))
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        self.close_slots(removed).await
    }

    /// Drain and close every pool. Only the first call does any work.
    pub async fn release_all(&self) -> usize {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("pool registry already shut down");
            return 0;
        }
        let drained: Vec<(PoolKey, Arc<PoolSlot>)> = match self.slots.lock() {
            Ok(mut map) => map.drain().collect(),
            Err(_) => Vec::new(),
        };
        let closed = self.close_slots(drained).await;
        info!(pools = closed, "pool registry shut down");
        closed
    }

    async fn close_slots(&self, slots: Vec<(PoolKey, Arc<PoolSlot>)>) -> usize {
        let mut closed = 0;
        for ((connection_id, dialect), slot) in slots {
            if slot.retire().await {
                closed += 1;
                debug!(%connection_id, %dialect, "pool closed");
                let _ = self.events.send(PoolEvent::Closed {
                    connection_id,
                    dialect,
                });
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, QueryOutput, SourcePool};
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use dbgate_core::models::{ColumnDescriptor, Record};
    use std::sync::atomic::AtomicUsize;

    struct FlakyPool {
        healthy: AtomicBool,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl SourcePool for FlakyPool {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }
        async fn ping(&self) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                bail!("server closed the connection")
            }
        }
        async fn list_tables(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn describe_columns(&self, _table: &str) -> Result<Vec<ColumnDescriptor>> {
            Ok(vec![])
        }
        async fn sample_rows(&self, _table: &str, _limit: u32) -> Result<Vec<Record>> {
            Ok(vec![])
        }
        async fn count_rows(&self, _table: &str) -> Result<u64> {
            Ok(0)
        }
        async fn run_query(&self, _query: &str) -> Result<QueryOutput> {
            Ok(QueryOutput::default())
        }
        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FlakyDriver {
        pool: Arc<FlakyPool>,
        delay: Duration,
        refuse: bool,
    }

    #[async_trait]
    impl Driver for FlakyDriver {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }
        fn permissive_tls_params(&self) -> &'static [(&'static str, &'static str)] {
            &[("sslmode", "require")]
        }
        async fn connect(&self, _uri: &str, _settings: &PoolSettings) -> Result<PoolHandle> {
            tokio::time::sleep(self.delay).await;
            if self.refuse {
                bail!("connection refused");
            }
            Ok(self.pool.clone())
        }
    }

    fn registry(pool: Arc<FlakyPool>, every: Duration) -> PoolRegistry {
        with_driver(FlakyDriver {
            pool,
            delay: Duration::ZERO,
            refuse: false,
        }, every)
    }

    fn with_driver(driver: FlakyDriver, every: Duration) -> PoolRegistry {
        let mut drivers = Drivers::new();
        drivers.register(Arc::new(driver));
        PoolRegistry::new(drivers, PoolSettings::default(), every)
    }

    fn healthy_pool() -> Arc<FlakyPool> {
        Arc::new(FlakyPool {
            healthy: AtomicBool::new(true),
            closed: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_failed_health_check_evicts_and_publishes_fatal() {
        let pool = Arc::new(FlakyPool {
            healthy: AtomicBool::new(true),
            closed: AtomicUsize::new(0),
        });
        let registry = registry(pool.clone(), Duration::from_millis(20));
        let mut events = registry.subscribe();

        registry
            .acquire("c1", Dialect::Postgres, "postgres://h/db")
            .await
            .unwrap();
        assert!(matches!(events.recv().await.unwrap(), PoolEvent::Opened { .. }));
        assert_eq!(registry.pool_count(), 1);

        pool.healthy.store(false, Ordering::SeqCst);
        let fatal = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(fatal, PoolEvent::Fatal { ref connection_id, .. } if connection_id == "c1"));

        let closed = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(closed, PoolEvent::Closed { .. }));
        assert_eq!(registry.pool_count(), 0);
        assert_eq!(pool.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_all_is_idempotent_and_blocks_acquire() {
        let pool = Arc::new(FlakyPool {
            healthy: AtomicBool::new(true),
            closed: AtomicUsize::new(0),
        });
        let registry = registry(pool.clone(), Duration::from_secs(60));
        registry
            .acquire("c1", Dialect::Postgres, "postgres://h/db")
            .await
            .unwrap();

        assert_eq!(registry.release_all().await, 1);
        assert_eq!(registry.release_all().await, 0);
        assert_eq!(pool.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            registry.acquire("c1", Dialect::Postgres, "postgres://h/db").await,
            Err(ConnectError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_unknown_dialect() {
        let registry = PoolRegistry::new(Drivers::new(), PoolSettings::default(), Duration::from_secs(60));
        let err = registry
            .acquire("c1", Dialect::Mongo, "mongodb://h/db")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::UnsupportedDialect(Dialect::Mongo)));
    }

    #[tokio::test]
    async fn test_shutdown_during_connect_closes_the_new_pool() {
        let pool = healthy_pool();
        let registry = Arc::new(with_driver(
            FlakyDriver {
                pool: pool.clone(),
                delay: Duration::from_millis(50),
                refuse: false,
            },
            Duration::from_secs(60),
        ));

        let acquiring = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .acquire("c1", Dialect::Postgres, "postgres://h/db")
                    .await
                    .map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.release_all().await;

        let result = acquiring.await.unwrap();
        assert!(matches!(result, Err(ConnectError::ShutDown)));
        assert_eq!(pool.closed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pool_count(), 0);
        assert_eq!(registry.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_release_during_connect_leaves_a_single_live_pool() {
        let pool = healthy_pool();
        let registry = Arc::new(with_driver(
            FlakyDriver {
                pool: pool.clone(),
                delay: Duration::from_millis(50),
                refuse: false,
            },
            Duration::from_secs(60),
        ));

        let acquiring = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .acquire("c1", Dialect::Postgres, "postgres://h/db")
                    .await
                    .map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.release("c1").await, 0);

        acquiring.await.unwrap().unwrap();
        // The pool built on the released slot was closed; a fresh one serves.
        assert_eq!(pool.closed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pool_count(), 1);
        assert_eq!(registry.slot_count(), 1);

        assert_eq!(registry.release_all().await, 1);
        assert_eq!(pool.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_acquire_leaves_no_slot_behind() {
        let registry = with_driver(
            FlakyDriver {
                pool: healthy_pool(),
                delay: Duration::ZERO,
                refuse: true,
            },
            Duration::from_secs(60),
        );

        for i in 0..5 {
            let id = format!("c{}", i);
            assert!(registry
                .acquire(&id, Dialect::Postgres, "postgres://h/db")
                .await
                .is_err());
        }
        assert_eq!(registry.slot_count(), 0);
        assert_eq!(registry.pool_count(), 0);
    }
}
