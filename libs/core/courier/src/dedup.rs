//! Duplicate suppression.
//!
//! Two decision rules share one [`DedupFilter`]:
//!
//! - **Set variant** ([`DedupFilter::is_duplicate`]): the first sighting of an
//!   id adds it to a shared set and passes; the second finds it, removes it and
//!   reports a duplicate. A third sighting passes again, so the filter tolerates
//!   exactly one repeat per id.
//! - **Timestamp variant** ([`DedupFilter::is_duplicate_at`]): keeps
//!   `id → last timestamp`; an incoming timestamp lower than or equal to the
//!   stored one is a duplicate, anything newer replaces it.
//!
//! The filter fails open: without a store, or when the store errors, every
//! message passes.

use crate::error::{CourierError, Result};
use async_trait::async_trait;
use core_config::{DedupStoreConfig, FromEnv};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Set holding ids seen once.
pub const DEDUP_SET_KEY: &str = "duplicateEntryCheck";
/// Hash holding the last timestamp per id.
pub const DEDUP_HASH_KEY: &str = "duplicateEventCheck";

/// Shared backing store of the dedup filter.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn contains_member(&self, id: &str) -> Result<bool>;

    async fn add_member(&self, id: &str) -> Result<()>;

    async fn remove_member(&self, id: &str) -> Result<()>;

    async fn get_timestamp(&self, id: &str) -> Result<Option<i64>>;

    async fn set_timestamp(&self, id: &str, timestamp: i64) -> Result<()>;
}

/// Redis-backed store shared by every subscriber process.
#[derive(Clone)]
pub struct RedisDedupStore {
    conn: ConnectionManager,
}

impl RedisDedupStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Connect and verify with PING.
    pub async fn connect(config: &DedupStoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.connection_url().as_str())?;
        let mut conn = ConnectionManager::new(client).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Dedup store connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn contains_member(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(DEDUP_SET_KEY, id).await?)
    }

    async fn add_member(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(DEDUP_SET_KEY, id).await?;
        Ok(())
    }

    async fn remove_member(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(DEDUP_SET_KEY, id).await?;
        Ok(())
    }

    async fn get_timestamp(&self, id: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(DEDUP_HASH_KEY, id).await?)
    }

    async fn set_timestamp(&self, id: &str, timestamp: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hset(DEDUP_HASH_KEY, id, timestamp).await?;
        Ok(())
    }
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryDedupStore {
    members: Mutex<HashSet<String>>,
    timestamps: Mutex<HashMap<String, i64>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> CourierError {
    CourierError::store("dedup store lock poisoned")
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn contains_member(&self, id: &str) -> Result<bool> {
        Ok(self.members.lock().map_err(poisoned)?.contains(id))
    }

    async fn add_member(&self, id: &str) -> Result<()> {
        self.members.lock().map_err(poisoned)?.insert(id.to_string());
        Ok(())
    }

    async fn remove_member(&self, id: &str) -> Result<()> {
        self.members.lock().map_err(poisoned)?.remove(id);
        Ok(())
    }

    async fn get_timestamp(&self, id: &str) -> Result<Option<i64>> {
        Ok(self.timestamps.lock().map_err(poisoned)?.get(id).copied())
    }

    async fn set_timestamp(&self, id: &str, timestamp: i64) -> Result<()> {
        self.timestamps
            .lock()
            .map_err(poisoned)?
            .insert(id.to_string(), timestamp);
        Ok(())
    }
}

/// Duplicate decision function over an optional shared store.
#[derive(Clone, Default)]
pub struct DedupFilter {
    store: Option<Arc<dyn DedupStore>>,
}

impl DedupFilter {
    pub fn new(store: Arc<dyn DedupStore>) -> Self {
        Self { store: Some(store) }
    }

    /// A filter that lets everything through.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    /// In-process filter, for single-node deployments and tests.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDedupStore::new()))
    }

    /// Build from `REDIS_URL`/`REDIS_PASSWORD`; disabled when unset or unreachable.
    pub async fn from_env() -> Self {
        let config = match DedupStoreConfig::from_env() {
            Ok(config) => config,
            Err(e) => {
                info!(reason = %e, "Dedup store not configured, deduplication disabled");
                return Self::disabled();
            }
        };
        match RedisDedupStore::connect(&config).await {
            Ok(store) => Self::new(Arc::new(store)),
            Err(e) => {
                warn!(error = %e, "Dedup store unreachable, deduplication disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Set variant. Passes the first sighting, suppresses the second.
    pub async fn is_duplicate(&self, id: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match Self::check_member(store.as_ref(), id).await {
            Ok(duplicate) => {
                if duplicate {
                    debug!(id, "Duplicate suppressed");
                }
                duplicate
            }
            Err(e) => {
                warn!(id, error = %e, "Dedup store error, passing message");
                false
            }
        }
    }

    /// Timestamp variant. Suppresses anything not newer than the last sighting.
    pub async fn is_duplicate_at(&self, id: &str, timestamp: i64) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match Self::check_timestamp(store.as_ref(), id, timestamp).await {
            Ok(duplicate) => {
                if duplicate {
                    debug!(id, timestamp, "Stale or repeated event suppressed");
                }
                duplicate
            }
            Err(e) => {
                warn!(id, error = %e, "Dedup store error, passing message");
                false
            }
        }
    }

    async fn check_member(store: &dyn DedupStore, id: &str) -> Result<bool> {
        if store.contains_member(id).await? {
            store.remove_member(id).await?;
            Ok(true)
        } else {
            store.add_member(id).await?;
            Ok(false)
        }
    }

    async fn check_timestamp(store: &dyn DedupStore, id: &str, timestamp: i64) -> Result<bool> {
        match store.get_timestamp(id).await? {
            Some(last) if last >= timestamp => Ok(true),
            _ => {
                store.set_timestamp(id, timestamp).await?;
                Ok(false)
            }
        }
    }
}

impl std::fmt::Debug for DedupFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupFilter")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_set_variant_single_retry_window() {
        let filter = DedupFilter::in_memory();
        let results = vec![
            filter.is_duplicate("E1").await,
            filter.is_duplicate("E1").await,
            filter.is_duplicate("E1").await,
        ];
        assert_eq!(results, vec![false, true, false]);
    }

    #[tokio::test]
    async fn test_set_variant_ids_are_independent() {
        let filter = DedupFilter::in_memory();
        assert!(!filter.is_duplicate("a").await);
        assert!(!filter.is_duplicate("b").await);
        assert!(filter.is_duplicate("a").await);
        assert!(filter.is_duplicate("b").await);
    }

    #[tokio::test]
    async fn test_timestamp_variant() {
        let filter = DedupFilter::in_memory();
        let mut results = Vec::new();
        for ts in [5, 5, 7, 6] {
            results.push(filter.is_duplicate_at("E", ts).await);
        }
        assert_eq!(results, vec![false, true, false, true]);
    }

    #[tokio::test]
    async fn test_disabled_filter_always_passes() {
        let filter = DedupFilter::disabled();
        assert!(!filter.is_enabled());
        for _ in 0..3 {
            assert!(!filter.is_duplicate("E1").await);
            assert!(!filter.is_duplicate_at("E", 1).await);
        }
    }

    #[tokio::test]
    async fn test_store_error_fails_open() {
        let mut store = MockDedupStore::new();
        store
            .expect_contains_member()
            .returning(|_| Err(CourierError::store("connection refused")));
        store
            .expect_get_timestamp()
            .returning(|_| Err(CourierError::store("connection refused")));

        let filter = DedupFilter::new(Arc::new(store));
        assert!(!filter.is_duplicate("E1").await);
        assert!(!filter.is_duplicate_at("E", 9).await);
    }

    #[tokio::test]
    async fn test_set_variant_store_calls() {
        let mut store = MockDedupStore::new();
        store
            .expect_contains_member()
            .with(eq("E1"))
            .times(1)
            .returning(|_| Ok(true));
        store
            .expect_remove_member()
            .with(eq("E1"))
            .times(1)
            .returning(|_| Ok(()));
        store.expect_add_member().never();

        let filter = DedupFilter::new(Arc::new(store));
        assert!(filter.is_duplicate("E1").await);
    }

    #[tokio::test]
    async fn test_timestamp_variant_updates_on_newer() {
        let mut store = MockDedupStore::new();
        store
            .expect_get_timestamp()
            .with(eq("E"))
            .returning(|_| Ok(Some(5)));
        store
            .expect_set_timestamp()
            .with(eq("E"), eq(8i64))
            .times(1)
            .returning(|_, _| Ok(()));

        let filter = DedupFilter::new(Arc::new(store));
        assert!(!filter.is_duplicate_at("E", 8).await);
        assert!(filter.is_duplicate_at("E", 5).await);
    }

    #[tokio::test]
    #[ignore] // Requires Docker for the Redis container
    async fn test_redis_store_matches_memory_semantics() {
        let redis = test_utils::TestRedis::new().await;
        let client = redis::Client::open(redis.connection_string()).unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        let filter = DedupFilter::new(Arc::new(RedisDedupStore::new(conn)));

        assert!(!filter.is_duplicate("E1").await);
        assert!(filter.is_duplicate("E1").await);
        assert!(!filter.is_duplicate("E1").await);

        assert!(!filter.is_duplicate_at("E", 5).await);
        assert!(filter.is_duplicate_at("E", 5).await);
        assert!(!filter.is_duplicate_at("E", 7).await);
        assert!(filter.is_duplicate_at("E", 6).await);
    }
}
