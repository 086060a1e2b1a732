//! Role permission cache.
//!
//! Maps a role id to the role's permission set and level with a fixed TTL.
//! Two backends share the [`PermissionCache`] contract:
//!
//! - [`MemoryPermissionCache`]: a locked map swept periodically.
//! - [`RedisPermissionCache`]: one key per role, `permissions:role:<role_id>`,
//!   expiring server-side. Read failures are treated as misses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::ServiceError;
use crate::models::SUPER_ADMIN_LEVEL;

/// Cached view of one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPermissionSet {
    pub role_level: i32,
    pub permissions: HashSet<String>,
    pub fetched_at: DateTime<Utc>,
}

impl CachedPermissionSet {
    pub fn new(role_level: i32, permissions: impl IntoIterator<Item = String>) -> Self {
        Self {
            role_level,
            permissions: permissions.into_iter().collect(),
            fetched_at: Utc::now(),
        }
    }

    /// Super admins hold every permission.
    pub fn grants(&self, permission: &str) -> bool {
        self.role_level == SUPER_ADMIN_LEVEL || self.permissions.contains(permission)
    }

    pub fn sorted_permissions(&self) -> Vec<String> {
        let mut perms: Vec<String> = self.permissions.iter().cloned().collect();
        perms.sort();
        perms
    }
}

#[async_trait]
pub trait PermissionCache: Send + Sync {
    /// Cached entry for the role, `None` on miss, expiry, or backend error.
    async fn get(&self, role_id: Uuid) -> Option<CachedPermissionSet>;

    async fn set(&self, role_id: Uuid, entry: &CachedPermissionSet) -> Result<(), ServiceError>;

    /// Drop the role's entry. Callers that change grants must see this succeed.
    async fn invalidate(&self, role_id: Uuid) -> Result<(), ServiceError>;
}

/// Where cached permission sets live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionCacheStorage {
    Memory,
    SharedStore,
}

impl FromStr for PermissionCacheStorage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(PermissionCacheStorage::Memory),
            "shared-store" | "redis" => Ok(PermissionCacheStorage::SharedStore),
            _ => Err(format!("Invalid permission cache storage: {}", s)),
        }
    }
}

/// Build the configured cache backend.
pub fn build_permission_cache(
    storage: PermissionCacheStorage,
    ttl: Duration,
    store_timeout: Duration,
    redis: Option<ConnectionManager>,
) -> Result<Arc<dyn PermissionCache>, AppError> {
    match storage {
        PermissionCacheStorage::Memory => Ok(Arc::new(MemoryPermissionCache::new(ttl))),
        PermissionCacheStorage::SharedStore => {
            let manager = redis.ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "shared-store permission cache requires a Redis connection"
                ))
            })?;
            Ok(Arc::new(RedisPermissionCache::new(manager, ttl, store_timeout)))
        }
    }
}

type Entries = Mutex<HashMap<Uuid, (CachedPermissionSet, Instant)>>;

/// In-process cache. A background sweep removes expired entries every TTL and
/// stops when the cache is dropped.
pub struct MemoryPermissionCache {
    entries: Arc<Entries>,
    ttl: Duration,
    sweeper: CancellationToken,
}

impl MemoryPermissionCache {
    /// Must be called from within a Tokio runtime.
    pub fn new(ttl: Duration) -> Self {
        let entries: Arc<Entries> = Arc::new(Mutex::new(HashMap::new()));
        let sweeper = CancellationToken::new();
        spawn_sweep(entries.clone(), ttl, sweeper.clone());

        Self {
            entries,
            ttl,
            sweeper,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries now.
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.entries)
    }
}

impl Drop for MemoryPermissionCache {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

fn sweep_expired(entries: &Entries) -> usize {
    let Ok(mut map) = entries.lock() else {
        return 0;
    };
    let now = Instant::now();
    let before = map.len();
    map.retain(|_, (_, expires_at)| *expires_at > now);
    before - map.len()
}

fn spawn_sweep(entries: Arc<Entries>, interval: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = sweep_expired(&entries);
                    if evicted > 0 {
                        tracing::debug!(evicted, "Permission cache sweep completed");
                    }
                }
            }
        }
    });
}

#[async_trait]
impl PermissionCache for MemoryPermissionCache {
    async fn get(&self, role_id: Uuid) -> Option<CachedPermissionSet> {
        let mut map = self.entries.lock().ok()?;
        let expired = match map.get(&role_id) {
            Some((entry, expires_at)) if *expires_at > Instant::now() => {
                return Some(entry.clone())
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            map.remove(&role_id);
        }
        None
    }

    async fn set(&self, role_id: Uuid, entry: &CachedPermissionSet) -> Result<(), ServiceError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| {
                ServiceError::Internal(anyhow::anyhow!("permission cache lock poisoned"))
            })?;
        map.insert(role_id, (entry.clone(), Instant::now() + self.ttl));
        Ok(())
    }

    async fn invalidate(&self, role_id: Uuid) -> Result<(), ServiceError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| {
                ServiceError::Internal(anyhow::anyhow!("permission cache lock poisoned"))
            })?;
        map.remove(&role_id);
        Ok(())
    }
}

/// Redis-backed cache shared by every replica.
pub struct RedisPermissionCache {
    manager: ConnectionManager,
    ttl: Duration,
    timeout: Duration,
}

impl RedisPermissionCache {
    pub fn new(manager: ConnectionManager, ttl: Duration, timeout: Duration) -> Self {
        Self {
            manager,
            ttl,
            timeout,
        }
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, redis::RedisError>>,
    ) -> Result<T, ServiceError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ServiceError::unavailable("permission cache", "timed out"))?
            .map_err(ServiceError::from)
    }
}

pub(crate) fn cache_key(role_id: Uuid) -> String {
    format!("permissions:role:{}", role_id)
}

/// Decode a cache read. Store failures and malformed entries are misses, so
/// the engine falls back to the directory.
fn read_entry(
    role_id: Uuid,
    raw: Result<Option<String>, ServiceError>,
) -> Option<CachedPermissionSet> {
    let raw = match raw {
        Ok(raw) => raw?,
        Err(e) => {
            tracing::warn!(role_id = %role_id, error = %e, "Permission cache read failed");
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::warn!(role_id = %role_id, error = %e, "Discarding malformed cache entry");
            None
        }
    }
}

#[async_trait]
impl PermissionCache for RedisPermissionCache {
    async fn get(&self, role_id: Uuid) -> Option<CachedPermissionSet> {
        let mut conn = self.manager.clone();
        let key = cache_key(role_id);
        let raw = self
            .bounded(redis::cmd("GET").arg(&key).query_async(&mut conn))
            .await;
        read_entry(role_id, raw)
    }

    async fn set(&self, role_id: Uuid, entry: &CachedPermissionSet) -> Result<(), ServiceError> {
        let payload = serde_json::to_string(entry)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("encode cache entry: {}", e)))?;
        let mut conn = self.manager.clone();
        let _: () = self
            .bounded(
                redis::cmd("SET")
                    .arg(cache_key(role_id))
                    .arg(payload)
                    .arg("EX")
                    .arg(self.ttl.as_secs().max(1))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn invalidate(&self, role_id: Uuid) -> Result<(), ServiceError> {
        let mut conn = self.manager.clone();
        let _: () = self
            .bounded(redis::cmd("DEL").arg(cache_key(role_id)).query_async(&mut conn))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_invalidate() {
        let cache = MemoryPermissionCache::new(Duration::from_secs(60));
        let role_id = Uuid::new_v4();
        let entry = CachedPermissionSet::new(10, vec!["orders:read".to_string()]);

        assert!(cache.get(role_id).await.is_none());
        cache.set(role_id, &entry).await.unwrap();
        assert_eq!(cache.get(role_id).await, Some(entry));

        cache.invalidate(role_id).await.unwrap();
        assert!(cache.get(role_id).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_miss_and_sweep() {
        let cache = MemoryPermissionCache::new(Duration::from_millis(10));
        let role_id = Uuid::new_v4();
        cache
            .set(role_id, &CachedPermissionSet::new(10, Vec::new()))
            .await
            .unwrap();
        cache
            .set(Uuid::new_v4(), &CachedPermissionSet::new(10, Vec::new()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(role_id).await.is_none());
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_super_admin_grants_everything() {
        let admin = CachedPermissionSet::new(SUPER_ADMIN_LEVEL, Vec::new());
        assert!(admin.grants("anything:at-all"));

        let clerk = CachedPermissionSet::new(10, vec!["orders:read".to_string()]);
        assert!(clerk.grants("orders:read"));
        assert!(!clerk.grants("orders:write"));
    }

    #[test]
    fn test_store_read_failure_is_a_miss() {
        let role_id = Uuid::new_v4();
        let down = Err(ServiceError::unavailable("permission cache", "timed out"));
        assert_eq!(read_entry(role_id, down), None);
        assert_eq!(read_entry(role_id, Ok(None)), None);
        assert_eq!(read_entry(role_id, Ok(Some("{not json".to_string()))), None);

        let entry = CachedPermissionSet::new(40, vec!["members:read".to_string()]);
        let stored = serde_json::to_string(&entry).unwrap();
        assert_eq!(read_entry(role_id, Ok(Some(stored))), Some(entry));
    }

    #[test]
    fn test_cache_key_schema() {
        let role_id = Uuid::nil();
        assert_eq!(
            cache_key(role_id),
            "permissions:role:00000000-0000-0000-0000-000000000000"
        );
    }
}
