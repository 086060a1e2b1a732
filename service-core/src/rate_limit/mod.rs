//! Per-key request rate control.
//!
//! A [`RateLimiterBackend`] admits or rejects a request by caller key. Two
//! backends implement the same contract and are chosen by configuration:
//!
//! - [`MemoryRateLimiter`]: a governor token bucket per key, held in a sharded
//!   map and swept periodically so idle keys do not accumulate.
//! - [`SharedRateLimiter`]: a token bucket kept in Redis and updated with one
//!   atomic script call, so every replica sees the same budget. Store errors
//!   admit the request.

mod memory;
mod shared;

pub use memory::MemoryRateLimiter;
pub use shared::SharedRateLimiter;

use crate::error::AppError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::{str::FromStr, sync::Arc, time::Duration};

/// Budget for one limiter scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Requests replenished per window.
    pub requests: u32,
    pub window_seconds: u64,
    /// Requests that may be spent back-to-back from a full bucket.
    pub burst: u32,
}

impl RateLimitPolicy {
    pub fn new(requests: u32, window_seconds: u64, burst: u32) -> Self {
        Self {
            requests: requests.max(1),
            window_seconds: window_seconds.max(1),
            burst: burst.max(1),
        }
    }

    /// Time to replenish a single token.
    pub fn replenish_interval(&self) -> Duration {
        let millis = (self.window_seconds * 1000) / self.requests as u64;
        Duration::from_millis(millis.max(1))
    }

    /// Tokens replenished per millisecond.
    pub fn tokens_per_milli(&self) -> f64 {
        self.requests as f64 / (self.window_seconds as f64 * 1000.0)
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }

    /// Whole seconds a rejected caller should wait, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RateDecision::Allowed => None,
            RateDecision::Limited { retry_after } => {
                Some((retry_after.as_millis() as u64).div_ceil(1000).max(1))
            }
        }
    }
}

#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Name of the scope this limiter guards, e.g. "api" or "auth".
    fn scope(&self) -> &str;

    /// Spend one token for `key`. Never errors: backend failures resolve to a decision.
    async fn check(&self, key: &str) -> RateDecision;

    async fn allow(&self, key: &str) -> bool {
        self.check(key).await.is_allowed()
    }
}

pub type SharedLimiter = Arc<dyn RateLimiterBackend>;

/// Where limiter state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStorage {
    Memory,
    SharedStore,
}

impl FromStr for RateLimitStorage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(RateLimitStorage::Memory),
            "shared-store" | "redis" => Ok(RateLimitStorage::SharedStore),
            _ => Err(format!("Invalid rate limit storage: {}", s)),
        }
    }
}

/// Options shared by every limiter built for one process.
#[derive(Clone)]
pub struct RateLimiterOptions {
    pub storage: RateLimitStorage,
    /// For memory limiters, how often the sweep runs. A bucket is dropped on
    /// the first sweep after it has fully refilled, not after this long idle.
    /// For the shared store, the expiry set on each key.
    pub cleanup_ttl: Duration,
    /// Upper bound on a single shared-store round trip.
    pub store_timeout: Duration,
    pub redis: Option<ConnectionManager>,
}

/// Build the configured backend for `scope`.
pub fn build_rate_limiter(
    scope: &str,
    policy: RateLimitPolicy,
    options: &RateLimiterOptions,
) -> Result<SharedLimiter, AppError> {
    match options.storage {
        RateLimitStorage::Memory => Ok(Arc::new(MemoryRateLimiter::new(
            scope,
            policy,
            options.cleanup_ttl,
        )?)),
        RateLimitStorage::SharedStore => {
            let manager = options.redis.clone().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "shared-store rate limiting requires a Redis connection"
                ))
            })?;
            Ok(Arc::new(SharedRateLimiter::new(
                scope,
                policy,
                manager,
                options.cleanup_ttl,
                options.store_timeout,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replenish_interval() {
        let policy = RateLimitPolicy::new(10, 60, 10);
        assert_eq!(policy.replenish_interval(), Duration::from_secs(6));

        let fast = RateLimitPolicy::new(1000, 60, 1000);
        assert_eq!(fast.replenish_interval(), Duration::from_millis(60));
    }

    #[test]
    fn test_policy_clamps_zero_values() {
        let policy = RateLimitPolicy::new(0, 0, 0);
        assert_eq!(policy.requests, 1);
        assert_eq!(policy.window_seconds, 1);
        assert_eq!(policy.burst, 1);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = RateDecision::Limited {
            retry_after: Duration::from_millis(1200),
        };
        assert_eq!(decision.retry_after_secs(), Some(2));

        let tiny = RateDecision::Limited {
            retry_after: Duration::from_millis(0),
        };
        assert_eq!(tiny.retry_after_secs(), Some(1));
        assert_eq!(RateDecision::Allowed.retry_after_secs(), None);
    }

    #[test]
    fn test_storage_parse() {
        assert_eq!("memory".parse(), Ok(RateLimitStorage::Memory));
        assert_eq!("shared-store".parse(), Ok(RateLimitStorage::SharedStore));
        assert!("disk".parse::<RateLimitStorage>().is_err());
    }

    #[tokio::test]
    async fn test_shared_store_requires_connection() {
        let options = RateLimiterOptions {
            storage: RateLimitStorage::SharedStore,
            cleanup_ttl: Duration::from_secs(3600),
            store_timeout: Duration::from_secs(5),
            redis: None,
        };
        let result = build_rate_limiter("api", RateLimitPolicy::new(10, 60, 10), &options);
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }
}
