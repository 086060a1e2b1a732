use super::{RateDecision, RateLimitPolicy, RateLimiterBackend};
use crate::error::AppError;
use async_trait::async_trait;
use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Token bucket per caller key, kept in process memory.
///
/// A background sweep drops buckets that have refilled completely, which is the
/// state an idle key converges to. The sweep stops when the limiter is dropped.
pub struct MemoryRateLimiter {
    scope: String,
    limiter: Arc<KeyedLimiter>,
    clock: DefaultClock,
    sweeper: CancellationToken,
}

impl MemoryRateLimiter {
    /// Must be called from within a Tokio runtime; the sweep task is spawned here.
    pub fn new(
        scope: &str,
        policy: RateLimitPolicy,
        cleanup_interval: Duration,
    ) -> Result<Self, AppError> {
        let burst = NonZeroU32::new(policy.burst).ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!("rate limit burst must be non-zero"))
        })?;
        let quota = Quota::with_period(policy.replenish_interval())
            .ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!("rate limit period must be non-zero"))
            })?
            .allow_burst(burst);

        let limiter = Arc::new(RateLimiter::dashmap(quota));
        let sweeper = CancellationToken::new();
        spawn_sweep(
            scope.to_string(),
            limiter.clone(),
            cleanup_interval,
            sweeper.clone(),
        );

        tracing::info!(
            scope = scope,
            requests = policy.requests,
            window_seconds = policy.window_seconds,
            burst = policy.burst,
            "In-memory rate limiter initialized"
        );

        Ok(Self {
            scope: scope.to_string(),
            limiter,
            clock: DefaultClock::default(),
            sweeper,
        })
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.limiter.len()
    }

    /// Evict buckets that are indistinguishable from a fresh one.
    pub fn sweep(&self) {
        sweep_idle(&self.limiter);
    }
}

impl Drop for MemoryRateLimiter {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

#[async_trait]
impl RateLimiterBackend for MemoryRateLimiter {
    fn scope(&self) -> &str {
        &self.scope
    }

    async fn check(&self, key: &str) -> RateDecision {
        match self.limiter.check_key(&key.to_string()) {
            Ok(_) => RateDecision::Allowed,
            Err(not_until) => RateDecision::Limited {
                retry_after: not_until.wait_time_from(self.clock.now()),
            },
        }
    }
}

fn sweep_idle(limiter: &KeyedLimiter) {
    limiter.retain_recent();
    limiter.shrink_to_fit();
}

fn spawn_sweep(
    scope: String,
    limiter: Arc<KeyedLimiter>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(scope = %scope, "Rate limiter sweep stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let before = limiter.len();
                    sweep_idle(&limiter);
                    tracing::debug!(
                        scope = %scope,
                        evicted = before.saturating_sub(limiter.len()),
                        "Rate limiter sweep completed"
                    );
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(burst: u32) -> MemoryRateLimiter {
        MemoryRateLimiter::new(
            "test",
            RateLimitPolicy::new(burst, 3600, burst),
            Duration::from_secs(3600),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_burst_then_reject() {
        let limiter = limiter(3);

        assert!(limiter.allow("10.0.0.1").await);
        assert!(limiter.allow("10.0.0.1").await);
        assert!(limiter.allow("10.0.0.1").await);

        let decision = limiter.check("10.0.0.1").await;
        assert!(!decision.is_allowed());
        assert!(decision.retry_after_secs().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter(1);

        assert!(limiter.allow("10.0.0.1").await);
        assert!(!limiter.allow("10.0.0.1").await);
        assert!(limiter.allow("10.0.0.2").await);
    }

    #[tokio::test]
    async fn test_sweep_keeps_recent_keys() {
        let limiter = limiter(2);
        assert!(limiter.allow("10.0.0.1").await);
        assert_eq!(limiter.tracked_keys(), 1);

        // The bucket is still partially spent, so the sweep must keep it.
        limiter.sweep();
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_sweep_drops_refilled_key_before_cleanup_interval() {
        // One token every 10ms, but the sweep interval is an hour.
        let limiter = MemoryRateLimiter::new(
            "test",
            RateLimitPolicy::new(100, 1, 1),
            Duration::from_secs(3600),
        )
        .unwrap();
        assert!(limiter.allow("10.0.0.1").await);
        assert_eq!(limiter.tracked_keys(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.sweep();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_zero_burst_is_clamped() {
        let limiter = MemoryRateLimiter::new(
            "test",
            RateLimitPolicy::new(5, 60, 0),
            Duration::from_secs(60),
        )
        .unwrap();
        assert!(limiter.allow("k").await);
    }
}
