use super::{RateDecision, RateLimitPolicy, RateLimiterBackend};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use std::{sync::Arc, time::Duration};

// Refill-then-spend on a bucket stored as two keys. Runs atomically in Redis and
// uses the server clock so replicas agree on elapsed time.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local tokens_key = KEYS[1]
local ts_key = KEYS[2]
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

local tokens = tonumber(redis.call('GET', tokens_key))
local last = tonumber(redis.call('GET', ts_key))
if tokens == nil then tokens = burst end
if last == nil then last = now end

local elapsed = math.max(0, now - last)
tokens = math.min(burst, tokens + elapsed * rate)

local allowed = 0
local retry_after = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
else
  retry_after = math.ceil((1 - tokens) / rate)
end

redis.call('SET', tokens_key, tostring(tokens), 'EX', ttl)
redis.call('SET', ts_key, tostring(now), 'EX', ttl)
return {allowed, retry_after}
"#;

/// Token bucket kept in Redis under `rate_limit:<scope>:<key>:{tokens,ts}`.
///
/// Both keys expire after the cleanup TTL, so idle callers are collected by
/// Redis itself. Any store error or timeout admits the request.
pub struct SharedRateLimiter {
    scope: String,
    policy: RateLimitPolicy,
    manager: ConnectionManager,
    script: Arc<Script>,
    key_ttl: Duration,
    timeout: Duration,
}

impl SharedRateLimiter {
    pub fn new(
        scope: &str,
        policy: RateLimitPolicy,
        manager: ConnectionManager,
        key_ttl: Duration,
        timeout: Duration,
    ) -> Self {
        tracing::info!(
            scope = scope,
            requests = policy.requests,
            window_seconds = policy.window_seconds,
            burst = policy.burst,
            "Shared-store rate limiter initialized"
        );

        Self {
            scope: scope.to_string(),
            policy,
            manager,
            script: Arc::new(Script::new(TOKEN_BUCKET_SCRIPT)),
            key_ttl,
            timeout,
        }
    }

    async fn invoke(&self, key: &str) -> Result<(i64, i64), anyhow::Error> {
        let (tokens_key, ts_key) = bucket_keys(&self.scope, key);
        let mut conn = self.manager.clone();

        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(tokens_key)
            .key(ts_key)
            .arg(self.policy.tokens_per_milli())
            .arg(self.policy.burst)
            .arg(self.key_ttl.as_secs().max(1));
        let call = invocation.invoke_async::<_, (i64, i64)>(&mut conn);

        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| anyhow::anyhow!("rate limit store timed out"))?
            .map_err(|e| anyhow::anyhow!("rate limit script failed: {}", e))
    }
}

pub(crate) fn bucket_keys(scope: &str, key: &str) -> (String, String) {
    let base = format!("rate_limit:{}:{}", scope, key);
    (format!("{}:tokens", base), format!("{}:ts", base))
}

#[async_trait]
impl RateLimiterBackend for SharedRateLimiter {
    fn scope(&self) -> &str {
        &self.scope
    }

    async fn check(&self, key: &str) -> RateDecision {
        decide(&self.scope, self.invoke(key).await)
    }
}

/// Map a script result to a decision. A failed call admits the request.
fn decide(scope: &str, result: Result<(i64, i64), anyhow::Error>) -> RateDecision {
    match result {
        Ok((1, _)) => RateDecision::Allowed,
        Ok((_, retry_after_ms)) => RateDecision::Limited {
            retry_after: Duration::from_millis(retry_after_ms.max(0) as u64),
        },
        Err(e) => {
            tracing::warn!(
                scope = %scope,
                error = %e,
                "Rate limit store unavailable, admitting request"
            );
            metrics::counter!("rate_limit_fail_open_total", "scope" => scope.to_string())
                .increment(1);
            RateDecision::Allowed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key_schema() {
        let (tokens, ts) = bucket_keys("auth", "203.0.113.7");
        assert_eq!(tokens, "rate_limit:auth:203.0.113.7:tokens");
        assert_eq!(ts, "rate_limit:auth:203.0.113.7:ts");
    }

    #[test]
    fn test_store_failure_admits_request() {
        let timed_out = decide("auth", Err(anyhow::anyhow!("rate limit store timed out")));
        assert_eq!(timed_out, RateDecision::Allowed);

        let refused = decide("api", Err(anyhow::anyhow!("connection refused")));
        assert!(refused.is_allowed());
    }

    #[test]
    fn test_script_result_decides() {
        assert_eq!(decide("auth", Ok((1, 0))), RateDecision::Allowed);
        assert_eq!(
            decide("auth", Ok((0, 1500))),
            RateDecision::Limited {
                retry_after: Duration::from_millis(1500)
            }
        );
        assert_eq!(
            decide("auth", Ok((0, -3))),
            RateDecision::Limited {
                retry_after: Duration::ZERO
            }
        );
    }
}
