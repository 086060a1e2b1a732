use secrecy::{ExposeSecret, SecretString};
use service_core::config::{self as core_config, get_env, get_env_parsed};
use service_core::error::AppError;
use service_core::rate_limit::{RateLimitPolicy, RateLimitStorage};
use std::{env, time::Duration};

use crate::services::PermissionCacheStorage;

/// Minimum HMAC secret length accepted at startup.
pub const MIN_JWT_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct AccessConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub permission_cache: PermissionCacheConfig,
    /// Upper bound on any single store round trip.
    pub store_timeout: Duration,
    /// Whole-request deadline.
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: SecretString,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    /// Path attribute of the refresh cookie.
    pub cookie_path: String,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub storage: RateLimitStorage,
    pub api: RateLimitPolicy,
    pub auth: RateLimitPolicy,
    /// Idle-key sweep interval for memory limiters, key expiry in the shared store.
    pub cleanup_ttl: Duration,
    /// Reverse proxies whose `x-forwarded-for` entries are believed. Zero keys
    /// callers by peer address only.
    pub trusted_proxy_hops: usize,
}

#[derive(Debug, Clone)]
pub struct PermissionCacheConfig {
    pub storage: PermissionCacheStorage,
    pub ttl: Duration,
}

impl AccessConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = AccessConfig {
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("access-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_env_parsed("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            jwt: JwtConfig {
                // No default, not even in dev.
                secret: SecretString::new(get_env("JWT_SECRET", None, true)?),
                access_token_expiry_minutes: get_env_parsed(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    Some("15"),
                    is_prod,
                )?,
                refresh_token_expiry_days: get_env_parsed(
                    "JWT_REFRESH_TOKEN_EXPIRY_DAYS",
                    Some("7"),
                    is_prod,
                )?,
            },
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                cookie_path: get_env("AUTH_COOKIE_PATH", Some("/auth"), is_prod)?,
            },
            rate_limit: RateLimitConfig {
                storage: get_env_parsed("RATE_LIMIT_STORAGE", Some("memory"), is_prod)?,
                api: policy_from_env("API", 1000, 60, is_prod)?,
                auth: policy_from_env("AUTH", 10, 60, is_prod)?,
                cleanup_ttl: Duration::from_secs(get_env_parsed(
                    "RATE_LIMIT_CLEANUP_TTL_SECONDS",
                    Some("3600"),
                    is_prod,
                )?),
                trusted_proxy_hops: get_env_parsed("TRUSTED_PROXY_HOPS", Some("0"), is_prod)?,
            },
            permission_cache: PermissionCacheConfig {
                storage: get_env_parsed("PERMISSION_CACHE_STORAGE", Some("memory"), is_prod)?,
                ttl: Duration::from_secs(get_env_parsed(
                    "PERMISSION_CACHE_TTL_SECONDS",
                    Some("900"),
                    is_prod,
                )?),
            },
            store_timeout: Duration::from_secs(get_env_parsed(
                "STORE_TIMEOUT_SECONDS",
                Some("5"),
                is_prod,
            )?),
            request_timeout: Duration::from_secs(get_env_parsed(
                "REQUEST_TIMEOUT_SECONDS",
                Some("30"),
                is_prod,
            )?),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn is_prod(&self) -> bool {
        self.environment == Environment::Prod
    }

    /// Whether any component keeps its state in Redis.
    pub fn needs_redis(&self) -> bool {
        self.rate_limit.storage == RateLimitStorage::SharedStore
            || self.permission_cache.storage == PermissionCacheStorage::SharedStore
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        self.jwt.validate()?;

        if self.store_timeout.is_zero() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "STORE_TIMEOUT_SECONDS must be positive"
            )));
        }

        if self.request_timeout < self.store_timeout {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REQUEST_TIMEOUT_SECONDS must not be below STORE_TIMEOUT_SECONDS"
            )));
        }

        if self.permission_cache.ttl.is_zero() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PERMISSION_CACHE_TTL_SECONDS must be positive"
            )));
        }

        if self.environment == Environment::Prod
            && self.security.allowed_origins.iter().any(|o| o == "*")
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Wildcard CORS origin not allowed in production"
            )));
        }

        Ok(())
    }
}

impl JwtConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.secret.expose_secret().len() < MIN_JWT_SECRET_BYTES {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_SECRET must be at least {} bytes",
                MIN_JWT_SECRET_BYTES
            )));
        }

        if self.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        Ok(())
    }
}

fn validate_timeouts(store_timeout: Duration, request_timeout: Duration) -> Result<(), AppError> {
    if store_timeout.is_zero() {
        return Err(AppError::ConfigError(anyhow::anyhow!(
            "STORE_TIMEOUT_SECONDS must be positive"
        )));
    }
    if request_timeout < store_timeout {
        return Err(AppError::ConfigError(anyhow::anyhow!(
            "REQUEST_TIMEOUT_SECONDS must not be shorter than STORE_TIMEOUT_SECONDS"
        )));
    }
    Ok(())
}

/// `RATE_LIMIT_<SCOPE>_{REQUESTS,WINDOW_SECONDS,BURST}`; burst defaults to requests.
fn policy_from_env(
    scope: &str,
    requests: u32,
    window_seconds: u64,
    is_prod: bool,
) -> Result<RateLimitPolicy, AppError> {
    let requests: u32 = get_env_parsed(
        &format!("RATE_LIMIT_{}_REQUESTS", scope),
        Some(&requests.to_string()),
        is_prod,
    )?;
    let window_seconds: u64 = get_env_parsed(
        &format!("RATE_LIMIT_{}_WINDOW_SECONDS", scope),
        Some(&window_seconds.to_string()),
        is_prod,
    )?;
    let burst: u32 = get_env_parsed(
        &format!("RATE_LIMIT_{}_BURST", scope),
        Some(&requests.to_string()),
        is_prod,
    )?;
    Ok(RateLimitPolicy::new(requests, window_seconds, burst))
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt(secret: &str) -> JwtConfig {
        JwtConfig {
            secret: SecretString::new(secret.to_string()),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        }
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(jwt("too-short").validate().is_err());
        assert!(jwt(&"k".repeat(MIN_JWT_SECRET_BYTES)).validate().is_ok());
    }

    #[test]
    fn test_non_positive_expiry_rejected() {
        let mut config = jwt(&"k".repeat(40));
        config.refresh_token_expiry_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_request_deadline_covers_store_timeout() {
        let five = Duration::from_secs(5);
        assert!(validate_timeouts(five, Duration::from_secs(30)).is_ok());
        assert!(validate_timeouts(five, five).is_ok());
        assert!(validate_timeouts(five, Duration::from_secs(2)).is_err());
        assert!(validate_timeouts(Duration::ZERO, five).is_err());
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!("PROD".parse::<Environment>(), Ok(Environment::Prod));
        assert!("staging".parse::<Environment>().is_err());
    }
}
