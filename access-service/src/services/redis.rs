use redis::aio::ConnectionManager;
use redis::Client;

use super::error::ServiceError;

/// Shared Redis connection used by the shared-store rate limiter and the
/// shared-store permission cache.
#[derive(Clone)]
pub struct RedisService {
    manager: ConnectionManager,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self { manager })
    }

    /// A handle for components that issue their own commands.
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn health_check(&self) -> Result<(), ServiceError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
