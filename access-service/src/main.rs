use access_service::{
    build_router,
    config::AccessConfig,
    db,
    handlers::auth::CookieSettings,
    services::{build_permission_cache, Database, JwtService, RedisService},
    AppState, CoreParts, HttpSettings, RateLimiters, ServiceInfo,
};
use service_core::error::AppError;
use service_core::middleware::security_headers::SecurityHeaders;
use service_core::observability::{init_tracing, install_prometheus_recorder};
use service_core::rate_limit::{build_rate_limiter, RateLimiterOptions};
use std::{net::SocketAddr, sync::Arc};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = AccessConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;
    let metrics = install_prometheus_recorder()?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting access service"
    );

    let pool = db::create_pool(&config.database, config.store_timeout)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
    db::run_migrations(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
    let database = Arc::new(Database::new(pool));

    let redis = if config.needs_redis() {
        Some(RedisService::new(&config.redis).await?)
    } else {
        None
    };

    let cache = build_permission_cache(
        config.permission_cache.storage,
        config.permission_cache.ttl,
        config.store_timeout,
        redis.as_ref().map(RedisService::manager),
    )?;

    let limiter_options = RateLimiterOptions {
        storage: config.rate_limit.storage,
        cleanup_ttl: config.rate_limit.cleanup_ttl,
        store_timeout: config.store_timeout,
        redis: redis.as_ref().map(RedisService::manager),
    };
    let limiters = RateLimiters {
        api: build_rate_limiter("api", config.rate_limit.api, &limiter_options)?,
        auth: build_rate_limiter("auth", config.rate_limit.auth, &limiter_options)?,
        trusted_proxy_hops: config.rate_limit.trusted_proxy_hops,
    };
    tracing::info!(
        storage = ?config.rate_limit.storage,
        api = ?config.rate_limit.api,
        auth = ?config.rate_limit.auth,
        trusted_proxy_hops = config.rate_limit.trusted_proxy_hops,
        "Rate limiters initialized"
    );

    let core = CoreParts {
        directory: database.clone(),
        sessions: database,
        cache,
        jwt: JwtService::new(&config.jwt),
        store_timeout: config.store_timeout,
    };
    let http = HttpSettings {
        cookies: CookieSettings {
            path: config.security.cookie_path.clone(),
            secure: config.is_prod(),
            max_age_days: config.jwt.refresh_token_expiry_days,
        },
        security: SecurityHeaders {
            strict_transport: config.is_prod(),
        },
        allowed_origins: config.security.allowed_origins.clone(),
        request_timeout: config.request_timeout,
    };
    let service = ServiceInfo {
        name: config.service_name.clone(),
        version: config.service_version.clone(),
    };

    let mut state = AppState::new(service, core, limiters, http).with_metrics(metrics);
    if let Some(redis) = redis {
        state = state.with_redis(redis);
    }
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
