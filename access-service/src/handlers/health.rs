use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::{json, Value};
use service_core::error::AppError;
use std::time::Duration;

use crate::{services::bounded, AppState};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn health_check(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    bounded(HEALTH_TIMEOUT, "directory", state.directory.health_check())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Directory health check failed");
            AppError::from(e)
        })?;

    let redis = match &state.redis {
        Some(redis) => {
            bounded(HEALTH_TIMEOUT, "redis", redis.health_check())
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Redis health check failed");
                    AppError::from(e)
                })?;
            "up"
        }
        None => "unused",
    };

    Ok(Json(json!({
        "status": "healthy",
        "service": state.service.name,
        "version": state.service.version,
        "checks": {
            "directory": "up",
            "redis": redis
        }
    })))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}
