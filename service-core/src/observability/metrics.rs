use crate::error::AppError;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the process-wide Prometheus recorder used by the `metrics` macros.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, AppError> {
    PrometheusBuilder::new().install_recorder().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!(
            "Failed to install Prometheus recorder: {}",
            e
        ))
    })
}
