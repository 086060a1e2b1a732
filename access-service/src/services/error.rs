use service_core::error::AppError;
use thiserror::Error;

/// Outcome classes surfaced by the authorization and session core.
///
/// Raw store errors never cross this boundary: they are folded into
/// `Unavailable` (or `Conflict` for uniqueness violations) where they occur.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Store unavailable: {0}")]
    Unavailable(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn unavailable(context: &str, err: impl std::fmt::Display) -> Self {
        ServiceError::Unavailable(anyhow::anyhow!("{}: {}", context, err))
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return ServiceError::Conflict(db_err.message().to_string());
            }
            if db_err.is_foreign_key_violation() {
                return ServiceError::Conflict(db_err.message().to_string());
            }
        }
        if let sqlx::Error::RowNotFound = err {
            return ServiceError::NotFound("Record".to_string());
        }
        ServiceError::Unavailable(anyhow::Error::new(err))
    }
}

impl From<redis::RedisError> for ServiceError {
    fn from(err: redis::RedisError) -> Self {
        ServiceError::Unavailable(anyhow::Error::new(err))
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(what) => {
                AppError::NotFound(anyhow::anyhow!("{} not found", what))
            }
            ServiceError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            ServiceError::Unauthorized(msg) => AppError::Unauthorized(anyhow::anyhow!(msg)),
            ServiceError::Forbidden(msg) => AppError::Forbidden(anyhow::anyhow!(msg)),
            ServiceError::InvalidInput(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ServiceError::Unavailable(e) => AppError::ServiceUnavailable(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::http::StatusCode;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ServiceError::NotFound("Role".into()), StatusCode::NOT_FOUND),
            (ServiceError::Conflict("dup".into()), StatusCode::CONFLICT),
            (ServiceError::Unauthorized("no".into()), StatusCode::UNAUTHORIZED),
            (ServiceError::Forbidden("no".into()), StatusCode::FORBIDDEN),
            (ServiceError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (
                ServiceError::Unavailable(anyhow::anyhow!("down")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ServiceError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_pool_errors_become_unavailable() {
        let err: ServiceError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, ServiceError::Unavailable(_)));
    }
}
