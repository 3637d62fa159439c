use service_core::error::AppError;
use thiserror::Error;

use crate::models::InvalidTransition;

#[derive(Error, Debug)]
pub enum ActivationError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("Too many activation attempts. Please try again later.")]
    RateLimited { retry_after_secs: u64 },

    #[error("Internal error: {0}")]
    Infra(#[from] anyhow::Error),
}

impl ActivationError {
    pub fn not_found(what: &str) -> Self {
        ActivationError::NotFound(format!("{what} not found"))
    }
}

impl From<InvalidTransition> for ActivationError {
    fn from(err: InvalidTransition) -> Self {
        ActivationError::InvalidState(format!("Cannot {} code: status is {}", err.transition.as_str(), err.from))
    }
}

impl From<ActivationError> for AppError {
    fn from(err: ActivationError) -> Self {
        match err {
            ActivationError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            ActivationError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            ActivationError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ActivationError::InvalidState(msg) => AppError::InvalidState(anyhow::anyhow!(msg)),
            e @ ActivationError::RateLimited { retry_after_secs } => {
                AppError::TooManyRequests(e.to_string(), Some(retry_after_secs.max(1)))
            }
            ActivationError::Infra(e) => AppError::InternalError(e),
        }
    }
}

pub type ActivationResult<T> = Result<T, ActivationError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, response::IntoResponse};

    fn status_of(err: ActivationError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_taxonomy_maps_to_http_status() {
        assert_eq!(status_of(ActivationError::not_found("Code")), StatusCode::NOT_FOUND);
        assert_eq!(status_of(ActivationError::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(status_of(ActivationError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(ActivationError::InvalidState("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(ActivationError::RateLimited { retry_after_secs: 30 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(ActivationError::Infra(anyhow::anyhow!("pool timed out"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let response = AppError::from(ActivationError::RateLimited { retry_after_secs: 0 }).into_response();
        assert_eq!(response.headers().get(axum::http::header::RETRY_AFTER).unwrap(), "1");
    }
}
