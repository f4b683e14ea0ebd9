use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::fmt;

use crate::models::{AuditStatus, Provider};

/// Outcome taxonomy of a conversion delivery.
///
/// Every variant is returned to the caller as a structured value inside
/// [`crate::models::DeliveryResult`]; nothing here is used for control flow
/// across the library boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DeliveryError {
    /// Missing credentials, no identity signal, unknown entity or provider.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A PII field could not be normalized into something a provider can match.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// The provider's breaker is open; no network I/O was attempted.
    #[error("circuit open for provider {0}")]
    CircuitOpen(Provider),

    /// Timeout, network failure or 5xx after all attempts were used.
    #[error("transport failed after {attempts} attempt(s): {message}")]
    Transport {
        message: String,
        status: Option<u16>,
        attempts: u32,
    },

    /// The request reached the provider and was judged invalid.
    #[error("provider rejected event: {0}")]
    ProviderRejected(String),

    /// Another caller already claimed or completed this (entity, level).
    #[error("conversion already claimed")]
    AlreadyClaimed,

    /// Claim store, audit store or credential store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl DeliveryError {
    /// Validation failures are reported synchronously and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DeliveryError::Validation(_) | DeliveryError::InvalidIdentity(_)
        )
    }

    /// Status written to the audit log for an attempt that ended with this error.
    pub fn audit_status(&self) -> AuditStatus {
        match self {
            DeliveryError::Validation(_)
            | DeliveryError::InvalidIdentity(_)
            | DeliveryError::CircuitOpen(_)
            | DeliveryError::AlreadyClaimed => AuditStatus::Skipped,
            DeliveryError::Transport { .. }
            | DeliveryError::ProviderRejected(_)
            | DeliveryError::Storage(_) => AuditStatus::Error,
        }
    }
}

impl From<sqlx::Error> for DeliveryError {
    fn from(err: sqlx::Error) -> Self {
        DeliveryError::Storage(err.to_string())
    }
}

/// Errors returned by HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Invalid path, query or body.
    BadRequest(String),
    /// A provider call failed or was refused.
    ExternalApiError(String),
    /// Claim or audit storage failed.
    InternalError(String),
    /// Missing or wrong `X-Api-Key`.
    Unauthorized(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ExternalApiError(msg) => write!(f, "External API error: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Maps each error variant to an HTTP status code and JSON body.
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::ExternalApiError(msg) => {
                tracing::error!("External API error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "External service error".to_string(),
                )
            }
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Unauthorized(msg) => {
                tracing::warn!("Unauthorized access: {}", msg);
                (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return source.into_response();
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Validation(msg) | DeliveryError::InvalidIdentity(msg) => {
                AppError::BadRequest(msg)
            }
            DeliveryError::Storage(msg) => AppError::InternalError(msg),
            other => AppError::ExternalApiError(other.to_string()),
        }
    }
}

/// Adds a context message to a failed result, like `anyhow::Context` for [`AppError`].
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<AppError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e.into()),
            context: context.into(),
        })
    }
}
