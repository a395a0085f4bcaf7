//! Gateway error taxonomy and HTTP mapping.
//!
//! Every error that crosses the HTTP boundary is one of these kinds; the
//! envelope is `{code, message, suggestion?}`. Upstream exchange errors
//! arrive as opaque strings and are classified by substring until the
//! exchange client grows structured error codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("risk reject: {0}")]
    RiskReject(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    AuthFailed(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Nonce(String),
    #[error("system in panic mode: all trading suspended")]
    SystemPanic,
    #[error("{0}")]
    Upstream(String),
    #[error("server is in read-only mode")]
    ReadOnly,
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RiskReject(_) => "RISK_REJECT",
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::AuthFailed(_) => "AUTH_FAILED",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::Nonce(_) => "NONCE_ERROR",
            GatewayError::SystemPanic => "SYSTEM_PANIC",
            GatewayError::Upstream(_) => "UPSTREAM_ERROR",
            GatewayError::ReadOnly => "READ_ONLY",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RiskReject(_) | GatewayError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Nonce(_) => StatusCode::CONFLICT,
            GatewayError::SystemPanic => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::ReadOnly => StatusCode::FORBIDDEN,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            GatewayError::RiskReject(_) => Some("Check order parameters against risk limits."),
            GatewayError::InvalidRequest(_) => Some("Fix the request payload."),
            GatewayError::Nonce(_) => Some("Retry the request."),
            GatewayError::AuthFailed(_) => Some("Check API keys and signatures."),
            GatewayError::SystemPanic => Some("Wait for system recovery."),
            GatewayError::Upstream(_) => Some("Retry later."),
            _ => None,
        }
    }

    /// Classify an opaque error string from the exchange or a service layer.
    /// Substring matching is a legacy behaviour of the upstream wire protocol;
    /// already-typed errors pass through untouched via `From`.
    pub fn classify(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let lower = msg.to_lowercase();
        if lower.contains("risk reject") {
            GatewayError::RiskReject(msg)
        } else if lower.contains("signature") || lower.contains("unauthorized") {
            GatewayError::AuthFailed(msg)
        } else if lower.contains("nonce") {
            GatewayError::Nonce(msg)
        } else if lower.contains("panic") {
            GatewayError::SystemPanic
        } else {
            GatewayError::Internal(msg)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<&'static str>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            suggestion: self.suggestion(),
        };
        (status, Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_substrings() {
        assert_eq!(
            GatewayError::classify("risk reject: too big").code(),
            "RISK_REJECT"
        );
        assert_eq!(
            GatewayError::classify("invalid signature").code(),
            "AUTH_FAILED"
        );
        assert_eq!(
            GatewayError::classify("order nonce too low").code(),
            "NONCE_ERROR"
        );
        assert_eq!(
            GatewayError::classify("system in panic mode").code(),
            "SYSTEM_PANIC"
        );
        assert_eq!(
            GatewayError::classify("something exploded").code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            GatewayError::RiskReject(String::new()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Nonce(String::new()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            GatewayError::SystemPanic.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(GatewayError::ReadOnly.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::Upstream(String::new()).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
