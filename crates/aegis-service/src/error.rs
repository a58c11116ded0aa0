//! The stable error envelope.
//!
//! Every failure leaves the service as
//! `{ "error": true, "reason_code", "reason", "details" }` with a status
//! mapped from the reason code. UIs key their localized messages off
//! `reason_code` and must not parse `reason`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use aegis_kernel::KernelError;
use aegis_types::ReasonCode;

/// A caller-visible service failure.
#[derive(Debug)]
pub struct ApiError {
    /// Machine-readable reason.
    pub reason_code: ReasonCode,
    /// Human-readable reason.
    pub reason: String,
    /// Structured extras (field names, ids).
    pub details: Value,
}

impl ApiError {
    /// A contract-validation failure.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            reason_code: ReasonCode::MalformedRequest,
            reason: reason.into(),
            details: Value::Null,
        }
    }

    /// The request's schema version is outside the accepted window.
    pub fn unsupported_schema_version(got: &str) -> Self {
        Self {
            reason_code: ReasonCode::UnsupportedSchemaVersion,
            reason: format!("schema_version {got} is not accepted"),
            details: json!({ "accepted": crate::api::ACCEPTED_SCHEMA_VERSIONS }),
        }
    }

    /// A missing entity.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self {
            reason_code: ReasonCode::NotFound,
            reason: what.into(),
            details: Value::Null,
        }
    }

    fn status(&self) -> StatusCode {
        match self.reason_code {
            ReasonCode::NotFound => StatusCode::NOT_FOUND,
            ReasonCode::MalformedRequest | ReasonCode::UnsupportedSchemaVersion => {
                StatusCode::BAD_REQUEST
            }
            ReasonCode::EvidenceRequired => StatusCode::UNPROCESSABLE_ENTITY,
            ReasonCode::LeaseLost
            | ReasonCode::InvalidState
            | ReasonCode::AlreadyDecided => StatusCode::CONFLICT,
            ReasonCode::SecretDetected => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        Self {
            reason_code: err.reason_code(),
            reason: err.to_string(),
            details: Value::Null,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            reason_code: ReasonCode::Internal,
            reason: err.to_string(),
            details: Value::Null,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": true,
            "reason_code": self.reason_code,
            "reason": self.reason,
            "details": self.details,
        });
        (self.status(), Json(body)).into_response()
    }
}
