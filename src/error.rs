//! Error taxonomy (§7) realized as one enum implementing axum's
//! `IntoResponse`, with `From` impls from each component's leaf
//! `thiserror` type. Component modules keep their own narrow error enum
//! (see `backend::error::BackendError`, `session::SessionError`, etc.);
//! this type exists only at the HTTP boundary.

use crate::backend::CapacityScope;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("tool not allowed: {0}")]
    ToolNotAllowed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {message}")]
    Conflict { code: &'static str, message: String },
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    /// §7: "per-user or global instance cap; 429 or 503 depending on
    /// scope" — a per-user cap leaves the caller able to succeed elsewhere
    /// (429, retryable by the same logic as rate limiting); a global cap
    /// means the whole instance has no room (503, the caller can't do
    /// anything about it).
    #[error("capacity exceeded: {message}")]
    CapacityExceeded { message: String, scope: CapacityScope },
    #[error("timeout")]
    Timeout,
    #[error("canceled")]
    Canceled,
    #[error("peer error: {0}")]
    PeerError(String),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::ToolNotAllowed(_) => "tool_not_allowed",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict { code, .. } => code,
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::CapacityExceeded { .. } => "capacity_exceeded",
            ApiError::Timeout => "timeout",
            ApiError::Canceled => "canceled",
            ApiError::PeerError(_) => "peer_error",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) | ApiError::ToolNotAllowed(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::CapacityExceeded { scope, .. } => match scope {
                CapacityScope::PerUser => StatusCode::TOO_MANY_REQUESTS,
                CapacityScope::Global => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::Timeout | ApiError::Canceled => StatusCode::GATEWAY_TIMEOUT,
            ApiError::PeerError(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// User-facing message. Never reveals internal identifiers (e.g. a
    /// profile_id in a mismatch error) — callers that need redaction build
    /// the message that way before constructing the variant.
    fn message(&self) -> String {
        match self {
            ApiError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }

        let status = self.status();
        let body = ErrorBody {
            ok: false,
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.message(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<crate::backend::BackendError> for ApiError {
    fn from(err: crate::backend::BackendError) -> Self {
        use crate::backend::BackendError as B;
        match err {
            B::Timeout { .. } => ApiError::Timeout,
            B::Canceled { .. } => ApiError::Canceled,
            B::NotFound { name } => ApiError::NotFound(format!("backend '{name}'")),
            // Both are per-connection limits (one backend's pending-request
            // table, one backend's response size cap), not an instance-wide
            // resource cap, so both stay at the per-user/retryable scope.
            B::ResponseTooLarge { name, reason } => ApiError::CapacityExceeded {
                message: format!("backend '{name}': {reason}"),
                scope: CapacityScope::PerUser,
            },
            B::Overloaded { name } => ApiError::CapacityExceeded {
                message: format!("backend '{name}' has no free capacity"),
                scope: CapacityScope::PerUser,
            },
            B::Unavailable { name } => ApiError::PeerError(format!("backend '{name}' is unavailable")),
            B::CapacityExceeded { name, scope } => ApiError::CapacityExceeded {
                message: format!("backend '{name}' has no free instance slots"),
                scope,
            },
            // No entry in the vault for this (user, mcp_id) pair: grouped
            // with the spec's Unauthorized kind ("credentials missing/
            // invalid/expired; 401") rather than given its own status code.
            B::CredentialsMissing { .. } => ApiError::Unauthorized,
            B::PeerError { name, message, .. } => {
                ApiError::PeerError(format!("backend '{name}': {message}"))
            }
            B::ProtocolError { name, reason } => {
                ApiError::PeerError(format!("backend '{name}': {reason}"))
            }
            B::StartupError { .. } | B::Other(_) => ApiError::Internal(err.into()),
        }
    }
}

impl From<crate::session::SessionError> for ApiError {
    fn from(err: crate::session::SessionError) -> Self {
        use crate::session::SessionError as S;
        match err {
            S::RateLimited { retry_after_secs } => ApiError::RateLimited { retry_after_secs },
            S::InvalidKeyFormat | S::InvalidFormat | S::InvalidToken | S::Unauthorized => {
                ApiError::Unauthorized
            }
            S::SessionExpired => ApiError::Unauthorized,
            S::ProfileMismatch => ApiError::Conflict {
                code: "profile_mismatch",
                message: "session already registered under a different profile".to_string(),
            },
            S::Other(e) => ApiError::Internal(e),
        }
    }
}

impl From<crate::catalog::ReloadError> for ApiError {
    fn from(err: crate::catalog::ReloadError) -> Self {
        use crate::catalog::ReloadError as R;
        match err {
            R::Conflict => ApiError::Conflict {
                code: "reload_conflict",
                message: "a catalog reload is already in progress".to_string(),
            },
            R::Other(e) => ApiError::Internal(e),
        }
    }
}

impl From<crate::audit::AuditError> for ApiError {
    fn from(err: crate::audit::AuditError) -> Self {
        match err {
            crate::audit::AuditError::InvalidAuditDir => {
                ApiError::Internal(anyhow::anyhow!("invalid audit directory"))
            }
            crate::audit::AuditError::Other(e) => ApiError::Internal(e),
        }
    }
}
