//! Backend Connection error taxonomy (§4.1), kept as a dedicated
//! `thiserror` enum so callers can match on kind without string-matching,
//! mirroring the teacher's own `BackendError` split.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend '{name}' failed to start: {reason}")]
    StartupError { name: String, reason: String },

    #[error("request to backend '{name}' timed out after {deadline_secs}s")]
    Timeout { name: String, deadline_secs: u64 },

    #[error("backend '{name}' sent a malformed or unexpected message: {reason}")]
    ProtocolError { name: String, reason: String },

    #[error("backend '{name}' returned a JSON-RPC error: {message}")]
    PeerError { name: String, code: i64, message: String },

    #[error("backend '{name}' response exceeded the size cap: {reason}")]
    ResponseTooLarge { name: String, reason: String },

    #[error("backend '{name}' has reached its pending-request cap")]
    Overloaded { name: String },

    #[error("request to backend '{name}' was canceled")]
    Canceled { name: String },

    #[error("backend '{name}' not found")]
    NotFound { name: String },

    #[error("backend '{name}' is not available in its current state")]
    Unavailable { name: String },

    #[error("capacity exceeded for backend '{name}'")]
    CapacityExceeded { name: String, scope: CapacityScope },

    /// §4.3: a per-user backend requires injected credentials but the
    /// vault has no entry on file for this `(user, mcp_id)` pair.
    #[error("no credentials on file for backend '{name}'")]
    CredentialsMissing { name: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Which cap a `CapacityExceeded` hit (§7: "429 or 503 depending on scope").
/// `PerUser` means the caller can succeed elsewhere or later (their own quota
/// is full); `Global` means the whole instance has no room left regardless
/// of caller, which the HTTP boundary surfaces as a 503 rather than a 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityScope {
    PerUser,
    Global,
}

/// Request correlation table cap (§4.1, §5).
pub const MAX_PENDING: usize = 100;
