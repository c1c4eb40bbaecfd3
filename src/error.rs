//! Error types for the session layer

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Main error type for session handling.
///
/// Errors are `Clone` because a single commit outcome is handed to every
/// caller that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session configuration error: {0}")]
    Configuration(String),

    #[error("Invalid key id: {0}")]
    InvalidKeyId(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Malformed session document: {0}")]
    Document(String),

    #[error("Possible replay attack: cookie {key_id} expired")]
    ReplayDetected { key_id: String },

    #[error("Session commit failed: {0}")]
    Commit(String),
}

impl SessionError {
    /// Whether the error only invalidates one candidate cookie.
    pub fn is_candidate_error(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidKeyId(_)
                | SessionError::KeyDerivation(_)
                | SessionError::Decryption(_)
                | SessionError::Document(_)
                | SessionError::ReplayDetected { .. }
        )
    }

    /// Wrap a failure raised while computing the outgoing cookie.
    pub fn into_commit(self) -> Self {
        match self {
            SessionError::Commit(_) => self,
            other => SessionError::Commit(other.to_string()),
        }
    }
}

/// Body sent in place of the handler's response when the session cookie
/// could not be computed.
pub fn commit_failure_body(err: &SessionError) -> String {
    format!("failed to update session cookie(s):\n{}", err)
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            commit_failure_body(&self),
        )
            .into_response()
    }
}
