//! Object server error types.

use objectloader_core::LoaderError;
use thiserror::Error;

/// Errors talking to the object server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Missing or rejected token
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("object '{id}' not found on server")]
    NotFound { id: String },

    /// Server asked us to slow down
    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    /// Timeouts, connection failures and 5xx responses
    #[error("server unavailable: {0}")]
    Unavailable(String),

    /// Any other non-success status
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(String),
}

impl ServerError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Worth another attempt after a backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Unavailable(_))
    }
}

impl From<ServerError> for LoaderError {
    fn from(error: ServerError) -> Self {
        match error {
            ServerError::NotFound { id } => LoaderError::not_found(id),
            other => LoaderError::origin(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ServerError::Unavailable("503".into()).is_transient());
        assert!(ServerError::RateLimited { retry_after: None }.is_transient());
        assert!(!ServerError::Auth("bad token".into()).is_transient());
        assert!(!ServerError::not_found("abc").is_transient());
    }

    #[test]
    fn test_into_loader_error() {
        let err: LoaderError = ServerError::not_found("abc").into();
        assert!(matches!(err, LoaderError::NotFound { ref id } if id == "abc"));

        let err: LoaderError = ServerError::Auth("expired".into()).into();
        assert!(matches!(err, LoaderError::Origin(_)));
        assert!(err.to_string().contains("expired"));
    }
}
