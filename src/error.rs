//! Error types for the consent gateway

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for the consent gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Consent gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network failure or 5xx from an upstream server
    #[error("Upstream unavailable: {0}")]
    Transient(String),

    /// Upstream call or evaluation attempt exceeded its time budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Structural violation of the OAuth2 / OIDC exchange
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The authorization server refused the request (4xx)
    #[error("Rejected by upstream: HTTP {status} - {body}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Response body, as returned
        body: String,
    },

    /// Exchange cannot start from the current consent state
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Concurrent update detected by the consent store
    #[error("Update conflict: {0}")]
    Conflict(String),

    /// Unknown consent, brand or registration
    #[error("Not found: {0}")]
    NotFound(String),

    /// JWT encode/decode error
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Failure of an in-flight evaluation observed by a coalesced caller
    #[error("{0}")]
    Shared(Arc<Error>),

    /// A dependency failed after its own healing attempts
    #[error("Dependency {node} failed: {cause}")]
    Dependency {
        /// Name of the failed dependency node
        node: String,
        /// Final error of the dependency
        cause: Arc<Error>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by callers and the healing resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry may succeed
    Transient,
    /// Retrying will not fix the response
    Protocol,
    /// Rejected before any network call
    Precondition,
    /// Lost a race with a concurrent update; safe to re-resolve
    Conflict,
    /// Anything else (configuration, internal)
    Fatal,
}

impl Error {
    /// Map a transport-level `reqwest` failure to the retryable variants
    #[must_use]
    pub fn from_transport(context: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(format!("{context}: {err}"))
        } else {
            Self::Transient(format!("{context}: {err}"))
        }
    }

    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) | Self::Timeout(_) | Self::Io(_) => ErrorKind::Transient,
            Self::Http(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                ErrorKind::Transient
            }
            Self::Protocol(_) | Self::Rejected { .. } | Self::Jwt(_) | Self::Json(_) => {
                ErrorKind::Protocol
            }
            Self::Precondition(_) | Self::NotFound(_) => ErrorKind::Precondition,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Shared(inner) | Self::Dependency { cause: inner, .. } => inner.kind(),
            Self::Config(_) | Self::Http(_) | Self::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the healing resolver may run another attempt
    ///
    /// Dependency failures are final: the dependency already healed on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Dependency { .. } => false,
            Self::Shared(inner) => inner.is_retryable(),
            _ => matches!(self.kind(), ErrorKind::Transient | ErrorKind::Conflict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_conflict_are_retryable() {
        assert!(Error::Transient("503".into()).is_retryable());
        assert!(Error::Timeout("token endpoint".into()).is_retryable());
        assert!(Error::Conflict("version 3".into()).is_retryable());
    }

    #[test]
    fn protocol_and_precondition_are_fatal() {
        assert!(!Error::Protocol("missing id_token".into()).is_retryable());
        assert!(!Error::Precondition("no refresh token".into()).is_retryable());
        assert!(
            !Error::Rejected {
                status: 400,
                body: "invalid_grant".into()
            }
            .is_retryable()
        );
        assert!(!Error::Config("bad".into()).is_retryable());
    }

    #[test]
    fn shared_error_keeps_inner_kind() {
        let shared = Error::Shared(Arc::new(Error::Timeout("slow".into())));
        assert_eq!(shared.kind(), ErrorKind::Transient);
        assert!(shared.is_retryable());

        let shared = Error::Shared(Arc::new(Error::Protocol("bad".into())));
        assert_eq!(shared.kind(), ErrorKind::Protocol);
        assert_eq!(shared.to_string(), "Protocol violation: bad");
    }

    #[test]
    fn dependency_failure_is_final_but_keeps_kind() {
        let err = Error::Dependency {
            node: "holder-metadata".into(),
            cause: Arc::new(Error::Transient("503".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(!err.is_retryable());
        assert!(!Error::Shared(Arc::new(err)).is_retryable());
    }
}
