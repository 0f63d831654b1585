//! Error types of the session runtime.
//!
//! The taxonomy is deliberate:
//!
//! - [`TransactionError`] flows through statement and transaction operations.
//!   Its `Client` variant is recoverable (reported as FAILURE, connection
//!   stays open); `NotFound` is an expected race, not a failure; everything
//!   else escalates.
//! - [`ServerError`] is the reportable failure recorded on connection state
//!   and handed to the response handler.
//! - [`Fatality`] is returned from `process` and friends when the transport
//!   must tear the connection down. An auth fatality is distinguished so
//!   callers can apply a different retry and reporting policy.

use std::fmt;

use thiserror::Error;

use crate::bolt::status::{self, Classification, StatusCode};

/// An error that occurred while executing statement or transaction
/// operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// A recoverable, caller-visible error. Reported as FAILURE; the
    /// connection stays open pending RESET.
    #[error("{message}")]
    Client {
        /// Status code
        code: String,
        /// Error message
        message: String,
    },

    /// The caller's authorization has expired; the connection must close.
    #[error("authorization expired: {0}")]
    AuthorizationExpired(String),

    /// The referenced transaction no longer exists. An expected race with
    /// reset and termination, swallowed where the design tolerates it.
    #[error("transaction not found: {0}")]
    NotFound(String),

    /// An unrecoverable failure; the connection must close.
    #[error("{message}")]
    Fatal {
        /// Status code
        code: String,
        /// Error message
        message: String,
    },

    /// Aggregated resource-cleanup failure: the first error is primary, the
    /// rest are suppressed rather than dropped.
    #[error("{primary}")]
    Cleanup {
        /// First failure encountered
        primary: Box<TransactionError>,
        /// Subsequent failures
        suppressed: Vec<TransactionError>,
    },
}

impl TransactionError {
    /// A recoverable client error.
    pub fn client(code: &str, message: impl Into<String>) -> Self {
        Self::Client {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// An unrecoverable error.
    pub fn fatal(code: &str, message: impl Into<String>) -> Self {
        Self::Fatal {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Status code of this error.
    pub fn code(&self) -> &str {
        match self {
            TransactionError::Client { code, .. } | TransactionError::Fatal { code, .. } => code,
            TransactionError::AuthorizationExpired(_) => StatusCode::AUTHORIZATION_EXPIRED,
            TransactionError::NotFound(_) => StatusCode::TRANSACTION_NOT_FOUND,
            TransactionError::Cleanup { primary, .. } => primary.code(),
        }
    }

    /// Whether this error is connection-fatal by type.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransactionError::Fatal { .. } | TransactionError::AuthorizationExpired(_) => true,
            TransactionError::Cleanup { primary, .. } => primary.is_fatal(),
            _ => false,
        }
    }
}

/// Authentication failure returned by the authentication capability.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct AuthenticationError {
    /// Status code
    pub code: String,
    /// Error message
    pub message: String,
}

impl AuthenticationError {
    /// Create an authentication error.
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Invalid credentials.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

/// A failure recorded on connection state and reported to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Status code
    code: String,
    /// Error message
    message: String,
    /// Whether the connection must close after reporting
    fatal: bool,
}

impl ServerError {
    /// A recoverable error.
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            fatal: false,
        }
    }

    /// A connection-fatal error.
    pub fn fatal(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            fatal: true,
        }
    }

    /// Build from a transaction error, optionally promoting it to fatal.
    /// Errors that are connection-fatal by type stay fatal regardless.
    pub fn from_transaction_error(err: &TransactionError, fatal: bool) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            fatal: fatal || err.is_fatal(),
        }
    }

    /// Status code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the connection must close after reporting this error.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Classification derived from the status code.
    pub fn classification(&self) -> Classification {
        Classification::of(&self.code)
    }

    /// Whether the root cause is a security failure.
    pub fn is_security(&self) -> bool {
        status::is_security(&self.code)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A condition that requires the transport to close the connection.
#[derive(Debug, Error)]
pub enum Fatality {
    /// A message was sent out of sequence; the connection is compromised.
    #[error("protocol breach: {0}")]
    Breach(String),

    /// Authentication failed or authorization expired. Distinguished so the
    /// caller does not silently reconnect.
    #[error("authentication fatality: {0}")]
    Auth(String),

    /// Any other connection-fatal failure.
    #[error("connection fatality: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_error_codes() {
        let err = TransactionError::client(StatusCode::REQUEST_INVALID, "bad request");
        assert_eq!(err.code(), StatusCode::REQUEST_INVALID);
        assert!(!err.is_fatal());

        let err = TransactionError::fatal(StatusCode::GENERAL_ERROR, "boom");
        assert!(err.is_fatal());

        let err = TransactionError::AuthorizationExpired("token expired".into());
        assert_eq!(err.code(), StatusCode::AUTHORIZATION_EXPIRED);
        assert!(err.is_fatal());

        let err = TransactionError::NotFound("tx 7".into());
        assert_eq!(err.code(), StatusCode::TRANSACTION_NOT_FOUND);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_cleanup_error_delegates_to_primary() {
        let err = TransactionError::Cleanup {
            primary: Box::new(TransactionError::fatal(StatusCode::GENERAL_ERROR, "first")),
            suppressed: vec![TransactionError::client(
                StatusCode::REQUEST_INVALID,
                "second",
            )],
        };
        assert_eq!(err.code(), StatusCode::GENERAL_ERROR);
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "first");
    }

    #[test]
    fn test_server_error_from_transaction_error() {
        let cause = TransactionError::client(StatusCode::REQUEST_INVALID, "nope");
        let err = ServerError::from_transaction_error(&cause, false);
        assert!(!err.is_fatal());
        assert_eq!(err.code(), StatusCode::REQUEST_INVALID);

        // caller intent promotes to fatal
        let err = ServerError::from_transaction_error(&cause, true);
        assert!(err.is_fatal());

        // fatal-by-type stays fatal even without caller intent
        let cause = TransactionError::AuthorizationExpired("expired".into());
        let err = ServerError::from_transaction_error(&cause, false);
        assert!(err.is_fatal());
        assert!(err.is_security());
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::new(StatusCode::REQUEST_INVALID, "bad");
        assert_eq!(err.to_string(), "Neo.ClientError.Request.Invalid: bad");
        assert_eq!(err.classification(), Classification::ClientError);
    }

    #[test]
    fn test_fatality_display() {
        assert!(Fatality::Breach("x".into()).to_string().contains("breach"));
        assert!(Fatality::Auth("x".into()).to_string().contains("authentication"));
    }
}
