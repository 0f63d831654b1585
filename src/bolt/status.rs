//! Status codes attached to failures.
//!
//! Codes follow the `Neo.{Classification}.{Category}.{Title}` convention.
//! The classification prefix decides how a failure is treated: client errors
//! are the caller's fault and never retried, transient errors may succeed on
//! retry, database errors are server-side faults.

/// Status code constants emitted by this crate.
pub struct StatusCode;

impl StatusCode {
    // Client errors (recoverable)
    pub const REQUEST_INVALID: &'static str = "Neo.ClientError.Request.Invalid";
    pub const AUTHENTICATION_FAILED: &'static str =
        "Neo.ClientError.Security.AuthenticationFailed";
    pub const UNAUTHORIZED: &'static str = "Neo.ClientError.Security.Unauthorized";
    pub const AUTHORIZATION_EXPIRED: &'static str =
        "Neo.ClientError.Security.AuthorizationExpired";
    pub const CREDENTIALS_EXPIRED: &'static str =
        "Neo.ClientError.Security.CredentialsExpired";
    pub const SEMANTIC_ERROR: &'static str = "Neo.ClientError.Statement.SemanticError";
    pub const TRANSACTION_NOT_FOUND: &'static str =
        "Neo.ClientError.Transaction.TransactionNotFound";
    pub const INVALID_BOOKMARK: &'static str = "Neo.ClientError.Transaction.InvalidBookmark";
    pub const DATABASE_NOT_FOUND: &'static str = "Neo.ClientError.Database.DatabaseNotFound";

    // Database errors
    pub const GENERAL_ERROR: &'static str = "Neo.DatabaseError.General.UnknownError";
    pub const EXECUTION_FAILED: &'static str = "Neo.DatabaseError.Statement.ExecutionFailed";

    // Transient errors (retry may succeed)
    pub const TRANSACTION_TERMINATED: &'static str =
        "Neo.TransientError.Transaction.Terminated";
    pub const TRANSACTION_INTERRUPTED: &'static str =
        "Neo.TransientError.Transaction.Interrupted";
    pub const TRANSACTION_TIMEOUT: &'static str =
        "Neo.TransientError.Transaction.TransactionTimedOut";
    pub const DATABASE_UNAVAILABLE: &'static str =
        "Neo.TransientError.General.DatabaseUnavailable";
}

/// Error classification, derived from a status code's prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The caller's fault; reported and never retried.
    ClientError,
    /// May succeed on retry.
    TransientError,
    /// Server-side fault.
    DatabaseError,
    /// Unrecognized prefix.
    Unknown,
}

impl Classification {
    /// Classify a status code by its prefix.
    pub fn of(code: &str) -> Self {
        if code.starts_with("Neo.ClientError") {
            Classification::ClientError
        } else if code.starts_with("Neo.TransientError") {
            Classification::TransientError
        } else if code.starts_with("Neo.DatabaseError") {
            Classification::DatabaseError
        } else {
            Classification::Unknown
        }
    }

    /// Whether a transaction terminated for this class of reason must be
    /// rolled back rather than left open for the client to inspect.
    pub fn mandates_rollback(self) -> bool {
        matches!(
            self,
            Classification::TransientError | Classification::DatabaseError
        )
    }
}

/// Whether the code denotes a security failure (authentication or
/// authorization).
pub fn is_security(code: &str) -> bool {
    code.contains(".Security.")
}

/// Whether the code denotes expired authorization, which must tear the
/// connection down rather than surface as an ordinary failure.
pub fn is_authorization_expired(code: &str) -> bool {
    code == StatusCode::AUTHORIZATION_EXPIRED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            Classification::of(StatusCode::REQUEST_INVALID),
            Classification::ClientError
        );
        assert_eq!(
            Classification::of(StatusCode::TRANSACTION_TERMINATED),
            Classification::TransientError
        );
        assert_eq!(
            Classification::of(StatusCode::GENERAL_ERROR),
            Classification::DatabaseError
        );
        assert_eq!(Classification::of("Whatever.Else"), Classification::Unknown);
    }

    #[test]
    fn test_mandates_rollback() {
        assert!(Classification::of(StatusCode::TRANSACTION_TERMINATED).mandates_rollback());
        assert!(Classification::of(StatusCode::EXECUTION_FAILED).mandates_rollback());
        assert!(!Classification::of(StatusCode::REQUEST_INVALID).mandates_rollback());
    }

    #[test]
    fn test_security_predicates() {
        assert!(is_security(StatusCode::UNAUTHORIZED));
        assert!(is_security(StatusCode::AUTHORIZATION_EXPIRED));
        assert!(!is_security(StatusCode::REQUEST_INVALID));

        assert!(is_authorization_expired(StatusCode::AUTHORIZATION_EXPIRED));
        assert!(!is_authorization_expired(StatusCode::UNAUTHORIZED));
    }
}
