//! Capability boundary of the session runtime.
//!
//! Everything the state machines need from the surrounding server arrives
//! through these traits: authentication, database resolution, transaction
//! and query execution, transaction tracking, response delivery, and the
//! transport handle. The runtime never reaches past them.

use std::collections::HashMap;
use std::time::Duration;

use crate::bolt::message::{AccessMode, AuthToken};
use crate::bolt::status::StatusCode;
use crate::bolt::value::Value;
use crate::runtime::bookmark::{Bookmark, BookmarkMetadata};
use crate::runtime::error::{AuthenticationError, ServerError, TransactionError};
use crate::runtime::transaction::TransactionStateMachine;

/// Identifier of a transaction tracked by the transaction manager.
pub type TransactionId = u64;

/// The authenticated subject of a connection.
#[derive(Debug, Clone, Default)]
pub struct LoginContext {
    /// Principal (username), if the scheme carries one
    pub principal: Option<String>,
    /// Authentication scheme that produced this context
    pub scheme: String,
}

impl LoginContext {
    /// Create a login context.
    pub fn new(principal: Option<String>, scheme: impl Into<String>) -> Self {
        Self {
            principal,
            scheme: scheme.into(),
        }
    }
}

/// Outcome of successful authentication.
#[derive(Debug, Clone)]
pub struct AuthenticationResult {
    /// The authenticated subject
    pub login: LoginContext,
    /// Whether the credentials are expired and must be rotated
    pub credentials_expired: bool,
}

/// Kind of transaction to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Opened by BEGIN, closed by COMMIT or ROLLBACK
    Explicit,
    /// Opened and closed around a single auto-commit statement
    Implicit,
    /// Implicit, committing internally in batches
    PeriodicCommit,
}

/// Why a transaction was terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReason {
    /// Status code
    pub code: String,
    /// Human-readable explanation
    pub message: String,
}

impl TerminationReason {
    /// Create a termination reason.
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Termination requested by interrupt or reset.
    pub fn interrupted() -> Self {
        Self::new(
            StatusCode::TRANSACTION_INTERRUPTED,
            "The transaction has been interrupted.",
        )
    }

    /// The reportable form of this reason.
    pub fn to_server_error(&self) -> ServerError {
        ServerError::new(&self.code, self.message.clone())
    }
}

/// Externally observed status of a tracked transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// No such transaction (never existed, or already closed)
    Closed,
    /// Open, no statement executing
    Open,
    /// Open with a statement currently executing
    OpenStatement,
    /// Marked for termination
    Interrupted(TerminationReason),
}

/// A live transaction obtained from the transaction service.
///
/// Handles are owned by exactly one [`TransactionStateMachine`] and touched
/// only from the session's processing thread; cross-thread cancellation goes
/// through [`TransactionManager::interrupt`] instead.
pub trait TransactionHandle: Send {
    /// Id under which the transaction manager tracks this transaction.
    fn id(&self) -> TransactionId;

    /// Commit.
    fn commit(&mut self) -> Result<(), TransactionError>;

    /// Roll back.
    fn rollback(&mut self) -> Result<(), TransactionError>;

    /// Request termination. A cancellation request, not a guarantee of
    /// immediate effect.
    fn mark_for_termination(&mut self, reason: TerminationReason);

    /// The termination reason, if this transaction has been terminated.
    fn reason_if_terminated(&self) -> Option<TerminationReason>;

    /// Bookmark data; meaningful once committed.
    fn bookmark_metadata(&self) -> BookmarkMetadata;
}

/// Opens transactions and answers statement-mode questions for one database.
pub trait TransactionService: Send + Sync {
    /// Open a transaction.
    fn begin_transaction(
        &self,
        kind: TransactionKind,
        login: &LoginContext,
        bookmarks: &[Bookmark],
        timeout: Option<Duration>,
        mode: AccessMode,
        metadata: &HashMap<String, Value>,
    ) -> Result<Box<dyn TransactionHandle>, TransactionError>;

    /// Whether the statement uses periodic commit.
    fn is_periodic_commit(&self, statement: &str) -> bool;

    /// Whether statements may stay open concurrently inside an explicit
    /// transaction. Decides between sequential statement ids and the absent
    /// sentinel.
    fn supports_nested_statements(&self) -> bool {
        false
    }

    /// Release per-transaction resources. Called exactly once per closed
    /// transaction, and when opening one fails.
    fn release(&self);
}

/// Executes statements inside an open transaction.
pub trait QueryExecutor: Send + Sync {
    /// Execute a statement, producing a lazily started result handle.
    fn execute_query(
        &self,
        transaction: &mut dyn TransactionHandle,
        statement: &str,
        parameters: &HashMap<String, Value>,
    ) -> Result<Box<dyn ResultHandle>, TransactionError>;
}

/// Owns the execution resources of one statement.
pub trait ResultHandle: Send {
    /// Start execution, producing the result.
    fn start(&mut self) -> Result<Box<dyn BoltResult>, TransactionError>;

    /// Close, releasing execution resources. `success` is false when the
    /// statement is abandoned.
    fn close(&mut self, success: bool) -> Result<(), TransactionError>;

    /// Abort a possibly still-running statement.
    fn terminate(&mut self) -> Result<(), TransactionError>;
}

/// A stream of records produced by one statement.
pub trait BoltResult: Send {
    /// Names of the record fields.
    fn field_names(&self) -> &[String];

    /// Feed up to `size` records to the consumer (`size < 0` means all).
    /// Returns whether records remain after this batch.
    fn handle_records(
        &mut self,
        consumer: &mut dyn RecordConsumer,
        size: i64,
    ) -> Result<bool, TransactionError>;
}

/// Receives records and result metadata from a [`BoltResult`].
pub trait RecordConsumer {
    /// A record with `n_fields` fields follows.
    fn begin_record(&mut self, n_fields: usize);

    /// One field of the current record.
    fn consume_field(&mut self, value: Value);

    /// The current record is complete.
    fn end_record(&mut self);

    /// Result-level metadata (statistics, plans).
    fn add_metadata(&mut self, key: &str, value: Value);
}

/// A result with no records and no fields.
///
/// Backs the dummy statement outcome installed by the auto-commit ROLLBACK
/// compatibility path.
#[derive(Debug, Default)]
pub struct EmptyResult {
    fields: Vec<String>,
}

impl EmptyResult {
    /// Create an empty result.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BoltResult for EmptyResult {
    fn field_names(&self) -> &[String] {
        &self.fields
    }

    fn handle_records(
        &mut self,
        _consumer: &mut dyn RecordConsumer,
        _size: i64,
    ) -> Result<bool, TransactionError> {
        Ok(false)
    }
}

/// Session-level view of the transaction manager, addressed by transaction
/// id. Safe to call from any thread.
pub trait TransactionManager: Send + Sync {
    /// Request interruption of a tracked transaction. Fire-and-forget.
    fn interrupt(&self, id: TransactionId);

    /// Externally observed status of a tracked transaction.
    fn transaction_status(&self, id: TransactionId) -> TransactionStatus;

    /// Roll back a tracked transaction. Fails with
    /// [`TransactionError::NotFound`] when it is already gone.
    fn rollback(&self, id: TransactionId) -> Result<(), TransactionError>;

    /// Drop any per-connection resources tracked under this connection id.
    fn clean_up(&self, connection_id: &str);
}

/// Resolves a database name to a transaction processor.
pub trait StatementProcessorProvider: Send + Sync {
    /// Obtain a processor for statements against `database`.
    fn acquire(
        &self,
        database: &str,
        login: &LoginContext,
    ) -> Result<TransactionStateMachine, TransactionError>;
}

/// Everything else the session machine needs from the server.
pub trait SessionSpi: Send + Sync {
    /// Authenticate a connection.
    fn authenticate(
        &self,
        token: &AuthToken,
    ) -> Result<AuthenticationResult, AuthenticationError>;

    /// The database statements target when they name none.
    fn default_database(&self, login: &LoginContext) -> String;

    /// Report an error to the server's logging boundary.
    fn report_error(&self, error: &ServerError);

    /// Server agent string for HELLO metadata.
    fn version(&self) -> String;
}

/// Receives the outcome of one processed message.
///
/// Installed for the duration of a single `process` call; `on_finish` fires
/// exactly once per message. Implementations use interior mutability; the
/// runtime shares the handler with record-streaming internals.
pub trait ResponseHandler: Send + Sync {
    /// Attach response metadata.
    fn on_metadata(&self, key: &str, value: Value);

    /// Stream records out of a result. `pull` distinguishes PULL from
    /// DISCARD; `size < 0` means all remaining records. Returns whether
    /// records remain.
    fn on_records(
        &self,
        result: &mut dyn BoltResult,
        pull: bool,
        size: i64,
    ) -> Result<bool, TransactionError>;

    /// The message failed.
    fn mark_failed(&self, error: ServerError);

    /// The message was ignored.
    fn mark_ignored(&self);

    /// The message is fully processed.
    fn on_finish(&self);
}

/// Flow-control boundary for pull-size-limited streaming.
pub trait ResultConsumer {
    /// Consume a batch of records from the result.
    fn consume(&mut self, result: &mut dyn BoltResult) -> Result<(), TransactionError>;

    /// Whether records remain after the batch just consumed.
    fn has_more(&self) -> bool;
}

/// The transport handle owned by a session.
pub trait Channel: Send + Sync {
    /// Close the underlying connection. Idempotent.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingConsumer {
        records: usize,
    }

    impl RecordConsumer for CountingConsumer {
        fn begin_record(&mut self, _n_fields: usize) {}
        fn consume_field(&mut self, _value: Value) {}
        fn end_record(&mut self) {
            self.records += 1;
        }
        fn add_metadata(&mut self, _key: &str, _value: Value) {}
    }

    #[test]
    fn test_empty_result() {
        let mut result = EmptyResult::new();
        assert!(result.field_names().is_empty());

        let mut consumer = CountingConsumer { records: 0 };
        let has_more = result.handle_records(&mut consumer, -1).unwrap();
        assert!(!has_more);
        assert_eq!(consumer.records, 0);
    }

    #[test]
    fn test_termination_reason() {
        let reason = TerminationReason::interrupted();
        assert_eq!(reason.code, StatusCode::TRANSACTION_INTERRUPTED);

        let err = reason.to_server_error();
        assert_eq!(err.code(), StatusCode::TRANSACTION_INTERRUPTED);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_transaction_status() {
        assert_eq!(TransactionStatus::Closed, TransactionStatus::Closed);
        assert_ne!(
            TransactionStatus::Open,
            TransactionStatus::Interrupted(TerminationReason::interrupted())
        );
    }
}
