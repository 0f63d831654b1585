//! # Bolt Session Runtime
//!
//! Server-side session runtime for the Bolt protocol: the per-connection
//! state machine that carries a client from authentication through
//! transactions and query execution.
//!
//! ## Overview
//!
//! Every connection owns one [`SessionStateMachine`]. The transport decodes
//! inbound messages and feeds them to [`SessionStateMachine::process`]; the
//! machine drives the protocol states
//!
//! ```text
//! CONNECTED --HELLO--> READY --RUN--> STREAMING --PULL/DISCARD--> READY
//!     |                  |                |
//!     |                  +----BEGIN/COMMIT/ROLLBACK (transaction layer)
//!     |                  |
//!     +---- any out-of-sequence message ----> FAILED --RESET--> READY
//! ```
//!
//! and delivers each message's outcome through a caller-supplied
//! [`ResponseHandler`]. A nested [`TransactionStateMachine`] tracks the
//! transaction layer: auto-commit statements that commit as soon as their
//! result is drained, and explicit transactions with bookmarks at COMMIT.
//!
//! To keep the protocol secure, any message sent out of sequence produces an
//! immediate failure response and closes the connection; only transitions in
//! the explicit table are ever taken.
//!
//! ## Interrupts and termination
//!
//! A session is processed by one worker thread at a time, but two signals may
//! arrive from other threads at any moment:
//!
//! - [`SessionStateMachine::interrupt`] cancels work ahead of a RESET in the
//!   inbound queue. N interrupts must be drained by N RESET messages.
//! - [`SessionStateMachine::mark_for_termination`] flags the connection; the
//!   session thread closes it on the next message.
//!
//! Both are available on the cloneable [`SessionHandle`] for threads that
//! cannot borrow the machine itself.
//!
//! ## Capabilities
//!
//! The runtime executes nothing by itself. Authentication, database
//! resolution, transactions, query execution and transaction tracking are
//! consumed through the traits in [`runtime::spi`]; wire encoding and the
//! network transport stay entirely outside this crate.
//!
//! ## Modules
//!
//! - [`bolt`] - Protocol vocabulary: messages, status codes, values
//! - [`runtime`] - The state machines and their capability boundary

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod bolt;
pub mod runtime;

// Re-exports for convenience
pub use bolt::{
    AccessMode, AuthToken, BeginMessage, Classification, HelloMessage, RequestMessage, RunMessage,
    StatusCode, StreamingMessage, Value, STREAM_LIMIT_UNLIMITED,
};
pub use runtime::{
    AuthenticationError, Bookmark, BookmarkMetadata, ConnectionState, Fatality, ProtocolState,
    ServerError, SessionHandle, SessionStateMachine, StatementMetadata, TransactionError,
    TransactionStateMachine, TxState, ABSENT_QUERY_ID,
};
pub use runtime::spi::{
    AuthenticationResult, BoltResult, Channel, EmptyResult, LoginContext, QueryExecutor,
    RecordConsumer, ResponseHandler, ResultConsumer, ResultHandle, SessionSpi,
    StatementProcessorProvider, TerminationReason, TransactionHandle, TransactionId,
    TransactionKind, TransactionManager, TransactionService, TransactionStatus,
};
