//! The protocol-level session state machine.
//!
//! One instance per connection. It oversees the exchange of messages for the
//! Bolt protocol across the five active states CONNECTED, READY, STREAMING,
//! FAILED and INTERRUPTED. Of particular note is RESET, which both marks the
//! current work for termination and clears the connection state back down.
//!
//! Any transition not defined in the table (a message sent out of sequence)
//! results in an immediate failure response and a closed connection.
//!
//! Threading: `process`, `close` and the other `&mut self` operations belong
//! to the connection's single processing thread. [`SessionHandle`] is the
//! only cross-thread surface; it reaches nothing but the atomic signal block
//! and the transaction manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::bolt::message::RequestMessage;
use crate::bolt::status::StatusCode;
use crate::runtime::connection::{ConnectionState, SharedSignals};
use crate::runtime::error::{Fatality, ServerError, TransactionError};
use crate::runtime::spi::{
    Channel, ResponseHandler, SessionSpi, StatementProcessorProvider, TransactionManager,
    TransactionStatus,
};
use crate::runtime::states::ProtocolState;
use crate::runtime::transaction::TransactionStateMachine;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Everything the transition functions need besides the current state.
pub(crate) struct SessionContext {
    pub(crate) connection: ConnectionState,
    pub(crate) spi: Arc<dyn SessionSpi>,
    pub(crate) provider: Arc<dyn StatementProcessorProvider>,
    pub(crate) tx_manager: Arc<dyn TransactionManager>,
}

/// Error resolving or driving the statement processor.
pub(crate) enum ProcessorError {
    /// Database switched under an open transaction; a protocol breach.
    Breach(String),
    /// Anything from the transaction layer.
    Tx(TransactionError),
}

impl SessionContext {
    /// Record a failure: report it, then either forward it to the response
    /// handler or stash it. A connection already in FAILED only marks the
    /// message ignored, so one failure is not reported twice.
    pub(crate) fn fail(&mut self, current: ProtocolState, error: ServerError) {
        self.spi.report_error(&error);
        if current == ProtocolState::Failed {
            self.connection.mark_ignored();
        } else {
            self.connection.mark_failed(error);
        }
    }

    /// Record a statement error and decide how processing continues:
    /// recoverable errors put the machine into FAILED, fatal ones raise the
    /// matching connection fatality.
    pub(crate) fn handle_statement_error(
        &mut self,
        current: ProtocolState,
        cause: TransactionError,
    ) -> Result<ProtocolState, Fatality> {
        let auth_expired = matches!(cause, TransactionError::AuthorizationExpired(_));
        let error = ServerError::from_transaction_error(&cause, false);
        let fatal = error.is_fatal();
        self.fail(current, error);

        if fatal {
            if auth_expired {
                Err(Fatality::Auth(cause.to_string()))
            } else {
                Err(Fatality::Connection(cause.to_string()))
            }
        } else {
            Ok(ProtocolState::Failed)
        }
    }

    /// Resolve the statement processor for a statement against `database`
    /// (empty selects the default database).
    ///
    /// A processor for a different database can only be installed once the
    /// current one is idle; switching databases under an open transaction is
    /// a protocol breach.
    pub(crate) fn ensure_statement_processor(
        &mut self,
        database: &str,
    ) -> Result<&mut TransactionStateMachine, ProcessorError> {
        let login = self
            .connection
            .login()
            .cloned()
            .ok_or_else(|| {
                ProcessorError::Tx(TransactionError::fatal(
                    StatusCode::GENERAL_ERROR,
                    "Connection is not authenticated.",
                ))
            })?;
        let database = if database.is_empty() {
            self.spi.default_database(&login)
        } else {
            database.to_string()
        };

        let replace = match self.connection.statement_processor() {
            None => true,
            Some(p) if p.database() == database => false,
            Some(p) if p.is_idle() => true,
            Some(p) => {
                return Err(ProcessorError::Breach(format!(
                    "Statement for database '{}' cannot be handled while the transaction \
                     against database '{}' is open.",
                    database,
                    p.database()
                )))
            }
        };

        if replace {
            let mut processor = self
                .provider
                .acquire(&database, &login)
                .map_err(ProcessorError::Tx)?;
            processor.set_transaction_tracker(self.connection.signals().transaction().clone());
            self.connection.set_statement_processor(processor);
        }

        self.connection.statement_processor_mut().ok_or_else(|| {
            ProcessorError::Tx(TransactionError::fatal(
                StatusCode::GENERAL_ERROR,
                "Statement processor missing after acquisition.",
            ))
        })
    }

    /// Roll back whatever transaction state is open, returning to the
    /// auto-commit baseline. A transaction already removed by a racing reset
    /// or termination is not an error.
    pub(crate) fn reset_transaction_state(&mut self) -> Result<(), TransactionError> {
        if let Some(processor) = self.connection.statement_processor_mut() {
            return match processor.reset() {
                Ok(()) | Err(TransactionError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            };
        }
        if let Some(id) = self.connection.signals().transaction().get() {
            let result = match self.tx_manager.rollback(id) {
                Ok(()) | Err(TransactionError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            };
            self.connection.signals().transaction().clear();
            return result;
        }
        Ok(())
    }
}

/// Cross-thread handle of a session.
///
/// Cloneable and `Send + Sync`; the only operations other threads may invoke
/// while the session thread is inside `process`.
#[derive(Clone)]
pub struct SessionHandle {
    connection_id: String,
    signals: Arc<SharedSignals>,
    tx_manager: Arc<dyn TransactionManager>,
}

impl SessionHandle {
    /// Request interruption of the session's current work. Each call must be
    /// matched by one future RESET before the session processes ordinary
    /// messages again.
    pub fn interrupt(&self) {
        self.signals.raise_interrupt();
        if let Some(id) = self.signals.transaction().get() {
            self.tx_manager.interrupt(id);
        }
    }

    /// Flag the session for termination. Never closes the socket directly;
    /// the session thread does that when it next looks at the flag.
    pub fn mark_for_termination(&self) {
        self.signals.mark_terminated();
        if let Some(id) = self.signals.transaction().get() {
            self.tx_manager.interrupt(id);
        }
        self.tx_manager.clean_up(&self.connection_id);
    }

    /// Whether the session has been flagged for termination.
    pub fn will_terminate(&self) -> bool {
        self.signals.is_terminated()
    }
}

/// The per-connection Bolt session state machine.
pub struct SessionStateMachine {
    state: ProtocolState,
    ctx: SessionContext,
    channel: Arc<dyn Channel>,
}

impl SessionStateMachine {
    /// Create a machine for a freshly connected channel.
    pub fn new(
        spi: Arc<dyn SessionSpi>,
        provider: Arc<dyn StatementProcessorProvider>,
        tx_manager: Arc<dyn TransactionManager>,
        channel: Arc<dyn Channel>,
    ) -> Self {
        let id = format!("bolt-{}", CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst) + 1);
        Self {
            state: ProtocolState::Connected,
            ctx: SessionContext {
                connection: ConnectionState::new(id),
                spi,
                provider,
                tx_manager,
            },
            channel,
        }
    }

    /// Connection id, unique per server instance.
    pub fn id(&self) -> &str {
        self.ctx.connection.id()
    }

    /// Current protocol state.
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// The connection's mutable state. Mostly useful to transports and
    /// tests; everything protocol-relevant goes through [`process`].
    ///
    /// [`process`]: Self::process
    pub fn connection_state(&self) -> &ConnectionState {
        &self.ctx.connection
    }

    /// A handle for interrupt and termination signals from other threads.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            connection_id: self.ctx.connection.id().to_string(),
            signals: self.ctx.connection.signals().clone(),
            tx_manager: self.ctx.tx_manager.clone(),
        }
    }

    /// Process one inbound message, delivering its outcome through
    /// `handler`. The handler's `on_finish` fires exactly once, whatever
    /// happens in between.
    ///
    /// An `Err` means the connection is beyond saving and the transport must
    /// close the socket.
    pub fn process(
        &mut self,
        message: &RequestMessage,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<(), Fatality> {
        debug!(message = message.name(), state = self.state.name(), "processing message");

        if matches!(message, RequestMessage::Goodbye) {
            self.mark_for_termination();
            self.close();
            return Ok(());
        }

        if self.ctx.connection.signals().is_terminated() {
            self.close();
            return Ok(());
        }

        if self.ctx.connection.signals().is_interrupted() {
            // let the state react before the real message is dispatched
            self.state = self.state.interrupt(&mut self.ctx)?;
        }

        self.ctx.connection.set_response_handler(handler);
        let result = self.dispatch(message);
        self.after();
        result
    }

    fn dispatch(&mut self, message: &RequestMessage) -> Result<(), Fatality> {
        if !message.safe_to_process_in_any_state() && !self.ctx.connection.can_process_message() {
            self.ctx.connection.mark_ignored();
            return Ok(());
        }

        let current = self.state;
        match current.process(message, &mut self.ctx) {
            Ok(Some(next)) => {
                self.state = next;
                Ok(())
            }
            Ok(None) => {
                let msg = format!(
                    "Message '{}' cannot be handled by a session in the {} state.",
                    message.name(),
                    current
                );
                warn!(message = message.name(), state = current.name(), "protocol breach");
                self.fail(ServerError::fatal(StatusCode::REQUEST_INVALID, &msg));
                self.state = ProtocolState::Failed;
                Err(Fatality::Breach(msg))
            }
            Err(fatality) => {
                error!(error = %fatality, "connection-fatal failure while processing");
                // the failed state is reachable from anywhere on an
                // unrecoverable error
                self.state = ProtocolState::Failed;
                Err(fatality)
            }
        }
    }

    /// The post-processing hook. Flushes pending state into the installed
    /// handler, fires `on_finish`, and clears the handler slot regardless of
    /// what the flush does.
    fn after(&mut self) {
        if let Some(handler) = self.ctx.connection.take_response_handler() {
            if let Some(error) = self.ctx.connection.take_pending_error() {
                handler.mark_failed(error);
                self.state = ProtocolState::Failed;
            }
            if self.ctx.connection.has_pending_ignore() {
                handler.mark_ignored();
                self.ctx.connection.clear_pending_ignore();
            }
            if let Some(notice) = self.ctx.connection.take_pending_termination_notice() {
                handler.mark_failed(notice.to_server_error());
            }
            handler.on_finish();
        }
    }

    fn fail(&mut self, error: ServerError) {
        self.ctx.spi.report_error(&error);
        if self.state == ProtocolState::Failed {
            self.ctx.connection.mark_ignored();
        } else {
            self.ctx.connection.mark_failed(error);
        }
    }

    /// Record a failure and force the machine into FAILED. With no message
    /// in flight the failure is stashed and reported on the next response.
    pub fn mark_failed(&mut self, error: ServerError) {
        self.fail(error);
        self.state = ProtocolState::Failed;
    }

    /// Record a failure that originated outside normal message handling,
    /// with the same pre/post envelope as [`process`].
    ///
    /// [`process`]: Self::process
    pub fn handle_external_failure(
        &mut self,
        error: ServerError,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<(), Fatality> {
        if self.ctx.connection.signals().is_terminated() {
            self.close();
            return Ok(());
        }
        if self.ctx.connection.signals().is_interrupted() {
            self.state = self.state.interrupt(&mut self.ctx)?;
        }
        self.ctx.connection.set_response_handler(handler);
        self.fail(error);
        self.state = ProtocolState::Failed;
        self.after();
        Ok(())
    }

    /// Classify and record a failure. Recoverable errors are swallowed after
    /// recording (the caller keeps processing per protocol); fatal ones
    /// raise the matching fatality, distinguishing auth causes.
    pub fn handle_failure(
        &mut self,
        cause: TransactionError,
        fatal: bool,
    ) -> Result<(), Fatality> {
        let auth_expired = matches!(cause, TransactionError::AuthorizationExpired(_));
        let error = ServerError::from_transaction_error(&cause, fatal);
        let is_fatal = error.is_fatal();
        self.fail(error);

        if is_fatal {
            if auth_expired {
                Err(Fatality::Auth(cause.to_string()))
            } else {
                Err(Fatality::Connection(cause.to_string()))
            }
        } else {
            Ok(())
        }
    }

    /// Request interruption of the current work from any thread. Each call
    /// requires one future RESET message before ordinary processing resumes.
    pub fn interrupt(&self) {
        self.ctx.connection.signals().raise_interrupt();
        if let Some(id) = self.ctx.connection.signals().transaction().get() {
            self.ctx.tx_manager.interrupt(id);
        }
    }

    /// Flag the connection for termination from any thread. The socket is
    /// not touched here; the session thread closes it on its next message.
    pub fn mark_for_termination(&self) {
        self.ctx.connection.signals().mark_terminated();
        if let Some(id) = self.ctx.connection.signals().transaction().get() {
            self.ctx.tx_manager.interrupt(id);
        }
        self.ctx.tx_manager.clean_up(self.ctx.connection.id());
    }

    /// Whether the connection has been flagged for termination.
    pub fn will_terminate(&self) -> bool {
        self.ctx.connection.signals().is_terminated()
    }

    /// Roll back open transaction state and force the machine back to READY.
    /// Returns `false` (after reporting) instead of propagating failures.
    pub fn reset(&mut self) -> bool {
        match self.ctx.reset_transaction_state() {
            Ok(()) => {
                self.ctx.connection.reset_pending();
                self.state = ProtocolState::Ready;
                true
            }
            Err(e) => {
                let error = ServerError::from_transaction_error(&e, false);
                self.fail(error);
                self.state = ProtocolState::Failed;
                false
            }
        }
    }

    /// If the tracked transaction was terminated from outside, stash the
    /// termination reason for the next response.
    pub fn validate_transaction(&mut self) -> Result<(), TransactionError> {
        if let Some(id) = self.ctx.connection.signals().transaction().get() {
            if let TransactionStatus::Interrupted(reason) =
                self.ctx.tx_manager.transaction_status(id)
            {
                self.ctx.connection.set_pending_termination_notice(reason);
            }
        }
        if let Some(processor) = self.ctx.connection.statement_processor_mut() {
            if let Some(reason) = processor.validate_transaction()? {
                self.ctx.connection.set_pending_termination_notice(reason);
            }
        }
        Ok(())
    }

    /// Whether the tracked transaction currently has a statement executing.
    pub fn has_open_statement(&self) -> bool {
        self.ctx
            .connection
            .signals()
            .transaction()
            .get()
            .map(|id| self.ctx.tx_manager.transaction_status(id) == TransactionStatus::OpenStatement)
            .unwrap_or(false)
    }

    /// Whether the scheduler must keep this session on its current worker
    /// thread. True while a statement is executing: the underlying
    /// transaction is not safe to touch from two threads.
    pub fn should_stick_on_thread(&self) -> bool {
        self.has_open_statement()
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.ctx.connection.is_closed()
    }

    /// Close the transport channel and mark the connection closed. Always
    /// attempts a transaction rollback afterwards: a transaction may have
    /// been opened concurrently with the close request.
    pub fn close(&mut self) {
        self.channel.close();
        self.ctx.tx_manager.clean_up(self.ctx.connection.id());
        self.ctx.connection.mark_closed();
        if let Err(e) = self.ctx.reset_transaction_state() {
            warn!(error = %e, "transaction rollback during close failed");
        }
    }
}

impl std::fmt::Debug for SessionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStateMachine")
            .field("id", &self.ctx.connection.id())
            .field("state", &self.state)
            .field("closed", &self.ctx.connection.is_closed())
            .finish()
    }
}
