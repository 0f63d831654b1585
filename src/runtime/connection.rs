//! Mutable per-connection state.
//!
//! `ConnectionState` is owned by one [`SessionStateMachine`] and, apart from
//! the shared signal fields, only ever touched from the session's processing
//! thread. The cross-thread surface is confined to [`SharedSignals`]: the
//! interrupt counter, the terminated flag and the tracked transaction id are
//! the only fields that interrupt/termination side-channels may reach, and
//! they use atomics or a small lock accordingly. Everything else is
//! single-threaded by contract.
//!
//! [`SessionStateMachine`]: crate::runtime::session::SessionStateMachine

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bolt::value::Value;
use crate::runtime::error::ServerError;
use crate::runtime::spi::{
    LoginContext, ResponseHandler, TerminationReason, TransactionId,
};
use crate::runtime::transaction::TransactionStateMachine;

/// Shared slot holding the id of the currently open transaction.
///
/// The transaction state machine publishes into it when a transaction opens
/// and clears it when the transaction closes; interrupt and termination
/// side-channels read it to address the transaction manager.
#[derive(Debug, Clone, Default)]
pub struct TransactionTracker {
    current: Arc<Mutex<Option<TransactionId>>>,
}

impl TransactionTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the id of a newly opened transaction.
    pub fn set(&self, id: TransactionId) {
        *self.current.lock() = Some(id);
    }

    /// Clear the tracked id once the transaction is closed.
    pub fn clear(&self) {
        *self.current.lock() = None;
    }

    /// The currently tracked transaction id, if any.
    pub fn get(&self) -> Option<TransactionId> {
        *self.current.lock()
    }
}

/// The connection state fields that other threads may touch.
#[derive(Debug, Default)]
pub struct SharedSignals {
    /// Incremented by `interrupt()`, drained one-for-one by RESET messages
    interrupt_counter: AtomicU32,
    /// Set once by `mark_for_termination()`; never cleared
    terminated: AtomicBool,
    /// Lookup key into the external transaction manager
    transaction: TransactionTracker,
}

impl SharedSignals {
    /// Create fresh signals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one interrupt. Each one must be matched by a future RESET.
    pub fn raise_interrupt(&self) {
        self.interrupt_counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Consume one interrupt for a processed RESET. Returns how many remain.
    pub fn consume_interrupt(&self) -> u32 {
        let mut remaining = 0;
        let _ = self
            .interrupt_counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                remaining = c.saturating_sub(1);
                Some(remaining)
            });
        remaining
    }

    /// Whether interrupts are pending.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt_counter.load(Ordering::SeqCst) > 0
    }

    /// Flag the connection for termination. Monotonic.
    pub fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Whether the connection has been flagged for termination.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// The tracked-transaction slot.
    pub fn transaction(&self) -> &TransactionTracker {
        &self.transaction
    }
}

/// Mutable state of one connection.
pub struct ConnectionState {
    id: String,
    signals: Arc<SharedSignals>,
    response_handler: Option<Arc<dyn ResponseHandler>>,
    pending_error: Option<ServerError>,
    pending_ignore: bool,
    pending_termination_notice: Option<TerminationReason>,
    login: Option<LoginContext>,
    statement_processor: Option<TransactionStateMachine>,
    closed: bool,
}

impl ConnectionState {
    /// Create connection state for a new connection.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            signals: Arc::new(SharedSignals::new()),
            response_handler: None,
            pending_error: None,
            pending_ignore: false,
            pending_termination_notice: None,
            login: None,
            statement_processor: None,
            closed: false,
        }
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The cross-thread signal block.
    pub fn signals(&self) -> &Arc<SharedSignals> {
        &self.signals
    }

    /// Whether ordinary messages may be dispatched: no pending interrupts,
    /// not terminated, not closed.
    pub fn can_process_message(&self) -> bool {
        !self.closed && !self.signals.is_terminated() && !self.signals.is_interrupted()
    }

    /// Install the response handler for the current message.
    pub fn set_response_handler(&mut self, handler: Arc<dyn ResponseHandler>) {
        self.response_handler = Some(handler);
    }

    /// Remove and return the installed response handler.
    pub fn take_response_handler(&mut self) -> Option<Arc<dyn ResponseHandler>> {
        self.response_handler.take()
    }

    /// The installed response handler, if a message is being processed.
    pub fn response_handler(&self) -> Option<Arc<dyn ResponseHandler>> {
        self.response_handler.clone()
    }

    /// Record a failure: forwarded to the installed handler, or stashed as
    /// the pending error until the next message flushes it.
    pub fn mark_failed(&mut self, error: ServerError) {
        match &self.response_handler {
            Some(handler) => handler.mark_failed(error),
            None => self.pending_error = Some(error),
        }
    }

    /// Record an ignored message, analogous to [`mark_failed`].
    ///
    /// [`mark_failed`]: Self::mark_failed
    pub fn mark_ignored(&mut self) {
        match &self.response_handler {
            Some(handler) => handler.mark_ignored(),
            None => self.pending_ignore = true,
        }
    }

    /// Attach metadata to the in-flight response, if any.
    pub fn on_metadata(&self, key: &str, value: Value) {
        if let Some(handler) = &self.response_handler {
            handler.on_metadata(key, value);
        }
    }

    /// The stashed error awaiting the next response, if any.
    pub fn pending_error(&self) -> Option<&ServerError> {
        self.pending_error.as_ref()
    }

    /// Whether an ignore is stashed awaiting the next response.
    pub fn has_pending_ignore(&self) -> bool {
        self.pending_ignore
    }

    /// Take the stashed error, clearing the slot.
    pub fn take_pending_error(&mut self) -> Option<ServerError> {
        self.pending_error.take()
    }

    /// Clear both pending slots.
    pub fn reset_pending(&mut self) {
        self.pending_error = None;
        self.pending_ignore = false;
    }

    /// Clear only the pending-ignore slot.
    pub fn clear_pending_ignore(&mut self) {
        self.pending_ignore = false;
    }

    /// Stash a termination notice for the next response.
    pub fn set_pending_termination_notice(&mut self, reason: TerminationReason) {
        self.pending_termination_notice = Some(reason);
    }

    /// Take the stashed termination notice, if any.
    pub fn take_pending_termination_notice(&mut self) -> Option<TerminationReason> {
        self.pending_termination_notice.take()
    }

    /// Record the authenticated subject after HELLO.
    pub fn set_login(&mut self, login: LoginContext) {
        self.login = Some(login);
    }

    /// The authenticated subject, once HELLO has succeeded.
    pub fn login(&self) -> Option<&LoginContext> {
        self.login.as_ref()
    }

    /// The current statement processor, if one is installed.
    pub fn statement_processor(&self) -> Option<&TransactionStateMachine> {
        self.statement_processor.as_ref()
    }

    /// Mutable access to the current statement processor.
    pub fn statement_processor_mut(&mut self) -> Option<&mut TransactionStateMachine> {
        self.statement_processor.as_mut()
    }

    /// Install a statement processor.
    pub fn set_statement_processor(&mut self, processor: TransactionStateMachine) {
        self.statement_processor = Some(processor);
    }

    /// Remove the statement processor.
    pub fn take_statement_processor(&mut self) -> Option<TransactionStateMachine> {
        self.statement_processor.take()
    }

    /// Mark the connection closed. Monotonic.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .field("pending_error", &self.pending_error)
            .field("pending_ignore", &self.pending_ignore)
            .finish()
    }
}
