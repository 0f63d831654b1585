//! Protocol states and their transition table.
//!
//! Transitions are a total function `(state, message) -> Option<next state>`.
//! `None` is the single invalid-transition outcome; the driver in
//! [`SessionStateMachine::process`] turns it into a fatal protocol breach and
//! closes the connection. No state handles its own unknown messages, which
//! keeps the fail-closed rule in one place.
//!
//! [`SessionStateMachine::process`]: crate::runtime::session::SessionStateMachine::process

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::bolt::message::{BeginMessage, RequestMessage, RunMessage, StreamingMessage};
use crate::bolt::status::StatusCode;
use crate::bolt::value::Value;
use crate::runtime::bookmark::Bookmark;
use crate::runtime::error::{Fatality, ServerError, TransactionError};
use crate::runtime::session::{ProcessorError, SessionContext};
use crate::runtime::spi::{BoltResult, ResponseHandler, ResultConsumer};
use crate::runtime::transaction::{StatementMetadata, TxState, ABSENT_QUERY_ID};

/// States of the protocol-level session machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Socket connected, HELLO not yet processed. The only valid transition
    /// is a correctly authorized HELLO into READY.
    Connected,
    /// Ready to accept a new RUN or BEGIN.
    Ready,
    /// A result is available and must be pulled or discarded.
    Streaming,
    /// A recoverable error occurred; everything but RESET is ignored.
    Failed,
    /// A RESET is waiting in the queue; everything ahead of it is ignored.
    Interrupted,
}

impl ProtocolState {
    /// State name as it appears in failure messages.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolState::Connected => "CONNECTED",
            ProtocolState::Ready => "READY",
            ProtocolState::Streaming => "STREAMING",
            ProtocolState::Failed => "FAILED",
            ProtocolState::Interrupted => "INTERRUPTED",
        }
    }

    /// Dispatch a message. `Ok(None)` means the message is not permitted in
    /// this state.
    pub(crate) fn process(
        self,
        message: &RequestMessage,
        ctx: &mut SessionContext,
    ) -> Result<Option<ProtocolState>, Fatality> {
        match (self, message) {
            (ProtocolState::Connected, RequestMessage::Hello(m)) => {
                connected_hello(ctx, m).map(Some)
            }

            (ProtocolState::Ready, RequestMessage::Run(m)) => ready_run(ctx, m).map(Some),
            (ProtocolState::Ready, RequestMessage::Begin(m)) => ready_begin(ctx, m).map(Some),
            (ProtocolState::Ready, RequestMessage::Commit) => ready_commit(ctx).map(Some),
            (ProtocolState::Ready, RequestMessage::Rollback) => ready_rollback(ctx).map(Some),

            (ProtocolState::Streaming, RequestMessage::Pull(m)) => {
                streaming_stream(ctx, m, true).map(Some)
            }
            (ProtocolState::Streaming, RequestMessage::Discard(m)) => {
                streaming_stream(ctx, m, false).map(Some)
            }
            (ProtocolState::Streaming, RequestMessage::Run(m)) => {
                // further statements mid-stream only inside an explicit
                // transaction whose service keeps nested statements open
                if nested_run_permitted(ctx) {
                    ready_run(ctx, m).map(Some)
                } else {
                    Ok(None)
                }
            }

            (
                ProtocolState::Ready | ProtocolState::Streaming | ProtocolState::Failed,
                RequestMessage::Reset,
            ) => reset_machine(self, ctx).map(Some),

            (
                ProtocolState::Failed,
                RequestMessage::Run(_)
                | RequestMessage::Pull(_)
                | RequestMessage::Discard(_)
                | RequestMessage::Begin(_)
                | RequestMessage::Commit
                | RequestMessage::Rollback,
            ) => {
                ctx.connection.mark_ignored();
                Ok(Some(ProtocolState::Failed))
            }

            (ProtocolState::Interrupted, RequestMessage::Reset) => {
                if ctx.connection.signals().consume_interrupt() > 0 {
                    ctx.connection.mark_ignored();
                    Ok(Some(ProtocolState::Interrupted))
                } else {
                    reset_machine(self, ctx).map(Some)
                }
            }
            (ProtocolState::Interrupted, _) => {
                ctx.connection.mark_ignored();
                Ok(Some(ProtocolState::Interrupted))
            }

            _ => Ok(None),
        }
    }

    /// The synthetic transition fed by a pending interrupt before the real
    /// message is dispatched.
    pub(crate) fn interrupt(self, ctx: &mut SessionContext) -> Result<ProtocolState, Fatality> {
        match self {
            ProtocolState::Connected => {
                // interrupts are triggered by a RESET message
                let msg = "RESET cannot be handled by a session in the CONNECTED state.";
                ctx.fail(self, ServerError::fatal(StatusCode::REQUEST_INVALID, msg));
                Err(Fatality::Breach(msg.to_string()))
            }
            _ => Ok(ProtocolState::Interrupted),
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn connected_hello(
    ctx: &mut SessionContext,
    message: &crate::bolt::message::HelloMessage,
) -> Result<ProtocolState, Fatality> {
    match ctx.spi.authenticate(&message.auth) {
        Ok(result) => {
            debug!(
                user_agent = %message.user_agent,
                principal = result.login.principal.as_deref().unwrap_or("<none>"),
                "connection authenticated"
            );
            ctx.connection.set_login(result.login);
            if result.credentials_expired {
                ctx.connection
                    .on_metadata("credentials_expired", Value::Boolean(true));
            }
            let connection_id = ctx.connection.id().to_string();
            ctx.connection
                .on_metadata("server", Value::String(ctx.spi.version()));
            ctx.connection
                .on_metadata("connection_id", Value::String(connection_id));
            Ok(ProtocolState::Ready)
        }
        Err(e) => {
            let error = ServerError::fatal(&e.code, e.message.clone());
            ctx.fail(ProtocolState::Connected, error);
            Err(Fatality::Auth(e.to_string()))
        }
    }
}

fn ready_run(ctx: &mut SessionContext, message: &RunMessage) -> Result<ProtocolState, Fatality> {
    let started = Instant::now();
    match run_statement(ctx, message) {
        Ok(metadata) => {
            let fields: Vec<Value> = metadata
                .field_names()
                .iter()
                .map(|name| Value::String(name.clone()))
                .collect();
            ctx.connection.on_metadata("fields", Value::List(fields));
            if metadata.query_id() != ABSENT_QUERY_ID {
                ctx.connection
                    .on_metadata("qid", Value::Integer(metadata.query_id()));
            }
            ctx.connection.on_metadata(
                "t_first",
                Value::Integer(started.elapsed().as_millis() as i64),
            );
            Ok(ProtocolState::Streaming)
        }
        Err(e) => handle_processor_error(ctx, ProtocolState::Ready, e),
    }
}

fn run_statement(
    ctx: &mut SessionContext,
    message: &RunMessage,
) -> Result<StatementMetadata, ProcessorError> {
    let bookmarks = message.bookmarks();
    let timeout = message.tx_timeout();
    let mode = message.access_mode();
    let metadata = message.tx_metadata();

    let processor = ctx.ensure_statement_processor(message.database())?;
    processor
        .run(
            &message.statement,
            &message.parameters,
            &bookmarks,
            timeout,
            mode,
            &metadata,
        )
        .map_err(ProcessorError::Tx)?;
    processor.take_last_statement_metadata().ok_or_else(|| {
        ProcessorError::Tx(TransactionError::fatal(
            StatusCode::GENERAL_ERROR,
            "Statement metadata missing after RUN.",
        ))
    })
}

fn ready_begin(ctx: &mut SessionContext, message: &BeginMessage) -> Result<ProtocolState, Fatality> {
    match begin_transaction(ctx, message) {
        Ok(()) => Ok(ProtocolState::Ready),
        Err(e) => handle_processor_error(ctx, ProtocolState::Ready, e),
    }
}

fn begin_transaction(
    ctx: &mut SessionContext,
    message: &BeginMessage,
) -> Result<(), ProcessorError> {
    let bookmarks = message.bookmarks();
    let timeout = message.tx_timeout();
    let mode = message.access_mode();
    let metadata = message.tx_metadata();

    let processor = ctx.ensure_statement_processor(message.database())?;
    processor
        .begin_transaction(&bookmarks, timeout, mode, &metadata)
        .map_err(ProcessorError::Tx)
}

fn ready_commit(ctx: &mut SessionContext) -> Result<ProtocolState, Fatality> {
    let result = match ctx.connection.statement_processor_mut() {
        Some(processor) => processor.commit_transaction(),
        None => Err(TransactionError::client(
            StatusCode::REQUEST_INVALID,
            "No current transaction to commit.",
        )),
    };

    match result {
        Ok(bookmark) => {
            if !bookmark.is_empty() {
                ctx.connection
                    .on_metadata("bookmark", Value::String(bookmark.value().to_string()));
            }
            Ok(ProtocolState::Ready)
        }
        Err(e) => ctx.handle_statement_error(ProtocolState::Ready, e),
    }
}

fn ready_rollback(ctx: &mut SessionContext) -> Result<ProtocolState, Fatality> {
    let result = match ctx.connection.statement_processor_mut() {
        Some(processor) => processor.rollback_transaction(),
        // nothing ever ran on this connection; the compatibility no-op
        None => Ok(()),
    };

    match result {
        Ok(()) => Ok(ProtocolState::Ready),
        Err(e) => ctx.handle_statement_error(ProtocolState::Ready, e),
    }
}

fn streaming_stream(
    ctx: &mut SessionContext,
    message: &StreamingMessage,
    pull: bool,
) -> Result<ProtocolState, Fatality> {
    match stream_records(ctx, message, pull) {
        Ok((bookmark, has_more)) => {
            if has_more {
                ctx.connection.on_metadata("has_more", Value::Boolean(true));
                Ok(ProtocolState::Streaming)
            } else {
                if !bookmark.is_empty() {
                    ctx.connection
                        .on_metadata("bookmark", Value::String(bookmark.value().to_string()));
                }
                // sibling statements may still be open under other ids
                let still_streaming = ctx
                    .connection
                    .statement_processor()
                    .map(|p| p.has_open_statements())
                    .unwrap_or(false);
                if still_streaming {
                    Ok(ProtocolState::Streaming)
                } else {
                    Ok(ProtocolState::Ready)
                }
            }
        }
        Err(e) => ctx.handle_statement_error(ProtocolState::Streaming, e),
    }
}

fn stream_records(
    ctx: &mut SessionContext,
    message: &StreamingMessage,
    pull: bool,
) -> Result<(Bookmark, bool), TransactionError> {
    let handler = ctx.connection.response_handler().ok_or_else(|| {
        TransactionError::fatal(
            StatusCode::GENERAL_ERROR,
            "No response handler installed while streaming.",
        )
    })?;
    let mut consumer = RecordStreamer {
        handler,
        pull,
        size: message.n,
        has_more: false,
    };

    let processor = ctx
        .connection
        .statement_processor_mut()
        .ok_or_else(|| {
            TransactionError::client(
                StatusCode::REQUEST_INVALID,
                format!("Unknown statement id: {}.", message.qid),
            )
        })?;
    let bookmark = processor.stream_result(message.qid, &mut consumer)?;
    Ok((bookmark, consumer.has_more))
}

fn nested_run_permitted(ctx: &SessionContext) -> bool {
    ctx.connection
        .statement_processor()
        .map(|p| p.state() == TxState::Explicit && p.supports_nested_statements())
        .unwrap_or(false)
}

fn reset_machine(
    state: ProtocolState,
    ctx: &mut SessionContext,
) -> Result<ProtocolState, Fatality> {
    match ctx.reset_transaction_state() {
        Ok(()) => {
            // a successful reset swallows anything stashed for this response
            ctx.connection.reset_pending();
            Ok(ProtocolState::Ready)
        }
        Err(e) => {
            let error = ServerError::fatal(e.code(), e.to_string());
            ctx.fail(state, error);
            Err(Fatality::Connection(e.to_string()))
        }
    }
}

fn handle_processor_error(
    ctx: &mut SessionContext,
    state: ProtocolState,
    error: ProcessorError,
) -> Result<ProtocolState, Fatality> {
    match error {
        ProcessorError::Breach(msg) => {
            ctx.fail(state, ServerError::fatal(StatusCode::REQUEST_INVALID, &msg));
            Err(Fatality::Breach(msg))
        }
        ProcessorError::Tx(e) => ctx.handle_statement_error(state, e),
    }
}

/// Adapts the installed response handler to the transaction layer's
/// [`ResultConsumer`] boundary, carrying the pull-size limit.
struct RecordStreamer {
    handler: Arc<dyn ResponseHandler>,
    pull: bool,
    size: i64,
    has_more: bool,
}

impl ResultConsumer for RecordStreamer {
    fn consume(&mut self, result: &mut dyn BoltResult) -> Result<(), TransactionError> {
        self.has_more = self.handler.on_records(result, self.pull, self.size)?;
        Ok(())
    }

    fn has_more(&self) -> bool {
        self.has_more
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ProtocolState::Connected.name(), "CONNECTED");
        assert_eq!(ProtocolState::Ready.name(), "READY");
        assert_eq!(ProtocolState::Streaming.name(), "STREAMING");
        assert_eq!(ProtocolState::Failed.name(), "FAILED");
        assert_eq!(ProtocolState::Interrupted.name(), "INTERRUPTED");
        assert_eq!(ProtocolState::Ready.to_string(), "READY");
    }
}
