//! The nested transaction state machine.
//!
//! One logical database session's query and transaction lifecycle. Two
//! states: `AUTO_COMMIT`, where every RUN opens an implicit transaction that
//! commits as soon as its result is fully consumed, and
//! `EXPLICIT_TRANSACTION`, entered by BEGIN and left by COMMIT or ROLLBACK.
//!
//! Closing discipline shared by every commit/rollback/terminate path: close
//! all tracked statement outcomes first, then the transaction itself, and
//! unconditionally clear the tracked transaction id and notify the service
//! of release afterwards. The transaction object is never touched after
//! result resources referencing it have been freed, and release happens
//! exactly once per transaction even on the error path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::bolt::message::AccessMode;
use crate::bolt::status::{Classification, StatusCode};
use crate::bolt::value::Value;
use crate::runtime::bookmark::{Bookmark, BookmarkMetadata};
use crate::runtime::connection::TransactionTracker;
use crate::runtime::error::TransactionError;
use crate::runtime::spi::{
    BoltResult, EmptyResult, LoginContext, QueryExecutor, ResultConsumer, ResultHandle,
    TerminationReason, TransactionHandle, TransactionKind, TransactionService,
};

/// Statement id meaning "the only statement, no explicit id needed".
///
/// Auto-commit mode always uses it, and explicit transactions fall back to
/// it when the service does not support concurrently open statements.
pub const ABSENT_QUERY_ID: i64 = -1;

/// Metadata produced by a RUN, read exactly once by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementMetadata {
    query_id: i64,
    field_names: Vec<String>,
}

impl StatementMetadata {
    /// Create statement metadata.
    pub fn new(query_id: i64, field_names: Vec<String>) -> Self {
        Self {
            query_id,
            field_names,
        }
    }

    /// Statement id, or [`ABSENT_QUERY_ID`].
    pub fn query_id(&self) -> i64 {
        self.query_id
    }

    /// Names of the fields the statement produces.
    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }
}

/// One open statement: the lazily-started execution handle paired with its
/// result. Both are closed together.
pub struct StatementOutcome {
    handle: Option<Box<dyn ResultHandle>>,
    result: Box<dyn BoltResult>,
}

impl StatementOutcome {
    /// Pair a result with its execution handle.
    pub fn new(handle: Box<dyn ResultHandle>, result: Box<dyn BoltResult>) -> Self {
        Self {
            handle: Some(handle),
            result,
        }
    }

    /// An outcome with no execution resources and no records. Installed by
    /// the auto-commit ROLLBACK compatibility path so a following PULL
    /// succeeds with zero records.
    pub fn empty() -> Self {
        Self {
            handle: None,
            result: Box::new(EmptyResult::new()),
        }
    }

    /// The statement's result.
    pub fn result_mut(&mut self) -> &mut dyn BoltResult {
        self.result.as_mut()
    }

    fn close(&mut self, success: bool) -> Result<(), TransactionError> {
        match self.handle.as_mut() {
            Some(handle) => handle.close(success),
            None => Ok(()),
        }
    }

    fn terminate(&mut self) -> Result<(), TransactionError> {
        match self.handle.as_mut() {
            Some(handle) => handle.terminate(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for StatementOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementOutcome")
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

/// State of the transaction layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Each statement runs in its own implicit transaction
    AutoCommit,
    /// An explicit transaction is open
    Explicit,
}

/// The per-session transaction state machine.
pub struct TransactionStateMachine {
    service: Arc<dyn TransactionService>,
    executor: Arc<dyn QueryExecutor>,
    login: LoginContext,
    database: String,
    state: TxState,
    current_transaction: Option<Box<dyn TransactionHandle>>,
    statement_outcomes: HashMap<i64, StatementOutcome>,
    statement_counter: i64,
    last_statement_id: i64,
    last_statement_metadata: Option<StatementMetadata>,
    tracker: TransactionTracker,
}

impl TransactionStateMachine {
    /// Create a processor for statements against `database`.
    pub fn new(
        service: Arc<dyn TransactionService>,
        executor: Arc<dyn QueryExecutor>,
        login: LoginContext,
        database: impl Into<String>,
    ) -> Self {
        Self {
            service,
            executor,
            login,
            database: database.into(),
            state: TxState::AutoCommit,
            current_transaction: None,
            statement_outcomes: HashMap::new(),
            statement_counter: 0,
            last_statement_id: ABSENT_QUERY_ID,
            last_statement_metadata: None,
            tracker: TransactionTracker::new(),
        }
    }

    /// Publish open-transaction ids into the connection's shared slot so
    /// interrupt and termination side-channels can address them.
    pub fn set_transaction_tracker(&mut self, tracker: TransactionTracker) {
        self.tracker = tracker;
    }

    /// The database this processor targets.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Current transaction-layer state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Whether a transaction is open.
    pub fn has_transaction(&self) -> bool {
        self.current_transaction.is_some()
    }

    /// Whether statements may stay open concurrently inside an explicit
    /// transaction, as decided by the backing service.
    pub fn supports_nested_statements(&self) -> bool {
        self.service.supports_nested_statements()
    }

    /// Whether statement outcomes are still tracked.
    pub fn has_open_statements(&self) -> bool {
        !self.statement_outcomes.is_empty()
    }

    /// Whether this processor carries no open work and may be replaced.
    pub fn is_idle(&self) -> bool {
        self.state == TxState::AutoCommit
            && self.current_transaction.is_none()
            && self.statement_outcomes.is_empty()
    }

    /// Open an explicit transaction.
    pub fn begin_transaction(
        &mut self,
        bookmarks: &[Bookmark],
        timeout: Option<Duration>,
        mode: AccessMode,
        metadata: &HashMap<String, Value>,
    ) -> Result<(), TransactionError> {
        match self.state {
            TxState::Explicit => Err(TransactionError::client(
                StatusCode::REQUEST_INVALID,
                "Nested transactions are not supported.",
            )),
            TxState::AutoCommit => {
                let tx = match self.service.begin_transaction(
                    TransactionKind::Explicit,
                    &self.login,
                    bookmarks,
                    timeout,
                    mode,
                    metadata,
                ) {
                    Ok(tx) => tx,
                    Err(e) => {
                        // the service acquired resources for the open attempt
                        self.service.release();
                        return Err(e);
                    }
                };
                debug!(database = %self.database, tx_id = tx.id(), "explicit transaction opened");
                self.tracker.set(tx.id());
                self.current_transaction = Some(tx);
                self.state = TxState::Explicit;
                Ok(())
            }
        }
    }

    /// Execute a statement. On success the statement metadata is stored for
    /// a single read through [`take_last_statement_metadata`].
    ///
    /// [`take_last_statement_metadata`]: Self::take_last_statement_metadata
    pub fn run(
        &mut self,
        statement: &str,
        parameters: &HashMap<String, Value>,
        bookmarks: &[Bookmark],
        timeout: Option<Duration>,
        mode: AccessMode,
        metadata: &HashMap<String, Value>,
    ) -> Result<(), TransactionError> {
        match self.state {
            TxState::AutoCommit => {
                self.run_auto_commit(statement, parameters, bookmarks, timeout, mode, metadata)
            }
            TxState::Explicit => self.run_in_transaction(statement, parameters, timeout, metadata),
        }
    }

    fn run_auto_commit(
        &mut self,
        statement: &str,
        parameters: &HashMap<String, Value>,
        bookmarks: &[Bookmark],
        timeout: Option<Duration>,
        mode: AccessMode,
        metadata: &HashMap<String, Value>,
    ) -> Result<(), TransactionError> {
        let kind = if self.service.is_periodic_commit(statement) {
            TransactionKind::PeriodicCommit
        } else {
            TransactionKind::Implicit
        };

        let mut tx = match self.service.begin_transaction(
            kind,
            &self.login,
            bookmarks,
            timeout,
            mode,
            metadata,
        ) {
            Ok(tx) => tx,
            Err(e) => {
                self.service.release();
                return Err(e);
            }
        };
        self.tracker.set(tx.id());

        match start_execution(self.executor.as_ref(), tx.as_mut(), statement, parameters) {
            Ok((handle, result)) => {
                let fields = result.field_names().to_vec();
                self.current_transaction = Some(tx);
                self.statement_outcomes
                    .insert(ABSENT_QUERY_ID, StatementOutcome::new(handle, result));
                self.last_statement_id = ABSENT_QUERY_ID;
                self.last_statement_metadata =
                    Some(StatementMetadata::new(ABSENT_QUERY_ID, fields));
                Ok(())
            }
            Err(e) => {
                // the implicit transaction must not leak
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "rollback after failed statement start failed");
                }
                self.tracker.clear();
                self.service.release();
                Err(e)
            }
        }
    }

    fn run_in_transaction(
        &mut self,
        statement: &str,
        parameters: &HashMap<String, Value>,
        timeout: Option<Duration>,
        metadata: &HashMap<String, Value>,
    ) -> Result<(), TransactionError> {
        if timeout.is_some() || !metadata.is_empty() {
            return Err(TransactionError::client(
                StatusCode::REQUEST_INVALID,
                "Statements in an explicit transaction cannot carry their own timeout or metadata.",
            ));
        }
        if self.service.is_periodic_commit(statement) {
            return Err(TransactionError::client(
                StatusCode::SEMANTIC_ERROR,
                "Executing statements that use periodic commit is not possible in an open transaction.",
            ));
        }

        let query_id = if self.service.supports_nested_statements() {
            let id = self.statement_counter;
            self.statement_counter += 1;
            id
        } else {
            ABSENT_QUERY_ID
        };

        let tx = self.current_transaction.as_mut().ok_or_else(|| {
            TransactionError::fatal(
                StatusCode::GENERAL_ERROR,
                "No open transaction in the EXPLICIT_TRANSACTION state.",
            )
        })?;

        let (handle, result) =
            start_execution(self.executor.as_ref(), tx.as_mut(), statement, parameters)?;
        let fields = result.field_names().to_vec();
        self.statement_outcomes
            .insert(query_id, StatementOutcome::new(handle, result));
        self.last_statement_id = query_id;
        self.last_statement_metadata = Some(StatementMetadata::new(query_id, fields));
        Ok(())
    }

    /// Metadata of the most recent RUN. Consumed by the read: a second call
    /// without an intervening RUN yields `None`.
    pub fn take_last_statement_metadata(&mut self) -> Option<StatementMetadata> {
        self.last_statement_metadata.take()
    }

    /// Stream records of a statement into `consumer`.
    ///
    /// [`ABSENT_QUERY_ID`] resolves to the most recent statement. The
    /// returned bookmark is non-empty only when this call committed an
    /// auto-commit transaction; explicit transactions never produce a
    /// bookmark mid-transaction.
    pub fn stream_result(
        &mut self,
        query_id: i64,
        consumer: &mut dyn ResultConsumer,
    ) -> Result<Bookmark, TransactionError> {
        let id = if query_id == ABSENT_QUERY_ID {
            self.last_statement_id
        } else {
            query_id
        };
        if !self.statement_outcomes.contains_key(&id) {
            return Err(TransactionError::client(
                StatusCode::REQUEST_INVALID,
                format!("Unknown statement id: {}.", id),
            ));
        }

        match self.state {
            TxState::AutoCommit => self.stream_auto_commit(id, consumer),
            TxState::Explicit => self.stream_in_transaction(id, consumer),
        }
    }

    fn stream_auto_commit(
        &mut self,
        id: i64,
        consumer: &mut dyn ResultConsumer,
    ) -> Result<Bookmark, TransactionError> {
        let consumed = match self.statement_outcomes.get_mut(&id) {
            Some(outcome) => consumer.consume(outcome.result_mut()),
            None => return Err(unknown_statement(id)),
        };

        if let Err(e) = consumed {
            if let Err(close_err) = self.close_transaction(false) {
                warn!(error = %close_err, "rollback after failed result consumption failed");
            }
            return Err(e);
        }

        if consumer.has_more() {
            // a real bookmark is only meaningful once committed
            return Ok(Bookmark::empty());
        }

        if let Some(mut outcome) = self.statement_outcomes.remove(&id) {
            if let Err(e) = outcome.close(true) {
                if let Err(close_err) = self.close_transaction(false) {
                    warn!(error = %close_err, "rollback after failed statement close failed");
                }
                return Err(e);
            }
        }

        let bookmark = self
            .close_transaction(true)?
            .map(|metadata| metadata.to_bookmark())
            .unwrap_or_else(Bookmark::empty);
        Ok(bookmark)
    }

    fn stream_in_transaction(
        &mut self,
        id: i64,
        consumer: &mut dyn ResultConsumer,
    ) -> Result<Bookmark, TransactionError> {
        let consumed = match self.statement_outcomes.get_mut(&id) {
            Some(outcome) => consumer.consume(outcome.result_mut()),
            None => return Err(unknown_statement(id)),
        };
        consumed?;

        if !consumer.has_more() {
            if let Some(mut outcome) = self.statement_outcomes.remove(&id) {
                outcome.close(true)?;
            }
        }
        Ok(Bookmark::empty())
    }

    /// Commit the explicit transaction, yielding its bookmark.
    pub fn commit_transaction(&mut self) -> Result<Bookmark, TransactionError> {
        match self.state {
            TxState::AutoCommit => Err(TransactionError::client(
                StatusCode::REQUEST_INVALID,
                "No current transaction to commit.",
            )),
            TxState::Explicit => {
                // the transaction is gone whether or not the commit succeeds
                self.state = TxState::AutoCommit;
                let bookmark = self
                    .close_transaction(true)?
                    .map(|metadata| metadata.to_bookmark())
                    .unwrap_or_else(Bookmark::empty);
                Ok(bookmark)
            }
        }
    }

    /// Roll back the explicit transaction.
    ///
    /// In auto-commit mode this is a protocol-compatibility no-op: older
    /// clients send ROLLBACK followed by PULL regardless of transaction
    /// mode, so a dummy empty outcome is installed for the PULL to consume.
    pub fn rollback_transaction(&mut self) -> Result<(), TransactionError> {
        match self.state {
            TxState::AutoCommit => {
                self.statement_outcomes
                    .insert(ABSENT_QUERY_ID, StatementOutcome::empty());
                self.last_statement_id = ABSENT_QUERY_ID;
                Ok(())
            }
            TxState::Explicit => {
                self.state = TxState::AutoCommit;
                self.close_transaction(false).map(|_| ())
            }
        }
    }

    /// Hard reset: terminate in-flight statements best-effort, roll back
    /// whatever transaction is open, return to auto-commit mode.
    ///
    /// Close failures are aggregated rather than dropped: the first becomes
    /// the primary error, the rest are attached as suppressed. All outcomes
    /// are removed from tracking regardless.
    pub fn reset(&mut self) -> Result<(), TransactionError> {
        let mut primary: Option<TransactionError> = None;
        let mut suppressed: Vec<TransactionError> = Vec::new();

        for id in self.outcome_ids() {
            if let Some(mut outcome) = self.statement_outcomes.remove(&id) {
                if let Err(e) = outcome.terminate() {
                    record_failure(&mut primary, &mut suppressed, e);
                }
            }
        }

        self.state = TxState::AutoCommit;
        self.last_statement_metadata = None;
        if let Err(e) = self.close_transaction(false) {
            record_failure(&mut primary, &mut suppressed, e);
        }

        aggregate(primary, suppressed)
    }

    /// If the open transaction was terminated for a reason whose
    /// classification mandates rollback, reset and surface that reason.
    pub fn validate_transaction(&mut self) -> Result<Option<TerminationReason>, TransactionError> {
        let reason = self
            .current_transaction
            .as_ref()
            .and_then(|tx| tx.reason_if_terminated());

        match reason {
            Some(reason) if Classification::of(&reason.code).mandates_rollback() => {
                self.reset()?;
                Ok(Some(reason))
            }
            _ => Ok(None),
        }
    }

    /// Close statement outcomes, then the transaction, then unconditionally
    /// clear the tracked id and release the service. Returns bookmark
    /// metadata when a transaction was committed.
    fn close_transaction(
        &mut self,
        commit: bool,
    ) -> Result<Option<BookmarkMetadata>, TransactionError> {
        let mut primary: Option<TransactionError> = None;
        let mut suppressed: Vec<TransactionError> = Vec::new();

        for id in self.outcome_ids() {
            if let Some(mut outcome) = self.statement_outcomes.remove(&id) {
                if let Err(e) = outcome.close(commit) {
                    record_failure(&mut primary, &mut suppressed, e);
                }
            }
        }

        let mut bookmark = None;
        if let Some(mut tx) = self.current_transaction.take() {
            if commit && primary.is_none() {
                match tx.commit() {
                    Ok(()) => bookmark = Some(tx.bookmark_metadata()),
                    Err(e) => record_failure(&mut primary, &mut suppressed, e),
                }
            } else if let Err(e) = tx.rollback() {
                record_failure(&mut primary, &mut suppressed, e);
            }
            self.tracker.clear();
            self.service.release();
        }

        aggregate(primary, suppressed).map(|()| bookmark)
    }

    /// Tracked statement ids in ascending order.
    fn outcome_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.statement_outcomes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for TransactionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStateMachine")
            .field("database", &self.database)
            .field("state", &self.state)
            .field("open_statements", &self.statement_outcomes.len())
            .finish()
    }
}

fn start_execution(
    executor: &dyn QueryExecutor,
    tx: &mut dyn TransactionHandle,
    statement: &str,
    parameters: &HashMap<String, Value>,
) -> Result<(Box<dyn ResultHandle>, Box<dyn BoltResult>), TransactionError> {
    let mut handle = executor.execute_query(tx, statement, parameters)?;
    match handle.start() {
        Ok(result) => Ok((handle, result)),
        Err(e) => {
            if let Err(close_err) = handle.close(false) {
                warn!(error = %close_err, "closing unstarted result handle failed");
            }
            Err(e)
        }
    }
}

fn unknown_statement(id: i64) -> TransactionError {
    TransactionError::client(
        StatusCode::REQUEST_INVALID,
        format!("Unknown statement id: {}.", id),
    )
}

fn record_failure(
    primary: &mut Option<TransactionError>,
    suppressed: &mut Vec<TransactionError>,
    error: TransactionError,
) {
    if primary.is_none() {
        *primary = Some(error);
    } else {
        suppressed.push(error);
    }
}

fn aggregate(
    primary: Option<TransactionError>,
    suppressed: Vec<TransactionError>,
) -> Result<(), TransactionError> {
    match primary {
        None => Ok(()),
        Some(p) if suppressed.is_empty() => Err(p),
        Some(p) => Err(TransactionError::Cleanup {
            primary: Box::new(p),
            suppressed,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{
        consume_all, consume_batch, CollectingConsumer, StubExecutor, StubService,
    };

    fn machine(service: &Arc<StubService>) -> TransactionStateMachine {
        TransactionStateMachine::new(
            service.clone(),
            Arc::new(StubExecutor::new()),
            LoginContext::new(Some("neo".into()), "basic"),
            "neo4j",
        )
    }

    fn machine_with_result(service: &Arc<StubService>, rows: usize) -> TransactionStateMachine {
        let executor = StubExecutor::new().with_result(vec!["n".to_string()], rows);
        TransactionStateMachine::new(
            service.clone(),
            Arc::new(executor),
            LoginContext::new(Some("neo".into()), "basic"),
            "neo4j",
        )
    }

    #[test]
    fn test_auto_commit_run_and_stream() {
        // Scenario A: RUN in auto-commit, stream everything, transaction
        // commits and a non-empty bookmark comes back.
        let service = Arc::new(StubService::new());
        let mut tx = machine_with_result(&service, 1);

        tx.run("RETURN 1", &HashMap::new(), &[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        assert_eq!(tx.state(), TxState::AutoCommit);

        let metadata = tx.take_last_statement_metadata().unwrap();
        assert_eq!(metadata.field_names(), ["n"]);
        assert_eq!(metadata.query_id(), ABSENT_QUERY_ID);

        let mut consumer = consume_all();
        let bookmark = tx.stream_result(ABSENT_QUERY_ID, &mut consumer).unwrap();
        assert!(!bookmark.is_empty());
        assert_eq!(tx.state(), TxState::AutoCommit);
        assert!(!tx.has_transaction());
        assert_eq!(service.probe(0).committed(), true);
        assert_eq!(service.released(), 1);
    }

    #[test]
    fn test_auto_commit_partial_stream_keeps_transaction_open() {
        // P4: while the consumer reports more records, the transaction stays
        // open and the bookmark is the empty placeholder.
        let service = Arc::new(StubService::new());
        let mut tx = machine_with_result(&service, 5);

        tx.run("RETURN 1", &HashMap::new(), &[], None, AccessMode::Write, &HashMap::new())
            .unwrap();

        let mut consumer = consume_batch(2);
        let bookmark = tx.stream_result(ABSENT_QUERY_ID, &mut consumer).unwrap();
        assert!(bookmark.is_empty());
        assert!(tx.has_transaction());
        assert!(!service.probe(0).committed());

        let mut consumer = consume_all();
        let bookmark = tx.stream_result(ABSENT_QUERY_ID, &mut consumer).unwrap();
        assert!(!bookmark.is_empty());
        assert!(!tx.has_transaction());
        assert!(service.probe(0).committed());
    }

    #[test]
    fn test_metadata_single_read() {
        // P3: the metadata slot is consumed by the first read.
        let service = Arc::new(StubService::new());
        let mut tx = machine_with_result(&service, 0);

        tx.run("RETURN 1", &HashMap::new(), &[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        assert!(tx.take_last_statement_metadata().is_some());
        assert!(tx.take_last_statement_metadata().is_none());
    }

    #[test]
    fn test_explicit_transaction_lifecycle() {
        // Scenario B: BEGIN, RUN, COMMIT yields a non-empty bookmark and
        // returns to auto-commit.
        let service = Arc::new(StubService::new());
        let mut tx = machine_with_result(&service, 1);

        tx.begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        assert_eq!(tx.state(), TxState::Explicit);

        tx.run("CREATE (n)", &HashMap::new(), &[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        let metadata = tx.take_last_statement_metadata().unwrap();
        assert_eq!(metadata.query_id(), ABSENT_QUERY_ID);

        let mut consumer = consume_all();
        let bookmark = tx.stream_result(ABSENT_QUERY_ID, &mut consumer).unwrap();
        assert!(bookmark.is_empty());

        let bookmark = tx.commit_transaction().unwrap();
        assert!(!bookmark.is_empty());
        assert_eq!(tx.state(), TxState::AutoCommit);
        assert!(service.probe(0).committed());
        assert_eq!(service.released(), 1);
    }

    #[test]
    fn test_explicit_statement_ids_with_nested_support() {
        let service = Arc::new(StubService::new().with_nested_statements());
        let mut tx = machine_with_result(&service, 0);

        tx.begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap();

        tx.run("RETURN 1", &HashMap::new(), &[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        assert_eq!(tx.take_last_statement_metadata().unwrap().query_id(), 0);

        tx.run("RETURN 2", &HashMap::new(), &[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        assert_eq!(tx.take_last_statement_metadata().unwrap().query_id(), 1);
        assert!(tx.has_open_statements());
    }

    #[test]
    fn test_explicit_mid_stream_never_yields_bookmark() {
        // P5: inside an explicit transaction, draining a result never
        // produces a bookmark; only COMMIT does.
        let service = Arc::new(StubService::new());
        let mut tx = machine_with_result(&service, 3);

        tx.begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        tx.run("RETURN 1", &HashMap::new(), &[], None, AccessMode::Write, &HashMap::new())
            .unwrap();

        let mut consumer = consume_batch(1);
        assert!(tx.stream_result(ABSENT_QUERY_ID, &mut consumer).unwrap().is_empty());
        let mut consumer = consume_all();
        assert!(tx.stream_result(ABSENT_QUERY_ID, &mut consumer).unwrap().is_empty());

        assert!(tx.has_transaction());
        assert!(!tx.commit_transaction().unwrap().is_empty());
    }

    #[test]
    fn test_nested_transaction_rejected() {
        // P6: BEGIN inside an explicit transaction is recoverable and leaves
        // the state untouched.
        let service = Arc::new(StubService::new());
        let mut tx = machine(&service);

        tx.begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap();

        let err = tx
            .begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, TransactionError::Client { .. }));
        assert!(err.to_string().contains("Nested transactions"));
        assert_eq!(tx.state(), TxState::Explicit);
    }

    #[test]
    fn test_commit_without_transaction() {
        // Scenario C
        let service = Arc::new(StubService::new());
        let mut tx = machine(&service);

        let err = tx.commit_transaction().unwrap_err();
        assert!(matches!(err, TransactionError::Client { .. }));
        assert_eq!(err.to_string(), "No current transaction to commit.");
        assert_eq!(tx.state(), TxState::AutoCommit);
    }

    #[test]
    fn test_auto_commit_rollback_installs_dummy_outcome() {
        // Scenario D: ROLLBACK in auto-commit is a compatibility no-op whose
        // dummy outcome satisfies the following PULL with zero records.
        let service = Arc::new(StubService::new());
        let mut tx = machine(&service);

        tx.rollback_transaction().unwrap();
        assert!(tx.has_open_statements());

        let mut consumer = CollectingConsumer::unlimited();
        let bookmark = tx.stream_result(ABSENT_QUERY_ID, &mut consumer).unwrap();
        assert!(bookmark.is_empty());
        assert_eq!(consumer.records(), 0);
        assert!(!tx.has_open_statements());
        assert_eq!(service.released(), 0);
    }

    #[test]
    fn test_explicit_rollback() {
        let service = Arc::new(StubService::new());
        let mut tx = machine(&service);

        tx.begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        tx.rollback_transaction().unwrap();

        assert_eq!(tx.state(), TxState::AutoCommit);
        assert!(!tx.has_transaction());
        assert!(service.probe(0).rolled_back());
        assert_eq!(service.released(), 1);
    }

    #[test]
    fn test_timeout_and_metadata_rejected_in_explicit_transaction() {
        let service = Arc::new(StubService::new());
        let mut tx = machine_with_result(&service, 0);

        tx.begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap();

        let err = tx
            .run(
                "RETURN 1",
                &HashMap::new(),
                &[],
                Some(Duration::from_secs(1)),
                AccessMode::Write,
                &HashMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, TransactionError::Client { .. }));
        assert_eq!(tx.state(), TxState::Explicit);

        let metadata = HashMap::from([("k".to_string(), Value::Integer(1))]);
        let err = tx
            .run("RETURN 1", &HashMap::new(), &[], None, AccessMode::Write, &metadata)
            .unwrap_err();
        assert!(matches!(err, TransactionError::Client { .. }));
    }

    #[test]
    fn test_periodic_commit_rejected_in_explicit_transaction() {
        let service = Arc::new(StubService::new().with_periodic_statement("USING PERIODIC COMMIT"));
        let mut tx = machine_with_result(&service, 0);

        tx.begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap();

        let err = tx
            .run(
                "USING PERIODIC COMMIT",
                &HashMap::new(),
                &[],
                None,
                AccessMode::Write,
                &HashMap::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("periodic commit"));
        assert_eq!(tx.state(), TxState::Explicit);
    }

    #[test]
    fn test_periodic_commit_opens_periodic_transaction() {
        let service = Arc::new(StubService::new().with_periodic_statement("USING PERIODIC COMMIT"));
        let mut tx = machine_with_result(&service, 0);

        tx.run(
            "USING PERIODIC COMMIT",
            &HashMap::new(),
            &[],
            None,
            AccessMode::Write,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(service.probe(0).kind(), TransactionKind::PeriodicCommit);
    }

    #[test]
    fn test_unknown_statement_id() {
        let service = Arc::new(StubService::new());
        let mut tx = machine(&service);

        let mut consumer = consume_all();
        let err = tx.stream_result(42, &mut consumer).unwrap_err();
        assert!(err.to_string().contains("Unknown statement id"));
    }

    #[test]
    fn test_begin_failure_releases_service() {
        let service = Arc::new(StubService::new().failing_begin());
        let mut tx = machine(&service);

        let err = tx
            .begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, TransactionError::Fatal { .. }));
        assert_eq!(tx.state(), TxState::AutoCommit);
        assert_eq!(service.transactions_opened(), 0);
        assert_eq!(service.released(), 1);
    }

    #[test]
    fn test_failed_execute_rolls_back_auto_commit_transaction() {
        let service = Arc::new(StubService::new());
        let executor = StubExecutor::new().failing_execute();
        let mut tx = TransactionStateMachine::new(
            service.clone(),
            Arc::new(executor),
            LoginContext::default(),
            "neo4j",
        );

        let err = tx
            .run("RETURN 1", &HashMap::new(), &[], None, AccessMode::Write, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, TransactionError::Fatal { .. }));
        assert!(!tx.has_transaction());
        assert!(service.probe(0).rolled_back());
        assert_eq!(service.released(), 1);
    }

    #[test]
    fn test_failed_statement_start_rolls_back_auto_commit_transaction() {
        let service = Arc::new(StubService::new());
        let executor = StubExecutor::new().failing_start();
        let mut tx = TransactionStateMachine::new(
            service.clone(),
            Arc::new(executor),
            LoginContext::default(),
            "neo4j",
        );

        let err = tx
            .run("RETURN 1", &HashMap::new(), &[], None, AccessMode::Write, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, TransactionError::Fatal { .. }));
        assert!(!tx.has_transaction());
        assert!(service.probe(0).rolled_back());
        assert_eq!(service.released(), 1);
    }

    #[test]
    fn test_commit_failure_still_returns_to_auto_commit() {
        let service = Arc::new(StubService::new().failing_commit());
        let mut tx = machine(&service);

        tx.begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        let err = tx.commit_transaction().unwrap_err();
        assert!(matches!(err, TransactionError::Fatal { .. }));
        assert_eq!(tx.state(), TxState::AutoCommit);
        assert!(!tx.has_transaction());
        assert_eq!(service.released(), 1);
    }

    #[test]
    fn test_reset_aggregates_close_failures() {
        // P7: three outcomes, the first and third fail to terminate; the
        // first failure is primary, the third suppressed, all removed.
        let service = Arc::new(StubService::new().with_nested_statements());
        let executor = StubExecutor::new()
            .with_result(vec!["n".to_string()], 1)
            .failing_terminate_for(&[0, 2]);
        let mut tx = TransactionStateMachine::new(
            service.clone(),
            Arc::new(executor),
            LoginContext::default(),
            "neo4j",
        );

        tx.begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        for statement in ["RETURN 1", "RETURN 2", "RETURN 3"] {
            tx.run(statement, &HashMap::new(), &[], None, AccessMode::Write, &HashMap::new())
                .unwrap();
        }
        assert!(tx.has_open_statements());

        let err = tx.reset().unwrap_err();
        match err {
            TransactionError::Cleanup { primary, suppressed } => {
                assert!(primary.to_string().contains("terminate 0"));
                assert_eq!(suppressed.len(), 1);
                assert!(suppressed[0].to_string().contains("terminate 2"));
            }
            other => panic!("expected Cleanup, got: {:?}", other),
        }
        assert!(!tx.has_open_statements());
        assert!(!tx.has_transaction());
        assert_eq!(tx.state(), TxState::AutoCommit);
        assert!(service.probe(0).rolled_back());
    }

    #[test]
    fn test_consumption_failure_rolls_back_auto_commit_transaction() {
        let service = Arc::new(StubService::new());
        let mut tx = machine_with_result(&service, 3);

        tx.run("RETURN 1", &HashMap::new(), &[], None, AccessMode::Write, &HashMap::new())
            .unwrap();

        let mut consumer = crate::runtime::testing::FailingConsumer;
        let err = tx.stream_result(ABSENT_QUERY_ID, &mut consumer).unwrap_err();
        assert!(err.to_string().contains("consumer failure"));
        assert!(!tx.has_transaction());
        assert!(service.probe(0).rolled_back());
        assert_eq!(service.released(), 1);
    }

    #[test]
    fn test_consumption_failure_keeps_explicit_transaction_open() {
        let service = Arc::new(StubService::new());
        let mut tx = machine_with_result(&service, 3);

        tx.begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        tx.run("RETURN 1", &HashMap::new(), &[], None, AccessMode::Write, &HashMap::new())
            .unwrap();

        let mut consumer = crate::runtime::testing::FailingConsumer;
        tx.stream_result(ABSENT_QUERY_ID, &mut consumer).unwrap_err();
        assert!(tx.has_transaction());
        assert_eq!(tx.state(), TxState::Explicit);
    }

    #[test]
    fn test_reset_with_nothing_open() {
        let service = Arc::new(StubService::new());
        let mut tx = machine(&service);
        tx.reset().unwrap();
        assert_eq!(tx.state(), TxState::AutoCommit);
        assert_eq!(service.released(), 0);
    }

    #[test]
    fn test_validate_transaction_resets_on_terminated_transaction() {
        let service = Arc::new(StubService::new());
        let mut tx = machine(&service);

        tx.begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        service
            .probe(0)
            .terminate_with(TerminationReason::interrupted());

        let reason = tx.validate_transaction().unwrap().unwrap();
        assert_eq!(reason.code, StatusCode::TRANSACTION_INTERRUPTED);
        assert!(!tx.has_transaction());
        assert_eq!(tx.state(), TxState::AutoCommit);
    }

    #[test]
    fn test_validate_transaction_ignores_client_reasons() {
        let service = Arc::new(StubService::new());
        let mut tx = machine(&service);

        tx.begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        service.probe(0).terminate_with(TerminationReason::new(
            StatusCode::REQUEST_INVALID,
            "client fault",
        ));

        assert!(tx.validate_transaction().unwrap().is_none());
        assert!(tx.has_transaction());
    }

    #[test]
    fn test_tracker_follows_transaction_lifetime() {
        let service = Arc::new(StubService::new());
        let mut tx = machine_with_result(&service, 0);
        let tracker = TransactionTracker::new();
        tx.set_transaction_tracker(tracker.clone());

        tx.begin_transaction(&[], None, AccessMode::Write, &HashMap::new())
            .unwrap();
        assert!(tracker.get().is_some());

        tx.rollback_transaction().unwrap();
        assert_eq!(tracker.get(), None);
    }
}
