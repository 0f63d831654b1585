//! In-memory test doubles for the session runtime.
//!
//! A response recorder standing in for the transport, and stub
//! implementations of the SPI traits with observable probes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bolt::message::{AccessMode, AuthToken};
use crate::bolt::status::StatusCode;
use crate::bolt::value::Value;
use crate::runtime::bookmark::{Bookmark, BookmarkMetadata};
use crate::runtime::error::{AuthenticationError, ServerError, TransactionError};
use crate::runtime::spi::{
    AuthenticationResult, BoltResult, Channel, LoginContext, QueryExecutor, RecordConsumer,
    ResponseHandler, ResultConsumer, ResultHandle, SessionSpi, StatementProcessorProvider,
    TerminationReason, TransactionHandle, TransactionId, TransactionKind, TransactionManager,
    TransactionService, TransactionStatus,
};
use crate::runtime::transaction::TransactionStateMachine;

// ----------------------------------------------------------------------------
// Response recording
// ----------------------------------------------------------------------------

/// One fully processed message as seen by the client.
#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub metadata: HashMap<String, Value>,
    pub records: Vec<Vec<Value>>,
    pub error: Option<ServerError>,
    pub ignored: bool,
}

impl Recorded {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.ignored
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_ignored(&self) -> bool {
        self.error.is_none() && self.ignored
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

#[derive(Default)]
struct InFlight {
    metadata: HashMap<String, Value>,
    records: Vec<Vec<Value>>,
    error: Option<ServerError>,
    ignored: bool,
}

struct RowCollector {
    rows: Vec<Vec<Value>>,
    current: Vec<Value>,
    metadata: HashMap<String, Value>,
}

impl RowCollector {
    fn new() -> Self {
        Self {
            rows: Vec::new(),
            current: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

impl RecordConsumer for RowCollector {
    fn begin_record(&mut self, n_fields: usize) {
        self.current = Vec::with_capacity(n_fields);
    }

    fn consume_field(&mut self, value: Value) {
        self.current.push(value);
    }

    fn end_record(&mut self) {
        self.rows.push(std::mem::take(&mut self.current));
    }

    fn add_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }
}

/// Records every response a machine produces, one per processed message.
#[derive(Default)]
pub(crate) struct ResponseRecorder {
    in_flight: Mutex<InFlight>,
    responses: Mutex<VecDeque<Recorded>>,
    fail_on_records: AtomicBool,
}

impl ResponseRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next record-streaming call fail, like a broken client pipe.
    pub fn fail_on_records(self: Arc<Self>) -> Arc<Self> {
        self.fail_on_records.store(true, Ordering::SeqCst);
        self
    }

    pub fn next_response(&self) -> Recorded {
        self.responses
            .lock()
            .pop_front()
            .expect("no response recorded")
    }

    pub fn response_count(&self) -> usize {
        self.responses.lock().len()
    }
}

impl ResponseHandler for ResponseRecorder {
    fn on_metadata(&self, key: &str, value: Value) {
        self.in_flight.lock().metadata.insert(key.to_string(), value);
    }

    fn on_records(
        &self,
        result: &mut dyn BoltResult,
        pull: bool,
        size: i64,
    ) -> Result<bool, TransactionError> {
        if self.fail_on_records.load(Ordering::SeqCst) {
            return Err(TransactionError::client(
                StatusCode::GENERAL_ERROR,
                "response handler failure",
            ));
        }
        let mut collector = RowCollector::new();
        let has_more = result.handle_records(&mut collector, size)?;
        let mut in_flight = self.in_flight.lock();
        if pull {
            in_flight.records.extend(collector.rows);
        }
        in_flight.metadata.extend(collector.metadata);
        Ok(has_more)
    }

    fn mark_failed(&self, error: ServerError) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.error.is_none() {
            in_flight.error = Some(error);
        }
    }

    fn mark_ignored(&self) {
        self.in_flight.lock().ignored = true;
    }

    fn on_finish(&self) {
        let in_flight = std::mem::take(&mut *self.in_flight.lock());
        self.responses.lock().push_back(Recorded {
            metadata: in_flight.metadata,
            records: in_flight.records,
            error: in_flight.error,
            ignored: in_flight.ignored,
        });
    }
}

// ----------------------------------------------------------------------------
// Result consumption
// ----------------------------------------------------------------------------

/// Consumes up to a fixed number of records per batch and remembers whether
/// the result had more.
pub(crate) struct CollectingConsumer {
    size: i64,
    has_more: bool,
    rows: Vec<Vec<Value>>,
}

impl CollectingConsumer {
    pub fn unlimited() -> Self {
        Self {
            size: -1,
            has_more: false,
            rows: Vec::new(),
        }
    }

    pub fn batch(size: i64) -> Self {
        Self {
            size,
            has_more: false,
            rows: Vec::new(),
        }
    }

    pub fn records(&self) -> usize {
        self.rows.len()
    }
}

impl ResultConsumer for CollectingConsumer {
    fn consume(&mut self, result: &mut dyn BoltResult) -> Result<(), TransactionError> {
        let mut collector = RowCollector::new();
        self.has_more = result.handle_records(&mut collector, self.size)?;
        self.rows.extend(collector.rows);
        Ok(())
    }

    fn has_more(&self) -> bool {
        self.has_more
    }
}

pub(crate) fn consume_all() -> CollectingConsumer {
    CollectingConsumer::unlimited()
}

pub(crate) fn consume_batch(size: i64) -> CollectingConsumer {
    CollectingConsumer::batch(size)
}

/// A consumer whose consumption always fails.
pub(crate) struct FailingConsumer;

impl ResultConsumer for FailingConsumer {
    fn consume(&mut self, _result: &mut dyn BoltResult) -> Result<(), TransactionError> {
        Err(TransactionError::fatal(
            StatusCode::GENERAL_ERROR,
            "consumer failure",
        ))
    }

    fn has_more(&self) -> bool {
        false
    }
}

// ----------------------------------------------------------------------------
// Transactions
// ----------------------------------------------------------------------------

/// Observable state of one stub transaction.
pub(crate) struct TxProbe {
    id: TransactionId,
    kind: TransactionKind,
    committed: AtomicBool,
    rolled_back: AtomicBool,
    termination: Mutex<Option<TerminationReason>>,
    fail_commit: bool,
    fail_rollback: bool,
}

impl TxProbe {
    pub fn committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> bool {
        self.rolled_back.load(Ordering::SeqCst)
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn terminate_with(&self, reason: TerminationReason) {
        *self.termination.lock() = Some(reason);
    }
}

struct StubTransaction {
    probe: Arc<TxProbe>,
}

impl TransactionHandle for StubTransaction {
    fn id(&self) -> TransactionId {
        self.probe.id
    }

    fn commit(&mut self) -> Result<(), TransactionError> {
        if self.probe.fail_commit {
            return Err(TransactionError::fatal(
                StatusCode::GENERAL_ERROR,
                "commit failed",
            ));
        }
        self.probe.committed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), TransactionError> {
        if self.probe.fail_rollback {
            return Err(TransactionError::fatal(
                StatusCode::GENERAL_ERROR,
                "rollback failed",
            ));
        }
        self.probe.rolled_back.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn mark_for_termination(&mut self, reason: TerminationReason) {
        self.probe.terminate_with(reason);
    }

    fn reason_if_terminated(&self) -> Option<TerminationReason> {
        self.probe.termination.lock().clone()
    }

    fn bookmark_metadata(&self) -> BookmarkMetadata {
        BookmarkMetadata::new(self.probe.id, "neo4j")
    }
}

/// Stub transaction service handing out observable transactions.
pub(crate) struct StubService {
    probes: Mutex<Vec<Arc<TxProbe>>>,
    next_id: AtomicU64,
    released: AtomicUsize,
    periodic: Mutex<Vec<String>>,
    nested: bool,
    fail_begin: bool,
    fail_commit: bool,
    fail_rollback: bool,
}

impl StubService {
    pub fn new() -> Self {
        Self {
            probes: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            released: AtomicUsize::new(0),
            periodic: Mutex::new(Vec::new()),
            nested: false,
            fail_begin: false,
            fail_commit: false,
            fail_rollback: false,
        }
    }

    pub fn with_nested_statements(mut self) -> Self {
        self.nested = true;
        self
    }

    pub fn with_periodic_statement(self, statement: &str) -> Self {
        self.periodic.lock().push(statement.to_string());
        self
    }

    pub fn failing_begin(mut self) -> Self {
        self.fail_begin = true;
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    /// Probe of the n-th transaction opened through this service.
    pub fn probe(&self, index: usize) -> Arc<TxProbe> {
        self.probes.lock()[index].clone()
    }

    pub fn transactions_opened(&self) -> usize {
        self.probes.lock().len()
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl TransactionService for StubService {
    fn begin_transaction(
        &self,
        kind: TransactionKind,
        _login: &LoginContext,
        _bookmarks: &[Bookmark],
        _timeout: Option<Duration>,
        _mode: AccessMode,
        _metadata: &HashMap<String, Value>,
    ) -> Result<Box<dyn TransactionHandle>, TransactionError> {
        if self.fail_begin {
            return Err(TransactionError::fatal(
                StatusCode::GENERAL_ERROR,
                "begin failed",
            ));
        }
        let probe = Arc::new(TxProbe {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            kind,
            committed: AtomicBool::new(false),
            rolled_back: AtomicBool::new(false),
            termination: Mutex::new(None),
            fail_commit: self.fail_commit,
            fail_rollback: self.fail_rollback,
        });
        self.probes.lock().push(probe.clone());
        Ok(Box::new(StubTransaction { probe }))
    }

    fn is_periodic_commit(&self, statement: &str) -> bool {
        self.periodic.lock().iter().any(|s| s == statement)
    }

    fn supports_nested_statements(&self) -> bool {
        self.nested
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Results
// ----------------------------------------------------------------------------

struct StubResult {
    fields: Vec<String>,
    remaining: usize,
    produced: usize,
}

impl BoltResult for StubResult {
    fn field_names(&self) -> &[String] {
        &self.fields
    }

    fn handle_records(
        &mut self,
        consumer: &mut dyn RecordConsumer,
        size: i64,
    ) -> Result<bool, TransactionError> {
        let batch = if size < 0 {
            self.remaining
        } else {
            self.remaining.min(size as usize)
        };
        for _ in 0..batch {
            consumer.begin_record(self.fields.len());
            for _ in &self.fields {
                consumer.consume_field(Value::Integer(self.produced as i64));
            }
            consumer.end_record();
            self.remaining -= 1;
            self.produced += 1;
        }
        Ok(self.remaining > 0)
    }
}

struct StubResultHandle {
    index: usize,
    fields: Vec<String>,
    rows: usize,
    fail_start: bool,
    fail_terminate: bool,
}

impl ResultHandle for StubResultHandle {
    fn start(&mut self) -> Result<Box<dyn BoltResult>, TransactionError> {
        if self.fail_start {
            return Err(TransactionError::fatal(
                StatusCode::GENERAL_ERROR,
                "start failed",
            ));
        }
        Ok(Box::new(StubResult {
            fields: self.fields.clone(),
            remaining: self.rows,
            produced: 0,
        }))
    }

    fn close(&mut self, _success: bool) -> Result<(), TransactionError> {
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), TransactionError> {
        if self.fail_terminate {
            return Err(TransactionError::fatal(
                StatusCode::GENERAL_ERROR,
                format!("terminate {} failed", self.index),
            ));
        }
        Ok(())
    }
}

/// Stub query executor producing fixed-size results.
pub(crate) struct StubExecutor {
    fields: Vec<String>,
    rows: usize,
    fail_execute: bool,
    fail_start: bool,
    expire_auth: bool,
    fail_terminate_for: Vec<usize>,
    handles_created: AtomicUsize,
}

impl StubExecutor {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            rows: 0,
            fail_execute: false,
            fail_start: false,
            expire_auth: false,
            fail_terminate_for: Vec::new(),
            handles_created: AtomicUsize::new(0),
        }
    }

    pub fn with_result(mut self, fields: Vec<String>, rows: usize) -> Self {
        self.fields = fields;
        self.rows = rows;
        self
    }

    pub fn failing_execute(mut self) -> Self {
        self.fail_execute = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn expiring_auth(mut self) -> Self {
        self.expire_auth = true;
        self
    }

    /// Handles created at the given indices (0-based) fail to terminate.
    pub fn failing_terminate_for(mut self, indices: &[usize]) -> Self {
        self.fail_terminate_for = indices.to_vec();
        self
    }
}

impl QueryExecutor for StubExecutor {
    fn execute_query(
        &self,
        _transaction: &mut dyn TransactionHandle,
        _statement: &str,
        _parameters: &HashMap<String, Value>,
    ) -> Result<Box<dyn ResultHandle>, TransactionError> {
        if self.expire_auth {
            return Err(TransactionError::AuthorizationExpired("Auth expired!".into()));
        }
        if self.fail_execute {
            return Err(TransactionError::fatal(
                StatusCode::EXECUTION_FAILED,
                "execute failed",
            ));
        }
        let index = self.handles_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubResultHandle {
            index,
            fields: self.fields.clone(),
            rows: self.rows,
            fail_start: self.fail_start,
            fail_terminate: self.fail_terminate_for.contains(&index),
        }))
    }
}

// ----------------------------------------------------------------------------
// Session-level stubs
// ----------------------------------------------------------------------------

/// Stub transaction manager recording signals it receives.
#[derive(Default)]
pub(crate) struct StubManager {
    interrupts: Mutex<Vec<TransactionId>>,
    cleaned: Mutex<Vec<String>>,
    statuses: Mutex<HashMap<TransactionId, TransactionStatus>>,
}

impl StubManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn interrupts(&self) -> Vec<TransactionId> {
        self.interrupts.lock().clone()
    }

    pub fn cleaned(&self) -> Vec<String> {
        self.cleaned.lock().clone()
    }

    pub fn set_status(&self, id: TransactionId, status: TransactionStatus) {
        self.statuses.lock().insert(id, status);
    }
}

impl TransactionManager for StubManager {
    fn interrupt(&self, id: TransactionId) {
        self.interrupts.lock().push(id);
    }

    fn transaction_status(&self, id: TransactionId) -> TransactionStatus {
        self.statuses
            .lock()
            .get(&id)
            .cloned()
            .unwrap_or(TransactionStatus::Closed)
    }

    fn rollback(&self, id: TransactionId) -> Result<(), TransactionError> {
        Err(TransactionError::NotFound(format!("transaction {}", id)))
    }

    fn clean_up(&self, connection_id: &str) {
        self.cleaned.lock().push(connection_id.to_string());
    }
}

/// Stub provider building processors around shared stubs.
pub(crate) struct StubProvider {
    service: Arc<StubService>,
    executor: Arc<StubExecutor>,
}

impl StubProvider {
    pub fn new(service: Arc<StubService>, executor: Arc<StubExecutor>) -> Arc<Self> {
        Arc::new(Self { service, executor })
    }
}

impl StatementProcessorProvider for StubProvider {
    fn acquire(
        &self,
        database: &str,
        login: &LoginContext,
    ) -> Result<TransactionStateMachine, TransactionError> {
        Ok(TransactionStateMachine::new(
            self.service.clone(),
            self.executor.clone(),
            login.clone(),
            database,
        ))
    }
}

/// Stub authentication and reporting boundary.
#[derive(Default)]
pub(crate) struct StubSpi {
    fail_auth: bool,
    reported: Mutex<Vec<ServerError>>,
}

impl StubSpi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_auth() -> Arc<Self> {
        Arc::new(Self {
            fail_auth: true,
            reported: Mutex::new(Vec::new()),
        })
    }

    pub fn reported(&self) -> Vec<ServerError> {
        self.reported.lock().clone()
    }
}

impl SessionSpi for StubSpi {
    fn authenticate(
        &self,
        token: &AuthToken,
    ) -> Result<AuthenticationResult, AuthenticationError> {
        if self.fail_auth {
            return Err(AuthenticationError::unauthorized("The client is unauthorized."));
        }
        Ok(AuthenticationResult {
            login: LoginContext::new(token.principal.clone(), token.scheme.clone()),
            credentials_expired: false,
        })
    }

    fn default_database(&self, _login: &LoginContext) -> String {
        "neo4j".to_string()
    }

    fn report_error(&self, error: &ServerError) {
        self.reported.lock().push(error.clone());
    }

    fn version(&self) -> String {
        "BoltSession/0.1".to_string()
    }
}

/// Transport stub recording whether it was closed.
#[derive(Default)]
pub(crate) struct RecordingChannel {
    closed: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Channel for RecordingChannel {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
