//! Bolt protocol request messages.
//!
//! Request messages arrive from the client, already decoded from the wire by
//! the transport layer. The session runtime consumes them as plain data; the
//! framing and serialization formats never reach this crate.

use std::collections::HashMap;
use std::time::Duration;

use super::value::Value;
use crate::runtime::bookmark::Bookmark;

/// Access mode for transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Read-write access (default)
    #[default]
    Write,
    /// Read-only access
    Read,
}

impl AccessMode {
    /// Convert from the wire representation.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "r" | "read" => AccessMode::Read,
            _ => AccessMode::Write,
        }
    }

    /// Convert to the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "r",
            AccessMode::Write => "w",
        }
    }
}

/// Authentication token carried by a HELLO message.
#[derive(Debug, Clone)]
pub struct AuthToken {
    /// Authentication scheme (e.g., "basic", "bearer")
    pub scheme: String,
    /// Principal (username)
    pub principal: Option<String>,
    /// Credentials (password)
    pub credentials: Option<String>,
    /// Realm
    pub realm: Option<String>,
    /// Additional parameters
    pub parameters: HashMap<String, Value>,
}

impl AuthToken {
    /// Create a basic auth token.
    pub fn basic(principal: &str, credentials: &str) -> Self {
        Self {
            scheme: "basic".to_string(),
            principal: Some(principal.to_string()),
            credentials: Some(credentials.to_string()),
            realm: None,
            parameters: HashMap::new(),
        }
    }

    /// Create an anonymous auth token (no auth).
    pub fn none() -> Self {
        Self {
            scheme: "none".to_string(),
            principal: None,
            credentials: None,
            realm: None,
            parameters: HashMap::new(),
        }
    }

    /// Parse from a decoded extra map.
    pub fn from_map(map: &HashMap<String, Value>) -> Self {
        let scheme = map
            .get("scheme")
            .and_then(|v| v.as_str())
            .unwrap_or("none")
            .to_string();

        let principal = map
            .get("principal")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let credentials = map
            .get("credentials")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let realm = map
            .get("realm")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let mut parameters = HashMap::new();
        for (k, v) in map {
            if !["scheme", "principal", "credentials", "realm"].contains(&k.as_str()) {
                parameters.insert(k.clone(), v.clone());
            }
        }

        Self {
            scheme,
            principal,
            credentials,
            realm,
            parameters,
        }
    }
}

/// All Bolt request messages.
#[derive(Debug, Clone)]
pub enum RequestMessage {
    /// HELLO - Initialize and authenticate the connection
    Hello(HelloMessage),
    /// RUN - Execute a statement
    Run(RunMessage),
    /// PULL - Retrieve records from the current result
    Pull(StreamingMessage),
    /// DISCARD - Drop records from the current result
    Discard(StreamingMessage),
    /// BEGIN - Open an explicit transaction
    Begin(BeginMessage),
    /// COMMIT - Commit the explicit transaction
    Commit,
    /// ROLLBACK - Roll back the explicit transaction
    Rollback,
    /// RESET - Clear failures and interrupts, back to READY
    Reset,
    /// GOODBYE - Close the connection gracefully
    Goodbye,
}

impl RequestMessage {
    /// Message name for logging and failure messages.
    pub fn name(&self) -> &'static str {
        match self {
            RequestMessage::Hello(_) => "HELLO",
            RequestMessage::Run(_) => "RUN",
            RequestMessage::Pull(_) => "PULL",
            RequestMessage::Discard(_) => "DISCARD",
            RequestMessage::Begin(_) => "BEGIN",
            RequestMessage::Commit => "COMMIT",
            RequestMessage::Rollback => "ROLLBACK",
            RequestMessage::Reset => "RESET",
            RequestMessage::Goodbye => "GOODBYE",
        }
    }

    /// Whether this message is dispatched even while the connection is
    /// interrupted or failed. RESET must reach the machine to drain
    /// interrupts; GOODBYE must always be able to end the connection.
    pub fn safe_to_process_in_any_state(&self) -> bool {
        matches!(self, RequestMessage::Reset | RequestMessage::Goodbye)
    }
}

/// HELLO message.
#[derive(Debug, Clone)]
pub struct HelloMessage {
    /// User agent string
    pub user_agent: String,
    /// Authentication token
    pub auth: AuthToken,
}

impl HelloMessage {
    /// Create a new HELLO message.
    pub fn new(user_agent: &str, auth: AuthToken) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            auth,
        }
    }
}

/// RUN message.
#[derive(Debug, Clone)]
pub struct RunMessage {
    /// Statement text
    pub statement: String,
    /// Statement parameters
    pub parameters: HashMap<String, Value>,
    /// Extra metadata (bookmarks, tx_timeout, tx_metadata, mode, db)
    pub extra: HashMap<String, Value>,
}

impl RunMessage {
    /// Create a new RUN message.
    pub fn new(statement: &str) -> Self {
        Self {
            statement: statement.to_string(),
            parameters: HashMap::new(),
            extra: HashMap::new(),
        }
    }

    /// Set statement parameters.
    pub fn with_parameters(mut self, params: HashMap<String, Value>) -> Self {
        self.parameters = params;
        self
    }

    /// Set extra metadata.
    pub fn with_extra(mut self, extra: HashMap<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    /// Set the target database.
    pub fn with_database(mut self, db: &str) -> Self {
        self.extra.insert("db".to_string(), Value::String(db.to_string()));
        self
    }

    /// Set the transaction timeout in milliseconds.
    pub fn with_tx_timeout(mut self, millis: i64) -> Self {
        self.extra
            .insert("tx_timeout".to_string(), Value::Integer(millis));
        self
    }

    /// Set transaction metadata.
    pub fn with_tx_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.extra
            .insert("tx_metadata".to_string(), Value::Map(metadata));
        self
    }

    /// Bookmarks this statement must causally follow.
    pub fn bookmarks(&self) -> Vec<Bookmark> {
        extra_bookmarks(&self.extra)
    }

    /// Transaction timeout, if supplied.
    pub fn tx_timeout(&self) -> Option<Duration> {
        extra_tx_timeout(&self.extra)
    }

    /// Transaction metadata, if supplied.
    pub fn tx_metadata(&self) -> HashMap<String, Value> {
        extra_tx_metadata(&self.extra)
    }

    /// Requested access mode.
    pub fn access_mode(&self) -> AccessMode {
        extra_access_mode(&self.extra)
    }

    /// Target database; empty means the default database.
    pub fn database(&self) -> &str {
        extra_database(&self.extra)
    }
}

/// BEGIN message.
#[derive(Debug, Clone, Default)]
pub struct BeginMessage {
    /// Extra metadata (bookmarks, tx_timeout, tx_metadata, mode, db)
    pub extra: HashMap<String, Value>,
}

impl BeginMessage {
    /// Create a new BEGIN message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set extra metadata.
    pub fn with_extra(mut self, extra: HashMap<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    /// Set the target database.
    pub fn with_database(mut self, db: &str) -> Self {
        self.extra.insert("db".to_string(), Value::String(db.to_string()));
        self
    }

    /// Set the transaction timeout in milliseconds.
    pub fn with_tx_timeout(mut self, millis: i64) -> Self {
        self.extra
            .insert("tx_timeout".to_string(), Value::Integer(millis));
        self
    }

    /// Bookmarks this transaction must causally follow.
    pub fn bookmarks(&self) -> Vec<Bookmark> {
        extra_bookmarks(&self.extra)
    }

    /// Transaction timeout, if supplied.
    pub fn tx_timeout(&self) -> Option<Duration> {
        extra_tx_timeout(&self.extra)
    }

    /// Transaction metadata, if supplied.
    pub fn tx_metadata(&self) -> HashMap<String, Value> {
        extra_tx_metadata(&self.extra)
    }

    /// Requested access mode.
    pub fn access_mode(&self) -> AccessMode {
        extra_access_mode(&self.extra)
    }

    /// Target database; empty means the default database.
    pub fn database(&self) -> &str {
        extra_database(&self.extra)
    }
}

/// Record count meaning "all remaining records".
pub const STREAM_LIMIT_UNLIMITED: i64 = -1;

/// PULL / DISCARD message.
#[derive(Debug, Clone)]
pub struct StreamingMessage {
    /// Number of records to stream; -1 streams everything
    pub n: i64,
    /// Statement id; -1 addresses the most recent statement
    pub qid: i64,
}

impl StreamingMessage {
    /// Stream `n` records of the most recent statement.
    pub fn new(n: i64) -> Self {
        Self { n, qid: -1 }
    }

    /// Stream all remaining records of the most recent statement.
    pub fn all() -> Self {
        Self::new(STREAM_LIMIT_UNLIMITED)
    }

    /// Address a specific statement id.
    pub fn with_qid(mut self, qid: i64) -> Self {
        self.qid = qid;
        self
    }
}

fn extra_bookmarks(extra: &HashMap<String, Value>) -> Vec<Bookmark> {
    extra
        .get("bookmarks")
        .and_then(|v| v.as_list())
        .map(|list| {
            list.iter()
                .filter_map(|item| item.as_str().map(Bookmark::new))
                .collect()
        })
        .unwrap_or_default()
}

fn extra_tx_timeout(extra: &HashMap<String, Value>) -> Option<Duration> {
    extra
        .get("tx_timeout")
        .and_then(|v| v.as_int())
        .filter(|ms| *ms >= 0)
        .map(|ms| Duration::from_millis(ms as u64))
}

fn extra_tx_metadata(extra: &HashMap<String, Value>) -> HashMap<String, Value> {
    extra
        .get("tx_metadata")
        .and_then(|v| v.as_map())
        .cloned()
        .unwrap_or_default()
}

fn extra_access_mode(extra: &HashMap<String, Value>) -> AccessMode {
    extra
        .get("mode")
        .and_then(|v| v.as_str())
        .map(AccessMode::from_str)
        .unwrap_or_default()
}

fn extra_database(extra: &HashMap<String, Value>) -> &str {
    extra.get("db").and_then(|v| v.as_str()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode() {
        assert_eq!(AccessMode::default(), AccessMode::Write);
        assert_eq!(AccessMode::from_str("r"), AccessMode::Read);
        assert_eq!(AccessMode::from_str("read"), AccessMode::Read);
        assert_eq!(AccessMode::from_str("w"), AccessMode::Write);
        assert_eq!(AccessMode::Read.as_str(), "r");
        assert_eq!(AccessMode::Write.as_str(), "w");
    }

    #[test]
    fn test_auth_token_from_map() {
        let mut map = HashMap::new();
        map.insert("scheme".to_string(), Value::String("basic".into()));
        map.insert("principal".to_string(), Value::String("neo".into()));
        map.insert("credentials".to_string(), Value::String("secret".into()));
        map.insert("custom".to_string(), Value::Integer(1));

        let token = AuthToken::from_map(&map);
        assert_eq!(token.scheme, "basic");
        assert_eq!(token.principal.as_deref(), Some("neo"));
        assert_eq!(token.credentials.as_deref(), Some("secret"));
        assert_eq!(token.parameters.len(), 1);
    }

    #[test]
    fn test_auth_token_constructors() {
        let token = AuthToken::basic("neo", "secret");
        assert_eq!(token.scheme, "basic");

        let token = AuthToken::none();
        assert_eq!(token.scheme, "none");
        assert!(token.principal.is_none());
    }

    #[test]
    fn test_message_names() {
        assert_eq!(RequestMessage::Run(RunMessage::new("RETURN 1")).name(), "RUN");
        assert_eq!(RequestMessage::Commit.name(), "COMMIT");
        assert_eq!(RequestMessage::Reset.name(), "RESET");
        assert_eq!(RequestMessage::Goodbye.name(), "GOODBYE");
    }

    #[test]
    fn test_safe_to_process_in_any_state() {
        assert!(RequestMessage::Reset.safe_to_process_in_any_state());
        assert!(RequestMessage::Goodbye.safe_to_process_in_any_state());
        assert!(!RequestMessage::Commit.safe_to_process_in_any_state());
        assert!(!RequestMessage::Run(RunMessage::new("RETURN 1")).safe_to_process_in_any_state());
    }

    #[test]
    fn test_run_extra_accessors() {
        let msg = RunMessage::new("RETURN 1")
            .with_database("movies")
            .with_tx_timeout(5000)
            .with_tx_metadata(HashMap::from([(
                "app".to_string(),
                Value::String("test".into()),
            )]));

        assert_eq!(msg.database(), "movies");
        assert_eq!(msg.tx_timeout(), Some(Duration::from_millis(5000)));
        assert_eq!(msg.tx_metadata().len(), 1);
        assert_eq!(msg.access_mode(), AccessMode::Write);
        assert!(msg.bookmarks().is_empty());
    }

    #[test]
    fn test_begin_bookmarks() {
        let mut extra = HashMap::new();
        extra.insert(
            "bookmarks".to_string(),
            Value::List(vec![
                Value::String("neo4j:bookmark:v1:tx1".into()),
                Value::String("neo4j:bookmark:v1:tx2".into()),
            ]),
        );
        extra.insert("mode".to_string(), Value::String("r".into()));

        let msg = BeginMessage::new().with_extra(extra);
        assert_eq!(msg.bookmarks().len(), 2);
        assert_eq!(msg.access_mode(), AccessMode::Read);
        assert_eq!(msg.database(), "");
    }

    #[test]
    fn test_streaming_message() {
        let msg = StreamingMessage::all();
        assert_eq!(msg.n, STREAM_LIMIT_UNLIMITED);
        assert_eq!(msg.qid, -1);

        let msg = StreamingMessage::new(100).with_qid(2);
        assert_eq!(msg.n, 100);
        assert_eq!(msg.qid, 2);
    }

    #[test]
    fn test_negative_tx_timeout_ignored() {
        let msg = RunMessage::new("RETURN 1").with_tx_timeout(-1);
        assert_eq!(msg.tx_timeout(), None);
    }
}
