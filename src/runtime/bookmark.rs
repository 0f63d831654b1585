//! Causal-consistency bookmarks.
//!
//! A bookmark is an opaque token encoding the causal position of a committed
//! transaction. Clients hand it back on later requests to get
//! read-your-writes across connections. Only a committed transaction ever
//! produces a non-empty bookmark.

use crate::runtime::spi::TransactionId;

/// A causal-consistency bookmark.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bookmark {
    value: String,
}

impl Bookmark {
    /// Create a bookmark from its string form.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// The empty placeholder bookmark. Returned whenever no transaction has
    /// committed: mid-stream in auto-commit mode, and always inside an
    /// explicit transaction.
    pub fn empty() -> Self {
        Self::new("")
    }

    /// Bookmark value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether this is the empty placeholder.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Combine several bookmarks; the most recent wins.
    pub fn from_bookmarks(bookmarks: &[Bookmark]) -> Self {
        bookmarks.last().cloned().unwrap_or_else(Self::empty)
    }
}

impl std::fmt::Display for Bookmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl From<String> for Bookmark {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Bookmark {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The data a committed transaction exposes for bookmark encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkMetadata {
    /// Committed transaction id
    pub transaction_id: TransactionId,
    /// Database the transaction ran against
    pub database: String,
}

impl BookmarkMetadata {
    /// Create bookmark metadata.
    pub fn new(transaction_id: TransactionId, database: impl Into<String>) -> Self {
        Self {
            transaction_id,
            database: database.into(),
        }
    }

    /// Encode as a bookmark.
    pub fn to_bookmark(&self) -> Bookmark {
        Bookmark::new(format!(
            "{}:bookmark:v1:tx{}",
            self.database, self.transaction_id
        ))
    }
}
