//! Message types for the change tracker
//!
//! Defines the opaque sequence marker and the change record delivered to the
//! consumer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Position in a remote change feed
///
/// Servers use numbers, strings or arrays here. The value is only ever echoed
/// back as `since` and compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(Value);

impl Sequence {
    /// Wrap a raw JSON value
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The raw JSON value
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Null, or an empty string, both mean "from the beginning"
    pub fn is_origin(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Render for the `since` query parameter
    ///
    /// Strings are sent bare, everything else as compact JSON.
    pub fn to_query_value(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Parse a value typed by a human (CLI flag, checkpoint file)
    ///
    /// Valid JSON is kept as-is so that `42` stays numeric; anything else is
    /// taken as a string.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Self(value),
            Err(_) => Self(Value::String(raw.to_string())),
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query_value())
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self(Value::from(value))
    }
}

impl From<&str> for Sequence {
    fn from(value: &str) -> Self {
        Self(Value::String(value.to_string()))
    }
}

impl From<String> for Sequence {
    fn from(value: String) -> Self {
        Self(Value::String(value))
    }
}

/// One reported document mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Feed position of this change
    pub sequence: Sequence,

    /// Document identifier
    pub doc_id: String,

    /// Leaf revision identifiers, in server order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<String>,

    /// Whether the winning revision is a deletion
    #[serde(default)]
    pub deleted: bool,

    /// Embedded document body (only with `include_docs`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

impl ChangeRecord {
    /// Create a record with no revisions
    pub fn new(sequence: impl Into<Sequence>, doc_id: impl Into<String>) -> Self {
        Self {
            sequence: sequence.into(),
            doc_id: doc_id.into(),
            revisions: Vec::new(),
            deleted: false,
            doc: None,
        }
    }

    /// Builder: set revisions
    pub fn with_revisions<I, S>(mut self, revisions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.revisions = revisions.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: mark as deleted
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    /// Builder: attach document body
    pub fn with_doc(mut self, doc: Value) -> Self {
        self.doc = Some(doc);
        self
    }

    /// First listed revision, which the server reports as the winner
    pub fn current_revision(&self) -> Option<&str> {
        self.revisions.first().map(String::as_str)
    }
}

/// A decoded top-level value from the feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    /// A change entry
    Change(ChangeRecord),
    /// Trailing `{"last_seq": ...}` marker of a continuous feed
    LastSequence(Sequence),
}
