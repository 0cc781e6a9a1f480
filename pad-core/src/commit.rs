//! Commit model.
//!
//! A commit travels through the log as opaque JSON text. The engine only ever
//! needs its `parent` pointer; the text transform additionally reads the edit
//! list:
//! ```text
//! {
//!   "clientID": 1700000000000,
//!   "parent":   4,
//!   "diff": [
//!     { "type": "Insert", "index": 3, "val": "abc" },
//!     { "type": "Delete", "index": 9, "size": 2 }
//!   ]
//! }
//! ```
//! Op indices are character offsets into the text at `parent`. Ops are sorted
//! by index and never overlap.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque serialized edit. Equality is byte equality of the JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Commit(String);

impl Commit {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Placeholder stored at index 0 of every history.
    pub fn sentinel() -> Self {
        Self(String::new())
    }

    pub fn is_sentinel(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The `{parent}` projection.
    pub fn partial(&self) -> Result<PartialCommit, CommitError> {
        Ok(serde_json::from_str(&self.0)?)
    }

    pub fn parent(&self) -> Result<usize, CommitError> {
        self.partial().map(|p| p.parent)
    }

    /// Full structured view used by the text transform.
    pub fn body(&self) -> Result<CommitBody, CommitError> {
        Ok(serde_json::from_str(&self.0)?)
    }

    pub fn from_body(body: &CommitBody) -> Result<Self, CommitError> {
        Ok(Self(serde_json::to_string(body)?))
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Commit {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for Commit {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Just enough of a commit to place it in a history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PartialCommit {
    pub parent: usize,
}

/// One edit against a base text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EditOp {
    Insert { index: usize, val: String },
    Delete { index: usize, size: usize },
}

impl EditOp {
    pub fn index(&self) -> usize {
        match self {
            EditOp::Insert { index, .. } | EditOp::Delete { index, .. } => *index,
        }
    }
}

/// Structured commit. Unknown fields are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitBody {
    #[serde(rename = "clientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<i64>,
    pub parent: usize,
    #[serde(default)]
    pub diff: Vec<EditOp>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CommitBody {
    pub fn new(parent: usize, diff: Vec<EditOp>) -> Self {
        Self {
            client_id: None,
            parent,
            diff,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_client(mut self, client_id: i64) -> Self {
        self.client_id = Some(client_id);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("Malformed commit: {0}")]
    Malformed(#[from] serde_json::Error),
}
