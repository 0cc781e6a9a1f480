//! Replicated log entries.
//!
//! Every decided slot holds exactly one [`Operation`]:
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────────────┐
//! │ id (63-bit)  │ kind                                                 │
//! ├──────────────┼──────────────────────────────────────────────────────┤
//! │ random       │ Put  { doc, commit, at }                             │
//! │ random       │ Sync { from, docs, reply_to: None }       announce   │
//! │ random       │ Sync { from, docs, reply_to: Some(id) }   reply      │
//! │ -1 / random  │ Noop                                                 │
//! └──────────────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! The id lets a proposer recognise its own value once the slot is decided.
//! Entries travel inside Paxos frames, so they stay plain serde data (no
//! flattened or untagged fields) for bincode.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use pad_core::{Commit, DocumentSnapshot};
use pad_paxos::{PeerId, ProtocolError, Seq};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Identifier carried by every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub i64);

impl OperationId {
    /// Shared by every untagged no-op; never matches a random id.
    pub const NOOP: OperationId = OperationId(-1);

    /// Fresh random non-negative 63-bit id.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(0..i64::MAX))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Append a commit to a named document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutArgs {
    pub doc: String,
    pub commit: Commit,
    /// Proposer's wall clock (ms since epoch); becomes the write stamp.
    pub at: u64,
}

/// A put as remembered by the duplicate filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedPut {
    pub doc: String,
    pub commit: Commit,
    pub seq: Seq,
}

/// A peer's full document state.
///
/// A peer announces itself with `reply_to: None`; every serving peer answers
/// with its own state as of the announcement, naming the announcement's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncArgs {
    pub from: PeerId,
    pub docs: BTreeMap<String, DocumentSnapshot>,
    pub reply_to: Option<OperationId>,
    /// Id of the entry in slot 0 of the log the sender follows.
    pub log_id: Option<OperationId>,
    /// Recently applied puts (replies only).
    pub recent: Vec<AppliedPut>,
}

impl SyncArgs {
    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Put(PutArgs),
    Sync(SyncArgs),
    Noop,
}

/// One log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OpKind,
}

impl Operation {
    pub fn put(doc: impl Into<String>, commit: Commit) -> Self {
        Self {
            id: OperationId::random(),
            kind: OpKind::Put(PutArgs {
                doc: doc.into(),
                commit,
                at: now_millis(),
            }),
        }
    }

    /// Announcement of `from`'s documents.
    pub fn sync(from: PeerId, docs: BTreeMap<String, DocumentSnapshot>) -> Self {
        Self {
            id: OperationId::random(),
            kind: OpKind::Sync(SyncArgs {
                from,
                docs,
                reply_to: None,
                log_id: None,
                recent: Vec::new(),
            }),
        }
    }

    /// `from`'s answer to the announcement `request`.
    pub fn reply(
        from: PeerId,
        request: OperationId,
        docs: BTreeMap<String, DocumentSnapshot>,
        recent: Vec<AppliedPut>,
    ) -> Self {
        Self {
            id: OperationId::random(),
            kind: OpKind::Sync(SyncArgs {
                from,
                docs,
                reply_to: Some(request),
                log_id: None,
                recent,
            }),
        }
    }

    /// Set the log identity a Sync carries. Other kinds are unchanged.
    pub fn with_log_id(mut self, log_id: Option<OperationId>) -> Self {
        if let OpKind::Sync(args) = &mut self.kind {
            args.log_id = log_id;
        }
        self
    }

    pub fn noop() -> Self {
        Self {
            id: OperationId::NOOP,
            kind: OpKind::Noop,
        }
    }

    /// No-op with its own id, so its proposer can tell whether it won.
    pub fn tagged_noop() -> Self {
        Self {
            id: OperationId::random(),
            kind: OpKind::Noop,
        }
    }

    /// Short kind name for logs.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            OpKind::Put(_) => "Put",
            OpKind::Sync(args) if args.is_reply() => "SyncReply",
            OpKind::Sync(_) => "Sync",
            OpKind::Noop => "Noop",
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.kind, OpKind::Noop)
    }

    /// Serialize with the same codec the RPC frames use.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        pad_paxos::protocol::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        pad_paxos::protocol::decode(bytes)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::Put(args) => write!(f, "{} Put({})", self.id, args.doc),
            OpKind::Sync(args) => match args.reply_to {
                None => write!(f, "{} Sync(peer {}, {} docs)", self.id, args.from, args.docs.len()),
                Some(request) => write!(
                    f,
                    "{} SyncReply(peer {} to {request}, {} docs)",
                    self.id,
                    args.from,
                    args.docs.len()
                ),
            },
            OpKind::Noop => write!(f, "Noop"),
        }
    }
}
