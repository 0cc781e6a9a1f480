//! A single replicated document: commit history, materialized text and the
//! readers waiting for versions that do not exist yet.
//!
//! ```text
//!   commits: [ sentinel │ c1 │ c2 │ ... │ cN ]      head = N
//!                                          ▲
//!   submit(c, parent=p): rebase c over c(p+1)..cN, apply, append
//!   read(v > N): park a oneshot under v, woken when cN+… reaches v
//! ```
//!
//! Every mutation happens under the document's own lock; waiters are
//! registered under it but awaited after it is released.

use std::collections::BTreeMap;

use log::{debug, error};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::commit::{Commit, CommitError};
use crate::transform::{TextTransform, TransformError};

/// Random 63-bit document identifier (distinct from the name).
pub type DocumentId = i64;

pub(crate) fn random_id() -> DocumentId {
    rand::thread_rng().gen_range(0..i64::MAX)
}

/// Errors from document operations.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// The commit names a parent this history does not have.
    #[error("Document '{doc}': parent {parent} is beyond history of length {len}")]
    InvalidParent { doc: String, parent: usize, len: usize },

    /// Folding through the newer commits did not reach head.
    #[error("Document '{doc}': rebased parent {parent} does not match head {head}")]
    IncompleteRebase { doc: String, parent: usize, head: usize },

    /// An earlier fatal error halted this document.
    #[error("Document '{doc}' is halted: {reason}")]
    Poisoned { doc: String, reason: String },

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    /// The document was dropped while a reader was waiting.
    #[error("Document '{0}' closed while waiting")]
    Closed(String),
}

impl DocumentError {
    /// Invariant violations that halt the document on every replica.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DocumentError::InvalidParent { .. }
                | DocumentError::IncompleteRebase { .. }
                | DocumentError::Poisoned { .. }
        )
    }
}

/// Serializable image of a document (persistence and sync payload).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub id: DocumentId,
    pub name: String,
    pub text: String,
    /// Write stamp of the last applied put, `None` if never written.
    /// Strictly increases with every put to this document.
    pub last_written: Option<u64>,
    pub commits: Vec<Commit>,
}

impl DocumentSnapshot {
    pub fn head(&self) -> usize {
        self.commits.len().saturating_sub(1)
    }
}

struct DocState {
    commits: Vec<Commit>,
    text: String,
    last_written: Option<u64>,
    waiters: BTreeMap<usize, Vec<oneshot::Sender<Commit>>>,
    poisoned: Option<String>,
}

impl DocState {
    fn install(&mut self, snapshot: DocumentSnapshot) {
        self.commits = if snapshot.commits.is_empty() {
            vec![Commit::sentinel()]
        } else {
            snapshot.commits
        };
        self.text = snapshot.text;
        self.last_written = snapshot.last_written;
        self.poisoned = None;
        self.release_ready();
    }

    /// Hand every now-available version to its waiters.
    fn release_ready(&mut self) {
        let pending = self.waiters.split_off(&self.commits.len());
        let ready = std::mem::replace(&mut self.waiters, pending);
        for (version, senders) in ready {
            let commit = &self.commits[version];
            for tx in senders {
                let _ = tx.send(commit.clone());
            }
        }
    }
}

/// One collaborative document.
pub struct Document {
    id: DocumentId,
    name: String,
    state: Mutex<DocState>,
}

impl Document {
    /// Empty document holding only the sentinel commit.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(random_id(), name)
    }

    pub fn with_id(id: DocumentId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            state: Mutex::new(DocState {
                commits: vec![Commit::sentinel()],
                text: String::new(),
                last_written: None,
                waiters: BTreeMap::new(),
                poisoned: None,
            }),
        }
    }

    pub fn from_snapshot(snapshot: DocumentSnapshot) -> Self {
        let doc = Self::with_id(snapshot.id, snapshot.name.clone());
        doc.state.lock().install(snapshot);
        doc
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rebase `commit` to head, apply it, append it and wake readers of the
    /// new version. Returns the commit as stored.
    ///
    /// The new write stamp is `stamp`, or one past the previous stamp when
    /// `stamp` does not exceed it.
    pub fn submit(
        &self,
        commit: Commit,
        transform: &dyn TextTransform,
        stamp: u64,
    ) -> Result<Commit, DocumentError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.poisoned {
            return Err(DocumentError::Poisoned {
                doc: self.name.clone(),
                reason: reason.clone(),
            });
        }

        let len = state.commits.len();
        let parent = commit.parent()?;
        if parent >= len {
            return Err(self.poison(&mut state, DocumentError::InvalidParent {
                doc: self.name.clone(),
                parent,
                len,
            }));
        }

        let mut rebased = commit;
        for existing in &state.commits[parent + 1..] {
            rebased = transform.rebase(existing, &rebased)?;
        }

        let head = len - 1;
        let rebased_parent = rebased.parent()?;
        if rebased_parent != head {
            return Err(self.poison(&mut state, DocumentError::IncompleteRebase {
                doc: self.name.clone(),
                parent: rebased_parent,
                head,
            }));
        }

        state.text = transform.apply_diff(&state.text, &rebased)?;
        state.commits.push(rebased.clone());
        state.last_written = Some(next_stamp(state.last_written, stamp));
        state.release_ready();
        debug!("Document '{}': appended version {} (from parent {parent})", self.name, len);
        Ok(rebased)
    }

    fn poison(&self, state: &mut DocState, err: DocumentError) -> DocumentError {
        error!("{err}");
        state.poisoned = Some(err.to_string());
        err
    }

    /// Commit at `version`, waiting until it exists.
    pub async fn read(&self, version: usize) -> Result<Commit, DocumentError> {
        let rx = {
            let mut state = self.state.lock();
            if let Some(commit) = state.commits.get(version) {
                return Ok(commit.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(version).or_default().push(tx);
            rx
        };
        rx.await.map_err(|_| DocumentError::Closed(self.name.clone()))
    }

    /// `(head index, text)`.
    pub fn state(&self) -> (usize, String) {
        let state = self.state.lock();
        (state.commits.len() - 1, state.text.clone())
    }

    pub fn head(&self) -> usize {
        self.state.lock().commits.len() - 1
    }

    pub fn last_written(&self) -> Option<u64> {
        self.state.lock().last_written
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned.is_some()
    }

    /// Number of readers currently parked.
    pub fn waiting_readers(&self) -> usize {
        self.state.lock().waiters.values().map(Vec::len).sum()
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        let state = self.state.lock();
        DocumentSnapshot {
            id: self.id,
            name: self.name.clone(),
            text: state.text.clone(),
            last_written: state.last_written,
            commits: state.commits.clone(),
        }
    }

    /// Take `other`'s content if it was written more recently. Returns whether
    /// anything changed.
    pub fn merge_newer(&self, other: &DocumentSnapshot) -> bool {
        let mut state = self.state.lock();
        let newer = state.last_written < other.last_written;
        if newer {
            state.install(other.clone());
        }
        newer
    }

    /// Take `other`'s content whatever its stamp.
    pub fn replace(&self, other: &DocumentSnapshot) {
        self.state.lock().install(other.clone());
    }
}

fn next_stamp(previous: Option<u64>, stamp: u64) -> u64 {
    match previous {
        Some(prev) if prev >= stamp => prev.saturating_add(1),
        _ => stamp,
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (head, _) = self.state();
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("head", &head)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{CommitBody, EditOp};
    use crate::transform::OtTransform;
    use std::sync::Arc;
    use std::time::Duration;

    fn insert(parent: usize, index: usize, val: &str) -> Commit {
        Commit::from_body(&CommitBody::new(
            parent,
            vec![EditOp::Insert { index, val: val.to_string() }],
        ))
        .unwrap()
    }

    #[test]
    fn test_new_document_has_sentinel() {
        let doc = Document::new("d");
        assert_eq!(doc.state(), (0, String::new()));
        assert!(doc.id() >= 0);
        assert_eq!(doc.last_written(), None);
    }

    #[test]
    fn test_submit_at_head() {
        let doc = Document::new("d");
        let t = OtTransform::new();
        let stored = doc.submit(insert(0, 0, "hello"), &t, 7).unwrap();
        assert_eq!(stored.parent().unwrap(), 0);
        assert_eq!(doc.state(), (1, "hello".to_string()));
        assert_eq!(doc.last_written(), Some(7));
    }

    #[test]
    fn test_submit_behind_head_is_rebased() {
        let doc = Document::new("doc1");
        let t = OtTransform::new();
        doc.submit(insert(0, 0, "world"), &t, 1).unwrap();
        let stored = doc.submit(insert(0, 0, "hello "), &t, 2).unwrap();
        assert_eq!(stored.parent().unwrap(), 1);
        // existing insert wins the tie at index 0
        assert_eq!(doc.state(), (2, "worldhello ".to_string()));
    }

    #[test]
    fn test_invalid_parent_poisons() {
        let doc = Document::new("d");
        let t = OtTransform::new();
        let err = doc.submit(insert(3, 0, "x"), &t, 1).unwrap_err();
        assert!(matches!(err, DocumentError::InvalidParent { parent: 3, len: 1, .. }));
        assert!(err.is_fatal());
        assert!(doc.is_poisoned());

        let again = doc.submit(insert(0, 0, "x"), &t, 2).unwrap_err();
        assert!(matches!(again, DocumentError::Poisoned { .. }));
    }

    #[test]
    fn test_malformed_commit_is_rejected_not_fatal() {
        let doc = Document::new("d");
        let t = OtTransform::new();
        let err = doc.submit(Commit::new("garbage"), &t, 1).unwrap_err();
        assert!(!err.is_fatal());
        assert!(!doc.is_poisoned());

        let out_of_range = insert(0, 5, "x");
        let err = doc.submit(out_of_range, &t, 2).unwrap_err();
        assert!(matches!(err, DocumentError::Transform(TransformError::OutOfRange { .. })));
        assert_eq!(doc.head(), 0);
    }

    struct NoBump;

    impl TextTransform for NoBump {
        fn diff(&self, _: &str, _: &str) -> Vec<EditOp> {
            Vec::new()
        }
        fn rebase(&self, _existing: &Commit, incoming: &Commit) -> Result<Commit, TransformError> {
            Ok(incoming.clone())
        }
        fn apply_diff(&self, text: &str, _: &Commit) -> Result<String, TransformError> {
            Ok(text.to_string())
        }
    }

    #[test]
    fn test_incomplete_rebase_poisons() {
        let doc = Document::new("d");
        doc.submit(insert(0, 0, "a"), &NoBump, 1).unwrap();
        let err = doc.submit(insert(0, 0, "b"), &NoBump, 2).unwrap_err();
        assert!(matches!(err, DocumentError::IncompleteRebase { parent: 0, head: 1, .. }));
        assert!(doc.is_poisoned());
    }

    #[tokio::test]
    async fn test_read_existing_version() {
        let doc = Document::new("d");
        assert!(doc.read(0).await.unwrap().is_sentinel());
    }

    #[tokio::test]
    async fn test_read_blocks_until_appended() {
        let doc = Arc::new(Document::new("d"));
        let reader = {
            let doc = Arc::clone(&doc);
            tokio::spawn(async move { doc.read(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(doc.waiting_readers(), 1);

        let t = OtTransform::new();
        doc.submit(insert(0, 0, "a"), &t, 1).unwrap();
        assert_eq!(doc.waiting_readers(), 1);
        let second = doc.submit(insert(1, 1, "b"), &t, 2).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, second);
        assert_eq!(doc.waiting_readers(), 0);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let doc = Document::new("d");
        let t = OtTransform::new();
        doc.submit(insert(0, 0, "abc"), &t, 4).unwrap();
        let snap = doc.snapshot();
        assert_eq!(snap.head(), 1);
        let copy = Document::from_snapshot(snap.clone());
        assert_eq!(copy.id(), doc.id());
        assert_eq!(copy.snapshot(), snap);
    }

    #[test]
    fn test_merge_keeps_newer() {
        let t = OtTransform::new();
        let a = Document::new("d");
        a.submit(insert(0, 0, "old"), &t, 3).unwrap();
        let b = Document::new("d");
        b.submit(insert(0, 0, "new"), &t, 9).unwrap();

        assert!(!b.merge_newer(&a.snapshot()));
        assert_eq!(b.state().1, "new");
        assert!(a.merge_newer(&b.snapshot()));
        assert_eq!(a.state().1, "new");
        assert_eq!(a.last_written(), Some(9));
    }

    #[test]
    fn test_stamp_only_moves_forward() {
        let t = OtTransform::new();
        let doc = Document::new("d");
        doc.submit(insert(0, 0, "a"), &t, 1_000).unwrap();
        // A writer whose clock is behind still advances the stamp.
        doc.submit(insert(1, 1, "b"), &t, 400).unwrap();
        assert_eq!(doc.last_written(), Some(1_001));
        doc.submit(insert(2, 2, "c"), &t, 5_000).unwrap();
        assert_eq!(doc.last_written(), Some(5_000));
    }

    #[test]
    fn test_merge_decided_by_stamp_not_history_length() {
        let t = OtTransform::new();
        // Longer history written earlier.
        let long = Document::new("d");
        for (i, c) in ["a", "b", "c"].iter().enumerate() {
            long.submit(insert(i, i, c), &t, 100 + i as u64).unwrap();
        }
        // Shorter history written later, e.g. after a restart reused low slots.
        let short = Document::new("d");
        short.submit(insert(0, 0, "z"), &t, 900).unwrap();

        assert!(!short.merge_newer(&long.snapshot()));
        assert!(long.merge_newer(&short.snapshot()));
        assert_eq!(long.state(), (1, "z".to_string()));
    }

    #[test]
    fn test_merge_never_overwrites_a_concurrent_newer_write() {
        let t = OtTransform::new();
        let stale = Document::new("d");
        stale.submit(insert(0, 0, "stale"), &t, 10).unwrap();
        let stale = stale.snapshot();

        let doc = Arc::new(Document::new("d"));
        let writer = {
            let doc = Arc::clone(&doc);
            std::thread::spawn(move || {
                let t = OtTransform::new();
                for i in 0..200 {
                    doc.submit(insert(i, i, "x"), &t, 11 + i as u64).unwrap();
                }
            })
        };
        let mergers: Vec<_> = (0..4)
            .map(|_| {
                let doc = Arc::clone(&doc);
                let stale = stale.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        doc.merge_newer(&stale);
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for m in mergers {
            m.join().unwrap();
        }

        // The stale image may only land before the first put; no put is lost.
        let snap = doc.snapshot();
        assert_eq!(snap.last_written, Some(210));
        assert_eq!(snap.text.chars().filter(|c| *c == 'x').count(), 200);
        assert!(!doc.is_poisoned());
    }

    #[tokio::test]
    async fn test_merge_releases_waiters() {
        let t = OtTransform::new();
        let src = Document::new("d");
        src.submit(insert(0, 0, "x"), &t, 5).unwrap();

        let dst = Arc::new(Document::new("d"));
        let reader = {
            let dst = Arc::clone(&dst);
            tokio::spawn(async move { dst.read(1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        dst.merge_newer(&src.snapshot());
        let got = reader.await.unwrap().unwrap();
        assert_eq!(got.parent().unwrap(), 0);
    }
}
