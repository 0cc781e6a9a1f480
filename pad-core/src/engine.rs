//! Document engine: name → document routing over a shared text transform.
//!
//! Documents are created lazily on first reference. The engine lock only
//! guards the map; all per-document work runs under that document's lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::RwLock;

use crate::commit::Commit;
use crate::document::{Document, DocumentError, DocumentSnapshot};
use crate::transform::{OtTransform, TextTransform};

/// Engine statistics.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub documents: usize,
    pub commits_applied: u64,
    pub commits_rejected: u64,
    pub documents_replaced: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    rejected: AtomicU64,
    replaced: AtomicU64,
}

/// All documents held by one replica.
pub struct DocumentEngine {
    docs: RwLock<HashMap<String, Arc<Document>>>,
    transform: Arc<dyn TextTransform>,
    counters: Counters,
}

impl DocumentEngine {
    pub fn new(transform: Arc<dyn TextTransform>) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            transform,
            counters: Counters::default(),
        }
    }

    /// Engine backed by the native [`OtTransform`].
    pub fn with_native_transform() -> Self {
        Self::new(Arc::new(OtTransform::new()))
    }

    pub fn transform(&self) -> &Arc<dyn TextTransform> {
        &self.transform
    }

    /// Existing document or a fresh empty one.
    pub fn document(&self, name: &str) -> Arc<Document> {
        if let Some(doc) = self.docs.read().get(name) {
            return Arc::clone(doc);
        }
        let mut docs = self.docs.write();
        Arc::clone(docs.entry(name.to_string()).or_insert_with(|| {
            debug!("Created document '{name}'");
            Arc::new(Document::new(name))
        }))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Document>> {
        self.docs.read().get(name).cloned()
    }

    /// Rebase and append `commit` to `name`. `stamp` (wall-clock ms of the
    /// put) becomes the document's last-written mark, bumped if needed so it
    /// never goes backwards.
    pub fn submit(&self, name: &str, commit: Commit, stamp: u64) -> Result<Commit, DocumentError> {
        let doc = self.document(name);
        let result = doc.submit(commit, self.transform.as_ref(), stamp);
        match &result {
            Ok(_) => self.counters.applied.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.rejected.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Commit `version` of `name`, waiting until it is appended.
    pub async fn read(&self, name: &str, version: usize) -> Result<Commit, DocumentError> {
        let doc = self.document(name);
        doc.read(version).await
    }

    /// `(head, text)` of `name`.
    pub fn get_state(&self, name: &str) -> (usize, String) {
        self.document(name).state()
    }

    /// Images of every document, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, DocumentSnapshot> {
        let docs: Vec<Arc<Document>> = self.docs.read().values().cloned().collect();
        docs.iter()
            .map(|doc| (doc.name().to_string(), doc.snapshot()))
            .collect()
    }

    /// Fold a peer's snapshots in: unknown documents are adopted, known ones
    /// are replaced only by a more recently written image. Returns how many
    /// documents changed.
    pub fn merge(&self, snapshots: &BTreeMap<String, DocumentSnapshot>) -> usize {
        let mut changed = 0;
        for (name, snapshot) in snapshots {
            let replaced = match self.get(name) {
                Some(doc) => doc.merge_newer(snapshot),
                None => {
                    let mut docs = self.docs.write();
                    match docs.get(name) {
                        // Created by a put since the lookup above.
                        Some(doc) => doc.merge_newer(snapshot),
                        None => {
                            let mut adopted = snapshot.clone();
                            adopted.id = crate::document::random_id();
                            adopted.name = name.clone();
                            docs.insert(name.clone(), Arc::new(Document::from_snapshot(adopted)));
                            true
                        }
                    }
                }
            };
            if replaced {
                changed += 1;
            }
        }
        self.counters.replaced.fetch_add(changed as u64, Ordering::Relaxed);
        if changed > 0 {
            info!("Merged {changed}/{} synced documents", snapshots.len());
        }
        changed
    }

    /// Take every image as is, whatever its stamp: known documents are
    /// overwritten in place, unknown ones adopted under a fresh id. Returns
    /// how many documents were written.
    pub fn adopt(&self, snapshots: &BTreeMap<String, DocumentSnapshot>) -> usize {
        let mut docs = self.docs.write();
        for (name, snapshot) in snapshots {
            match docs.get(name) {
                Some(doc) => doc.replace(snapshot),
                None => {
                    let mut adopted = snapshot.clone();
                    adopted.id = crate::document::random_id();
                    adopted.name = name.clone();
                    docs.insert(name.clone(), Arc::new(Document::from_snapshot(adopted)));
                }
            }
        }
        self.counters.replaced.fetch_add(snapshots.len() as u64, Ordering::Relaxed);
        info!("Adopted {} documents", snapshots.len());
        snapshots.len()
    }

    /// Install persisted documents, keeping their ids. Documents already in
    /// memory are only replaced by newer images.
    pub fn restore(&self, snapshots: Vec<DocumentSnapshot>) -> usize {
        let mut restored = 0;
        for snapshot in snapshots {
            let mut docs = self.docs.write();
            match docs.get(&snapshot.name) {
                Some(doc) => {
                    if doc.merge_newer(&snapshot) {
                        restored += 1;
                    }
                }
                None => {
                    docs.insert(snapshot.name.clone(), Arc::new(Document::from_snapshot(snapshot)));
                    restored += 1;
                }
            }
        }
        restored
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.docs.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            documents: self.len(),
            commits_applied: self.counters.applied.load(Ordering::Relaxed),
            commits_rejected: self.counters.rejected.load(Ordering::Relaxed),
            documents_replaced: self.counters.replaced.load(Ordering::Relaxed),
        }
    }
}

impl Default for DocumentEngine {
    fn default() -> Self {
        Self::with_native_transform()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{CommitBody, EditOp};

    fn insert(parent: usize, index: usize, val: &str) -> Commit {
        Commit::from_body(&CommitBody::new(
            parent,
            vec![EditOp::Insert { index, val: val.to_string() }],
        ))
        .unwrap()
    }

    #[test]
    fn test_documents_created_lazily() {
        let engine = DocumentEngine::default();
        assert!(engine.is_empty());
        assert_eq!(engine.get_state("a"), (0, String::new()));
        assert_eq!(engine.len(), 1);
        assert!(Arc::ptr_eq(&engine.document("a"), &engine.document("a")));
    }

    #[test]
    fn test_documents_are_isolated() {
        let engine = DocumentEngine::default();
        engine.submit("a", insert(0, 0, "alpha"), 0).unwrap();
        engine.submit("b", insert(0, 0, "beta"), 1).unwrap();
        assert_eq!(engine.get_state("a"), (1, "alpha".to_string()));
        assert_eq!(engine.get_state("b"), (1, "beta".to_string()));

        // A halted document does not affect its neighbours.
        assert!(engine.submit("a", insert(9, 0, "x"), 2).is_err());
        engine.submit("b", insert(1, 4, "!"), 3).unwrap();
        assert_eq!(engine.get_state("b").1, "beta!");
        assert_eq!(engine.stats().commits_rejected, 1);
        assert_eq!(engine.stats().commits_applied, 3);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let engine = DocumentEngine::default();
        for name in ["zeta", "alpha", "mid"] {
            engine.document(name);
        }
        let names: Vec<_> = engine.snapshot().into_keys().collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert_eq!(engine.names(), names);
    }

    #[test]
    fn test_merge_adopts_and_prefers_newer() {
        let a = DocumentEngine::default();
        a.submit("shared", insert(0, 0, "from a"), 10).unwrap();
        a.submit("only-a", insert(0, 0, "a"), 11).unwrap();

        let b = DocumentEngine::default();
        b.submit("shared", insert(0, 0, "from b"), 4).unwrap();

        assert_eq!(b.merge(&a.snapshot()), 2);
        assert_eq!(b.get_state("shared").1, "from a");
        assert_eq!(b.get_state("only-a").1, "a");
        assert_ne!(b.document("only-a").id(), a.document("only-a").id());

        // Nothing newer the second time.
        assert_eq!(b.merge(&a.snapshot()), 0);
        assert_eq!(b.stats().documents_replaced, 2);
    }

    #[test]
    fn test_adopt_ignores_stamps() {
        let current = DocumentEngine::default();
        current.submit("doc", insert(0, 0, "current"), 1).unwrap();
        current.submit("other", insert(0, 0, "o"), 2).unwrap();

        let stale = DocumentEngine::default();
        stale.submit("doc", insert(0, 0, "ahead of time"), 50).unwrap();
        let id = stale.document("doc").id();

        assert_eq!(stale.merge(&current.snapshot()), 1);
        assert_eq!(stale.get_state("doc").1, "ahead of time");

        assert_eq!(stale.adopt(&current.snapshot()), 2);
        assert_eq!(stale.get_state("doc"), (1, "current".to_string()));
        assert_eq!(stale.document("doc").id(), id);
        assert_eq!(stale.document("doc").last_written(), Some(1));
        assert_eq!(stale.get_state("other").1, "o");
    }

    #[test]
    fn test_restore_keeps_ids() {
        let a = DocumentEngine::default();
        a.submit("doc", insert(0, 0, "persisted"), 3).unwrap();
        let snaps: Vec<_> = a.snapshot().into_values().collect();

        let b = DocumentEngine::default();
        assert_eq!(b.restore(snaps), 1);
        assert_eq!(b.document("doc").id(), a.document("doc").id());
        assert_eq!(b.get_state("doc"), (1, "persisted".to_string()));
    }

    #[tokio::test]
    async fn test_read_through_engine() {
        let engine = Arc::new(DocumentEngine::default());
        let reader = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.read("doc", 1).await })
        };
        tokio::task::yield_now().await;
        let stored = engine.submit("doc", insert(0, 0, "x"), 0).unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), stored);
    }
}
