//! Background persistence: periodically writes every document whose
//! head or last-written stamp moved since the previous flush, together with
//! the log position those documents reflect.
//!
//! ```text
//!   startup:   DocumentStore::load_all ──► StateSource::install
//!              DocumentStore::load_checkpoint ──► caller (Replica::resume)
//!   every 5s:  StateSource::capture ──► changed only ──► DocumentStore::save
//!   shutdown:  one final flush
//! ```
//!
//! A failed flush is logged and retried on the next tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use pad_core::{DocumentEngine, DocumentSnapshot};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::rocks::{DocumentStore, ReplicaCheckpoint, StoreError};

/// Where the worker reads state from and restores it into.
pub trait StateSource: Send + Sync {
    /// Every document, plus the log position they reflect if there is one.
    fn capture(&self) -> (BTreeMap<String, DocumentSnapshot>, Option<ReplicaCheckpoint>);

    /// Install persisted documents. Returns how many were taken.
    fn install(&self, docs: Vec<DocumentSnapshot>) -> usize;
}

impl StateSource for DocumentEngine {
    fn capture(&self) -> (BTreeMap<String, DocumentSnapshot>, Option<ReplicaCheckpoint>) {
        (self.snapshot(), None)
    }

    fn install(&self, docs: Vec<DocumentSnapshot>) -> usize {
        self.restore(docs)
    }
}

/// Worker statistics.
#[derive(Debug, Clone, Default)]
pub struct PersistenceStats {
    pub flushes: u64,
    pub documents_saved: u64,
    pub checkpoints_saved: u64,
    pub save_errors: u64,
}

#[derive(Default)]
struct Counters {
    flushes: AtomicU64,
    saved: AtomicU64,
    checkpoints: AtomicU64,
    errors: AtomicU64,
}

pub struct PersistenceWorker {
    source: Arc<dyn StateSource>,
    store: Arc<DocumentStore>,
    interval: Duration,
    /// `(head, last_written)` of each document as of its last successful save.
    flushed: Mutex<HashMap<String, (usize, Option<u64>)>>,
    /// Last checkpoint written.
    checkpoint: Mutex<Option<ReplicaCheckpoint>>,
    counters: Counters,
}

impl PersistenceWorker {
    pub fn new(source: Arc<dyn StateSource>, store: Arc<DocumentStore>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            source,
            store,
            interval,
            flushed: Mutex::new(HashMap::new()),
            checkpoint: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Load every stored document into the source. Returns the stored
    /// checkpoint, if any.
    pub fn restore(&self) -> Result<Option<ReplicaCheckpoint>, StoreError> {
        let snapshots = self.store.load_all()?;
        let checkpoint = self.store.load_checkpoint()?;
        let total = snapshots.len();
        {
            let mut flushed = self.flushed.lock();
            for snapshot in &snapshots {
                flushed.insert(snapshot.name.clone(), (snapshot.head(), snapshot.last_written));
            }
        }
        *self.checkpoint.lock() = checkpoint.clone();
        let restored = self.source.install(snapshots);
        info!(
            "Recovery complete: {restored}/{total} documents restored, log position {:?}",
            checkpoint.as_ref().and_then(|c| c.last_applied)
        );
        Ok(checkpoint)
    }

    /// Save every document written since its last save, and the checkpoint
    /// if it moved, in one batch. Returns how many documents were saved.
    pub fn flush(&self) -> Result<usize, StoreError> {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        let (docs, checkpoint) = self.source.capture();

        let changed: Vec<DocumentSnapshot> = {
            let flushed = self.flushed.lock();
            docs.into_values()
                .filter(|snapshot| snapshot.last_written.is_some())
                .filter(|snapshot| {
                    flushed.get(&snapshot.name) != Some(&(snapshot.head(), snapshot.last_written))
                })
                .collect()
        };
        let checkpoint = checkpoint.filter(|c| self.checkpoint.lock().as_ref() != Some(c));
        if changed.is_empty() && checkpoint.is_none() {
            return Ok(0);
        }

        if let Err(e) = self.store.save(&changed, checkpoint.as_ref()) {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to persist {} documents: {e}", changed.len());
            return Err(e);
        }

        {
            let mut flushed = self.flushed.lock();
            for snapshot in &changed {
                flushed.insert(snapshot.name.clone(), (snapshot.head(), snapshot.last_written));
            }
        }
        if let Some(checkpoint) = checkpoint {
            self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
            *self.checkpoint.lock() = Some(checkpoint);
        }
        let saved = changed.len();
        self.counters.saved.fetch_add(saved as u64, Ordering::Relaxed);
        if saved > 0 {
            debug!("Persisted {saved} documents");
        }
        Ok(saved)
    }

    /// Flush on every tick until `shutdown` flips, then flush once more.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        info!("Persistence worker started (every {:?})", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush() {
                        warn!("Periodic flush failed, retrying in {:?}: {e}", self.interval);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        match self.flush().and_then(|saved| self.store.sync().map(|_| saved)) {
            Ok(saved) => info!("Persistence worker stopped ({saved} documents in final flush)"),
            Err(e) => error!("Final flush failed: {e}"),
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            documents_saved: self.counters.saved.load(Ordering::Relaxed),
            checkpoints_saved: self.counters.checkpoints.load(Ordering::Relaxed),
            save_errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}
