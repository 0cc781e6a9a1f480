//! Replicated state machine driver: turns decided log slots into document
//! mutations, strictly in slot order.
//!
//! ```text
//!   client ── propose(op) ──► start(max+1) ──► wait_till_decided ──┐
//!                 ▲                                  │ 7 polls     │
//!                 └──── lost the slot, next seq ◄────┤ → start Noop│
//!                                                    ▼             │
//!   run():  status(last_applied+1) ── Decided ──► apply ── done() ─┘
//!                     │                           │
//!                  Pending → sleep                ├── Put   → dedup → DocumentEngine::submit
//!                                                 ├── Sync  → DocumentEngine::merge
//!                                                 │            └─► another peer announcing? reply
//!                                                 └── Noop
//! ```
//!
//! Rejoining after a restart:
//! ```text
//!   checkpoint L, cluster floor F
//!     F <= L+1 ─► replay from L+1 (slots up to L are already in the documents)
//!     F >  L+1 ─► catch-up: skip slots until our Sync lands at q,
//!                 hold slots after q until a reply to it (state as of q)
//!                 arrives, adopt the reply, replay the held slots
//! ```
//!
//! Only the driver loop writes `last_applied`; clients observe it through a
//! watch channel. The ledger lock is held while a slot is applied, so a
//! capture for persistence sees documents and position from the same slot.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use pad_core::{Commit, DocumentEngine, DocumentSnapshot};
use pad_paxos::{Fate, Paxos, PeerId, Seq};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::ReplicaConfig;
use crate::op::{AppliedPut, OpKind, Operation, OperationId, PutArgs, SyncArgs};
use crate::storage::{ReplicaCheckpoint, StateSource};

/// Driver errors.
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("Replica {0} is shutting down")]
    Shutdown(PeerId),
}

/// Counters for observability.
#[derive(Debug, Clone, Default)]
pub struct ReplicaStats {
    pub last_applied: Option<Seq>,
    pub puts_applied: u64,
    pub puts_duplicate: u64,
    pub puts_failed: u64,
    pub syncs_applied: usize,
    pub sync_replies: u64,
    pub noops_applied: u64,
    pub noops_proposed: u64,
    pub slots_skipped: u64,
}

#[derive(Default)]
struct Counters {
    puts: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
    syncs: AtomicU64,
    replies: AtomicU64,
    noops: AtomicU64,
    nudges: AtomicU64,
    skipped: AtomicU64,
}

/// Progress of a peer whose documents are behind the log it rejoined.
enum CatchUp {
    /// Waiting for our Sync to be sequenced; earlier slots are skipped.
    Announcing { request: Option<OperationId> },
    /// Our Sync is in; later slots wait for a reply to it.
    Holding {
        request: OperationId,
        held: Vec<(Seq, Operation)>,
    },
}

/// Log bookkeeping that moves together with the documents.
#[derive(Default)]
struct Ledger {
    /// `(document, commit)` → slot it was first applied at
    seen: HashMap<(String, Commit), Seq>,
    /// Entry in slot 0 of the log being followed
    log_id: Option<OperationId>,
    catch_up: Option<CatchUp>,
    /// This boot's Sync announcement
    announced: Option<OperationId>,
    /// Set once `announced` is applied; only then are other peers answered
    serving: bool,
    /// Cluster floor at the last prune of `seen`
    pruned_at: Seq,
}

impl Ledger {
    fn recent(&self) -> Vec<AppliedPut> {
        let mut recent: Vec<AppliedPut> = self
            .seen
            .iter()
            .map(|((doc, commit), seq)| AppliedPut {
                doc: doc.clone(),
                commit: commit.clone(),
                seq: *seq,
            })
            .collect();
        recent.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.doc.cmp(&b.doc)));
        recent
    }

    fn remember(&mut self, recent: Vec<AppliedPut>) {
        self.seen = recent
            .into_iter()
            .map(|put| ((put.doc, put.commit), put.seq))
            .collect();
    }
}

/// One peer's log interpreter.
pub struct Replica {
    paxos: Arc<Paxos<Operation>>,
    engine: Arc<DocumentEngine>,
    config: ReplicaConfig,
    applied: watch::Sender<Option<Seq>>,
    /// Latest slot at which each peer's Sync was applied
    synced: watch::Sender<BTreeMap<PeerId, Seq>>,
    ledger: Mutex<Ledger>,
    /// Operations being proposed from this peer → slot they were applied at
    placed: Mutex<HashMap<OperationId, Option<Seq>>>,
    counters: Counters,
}

impl Replica {
    pub fn new(
        paxos: Arc<Paxos<Operation>>,
        engine: Arc<DocumentEngine>,
        config: ReplicaConfig,
    ) -> Arc<Self> {
        let (applied, _) = watch::channel(None);
        let (synced, _) = watch::channel(BTreeMap::new());
        Arc::new(Self {
            paxos,
            engine,
            config,
            applied,
            synced,
            ledger: Mutex::new(Ledger::default()),
            placed: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    pub fn paxos(&self) -> &Arc<Paxos<Operation>> {
        &self.paxos
    }

    pub fn engine(&self) -> &Arc<DocumentEngine> {
        &self.engine
    }

    pub fn last_applied(&self) -> Option<Seq> {
        *self.applied.borrow()
    }

    fn next_seq(&self) -> Seq {
        self.last_applied().map_or(0, |s| s + 1)
    }

    /// Id of the entry in slot 0 of the log this peer follows, once known.
    pub fn log_id(&self) -> Option<OperationId> {
        self.ledger.lock().log_id
    }

    pub fn is_catching_up(&self) -> bool {
        self.ledger.lock().catch_up.is_some()
    }

    /// Skip every slot below `floor`: they were released cluster-wide and
    /// their effects arrive through document sync instead.
    pub fn set_floor(&self, floor: Seq) {
        let _ledger = self.ledger.lock();
        self.skip_below(floor);
    }

    /// Caller holds the ledger. Returns whether anything was skipped.
    fn skip_below(&self, floor: Seq) -> bool {
        if floor == 0 || self.next_seq() >= floor {
            return false;
        }
        info!("peer {}: skipping log slots below {floor}", self.paxos.me());
        self.applied.send_replace(Some(floor - 1));
        self.paxos.done(floor - 1);
        true
    }

    // ─── Rejoining ────────────────────────────────────────────────────

    /// Pick up where the stored documents left off.
    ///
    /// `checkpoint` is what the persistence worker restored and `floor` the
    /// cluster's Min(). Slots the checkpoint covers are not replayed. If the
    /// cluster already released slots this peer never applied, the peer
    /// catches up through its Sync (see [`Replica::announcement`]).
    pub async fn resume(&self, checkpoint: Option<ReplicaCheckpoint>, floor: Seq, wait: Duration) {
        let me = self.paxos.me();
        let checkpoint = match checkpoint {
            Some(cp) if cp.last_applied.is_some() => {
                if floor == 0 && !self.same_log(cp.log_id, wait).await {
                    info!(
                        "peer {me}: log restarted since checkpoint at slot {:?}, replaying from slot 0",
                        cp.last_applied
                    );
                    None
                } else {
                    Some(cp)
                }
            }
            _ => None,
        };

        let mut ledger = self.ledger.lock();
        if let Some(cp) = checkpoint {
            ledger.log_id = cp.log_id;
            ledger.remember(cp.recent);
            if let Some(last) = cp.last_applied {
                info!("peer {me}: resuming after slot {last}");
                self.applied.send_replace(Some(last));
                self.paxos.done(last);
            }
        }
        if self.skip_below(floor) {
            warn!("peer {me}: slots below {floor} were released before this peer applied them, catching up through sync");
            ledger.catch_up = Some(CatchUp::Announcing { request: None });
        }
    }

    /// Whether slot 0 still holds `recorded`. A log restarted from scratch
    /// has a different entry there, or nothing until our own marker lands.
    async fn same_log(&self, recorded: Option<OperationId>, wait: Duration) -> bool {
        let marker = Operation::tagged_noop();
        let ours = marker.id;
        self.paxos.start(0, marker);
        let first = tokio::time::timeout(wait, async {
            loop {
                match self.paxos.status(0) {
                    Fate::Decided(op) => return Some(op.id),
                    Fate::Forgotten => return None,
                    Fate::Pending => tokio::time::sleep(self.config.apply_poll).await,
                }
            }
        })
        .await
        .ok()
        .flatten();

        match first {
            Some(id) if id == ours => false,
            Some(id) => recorded.map_or(true, |r| r == id),
            None => true,
        }
    }

    /// This peer's Sync announcement. While catching up, its id is
    /// remembered so the driver knows when it is sequenced.
    pub fn announcement(&self) -> Operation {
        let mut ledger = self.ledger.lock();
        let op = Operation::sync(self.paxos.me(), self.engine.snapshot()).with_log_id(ledger.log_id);
        ledger.announced = Some(op.id);
        if let Some(CatchUp::Announcing { request }) = &mut ledger.catch_up {
            *request = Some(op.id);
        }
        op
    }

    /// Stop catching up without a reply: held slots are applied to the
    /// documents as they are.
    pub fn end_catch_up(self: &Arc<Self>) {
        let mut ledger = self.ledger.lock();
        match ledger.catch_up.take() {
            Some(CatchUp::Holding { held, .. }) => {
                warn!(
                    "peer {}: no sync reply arrived, applying {} held slots to stale documents",
                    self.paxos.me(),
                    held.len()
                );
                for (seq, op) in held {
                    self.execute(&mut ledger, seq, op);
                }
            }
            Some(CatchUp::Announcing { .. }) => {
                warn!("peer {}: gave up catching up before our sync was sequenced", self.paxos.me());
            }
            None => {}
        }
    }

    /// Start catching up from inside the driver after falling behind `floor`.
    fn fall_behind(self: &Arc<Self>, floor: Seq) {
        {
            let mut ledger = self.ledger.lock();
            if !self.skip_below(floor) || ledger.catch_up.is_some() {
                return;
            }
            ledger.catch_up = Some(CatchUp::Announcing { request: None });
        }
        let this = Arc::clone(self);
        let announcement = self.announcement();
        tokio::spawn(async move {
            if let Err(e) = this.propose(announcement).await {
                debug!("catch-up sync abandoned: {e}");
            }
        });
    }

    // ─── Proposing ────────────────────────────────────────────────────

    /// Get `op` into the log. Returns the slot it was decided in.
    ///
    /// Tries the first slot past everything this peer has learned or applied;
    /// a slot won by another value means trying the next one.
    pub async fn propose(&self, op: Operation) -> Result<Seq, ReplicaError> {
        self.placed.lock().insert(op.id, None);
        let placed = self.place(&op).await;
        self.placed.lock().remove(&op.id);
        placed
    }

    async fn place(&self, op: &Operation) -> Result<Seq, ReplicaError> {
        loop {
            if self.paxos.is_dead() {
                return Err(ReplicaError::Shutdown(self.paxos.me()));
            }
            let seq = self.paxos.max().map_or(0, |m| m + 1).max(self.next_seq());
            self.paxos.start(seq, op.clone());
            match self.wait_till_decided(seq).await? {
                Some(decided) if decided.id == op.id => {
                    debug!("peer {}: {op} decided at slot {seq}", self.paxos.me());
                    return Ok(seq);
                }
                Some(decided) => {
                    trace!("peer {}: slot {seq} went to {decided}, retrying", self.paxos.me());
                }
                None => {
                    debug!("peer {}: slot {seq} released before we saw it", self.paxos.me());
                }
            }
            // The driver may have applied it in a slot we stopped watching.
            if let Some(Some(at)) = self.placed.lock().get(&op.id).copied() {
                debug!("peer {}: {op} was already applied at slot {at}", self.paxos.me());
                return Ok(at);
            }
        }
    }

    /// Poll slot `seq` with a doubling wait until it is decided (`Some`) or
    /// released (`None`). After `noop_after` polls a no-op is proposed for the
    /// slot so a stalled proposal cannot hold it forever.
    pub async fn wait_till_decided(&self, seq: Seq) -> Result<Option<Operation>, ReplicaError> {
        let mut shutdown = self.paxos.shutdown_signal();
        let mut polls: u32 = 0;
        loop {
            match self.paxos.status(seq) {
                Fate::Decided(op) => return Ok(Some(op)),
                Fate::Forgotten => return Ok(None),
                Fate::Pending => {}
            }
            if *shutdown.borrow() {
                return Err(ReplicaError::Shutdown(self.paxos.me()));
            }

            let wait = self.config.decide_wait(polls);
            polls = polls.saturating_add(1);
            if polls == self.config.noop_after {
                debug!("peer {}: slot {seq} still open, proposing a no-op", self.paxos.me());
                self.counters.nudges.fetch_add(1, Ordering::Relaxed);
                self.paxos.start(seq, Operation::noop());
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Err(ReplicaError::Shutdown(self.paxos.me()));
                    }
                }
            }
        }
    }

    // ─── Applying ─────────────────────────────────────────────────────

    /// Apply decided slots in order until the consensus peer is killed.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.paxos.shutdown_signal();
        info!("peer {}: log driver started at slot {}", self.paxos.me(), self.next_seq());
        let nudge_every = self.config.noop_after.max(1);
        let mut stalled: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let seq = self.next_seq();
            match self.paxos.status(seq) {
                Fate::Decided(op) => {
                    self.apply(seq, op);
                    stalled = 0;
                    continue;
                }
                Fate::Forgotten => {
                    warn!("peer {}: slot {seq} released before it was applied", self.paxos.me());
                    self.fall_behind(self.paxos.min());
                    stalled = 0;
                    continue;
                }
                Fate::Pending => {}
            }

            // A later slot is known, so this one may have been settled without
            // us hearing the Learn. A no-op proposal recovers the value.
            if self.paxos.max().is_some_and(|m| m > seq) {
                stalled = stalled.saturating_add(1);
                if stalled % nudge_every == 0 {
                    debug!("peer {}: slot {seq} missing behind a later decision, proposing a no-op", self.paxos.me());
                    self.counters.nudges.fetch_add(1, Ordering::Relaxed);
                    self.paxos.start(seq, Operation::noop());
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.apply_poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("peer {}: log driver stopped after slot {:?}", self.paxos.me(), self.last_applied());
    }

    /// Execute one decided slot, then release it.
    fn apply(self: &Arc<Self>, seq: Seq, op: Operation) {
        trace!("peer {}: applying slot {seq}: {op}", self.paxos.me());
        if let Some(slot) = self.placed.lock().get_mut(&op.id) {
            *slot = Some(seq);
        }
        {
            let mut ledger = self.ledger.lock();
            if seq == 0 && ledger.log_id.is_none() && op.id != OperationId::NOOP {
                ledger.log_id = Some(op.id);
            }
            match ledger.catch_up.take() {
                None => self.execute(&mut ledger, seq, op),
                Some(state) => self.step_catch_up(&mut ledger, state, seq, op),
            }
            self.applied.send_replace(Some(seq));
            self.prune(&mut ledger, seq);
        }
        self.paxos.done(seq);
    }

    fn step_catch_up(self: &Arc<Self>, ledger: &mut Ledger, state: CatchUp, seq: Seq, op: Operation) {
        let me = self.paxos.me();
        match state {
            CatchUp::Announcing { request: Some(request) } if request == op.id => {
                debug!("peer {me}: our sync is in at slot {seq}, holding later slots for a reply");
                self.execute(ledger, seq, op);
                ledger.catch_up = Some(CatchUp::Holding { request, held: Vec::new() });
            }
            CatchUp::Announcing { request } => {
                trace!("peer {me}: slot {seq} predates our sync, skipped");
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                ledger.catch_up = Some(CatchUp::Announcing { request });
            }
            CatchUp::Holding { request, mut held } => match op.kind {
                OpKind::Sync(args) if args.reply_to == Some(request) && args.from != me => {
                    let from = args.from;
                    let taken = self.engine.adopt(&args.docs);
                    ledger.remember(args.recent);
                    if args.log_id.is_some() {
                        ledger.log_id = args.log_id;
                    }
                    self.note_sync(from, seq);
                    info!(
                        "peer {me}: caught up from peer {from} at slot {seq} ({taken} documents, {} held slots to replay)",
                        held.len()
                    );
                    for (held_seq, held_op) in held {
                        self.execute(ledger, held_seq, held_op);
                    }
                }
                kind => {
                    held.push((seq, Operation { id: op.id, kind }));
                    ledger.catch_up = Some(CatchUp::Holding { request, held });
                }
            },
        }
    }

    fn execute(self: &Arc<Self>, ledger: &mut Ledger, seq: Seq, op: Operation) {
        match op.kind {
            OpKind::Put(args) => self.apply_put(ledger, seq, args),
            OpKind::Sync(args) => self.apply_sync(ledger, seq, op.id, args),
            OpKind::Noop => {
                self.counters.noops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn apply_put(&self, ledger: &mut Ledger, seq: Seq, args: PutArgs) {
        let PutArgs { doc, commit, at } = args;
        let key = (doc, commit);
        if let Some(first) = ledger.seen.get(&key) {
            if seq.saturating_sub(*first) <= self.config.dedup_window {
                debug!("peer {}: duplicate commit for '{}' at slot {seq} (first at {first})", self.paxos.me(), key.0);
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        ledger.seen.insert(key.clone(), seq);
        let (doc, commit) = key;
        match self.engine.submit(&doc, commit, at) {
            Ok(stored) => {
                self.counters.puts.fetch_add(1, Ordering::Relaxed);
                trace!("peer {}: '{doc}' ← {stored}", self.paxos.me());
            }
            Err(e) if e.is_fatal() => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("peer {}: slot {seq} halted '{doc}': {e}", self.paxos.me());
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("peer {}: slot {seq} commit for '{doc}' rejected: {e}", self.paxos.me());
            }
        }
    }

    fn apply_sync(self: &Arc<Self>, ledger: &mut Ledger, seq: Seq, id: OperationId, args: SyncArgs) {
        let me = self.paxos.me();
        let changed = self.engine.merge(&args.docs);
        if ledger.log_id.is_none() {
            ledger.log_id = args.log_id;
        }
        info!(
            "peer {me}: {} from peer {} at slot {seq} ({changed}/{} documents taken)",
            if args.is_reply() { "sync reply" } else { "sync" },
            args.from,
            args.docs.len()
        );

        if ledger.announced == Some(id) {
            ledger.serving = true;
        }
        self.note_sync(args.from, seq);
        if ledger.serving && !args.is_reply() && args.from != me && ledger.catch_up.is_none() {
            self.reply(ledger, id);
        }
    }

    fn note_sync(&self, from: PeerId, seq: Seq) {
        self.counters.syncs.fetch_add(1, Ordering::Relaxed);
        self.synced.send_modify(|synced| {
            synced.insert(from, seq);
        });
    }

    /// Answer another peer's announcement with this peer's state as of now.
    fn reply(self: &Arc<Self>, ledger: &Ledger, request: OperationId) {
        let me = self.paxos.me();
        let reply = Operation::reply(me, request, self.engine.snapshot(), ledger.recent())
            .with_log_id(ledger.log_id);
        self.counters.replies.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.propose(reply).await {
                debug!("peer {me}: sync reply to {request} abandoned: {e}");
            }
        });
    }

    /// Drop filter entries too old to match, once the floor has moved.
    fn prune(&self, ledger: &mut Ledger, seq: Seq) {
        let floor = self.paxos.min();
        if floor <= ledger.pruned_at {
            return;
        }
        ledger.pruned_at = floor;
        let horizon = seq.saturating_sub(self.config.dedup_window);
        let before = ledger.seen.len();
        ledger.seen.retain(|_, first| *first >= horizon);
        if ledger.seen.len() < before {
            debug!(
                "peer {}: pruned {} duplicate-filter entries below slot {horizon}",
                self.paxos.me(),
                before - ledger.seen.len()
            );
        }
    }

    // ─── Waiting ──────────────────────────────────────────────────────

    /// Resolve once slot `seq` has been applied locally.
    pub async fn wait_applied(&self, seq: Seq) -> Result<(), ReplicaError> {
        let mut applied = self.applied.subscribe();
        let mut shutdown = self.paxos.shutdown_signal();
        tokio::select! {
            reached = applied.wait_for(|a| a.is_some_and(|a| a >= seq)) => {
                reached.map(|_| ()).map_err(|_| ReplicaError::Shutdown(self.paxos.me()))
            }
            _ = shutdown.wait_for(|dead| *dead) => Err(ReplicaError::Shutdown(self.paxos.me())),
        }
    }

    /// Resolve once every one of `peers` has had a Sync applied at or after
    /// slot `since`.
    pub async fn wait_synced(&self, since: Seq, peers: usize) -> Result<(), ReplicaError> {
        let mut synced = self.synced.subscribe();
        let mut shutdown = self.paxos.shutdown_signal();
        tokio::select! {
            reached = synced.wait_for(|m| (0..peers).all(|p| m.get(&p).is_some_and(|s| *s >= since))) => {
                reached.map(|_| ()).map_err(|_| ReplicaError::Shutdown(self.paxos.me()))
            }
            _ = shutdown.wait_for(|dead| *dead) => Err(ReplicaError::Shutdown(self.paxos.me())),
        }
    }

    /// Latest slot at which each peer's Sync was applied.
    pub fn synced(&self) -> BTreeMap<PeerId, Seq> {
        self.synced.borrow().clone()
    }

    pub fn syncs_applied(&self) -> usize {
        self.counters.syncs.load(Ordering::Relaxed) as usize
    }

    pub fn stats(&self) -> ReplicaStats {
        ReplicaStats {
            last_applied: self.last_applied(),
            puts_applied: self.counters.puts.load(Ordering::Relaxed),
            puts_duplicate: self.counters.duplicates.load(Ordering::Relaxed),
            puts_failed: self.counters.failed.load(Ordering::Relaxed),
            syncs_applied: self.syncs_applied(),
            sync_replies: self.counters.replies.load(Ordering::Relaxed),
            noops_applied: self.counters.noops.load(Ordering::Relaxed),
            noops_proposed: self.counters.nudges.load(Ordering::Relaxed),
            slots_skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }
}

impl StateSource for Replica {
    /// Nothing is handed out while catching up: the documents do not match
    /// the applied position until the reply lands.
    fn capture(&self) -> (BTreeMap<String, DocumentSnapshot>, Option<ReplicaCheckpoint>) {
        let ledger = self.ledger.lock();
        if ledger.catch_up.is_some() {
            return (BTreeMap::new(), None);
        }
        let checkpoint = ReplicaCheckpoint {
            log_id: ledger.log_id,
            last_applied: self.last_applied(),
            recent: ledger.recent(),
        };
        (self.engine.snapshot(), Some(checkpoint))
    }

    fn install(&self, docs: Vec<DocumentSnapshot>) -> usize {
        self.engine.restore(docs)
    }
}
