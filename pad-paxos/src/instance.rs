//! One peer's consensus instance: acceptor + learner + GC watermarks, with
//! proposers spawned on demand by [`Paxos::start`].
//!
//! Architecture:
//! ```text
//!              start(seq, v)
//!                   │ tokio::spawn
//!                   ▼
//!            ┌─────────────┐  Prepare/Accept/Learn   ┌─────────────┐
//!            │  Proposer   │ ──────────────────────► │ peers 0..N  │
//!            └─────────────┘                         └──────┬──────┘
//!                                                           │ RpcHandler
//!   status(seq) ◄── decisions ◄── ┌───────────────────┐ ◄───┘
//!   min()/max() ◄── watermarks ◄─ │ InstanceState     │
//!   done(seq)   ──► watermarks ─► │ (parking_lot lock)│
//!                                 └───────────────────┘
//! ```
//!
//! The state lock only guards map operations and is never held across an
//! `.await`.
//!
//! Reference: Lamport, Paxos Made Simple; Kleppmann, DDIA, Chapter 9

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::acceptor::Acceptor;
use crate::config::PaxosConfig;
use crate::protocol::{AcceptReply, PrepareReply, Request, Response};
use crate::transport::{RpcHandler, Transport};
use crate::types::{Ballot, Fate, PaxosValue, PeerId, Proposition, Seq};

/// Mutable consensus state of one peer.
struct InstanceState<V> {
    acceptor: Acceptor<V>,
    decisions: BTreeMap<Seq, V>,
    /// Highest `Done()` argument heard from each peer
    done: Vec<Option<Seq>>,
    /// Highest slot learned
    max: Option<Seq>,
}

impl<V: PaxosValue> InstanceState<V> {
    fn min(&self) -> Seq {
        self.done
            .iter()
            .map(|d| d.map_or(0, |s| s + 1))
            .min()
            .unwrap_or(0)
    }

    fn note_done(&mut self, peer: PeerId, done: Option<Seq>) {
        if let Some(slot) = self.done.get_mut(peer) {
            if done > *slot {
                *slot = done;
            }
        }
    }

    fn collect_garbage(&mut self) {
        let floor = self.min();
        self.acceptor.forget_below(floor);
        self.decisions = self.decisions.split_off(&floor);
    }

    fn fate(&self, seq: Seq) -> Fate<V> {
        if seq < self.min() {
            return Fate::Forgotten;
        }
        match self.decisions.get(&seq) {
            Some(v) => Fate::Decided(v.clone()),
            None => Fate::Pending,
        }
    }
}

/// Counters for observability.
#[derive(Debug, Clone, Default)]
pub struct PaxosStats {
    /// Proposer tasks spawned
    pub proposals: u64,
    /// Prepare rounds run by this peer's proposers
    pub rounds: u64,
    /// Slots learned
    pub learned: u64,
    /// Acceptor slots currently held (not yet garbage-collected)
    pub live_slots: usize,
}

#[derive(Default)]
struct Counters {
    proposals: AtomicU64,
    rounds: AtomicU64,
    learned: AtomicU64,
}

/// Multi-instance Paxos peer.
pub struct Paxos<V: PaxosValue> {
    me: PeerId,
    peers: usize,
    config: PaxosConfig,
    transport: Arc<dyn Transport<V>>,
    state: Mutex<InstanceState<V>>,
    shutdown: watch::Sender<bool>,
    counters: Counters,
}

impl<V: PaxosValue> Paxos<V> {
    /// Create peer `me` of a `peers`-sized cluster.
    pub fn new(
        me: PeerId,
        peers: usize,
        transport: Arc<dyn Transport<V>>,
        config: PaxosConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        info!("Paxos peer {me}/{peers} created");
        Arc::new(Self {
            me,
            peers,
            config,
            transport,
            state: Mutex::new(InstanceState {
                acceptor: Acceptor::new(),
                decisions: BTreeMap::new(),
                done: vec![None; peers],
                max: None,
            }),
            shutdown,
            counters: Counters::default(),
        })
    }

    pub fn me(&self) -> PeerId {
        self.me
    }

    pub fn peers(&self) -> usize {
        self.peers
    }

    pub fn config(&self) -> &PaxosConfig {
        &self.config
    }

    pub(crate) fn majority(&self) -> usize {
        self.peers / 2 + 1
    }

    // ─── Application API ──────────────────────────────────────────────

    /// Begin agreement on `seq` with `value` and return immediately.
    ///
    /// No-op if `seq` is already decided, forgotten, or the peer was killed.
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>, seq: Seq, value: V) {
        if self.is_dead() {
            return;
        }
        match self.status(seq) {
            Fate::Pending => {}
            Fate::Decided(_) => return,
            Fate::Forgotten => {
                debug!("peer {}: start({seq}) ignored, slot forgotten", self.me);
                return;
            }
        }
        self.counters.proposals.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.propose(seq, Proposition::new(value)).await;
        });
    }

    /// Local view of slot `seq`. Never contacts other peers.
    pub fn status(&self, seq: Seq) -> Fate<V> {
        self.state.lock().fate(seq)
    }

    /// The application is finished with every slot `<= seq`.
    pub fn done(&self, seq: Seq) {
        let mut state = self.state.lock();
        state.note_done(self.me, Some(seq));
        state.collect_garbage();
    }

    /// Highest slot learned by this peer.
    pub fn max(&self) -> Option<Seq> {
        self.state.lock().max
    }

    /// One more than the lowest done watermark across all peers; peers never
    /// heard from count as done with nothing.
    pub fn min(&self) -> Seq {
        self.state.lock().min()
    }

    /// Stop proposers and any RPC listener tied to [`Paxos::shutdown_signal`].
    pub fn kill(&self) {
        info!("Paxos peer {} shutting down", self.me);
        self.shutdown.send_replace(true);
    }

    pub fn is_dead(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Highest `Min()` reported by any reachable peer (self included).
    ///
    /// A restarting peer uses this as its floor: slots below it are gone
    /// cluster-wide and can only be recovered through document sync.
    pub async fn query_min(&self) -> Seq {
        let mut floor = self.min();
        let mut replies = self.broadcast(Request::MinQuery);
        while let Some(reply) = replies.next().await {
            if let Some(Response::Min(min)) = reply {
                floor = floor.max(min);
            }
        }
        floor
    }

    pub fn stats(&self) -> PaxosStats {
        let live_slots = self.state.lock().acceptor.len();
        PaxosStats {
            proposals: self.counters.proposals.load(Ordering::Relaxed),
            rounds: self.counters.rounds.load(Ordering::Relaxed),
            learned: self.counters.learned.load(Ordering::Relaxed),
            live_slots,
        }
    }

    // ─── Proposer support ─────────────────────────────────────────────

    /// Smallest ballot of ours above everything seen for `seq`.
    pub(crate) fn next_ballot(&self, seq: Seq, seen: Option<Ballot>) -> Ballot {
        let promised = self.state.lock().acceptor.promised(seq);
        Ballot::next_above(promised.max(seen), self.me, self.peers)
    }

    pub(crate) fn local_done(&self) -> Option<Seq> {
        self.state.lock().done.get(self.me).copied().flatten()
    }

    pub(crate) fn count_round(&self) {
        self.counters.rounds.fetch_add(1, Ordering::Relaxed);
    }

    /// Send `request` to every peer. Self is answered inline; remote calls
    /// are bounded by the RPC timeout.
    pub(crate) fn broadcast(
        &self,
        request: Request<V>,
    ) -> FuturesUnordered<futures_util::future::BoxFuture<'static, Option<Response<V>>>> {
        use futures_util::FutureExt;

        let timeout = self.config.rpc_timeout;
        (0..self.peers)
            .map(|peer| {
                if peer == self.me {
                    let reply = self.handle(request.clone());
                    futures_util::future::ready(Some(reply)).boxed()
                } else {
                    let call = self.transport.call(peer, request.clone());
                    async move { tokio::time::timeout(timeout, call).await.ok().flatten() }.boxed()
                }
            })
            .collect()
    }

    // ─── Acceptor / learner handlers ──────────────────────────────────

    fn on_prepare(&self, ballot: Ballot, seq: Seq, from: PeerId, done: Option<Seq>) -> PrepareReply<V> {
        let mut state = self.state.lock();
        if from < self.peers {
            state.note_done(from, done);
            state.collect_garbage();
        } else {
            warn!("peer {}: prepare from unknown peer {from}", self.me);
        }
        if seq < state.min() {
            return PrepareReply::Forgotten;
        }
        state.acceptor.prepare(seq, ballot)
    }

    fn on_accept(&self, ballot: Ballot, seq: Seq, proposition: Proposition<V>) -> AcceptReply {
        let mut state = self.state.lock();
        if seq < state.min() {
            return AcceptReply::Forgotten;
        }
        state.acceptor.accept(seq, ballot, proposition)
    }

    fn on_learn(&self, seq: Seq, proposition: Proposition<V>) {
        let mut state = self.state.lock();
        if seq < state.min() {
            return;
        }
        if state.decisions.contains_key(&seq) {
            return;
        }
        debug!("peer {}: learned slot {seq} ({})", self.me, proposition.id);
        state.decisions.insert(seq, proposition.value);
        if state.max.map_or(true, |m| seq > m) {
            state.max = Some(seq);
        }
        self.counters.learned.fetch_add(1, Ordering::Relaxed);
    }
}

impl<V: PaxosValue> RpcHandler<V> for Paxos<V> {
    fn handle(&self, request: Request<V>) -> Response<V> {
        match request {
            Request::Prepare { ballot, seq, from, done } => {
                Response::Prepare(self.on_prepare(ballot, seq, from, done))
            }
            Request::Accept { ballot, seq, proposition } => {
                Response::Accept(self.on_accept(ballot, seq, proposition))
            }
            Request::Learn { seq, proposition } => {
                self.on_learn(seq, proposition);
                Response::Learned
            }
            Request::MinQuery => Response::Min(self.min()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalNetwork;

    fn solo(peers: usize) -> (LocalNetwork<String>, Arc<Paxos<String>>) {
        let net: LocalNetwork<String> = LocalNetwork::new(peers);
        let px = Paxos::new(0, peers, net.endpoint(0), PaxosConfig::for_testing());
        net.register(0, &px);
        (net, px)
    }

    #[test]
    fn test_initial_watermarks() {
        let (_net, px) = solo(3);
        assert_eq!(px.max(), None);
        assert_eq!(px.min(), 0);
        assert_eq!(px.status(0), Fate::Pending);
    }

    #[test]
    fn test_learn_sets_max_and_status() {
        let (_net, px) = solo(3);
        px.handle(Request::Learn { seq: 4, proposition: Proposition::new("a".into()) });
        px.handle(Request::Learn { seq: 2, proposition: Proposition::new("b".into()) });
        assert_eq!(px.max(), Some(4));
        assert_eq!(px.status(4), Fate::Decided("a".to_string()));
        assert_eq!(px.status(2), Fate::Decided("b".to_string()));
        assert_eq!(px.status(3), Fate::Pending);
    }

    #[test]
    fn test_decision_is_immutable() {
        let (_net, px) = solo(1);
        px.handle(Request::Learn { seq: 0, proposition: Proposition::new("first".into()) });
        px.handle(Request::Learn { seq: 0, proposition: Proposition::new("second".into()) });
        assert_eq!(px.status(0), Fate::Decided("first".to_string()));
    }

    #[test]
    fn test_min_waits_for_all_peers() {
        let (_net, px) = solo(3);
        for seq in 0..8 {
            px.handle(Request::Learn { seq, proposition: Proposition::new(seq.to_string()) });
        }
        px.done(5);
        // Peers 1 and 2 never heard from.
        assert_eq!(px.min(), 0);
        assert_eq!(px.status(0), Fate::Decided("0".to_string()));

        // Piggybacked watermarks arrive with prepares.
        px.handle(Request::Prepare { ballot: Ballot(1), seq: 9, from: 1, done: Some(2) });
        assert_eq!(px.min(), 0);
        px.handle(Request::Prepare { ballot: Ballot(2), seq: 9, from: 2, done: Some(2) });
        assert_eq!(px.min(), 3);

        assert_eq!(px.status(2), Fate::Forgotten);
        for seq in 3..=5 {
            assert_eq!(px.status(seq), Fate::Decided(seq.to_string()));
        }
    }

    #[test]
    fn test_done_is_monotonic() {
        let (_net, px) = solo(1);
        px.done(5);
        px.done(2);
        assert_eq!(px.min(), 6);
        assert_eq!(px.local_done(), Some(5));
    }

    #[test]
    fn test_forgotten_slots_reject_prepare_and_accept() {
        let (_net, px) = solo(1);
        px.done(3);
        let prep = px.handle(Request::Prepare { ballot: Ballot(9), seq: 1, from: 0, done: Some(3) });
        assert!(matches!(prep, Response::Prepare(PrepareReply::Forgotten)));
        let acc = px.handle(Request::Accept {
            ballot: Ballot(9),
            seq: 2,
            proposition: Proposition::new("x".into()),
        });
        assert!(matches!(acc, Response::Accept(AcceptReply::Forgotten)));
    }

    #[test]
    fn test_gc_drops_acceptor_state() {
        let (_net, px) = solo(1);
        for seq in 0..4 {
            px.handle(Request::Prepare { ballot: Ballot(1), seq, from: 0, done: None });
        }
        assert_eq!(px.stats().live_slots, 4);
        px.done(1);
        assert_eq!(px.stats().live_slots, 2);
    }

    #[test]
    fn test_next_ballot_above_promise() {
        let (_net, px) = solo(3);
        assert_eq!(px.next_ballot(0, None), Ballot(0));
        px.handle(Request::Prepare { ballot: Ballot(7), seq: 0, from: 1, done: None });
        assert_eq!(px.next_ballot(0, None), Ballot(9));
        assert_eq!(px.next_ballot(0, Some(Ballot(10))), Ballot(12));
    }

    #[tokio::test]
    async fn test_single_peer_decides() {
        let (_net, px) = solo(1);
        px.start(0, "solo".to_string());
        let mut waited = 0;
        while !px.status(0).is_decided() && waited < 200 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            waited += 1;
        }
        assert_eq!(px.status(0), Fate::Decided("solo".to_string()));
        assert_eq!(px.max(), Some(0));
    }

    #[tokio::test]
    async fn test_min_query_reports_highest_floor() {
        let net: LocalNetwork<u64> = LocalNetwork::new(2);
        let a = Paxos::new(0, 2, net.endpoint(0), PaxosConfig::for_testing());
        let b = Paxos::new(1, 2, net.endpoint(1), PaxosConfig::for_testing());
        net.register(0, &a);
        net.register(1, &b);

        // b has heard both peers finish slot 4.
        b.done(4);
        b.handle(Request::Prepare { ballot: Ballot(0), seq: 10, from: 0, done: Some(4) });
        assert_eq!(b.min(), 5);
        assert_eq!(a.min(), 0);
        assert_eq!(a.query_min().await, 5);
    }

    #[test]
    fn test_kill_marks_dead() {
        let (_net, px) = solo(1);
        let signal = px.shutdown_signal();
        assert!(!px.is_dead());
        px.kill();
        assert!(px.is_dead());
        assert!(*signal.borrow());
    }
}
