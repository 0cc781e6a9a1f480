//! Proposer role: drive one slot to a decision.
//!
//! Per attempt:
//! 1. pick a ballot above anything seen for the slot
//! 2. Prepare → wait for a majority of promises, adopt the highest accepted
//!    proposition among them
//! 3. Accept → wait for a majority accepting *this* proposition id
//! 4. Learn → broadcast the decision, best effort
//!
//! A failed attempt backs off (randomized, exponential) and tries again. The
//! task ends once the slot is decided or forgotten locally, or the peer is
//! killed.

use std::sync::Arc;

use futures_util::stream::StreamExt;
use log::{debug, trace};

use crate::instance::Paxos;
use crate::protocol::{AcceptReply, PrepareReply, Request, Response};
use crate::types::{Ballot, Fate, PaxosValue, Proposition, Seq};

/// Result of one prepare/accept attempt.
#[derive(Debug)]
enum Round {
    /// A majority accepted; the decision was broadcast.
    Chosen,
    /// No majority; carries the highest competing promise observed.
    Failed(Option<Ballot>),
    /// Some acceptor no longer has the slot.
    Forgotten,
}

impl<V: PaxosValue> Paxos<V> {
    pub(crate) async fn propose(self: Arc<Self>, seq: Seq, proposition: Proposition<V>) {
        let mut shutdown = self.shutdown_signal();
        let mut seen: Option<Ballot> = None;
        let mut attempt: u32 = 0;

        loop {
            if self.is_dead() {
                return;
            }
            if !matches!(self.status(seq), Fate::Pending) {
                return;
            }

            let ballot = self.next_ballot(seq, seen);
            self.count_round();
            match self.round(seq, ballot, &proposition).await {
                Round::Chosen => return,
                Round::Forgotten => {
                    debug!("peer {}: slot {seq} forgotten by an acceptor, giving up", self.me());
                    return;
                }
                Round::Failed(hint) => {
                    seen = seen.max(hint).max(Some(ballot));
                }
            }

            attempt += 1;
            let pause = self.config().backoff(attempt);
            trace!("peer {}: slot {seq} attempt {attempt} failed, retrying in {pause:?}", self.me());
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn round(&self, seq: Seq, ballot: Ballot, own: &Proposition<V>) -> Round {
        let majority = self.majority();
        let tolerable = self.peers() - majority;

        // ─── Phase 1: prepare ─────────────────────────────────────────
        let mut replies = self.broadcast(Request::Prepare {
            ballot,
            seq,
            from: self.me(),
            done: self.local_done(),
        });
        let mut promises = 0usize;
        let mut failures = 0usize;
        let mut highest: Option<Ballot> = None;
        let mut adopted: Option<(Ballot, Proposition<V>)> = None;

        while let Some(reply) = replies.next().await {
            match reply {
                Some(Response::Prepare(PrepareReply::Promise { accepted })) => {
                    promises += 1;
                    if let Some((n_a, v_a)) = accepted {
                        if adopted.as_ref().map_or(true, |(best, _)| n_a > *best) {
                            adopted = Some((n_a, v_a));
                        }
                    }
                }
                Some(Response::Prepare(PrepareReply::Reject { promised })) => {
                    failures += 1;
                    highest = highest.max(Some(promised));
                }
                Some(Response::Prepare(PrepareReply::Forgotten)) => return Round::Forgotten,
                _ => failures += 1,
            }
            if promises >= majority || failures > tolerable {
                break;
            }
        }
        drop(replies);
        if promises < majority {
            trace!("peer {}: slot {seq} prepare {ballot} got {promises}/{majority}", self.me());
            return Round::Failed(highest);
        }

        // ─── Phase 2: accept ──────────────────────────────────────────
        let proposition = match adopted {
            Some((_, v_a)) => v_a,
            None => own.clone(),
        };
        let mut replies = self.broadcast(Request::Accept {
            ballot,
            seq,
            proposition: proposition.clone(),
        });
        let mut accepts = 0usize;
        let mut failures = 0usize;

        while let Some(reply) = replies.next().await {
            match reply {
                Some(Response::Accept(AcceptReply::Accepted { id, .. })) if id == proposition.id => {
                    accepts += 1;
                }
                Some(Response::Accept(AcceptReply::Reject { promised })) => {
                    failures += 1;
                    highest = highest.max(Some(promised));
                }
                Some(Response::Accept(AcceptReply::Forgotten)) => return Round::Forgotten,
                _ => failures += 1,
            }
            if accepts >= majority || failures > tolerable {
                break;
            }
        }
        drop(replies);
        if accepts < majority {
            trace!("peer {}: slot {seq} accept {ballot} got {accepts}/{majority}", self.me());
            return Round::Failed(highest);
        }

        // ─── Learn ────────────────────────────────────────────────────
        debug!(
            "peer {}: slot {seq} chosen at {ballot} ({})",
            self.me(),
            proposition.id
        );
        let mut replies = self.broadcast(Request::Learn { seq, proposition });
        tokio::spawn(async move { while replies.next().await.is_some() {} });
        Round::Chosen
    }
}
