//! Acceptor role: per-slot promise/accept bookkeeping.
//!
//! Each slot tracks:
//! - `n_p`: highest ballot promised
//! - `n_a` / `v_a`: highest ballot accepted and the proposition accepted with it
//!
//! Slot state is created lazily on the first Prepare or Accept for that slot
//! and dropped by [`Acceptor::forget_below`] once every peer is done with it.
//!
//! Reference: Lamport, Paxos Made Simple, Section 2.2

use std::collections::BTreeMap;

use log::{debug, trace};

use crate::protocol::{AcceptReply, PrepareReply};
use crate::types::{Ballot, Proposition, Seq};

/// Acceptor state for one slot.
#[derive(Debug, Clone)]
pub struct AcceptorSlot<V> {
    promised: Option<Ballot>,
    accepted: Option<(Ballot, Proposition<V>)>,
}

impl<V> Default for AcceptorSlot<V> {
    fn default() -> Self {
        Self {
            promised: None,
            accepted: None,
        }
    }
}

impl<V: Clone> AcceptorSlot<V> {
    pub fn promised(&self) -> Option<Ballot> {
        self.promised
    }

    pub fn accepted(&self) -> Option<&(Ballot, Proposition<V>)> {
        self.accepted.as_ref()
    }

    /// Promise iff `ballot > n_p`.
    pub fn on_prepare(&mut self, ballot: Ballot) -> PrepareReply<V> {
        match self.promised {
            Some(promised) if ballot <= promised => PrepareReply::Reject { promised },
            _ => {
                self.promised = Some(ballot);
                PrepareReply::Promise {
                    accepted: self.accepted.clone(),
                }
            }
        }
    }

    /// Accept iff `ballot >= n_p`.
    pub fn on_accept(&mut self, ballot: Ballot, proposition: Proposition<V>) -> AcceptReply {
        match self.promised {
            Some(promised) if ballot < promised => AcceptReply::Reject { promised },
            _ => {
                let id = proposition.id;
                self.promised = Some(ballot);
                self.accepted = Some((ballot, proposition));
                AcceptReply::Accepted { ballot, id }
            }
        }
    }
}

/// All acceptor slots of one peer.
#[derive(Debug)]
pub struct Acceptor<V> {
    slots: BTreeMap<Seq, AcceptorSlot<V>>,
}

impl<V> Default for Acceptor<V> {
    fn default() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }
}

impl<V: Clone + std::fmt::Debug> Acceptor<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepare(&mut self, seq: Seq, ballot: Ballot) -> PrepareReply<V> {
        let reply = self.slots.entry(seq).or_default().on_prepare(ballot);
        match &reply {
            PrepareReply::Promise { accepted } => {
                trace!("slot {seq}: promised {ballot} (accepted: {:?})", accepted.as_ref().map(|(b, _)| *b));
            }
            PrepareReply::Reject { promised } => {
                debug!("slot {seq}: rejected prepare {ballot}, already promised {promised}");
            }
            PrepareReply::Forgotten => {}
        }
        reply
    }

    pub fn accept(&mut self, seq: Seq, ballot: Ballot, proposition: Proposition<V>) -> AcceptReply {
        let reply = self.slots.entry(seq).or_default().on_accept(ballot, proposition);
        match &reply {
            AcceptReply::Accepted { id, .. } => trace!("slot {seq}: accepted {ballot} ({id})"),
            AcceptReply::Reject { promised } => {
                debug!("slot {seq}: rejected accept {ballot}, already promised {promised}");
            }
            AcceptReply::Forgotten => {}
        }
        reply
    }

    /// Highest ballot promised for `seq`, if the slot exists.
    pub fn promised(&self, seq: Seq) -> Option<Ballot> {
        self.slots.get(&seq).and_then(|s| s.promised())
    }

    pub fn slot(&self, seq: Seq) -> Option<&AcceptorSlot<V>> {
        self.slots.get(&seq)
    }

    /// Drop every slot `< floor`.
    pub fn forget_below(&mut self, floor: Seq) {
        self.slots = self.slots.split_off(&floor);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_prepare_promises_with_nothing_accepted() {
        let mut acc: Acceptor<String> = Acceptor::new();
        match acc.prepare(0, Ballot(1)) {
            PrepareReply::Promise { accepted } => assert!(accepted.is_none()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(acc.promised(0), Some(Ballot(1)));
    }

    #[test]
    fn test_prepare_requires_strictly_higher_ballot() {
        let mut acc: Acceptor<String> = Acceptor::new();
        acc.prepare(0, Ballot(5));
        assert_eq!(acc.prepare(0, Ballot(5)), PrepareReply::Reject { promised: Ballot(5) });
        assert_eq!(acc.prepare(0, Ballot(4)), PrepareReply::Reject { promised: Ballot(5) });
        assert!(matches!(acc.prepare(0, Ballot(6)), PrepareReply::Promise { .. }));
    }

    #[test]
    fn test_accept_at_equal_ballot() {
        let mut acc: Acceptor<String> = Acceptor::new();
        acc.prepare(3, Ballot(2));
        let prop = Proposition::new("x".to_string());
        let id = prop.id;
        assert_eq!(
            acc.accept(3, Ballot(2), prop),
            AcceptReply::Accepted { ballot: Ballot(2), id }
        );
    }

    #[test]
    fn test_accept_rejected_below_promise() {
        let mut acc: Acceptor<String> = Acceptor::new();
        acc.prepare(0, Ballot(9));
        let reply = acc.accept(0, Ballot(4), Proposition::new("late".to_string()));
        assert_eq!(reply, AcceptReply::Reject { promised: Ballot(9) });
        assert!(acc.slot(0).unwrap().accepted().is_none());
    }

    #[test]
    fn test_later_prepare_reports_accepted_value() {
        let mut acc: Acceptor<String> = Acceptor::new();
        acc.prepare(0, Ballot(1));
        let prop = Proposition::new("v".to_string());
        acc.accept(0, Ballot(1), prop.clone());
        match acc.prepare(0, Ballot(4)) {
            PrepareReply::Promise { accepted: Some((b, p)) } => {
                assert_eq!(b, Ballot(1));
                assert_eq!(p, prop);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_accept_without_prepare_creates_slot() {
        let mut acc: Acceptor<u32> = Acceptor::new();
        let reply = acc.accept(7, Ballot(0), Proposition::new(1));
        assert!(matches!(reply, AcceptReply::Accepted { .. }));
        assert_eq!(acc.promised(7), Some(Ballot(0)));
    }

    #[test]
    fn test_forget_below() {
        let mut acc: Acceptor<u32> = Acceptor::new();
        for seq in 0..6 {
            acc.prepare(seq, Ballot(1));
        }
        acc.forget_below(3);
        assert_eq!(acc.len(), 3);
        assert!(acc.slot(2).is_none());
        assert!(acc.slot(3).is_some());
        assert!(acc.slot(5).is_some());
    }
}
