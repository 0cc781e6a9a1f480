//! Core value types shared by the acceptor, proposer and wire protocol.
//!
//! Ballots are partitioned by peer so two proposers never pick the same
//! number without talking to each other:
//! ```text
//!   peers = 3
//!   peer 0 → 0, 3, 6, 9, ...
//!   peer 1 → 1, 4, 7, 10, ...
//!   peer 2 → 2, 5, 8, 11, ...
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Index of a peer in the fixed, ordered peer list.
pub type PeerId = usize;

/// Log slot number (one Paxos instance per slot).
pub type Seq = u64;

/// Anything that can be agreed upon: cloned between tasks, shipped over the
/// wire, logged.
pub trait PaxosValue:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> PaxosValue for T where
    T: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Proposal number. Totally ordered, globally unique per owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot(pub u64);

impl Ballot {
    /// Smallest ballot owned by `me` that is strictly greater than `floor`.
    pub fn next_above(floor: Option<Ballot>, me: PeerId, peers: usize) -> Ballot {
        let me = me as u64;
        let peers = peers.max(1) as u64;
        match floor {
            None => Ballot(me),
            Some(Ballot(f)) => {
                let mut n = (f / peers) * peers + me;
                if n <= f {
                    n += peers;
                }
                Ballot(n)
            }
        }
    }

    /// Peer that owns this ballot.
    pub fn owner(self, peers: usize) -> PeerId {
        (self.0 % peers.max(1) as u64) as PeerId
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Random identity of one proposal attempt's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalId(pub Uuid);

impl ProposalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value wrapped with the id the accept phase matches on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposition<V> {
    pub id: ProposalId,
    pub value: V,
}

impl<V> Proposition<V> {
    pub fn new(value: V) -> Self {
        Self {
            id: ProposalId::new(),
            value,
        }
    }
}

/// What this peer knows about a slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Fate<V> {
    /// A value was chosen and learned locally.
    Decided(V),
    /// Not learned yet (may or may not be chosen elsewhere).
    Pending,
    /// Below `Min()`: state was garbage-collected.
    Forgotten,
}

impl<V> Fate<V> {
    pub fn is_decided(&self) -> bool {
        matches!(self, Fate::Decided(_))
    }

    pub fn decided(self) -> Option<V> {
        match self {
            Fate::Decided(v) => Some(v),
            _ => None,
        }
    }
}
