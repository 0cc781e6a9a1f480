//! # pad-paxos: Multi-instance Paxos for the pad replicas
//!
//! Agrees on one value per log slot across a fixed set of peers, tolerating
//! message loss, reordering and the failure of a minority.
//!
//! ## Architecture
//!
//! ```text
//!   application                          other peers
//!       │ start / status / done               ▲
//!       ▼                                     │ Transport (TCP | in-process)
//! ┌──────────────────────────────────────────┐│
//! │ Paxos (one per peer)                     ││
//! │  ├── Proposer tasks (one per start)  ────┘│
//! │  ├── Acceptor (n_p, n_a, v_a per slot) ◄──┘ RpcHandler
//! │  └── Learner (decisions, max, done[])    │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`]: ballots, slots, propositions, [`Fate`]
//! - [`protocol`]: RPC envelope and length-prefixed bincode framing
//! - [`acceptor`]: promise/accept rules
//! - [`instance`]: the peer: learner, watermarks, garbage collection
//! - [`transport`]: TCP and in-process networks
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Agreement | majority intersection + adopt highest accepted |
//! | Validity | only proposed values are ever accepted |
//! | GC safety | slots dropped only below the all-peer done minimum |
//! | Liveness (stable majority) | randomized exponential backoff |

pub mod acceptor;
pub mod config;
pub mod instance;
pub mod protocol;
mod proposer;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use acceptor::{Acceptor, AcceptorSlot};
pub use config::PaxosConfig;
pub use instance::{Paxos, PaxosStats};
pub use protocol::{AcceptReply, PrepareReply, ProtocolError, Request, Response};
pub use transport::{LocalNetwork, RpcHandler, RpcServer, TcpTransport, Transport};
pub use types::{Ballot, Fate, PaxosValue, PeerId, ProposalId, Proposition, Seq};
