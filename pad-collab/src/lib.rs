//! # pad-collab: Replicated collaborative pad server
//!
//! Every peer keeps the same documents by agreeing, through multi-instance
//! Paxos, on one global order of edits and applying that order everywhere.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  put / get / init   ┌──────────────────────────────┐
//! │ front-end   │ ──────────────────► │ PadServer (one per peer)     │
//! └─────────────┘                     │  ├── Replica (log driver)    │
//!                                     │  │     └── DocumentEngine    │
//!                                     │  ├── Paxos<Operation>  ◄─────┼──► peers
//!                                     │  └── PersistenceWorker       │
//!                                     └──────────────┬───────────────┘
//!                                                    ▼
//!                                             RocksDB (per peer)
//! ```
//!
//! ## Modules
//!
//! - [`op`]: log entries (Put / Sync / Noop)
//! - [`replica`]: propose, wait-till-decided, in-order apply, dedup
//! - [`storage`]: RocksDB document store and background persistence
//! - [`config`]: replica and server settings, peers file
//! - [`server`]: startup sequence and the client-facing document API
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Same text on every peer | one log order + deterministic rebase |
//! | At-most-once commits | `(document, commit)` filter over a fixed slot window |
//! | Gap-free application | driver applies `last_applied + 1` only |
//! | Joining peer catches up | startup Sync, newer last-written wins |
//! | Restarted peer rejoins | stored checkpoint, or adopt a Sync reply |

pub mod config;
pub mod op;
pub mod replica;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use config::{ConfigError, ReplicaConfig, ServerConfig};
pub use op::{AppliedPut, OpKind, Operation, OperationId, PutArgs, SyncArgs};
pub use replica::{Replica, ReplicaError, ReplicaStats};
pub use server::{PadServer, ServerError, ServerStats};
pub use storage::{
    DocumentStore, PersistenceWorker, ReplicaCheckpoint, StateSource, StoreConfig, StoreError,
};
