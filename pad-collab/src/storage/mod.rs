//! Persistent storage for replicated documents.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐   changed docs    ┌──────────────────┐
//! │ DocumentEngine │ ────────────────► │ DocumentStore    │
//! │ (in-memory)    │  every interval   │ (RocksDB)        │
//! └───────┬────────┘                   └────────┬─────────┘
//!         ▲                                     │ column families
//!         │ restore on startup                  ▼
//!         │                      ┌──────────────────────────────────┐
//!  PersistenceWorker ◄────────── │ CF "documents": text + commits   │
//!                                │ CF "metadata" : name → id, stamp │
//!                                │ CF "replica"  : log checkpoint   │
//!                                └──────────────────────────────────┘
//! ```
//!
//! The store is a recovery aid for a single peer; the replicated log and the
//! startup sync are what keep peers identical.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 3

pub mod rocks;
pub mod worker;

pub use rocks::{DocumentMetadata, DocumentStore, ReplicaCheckpoint, StoreConfig, StoreError};
pub use worker::{PersistenceStats, PersistenceWorker, StateSource};
