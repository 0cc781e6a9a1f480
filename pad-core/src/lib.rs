//! # pad-core: Documents, commits and the text transform
//!
//! Everything a replica does to a document once the log has fixed the order
//! of commits.
//!
//! ## Architecture
//!
//! ```text
//!   decided Put(doc, commit)
//!            │
//!            ▼
//! ┌─────────────────────┐     name → Arc<Document>
//! │ DocumentEngine      │ ─────────────────────────┐
//! └─────────┬───────────┘                          ▼
//!           │ rebase / apply          ┌─────────────────────────┐
//!           ▼                         │ Document (own lock)     │
//! ┌─────────────────────┐             │  commits [0..=head]     │
//! │ TextTransform       │ ◄────────── │  text                   │
//! │ (OtTransform)       │             │  waiters by version     │
//! └─────────────────────┘             └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`commit`]: opaque commit text, `{parent}` view, edit ops
//! - [`transform`]: diff / rebase / apply
//! - [`document`]: per-document history, blocking reads, snapshots
//! - [`engine`]: lazy document map, sync merge, restore

pub mod commit;
pub mod document;
pub mod engine;
pub mod transform;

// Re-exports for convenience
pub use commit::{Commit, CommitBody, CommitError, EditOp, PartialCommit};
pub use document::{Document, DocumentError, DocumentId, DocumentSnapshot};
pub use engine::{DocumentEngine, EngineStats};
pub use transform::{apply_ops, OtTransform, TextTransform, TransformError, CURSOR_MARKER};
