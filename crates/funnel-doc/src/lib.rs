//! In-memory funnel document model for funnelsync.
//!
//! The document model is the UI's source of truth. Actions apply
//! synchronously and never wait on the network; persistence happens later,
//! from snapshots, in the sync engine.
//!
//! # Design Philosophy
//!
//! - **Optimistic**: an action either fails validation up front or is applied;
//!   nothing downstream ever reverts it.
//! - **Copy-on-write**: steps and element lists sit behind `Arc`, so a snapshot
//!   costs one reference bump per step and later edits copy only what they touch.
//! - **Dirty tracking**: each action records which entity and fields it changed,
//!   letting the sync engine pick the narrowest write that covers the change.

mod dirty;
mod document;
mod error;
mod store;

pub use dirty::{DirtySet, FunnelField, StepField, WriteFocus};
pub use document::{FunnelDocument, PendingSnapshot, StepPatch};
pub use error::DocumentError;
pub use store::{DocumentStore, SharedDocuments};

/// Result type for document actions.
pub type Result<T> = std::result::Result<T, DocumentError>;
