//! Shared identity and value types for funnelsync.
//!
//! This crate is the leaf of the workspace: typed IDs and the plain data of
//! the funnel document tree. It has **no internal dependencies**; the document
//! model, store backends and sync engine all build on it.
//!
//! # Entity-Relationship Overview
//!
//! ```text
//! Funnel (FunnelId) ← the aggregate, owns everything below
//!     └── Step (StepId), ordered by order_index (contiguous 0..n)
//!             └── CanvasElement (ElementId), ordered by position
//! ```
//!
//! # Key Types
//!
//! |-------------------|----------------------------------------------|
//! | Type              | Purpose                                      |
//! |-------------------|----------------------------------------------|
//! | [`Funnel`]        | Aggregate root: metadata + `Vec<Arc<Step>>`  |
//! | [`Step`]          | One page; elements behind `Arc<Vec<_>>`      |
//! | [`CanvasElement`] | Opaque widget blob (type + config map)       |
//! | [`FunnelStatus`]  | draft / published / archived                 |
//! | [`FunnelId`]      | Which aggregate                              |
//! | [`StepId`]        | Which step                                   |
//! | [`ElementId`]     | Which element                                |
//! |-------------------|----------------------------------------------|

pub mod funnel;
pub mod ids;
pub mod step;

pub use funnel::{Funnel, FunnelStatus};
pub use ids::{ElementId, FunnelId, StepId};
pub use step::{CanvasElement, Step};

/// Current time as Unix milliseconds. Used by constructors throughout the workspace.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
