//! Local-first sync engine for funnelsync.
//!
//! Edits land in the document model immediately; this crate decides when and
//! how they reach the remote store.
//!
//! # Pipeline
//!
//! ```text
//! schedule_save ─▶ Debouncer ─(expiry)─▶ FlightTable ─▶ TieredWriter::flush
//!                                          │                │ narrow → entity → aggregate
//!                                          │                ▼
//!                                          │          SchemaDriftAdapter (strip rejected columns)
//!                                          │                │
//!                                          └──── RetryQueue ◀┘ (all tiers failed, retryable)
//! ```
//!
//! # Key Types
//!
//! |-------------------------|-----------------------------------------------|
//! | Type                    | Purpose                                       |
//! |-------------------------|-----------------------------------------------|
//! | [`SyncEngine`]          | Cloneable handle to the coordinator actor     |
//! | [`SyncEvent`]           | Persisted / failed / queued notifications     |
//! | [`TieredWriter`]        | One flush through the fallback chain          |
//! | [`SchemaDriftAdapter`]  | Remembers columns the remote rejected         |
//! | [`RetryQueue`]          | Per-aggregate FIFO lanes with backoff         |
//! | [`SyncConfig`]          | RON-loadable tuning knobs                     |
//! |-------------------------|-----------------------------------------------|

pub mod config;
pub mod constants;
pub mod debounce;
pub mod drift;
pub mod engine;
pub mod error;
pub mod flight;
pub mod payload;
pub mod queue;
pub mod tiers;

pub use config::{ConfigError, QueueConfig, SyncConfig};
pub use drift::SchemaDriftAdapter;
pub use engine::{ProviderFn, SharedProvider, SnapshotProvider, SyncEngine, SyncEvent, SyncListener};
pub use error::{ErrorClass, SyncError, classify};
pub use queue::{
    AttemptOutcome, Backoff, EnqueueOptions, OperationState, QueueCallbacks, QueuedOperation,
    QueuedOperationView, RetryQueue,
};
pub use tiers::{FlushOutcome, Tier, TieredWriter};
