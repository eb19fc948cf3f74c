//! Sync engine defaults.
//!
//! Centralizes tunables so `SyncConfig` defaults and docs agree.

use std::time::Duration;

/// Quiet period after the last mutation before a flush runs.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(1500);

/// Upper bound on any single remote call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Same-tier retries for transient errors before escalating.
pub const DEFAULT_TRANSIENT_RETRIES: u32 = 1;

/// Pause between same-tier transient retries.
pub const DEFAULT_TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Retry-queue attempts before an operation is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Backoff for the first queued attempt; doubles per attempt (1s, 2s, 4s ...).
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Backoff ceiling.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Fractional jitter applied to each backoff (0.1 = ±10%).
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.1;

/// Same-tier retries after a schema-drift rejection before escalating.
pub const MAX_DRIFT_RETRIES_PER_TIER: u32 = 1;

/// Buffered sync events per subscriber before it starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Columns the drift adapter never strips.
pub const KEY_COLUMNS: &[&str] = &["id", "funnel_id", "step_id"];
