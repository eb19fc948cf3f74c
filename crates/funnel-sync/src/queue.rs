//! Retry queue.
//!
//! Snapshots whose flush exhausted every tier land here. Each operation keeps
//! its own backoff schedule; aggregates are independent, but operations for the
//! same aggregate run strictly in FIFO order (only the head of a lane is ever
//! eligible). Attempts re-run the tier chain against the stored snapshot, never
//! against live state.
//!
//! # State Machine
//!
//! ```text
//!              begin_attempt          Ok
//!   Waiting ─────────────────▶ Attempting ──────▶ Succeeded (removed)
//!      ▲  │                        │
//!      │  │ supersede              │ Err, attempts left
//!      │  ▼                        │
//!      │ Superseded (removed)      │
//!      └───────────────────────────┘
//!                                  │ Err, exhausted or non-retryable
//!                                  ▼
//!                               Failed (removed)
//! ```
//!
//! The queue is a pure state machine driven by the engine's event loop. With a
//! journal attached, every transition is mirrored to it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use strum::Display;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use funnel_doc::PendingSnapshot;
use funnel_store::{JournalEntry, QueueJournal, Record};
use funnel_types::{FunnelId, now_millis};

use crate::config::QueueConfig;
use crate::error::SyncError;

/// Lifecycle of a queued operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationState {
    Waiting,
    Attempting,
    Succeeded,
    Failed,
    Superseded,
}

/// A snapshot waiting for another try.
#[derive(Clone, Debug)]
pub struct QueuedOperation {
    pub id: Uuid,
    pub aggregate_id: FunnelId,
    pub payload: PendingSnapshot,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub next_eligible: Instant,
    pub description: String,
    pub state: OperationState,
    seq: i64,
}

type SuccessCallback = Box<dyn FnOnce(&Record) + Send>;
type ErrorCallback = Box<dyn FnOnce(&SyncError) + Send>;

/// Per-operation completion hooks. Each fires at most once.
#[derive(Default)]
pub struct QueueCallbacks {
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl QueueCallbacks {
    pub fn on_success(mut self, f: impl FnOnce(&Record) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&SyncError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn succeed(&mut self, record: &Record) {
        if let Some(f) = self.on_success.take() {
            f(record);
        }
    }

    fn fail(&mut self, error: &SyncError) {
        if let Some(f) = self.on_error.take() {
            f(error);
        }
    }
}

impl fmt::Debug for QueueCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueCallbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Options for [`RetryQueue::enqueue`].
#[derive(Debug)]
pub struct EnqueueOptions {
    pub max_attempts: u32,
    pub description: String,
    pub callbacks: QueueCallbacks,
}

impl EnqueueOptions {
    pub fn new(max_attempts: u32, description: impl Into<String>) -> Self {
        Self {
            max_attempts,
            description: description.into(),
            callbacks: QueueCallbacks::default(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: QueueCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// Read-only view of a queued operation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueuedOperationView {
    pub id: Uuid,
    pub aggregate_id: FunnelId,
    pub revision: u64,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Time until the operation becomes eligible (zero if it already is).
    pub eligible_in: Duration,
    pub description: String,
    pub state: OperationState,
}

/// Result of reporting an attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum AttemptOutcome {
    Succeeded {
        operation: Uuid,
        revision: u64,
        record: Record,
    },
    Rescheduled {
        operation: Uuid,
        attempts_made: u32,
        delay: Duration,
        error: SyncError,
    },
    Failed {
        operation: Uuid,
        revision: u64,
        error: SyncError,
    },
}

/// Exponential backoff with jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Backoff {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            base: config.base_backoff(),
            max: config.max_backoff(),
            jitter: config.jitter,
        }
    }

    /// Delay before attempt number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max`, then spread by ±`jitter`. A non-finite jitter counts as 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self.base.saturating_mul(1u32 << exponent).min(self.max);
        if !self.jitter.is_finite() || self.jitter <= 0.0 {
            return raw;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        raw.mul_f64((1.0 + spread).max(0.0))
    }
}

struct Entry {
    op: QueuedOperation,
    callbacks: QueueCallbacks,
}

/// Per-aggregate FIFO lanes of queued operations.
pub struct RetryQueue {
    lanes: HashMap<FunnelId, VecDeque<Entry>>,
    backoff: Backoff,
    next_seq: i64,
    journal: Option<Box<dyn QueueJournal>>,
}

impl RetryQueue {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            lanes: HashMap::new(),
            backoff,
            next_seq: 1,
            journal: None,
        }
    }

    /// Mirror every transition to `journal`.
    pub fn with_journal(mut self, journal: Box<dyn QueueJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn len(&self) -> usize {
        self.lanes.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Number of operations queued for one aggregate.
    pub fn pending_for(&self, id: FunnelId) -> usize {
        self.lanes.get(&id).map_or(0, VecDeque::len)
    }

    /// Take ownership of a snapshot. The first attempt is scheduled one
    /// backoff step out.
    pub fn enqueue(
        &mut self,
        payload: PendingSnapshot,
        options: EnqueueOptions,
        now: Instant,
    ) -> Uuid {
        let delay = self.backoff.delay(1);
        let op = QueuedOperation {
            id: Uuid::now_v7(),
            aggregate_id: payload.aggregate_id(),
            payload,
            attempts_made: 0,
            max_attempts: options.max_attempts.max(1),
            next_eligible: now + delay,
            description: options.description,
            state: OperationState::Waiting,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let id = op.id;
        info!(
            "queued {} for funnel {:?} (r{}), first attempt in {delay:?}",
            op.description, op.aggregate_id, op.payload.revision
        );
        self.journal_put(&op, delay);
        self.lanes
            .entry(op.aggregate_id)
            .or_default()
            .push_back(Entry {
                op,
                callbacks: options.callbacks,
            });
        id
    }

    /// Aggregates whose head operation is due and not blocked by `busy`.
    pub fn ready(&self, now: Instant, busy: impl Fn(FunnelId) -> bool) -> Vec<FunnelId> {
        let mut ready: Vec<(Instant, FunnelId)> = self
            .heads()
            .filter(|op| op.state == OperationState::Waiting && op.next_eligible <= now)
            .filter(|op| !busy(op.aggregate_id))
            .map(|op| (op.next_eligible, op.aggregate_id))
            .collect();
        ready.sort();
        ready.into_iter().map(|(_, id)| id).collect()
    }

    /// Earliest moment a head not blocked by `busy` becomes eligible.
    pub fn next_deadline(&self, busy: impl Fn(FunnelId) -> bool) -> Option<Instant> {
        self.heads()
            .filter(|op| op.state == OperationState::Waiting && !busy(op.aggregate_id))
            .map(|op| op.next_eligible)
            .min()
    }

    fn heads(&self) -> impl Iterator<Item = &QueuedOperation> {
        self.lanes.values().filter_map(|lane| lane.front().map(|e| &e.op))
    }

    /// Mark the head of `id`'s lane as attempting and hand out its snapshot.
    pub fn begin_attempt(&mut self, id: FunnelId) -> Option<(Uuid, PendingSnapshot)> {
        let entry = self.lanes.get_mut(&id)?.front_mut()?;
        if entry.op.state != OperationState::Waiting {
            return None;
        }
        entry.op.state = OperationState::Attempting;
        debug!(
            "attempt {} of {} for {}",
            entry.op.attempts_made + 1,
            entry.op.max_attempts,
            entry.op.description
        );
        Some((entry.op.id, entry.op.payload.clone()))
    }

    /// Report the result of the attempt started by [`begin_attempt`](Self::begin_attempt).
    pub fn complete_attempt(
        &mut self,
        id: FunnelId,
        operation: Uuid,
        result: Result<Record, SyncError>,
        now: Instant,
    ) -> Option<AttemptOutcome> {
        let lane = self.lanes.get_mut(&id)?;
        let entry = lane.front_mut().filter(|e| e.op.id == operation)?;

        let error = match result {
            Ok(record) => {
                entry.op.state = OperationState::Succeeded;
                let mut done = self.pop_head(id)?;
                done.callbacks.succeed(&record);
                info!("queued {} persisted", done.op.description);
                return Some(AttemptOutcome::Succeeded {
                    operation,
                    revision: done.op.payload.revision,
                    record,
                });
            }
            Err(error) => error,
        };

        entry.op.attempts_made += 1;
        let exhausted = entry.op.attempts_made >= entry.op.max_attempts;
        if exhausted || !error.class().is_retryable() {
            entry.op.state = OperationState::Failed;
            let aggregate = entry.op.aggregate_id;
            let attempts = entry.op.attempts_made;
            let final_error = if exhausted {
                SyncError::RetriesExhausted {
                    aggregate,
                    attempts,
                    last: Box::new(error),
                }
            } else {
                error
            };
            let mut done = self.pop_head(id)?;
            warn!("giving up on {}: {final_error}", done.op.description);
            done.callbacks.fail(&final_error);
            return Some(AttemptOutcome::Failed {
                operation,
                revision: done.op.payload.revision,
                error: final_error,
            });
        }

        let delay = self.backoff.delay(entry.op.attempts_made + 1);
        entry.op.state = OperationState::Waiting;
        entry.op.next_eligible = now + delay;
        let attempts_made = entry.op.attempts_made;
        if let Some(journal) = &self.journal {
            let eligible_ms = now_millis() + delay.as_millis() as u64;
            if let Err(err) = journal.update_attempts(&operation.to_string(), attempts_made, eligible_ms) {
                warn!("failed to journal attempt for {operation}: {err}");
            }
        }
        Some(AttemptOutcome::Rescheduled {
            operation,
            attempts_made,
            delay,
            error,
        })
    }

    /// A newer aggregate save of `id` at `revision` succeeded: waiting
    /// operations holding older (or equal) snapshots are obsolete.
    ///
    /// Their `on_success` fires with the newer record. Returns how many were
    /// superseded.
    pub fn supersede(&mut self, id: FunnelId, revision: u64, record: &Record) -> usize {
        let Some(lane) = self.lanes.get_mut(&id) else {
            return 0;
        };
        let mut superseded = Vec::new();
        lane.retain_mut(|entry| {
            let obsolete = entry.op.state == OperationState::Waiting
                && entry.op.payload.revision <= revision;
            if obsolete {
                entry.op.state = OperationState::Superseded;
                entry.callbacks.succeed(record);
                superseded.push(entry.op.id);
            }
            !obsolete
        });
        if lane.is_empty() {
            self.lanes.remove(&id);
        }
        for op in &superseded {
            debug!("queued operation {op} superseded by r{revision}");
            self.journal_remove(*op);
        }
        superseded.len()
    }

    /// Read-only view of every queued operation, lane by lane in FIFO order.
    pub fn snapshot(&self, now: Instant) -> Vec<QueuedOperationView> {
        let mut views: Vec<(i64, QueuedOperationView)> = self
            .lanes
            .values()
            .flat_map(|lane| lane.iter())
            .map(|entry| {
                let op = &entry.op;
                (
                    op.seq,
                    QueuedOperationView {
                        id: op.id,
                        aggregate_id: op.aggregate_id,
                        revision: op.payload.revision,
                        attempts_made: op.attempts_made,
                        max_attempts: op.max_attempts,
                        eligible_in: op.next_eligible.saturating_duration_since(now),
                        description: op.description.clone(),
                        state: op.state,
                    },
                )
            })
            .collect();
        views.sort_by_key(|(seq, _)| *seq);
        views.into_iter().map(|(_, view)| view).collect()
    }

    /// Reload operations persisted by an earlier process. Callbacks cannot be
    /// persisted, so restored operations report through engine events only.
    pub fn restore(&mut self, now: Instant) -> usize {
        let Some(journal) = &self.journal else {
            return 0;
        };
        let entries = match journal.load_all() {
            Ok(entries) => entries,
            Err(err) => {
                warn!("failed to load queue journal: {err}");
                return 0;
            }
        };

        let wall_now = now_millis();
        let mut restored = 0;
        let drop_entry = |id: &str, reason: String| {
            warn!("dropping unreadable journal entry {id}: {reason}");
            if let Err(err) = journal.remove(id) {
                warn!("failed to drop journal entry {id}: {err}");
            }
        };
        for entry in entries {
            let id = match Uuid::parse_str(&entry.id) {
                Ok(id) => id,
                Err(err) => {
                    drop_entry(&entry.id, err.to_string());
                    continue;
                }
            };
            let payload: PendingSnapshot = match serde_json::from_str(&entry.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    drop_entry(&entry.id, err.to_string());
                    continue;
                }
            };
            let wait = Duration::from_millis(entry.next_eligible_ms.saturating_sub(wall_now));
            let op = QueuedOperation {
                id,
                aggregate_id: payload.aggregate_id(),
                payload,
                attempts_made: entry.attempts_made,
                max_attempts: entry.max_attempts.max(1),
                next_eligible: now + wait,
                description: entry.description,
                state: OperationState::Waiting,
                seq: entry.seq,
            };
            self.next_seq = self.next_seq.max(entry.seq + 1);
            self.lanes
                .entry(op.aggregate_id)
                .or_default()
                .push_back(Entry {
                    op,
                    callbacks: QueueCallbacks::default(),
                });
            restored += 1;
        }
        if restored > 0 {
            info!("restored {restored} queued operation(s) from journal");
        }
        restored
    }

    fn pop_head(&mut self, id: FunnelId) -> Option<Entry> {
        let lane = self.lanes.get_mut(&id)?;
        let entry = lane.pop_front();
        if lane.is_empty() {
            self.lanes.remove(&id);
        }
        if let Some(entry) = &entry {
            self.journal_remove(entry.op.id);
        }
        entry
    }

    fn journal_put(&self, op: &QueuedOperation, delay: Duration) {
        let Some(journal) = &self.journal else {
            return;
        };
        let payload = match serde_json::to_string(&op.payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("cannot journal {}: {err}", op.description);
                return;
            }
        };
        let entry = JournalEntry {
            id: op.id.to_string(),
            aggregate_id: op.aggregate_id.to_string(),
            seq: op.seq,
            payload,
            attempts_made: op.attempts_made,
            max_attempts: op.max_attempts,
            next_eligible_ms: now_millis() + delay.as_millis() as u64,
            description: op.description.clone(),
        };
        if let Err(err) = journal.put(&entry) {
            warn!("failed to journal {}: {err}", op.description);
        }
    }

    fn journal_remove(&self, op: Uuid) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.remove(&op.to_string()) {
                warn!("failed to remove {op} from journal: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funnel_doc::FunnelDocument;
    use funnel_store::SqliteJournal;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn backoff() -> Backoff {
        Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.0,
        }
    }

    fn snapshot(doc: &mut FunnelDocument) -> PendingSnapshot {
        doc.rename(format!("rev {}", doc.revision() + 1));
        doc.take_full()
    }

    fn transient() -> SyncError {
        SyncError::TransientNetwork("connection reset".into())
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let b = backoff();
        assert_eq!(b.delay(1), Duration::from_secs(1));
        assert_eq!(b.delay(2), Duration::from_secs(2));
        assert_eq!(b.delay(3), Duration::from_secs(4));
        assert_eq!(b.delay(10), Duration::from_secs(30));
        assert_eq!(b.delay(200), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let b = Backoff {
            jitter: 0.1,
            ..backoff()
        };
        for _ in 0..100 {
            let d = b.delay(3);
            assert!(d >= Duration::from_millis(3600) && d <= Duration::from_millis(4400), "{d:?}");
        }
    }

    #[test]
    fn test_backoff_ignores_non_finite_jitter() {
        for jitter in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let b = Backoff { jitter, ..backoff() };
            assert_eq!(b.delay(2), Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn test_enqueue_schedules_first_attempt() {
        let mut queue = RetryQueue::new(backoff());
        let mut doc = FunnelDocument::new("Q");
        let now = Instant::now();
        let op = queue.enqueue(snapshot(&mut doc), EnqueueOptions::new(3, "save Q"), now);

        let view = queue.snapshot(now);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, op);
        assert_eq!(view[0].attempts_made, 0);
        assert_eq!(view[0].state, OperationState::Waiting);
        assert_eq!(view[0].eligible_in, Duration::from_secs(1));

        assert!(queue.ready(now, |_| false).is_empty());
        assert_eq!(queue.ready(now + Duration::from_secs(1), |_| false), vec![doc.id()]);
        assert!(queue.ready(now + Duration::from_secs(1), |_| true).is_empty());
    }

    #[tokio::test]
    async fn test_fifo_per_aggregate() {
        let mut queue = RetryQueue::new(backoff());
        let mut doc = FunnelDocument::new("FIFO");
        let now = Instant::now();
        let first = queue.enqueue(snapshot(&mut doc), EnqueueOptions::new(3, "first"), now);
        let second = queue.enqueue(snapshot(&mut doc), EnqueueOptions::new(3, "second"), now);
        let later = now + Duration::from_secs(5);

        let (op, _) = queue.begin_attempt(doc.id()).unwrap();
        assert_eq!(op, first);
        // The head is attempting; nothing else in the lane may start.
        assert!(queue.begin_attempt(doc.id()).is_none());
        assert!(queue.ready(later, |_| false).is_empty());

        queue.complete_attempt(doc.id(), first, Ok(Record::new()), later);
        let (op, _) = queue.begin_attempt(doc.id()).unwrap();
        assert_eq!(op, second);
    }

    #[tokio::test]
    async fn test_exhaustion_fires_on_error_once() {
        let mut queue = RetryQueue::new(backoff());
        let mut doc = FunnelDocument::new("Doomed");
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let callbacks = QueueCallbacks::default().on_error(move |err| {
            assert!(matches!(err, SyncError::RetriesExhausted { attempts: 3, .. }));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut now = Instant::now();
        let op = queue.enqueue(
            snapshot(&mut doc),
            EnqueueOptions::new(3, "doomed").with_callbacks(callbacks),
            now,
        );

        let mut delays = Vec::new();
        for _ in 0..3 {
            queue.begin_attempt(doc.id()).unwrap();
            match queue.complete_attempt(doc.id(), op, Err(transient()), now).unwrap() {
                AttemptOutcome::Rescheduled { delay, .. } => delays.push(delay),
                AttemptOutcome::Failed { .. } => break,
                other => panic!("unexpected {other:?}"),
            }
            now += Duration::from_secs(60);
        }

        assert_eq!(delays, vec![Duration::from_secs(2), Duration::from_secs(4)]);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let mut queue = RetryQueue::new(backoff());
        let mut doc = FunnelDocument::new("Auth");
        let now = Instant::now();
        let op = queue.enqueue(snapshot(&mut doc), EnqueueOptions::new(5, "auth"), now);
        queue.begin_attempt(doc.id());

        let outcome = queue
            .complete_attempt(doc.id(), op, Err(SyncError::Authorization("JWT expired".into())), now)
            .unwrap();
        assert!(matches!(
            outcome,
            AttemptOutcome::Failed {
                error: SyncError::Authorization(_),
                ..
            }
        ));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_supersede_older_waiting_operations() {
        let mut queue = RetryQueue::new(backoff());
        let mut doc = FunnelDocument::new("Newer wins");
        let now = Instant::now();
        let successes = Arc::new(AtomicUsize::new(0));
        let counter = successes.clone();
        let old = snapshot(&mut doc);
        queue.enqueue(
            old.clone(),
            EnqueueOptions::new(3, "old").with_callbacks(
                QueueCallbacks::default().on_success(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            ),
            now,
        );
        let newer = snapshot(&mut doc);
        queue.enqueue(newer.clone(), EnqueueOptions::new(3, "newer"), now);

        assert_eq!(queue.supersede(doc.id(), old.revision, &Record::new()), 1);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_for(doc.id()), 1);
        assert_eq!(queue.snapshot(now)[0].revision, newer.revision);
    }

    #[tokio::test]
    async fn test_journal_mirrors_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let mut doc = FunnelDocument::new("Durable");
        let now = Instant::now();

        let op = {
            let journal = SqliteJournal::open(&path).unwrap();
            let mut queue = RetryQueue::new(backoff()).with_journal(Box::new(journal));
            let op = queue.enqueue(snapshot(&mut doc), EnqueueOptions::new(4, "durable"), now);
            queue.begin_attempt(doc.id());
            queue.complete_attempt(doc.id(), op, Err(transient()), now);
            op
        };

        let journal = SqliteJournal::open(&path).unwrap();
        let mut queue = RetryQueue::new(backoff()).with_journal(Box::new(journal));
        assert_eq!(queue.restore(now), 1);

        let views = queue.snapshot(now);
        let view = &views[0];
        assert_eq!(view.id, op);
        assert_eq!(view.aggregate_id, doc.id());
        assert_eq!(view.attempts_made, 1);
        assert_eq!(view.max_attempts, 4);

        queue.begin_attempt(doc.id()).unwrap();
        queue.complete_attempt(doc.id(), op, Ok(Record::new()), now);
        assert!(SqliteJournal::open(&path).unwrap().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_restore_drops_entries_with_bad_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let mut doc = FunnelDocument::new("Mangled");
        let journal = SqliteJournal::open(&path).unwrap();
        journal
            .put(&JournalEntry {
                id: "not-a-uuid".into(),
                aggregate_id: doc.id().to_string(),
                seq: 1,
                payload: serde_json::to_string(&snapshot(&mut doc)).unwrap(),
                attempts_made: 1,
                max_attempts: 3,
                next_eligible_ms: 0,
                description: "mangled".into(),
            })
            .unwrap();

        let mut queue = RetryQueue::new(backoff()).with_journal(Box::new(journal));
        assert_eq!(queue.restore(Instant::now()), 0);
        assert!(queue.is_empty());
        assert!(SqliteJournal::open(&path).unwrap().is_empty().unwrap());
    }
}
