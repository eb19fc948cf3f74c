//! Sync engine: the coordinator actor and its public handle.
//!
//! All mutable sync state (debounce timers, in-flight slots, retry lanes) is
//! owned by one coordinator task. Callers hold a cloneable `Send + Sync`
//! [`SyncEngine`] that talks to it over a channel; store calls run on spawned
//! tasks and report back on a second channel.
//!
//! ```text
//!   SyncEngine (Send+Sync)      mpsc        Coordinator (one task)
//!   ┌──────────────────────┐  ────────▶  ┌─────────────────────────────┐
//!   │ .schedule_save()     │             │ Debouncer   (timers)        │
//!   │ .flush_now()         │  ◀────────  │ FlightTable (single-flight) │
//!   │ .queue_snapshot()    │   oneshot   │ RetryQueue  (FIFO lanes)    │
//!   └──────────────────────┘             └──────┬──────────────▲───────┘
//!            ▲                                  │ spawn        │ landed
//!            │ broadcast SyncEvent              ▼              │
//!            └──────────────────────────  TieredWriter::flush ─┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use funnel_doc::{DocumentStore, PendingSnapshot, SharedDocuments, WriteFocus};
use funnel_store::{QueueJournal, Record, RemoteStore, SqliteJournal};
use funnel_types::FunnelId;

use crate::config::SyncConfig;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::debounce::Debouncer;
use crate::drift::SchemaDriftAdapter;
use crate::error::SyncError;
use crate::flight::{Admission, FlightKind, FlightTable, Waiter, notify};
use crate::queue::{AttemptOutcome, Backoff, EnqueueOptions, QueuedOperationView, RetryQueue};
use crate::tiers::{FlushOutcome, Tier, TieredWriter};

// ============================================================================
// Snapshot providers
// ============================================================================

/// Produces the snapshot to persist when a debounce timer expires.
///
/// Called on the coordinator task at expiry, never earlier. `None` means
/// there is nothing to write.
pub trait SnapshotProvider: Send + Sync {
    fn snapshot(&self, id: FunnelId) -> Option<PendingSnapshot>;
}

/// The document registry hands out pending changes (and clears its dirt).
impl SnapshotProvider for DocumentStore {
    fn snapshot(&self, id: FunnelId) -> Option<PendingSnapshot> {
        self.take_pending(id)
    }
}

/// Adapts a closure into a [`SnapshotProvider`].
pub struct ProviderFn<F>(pub F);

impl<F> SnapshotProvider for ProviderFn<F>
where
    F: Fn(FunnelId) -> Option<PendingSnapshot> + Send + Sync,
{
    fn snapshot(&self, id: FunnelId) -> Option<PendingSnapshot> {
        (self.0)(id)
    }
}

pub type SharedProvider = Arc<dyn SnapshotProvider>;

// ============================================================================
// Events
// ============================================================================

/// Outcome notifications, broadcast to every subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    /// A snapshot reached the store.
    Persisted {
        aggregate_id: FunnelId,
        revision: u64,
        tier: Tier,
        record: Record,
        from_queue: bool,
    },
    /// A snapshot will not be persisted (non-retryable, or retries exhausted).
    PersistFailed {
        aggregate_id: FunnelId,
        revision: u64,
        error: SyncError,
    },
    /// A snapshot was handed to the retry queue.
    Queued {
        aggregate_id: FunnelId,
        operation: Uuid,
        revision: u64,
        error: Option<SyncError>,
    },
    /// A queued attempt failed and was rescheduled.
    RetryScheduled {
        aggregate_id: FunnelId,
        operation: Uuid,
        attempts_made: u32,
        delay: Duration,
        error: SyncError,
    },
}

impl SyncEvent {
    pub fn aggregate_id(&self) -> FunnelId {
        match self {
            SyncEvent::Persisted { aggregate_id, .. }
            | SyncEvent::PersistFailed { aggregate_id, .. }
            | SyncEvent::Queued { aggregate_id, .. }
            | SyncEvent::RetryScheduled { aggregate_id, .. } => *aggregate_id,
        }
    }
}

/// Callback-style consumer of [`SyncEvent`]s.
pub trait SyncListener: Send + 'static {
    fn on_persisted(&mut self, aggregate_id: FunnelId, record: &Record);

    fn on_persist_failed(&mut self, aggregate_id: FunnelId, error: &SyncError);

    /// Every event, including queue traffic. Default: ignore.
    fn on_event(&mut self, _event: &SyncEvent) {}
}

// ============================================================================
// Commands (internal)
// ============================================================================

enum Command {
    Schedule {
        id: FunnelId,
        provider: Option<SharedProvider>,
        window: Option<Duration>,
    },
    FlushNow {
        id: FunnelId,
        reply: Waiter,
    },
    Enqueue {
        snapshot: PendingSnapshot,
        options: EnqueueOptions,
        reply: oneshot::Sender<Uuid>,
    },
    Forget {
        id: FunnelId,
    },
    QueueSnapshot {
        reply: oneshot::Sender<Vec<QueuedOperationView>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A finished flight, reported by its task.
struct Landed {
    id: FunnelId,
    kind: FlightKind,
    operation: Option<Uuid>,
    snapshot: PendingSnapshot,
    result: Result<FlushOutcome, SyncError>,
}

// ============================================================================
// SyncEngine (Send + Sync public API)
// ============================================================================

/// Handle to a running sync engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SyncEvent>,
    documents: SharedDocuments,
    drift: Arc<SchemaDriftAdapter>,
}

impl SyncEngine {
    /// Start the coordinator on the current tokio runtime.
    ///
    /// Opens the queue journal if `config.journal_path` is set and restores
    /// whatever an earlier process left in it. Fails on an invalid config.
    pub fn spawn(
        store: Arc<dyn RemoteStore>,
        documents: SharedDocuments,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config
            .validate()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        let journal: Option<Box<dyn QueueJournal>> = match &config.journal_path {
            Some(path) => {
                let journal =
                    SqliteJournal::open(path).map_err(|e| SyncError::Journal(e.to_string()))?;
                Some(Box::new(journal))
            }
            None => None,
        };
        Self::spawn_with_journal(store, documents, config, journal)
    }

    /// Start the coordinator with an explicit (or no) journal.
    pub fn spawn_with_journal(
        store: Arc<dyn RemoteStore>,
        documents: SharedDocuments,
        config: SyncConfig,
        journal: Option<Box<dyn QueueJournal>>,
    ) -> Result<Self, SyncError> {
        config
            .validate()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        let drift = Arc::new(SchemaDriftAdapter::new());
        let writer = TieredWriter::new(store, &config).with_drift_adapter(Arc::clone(&drift));

        let mut queue = RetryQueue::new(Backoff::from_config(&config.queue));
        if let Some(journal) = journal {
            queue = queue.with_journal(journal);
        }

        let (tx, commands) = mpsc::unbounded_channel();
        let (landed_tx, landed) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let default_provider: SharedProvider = documents.clone();
        let coordinator = Coordinator {
            writer: Arc::new(writer),
            documents: documents.clone(),
            default_provider,
            window: config.debounce_window(),
            max_attempts: config.queue.max_attempts,
            debouncer: Debouncer::new(),
            flights: FlightTable::new(),
            queue,
            events: events.clone(),
            landed_tx,
        };
        tokio::spawn(coordinator.run(commands, landed));

        Ok(Self {
            tx,
            events,
            documents,
            drift,
        })
    }

    /// The document registry this engine persists from.
    pub fn documents(&self) -> &SharedDocuments {
        &self.documents
    }

    /// Columns the remote has been observed to reject.
    pub fn drift(&self) -> &SchemaDriftAdapter {
        &self.drift
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            trace!("sync engine shut down; dropping command");
        }
    }

    /// Debounced save with the default window and the document registry as
    /// provider. Fire-and-forget.
    pub fn schedule_save(&self, id: FunnelId) {
        self.send(Command::Schedule {
            id,
            provider: None,
            window: None,
        });
    }

    /// Debounced save with an explicit provider and window.
    pub fn schedule_with(&self, id: FunnelId, provider: SharedProvider, window: Duration) {
        self.send(Command::Schedule {
            id,
            provider: Some(provider),
            window: Some(window),
        });
    }

    /// Cancel any pending timer and persist now. Writes the full aggregate if
    /// nothing is dirty.
    pub async fn flush_now(&self, id: FunnelId) -> Result<Record, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::FlushNow { id, reply })
            .map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }

    /// Hand a snapshot straight to the retry queue.
    pub async fn enqueue(
        &self,
        snapshot: PendingSnapshot,
        options: EnqueueOptions,
    ) -> Result<Uuid, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Enqueue {
                snapshot,
                options,
                reply,
            })
            .map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }

    /// Drop timers and pending reruns for a deleted aggregate.
    pub fn forget(&self, id: FunnelId) {
        self.send(Command::Forget { id });
    }

    /// Read-only view of the retry queue.
    pub async fn queue_snapshot(&self) -> Result<Vec<QueuedOperationView>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::QueueSnapshot { reply })
            .map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Drive a [`SyncListener`] from the event stream on its own task.
    pub fn listen<L: SyncListener>(&self, mut listener: L) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        listener.on_event(&event);
                        match &event {
                            SyncEvent::Persisted {
                                aggregate_id,
                                record,
                                ..
                            } => listener.on_persisted(*aggregate_id, record),
                            SyncEvent::PersistFailed {
                                aggregate_id,
                                error,
                                ..
                            } => listener.on_persist_failed(*aggregate_id, error),
                            _ => {}
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("sync listener lagged; {missed} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stop the coordinator. Pending timers are dropped; flights already
    /// running finish on their own but report nowhere.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply })
            .map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }
}

// ============================================================================
// Coordinator (owns all mutable sync state)
// ============================================================================

struct Coordinator {
    writer: Arc<TieredWriter>,
    documents: SharedDocuments,
    default_provider: SharedProvider,
    window: Duration,
    max_attempts: u32,
    debouncer: Debouncer<SharedProvider>,
    flights: FlightTable<SharedProvider>,
    queue: RetryQueue,
    events: broadcast::Sender<SyncEvent>,
    landed_tx: mpsc::UnboundedSender<Landed>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut landed: mpsc::UnboundedReceiver<Landed>,
    ) {
        self.restore();
        info!("sync engine started");

        loop {
            let wake = self.next_wake();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        info!(
                            "sync engine stopping: {} timer(s) dropped, {} operation(s) queued",
                            self.debouncer.len(),
                            self.queue.len()
                        );
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(done) = landed.recv() => self.on_landed(done),
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    self.on_tick(Instant::now());
                }
            }
        }

        info!("sync engine stopped");
    }

    fn restore(&mut self) {
        let now = Instant::now();
        if self.queue.restore(now) == 0 {
            return;
        }
        // Restored snapshots are older than anything edited since; make the
        // next live write cover the whole aggregate.
        for view in self.queue.snapshot(now) {
            self.documents.mark_unsynced(view.aggregate_id);
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let timers = self.debouncer.next_deadline();
        let retries = self.queue.next_deadline(|id| self.flights.is_in_flight(id));
        match (timers, retries) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Schedule {
                id,
                provider,
                window,
            } => {
                let deadline = Instant::now() + window.unwrap_or(self.window);
                let provider = provider.unwrap_or_else(|| Arc::clone(&self.default_provider));
                if self.debouncer.schedule(id, provider, deadline) {
                    trace!("debounce for {id:?} reset");
                }
            }
            Command::FlushNow { id, reply } => self.flush_now(id, reply),
            Command::Enqueue {
                snapshot,
                options,
                reply,
            } => {
                let aggregate_id = snapshot.aggregate_id();
                let revision = snapshot.revision;
                let operation = self.queue.enqueue(snapshot, options, Instant::now());
                let _ = reply.send(operation);
                self.emit(SyncEvent::Queued {
                    aggregate_id,
                    operation,
                    revision,
                    error: None,
                });
            }
            Command::Forget { id } => {
                self.debouncer.cancel(id);
                self.flights.clear_rerun(id);
                debug!("forgot timers for {id:?}");
            }
            Command::QueueSnapshot { reply } => {
                let _ = reply.send(self.queue.snapshot(Instant::now()));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn flush_now(&mut self, id: FunnelId, reply: Waiter) {
        let provider = self
            .debouncer
            .cancel(id)
            .unwrap_or_else(|| Arc::clone(&self.default_provider));
        let (admission, reply) = self
            .flights
            .request_flush(id, reply, Arc::clone(&provider));
        match admission {
            Admission::Joined => debug!("flush_now for {id:?} joined the running flush"),
            Admission::Deferred => debug!("flush_now for {id:?} deferred behind a retry"),
            Admission::Start => {}
        }
        if let Some(reply) = reply {
            self.start_fresh(id, &provider, vec![reply]);
        }
    }

    /// Start a live flush of the latest state; the full aggregate if clean.
    fn start_fresh(&mut self, id: FunnelId, provider: &SharedProvider, waiters: Vec<Waiter>) {
        match provider.snapshot(id).or_else(|| self.documents.take_full(id)) {
            Some(snapshot) => self.start_live(snapshot, waiters),
            None => notify(waiters, &Err(SyncError::UnknownAggregate(id))),
        }
    }

    fn start_live(&mut self, snapshot: PendingSnapshot, waiters: Vec<Waiter>) {
        let id = snapshot.aggregate_id();
        if !self.flights.begin(id, FlightKind::Live, waiters) {
            error!("live flush for {id:?} started while another was in flight");
            return;
        }
        debug!(
            "flushing funnel {id:?} r{} ({} focus)",
            snapshot.revision,
            snapshot.focus.label()
        );
        self.spawn_flight(id, FlightKind::Live, None, snapshot);
    }

    fn spawn_flight(
        &self,
        id: FunnelId,
        kind: FlightKind,
        operation: Option<Uuid>,
        snapshot: PendingSnapshot,
    ) {
        let writer = Arc::clone(&self.writer);
        let landed = self.landed_tx.clone();
        tokio::spawn(async move {
            let result = writer.flush(&snapshot).await;
            let _ = landed.send(Landed {
                id,
                kind,
                operation,
                snapshot,
                result,
            });
        });
    }

    fn on_tick(&mut self, now: Instant) {
        for (id, provider) in self.debouncer.take_expired(now) {
            self.on_expired(id, provider);
        }
        self.drive_queue(now);
    }

    fn on_expired(&mut self, id: FunnelId, provider: SharedProvider) {
        if self.flights.is_in_flight(id) {
            self.flights.mark_rerun(id, provider);
            debug!("debounce for {id:?} expired mid-flight; rerun queued");
            return;
        }
        match provider.snapshot(id) {
            Some(snapshot) => self.start_live(snapshot, Vec::new()),
            None => trace!("debounce for {id:?} expired with nothing to write"),
        }
    }

    /// Start an attempt for every lane whose head is due and idle.
    fn drive_queue(&mut self, now: Instant) {
        let ready = self.queue.ready(now, |id| self.flights.is_in_flight(id));
        for id in ready {
            if let Some((operation, snapshot)) = self.queue.begin_attempt(id) {
                self.flights.begin(id, FlightKind::Retry, Vec::new());
                self.spawn_flight(id, FlightKind::Retry, Some(operation), snapshot);
            }
        }
    }

    fn on_landed(&mut self, done: Landed) {
        let Landed {
            id,
            kind,
            operation,
            snapshot,
            result,
        } = done;

        let Some(landing) = self.flights.land(id) else {
            warn!("flight for {id:?} landed without a slot");
            return;
        };

        match kind {
            FlightKind::Live => self.on_live_landed(snapshot, result, landing.waiters),
            FlightKind::Retry => self.on_retry_landed(id, operation, result),
        }

        if landing.deferred_flush {
            let provider = Arc::clone(&self.default_provider);
            self.start_fresh(id, &provider, landing.deferred);
        } else if let Some(provider) = landing.rerun {
            self.debouncer.schedule(id, provider, Instant::now() + self.window);
        }
        self.drive_queue(Instant::now());
    }

    fn on_live_landed(
        &mut self,
        snapshot: PendingSnapshot,
        result: Result<FlushOutcome, SyncError>,
        waiters: Vec<Waiter>,
    ) {
        let id = snapshot.aggregate_id();
        let revision = snapshot.revision;
        match result {
            Ok(outcome) => {
                notify(waiters, &Ok(outcome.record.clone()));
                if snapshot.focus == WriteFocus::Aggregate {
                    let superseded = self.queue.supersede(id, revision, &outcome.record);
                    if superseded > 0 {
                        info!("r{revision} of {id:?} superseded {superseded} queued operation(s)");
                    }
                }
                self.emit(SyncEvent::Persisted {
                    aggregate_id: id,
                    revision,
                    tier: outcome.tier,
                    record: outcome.record,
                    from_queue: false,
                });
            }
            Err(err) => {
                notify(waiters, &Err(err.clone()));
                // The dirt this snapshot carried was consumed; widen the next
                // write so nothing is left behind.
                self.documents.mark_unsynced(id);
                if err.class().is_retryable() {
                    let description = format!("save funnel {} r{revision}", id.short());
                    let options = EnqueueOptions::new(self.max_attempts, description);
                    let operation = self.queue.enqueue(snapshot, options, Instant::now());
                    self.emit(SyncEvent::Queued {
                        aggregate_id: id,
                        operation,
                        revision,
                        error: Some(err),
                    });
                } else {
                    error!("funnel {id:?} r{revision} not persisted: {err}");
                    self.emit(SyncEvent::PersistFailed {
                        aggregate_id: id,
                        revision,
                        error: err,
                    });
                }
            }
        }
    }

    fn on_retry_landed(
        &mut self,
        id: FunnelId,
        operation: Option<Uuid>,
        result: Result<FlushOutcome, SyncError>,
    ) {
        let Some(operation) = operation else {
            return;
        };
        let tier = result.as_ref().map(|o| o.tier).unwrap_or(Tier::Aggregate);
        let outcome =
            self.queue
                .complete_attempt(id, operation, result.map(|o| o.record), Instant::now());
        match outcome {
            Some(AttemptOutcome::Succeeded {
                revision, record, ..
            }) => self.emit(SyncEvent::Persisted {
                aggregate_id: id,
                revision,
                tier,
                record,
                from_queue: true,
            }),
            Some(AttemptOutcome::Rescheduled {
                operation,
                attempts_made,
                delay,
                error,
            }) => {
                warn!("retry {attempts_made} for {id:?} failed: {error}; next in {delay:?}");
                self.emit(SyncEvent::RetryScheduled {
                    aggregate_id: id,
                    operation,
                    attempts_made,
                    delay,
                    error,
                });
            }
            Some(AttemptOutcome::Failed {
                revision, error, ..
            }) => {
                error!("funnel {id:?} r{revision} not persisted: {error}");
                self.emit(SyncEvent::PersistFailed {
                    aggregate_id: id,
                    revision,
                    error,
                });
            }
            None => debug!("result for unknown queued operation {operation}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use funnel_doc::DocumentStore;
    use funnel_store::{MemoryStore, collections};

    #[tokio::test(start_paused = true)]
    async fn test_provider_evaluated_once_at_expiry() {
        let store = Arc::new(MemoryStore::new());
        let docs = DocumentStore::shared();
        let engine = SyncEngine::spawn(store.clone(), docs.clone(), SyncConfig::default()).unwrap();
        let id = docs.create("Timed");

        let calls = Arc::new(AtomicUsize::new(0));
        let provider: SharedProvider = {
            let calls = Arc::clone(&calls);
            let docs = Arc::clone(&docs);
            Arc::new(ProviderFn(move |id: FunnelId| {
                calls.fetch_add(1, Ordering::SeqCst);
                docs.take_pending(id)
            }))
        };

        for _ in 0..3 {
            engine.schedule_with(id, Arc::clone(&provider), Duration::from_millis(300));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // Edit after the last reset but before expiry: must be in the write.
        docs.update(id, |doc| {
            doc.rename("Timed (final)");
            Ok(())
        })
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let row = store.record(collections::FUNNELS, &id.to_string()).unwrap();
        assert_eq!(row["name"], "Timed (final)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_returning_none_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let docs = DocumentStore::shared();
        let engine = SyncEngine::spawn(store.clone(), docs.clone(), SyncConfig::default()).unwrap();
        let id = docs.create("Never");

        let provider: SharedProvider =
            Arc::new(ProviderFn(|_: FunnelId| -> Option<PendingSnapshot> { None }));
        engine.schedule_with(id, provider, Duration::from_millis(50));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(store.calls().is_empty());
        assert_eq!(docs.read(id, |doc| doc.is_dirty()), Some(true));
    }

    #[test]
    fn test_event_aggregate_id() {
        let id = FunnelId::new();
        let event = SyncEvent::PersistFailed {
            aggregate_id: id,
            revision: 3,
            error: SyncError::Shutdown,
        };
        assert_eq!(event.aggregate_id(), id);
    }
}
