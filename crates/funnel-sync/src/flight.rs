//! Single-flight table.
//!
//! At most one remote call chain per aggregate is in flight, whether it was
//! started by a debounce expiry, `flush_now`, or the retry queue. Requests that
//! arrive while a flight is running never start a second one:
//!
//! - a live request during a live flight joins it (its waiter gets the running
//!   attempt's result) and marks the slot for one rerun;
//! - a `flush_now` during a retry flight is deferred and runs as a fresh live
//!   flush once the retry resolves;
//! - a debounce expiry during any flight marks the slot for rerun.
//!
//! A rerun is one more debounce cycle, started when the flight completes, so
//! edits made during the flight are persisted with the latest snapshot.

use std::collections::HashMap;

use tokio::sync::oneshot;

use funnel_store::Record;
use funnel_types::FunnelId;

use crate::error::SyncError;

/// Reply channel for a caller awaiting a flush.
pub type Waiter = oneshot::Sender<Result<Record, SyncError>>;

/// Who started the running flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlightKind {
    /// Debounce expiry or `flush_now`.
    Live,
    /// A retry-queue attempt.
    Retry,
}

/// What happened to a live request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Nothing was running; the caller must start the flight.
    Start,
    /// Attached to the running live flight; a rerun is queued.
    Joined,
    /// A retry is running; the request runs after it.
    Deferred,
}

struct Slot<P> {
    kind: FlightKind,
    waiters: Vec<Waiter>,
    rerun: Option<P>,
    deferred: Vec<Waiter>,
    deferred_flush: bool,
}

/// Everything the engine must act on once a flight resolves.
pub struct Landing<P> {
    pub kind: FlightKind,
    /// Callers owed the flight's result.
    pub waiters: Vec<Waiter>,
    /// Provider for one more debounce cycle.
    pub rerun: Option<P>,
    /// Whether a deferred `flush_now` must start now.
    pub deferred_flush: bool,
    /// Callers owed the deferred flush's result.
    pub deferred: Vec<Waiter>,
}

/// In-flight slots keyed by aggregate.
pub struct FlightTable<P> {
    slots: HashMap<FunnelId, Slot<P>>,
}

impl<P> Default for FlightTable<P> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<P> FlightTable<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self, id: FunnelId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn kind(&self, id: FunnelId) -> Option<FlightKind> {
        self.slots.get(&id).map(|slot| slot.kind)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Claim the slot for a new flight. Returns `false` if one is running.
    pub fn begin(&mut self, id: FunnelId, kind: FlightKind, waiters: Vec<Waiter>) -> bool {
        if self.slots.contains_key(&id) {
            return false;
        }
        self.slots.insert(
            id,
            Slot {
                kind,
                waiters,
                rerun: None,
                deferred: Vec::new(),
                deferred_flush: false,
            },
        );
        true
    }

    /// Route a `flush_now` for an aggregate.
    ///
    /// On [`Admission::Start`] the waiter is handed back untouched for the
    /// caller to start the flight with.
    pub fn request_flush(
        &mut self,
        id: FunnelId,
        waiter: Waiter,
        rerun: P,
    ) -> (Admission, Option<Waiter>) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return (Admission::Start, Some(waiter));
        };
        match slot.kind {
            FlightKind::Live => {
                slot.waiters.push(waiter);
                slot.rerun = Some(rerun);
                (Admission::Joined, None)
            }
            FlightKind::Retry => {
                slot.deferred.push(waiter);
                slot.deferred_flush = true;
                (Admission::Deferred, None)
            }
        }
    }

    /// A debounce expiry found the aggregate busy: run one more cycle later.
    ///
    /// Returns `false` (and drops `provider`) if nothing is in flight.
    pub fn mark_rerun(&mut self, id: FunnelId, provider: P) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.rerun = Some(provider);
                true
            }
            None => false,
        }
    }

    /// Drop a pending rerun (aggregate torn down).
    pub fn clear_rerun(&mut self, id: FunnelId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.rerun = None;
        }
    }

    /// Release the slot.
    pub fn land(&mut self, id: FunnelId) -> Option<Landing<P>> {
        self.slots.remove(&id).map(|slot| Landing {
            kind: slot.kind,
            waiters: slot.waiters,
            rerun: slot.rerun,
            deferred_flush: slot.deferred_flush,
            deferred: slot.deferred,
        })
    }
}

/// Deliver one result to every waiter. Dropped receivers are ignored.
pub fn notify(waiters: Vec<Waiter>, result: &Result<Record, SyncError>) {
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter() -> (Waiter, oneshot::Receiver<Result<Record, SyncError>>) {
        oneshot::channel()
    }

    #[test]
    fn test_begin_is_exclusive() {
        let mut table: FlightTable<()> = FlightTable::new();
        let id = FunnelId::new();
        assert!(table.begin(id, FlightKind::Live, Vec::new()));
        assert!(!table.begin(id, FlightKind::Retry, Vec::new()));
        assert_eq!(table.kind(id), Some(FlightKind::Live));
        assert!(table.begin(FunnelId::new(), FlightKind::Live, Vec::new()));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_flush_during_live_flight_joins_and_reruns() {
        let mut table = FlightTable::new();
        let id = FunnelId::new();
        let (first, mut first_rx) = waiter();
        table.begin(id, FlightKind::Live, vec![first]);

        let (second, mut second_rx) = waiter();
        let (admission, handed_back) = table.request_flush(id, second, "provider");
        assert_eq!(admission, Admission::Joined);
        assert!(handed_back.is_none());

        let landing = table.land(id).unwrap();
        assert_eq!(landing.rerun, Some("provider"));
        assert!(!landing.deferred_flush);
        assert_eq!(landing.waiters.len(), 2);

        notify(landing.waiters, &Ok(Record::new()));
        assert!(first_rx.try_recv().unwrap().is_ok());
        assert!(second_rx.try_recv().unwrap().is_ok());
        assert!(!table.is_in_flight(id));
    }

    #[test]
    fn test_flush_during_retry_is_deferred() {
        let mut table = FlightTable::new();
        let id = FunnelId::new();
        table.begin(id, FlightKind::Retry, Vec::new());

        let (w, _rx) = waiter();
        let (admission, _) = table.request_flush(id, w, ());
        assert_eq!(admission, Admission::Deferred);

        let landing = table.land(id).unwrap();
        assert_eq!(landing.kind, FlightKind::Retry);
        assert!(landing.waiters.is_empty());
        assert!(landing.deferred_flush);
        assert_eq!(landing.deferred.len(), 1);
    }

    #[test]
    fn test_idle_flush_is_handed_back() {
        let mut table = FlightTable::new();
        let (w, _rx) = waiter();
        let (admission, handed_back) = table.request_flush(FunnelId::new(), w, ());
        assert_eq!(admission, Admission::Start);
        assert!(handed_back.is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_rerun_requires_flight() {
        let mut table = FlightTable::new();
        let id = FunnelId::new();
        assert!(!table.mark_rerun(id, 1));
        table.begin(id, FlightKind::Live, Vec::new());
        assert!(table.mark_rerun(id, 2));
        table.clear_rerun(id);
        assert_eq!(table.land(id).unwrap().rerun, None);
    }
}
