//! Debounce coordinator state.
//!
//! One timer per aggregate. Scheduling again resets the deadline and replaces
//! the provider; nothing is evaluated until expiry, so the flush always sees
//! the state as of the deadline, not as of the first mutation.
//!
//! This is a pure state machine: the engine's event loop owns it, sleeps until
//! [`Debouncer::next_deadline`], then drains [`Debouncer::take_expired`].

use std::collections::HashMap;

use tokio::time::Instant;

use funnel_types::FunnelId;

#[derive(Debug)]
struct Pending<P> {
    deadline: Instant,
    provider: P,
}

/// Per-aggregate debounce timers carrying a provider of type `P`.
#[derive(Debug)]
pub struct Debouncer<P> {
    pending: HashMap<FunnelId, Pending<P>>,
}

impl<P> Default for Debouncer<P> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<P> Debouncer<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm or re-arm the timer for `id`. Returns `true` if an existing timer
    /// was reset.
    pub fn schedule(&mut self, id: FunnelId, provider: P, deadline: Instant) -> bool {
        self.pending
            .insert(id, Pending { deadline, provider })
            .is_some()
    }

    /// Disarm the timer for `id`, returning its provider.
    pub fn cancel(&mut self, id: FunnelId) -> Option<P> {
        self.pending.remove(&id).map(|p| p.provider)
    }

    pub fn is_pending(&self, id: FunnelId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn deadline(&self, id: FunnelId) -> Option<Instant> {
        self.pending.get(&id).map(|p| p.deadline)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Remove and return every timer whose deadline is at or before `now`,
    /// earliest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(FunnelId, P)> {
        let mut due: Vec<(Instant, FunnelId)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, p)| (p.deadline, *id))
            .collect();
        due.sort();
        due.into_iter()
            .filter_map(|(_, id)| self.pending.remove(&id).map(|p| (id, p.provider)))
            .collect()
    }
}
