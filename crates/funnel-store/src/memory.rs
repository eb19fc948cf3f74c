//! In-memory remote store.
//!
//! Behaves like a permissive record store until told otherwise: give it a
//! column list and it rejects unknown fields the way a stale remote schema
//! would; script faults and it fails the next N matching calls; set a latency
//! and every call sleeps first. All calls are logged for later inspection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::{Filter, Order, Record, RemoteStore, StoreError, StoreResult, sort_records};

/// Store operation, for fault matching and the call log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Upsert,
    Update,
    Delete,
    Select,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOp::Upsert => "upsert",
            StoreOp::Update => "update",
            StoreOp::Delete => "delete",
            StoreOp::Select => "select",
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged call.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreCall {
    pub op: StoreOp,
    pub collection: String,
    pub id: Option<String>,
    /// Field names sent (upsert/update), sorted.
    pub fields: Vec<String>,
    /// Whether the call returned `Ok`.
    pub succeeded: bool,
}

#[derive(Debug)]
struct Fault {
    op: Option<StoreOp>,
    collection: Option<String>,
    /// `None` = fail forever.
    remaining: Option<usize>,
    error: StoreError,
}

impl Fault {
    fn matches(&self, op: StoreOp, collection: &str) -> bool {
        self.op.is_none_or(|o| o == op)
            && self.collection.as_deref().is_none_or(|c| c == collection)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<String, BTreeMap<String, Record>>,
    /// Collections with an enforced column list.
    columns: HashMap<String, BTreeSet<String>>,
    faults: Vec<Fault>,
    calls: Vec<StoreCall>,
    latency: Duration,
}

impl MemoryState {
    /// Consume the first fault matching this call, if any.
    fn take_fault(&mut self, op: StoreOp, collection: &str) -> Option<StoreError> {
        let idx = self.faults.iter().position(|f| f.matches(op, collection))?;
        let fault = &mut self.faults[idx];
        let error = fault.error.clone();
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.faults.remove(idx);
            }
        }
        Some(error)
    }

    fn check_columns(&self, collection: &str, fields: &Record) -> StoreResult<()> {
        let Some(known) = self.columns.get(collection) else {
            return Ok(());
        };
        // Report the first unknown column in key order, like a real remote would.
        match fields.keys().find(|k| !known.contains(k.as_str())) {
            Some(column) => Err(StoreError::unknown_column(collection, column)),
            None => Ok(()),
        }
    }
}

/// In-memory [`RemoteStore`] with fault injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when the call finishes.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict `collection` to the given columns (`id` is always allowed).
    pub fn set_columns(&self, collection: &str, columns: &[&str]) {
        let mut known: BTreeSet<String> = columns.iter().map(|c| c.to_string()).collect();
        known.insert("id".to_string());
        self.state.lock().columns.insert(collection.to_string(), known);
    }

    /// Remove a column from an enforced collection, simulating a migration lag.
    pub fn drop_column(&self, collection: &str, column: &str) {
        if let Some(known) = self.state.lock().columns.get_mut(collection) {
            known.remove(column);
        }
    }

    /// Lift column enforcement for `collection`.
    pub fn allow_any_columns(&self, collection: &str) {
        self.state.lock().columns.remove(collection);
    }

    /// Fail every matching call until cleared. `None` matches anything.
    pub fn fail(&self, op: Option<StoreOp>, collection: Option<&str>, error: StoreError) {
        self.push_fault(op, collection, None, error);
    }

    /// Fail the next `times` matching calls.
    pub fn fail_times(
        &self,
        op: Option<StoreOp>,
        collection: Option<&str>,
        times: usize,
        error: StoreError,
    ) {
        if times > 0 {
            self.push_fault(op, collection, Some(times), error);
        }
    }

    /// Fail every call of every kind (the remote is "down").
    pub fn fail_all(&self, error: StoreError) {
        self.fail(None, None, error);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    fn push_fault(
        &self,
        op: Option<StoreOp>,
        collection: Option<&str>,
        remaining: Option<usize>,
        error: StoreError,
    ) {
        self.state.lock().faults.push(Fault {
            op,
            collection: collection.map(str::to_string),
            remaining,
            error,
        });
    }

    /// Sleep this long at the start of every call.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Seed a row directly, bypassing faults and column checks.
    pub fn insert_raw(&self, collection: &str, id: &str, mut record: Record) {
        record.insert("id".to_string(), Value::String(id.to_string()));
        self.state
            .lock()
            .rows
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), record);
    }

    pub fn record(&self, collection: &str, id: &str) -> Option<Record> {
        self.state
            .lock()
            .rows
            .get(collection)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// All rows of a collection, in id order.
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.state
            .lock()
            .rows
            .get(collection)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    /// Number of logged calls matching `op` and `collection` (`None` = any).
    pub fn call_count(&self, op: Option<StoreOp>, collection: Option<&str>) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| op.is_none_or(|o| o == c.op))
            .filter(|c| collection.is_none_or(|name| name == c.collection))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Highest number of calls ever observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Enter a call: bump concurrency counters and apply latency.
    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn log(
        state: &mut MemoryState,
        op: StoreOp,
        collection: &str,
        id: Option<&str>,
        fields: Option<&Record>,
        succeeded: bool,
    ) {
        trace!("memory store {op} {collection} {id:?} ok={succeeded}");
        state.calls.push(StoreCall {
            op,
            collection: collection.to_string(),
            id: id.map(str::to_string),
            fields: fields
                .map(|f| f.keys().cloned().collect())
                .unwrap_or_default(),
            succeeded,
        });
    }

    /// Shared body of upsert/update.
    fn write(
        &self,
        op: StoreOp,
        collection: &str,
        id: &str,
        fields: Record,
    ) -> StoreResult<Record> {
        let mut state = self.state.lock();
        let result = Self::apply_write(&mut state, op, collection, id, &fields);
        Self::log(&mut state, op, collection, Some(id), Some(&fields), result.is_ok());
        result
    }

    fn apply_write(
        state: &mut MemoryState,
        op: StoreOp,
        collection: &str,
        id: &str,
        fields: &Record,
    ) -> StoreResult<Record> {
        if let Some(err) = state.take_fault(op, collection) {
            return Err(err);
        }
        state.check_columns(collection, fields)?;

        let rows = state.rows.entry(collection.to_string()).or_default();
        if op == StoreOp::Update && !rows.contains_key(id) {
            return Err(StoreError::not_found(collection, id));
        }
        let row = rows.entry(id.to_string()).or_default();
        for (key, value) in fields {
            row.insert(key.clone(), value.clone());
        }
        row.insert("id".to_string(), Value::String(id.to_string()));
        Ok(row.clone())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn upsert_record(
        &self,
        collection: &str,
        id: &str,
        fields: Record,
    ) -> StoreResult<Record> {
        let _guard = self.enter().await;
        self.write(StoreOp::Upsert, collection, id, fields)
    }

    async fn update_record(
        &self,
        collection: &str,
        id: &str,
        patch: Record,
    ) -> StoreResult<Record> {
        let _guard = self.enter().await;
        self.write(StoreOp::Update, collection, id, patch)
    }

    async fn delete_record(&self, collection: &str, id: &str) -> StoreResult<()> {
        let _guard = self.enter().await;
        let mut state = self.state.lock();
        let result = match state.take_fault(StoreOp::Delete, collection) {
            Some(err) => Err(err),
            None => {
                if let Some(rows) = state.rows.get_mut(collection) {
                    rows.remove(id);
                }
                Ok(())
            }
        };
        Self::log(&mut state, StoreOp::Delete, collection, Some(id), None, result.is_ok());
        result
    }

    async fn select_records(
        &self,
        collection: &str,
        filter: &Filter,
        order: Option<&Order>,
    ) -> StoreResult<Vec<Record>> {
        let _guard = self.enter().await;
        let mut state = self.state.lock();
        let result = match state.take_fault(StoreOp::Select, collection) {
            Some(err) => Err(err),
            None => {
                let mut rows: Vec<Record> = state
                    .rows
                    .get(collection)
                    .map(|rows| rows.values().filter(|r| filter.matches(r)).cloned().collect())
                    .unwrap_or_default();
                if let Some(order) = order {
                    sort_records(&mut rows, order);
                }
                Ok(rows)
            }
        };
        Self::log(&mut state, StoreOp::Select, collection, None, None, result.is_ok());
        result
    }
}
