//! Remote persistence for funnelsync.
//!
//! The sync engine talks to a remote record store through the [`RemoteStore`]
//! trait: upsert, partial update, delete and equality-filtered select over
//! named collections of JSON-shaped records. Backends decide how that maps to
//! storage; the engine only cares about the semantics below.
//!
//! # Collections
//!
//! |-------------------|-----------------------------------------------------|
//! | Collection        | Row                                                 |
//! |-------------------|-----------------------------------------------------|
//! | `funnels`         | name, description, status, settings, updated_at     |
//! | `steps`           | funnel_id, order_index, title, buttonText, ...      |
//! | `canvas_elements` | step_id, type, position, config (normalized mode)   |
//! |-------------------|-----------------------------------------------------|
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process, with scripted faults, latency and a call log.
//!   Used by tests and the demo's fault injection.
//! - [`SqliteStore`]: a real SQL database. Column mismatches surface as genuine
//!   "no such column" errors, which is what schema drift looks like in practice.
//!
//! [`SqliteJournal`] is unrelated to the remote: it is a local, durable log the
//! retry queue can mirror itself into.

use async_trait::async_trait;
use serde_json::Value;

mod error;
pub mod journal;
pub mod memory;
pub mod sqlite;

pub use error::{StoreError, StoreErrorKind};
pub use journal::{JournalEntry, JournalError, QueueJournal, SqliteJournal};
pub use memory::{MemoryStore, StoreCall, StoreOp};
pub use sqlite::SqliteStore;

/// One remote row as column → JSON value.
pub type Record = serde_json::Map<String, Value>;

/// Result type for store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Collection names used by the sync engine.
pub mod collections {
    pub const FUNNELS: &str = "funnels";
    pub const STEPS: &str = "steps";
    pub const CANVAS_ELEMENTS: &str = "canvas_elements";

    /// Every collection a backend is expected to serve.
    pub const ALL: [&str; 3] = [FUNNELS, STEPS, CANVAS_ELEMENTS];
}

/// Conjunction of equality conditions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<(String, Value)>,
}

impl Filter {
    /// Match every row.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and_eq(column, value)
    }

    pub fn and_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    /// Evaluate against a row. Missing columns never match.
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions
            .iter()
            .all(|(column, value)| record.get(column) == Some(value))
    }
}

/// Sort order for selects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

/// A remote record store.
///
/// All calls are independent: there are no transactions, and a multi-row
/// write is a sequence of single-row calls that can fail part-way.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert the row, or overwrite the given fields if `id` already exists.
    /// Returns the stored row.
    async fn upsert_record(&self, collection: &str, id: &str, fields: Record)
        -> StoreResult<Record>;

    /// Overwrite the given fields of an existing row. Fails with
    /// [`StoreErrorKind::NotFound`] if the row does not exist.
    async fn update_record(&self, collection: &str, id: &str, patch: Record)
        -> StoreResult<Record>;

    /// Delete a row. Deleting a missing row is not an error.
    async fn delete_record(&self, collection: &str, id: &str) -> StoreResult<()>;

    async fn select_records(
        &self,
        collection: &str,
        filter: &Filter,
        order: Option<&Order>,
    ) -> StoreResult<Vec<Record>>;
}

/// Sort rows in place the way a remote `ORDER BY` would.
///
/// Numbers compare numerically, strings lexically; rows missing the column
/// sort first.
pub fn sort_records(rows: &mut [Record], order: &Order) {
    rows.sort_by(|a, b| {
        let ord = compare_values(a.get(&order.column), b.get(&order.column));
        if order.ascending { ord } else { ord.reverse() }
    });
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_matches_all_conditions() {
        let r = row(json!({"funnel_id": "f1", "order_index": 2}));
        assert!(Filter::all().matches(&r));
        assert!(Filter::eq("funnel_id", "f1").matches(&r));
        assert!(!Filter::eq("funnel_id", "f1").and_eq("order_index", 3).matches(&r));
        assert!(!Filter::eq("missing", "x").matches(&r));
    }

    #[test]
    fn test_sort_records_numeric_and_descending() {
        let mut rows = vec![
            row(json!({"order_index": 10})),
            row(json!({"order_index": 2})),
            row(json!({})),
        ];
        sort_records(&mut rows, &Order::asc("order_index"));
        assert_eq!(rows[0].get("order_index"), None);
        assert_eq!(rows[1]["order_index"], 2);
        assert_eq!(rows[2]["order_index"], 10);

        sort_records(&mut rows, &Order::desc("order_index"));
        assert_eq!(rows[0]["order_index"], 10);
    }
}
