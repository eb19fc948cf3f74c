//! Schema-drift adapter.
//!
//! A remote whose migrations lag the client rejects payloads naming columns it
//! has not grown yet. Instead of failing the write, the adapter works out which
//! field was rejected, strips it, and remembers it per collection so later
//! payloads are narrowed before they are sent.
//!
//! Key columns (`id`, `funnel_id`, `step_id`) are never stripped: a rejection
//! naming one of them escalates to the next tier instead.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use dashmap::DashMap;
use regex::Regex;
use tracing::warn;

use funnel_store::{Record, StoreError};

use crate::constants::KEY_COLUMNS;

/// Rejection phrasings, most specific first. Group 1 is the column.
static REJECTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // PostgREST schema cache
        r"Could not find the '([^']+)' column of '[^']*' in the schema cache",
        // PostgreSQL
        r#"column "([^"]+)" of relation "[^"]*" does not exist"#,
        r#"column "?([A-Za-z_][\w.]*)"? does not exist"#,
        // SQLite
        r"has no column named ([A-Za-z_]\w*)",
        r"no such column: ([A-Za-z_][\w.]*)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Extract the rejected column from a backend message.
///
/// Table qualifiers (`steps.title`) are dropped. Returns `None` when no known
/// phrasing matches.
pub fn parse_rejected_field(message: &str) -> Option<String> {
    REJECTION_PATTERNS.iter().find_map(|re| {
        let column = re.captures(message)?.get(1)?.as_str();
        let column = column.rsplit('.').next().unwrap_or(column);
        (!column.is_empty()).then(|| column.to_string())
    })
}

/// The rejected column of a store error: the typed field if present, else
/// whatever the message names.
pub fn rejected_field(err: &StoreError) -> Option<String> {
    err.column
        .clone()
        .or_else(|| parse_rejected_field(&err.message))
}

/// Whether `field` may be removed from a payload.
pub fn is_strippable(field: &str) -> bool {
    !KEY_COLUMNS.contains(&field)
}

/// Remove the rejected field from `payload`.
///
/// `None` means "escalate": the hint names a key column or a field the payload
/// does not contain, so stripping cannot help.
pub fn narrow(payload: &Record, rejected_field_hint: &str) -> Option<Record> {
    if !is_strippable(rejected_field_hint) || !payload.contains_key(rejected_field_hint) {
        return None;
    }
    let mut narrowed = payload.clone();
    narrowed.remove(rejected_field_hint);
    Some(narrowed)
}

/// Remembers rejected columns per collection.
#[derive(Debug, Default)]
pub struct SchemaDriftAdapter {
    rejected: DashMap<String, BTreeSet<String>>,
}

impl SchemaDriftAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `collection` rejects `field`.
    ///
    /// Returns `true` only if the field is strippable and was not already
    /// known, i.e. when a same-tier retry could now succeed.
    pub fn remember(&self, collection: &str, field: &str) -> bool {
        if !is_strippable(field) {
            warn!("{collection} rejected key column {field:?}; cannot narrow");
            return false;
        }
        let added = self
            .rejected
            .entry(collection.to_string())
            .or_default()
            .insert(field.to_string());
        if added {
            warn!("schema drift: {collection} does not accept {field:?}; stripping from now on");
        }
        added
    }

    /// Strip every remembered field from a payload bound for `collection`.
    ///
    /// Returns the narrowed payload and the names of the fields removed.
    pub fn prepare(&self, collection: &str, mut payload: Record) -> (Record, Vec<String>) {
        let Some(rejected) = self.rejected.get(collection) else {
            return (payload, Vec::new());
        };
        let mut stripped = Vec::new();
        for field in rejected.iter() {
            if let Some(narrowed) = narrow(&payload, field) {
                payload = narrowed;
                stripped.push(field.clone());
            }
        }
        (payload, stripped)
    }

    /// Fields currently stripped from `collection`, sorted.
    pub fn rejected(&self, collection: &str) -> Vec<String> {
        self.rejected
            .get(collection)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget everything, e.g. after the remote schema was migrated.
    pub fn clear(&self) {
        self.rejected.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Record {
        json!({"funnel_id": "f1", "title": "Hi", "backButtonText": "Back"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_parse_known_phrasings() {
        let cases = [
            (
                "Could not find the 'backButtonText' column of 'steps' in the schema cache",
                "backButtonText",
            ),
            (
                r#"column "showProgressBar" of relation "steps" does not exist"#,
                "showProgressBar",
            ),
            ("column steps.buttonText does not exist", "buttonText"),
            ("table steps has no column named backButtonText", "backButtonText"),
            ("no such column: canvasElements", "canvasElements"),
        ];
        for (message, expected) in cases {
            assert_eq!(parse_rejected_field(message).as_deref(), Some(expected), "{message}");
        }
    }

    #[test]
    fn test_parse_unrecognized_is_none() {
        assert_eq!(parse_rejected_field("connection reset"), None);
        assert_eq!(parse_rejected_field(""), None);
    }

    #[test]
    fn test_typed_column_takes_priority() {
        let err = StoreError::backend("no such column: title").with_column("buttonText");
        assert_eq!(rejected_field(&err).as_deref(), Some("buttonText"));
    }

    #[test]
    fn test_narrow_strips_field() {
        let narrowed = narrow(&payload(), "backButtonText").unwrap();
        assert!(!narrowed.contains_key("backButtonText"));
        assert_eq!(narrowed["title"], "Hi");
    }

    #[test]
    fn test_narrow_refuses_keys_and_absent_fields() {
        assert_eq!(narrow(&payload(), "funnel_id"), None);
        assert_eq!(narrow(&payload(), "id"), None);
        assert_eq!(narrow(&payload(), "nonexistent"), None);
    }

    #[test]
    fn test_adapter_remembers_per_collection() {
        let adapter = SchemaDriftAdapter::new();
        assert!(adapter.remember("steps", "backButtonText"));
        assert!(!adapter.remember("steps", "backButtonText"));
        assert!(!adapter.remember("steps", "step_id"));

        let (narrowed, stripped) = adapter.prepare("steps", payload());
        assert_eq!(stripped, vec!["backButtonText".to_string()]);
        assert!(!narrowed.contains_key("backButtonText"));

        let (untouched, stripped) = adapter.prepare("funnels", payload());
        assert!(stripped.is_empty());
        assert_eq!(untouched, payload());

        adapter.clear();
        assert!(adapter.rejected("steps").is_empty());
    }
}
