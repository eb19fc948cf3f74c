//! Sync error taxonomy.
//!
//! Every store failure is classified into an [`ErrorClass`], which decides
//! what the tier chain and the retry queue do next:
//!
//! |--------------------|---------------------------------------------------|
//! | Class              | Handling                                          |
//! |--------------------|---------------------------------------------------|
//! | `TransientNetwork` | retry same tier, then escalate; queue retries     |
//! | `SchemaDrift`      | strip the rejected field, retry same tier once    |
//! | `Authorization`    | abort the chain, surface immediately              |
//! | `Validation`       | abort the chain, surface immediately              |
//! | `Unknown`          | escalate to the next tier                         |
//! |--------------------|---------------------------------------------------|
//!
//! Classification order: the store's typed kind, then its error code, then
//! message heuristics, then `Unknown`.

use funnel_store::{StoreError, StoreErrorKind};
use funnel_types::FunnelId;
use strum::{Display, IntoStaticStr};
use thiserror::Error;

use crate::drift;

/// How a failure should be handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    TransientNetwork,
    SchemaDrift,
    Authorization,
    Validation,
    Unknown,
}

impl ErrorClass {
    /// Whether a later attempt could succeed without user intervention.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Authorization | ErrorClass::Validation)
    }
}

/// Errors surfaced by the sync engine.
///
/// `Clone` so every coalesced waiter receives the same outcome.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("schema drift on {collection}: {message}")]
    SchemaDrift {
        collection: String,
        /// Rejected column, when it could be determined.
        field: Option<String>,
        message: String,
    },

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Unknown(String),

    #[error("all write tiers failed for funnel {aggregate}: {last}")]
    TiersExhausted {
        aggregate: FunnelId,
        last: Box<SyncError>,
    },

    #[error("gave up on funnel {aggregate} after {attempts} attempts: {last}")]
    RetriesExhausted {
        aggregate: FunnelId,
        attempts: u32,
        last: Box<SyncError>,
    },

    #[error("unknown funnel {0}")]
    UnknownAggregate(FunnelId),

    #[error("queue journal error: {0}")]
    Journal(String),

    #[error("invalid sync config: {0}")]
    Config(String),

    #[error("sync engine shut down")]
    Shutdown,
}

impl SyncError {
    /// The class that decides retry/escalation.
    ///
    /// Wrapper errors report the class of the failure they wrap.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::TransientNetwork(_) => ErrorClass::TransientNetwork,
            SyncError::SchemaDrift { .. } => ErrorClass::SchemaDrift,
            SyncError::Authorization(_) => ErrorClass::Authorization,
            SyncError::Validation(_) | SyncError::UnknownAggregate(_) | SyncError::Config(_) => {
                ErrorClass::Validation
            }
            SyncError::TiersExhausted { last, .. } | SyncError::RetriesExhausted { last, .. } => {
                last.class()
            }
            SyncError::Unknown(_) | SyncError::Journal(_) | SyncError::Shutdown => {
                ErrorClass::Unknown
            }
        }
    }

    /// Classify a store failure on `collection`.
    pub fn from_store(collection: &str, err: &StoreError) -> Self {
        let message = err.to_string();
        match classify(err) {
            ErrorClass::TransientNetwork => SyncError::TransientNetwork(message),
            ErrorClass::SchemaDrift => SyncError::SchemaDrift {
                collection: collection.to_string(),
                field: drift::rejected_field(err),
                message: err.message.clone(),
            },
            ErrorClass::Authorization => SyncError::Authorization(message),
            ErrorClass::Validation => SyncError::Validation(message),
            ErrorClass::Unknown => SyncError::Unknown(message),
        }
    }

    /// The innermost failure, unwrapping exhaustion wrappers.
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::TiersExhausted { last, .. } | SyncError::RetriesExhausted { last, .. } => {
                last.root()
            }
            other => other,
        }
    }
}

const DRIFT_CODES: &[&str] = &["42703", "PGRST204", "PGRST200"];
const AUTH_CODES: &[&str] = &["42501", "28000", "28P01", "PGRST301", "PGRST302", "401", "403"];
const TRANSIENT_CODES: &[&str] = &[
    "08000", "08001", "08003", "08006", "57P01", "57P03", "53300", "502", "503", "504",
];
const VALIDATION_CODES: &[&str] = &["22P02", "23502", "23503", "23505", "23514", "400", "422"];

/// Map a store error to its handling class.
pub fn classify(err: &StoreError) -> ErrorClass {
    match err.kind {
        StoreErrorKind::Network | StoreErrorKind::Timeout => return ErrorClass::TransientNetwork,
        StoreErrorKind::Unauthorized => return ErrorClass::Authorization,
        StoreErrorKind::UnknownColumn => return ErrorClass::SchemaDrift,
        StoreErrorKind::Invalid => return ErrorClass::Validation,
        StoreErrorKind::NotFound | StoreErrorKind::PayloadTooLarge => return ErrorClass::Unknown,
        StoreErrorKind::Backend => {}
    }

    if let Some(code) = err.code.as_deref() {
        if DRIFT_CODES.contains(&code) {
            return ErrorClass::SchemaDrift;
        }
        if AUTH_CODES.contains(&code) {
            return ErrorClass::Authorization;
        }
        if TRANSIENT_CODES.contains(&code) {
            return ErrorClass::TransientNetwork;
        }
        if VALIDATION_CODES.contains(&code) {
            return ErrorClass::Validation;
        }
    }

    classify_message(&err.message)
}

fn classify_message(message: &str) -> ErrorClass {
    let msg = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&["jwt", "permission denied", "row-level security", "not authorized", "unauthorized"]) {
        ErrorClass::Authorization
    } else if has(&["schema cache", "no such column", "has no column named"])
        || (msg.contains("column") && msg.contains("does not exist"))
    {
        ErrorClass::SchemaDrift
    } else if has(&[
        "timed out",
        "timeout",
        "connection",
        "network",
        "fetch failed",
        "temporarily unavailable",
    ]) {
        ErrorClass::TransientNetwork
    } else if has(&["violates", "invalid input syntax", "not-null constraint"]) {
        ErrorClass::Validation
    } else {
        ErrorClass::Unknown
    }
}
