//! Store error type.
//!
//! Backends report failures as a [`StoreError`] carrying a coarse kind plus
//! whatever the remote said verbatim. Classification into retry policy is the
//! sync engine's job; backends only describe what happened.

use std::fmt;

use thiserror::Error;

/// Coarse category of a backend failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// Connection refused, reset, DNS failure.
    Network,
    /// The call did not complete in time.
    Timeout,
    /// Credentials missing, expired, or insufficient.
    Unauthorized,
    /// The payload named a column the remote schema does not have.
    UnknownColumn,
    /// The target row does not exist.
    NotFound,
    PayloadTooLarge,
    /// The remote rejected the payload's shape or values.
    Invalid,
    /// Anything else the backend could not describe better.
    Backend,
}

impl StoreErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreErrorKind::Network => "network",
            StoreErrorKind::Timeout => "timeout",
            StoreErrorKind::Unauthorized => "unauthorized",
            StoreErrorKind::UnknownColumn => "unknown_column",
            StoreErrorKind::NotFound => "not_found",
            StoreErrorKind::PayloadTooLarge => "payload_too_large",
            StoreErrorKind::Invalid => "invalid",
            StoreErrorKind::Backend => "backend",
        }
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed store call.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    /// Remote error code, if the backend has one (`42703`, `PGRST204`, ...).
    pub code: Option<String>,
    /// Offending column, when the backend names it structurally.
    pub column: Option<String>,
    /// Human-readable message exactly as the remote produced it.
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            column: None,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Timeout, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Unauthorized, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Invalid, message)
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Backend, message)
    }

    pub fn not_found(collection: &str, id: &str) -> Self {
        Self::new(
            StoreErrorKind::NotFound,
            format!("no row with id {id} in {collection}"),
        )
    }

    /// Unknown-column rejection phrased the way a PostgREST schema cache reports it.
    pub fn unknown_column(collection: &str, column: &str) -> Self {
        Self {
            kind: StoreErrorKind::UnknownColumn,
            code: Some("PGRST204".to_string()),
            column: Some(column.to_string()),
            message: format!(
                "Could not find the '{column}' column of '{collection}' in the schema cache"
            ),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        let message = err.to_string();
        let kind = match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                StoreErrorKind::Timeout
            }
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == ErrorCode::TooBig =>
            {
                StoreErrorKind::PayloadTooLarge
            }
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                StoreErrorKind::Invalid
            }
            _ if message.contains("no such column") || message.contains("has no column named") => {
                StoreErrorKind::UnknownColumn
            }
            _ => StoreErrorKind::Backend,
        };
        Self::new(kind, message)
    }
}
