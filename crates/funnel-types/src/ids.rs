//! Typed identifiers for funnels, steps, and canvas elements.
//!
//! All ID types wrap UUIDv7 (time-ordered, globally unique). They are stored as
//! standard UUID text in the remote store and display the same way in logs.
//! The `short()` form (first 8 hex chars) is for human-facing output only,
//! never used as a lookup key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A funnel (aggregate) identifier.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunnelId(uuid::Uuid);

/// A step identifier.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(uuid::Uuid);

/// A canvas element identifier.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(uuid::Uuid);

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_typed_id {
    ($T:ident, $name:literal) => {
        impl $T {
            /// Create a new time-ordered ID (UUIDv7).
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }

            /// First 8 hex characters, for display. Not unique enough for lookup.
            pub fn short(&self) -> String {
                self.0.as_simple().to_string()[..8].to_string()
            }

            /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                uuid::Uuid::parse_str(s).map(Self)
            }

            /// The all-zero ID. Only used as a sentinel.
            pub fn nil() -> Self {
                Self(uuid::Uuid::nil())
            }

            /// Check if this is the nil ID.
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<uuid::Uuid> for $T {
            fn from(u: uuid::Uuid) -> Self {
                Self(u)
            }
        }

        impl From<$T> for uuid::Uuid {
            fn from(id: $T) -> uuid::Uuid {
                id.0
            }
        }

        impl std::str::FromStr for $T {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Full UUID with hyphens: this is also the store's key format
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.short())
            }
        }
    };
}

impl_typed_id!(FunnelId, "FunnelId");
impl_typed_id!(StepId, "StepId");
impl_typed_id!(ElementId, "ElementId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parse_roundtrip() {
        let id = StepId::new();
        let parsed = StepId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let a = FunnelId::new();
        let b = FunnelId::new();
        assert!(a < b);
    }

    #[test]
    fn test_debug_uses_short_form() {
        let id = ElementId::new();
        let dbg = format!("{id:?}");
        assert!(dbg.starts_with("ElementId("));
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_nil_sentinel() {
        assert!(FunnelId::nil().is_nil());
        assert!(!FunnelId::new().is_nil());
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = FunnelId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
