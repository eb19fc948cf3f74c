//! The funnel aggregate: the top-level document owning its steps.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::{FunnelId, StepId};
use crate::step::Step;

/// Publication status of a funnel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum FunnelStatus {
    /// Being edited, not visible to visitors.
    #[default]
    Draft,
    /// Live.
    #[strum(serialize = "published", serialize = "live")]
    Published,
    /// Retired; kept for reporting.
    Archived,
}

impl FunnelStatus {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelStatus::Draft => "draft",
            FunnelStatus::Published => "published",
            FunnelStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for FunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A funnel and its ordered steps.
///
/// Steps are held behind `Arc` so that cloning a funnel (taking a snapshot)
/// only bumps reference counts. Writers go through `Arc::make_mut`, which
/// copies a step only when a snapshot still shares it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Funnel {
    pub id: FunnelId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: FunnelStatus,
    /// Free-form settings object (theme, tracking pixels, domain, ...).
    #[serde(default = "empty_settings")]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub steps: Vec<Arc<Step>>,
    /// Unix milliseconds of the last local change to a funnel-row field.
    pub updated_at: u64,
}

fn empty_settings() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Funnel {
    /// Create an empty draft funnel.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: FunnelId::new(),
            name: name.into(),
            description: String::new(),
            status: FunnelStatus::Draft,
            settings: empty_settings(),
            steps: Vec::new(),
            updated_at: crate::now_millis(),
        }
    }

    /// Find a step by id.
    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id).map(|s| s.as_ref())
    }

    /// Position of a step in the ordered list.
    pub fn step_index(&self, id: StepId) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Total number of canvas elements across all steps.
    pub fn element_count(&self) -> usize {
        self.steps.iter().map(|s| s.canvas_elements.len()).sum()
    }

    /// Check that `order_index` values are exactly `0..steps.len()` in list order.
    pub fn order_is_contiguous(&self) -> bool {
        self.steps
            .iter()
            .enumerate()
            .all(|(i, s)| s.order_index as usize == i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_aliases() {
        assert_eq!(FunnelStatus::from_str("LIVE"), Some(FunnelStatus::Published));
        assert_eq!(FunnelStatus::from_str("draft"), Some(FunnelStatus::Draft));
        assert_eq!(FunnelStatus::from_str("gone"), None);
        assert_eq!(FunnelStatus::Archived.to_string(), "archived");
    }

    #[test]
    fn test_new_funnel_is_empty_draft() {
        let funnel = Funnel::new("Webinar");
        assert_eq!(funnel.status, FunnelStatus::Draft);
        assert!(funnel.settings.as_object().is_some_and(|m| m.is_empty()));
        assert!(funnel.order_is_contiguous());
        assert_eq!(funnel.element_count(), 0);
    }

    #[test]
    fn test_clone_shares_steps() {
        let mut funnel = Funnel::new("Shared");
        funnel.steps.push(Arc::new(Step::new(funnel.id, 0, "Opt-in")));
        let copy = funnel.clone();
        assert!(Arc::ptr_eq(&funnel.steps[0], &copy.steps[0]));
    }
}
