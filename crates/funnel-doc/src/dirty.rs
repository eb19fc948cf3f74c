//! Dirty tracking: what changed since the last flush.
//!
//! The sync engine persists whatever a document looks like at flush time, but
//! it picks *how* to persist from the accumulated dirt. One step with a couple
//! of changed fields can be written as a narrow patch; anything structural
//! needs the whole aggregate.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use funnel_types::StepId;

/// A persisted column of the `steps` collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepField {
    OrderIndex,
    Title,
    ButtonText,
    BackButtonText,
    ShowProgressBar,
    CanvasElements,
}

impl StepField {
    /// Column name in the remote `steps` collection.
    pub fn column(&self) -> &'static str {
        match self {
            StepField::OrderIndex => "order_index",
            StepField::Title => "title",
            StepField::ButtonText => "buttonText",
            StepField::BackButtonText => "backButtonText",
            StepField::ShowProgressBar => "showProgressBar",
            StepField::CanvasElements => "canvasElements",
        }
    }
}

/// A persisted column of the `funnels` collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelField {
    Name,
    Description,
    Status,
    Settings,
}

impl FunnelField {
    /// Column name in the remote `funnels` collection.
    pub fn column(&self) -> &'static str {
        match self {
            FunnelField::Name => "name",
            FunnelField::Description => "description",
            FunnelField::Status => "status",
            FunnelField::Settings => "settings",
        }
    }
}

/// The part of an aggregate a flush has to cover.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteFocus {
    /// Exactly one step changed, and only these fields of it.
    Step {
        step_id: StepId,
        fields: BTreeSet<StepField>,
    },
    /// Only funnel-row fields changed.
    Funnel { fields: BTreeSet<FunnelField> },
    /// Structural change or several entities: persist everything.
    Aggregate,
}

impl WriteFocus {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            WriteFocus::Step { .. } => "step",
            WriteFocus::Funnel { .. } => "funnel",
            WriteFocus::Aggregate => "aggregate",
        }
    }
}

/// Changes accumulated since the last `take`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirtySet {
    /// Steps added, removed, reordered, or the whole aggregate needs a resave.
    structural: bool,
    funnel: BTreeSet<FunnelField>,
    steps: BTreeMap<StepId, BTreeSet<StepField>>,
}

impl DirtySet {
    /// Nothing changed since the last flush.
    pub fn is_clean(&self) -> bool {
        !self.structural && self.funnel.is_empty() && self.steps.is_empty()
    }

    /// Whether a structural change forces an aggregate write.
    pub fn is_structural(&self) -> bool {
        self.structural
    }

    pub fn mark_structural(&mut self) {
        self.structural = true;
    }

    pub fn mark_funnel(&mut self, field: FunnelField) {
        self.funnel.insert(field);
    }

    pub fn mark_step(&mut self, step_id: StepId, field: StepField) {
        self.steps.entry(step_id).or_default().insert(field);
    }

    /// Derive the write focus. `None` when clean.
    pub fn focus(&self) -> Option<WriteFocus> {
        if self.is_clean() {
            return None;
        }
        if self.structural || self.steps.len() > 1 {
            return Some(WriteFocus::Aggregate);
        }
        match (self.funnel.is_empty(), self.steps.iter().next()) {
            (true, Some((step_id, fields))) => Some(WriteFocus::Step {
                step_id: *step_id,
                fields: fields.clone(),
            }),
            (false, None) => Some(WriteFocus::Funnel {
                fields: self.funnel.clone(),
            }),
            _ => Some(WriteFocus::Aggregate),
        }
    }

    /// Return the current dirt and reset to clean.
    pub fn take(&mut self) -> DirtySet {
        std::mem::take(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_has_no_focus() {
        assert_eq!(DirtySet::default().focus(), None);
    }

    #[test]
    fn test_single_step_focus() {
        let mut dirty = DirtySet::default();
        let step = StepId::new();
        dirty.mark_step(step, StepField::CanvasElements);
        dirty.mark_step(step, StepField::Title);

        match dirty.focus() {
            Some(WriteFocus::Step { step_id, fields }) => {
                assert_eq!(step_id, step);
                assert_eq!(fields.len(), 2);
                assert!(fields.contains(&StepField::CanvasElements));
            }
            other => panic!("expected step focus, got {other:?}"),
        }
    }

    #[test]
    fn test_two_steps_escalate_to_aggregate() {
        let mut dirty = DirtySet::default();
        dirty.mark_step(StepId::new(), StepField::Title);
        dirty.mark_step(StepId::new(), StepField::Title);
        assert_eq!(dirty.focus(), Some(WriteFocus::Aggregate));
    }

    #[test]
    fn test_funnel_and_step_escalate_to_aggregate() {
        let mut dirty = DirtySet::default();
        dirty.mark_funnel(FunnelField::Name);
        dirty.mark_step(StepId::new(), StepField::Title);
        assert_eq!(dirty.focus(), Some(WriteFocus::Aggregate));
    }

    #[test]
    fn test_funnel_only_focus() {
        let mut dirty = DirtySet::default();
        dirty.mark_funnel(FunnelField::Settings);
        assert!(matches!(dirty.focus(), Some(WriteFocus::Funnel { .. })));
    }

    #[test]
    fn test_take_resets() {
        let mut dirty = DirtySet::default();
        dirty.mark_structural();
        let taken = dirty.take();
        assert!(taken.is_structural());
        assert!(dirty.is_clean());
    }

    #[test]
    fn test_columns_match_persisted_shape() {
        assert_eq!(StepField::BackButtonText.column(), "backButtonText");
        assert_eq!(StepField::OrderIndex.column(), "order_index");
        assert_eq!(FunnelField::Settings.column(), "settings");
    }
}
