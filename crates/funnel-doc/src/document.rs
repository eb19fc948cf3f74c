//! Funnel document: one aggregate plus its action layer.
//!
//! Every action mutates the tree synchronously, bumps the revision and
//! records what changed in the [`DirtySet`]. Nothing here talks to the network;
//! the sync engine pulls a [`PendingSnapshot`] when its debounce window
//! expires.
//!
//! # Ordering
//!
//! `Step::order_index` and `CanvasElement::position` always equal the item's
//! index in its list. Reorders renumber every affected sibling inside the same
//! action, so the renumbering lands in the same snapshot as the move itself.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use funnel_types::{CanvasElement, ElementId, Funnel, FunnelId, FunnelStatus, Step, StepId};

use crate::dirty::{DirtySet, FunnelField, StepField, WriteFocus};
use crate::{DocumentError, Result};

/// Immutable snapshot of an aggregate, captured for persistence.
///
/// The funnel is a structural share of the live tree: later edits copy-on-write
/// around it and never show through.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingSnapshot {
    pub funnel: Arc<Funnel>,
    /// Document revision the snapshot was taken at.
    pub revision: u64,
    pub focus: WriteFocus,
}

impl PendingSnapshot {
    pub fn aggregate_id(&self) -> FunnelId {
        self.funnel.id
    }

    /// The step a `Step` focus points at, if it still exists in the snapshot.
    pub fn focused_step(&self) -> Option<&Step> {
        match &self.focus {
            WriteFocus::Step { step_id, .. } => self.funnel.step(*step_id),
            _ => None,
        }
    }

    /// The same data, widened to a full aggregate write.
    pub fn widened(&self) -> Self {
        Self {
            funnel: Arc::clone(&self.funnel),
            revision: self.revision,
            focus: WriteFocus::Aggregate,
        }
    }
}

/// Field-level update for a step's scalar fields. `None` leaves a field alone.
#[derive(Clone, Debug, Default)]
pub struct StepPatch {
    pub title: Option<String>,
    pub button_text: Option<String>,
    pub back_button_text: Option<String>,
    pub show_progress_bar: Option<bool>,
}

impl StepPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }
}

/// One funnel being edited.
#[derive(Debug, Clone)]
pub struct FunnelDocument {
    funnel: Funnel,
    revision: u64,
    dirty: DirtySet,
}

impl FunnelDocument {
    /// Create a brand-new funnel. It has never been persisted, so the first
    /// flush writes the whole aggregate.
    pub fn new(name: impl Into<String>) -> Self {
        let mut dirty = DirtySet::default();
        dirty.mark_structural();
        Self {
            funnel: Funnel::new(name),
            revision: 1,
            dirty,
        }
    }

    /// Wrap a funnel loaded from the store. Starts clean.
    pub fn from_funnel(funnel: Funnel) -> Self {
        Self {
            funnel,
            revision: 0,
            dirty: DirtySet::default(),
        }
    }

    pub fn id(&self) -> FunnelId {
        self.funnel.id
    }

    pub fn funnel(&self) -> &Funnel {
        &self.funnel
    }

    /// Monotonic counter bumped by every effective mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_clean()
    }

    pub fn dirty(&self) -> &DirtySet {
        &self.dirty
    }

    /// Structural share of the current tree (O(steps) reference bumps).
    pub fn snapshot(&self) -> Funnel {
        self.funnel.clone()
    }

    /// Capture the current state for a flush and reset dirt.
    ///
    /// Returns `None` when nothing changed since the last take.
    pub fn take_pending(&mut self) -> Option<PendingSnapshot> {
        let focus = self.dirty.focus()?;
        self.dirty.take();
        Some(self.pending(focus))
    }

    /// Capture the current state as a full aggregate write, dirty or not.
    pub fn take_full(&mut self) -> PendingSnapshot {
        self.dirty.take();
        self.pending(WriteFocus::Aggregate)
    }

    fn pending(&self, focus: WriteFocus) -> PendingSnapshot {
        PendingSnapshot {
            funnel: Arc::new(self.funnel.clone()),
            revision: self.revision,
            focus,
        }
    }

    /// Force the next flush to cover the whole aggregate.
    ///
    /// Local data is untouched; only the dirt widens.
    pub fn mark_unsynced(&mut self) {
        self.dirty.mark_structural();
    }

    // =========================================================================
    // Funnel fields
    // =========================================================================

    pub fn rename(&mut self, name: impl Into<String>) {
        let name = name.into();
        if self.funnel.name != name {
            self.funnel.name = name;
            self.touch_funnel(FunnelField::Name);
        }
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        let description = description.into();
        if self.funnel.description != description {
            self.funnel.description = description;
            self.touch_funnel(FunnelField::Description);
        }
    }

    pub fn set_status(&mut self, status: FunnelStatus) {
        if self.funnel.status != status {
            self.funnel.status = status;
            self.touch_funnel(FunnelField::Status);
        }
    }

    /// Set one key of the settings object.
    pub fn set_setting(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<()> {
        let map = self
            .funnel
            .settings
            .as_object_mut()
            .ok_or(DocumentError::SettingsNotObject)?;
        map.insert(key.into(), value);
        self.touch_funnel(FunnelField::Settings);
        Ok(())
    }

    /// Replace the whole settings object.
    pub fn replace_settings(&mut self, settings: serde_json::Value) -> Result<()> {
        if !settings.is_object() {
            return Err(DocumentError::SettingsNotObject);
        }
        self.funnel.settings = settings;
        self.touch_funnel(FunnelField::Settings);
        Ok(())
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Append a new step. Returns its id.
    pub fn add_step(&mut self, title: impl Into<String>) -> StepId {
        let index = self.funnel.steps.len();
        let step = Step::new(self.funnel.id, index as u32, title);
        let id = step.id;
        self.funnel.steps.push(Arc::new(step));
        self.touch_structure();
        id
    }

    /// Insert a prepared step at `index`, renumbering the tail.
    pub fn insert_step(&mut self, index: usize, mut step: Step) -> Result<StepId> {
        let len = self.funnel.steps.len();
        if index > len {
            return Err(DocumentError::IndexOutOfBounds { index, len });
        }
        step.funnel_id = self.funnel.id;
        let id = step.id;
        self.funnel.steps.insert(index, Arc::new(step));
        self.renumber_steps();
        self.touch_structure();
        Ok(id)
    }

    /// Remove a step, renumbering the remaining ones.
    pub fn remove_step(&mut self, step_id: StepId) -> Result<Step> {
        let index = self
            .funnel
            .step_index(step_id)
            .ok_or(DocumentError::UnknownStep(step_id))?;
        let removed = self.funnel.steps.remove(index);
        self.renumber_steps();
        self.touch_structure();
        Ok(Arc::unwrap_or_clone(removed))
    }

    /// Move a step to `to`, renumbering every sibling in between.
    pub fn move_step(&mut self, step_id: StepId, to: usize) -> Result<()> {
        let len = self.funnel.steps.len();
        let from = self
            .funnel
            .step_index(step_id)
            .ok_or(DocumentError::UnknownStep(step_id))?;
        if to >= len {
            return Err(DocumentError::IndexOutOfBounds { index: to, len });
        }
        if from == to {
            return Ok(());
        }
        let step = self.funnel.steps.remove(from);
        self.funnel.steps.insert(to, step);
        self.renumber_steps();
        self.touch_structure();
        Ok(())
    }

    /// Apply a field-level patch. Only fields that actually change are marked.
    pub fn update_step(&mut self, step_id: StepId, patch: StepPatch) -> Result<()> {
        let mut changed = Vec::new();
        {
            let step = self.step_mut(step_id)?;
            if let Some(title) = patch.title.filter(|t| *t != step.title) {
                step.title = title;
                changed.push(StepField::Title);
            }
            if let Some(text) = patch.button_text.filter(|t| *t != step.button_text) {
                step.button_text = text;
                changed.push(StepField::ButtonText);
            }
            if let Some(text) = patch.back_button_text.filter(|t| *t != step.back_button_text) {
                step.back_button_text = text;
                changed.push(StepField::BackButtonText);
            }
            if let Some(show) = patch.show_progress_bar.filter(|s| *s != step.show_progress_bar) {
                step.show_progress_bar = show;
                changed.push(StepField::ShowProgressBar);
            }
            if !changed.is_empty() {
                step.updated_at = funnel_types::now_millis();
            }
        }
        for field in changed.iter().copied() {
            self.dirty.mark_step(step_id, field);
        }
        if !changed.is_empty() {
            self.revision += 1;
        }
        Ok(())
    }

    /// Copy a step (with fresh ids for it and its elements) right after the
    /// original.
    pub fn duplicate_step(&mut self, step_id: StepId) -> Result<StepId> {
        let index = self
            .funnel
            .step_index(step_id)
            .ok_or(DocumentError::UnknownStep(step_id))?;
        let original = &self.funnel.steps[index];
        let mut copy = Step::new(self.funnel.id, 0, format!("{} (copy)", original.title));
        copy.button_text = original.button_text.clone();
        copy.back_button_text = original.back_button_text.clone();
        copy.show_progress_bar = original.show_progress_bar;
        copy.canvas_elements = Arc::new(
            original
                .canvas_elements
                .iter()
                .map(|el| CanvasElement {
                    id: ElementId::new(),
                    ..el.clone()
                })
                .collect(),
        );
        self.insert_step(index + 1, copy)
    }

    // =========================================================================
    // Canvas elements
    // =========================================================================

    /// Append an element to a step. Returns its id.
    pub fn add_element(&mut self, step_id: StepId, element: CanvasElement) -> Result<ElementId> {
        let len = self.step(step_id)?.canvas_elements.len();
        self.insert_element(step_id, len, element)
    }

    /// Insert an element at `index`, renumbering positions.
    pub fn insert_element(
        &mut self,
        step_id: StepId,
        index: usize,
        element: CanvasElement,
    ) -> Result<ElementId> {
        let id = element.id;
        {
            let elements = self.elements_mut(step_id)?;
            let len = elements.len();
            if index > len {
                return Err(DocumentError::IndexOutOfBounds { index, len });
            }
            elements.insert(index, element);
            renumber_elements(elements);
        }
        self.touch_elements(step_id);
        Ok(id)
    }

    pub fn remove_element(&mut self, step_id: StepId, element_id: ElementId) -> Result<CanvasElement> {
        let removed = {
            let elements = self.elements_mut(step_id)?;
            let index = elements
                .iter()
                .position(|e| e.id == element_id)
                .ok_or(DocumentError::UnknownElement { step: step_id, element: element_id })?;
            let removed = elements.remove(index);
            renumber_elements(elements);
            removed
        };
        self.touch_elements(step_id);
        Ok(removed)
    }

    /// Move an element within its step, renumbering every position.
    pub fn move_element(&mut self, step_id: StepId, element_id: ElementId, to: usize) -> Result<()> {
        let step = self.step(step_id)?;
        let len = step.canvas_elements.len();
        let from = step
            .element_index(element_id)
            .ok_or(DocumentError::UnknownElement { step: step_id, element: element_id })?;
        if to >= len {
            return Err(DocumentError::IndexOutOfBounds { index: to, len });
        }
        if from == to {
            return Ok(());
        }
        {
            let elements = self.elements_mut(step_id)?;
            let element = elements.remove(from);
            elements.insert(to, element);
            renumber_elements(elements);
        }
        self.touch_elements(step_id);
        Ok(())
    }

    /// Set one config key on an element.
    pub fn set_element_config(
        &mut self,
        step_id: StepId,
        element_id: ElementId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        {
            let elements = self.elements_mut(step_id)?;
            let element = elements
                .iter_mut()
                .find(|e| e.id == element_id)
                .ok_or(DocumentError::UnknownElement { step: step_id, element: element_id })?;
            element.config.insert(key.into(), value);
        }
        self.touch_elements(step_id);
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn step(&self, step_id: StepId) -> Result<&Step> {
        self.funnel.step(step_id).ok_or(DocumentError::UnknownStep(step_id))
    }

    /// Copy-on-write access to a step.
    fn step_mut(&mut self, step_id: StepId) -> Result<&mut Step> {
        let step = self
            .funnel
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or(DocumentError::UnknownStep(step_id))?;
        Ok(Arc::make_mut(step))
    }

    /// Copy-on-write access to a step's element list.
    fn elements_mut(&mut self, step_id: StepId) -> Result<&mut Vec<CanvasElement>> {
        let step = self.step_mut(step_id)?;
        Ok(Arc::make_mut(&mut step.canvas_elements))
    }

    /// Bring `order_index` back in line with list position. Untouched steps
    /// keep sharing their allocation with older snapshots.
    fn renumber_steps(&mut self) {
        let now = funnel_types::now_millis();
        for (i, step) in self.funnel.steps.iter_mut().enumerate() {
            if step.order_index as usize != i {
                let step = Arc::make_mut(step);
                step.order_index = i as u32;
                step.updated_at = now;
            }
        }
    }

    fn touch_funnel(&mut self, field: FunnelField) {
        self.funnel.updated_at = funnel_types::now_millis();
        self.dirty.mark_funnel(field);
        self.revision += 1;
    }

    fn touch_structure(&mut self) {
        self.funnel.updated_at = funnel_types::now_millis();
        self.dirty.mark_structural();
        self.revision += 1;
    }

    fn touch_elements(&mut self, step_id: StepId) {
        if let Ok(step) = self.step_mut(step_id) {
            step.updated_at = funnel_types::now_millis();
        }
        self.dirty.mark_step(step_id, StepField::CanvasElements);
        self.revision += 1;
    }
}

fn renumber_elements(elements: &mut [CanvasElement]) {
    for (i, element) in elements.iter_mut().enumerate() {
        element.position = i as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_steps(n: usize) -> (FunnelDocument, Vec<StepId>) {
        let mut doc = FunnelDocument::new("Test funnel");
        let ids = (0..n).map(|i| doc.add_step(format!("Step {i}"))).collect();
        doc.take_pending();
        (doc, ids)
    }

    fn order(doc: &FunnelDocument) -> Vec<(StepId, u32)> {
        doc.funnel().steps.iter().map(|s| (s.id, s.order_index)).collect()
    }

    #[test]
    fn test_new_document_needs_full_write() {
        let mut doc = FunnelDocument::new("Fresh");
        let pending = doc.take_pending().unwrap();
        assert_eq!(pending.focus, WriteFocus::Aggregate);
        assert!(doc.take_pending().is_none());
    }

    #[test]
    fn test_move_step_renumbers_all_siblings() {
        let (mut doc, ids) = doc_with_steps(4);

        doc.move_step(ids[3], 0).unwrap();

        let got = order(&doc);
        assert_eq!(got[0], (ids[3], 0));
        assert_eq!(got[1], (ids[0], 1));
        assert_eq!(got[2], (ids[1], 2));
        assert_eq!(got[3], (ids[2], 3));
        assert!(doc.funnel().order_is_contiguous());
        assert_eq!(doc.take_pending().unwrap().focus, WriteFocus::Aggregate);
    }

    #[test]
    fn test_remove_step_closes_gap() {
        let (mut doc, ids) = doc_with_steps(3);
        doc.remove_step(ids[0]).unwrap();
        assert!(doc.funnel().order_is_contiguous());
        assert_eq!(doc.funnel().steps.len(), 2);
        assert_eq!(doc.remove_step(ids[0]), Err(DocumentError::UnknownStep(ids[0])));
    }

    #[test]
    fn test_move_step_out_of_bounds() {
        let (mut doc, ids) = doc_with_steps(2);
        let rev = doc.revision();
        let err = doc.move_step(ids[0], 5).unwrap_err();
        assert_eq!(err, DocumentError::IndexOutOfBounds { index: 5, len: 2 });
        assert_eq!(doc.revision(), rev);
    }

    #[test]
    fn test_element_edits_focus_single_step() {
        let (mut doc, ids) = doc_with_steps(2);
        let el = doc.add_element(ids[1], CanvasElement::new("button")).unwrap();
        doc.set_element_config(ids[1], el, "label", serde_json::json!("Go")).unwrap();

        let pending = doc.take_pending().unwrap();
        match &pending.focus {
            WriteFocus::Step { step_id, fields } => {
                assert_eq!(*step_id, ids[1]);
                assert_eq!(fields.iter().copied().collect::<Vec<_>>(), vec![StepField::CanvasElements]);
            }
            other => panic!("unexpected focus {other:?}"),
        }
        assert_eq!(pending.focused_step().unwrap().canvas_elements.len(), 1);
    }

    #[test]
    fn test_move_element_renumbers_positions() {
        let (mut doc, ids) = doc_with_steps(1);
        let els: Vec<_> = (0..5)
            .map(|i| doc.add_element(ids[0], CanvasElement::new(format!("w{i}"))).unwrap())
            .collect();

        doc.move_element(ids[0], els[4], 0).unwrap();
        doc.move_element(ids[0], els[0], 4).unwrap();

        let step = doc.funnel().step(ids[0]).unwrap();
        let got: Vec<_> = step.canvas_elements.iter().map(|e| (e.id, e.position)).collect();
        assert_eq!(
            got,
            vec![(els[4], 0), (els[1], 1), (els[2], 2), (els[3], 3), (els[0], 4)]
        );
    }

    #[test]
    fn test_update_step_marks_only_changed_fields() {
        let (mut doc, ids) = doc_with_steps(1);
        let rev = doc.revision();
        doc.update_step(
            ids[0],
            StepPatch {
                title: Some("Step 0".into()), // unchanged
                back_button_text: Some("Previous".into()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(doc.revision(), rev + 1);
        let pending = doc.take_pending().unwrap();
        assert_eq!(
            pending.focus,
            WriteFocus::Step {
                step_id: ids[0],
                fields: [StepField::BackButtonText].into_iter().collect(),
            }
        );
    }

    #[test]
    fn test_noop_patch_does_not_dirty() {
        let (mut doc, ids) = doc_with_steps(1);
        doc.update_step(ids[0], StepPatch::title("Step 0")).unwrap();
        assert!(!doc.is_dirty());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_edits() {
        let (mut doc, ids) = doc_with_steps(2);
        doc.add_element(ids[0], CanvasElement::new("text")).unwrap();
        let pending = doc.take_pending().unwrap();

        doc.update_step(ids[0], StepPatch::title("Renamed")).unwrap();
        doc.add_element(ids[0], CanvasElement::new("image")).unwrap();

        let snap_step = pending.funnel.step(ids[0]).unwrap();
        assert_eq!(snap_step.title, "Step 0");
        assert_eq!(snap_step.canvas_elements.len(), 1);
        // The untouched step is still shared with the live tree.
        assert!(Arc::ptr_eq(&pending.funnel.steps[1], &doc.funnel().steps[1]));
    }

    #[test]
    fn test_duplicate_step_gets_fresh_ids() {
        let (mut doc, ids) = doc_with_steps(2);
        let el = doc.add_element(ids[0], CanvasElement::new("form")).unwrap();

        let copy = doc.duplicate_step(ids[0]).unwrap();

        let funnel = doc.funnel();
        assert_eq!(funnel.step_index(copy), Some(1));
        assert!(funnel.order_is_contiguous());
        let copied = funnel.step(copy).unwrap();
        assert_eq!(copied.title, "Step 0 (copy)");
        assert_eq!(copied.canvas_elements.len(), 1);
        assert_ne!(copied.canvas_elements[0].id, el);
    }

    #[test]
    fn test_mark_unsynced_widens_next_focus() {
        let (mut doc, ids) = doc_with_steps(1);
        doc.update_step(ids[0], StepPatch::title("x")).unwrap();
        doc.mark_unsynced();
        assert_eq!(doc.take_pending().unwrap().focus, WriteFocus::Aggregate);
    }

    #[test]
    fn test_settings_must_be_object() {
        let mut doc = FunnelDocument::new("s");
        assert_eq!(
            doc.replace_settings(serde_json::json!([1, 2])),
            Err(DocumentError::SettingsNotObject)
        );
        doc.set_setting("theme", serde_json::json!("dark")).unwrap();
        assert_eq!(doc.funnel().settings["theme"], "dark");
    }
}
