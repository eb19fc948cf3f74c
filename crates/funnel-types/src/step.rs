//! Steps and the canvas elements placed on them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ids::{ElementId, FunnelId, StepId};

/// One page of a funnel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub funnel_id: FunnelId,
    /// Contiguous, unique position within the owning funnel.
    pub order_index: u32,
    pub title: String,
    #[serde(default)]
    pub button_text: String,
    #[serde(default)]
    pub back_button_text: String,
    #[serde(default)]
    pub show_progress_bar: bool,
    #[serde(default)]
    pub canvas_elements: Arc<Vec<CanvasElement>>,
    /// Unix milliseconds of the last local change to this step.
    pub updated_at: u64,
}

impl Step {
    /// Create an empty step at the given position.
    pub fn new(funnel_id: FunnelId, order_index: u32, title: impl Into<String>) -> Self {
        Self {
            id: StepId::new(),
            funnel_id,
            order_index,
            title: title.into(),
            button_text: "Continue".to_string(),
            back_button_text: "Back".to_string(),
            show_progress_bar: true,
            canvas_elements: Arc::new(Vec::new()),
            updated_at: crate::now_millis(),
        }
    }

    /// Find an element by id.
    pub fn element(&self, id: ElementId) -> Option<&CanvasElement> {
        self.canvas_elements.iter().find(|e| e.id == id)
    }

    /// Position of an element in the step's element list.
    pub fn element_index(&self, id: ElementId) -> Option<usize> {
        self.canvas_elements.iter().position(|e| e.id == id)
    }
}

/// A widget placed on a step's canvas.
///
/// The sync engine treats this as a blob: `kind` and `config` belong to the
/// renderers. `position` mirrors the element's index in the step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanvasElement {
    pub id: ElementId,
    #[serde(rename = "type")]
    pub kind: String,
    pub position: u32,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl CanvasElement {
    /// Create an element of the given widget type with empty config.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: ElementId::new(),
            kind: kind.into(),
            position: 0,
            config: serde_json::Map::new(),
        }
    }

    /// Builder-style config entry.
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_serializes_kind_as_type() {
        let el = CanvasElement::new("button").with_config("label", serde_json::json!("Buy"));
        let json = serde_json::to_value(&el).unwrap();
        assert_eq!(json["type"], "button");
        assert_eq!(json["config"]["label"], "Buy");
    }

    #[test]
    fn test_step_lookup() {
        let mut step = Step::new(FunnelId::new(), 0, "Checkout");
        let el = CanvasElement::new("pricing_card");
        let id = el.id;
        Arc::make_mut(&mut step.canvas_elements).push(el);
        assert_eq!(step.element_index(id), Some(0));
        assert!(step.element(ElementId::new()).is_none());
    }
}
