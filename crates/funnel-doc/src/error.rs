//! Error types for document actions.

use thiserror::Error;

use funnel_types::{ElementId, FunnelId, StepId};

/// Errors that can occur while applying an action to a funnel document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// Funnel not registered in the document store.
    #[error("funnel not found: {0:?}")]
    UnknownFunnel(FunnelId),

    /// Step not found in the funnel.
    #[error("step not found: {0:?}")]
    UnknownStep(StepId),

    /// Element not found on the step.
    #[error("element {element:?} not found on step {step:?}")]
    UnknownElement { step: StepId, element: ElementId },

    /// Reorder or insert index past the end of the list.
    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// Funnel already registered.
    #[error("funnel already exists: {0:?}")]
    DuplicateFunnel(FunnelId),

    /// Settings must stay a JSON object.
    #[error("funnel settings must be a JSON object")]
    SettingsNotObject,
}
