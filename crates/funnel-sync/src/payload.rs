//! Snapshot → remote records.
//!
//! Column names follow the persisted shape (`buttonText`, `order_index`, ...).
//! Ids go out as UUID text. `id` itself is never part of a field map; it is the
//! record key passed alongside.

use std::collections::BTreeSet;

use serde_json::{Value, json};

use funnel_doc::{FunnelField, StepField};
use funnel_store::Record;
use funnel_types::{CanvasElement, Funnel, Step, StepId};

/// Full `funnels` row.
pub fn funnel_record(funnel: &Funnel) -> Record {
    let mut record = Record::new();
    for field in [
        FunnelField::Name,
        FunnelField::Description,
        FunnelField::Status,
        FunnelField::Settings,
    ] {
        record.insert(field.column().to_string(), funnel_value(funnel, field));
    }
    record.insert("updated_at".into(), json!(funnel.updated_at));
    record
}

/// Only the changed `funnels` columns, plus `updated_at`.
pub fn funnel_patch(funnel: &Funnel, fields: &BTreeSet<FunnelField>) -> Record {
    let mut record: Record = fields
        .iter()
        .map(|field| (field.column().to_string(), funnel_value(funnel, *field)))
        .collect();
    record.insert("updated_at".into(), json!(funnel.updated_at));
    record
}

fn funnel_value(funnel: &Funnel, field: FunnelField) -> Value {
    match field {
        FunnelField::Name => json!(funnel.name),
        FunnelField::Description => json!(funnel.description),
        FunnelField::Status => json!(funnel.status.as_str()),
        FunnelField::Settings => funnel.settings.clone(),
    }
}

const STEP_FIELDS: [StepField; 6] = [
    StepField::OrderIndex,
    StepField::Title,
    StepField::ButtonText,
    StepField::BackButtonText,
    StepField::ShowProgressBar,
    StepField::CanvasElements,
];

/// Full `steps` row, elements embedded as JSON.
pub fn step_record(step: &Step) -> Record {
    let mut record = Record::new();
    record.insert("funnel_id".into(), json!(step.funnel_id.to_string()));
    for field in STEP_FIELDS {
        record.insert(field.column().to_string(), step_value(step, field));
    }
    record.insert("updated_at".into(), json!(step.updated_at));
    record
}

/// Only the changed `steps` columns, plus `updated_at`.
pub fn step_patch(step: &Step, fields: &BTreeSet<StepField>) -> Record {
    let mut record: Record = fields
        .iter()
        .map(|field| (field.column().to_string(), step_value(step, *field)))
        .collect();
    record.insert("updated_at".into(), json!(step.updated_at));
    record
}

fn step_value(step: &Step, field: StepField) -> Value {
    match field {
        StepField::OrderIndex => json!(step.order_index),
        StepField::Title => json!(step.title),
        StepField::ButtonText => json!(step.button_text),
        StepField::BackButtonText => json!(step.back_button_text),
        StepField::ShowProgressBar => json!(step.show_progress_bar),
        StepField::CanvasElements => {
            Value::Array(step.canvas_elements.iter().map(element_value).collect())
        }
    }
}

/// Embedded form of one element inside `canvasElements`.
fn element_value(element: &CanvasElement) -> Value {
    json!({
        "id": element.id.to_string(),
        "type": element.kind,
        "position": element.position,
        "config": element.config,
    })
}

/// `canvas_elements` row for normalized element storage.
pub fn element_record(step_id: StepId, element: &CanvasElement, updated_at: u64) -> Record {
    let mut record = Record::new();
    record.insert("step_id".into(), json!(step_id.to_string()));
    record.insert("type".into(), json!(element.kind));
    record.insert("position".into(), json!(element.position));
    record.insert("config".into(), Value::Object(element.config.clone()));
    record.insert("updated_at".into(), json!(updated_at));
    record
}
