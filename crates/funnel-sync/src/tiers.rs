//! Tiered write strategy.
//!
//! A flush tries progressively broader writes until one sticks:
//!
//! ```text
//!   Narrow     update_record(changed fields of the focused entity)
//!     │ escalate
//!     ▼
//!   Entity     upsert_record(full focused entity)
//!     │ escalate
//!     ▼
//!   Aggregate  upsert funnel + every step (+ elements), delete stale rows
//!     │ escalate
//!     ▼
//!   TiersExhausted  → caller hands the snapshot to the retry queue
//! ```
//!
//! Within a tier, transient failures are retried after a short pause and
//! schema drift is narrowed away; authorization and validation failures stop
//! the chain outright. The writer never touches local state.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use strum::{Display, IntoStaticStr};
use tracing::{debug, info, warn};

use funnel_doc::{PendingSnapshot, WriteFocus};
use funnel_store::{Filter, Record, RemoteStore, StoreResult, collections};
use funnel_types::Step;

use crate::config::SyncConfig;
use crate::constants::MAX_DRIFT_RETRIES_PER_TIER;
use crate::drift::SchemaDriftAdapter;
use crate::error::SyncError;
use crate::payload;

/// One strategy in the fallback chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    Narrow,
    Entity,
    Aggregate,
}

/// A successful flush.
#[derive(Clone, Debug, PartialEq)]
pub struct FlushOutcome {
    pub tier: Tier,
    /// Server-confirmed record. For aggregate writes: the funnel row with the
    /// saved steps under `"steps"`.
    pub record: Record,
    /// Fields removed by the drift adapter on the successful attempt.
    pub stripped: Vec<String>,
}

/// Runs the tier chain against a [`RemoteStore`].
pub struct TieredWriter {
    store: Arc<dyn RemoteStore>,
    drift: Arc<SchemaDriftAdapter>,
    call_timeout: Duration,
    transient_retries: u32,
    transient_retry_delay: Duration,
    normalize_elements: bool,
}

impl TieredWriter {
    pub fn new(store: Arc<dyn RemoteStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            drift: Arc::new(SchemaDriftAdapter::new()),
            call_timeout: config.call_timeout(),
            transient_retries: config.transient_retries,
            transient_retry_delay: config.transient_retry_delay(),
            normalize_elements: config.normalize_elements,
        }
    }

    /// Share a drift adapter (and what it has learned) with other writers.
    pub fn with_drift_adapter(mut self, drift: Arc<SchemaDriftAdapter>) -> Self {
        self.drift = drift;
        self
    }

    pub fn drift(&self) -> &SchemaDriftAdapter {
        &self.drift
    }

    /// Tiers a snapshot is eligible for, in order.
    pub fn plan(snapshot: &PendingSnapshot) -> Vec<Tier> {
        match &snapshot.focus {
            WriteFocus::Step { .. } if snapshot.focused_step().is_some() => {
                vec![Tier::Narrow, Tier::Entity, Tier::Aggregate]
            }
            WriteFocus::Funnel { .. } => vec![Tier::Narrow, Tier::Entity, Tier::Aggregate],
            _ => vec![Tier::Aggregate],
        }
    }

    /// Persist a snapshot, falling back tier by tier.
    pub async fn flush(&self, snapshot: &PendingSnapshot) -> Result<FlushOutcome, SyncError> {
        let aggregate = snapshot.aggregate_id();
        if let Err(err) = validate(snapshot) {
            warn!("refusing to persist funnel {aggregate:?}: {err}");
            return Err(err);
        }

        let mut last = None;
        for tier in Self::plan(snapshot) {
            match self.run_tier_with_retries(tier, snapshot).await {
                Ok(outcome) => {
                    info!(
                        "persisted funnel {aggregate:?} r{} via {tier} write",
                        snapshot.revision
                    );
                    return Ok(outcome);
                }
                Err(err) if !err.class().is_retryable() => {
                    warn!("{tier} write for funnel {aggregate:?} aborted: {err}");
                    return Err(err);
                }
                Err(err) => {
                    warn!("{tier} write for funnel {aggregate:?} failed ({}): {err}", err.class());
                    last = Some(err);
                }
            }
        }

        Err(SyncError::TiersExhausted {
            aggregate,
            last: Box::new(last.unwrap_or_else(|| SyncError::Unknown("no tier attempted".into()))),
        })
    }

    async fn run_tier_with_retries(
        &self,
        tier: Tier,
        snapshot: &PendingSnapshot,
    ) -> Result<FlushOutcome, SyncError> {
        let mut transient_left = self.transient_retries;
        let mut drift_left = MAX_DRIFT_RETRIES_PER_TIER;
        loop {
            let mut stripped = Vec::new();
            let err = match self.run_tier(tier, snapshot, &mut stripped).await {
                Ok(record) => {
                    return Ok(FlushOutcome {
                        tier,
                        record,
                        stripped,
                    });
                }
                Err(err) => err,
            };

            let pause = match &err {
                SyncError::SchemaDrift {
                    collection,
                    field: Some(field),
                    ..
                } if drift_left > 0 && self.drift.remember(collection, field) => {
                    drift_left -= 1;
                    Some(Duration::ZERO)
                }
                SyncError::TransientNetwork(_) if transient_left > 0 => {
                    transient_left -= 1;
                    Some(self.transient_retry_delay)
                }
                _ => None,
            };
            match pause {
                None => return Err(err),
                Some(delay) => {
                    debug!("retrying {tier} write after {err}");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn run_tier(
        &self,
        tier: Tier,
        snapshot: &PendingSnapshot,
        stripped: &mut Vec<String>,
    ) -> Result<Record, SyncError> {
        let funnel = &snapshot.funnel;
        match (tier, &snapshot.focus) {
            (Tier::Narrow, WriteFocus::Step { step_id, fields }) => {
                let step = focused(snapshot)?;
                let patch = payload::step_patch(step, fields);
                self.update(collections::STEPS, &step_id.to_string(), patch, stripped)
                    .await
            }
            (Tier::Narrow, WriteFocus::Funnel { fields }) => {
                let patch = payload::funnel_patch(funnel, fields);
                self.update(collections::FUNNELS, &funnel.id.to_string(), patch, stripped)
                    .await
            }
            (Tier::Entity, WriteFocus::Step { step_id, .. }) => {
                let step = focused(snapshot)?;
                let record = payload::step_record(step);
                self.upsert(collections::STEPS, &step_id.to_string(), record, stripped)
                    .await
            }
            (Tier::Entity, WriteFocus::Funnel { .. }) => {
                let record = payload::funnel_record(funnel);
                self.upsert(collections::FUNNELS, &funnel.id.to_string(), record, stripped)
                    .await
            }
            (Tier::Aggregate, _) | (_, WriteFocus::Aggregate) => {
                self.write_aggregate(snapshot, stripped).await
            }
        }
    }

    async fn write_aggregate(
        &self,
        snapshot: &PendingSnapshot,
        stripped: &mut Vec<String>,
    ) -> Result<Record, SyncError> {
        let funnel = &snapshot.funnel;
        let funnel_id = funnel.id.to_string();
        let mut saved = self
            .upsert(collections::FUNNELS, &funnel_id, payload::funnel_record(funnel), stripped)
            .await?;

        let mut saved_steps = Vec::with_capacity(funnel.steps.len());
        for step in &funnel.steps {
            let row = self
                .upsert(collections::STEPS, &step.id.to_string(), payload::step_record(step), stripped)
                .await?;
            saved_steps.push(Value::Object(row));
            if self.normalize_elements {
                self.write_elements(step, stripped).await?;
            }
        }

        let local: HashSet<String> = funnel.steps.iter().map(|s| s.id.to_string()).collect();
        let remote = self
            .select(collections::STEPS, Filter::eq("funnel_id", funnel_id.as_str()))
            .await?;
        for stale in stale_ids(&remote, &local) {
            if self.normalize_elements {
                let elements = self
                    .select(collections::CANVAS_ELEMENTS, Filter::eq("step_id", stale.as_str()))
                    .await?;
                for element in stale_ids(&elements, &HashSet::new()) {
                    self.delete(collections::CANVAS_ELEMENTS, &element).await?;
                }
            }
            self.delete(collections::STEPS, &stale).await?;
            debug!("deleted stale step {stale} of funnel {funnel_id}");
        }

        saved.insert("steps".into(), Value::Array(saved_steps));
        Ok(saved)
    }

    async fn write_elements(&self, step: &Step, stripped: &mut Vec<String>) -> Result<(), SyncError> {
        for element in step.canvas_elements.iter() {
            let record = payload::element_record(step.id, element, step.updated_at);
            self.upsert(collections::CANVAS_ELEMENTS, &element.id.to_string(), record, stripped)
                .await?;
        }

        let local: HashSet<String> = step.canvas_elements.iter().map(|e| e.id.to_string()).collect();
        let remote = self
            .select(collections::CANVAS_ELEMENTS, Filter::eq("step_id", step.id.to_string()))
            .await?;
        for stale in stale_ids(&remote, &local) {
            self.delete(collections::CANVAS_ELEMENTS, &stale).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Bounded store calls
    // ========================================================================

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        fields: Record,
        stripped: &mut Vec<String>,
    ) -> Result<Record, SyncError> {
        let (fields, removed) = self.drift.prepare(collection, fields);
        stripped.extend(removed);
        let sent: HashSet<String> = fields.keys().cloned().collect();
        self.bounded(collection, "upsert", self.store.upsert_record(collection, id, fields))
            .await
            .map_err(|err| attribute_drift(err, &sent))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Record,
        stripped: &mut Vec<String>,
    ) -> Result<Record, SyncError> {
        let (patch, removed) = self.drift.prepare(collection, patch);
        stripped.extend(removed);
        let sent: HashSet<String> = patch.keys().cloned().collect();
        self.bounded(collection, "update", self.store.update_record(collection, id, patch))
            .await
            .map_err(|err| attribute_drift(err, &sent))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), SyncError> {
        self.bounded(collection, "delete", self.store.delete_record(collection, id))
            .await
    }

    async fn select(&self, collection: &str, filter: Filter) -> Result<Vec<Record>, SyncError> {
        self.bounded(collection, "select", async {
            self.store.select_records(collection, &filter, None).await
        })
        .await
    }

    /// Apply the call timeout and classify failures.
    async fn bounded<T>(
        &self,
        collection: &str,
        op: &str,
        call: impl Future<Output = StoreResult<T>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                debug!("{op} on {collection} failed: {err}");
                Err(SyncError::from_store(collection, &err))
            }
            Err(_) => Err(SyncError::TransientNetwork(format!(
                "{op} on {collection} timed out after {:?}",
                self.call_timeout
            ))),
        }
    }
}

/// Drop the rejected-field hint when the payload never carried that field.
/// Stripping cannot change the payload, so the error escalates instead.
fn attribute_drift(err: SyncError, sent: &HashSet<String>) -> SyncError {
    match err {
        SyncError::SchemaDrift {
            collection,
            field: Some(field),
            message,
        } if !sent.contains(&field) => {
            debug!("{collection} rejected {field:?}, which was not sent; escalating");
            SyncError::SchemaDrift {
                collection,
                field: None,
                message,
            }
        }
        other => other,
    }
}

fn focused(snapshot: &PendingSnapshot) -> Result<&Step, SyncError> {
    snapshot
        .focused_step()
        .ok_or_else(|| SyncError::Unknown("focused step missing from snapshot".into()))
}

/// Ids of `rows` not present in `keep`.
fn stale_ids(rows: &[Record], keep: &HashSet<String>) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.get("id").and_then(Value::as_str))
        .filter(|id| !keep.contains(*id))
        .map(str::to_string)
        .collect()
}

/// Reject snapshots that would corrupt the remote if written.
pub fn validate(snapshot: &PendingSnapshot) -> Result<(), SyncError> {
    let funnel = &snapshot.funnel;
    if funnel.id.is_nil() {
        return Err(SyncError::Validation("funnel id is nil".into()));
    }
    if !funnel.order_is_contiguous() {
        return Err(SyncError::Validation(format!(
            "step order_index of funnel {} is not contiguous",
            funnel.id
        )));
    }
    for step in &funnel.steps {
        if step.id.is_nil() {
            return Err(SyncError::Validation("step id is nil".into()));
        }
        if step.funnel_id != funnel.id {
            return Err(SyncError::Validation(format!(
                "step {} belongs to funnel {}, not {}",
                step.id, step.funnel_id, funnel.id
            )));
        }
        for (position, element) in step.canvas_elements.iter().enumerate() {
            if element.id.is_nil() || element.position as usize != position {
                return Err(SyncError::Validation(format!(
                    "element {} of step {} is out of place",
                    element.id, step.id
                )));
            }
        }
    }
    Ok(())
}
