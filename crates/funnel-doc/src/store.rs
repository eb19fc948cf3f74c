//! Shared registry of open funnel documents.
//!
//! # Concurrency Model
//!
//! - DashMap for per-funnel concurrent access
//! - Actions run under the entry's shard lock, so mutations to one funnel
//!   apply in submission order
//! - Reads hand out structural snapshots, never references into the map

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use funnel_types::{Funnel, FunnelId};

use crate::document::{FunnelDocument, PendingSnapshot};
use crate::{DocumentError, Result};

/// Thread-safe handle to the document registry.
pub type SharedDocuments = Arc<DocumentStore>;

/// All funnels currently loaded in the editor.
#[derive(Debug, Default)]
pub struct DocumentStore {
    docs: DashMap<FunnelId, FunnelDocument>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new shared store.
    pub fn shared() -> SharedDocuments {
        Arc::new(Self::new())
    }

    /// Register a document. Fails if the id is already present.
    pub fn insert(&self, doc: FunnelDocument) -> Result<FunnelId> {
        let id = doc.id();
        match self.docs.entry(id) {
            Entry::Occupied(_) => Err(DocumentError::DuplicateFunnel(id)),
            Entry::Vacant(slot) => {
                slot.insert(doc);
                debug!("Registered funnel {id:?}");
                Ok(id)
            }
        }
    }

    /// Create and register a new, never-persisted funnel.
    pub fn create(&self, name: impl Into<String>) -> FunnelId {
        let doc = FunnelDocument::new(name);
        let id = doc.id();
        self.docs.insert(id, doc);
        id
    }

    /// Drop a document (explicit delete or editor close).
    pub fn remove(&self, id: FunnelId) -> Option<FunnelDocument> {
        self.docs.remove(&id).map(|(_, doc)| doc)
    }

    pub fn contains(&self, id: FunnelId) -> bool {
        self.docs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn ids(&self) -> Vec<FunnelId> {
        self.docs.iter().map(|entry| *entry.key()).collect()
    }

    /// Current state of a funnel, as a structural snapshot.
    pub fn funnel(&self, id: FunnelId) -> Option<Funnel> {
        self.docs.get(&id).map(|doc| doc.snapshot())
    }

    pub fn revision(&self, id: FunnelId) -> Option<u64> {
        self.docs.get(&id).map(|doc| doc.revision())
    }

    /// Run an action against one document.
    pub fn update<R>(
        &self,
        id: FunnelId,
        action: impl FnOnce(&mut FunnelDocument) -> Result<R>,
    ) -> Result<R> {
        let mut doc = self.docs.get_mut(&id).ok_or(DocumentError::UnknownFunnel(id))?;
        action(doc.value_mut())
    }

    /// Read-only access to one document.
    pub fn read<R>(&self, id: FunnelId, f: impl FnOnce(&FunnelDocument) -> R) -> Option<R> {
        self.docs.get(&id).map(|doc| f(doc.value()))
    }

    /// Capture pending changes for a flush (`None` if unknown or clean).
    pub fn take_pending(&self, id: FunnelId) -> Option<PendingSnapshot> {
        self.docs.get_mut(&id).and_then(|mut doc| doc.take_pending())
    }

    /// Capture a full-aggregate snapshot regardless of dirt.
    pub fn take_full(&self, id: FunnelId) -> Option<PendingSnapshot> {
        self.docs.get_mut(&id).map(|mut doc| doc.take_full())
    }

    /// Force the next flush of `id` to write the whole aggregate.
    pub fn mark_unsynced(&self, id: FunnelId) {
        if let Some(mut doc) = self.docs.get_mut(&id) {
            doc.mark_unsynced();
        }
    }
}
