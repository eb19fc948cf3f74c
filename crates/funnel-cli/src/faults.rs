//! Fault injection for the demo: a store that drops its first N calls.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use funnel_store::{Filter, Order, Record, RemoteStore, SqliteStore, StoreError, StoreResult};

/// Wraps a [`SqliteStore`] and fails the first `outage` calls with a network
/// error, as if the connection were down.
pub struct Flaky {
    inner: SqliteStore,
    remaining: AtomicUsize,
}

impl Flaky {
    pub fn new(inner: SqliteStore, outage: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(outage),
        }
    }

    fn check(&self, op: &str, collection: &str) -> StoreResult<()> {
        let dropped = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            debug!("injected failure: {op} {collection}");
            return Err(StoreError::network("injected: connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for Flaky {
    async fn upsert_record(&self, collection: &str, id: &str, fields: Record) -> StoreResult<Record> {
        self.check("upsert", collection)?;
        self.inner.upsert_record(collection, id, fields).await
    }

    async fn update_record(&self, collection: &str, id: &str, patch: Record) -> StoreResult<Record> {
        self.check("update", collection)?;
        self.inner.update_record(collection, id, patch).await
    }

    async fn delete_record(&self, collection: &str, id: &str) -> StoreResult<()> {
        self.check("delete", collection)?;
        self.inner.delete_record(collection, id).await
    }

    async fn select_records(
        &self,
        collection: &str,
        filter: &Filter,
        order: Option<&Order>,
    ) -> StoreResult<Vec<Record>> {
        self.check("select", collection)?;
        self.inner.select_records(collection, filter, order).await
    }
}
