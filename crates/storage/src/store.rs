//! Document store interface.

use async_trait::async_trait;
use livedata_core::{Document, DocumentId, Result};
use livedata_query::CursorDescription;
use serde_json::Value;

use crate::crossbar::Crossbar;
use crate::oplog::OplogHandle;

/// What a store offers beyond queries and point reads.
#[derive(Clone)]
pub enum StoreCapabilities {
    /// The store exposes an operation log.
    LogTailing(OplogHandle),
    /// Only queries and point reads; live queries must poll.
    PointReadOnly,
}

impl StoreCapabilities {
    pub fn oplog(&self) -> Option<&OplogHandle> {
        match self {
            StoreCapabilities::LogTailing(handle) => Some(handle),
            StoreCapabilities::PointReadOnly => None,
        }
    }
}

/// Options for [`DocumentStore::update`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    pub multi: bool,
    pub upsert: bool,
}

/// Outcome of [`DocumentStore::update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched: usize,
    pub upserted_id: Option<DocumentId>,
}

/// A backing document store.
///
/// Writes announce every affected document on the invalidation crossbar as
/// `{collection, id}` while the calling task's write fence (if any) still
/// holds a write for them, so observers can join that fence.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn capabilities(&self) -> StoreCapabilities;

    fn invalidation_crossbar(&self) -> &Crossbar;

    /// Runs a query: selector, sort, skip, limit and projection.
    async fn find(&self, cursor: &CursorDescription) -> Result<Vec<Document>>;

    /// Point read by id.
    async fn find_one(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>>;

    async fn insert(&self, collection: &str, doc: Document) -> Result<DocumentId>;

    async fn update(
        &self,
        collection: &str,
        selector: &Value,
        modifier: &Value,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome>;

    async fn remove(&self, collection: &str, selector: &Value) -> Result<usize>;

    async fn drop_collection(&self, collection: &str) -> Result<()>;
}
