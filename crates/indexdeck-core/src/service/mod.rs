//! The indexing service seam.
//!
//! Everything the coordinators know about the backend goes through
//! [`IndexService`]. The service does the actual extraction and embedding;
//! this crate only triggers it and watches its event channels.

pub(crate) mod memory;

pub use memory::{MemoryIndexService, ServiceFixture};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::models::{
    BatchAck, DimensionInfo, IndexDiagnostic, IndexItemOptions, IndexItemResult, IndexState,
    IndexStatusSummary, SummaryFilter,
};

/// Raw event payloads from one named channel.
pub type EventStream = BoxStream<'static, serde_json::Value>;

#[async_trait]
pub trait IndexService: Send + Sync + 'static {
    /// Aggregate counts plus the filtered record list.
    async fn get_summary(&self, filter: SummaryFilter) -> anyhow::Result<IndexStatusSummary>;

    async fn list_dimensions(&self) -> anyhow::Result<Vec<DimensionInfo>>;

    /// Start text indexing of up to `max_count` pending or failed resources.
    ///
    /// Returns as soon as the work is claimed. Progress and completion are
    /// reported on the batch channel only.
    async fn submit_batch(&self, max_count: u32) -> anyhow::Result<BatchAck>;

    /// Multimodal-index a single item. Resolves when the item is done.
    async fn index_item(
        &self,
        source_type: &str,
        source_id: &str,
        options: IndexItemOptions,
    ) -> anyhow::Result<IndexItemResult>;

    /// Subscribe to a named event channel. The stream does not end on its
    /// own; drop it to unsubscribe.
    async fn subscribe(&self, channel: &str) -> anyhow::Result<EventStream>;

    /// Reset every resource to pending. Returns the affected count.
    async fn reset_all(&self) -> anyhow::Result<u32>;

    async fn reset_disabled_to_pending(&self) -> anyhow::Result<u32>;

    /// Send back to pending every `indexed` resource with no stored chunks.
    async fn reset_indexed_without_embeddings(&self) -> anyhow::Result<u32>;

    async fn get_diagnostic(&self) -> anyhow::Result<IndexDiagnostic>;

    /// Enable or disable text indexing for one resource. Returns the new state.
    async fn set_disabled(&self, resource_id: &str, disabled: bool) -> anyhow::Result<IndexState>;

    /// Re-index one resource's text now. Returns its chunk count.
    async fn reindex(&self, resource_id: &str) -> anyhow::Result<u32>;
}
