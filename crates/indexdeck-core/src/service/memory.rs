//! In-process indexing service.
//!
//! Keeps records in memory and emits the same event shapes as the real
//! backend on both progress channels. Used by the CLI and by tests; "work"
//! is a configurable sleep per item.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;

use super::{EventStream, IndexService};
use crate::config::{BATCH_CHANNEL, MULTIMODAL_CHANNEL};
use crate::models::{
    BatchAck, ConsistencyCheck, DimensionInfo, IndexDiagnostic, IndexItemOptions,
    IndexItemResult, IndexState, IndexStateCounts, IndexStatusSummary, ResourceIndexRecord,
    SummaryFilter,
};

const TEXT_DIMENSION: u32 = 768;
const MULTIMODAL_DIMENSION: u32 = 1024;
const PAGES_PER_ITEM: u32 = 4;
const DEFAULT_SUMMARY_LIMIT: u32 = 100;

/// Resource types the backend counts toward the multimodal totals.
const MULTIMODAL_TYPES: [&str; 4] = ["textbook", "file", "image", "exam"];

/// Seed data for [`MemoryIndexService`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceFixture {
    pub resources: Vec<ResourceIndexRecord>,
    /// Resource or source ids whose indexing always fails
    #[serde(default)]
    pub failing: Vec<String>,
}

impl ServiceFixture {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid fixture {}", path.display()))
    }

    /// A small mixed library.
    pub fn sample() -> Self {
        let mut resources = Vec::new();
        let mut push = |id: &str, kind: &str, name: &str, text: IndexState, mm: IndexState| {
            resources.push(seed_record(id, kind, name, text, mm));
        };

        push("res_1", "note", "Lecture notes week 1", IndexState::Indexed, IndexState::Pending);
        push("res_2", "note", "Lecture notes week 2", IndexState::Pending, IndexState::Pending);
        push("res_3", "textbook", "Linear Algebra", IndexState::Pending, IndexState::Pending);
        push("res_4", "exam", "Midterm 2023", IndexState::Failed, IndexState::Failed);
        push("res_5", "image", "Whiteboard photo", IndexState::Indexed, IndexState::Indexed);
        push("res_6", "file", "Syllabus.pdf", IndexState::Disabled, IndexState::Disabled);
        push("res_7", "translation", "Chapter 3 (translated)", IndexState::Pending, IndexState::Pending);

        Self {
            resources,
            failing: vec!["res_4".to_string()],
        }
    }
}

/// Build a plausible record in the given states.
pub(crate) fn seed_record(
    id: &str,
    resource_type: &str,
    name: &str,
    text: IndexState,
    mm: IndexState,
) -> ResourceIndexRecord {
    let indexed = text == IndexState::Indexed;
    let mm_indexed = mm == IndexState::Indexed;
    ResourceIndexRecord {
        resource_id: id.to_string(),
        source_id: Some(format!("{}_{}", resource_type, id)),
        resource_type: resource_type.to_string(),
        name: name.to_string(),
        text_chunk_count: if indexed { chunk_count_for(name) } else { 0 },
        text_embedding_dim: indexed.then_some(TEXT_DIMENSION),
        text_indexed_at: indexed.then_some(0),
        text_index_error: (text == IndexState::Failed).then(|| "extraction failed".to_string()),
        text_index_state: text,
        is_stale: false,
        mm_indexed_pages: if mm_indexed { PAGES_PER_ITEM } else { 0 },
        mm_embedding_dim: mm_indexed.then_some(MULTIMODAL_DIMENSION),
        mm_index_error: None,
        mm_indexing_mode: mm_indexed.then(|| "vl_embedding".to_string()),
        mm_index_state: mm,
        updated_at: 0,
    }
}

fn chunk_count_for(name: &str) -> u32 {
    (name.len() as u32 / 6).max(1)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn is_multimodal_type(resource_type: &str) -> bool {
    MULTIMODAL_TYPES.contains(&resource_type)
}

#[derive(Debug, Default)]
struct Store {
    records: Vec<ResourceIndexRecord>,
    failing: HashSet<String>,
    submit_error: Option<String>,
    summary_error: Option<String>,
}

impl Store {
    fn get_mut(&mut self, resource_id: &str) -> anyhow::Result<&mut ResourceIndexRecord> {
        self.records
            .iter_mut()
            .find(|r| r.resource_id == resource_id)
            .ok_or_else(|| anyhow!("Resource not found: {}", resource_id))
    }

    fn fails(&self, record: &ResourceIndexRecord) -> bool {
        self.failing.contains(&record.resource_id)
            || record
                .source_id
                .as_ref()
                .is_some_and(|s| self.failing.contains(s))
    }
}

/// Decrements the in-flight gauge on drop.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(current)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory [`IndexService`].
#[derive(Clone)]
pub struct MemoryIndexService {
    store: Arc<RwLock<Store>>,
    batch_tx: broadcast::Sender<Value>,
    mm_tx: broadcast::Sender<Value>,
    batch_channel: String,
    multimodal_channel: String,
    item_delay: Duration,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl MemoryIndexService {
    pub fn new(records: Vec<ResourceIndexRecord>) -> Self {
        let (batch_tx, _) = broadcast::channel(1024);
        let (mm_tx, _) = broadcast::channel(1024);
        Self {
            store: Arc::new(RwLock::new(Store {
                records,
                ..Default::default()
            })),
            batch_tx,
            mm_tx,
            batch_channel: BATCH_CHANNEL.to_string(),
            multimodal_channel: MULTIMODAL_CHANNEL.to_string(),
            item_delay: Duration::from_millis(50),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_fixture(fixture: ServiceFixture) -> Self {
        let service = Self::new(fixture.resources);
        if let Ok(mut store) = service.store.try_write() {
            store.failing = fixture.failing.into_iter().collect();
        }
        service
    }

    /// Simulated work per item.
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    pub fn with_channels(mut self, batch: impl Into<String>, multimodal: impl Into<String>) -> Self {
        self.batch_channel = batch.into();
        self.multimodal_channel = multimodal.into();
        self
    }

    /// Make indexing of these resource or source ids fail.
    pub async fn fail_items<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut store = self.store.write().await;
        store.failing.extend(ids.into_iter().map(Into::into));
    }

    /// Make the next `submit_batch` calls fail with this message.
    pub async fn set_submit_error(&self, error: Option<String>) {
        self.store.write().await.submit_error = error;
    }

    /// Make `get_summary` fail with this message.
    pub async fn set_summary_error(&self, error: Option<String>) {
        self.store.write().await.summary_error = error;
    }

    /// Mark a resource's content as changed since its last index.
    pub async fn mark_content_changed(&self, resource_id: &str) -> anyhow::Result<()> {
        let mut store = self.store.write().await;
        let record = store.get_mut(resource_id)?;
        if record.text_index_state == IndexState::Indexed {
            record.is_stale = true;
        }
        record.updated_at = now_ms();
        Ok(())
    }

    pub async fn records(&self) -> Vec<ResourceIndexRecord> {
        self.store.read().await.records.clone()
    }

    /// Highest number of `index_item` calls seen running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn emit_batch(&self, payload: Value) {
        let _ = self.batch_tx.send(payload);
    }

    fn emit_mm(&self, payload: Value) {
        let _ = self.mm_tx.send(payload);
    }

    /// Claimed batch work, run in the background.
    async fn run_batch(self, claimed: Vec<(String, String)>) {
        let total = claimed.len() as u32;
        self.emit_batch(json!({
            "type": "batch_started",
            "total": total,
            "message": format!("Indexing {} resources", total),
        }));

        let mut success_count = 0u32;
        let mut fail_count = 0u32;

        for (index, (resource_id, name)) in claimed.into_iter().enumerate() {
            let current = index as u32 + 1;
            self.emit_batch(json!({
                "type": "resource_started",
                "resourceId": resource_id,
                "current": current,
                "total": total,
                "progress": index as u32 * 100 / total,
                "message": format!("Indexing {} ({}/{})", name, current, total),
            }));

            tokio::time::sleep(self.item_delay).await;

            let chunks = chunk_count_for(&name);
            self.emit_batch(json!({
                "type": "embedding_progress",
                "resourceId": resource_id,
                "chunksProcessed": chunks,
                "chunksTotal": chunks,
                "progress": (index as u32 * 100 + 50) / total,
            }));

            let progress = current * 100 / total;
            match self.finish_text_index(&resource_id, &name).await {
                Ok(chunk_count) => {
                    success_count += 1;
                    self.emit_batch(json!({
                        "type": "resource_completed",
                        "resourceId": resource_id,
                        "chunkCount": chunk_count,
                        "progress": progress,
                    }));
                }
                Err(e) => {
                    fail_count += 1;
                    self.emit_batch(json!({
                        "type": "resource_failed",
                        "resourceId": resource_id,
                        "error": e.to_string(),
                        "progress": progress,
                    }));
                }
            }
        }

        tracing::debug!(success_count, fail_count, "Simulated batch finished");
        self.emit_batch(json!({
            "type": "batch_completed",
            "successCount": success_count,
            "failCount": fail_count,
            "total": total,
            "progress": 100,
            "message": format!(
                "Batch indexing complete: {} succeeded, {} failed",
                success_count, fail_count
            ),
        }));
    }

    /// Write the result of indexing one resource's text.
    async fn finish_text_index(&self, resource_id: &str, name: &str) -> anyhow::Result<u32> {
        let mut store = self.store.write().await;
        let fails = store
            .records
            .iter()
            .find(|r| r.resource_id == resource_id)
            .is_some_and(|r| store.fails(r));
        let record = store.get_mut(resource_id)?;
        record.updated_at = now_ms();

        if fails {
            let error = format!("Text extraction failed for {}", name);
            record.text_index_state = IndexState::Failed;
            record.text_index_error = Some(error.clone());
            bail!(error);
        }

        let chunks = chunk_count_for(name);
        record.text_index_state = IndexState::Indexed;
        record.text_chunk_count = chunks;
        record.text_embedding_dim = Some(TEXT_DIMENSION);
        record.text_indexed_at = Some(record.updated_at);
        record.text_index_error = None;
        record.is_stale = false;
        Ok(chunks)
    }
}

fn count_states<'a>(states: impl Iterator<Item = &'a IndexState>) -> IndexStateCounts {
    let mut counts = IndexStateCounts::default();
    for state in states {
        match state {
            IndexState::Pending => counts.pending += 1,
            IndexState::Indexing => counts.indexing += 1,
            IndexState::Indexed => counts.indexed += 1,
            IndexState::Failed => counts.failed += 1,
            IndexState::Disabled => counts.disabled += 1,
            IndexState::Unrecognized(_) => counts.unrecognized += 1,
        }
    }
    counts
}

#[async_trait]
impl IndexService for MemoryIndexService {
    async fn get_summary(&self, filter: SummaryFilter) -> anyhow::Result<IndexStatusSummary> {
        let store = self.store.read().await;
        if let Some(error) = &store.summary_error {
            bail!(error.clone());
        }

        let in_scope: Vec<&ResourceIndexRecord> = store
            .records
            .iter()
            .filter(|r| {
                filter
                    .resource_type
                    .as_ref()
                    .map_or(true, |t| &r.resource_type == t)
            })
            .collect();

        let text = count_states(in_scope.iter().map(|r| &r.text_index_state));
        let mm_scope: Vec<&&ResourceIndexRecord> = in_scope
            .iter()
            .filter(|r| is_multimodal_type(&r.resource_type))
            .collect();
        let mm = count_states(mm_scope.iter().map(|r| &r.mm_index_state));

        let limit = if filter.limit == 0 {
            DEFAULT_SUMMARY_LIMIT
        } else {
            filter.limit
        };
        let resources = in_scope
            .iter()
            .filter(|r| {
                filter
                    .state_filter
                    .as_ref()
                    .map_or(true, |s| &r.text_index_state == s)
            })
            .take(limit as usize)
            .map(|r| (*r).clone())
            .collect();

        // Unrecognized states count toward pending so totals still add up
        Ok(IndexStatusSummary {
            total_resources: in_scope.len() as u32,
            indexed_count: text.indexed,
            pending_count: text.pending + text.unrecognized,
            indexing_count: text.indexing,
            failed_count: text.failed,
            disabled_count: text.disabled,
            stale_count: in_scope
                .iter()
                .filter(|r| r.is_stale && r.text_index_state == IndexState::Indexed)
                .count() as u32,
            mm_total_resources: mm_scope.len() as u32,
            mm_indexed_count: mm.indexed,
            mm_pending_count: mm.pending + mm.unrecognized,
            mm_indexing_count: mm.indexing,
            mm_failed_count: mm.failed,
            mm_disabled_count: mm.disabled,
            resources,
        })
    }

    async fn list_dimensions(&self) -> anyhow::Result<Vec<DimensionInfo>> {
        let store = self.store.read().await;
        let mut table: BTreeMap<(&str, u32), u64> = BTreeMap::new();

        for record in &store.records {
            if let Some(dim) = record.text_embedding_dim {
                *table.entry(("text", dim)).or_default() += record.text_chunk_count as u64;
            }
            if let Some(dim) = record.mm_embedding_dim {
                *table.entry(("multimodal", dim)).or_default() += record.mm_indexed_pages as u64;
            }
        }

        Ok(table
            .into_iter()
            .map(|((modality, dimension), record_count)| DimensionInfo {
                modality: modality.to_string(),
                dimension,
                record_count,
            })
            .collect())
    }

    async fn submit_batch(&self, max_count: u32) -> anyhow::Result<BatchAck> {
        let claimed: Vec<(String, String)> = {
            let mut store = self.store.write().await;
            if let Some(error) = &store.submit_error {
                bail!(error.clone());
            }

            let now = now_ms();
            store
                .records
                .iter_mut()
                .filter(|r| {
                    matches!(
                        r.text_index_state,
                        IndexState::Pending | IndexState::Failed
                    )
                })
                .take(max_count as usize)
                .map(|r| {
                    r.text_index_state = IndexState::Indexing;
                    r.updated_at = now;
                    (r.resource_id.clone(), r.label().to_string())
                })
                .collect()
        };

        let ack = BatchAck {
            batch_id: uuid::Uuid::new_v4().to_string(),
            total: claimed.len() as u32,
        };
        tracing::info!(batch_id = %ack.batch_id, total = ack.total, "Batch claimed");

        // Nothing claimed: the backend stays silent
        if !claimed.is_empty() {
            tokio::spawn(self.clone().run_batch(claimed));
        }

        Ok(ack)
    }

    async fn index_item(
        &self,
        source_type: &str,
        source_id: &str,
        options: IndexItemOptions,
    ) -> anyhow::Result<IndexItemResult> {
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);

        let (resource_id, already_indexed, fails) = {
            let mut store = self.store.write().await;
            let record = store
                .records
                .iter()
                .find(|r| r.source_id.as_deref() == Some(source_id))
                .ok_or_else(|| anyhow!("Resource not found: {} {}", source_type, source_id))?;
            let resource_id = record.resource_id.clone();
            let already_indexed = record.mm_index_state == IndexState::Indexed;
            let fails = store.fails(record);

            if !already_indexed || options.force_rebuild {
                let record = store.get_mut(&resource_id)?;
                record.mm_index_state = IndexState::Indexing;
                record.updated_at = now_ms();
            }
            (resource_id, already_indexed, fails)
        };

        if already_indexed && !options.force_rebuild {
            let store = self.store.read().await;
            let pages = store
                .records
                .iter()
                .find(|r| r.resource_id == resource_id)
                .map_or(0, |r| r.mm_indexed_pages);
            return Ok(IndexItemResult {
                indexed_pages: pages,
                dimension: Some(MULTIMODAL_DIMENSION),
                failed_pages: 0,
            });
        }

        let event = |phase: &str, current_page: u32| {
            json!({
                "phase": phase,
                "sourceType": source_type,
                "sourceId": source_id,
                "resourceId": resource_id,
                "currentPage": current_page,
                "totalPages": PAGES_PER_ITEM,
            })
        };

        self.emit_mm(event("preparing", 0));
        tokio::time::sleep(self.item_delay / 2).await;
        self.emit_mm(event("embedding", PAGES_PER_ITEM / 2));
        tokio::time::sleep(self.item_delay / 2).await;

        let mut store = self.store.write().await;
        let record = store.get_mut(&resource_id)?;
        record.updated_at = now_ms();

        if fails {
            let error = format!("Vision model rejected {}", source_id);
            record.mm_index_state = IndexState::Failed;
            record.mm_index_error = Some(error.clone());
            drop(store);

            let mut payload = event("failed", PAGES_PER_ITEM / 2);
            payload["error"] = json!(error);
            self.emit_mm(payload);
            bail!(error);
        }

        self.emit_mm(event("saving", PAGES_PER_ITEM));
        record.mm_index_state = IndexState::Indexed;
        record.mm_indexed_pages = PAGES_PER_ITEM;
        record.mm_embedding_dim = Some(MULTIMODAL_DIMENSION);
        record.mm_index_error = None;
        record.mm_indexing_mode = Some("vl_embedding".to_string());
        drop(store);

        self.emit_mm(event("completed", PAGES_PER_ITEM));

        if let Some(folder_id) = &options.folder_id {
            tracing::trace!(source_id, folder_id = %folder_id, "Indexed item in folder");
        }

        Ok(IndexItemResult {
            indexed_pages: PAGES_PER_ITEM,
            dimension: Some(MULTIMODAL_DIMENSION),
            failed_pages: 0,
        })
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<EventStream> {
        let rx = if channel == self.batch_channel {
            self.batch_tx.subscribe()
        } else if channel == self.multimodal_channel {
            self.mm_tx.subscribe()
        } else {
            bail!("Unknown event channel: {}", channel);
        };

        let channel = channel.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let channel = channel.clone();
            async move {
                match item {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "Event subscriber lagged");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn reset_all(&self) -> anyhow::Result<u32> {
        let mut store = self.store.write().await;
        let now = now_ms();
        for record in store.records.iter_mut() {
            record.text_index_state = IndexState::Pending;
            record.text_chunk_count = 0;
            record.text_embedding_dim = None;
            record.text_indexed_at = None;
            record.text_index_error = None;
            record.is_stale = false;
            record.mm_index_state = IndexState::Pending;
            record.mm_indexed_pages = 0;
            record.mm_embedding_dim = None;
            record.mm_index_error = None;
            record.mm_indexing_mode = None;
            record.updated_at = now;
        }
        Ok(store.records.len() as u32)
    }

    async fn reset_disabled_to_pending(&self) -> anyhow::Result<u32> {
        let mut store = self.store.write().await;
        let mut updated = 0;
        for record in store
            .records
            .iter_mut()
            .filter(|r| r.text_index_state == IndexState::Disabled)
        {
            record.text_index_state = IndexState::Pending;
            record.text_index_error = None;
            updated += 1;
        }
        Ok(updated)
    }

    async fn reset_indexed_without_embeddings(&self) -> anyhow::Result<u32> {
        let mut store = self.store.write().await;
        let mut updated = 0;
        for record in store
            .records
            .iter_mut()
            .filter(|r| r.text_index_state == IndexState::Indexed && r.text_chunk_count == 0)
        {
            record.text_index_state = IndexState::Pending;
            record.text_index_error = None;
            updated += 1;
        }
        Ok(updated)
    }

    async fn get_diagnostic(&self) -> anyhow::Result<IndexDiagnostic> {
        let store = self.store.read().await;
        let text_counts = count_states(store.records.iter().map(|r| &r.text_index_state));
        let mm_counts = count_states(
            store
                .records
                .iter()
                .filter(|r| is_multimodal_type(&r.resource_type))
                .map(|r| &r.mm_index_state),
        );

        let mut checks = Vec::new();

        let empty_indexed: Vec<&str> = store
            .records
            .iter()
            .filter(|r| r.text_index_state == IndexState::Indexed && r.text_chunk_count == 0)
            .map(|r| r.resource_id.as_str())
            .collect();
        checks.push(ConsistencyCheck {
            check_name: "resources_indexed_without_chunks".to_string(),
            passed: empty_indexed.is_empty(),
            details: if empty_indexed.is_empty() {
                "All indexed resources have chunks".to_string()
            } else {
                format!("Indexed without chunks: {}", empty_indexed.join(", "))
            },
        });

        let empty_mm = store
            .records
            .iter()
            .filter(|r| r.mm_index_state == IndexState::Indexed && r.mm_indexed_pages == 0)
            .count();
        checks.push(ConsistencyCheck {
            check_name: "mm_indexed_without_pages".to_string(),
            passed: empty_mm == 0,
            details: format!("{} multimodal resources indexed without pages", empty_mm),
        });

        let stuck = text_counts.indexing;
        checks.push(ConsistencyCheck {
            check_name: "resources_stuck_indexing".to_string(),
            passed: true,
            details: format!("{} resources currently indexing", stuck),
        });

        checks.push(ConsistencyCheck {
            check_name: "unrecognized_states".to_string(),
            passed: text_counts.unrecognized == 0 && mm_counts.unrecognized == 0,
            details: format!(
                "{} text, {} multimodal",
                text_counts.unrecognized, mm_counts.unrecognized
            ),
        });

        checks.push(ConsistencyCheck {
            check_name: "pending_resources_info".to_string(),
            passed: true,
            details: format!("{} resources pending", text_counts.pending),
        });
        checks.push(ConsistencyCheck {
            check_name: "disabled_resources_info".to_string(),
            passed: true,
            details: format!("{} resources disabled", text_counts.disabled),
        });

        Ok(IndexDiagnostic {
            timestamp: chrono::Utc::now()
                .format("%Y-%m-%d %H:%M:%S%.3f UTC")
                .to_string(),
            text_counts,
            mm_counts,
            consistency_checks: checks,
        })
    }

    async fn set_disabled(&self, resource_id: &str, disabled: bool) -> anyhow::Result<IndexState> {
        let mut store = self.store.write().await;
        let record = store.get_mut(resource_id)?;

        let next = match (disabled, &record.text_index_state) {
            (true, _) => IndexState::Disabled,
            (false, IndexState::Disabled) => IndexState::Pending,
            (false, current) => current.clone(),
        };
        tracing::info!(
            resource_id,
            from = %record.text_index_state,
            to = %next,
            "Index state toggled"
        );
        record.text_index_state = next.clone();
        record.updated_at = now_ms();
        Ok(next)
    }

    async fn reindex(&self, resource_id: &str) -> anyhow::Result<u32> {
        let name = {
            let mut store = self.store.write().await;
            let record = store.get_mut(resource_id)?;
            if record.text_index_state == IndexState::Disabled {
                bail!("Resource {} has indexing disabled", resource_id);
            }
            record.text_index_state = IndexState::Indexing;
            record.label().to_string()
        };

        self.emit_batch(json!({
            "type": "started",
            "resourceId": resource_id,
            "message": format!("Re-indexing {}", name),
        }));
        tokio::time::sleep(self.item_delay).await;

        match self.finish_text_index(resource_id, &name).await {
            Ok(chunk_count) => {
                self.emit_batch(json!({
                    "type": "completed",
                    "resourceId": resource_id,
                    "chunkCount": chunk_count,
                }));
                Ok(chunk_count)
            }
            Err(e) => {
                self.emit_batch(json!({
                    "type": "failed",
                    "resourceId": resource_id,
                    "error": e.to_string(),
                }));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MemoryIndexService {
        MemoryIndexService::from_fixture(ServiceFixture::sample())
            .with_item_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_summary_counts_ignore_state_filter() {
        let service = service();

        let all = service.get_summary(SummaryFilter::default()).await.unwrap();
        assert_eq!(all.total_resources, 7);
        assert!(all.is_consistent());
        assert_eq!(all.resources.len(), 7);

        let filtered = service
            .get_summary(SummaryFilter {
                state_filter: Some(IndexState::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(filtered.total_resources, 7);
        assert_eq!(filtered.pending_count, all.pending_count);
        assert_eq!(filtered.resources.len(), 3);

        let limited = service.get_summary(SummaryFilter::with_limit(2)).await.unwrap();
        assert_eq!(limited.resources.len(), 2);
        assert_eq!(limited.total_resources, 7);
    }

    #[tokio::test]
    async fn test_multimodal_counts_only_eligible_types() {
        let summary = service().get_summary(SummaryFilter::default()).await.unwrap();
        // textbook, exam, image, file
        assert_eq!(summary.mm_total_resources, 4);
        assert_eq!(summary.mm_indexed_count, 1);
    }

    #[tokio::test]
    async fn test_submit_batch_emits_terminal_event() {
        let service = service();
        let mut events = service.subscribe(BATCH_CHANNEL).await.unwrap();

        let ack = service.submit_batch(10).await.unwrap();
        // pending: res_2, res_3, res_7; failed: res_4
        assert_eq!(ack.total, 4);

        let mut last = None;
        while let Some(payload) = events.next().await {
            if payload["type"] == "batch_completed" {
                last = Some(payload);
                break;
            }
        }
        let last = last.unwrap();
        assert_eq!(last["successCount"], 3);
        assert_eq!(last["failCount"], 1);

        let summary = service.get_summary(SummaryFilter::default()).await.unwrap();
        assert_eq!(summary.indexed_count, 5);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.indexing_count, 0);
    }

    #[tokio::test]
    async fn test_submit_batch_with_nothing_pending() {
        let service = MemoryIndexService::new(vec![seed_record(
            "a",
            "note",
            "A",
            IndexState::Indexed,
            IndexState::Pending,
        )]);
        let ack = service.submit_batch(10).await.unwrap();
        assert_eq!(ack.total, 0);
    }

    #[tokio::test]
    async fn test_index_item_updates_record() {
        let service = service();
        let result = service
            .index_item("textbook", "textbook_res_3", IndexItemOptions::default())
            .await
            .unwrap();
        assert_eq!(result.indexed_pages, PAGES_PER_ITEM);

        let err = service
            .index_item("exam", "exam_res_4", IndexItemOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Vision model"));

        let records = service.records().await;
        let textbook = records.iter().find(|r| r.resource_id == "res_3").unwrap();
        assert_eq!(textbook.mm_index_state, IndexState::Indexed);
        let exam = records.iter().find(|r| r.resource_id == "res_4").unwrap();
        assert_eq!(exam.mm_index_state, IndexState::Failed);
        assert_eq!(service.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_toggle_and_resets() {
        let service = service();

        assert_eq!(
            service.set_disabled("res_2", true).await.unwrap(),
            IndexState::Disabled
        );
        assert_eq!(service.reset_disabled_to_pending().await.unwrap(), 2);
        assert_eq!(
            service.set_disabled("res_1", false).await.unwrap(),
            IndexState::Indexed
        );

        service.mark_content_changed("res_1").await.unwrap();
        let summary = service.get_summary(SummaryFilter::default()).await.unwrap();
        assert_eq!(summary.stale_count, 1);

        assert_eq!(service.reset_indexed_without_embeddings().await.unwrap(), 0);
        assert_eq!(service.reset_all().await.unwrap(), 7);
        let summary = service.get_summary(SummaryFilter::default()).await.unwrap();
        assert_eq!(summary.pending_count, 7);
        assert!(service.set_disabled("nope", true).await.is_err());
    }

    #[tokio::test]
    async fn test_diagnostic_flags_empty_indexed() {
        let mut record = seed_record("a", "note", "A", IndexState::Indexed, IndexState::Pending);
        record.text_chunk_count = 0;
        let service = MemoryIndexService::new(vec![record]);

        let report = service.get_diagnostic().await.unwrap();
        assert!(!report.all_passed());
        assert_eq!(report.text_counts.indexed, 1);

        assert_eq!(service.reset_indexed_without_embeddings().await.unwrap(), 1);
        assert!(service.get_diagnostic().await.unwrap().all_passed());
    }

    #[tokio::test]
    async fn test_unknown_channel_rejected() {
        assert!(service().subscribe("nope").await.is_err());
    }

    #[test]
    fn test_fixture_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("fixture.json");
        std::fs::write(
            &path,
            serde_json::to_string(&ServiceFixture::sample()).unwrap(),
        )
        .unwrap();

        let fixture = ServiceFixture::load(&path).unwrap();
        assert_eq!(fixture.resources.len(), 7);
        assert!(ServiceFixture::load(&temp_dir.path().join("missing.json")).is_err());
    }
}
