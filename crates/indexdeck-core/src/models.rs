//! Snapshot types returned by the indexing service.
//!
//! Records are owned by the snapshot that produced them and are replaced
//! wholesale on every refresh. Progress events never patch them.

use serde::{Deserialize, Serialize};

/// Index state of one channel (text or multimodal) of a resource.
///
/// Unknown backend strings are kept as `Unrecognized` instead of failing
/// deserialization, so a single odd row cannot break a whole snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IndexState {
    Pending,
    Indexing,
    Indexed,
    Failed,
    Disabled,
    Unrecognized(String),
}

impl IndexState {
    pub fn as_str(&self) -> &str {
        match self {
            IndexState::Pending => "pending",
            IndexState::Indexing => "indexing",
            IndexState::Indexed => "indexed",
            IndexState::Failed => "failed",
            IndexState::Disabled => "disabled",
            IndexState::Unrecognized(raw) => raw,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, IndexState::Unrecognized(_))
    }
}

impl From<String> for IndexState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "pending" => IndexState::Pending,
            "indexing" => IndexState::Indexing,
            "indexed" => IndexState::Indexed,
            "failed" => IndexState::Failed,
            "disabled" => IndexState::Disabled,
            _ => IndexState::Unrecognized(value),
        }
    }
}

impl From<&str> for IndexState {
    fn from(value: &str) -> Self {
        IndexState::from(value.to_string())
    }
}

impl From<IndexState> for String {
    fn from(value: IndexState) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Index status of a single resource, as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIndexRecord {
    pub resource_id: String,
    /// Business id used for multimodal indexing (e.g. `textbook_xxx`)
    #[serde(default)]
    pub source_id: Option<String>,
    pub resource_type: String,
    /// Display name
    #[serde(default)]
    pub name: String,

    pub text_index_state: IndexState,
    #[serde(default)]
    pub text_chunk_count: u32,
    #[serde(default)]
    pub text_embedding_dim: Option<u32>,
    /// Milliseconds since epoch
    #[serde(default)]
    pub text_indexed_at: Option<i64>,
    #[serde(default)]
    pub text_index_error: Option<String>,
    /// Content changed after the last successful text index
    #[serde(default)]
    pub is_stale: bool,

    pub mm_index_state: IndexState,
    #[serde(default)]
    pub mm_indexed_pages: u32,
    #[serde(default)]
    pub mm_embedding_dim: Option<u32>,
    #[serde(default)]
    pub mm_index_error: Option<String>,
    #[serde(default)]
    pub mm_indexing_mode: Option<String>,

    pub updated_at: i64,
}

impl ResourceIndexRecord {
    /// Source id usable for a per-item multimodal call, if any.
    pub fn resolvable_source_id(&self) -> Option<&str> {
        self.source_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Human label for progress messages.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.resource_id
        } else {
            &self.name
        }
    }
}

/// Aggregate counts plus the (possibly filtered and limited) record list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatusSummary {
    pub total_resources: u32,
    pub indexed_count: u32,
    pub pending_count: u32,
    pub indexing_count: u32,
    pub failed_count: u32,
    pub disabled_count: u32,
    pub stale_count: u32,

    pub mm_total_resources: u32,
    pub mm_indexed_count: u32,
    pub mm_pending_count: u32,
    pub mm_indexing_count: u32,
    pub mm_failed_count: u32,
    pub mm_disabled_count: u32,

    #[serde(default)]
    pub resources: Vec<ResourceIndexRecord>,
}

impl IndexStatusSummary {
    /// Per-state counts add up to the totals on both channels.
    pub fn is_consistent(&self) -> bool {
        let text = self.indexed_count
            + self.pending_count
            + self.indexing_count
            + self.failed_count
            + self.disabled_count;
        let mm = self.mm_indexed_count
            + self.mm_pending_count
            + self.mm_indexing_count
            + self.mm_failed_count
            + self.mm_disabled_count;
        text == self.total_resources && mm == self.mm_total_resources
    }

    /// Number of resources the text batch would pick up.
    pub fn text_candidate_count(&self) -> u32 {
        self.pending_count + self.failed_count
    }

    /// Look up a record by resource id or source id.
    pub fn find(&self, id: &str) -> Option<&ResourceIndexRecord> {
        self.resources
            .iter()
            .find(|r| r.resource_id == id || r.source_id.as_deref() == Some(id))
    }
}

/// Filter for a snapshot fetch.
///
/// `state_filter` narrows the record list only; counts always cover every
/// resource matching `resource_type`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryFilter {
    pub state_filter: Option<IndexState>,
    pub resource_type: Option<String>,
    pub limit: u32,
}

impl SummaryFilter {
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

/// Embedding dimension table entry (informational).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionInfo {
    pub modality: String,
    pub dimension: u32,
    pub record_count: u64,
}

/// Acknowledgement of a batch submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAck {
    pub batch_id: String,
    /// Resources claimed for this batch. Zero means no events will follow.
    pub total: u32,
}

/// Options forwarded to a per-item multimodal index call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexItemOptions {
    pub folder_id: Option<String>,
    pub force_rebuild: bool,
}

/// Result of a successful per-item multimodal index call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexItemResult {
    pub indexed_pages: u32,
    pub dimension: Option<u32>,
    pub failed_pages: u32,
}

/// Raw state counts for the diagnostic report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStateCounts {
    pub pending: u32,
    pub indexing: u32,
    pub indexed: u32,
    pub failed: u32,
    pub disabled: u32,
    pub unrecognized: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyCheck {
    pub check_name: String,
    pub passed: bool,
    pub details: String,
}

/// Read-only troubleshooting report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDiagnostic {
    pub timestamp: String,
    pub text_counts: IndexStateCounts,
    pub mm_counts: IndexStateCounts,
    pub consistency_checks: Vec<ConsistencyCheck>,
}

impl IndexDiagnostic {
    pub fn all_passed(&self) -> bool {
        self.consistency_checks.iter().all(|c| c.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_state_from_str() {
        assert_eq!(IndexState::from("pending"), IndexState::Pending);
        assert_eq!(IndexState::from("disabled"), IndexState::Disabled);
        assert_eq!(
            IndexState::from("queued"),
            IndexState::Unrecognized("queued".to_string())
        );
        assert!(!IndexState::from("queued").is_recognized());
    }

    #[test]
    fn test_record_deserializes_unknown_state() {
        let json = serde_json::json!({
            "resourceId": "res_1",
            "sourceId": "textbook_1",
            "resourceType": "textbook",
            "name": "Algebra",
            "textIndexState": "migrating",
            "mmIndexState": "indexed",
            "mmIndexedPages": 12,
            "updatedAt": 1700000000000i64
        });

        let record: ResourceIndexRecord = serde_json::from_value(json).unwrap();
        assert_eq!(
            record.text_index_state,
            IndexState::Unrecognized("migrating".to_string())
        );
        assert_eq!(record.mm_index_state, IndexState::Indexed);
        assert_eq!(record.mm_indexed_pages, 12);
        assert!(!record.is_stale);
    }

    #[test]
    fn test_resolvable_source_id() {
        let json = serde_json::json!({
            "resourceId": "res_1",
            "sourceId": "   ",
            "resourceType": "file",
            "textIndexState": "pending",
            "mmIndexState": "pending",
            "updatedAt": 0
        });
        let mut record: ResourceIndexRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.resolvable_source_id(), None);
        assert_eq!(record.label(), "res_1");

        record.source_id = Some("file_9".to_string());
        assert_eq!(record.resolvable_source_id(), Some("file_9"));
    }

    #[test]
    fn test_summary_consistency() {
        let summary = IndexStatusSummary {
            total_resources: 17,
            indexed_count: 10,
            pending_count: 5,
            failed_count: 2,
            ..Default::default()
        };
        assert!(summary.is_consistent());
        assert_eq!(summary.text_candidate_count(), 7);

        let broken = IndexStatusSummary {
            total_resources: 3,
            indexed_count: 1,
            ..Default::default()
        };
        assert!(!broken.is_consistent());
    }
}
