//! Grouped and ratio views over a summary snapshot.
//!
//! Pure: no I/O, no logging. Callers log the `unrecognized` list.

use serde::Serialize;

use crate::models::{IndexState, IndexStatusSummary, ResourceIndexRecord};

/// Records bucketed by effective text state.
///
/// Records keep their true state; only the bucket differs (a stale
/// `indexed` record sits under `pending`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateGroups {
    pub pending: Vec<ResourceIndexRecord>,
    pub indexing: Vec<ResourceIndexRecord>,
    pub indexed: Vec<ResourceIndexRecord>,
    pub failed: Vec<ResourceIndexRecord>,
    pub disabled: Vec<ResourceIndexRecord>,
}

impl StateGroups {
    pub fn total(&self) -> usize {
        self.pending.len()
            + self.indexing.len()
            + self.indexed.len()
            + self.failed.len()
            + self.disabled.len()
    }

    pub fn get(&self, state: &IndexState) -> &[ResourceIndexRecord] {
        match state {
            IndexState::Pending | IndexState::Unrecognized(_) => &self.pending,
            IndexState::Indexing => &self.indexing,
            IndexState::Indexed => &self.indexed,
            IndexState::Failed => &self.failed,
            IndexState::Disabled => &self.disabled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IndexRatios {
    /// indexed / total on the text channel
    pub text: f64,
    /// text and multimodal folded together, or `text` when no resource is multimodal
    pub combined: f64,
}

/// Output of [`reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciledView {
    pub groups: StateGroups,
    pub ratios: IndexRatios,
    /// Resource ids grouped under pending because they are stale
    pub stale: Vec<String>,
    /// (resource id, raw state) pairs with an unknown text state
    pub unrecognized: Vec<(String, String)>,
}

/// Effective group for a record.
pub fn effective_state(record: &ResourceIndexRecord) -> IndexState {
    match &record.text_index_state {
        IndexState::Indexed if record.is_stale => IndexState::Pending,
        IndexState::Unrecognized(_) => IndexState::Pending,
        state => state.clone(),
    }
}

pub fn reconcile(summary: &IndexStatusSummary) -> ReconciledView {
    let mut view = ReconciledView::default();

    for record in &summary.resources {
        if let IndexState::Unrecognized(raw) = &record.text_index_state {
            view.unrecognized
                .push((record.resource_id.clone(), raw.clone()));
        }
        if record.text_index_state == IndexState::Indexed && record.is_stale {
            view.stale.push(record.resource_id.clone());
        }

        let bucket = match effective_state(record) {
            IndexState::Indexing => &mut view.groups.indexing,
            IndexState::Indexed => &mut view.groups.indexed,
            IndexState::Failed => &mut view.groups.failed,
            IndexState::Disabled => &mut view.groups.disabled,
            IndexState::Pending | IndexState::Unrecognized(_) => &mut view.groups.pending,
        };
        bucket.push(record.clone());
    }

    view.ratios = ratios(summary);
    view
}

fn ratio(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn ratios(summary: &IndexStatusSummary) -> IndexRatios {
    let text = ratio(summary.indexed_count, summary.total_resources);
    let combined = if summary.mm_total_resources > 0 {
        ratio(
            summary.indexed_count + summary.mm_indexed_count,
            summary.total_resources + summary.mm_total_resources,
        )
    } else {
        text
    };
    IndexRatios { text, combined }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, state: &str, stale: bool) -> ResourceIndexRecord {
        ResourceIndexRecord {
            resource_id: id.to_string(),
            source_id: None,
            resource_type: "note".to_string(),
            name: id.to_string(),
            text_index_state: IndexState::from(state),
            text_chunk_count: 0,
            text_embedding_dim: None,
            text_indexed_at: None,
            text_index_error: None,
            is_stale: stale,
            mm_index_state: IndexState::Pending,
            mm_indexed_pages: 0,
            mm_embedding_dim: None,
            mm_index_error: None,
            mm_indexing_mode: None,
            updated_at: 0,
        }
    }

    #[test]
    fn test_stale_indexed_groups_as_pending() {
        let summary = IndexStatusSummary {
            total_resources: 2,
            indexed_count: 2,
            stale_count: 1,
            resources: vec![record("a", "indexed", true), record("b", "indexed", false)],
            ..Default::default()
        };

        let view = reconcile(&summary);
        assert_eq!(view.groups.pending.len(), 1);
        assert_eq!(view.groups.indexed.len(), 1);
        assert_eq!(view.stale, vec!["a".to_string()]);
        // True state survives for detail display
        assert_eq!(view.groups.pending[0].text_index_state, IndexState::Indexed);
    }

    #[test]
    fn test_unrecognized_state_is_kept() {
        let records = vec![
            record("a", "pending", false),
            record("b", "exploded", false),
            record("c", "disabled", false),
            record("d", "failed", false),
            record("e", "indexing", false),
            record("f", "", false),
        ];
        let summary = IndexStatusSummary {
            resources: records.clone(),
            ..Default::default()
        };

        let view = reconcile(&summary);
        assert_eq!(view.groups.total(), records.len());
        assert_eq!(view.groups.pending.len(), 3);
        assert_eq!(view.unrecognized.len(), 2);
        assert_eq!(view.unrecognized[0], ("b".to_string(), "exploded".to_string()));
    }

    #[test]
    fn test_ratios() {
        let empty = reconcile(&IndexStatusSummary::default());
        assert_eq!(empty.ratios.text, 0.0);
        assert_eq!(empty.ratios.combined, 0.0);

        let text_only = IndexStatusSummary {
            total_resources: 4,
            indexed_count: 1,
            ..Default::default()
        };
        let view = reconcile(&text_only);
        assert_eq!(view.ratios.text, 0.25);
        assert_eq!(view.ratios.combined, 0.25);

        let with_mm = IndexStatusSummary {
            total_resources: 4,
            indexed_count: 2,
            mm_total_resources: 4,
            mm_indexed_count: 4,
            ..Default::default()
        };
        let view = reconcile(&with_mm);
        assert_eq!(view.ratios.text, 0.5);
        assert_eq!(view.ratios.combined, 0.75);
    }

    #[test]
    fn test_group_lookup() {
        let summary = IndexStatusSummary {
            resources: vec![record("a", "mystery", false), record("b", "failed", false)],
            ..Default::default()
        };
        let view = reconcile(&summary);
        assert_eq!(view.groups.get(&IndexState::from("mystery")).len(), 1);
        assert_eq!(view.groups.get(&IndexState::Failed).len(), 1);
        assert!(view.groups.get(&IndexState::Disabled).is_empty());
    }
}
