//! Progress events from the indexing service.
//!
//! Two channels with different payload shapes arrive here:
//!
//! ```text
//! vfs-index-progress (tag "type")        mm_index_progress (tag "phase")
//! ───────────────────────────────        ───────────────────────────────
//! batch_started / prepared               preparing
//! resource_started / started             summarizing
//! embedding_progress                     embedding
//! auto_extract_phase                     saving
//! resource_completed / completed         completed
//! resource_failed / failed               failed
//! batch_completed / batch_failed
//!          │                                      │
//!          └──────────► ProgressEvent ◄───────────┘
//! ```
//!
//! Payloads are validated here. Anything that does not match a known shape
//! is rejected with [`EventShapeError`] and dropped by the adapter.

mod watcher;

pub use watcher::{ProgressEventAdapter, Subscription};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which progress channel an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Batch,
    Multimodal,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Batch => write!(f, "batch"),
            Channel::Multimodal => write!(f, "multimodal"),
        }
    }
}

/// Normalized progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        percent: u8,
        message: String,
    },
    ItemProgress {
        item: String,
        percent: u8,
        message: String,
    },
    ItemCompleted {
        item: String,
        percent: u8,
        message: String,
    },
    ItemFailed {
        item: String,
        percent: u8,
        message: String,
        error: String,
    },
    BatchCompleted {
        percent: u8,
        message: String,
        success_count: u32,
        fail_count: u32,
    },
    BatchFailed {
        percent: u8,
        message: String,
        error: String,
    },
}

impl ProgressEvent {
    pub fn percent(&self) -> u8 {
        match self {
            ProgressEvent::Started { percent, .. }
            | ProgressEvent::ItemProgress { percent, .. }
            | ProgressEvent::ItemCompleted { percent, .. }
            | ProgressEvent::ItemFailed { percent, .. }
            | ProgressEvent::BatchCompleted { percent, .. }
            | ProgressEvent::BatchFailed { percent, .. } => *percent,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProgressEvent::Started { message, .. }
            | ProgressEvent::ItemProgress { message, .. }
            | ProgressEvent::ItemCompleted { message, .. }
            | ProgressEvent::ItemFailed { message, .. }
            | ProgressEvent::BatchCompleted { message, .. }
            | ProgressEvent::BatchFailed { message, .. } => message,
        }
    }

    pub fn item(&self) -> Option<&str> {
        match self {
            ProgressEvent::ItemProgress { item, .. }
            | ProgressEvent::ItemCompleted { item, .. }
            | ProgressEvent::ItemFailed { item, .. } => Some(item),
            _ => None,
        }
    }

    /// End of a whole run (batch level).
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::BatchCompleted { .. } | ProgressEvent::BatchFailed { .. }
        )
    }

    /// End of a single item.
    pub fn is_item_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::ItemCompleted { .. } | ProgressEvent::ItemFailed { .. }
        )
    }
}

/// A normalized event tagged with its channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelEvent {
    pub channel: Channel,
    pub event: ProgressEvent,
}

#[derive(Debug, thiserror::Error)]
pub enum EventShapeError {
    #[error("unrecognized event payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("event carries no item identifier")]
    MissingItem,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum RawBatchEvent {
    Prepared {
        #[serde(default)]
        total: u32,
        #[serde(default)]
        message: String,
    },
    BatchStarted {
        #[serde(default)]
        total: u32,
        #[serde(default)]
        message: String,
    },
    Started {
        #[serde(default)]
        resource_id: Option<String>,
        #[serde(default)]
        message: String,
    },
    ResourceStarted {
        resource_id: String,
        #[serde(default)]
        current: u32,
        #[serde(default)]
        total: u32,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: String,
    },
    EmbeddingProgress {
        resource_id: String,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        chunks_processed: u32,
        #[serde(default)]
        chunks_total: u32,
        #[serde(default)]
        message: String,
    },
    AutoExtractPhase {
        #[serde(default)]
        resource_id: Option<String>,
        #[serde(default)]
        phase: Option<String>,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: String,
    },
    ResourceCompleted {
        resource_id: String,
        #[serde(default)]
        chunk_count: u32,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: String,
    },
    Completed {
        resource_id: String,
        #[serde(default)]
        chunk_count: u32,
        #[serde(default)]
        message: String,
    },
    ResourceFailed {
        resource_id: String,
        #[serde(default)]
        error: String,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: String,
    },
    Failed {
        resource_id: String,
        #[serde(default)]
        error: String,
        #[serde(default)]
        message: String,
    },
    BatchCompleted {
        #[serde(default)]
        success_count: u32,
        #[serde(default)]
        fail_count: u32,
        #[serde(default)]
        message: String,
    },
    BatchFailed {
        #[serde(default)]
        error: String,
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum MultimodalPhase {
    Preparing,
    Summarizing,
    Embedding,
    Saving,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMultimodalEvent {
    phase: MultimodalPhase,
    #[serde(default)]
    current_page: u32,
    #[serde(default)]
    total_pages: u32,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    error: Option<String>,
}

fn clamp_percent(value: f64) -> u8 {
    if value.is_nan() {
        0
    } else {
        value.round().clamp(0.0, 100.0) as u8
    }
}

fn percent_or(progress: Option<f64>, fallback: u8) -> u8 {
    progress.map(clamp_percent).unwrap_or(fallback)
}

fn fraction_percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        0
    } else {
        clamp_percent(done as f64 * 100.0 / total as f64)
    }
}

fn or_default(message: String, fallback: impl FnOnce() -> String) -> String {
    if message.trim().is_empty() {
        fallback()
    } else {
        message
    }
}

/// Normalize a batch-channel payload.
pub fn normalize_batch(payload: &Value) -> Result<ProgressEvent, EventShapeError> {
    let raw: RawBatchEvent = serde_json::from_value(payload.clone())?;

    let event = match raw {
        RawBatchEvent::Prepared { total, message } => ProgressEvent::Started {
            percent: 0,
            message: or_default(message, || format!("Preparing {} resources", total)),
        },
        RawBatchEvent::BatchStarted { total, message } => ProgressEvent::Started {
            percent: 0,
            message: or_default(message, || format!("Indexing {} resources", total)),
        },
        RawBatchEvent::Started {
            resource_id: Some(resource_id),
            message,
        } => ProgressEvent::ItemProgress {
            message: or_default(message, || format!("Indexing {}", resource_id)),
            item: resource_id,
            percent: 0,
        },
        RawBatchEvent::Started {
            resource_id: None,
            message,
        } => ProgressEvent::Started {
            percent: 0,
            message: or_default(message, || "Indexing started".to_string()),
        },
        RawBatchEvent::ResourceStarted {
            resource_id,
            current,
            total,
            progress,
            message,
        } => ProgressEvent::ItemProgress {
            percent: percent_or(progress, fraction_percent(current.saturating_sub(1), total)),
            message: or_default(message, || format!("Indexing resource {}/{}", current, total)),
            item: resource_id,
        },
        RawBatchEvent::EmbeddingProgress {
            resource_id,
            progress,
            chunks_processed,
            chunks_total,
            message,
        } => ProgressEvent::ItemProgress {
            percent: percent_or(progress, 0),
            message: or_default(message, || {
                format!("Embedding {}/{} chunks", chunks_processed, chunks_total)
            }),
            item: resource_id,
        },
        RawBatchEvent::AutoExtractPhase {
            resource_id,
            phase,
            progress,
            message,
        } => {
            let message = or_default(message, || {
                format!("Extracting text ({})", phase.as_deref().unwrap_or("ocr"))
            });
            match resource_id {
                Some(item) => ProgressEvent::ItemProgress {
                    item,
                    percent: percent_or(progress, 0),
                    message,
                },
                None => ProgressEvent::Started {
                    percent: percent_or(progress, 0),
                    message,
                },
            }
        }
        RawBatchEvent::ResourceCompleted {
            resource_id,
            chunk_count,
            progress,
            message,
        } => ProgressEvent::ItemCompleted {
            percent: percent_or(progress, 0),
            message: or_default(message, || format!("Indexed {} chunks", chunk_count)),
            item: resource_id,
        },
        RawBatchEvent::Completed {
            resource_id,
            chunk_count,
            message,
        } => ProgressEvent::ItemCompleted {
            percent: 100,
            message: or_default(message, || format!("Indexed {} chunks", chunk_count)),
            item: resource_id,
        },
        RawBatchEvent::ResourceFailed {
            resource_id,
            error,
            progress,
            message,
        } => ProgressEvent::ItemFailed {
            percent: percent_or(progress, 0),
            message: or_default(message, || format!("Indexing failed: {}", error)),
            item: resource_id,
            error,
        },
        RawBatchEvent::Failed {
            resource_id,
            error,
            message,
        } => ProgressEvent::ItemFailed {
            percent: 100,
            message: or_default(message, || format!("Indexing failed: {}", error)),
            item: resource_id,
            error,
        },
        RawBatchEvent::BatchCompleted {
            success_count,
            fail_count,
            message,
        } => ProgressEvent::BatchCompleted {
            percent: 100,
            message: or_default(message, || {
                format!(
                    "Batch indexing complete: {} succeeded, {} failed",
                    success_count, fail_count
                )
            }),
            success_count,
            fail_count,
        },
        RawBatchEvent::BatchFailed { error, message } => ProgressEvent::BatchFailed {
            percent: 100,
            message: or_default(message, || format!("Batch indexing failed: {}", error)),
            error,
        },
    };

    Ok(event)
}

/// Item id of a multimodal payload: the source id, else the resource id.
/// Null or blank ids are skipped.
pub fn multimodal_item_id(payload: &Value) -> Option<String> {
    ["sourceId", "resourceId"]
        .iter()
        .filter_map(|key| payload.get(*key).and_then(Value::as_str))
        .find(|id| !id.trim().is_empty())
        .map(str::to_string)
}

/// Normalize a multimodal-channel payload.
///
/// `label` resolves a raw item id to a display name; a miss falls back to
/// the raw id.
pub fn normalize_multimodal(
    payload: &Value,
    label: impl Fn(&str) -> Option<String>,
) -> Result<ProgressEvent, EventShapeError> {
    let raw: RawMultimodalEvent = serde_json::from_value(payload.clone())?;

    let item = multimodal_item_id(payload).ok_or(EventShapeError::MissingItem)?;
    let name = label(&item).unwrap_or_else(|| item.clone());

    let page_percent = fraction_percent(raw.current_page, raw.total_pages);
    let percent = percent_or(raw.progress, page_percent);
    let pages = if raw.total_pages > 0 {
        format!(" ({}/{})", raw.current_page, raw.total_pages)
    } else {
        String::new()
    };
    let detail = |verb: &str| or_default(raw.message.clone(), || format!("{}{}", verb, pages));

    let event = match raw.phase {
        MultimodalPhase::Preparing => ProgressEvent::ItemProgress {
            message: format!("{}: {}", name, detail("Preparing")),
            item,
            percent,
        },
        MultimodalPhase::Summarizing => ProgressEvent::ItemProgress {
            message: format!("{}: {}", name, detail("Summarizing pages")),
            item,
            percent,
        },
        MultimodalPhase::Embedding => ProgressEvent::ItemProgress {
            message: format!("{}: {}", name, detail("Embedding pages")),
            item,
            percent,
        },
        MultimodalPhase::Saving => ProgressEvent::ItemProgress {
            message: format!("{}: {}", name, detail("Saving")),
            item,
            percent,
        },
        MultimodalPhase::Completed => ProgressEvent::ItemCompleted {
            message: format!("{}: {}", name, detail("Multimodal index complete")),
            item,
            percent: 100,
        },
        MultimodalPhase::Failed => {
            let error = raw
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            ProgressEvent::ItemFailed {
                message: format!("{}: {}", name, detail("Multimodal index failed")),
                item,
                percent: 100,
                error,
            }
        }
    };

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_batch_started() {
        let event = normalize_batch(&json!({"type": "batch_started", "total": 7})).unwrap();
        assert_eq!(
            event,
            ProgressEvent::Started {
                percent: 0,
                message: "Indexing 7 resources".to_string()
            }
        );
    }

    #[test]
    fn test_batch_resource_events() {
        let started = normalize_batch(&json!({
            "type": "resource_started",
            "resourceId": "res_1",
            "current": 2,
            "total": 4,
            "progress": 25,
            "message": "Indexing 2/4"
        }))
        .unwrap();
        assert_eq!(started.item(), Some("res_1"));
        assert_eq!(started.percent(), 25);

        let failed = normalize_batch(&json!({
            "type": "resource_failed",
            "resourceId": "res_2",
            "error": "boom",
            "progress": 50
        }))
        .unwrap();
        assert!(failed.is_item_terminal());
        assert!(!failed.is_run_terminal());
        assert_eq!(failed.message(), "Indexing failed: boom");
    }

    #[test]
    fn test_batch_completed_carries_tally() {
        let event = normalize_batch(&json!({
            "type": "batch_completed",
            "successCount": 6,
            "failCount": 1,
            "total": 7,
            "progress": 100
        }))
        .unwrap();

        match event {
            ProgressEvent::BatchCompleted {
                percent,
                success_count,
                fail_count,
                ..
            } => {
                assert_eq!(percent, 100);
                assert_eq!(success_count, 6);
                assert_eq!(fail_count, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_batch_percent_is_clamped() {
        let event = normalize_batch(&json!({
            "type": "embedding_progress",
            "resourceId": "res_1",
            "progress": 250.4
        }))
        .unwrap();
        assert_eq!(event.percent(), 100);
    }

    #[test]
    fn test_batch_unknown_shapes_rejected() {
        assert!(normalize_batch(&json!({"type": "teleported"})).is_err());
        assert!(normalize_batch(&json!({"progress": 10})).is_err());
        assert!(normalize_batch(&json!("batch_completed")).is_err());
        // Required field missing
        assert!(normalize_batch(&json!({"type": "resource_started"})).is_err());
    }

    #[test]
    fn test_multimodal_label_lookup() {
        let payload = json!({
            "phase": "embedding",
            "sourceId": "textbook_1",
            "currentPage": 3,
            "totalPages": 12
        });

        let event = normalize_multimodal(&payload, |id| {
            (id == "textbook_1").then(|| "Linear Algebra".to_string())
        })
        .unwrap();
        assert_eq!(event.item(), Some("textbook_1"));
        assert_eq!(event.percent(), 25);
        assert_eq!(event.message(), "Linear Algebra: Embedding pages (3/12)");

        let missed = normalize_multimodal(&payload, |_| None).unwrap();
        assert_eq!(missed.message(), "textbook_1: Embedding pages (3/12)");
    }

    #[test]
    fn test_multimodal_terminal_phases() {
        let done = normalize_multimodal(
            &json!({"phase": "completed", "sourceId": "exam_1"}),
            |_| None,
        )
        .unwrap();
        assert!(done.is_item_terminal());
        assert_eq!(done.percent(), 100);

        let failed = normalize_multimodal(
            &json!({"phase": "failed", "resourceId": "res_9", "error": "vision model offline"}),
            |_| None,
        )
        .unwrap();
        match failed {
            ProgressEvent::ItemFailed { error, .. } => assert_eq!(error, "vision model offline"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_multimodal_rejects_bad_shapes() {
        assert!(matches!(
            normalize_multimodal(&json!({"phase": "embedding"}), |_| None),
            Err(EventShapeError::MissingItem)
        ));
        assert!(matches!(
            normalize_multimodal(&json!({"phase": "dreaming", "sourceId": "x"}), |_| None),
            Err(EventShapeError::Malformed(_))
        ));
    }

    #[test]
    fn test_blank_source_id_falls_back_to_resource_id() {
        for source in [json!(null), json!(""), json!("  ")] {
            let payload = json!({
                "phase": "embedding",
                "sourceId": source,
                "resourceId": "res_9",
                "currentPage": 1,
                "totalPages": 2,
            });
            assert_eq!(multimodal_item_id(&payload).as_deref(), Some("res_9"));

            let event = normalize_multimodal(&payload, |id| {
                (id == "res_9").then(|| "Lab report".to_string())
            })
            .unwrap();
            assert_eq!(event.item(), Some("res_9"));
            assert!(event.message().starts_with("Lab report: "));
        }

        let neither = json!({"phase": "completed", "sourceId": null});
        assert!(multimodal_item_id(&neither).is_none());
        assert!(matches!(
            normalize_multimodal(&neither, |_| None),
            Err(EventShapeError::MissingItem)
        ));
    }
}
