//! Multimodal fan-out: one service call per item, bounded parallelism.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;

use super::context::IndexContext;
use super::limiter::ConcurrencyLimiter;
use crate::config::Settings;
use crate::error::CoordResult;
use crate::events::Channel;
use crate::models::{IndexItemOptions, IndexState, ResourceIndexRecord};

/// Tally of a finished fan-out. `success + fail + skip == total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultimodalRunSummary {
    pub success: u32,
    pub fail: u32,
    pub skip: u32,
    pub total: u32,
}

impl MultimodalRunSummary {
    pub fn settled(&self) -> u32 {
        self.success + self.fail + self.skip
    }
}

#[derive(Debug)]
enum ItemOutcome {
    Indexed,
    Skipped,
    Failed,
}

/// Records that still need multimodal indexing.
pub fn multimodal_candidates(
    records: &[ResourceIndexRecord],
    settings: &Settings,
) -> Vec<ResourceIndexRecord> {
    records
        .iter()
        .filter(|r| settings.is_multimodal_type(&r.resource_type))
        .filter(|r| !matches!(r.mm_index_state, IndexState::Indexed | IndexState::Disabled))
        .cloned()
        .collect()
}

fn round_percent(settled: u32, total: u32) -> u8 {
    if total == 0 {
        100
    } else {
        ((settled * 100 + total / 2) / total).min(100) as u8
    }
}

/// Runs multimodal indexing over a candidate list.
pub struct MultimodalIndexCoordinator {
    ctx: Arc<IndexContext>,
    limiter: ConcurrencyLimiter,
}

impl MultimodalIndexCoordinator {
    pub fn new(ctx: Arc<IndexContext>) -> Self {
        let limiter = ConcurrencyLimiter::new(ctx.settings.max_concurrency);
        Self { ctx, limiter }
    }

    /// Index every candidate, at most `max_concurrency` at a time.
    ///
    /// Resolves when every item has settled. Item failures are tallied and
    /// never stop the rest.
    pub async fn trigger(
        &self,
        candidates: Vec<ResourceIndexRecord>,
    ) -> CoordResult<MultimodalRunSummary> {
        let total = candidates.len() as u32;
        let run_id = self
            .ctx
            .state
            .try_begin(
                Channel::Multimodal,
                &format!("Preparing multimodal index for {} resources", total),
            )
            .await?;
        tracing::info!(run_id, total, "Multimodal index triggered");

        let owned = candidates
            .iter()
            .flat_map(|r| [Some(r.resource_id.clone()), r.source_id.clone()])
            .flatten()
            .collect();
        self.ctx.state.own_items(run_id, owned).await;

        if total == 0 {
            self.ctx
                .state
                .finish(
                    Channel::Multimodal,
                    run_id,
                    "No resources need multimodal indexing",
                    None,
                )
                .await;
            self.ctx.settle(Channel::Multimodal, run_id);
            return Ok(MultimodalRunSummary::default());
        }

        self.ctx
            .state
            .report(
                Channel::Multimodal,
                run_id,
                0,
                &format!("Multimodal indexing 0/{}", total),
            )
            .await;

        let settled = Arc::new(AtomicU32::new(0));
        let tasks: Vec<_> = candidates
            .into_iter()
            .map(|record| {
                let ctx = self.ctx.clone();
                let settled = settled.clone();
                async move {
                    let outcome = AssertUnwindSafe(index_one(&ctx, &record))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            tracing::error!(resource_id = %record.resource_id, "Multimodal task panicked");
                            ItemOutcome::Failed
                        });

                    let done = settled.fetch_add(1, Ordering::SeqCst) + 1;
                    ctx.state
                        .report(
                            Channel::Multimodal,
                            run_id,
                            round_percent(done, total),
                            &format!("Multimodal indexing {}/{}", done, total),
                        )
                        .await;
                    outcome
                }
            })
            .collect();

        let outcomes = self.limiter.run(tasks).await;

        let mut summary = MultimodalRunSummary {
            total,
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(ItemOutcome::Indexed) => summary.success += 1,
                Ok(ItemOutcome::Skipped) => summary.skip += 1,
                Ok(ItemOutcome::Failed) | Err(_) => summary.fail += 1,
            }
        }

        let (message, error) = if summary.fail == 0 {
            (
                format!(
                    "Multimodal indexing complete: {} indexed, {} skipped",
                    summary.success, summary.skip
                ),
                None,
            )
        } else {
            (
                format!(
                    "Multimodal indexing finished with {} failures ({} indexed, {} skipped)",
                    summary.fail, summary.success, summary.skip
                ),
                Some(format!("{} of {} items failed", summary.fail, total)),
            )
        };
        tracing::info!(
            run_id,
            success = summary.success,
            fail = summary.fail,
            skip = summary.skip,
            "Multimodal index finished"
        );

        self.ctx
            .state
            .finish(Channel::Multimodal, run_id, &message, error)
            .await;
        self.ctx.settle(Channel::Multimodal, run_id);

        Ok(summary)
    }
}

async fn index_one(ctx: &IndexContext, record: &ResourceIndexRecord) -> ItemOutcome {
    let Some(source_id) = record.resolvable_source_id() else {
        tracing::debug!(resource_id = %record.resource_id, "No source id, skipping multimodal index");
        return ItemOutcome::Skipped;
    };

    match ctx
        .service
        .index_item(&record.resource_type, source_id, IndexItemOptions::default())
        .await
    {
        Ok(result) => {
            tracing::debug!(
                source_id,
                pages = result.indexed_pages,
                failed_pages = result.failed_pages,
                "Multimodal item indexed"
            );
            ItemOutcome::Indexed
        }
        Err(e) => {
            tracing::warn!(source_id, error = %e, "Multimodal item failed");
            ItemOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::state::JobPhase;
    use crate::service::MemoryIndexService;
    use crate::test_support::record;
    use std::time::Duration;

    fn textbook(id: &str) -> ResourceIndexRecord {
        record(id, "textbook", IndexState::Pending)
    }

    #[test]
    fn test_candidate_selection() {
        let mut indexed = textbook("b");
        indexed.mm_index_state = IndexState::Indexed;
        let mut disabled = textbook("c");
        disabled.mm_index_state = IndexState::Disabled;
        let mut failed = textbook("d");
        failed.mm_index_state = IndexState::Failed;

        let records = vec![
            textbook("a"),
            indexed,
            disabled,
            failed,
            record("e", "note", IndexState::Pending),
        ];
        let ids: Vec<_> = multimodal_candidates(&records, &Settings::default())
            .into_iter()
            .map(|r| r.resource_id)
            .collect();
        assert_eq!(ids, vec!["a", "d"]);
    }

    #[test]
    fn test_round_percent() {
        assert_eq!(round_percent(0, 0), 100);
        assert_eq!(round_percent(1, 3), 33);
        assert_eq!(round_percent(2, 3), 67);
        assert_eq!(round_percent(3, 3), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_tally_and_bound() {
        let mut records: Vec<_> = (0..10).map(|i| textbook(&format!("t{}", i))).collect();
        records[3].source_id = None;
        records[7].source_id = Some("  ".to_string());

        let service = MemoryIndexService::new(records.clone())
            .with_item_delay(Duration::from_millis(100));
        service.fail_items(["t5"]).await;

        let (ctx, _updates) = IndexContext::new(Arc::new(service.clone()), Settings::default());
        let coordinator = MultimodalIndexCoordinator::new(ctx.clone());

        let summary = coordinator.trigger(records).await.unwrap();
        assert_eq!(summary.total, 10);
        assert_eq!(summary.skip, 2);
        assert_eq!(summary.fail, 1);
        assert_eq!(summary.success, 7);
        assert_eq!(summary.settled(), summary.total);
        assert!(service.peak_in_flight() <= 3);

        let job = ctx.state.job(Channel::Multimodal).await;
        assert_eq!(job.phase, JobPhase::Completed);
        assert_eq!(job.progress_percent, 100);
        assert!(job.error.is_some());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(ctx.state.job(Channel::Multimodal).await.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_candidates_settle_at_once() {
        let service = MemoryIndexService::new(Vec::new());
        let (ctx, _updates) = IndexContext::new(Arc::new(service), Settings::default());
        let coordinator = MultimodalIndexCoordinator::new(ctx.clone());

        let summary = coordinator.trigger(Vec::new()).await.unwrap();
        assert_eq!(summary, MultimodalRunSummary::default());

        let job = ctx.state.job(Channel::Multimodal).await;
        assert_eq!(job.phase, JobPhase::Completed);
        assert_eq!(job.progress_percent, 100);
    }
}
