//! One entry point for "index everything".

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use super::batch::BatchIndexCoordinator;
use super::context::{IndexContext, Refresh};
use super::multimodal::{multimodal_candidates, MultimodalIndexCoordinator, MultimodalRunSummary};
use super::state::{BatchOutcome, StateSnapshot, StateUpdate};
use crate::config::Settings;
use crate::error::{CoordResult, CoordinatorError, ResultExt};
use crate::events::{ProgressEventAdapter, Subscription};
use crate::models::{DimensionInfo, IndexDiagnostic, IndexState, SummaryFilter};
use crate::service::IndexService;

/// Administrative resets offered by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetKind {
    /// Every resource back to pending
    All,
    /// Disabled resources back to pending
    Disabled,
    /// Indexed resources that have no stored chunks back to pending
    NoEmbeddings,
}

/// What a unified run did in each phase.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedRunReport {
    /// Pending plus failed count handed to the batch trigger
    pub text_requested: u32,
    pub multimodal_candidates: u32,
    pub batch: Option<BatchOutcome>,
    pub batch_error: Option<CoordinatorError>,
    pub multimodal: Option<MultimodalRunSummary>,
    pub multimodal_error: Option<CoordinatorError>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnifiedRun {
    NothingToIndex,
    Finished(UnifiedRunReport),
}

/// Owns the context, both coordinators and the event subscription.
///
/// Lifecycle: [`start`](Self::start) subscribes and loads the first
/// snapshot; [`shutdown`](Self::shutdown) tears everything down. After
/// shutdown every deferred write is a no-op and every operation returns
/// [`CoordinatorError::ShutDown`].
pub struct UnifiedIndexOrchestrator {
    ctx: Arc<IndexContext>,
    batch: BatchIndexCoordinator,
    multimodal: MultimodalIndexCoordinator,
    run_lock: Mutex<()>,
    subscription: Mutex<Option<Subscription>>,
}

impl UnifiedIndexOrchestrator {
    pub fn new(
        service: Arc<dyn IndexService>,
        settings: Settings,
    ) -> (Self, mpsc::Receiver<StateUpdate>) {
        let (ctx, updates) = IndexContext::new(service, settings);
        let orchestrator = Self {
            batch: BatchIndexCoordinator::new(ctx.clone()),
            multimodal: MultimodalIndexCoordinator::new(ctx.clone()),
            ctx,
            run_lock: Mutex::new(()),
            subscription: Mutex::new(None),
        };
        (orchestrator, updates)
    }

    pub fn context(&self) -> &Arc<IndexContext> {
        &self.ctx
    }

    pub fn batch(&self) -> &BatchIndexCoordinator {
        &self.batch
    }

    pub fn multimodal(&self) -> &MultimodalIndexCoordinator {
        &self.multimodal
    }

    /// Subscribe to progress events and load the first snapshot.
    ///
    /// A failed first fetch is left in the state as the fetch error; it
    /// does not fail `start`.
    pub async fn start(&self) -> CoordResult<()> {
        self.ctx.ensure_alive()?;

        {
            let mut subscription = self.subscription.lock().await;
            if !subscription.as_ref().is_some_and(Subscription::is_active) {
                *subscription = Some(ProgressEventAdapter::subscribe(self.ctx.clone()).await?);
            }
        }

        if let Err(e) = self.ctx.refresh().await {
            tracing::warn!(error = %e, "Initial index summary unavailable");
        }
        Ok(())
    }

    /// Tear down: no state write happens after this returns.
    pub async fn shutdown(&self) {
        if !self.ctx.teardown() {
            return;
        }
        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.close().await;
        }
        tracing::info!("Index orchestrator shut down");
    }

    pub async fn refresh(&self) -> CoordResult<Refresh> {
        self.ctx.ensure_alive()?;
        self.ctx.refresh().await
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.ctx.state.snapshot().await
    }

    /// Text batch first, then the multimodal fan-out.
    ///
    /// Refused while any job is in progress or still showing its result.
    /// A failed batch trigger is recorded in the report and the multimodal
    /// phase still runs.
    pub async fn run_all(&self) -> CoordResult<UnifiedRun> {
        let _run = self
            .run_lock
            .try_lock()
            .map_err(|_| CoordinatorError::busy())?;
        self.ctx.ensure_alive()?;
        if !self.ctx.state.is_idle().await {
            return Err(CoordinatorError::busy());
        }
        self.ctx.ensure_settleable()?;

        let summary = match self.ctx.state.summary().await {
            Some(summary) => summary,
            None => {
                self.ctx.refresh().await?;
                self.ctx
                    .state
                    .summary()
                    .await
                    .ok_or_else(|| CoordinatorError::fetch("No index summary available"))?
            }
        };

        let text_requested = summary.text_candidate_count();
        let candidates = multimodal_candidates(&summary.resources, &self.ctx.settings);
        if text_requested == 0 && candidates.is_empty() {
            tracing::info!("Nothing to index");
            return Ok(UnifiedRun::NothingToIndex);
        }

        let mut report = UnifiedRunReport {
            text_requested,
            multimodal_candidates: candidates.len() as u32,
            ..Default::default()
        };
        tracing::info!(
            text = text_requested,
            multimodal = report.multimodal_candidates,
            "Unified index run started"
        );

        if text_requested > 0 {
            match self.batch.trigger(text_requested).await {
                Ok(ticket) => report.batch = Some(ticket.wait().await),
                Err(e) => {
                    tracing::warn!(error = %e, "Batch phase failed, continuing with multimodal");
                    report.batch_error = Some(e);
                }
            }
        }

        if !candidates.is_empty() {
            self.ctx.ensure_alive()?;
            match self.multimodal.trigger(candidates).await {
                Ok(summary) => report.multimodal = Some(summary),
                Err(e) => {
                    tracing::warn!(error = %e, "Multimodal phase failed");
                    report.multimodal_error = Some(e);
                }
            }
        }

        Ok(UnifiedRun::Finished(report))
    }

    pub async fn dimensions(&self) -> CoordResult<Vec<DimensionInfo>> {
        self.ctx.ensure_alive()?;
        self.ctx.service.list_dimensions().await.service_err()
    }

    pub async fn diagnostic(&self) -> CoordResult<IndexDiagnostic> {
        self.ctx.ensure_alive()?;
        self.ctx.service.get_diagnostic().await.service_err()
    }

    /// Run an administrative reset, then refresh.
    pub async fn reset(&self, kind: ResetKind) -> CoordResult<u32> {
        self.ensure_quiet().await?;
        let service = &self.ctx.service;
        let affected = match kind {
            ResetKind::All => service.reset_all().await,
            ResetKind::Disabled => service.reset_disabled_to_pending().await,
            ResetKind::NoEmbeddings => service.reset_indexed_without_embeddings().await,
        }
        .service_err()?;

        tracing::info!(?kind, affected, "Index state reset");
        self.refresh_after("reset").await;
        Ok(affected)
    }

    pub async fn set_disabled(&self, resource_id: &str, disabled: bool) -> CoordResult<IndexState> {
        self.ensure_quiet().await?;
        let state = self
            .ctx
            .service
            .set_disabled(resource_id, disabled)
            .await
            .service_err()?;
        self.refresh_after("toggle").await;
        Ok(state)
    }

    /// Flip a resource between disabled and pending.
    ///
    /// The current state is read from the service: the cached snapshot is
    /// capped at `summary_limit` and may not hold the record.
    pub async fn toggle_disabled(&self, resource_id: &str) -> CoordResult<IndexState> {
        let disabled = self.is_disabled(resource_id).await?;
        self.set_disabled(resource_id, !disabled).await
    }

    async fn is_disabled(&self, resource_id: &str) -> CoordResult<bool> {
        self.ctx.ensure_alive()?;
        let mut filter = SummaryFilter {
            state_filter: Some(IndexState::Disabled),
            limit: 1,
            ..Default::default()
        };
        // Counts ignore the state filter, so the first page sizes the second
        let first = self.ctx.service.get_summary(filter.clone()).await.fetch_err()?;
        if first.find(resource_id).is_some() {
            return Ok(true);
        }
        if first.disabled_count <= 1 {
            return Ok(false);
        }

        filter.limit = first.disabled_count;
        let all = self.ctx.service.get_summary(filter).await.fetch_err()?;
        Ok(all.find(resource_id).is_some())
    }

    /// Re-index one resource's text right away.
    pub async fn reindex(&self, resource_id: &str) -> CoordResult<u32> {
        self.ensure_quiet().await?;
        let chunks = self
            .ctx
            .service
            .reindex(resource_id)
            .await
            .trigger_err()?;
        self.refresh_after("reindex").await;
        Ok(chunks)
    }

    async fn ensure_quiet(&self) -> CoordResult<()> {
        self.ctx.ensure_alive()?;
        let snapshot = self.ctx.state.snapshot().await;
        if snapshot.batch.is_active() || snapshot.multimodal.is_active() {
            return Err(CoordinatorError::busy());
        }
        Ok(())
    }

    async fn refresh_after(&self, action: &str) {
        if let Err(e) = self.ctx.refresh().await {
            tracing::warn!(action, error = %e, "Refresh after action failed");
        }
    }
}
