//! Shared coordinator state: latest snapshot plus one job state per channel.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, RwLock};

use crate::error::{CoordResult, CoordinatorError};
use crate::events::{Channel, ProgressEvent};
use crate::guards::{LifecycleGuard, RequestToken, RequestVersionGuard};
use crate::models::IndexStatusSummary;
use crate::reconcile::ReconciledView;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    #[default]
    Idle,
    Preparing,
    Running,
    Completed,
}

/// Progress of the job on one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub phase: JobPhase,
    pub progress_percent: u8,
    pub message: String,
    /// Failure message of a finished run
    pub error: Option<String>,
    /// Generation of the run this state belongs to
    pub run_id: u64,
}

impl JobState {
    fn fresh(run_id: u64, phase: JobPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            progress_percent: 0,
            message: message.into(),
            error: None,
            run_id,
        }
    }

    /// Preparing or running.
    pub fn is_active(&self) -> bool {
        matches!(self.phase, JobPhase::Preparing | JobPhase::Running)
    }

    pub fn is_idle(&self) -> bool {
        self.phase == JobPhase::Idle
    }

    /// Percent never goes backwards within a run.
    fn advance(&mut self, percent: u8, message: &str) {
        self.progress_percent = self.progress_percent.max(percent.min(100));
        if !message.is_empty() {
            self.message = message.to_string();
        }
    }

    fn finish(&mut self, message: impl Into<String>, error: Option<String>) {
        self.phase = JobPhase::Completed;
        self.progress_percent = 100;
        self.message = message.into();
        self.error = error;
    }
}

/// How a batch run ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub run_id: u64,
    pub success_count: u32,
    pub fail_count: u32,
    pub error: Option<String>,
    pub timed_out: bool,
}

/// Notification sent to listeners after every state change.
#[derive(Debug, Clone)]
pub enum StateUpdate {
    Job { channel: Channel, state: JobState },
    Summary(Arc<IndexStatusSummary>),
    FetchFailed(String),
}

/// Read-only copy of everything the state holds.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub summary: Option<Arc<IndexStatusSummary>>,
    pub view: Option<Arc<ReconciledView>>,
    pub fetch_error: Option<String>,
    pub batch: JobState,
    pub multimodal: JobState,
}

/// What [`CoordinatorState::apply`] did with an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    /// The event opened a run nobody triggered here
    pub started: Option<u64>,
    /// The event ended this run
    pub terminal: Option<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    summary: Option<Arc<IndexStatusSummary>>,
    view: Option<Arc<ReconciledView>>,
    fetch_error: Option<String>,
    batch: JobState,
    multimodal: JobState,
    next_run_id: u64,
    /// A fan-out run owns the multimodal channel; its events are cosmetic
    fan_out: bool,
    /// Items of the last fan-out. Their late events stay cosmetic until the
    /// channel is back to idle.
    fan_out_items: HashSet<String>,
    /// (completed, failed) items seen on the batch channel this run
    batch_items: (u32, u32),
}

impl Inner {
    fn job(&self, channel: Channel) -> &JobState {
        match channel {
            Channel::Batch => &self.batch,
            Channel::Multimodal => &self.multimodal,
        }
    }

    fn job_mut(&mut self, channel: Channel) -> &mut JobState {
        match channel {
            Channel::Batch => &mut self.batch,
            Channel::Multimodal => &mut self.multimodal,
        }
    }

    fn next_run(&mut self) -> u64 {
        self.next_run_id += 1;
        self.next_run_id
    }
}

/// Shared state behind one lock.
///
/// Every write checks the lifecycle flag while holding the lock, so nothing
/// lands after teardown.
#[derive(Clone)]
pub struct CoordinatorState {
    inner: Arc<RwLock<Inner>>,
    lifecycle: LifecycleGuard,
    /// Channel to notify listeners of state changes
    notify_tx: mpsc::Sender<StateUpdate>,
    batch_settled: Arc<watch::Sender<Option<BatchOutcome>>>,
}

impl CoordinatorState {
    pub fn new(lifecycle: LifecycleGuard) -> (Self, mpsc::Receiver<StateUpdate>) {
        let (notify_tx, notify_rx) = mpsc::channel(256);
        let (batch_settled, _) = watch::channel(None);
        (
            Self {
                inner: Arc::new(RwLock::new(Inner::default())),
                lifecycle,
                notify_tx,
                batch_settled: Arc::new(batch_settled),
            },
            notify_rx,
        )
    }

    fn notify_job(&self, inner: &Inner, channel: Channel) {
        let _ = self.notify_tx.try_send(StateUpdate::Job {
            channel,
            state: inner.job(channel).clone(),
        });
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.read().await;
        StateSnapshot {
            summary: inner.summary.clone(),
            view: inner.view.clone(),
            fetch_error: inner.fetch_error.clone(),
            batch: inner.batch.clone(),
            multimodal: inner.multimodal.clone(),
        }
    }

    pub async fn job(&self, channel: Channel) -> JobState {
        self.inner.read().await.job(channel).clone()
    }

    pub async fn summary(&self) -> Option<Arc<IndexStatusSummary>> {
        self.inner.read().await.summary.clone()
    }

    pub async fn view(&self) -> Option<Arc<ReconciledView>> {
        self.inner.read().await.view.clone()
    }

    pub async fn fetch_error(&self) -> Option<String> {
        self.inner.read().await.fetch_error.clone()
    }

    /// Both channels idle.
    pub async fn is_idle(&self) -> bool {
        let inner = self.inner.read().await;
        inner.batch.is_idle() && inner.multimodal.is_idle()
    }

    /// Display label for an item id from the last snapshot.
    pub async fn label_for(&self, id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .summary
            .as_ref()
            .and_then(|s| s.find(id))
            .map(|r| r.label().to_string())
    }

    pub fn watch_batch(&self) -> watch::Receiver<Option<BatchOutcome>> {
        self.batch_settled.subscribe()
    }

    /// Admit a new run on `channel`.
    ///
    /// Refused while either channel is preparing or running. The check and
    /// the transition happen under one write lock.
    pub async fn try_begin(&self, channel: Channel, message: &str) -> CoordResult<u64> {
        let mut inner = self.inner.write().await;
        if !self.lifecycle.is_alive() {
            return Err(CoordinatorError::shut_down());
        }
        if inner.batch.is_active() || inner.multimodal.is_active() {
            return Err(CoordinatorError::busy());
        }

        let run_id = inner.next_run();
        *inner.job_mut(channel) = JobState::fresh(run_id, JobPhase::Preparing, message);
        match channel {
            Channel::Batch => inner.batch_items = (0, 0),
            Channel::Multimodal => inner.fan_out = true,
        }
        self.notify_job(&inner, channel);
        Ok(run_id)
    }

    /// Drop a run whose trigger call failed. Straight back to idle.
    pub async fn abort(&self, channel: Channel, run_id: u64) {
        let mut inner = self.inner.write().await;
        if !self.lifecycle.is_alive() || inner.job(channel).run_id != run_id {
            return;
        }
        *inner.job_mut(channel) = JobState {
            run_id,
            ..Default::default()
        };
        if channel == Channel::Multimodal {
            inner.fan_out = false;
        }
        self.notify_job(&inner, channel);
    }

    /// Progress reported by the code driving a run (not by events).
    pub async fn report(&self, channel: Channel, run_id: u64, percent: u8, message: &str) {
        let mut inner = self.inner.write().await;
        if !self.lifecycle.is_alive() {
            return;
        }
        let job = inner.job_mut(channel);
        if job.run_id != run_id || !job.is_active() {
            return;
        }
        job.phase = JobPhase::Running;
        job.advance(percent, message);
        self.notify_job(&inner, channel);
    }

    /// End a run. Returns false if the run is no longer the active one.
    pub async fn finish(
        &self,
        channel: Channel,
        run_id: u64,
        message: &str,
        error: Option<String>,
    ) -> bool {
        let mut inner = self.inner.write().await;
        if !self.lifecycle.is_alive() {
            return false;
        }
        let job = inner.job_mut(channel);
        if job.run_id != run_id || !job.is_active() {
            return false;
        }
        job.finish(message, error);
        if channel == Channel::Multimodal {
            inner.fan_out = false;
        }
        self.notify_job(&inner, channel);
        true
    }

    /// Register the item ids a fan-out run is about to index.
    pub async fn own_items(&self, run_id: u64, items: Vec<String>) {
        let mut inner = self.inner.write().await;
        if inner.multimodal.run_id == run_id && inner.fan_out {
            inner.fan_out_items = items.into_iter().collect();
        }
    }

    /// Publish the outcome of a batch run to waiting tickets.
    pub fn publish_batch(&self, outcome: BatchOutcome) {
        self.batch_settled.send_replace(Some(outcome));
    }

    /// Settle a run that never sent a terminal event.
    pub async fn time_out(&self, channel: Channel, run_id: u64) -> bool {
        let message = "No progress received in time, marking job as finished";
        let applied = self
            .finish(channel, run_id, message, Some("timed out".to_string()))
            .await;
        if applied && channel == Channel::Batch {
            let (success_count, fail_count) = self.inner.read().await.batch_items;
            self.publish_batch(BatchOutcome {
                run_id,
                success_count,
                fail_count,
                error: Some("timed out".to_string()),
                timed_out: true,
            });
        }
        applied
    }

    /// Fold a progress event into the job state of its channel.
    pub async fn apply(&self, channel: Channel, event: &ProgressEvent) -> Applied {
        let mut inner = self.inner.write().await;
        if !self.lifecycle.is_alive() {
            return Applied::default();
        }

        let applied = match channel {
            Channel::Batch => self.apply_batch(&mut inner, event),
            Channel::Multimodal => self.apply_multimodal(&mut inner, event),
        };
        self.notify_job(&inner, channel);
        applied
    }

    fn apply_batch(&self, inner: &mut Inner, event: &ProgressEvent) -> Applied {
        let mut applied = Applied::default();

        if !inner.batch.is_active() {
            match event {
                ProgressEvent::Started { .. } => {
                    let run_id = inner.next_run();
                    inner.batch = JobState::fresh(run_id, JobPhase::Running, "");
                    inner.batch_items = (0, 0);
                    applied.started = Some(run_id);
                    tracing::debug!(run_id, "Batch run started outside this coordinator");
                }
                _ => {
                    tracing::debug!(?event, "Ignoring batch event with no active run");
                    return applied;
                }
            }
        }

        let run_id = inner.batch.run_id;
        inner.batch.phase = JobPhase::Running;
        inner.batch.advance(event.percent(), event.message());

        match event {
            ProgressEvent::ItemCompleted { .. } => inner.batch_items.0 += 1,
            ProgressEvent::ItemFailed { item, error, .. } => {
                inner.batch_items.1 += 1;
                tracing::warn!(resource_id = %item, error = %error, "Resource failed to index");
            }
            ProgressEvent::BatchCompleted {
                message,
                success_count,
                fail_count,
                ..
            } => {
                inner.batch.finish(message.clone(), None);
                self.publish_batch(BatchOutcome {
                    run_id,
                    success_count: *success_count,
                    fail_count: *fail_count,
                    error: None,
                    timed_out: false,
                });
                applied.terminal = Some(run_id);
            }
            ProgressEvent::BatchFailed { message, error, .. } => {
                inner.batch.finish(message.clone(), Some(error.clone()));
                let (success_count, fail_count) = inner.batch_items;
                self.publish_batch(BatchOutcome {
                    run_id,
                    success_count,
                    fail_count,
                    error: Some(error.clone()),
                    timed_out: false,
                });
                applied.terminal = Some(run_id);
            }
            _ => {}
        }

        applied
    }

    fn apply_multimodal(&self, inner: &mut Inner, event: &ProgressEvent) -> Applied {
        let mut applied = Applied::default();

        let owned = event
            .item()
            .is_some_and(|item| inner.fan_out_items.contains(item));
        if inner.fan_out || owned {
            // The fan-out drives percent and settlement itself
            if inner.multimodal.is_active() && !event.message().is_empty() {
                inner.multimodal.message = event.message().to_string();
            }
            return applied;
        }

        if !inner.multimodal.is_active() {
            let run_id = inner.next_run();
            inner.multimodal = JobState::fresh(run_id, JobPhase::Running, "");
            applied.started = Some(run_id);
        }

        let run_id = inner.multimodal.run_id;
        inner.multimodal.phase = JobPhase::Running;
        inner.multimodal.advance(event.percent(), event.message());

        match event {
            ProgressEvent::ItemCompleted { message, .. } => {
                inner.multimodal.finish(message.clone(), None);
                applied.terminal = Some(run_id);
            }
            ProgressEvent::ItemFailed { message, error, .. } => {
                inner.multimodal.finish(message.clone(), Some(error.clone()));
                applied.terminal = Some(run_id);
            }
            _ => {}
        }

        applied
    }

    /// Return a finished run to idle, unless a newer run took over.
    pub async fn reset_if_current(&self, channel: Channel, run_id: u64) -> bool {
        let mut inner = self.inner.write().await;
        if !self.lifecycle.is_alive() {
            return false;
        }
        let job = inner.job(channel);
        if job.run_id != run_id || job.phase != JobPhase::Completed {
            return false;
        }
        *inner.job_mut(channel) = JobState {
            run_id,
            ..Default::default()
        };
        if channel == Channel::Multimodal {
            inner.fan_out_items.clear();
        }
        self.notify_job(&inner, channel);
        true
    }

    /// Store a fetched snapshot if its token is still the latest.
    pub async fn apply_summary(
        &self,
        versions: &RequestVersionGuard,
        token: RequestToken,
        summary: IndexStatusSummary,
        view: ReconciledView,
    ) -> bool {
        let mut inner = self.inner.write().await;
        if !self.lifecycle.is_alive() || !versions.is_current(token) {
            return false;
        }
        let summary = Arc::new(summary);
        inner.summary = Some(summary.clone());
        inner.view = Some(Arc::new(view));
        inner.fetch_error = None;
        let _ = self.notify_tx.try_send(StateUpdate::Summary(summary));
        true
    }

    /// Record a fetch failure if its token is still the latest.
    pub async fn apply_fetch_error(
        &self,
        versions: &RequestVersionGuard,
        token: RequestToken,
        error: &str,
    ) -> bool {
        let mut inner = self.inner.write().await;
        if !self.lifecycle.is_alive() || !versions.is_current(token) {
            return false;
        }
        inner.fetch_error = Some(error.to_string());
        let _ = self
            .notify_tx
            .try_send(StateUpdate::FetchFailed(error.to_string()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (CoordinatorState, LifecycleGuard) {
        let lifecycle = LifecycleGuard::new();
        let (state, _rx) = CoordinatorState::new(lifecycle.clone());
        (state, lifecycle)
    }

    fn progress(percent: u8) -> ProgressEvent {
        ProgressEvent::ItemProgress {
            item: "res_1".to_string(),
            percent,
            message: format!("at {}", percent),
        }
    }

    #[tokio::test]
    async fn test_try_begin_is_exclusive() {
        let (state, _) = state();

        let run = state.try_begin(Channel::Batch, "Preparing").await.unwrap();
        assert_eq!(state.job(Channel::Batch).await.phase, JobPhase::Preparing);

        let err = state.try_begin(Channel::Multimodal, "x").await.unwrap_err();
        assert!(err.is_busy());
        let err = state.try_begin(Channel::Batch, "x").await.unwrap_err();
        assert!(err.is_busy());

        state.abort(Channel::Batch, run).await;
        assert!(state.job(Channel::Batch).await.is_idle());
        assert!(state.try_begin(Channel::Multimodal, "x").await.is_ok());
    }

    #[tokio::test]
    async fn test_percent_clamped_to_max_seen() {
        let (state, _) = state();
        let run = state.try_begin(Channel::Batch, "Preparing").await.unwrap();

        state.apply(Channel::Batch, &progress(40)).await;
        state.apply(Channel::Batch, &progress(20)).await;
        let job = state.job(Channel::Batch).await;
        assert_eq!(job.phase, JobPhase::Running);
        assert_eq!(job.progress_percent, 40);
        assert_eq!(job.message, "at 20");
        assert_eq!(job.run_id, run);
    }

    #[tokio::test]
    async fn test_batch_terminal_publishes_outcome() {
        let (state, _) = state();
        let mut settled = state.watch_batch();
        let run = state.try_begin(Channel::Batch, "Preparing").await.unwrap();

        let applied = state
            .apply(
                Channel::Batch,
                &ProgressEvent::BatchCompleted {
                    percent: 100,
                    message: "done".to_string(),
                    success_count: 6,
                    fail_count: 1,
                },
            )
            .await;
        assert_eq!(applied.terminal, Some(run));

        settled.changed().await.unwrap();
        let outcome = settled.borrow().clone().unwrap();
        assert_eq!(outcome.run_id, run);
        assert_eq!((outcome.success_count, outcome.fail_count), (6, 1));

        let job = state.job(Channel::Batch).await;
        assert_eq!(job.phase, JobPhase::Completed);
        assert_eq!(job.progress_percent, 100);

        assert!(state.reset_if_current(Channel::Batch, run).await);
        assert!(state.job(Channel::Batch).await.is_idle());
    }

    #[tokio::test]
    async fn test_stray_batch_events_ignored_when_idle() {
        let (state, _) = state();
        let applied = state.apply(Channel::Batch, &progress(50)).await;
        assert_eq!(applied, Applied::default());
        assert!(state.job(Channel::Batch).await.is_idle());

        let applied = state
            .apply(
                Channel::Batch,
                &ProgressEvent::Started {
                    percent: 0,
                    message: "Indexing 3 resources".to_string(),
                },
            )
            .await;
        assert!(applied.started.is_some());
        assert!(state.job(Channel::Batch).await.is_active());
    }

    #[tokio::test]
    async fn test_fan_out_owns_multimodal_channel() {
        let (state, _) = state();
        let run = state.try_begin(Channel::Multimodal, "Preparing").await.unwrap();

        let applied = state
            .apply(
                Channel::Multimodal,
                &ProgressEvent::ItemCompleted {
                    item: "textbook_1".to_string(),
                    percent: 100,
                    message: "Algebra: done".to_string(),
                },
            )
            .await;
        assert_eq!(applied.terminal, None);
        let job = state.job(Channel::Multimodal).await;
        assert!(job.is_active());
        assert_eq!(job.progress_percent, 0);
        assert_eq!(job.message, "Algebra: done");

        assert!(state.finish(Channel::Multimodal, run, "all done", None).await);
        // Without a fan-out, a single-item terminal ends an implicit run
        let applied = state
            .apply(
                Channel::Multimodal,
                &ProgressEvent::ItemFailed {
                    item: "exam_1".to_string(),
                    percent: 100,
                    message: "exam_1: failed".to_string(),
                    error: "boom".to_string(),
                },
            )
            .await;
        assert!(applied.started.is_some());
        assert_eq!(applied.terminal, applied.started);
        assert_eq!(
            state.job(Channel::Multimodal).await.error.as_deref(),
            Some("boom")
        );
    }

    #[tokio::test]
    async fn test_late_fan_out_events_stay_cosmetic() {
        let (state, _) = state();
        let run = state.try_begin(Channel::Multimodal, "Preparing").await.unwrap();
        state.own_items(run, vec!["textbook_1".to_string()]).await;
        state.finish(Channel::Multimodal, run, "all done", None).await;

        let applied = state
            .apply(
                Channel::Multimodal,
                &ProgressEvent::ItemCompleted {
                    item: "textbook_1".to_string(),
                    percent: 100,
                    message: "late".to_string(),
                },
            )
            .await;
        assert_eq!(applied, Applied::default());
        let job = state.job(Channel::Multimodal).await;
        assert_eq!(job.run_id, run);
        assert_eq!(job.message, "all done");

        // Back at idle the items are released
        assert!(state.reset_if_current(Channel::Multimodal, run).await);
        let applied = state
            .apply(Channel::Multimodal, &progress(10))
            .await;
        assert!(applied.started.is_some());
    }

    #[tokio::test]
    async fn test_stale_reset_is_ignored() {
        let (state, _) = state();
        let first = state.try_begin(Channel::Batch, "a").await.unwrap();
        state.finish(Channel::Batch, first, "done", None).await;

        let second = state.try_begin(Channel::Batch, "b").await.unwrap();
        assert!(!state.reset_if_current(Channel::Batch, first).await);
        assert_eq!(state.job(Channel::Batch).await.run_id, second);
        assert!(state.job(Channel::Batch).await.is_active());
    }

    #[tokio::test]
    async fn test_stale_summary_discarded() {
        let (state, _) = state();
        let versions = RequestVersionGuard::new();

        let old = versions.begin();
        let new = versions.begin();

        let fresh = IndexStatusSummary {
            total_resources: 2,
            pending_count: 2,
            ..Default::default()
        };
        let stale = IndexStatusSummary {
            total_resources: 9,
            pending_count: 9,
            ..Default::default()
        };

        assert!(
            state
                .apply_summary(&versions, new, fresh.clone(), ReconciledView::default())
                .await
        );
        assert!(
            !state
                .apply_summary(&versions, old, stale, ReconciledView::default())
                .await
        );
        assert!(!state.apply_fetch_error(&versions, old, "late failure").await);

        assert_eq!(state.summary().await.as_deref(), Some(&fresh));
        assert!(state.fetch_error().await.is_none());
    }

    #[tokio::test]
    async fn test_no_writes_after_teardown() {
        let (state, lifecycle) = state();
        let run = state.try_begin(Channel::Batch, "a").await.unwrap();
        lifecycle.teardown();

        state.apply(Channel::Batch, &progress(80)).await;
        assert!(!state.finish(Channel::Batch, run, "done", None).await);
        assert_eq!(state.job(Channel::Batch).await.progress_percent, 0);

        let err = state.try_begin(Channel::Multimodal, "x").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ShutDown { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_serializes_with_summary() {
        let (state, _) = state();
        let versions = RequestVersionGuard::new();
        let token = versions.begin();

        let summary = IndexStatusSummary {
            total_resources: 3,
            indexed_count: 1,
            pending_count: 2,
            ..Default::default()
        };
        let view = crate::reconcile::reconcile(&summary);
        assert!(state.apply_summary(&versions, token, summary, view).await);

        let json = serde_json::to_value(state.snapshot().await).unwrap();
        assert_eq!(json["summary"]["totalResources"], 3);
        assert_eq!(json["view"]["ratios"]["text"], 1.0 / 3.0);
        assert_eq!(json["batch"]["phase"], "idle");
        assert!(json["fetchError"].is_null());
    }
}
