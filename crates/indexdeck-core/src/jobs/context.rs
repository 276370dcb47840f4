//! Shared context for the coordinators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use super::state::{CoordinatorState, StateUpdate};
use crate::config::Settings;
use crate::error::{CoordResult, CoordinatorError};
use crate::events::{Channel, ChannelEvent};
use crate::guards::{DeferredTask, LifecycleGuard, RequestVersionGuard};
use crate::models::SummaryFilter;
use crate::reconcile::reconcile;
use crate::service::IndexService;

/// Result of a snapshot refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    Applied,
    /// A newer fetch started, or the context was torn down
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Timer {
    Refresh,
    Reset,
    Watchdog,
}

/// Everything the coordinators share.
pub struct IndexContext {
    pub(crate) service: Arc<dyn IndexService>,
    pub(crate) state: CoordinatorState,
    pub(crate) versions: RequestVersionGuard,
    pub(crate) lifecycle: LifecycleGuard,
    pub(crate) settings: Settings,
    timers: Mutex<HashMap<(Channel, Timer), DeferredTask>>,
    listeners: Arc<AtomicUsize>,
}

/// Held by a running event loop. The context counts as listening while
/// at least one guard is alive.
pub(crate) struct ListenerGuard(Arc<AtomicUsize>);

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl IndexContext {
    pub fn new(
        service: Arc<dyn IndexService>,
        settings: Settings,
    ) -> (Arc<Self>, mpsc::Receiver<StateUpdate>) {
        let lifecycle = LifecycleGuard::new();
        let (state, updates) = CoordinatorState::new(lifecycle.clone());
        let ctx = Arc::new(Self {
            service,
            state,
            versions: RequestVersionGuard::new(),
            lifecycle,
            settings,
            timers: Mutex::new(HashMap::new()),
            listeners: Arc::new(AtomicUsize::new(0)),
        });
        (ctx, updates)
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_alive(&self) -> bool {
        self.lifecycle.is_alive()
    }

    /// True while a progress subscription is delivering events.
    pub fn is_listening(&self) -> bool {
        self.listeners.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn listen(&self) -> ListenerGuard {
        self.listeners.fetch_add(1, Ordering::SeqCst);
        ListenerGuard(self.listeners.clone())
    }

    /// A batch run ends on its terminal event or on the watchdog. Refuse
    /// to start one when neither can happen.
    pub(crate) fn ensure_settleable(&self) -> CoordResult<()> {
        if self.is_listening() || self.settings.watchdog_timeout().is_some() {
            Ok(())
        } else {
            Err(CoordinatorError::not_started())
        }
    }

    pub(crate) fn ensure_alive(&self) -> CoordResult<()> {
        if self.lifecycle.is_alive() {
            Ok(())
        } else {
            Err(CoordinatorError::shut_down())
        }
    }

    /// Fetch a fresh snapshot.
    ///
    /// Only the most recently started fetch is applied. A failure of that
    /// fetch is recorded as the fetch error and returned; failures of
    /// overtaken fetches are dropped.
    pub async fn refresh(&self) -> CoordResult<Refresh> {
        let token = self.versions.begin();
        let filter = SummaryFilter::with_limit(self.settings.summary_limit);

        match self.service.get_summary(filter).await {
            Ok(summary) => {
                let view = reconcile(&summary);
                for (resource_id, raw) in &view.unrecognized {
                    tracing::warn!(
                        resource_id = %resource_id,
                        state = %raw,
                        "Unrecognized index state, treating as pending"
                    );
                }
                if !summary.is_consistent() {
                    tracing::warn!(
                        total = summary.total_resources,
                        mm_total = summary.mm_total_resources,
                        "Summary counts do not add up to totals"
                    );
                }

                if self
                    .state
                    .apply_summary(&self.versions, token, summary, view)
                    .await
                {
                    Ok(Refresh::Applied)
                } else {
                    tracing::debug!(token = token.value(), "Discarding stale summary");
                    Ok(Refresh::Discarded)
                }
            }
            Err(e) => {
                let message = e.to_string();
                if self
                    .state
                    .apply_fetch_error(&self.versions, token, &message)
                    .await
                {
                    tracing::warn!(error = %message, "Failed to fetch index summary");
                    Err(CoordinatorError::fetch(message))
                } else {
                    tracing::debug!(token = token.value(), "Discarding stale fetch error");
                    Ok(Refresh::Discarded)
                }
            }
        }
    }

    /// Feed one normalized event into the state.
    pub(crate) async fn on_event(self: &Arc<Self>, event: ChannelEvent) {
        let ChannelEvent { channel, event } = event;
        let applied = self.state.apply(channel, &event).await;

        if let Some(run_id) = applied.started {
            self.arm_watchdog(channel, run_id);
        }
        if let Some(run_id) = applied.terminal {
            tracing::info!(
                channel = %channel,
                run_id,
                message = %event.message(),
                "Indexing job finished"
            );
            self.settle(channel, run_id);
        }
    }

    /// After a run ends: refresh now, return to idle after the reset delay.
    pub(crate) fn settle(self: &Arc<Self>, channel: Channel, run_id: u64) {
        self.cancel_timer(channel, Timer::Watchdog);

        let ctx = self.clone();
        let refresh = self.lifecycle.defer(Duration::ZERO, move || async move {
            if let Err(e) = ctx.refresh().await {
                tracing::warn!(channel = %channel, error = %e, "Refresh after job failed");
            }
        });
        self.replace_timer(channel, Timer::Refresh, refresh);

        let ctx = self.clone();
        let reset = self
            .lifecycle
            .defer(self.settings.reset_delay(), move || async move {
                if ctx.state.reset_if_current(channel, run_id).await {
                    tracing::debug!(channel = %channel, run_id, "Job state reset to idle");
                }
            });
        self.replace_timer(channel, Timer::Reset, reset);
    }

    /// Settle `run_id` as timed out if no terminal event arrives in time.
    /// No-op unless a watchdog timeout is configured.
    pub(crate) fn arm_watchdog(self: &Arc<Self>, channel: Channel, run_id: u64) {
        let Some(timeout) = self.settings.watchdog_timeout() else {
            return;
        };

        let ctx = self.clone();
        let watchdog = self.lifecycle.defer(timeout, move || async move {
            if ctx.state.time_out(channel, run_id).await {
                tracing::warn!(
                    channel = %channel,
                    run_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "No terminal event received, job timed out"
                );
                ctx.settle(channel, run_id);
            }
        });
        self.replace_timer(channel, Timer::Watchdog, watchdog);
    }

    fn replace_timer(&self, channel: Channel, timer: Timer, task: DeferredTask) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = timers.insert((channel, timer), task) {
            previous.cancel();
        }
    }

    fn cancel_timer(&self, channel: Channel, timer: Timer) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = timers.remove(&(channel, timer)) {
            task.cancel();
        }
    }

    /// Flip the liveness flag, cancel timers and invalidate in-flight
    /// fetches. Returns false if already torn down.
    pub(crate) fn teardown(&self) -> bool {
        let was_alive = self.lifecycle.teardown();
        self.versions.begin();

        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, task) in timers.drain() {
            task.cancel();
        }
        was_alive
    }
}
