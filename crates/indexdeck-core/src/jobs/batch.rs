//! Text batch indexing: one trigger call, completion reported by events.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::context::IndexContext;
use super::state::BatchOutcome;
use crate::error::{CoordResult, CoordinatorError};
use crate::events::Channel;

/// Handle to an accepted batch run.
#[derive(Debug)]
pub struct BatchTicket {
    pub run_id: u64,
    pub batch_id: String,
    /// Resources the service claimed
    pub total: u32,
    settled: watch::Receiver<Option<BatchOutcome>>,
    cancel: CancellationToken,
}

impl BatchTicket {
    /// Wait for the run's terminal event (or its watchdog).
    ///
    /// Resolves with an error outcome if the coordinator shuts down first.
    pub async fn wait(mut self) -> BatchOutcome {
        loop {
            let latest = self.settled.borrow_and_update().clone();
            if let Some(outcome) = latest {
                if outcome.run_id == self.run_id {
                    return outcome;
                }
                if outcome.run_id > self.run_id {
                    return self.unresolved("batch run was superseded");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return self.unresolved("coordinator shut down");
                }
                changed = self.settled.changed() => {
                    if changed.is_err() {
                        return self.unresolved("coordinator shut down");
                    }
                }
            }
        }
    }

    fn unresolved(&self, reason: &str) -> BatchOutcome {
        BatchOutcome {
            run_id: self.run_id,
            error: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

/// Triggers text batch runs.
///
/// `trigger` returns once the service has claimed the work. The run then
/// lives on the batch channel until `batch_completed` or `batch_failed`.
pub struct BatchIndexCoordinator {
    ctx: Arc<IndexContext>,
}

impl BatchIndexCoordinator {
    pub fn new(ctx: Arc<IndexContext>) -> Self {
        Self { ctx }
    }

    pub async fn trigger(&self, max_count: u32) -> CoordResult<BatchTicket> {
        self.ctx.ensure_settleable()?;
        // Subscribe before the run exists so its outcome cannot be missed
        let settled = self.ctx.state.watch_batch();
        let run_id = self
            .ctx
            .state
            .try_begin(Channel::Batch, "Preparing batch index")
            .await?;
        tracing::info!(run_id, max_count, "Batch index triggered");

        let ack = match self.ctx.service.submit_batch(max_count).await {
            Ok(ack) => ack,
            Err(e) => {
                self.ctx.state.abort(Channel::Batch, run_id).await;
                let err = CoordinatorError::trigger(e.to_string());
                tracing::warn!(run_id, error = %e, hint = ?err.hint(), "Batch trigger failed");
                return Err(err);
            }
        };

        if ack.total == 0 {
            // The service emits nothing for an empty claim
            let message = "No resources waiting for indexing";
            if self
                .ctx
                .state
                .finish(Channel::Batch, run_id, message, None)
                .await
            {
                self.ctx.state.publish_batch(BatchOutcome {
                    run_id,
                    ..Default::default()
                });
                self.ctx.settle(Channel::Batch, run_id);
            }
        } else {
            tracing::debug!(run_id, batch_id = %ack.batch_id, total = ack.total, "Batch accepted");
            self.ctx.arm_watchdog(Channel::Batch, run_id);
        }

        Ok(BatchTicket {
            run_id,
            batch_id: ack.batch_id,
            total: ack.total,
            settled,
            cancel: self.ctx.lifecycle.token(),
        })
    }
}
