//! Subscription loop for both progress channels.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{multimodal_item_id, normalize_batch, normalize_multimodal, Channel, ChannelEvent};
use crate::error::{CoordResult, CoordinatorError};
use crate::jobs::context::ListenerGuard;
use crate::jobs::IndexContext;
use crate::service::EventStream;

/// Live subscription to the progress channels.
///
/// Dropping the handle or calling [`unsubscribe`](Self::unsubscribe) stops
/// delivery; teardown of the owning context stops it too.
pub struct Subscription {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }

    /// Stop and wait for the loop to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Turns raw channel payloads into [`ChannelEvent`]s and feeds them to the
/// coordinator state.
pub struct ProgressEventAdapter {
    ctx: Arc<IndexContext>,
}

impl ProgressEventAdapter {
    /// Subscribe to both channels and start delivering events.
    ///
    /// Both subscriptions are made before this returns, so events emitted
    /// by a trigger issued afterwards are not missed.
    pub async fn subscribe(ctx: Arc<IndexContext>) -> CoordResult<Subscription> {
        let batch_name = ctx.settings.batch_channel.clone();
        let mm_name = ctx.settings.multimodal_channel.clone();

        let batch = ctx
            .service
            .subscribe(&batch_name)
            .await
            .map_err(|e| CoordinatorError::subscribe(&batch_name, e.to_string()))?;
        let multimodal = ctx
            .service
            .subscribe(&mm_name)
            .await
            .map_err(|e| CoordinatorError::subscribe(&mm_name, e.to_string()))?;

        let cancel = ctx.lifecycle.token().child_token();
        let listening = ctx.listen();
        let adapter = Self { ctx };
        let handle = tokio::spawn(adapter.run(batch, multimodal, cancel.clone(), listening));

        tracing::info!(batch = %batch_name, multimodal = %mm_name, "Subscribed to progress channels");
        Ok(Subscription { cancel, handle })
    }

    async fn run(
        self,
        mut batch: EventStream,
        mut multimodal: EventStream,
        cancel: CancellationToken,
        _listening: ListenerGuard,
    ) {
        let mut batch_open = true;
        let mut mm_open = true;

        while batch_open || mm_open {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::debug!("Progress subscription cancelled");
                    break;
                }

                payload = batch.next(), if batch_open => match payload {
                    Some(payload) => self.on_batch(payload).await,
                    None => {
                        tracing::debug!("Batch channel ended");
                        batch_open = false;
                    }
                },

                payload = multimodal.next(), if mm_open => match payload {
                    Some(payload) => self.on_multimodal(payload).await,
                    None => {
                        tracing::debug!("Multimodal channel ended");
                        mm_open = false;
                    }
                },
            }
        }

        tracing::debug!("Progress subscription stopped");
    }

    async fn on_batch(&self, payload: Value) {
        match normalize_batch(&payload) {
            Ok(event) => {
                self.ctx
                    .on_event(ChannelEvent {
                        channel: Channel::Batch,
                        event,
                    })
                    .await
            }
            Err(e) => {
                tracing::warn!(error = %e, payload = %payload, "Ignoring batch event");
            }
        }
    }

    async fn on_multimodal(&self, payload: Value) {
        // Labels come from the last snapshot; resolve before normalizing
        let id = multimodal_item_id(&payload);
        let label = match &id {
            Some(id) => self.ctx.state.label_for(id).await,
            None => None,
        };

        match normalize_multimodal(&payload, |_| label.clone()) {
            Ok(event) => {
                self.ctx
                    .on_event(ChannelEvent {
                        channel: Channel::Multimodal,
                        event,
                    })
                    .await
            }
            Err(e) => {
                tracing::warn!(error = %e, payload = %payload, "Ignoring multimodal event");
            }
        }
    }
}
