//! indexdeck core - coordination of content-indexing jobs
//!
//! This crate drives an external indexing service and keeps an aggregate
//! view of its work:
//! - Snapshot fetches with stale-result protection
//! - Text batch runs tracked through push events
//! - Multimodal fan-out with bounded parallelism
//! - A unified "index everything" run over both
//! - Delayed resets and refreshes that go quiet after teardown

pub mod config;
pub mod error;
pub mod events;
pub mod guards;
pub mod jobs;
pub mod models;
pub mod reconcile;
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{Config, Settings};
pub use error::{CoordResult, CoordinatorError, TriggerHint};
pub use events::{Channel, ChannelEvent, ProgressEvent};
pub use jobs::{
    BatchIndexCoordinator, JobPhase, JobState, MultimodalIndexCoordinator, ResetKind,
    UnifiedIndexOrchestrator, UnifiedRun,
};
pub use models::{IndexState, IndexStatusSummary, ResourceIndexRecord};
pub use reconcile::{reconcile, ReconciledView};
pub use service::{IndexService, MemoryIndexService};
