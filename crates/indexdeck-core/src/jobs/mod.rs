//! Indexing job coordination.
//!
//! Architecture:
//!
//! ```text
//!                      UnifiedIndexOrchestrator::run_all()
//!                                  │
//!                  ┌───────────────┴────────────────┐
//!                  ▼                                ▼
//!       BatchIndexCoordinator            MultimodalIndexCoordinator
//!       submit_batch() once              index_item() per candidate
//!                  │                     (ConcurrencyLimiter, N = 3)
//!                  ▼                                │
//!       vfs-index-progress ──┐      ┌── mm_index_progress
//!                            ▼      ▼               │
//!                      ProgressEventAdapter         │
//!                            │                      │
//!                            ▼                      ▼
//!                    CoordinatorState  ◄──── tally / percent
//!               (summary, view, 2 × JobState)
//!                            │
//!             terminal ──► refresh now, reset to idle later
//!                          (LifecycleGuard, RequestVersionGuard)
//! ```
//!
//! The batch phase completes only through its terminal event. The
//! multimodal phase completes when every per-item call has settled; its
//! channel events only update the message while a fan-out owns it.

mod batch;
pub(crate) mod context;
pub mod limiter;
mod multimodal;
mod orchestrator;
pub mod state;

pub use batch::{BatchIndexCoordinator, BatchTicket};
pub use context::{IndexContext, Refresh};
pub use limiter::{ConcurrencyLimiter, TaskAborted, TaskOutcome, DEFAULT_CONCURRENCY};
pub use multimodal::{multimodal_candidates, MultimodalIndexCoordinator, MultimodalRunSummary};
pub use orchestrator::{ResetKind, UnifiedIndexOrchestrator, UnifiedRun, UnifiedRunReport};
pub use state::{
    BatchOutcome, CoordinatorState, JobPhase, JobState, StateSnapshot, StateUpdate,
};
