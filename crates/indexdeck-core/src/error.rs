//! Coordinator error types
//!
//! Errors serialize to `{"code": "...", "message": "..."}` so a frontend can
//! match on `code` without parsing messages.

use serde::Serialize;
use thiserror::Error;

/// Best-effort guess at what broke when a trigger call fails.
///
/// Derived from error text. Good enough to pick a hint for the user, not
/// something to branch program logic on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerHint {
    /// Embedding model missing or misconfigured
    EmbeddingModel,
    /// Backend unreachable
    Connectivity,
    /// Storage busy or locked
    StorageContention,
    Unknown,
}

impl TriggerHint {
    pub fn classify(error: &str) -> Self {
        let lower = error.to_lowercase();
        let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if any(&["embedding", "model", "dimension"]) {
            TriggerHint::EmbeddingModel
        } else if any(&[
            "connect",
            "network",
            "timed out",
            "timeout",
            "unreachable",
            "refused",
        ]) {
            TriggerHint::Connectivity
        } else if any(&["locked", "busy", "contention", "lock"]) {
            TriggerHint::StorageContention
        } else {
            TriggerHint::Unknown
        }
    }
}

/// Errors returned by coordinator operations.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum CoordinatorError {
    /// Another job is active on one of the channels
    #[error("{message}")]
    Busy { message: String },

    /// Snapshot fetch failed
    #[error("{message}")]
    FetchFailed { message: String },

    /// The trigger call itself failed before any event arrived
    #[error("{message}")]
    TriggerFailed { message: String, hint: TriggerHint },

    /// Subscribing to an event channel failed
    #[error("{message}")]
    SubscribeFailed { message: String, channel: String },

    /// Any other call into the indexing service failed
    #[error("{message}")]
    ServiceError { message: String },

    /// No progress subscription is live, so a batch run could never finish
    #[error("{message}")]
    NotStarted { message: String },

    /// The coordinator was already shut down
    #[error("{message}")]
    ShutDown { message: String },
}

impl CoordinatorError {
    pub fn busy() -> Self {
        Self::Busy {
            message: "An indexing job is already running. Wait for the current job to finish."
                .to_string(),
        }
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Self::FetchFailed {
            message: message.into(),
        }
    }

    pub fn trigger(message: impl Into<String>) -> Self {
        let message = message.into();
        let hint = TriggerHint::classify(&message);
        Self::TriggerFailed { message, hint }
    }

    pub fn subscribe(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SubscribeFailed {
            message: message.into(),
            channel: channel.into(),
        }
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::ServiceError {
            message: message.into(),
        }
    }

    pub fn not_started() -> Self {
        Self::NotStarted {
            message: "Not listening for progress events. Start the coordinator first.".to_string(),
        }
    }

    pub fn shut_down() -> Self {
        Self::ShutDown {
            message: "Coordinator has been shut down".to_string(),
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    pub fn hint(&self) -> Option<TriggerHint> {
        match self {
            Self::TriggerFailed { hint, .. } => Some(*hint),
            _ => None,
        }
    }
}

/// Result type alias for coordinator operations
pub type CoordResult<T> = Result<T, CoordinatorError>;

/// Extension trait for converting service results
pub trait ResultExt<T> {
    fn fetch_err(self) -> CoordResult<T>;
    fn trigger_err(self) -> CoordResult<T>;
    fn service_err(self) -> CoordResult<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn fetch_err(self) -> CoordResult<T> {
        self.map_err(|e| CoordinatorError::fetch(e.to_string()))
    }

    fn trigger_err(self) -> CoordResult<T> {
        self.map_err(|e| CoordinatorError::trigger(e.to_string()))
    }

    fn service_err(self) -> CoordResult<T> {
        self.map_err(|e| CoordinatorError::service(e.to_string()))
    }
}
