//! Guards against stale results and writes after teardown.
//!
//! The indexing service has no cancel primitive, so these are the only
//! tools for "cancelling" work that is already in flight:
//! - [`RequestVersionGuard`] invalidates fetch results that were overtaken
//! - [`LifecycleGuard`] turns deferred writes into no-ops after teardown

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Token captured when an async fetch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestToken(u64);

impl RequestToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Monotonic token issuer. A result is only applied if its token is still
/// the latest one issued.
#[derive(Debug, Clone, Default)]
pub struct RequestVersionGuard {
    current: Arc<AtomicU64>,
}

impl RequestVersionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new request, invalidating every earlier token.
    pub fn begin(&self) -> RequestToken {
        RequestToken(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, token: RequestToken) -> bool {
        self.current.load(Ordering::SeqCst) == token.0
    }
}

/// Liveness flag for the owning context.
///
/// True from construction, flipped to false exactly once by [`teardown`].
/// Teardown also cancels every timer scheduled through [`defer`].
///
/// [`teardown`]: LifecycleGuard::teardown
/// [`defer`]: LifecycleGuard::defer
#[derive(Debug, Clone)]
pub struct LifecycleGuard {
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Default for LifecycleGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleGuard {
    pub fn new() -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Mark the context as gone. Returns false if it was already torn down.
    pub fn teardown(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        self.cancel.cancel();
        was_alive
    }

    /// Token cancelled at teardown, for long-running loops.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Schedule `f` after `delay`.
    ///
    /// The timer is dropped at teardown, and the liveness flag is checked
    /// again right before `f` runs.
    pub fn defer<F, Fut>(&self, delay: Duration, f: F) -> DeferredTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.child_token();
        let alive = self.alive.clone();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = task_cancel.cancelled() => {
                    tracing::trace!("Deferred task cancelled");
                    return;
                }

                _ = tokio::time::sleep(delay) => {}
            }

            if !alive.load(Ordering::SeqCst) {
                tracing::trace!("Deferred task skipped after teardown");
                return;
            }

            f().await;
        });

        DeferredTask { cancel, handle }
    }
}

/// Handle to a task scheduled with [`LifecycleGuard::defer`].
#[derive(Debug)]
pub struct DeferredTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl DeferredTask {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
