//! Cancellable subscription streams.
//!
//! Every realtime feed in causette (conversation snapshots, relay events,
//! presence updates) is delivered as a [`Subscription`]: an mpsc receiver
//! paired with a guard that aborts the feeding task when the handle is
//! dropped. Dropping the subscription *is* the unsubscribe.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Aborts the wrapped task when dropped.
///
/// Also used standalone for background loops owned by a component, so tearing
/// the component down stops its tasks.
#[derive(Debug)]
pub struct TaskGuard {
    handle: JoinHandle<()>,
}

impl TaskGuard {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Stop the task now instead of waiting for the guard to drop.
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A live stream of items produced by a background task.
///
/// `recv` returns `None` once the feeder stops, either because the source
/// closed or because the subscription was cancelled from the producing side.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    _guard: TaskGuard,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::Receiver<T>, guard: TaskGuard) -> Self {
        Self { rx, _guard: guard }
    }

    /// Next item, or `None` when the stream has ended.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking read, for draining in tests.
    pub fn try_recv(&mut self) -> Result<T, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}
