//! Rebuild sessions.
//!
//! Each binary group owns one [`RebuildSlot`]. A trigger cancels the running
//! session of that group, waits until it has fully stopped, then starts the
//! new one on a fresh child token. Sessions wait out the debounce window
//! before doing any work, so a burst of saves collapses into one rebuild.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::obs::emit_rebuild_cancelled;
use crate::poll::sleep_or_cancel;

struct Session {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// At most one running session for one group.
pub struct RebuildSlot {
    group: String,
    parent: CancellationToken,
    debounce: Duration,
    current: Option<Session>,
}

impl RebuildSlot {
    pub fn new(group: impl Into<String>, parent: CancellationToken, debounce: Duration) -> Self {
        Self {
            group: group.into(),
            parent,
            debounce,
            current: None,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Replace the running session with `work`.
    ///
    /// `work` receives the session token and must stop promptly once it fires.
    pub async fn trigger<F, Fut>(&mut self, work: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel_current().await;

        let token = self.parent.child_token();
        let session = work(token.clone());
        let group = self.group.clone();
        let debounce = self.debounce;
        let session_token = token.clone();
        let handle = tokio::spawn(async move {
            if !sleep_or_cancel(&session_token, debounce).await {
                emit_rebuild_cancelled(&group);
                return;
            }
            session.await;
        });
        self.current = Some(Session { token, handle });
    }

    /// Wait for the running session to end on its own.
    pub async fn settle(&mut self) {
        if let Some(session) = self.current.take() {
            let _ = session.handle.await;
        }
    }

    /// Cancel the running session and wait for it.
    pub async fn finish(&mut self) {
        self.cancel_current().await;
    }

    async fn cancel_current(&mut self) {
        if let Some(previous) = self.current.take() {
            previous.token.cancel();
            if let Err(e) = previous.handle.await {
                debug!(group = %self.group, error = %e, "rebuild session aborted");
            }
        }
    }
}

/// Counters over all sessions.
#[derive(Debug, Default)]
pub struct RebuildStats {
    completed: AtomicUsize,
    cancelled: AtomicUsize,
    failed: AtomicUsize,
    restarts: AtomicUsize,
}

/// Point-in-time copy of [`RebuildStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildCounts {
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub restarts: usize,
}

impl RebuildStats {
    pub fn record_completed(&self, restarted: bool) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        if restarted {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> RebuildCounts {
        RebuildCounts {
            completed: self.completed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            restarts: self.restarts.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn counting_work(
        stats: Arc<RebuildStats>,
        duration: Duration,
    ) -> impl FnOnce(CancellationToken) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
        move |token| {
            Box::pin(async move {
                if sleep_or_cancel(&token, duration).await {
                    stats.record_completed(false);
                } else {
                    stats.record_cancelled();
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_triggers_complete_once() {
        let stats = Arc::new(RebuildStats::default());
        let mut slot = RebuildSlot::new("agent", CancellationToken::new(), Duration::from_millis(300));

        slot.trigger(counting_work(stats.clone(), Duration::from_secs(1)))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        slot.trigger(counting_work(stats.clone(), Duration::from_secs(1)))
            .await;
        slot.settle().await;

        assert_eq!(stats.snapshot().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_cancels_running_session() {
        let stats = Arc::new(RebuildStats::default());
        let mut slot = RebuildSlot::new("agent", CancellationToken::new(), Duration::from_millis(10));

        slot.trigger(counting_work(stats.clone(), Duration::from_secs(5)))
            .await;
        // past the debounce window, first session is mid-work
        tokio::time::sleep(Duration::from_millis(100)).await;
        slot.trigger(counting_work(stats.clone(), Duration::from_millis(100)))
            .await;
        assert_eq!(stats.snapshot().cancelled, 1);

        slot.settle().await;
        let counts = stats.snapshot();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slots_are_independent() {
        let stats = Arc::new(RebuildStats::default());
        let root = CancellationToken::new();
        let mut agent = RebuildSlot::new("agent", root.clone(), Duration::from_millis(10));
        let mut workflow = RebuildSlot::new("workflow", root.clone(), Duration::from_millis(10));

        agent
            .trigger(counting_work(stats.clone(), Duration::from_millis(100)))
            .await;
        workflow
            .trigger(counting_work(stats.clone(), Duration::from_millis(100)))
            .await;
        agent.settle().await;
        workflow.settle().await;

        assert_eq!(stats.snapshot().completed, 2);
        assert!(!root.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_reaches_session() {
        let stats = Arc::new(RebuildStats::default());
        let root = CancellationToken::new();
        let mut slot = RebuildSlot::new("agent", root.clone(), Duration::from_millis(10));

        slot.trigger(counting_work(stats.clone(), Duration::from_secs(60)))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        root.cancel();
        slot.settle().await;

        assert_eq!(stats.snapshot().cancelled, 1);
        assert_eq!(stats.snapshot().completed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_stops_session() {
        let stats = Arc::new(RebuildStats::default());
        let mut slot = RebuildSlot::new("agent", CancellationToken::new(), Duration::from_millis(10));
        slot.trigger(counting_work(stats.clone(), Duration::from_secs(60)))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        slot.finish().await;
        assert_eq!(stats.snapshot().cancelled, 1);
    }
}
