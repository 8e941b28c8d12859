//! Debounced rebuild trigger
//!
//! The watch path calls [`RebuildTrigger::notify`] on every object event;
//! the call never blocks and never fails. A run loop owns the receiving
//! end and coalesces bursts: each notification re-arms an idle timer, a
//! maximum coalescing window bounds how long a sustained stream can
//! postpone work, and when either fires exactly one rebuild runs.
//!
//! Single-flight is structural: the loop awaits the rebuild future, so no
//! two rebuilds ever overlap. Notifications arriving while a rebuild is in
//! flight are not lost and do not cancel it - they are drained afterwards
//! and dispatch one immediate follow-up rebuild.
//!
//! The trigger itself carries no object state; the cache is always mutated
//! before `notify` is called, so any rebuild dispatched after a
//! notification observes its effect.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cache::Kind;

/// The kind of change a watch event reported
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    /// Object created
    Add,
    /// Object modified
    Update,
    /// Object deleted
    Delete,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A single change notification
#[derive(Clone, Debug)]
pub struct Notification {
    /// Kind of the changed object
    pub kind: Kind,
    /// Namespace of the changed object
    pub namespace: String,
    /// Name of the changed object
    pub name: String,
    /// What happened
    pub change: ChangeType,
}

/// Debounce parameters for the rebuild loop
#[derive(Clone, Copy, Debug)]
pub struct DebounceConfig {
    /// Idle window; re-armed by every notification
    pub window: Duration,
    /// Hard bound measured from the first pending notification
    pub max_window: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(crate::DEFAULT_DEBOUNCE_MS),
            max_window: Duration::from_millis(crate::DEFAULT_MAX_COALESCE_MS),
        }
    }
}

/// Sending half handed to the watch path. Cheap to clone.
#[derive(Clone)]
pub struct RebuildTrigger {
    tx: mpsc::UnboundedSender<Notification>,
}

impl RebuildTrigger {
    /// Create a trigger and the receiver its run loop consumes
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Record a change notification. Returns immediately; a send after the
    /// run loop has shut down is silently discarded.
    pub fn notify(
        &self,
        kind: Kind,
        namespace: impl Into<String>,
        name: impl Into<String>,
        change: ChangeType,
    ) {
        let notification = Notification {
            kind,
            namespace: namespace.into(),
            name: name.into(),
            change,
        };
        trace!(
            kind = %notification.kind,
            object = %format!("{}/{}", notification.namespace, notification.name),
            change = %notification.change,
            "change notification"
        );
        let _ = self.tx.send(notification);
    }
}

/// Drive debounced, single-flight rebuilds until every trigger handle is
/// dropped and the queue is drained.
///
/// `rebuild` is invoked with no arguments; it gathers its own cache
/// snapshot so that each rebuild observes the newest state at the moment
/// it starts, not at the moment the first notification arrived.
pub async fn run_rebuild_loop<F, Fut>(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    config: DebounceConfig,
    mut rebuild: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        // Park until something changes.
        if rx.recv().await.is_none() {
            debug!("rebuild trigger closed, stopping");
            return;
        }

        // Coalesce the burst: every further notification re-arms the idle
        // timer, the deadline caps total postponement.
        let deadline = Instant::now() + config.max_window;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let idle = config.window.min(deadline - now);
            tokio::select! {
                maybe = rx.recv() => {
                    if maybe.is_none() {
                        break;
                    }
                }
                _ = tokio::time::sleep(idle) => {
                    break;
                }
            }
        }

        rebuild().await;

        // Notifications that landed mid-rebuild get one immediate
        // follow-up pass, no fresh debounce delay.
        loop {
            let mut drained = false;
            while rx.try_recv().is_ok() {
                drained = true;
            }
            if !drained {
                break;
            }
            debug!("notifications arrived during rebuild, running follow-up");
            rebuild().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn config(window_ms: u64, max_ms: u64) -> DebounceConfig {
        DebounceConfig {
            window: Duration::from_millis(window_ms),
            max_window: Duration::from_millis(max_ms),
        }
    }

    fn counting_rebuild(
        count: Arc<AtomicU32>,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
        move || {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_one_rebuild() {
        let (trigger, rx) = RebuildTrigger::new();
        let count = Arc::new(AtomicU32::new(0));
        let loop_handle = tokio::spawn(run_rebuild_loop(
            rx,
            config(100, 500),
            counting_rebuild(count.clone()),
        ));

        // 50 notifications for distinct objects inside one window.
        for i in 0..50 {
            trigger.notify(Kind::Proxy, "shop", format!("proxy-{i}"), ChangeType::Add);
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(trigger);
        loop_handle.await.expect("rebuild loop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_notifications_rebuild_per_window() {
        let (trigger, rx) = RebuildTrigger::new();
        let count = Arc::new(AtomicU32::new(0));
        let loop_handle = tokio::spawn(run_rebuild_loop(
            rx,
            config(100, 500),
            counting_rebuild(count.clone()),
        ));

        for _ in 0..3 {
            trigger.notify(Kind::Proxy, "shop", "storefront", ChangeType::Update);
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        assert_eq!(count.load(Ordering::SeqCst), 3);
        drop(trigger);
        loop_handle.await.expect("rebuild loop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_stream_is_capped_by_max_window() {
        let (trigger, rx) = RebuildTrigger::new();
        let count = Arc::new(AtomicU32::new(0));
        let loop_handle = tokio::spawn(run_rebuild_loop(
            rx,
            config(100, 500),
            counting_rebuild(count.clone()),
        ));

        // Notify every 50ms for 2s: the idle timer alone would never fire.
        let sender = trigger.clone();
        let feeder = tokio::spawn(async move {
            for i in 0..40 {
                sender.notify(Kind::Endpoints, "shop", format!("ep-{i}"), ChangeType::Update);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
        feeder.await.expect("feeder");
        tokio::time::sleep(Duration::from_millis(700)).await;

        // Without the max window the stream would coalesce into a single
        // trailing rebuild; with it, rebuilds pace out roughly every 500ms.
        let rebuilds = count.load(Ordering::SeqCst);
        assert!(
            (3..=10).contains(&rebuilds),
            "expected max-window-paced rebuilds, got {rebuilds}"
        );
        drop(trigger);
        loop_handle.await.expect("rebuild loop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_during_rebuild_runs_immediate_followup() {
        let (trigger, rx) = RebuildTrigger::new();
        let count = Arc::new(AtomicU32::new(0));

        let count_in = count.clone();
        let trigger_in = trigger.clone();
        let loop_handle = tokio::spawn(run_rebuild_loop(rx, config(100, 500), move || {
            let count = count_in.clone();
            let trigger = trigger_in.clone();
            Box::pin(async move {
                let call = count.fetch_add(1, Ordering::SeqCst);
                if call == 0 {
                    // A change lands while the first rebuild is in flight.
                    trigger.notify(Kind::Secret, "certs", "wildcard", ChangeType::Update);
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }) as std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
        }));

        trigger.notify(Kind::Proxy, "shop", "storefront", ChangeType::Add);

        // First rebuild: starts at t=100, ends t=300. Follow-up must start
        // immediately, without waiting out another debounce window.
        tokio::time::sleep(Duration::from_millis(310)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // And it is one follow-up, not a rebuild storm.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        drop(trigger);
        loop_handle.abort();
    }
}
