//! Graceful shutdown.
//!
//! One [`CancellationToken`] fans the stop request out to the axum server
//! and the audit retry worker (which flushes its queue before exiting).
//! Fire-and-forget work registers with [`ShutdownCoordinator::track_task`];
//! the returned guard keeps a drain counter accurate and wakes
//! [`ShutdownCoordinator::wait_for_tasks`] when the last one finishes, so
//! the process holds on until pending analytics and audit submissions
//! complete or the drain window closes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Shutdown coordinator
// ---------------------------------------------------------------------------

/// Drain state shared by every coordinator clone and task guard.
struct DrainState {
    token: CancellationToken,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Fans shutdown out to subsystems and drains in-flight background work.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    state: Arc<DrainState>,
    drain_window: Duration,
}

impl ShutdownCoordinator {
    /// Coordinator allowing `timeout_seconds` for the final drain.
    pub fn new(timeout_seconds: u64) -> Self {
        Self {
            state: Arc::new(DrainState {
                token: CancellationToken::new(),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            drain_window: Duration::from_secs(timeout_seconds),
        }
    }

    /// Token subsystems select on to learn about shutdown.
    pub fn token(&self) -> CancellationToken {
        self.state.token.clone()
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.state.token.is_cancelled()
    }

    /// Register one unit of in-flight background work.
    ///
    /// Dropping the returned guard deregisters it; the guard that brings
    /// the counter to zero wakes the drain waiter.
    pub fn track_task(&self) -> TaskGuard {
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            state: Arc::clone(&self.state),
        }
    }

    /// Number of in-flight background tasks.
    pub fn in_flight_count(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Request shutdown.
    pub fn trigger(&self) {
        self.state.token.cancel();
    }

    /// Hold until in-flight work drains or the window closes.
    ///
    /// Returns `true` when the counter reached zero in time. Wakeups come
    /// from the guards themselves, so an already-empty counter returns
    /// without sleeping.
    pub async fn wait_for_tasks(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.drain_window;
        while self.in_flight_count() > 0 {
            info!(
                pending = self.in_flight_count(),
                "Draining background tasks"
            );
            if tokio::time::timeout_at(deadline, self.state.idle.notified())
                .await
                .is_err()
            {
                // A guard dropped right at the deadline may have beaten
                // the timeout without waking us.
                let pending = self.in_flight_count();
                if pending == 0 {
                    break;
                }
                warn!(
                    pending,
                    drain_seconds = self.drain_window.as_secs(),
                    "Drain window closed with background tasks still running"
                );
                return false;
            }
        }
        info!("Background tasks drained");
        true
    }
}

/// Guard for one unit of tracked background work.
pub struct TaskGuard {
    state: Arc<DrainState>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.state.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            // notify_one stores a permit, so a waiter arriving after this
            // drop still sees the wakeup.
            self.state.idle.notify_one();
        }
    }
}

// ---------------------------------------------------------------------------
// Signal handling
// ---------------------------------------------------------------------------

/// Resolves once the process should stop, then triggers the coordinator.
///
/// Listens for SIGTERM and SIGINT on Unix (Ctrl-C elsewhere) alongside the
/// coordinator's own token, so programmatic triggers resolve it too.
pub async fn shutdown_signal(coordinator: ShutdownCoordinator) {
    let cause = wait_for_stop_request(coordinator.token()).await;
    info!(cause, "Shutting down");
    coordinator.trigger();
}

#[cfg(unix)]
async fn wait_for_stop_request(token: CancellationToken) -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    // A handler that cannot be installed leaves the token as the only
    // trigger for that path.
    async fn recv(kind: SignalKind, name: &'static str) {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(signal = name, error = %e, "Signal handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    }

    tokio::select! {
        _ = recv(SignalKind::terminate(), "SIGTERM") => "SIGTERM",
        _ = recv(SignalKind::interrupt(), "SIGINT") => "SIGINT",
        _ = token.cancelled() => "token",
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_request(token: CancellationToken) -> &'static str {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Ctrl-C handler unavailable");
                token.cancelled().await;
                return "token";
            }
            "Ctrl-C"
        }
        _ = token.cancelled() => "token",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_initial_state() {
        let coord = ShutdownCoordinator::new(30);
        assert!(!coord.is_shutting_down());
        assert_eq!(coord.in_flight_count(), 0);
    }

    #[test]
    fn test_trigger_cancels_token() {
        let coord = ShutdownCoordinator::new(30);
        let token = coord.token();
        coord.trigger();
        assert!(coord.is_shutting_down());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_task_guard_counts() {
        let coord = ShutdownCoordinator::new(30);
        let guard1 = coord.track_task();
        let guard2 = coord.track_task();
        assert_eq!(coord.in_flight_count(), 2);

        drop(guard1);
        assert_eq!(coord.in_flight_count(), 1);
        drop(guard2);
        assert_eq!(coord.in_flight_count(), 0);
    }

    #[test]
    fn test_coordinator_clone_shares_state() {
        let coord = ShutdownCoordinator::new(30);
        let coord2 = coord.clone();

        let _guard = coord.track_task();
        assert_eq!(coord2.in_flight_count(), 1);

        coord.trigger();
        assert!(coord2.is_shutting_down());
    }

    #[tokio::test]
    async fn test_wait_for_tasks_immediate_when_empty() {
        let coord = ShutdownCoordinator::new(1);
        assert!(coord.wait_for_tasks().await);
    }

    #[tokio::test]
    async fn test_last_guard_wakes_drain_wait() {
        let coord = ShutdownCoordinator::new(30);
        let coord2 = coord.clone();

        tokio::spawn(async move {
            let _guard = coord2.track_task();
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coord.in_flight_count(), 1);

        // Wakes on the guard drop, well before the 30s window
        let start = tokio::time::Instant::now();
        assert!(coord.wait_for_tasks().await);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_for_tasks_gives_up_at_window() {
        let coord = ShutdownCoordinator::new(1);
        let _guard = coord.track_task(); // never dropped

        let start = tokio::time::Instant::now();
        assert!(!coord.wait_for_tasks().await);
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(coord.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_signal_resolves_on_token() {
        let coord = ShutdownCoordinator::new(30);
        let coord2 = coord.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            coord2.trigger();
        });

        let start = tokio::time::Instant::now();
        shutdown_signal(coord.clone()).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(coord.is_shutting_down());
    }
}
