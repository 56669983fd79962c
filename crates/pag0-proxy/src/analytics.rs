//! Fire-and-forget request analytics.
//!
//! Every completed proxy request is recorded off the hot path. Recording
//! failures are logged and dropped; analytics never gates a response.

use crate::shutdown::ShutdownCoordinator;
use pag0_core::{AnalyticsStore, RequestRecord};
use std::sync::Arc;
use tracing::warn;

/// Records request rows in the background.
pub struct AnalyticsRecorder {
    analytics: Arc<dyn AnalyticsStore>,
    shutdown: ShutdownCoordinator,
}

impl AnalyticsRecorder {
    /// Create a recorder. Spawned writes register with the shutdown
    /// coordinator so a draining server waits for them.
    pub fn new(analytics: Arc<dyn AnalyticsStore>, shutdown: ShutdownCoordinator) -> Self {
        Self { analytics, shutdown }
    }

    /// Record a request without blocking the caller.
    pub fn record_async(&self, record: RequestRecord) {
        let analytics = Arc::clone(&self.analytics);
        let guard = self.shutdown.track_task();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = analytics.record_request(&record).await {
                warn!(
                    endpoint = %record.endpoint,
                    error = %e,
                    "Failed to record request analytics"
                );
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
