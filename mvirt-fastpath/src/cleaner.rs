//! Connection tracking cleanup task.
//!
//! Periodically removes idle entries from the conntrack table. The packet
//! path never expires entries itself.

use crate::conntrack::{ConnTrack, CtTimeouts, monotonic_ns};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info};

/// Default cleanup interval in seconds
const CLEANUP_INTERVAL_SECS: u64 = 30;

/// Connection tracking cleanup task handle.
pub struct ConnTrackCleaner {
    task: tokio::task::JoinHandle<()>,
}

impl ConnTrackCleaner {
    /// Start a cleanup task with default interval and timeouts.
    pub fn start(conntrack: Arc<ConnTrack>) -> Self {
        Self::start_with(
            conntrack,
            Duration::from_secs(CLEANUP_INTERVAL_SECS),
            CtTimeouts::default(),
        )
    }

    pub fn start_with(conntrack: Arc<ConnTrack>, interval: Duration, timeouts: CtTimeouts) -> Self {
        let task = tokio::spawn(async move {
            cleanup_loop(conntrack, interval, timeouts).await;
        });

        info!(?interval, "Connection tracking cleanup task started");

        Self { task }
    }

    /// Stop the cleanup task.
    pub fn stop(self) {
        self.task.abort();
        info!("Connection tracking cleanup task stopped");
    }
}

async fn cleanup_loop(conntrack: Arc<ConnTrack>, interval: Duration, timeouts: CtTimeouts) {
    let mut interval = time::interval(interval);

    loop {
        interval.tick().await;

        let removed = conntrack.expire(monotonic_ns(), &timeouts);
        if removed > 0 {
            debug!(removed, remaining = conntrack.len(), "Expired conntrack entries");
        }
    }
}
