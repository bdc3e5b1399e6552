use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Inactivity tracker for a worker process.
///
/// Every handled request (health checks included) records activity; the
/// timer itself never resets otherwise. The harness polls it and shuts the
/// worker down once the idle window has fully elapsed.
pub struct IdleTimer {
    last_activity: Mutex<Instant>,
    window: Duration,
}

impl IdleTimer {
    pub fn new(window: Duration) -> Self {
        Self {
            last_activity: Mutex::new(Instant::now()),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Mark the worker as active now.
    pub fn record_activity(&self) {
        let mut last = self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Instant::now();
        debug!("Activity recorded, idle timer reset");
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    pub fn expired(&self) -> bool {
        self.idle_for() >= self.window
    }

    /// Resolve once the idle window has elapsed with no recorded activity,
    /// checking every `poll` interval.
    pub async fn expired_after_polling(&self, poll: Duration) {
        loop {
            if self.expired() {
                info!(
                    "No activity for {:?} (window {:?}), signaling shutdown",
                    self.idle_for(),
                    self.window
                );
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }
}
