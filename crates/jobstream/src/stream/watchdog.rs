//! Heartbeat watchdog.
//!
//! A single-shot, restartable deadline owned by the connection task. The task
//! polls [`Watchdog::expired`] inside its `select!`; the future resolves at
//! most once per arm cycle and the watchdog disarms itself when it does.

use std::future;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// Liveness deadline for one connection.
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl Watchdog {
    /// Create a disarmed watchdog with the given default timeout.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    /// The timeout used by [`arm`](Self::arm) and [`reset`](Self::reset).
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check if a firing is pending.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Schedule a single firing after the default timeout.
    pub fn arm(&mut self) {
        self.arm_for(self.timeout);
    }

    /// Schedule a single firing after `timeout`, replacing any pending one.
    pub fn arm_for(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.deadline = Some(Instant::now() + timeout);
    }

    /// Cancel any pending firing and re-arm from now.
    pub fn reset(&mut self) {
        self.arm();
    }

    /// Disarm until the next [`arm`](Self::arm).
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Resolves when the deadline passes. Pending forever while disarmed.
    ///
    /// Cancel safe: dropping the future before it resolves leaves the
    /// deadline untouched.
    pub async fn expired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => future::pending().await,
        }
    }
}
