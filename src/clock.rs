//! Time source for the control loop
//!
//! Every suspension point of the controller (poll interval, acknowledgment
//! polling, settle delays) goes through [`Clock`], so tests and dry runs can
//! substitute [`ManualClock`] and observe the exact sleep schedule.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic time plus sleeping
#[async_trait]
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock was created
    fn now(&self) -> Duration;

    async fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by `tokio::time`
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Default)]
struct ManualState {
    now: Duration,
    sleeps: Vec<Duration>,
}

/// Virtual clock: `sleep` returns immediately after advancing time.
///
/// Clones share state, so a test can keep one handle while the controller
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward without recording a sleep
    pub fn advance(&self, by: Duration) {
        if let Ok(mut s) = self.state.lock() {
            s.now += by;
        }
    }

    /// Every sleep requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .map(|s| s.sleeps.clone())
            .unwrap_or_default()
    }

    /// Sum of all requested sleeps
    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }

    pub fn clear_sleeps(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.sleeps.clear();
        }
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.state.lock().map(|s| s.now).unwrap_or_default()
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut s) = self.state.lock() {
            s.now += duration;
            s.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}
