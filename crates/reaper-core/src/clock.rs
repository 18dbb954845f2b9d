//! Injected time source for the rate limiter and constraints.
//!
//! Production code uses [`SystemClock`], which reads `tokio::time`, so tests
//! can run under a paused runtime. Exact-arithmetic tests substitute a manual
//! clock whose `sleep` advances time instantly.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::util::{duration_to_micros, micros_to_duration};

/// Monotonic clock plus sleeper.
pub trait Clock: Send + Sync + Clone + 'static {
    /// Microseconds elapsed since this clock was created.
    fn now_micros(&self) -> i64;

    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Suspends the caller for `micros`; non-positive values return immediately.
    fn sleep_micros(&self, micros: i64) -> impl Future<Output = ()> + Send {
        self.sleep(micros_to_duration(micros))
    }
}

/// Clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        duration_to_micros(self.origin.elapsed())
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}
