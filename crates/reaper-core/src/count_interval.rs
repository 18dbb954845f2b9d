//! Sliding-window constraint: at most `count` grants in any trailing `time_span`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::constraint::{AwaitableConstraint, ConstraintGrant};
use crate::error::AppError;
use crate::util::duration_to_micros;

/// Fixed-capacity stack of grant timestamps, newest first.
#[derive(Debug)]
pub struct TimestampWindow {
    capacity: usize,
    stamps: VecDeque<i64>,
}

impl TimestampWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            stamps: VecDeque::with_capacity(capacity),
        }
    }

    /// Pushes a timestamp, evicting the oldest entry on overflow.
    pub fn push(&mut self, micros: i64) {
        self.stamps.push_front(micros);
        self.stamps.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// Microseconds until another grant fits in a window of `span_micros` ending at `now`.
    pub fn wait_micros(&self, now: i64, span_micros: i64) -> i64 {
        let threshold = now.saturating_sub(span_micros);
        let mut qualifying = 0;
        let mut oldest_qualifying = None;
        for &stamp in &self.stamps {
            if stamp <= threshold {
                break;
            }
            qualifying += 1;
            oldest_qualifying = Some(stamp);
        }

        match oldest_qualifying {
            Some(oldest) if qualifying >= self.capacity => {
                (oldest.saturating_add(span_micros) - now).max(0)
            }
            _ => 0,
        }
    }
}

/// "`count` operations per `time_span`", granted in arrival order.
pub struct CountByIntervalConstraint<C: Clock = SystemClock> {
    count: usize,
    time_span: Duration,
    clock: C,
    semaphore: Arc<Semaphore>,
    window: Arc<Mutex<TimestampWindow>>,
}

impl CountByIntervalConstraint<SystemClock> {
    pub fn new(count: usize, time_span: Duration) -> Result<Self, AppError> {
        Self::with_clock(count, time_span, SystemClock::new())
    }
}

impl<C: Clock> CountByIntervalConstraint<C> {
    pub fn with_clock(count: usize, time_span: Duration, clock: C) -> Result<Self, AppError> {
        if count == 0 {
            return Err(AppError::InvalidArgument(
                "count per interval must be positive".into(),
            ));
        }
        if time_span.is_zero() {
            return Err(AppError::InvalidArgument(
                "interval time span must be positive".into(),
            ));
        }
        Ok(Self {
            count,
            time_span,
            clock,
            semaphore: Arc::new(Semaphore::new(1)),
            window: Arc::new(Mutex::new(TimestampWindow::new(count))),
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn time_span(&self) -> Duration {
        self.time_span
    }
}

fn lock_window(window: &Mutex<TimestampWindow>) -> MutexGuard<'_, TimestampWindow> {
    window.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Timestamp window recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

impl<C: Clock> AwaitableConstraint for CountByIntervalConstraint<C> {
    fn wait_for_readiness<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ConstraintGrant, AppError>> {
        Box::pin(async move {
            // Taken at entry, so waiters are served in arrival order.
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| AppError::Generic("constraint semaphore closed".into()))?
                }
                () = cancel.cancelled() => return Err(AppError::Cancelled),
            };

            let now = self.clock.now_micros();
            let wait = lock_window(&self.window).wait_micros(now, duration_to_micros(self.time_span));
            if wait > 0 {
                tracing::debug!(
                    count = self.count,
                    wait_ms = wait / 1000,
                    "Interval constraint full, delaying"
                );
                tokio::select! {
                    () = self.clock.sleep_micros(wait) => {}
                    () = cancel.cancelled() => return Err(AppError::Cancelled),
                }
            }

            let clock = self.clock.clone();
            let window = self.window.clone();
            Ok(ConstraintGrant::new(move || {
                lock_window(&window).push(clock.now_micros());
                drop(permit);
            }))
        })
    }
}
