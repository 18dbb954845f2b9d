//! Token-bucket rate limiter shared by every crawl worker.
//!
//! Two smoothing modes:
//!
//! ```text
//! Bursty      idle time refills up to `max_burst_seconds` worth of permits,
//!             which are then handed out without waiting.
//!
//! WarmingUp   stored permits are *expensive*: the wait per permit falls
//!             linearly from cold_factor * stable_interval (bucket full,
//!             resource cold) to stable_interval (bucket at threshold).
//!
//!   wait/permit
//!        ^  cold ..........+
//!        |               / |
//!        |             /   |
//!        |  stable --+     |
//!        |           |     |
//!        +-----------+-----+----> stored permits
//!                threshold  max
//! ```
//!
//! Reservations are made under a mutex, but callers sleep outside it. A new
//! rate applies to future reservations only; a wait that was already handed
//! out is not recomputed.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::AppError;
use crate::util::{duration_to_micros, saturated_add};

const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Cold factor used by [`RateLimiter::warming_up`].
pub const DEFAULT_COLD_FACTOR: f64 = 3.0;

#[derive(Debug, Clone, Copy)]
enum Smoothing {
    Bursty {
        max_burst_seconds: f64,
    },
    WarmingUp {
        warmup_period_micros: i64,
        cold_factor: f64,
        slope: f64,
        threshold_permits: f64,
    },
}

#[derive(Debug)]
struct RateLimiterState {
    stored_permits: f64,
    max_permits: f64,
    stable_interval_micros: f64,
    next_free_ticket_micros: i64,
    smoothing: Smoothing,
}

impl RateLimiterState {
    fn new(smoothing: Smoothing) -> Self {
        Self {
            stored_permits: 0.0,
            max_permits: 0.0,
            stable_interval_micros: 0.0,
            next_free_ticket_micros: 0,
            smoothing,
        }
    }

    /// Time it takes to regain one stored permit while idle.
    fn cool_down_interval_micros(&self) -> f64 {
        match self.smoothing {
            Smoothing::Bursty { .. } => self.stable_interval_micros,
            Smoothing::WarmingUp {
                warmup_period_micros,
                ..
            } => {
                if self.max_permits > 0.0 {
                    warmup_period_micros as f64 / self.max_permits
                } else {
                    self.stable_interval_micros
                }
            }
        }
    }

    /// Credits permits earned since the last reservation.
    fn resync(&mut self, now_micros: i64) {
        if now_micros > self.next_free_ticket_micros {
            let elapsed = (now_micros - self.next_free_ticket_micros) as f64;
            let new_permits = elapsed / self.cool_down_interval_micros();
            self.stored_permits = self.max_permits.min(self.stored_permits + new_permits);
            self.next_free_ticket_micros = now_micros;
        }
    }

    fn apply_rate(&mut self, permits_per_second: f64, now_micros: i64) {
        self.resync(now_micros);
        let stable_interval_micros = MICROS_PER_SECOND / permits_per_second;
        self.stable_interval_micros = stable_interval_micros;
        let old_max_permits = self.max_permits;

        match &mut self.smoothing {
            Smoothing::Bursty { max_burst_seconds } => {
                self.max_permits = *max_burst_seconds * permits_per_second;
                self.stored_permits = if old_max_permits == 0.0 {
                    0.0
                } else {
                    self.stored_permits * self.max_permits / old_max_permits
                };
            }
            Smoothing::WarmingUp {
                warmup_period_micros,
                cold_factor,
                slope,
                threshold_permits,
            } => {
                let warmup = *warmup_period_micros as f64;
                let cold_interval_micros = stable_interval_micros * *cold_factor;
                *threshold_permits = 0.5 * warmup / stable_interval_micros;
                self.max_permits = *threshold_permits
                    + 2.0 * warmup / (stable_interval_micros + cold_interval_micros);
                *slope = if self.max_permits > *threshold_permits {
                    (cold_interval_micros - stable_interval_micros)
                        / (self.max_permits - *threshold_permits)
                } else {
                    0.0
                };
                // A fresh limiter starts cold, with a full bucket.
                self.stored_permits = if old_max_permits == 0.0 {
                    self.max_permits
                } else {
                    self.stored_permits * self.max_permits / old_max_permits
                };
            }
        }
    }

    /// Extra wait charged for spending `permits_to_take` out of `stored_permits`.
    fn stored_permits_to_wait_time(&self, stored_permits: f64, permits_to_take: f64) -> i64 {
        match self.smoothing {
            Smoothing::Bursty { .. } => 0,
            Smoothing::WarmingUp {
                slope,
                threshold_permits,
                ..
            } => {
                let permits_to_time = |permits: f64| self.stable_interval_micros + permits * slope;
                let available_above_threshold = stored_permits - threshold_permits;
                let mut permits_to_take = permits_to_take;
                let mut micros = 0.0;
                if available_above_threshold > 0.0 {
                    let above = available_above_threshold.min(permits_to_take);
                    let length = permits_to_time(available_above_threshold)
                        + permits_to_time(available_above_threshold - above);
                    micros = above * length / 2.0;
                    permits_to_take -= above;
                }
                (micros + self.stable_interval_micros * permits_to_take) as i64
            }
        }
    }

    /// Books `required` permits and returns the moment the caller may proceed.
    fn reserve_earliest_available(&mut self, required: f64, now_micros: i64) -> i64 {
        self.resync(now_micros);
        let moment_available = self.next_free_ticket_micros;
        let stored_to_spend = required.min(self.stored_permits);
        let fresh_permits = required - stored_to_spend;
        let wait_micros = saturated_add(
            self.stored_permits_to_wait_time(self.stored_permits, stored_to_spend),
            (fresh_permits * self.stable_interval_micros) as i64,
        );
        self.next_free_ticket_micros = saturated_add(self.next_free_ticket_micros, wait_micros);
        self.stored_permits -= stored_to_spend;
        moment_available
    }

    fn reserve_and_get_wait_length(&mut self, permits: u32, now_micros: i64) -> i64 {
        let moment_available = self.reserve_earliest_available(f64::from(permits), now_micros);
        (moment_available - now_micros).max(0)
    }

    fn can_acquire(&self, now_micros: i64, timeout_micros: i64) -> bool {
        self.next_free_ticket_micros.saturating_sub(timeout_micros) <= now_micros
    }
}

/// Thread-safe token-bucket limiter. Clones share one bucket.
#[derive(Clone)]
pub struct RateLimiter<C: Clock = SystemClock> {
    clock: C,
    inner: Arc<Mutex<RateLimiterState>>,
}

impl RateLimiter<SystemClock> {
    /// Stable-rate limiter that can bank up to one second of unused permits.
    pub fn new(permits_per_second: f64) -> Result<Self, AppError> {
        Self::bursty_with_clock(permits_per_second, 1.0, SystemClock::new())
    }

    /// Limiter that ramps from `3 x` the stable interval down to it over `warmup_period`.
    pub fn warming_up(permits_per_second: f64, warmup_period: Duration) -> Result<Self, AppError> {
        Self::warming_up_with_clock(
            permits_per_second,
            warmup_period,
            DEFAULT_COLD_FACTOR,
            SystemClock::new(),
        )
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn bursty_with_clock(
        permits_per_second: f64,
        max_burst_seconds: f64,
        clock: C,
    ) -> Result<Self, AppError> {
        if !(max_burst_seconds.is_finite() && max_burst_seconds >= 0.0) {
            return Err(AppError::InvalidArgument(format!(
                "max burst must be a non-negative number of seconds, got {max_burst_seconds}"
            )));
        }
        Self::build(
            permits_per_second,
            Smoothing::Bursty { max_burst_seconds },
            clock,
        )
    }

    pub fn warming_up_with_clock(
        permits_per_second: f64,
        warmup_period: Duration,
        cold_factor: f64,
        clock: C,
    ) -> Result<Self, AppError> {
        if !(cold_factor.is_finite() && cold_factor >= 1.0) {
            return Err(AppError::InvalidArgument(format!(
                "cold factor must be at least 1.0, got {cold_factor}"
            )));
        }
        Self::build(
            permits_per_second,
            Smoothing::WarmingUp {
                warmup_period_micros: duration_to_micros(warmup_period),
                cold_factor,
                slope: 0.0,
                threshold_permits: 0.0,
            },
            clock,
        )
    }

    fn build(permits_per_second: f64, smoothing: Smoothing, clock: C) -> Result<Self, AppError> {
        check_rate(permits_per_second)?;
        let mut state = RateLimiterState::new(smoothing);
        state.apply_rate(permits_per_second, clock.now_micros());
        Ok(Self {
            clock,
            inner: Arc::new(Mutex::new(state)),
        })
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, RateLimiterState> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Rate limiter recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Current stable rate in permits per second.
    pub fn rate(&self) -> f64 {
        MICROS_PER_SECOND / self.lock_inner().stable_interval_micros
    }

    /// Changes the stable rate. Waits already handed out are not affected.
    pub fn set_rate(&self, permits_per_second: f64) -> Result<(), AppError> {
        check_rate(permits_per_second)?;
        let now = self.clock.now_micros();
        self.lock_inner().apply_rate(permits_per_second, now);
        tracing::debug!(permits_per_second, "Rate limiter rate updated");
        Ok(())
    }

    /// Waits until `permits` are available and returns the seconds spent waiting.
    pub async fn acquire(&self, permits: u32) -> Result<f64, AppError> {
        check_permits(permits)?;
        let wait_micros = self.reserve(permits);
        if wait_micros > 0 {
            tracing::debug!(permits, wait_ms = wait_micros / 1000, "Waiting for permits");
        }
        self.clock.sleep_micros(wait_micros).await;
        Ok(wait_micros as f64 / MICROS_PER_SECOND)
    }

    /// Acquires `permits` only if they become available within `timeout`.
    ///
    /// Returns `false` straight away, without consuming anything, when the
    /// wait would exceed `timeout`.
    pub async fn try_acquire(&self, permits: u32, timeout: Duration) -> Result<bool, AppError> {
        check_permits(permits)?;
        let timeout_micros = duration_to_micros(timeout);
        let wait_micros = {
            let mut state = self.lock_inner();
            let now = self.clock.now_micros();
            if !state.can_acquire(now, timeout_micros) {
                return Ok(false);
            }
            state.reserve_and_get_wait_length(permits, now)
        };
        self.clock.sleep_micros(wait_micros).await;
        Ok(true)
    }

    fn reserve(&self, permits: u32) -> i64 {
        let mut state = self.lock_inner();
        let now = self.clock.now_micros();
        state.reserve_and_get_wait_length(permits, now)
    }
}

fn check_rate(permits_per_second: f64) -> Result<(), AppError> {
    if permits_per_second.is_finite() && permits_per_second > 0.0 {
        Ok(())
    } else {
        Err(AppError::InvalidArgument(format!(
            "rate must be a positive number of permits per second, got {permits_per_second}"
        )))
    }
}

fn check_permits(permits: u32) -> Result<(), AppError> {
    if permits == 0 {
        Err(AppError::InvalidArgument(
            "requested permits must be positive".into(),
        ))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ManualClock;

    fn assert_waits(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-3, "waits {actual:?} != {expected:?}");
        }
    }

    async fn acquire_n<C: Clock>(limiter: &RateLimiter<C>, n: usize) -> Vec<f64> {
        let mut waits = Vec::with_capacity(n);
        for _ in 0..n {
            waits.push(limiter.acquire(1).await.unwrap());
        }
        waits
    }

    #[tokio::test]
    async fn test_bursty_paces_at_stable_interval() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::bursty_with_clock(5.0, 1.0, clock.clone()).unwrap();

        let waits = acquire_n(&limiter, 3).await;
        assert_waits(&waits, &[0.0, 0.2, 0.2]);
        assert_eq!(clock.now_micros(), 400_000);
    }

    #[tokio::test]
    async fn test_bursty_banks_idle_permits_up_to_one_second() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::bursty_with_clock(5.0, 1.0, clock.clone()).unwrap();
        acquire_n(&limiter, 3).await;

        clock.advance(Duration::from_secs(2));

        // Five banked permits plus the already-free ticket, then stable pacing.
        let waits = acquire_n(&limiter, 7).await;
        assert_waits(&waits, &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.2]);
    }

    #[tokio::test]
    async fn test_warming_up_decays_to_stable_rate() {
        let clock = ManualClock::new();
        let limiter =
            RateLimiter::warming_up_with_clock(2.0, Duration::from_secs(4), 3.0, clock.clone())
                .unwrap();

        let waits = acquire_n(&limiter, 8).await;
        assert_waits(
            &waits,
            &[0.0, 1.375, 1.125, 0.875, 0.625, 0.5, 0.5, 0.5],
        );
    }

    #[tokio::test]
    async fn test_warming_up_cools_down_after_idle() {
        let clock = ManualClock::new();
        let limiter =
            RateLimiter::warming_up_with_clock(2.0, Duration::from_secs(4), 3.0, clock.clone())
                .unwrap();
        acquire_n(&limiter, 8).await;

        clock.advance(Duration::from_secs(60));
        let waits = acquire_n(&limiter, 2).await;
        assert_waits(&waits, &[0.0, 1.375]);
    }

    #[tokio::test]
    async fn test_zero_warmup_behaves_like_stable_rate() {
        let clock = ManualClock::new();
        let limiter =
            RateLimiter::warming_up_with_clock(4.0, Duration::ZERO, 3.0, clock.clone()).unwrap();
        let waits = acquire_n(&limiter, 3).await;
        assert_waits(&waits, &[0.0, 0.25, 0.25]);
    }

    #[tokio::test]
    async fn test_try_acquire_fails_fast_without_consuming() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::bursty_with_clock(1.0, 1.0, clock.clone()).unwrap();

        assert!(limiter.try_acquire(1, Duration::ZERO).await.unwrap());
        assert!(!limiter.try_acquire(1, Duration::ZERO).await.unwrap());
        assert!(!limiter.try_acquire(1, Duration::from_millis(500)).await.unwrap());
        assert_eq!(clock.now_micros(), 0);

        // The failed probes did not push the next ticket further out.
        assert!(limiter.try_acquire(1, Duration::from_secs(1)).await.unwrap());
        assert_eq!(clock.now_micros(), 1_000_000);
    }

    #[tokio::test]
    async fn test_set_rate_is_not_retroactive() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::bursty_with_clock(1.0, 1.0, clock.clone()).unwrap();

        acquire_n(&limiter, 1).await;
        limiter.set_rate(10.0).unwrap();
        assert!((limiter.rate() - 10.0).abs() < 1e-9);

        // The ticket booked at 1 permit/s still costs a full second.
        let waits = acquire_n(&limiter, 2).await;
        assert_waits(&waits, &[1.0, 0.1]);
    }

    #[test]
    fn test_reservation_saturates_instead_of_wrapping() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::bursty_with_clock(1e-12, 1.0, clock).unwrap();

        assert_eq!(limiter.reserve(1), 0);
        limiter.reserve(u32::MAX);
        assert_eq!(limiter.lock_inner().next_free_ticket_micros, i64::MAX);
        assert_eq!(limiter.reserve(1), i64::MAX);
        assert_eq!(limiter.lock_inner().next_free_ticket_micros, i64::MAX);
    }

    #[test]
    fn test_rejects_invalid_arguments() {
        let clock = ManualClock::new();
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let result = RateLimiter::bursty_with_clock(rate, 1.0, clock.clone());
            assert!(matches!(result, Err(AppError::InvalidArgument(_))));
        }
        assert!(matches!(
            RateLimiter::warming_up_with_clock(1.0, Duration::from_secs(1), 0.5, clock.clone()),
            Err(AppError::InvalidArgument(_))
        ));

        let limiter = RateLimiter::bursty_with_clock(1.0, 1.0, clock).unwrap();
        assert!(matches!(
            limiter.set_rate(-3.0),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_permits_is_rejected() {
        let limiter = RateLimiter::bursty_with_clock(1.0, 1.0, ManualClock::new()).unwrap();
        assert!(matches!(
            limiter.acquire(0).await,
            Err(AppError::InvalidArgument(_))
        ));
        assert!(matches!(
            limiter.try_acquire(0, Duration::ZERO).await,
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_acquires_at_two_per_second_take_one_and_a_half_seconds() {
        let limiter = RateLimiter::new(2.0).unwrap();
        let start = tokio::time::Instant::now();
        for _ in 0..4 {
            limiter.acquire(1).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_bucket() {
        let limiter = RateLimiter::new(10.0).unwrap();
        let start = tokio::time::Instant::now();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire(2).await.unwrap() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Ten permits at 10/s: the last caller waits for the first eight.
        assert!(start.elapsed() >= Duration::from_millis(800));
    }
}
