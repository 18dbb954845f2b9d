//! Per-request admission shared by every downloader.
//!
//! A [`RequestThrottle`] combines an optional [`SharedConstraint`] (e.g. "100
//! requests per minute") with an optional token-bucket [`RateLimiter`]. Each
//! outbound request first waits for the constraint, then for a limiter permit.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use reaper_core::count_interval::CountByIntervalConstraint;
//! use reaper_core::rate_limiter::RateLimiter;
//! use reaper_core::throttle::RequestThrottle;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), reaper_core::AppError> {
//! let throttle = RequestThrottle::new()
//!     .with_constraint(Arc::new(CountByIntervalConstraint::new(90, Duration::from_secs(60))?))
//!     .with_rate_limiter(RateLimiter::new(2.0)?);
//!
//! let cancel = CancellationToken::new();
//! let body = throttle
//!     .run(&cancel, async { Ok::<_, reaper_core::AppError>("page".to_string()) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::constraint::{ConstraintGrant, SharedConstraint, compose};
use crate::error::AppError;
use crate::rate_limiter::RateLimiter;

/// Admission gate for outbound requests. Clones share the same limits.
#[derive(Clone)]
pub struct RequestThrottle<C: Clock = SystemClock> {
    constraint: Option<SharedConstraint>,
    limiter: Option<RateLimiter<C>>,
}

impl RequestThrottle<SystemClock> {
    /// A throttle with no limits; `admit` returns immediately.
    pub fn new() -> Self {
        Self {
            constraint: None,
            limiter: None,
        }
    }
}

impl Default for RequestThrottle<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> RequestThrottle<C> {
    /// Adds a constraint; a second call composes it with the first.
    pub fn with_constraint(mut self, constraint: SharedConstraint) -> Self {
        self.constraint = Some(match self.constraint.take() {
            Some(existing) => compose(existing, constraint),
            None => constraint,
        });
        self
    }

    pub fn with_rate_limiter<D: Clock>(self, limiter: RateLimiter<D>) -> RequestThrottle<D> {
        RequestThrottle {
            constraint: self.constraint,
            limiter: Some(limiter),
        }
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter<C>> {
        self.limiter.as_ref()
    }

    pub fn is_unlimited(&self) -> bool {
        self.constraint.is_none() && self.limiter.is_none()
    }

    /// Waits for admission. Keep the returned grant alive while the request
    /// runs; dropping it frees the constraint for the next caller.
    pub async fn admit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ConstraintGrant>, AppError> {
        let grant = match &self.constraint {
            Some(constraint) => Some(constraint.wait_for_readiness(cancel).await?),
            None => None,
        };

        if let Some(limiter) = &self.limiter {
            tokio::select! {
                waited = limiter.acquire(1) => {
                    let waited = waited?;
                    if waited > 0.0 {
                        tracing::debug!(wait_ms = (waited * 1000.0) as u64, "Request throttled");
                    }
                }
                () = cancel.cancelled() => return Err(AppError::Cancelled),
            }
        }

        Ok(grant)
    }

    /// Runs `operation` once admitted, holding the grant until it finishes.
    pub async fn run<T, Fut>(&self, cancel: &CancellationToken, operation: Fut) -> Result<T, AppError>
    where
        Fut: Future<Output = Result<T, AppError>>,
    {
        let _grant = self.admit(cancel).await?;
        operation.await
    }
}
