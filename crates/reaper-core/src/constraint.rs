//! "Wait until allowed to proceed" admission constraints.
//!
//! A constraint hands out at most one [`ConstraintGrant`] at a time. The
//! grant releases the constraint when dropped (or via
//! [`ConstraintGrant::release`]), so every exit path gives it back.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// An admission gate callers await before doing rate-limited work.
pub trait AwaitableConstraint: Send + Sync {
    /// Resolves once the caller may proceed, or fails with
    /// [`AppError::Cancelled`] if `cancel` fires first.
    fn wait_for_readiness<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ConstraintGrant, AppError>>;
}

/// Constraint handle shared between workers.
pub type SharedConstraint = Arc<dyn AwaitableConstraint>;

/// Scoped permission to proceed. Dropping it frees the constraint.
#[must_use = "dropping the grant releases the constraint immediately"]
pub struct ConstraintGrant {
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl ConstraintGrant {
    pub fn new(on_release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_release: Some(Box::new(on_release)),
        }
    }

    /// Releases the constraint now rather than at end of scope.
    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            on_release();
        }
    }
}

impl Drop for ConstraintGrant {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for ConstraintGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstraintGrant")
            .field("released", &self.on_release.is_none())
            .finish()
    }
}

/// Combines two constraints into one that grants only when both do.
///
/// Composing a constraint with itself returns it unchanged.
pub fn compose(first: SharedConstraint, second: SharedConstraint) -> SharedConstraint {
    if Arc::ptr_eq(&first, &second) {
        return first;
    }
    Arc::new(ComposedConstraint::new(first, second))
}

/// Both children are awaited concurrently under a composition lock.
pub struct ComposedConstraint {
    first: SharedConstraint,
    second: SharedConstraint,
    lock: Arc<Semaphore>,
}

impl ComposedConstraint {
    pub fn new(first: SharedConstraint, second: SharedConstraint) -> Self {
        Self {
            first,
            second,
            lock: Arc::new(Semaphore::new(1)),
        }
    }
}

impl AwaitableConstraint for ComposedConstraint {
    fn wait_for_readiness<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ConstraintGrant, AppError>> {
        Box::pin(async move {
            let permit = tokio::select! {
                permit = self.lock.clone().acquire_owned() => {
                    permit.map_err(|_| AppError::Generic("composition lock closed".into()))?
                }
                () = cancel.cancelled() => return Err(AppError::Cancelled),
            };

            let finished = AtomicUsize::new(0);
            let ordered = |constraint: &'a SharedConstraint| {
                let finished = &finished;
                async move {
                    let grant = constraint.wait_for_readiness(cancel).await?;
                    Ok::<_, AppError>((finished.fetch_add(1, Ordering::SeqCst), grant))
                }
            };

            // On error the sibling's grant (if any) is dropped here, and the
            // composition lock goes with `permit`.
            let (a, b) = futures::future::try_join(ordered(&self.first), ordered(&self.second))
                .await?;
            let (earlier, later) = if a.0 <= b.0 { (a.1, b.1) } else { (b.1, a.1) };

            Ok(ConstraintGrant::new(move || {
                drop(earlier);
                drop(later);
                drop(permit);
            }))
        })
    }
}
