pub mod clock;
pub mod constraint;
pub mod count_interval;
pub mod error;
pub mod models;
pub mod pause;
pub mod queue;
pub mod rate_limiter;
pub mod scheduler;
pub mod throttle;
pub mod traits;
pub mod util;

#[cfg(test)]
mod testutil;

pub use clock::{Clock, SystemClock};
pub use constraint::{AwaitableConstraint, ConstraintGrant, SharedConstraint, compose};
pub use count_interval::CountByIntervalConstraint;
pub use error::AppError;
pub use models::{BlogIdentity, BlogKind, ProgressSink, WorkItem};
pub use pause::{PausePhase, PauseSignal, PauseToken};
pub use queue::{QueueEvent, QueueManager};
pub use rate_limiter::RateLimiter;
pub use scheduler::{
    Command, CrawlScheduler, SchedulerConfig, SchedulerEvent, SchedulerReporter,
    SchedulerSnapshot, SchedulerState, TracingSchedulerReporter,
};
pub use throttle::RequestThrottle;
pub use traits::{Blog, Downloader, DownloaderFactory};
