use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{BlogIdentity, ProgressSink, WorkItem};
use crate::pause::PauseToken;

/// A crawl target as seen by the scheduler: identity and bookkeeping flags.
///
/// The scheduler never reads content through this trait.
pub trait Blog: Send + Sync {
    fn identity(&self) -> BlogIdentity;

    fn is_dirty(&self) -> bool;

    fn set_dirty(&self, dirty: bool);

    fn is_online(&self) -> bool;

    fn set_online(&self, online: bool);

    fn download_location(&self) -> PathBuf;

    /// Persists the blog's own state. Called for dirty blogs at shutdown.
    fn save(&self) -> Result<(), AppError>;
}

/// Site-specific crawler for one blog.
pub trait Downloader: Send + Sync + 'static {
    /// Short liveness probe. `Ok(false)` means the blog is gone or offline;
    /// an `Err` is a probe failure, which may be transient.
    fn is_reachable(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Crawls the blog, reporting progress and honouring both tokens at its
    /// own suspension points. Returns [`AppError::Cancelled`] when `cancel` fires.
    fn crawl(
        &self,
        progress: ProgressSink,
        cancel: CancellationToken,
        pause: PauseToken,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Builds the downloader matching a work item's site family.
pub trait DownloaderFactory: Send + Sync + Clone + 'static {
    type Downloader: Downloader;

    fn create(&self, item: &WorkItem) -> Result<Self::Downloader, AppError>;
}
