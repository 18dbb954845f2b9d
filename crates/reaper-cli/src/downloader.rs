use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reaper_core::error::AppError;
use reaper_core::models::{BlogIdentity, ProgressSink, WorkItem};
use reaper_core::pause::PauseToken;
use reaper_core::throttle::RequestThrottle;
use reaper_core::traits::{Blog, Downloader, DownloaderFactory};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::blog::FileBlog;

/// Builds [`HttpDownloader`]s for the blogs loaded from the queue file.
#[derive(Clone)]
pub struct HttpDownloaderFactory {
    client: Client,
    throttle: RequestThrottle,
    max_pages: u32,
    blogs: Arc<HashMap<BlogIdentity, Arc<FileBlog>>>,
}

impl HttpDownloaderFactory {
    pub fn new(
        throttle: RequestThrottle,
        max_pages: u32,
        blogs: impl IntoIterator<Item = Arc<FileBlog>>,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent("Blogreaper/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            throttle,
            max_pages: max_pages.max(1),
            blogs: Arc::new(blogs.into_iter().map(|b| (b.identity(), b)).collect()),
        })
    }
}

impl DownloaderFactory for HttpDownloaderFactory {
    type Downloader = HttpDownloader;

    fn create(&self, item: &WorkItem) -> Result<HttpDownloader, AppError> {
        let blog = self.blogs.get(item.identity()).cloned().ok_or_else(|| {
            AppError::InvalidArgument(format!("No downloader target for {}", item.identity()))
        })?;
        Ok(HttpDownloader {
            client: self.client.clone(),
            throttle: self.throttle.clone(),
            max_pages: self.max_pages,
            blog,
        })
    }
}

/// Walks a blog's index pages (`/`, `/page/2`, ...) and stores them on disk.
pub struct HttpDownloader {
    client: Client,
    throttle: RequestThrottle,
    max_pages: u32,
    blog: Arc<FileBlog>,
}

impl HttpDownloader {
    async fn fetch_page(&self, url: &Url, cancel: &CancellationToken) -> Result<Option<String>, AppError> {
        let request = async {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(map_reqwest_error)?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => response
                    .text()
                    .await
                    .map(Some)
                    .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}"))),
                status => Err(AppError::HttpError(format!(
                    "HTTP {} for {url}",
                    status.as_u16()
                ))),
            }
        };

        tokio::select! {
            result = self.throttle.run(cancel, request) => result,
            () = cancel.cancelled() => Err(AppError::Cancelled),
        }
    }
}

impl Downloader for HttpDownloader {
    /// Sends a single HEAD request. It is not admitted through the throttle,
    /// so `timeout` bounds only the request itself.
    async fn is_reachable(&self, timeout: Duration) -> Result<bool, AppError> {
        let response = self
            .client
            .head(self.blog.url().clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(timeout)
                } else {
                    map_reqwest_error(e)
                }
            })?;
        classify_probe(response.status())
    }

    async fn crawl(
        &self,
        progress: ProgressSink,
        cancel: CancellationToken,
        pause: PauseToken,
    ) -> Result<(), AppError> {
        let location = self.blog.download_location();
        tokio::fs::create_dir_all(&location)
            .await
            .map_err(|e| AppError::StorageError(format!("{}: {e}", location.display())))?;

        for page in 1..=self.max_pages {
            tokio::select! {
                () = pause.wait_while_paused_with_ack() => {}
                () = cancel.cancelled() => return Err(AppError::Cancelled),
            }

            let url = page_url(self.blog.url(), page)?;
            let Some(body) = self.fetch_page(&url, &cancel).await? else {
                tracing::debug!(blog = %self.blog.identity(), %page, "No more pages");
                break;
            };

            let path = location.join(format!("page-{page}.html"));
            tokio::fs::write(&path, body)
                .await
                .map_err(|e| AppError::StorageError(format!("{}: {e}", path.display())))?;
            self.blog.record_page();
            progress.report(percent(page, self.max_pages));
        }

        self.blog.mark_crawled();
        progress.report(100);
        Ok(())
    }
}

/// Maps a probe response to online/offline. Throttling and server errors are
/// transient, so the blog is retried on a later pass.
fn classify_probe(status: StatusCode) -> Result<bool, AppError> {
    if status.is_success() || status.is_redirection() {
        Ok(true)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(AppError::NetworkError(format!("HTTP {}", status.as_u16())))
    } else {
        Ok(false)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> AppError {
    if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else if e.is_timeout() {
        AppError::NetworkError(format!("Request timeout: {e}"))
    } else {
        AppError::HttpError(e.to_string())
    }
}

fn page_url(base: &Url, page: u32) -> Result<Url, AppError> {
    if page <= 1 {
        return Ok(base.clone());
    }
    base.join(&format!("page/{page}"))
        .map_err(|e| AppError::InvalidArgument(format!("Bad page url for {base}: {e}")))
}

fn percent(page: u32, max_pages: u32) -> u8 {
    (u64::from(page) * 100 / u64::from(max_pages.max(1))).min(100) as u8
}
