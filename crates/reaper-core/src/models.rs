use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::traits::Blog;

/// Site family a blog belongs to; selects the downloader implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlogKind {
    Tumblr,
    TumblrHidden,
    TumblrSearch,
    TumblrTagSearch,
    Twitter,
    Bluesky,
    Generic,
}

impl BlogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlogKind::Tumblr => "tumblr",
            BlogKind::TumblrHidden => "tumblrhidden",
            BlogKind::TumblrSearch => "tumblrsearch",
            BlogKind::TumblrTagSearch => "tumblrtagsearch",
            BlogKind::Twitter => "twitter",
            BlogKind::Bluesky => "bluesky",
            BlogKind::Generic => "generic",
        }
    }
}

impl fmt::Display for BlogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BlogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tumblr" => Ok(BlogKind::Tumblr),
            "tumblrhidden" => Ok(BlogKind::TumblrHidden),
            "tumblrsearch" => Ok(BlogKind::TumblrSearch),
            "tumblrtagsearch" => Ok(BlogKind::TumblrTagSearch),
            "twitter" => Ok(BlogKind::Twitter),
            "bluesky" => Ok(BlogKind::Bluesky),
            "generic" => Ok(BlogKind::Generic),
            _ => Err(format!("Unknown blog kind: {}", s)),
        }
    }
}

/// Identity of a crawl target: name plus site family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlogIdentity {
    pub name: String,
    pub kind: BlogKind,
}

impl BlogIdentity {
    pub fn new(name: impl Into<String>, kind: BlogKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for BlogIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

/// A queued crawl target plus its in-flight progress.
///
/// Clones share the blog and the progress counter. Equality is by identity.
#[derive(Clone)]
pub struct WorkItem {
    blog: Arc<dyn Blog>,
    identity: BlogIdentity,
    progress: Arc<AtomicU8>,
    enqueued_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(blog: Arc<dyn Blog>) -> Self {
        let identity = blog.identity();
        Self {
            blog,
            identity,
            progress: Arc::new(AtomicU8::new(0)),
            enqueued_at: Utc::now(),
        }
    }

    pub fn blog(&self) -> &Arc<dyn Blog> {
        &self.blog
    }

    pub fn identity(&self) -> &BlogIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Percentage complete, 0-100.
    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn set_progress(&self, percent: u8) {
        self.progress.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for WorkItem {}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("identity", &self.identity)
            .field("progress", &self.progress())
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

type ProgressListener = Arc<dyn Fn(&WorkItem, u8) + Send + Sync>;

/// Progress channel handed to a downloader.
///
/// Every report updates the work item; the listener is called at most once
/// per `interval`, plus always for 100%.
pub struct ProgressSink {
    item: WorkItem,
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
    listener: Option<ProgressListener>,
}

impl ProgressSink {
    pub fn new(item: WorkItem, interval: Duration) -> Self {
        Self {
            item,
            interval,
            last_emit: Mutex::new(None),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: impl Fn(&WorkItem, u8) + Send + Sync + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        self.item.set_progress(percent);

        let Some(listener) = &self.listener else {
            return;
        };
        let due = {
            let mut last = self
                .last_emit
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let due = percent == 100 || last.is_none_or(|at| at.elapsed() >= self.interval);
            if due {
                *last = Some(Instant::now());
            }
            due
        };
        if due {
            listener(&self.item, percent);
        }
    }
}
