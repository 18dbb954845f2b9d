//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! Shared state sits behind `Arc<Mutex<_>>` or atomics so tests can assert
//! on recorded calls after handing a clone to the code under test.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::constraint::{AwaitableConstraint, ConstraintGrant};
use crate::error::AppError;
use crate::models::{BlogIdentity, BlogKind, ProgressSink, WorkItem};
use crate::pause::PauseToken;
use crate::scheduler::{SchedulerEvent, SchedulerReporter};
use crate::traits::{Blog, Downloader, DownloaderFactory};
use crate::util::duration_to_micros;

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock that only moves when told to. `sleep` advances it instantly.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now
            .fetch_add(duration_to_micros(duration), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

// ---------------------------------------------------------------------------
// MockConstraint
// ---------------------------------------------------------------------------

/// Constraint that grants when its gate is open, counting grants and releases.
pub struct MockConstraint {
    gate: watch::Sender<bool>,
    fail: bool,
    granted: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    release_log: Option<(&'static str, Arc<Mutex<Vec<&'static str>>>)>,
}

impl MockConstraint {
    fn build(open: bool, fail: bool) -> Self {
        let (gate, _) = watch::channel(open);
        Self {
            gate,
            fail,
            granted: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
            release_log: None,
        }
    }

    /// Appends `id` to `log` whenever one of this constraint's grants is released.
    pub fn with_release_log(mut self, id: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Self {
        self.release_log = Some((id, log));
        self
    }

    /// Grants immediately.
    pub fn ready() -> Self {
        Self::build(true, false)
    }

    /// Blocks until [`MockConstraint::open`] is called.
    pub fn gated() -> Self {
        Self::build(false, false)
    }

    /// Always fails with [`AppError::Generic`].
    pub fn failing() -> Self {
        Self::build(true, true)
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn granted(&self) -> usize {
        self.granted.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl AwaitableConstraint for MockConstraint {
    fn wait_for_readiness<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ConstraintGrant, AppError>> {
        Box::pin(async move {
            if self.fail {
                return Err(AppError::Generic("constraint failed".into()));
            }
            let mut gate = self.gate.subscribe();
            tokio::select! {
                opened = gate.wait_for(|open| *open) => {
                    opened.map_err(|_| AppError::Generic("gate dropped".into()))?;
                }
                () = cancel.cancelled() => return Err(AppError::Cancelled),
            }

            self.granted.fetch_add(1, Ordering::SeqCst);
            let released = self.released.clone();
            let release_log = self.release_log.clone();
            Ok(ConstraintGrant::new(move || {
                released.fetch_add(1, Ordering::SeqCst);
                if let Some((id, log)) = release_log {
                    log.lock().unwrap().push(id);
                }
            }))
        })
    }
}

// ---------------------------------------------------------------------------
// MockBlog
// ---------------------------------------------------------------------------

/// In-memory blog that counts saves.
pub struct MockBlog {
    identity: BlogIdentity,
    dirty: AtomicBool,
    online: AtomicBool,
    saves: AtomicUsize,
    fail_save: bool,
}

impl MockBlog {
    pub fn new(name: &str, kind: BlogKind) -> Self {
        Self {
            identity: BlogIdentity::new(name, kind),
            dirty: AtomicBool::new(false),
            online: AtomicBool::new(true),
            saves: AtomicUsize::new(0),
            fail_save: false,
        }
    }

    pub fn shared(name: &str, kind: BlogKind) -> Arc<Self> {
        Arc::new(Self::new(name, kind))
    }

    pub fn failing_save(name: &str, kind: BlogKind) -> Arc<Self> {
        Arc::new(Self {
            fail_save: true,
            ..Self::new(name, kind)
        })
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl Blog for MockBlog {
    fn identity(&self) -> BlogIdentity {
        self.identity.clone()
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn download_location(&self) -> PathBuf {
        PathBuf::from("/tmp").join(&self.identity.name)
    }

    fn save(&self) -> Result<(), AppError> {
        if self.fail_save {
            return Err(AppError::StorageError("disk full".into()));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A Tumblr work item backed by a fresh [`MockBlog`].
pub fn make_item(name: &str) -> WorkItem {
    WorkItem::new(MockBlog::shared(name, BlogKind::Tumblr))
}

// ---------------------------------------------------------------------------
// MockDownloaderFactory / MockDownloader
// ---------------------------------------------------------------------------

/// Scripted liveness probe result.
#[derive(Debug, Clone, Copy)]
pub enum MockProbe {
    Reachable,
    Offline,
    /// Retryable network error.
    Transient,
    /// Permanent HTTP error.
    Fatal,
    /// Never answers; the scheduler's probe timeout fires.
    Hang,
}

/// Scripted crawl behaviour.
#[derive(Debug, Clone, Copy)]
pub enum MockCrawl {
    Succeed(Duration),
    /// Runs until [`MockDownloaderFactory::release`] is called for the blog.
    Gated,
    Fail,
    Panic,
}

#[derive(Default)]
struct MockRecord {
    scripts: HashMap<String, (MockProbe, MockCrawl)>,
    gates: HashMap<String, Arc<Semaphore>>,
    probes: HashMap<String, usize>,
    started: Vec<String>,
    completed: Vec<String>,
    cancelled: Vec<String>,
}

/// Factory whose downloaders follow per-blog scripts and record every call.
/// Unscripted blogs are reachable and succeed immediately.
#[derive(Clone, Default)]
pub struct MockDownloaderFactory {
    record: Arc<Mutex<MockRecord>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl MockDownloaderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, name: &str, probe: MockProbe, crawl: MockCrawl) {
        self.record
            .lock()
            .unwrap()
            .scripts
            .insert(name.to_string(), (probe, crawl));
    }

    /// Lets one gated crawl of `name` finish.
    pub fn release(&self, name: &str) {
        self.gate(name).add_permits(1);
    }

    pub fn probes(&self, name: &str) -> usize {
        self.record
            .lock()
            .unwrap()
            .probes
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Names whose crawl started, sorted.
    pub fn started(&self) -> Vec<String> {
        sorted(&self.record.lock().unwrap().started)
    }

    pub fn completed(&self) -> Vec<String> {
        sorted(&self.record.lock().unwrap().completed)
    }

    pub fn cancelled(&self) -> Vec<String> {
        sorted(&self.record.lock().unwrap().cancelled)
    }

    /// Highest number of crawls observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn gate(&self, name: &str) -> Arc<Semaphore> {
        self.record
            .lock()
            .unwrap()
            .gates
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }
}

fn sorted(names: &[String]) -> Vec<String> {
    let mut names = names.to_vec();
    names.sort();
    names
}

impl DownloaderFactory for MockDownloaderFactory {
    type Downloader = MockDownloader;

    fn create(&self, item: &WorkItem) -> Result<MockDownloader, AppError> {
        let name = item.name().to_string();
        let script = self
            .record
            .lock()
            .unwrap()
            .scripts
            .get(&name)
            .copied()
            .unwrap_or((MockProbe::Reachable, MockCrawl::Succeed(Duration::ZERO)));
        Ok(MockDownloader {
            gate: self.gate(&name),
            name,
            probe: script.0,
            crawl: script.1,
            factory: self.clone(),
        })
    }
}

pub struct MockDownloader {
    name: String,
    probe: MockProbe,
    crawl: MockCrawl,
    gate: Arc<Semaphore>,
    factory: MockDownloaderFactory,
}

impl MockDownloader {
    fn record(&self, f: impl FnOnce(&mut MockRecord)) {
        f(&mut self.factory.record.lock().unwrap());
    }

    async fn run_script(&self, cancel: &CancellationToken, pause: &PauseToken) -> Result<(), AppError> {
        match self.crawl {
            MockCrawl::Succeed(duration) => {
                pause.wait_while_paused_with_ack().await;
                tokio::select! {
                    () = tokio::time::sleep(duration) => Ok(()),
                    () = cancel.cancelled() => Err(AppError::Cancelled),
                }
            }
            MockCrawl::Gated => loop {
                tokio::select! {
                    permit = self.gate.acquire() => {
                        permit.map_err(|_| AppError::Generic("gate closed".into()))?.forget();
                        return Ok(());
                    }
                    () = pause.paused() => pause.wait_while_paused_with_ack().await,
                    () = cancel.cancelled() => return Err(AppError::Cancelled),
                }
            },
            MockCrawl::Fail => Err(AppError::DownloadError("scripted failure".into())),
            MockCrawl::Panic => panic!("scripted downloader panic"),
        }
    }
}

impl Downloader for MockDownloader {
    async fn is_reachable(&self, _timeout: Duration) -> Result<bool, AppError> {
        self.record(|r| *r.probes.entry(self.name.clone()).or_default() += 1);
        match self.probe {
            MockProbe::Reachable => Ok(true),
            MockProbe::Offline => Ok(false),
            MockProbe::Transient => Err(AppError::NetworkError("connection reset".into())),
            MockProbe::Fatal => Err(AppError::HttpError("HTTP 404 not found".into())),
            MockProbe::Hang => std::future::pending().await,
        }
    }

    async fn crawl(
        &self,
        progress: ProgressSink,
        cancel: CancellationToken,
        pause: PauseToken,
    ) -> Result<(), AppError> {
        self.record(|r| r.started.push(self.name.clone()));
        let running = self.factory.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.factory.max_running.fetch_max(running, Ordering::SeqCst);
        progress.report(10);

        let result = self.run_script(&cancel, &pause).await;

        self.factory.running.fetch_sub(1, Ordering::SeqCst);
        match &result {
            Ok(()) => {
                progress.report(100);
                self.record(|r| r.completed.push(self.name.clone()));
            }
            Err(e) if e.is_cancelled() => self.record(|r| r.cancelled.push(self.name.clone())),
            Err(_) => {}
        }
        result
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records event labels, e.g. `"Completed:a"`.
#[derive(Clone, Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == label)
            .count()
    }
}

impl SchedulerReporter for MockReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        let label = match event {
            SchedulerEvent::Started { .. } => "Started".to_string(),
            SchedulerEvent::WorkerStarted { .. } => "WorkerStarted".to_string(),
            SchedulerEvent::Claimed { item, .. } => format!("Claimed:{}", item.name()),
            SchedulerEvent::Skipped { item, reason, .. } => {
                format!("Skipped:{}:{}", item.name(), reason)
            }
            SchedulerEvent::Progress { item, percent } => {
                format!("Progress:{}:{}", item.name(), percent)
            }
            SchedulerEvent::Completed { item, .. } => format!("Completed:{}", item.name()),
            SchedulerEvent::Failed { item, .. } => format!("Failed:{}", item.name()),
            SchedulerEvent::ItemCancelled { item, .. } => {
                format!("ItemCancelled:{}", item.name())
            }
            SchedulerEvent::Paused => "Paused".to_string(),
            SchedulerEvent::Resumed => "Resumed".to_string(),
            SchedulerEvent::Stopping { .. } => "Stopping".to_string(),
            SchedulerEvent::WorkerStopped { .. } => "WorkerStopped".to_string(),
            SchedulerEvent::Stopped { .. } => "Stopped".to_string(),
            SchedulerEvent::Saved { .. } => "Saved".to_string(),
            SchedulerEvent::SaveFailed { .. } => "SaveFailed".to_string(),
        };
        self.events.lock().unwrap().push(label);
    }
}
