//! Crawl scheduler: a fixed pool of worker loops draining the blog queue.
//!
//! # States
//!
//! ```text
//! IDLE --start--> CRAWLING --pause--> PAUSED
//!   ^                |  ^               |
//!   |                |  +----resume-----+
//!   |               stop               stop
//!   |                v                  |
//!   +---------- STOPPING <--------------+
//! ```
//!
//! Queue and active-set bookkeeping lives behind one mutex (the "book").
//! Workers take it only for short synchronous sections and never hold it
//! across an `.await`.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{BlogIdentity, ProgressSink, WorkItem};
use crate::pause::{PauseSignal, PauseToken};
use crate::queue::{QueueEvent, QueueManager};
use crate::traits::{Blog, Downloader, DownloaderFactory};

/// Pool settings, snapshotted at every `start`.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of concurrent worker loops.
    pub parallelism: usize,
    /// Upper bound on a single liveness probe.
    pub probe_timeout: Duration,
    /// Back-off when there is nothing to claim or a probe failed transiently.
    pub idle_interval: Duration,
    /// Minimum spacing between progress events per item.
    pub progress_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallelism: 3,
            probe_timeout: Duration::from_secs(4),
            idle_interval: Duration::from_secs(4),
            progress_interval: Duration::from_millis(500),
        }
    }
}

impl SchedulerConfig {
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.parallelism == 0 {
            return Err(AppError::InvalidArgument(
                "parallelism must be at least 1".into(),
            ));
        }
        if self.probe_timeout.is_zero() {
            return Err(AppError::InvalidArgument(
                "probe timeout must be positive".into(),
            ));
        }
        if self.idle_interval.is_zero() {
            return Err(AppError::InvalidArgument(
                "idle interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Pool-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Crawling,
    Paused,
    Stopping,
}

impl SchedulerState {
    /// Command guard: whether `command` may run in this state.
    pub fn can_execute(self, command: Command) -> bool {
        match command {
            Command::Start => self == SchedulerState::Idle,
            Command::Pause => self == SchedulerState::Crawling,
            Command::Resume => self == SchedulerState::Paused,
            Command::Stop => matches!(self, SchedulerState::Crawling | SchedulerState::Paused),
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "idle"),
            SchedulerState::Crawling => write!(f, "crawling"),
            SchedulerState::Paused => write!(f, "paused"),
            SchedulerState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Control-surface commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Pause,
    Resume,
    Stop,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start => write!(f, "start"),
            Command::Pause => write!(f, "pause"),
            Command::Resume => write!(f, "resume"),
            Command::Stop => write!(f, "stop"),
        }
    }
}

/// Why a claimed item was dropped without crawling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Probe reported the blog offline, or failed permanently. Dequeued.
    Offline,
    /// Another blog with the same name is already being crawled. Dequeued.
    DuplicateName,
    /// Probe failed transiently. Stays queued for a later pass.
    ProbeFailed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Offline => write!(f, "offline"),
            SkipReason::DuplicateName => write!(f, "duplicate-name"),
            SkipReason::ProbeFailed => write!(f, "probe-failed"),
        }
    }
}

/// Events emitted by the scheduler for monitoring/logging.
#[derive(Debug, Clone)]
pub enum SchedulerEvent<'a> {
    Started {
        run_id: Uuid,
        parallelism: usize,
    },
    WorkerStarted {
        worker: usize,
    },
    Claimed {
        worker: usize,
        item: &'a WorkItem,
    },
    Skipped {
        worker: usize,
        item: &'a WorkItem,
        reason: SkipReason,
        error: Option<&'a AppError>,
    },
    Progress {
        item: &'a WorkItem,
        percent: u8,
    },
    Completed {
        worker: usize,
        item: &'a WorkItem,
    },
    Failed {
        worker: usize,
        item: &'a WorkItem,
        error: &'a AppError,
    },
    ItemCancelled {
        worker: usize,
        item: &'a WorkItem,
    },
    Paused,
    Resumed,
    Stopping {
        in_flight: usize,
    },
    WorkerStopped {
        worker: usize,
    },
    Stopped {
        run_id: Uuid,
    },
    Saved {
        blog: &'a BlogIdentity,
    },
    SaveFailed {
        blog: &'a BlogIdentity,
        error: &'a AppError,
    },
}

/// Trait for receiving scheduler events (decoupled logging and UI updates).
pub trait SchedulerReporter: Send + Sync + 'static {
    fn report(&self, event: SchedulerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSchedulerReporter;

impl SchedulerReporter for TracingSchedulerReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        match event {
            SchedulerEvent::Started {
                run_id,
                parallelism,
            } => {
                tracing::info!(%run_id, %parallelism, "Crawl started");
            }
            SchedulerEvent::WorkerStarted { worker } => {
                tracing::debug!(%worker, "Worker started");
            }
            SchedulerEvent::Claimed { worker, item } => {
                tracing::info!(%worker, blog = %item.identity(), "Blog claimed");
            }
            SchedulerEvent::Skipped {
                worker,
                item,
                reason,
                error,
            } => match error {
                Some(error) => {
                    tracing::warn!(%worker, blog = %item.identity(), %reason, %error, "Blog skipped")
                }
                None => tracing::info!(%worker, blog = %item.identity(), %reason, "Blog skipped"),
            },
            SchedulerEvent::Progress { item, percent } => {
                tracing::debug!(blog = %item.identity(), %percent, "Crawl progress");
            }
            SchedulerEvent::Completed { worker, item } => {
                tracing::info!(%worker, blog = %item.identity(), "Blog crawl completed");
            }
            SchedulerEvent::Failed {
                worker,
                item,
                error,
            } => {
                tracing::warn!(%worker, blog = %item.identity(), %error, "Blog crawl failed");
            }
            SchedulerEvent::ItemCancelled { worker, item } => {
                tracing::info!(%worker, blog = %item.identity(), "Blog crawl cancelled");
            }
            SchedulerEvent::Paused => tracing::info!("Crawl paused"),
            SchedulerEvent::Resumed => tracing::info!("Crawl resumed"),
            SchedulerEvent::Stopping { in_flight } => {
                tracing::info!(%in_flight, "Crawl stopping");
            }
            SchedulerEvent::WorkerStopped { worker } => {
                tracing::debug!(%worker, "Worker stopped");
            }
            SchedulerEvent::Stopped { run_id } => {
                tracing::info!(%run_id, "Crawl stopped");
            }
            SchedulerEvent::Saved { blog } => {
                tracing::debug!(%blog, "Blog state saved");
            }
            SchedulerEvent::SaveFailed { blog, error } => {
                tracing::error!(%blog, %error, "Failed to save blog state");
            }
        }
    }
}

/// Point-in-time view of the scheduler for status displays.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub state: SchedulerState,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub queued: Vec<BlogIdentity>,
    /// In-flight blogs with their progress percentage.
    pub active: Vec<(BlogIdentity, u8)>,
}

/// Result of trying to claim work under the book lock.
enum Claim {
    Item(WorkItem, CancellationToken),
    DuplicateName(WorkItem),
    Nothing,
}

/// How an in-flight item ended.
enum Outcome {
    Completed,
    Dropped(SkipReason, Option<AppError>),
    Deferred(AppError),
    Failed(AppError),
    Cancelled,
}

/// Queue, active set, and per-item cancellation, guarded together.
struct CrawlBook {
    queue: QueueManager,
    active: Vec<WorkItem>,
    tokens: HashMap<BlogIdentity, CancellationToken>,
    /// Queued items whose last probe failed transiently, with the earliest
    /// instant they may be claimed again.
    deferred: HashMap<BlogIdentity, Instant>,
}

impl CrawlBook {
    fn is_active(&self, identity: &BlogIdentity) -> bool {
        self.active.iter().any(|a| a.identity() == identity)
    }

    fn is_deferred(&self, identity: &BlogIdentity, now: Instant) -> bool {
        self.deferred.get(identity).is_some_and(|until| *until > now)
    }

    /// Claims the lowest-index queued item that no worker holds and that is
    /// not waiting out a deferral.
    fn claim_next(&mut self, shutdown: &CancellationToken) -> Claim {
        let now = Instant::now();
        self.deferred.retain(|_, until| *until > now);

        let Some(item) = self
            .queue
            .items()
            .iter()
            .find(|item| !self.is_active(item.identity()) && !self.is_deferred(item.identity(), now))
            .cloned()
        else {
            return Claim::Nothing;
        };

        if self.active.iter().any(|a| a.name() == item.name()) {
            self.deferred.remove(item.identity());
            self.queue.remove(item.identity());
            return Claim::DuplicateName(item);
        }

        let token = shutdown.child_token();
        self.tokens.insert(item.identity().clone(), token.clone());
        self.active.push(item.clone());
        Claim::Item(item, token)
    }

    /// Releases a claim and applies what the outcome means for the queue entry.
    fn settle(&mut self, item: &WorkItem, settlement: Settlement) {
        self.active.retain(|a| a != item);
        self.tokens.remove(item.identity());
        match settlement {
            Settlement::Dequeue => {
                self.deferred.remove(item.identity());
                self.queue.remove(item.identity());
            }
            Settlement::RetryAt(until) if self.queue.contains(item.identity()) => {
                self.deferred.insert(item.identity().clone(), until);
            }
            Settlement::RetryAt(_) | Settlement::Keep => {}
        }
    }

    fn forget(&mut self, items: &[WorkItem]) {
        for item in items {
            self.deferred.remove(item.identity());
        }
    }
}

/// What happens to a queue entry once its claim is released.
enum Settlement {
    Dequeue,
    /// Stays queued but is skipped by claims until the given instant.
    RetryAt(Instant),
    Keep,
}

struct PoolRun {
    id: Uuid,
    started_at: DateTime<Utc>,
    shutdown: CancellationToken,
    workers: JoinSet<Result<(), AppError>>,
}

struct Control {
    state: SchedulerState,
    config: SchedulerConfig,
    run: Option<PoolRun>,
}

struct Shared<DF, R> {
    factory: DF,
    reporter: R,
    book: Mutex<CrawlBook>,
    control: Mutex<Control>,
    pause: PauseSignal,
    /// Blogs marked dirty during any run, saved on shutdown.
    dirty: Mutex<HashMap<BlogIdentity, Arc<dyn Blog>>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(lock = what, "Recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

/// Bounded pool of crawl workers with a start/pause/resume/stop control surface.
///
/// Clones share the same pool.
pub struct CrawlScheduler<DF, R = TracingSchedulerReporter>
where
    DF: DownloaderFactory,
    R: SchedulerReporter,
{
    shared: Arc<Shared<DF, R>>,
}

impl<DF, R> Clone for CrawlScheduler<DF, R>
where
    DF: DownloaderFactory,
    R: SchedulerReporter,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<DF: DownloaderFactory> CrawlScheduler<DF, TracingSchedulerReporter> {
    pub fn new(factory: DF, config: SchedulerConfig) -> Result<Self, AppError> {
        Self::with_reporter(factory, config, TracingSchedulerReporter)
    }
}

impl<DF, R> CrawlScheduler<DF, R>
where
    DF: DownloaderFactory,
    R: SchedulerReporter,
{
    pub fn with_reporter(factory: DF, config: SchedulerConfig, reporter: R) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                factory,
                reporter,
                book: Mutex::new(CrawlBook {
                    queue: QueueManager::new(),
                    active: Vec::new(),
                    tokens: HashMap::new(),
                    deferred: HashMap::new(),
                }),
                control: Mutex::new(Control {
                    state: SchedulerState::Idle,
                    config,
                    run: None,
                }),
                pause: PauseSignal::new(),
                dirty: Mutex::new(HashMap::new()),
            }),
        })
    }

    // -- configuration ------------------------------------------------------

    pub fn config(&self) -> SchedulerConfig {
        self.shared.control().config.clone()
    }

    /// Replaces the pool settings; they take effect at the next `start`.
    pub fn set_config(&self, config: SchedulerConfig) -> Result<(), AppError> {
        config.validate()?;
        self.shared.control().config = config;
        Ok(())
    }

    // -- queue --------------------------------------------------------------

    pub fn add_items(&self, items: impl IntoIterator<Item = WorkItem>) -> usize {
        self.shared.book().queue.add_items(items)
    }

    pub fn insert_items(&self, index: usize, items: impl IntoIterator<Item = WorkItem>) -> usize {
        self.shared.book().queue.insert_items(index, items)
    }

    /// Removes matching items from the queue, cancelling any that are in flight.
    pub fn remove_items(&self, predicate: impl FnMut(&WorkItem) -> bool) -> Vec<WorkItem> {
        let mut book = self.shared.book();
        let removed = book.queue.remove_items(predicate);
        for item in &removed {
            if let Some(token) = book.tokens.get(item.identity()) {
                token.cancel();
            }
        }
        book.forget(&removed);
        removed
    }

    /// Empties the queue, cancelling everything in flight.
    pub fn clear_items(&self) -> Vec<WorkItem> {
        let mut book = self.shared.book();
        for token in book.tokens.values() {
            token.cancel();
        }
        book.deferred.clear();
        book.queue.clear_items()
    }

    pub fn move_item(&self, from: usize, to: usize) -> bool {
        self.shared.book().queue.move_item(from, to)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.book().queue.subscribe()
    }

    pub fn queued(&self) -> Vec<WorkItem> {
        self.shared.book().queue.snapshot()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.book().queue.len()
    }

    pub fn active(&self) -> Vec<WorkItem> {
        self.shared.book().active.clone()
    }

    // -- control surface ----------------------------------------------------

    pub fn state(&self) -> SchedulerState {
        self.shared.control().state
    }

    pub fn can_execute(&self, command: Command) -> bool {
        self.state().can_execute(command)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let (state, run_id, started_at) = {
            let control = self.shared.control();
            let run = control.run.as_ref();
            (
                control.state,
                run.map(|r| r.id),
                run.map(|r| r.started_at),
            )
        };
        let book = self.shared.book();
        SchedulerSnapshot {
            state,
            run_id,
            started_at,
            queued: book
                .queue
                .items()
                .iter()
                .map(|i| i.identity().clone())
                .collect(),
            active: book
                .active
                .iter()
                .map(|i| (i.identity().clone(), i.progress()))
                .collect(),
        }
    }

    /// Spawns the worker pool. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), AppError> {
        let mut control = self.shared.control();
        ensure_allowed(control.state, Command::Start)?;
        // A pause left over from the previous run must not hold the new pool.
        self.shared.pause.resume();

        let config = control.config.clone();
        let shutdown = CancellationToken::new();
        let run_id = Uuid::new_v4();
        let mut workers = JoinSet::new();
        for worker in 0..config.parallelism {
            let shared = self.shared.clone();
            let config = config.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { shared.worker_loop(worker, config, shutdown).await });
        }

        control.run = Some(PoolRun {
            id: run_id,
            started_at: Utc::now(),
            shutdown,
            workers,
        });
        control.state = SchedulerState::Crawling;
        drop(control);

        self.shared.reporter.report(SchedulerEvent::Started {
            run_id,
            parallelism: config.parallelism,
        });
        Ok(())
    }

    /// Pauses the pool and waits until a worker has acknowledged the pause.
    pub async fn pause(&self) -> Result<(), AppError> {
        // Armed under the control lock so a concurrent stop either rejects
        // the pause or observes it and resumes the signal.
        let ack = {
            let control = self.shared.control();
            ensure_allowed(control.state, Command::Pause)?;
            self.shared.pause.pause_with_ack()
        };
        ack.await;

        let mut control = self.shared.control();
        match control.state {
            SchedulerState::Crawling if self.shared.pause.is_paused() => {
                control.state = SchedulerState::Paused;
                drop(control);
                self.shared.reporter.report(SchedulerEvent::Paused);
                Ok(())
            }
            SchedulerState::Paused => Ok(()),
            state => Err(AppError::InvalidState(format!(
                "pause interrupted; scheduler is {state}"
            ))),
        }
    }

    pub fn resume(&self) -> Result<(), AppError> {
        let mut control = self.shared.control();
        ensure_allowed(control.state, Command::Resume)?;
        self.shared.pause.resume();
        control.state = SchedulerState::Crawling;
        drop(control);
        self.shared.reporter.report(SchedulerEvent::Resumed);
        Ok(())
    }

    /// Cancels in-flight items and waits for every worker loop to exit.
    ///
    /// Cancelled items leave the active set but stay queued.
    pub async fn stop(&self) -> Result<(), AppError> {
        let run = {
            let mut control = self.shared.control();
            ensure_allowed(control.state, Command::Stop)?;
            control.state = SchedulerState::Stopping;
            control.run.take()
        };

        // Paused workers must wake up to observe cancellation.
        self.shared.pause.resume();

        let in_flight = {
            let mut book = self.shared.book();
            let in_flight = book.tokens.len();
            for (_, token) in book.tokens.drain() {
                token.cancel();
            }
            book.deferred.clear();
            in_flight
        };
        self.shared
            .reporter
            .report(SchedulerEvent::Stopping { in_flight });

        let run_id = match run {
            Some(mut run) => {
                run.shutdown.cancel();
                while let Some(joined) = run.workers.join_next().await {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) if e.is_cancelled() => {}
                        Ok(Err(e)) => tracing::warn!(error = %e, "Worker exited with error"),
                        Err(e) => tracing::error!(error = %e, "Worker task panicked"),
                    }
                }
                Some(run.id)
            }
            None => None,
        };

        self.shared.control().state = SchedulerState::Idle;
        if let Some(run_id) = run_id {
            self.shared.reporter.report(SchedulerEvent::Stopped { run_id });
        }
        Ok(())
    }

    /// Stops the pool if running, then saves every blog still marked dirty.
    /// Returns how many blogs were saved.
    pub async fn shutdown(&self) -> Result<usize, AppError> {
        if self.can_execute(Command::Stop) {
            self.stop().await?;
        }

        let dirty: Vec<(BlogIdentity, Arc<dyn Blog>)> =
            lock(&self.shared.dirty, "dirty").drain().collect();
        let mut saved = 0;
        for (identity, blog) in dirty {
            if !blog.is_dirty() {
                continue;
            }
            match blog.save() {
                Ok(()) => {
                    blog.set_dirty(false);
                    saved += 1;
                    self.shared
                        .reporter
                        .report(SchedulerEvent::Saved { blog: &identity });
                }
                Err(error) => {
                    self.shared.reporter.report(SchedulerEvent::SaveFailed {
                        blog: &identity,
                        error: &error,
                    });
                }
            }
        }
        Ok(saved)
    }
}

fn ensure_allowed(state: SchedulerState, command: Command) -> Result<(), AppError> {
    if state.can_execute(command) {
        Ok(())
    } else {
        Err(AppError::InvalidState(format!(
            "cannot {command} while {state}"
        )))
    }
}

impl<DF, R> Shared<DF, R>
where
    DF: DownloaderFactory,
    R: SchedulerReporter,
{
    fn book(&self) -> MutexGuard<'_, CrawlBook> {
        lock(&self.book, "book")
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        lock(&self.control, "control")
    }

    /// Runs until `shutdown` fires, then returns [`AppError::Cancelled`].
    async fn worker_loop(
        self: Arc<Self>,
        worker: usize,
        config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Result<(), AppError> {
        self.reporter.report(SchedulerEvent::WorkerStarted { worker });
        let pause = self.pause.token();

        let result = loop {
            if shutdown.is_cancelled() {
                break Err(AppError::Cancelled);
            }

            if pause.is_paused() {
                tokio::select! {
                    () = pause.wait_while_paused_with_ack() => {}
                    () = shutdown.cancelled() => break Err(AppError::Cancelled),
                }
                continue;
            }

            let claim = self.book().claim_next(&shutdown);
            let back_off = match claim {
                Claim::Nothing => true,
                Claim::DuplicateName(item) => {
                    self.reporter.report(SchedulerEvent::Skipped {
                        worker,
                        item: &item,
                        reason: SkipReason::DuplicateName,
                        error: None,
                    });
                    false
                }
                Claim::Item(item, cancel) => {
                    self.reporter
                        .report(SchedulerEvent::Claimed { worker, item: &item });
                    self.run_item(worker, &config, item, cancel, &pause).await;
                    false
                }
            };

            if back_off {
                tokio::select! {
                    () = tokio::time::sleep(config.idle_interval) => {}
                    () = pause.paused() => {}
                    () = shutdown.cancelled() => break Err(AppError::Cancelled),
                }
            }
        };

        self.reporter.report(SchedulerEvent::WorkerStopped { worker });
        result
    }

    /// Crawls one claimed item and settles its bookkeeping.
    async fn run_item(
        self: &Arc<Self>,
        worker: usize,
        config: &SchedulerConfig,
        item: WorkItem,
        cancel: CancellationToken,
        pause: &PauseToken,
    ) {
        let outcome = self.process_item(config, &item, &cancel, pause).await;

        let settlement = match &outcome {
            Outcome::Completed | Outcome::Failed(_) | Outcome::Dropped(..) => Settlement::Dequeue,
            Outcome::Deferred(_) => Settlement::RetryAt(Instant::now() + config.idle_interval),
            Outcome::Cancelled => Settlement::Keep,
        };
        self.book().settle(&item, settlement);

        let item = &item;
        let event = match &outcome {
            Outcome::Completed => SchedulerEvent::Completed { worker, item },
            Outcome::Failed(error) => SchedulerEvent::Failed {
                worker,
                item,
                error,
            },
            Outcome::Dropped(reason, error) => SchedulerEvent::Skipped {
                worker,
                item,
                reason: *reason,
                error: error.as_ref(),
            },
            Outcome::Deferred(error) => SchedulerEvent::Skipped {
                worker,
                item,
                reason: SkipReason::ProbeFailed,
                error: Some(error),
            },
            Outcome::Cancelled => SchedulerEvent::ItemCancelled { worker, item },
        };
        self.reporter.report(event);
    }

    async fn process_item(
        self: &Arc<Self>,
        config: &SchedulerConfig,
        item: &WorkItem,
        cancel: &CancellationToken,
        pause: &PauseToken,
    ) -> Outcome {
        let downloader = match self.factory.create(item) {
            Ok(downloader) => downloader,
            Err(e) => return Outcome::Failed(e),
        };

        let probe = tokio::select! {
            probe = tokio::time::timeout(
                config.probe_timeout,
                downloader.is_reachable(config.probe_timeout),
            ) => probe.unwrap_or(Err(AppError::Timeout(config.probe_timeout))),
            () = cancel.cancelled() => return Outcome::Cancelled,
        };
        let blog = item.blog();
        match probe {
            Ok(true) => blog.set_online(true),
            Ok(false) => {
                blog.set_online(false);
                return Outcome::Dropped(SkipReason::Offline, None);
            }
            Err(e) if e.is_cancelled() => return Outcome::Cancelled,
            Err(e) if e.is_retryable() => return Outcome::Deferred(e),
            Err(e) => {
                blog.set_online(false);
                return Outcome::Dropped(SkipReason::Offline, Some(e));
            }
        }

        blog.set_dirty(true);
        lock(&self.dirty, "dirty").insert(item.identity().clone(), blog.clone());

        let shared = Arc::clone(self);
        let progress = ProgressSink::new(item.clone(), config.progress_interval).with_listener(
            move |item, percent| {
                shared
                    .reporter
                    .report(SchedulerEvent::Progress { item, percent });
            },
        );

        let result = AssertUnwindSafe(downloader.crawl(progress, cancel.clone(), pause.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(AppError::DownloadError("downloader panicked".into())));

        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        match result {
            Ok(()) => {
                item.set_progress(100);
                Outcome::Completed
            }
            Err(e) if e.is_cancelled() => Outcome::Cancelled,
            Err(e) => Outcome::Failed(e),
        }
    }
}
