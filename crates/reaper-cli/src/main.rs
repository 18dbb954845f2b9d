mod blog;
mod downloader;
mod queue_file;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use reaper_core::count_interval::CountByIntervalConstraint;
use reaper_core::models::WorkItem;
use reaper_core::rate_limiter::RateLimiter;
use reaper_core::scheduler::{CrawlScheduler, SchedulerConfig};
use reaper_core::throttle::RequestThrottle;
use reaper_core::traits::{Blog, Downloader, DownloaderFactory};

use crate::blog::FileBlog;
use crate::downloader::HttpDownloaderFactory;

#[derive(Parser)]
#[command(name = "blogreaper", version, about = "Parallel blog crawler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl every queued blog until the queue drains (Ctrl-C stops early)
    Crawl {
        #[command(flatten)]
        opts: CrawlOptions,

        /// Number of blogs crawled concurrently
        #[arg(short, long, env = "BLOGREAPER_PARALLELISM", default_value_t = 3)]
        parallelism: usize,

        /// Index pages fetched per blog
        #[arg(long, env = "BLOGREAPER_MAX_PAGES", default_value_t = 10)]
        max_pages: u32,

        /// Seconds a worker waits before re-checking an empty or failing queue
        #[arg(long, env = "BLOGREAPER_IDLE_SECS", default_value_t = 4)]
        idle_secs: u64,
    },

    /// Probe every queued blog and report whether it is online
    Check {
        #[command(flatten)]
        opts: CrawlOptions,
    },
}

#[derive(Args)]
struct CrawlOptions {
    /// JSON file listing the blogs to crawl
    #[arg(short, long, env = "BLOGREAPER_QUEUE")]
    queue: PathBuf,

    /// Root directory for downloaded pages and blog state
    #[arg(short, long, env = "BLOGREAPER_OUTPUT", default_value = "downloads")]
    output: PathBuf,

    /// Request rate limit in requests per second (unlimited if omitted)
    #[arg(short, long, env = "BLOGREAPER_RATE")]
    rate: Option<f64>,

    /// Warm-up period for the rate limiter; 0 allows short bursts instead
    #[arg(long, env = "BLOGREAPER_WARMUP_SECS", default_value_t = 0)]
    warmup_secs: u64,

    /// At most this many requests per --window-secs
    #[arg(long, env = "BLOGREAPER_WINDOW_COUNT")]
    window_count: Option<usize>,

    /// Length of the request-count window in seconds
    #[arg(long, env = "BLOGREAPER_WINDOW_SECS", default_value_t = 60)]
    window_secs: u64,

    /// Liveness probe timeout in seconds
    #[arg(long, env = "BLOGREAPER_PROBE_TIMEOUT_SECS", default_value_t = 4)]
    probe_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("blogreaper=info".parse()?)
                .add_directive("reaper_core=info".parse()?),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Crawl {
            opts,
            parallelism,
            max_pages,
            idle_secs,
        } => {
            let config = SchedulerConfig::default()
                .with_parallelism(parallelism)
                .with_probe_timeout(Duration::from_secs(opts.probe_timeout_secs))
                .with_idle_interval(Duration::from_secs(idle_secs));
            cmd_crawl(&opts, config, max_pages).await?;
        }
        Commands::Check { opts } => {
            cmd_check(&opts).await?;
        }
    }

    Ok(())
}

/// Builds the shared request throttle from the rate and window options.
fn build_throttle(opts: &CrawlOptions) -> Result<RequestThrottle> {
    let mut throttle = RequestThrottle::new();
    if let Some(count) = opts.window_count {
        let constraint = CountByIntervalConstraint::new(count, Duration::from_secs(opts.window_secs))
            .context("Invalid request window")?;
        throttle = throttle.with_constraint(Arc::new(constraint));
    }
    if let Some(rate) = opts.rate {
        let limiter = if opts.warmup_secs > 0 {
            RateLimiter::warming_up(rate, Duration::from_secs(opts.warmup_secs))
        } else {
            RateLimiter::new(rate)
        }
        .context("Invalid request rate")?;
        throttle = throttle.with_rate_limiter(limiter);
    }
    Ok(throttle)
}

fn load_blogs(opts: &CrawlOptions) -> Result<Vec<Arc<FileBlog>>> {
    queue_file::load_queue(&opts.queue)?
        .into_iter()
        .map(|entry| {
            let url = entry.resolve_url()?;
            let blog = FileBlog::open(&entry.name, entry.kind, url, &opts.output)
                .with_context(|| format!("Failed to open blog '{}'", entry.name))?;
            Ok(Arc::new(blog))
        })
        .collect()
}

async fn cmd_crawl(opts: &CrawlOptions, config: SchedulerConfig, max_pages: u32) -> Result<()> {
    let blogs = load_blogs(opts)?;
    let factory = HttpDownloaderFactory::new(build_throttle(opts)?, max_pages, blogs.clone())?;
    let scheduler = CrawlScheduler::new(factory, config)?;

    let added = scheduler.add_items(
        blogs
            .iter()
            .map(|blog| WorkItem::new(Arc::clone(blog) as Arc<dyn Blog>)),
    );
    tracing::info!(blogs = added, output = %opts.output.display(), "Queue loaded");
    if added == 0 {
        println!("Queue is empty, nothing to crawl.");
        return Ok(());
    }

    scheduler.start()?;

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if scheduler.queue_len() == 0 && scheduler.active().is_empty() {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Interrupted, stopping crawl");
                break;
            }
        }
    }

    let remaining = scheduler.queue_len();
    let saved = scheduler.shutdown().await?;

    println!("Crawl finished.");
    println!("  Blogs queued:   {added}");
    println!("  Still queued:   {remaining}");
    println!("  States saved:   {saved}");
    for blog in &blogs {
        let state = blog.state();
        println!(
            "  {:<32} pages: {:>4}  online: {}",
            blog.identity().to_string(),
            state.pages_crawled,
            blog.is_online()
        );
    }

    Ok(())
}

async fn cmd_check(opts: &CrawlOptions) -> Result<()> {
    let blogs = load_blogs(opts)?;
    let factory = HttpDownloaderFactory::new(build_throttle(opts)?, 1, blogs.clone())?;
    let timeout = Duration::from_secs(opts.probe_timeout_secs);

    let mut offline = 0;
    for blog in &blogs {
        let item = WorkItem::new(Arc::clone(blog) as Arc<dyn Blog>);
        let downloader = factory.create(&item)?;
        let status = match tokio::time::timeout(timeout, downloader.is_reachable(timeout)).await {
            Ok(Ok(true)) => "online".to_string(),
            Ok(Ok(false)) => {
                offline += 1;
                "offline".to_string()
            }
            Ok(Err(e)) => {
                offline += 1;
                format!("error: {e}")
            }
            Err(_) => {
                offline += 1;
                "timed out".to_string()
            }
        };
        println!("{:<32} {status}", item.identity().to_string());
    }

    println!("\n{} of {} blogs reachable.", blogs.len() - offline, blogs.len());
    Ok(())
}
