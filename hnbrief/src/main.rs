/*
hnbrief - single-binary main.rs
This binary starts the Rocket HTTP server and runs the daily digest scheduler inside the same process.
*/

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use common::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::init_db_pool;

use hnbrief::chat::Chat;
use hnbrief::conversations::ConversationRecorder;
use hnbrief::crawler::Crawler;
use hnbrief::digest::{DigestPublisher, DigestSettings};
use hnbrief::ingestion::{HackerNewsFeed, DEFAULT_FEED_BASE};
use hnbrief::llm::summarizer::{Summarizer, SummarizerSettings};
use hnbrief::llm::{remote::RemoteLlmProvider, LlmProvider};
use hnbrief::mailer::{Distributor, HttpMailer};
use hnbrief::scheduler::{self, DailyJob, DEFAULT_CRAWL_COUNT};
use hnbrief::scraping::HttpFetcher;
use hnbrief::server::{self, launch_rocket, AppState};
use hnbrief::storage::StoryStore;

const RECORDER_QUEUE_CAPACITY: usize = 256;
const DEFAULT_MODEL: &str = "qwen-turbo";
const DEFAULT_LLM_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions";

#[derive(Parser, Debug)]
#[command(name = "hnbrief", about = "hnbrief single-binary server + scheduler")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Disable the daily scheduler (run server only)
    #[arg(long)]
    no_worker: bool,

    /// Run the scheduler only (do not bind HTTP server)
    #[arg(long)]
    worker_only: bool,

    /// Run one crawl + digest immediately at startup
    #[arg(long)]
    run_now: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");
    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    let config = match Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    info!(default = ?default_path, override = ?override_path, "configuration loaded");
    let config = Arc::new(config);

    let db_pool = match init_db_pool(&config.database.path).await {
        Ok(p) => p,
        Err(e) => {
            error!(%e, db_path = %config.database.path, "failed to initialize database pool");
            return Err(e);
        }
    };

    if config.auto_migrate() {
        server::ensure_schema(&db_pool).await?;
    } else {
        info!("auto-migrate disabled, assuming schema exists");
    }
    common::sync_users(&config, &db_pool).await?;

    // Wire the pipeline
    let llm = create_llm_provider(&config)?;
    let remote = config.llm.as_ref().and_then(|l| l.remote.as_ref());
    let settings = SummarizerSettings {
        temperature: remote.and_then(|r| r.temperature).unwrap_or(1.3),
        max_tokens: remote.and_then(|r| r.max_tokens),
        timeout_seconds: remote.and_then(|r| r.timeout_seconds),
    };

    let fetcher = Arc::new(HttpFetcher::new(config.scraping.timeout_seconds).context("failed to build page fetcher")?);
    let feed = Arc::new(
        HackerNewsFeed::new(
            config.feed.base_url.clone().unwrap_or_else(|| DEFAULT_FEED_BASE.to_string()),
            config.feed.timeout_seconds,
        )
        .context("failed to build feed client")?,
    );

    let (recorder, recorder_handle) = ConversationRecorder::spawn(db_pool.clone(), RECORDER_QUEUE_CAPACITY);
    let chat = Arc::new(Chat::new(llm.clone(), recorder.clone(), settings.clone()));
    let summarizer = Arc::new(Summarizer::new(fetcher, llm, recorder, settings));
    let store = StoryStore::new(db_pool.clone());
    let crawler = Arc::new(Crawler::new(feed, store.clone(), summarizer.clone()));

    let distributor = match &config.mail {
        Some(mail) => {
            let api_key = mail.api_key_env.as_deref().and_then(|env| match std::env::var(env) {
                Ok(key) => Some(key),
                Err(_) => {
                    warn!(env, "mail API key env var not set, sending without credentials");
                    None
                }
            });
            let mailer = HttpMailer::new(mail.api_url.clone(), api_key).context("failed to build mail client")?;
            Some(Arc::new(Distributor::new(
                db_pool.clone(),
                Arc::new(mailer),
                mail.from.clone(),
                config.digest.subject.clone(),
            )))
        }
        None => {
            warn!("no [mail] section configured, digests will not be sent");
            None
        }
    };
    let digest_settings = DigestSettings {
        top_stories: config.digest.top_stories.unwrap_or(DigestSettings::default().top_stories),
        window_days: config.digest.window_days.unwrap_or(DigestSettings::default().window_days),
    };
    let publisher = Arc::new(DigestPublisher::new(store, distributor, digest_settings));
    let crawl_count = config.scheduler.crawl_count.unwrap_or(DEFAULT_CRAWL_COUNT);
    let job = Arc::new(DailyJob::new(crawler, publisher, crawl_count));

    let times = scheduler::parse_times(&config.scheduler.times)?;
    let shutdown_notify = Arc::new(Notify::new());

    if args.run_now {
        info!("running the daily job once at startup");
        match job.run_once().await {
            Ok(Some(report)) => info!(
                crawled = report.crawled,
                crawl_failed = report.crawl_error.is_some(),
                sent = report.distribution.sent,
                "startup run finished"
            ),
            Ok(None) => {}
            Err(e) => error!(error = %format!("{:#}", e), "startup run failed"),
        }
    }

    if args.worker_only {
        info!("Starting in worker-only mode");
        let worker = scheduler::run_scheduler(job.clone(), times, shutdown_notify.clone());

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, notifying scheduler to shutdown");
                shutdown_notify.notify_waiters();
            }
            res = worker => {
                if let Err(e) = res {
                    error!(%e, "scheduler encountered an error");
                }
            }
        }
        info!("worker-only run finished");
        return Ok(());
    }

    let mut worker_handle = None;
    if !args.no_worker {
        info!("Spawning scheduler task");
        let w_job = job.clone();
        let w_shutdown = shutdown_notify.clone();
        worker_handle = Some(tokio::spawn(async move {
            scheduler::run_scheduler(w_job, times, w_shutdown).await
        }));
    } else {
        info!("Scheduler disabled via CLI (--no-worker)");
    }

    let state = AppState {
        started_at: Utc::now(),
        config: config.clone(),
        db: db_pool.clone(),
        summarizer,
        chat,
        job,
    };

    info!("Launching Rocket HTTP server");
    if let Err(e) = launch_rocket(state).await {
        error!(%e, "Rocket server failed");
    }

    info!("HTTP server stopped; notifying scheduler to shutdown");
    shutdown_notify.notify_waiters();

    if let Some(handle) = worker_handle {
        match tokio::time::timeout(Duration::from_secs(20), handle).await {
            Ok(Ok(Ok(()))) => info!("scheduler exited cleanly"),
            Ok(Ok(Err(e))) => error!(%e, "scheduler returned an error"),
            Ok(Err(join_err)) => error!(%join_err, "scheduler task panicked"),
            Err(_) => info!("Timed out waiting for scheduler to exit; continuing shutdown"),
        }
    }

    // The recorder drains once its last sender is gone; Rocket's state held the final clone.
    if tokio::time::timeout(Duration::from_secs(5), recorder_handle).await.is_err() {
        warn!("conversation recorder did not drain before shutdown");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Create the LLM provider from the `[llm]` section
fn create_llm_provider(config: &Config) -> Result<Arc<dyn LlmProvider>> {
    let llm_config = config
        .llm
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("missing [llm] configuration section"))?;
    let adapter = llm_config.adapter.as_deref().unwrap_or("remote");

    match adapter {
        "remote" => {
            let remote = llm_config
                .remote
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("remote adapter selected but [llm.remote] is missing"))?;

            let api_key_env = remote
                .api_key_env
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Missing api_key_env in remote config"))?;
            let api_key = std::env::var(api_key_env)
                .with_context(|| format!("LLM API key env var '{}' not set", api_key_env))?;

            let model = remote.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string());
            let api_url = remote.api_url.clone().unwrap_or_else(|| DEFAULT_LLM_URL.to_string());
            info!(%model, %api_url, "LLM provider initialized: remote");

            let provider: Arc<dyn LlmProvider> = Arc::new(RemoteLlmProvider::new(api_url, api_key, model).with_defaults(
                remote.timeout_seconds,
                remote.max_tokens,
                remote.temperature.unwrap_or(1.3),
            ));
            Ok(provider)
        }
        _ => anyhow::bail!("Unknown LLM adapter type: {}", adapter),
    }
}
