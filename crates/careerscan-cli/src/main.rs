use std::path::Path;

use anyhow::{bail, Context, Result};
use careerscan_adapters::{ChromiumSessionFactory, SourceProfile};
use careerscan_core::{ExtractStatus, RunStatus, ScrapeRun};
use careerscan_crawl::{CrawlConfig, RunController, RunMode, RunOptions, SourceRegistry};
use careerscan_storage::{JobFilter, JobStore, SourceSummary};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "careerscan")]
#[command(about = "Discover and extract job postings from client-rendered careers pages")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the job database and apply migrations.
    Init,
    /// Discover listings, then extract every unprocessed job.
    Scrape {
        #[arg(long)]
        source: Option<String>,
        /// Extract at most this many jobs per source.
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Extract only jobs that are still unprocessed; no discovery.
    Resume {
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Summarize stored jobs per source and the most recent run.
    Status,
    /// Show recent scrape runs.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// List stored jobs.
    Jobs {
        #[arg(long)]
        source: Option<String>,
        /// pending, extracted or failed
        #[arg(long)]
        status: Option<ExtractStatus>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

fn init_tracing() {
    let fallback = std::env::var("CAREERSCAN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("{fallback},sqlx=warn"))),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// `sqlite://data/jobs.db` does not create `data/` on its own.
fn ensure_database_dir(database_url: &str) -> Result<()> {
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(())
}

async fn open_store(config: &CrawlConfig) -> Result<JobStore> {
    ensure_database_dir(&config.database_url)?;
    JobStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening job store {}", config.database_url))
}

fn select_sources(registry: &SourceRegistry, source: Option<&str>) -> Result<Vec<SourceProfile>> {
    match source {
        Some(id) => {
            let profile = registry
                .get(id)
                .with_context(|| format!("unknown source {id}"))?;
            Ok(vec![profile.clone()])
        }
        None => {
            let enabled: Vec<_> = registry.enabled().cloned().collect();
            if enabled.is_empty() {
                bail!("no enabled sources in registry");
            }
            Ok(enabled)
        }
    }
}

fn status_report(summaries: &[SourceSummary], last_run: Option<&ScrapeRun>) -> String {
    let total: u64 = summaries.iter().map(|s| u64::from(s.total)).sum();
    let mut out = format!("{total} job(s) across {} source(s)\n", summaries.len());
    for s in summaries {
        out.push_str(&format!(
            "  {:<16} total={} extracted={} failed={} pending={} analyzed={} last_scraped={}\n",
            s.source_id,
            s.total,
            s.extracted,
            s.failed,
            s.pending,
            s.analyzed,
            s.last_scraped_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string()),
        ));
    }
    match last_run {
        Some(run) => out.push_str(&format!(
            "last run {} [{}] {} started {}\n",
            run.id,
            run.source_id.as_deref().unwrap_or("-"),
            run.status,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
        )),
        None => out.push_str("no runs recorded\n"),
    }
    out
}

async fn crawl(config: CrawlConfig, source: Option<String>, options: RunOptions) -> Result<()> {
    let registry = SourceRegistry::load(&config.sources_path)?;
    let sources = select_sources(&registry, source.as_deref())?;
    let store = open_store(&config).await?;
    let factory = ChromiumSessionFactory::launch(config.headless)
        .await
        .context("launching browser")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after in-flight store writes");
            on_signal.cancel();
        }
    });

    let controller = RunController::new(store.clone(), factory, config);
    let mut failed_runs = 0;
    for profile in &sources {
        if cancel.is_cancelled() {
            break;
        }
        let report = controller.run(profile, &options, &cancel).await?;
        println!(
            "run {} [{}] {}: discovered={} new={} queued={} scraped={} failed={}",
            report.run.id,
            profile.source_id,
            report.run.status,
            report.run.jobs_discovered,
            report.new_jobs,
            report.queued,
            report.run.jobs_scraped,
            report.failures.len(),
        );
        for failure in &report.failures {
            println!("  ! job {} {} ({})", failure.job_id, failure.reason, failure.url);
        }
        if let Some(message) = &report.run.error_message {
            println!("  error: {message}");
        }
        if report.run.status == RunStatus::Failed {
            failed_runs += 1;
        }
    }

    controller.into_factory().shutdown().await;
    store.close().await;
    if failed_runs > 0 {
        bail!("{failed_runs} run(s) failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = CrawlConfig::from_env();

    match cli.command.unwrap_or(Commands::Scrape {
        source: None,
        limit: None,
    }) {
        Commands::Init => {
            let store = open_store(&config).await?;
            store.close().await;
            println!("job store ready at {}", config.database_url);
        }
        Commands::Scrape { source, limit } => {
            let options = RunOptions {
                mode: RunMode::Full,
                limit,
            };
            crawl(config, source, options).await?;
        }
        Commands::Resume { source, limit } => {
            let options = RunOptions {
                mode: RunMode::Resume,
                limit,
            };
            crawl(config, source, options).await?;
        }
        Commands::Status => {
            let store = open_store(&config).await?;
            let summaries = store.source_summaries().await?;
            let last_run = store.recent_runs(1).await?.into_iter().next();
            print!("{}", status_report(&summaries, last_run.as_ref()));
            store.close().await;
        }
        Commands::Runs { limit } => {
            let store = open_store(&config).await?;
            for run in store.recent_runs(limit).await? {
                println!(
                    "{:>5} {:<10} {} -> {} source={} discovered={} scraped={} analyzed={}{}",
                    run.id,
                    run.status,
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.completed_at
                        .map(|t| t.format("%H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    run.source_id.as_deref().unwrap_or("-"),
                    run.jobs_discovered,
                    run.jobs_scraped,
                    run.jobs_analyzed,
                    run.error_message
                        .map(|m| format!(" error={m}"))
                        .unwrap_or_default(),
                );
            }
        }
        Commands::Jobs {
            source,
            status,
            limit,
        } => {
            let store = open_store(&config).await?;
            let filter = JobFilter {
                source_id: source,
                status,
                limit: Some(limit),
                ..Default::default()
            };
            let total = store.count_jobs(&JobFilter {
                limit: None,
                ..filter.clone()
            })
            .await?;
            for job in store.list_jobs(&filter).await? {
                println!(
                    "{:>6} {:<9} {:<12} {} | {}{}",
                    job.id,
                    job.extract_status,
                    job.source_id,
                    job.title,
                    job.canonical_url,
                    job.failure_reason
                        .map(|r| format!(" [{r}]"))
                        .unwrap_or_default(),
                );
            }
            println!("{total} job(s) match");
        }
    }

    Ok(())
}
