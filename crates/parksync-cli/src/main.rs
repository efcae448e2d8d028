use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parksync_core::RunStatus;
use parksync_links::{write_report_file, LinkCheckConfig, LinkChecker};
use parksync_storage::{FsObjectStore, HttpFetcher};
use parksync_sync::{build_scheduler, run_sync, CanonicalStore, RegionRegistry, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "parksync")]
#[command(about = "Park and trail ingestion into a canonical store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every configured region once, or just one.
    Sync {
        #[arg(long)]
        region: Option<String>,
    },
    /// Run regions on their cron schedules until Ctrl-C.
    Schedule,
    /// Check stored links and write a report; exits 1 when any link is broken.
    ValidateLinks {
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parksync=info")),
        )
        .init();

    let config = SyncConfig::from_env();
    match Cli::parse().command.unwrap_or(Commands::Sync { region: None }) {
        Commands::Sync { region } => sync(&config, region.as_deref()).await,
        Commands::Schedule => schedule(config).await,
        Commands::ValidateLinks { region, output } => {
            validate_links(&config, region.as_deref(), output).await
        }
    }
}

fn http(config: &SyncConfig) -> Result<Arc<HttpFetcher>> {
    Ok(Arc::new(HttpFetcher::new(config.http_client_config())?))
}

async fn sync(config: &SyncConfig, region: Option<&str>) -> Result<ExitCode> {
    let runs = run_sync(config, region).await?;
    let mut failed = false;
    for run in &runs {
        failed |= run.status == RunStatus::Failed;
        println!(
            "{}: {:?} run_id={} processed={} created={} updated={} failed={} carried_forward={} reviews={}",
            run.region,
            run.status,
            run.run_id,
            run.processed,
            run.created,
            run.updated,
            run.failed,
            run.carried_forward,
            run.reviews.len()
        );
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

async fn schedule(config: SyncConfig) -> Result<ExitCode> {
    let registry = RegionRegistry::load(&config.regions_path).await?;
    let store = CanonicalStore::open_dir(config.store_dir.clone());
    let http = http(&config)?;

    let Some(mut sched) = build_scheduler(config, registry.regions, http, store).await? else {
        eprintln!("no region declares a cron schedule");
        return Ok(ExitCode::FAILURE);
    };
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    sched.shutdown().await.context("stopping scheduler")?;
    Ok(ExitCode::SUCCESS)
}

async fn validate_links(
    config: &SyncConfig,
    region: Option<&str>,
    output: Option<PathBuf>,
) -> Result<ExitCode> {
    let store = FsObjectStore::new(config.store_dir.clone());
    let checker = LinkChecker::new(
        http(config)?,
        LinkCheckConfig {
            timeout: Duration::from_secs(config.link_timeout_secs),
            pace: Duration::from_millis(config.link_pace_ms),
            ..Default::default()
        },
    );

    let report = parksync_links::validate_store_links(&store, &checker, region).await?;
    if let Some(path) = output {
        write_report_file(&path, &report)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
    }

    println!(
        "links: total={} valid={} broken={} timeouts={} errors={} redirects={} browser_only={}",
        report.total_links,
        report.valid_links,
        report.broken_links,
        report.timeouts,
        report.errors,
        report.redirects,
        report.browser_only
    );
    for key in &report.skipped_records {
        println!("  skipped unreadable record {key}");
    }
    for entity in &report.worst_entities {
        println!("  {} ({}): {} broken of {}", entity.entity_name, entity.entity_id, entity.broken, entity.total);
    }
    Ok(if report.passed() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
