use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use kfund_adapters::SourceRegistry;
use kfund_core::DateRange;
use kfund_storage::{AttachmentStore, PgRecordStore, RecordStore};
use kfund_sync::{
    build_fetcher, build_scheduler, build_worker_pool, lookback_range, spawn_completion_listener,
    write_discovery_report, write_process_report, ChannelCompletionSink, CheckpointStore, DiscoveryRequest,
    DiscoveryStage, SchedulerJobs, SyncConfig,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kfund-cli")]
#[command(about = "Korean funding program ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl listing pages for a date range and store new announcements.
    Discover {
        /// Source id from sources.yaml; every enabled source when omitted.
        #[arg(long)]
        source: Option<String>,
        #[arg(long = "from-date", alias = "fromDate")]
        from_date: Option<NaiveDate>,
        #[arg(long = "to-date", alias = "toDate")]
        to_date: Option<NaiveDate>,
        #[arg(long)]
        resume: bool,
        #[arg(long = "max-pages", alias = "maxPages")]
        max_pages: Option<u32>,
        #[arg(long = "dry-run", alias = "dryRun")]
        dry_run: bool,
        /// Skip the process run normally chained to a completed discovery.
        #[arg(long = "no-process")]
        no_process: bool,
    },
    /// Drain the pending queue once.
    Process,
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Mark programs past their deadline as expired.
    Expire,
    Migrate,
    /// List captures that exhausted their processing attempts.
    Review,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kfund=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Discover {
            source,
            from_date,
            to_date,
            resume,
            max_pages,
            dry_run,
            no_process,
        } => {
            let range = date_range(&config, from_date, to_date)?;
            let request = DiscoverArgs {
                source,
                range,
                resume,
                max_pages,
                dry_run,
                process: !no_process && !dry_run,
            };
            discover(&config, request).await?;
        }
        Commands::Process => {
            let store = connect_store(&config).await?;
            let pool = build_worker_pool(&config, store)?;
            let report = pool.run_until_idle().await?;
            let dir = write_process_report(&config.reports_dir(), &report).await?;
            println!(
                "process complete: run_id={} processed={} failed={} flagged={} cost_usd={:.4} report={}",
                report.run_id,
                report.processed,
                report.failed,
                report.flagged_for_review,
                report.cascade.total_cost_usd(),
                dir.display()
            );
        }
        Commands::Schedule => schedule(&config).await?,
        Commands::Expire => {
            let store = connect_store(&config).await?;
            let today = Utc::now().date_naive();
            let expired = store.expire_programs(today).await.context("expiring programs")?;
            println!("expired {expired} programs with a deadline before {today}");
        }
        Commands::Migrate => {
            let store = PgRecordStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Review => {
            let store = connect_store(&config).await?;
            let captures = store.list_needing_review().await.context("listing captures needing review")?;
            if captures.is_empty() {
                println!("no captures need review");
            }
            for capture in captures {
                println!(
                    "{}\t{}\tattempts={}\t{}",
                    capture.id,
                    capture.url,
                    capture.processing_attempts,
                    capture.processing_error.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

struct DiscoverArgs {
    source: Option<String>,
    range: DateRange,
    resume: bool,
    max_pages: Option<u32>,
    dry_run: bool,
    process: bool,
}

fn date_range(config: &SyncConfig, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<DateRange> {
    let today = Utc::now().date_naive();
    match (from, to) {
        (None, None) => Ok(lookback_range(today, config.lookback_days)),
        (from, to) => {
            let to = to.unwrap_or(today);
            let from = from.unwrap_or(to);
            DateRange::new(from, to).context("invalid --from-date/--to-date")
        }
    }
}

async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn RecordStore>> {
    let store = PgRecordStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

fn load_registry(config: &SyncConfig) -> Result<Arc<SourceRegistry>> {
    Ok(Arc::new(SourceRegistry::load(&config.sources_path)?))
}

async fn discover(config: &SyncConfig, args: DiscoverArgs) -> Result<()> {
    let registry = load_registry(config)?;
    // Dry runs read the store to classify rows; the stage skips every write.
    let store = connect_store(config).await?;
    let fetcher = Arc::new(build_fetcher(config, &registry).await?);
    let (sink, events) = ChannelCompletionSink::new();

    let listener = if args.process {
        let pool = build_worker_pool(config, store.clone())?;
        Some(spawn_completion_listener(events, pool, config.reports_dir()))
    } else {
        drop(events);
        None
    };

    let stage = DiscoveryStage::new(
        registry.clone(),
        fetcher,
        store,
        AttachmentStore::new(&config.attachments_dir),
        CheckpointStore::new(&config.checkpoint_dir),
        Arc::new(sink),
        config.discovery_config(),
    );

    let source_ids = match &args.source {
        Some(id) => vec![id.clone()],
        None => registry.enabled().map(|s| s.id.clone()).collect(),
    };
    let mut failures = 0usize;
    for source_id in source_ids {
        let request = DiscoveryRequest {
            source_id: source_id.clone(),
            date_range: args.range,
            resume: args.resume,
            max_pages: args.max_pages,
            dry_run: args.dry_run,
        };
        match stage.run(request).await {
            Ok(report) => {
                let dir = write_discovery_report(&config.reports_dir(), &report).await?;
                println!(
                    "discovery {}: source={} range={} found={} new={} updated={} skipped={} failed={} completed={} report={}",
                    report.session_id,
                    report.source_id,
                    report.date_range,
                    report.counts.found,
                    report.counts.new,
                    report.counts.updated,
                    report.counts.skipped,
                    report.counts.failed,
                    report.completed,
                    dir.display()
                );
            }
            Err(e) => {
                error!(source_id = %source_id, error = %e, "discovery failed; checkpoint kept for --resume");
                failures += 1;
            }
        }
    }

    // Dropping the stage closes the event channel so the listener drains and exits.
    drop(stage);
    if let Some(listener) = listener {
        info!("waiting for chained process runs");
        listener.await.context("process listener panicked")?;
    }

    if failures > 0 {
        bail!("{failures} discovery run(s) failed");
    }
    Ok(())
}

async fn schedule(config: &SyncConfig) -> Result<()> {
    if !config.scheduler_enabled {
        println!("scheduler disabled; set KFUND_SCHEDULER_ENABLED=1 to run it");
        return Ok(());
    }

    let registry = load_registry(config)?;
    let store = connect_store(config).await?;
    let fetcher = Arc::new(build_fetcher(config, &registry).await?);
    let (sink, events) = ChannelCompletionSink::new();
    let pool = build_worker_pool(config, store.clone())?;
    let listener = spawn_completion_listener(events, pool, config.reports_dir());

    let stage = Arc::new(DiscoveryStage::new(
        registry,
        fetcher,
        store.clone(),
        AttachmentStore::new(&config.attachments_dir),
        CheckpointStore::new(&config.checkpoint_dir),
        Arc::new(sink),
        config.discovery_config(),
    ));
    let jobs = SchedulerJobs {
        discovery_cron: config.discovery_cron.clone(),
        expiry_cron: config.expiry_cron.clone(),
        lookback_days: config.lookback_days,
        reports_dir: config.reports_dir(),
    };
    let mut sched = build_scheduler(jobs, stage, store).await?;
    sched.start().await.context("starting scheduler")?;
    info!(
        discovery_cron = %config.discovery_cron,
        expiry_cron = %config.expiry_cron,
        "scheduler running; ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    listener.abort();
    Ok(())
}
