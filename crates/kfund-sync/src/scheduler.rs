use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use kfund_core::DateRange;
use kfund_storage::RecordStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::discovery::{DiscoveryRequest, DiscoveryStage};
use crate::events::DiscoveryCompleted;
use crate::report::{write_discovery_report, write_process_report};
use crate::worker::ProcessWorkerPool;

/// `[today - lookback_days, today]`.
pub fn lookback_range(today: NaiveDate, lookback_days: u32) -> DateRange {
    let from = today - ChronoDuration::days(i64::from(lookback_days));
    DateRange { from, to: today }
}

/// Scheduled discovery always resumes, so a crashed run picks up where it stopped.
pub async fn run_scheduled_discovery(stage: &DiscoveryStage, lookback_days: u32, reports_dir: &Path) {
    let range = lookback_range(Utc::now().date_naive(), lookback_days);
    let source_ids = stage.registry().enabled().map(|s| s.id.clone()).collect::<Vec<_>>();
    for source_id in source_ids {
        let request = DiscoveryRequest {
            source_id: source_id.clone(),
            date_range: range,
            resume: true,
            max_pages: None,
            dry_run: false,
        };
        match stage.run(request).await {
            Ok(report) => {
                if let Err(e) = write_discovery_report(reports_dir, &report).await {
                    warn!(error = %format!("{e:#}"), "writing discovery report failed");
                }
            }
            Err(e) => error!(source_id = %source_id, error = %e, "scheduled discovery failed"),
        }
    }
}

/// Start one process run per completion event.
pub fn spawn_completion_listener(
    mut events: mpsc::UnboundedReceiver<DiscoveryCompleted>,
    pool: ProcessWorkerPool,
    reports_dir: PathBuf,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(
                session_id = %event.session_id,
                source_id = %event.source_id,
                new = event.counts.new,
                "discovery completed; starting process worker"
            );
            match pool.run_until_idle().await {
                Ok(report) => {
                    if let Err(e) = write_process_report(&reports_dir, &report).await {
                        warn!(error = %format!("{e:#}"), "writing process report failed");
                    }
                }
                Err(e) => error!(error = %format!("{e:#}"), "process run failed"),
            }
        }
    })
}

pub struct SchedulerJobs {
    pub discovery_cron: String,
    pub expiry_cron: String,
    pub lookback_days: u32,
    pub reports_dir: PathBuf,
}

/// Discovery on a cron with a rolling date range, plus the daily expiry sweep.
pub async fn build_scheduler(
    jobs: SchedulerJobs,
    stage: Arc<DiscoveryStage>,
    store: Arc<dyn RecordStore>,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let lookback_days = jobs.lookback_days;
    let reports_dir = jobs.reports_dir.clone();
    let discovery = Job::new_async(jobs.discovery_cron.as_str(), move |_uuid, _l| {
        let stage = stage.clone();
        let reports_dir = reports_dir.clone();
        Box::pin(async move {
            run_scheduled_discovery(&stage, lookback_days, &reports_dir).await;
        })
    })
    .with_context(|| format!("creating discovery job for cron {}", jobs.discovery_cron))?;
    sched.add(discovery).await.context("adding discovery job")?;

    let expiry = Job::new_async(jobs.expiry_cron.as_str(), move |_uuid, _l| {
        let store = store.clone();
        Box::pin(async move {
            let today = Utc::now().date_naive();
            match store.expire_programs(today).await {
                Ok(expired) => info!(expired, %today, "expiry sweep finished"),
                Err(e) => error!(error = %e, "expiry sweep failed"),
            }
        })
    })
    .with_context(|| format!("creating expiry job for cron {}", jobs.expiry_cron))?;
    sched.add(expiry).await.context("adding expiry job")?;

    Ok(sched)
}
