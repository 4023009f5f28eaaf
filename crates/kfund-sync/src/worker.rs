//! Process worker pool: claim pending captures, extract, classify, normalize, upsert.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use kfund_codes::normalize_eligibility;
use kfund_core::{
    program_id_for, AnnouncementType, CanonicalProgramRecord, ExtractionTier, ProgramStatus, RawCapture,
};
use kfund_extract::{classify_announcement, Cascade, CascadeResult, CascadeStats, ExtractionInput, TextExtractor};
use kfund_storage::{AttachmentStore, RecordStore, StatusUpdate, UpsertOutcome};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Consecutive empty polls before the pool exits.
    pub max_idle_polls: u32,
    pub max_attempts: u32,
    pub max_tier: ExtractionTier,
    /// How long a claim may stay in PROCESSING before another poll takes it back.
    pub claim_lease: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_secs(5),
            max_idle_polls: 16,
            max_attempts: 3,
            max_tier: ExtractionTier::Tier3,
            claim_lease: Duration::from_secs(15 * 60),
        }
    }
}

/// Downstream cache hook called after a program record changes.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, record: &CanonicalProgramRecord) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopCacheInvalidator;

#[async_trait]
impl CacheInvalidator for NoopCacheInvalidator {
    async fn invalidate(&self, _record: &CanonicalProgramRecord) -> Result<()> {
        Ok(())
    }
}

/// POSTs the changed program's identity to a webhook.
pub struct HttpCacheInvalidator {
    client: reqwest::Client,
    url: String,
}

impl HttpCacheInvalidator {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building cache invalidation client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl CacheInvalidator for HttpCacheInvalidator {
    async fn invalidate(&self, record: &CanonicalProgramRecord) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&serde_json::json!({
                "program_id": record.id,
                "content_hash": record.content_hash,
                "status": record.status,
                "matchable": record.matchable,
            }))
            .send()
            .await
            .with_context(|| format!("posting cache invalidation to {}", self.url))?
            .error_for_status()
            .context("cache invalidation rejected")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessReport {
    pub run_id: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub claimed: u64,
    pub processed: u64,
    pub failed: u64,
    pub flagged_for_review: u64,
    pub polls: u64,
    pub by_type: BTreeMap<String, u64>,
    pub cascade: CascadeStats,
    pub errors: Vec<String>,
}

enum ItemResult {
    Processed {
        announcement_type: AnnouncementType,
        cascade: CascadeResult,
    },
    Failed {
        error: String,
        flagged: bool,
    },
}

struct WorkerContext {
    store: Arc<dyn RecordStore>,
    attachments: AttachmentStore,
    cascade: Arc<Cascade>,
    text: Arc<TextExtractor>,
    invalidator: Arc<dyn CacheInvalidator>,
    config: QueueConfig,
}

#[derive(Clone)]
pub struct ProcessWorkerPool {
    ctx: Arc<WorkerContext>,
    permits: Arc<Semaphore>,
    // One run at a time per pool; overlapping triggers queue up behind it.
    running: Arc<Mutex<()>>,
}

impl ProcessWorkerPool {
    pub fn new(
        store: Arc<dyn RecordStore>,
        attachments: AttachmentStore,
        config: QueueConfig,
        cascade: Arc<Cascade>,
        text: Arc<TextExtractor>,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            ctx: Arc::new(WorkerContext {
                store,
                attachments,
                cascade,
                text,
                invalidator,
                config,
            }),
            permits,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.ctx.config
    }

    /// Poll until `max_idle_polls` consecutive polls find nothing to do.
    pub async fn run_until_idle(&self) -> Result<ProcessReport> {
        let _running = self.running.lock().await;
        let config = &self.ctx.config;
        let mut report = ProcessReport {
            run_id: Uuid::new_v4(),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        let lease = chrono::Duration::from_std(config.claim_lease).context("claim lease out of range")?;
        let mut idle_polls = 0u32;

        loop {
            report.polls += 1;
            let claimed = self
                .ctx
                .store
                .claim_pending(config.concurrency.max(1), config.max_attempts, lease)
                .await
                .context("claiming pending captures")?;

            if claimed.is_empty() {
                idle_polls += 1;
                if idle_polls >= config.max_idle_polls {
                    info!(idle_polls, "queue idle; worker exiting");
                    break;
                }
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
            idle_polls = 0;
            report.claimed += claimed.len() as u64;

            let mut tasks = JoinSet::new();
            for capture in claimed {
                let ctx = self.ctx.clone();
                let permits = self.permits.clone();
                tasks.spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let (id, url, attempts) = (capture.id, capture.url.clone(), capture.processing_attempts);
                    let span = info_span!("process_capture", capture_id = %id, url = %url);
                    // A panic inside one item must still leave its row in a claimable state.
                    let item = tokio::spawn({
                        let ctx = ctx.clone();
                        async move { ctx.process_or_record_failure(capture).await }.instrument(span)
                    });
                    match item.await {
                        Ok(result) => result,
                        Err(join_err) => {
                            error!(capture_id = %id, error = %join_err, "processing task panicked");
                            ctx.record_failure(id, &url, attempts, format!("processing task panicked: {join_err}"))
                                .await
                        }
                    }
                });
            }

            // Drain every task before surfacing a store error so siblings finish recording.
            let mut store_error = None;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(ItemResult::Processed {
                        announcement_type,
                        cascade,
                    })) => {
                        report.processed += 1;
                        *report.by_type.entry(announcement_type.to_string()).or_default() += 1;
                        report.cascade.record(&cascade);
                    }
                    Ok(Ok(ItemResult::Failed { error, flagged })) => {
                        report.failed += 1;
                        if flagged {
                            report.flagged_for_review += 1;
                        }
                        report.errors.push(error);
                    }
                    Ok(Err(e)) => {
                        error!(error = %format!("{e:#}"), "recording processing outcome failed");
                        report.errors.push(format!("{e:#}"));
                        store_error.get_or_insert(e);
                    }
                    Err(join_err) => {
                        error!(error = %join_err, "worker task panicked");
                        report.failed += 1;
                        report.errors.push(join_err.to_string());
                    }
                }
            }
            if let Some(e) = store_error {
                return Err(e);
            }
        }

        report.finished_at = Some(Utc::now());
        info!(
            claimed = report.claimed,
            processed = report.processed,
            failed = report.failed,
            cost_usd = report.cascade.total_cost_usd(),
            "process run finished"
        );
        Ok(report)
    }
}

impl WorkerContext {
    /// Only a store failure while recording the outcome escapes as an error.
    async fn process_or_record_failure(&self, capture: RawCapture) -> Result<ItemResult> {
        let id = capture.id;
        match self.process(&capture).await {
            Ok((announcement_type, cascade)) => {
                self.store
                    .update_status(id, StatusUpdate::Processed)
                    .await
                    .with_context(|| format!("marking capture {id} processed"))?;
                Ok(ItemResult::Processed {
                    announcement_type,
                    cascade,
                })
            }
            Err(e) => {
                self.record_failure(id, &capture.url, capture.processing_attempts, format!("{e:#}"))
                    .await
            }
        }
    }

    async fn record_failure(&self, id: Uuid, url: &str, prior_attempts: u32, error: String) -> Result<ItemResult> {
        warn!(error = %error, attempts = prior_attempts + 1, "processing failed");
        let updated = self
            .store
            .update_status(
                id,
                StatusUpdate::ProcessingFailed {
                    error: error.clone(),
                    max_attempts: self.config.max_attempts,
                },
            )
            .await
            .with_context(|| format!("recording failure for capture {id}"))?;
        if updated.needs_review {
            warn!(attempts = updated.processing_attempts, "attempt limit reached; flagged for review");
        }
        Ok(ItemResult::Failed {
            error: format!("{url}: {error}"),
            flagged: updated.needs_review,
        })
    }

    async fn process(&self, capture: &RawCapture) -> Result<(AnnouncementType, CascadeResult)> {
        let detail = capture.detail().context("decoding detail payload")?;

        let attachment_paths = match &capture.attachment_dir {
            Some(dir) => self
                .attachments
                .list_files(Path::new(dir))
                .await
                .context("listing attachments")?,
            None => Vec::new(),
        };
        let document = self.text.build_document(&detail, &attachment_paths).await;

        let announcement_type = classify_announcement(&detail.title);
        // Non-funding announcements are stored but never pay for model calls.
        let max_tier = if announcement_type.is_matchable() {
            self.config.max_tier
        } else {
            ExtractionTier::Tier1
        };

        let input = ExtractionInput {
            title: detail.title.clone(),
            description: detail.description.clone(),
            support_target: detail.support_target.clone(),
            document: (!document.text.trim().is_empty()).then(|| document.text.clone()),
        };
        let cascade = self.cascade.run(&input, max_tier).await;
        let extracted = &cascade.eligibility;

        let record = CanonicalProgramRecord {
            id: program_id_for(&capture.content_hash),
            content_hash: capture.content_hash.clone(),
            source_id: capture.source_id.clone(),
            announcement_id: detail.announcement_id.clone(),
            url: detail.url.clone(),
            title: detail.title.clone(),
            agency: detail.agency.clone(),
            application_start: detail.application_start,
            deadline: detail.deadline,
            announcement_type,
            matchable: announcement_type.is_matchable(),
            eligibility: normalize_eligibility(extracted),
            confidence: extracted.confidence,
            source_tier: extracted.source_tier,
            extraction_cost_usd: extracted.total_cost_usd(),
            status: ProgramStatus::for_deadline(detail.deadline, today()),
            updated_at: Utc::now(),
        };

        let outcome = self
            .store
            .upsert_canonical_program(record.clone())
            .await
            .context("upserting canonical program")?;
        info!(
            program_id = %record.id,
            announcement_type = %announcement_type,
            confidence = %record.confidence,
            outcome = ?outcome,
            "program upserted"
        );
        if outcome != UpsertOutcome::Unchanged {
            if let Err(e) = self.invalidator.invalidate(&record).await {
                warn!(error = %format!("{e:#}"), "cache invalidation failed");
            }
        }
        Ok((announcement_type, cascade))
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}
