//! Listing → detail → attachment crawl for one source and date range.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use kfund_adapters::{
    discover_total_pages, parse_detail, parse_listing, AdapterError, ListingRow, PageCountBasis, SourceConfig,
    SourceRegistry,
};
use kfund_core::{Checkpoint, DateRange, NewRawCapture, ScrapingStatus};
use kfund_storage::{
    unique_filenames, AttachmentStore, FetchError, PageFetcher, RecordStore, StatusUpdate, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::dedup::{ContentDeduplicator, DedupDecision, HashStrategy};
use crate::events::{CompletionSink, DiscoveryCompleted, DiscoveryCounts};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("source {0} is disabled")]
    SourceDisabled(String),
    #[error("fetching listing page {page} ({url}): {source}")]
    Listing {
        page: u32,
        url: String,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub detail_delay: Duration,
    pub attachment_delay: Duration,
    pub hash_strategy: HashStrategy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            detail_delay: Duration::from_secs(1),
            attachment_delay: Duration::from_millis(500),
            hash_strategy: HashStrategy::Url,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub source_id: String,
    pub date_range: DateRange,
    pub resume: bool,
    /// Highest page index to visit in this run.
    pub max_pages: Option<u32>,
    /// Parse and count without writing captures, attachments or checkpoints.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub session_id: Uuid,
    pub source_id: String,
    pub date_range: DateRange,
    pub dry_run: bool,
    pub resumed: bool,
    pub start_page: u32,
    pub last_page_visited: u32,
    pub total_pages: u32,
    pub page_count_basis: PageCountBasis,
    /// Whether the whole range was walked; a partial run keeps its checkpoint.
    pub completed: bool,
    pub counts: DiscoveryCounts,
    /// Checkpoint totals including earlier interrupted runs.
    pub total_processed: u64,
    pub total_downloaded: u64,
    pub total_skipped: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Detail page and attachments fetched for one listing row.
struct ScrapedItem {
    payload: serde_json::Value,
    attachment_dir: Option<String>,
    attachment_files: Vec<String>,
}

enum ItemOutcome {
    New,
    Updated,
    Skipped,
    Failed,
}

pub struct DiscoveryStage {
    registry: Arc<SourceRegistry>,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn RecordStore>,
    dedup: ContentDeduplicator,
    attachments: AttachmentStore,
    checkpoints: CheckpointStore,
    sink: Arc<dyn CompletionSink>,
    config: DiscoveryConfig,
}

impl DiscoveryStage {
    pub fn new(
        registry: Arc<SourceRegistry>,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn RecordStore>,
        attachments: AttachmentStore,
        checkpoints: CheckpointStore,
        sink: Arc<dyn CompletionSink>,
        config: DiscoveryConfig,
    ) -> Self {
        let dedup = ContentDeduplicator::new(store.clone(), config.hash_strategy);
        Self {
            registry,
            fetcher,
            store,
            dedup,
            attachments,
            checkpoints,
            sink,
            config,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub async fn run(&self, request: DiscoveryRequest) -> Result<DiscoveryReport, DiscoveryError> {
        let source = self
            .registry
            .get(&request.source_id)
            .ok_or_else(|| DiscoveryError::UnknownSource(request.source_id.clone()))?;
        if !source.enabled {
            return Err(DiscoveryError::SourceDisabled(source.id.clone()));
        }

        let span = info_span!("discovery", source_id = %source.id, range = %request.date_range);
        self.run_source(source, &request).instrument(span).await
    }

    async fn run_source(
        &self,
        source: &SourceConfig,
        request: &DiscoveryRequest,
    ) -> Result<DiscoveryReport, DiscoveryError> {
        let started_at = Utc::now();
        let range = request.date_range;

        let saved = if request.resume {
            self.checkpoints.load(&source.id, &range).await?
        } else {
            None
        };
        let resumed = saved.is_some();
        let mut checkpoint = saved.unwrap_or_else(|| Checkpoint::new(source.id.clone(), range, Uuid::new_v4()));
        let start_page = checkpoint.next_page();
        if resumed {
            info!(
                start_page,
                total_processed = checkpoint.total_processed,
                "resuming from checkpoint"
            );
        }

        let first_url = source.listing_url(start_page, range.from, range.to);
        let first_html = self.fetch_listing(source, start_page, &first_url).await?;
        let page_count = discover_total_pages(source, &first_html)?;
        let last_page = match request.max_pages {
            Some(max) => page_count.total_pages.min(max.max(1)),
            None => page_count.total_pages,
        };
        info!(
            total_pages = page_count.total_pages,
            basis = ?page_count.basis,
            last_page,
            "listing pagination"
        );

        let mut counts = DiscoveryCounts::default();
        let mut last_visited = start_page.saturating_sub(1);
        let mut reached_end = start_page > page_count.total_pages;
        let mut pending_html = Some(first_html);

        for page in start_page..=last_page {
            let page_url = source.listing_url(page, range.from, range.to);
            let html = match pending_html.take() {
                Some(html) => html,
                None => match self.fetch_listing(source, page, &page_url).await {
                    Ok(html) => html,
                    Err(e) => return Err(self.abort(&checkpoint, request, e).await),
                },
            };

            let rows = match parse_listing(source, &html, &page_url) {
                Ok(rows) => rows,
                Err(e) => return Err(self.abort(&checkpoint, request, e.into()).await),
            };
            if rows.is_empty() {
                debug!(page, "empty listing page; treating as end of range");
                last_visited = page;
                reached_end = true;
                break;
            }

            let mut page_counts = DiscoveryCounts::default();
            for (i, row) in rows.iter().enumerate() {
                if i > 0 && !self.config.detail_delay.is_zero() {
                    tokio::time::sleep(self.config.detail_delay).await;
                }
                page_counts.found += 1;
                let outcome = match self.handle_row(source, &range, page, row, request.dry_run, &mut page_counts).await {
                    Ok(outcome) => outcome,
                    Err(e) => return Err(self.abort(&checkpoint, request, e).await),
                };
                match outcome {
                    ItemOutcome::New => page_counts.new += 1,
                    ItemOutcome::Updated => page_counts.updated += 1,
                    ItemOutcome::Skipped => page_counts.skipped += 1,
                    ItemOutcome::Failed => page_counts.failed += 1,
                }
                checkpoint.last_processed_url = Some(row.url.clone());
            }

            accumulate(&mut counts, &page_counts);
            checkpoint.last_processed_page = page;
            checkpoint.total_processed += page_counts.found;
            checkpoint.total_downloaded += page_counts.new + page_counts.updated;
            checkpoint.total_skipped += page_counts.skipped;
            checkpoint.updated_at = Utc::now();
            if !request.dry_run {
                self.checkpoints.save(&checkpoint).await?;
            }
            last_visited = page;
            info!(
                page,
                found = page_counts.found,
                new = page_counts.new,
                skipped = page_counts.skipped,
                failed = page_counts.failed,
                "listing page done"
            );
        }

        let completed = reached_end || last_visited >= page_count.total_pages;
        if completed && !request.dry_run {
            self.checkpoints.clear(&source.id, &range).await?;
            self.sink.discovery_completed(DiscoveryCompleted {
                session_id: checkpoint.session_id,
                source_id: source.id.clone(),
                date_range: range,
                counts,
            });
        } else if !completed {
            info!(last_visited, total_pages = page_count.total_pages, "stopping before end of range; checkpoint kept");
        }

        Ok(DiscoveryReport {
            session_id: checkpoint.session_id,
            source_id: source.id.clone(),
            date_range: range,
            dry_run: request.dry_run,
            resumed,
            start_page,
            last_page_visited: last_visited,
            total_pages: page_count.total_pages,
            page_count_basis: page_count.basis,
            completed,
            counts,
            total_processed: checkpoint.total_processed,
            total_downloaded: checkpoint.total_downloaded,
            total_skipped: checkpoint.total_skipped,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Persist the last completed page before surfacing a fatal error.
    async fn abort(&self, checkpoint: &Checkpoint, request: &DiscoveryRequest, err: DiscoveryError) -> DiscoveryError {
        warn!(
            error = %err,
            last_processed_page = checkpoint.last_processed_page,
            "discovery aborted"
        );
        if !request.dry_run {
            if let Err(save_err) = self.checkpoints.save(checkpoint).await {
                warn!(error = %save_err, "failed to persist checkpoint after fatal error");
            }
        }
        err
    }

    async fn fetch_listing(&self, source: &SourceConfig, page: u32, url: &str) -> Result<String, DiscoveryError> {
        self.fetcher
            .fetch(&source.id, url)
            .await
            .map(|resp| resp.text())
            .map_err(|source| DiscoveryError::Listing {
                page,
                url: url.to_string(),
                source,
            })
    }

    /// Store failures are fatal; anything that goes wrong scraping the item itself is
    /// recorded on the capture.
    async fn handle_row(
        &self,
        source: &SourceConfig,
        range: &DateRange,
        page: u32,
        row: &ListingRow,
        dry_run: bool,
        counts: &mut DiscoveryCounts,
    ) -> Result<ItemOutcome, DiscoveryError> {
        let content_hash = self.dedup.content_hash(row);
        let decision = self.dedup.check(&content_hash, &row.url).await?;

        match decision {
            DedupDecision::Known(capture) => {
                if !dry_run {
                    self.dedup.touch(&capture, Utc::now()).await?;
                }
                Ok(ItemOutcome::Skipped)
            }
            DedupDecision::Rescrape(capture) => {
                if dry_run {
                    return Ok(ItemOutcome::Updated);
                }
                match self.scrape(source, range, page, row, counts).await {
                    Ok(item) => {
                        self.store
                            .update_status(
                                capture.id,
                                StatusUpdate::Rescraped {
                                    raw_payload: item.payload,
                                    attachment_dir: item.attachment_dir,
                                    attachment_files: item.attachment_files,
                                },
                            )
                            .await?;
                        info!(url = %row.url, "re-scraped previously failed announcement");
                        Ok(ItemOutcome::Updated)
                    }
                    Err(e) => {
                        let error = format!("{e:#}");
                        warn!(url = %row.url, error = %error, "re-scrape failed");
                        self.store
                            .update_status(capture.id, StatusUpdate::ScrapingFailed { error })
                            .await?;
                        Ok(ItemOutcome::Failed)
                    }
                }
            }
            DedupDecision::New => {
                if dry_run {
                    return Ok(ItemOutcome::New);
                }
                let (status, error, item) = match self.scrape(source, range, page, row, counts).await {
                    Ok(item) => (ScrapingStatus::Scraped, None, item),
                    Err(e) => {
                        let error = format!("{e:#}");
                        warn!(url = %row.url, error = %error, "scrape failed; recording failure");
                        let payload = serde_json::to_value(row_payload(row)).unwrap_or_default();
                        (
                            ScrapingStatus::ScrapingFailed,
                            Some(error),
                            ScrapedItem {
                                payload,
                                attachment_dir: None,
                                attachment_files: Vec::new(),
                            },
                        )
                    }
                };
                let outcome = self
                    .store
                    .create_if_absent(NewRawCapture {
                        source_id: source.id.clone(),
                        url: row.url.clone(),
                        content_hash,
                        raw_payload: item.payload,
                        attachment_dir: item.attachment_dir,
                        attachment_files: item.attachment_files,
                        scraping_status: status,
                        scraping_error: error,
                        captured_at: Utc::now(),
                    })
                    .await?;
                Ok(match (outcome.was_created(), status) {
                    (false, _) => ItemOutcome::Skipped,
                    (true, ScrapingStatus::ScrapingFailed) => ItemOutcome::Failed,
                    (true, _) => ItemOutcome::New,
                })
            }
        }
    }

    async fn scrape(
        &self,
        source: &SourceConfig,
        range: &DateRange,
        page: u32,
        row: &ListingRow,
        counts: &mut DiscoveryCounts,
    ) -> anyhow::Result<ScrapedItem> {
        let response = self
            .fetcher
            .fetch(&source.id, &row.url)
            .await
            .with_context(|| format!("fetching detail {}", row.url))?;
        let detail = parse_detail(source, &response.text(), row, &row.url)
            .with_context(|| format!("parsing detail {}", row.url))?;

        let mut attachment_files = Vec::new();
        let relative_dir: PathBuf = self.attachments.announcement_dir(range, page, &row.announcement_id);
        let filenames = unique_filenames(detail.attachments.iter().map(|a| a.filename.as_str()));
        for (i, (link, filename)) in detail.attachments.iter().zip(&filenames).enumerate() {
            if i > 0 && !self.config.attachment_delay.is_zero() {
                tokio::time::sleep(self.config.attachment_delay).await;
            }
            let file = self
                .fetcher
                .fetch(&source.id, &link.url)
                .await
                .with_context(|| format!("downloading attachment {}", link.url))?;
            let stored = self
                .attachments
                .write_once(&relative_dir, filename, &file.body)
                .await?;
            if !stored.already_present {
                counts.attachments += 1;
            }
            attachment_files.push(stored.filename);
        }

        let payload = serde_json::to_value(&detail).context("serializing detail capture")?;
        Ok(ScrapedItem {
            payload,
            attachment_dir: (!attachment_files.is_empty()).then(|| relative_dir.to_string_lossy().into_owned()),
            attachment_files,
        })
    }
}

#[derive(Serialize)]
struct RowPayload<'a> {
    announcement_id: &'a str,
    title: &'a str,
    url: &'a str,
    agency: Option<&'a str>,
    period_text: Option<&'a str>,
}

/// What is known about a row whose detail page could not be captured.
fn row_payload(row: &ListingRow) -> RowPayload<'_> {
    RowPayload {
        announcement_id: &row.announcement_id,
        title: &row.title,
        url: &row.url,
        agency: row.agency.as_deref(),
        period_text: row.period_text.as_deref(),
    }
}

fn accumulate(total: &mut DiscoveryCounts, page: &DiscoveryCounts) {
    total.found += page.found;
    total.new += page.new;
    total.updated += page.updated;
    total.skipped += page.skipped;
    total.failed += page.failed;
    total.attachments += page.attachments;
}
