use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use kfund_core::{
    CanonicalProgramRecord, NewRawCapture, ProcessingStatus, ProgramStatus, RawCapture,
    ScrapingStatus,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("capture {0} not found")]
    NotFound(Uuid),
    #[error("invalid processing transition {from} -> {to} for capture {id}")]
    InvalidTransition {
        id: Uuid,
        from: ProcessingStatus,
        to: ProcessingStatus,
    },
    #[error("capture {0} is not in a re-scrapable state")]
    NotRescrapable(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(RawCapture),
    Existing(RawCapture),
}

impl CreateOutcome {
    pub fn capture(&self) -> &RawCapture {
        match self {
            CreateOutcome::Created(c) | CreateOutcome::Existing(c) => c,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Status mutations the pipeline performs on a capture.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Processing,
    Processed,
    /// Increments the attempt counter; flags the capture for review once the counter
    /// reaches `max_attempts`.
    ProcessingFailed { error: String, max_attempts: u32 },
    /// A claim outlived its lease; counts as a failed attempt.
    ClaimExpired { max_attempts: u32 },
    /// Replace a failed scrape with a successful one and re-queue it.
    Rescraped {
        raw_payload: serde_json::Value,
        attachment_dir: Option<String>,
        attachment_files: Vec<String>,
    },
    ScrapingFailed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Record store consumed by discovery and the process worker. Every operation is keyed
/// so duplicate delivery is harmless.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_if_absent(&self, capture: NewRawCapture) -> Result<CreateOutcome, StoreError>;
    async fn find_by_url(&self, url: &str) -> Result<Option<RawCapture>, StoreError>;
    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Option<RawCapture>, StoreError>;
    async fn touch(&self, id: Uuid, seen_at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<RawCapture, StoreError>;
    /// Move up to `limit` retryable captures to PROCESSING and hand them out. Claims older
    /// than `lease` are first released as failed attempts so a crashed worker's items return
    /// to the queue or land in review.
    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: u32,
        lease: Duration,
    ) -> Result<Vec<RawCapture>, StoreError>;
    async fn upsert_canonical_program(&self, record: CanonicalProgramRecord) -> Result<UpsertOutcome, StoreError>;
    async fn find_program(&self, content_hash: &str) -> Result<Option<CanonicalProgramRecord>, StoreError>;
    /// Flip ACTIVE programs whose deadline is before `today` to EXPIRED.
    async fn expire_programs(&self, today: NaiveDate) -> Result<u64, StoreError>;
    async fn list_needing_review(&self) -> Result<Vec<RawCapture>, StoreError>;
}

pub(crate) const CLAIM_EXPIRED_ERROR: &str = "claim lease expired before processing finished";

pub(crate) fn apply_status_update(
    capture: &mut RawCapture,
    update: StatusUpdate,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let transition = |capture: &RawCapture, to: ProcessingStatus| {
        if capture.processing_status.can_transition_to(to) {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                id: capture.id,
                from: capture.processing_status,
                to,
            })
        }
    };

    match update {
        StatusUpdate::Processing => {
            transition(capture, ProcessingStatus::Processing)?;
            capture.processing_status = ProcessingStatus::Processing;
            capture.claimed_at = Some(now);
        }
        StatusUpdate::Processed => {
            transition(capture, ProcessingStatus::Processed)?;
            capture.processing_status = ProcessingStatus::Processed;
            capture.processing_error = None;
            capture.processed_at = Some(now);
            capture.claimed_at = None;
        }
        StatusUpdate::ProcessingFailed { error, max_attempts } => {
            transition(capture, ProcessingStatus::ProcessingFailed)?;
            capture.processing_status = ProcessingStatus::ProcessingFailed;
            capture.processing_error = Some(error);
            capture.processing_attempts += 1;
            capture.needs_review = capture.processing_attempts >= max_attempts;
            capture.claimed_at = None;
        }
        StatusUpdate::ClaimExpired { max_attempts } => {
            return apply_status_update(
                capture,
                StatusUpdate::ProcessingFailed {
                    error: CLAIM_EXPIRED_ERROR.to_string(),
                    max_attempts,
                },
                now,
            );
        }
        StatusUpdate::Rescraped {
            raw_payload,
            attachment_dir,
            attachment_files,
        } => {
            if capture.scraping_status != ScrapingStatus::ScrapingFailed {
                return Err(StoreError::NotRescrapable(capture.id));
            }
            capture.scraping_status = ScrapingStatus::Scraped;
            capture.scraping_error = None;
            capture.raw_payload = raw_payload;
            capture.attachment_dir = attachment_dir;
            capture.attachment_count = attachment_files.len() as u32;
            capture.attachment_files = attachment_files;
            capture.processing_status = ProcessingStatus::Pending;
            capture.processing_attempts = 0;
            capture.processing_error = None;
            capture.needs_review = false;
            capture.claimed_at = None;
            capture.last_seen_at = now;
        }
        StatusUpdate::ScrapingFailed { error } => {
            capture.scraping_status = ScrapingStatus::ScrapingFailed;
            capture.scraping_error = Some(error);
            capture.last_seen_at = now;
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryState {
    captures: HashMap<Uuid, RawCapture>,
    programs: HashMap<String, CanonicalProgramRecord>,
}

/// In-process store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn captures(&self) -> Vec<RawCapture> {
        let state = self.state.lock().await;
        let mut out = state.captures.values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| a.captured_at.cmp(&b.captured_at).then(a.url.cmp(&b.url)));
        out
    }

    pub async fn programs(&self) -> Vec<CanonicalProgramRecord> {
        let state = self.state.lock().await;
        let mut out = state.programs.values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
        out
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_if_absent(&self, capture: NewRawCapture) -> Result<CreateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .captures
            .values()
            .find(|c| c.content_hash == capture.content_hash || c.url == capture.url)
        {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }
        let created = capture.into_capture(Uuid::new_v4());
        state.captures.insert(created.id, created.clone());
        Ok(CreateOutcome::Created(created))
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<RawCapture>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.captures.values().find(|c| c.url == url).cloned())
    }

    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Option<RawCapture>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .captures
            .values()
            .find(|c| c.content_hash == content_hash)
            .cloned())
    }

    async fn touch(&self, id: Uuid, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let capture = state.captures.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        capture.last_seen_at = seen_at;
        Ok(())
    }

    async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<RawCapture, StoreError> {
        let mut state = self.state.lock().await;
        let capture = state.captures.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        apply_status_update(capture, update, Utc::now())?;
        Ok(capture.clone())
    }

    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: u32,
        lease: Duration,
    ) -> Result<Vec<RawCapture>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for capture in state.captures.values_mut() {
            if capture.claim_expired(now, lease) {
                apply_status_update(capture, StatusUpdate::ClaimExpired { max_attempts }, now)?;
                warn!(
                    capture_id = %capture.id,
                    attempts = capture.processing_attempts,
                    "claim lease expired; releasing capture"
                );
            }
        }

        let mut candidates = state
            .captures
            .values()
            .filter(|c| c.is_retryable(max_attempts))
            .map(|c| (c.captured_at, c.id))
            .collect::<Vec<_>>();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, id) in candidates.into_iter().take(limit) {
            if let Some(capture) = state.captures.get_mut(&id) {
                apply_status_update(capture, StatusUpdate::Processing, now)?;
                claimed.push(capture.clone());
            }
        }
        Ok(claimed)
    }

    async fn upsert_canonical_program(&self, record: CanonicalProgramRecord) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        match state.programs.get_mut(&record.content_hash) {
            Some(existing) => {
                let mut comparable = existing.clone();
                comparable.updated_at = record.updated_at;
                if comparable == record {
                    return Ok(UpsertOutcome::Unchanged);
                }
                *existing = record;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                state.programs.insert(record.content_hash.clone(), record);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn find_program(&self, content_hash: &str) -> Result<Option<CanonicalProgramRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.programs.get(content_hash).cloned())
    }

    async fn expire_programs(&self, today: NaiveDate) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for program in state.programs.values_mut() {
            if program.status == ProgramStatus::Active
                && ProgramStatus::for_deadline(program.deadline, today) == ProgramStatus::Expired
            {
                program.status = ProgramStatus::Expired;
                program.updated_at = Utc::now();
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn list_needing_review(&self) -> Result<Vec<RawCapture>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .captures
            .values()
            .filter(|c| c.needs_review)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|c| c.captured_at);
        Ok(out)
    }
}
