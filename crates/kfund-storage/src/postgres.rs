use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use kfund_core::{CanonicalProgramRecord, NewRawCapture, ProgramStatus, RawCapture};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::records::{
    apply_status_update, CreateOutcome, CLAIM_EXPIRED_ERROR, RecordStore, StatusUpdate, StoreError, UpsertOutcome,
};

const CAPTURE_COLUMNS: &str = "id, source_id, url, content_hash, raw_payload, attachment_dir, \
     attachment_files, attachment_count, scraping_status, scraping_error, processing_status, \
     processing_error, processing_attempts, needs_review, captured_at, last_seen_at, processed_at, \
     claimed_at";

/// Postgres-backed record store. Rows are the durable work queue for the worker pool.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn lock_capture(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<RawCapture, StoreError> {
        let sql = format!("SELECT {CAPTURE_COLUMNS} FROM raw_captures WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        capture_from_row(&row)
    }

    async fn write_capture(
        tx: &mut Transaction<'_, Postgres>,
        capture: &RawCapture,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE raw_captures
               SET raw_payload = $2,
                   attachment_dir = $3,
                   attachment_files = $4,
                   attachment_count = $5,
                   scraping_status = $6,
                   scraping_error = $7,
                   processing_status = $8,
                   processing_error = $9,
                   processing_attempts = $10,
                   needs_review = $11,
                   last_seen_at = $12,
                   processed_at = $13,
                   claimed_at = $14
             WHERE id = $1
            "#,
        )
        .bind(capture.id)
        .bind(&capture.raw_payload)
        .bind(&capture.attachment_dir)
        .bind(serde_json::json!(capture.attachment_files))
        .bind(capture.attachment_count as i32)
        .bind(capture.scraping_status.as_str())
        .bind(&capture.scraping_error)
        .bind(capture.processing_status.as_str())
        .bind(&capture.processing_error)
        .bind(capture.processing_attempts as i32)
        .bind(capture.needs_review)
        .bind(capture.last_seen_at)
        .bind(capture.processed_at)
        .bind(capture.claimed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn find_one(&self, column: &str, value: &str) -> Result<Option<RawCapture>, StoreError> {
        let sql = format!("SELECT {CAPTURE_COLUMNS} FROM raw_captures WHERE {column} = $1");
        let row = sqlx::query(&sql).bind(value).fetch_optional(&self.pool).await?;
        row.as_ref().map(capture_from_row).transpose()
    }
}

fn capture_from_row(row: &PgRow) -> Result<RawCapture, StoreError> {
    let attachment_files: serde_json::Value = row.try_get("attachment_files")?;
    let attachment_files = serde_json::from_value::<Vec<String>>(attachment_files)
        .map_err(|e| StoreError::Corrupt(format!("attachment_files: {e}")))?;
    let scraping_status: String = row.try_get("scraping_status")?;
    let processing_status: String = row.try_get("processing_status")?;
    let attachment_count: i32 = row.try_get("attachment_count")?;
    let processing_attempts: i32 = row.try_get("processing_attempts")?;

    Ok(RawCapture {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        url: row.try_get("url")?,
        content_hash: row.try_get("content_hash")?,
        raw_payload: row.try_get("raw_payload")?,
        attachment_dir: row.try_get("attachment_dir")?,
        attachment_files,
        attachment_count: attachment_count.max(0) as u32,
        scraping_status: scraping_status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        scraping_error: row.try_get("scraping_error")?,
        processing_status: processing_status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        processing_error: row.try_get("processing_error")?,
        processing_attempts: processing_attempts.max(0) as u32,
        needs_review: row.try_get("needs_review")?,
        captured_at: row.try_get("captured_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        processed_at: row.try_get("processed_at")?,
        claimed_at: row.try_get("claimed_at")?,
    })
}

fn program_from_row(row: &PgRow) -> Result<CanonicalProgramRecord, StoreError> {
    let data: serde_json::Value = row.try_get("data_json")?;
    serde_json::from_value(data).map_err(|e| StoreError::Corrupt(format!("program data_json: {e}")))
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create_if_absent(&self, capture: NewRawCapture) -> Result<CreateOutcome, StoreError> {
        let candidate = capture.into_capture(Uuid::new_v4());
        let sql = format!(
            "INSERT INTO raw_captures ({CAPTURE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) \
             ON CONFLICT DO NOTHING RETURNING {CAPTURE_COLUMNS}"
        );
        let inserted = sqlx::query(&sql)
            .bind(candidate.id)
            .bind(&candidate.source_id)
            .bind(&candidate.url)
            .bind(&candidate.content_hash)
            .bind(&candidate.raw_payload)
            .bind(&candidate.attachment_dir)
            .bind(serde_json::json!(candidate.attachment_files))
            .bind(candidate.attachment_count as i32)
            .bind(candidate.scraping_status.as_str())
            .bind(&candidate.scraping_error)
            .bind(candidate.processing_status.as_str())
            .bind(&candidate.processing_error)
            .bind(candidate.processing_attempts as i32)
            .bind(candidate.needs_review)
            .bind(candidate.captured_at)
            .bind(candidate.last_seen_at)
            .bind(candidate.processed_at)
            .bind(candidate.claimed_at)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = inserted {
            return Ok(CreateOutcome::Created(capture_from_row(&row)?));
        }

        let sql = format!(
            "SELECT {CAPTURE_COLUMNS} FROM raw_captures WHERE content_hash = $1 OR url = $2 LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(&candidate.content_hash)
            .bind(&candidate.url)
            .fetch_one(&self.pool)
            .await?;
        Ok(CreateOutcome::Existing(capture_from_row(&row)?))
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<RawCapture>, StoreError> {
        self.find_one("url", url).await
    }

    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Option<RawCapture>, StoreError> {
        self.find_one("content_hash", content_hash).await
    }

    async fn touch(&self, id: Uuid, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE raw_captures SET last_seen_at = $2 WHERE id = $1")
            .bind(id)
            .bind(seen_at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<RawCapture, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut capture = Self::lock_capture(&mut tx, id).await?;
        apply_status_update(&mut capture, update, Utc::now())?;
        Self::write_capture(&mut tx, &capture).await?;
        tx.commit().await?;
        Ok(capture)
    }

    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: u32,
        lease: Duration,
    ) -> Result<Vec<RawCapture>, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let released = sqlx::query(
            r#"
            UPDATE raw_captures
               SET processing_status = 'PROCESSING_FAILED',
                   processing_error = $3,
                   processing_attempts = processing_attempts + 1,
                   needs_review = processing_attempts + 1 >= $2,
                   claimed_at = NULL
             WHERE processing_status = 'PROCESSING'
               AND (claimed_at IS NULL OR claimed_at <= $1)
            "#,
        )
        .bind(now - lease)
        .bind(max_attempts as i32)
        .bind(CLAIM_EXPIRED_ERROR)
        .execute(&mut *tx)
        .await?;
        if released.rows_affected() > 0 {
            warn!(released = released.rows_affected(), "claim leases expired; captures released");
        }

        let sql = format!(
            r#"
            UPDATE raw_captures
               SET processing_status = 'PROCESSING',
                   claimed_at = $3
             WHERE id IN (
                   SELECT id
                     FROM raw_captures
                    WHERE scraping_status = 'SCRAPED'
                      AND NOT needs_review
                      AND (processing_status = 'PENDING'
                           OR (processing_status = 'PROCESSING_FAILED' AND processing_attempts < $2))
                    ORDER BY captured_at
                    LIMIT $1
                      FOR UPDATE SKIP LOCKED)
            RETURNING {CAPTURE_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(max_attempts as i32)
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        rows.iter().map(capture_from_row).collect()
    }

    async fn upsert_canonical_program(&self, record: CanonicalProgramRecord) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query("SELECT data_json FROM programs WHERE content_hash = $1 FOR UPDATE")
            .bind(&record.content_hash)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match existing.as_ref().map(program_from_row).transpose()? {
            Some(mut current) => {
                current.updated_at = record.updated_at;
                if current == record {
                    UpsertOutcome::Unchanged
                } else {
                    UpsertOutcome::Updated
                }
            }
            None => UpsertOutcome::Inserted,
        };

        if outcome != UpsertOutcome::Unchanged {
            let data = serde_json::to_value(&record)
                .map_err(|e| StoreError::Corrupt(format!("serializing program: {e}")))?;
            sqlx::query(
                r#"
                INSERT INTO programs (content_hash, id, status, deadline, data_json, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (content_hash) DO UPDATE
                   SET status = EXCLUDED.status,
                       deadline = EXCLUDED.deadline,
                       data_json = EXCLUDED.data_json,
                       updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&record.content_hash)
            .bind(record.id)
            .bind(record.status.as_str())
            .bind(record.deadline)
            .bind(data)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn find_program(&self, content_hash: &str) -> Result<Option<CanonicalProgramRecord>, StoreError> {
        let row = sqlx::query("SELECT data_json FROM programs WHERE content_hash = $1")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(program_from_row).transpose()
    }

    async fn expire_programs(&self, today: NaiveDate) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE programs
               SET status = $2,
                   data_json = jsonb_set(data_json, '{status}', to_jsonb($2::text)),
                   updated_at = now()
             WHERE status = $3
               AND deadline IS NOT NULL
               AND deadline < $1
            "#,
        )
        .bind(today)
        .bind(ProgramStatus::Expired.as_str())
        .bind(ProgramStatus::Active.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_needing_review(&self) -> Result<Vec<RawCapture>, StoreError> {
        let sql = format!(
            "SELECT {CAPTURE_COLUMNS} FROM raw_captures WHERE needs_review ORDER BY captured_at"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(capture_from_row).collect()
    }
}
