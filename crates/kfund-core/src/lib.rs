//! Core domain model for funding-program ingestion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "kfund-core";

/// One 억원. Revenue bounds are stored in this unit.
pub const HUNDRED_MILLION_KRW: u64 = 100_000_000;

/// Current version of the [`DetailCapture`] payload written by discovery.
pub const DETAIL_PAYLOAD_VERSION: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseEnumError {
    #[error("unknown {kind} value: {value}")]
    Unknown { kind: &'static str, value: String },
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError::Unknown {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScrapingStatus {
    Pending,
    Scraped,
    ScrapingFailed,
}

string_enum!(ScrapingStatus, "scraping status", {
    Pending => "PENDING",
    Scraped => "SCRAPED",
    ScrapingFailed => "SCRAPING_FAILED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Processed,
    ProcessingFailed,
}

string_enum!(ProcessingStatus, "processing status", {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Processed => "PROCESSED",
    ProcessingFailed => "PROCESSING_FAILED",
});

impl ProcessingStatus {
    /// Allowed moves: PENDING -> PROCESSING -> {PROCESSED, PROCESSING_FAILED}, plus
    /// PROCESSING_FAILED -> PROCESSING for a retry.
    pub fn can_transition_to(self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (ProcessingFailed, Processing)
                | (Processing, Processed)
                | (Processing, ProcessingFailed)
        )
    }
}

/// Inclusive announcement date range a discovery run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("date range start {from} is after end {to}")]
pub struct InvalidDateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, InvalidDateRange> {
        if from > to {
            return Err(InvalidDateRange { from, to });
        }
        Ok(Self { from, to })
    }

    /// Folder segment used for attachment paths and checkpoint names.
    pub fn folder_name(&self) -> String {
        format!("{}_{}", self.from.format("%Y%m%d"), self.to.format("%Y%m%d"))
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

/// One attachment link found on a detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentLink {
    pub url: String,
    pub filename: String,
}

/// Raw fields captured from a detail page. Stored verbatim as the capture payload and
/// read back by the process worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailCapture {
    pub payload_version: u32,
    pub announcement_id: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub support_target: Option<String>,
    #[serde(default)]
    pub period_text: Option<String>,
    #[serde(default)]
    pub application_start: Option<NaiveDate>,
    #[serde(default)]
    pub deadline: Option<NaiveDate>,
    #[serde(default)]
    pub attachments: Vec<AttachmentLink>,
    pub raw_html: String,
}

/// Persisted result of discovery for one announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCapture {
    pub id: Uuid,
    pub source_id: String,
    pub url: String,
    pub content_hash: String,
    pub raw_payload: serde_json::Value,
    pub attachment_dir: Option<String>,
    pub attachment_files: Vec<String>,
    pub attachment_count: u32,
    pub scraping_status: ScrapingStatus,
    pub scraping_error: Option<String>,
    pub processing_status: ProcessingStatus,
    pub processing_error: Option<String>,
    pub processing_attempts: u32,
    pub needs_review: bool,
    pub captured_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Set while PROCESSING; a worker that dies leaves it behind as an expired lease.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl RawCapture {
    pub fn detail(&self) -> serde_json::Result<DetailCapture> {
        serde_json::from_value(self.raw_payload.clone())
    }

    /// True when the worker may still pick this capture up.
    pub fn is_retryable(&self, max_attempts: u32) -> bool {
        self.scraping_status == ScrapingStatus::Scraped
            && !self.needs_review
            && match self.processing_status {
                ProcessingStatus::Pending => true,
                ProcessingStatus::ProcessingFailed => self.processing_attempts < max_attempts,
                _ => false,
            }
    }

    /// A PROCESSING capture whose claim is older than `lease` belongs to a worker that is gone.
    pub fn claim_expired(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        self.processing_status == ProcessingStatus::Processing
            && self.claimed_at.is_none_or(|claimed| claimed + lease <= now)
    }
}

/// Fields discovery supplies when creating a capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRawCapture {
    pub source_id: String,
    pub url: String,
    pub content_hash: String,
    pub raw_payload: serde_json::Value,
    pub attachment_dir: Option<String>,
    pub attachment_files: Vec<String>,
    pub scraping_status: ScrapingStatus,
    pub scraping_error: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl NewRawCapture {
    pub fn into_capture(self, id: Uuid) -> RawCapture {
        RawCapture {
            id,
            attachment_count: self.attachment_files.len() as u32,
            source_id: self.source_id,
            url: self.url,
            content_hash: self.content_hash,
            raw_payload: self.raw_payload,
            attachment_dir: self.attachment_dir,
            attachment_files: self.attachment_files,
            scraping_status: self.scraping_status,
            scraping_error: self.scraping_error,
            processing_status: ProcessingStatus::Pending,
            processing_error: None,
            processing_attempts: 0,
            needs_review: false,
            captured_at: self.captured_at,
            last_seen_at: self.captured_at,
            processed_at: None,
            claimed_at: None,
        }
    }
}

/// Resumability snapshot written after every listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: String,
    pub date_range: DateRange,
    pub session_id: Uuid,
    pub last_processed_page: u32,
    pub last_processed_url: Option<String>,
    pub total_processed: u64,
    pub total_downloaded: u64,
    pub total_skipped: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(source_id: impl Into<String>, date_range: DateRange, session_id: Uuid) -> Self {
        Self {
            source_id: source_id.into(),
            date_range,
            session_id,
            last_processed_page: 0,
            last_processed_url: None,
            total_processed: 0,
            total_downloaded: 0,
            total_skipped: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn next_page(&self) -> u32 {
        self.last_processed_page + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

string_enum!(Confidence, "confidence", {
    Low => "LOW",
    Medium => "MEDIUM",
    High => "HIGH",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExtractionTier {
    Tier1,
    Tier2,
    Tier3,
}

string_enum!(ExtractionTier, "extraction tier", {
    Tier1 => "TIER1",
    Tier2 => "TIER2",
    Tier3 => "TIER3",
});

/// Token and cost accounting for one model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tier: ExtractionTier,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
}

/// Common output schema of every extraction tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEligibility {
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub company_scale: Vec<String>,
    pub min_employees: Option<u32>,
    pub max_employees: Option<u32>,
    /// 억원, one decimal place.
    pub min_revenue: Option<f64>,
    /// 억원, one decimal place.
    pub max_revenue: Option<f64>,
    pub min_business_age: Option<u32>,
    pub max_business_age: Option<u32>,
    #[serde(default)]
    pub required_certs: Vec<String>,
    pub target_industry: Option<String>,
    #[serde(default)]
    pub exclusion_conditions: Vec<String>,
    /// KRW.
    pub support_amount_min: Option<u64>,
    /// KRW.
    pub support_amount_max: Option<u64>,
    pub confidence: Confidence,
    pub source_tier: Option<ExtractionTier>,
    #[serde(default)]
    pub usage: Vec<TokenUsage>,
}

impl Default for ExtractedEligibility {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            company_scale: Vec::new(),
            min_employees: None,
            max_employees: None,
            min_revenue: None,
            max_revenue: None,
            min_business_age: None,
            max_business_age: None,
            required_certs: Vec::new(),
            target_industry: None,
            exclusion_conditions: Vec::new(),
            support_amount_min: None,
            support_amount_max: None,
            confidence: Confidence::Low,
            source_tier: None,
            usage: Vec::new(),
        }
    }
}

impl ExtractedEligibility {
    pub fn populated_field_count(&self) -> usize {
        [
            !self.regions.is_empty(),
            !self.company_scale.is_empty(),
            self.min_employees.is_some(),
            self.max_employees.is_some(),
            self.min_revenue.is_some(),
            self.max_revenue.is_some(),
            self.min_business_age.is_some(),
            self.max_business_age.is_some(),
            !self.required_certs.is_empty(),
            self.target_industry.is_some(),
            !self.exclusion_conditions.is_empty(),
            self.support_amount_min.is_some(),
            self.support_amount_max.is_some(),
        ]
        .into_iter()
        .filter(|populated| *populated)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.populated_field_count() == 0
    }

    /// Copy fields that are still unset here from `other`. Populated fields are never
    /// overwritten. Returns how many fields were filled.
    pub fn fill_missing_from(&mut self, other: &ExtractedEligibility) -> usize {
        fn fill_vec(dst: &mut Vec<String>, src: &[String]) -> usize {
            if dst.is_empty() && !src.is_empty() {
                *dst = src.to_vec();
                1
            } else {
                0
            }
        }
        fn fill_opt<T: Clone>(dst: &mut Option<T>, src: &Option<T>) -> usize {
            if dst.is_none() && src.is_some() {
                *dst = src.clone();
                1
            } else {
                0
            }
        }

        let mut filled = 0;
        filled += fill_vec(&mut self.regions, &other.regions);
        filled += fill_vec(&mut self.company_scale, &other.company_scale);
        filled += fill_opt(&mut self.min_employees, &other.min_employees);
        filled += fill_opt(&mut self.max_employees, &other.max_employees);
        filled += fill_opt(&mut self.min_revenue, &other.min_revenue);
        filled += fill_opt(&mut self.max_revenue, &other.max_revenue);
        filled += fill_opt(&mut self.min_business_age, &other.min_business_age);
        filled += fill_opt(&mut self.max_business_age, &other.max_business_age);
        filled += fill_vec(&mut self.required_certs, &other.required_certs);
        filled += fill_opt(&mut self.target_industry, &other.target_industry);
        filled += fill_vec(&mut self.exclusion_conditions, &other.exclusion_conditions);
        filled += fill_opt(&mut self.support_amount_min, &other.support_amount_min);
        filled += fill_opt(&mut self.support_amount_max, &other.support_amount_max);
        filled
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.usage.iter().map(|u| u.cost_usd).sum()
    }
}

/// Round to the one-decimal precision revenue is stored with.
pub fn round_revenue(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnnouncementType {
    Funding,
    Survey,
    Notice,
    Event,
}

string_enum!(AnnouncementType, "announcement type", {
    Funding => "FUNDING",
    Survey => "SURVEY",
    Notice => "NOTICE",
    Event => "EVENT",
});

impl AnnouncementType {
    /// Only funding opportunities reach the matching engine.
    pub fn is_matchable(self) -> bool {
        self == AnnouncementType::Funding
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgramStatus {
    Active,
    Expired,
}

string_enum!(ProgramStatus, "program status", {
    Active => "ACTIVE",
    Expired => "EXPIRED",
});

impl ProgramStatus {
    pub fn for_deadline(deadline: Option<NaiveDate>, today: NaiveDate) -> Self {
        match deadline {
            Some(d) if d < today => ProgramStatus::Expired,
            _ => ProgramStatus::Active,
        }
    }
}

/// Eligibility expressed only in canonical codes and numeric ranges.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedEligibility {
    pub region_codes: Vec<String>,
    pub scale_codes: Vec<String>,
    pub cert_codes: Vec<String>,
    pub business_age_brackets: Vec<String>,
    pub revenue_brackets: Vec<String>,
    pub employee_brackets: Vec<String>,
    pub min_employees: Option<u32>,
    pub max_employees: Option<u32>,
    pub min_revenue: Option<f64>,
    pub max_revenue: Option<f64>,
    pub min_business_age: Option<u32>,
    pub max_business_age: Option<u32>,
    pub target_industry: Option<String>,
    pub exclusion_conditions: Vec<String>,
    pub support_amount_min: Option<u64>,
    pub support_amount_max: Option<u64>,
}

/// Normalized entity handed to the matching engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProgramRecord {
    pub id: Uuid,
    pub content_hash: String,
    pub source_id: String,
    pub announcement_id: String,
    pub url: String,
    pub title: String,
    pub agency: Option<String>,
    pub application_start: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub announcement_type: AnnouncementType,
    pub matchable: bool,
    pub eligibility: NormalizedEligibility,
    pub confidence: Confidence,
    pub source_tier: Option<ExtractionTier>,
    pub extraction_cost_usd: f64,
    pub status: ProgramStatus,
    pub updated_at: DateTime<Utc>,
}

/// Stable program id derived from the content hash, so repeated upserts keep one id.
pub fn program_id_for(content_hash: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, content_hash.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn processing_status_only_moves_forward() {
        use ProcessingStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processed));
        assert!(Processing.can_transition_to(ProcessingFailed));
        assert!(ProcessingFailed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Processed));
        assert!(!Processed.can_transition_to(Processing));
        assert!(!Processed.can_transition_to(Pending));
    }

    #[test]
    fn status_strings_round_trip_through_from_str() {
        assert_eq!("PROCESSING_FAILED".parse::<ProcessingStatus>(), Ok(ProcessingStatus::ProcessingFailed));
        assert_eq!(ScrapingStatus::ScrapingFailed.as_str(), "SCRAPING_FAILED");
        assert!("DONE".parse::<ProcessingStatus>().is_err());
    }

    #[test]
    fn date_range_rejects_reversed_bounds_and_names_folder() {
        assert!(DateRange::new(date(2026, 2, 1), date(2026, 1, 1)).is_err());
        let range = DateRange::new(date(2026, 1, 1), date(2026, 1, 31)).unwrap();
        assert_eq!(range.folder_name(), "20260101_20260131");
    }

    #[test]
    fn fill_missing_never_overwrites_populated_fields() {
        let mut lower = ExtractedEligibility {
            regions: vec!["SEOUL".into()],
            max_revenue: Some(50.0),
            ..Default::default()
        };
        let higher = ExtractedEligibility {
            regions: vec!["BUSAN".into()],
            max_revenue: Some(10.0),
            min_employees: Some(5),
            target_industry: Some("제조업".into()),
            ..Default::default()
        };
        let filled = lower.fill_missing_from(&higher);
        assert_eq!(filled, 2);
        assert_eq!(lower.regions, vec!["SEOUL".to_string()]);
        assert_eq!(lower.max_revenue, Some(50.0));
        assert_eq!(lower.min_employees, Some(5));
        assert_eq!(lower.target_industry.as_deref(), Some("제조업"));
    }

    #[test]
    fn retryable_respects_attempt_limit_and_review_flag() {
        let mut capture = NewRawCapture {
            source_id: "bizinfo".into(),
            url: "https://example.test/a".into(),
            content_hash: "v1:abc".into(),
            raw_payload: serde_json::Value::Null,
            attachment_dir: None,
            attachment_files: vec![],
            scraping_status: ScrapingStatus::Scraped,
            scraping_error: None,
            captured_at: Utc::now(),
        }
        .into_capture(Uuid::new_v4());
        assert!(capture.is_retryable(3));

        capture.processing_status = ProcessingStatus::ProcessingFailed;
        capture.processing_attempts = 2;
        assert!(capture.is_retryable(3));
        capture.processing_attempts = 3;
        assert!(!capture.is_retryable(3));

        capture.processing_attempts = 1;
        capture.needs_review = true;
        assert!(!capture.is_retryable(3));
    }

    #[test]
    fn claim_expires_only_while_processing() {
        let now = Utc::now();
        let lease = chrono::Duration::minutes(15);
        let mut capture = NewRawCapture {
            source_id: "bizinfo".into(),
            url: "https://example.test/a".into(),
            content_hash: "v1:abc".into(),
            raw_payload: serde_json::Value::Null,
            attachment_dir: None,
            attachment_files: vec![],
            scraping_status: ScrapingStatus::Scraped,
            scraping_error: None,
            captured_at: now,
        }
        .into_capture(Uuid::new_v4());
        assert!(!capture.claim_expired(now, lease));

        capture.processing_status = ProcessingStatus::Processing;
        capture.claimed_at = Some(now - chrono::Duration::minutes(5));
        assert!(!capture.claim_expired(now, lease));
        capture.claimed_at = Some(now - chrono::Duration::minutes(20));
        assert!(capture.claim_expired(now, lease));
        capture.claimed_at = None;
        assert!(capture.claim_expired(now, lease));
    }

    #[test]
    fn program_status_expires_after_deadline() {
        let today = date(2026, 3, 1);
        assert_eq!(ProgramStatus::for_deadline(Some(date(2026, 2, 28)), today), ProgramStatus::Expired);
        assert_eq!(ProgramStatus::for_deadline(Some(today), today), ProgramStatus::Active);
        assert_eq!(ProgramStatus::for_deadline(None, today), ProgramStatus::Active);
    }

    #[test]
    fn program_id_is_stable_per_hash() {
        assert_eq!(program_id_for("v1:abc"), program_id_for("v1:abc"));
        assert_ne!(program_id_for("v1:abc"), program_id_for("v1:abd"));
    }
}
