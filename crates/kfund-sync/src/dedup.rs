//! Content-hash identity for announcements.
//!
//! Hashes carry a `v{version}:{strategy}:` prefix so a store can hold records from two
//! hash definitions while a migration is in progress.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kfund_adapters::{parse_period, ListingRow};
use kfund_core::{RawCapture, ScrapingStatus};
use kfund_storage::{sha256_hex, RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CONTENT_HASH_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashStrategy {
    /// Announcement URL without fragment.
    #[default]
    Url,
    /// Title, deadline and agency from the listing row; survives URL changes.
    TitleDeadlineAgency,
}

impl HashStrategy {
    fn tag(self) -> &'static str {
        match self {
            HashStrategy::Url => "url",
            HashStrategy::TitleDeadlineAgency => "tda",
        }
    }

    /// Hash of a listing row, computed before the detail page is fetched.
    pub fn content_hash(self, row: &ListingRow) -> String {
        let material = match self {
            HashStrategy::Url => normalize_url(&row.url),
            HashStrategy::TitleDeadlineAgency => {
                let deadline = row
                    .period_text
                    .as_deref()
                    .and_then(|p| parse_period(p).1)
                    .map(|d| d.to_string())
                    .unwrap_or_default();
                let title = row.title.split_whitespace().collect::<Vec<_>>().join(" ");
                let agency = row.agency.as_deref().map(str::trim).unwrap_or_default();
                format!("{title}\u{1f}{deadline}\u{1f}{agency}")
            }
        };
        format!(
            "v{CONTENT_HASH_VERSION}:{}:{}",
            self.tag(),
            sha256_hex(material.as_bytes())
        )
    }
}

impl FromStr for HashStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "url" => Ok(HashStrategy::Url),
            "title_deadline_agency" | "tda" => Ok(HashStrategy::TitleDeadlineAgency),
            other => Err(format!("unknown content hash strategy: {other}")),
        }
    }
}

fn normalize_url(url: &str) -> String {
    let url = url.trim();
    url.split_once('#').map(|(head, _)| head).unwrap_or(url).to_string()
}

#[derive(Debug, Clone)]
pub enum DedupDecision {
    New,
    /// Already captured; only the last-seen time changes.
    Known(RawCapture),
    /// Captured before but the scrape failed; fetch it again.
    Rescrape(RawCapture),
}

pub struct ContentDeduplicator {
    store: Arc<dyn RecordStore>,
    strategy: HashStrategy,
}

impl ContentDeduplicator {
    pub fn new(store: Arc<dyn RecordStore>, strategy: HashStrategy) -> Self {
        Self { store, strategy }
    }

    pub fn strategy(&self) -> HashStrategy {
        self.strategy
    }

    pub fn content_hash(&self, row: &ListingRow) -> String {
        self.strategy.content_hash(row)
    }

    /// A URL recorded under a different hash definition still counts as known.
    pub async fn check(&self, content_hash: &str, url: &str) -> Result<DedupDecision, StoreError> {
        let existing = match self.store.find_by_content_hash(content_hash).await? {
            Some(capture) => Some(capture),
            None => self.store.find_by_url(url).await?,
        };
        Ok(match existing {
            None => DedupDecision::New,
            Some(capture) if capture.scraping_status == ScrapingStatus::ScrapingFailed => {
                DedupDecision::Rescrape(capture)
            }
            Some(capture) => {
                debug!(url, content_hash, "known announcement");
                DedupDecision::Known(capture)
            }
        })
    }

    pub async fn touch(&self, capture: &RawCapture, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.store.touch(capture.id, seen_at).await
    }
}
