//! Attachment storage, rate-limited HTTP fetching and the record store boundary.

use sha2::{Digest, Sha256};

mod attachments;
mod fetch;
mod postgres;
mod rate_limit;
mod records;

pub use attachments::{sanitize_filename, unique_filenames, AttachmentStore, StoredAttachment};
pub use fetch::{
    classify_reqwest_error, classify_status, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, PageFetcher, RetryDisposition, RetryPolicy,
};
pub use postgres::PgRecordStore;
pub use rate_limit::{RateLimitConfig, RateLimiterRegistry, TokenBucket};
pub use records::{
    CreateOutcome, MemoryRecordStore, RecordStore, StatusUpdate, StoreError, UpsertOutcome,
};

pub const CRATE_NAME: &str = "kfund-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
