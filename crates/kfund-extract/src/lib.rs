//! Eligibility extraction: document text, announcement classification and the
//! three-tier extraction cascade.

use std::path::PathBuf;

use thiserror::Error;

pub mod cascade;
pub mod classify;
pub mod hwpx;
pub mod llm;
pub mod schema;
pub mod text;
pub mod tier1;
pub mod tier2;
pub mod tier3;

pub use cascade::{Cascade, CascadeMode, CascadeResult, CascadeStats, ExtractionInput, ExtractorStrategy, TierReport, TierStats};
pub use classify::classify_announcement;
pub use llm::{AnthropicProvider, CallPacer, Completion, InferenceProvider, ModelPrice, ModelTier};
pub use schema::{SchemaError, RESPONSE_SCHEMA_VERSION};
pub use text::{html_to_text, ConverterCommand, EligibilityDocument, TextExtractor, TextExtractorConfig};
pub use tier1::{extract_tier1, Tier1Extractor};
pub use tier2::Tier2Extractor;
pub use tier3::Tier3Extractor;

pub const CRATE_NAME: &str = "kfund-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("inference provider error: {0}")]
    Provider(String),
    #[error("inference provider returned {status}: {body}")]
    ProviderStatus { status: u16, body: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("converting {path}: {message}")]
    Conversion { path: PathBuf, message: String },
    #[error("converting {path} timed out")]
    ConversionTimeout { path: PathBuf },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
