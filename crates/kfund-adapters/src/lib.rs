//! Source registry and fixture-tested parsers for agency listing and detail pages.

use thiserror::Error;

mod dates;
mod detail;
mod html;
mod listing;
mod registry;

pub use dates::{find_dates, parse_period};
pub use detail::parse_detail;
pub use listing::{discover_total_pages, parse_listing, ListingRow, PageCount, PageCountBasis};
pub use registry::{DetailSelectors, ListingSelectors, PaginationRule, SourceConfig, SourceRegistry};

pub const CRATE_NAME: &str = "kfund-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("source config: {0}")]
    Config(String),
}
