use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use kfund_storage::RateLimitConfig;
use serde::Deserialize;

use crate::AdapterError;

/// Registry of announcement sources, loaded from `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<(), AdapterError> {
        for (i, source) in self.sources.iter().enumerate() {
            if self.sources[..i].iter().any(|s| s.id == source.id) {
                return Err(AdapterError::Config(format!("duplicate source id {}", source.id)));
            }
            if !source.listing_path.contains("{page}") {
                return Err(AdapterError::Config(format!(
                    "listing_path for {} has no {{page}} placeholder",
                    source.id
                )));
            }
            if source.pagination.page_size == 0 {
                return Err(AdapterError::Config(format!("page_size for {} must be positive", source.id)));
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_url: String,
    /// Path (or absolute URL) with `{page}`, `{from}` and `{to}` placeholders.
    pub listing_path: String,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    /// Query parameter carrying the announcement id on detail links.
    pub id_param: String,
    pub listing: ListingSelectors,
    pub detail: DetailSelectors,
    pub pagination: PaginationRule,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl SourceConfig {
    pub fn listing_url(&self, page: u32, from: NaiveDate, to: NaiveDate) -> String {
        let path = self
            .listing_path
            .replace("{page}", &page.to_string())
            .replace("{from}", &from.format(&self.date_format).to_string())
            .replace("{to}", &to.format(&self.date_format).to_string());
        if path.starts_with("http://") || path.starts_with("https://") {
            path
        } else {
            format!("{}{}", self.base_url.trim_end_matches('/'), path)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingSelectors {
    pub row: String,
    /// Anchor leading to the detail page. Its text is the listing title.
    pub link: String,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub posted_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetailSelectors {
    pub title: String,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub support_target: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub attachments: Option<String>,
}

/// How the number of listing pages is determined.
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationRule {
    pub page_size: u32,
    #[serde(default = "default_total_count_pattern")]
    pub total_count_pattern: String,
    #[serde(default)]
    pub link_selector: Option<String>,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_true() -> bool {
    true
}

fn default_date_format() -> String {
    "%Y-%m-%d".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_total_count_pattern() -> String {
    r"총\s*([\d,]+)\s*건".to_string()
}

fn default_page_param() -> String {
    "cpage".to_string()
}

fn default_max_pages() -> u32 {
    200
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
sources:
  - id: bizinfo
    display_name: 기업마당
    base_url: https://www.bizinfo.go.kr/
    listing_path: /list.do?cpage={page}&startDate={from}&endDate={to}
    id_param: pblancId
    listing:
      row: "tbody tr"
      link: "td.title a"
    detail:
      title: "h2.title"
    pagination:
      page_size: 15
    rate_limit:
      capacity: 2
      refill_every_ms: 1500
"#;

    #[test]
    fn loads_defaults_and_expands_listing_template() {
        let registry = SourceRegistry::from_yaml(YAML).unwrap();
        let source = registry.get("bizinfo").unwrap();
        assert!(source.enabled);
        assert_eq!(source.pagination.max_pages, 200);
        assert_eq!(source.rate_limit.capacity, 2);
        let from = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2026, 1, 31).unwrap();
        assert_eq!(
            source.listing_url(3, from, to),
            "https://www.bizinfo.go.kr/list.do?cpage=3&startDate=2026-01-01&endDate=2026-01-31"
        );
    }

    #[test]
    fn rejects_duplicate_ids() {
        let doubled = format!("{YAML}{}", YAML.replace("sources:\n", ""));
        assert!(SourceRegistry::from_yaml(&doubled).is_err());
    }
}
