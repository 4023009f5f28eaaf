use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kfund_core::{ExtractedEligibility, ExtractionTier};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ExtractError;

/// Text handed to every tier for one announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionInput {
    pub title: String,
    pub description: Option<String>,
    pub support_target: Option<String>,
    /// Concatenated detail and attachment text, when any was extracted.
    pub document: Option<String>,
}

impl ExtractionInput {
    /// Description and support-target text, the short context Tiers 1 and 2 read.
    pub fn short_text_body(&self) -> String {
        [self.description.as_deref(), self.support_target.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_document(&self) -> bool {
        self.document.as_deref().is_some_and(|d| !d.trim().is_empty())
    }
}

#[async_trait]
pub trait ExtractorStrategy: Send + Sync {
    fn tier(&self) -> ExtractionTier;

    fn is_applicable(&self, _input: &ExtractionInput) -> bool {
        true
    }

    /// An empty result means no signal. Model usage is reported on the result even when
    /// nothing was extracted.
    async fn extract(&self, input: &ExtractionInput) -> Result<ExtractedEligibility, ExtractError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeMode {
    #[default]
    StopAtFirstSignal,
    MaximizeEnrichment,
}

impl std::str::FromStr for CascadeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop_at_first_signal" | "stop" => Ok(Self::StopAtFirstSignal),
            "maximize_enrichment" | "maximize" => Ok(Self::MaximizeEnrichment),
            other => Err(format!("unknown cascade mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierReport {
    pub tier: ExtractionTier,
    pub populated_fields: usize,
    pub fields_filled: usize,
    pub cost_usd: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CascadeResult {
    pub eligibility: ExtractedEligibility,
    pub reports: Vec<TierReport>,
}

impl CascadeResult {
    pub fn tiers_invoked(&self) -> Vec<ExtractionTier> {
        self.reports.iter().map(|r| r.tier).collect()
    }
}

/// Ordered chain of extractor strategies.
pub struct Cascade {
    strategies: Vec<Arc<dyn ExtractorStrategy>>,
    mode: CascadeMode,
}

impl Cascade {
    pub fn new(mode: CascadeMode) -> Self {
        Self {
            strategies: Vec::new(),
            mode,
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn ExtractorStrategy>) -> Self {
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| s.tier());
        self
    }

    pub fn mode(&self) -> CascadeMode {
        self.mode
    }

    pub fn tiers(&self) -> Vec<ExtractionTier> {
        self.strategies.iter().map(|s| s.tier()).collect()
    }

    /// Run tiers in order up to and including `max_tier`. Lower tiers own every field
    /// they populate; later tiers only fill what is still unset.
    pub async fn run(&self, input: &ExtractionInput, max_tier: ExtractionTier) -> CascadeResult {
        let mut merged = ExtractedEligibility::default();
        let mut reports = Vec::new();

        for strategy in &self.strategies {
            let tier = strategy.tier();
            if tier > max_tier {
                break;
            }
            if self.mode == CascadeMode::StopAtFirstSignal && !merged.is_empty() {
                break;
            }
            if !strategy.is_applicable(input) {
                debug!(tier = %tier, "extractor not applicable");
                continue;
            }

            let (result, error) = match strategy.extract(input).await {
                Ok(result) => (result, None),
                Err(e) => {
                    warn!(tier = %tier, error = %e, "extraction tier failed; treating as no signal");
                    (ExtractedEligibility::default(), Some(e.to_string()))
                }
            };

            let populated = result.populated_field_count();
            let cost_usd = result.total_cost_usd();
            merged.usage.extend(result.usage.iter().cloned());

            let filled = merged.fill_missing_from(&result);
            if populated > 0 {
                if merged.source_tier.is_none() {
                    merged.source_tier = Some(tier);
                }
                merged.confidence = merged.confidence.max(result.confidence);
            }
            info!(tier = %tier, populated, filled, cost_usd, "extraction tier finished");

            reports.push(TierReport {
                tier,
                populated_fields: populated,
                fields_filled: filled,
                cost_usd,
                error,
            });
        }

        CascadeResult {
            eligibility: merged,
            reports,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierStats {
    pub invocations: u64,
    pub with_signal: u64,
    pub fields_filled: u64,
    pub failures: u64,
    pub cost_usd: f64,
}

/// Per-tier totals across a processing run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CascadeStats {
    pub tiers: BTreeMap<ExtractionTier, TierStats>,
}

impl CascadeStats {
    pub fn record(&mut self, result: &CascadeResult) {
        for report in &result.reports {
            let stats = self.tiers.entry(report.tier).or_default();
            stats.invocations += 1;
            if report.populated_fields > 0 {
                stats.with_signal += 1;
            }
            stats.fields_filled += report.fields_filled as u64;
            if report.error.is_some() {
                stats.failures += 1;
            }
            stats.cost_usd += report.cost_usd;
        }
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.tiers.values().map(|s| s.cost_usd).sum()
    }
}
