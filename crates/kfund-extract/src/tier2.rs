//! Short-context model fallback over the title and a truncated description.

use std::sync::Arc;

use async_trait::async_trait;
use kfund_core::{Confidence, ExtractedEligibility, ExtractionTier};
use tracing::warn;

use crate::cascade::{ExtractionInput, ExtractorStrategy};
use crate::llm::{paced_completion, truncate_chars, CallPacer, InferenceProvider, ModelTier};
use crate::schema::parse_tier2_response;
use crate::ExtractError;

pub const TIER2_MAX_INPUT_CHARS: usize = 3_000;
const TIER2_MAX_TOKENS: u32 = 512;

const TIER2_PROMPT: &str = r#"You extract eligibility constraints from a Korean government funding announcement.
Reply with a single JSON object and nothing else, using exactly these fields:
{
  "schema_version": 1,
  "regions": [Korean province names such as "서울", "경기도", or "전국" for nationwide],
  "company_scale": [labels from: 예비창업자, 소상공인, 소공인, 소기업, 중소기업, 중견기업, 대기업, 창업기업],
  "min_employees": integer or null,
  "max_employees": integer or null,
  "min_revenue_eok": annual revenue lower bound in 억원 or null,
  "max_revenue_eok": annual revenue upper bound in 억원 or null,
  "min_business_age": years since founding or null,
  "max_business_age": years since founding or null
}
Use null or an empty list when the text does not state a constraint. Do not guess."#;

pub fn build_tier2_prompt(input: &ExtractionInput) -> String {
    let body = input.short_text_body();
    format!(
        "{TIER2_PROMPT}\n\n제목: {}\n\n본문:\n{}",
        input.title.trim(),
        truncate_chars(&body, TIER2_MAX_INPUT_CHARS)
    )
}

pub struct Tier2Extractor {
    provider: Arc<dyn InferenceProvider>,
    pacer: Arc<CallPacer>,
}

impl Tier2Extractor {
    pub fn new(provider: Arc<dyn InferenceProvider>, pacer: Arc<CallPacer>) -> Self {
        Self { provider, pacer }
    }
}

#[async_trait]
impl ExtractorStrategy for Tier2Extractor {
    fn tier(&self) -> ExtractionTier {
        ExtractionTier::Tier2
    }

    fn is_applicable(&self, input: &ExtractionInput) -> bool {
        !input.title.trim().is_empty() || !input.short_text_body().is_empty()
    }

    async fn extract(&self, input: &ExtractionInput) -> Result<ExtractedEligibility, ExtractError> {
        let prompt = build_tier2_prompt(input);
        let (completion, usage) = paced_completion(
            self.provider.as_ref(),
            &self.pacer,
            ModelTier::Cheap.price(),
            ExtractionTier::Tier2,
            &prompt,
            TIER2_MAX_TOKENS,
        )
        .await?;

        // A malformed reply is no signal; the call is not retried.
        let mut result = parse_tier2_response(&completion.text).unwrap_or_else(|e| {
            warn!(error = %e, "discarding malformed tier 2 response");
            ExtractedEligibility::default()
        });
        result.confidence = if result.is_empty() {
            Confidence::Low
        } else {
            Confidence::Medium
        };
        result.usage.push(usage);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_truncates_body() {
        let input = ExtractionInput {
            title: "지원사업".into(),
            description: Some("가".repeat(5_000)),
            ..Default::default()
        };
        let prompt = build_tier2_prompt(&input);
        assert_eq!(prompt.matches('가').count(), TIER2_MAX_INPUT_CHARS);
        assert!(prompt.contains("제목: 지원사업"));
    }
}
