//! Full-document model fallback. Only runs when document text was extracted.

use std::sync::Arc;

use async_trait::async_trait;
use kfund_core::{Confidence, ExtractedEligibility, ExtractionTier};
use tracing::warn;

use crate::cascade::{ExtractionInput, ExtractorStrategy};
use crate::llm::{paced_completion, truncate_chars, CallPacer, InferenceProvider, ModelTier};
use crate::schema::parse_tier3_response;
use crate::ExtractError;

pub const TIER3_MAX_DOCUMENT_CHARS: usize = 50_000;
const TIER3_MAX_TOKENS: u32 = 1_024;

const TIER3_PROMPT: &str = r#"You read the full text of a Korean government funding announcement and its attachments
and extract who may apply. Reply with a single JSON object and nothing else:
{
  "schema_version": 1,
  "regions": [Korean province names such as "서울", "경기도", or "전국" for nationwide],
  "company_scale": [labels from: 예비창업자, 소상공인, 소공인, 소기업, 중소기업, 중견기업, 대기업, 창업기업],
  "min_employees": integer or null,
  "max_employees": integer or null,
  "min_revenue_eok": annual revenue lower bound in 억원 or null,
  "max_revenue_eok": annual revenue upper bound in 억원 or null,
  "min_business_age": years since founding or null,
  "max_business_age": years since founding or null,
  "required_certs": [certifications applicants must hold, e.g. "벤처기업", "이노비즈", "메인비즈"],
  "target_industry": one industry label or null,
  "exclusion_conditions": [short phrases describing who is excluded],
  "support_amount_min_manwon": minimum support per company in 만원 or null,
  "support_amount_max_manwon": maximum support per company in 만원 or null
}
Use null or an empty list when the document does not state a constraint. Do not guess."#;

pub fn build_tier3_prompt(input: &ExtractionInput) -> String {
    let document = input.document.as_deref().unwrap_or_default();
    format!(
        "{TIER3_PROMPT}\n\n제목: {}\n\n문서:\n{}",
        input.title.trim(),
        truncate_chars(document, TIER3_MAX_DOCUMENT_CHARS)
    )
}

pub fn tier3_confidence(populated: usize) -> Confidence {
    match populated {
        0 => Confidence::Low,
        1..=3 => Confidence::Medium,
        _ => Confidence::High,
    }
}

pub struct Tier3Extractor {
    provider: Arc<dyn InferenceProvider>,
    pacer: Arc<CallPacer>,
    model_tier: ModelTier,
}

impl Tier3Extractor {
    /// `model_tier` must match the model the provider calls; it selects the price table.
    pub fn new(provider: Arc<dyn InferenceProvider>, pacer: Arc<CallPacer>, model_tier: ModelTier) -> Self {
        Self {
            provider,
            pacer,
            model_tier,
        }
    }
}

#[async_trait]
impl ExtractorStrategy for Tier3Extractor {
    fn tier(&self) -> ExtractionTier {
        ExtractionTier::Tier3
    }

    fn is_applicable(&self, input: &ExtractionInput) -> bool {
        input.has_document()
    }

    async fn extract(&self, input: &ExtractionInput) -> Result<ExtractedEligibility, ExtractError> {
        let prompt = build_tier3_prompt(input);
        let (completion, usage) = paced_completion(
            self.provider.as_ref(),
            &self.pacer,
            self.model_tier.price(),
            ExtractionTier::Tier3,
            &prompt,
            TIER3_MAX_TOKENS,
        )
        .await?;

        let mut result = parse_tier3_response(&completion.text).unwrap_or_else(|e| {
            warn!(error = %e, "discarding malformed tier 3 response");
            ExtractedEligibility::default()
        });
        result.confidence = tier3_confidence(result.populated_field_count());
        result.usage.push(usage);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_thresholds() {
        assert_eq!(tier3_confidence(0), Confidence::Low);
        assert_eq!(tier3_confidence(3), Confidence::Medium);
        assert_eq!(tier3_confidence(4), Confidence::High);
    }

    #[test]
    fn not_applicable_without_document() {
        let extractor = Tier3Extractor::new(
            Arc::new(NeverCalled),
            Arc::new(CallPacer::new(std::time::Duration::ZERO)),
            ModelTier::Cheap,
        );
        let mut input = ExtractionInput {
            title: "공고".into(),
            document: Some("  ".into()),
            ..Default::default()
        };
        assert!(!extractor.is_applicable(&input));
        input.document = Some("본문".into());
        assert!(extractor.is_applicable(&input));
    }

    struct NeverCalled;

    #[async_trait]
    impl InferenceProvider for NeverCalled {
        fn model(&self) -> &str {
            "never"
        }

        async fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<crate::llm::Completion, ExtractError> {
            Err(ExtractError::Provider("unexpected call".into()))
        }
    }
}
