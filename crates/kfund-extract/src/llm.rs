use std::time::Duration;

use async_trait::async_trait;
use kfund_core::{ExtractionTier, TokenUsage};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::ExtractError;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Raw model output plus token accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn model(&self) -> &str;
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<Completion, ExtractError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Cheap,
    Premium,
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelTier {
    pub fn price(self) -> ModelPrice {
        match self {
            ModelTier::Cheap => ModelPrice {
                input_per_mtok: 0.25,
                output_per_mtok: 1.25,
            },
            ModelTier::Premium => ModelPrice {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
            },
        }
    }
}

impl ModelPrice {
    pub fn cost_usd(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (f64::from(input_tokens) * self.input_per_mtok + f64::from(output_tokens) * self.output_per_mtok)
            / 1_000_000.0
    }
}

/// Enforces a fixed gap between consecutive model calls.
#[derive(Debug)]
pub struct CallPacer {
    gap: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl CallPacer {
    pub fn new(gap: Duration) -> Self {
        Self {
            gap,
            last_call: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.gap;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Call a provider through the pacer and account for the tokens it used.
pub async fn paced_completion(
    provider: &dyn InferenceProvider,
    pacer: &CallPacer,
    price: ModelPrice,
    tier: ExtractionTier,
    prompt: &str,
    max_tokens: u32,
) -> Result<(Completion, TokenUsage), ExtractError> {
    pacer.wait_turn().await;
    let completion = provider.complete(prompt, max_tokens).await?;
    let usage = TokenUsage {
        tier,
        model: provider.model().to_string(),
        input_tokens: completion.input_tokens,
        output_tokens: completion.output_tokens,
        cost_usd: price.cost_usd(completion.input_tokens, completion.output_tokens),
    };
    info!(
        tier = %tier,
        model = %usage.model,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        cost_usd = usage.cost_usd,
        "model call"
    );
    Ok((completion, usage))
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// Anthropic Messages API client for a single model.
pub struct AnthropicProvider {
    api_key: String,
    model: String,
    http: reqwest::Client,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Result<Self, ExtractError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            http,
            base_url: ANTHROPIC_API_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn headers(&self) -> Result<HeaderMap, ExtractError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key).map_err(|e| ExtractError::Provider(e.to_string()))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[async_trait]
impl InferenceProvider for AnthropicProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<Completion, ExtractError> {
        let url = format!("{}/messages", self.base_url);
        debug!(model = %self.model, prompt_chars = prompt.chars().count(), "messages request");

        let request = MessagesRequest {
            model: &self.model,
            max_tokens,
            messages: vec![WireMessage {
                role: "user",
                content: prompt,
            }],
        };
        let response = self.http.post(&url).headers(self.headers()?).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractError::ProviderStatus { status, body });
        }

        let parsed: MessagesResponse = response.json().await?;
        let text = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(Completion {
            text,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }
}

/// Strip a markdown code fence around a JSON response.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// At most `max_chars` characters of `s`.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
