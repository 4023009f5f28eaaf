//! Ingestion pipeline: discovery, dedup, process worker pool and scheduling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kfund_adapters::SourceRegistry;
use kfund_extract::{
    AnthropicProvider, CallPacer, Cascade, InferenceProvider, TextExtractor, Tier1Extractor, Tier2Extractor,
    Tier3Extractor,
};
use kfund_storage::{AttachmentStore, HttpFetcher, RecordStore};
use tracing::info;

pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod discovery;
pub mod events;
pub mod report;
pub mod scheduler;
pub mod worker;

pub use checkpoint::{CheckpointError, CheckpointStore};
pub use config::SyncConfig;
pub use dedup::{ContentDeduplicator, DedupDecision, HashStrategy, CONTENT_HASH_VERSION};
pub use discovery::{DiscoveryConfig, DiscoveryError, DiscoveryReport, DiscoveryRequest, DiscoveryStage};
pub use events::{ChannelCompletionSink, CompletionSink, DiscoveryCompleted, DiscoveryCounts, NoopCompletionSink};
pub use report::{write_discovery_report, write_process_report};
pub use scheduler::{build_scheduler, lookback_range, run_scheduled_discovery, spawn_completion_listener, SchedulerJobs};
pub use worker::{
    CacheInvalidator, HttpCacheInvalidator, NoopCacheInvalidator, ProcessReport, ProcessWorkerPool, QueueConfig,
};

pub const CRATE_NAME: &str = "kfund-sync";

/// Tier 1 always; the model tiers only when an API key is configured.
pub fn build_cascade(config: &SyncConfig) -> Result<Cascade> {
    let mut cascade = Cascade::new(config.cascade_mode).with_strategy(Arc::new(Tier1Extractor));
    let Some(api_key) = config.anthropic_api_key.as_deref() else {
        info!("ANTHROPIC_API_KEY not set; extraction limited to tier 1");
        return Ok(cascade);
    };

    let timeout = Duration::from_secs(config.http_timeout_secs.max(60));
    // Both model tiers share one pacer so the combined call rate stays bounded.
    let pacer = Arc::new(CallPacer::new(Duration::from_millis(config.llm_call_delay_ms)));

    let tier2: Arc<dyn InferenceProvider> = Arc::new(
        AnthropicProvider::new(api_key, &config.tier2_model, timeout).context("building tier 2 client")?,
    );
    let (tier3_model, tier3_price) = config.tier3_model();
    let tier3: Arc<dyn InferenceProvider> =
        Arc::new(AnthropicProvider::new(api_key, tier3_model, timeout).context("building tier 3 client")?);

    cascade = cascade
        .with_strategy(Arc::new(Tier2Extractor::new(tier2, pacer.clone())))
        .with_strategy(Arc::new(Tier3Extractor::new(tier3, pacer, tier3_price)));
    Ok(cascade)
}

/// HTTP fetcher with one token bucket per enabled source.
pub async fn build_fetcher(config: &SyncConfig, registry: &SourceRegistry) -> Result<HttpFetcher> {
    let fetcher = HttpFetcher::new(config.http_client_config())?;
    for source in registry.enabled() {
        fetcher
            .register_source(&source.id, source.rate_limit, Some(source.timeout()))
            .await;
    }
    Ok(fetcher)
}

pub fn build_worker_pool(config: &SyncConfig, store: Arc<dyn RecordStore>) -> Result<ProcessWorkerPool> {
    let cascade = Arc::new(build_cascade(config)?);
    let text = Arc::new(TextExtractor::new(config.text_extractor_config()));
    let invalidator: Arc<dyn CacheInvalidator> = match config.cache_invalidate_url.as_deref() {
        Some(url) => Arc::new(HttpCacheInvalidator::new(url, Duration::from_secs(config.http_timeout_secs))?),
        None => Arc::new(NoopCacheInvalidator),
    };
    Ok(ProcessWorkerPool::new(
        store,
        AttachmentStore::new(&config.attachments_dir),
        config.queue_config(),
        cascade,
        text,
        invalidator,
    ))
}
