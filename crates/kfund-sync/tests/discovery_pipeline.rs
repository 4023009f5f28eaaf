use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use kfund_adapters::SourceRegistry;
use kfund_core::{
    AnnouncementType, CanonicalProgramRecord, Confidence, DateRange, ExtractionTier, NewRawCapture,
    ProcessingStatus, RawCapture, ScrapingStatus,
};
use kfund_extract::{Cascade, CascadeMode, TextExtractor, TextExtractorConfig, Tier1Extractor};
use kfund_storage::{
    AttachmentStore, CreateOutcome, FetchError, FetchedResponse, MemoryRecordStore, PageFetcher, RecordStore,
    StatusUpdate, StoreError, UpsertOutcome,
};
use kfund_sync::{
    CacheInvalidator, ChannelCompletionSink, CheckpointStore, DiscoveryConfig, DiscoveryError, DiscoveryRequest, DiscoveryStage,
    HashStrategy, NoopCacheInvalidator, ProcessWorkerPool, QueueConfig,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

const SOURCES: &str = r#"
sources:
  - id: bizinfo
    display_name: 기업마당
    base_url: https://www.bizinfo.go.kr
    listing_path: /list.do?cpage={page}&from={from}&to={to}
    id_param: pblancId
    listing:
      row: "table.table_List tbody tr"
      link: "td.txt_l a"
      agency: "td.agency"
      period: "td.period"
      posted_at: "td.date"
    detail:
      title: "div.view_cont h2.title"
      agency: "ul.view_info div.agency"
      description: "div.view_cont_txt"
      support_target: "ul.view_info div.target"
      period: "ul.view_info div.period"
      attachments: "div.attached_file_list a"
    pagination:
      page_size: 2
      link_selector: "div.page_wrap a"
      page_param: cpage
"#;

const PAGE_TWO: &str = r#"<html><body>
<p class="total">총 <strong>3</strong>건</p>
<table class="table_List"><tbody>
  <tr>
    <td class="txt_l"><a href="/web/lay1/bbs/S1T122C128/AS/74/view.do?pblancId=PBLN_000000000100004">2026년 수출바우처 사업 공고</a></td>
    <td class="period">2026.01.20 ~ 2026.02.28</td>
    <td class="agency">산업통상자원부</td>
    <td class="date">2026-01-20</td>
  </tr>
</tbody></table>
</body></html>"#;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixture(name: &str) -> Vec<u8> {
    let path = workspace_root().join("fixtures/bizinfo").join(name);
    std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

/// Serves canned bodies for any URL containing a route's needle.
struct StaticFetcher {
    routes: Mutex<Vec<(String, Result<Vec<u8>, u16>)>>,
    requested: Mutex<Vec<String>>,
}

impl StaticFetcher {
    fn bizinfo() -> Arc<Self> {
        let fetcher = Arc::new(Self {
            routes: Mutex::new(Vec::new()),
            requested: Mutex::new(Vec::new()),
        });
        fetcher.route("cpage=1&", Ok(fixture("listing_page_1.html")));
        fetcher.route("cpage=2&", Ok(PAGE_TWO.as_bytes().to_vec()));
        for id in ["100001", "100002", "100003"] {
            fetcher.route(
                &format!("pblancId=PBLN_000000000{id}"),
                Ok(fixture(&format!("detail_PBLN_000000000{id}.html"))),
            );
        }
        fetcher.route("pblancId=PBLN_000000000100004", Ok(fixture("detail_PBLN_000000000100002.html")));
        fetcher.route("FILE_000000000700001&fileSn=0", Ok(b"hwp body".to_vec()));
        fetcher.route("FILE_000000000700001&fileSn=1", Ok(b"pdf body".to_vec()));
        fetcher.route("FILE_000000000700002", Ok(fixture("attachment_plan.txt")));
        fetcher
    }

    /// Later routes win, so tests can override the defaults.
    fn route(&self, needle: &str, response: Result<Vec<u8>, u16>) {
        self.routes.lock().unwrap().insert(0, (needle.to_string(), response));
    }

    fn requested_matching(&self, needle: &str) -> usize {
        self.requested.lock().unwrap().iter().filter(|u| u.contains(needle)).count()
    }
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch(&self, _source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.requested.lock().unwrap().push(url.to_string());
        let routes = self.routes.lock().unwrap();
        let response = routes
            .iter()
            .find(|(needle, _)| url.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or(Err(404));
        match response {
            Ok(body) => Ok(FetchedResponse {
                status: 200,
                final_url: url.to_string(),
                content_type: Some("text/html; charset=utf-8".into()),
                body,
            }),
            Err(status) => Err(FetchError::HttpStatus {
                status,
                url: url.to_string(),
            }),
        }
    }
}

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    store: Arc<MemoryRecordStore>,
    fetcher: Arc<StaticFetcher>,
    stage: DiscoveryStage,
    events: UnboundedReceiver<kfund_sync::DiscoveryCompleted>,
    checkpoints: CheckpointStore,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let store = Arc::new(MemoryRecordStore::new());
    let fetcher = StaticFetcher::bizinfo();
    let (sink, events) = ChannelCompletionSink::new();
    let checkpoints = CheckpointStore::new(root.join("checkpoints"));
    let stage = DiscoveryStage::new(
        Arc::new(SourceRegistry::from_yaml(SOURCES).unwrap()),
        fetcher.clone(),
        store.clone(),
        AttachmentStore::new(root.join("attachments")),
        checkpoints.clone(),
        Arc::new(sink),
        DiscoveryConfig {
            detail_delay: Duration::ZERO,
            attachment_delay: Duration::ZERO,
            hash_strategy: HashStrategy::Url,
        },
    );
    Harness {
        _dir: dir,
        root,
        store,
        fetcher,
        stage,
        events,
        checkpoints,
    }
}

fn january() -> DateRange {
    DateRange::new(
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
    )
    .unwrap()
}

fn request(resume: bool) -> DiscoveryRequest {
    DiscoveryRequest {
        source_id: "bizinfo".into(),
        date_range: january(),
        resume,
        max_pages: None,
        dry_run: false,
    }
}

fn tier1_pool(h: &Harness, config: QueueConfig) -> ProcessWorkerPool {
    tier1_pool_with(h, h.store.clone(), config, Arc::new(NoopCacheInvalidator))
}

fn tier1_pool_with(
    h: &Harness,
    store: Arc<dyn RecordStore>,
    config: QueueConfig,
    invalidator: Arc<dyn CacheInvalidator>,
) -> ProcessWorkerPool {
    ProcessWorkerPool::new(
        store,
        AttachmentStore::new(h.root.join("attachments")),
        config,
        Arc::new(Cascade::new(CascadeMode::StopAtFirstSignal).with_strategy(Arc::new(Tier1Extractor))),
        Arc::new(TextExtractor::new(TextExtractorConfig::default())),
        invalidator,
    )
}

/// Panics on every changed program, so only the first pass over a capture blows up.
struct PanickingInvalidator;

#[async_trait]
impl CacheInvalidator for PanickingInvalidator {
    async fn invalidate(&self, record: &CanonicalProgramRecord) -> anyhow::Result<()> {
        panic!("cache for {} unavailable", record.id);
    }
}

/// Delegates to the memory store but refuses to mark one capture processed.
struct RefusingStore {
    inner: Arc<MemoryRecordStore>,
    refuse: Uuid,
}

#[async_trait]
impl RecordStore for RefusingStore {
    async fn create_if_absent(&self, capture: NewRawCapture) -> Result<CreateOutcome, StoreError> {
        self.inner.create_if_absent(capture).await
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<RawCapture>, StoreError> {
        self.inner.find_by_url(url).await
    }

    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Option<RawCapture>, StoreError> {
        self.inner.find_by_content_hash(content_hash).await
    }

    async fn touch(&self, id: Uuid, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.touch(id, seen_at).await
    }

    async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<RawCapture, StoreError> {
        if id == self.refuse && matches!(update, StatusUpdate::Processed) {
            return Err(StoreError::Corrupt("connection reset".into()));
        }
        self.inner.update_status(id, update).await
    }

    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: u32,
        lease: chrono::Duration,
    ) -> Result<Vec<RawCapture>, StoreError> {
        self.inner.claim_pending(limit, max_attempts, lease).await
    }

    async fn upsert_canonical_program(&self, record: CanonicalProgramRecord) -> Result<UpsertOutcome, StoreError> {
        self.inner.upsert_canonical_program(record).await
    }

    async fn find_program(&self, content_hash: &str) -> Result<Option<CanonicalProgramRecord>, StoreError> {
        self.inner.find_program(content_hash).await
    }

    async fn expire_programs(&self, today: NaiveDate) -> Result<u64, StoreError> {
        self.inner.expire_programs(today).await
    }

    async fn list_needing_review(&self) -> Result<Vec<RawCapture>, StoreError> {
        self.inner.list_needing_review().await
    }
}

fn fast_queue() -> QueueConfig {
    QueueConfig {
        concurrency: 2,
        poll_interval: Duration::ZERO,
        max_idle_polls: 1,
        max_attempts: 3,
        max_tier: ExtractionTier::Tier1,
        claim_lease: Duration::from_secs(900),
    }
}

#[tokio::test]
async fn full_run_stores_captures_and_attachments_once() {
    let mut h = harness();

    let report = h.stage.run(request(false)).await.unwrap();
    assert!(report.completed);
    assert_eq!(report.total_pages, 2);
    assert_eq!(report.counts.found, 4);
    assert_eq!(report.counts.new, 4);
    assert_eq!(report.counts.attachments, 4);

    let captures = h.store.captures().await;
    assert_eq!(captures.len(), 4);
    assert!(captures.iter().all(|c| c.scraping_status == ScrapingStatus::Scraped));
    assert!(captures.iter().all(|c| c.content_hash.starts_with("v1:url:")));

    let with_files = captures
        .iter()
        .find(|c| c.url.ends_with("PBLN_000000000100001"))
        .unwrap();
    assert_eq!(with_files.attachment_files.len(), 2);
    let dir = h.root.join("attachments").join(with_files.attachment_dir.as_ref().unwrap());
    assert!(dir.to_string_lossy().contains("20260101_20260131"));
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 2);

    let event = h.events.try_recv().unwrap();
    assert_eq!(event.session_id, report.session_id);
    assert_eq!(event.counts.new, 4);
    assert!(!h.checkpoints.path_for("bizinfo", &january()).exists());

    // Same range again: everything is known, nothing is re-downloaded.
    let again = h.stage.run(request(false)).await.unwrap();
    assert_eq!(again.counts.new, 0);
    assert_eq!(again.counts.skipped, 4);
    assert_eq!(again.counts.attachments, 0);
    assert_eq!(h.store.captures().await.len(), 4);
    assert_eq!(h.fetcher.requested_matching("FILE_000000000700002"), 2);
}

#[tokio::test]
async fn same_named_attachments_are_both_kept() {
    let h = harness();
    let detail = String::from_utf8(fixture("detail_PBLN_000000000100001.html"))
        .unwrap()
        .replace("2026년_청년창업_공고문.hwp", "서식.hwp")
        .replace("신청서 양식.pdf", "서식.hwp");
    h.fetcher.route("pblancId=PBLN_000000000100001", Ok(detail.into_bytes()));

    h.stage.run(request(false)).await.unwrap();

    let capture = h
        .store
        .captures()
        .await
        .into_iter()
        .find(|c| c.url.ends_with("PBLN_000000000100001"))
        .unwrap();
    assert_eq!(capture.attachment_files, vec!["서식.hwp", "서식 (2).hwp"]);
    let dir = h.root.join("attachments").join(capture.attachment_dir.unwrap());
    assert_eq!(std::fs::read(dir.join("서식.hwp")).unwrap(), b"hwp body");
    assert_eq!(std::fs::read(dir.join("서식 (2).hwp")).unwrap(), b"pdf body");
}

#[tokio::test]
async fn interrupted_run_resumes_from_checkpoint() {
    let mut h = harness();
    h.fetcher.route("cpage=2&", Err(503));

    let err = h.stage.run(request(true)).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Listing { page: 2, .. }));
    let saved = h.checkpoints.load("bizinfo", &january()).await.unwrap().unwrap();
    assert_eq!(saved.last_processed_page, 1);
    assert_eq!(saved.total_processed, 3);
    assert!(h.events.try_recv().is_err());

    h.fetcher.route("cpage=2&", Ok(PAGE_TWO.as_bytes().to_vec()));
    let report = h.stage.run(request(true)).await.unwrap();
    assert!(report.resumed);
    assert_eq!(report.start_page, 2);
    assert_eq!(report.session_id, saved.session_id);
    assert_eq!(report.counts.found, 1);
    assert_eq!(report.total_processed, 4);
    assert!(report.completed);

    assert_eq!(h.fetcher.requested_matching("cpage=1&"), 1);
    assert_eq!(h.store.captures().await.len(), 4);
    assert!(h.checkpoints.load("bizinfo", &january()).await.unwrap().is_none());
    assert_eq!(h.events.try_recv().unwrap().counts.found, 1);
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn max_pages_stops_early_and_keeps_checkpoint() {
    let mut h = harness();
    let report = h
        .stage
        .run(DiscoveryRequest {
            max_pages: Some(1),
            ..request(true)
        })
        .await
        .unwrap();

    assert!(!report.completed);
    assert_eq!(report.last_page_visited, 1);
    assert_eq!(h.fetcher.requested_matching("cpage=2&"), 0);
    assert!(h.events.try_recv().is_err());
    let saved = h.checkpoints.load("bizinfo", &january()).await.unwrap().unwrap();
    assert_eq!(saved.next_page(), 2);
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let mut h = harness();
    let report = h
        .stage
        .run(DiscoveryRequest {
            dry_run: true,
            ..request(true)
        })
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.counts.new, 4);
    assert!(h.store.captures().await.is_empty());
    assert_eq!(h.fetcher.requested_matching("pblancId="), 0);
    assert!(!h.root.join("attachments").exists());
    assert!(!h.checkpoints.path_for("bizinfo", &january()).exists());
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn dry_run_after_a_real_run_reports_known_rows_as_skipped() {
    let mut h = harness();
    h.stage.run(request(false)).await.unwrap();
    while h.events.try_recv().is_ok() {}
    let before = h.store.captures().await;
    let detail_fetches = h.fetcher.requested_matching("pblancId=");

    let report = h
        .stage
        .run(DiscoveryRequest {
            dry_run: true,
            ..request(false)
        })
        .await
        .unwrap();

    assert_eq!(report.counts.found, 4);
    assert_eq!(report.counts.skipped, 4);
    assert_eq!(report.counts.new, 0);
    assert_eq!(h.store.captures().await, before);
    assert_eq!(h.fetcher.requested_matching("pblancId="), detail_fetches);
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn failed_detail_is_recorded_then_rescraped() {
    let h = harness();
    h.fetcher.route("pblancId=PBLN_000000000100003", Err(500));

    let first = h.stage.run(request(false)).await.unwrap();
    assert_eq!(first.counts.failed, 1);
    assert_eq!(first.counts.new, 3);
    let failed = h
        .store
        .captures()
        .await
        .into_iter()
        .find(|c| c.url.ends_with("PBLN_000000000100003"))
        .unwrap();
    assert_eq!(failed.scraping_status, ScrapingStatus::ScrapingFailed);
    assert!(failed.scraping_error.as_deref().unwrap().contains("500"));

    h.fetcher
        .route("pblancId=PBLN_000000000100003", Ok(fixture("detail_PBLN_000000000100003.html")));
    let second = h.stage.run(request(false)).await.unwrap();
    assert_eq!(second.counts.updated, 1);
    assert_eq!(second.counts.skipped, 3);

    let fixed = h.store.find_by_url(&failed.url).await.unwrap().unwrap();
    assert_eq!(fixed.id, failed.id);
    assert_eq!(fixed.scraping_status, ScrapingStatus::Scraped);
    assert_eq!(fixed.detail().unwrap().title, "2025년 예비창업패키지 최종 선정결과 공고");
}

#[tokio::test]
async fn unknown_source_is_rejected() {
    let h = harness();
    let err = h
        .stage
        .run(DiscoveryRequest {
            source_id: "nope".into(),
            ..request(false)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::UnknownSource(id) if id == "nope"));
}

#[tokio::test]
async fn discovered_captures_become_canonical_programs() {
    let h = harness();
    h.stage.run(request(false)).await.unwrap();

    let report = tier1_pool(&h, fast_queue()).run_until_idle().await.unwrap();
    assert_eq!(report.processed, 4);
    assert_eq!(report.failed, 0);
    assert_eq!(report.by_type.get("NOTICE"), Some(&1));

    let captures = h.store.captures().await;
    assert!(captures
        .iter()
        .all(|c| c.processing_status == ProcessingStatus::Processed));

    let seoul = captures
        .iter()
        .find(|c| c.url.ends_with("PBLN_000000000100001"))
        .unwrap();
    let program = h.store.find_program(&seoul.content_hash).await.unwrap().unwrap();
    assert_eq!(program.announcement_type, AnnouncementType::Funding);
    assert!(program.matchable);
    assert_eq!(program.confidence, Confidence::High);
    assert_eq!(program.source_tier, Some(ExtractionTier::Tier1));
    assert_eq!(program.eligibility.region_codes, vec!["11"]);
    assert_eq!(program.extraction_cost_usd, 0.0);

    let notice = captures
        .iter()
        .find(|c| c.url.ends_with("PBLN_000000000100003"))
        .unwrap();
    let program = h.store.find_program(&notice.content_hash).await.unwrap().unwrap();
    assert_eq!(program.announcement_type, AnnouncementType::Notice);
    assert!(!program.matchable);
}

#[tokio::test]
async fn repeated_processing_failures_flag_for_review() {
    let h = harness();
    h.store
        .create_if_absent(NewRawCapture {
            source_id: "bizinfo".into(),
            url: "https://www.bizinfo.go.kr/view.do?pblancId=BROKEN".into(),
            content_hash: "v1:url:broken".into(),
            raw_payload: serde_json::Value::Null,
            attachment_dir: None,
            attachment_files: Vec::new(),
            scraping_status: ScrapingStatus::Scraped,
            scraping_error: None,
            captured_at: Utc::now(),
        })
        .await
        .unwrap();

    let report = tier1_pool(
        &h,
        QueueConfig {
            concurrency: 1,
            ..fast_queue()
        },
    )
    .run_until_idle()
    .await
    .unwrap();

    assert_eq!(report.claimed, 3);
    assert_eq!(report.failed, 3);
    assert_eq!(report.flagged_for_review, 1);

    let flagged = h.store.list_needing_review().await.unwrap();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].processing_attempts, 3);
    assert_eq!(flagged[0].processing_status, ProcessingStatus::ProcessingFailed);
    assert!(h.store.claim_pending(10, 3, chrono::Duration::minutes(15)).await.unwrap().is_empty());
}

#[tokio::test]
async fn panicking_item_is_recorded_as_failed_and_retried() {
    let h = harness();
    h.stage.run(request(false)).await.unwrap();

    let report = tier1_pool_with(&h, h.store.clone(), fast_queue(), Arc::new(PanickingInvalidator))
        .run_until_idle()
        .await
        .unwrap();

    // First pass panics after the insert; the retry finds the program unchanged.
    assert_eq!(report.failed, 4);
    assert_eq!(report.processed, 4);
    assert!(report.errors.iter().all(|e| e.contains("processing task panicked")));

    let captures = h.store.captures().await;
    assert!(captures.iter().all(|c| c.processing_status == ProcessingStatus::Processed));
    assert!(captures.iter().all(|c| c.processing_attempts == 1 && c.claimed_at.is_none()));
}

#[tokio::test]
async fn store_error_lets_sibling_items_finish() {
    let h = harness();
    h.stage.run(request(false)).await.unwrap();
    let refused = h
        .store
        .captures()
        .await
        .into_iter()
        .find(|c| c.url.ends_with("PBLN_000000000100002"))
        .unwrap();

    let store = Arc::new(RefusingStore {
        inner: h.store.clone(),
        refuse: refused.id,
    });
    let config = QueueConfig {
        concurrency: 4,
        ..fast_queue()
    };
    let err = tier1_pool_with(&h, store, config, Arc::new(NoopCacheInvalidator))
        .run_until_idle()
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("connection reset"));

    let captures = h.store.captures().await;
    let others = captures.iter().filter(|c| c.id != refused.id).collect::<Vec<_>>();
    assert_eq!(others.len(), 3);
    assert!(others.iter().all(|c| c.processing_status == ProcessingStatus::Processed));

    // The stranded claim comes back once its lease runs out.
    let stranded = h.store.find_by_url(&refused.url).await.unwrap().unwrap();
    assert_eq!(stranded.processing_status, ProcessingStatus::Processing);
    let reclaimed = h.store.claim_pending(10, 3, chrono::Duration::zero()).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, refused.id);
    assert_eq!(reclaimed[0].processing_attempts, 1);
}
