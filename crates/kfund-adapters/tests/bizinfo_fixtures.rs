use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use kfund_adapters::{discover_total_pages, parse_detail, parse_listing, PageCountBasis, SourceRegistry};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixture(name: &str) -> String {
    let path = workspace_root().join("fixtures/bizinfo").join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[test]
fn registry_loads_from_workspace_sources_yaml() {
    let registry = SourceRegistry::load(workspace_root().join("sources.yaml")).unwrap();
    let enabled = registry.enabled().map(|s| s.id.as_str()).collect::<Vec<_>>();
    assert_eq!(enabled, vec!["bizinfo"]);
    assert!(registry.get("kstartup").is_some());
}

#[test]
fn bizinfo_listing_fixture_parses_rows_and_page_count() {
    let registry = SourceRegistry::load(workspace_root().join("sources.yaml")).unwrap();
    let source = registry.get("bizinfo").unwrap();
    let from = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    let to = NaiveDate::from_ymd_opt(2026, 1, 31).unwrap();
    let page_url = source.listing_url(1, from, to);
    let html = fixture("listing_page_1.html");

    let rows = parse_listing(source, &html, &page_url).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].announcement_id, "PBLN_000000000100001");
    assert_eq!(
        rows[0].url,
        "https://www.bizinfo.go.kr/web/lay1/bbs/S1T122C128/AS/74/view.do?pblancId=PBLN_000000000100001"
    );
    assert_eq!(rows[0].posted_at, NaiveDate::from_ymd_opt(2026, 1, 5));
    assert_eq!(rows[2].period_text.as_deref(), Some("상시"));

    let pages = discover_total_pages(source, &html).unwrap();
    assert_eq!(pages.basis, PageCountBasis::TotalCount);
    assert_eq!(pages.total_pages, 1);
}

#[test]
fn bizinfo_detail_fixture_captures_fields_and_attachments() {
    let registry = SourceRegistry::load(workspace_root().join("sources.yaml")).unwrap();
    let source = registry.get("bizinfo").unwrap();
    let listing = fixture("listing_page_1.html");
    let rows = parse_listing(source, &listing, "https://www.bizinfo.go.kr/web/lay1/bbs/S1T122C128/AS/74/list.do").unwrap();

    let html = fixture("detail_PBLN_000000000100001.html");
    let detail = parse_detail(source, &html, &rows[0], &rows[0].url).unwrap();

    assert_eq!(detail.title, "[서울] 2026년 청년 창업기업 성장 지원사업 공고");
    assert_eq!(detail.agency.as_deref(), Some("서울특별시"));
    assert_eq!(
        detail.support_target.as_deref(),
        Some("업력 3년~7년 기업 대상, 서울특별시 소재, 중소기업 한정")
    );
    assert_eq!(detail.application_start, NaiveDate::from_ymd_opt(2026, 1, 5));
    assert_eq!(detail.deadline, NaiveDate::from_ymd_opt(2026, 2, 15));
    assert!(!detail.description.as_deref().unwrap_or_default().contains("trackingId"));

    let names = detail.attachments.iter().map(|a| a.filename.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["2026년_청년창업_공고문.hwp", "신청서 양식.pdf"]);
    assert!(detail.attachments[0].url.contains("fileSn=0"));
}

#[test]
fn rolling_detail_has_no_dates() {
    let registry = SourceRegistry::load(workspace_root().join("sources.yaml")).unwrap();
    let source = registry.get("bizinfo").unwrap();
    let listing = fixture("listing_page_1.html");
    let rows = parse_listing(source, &listing, "https://www.bizinfo.go.kr/web/list.do").unwrap();

    let html = fixture("detail_PBLN_000000000100003.html");
    let detail = parse_detail(source, &html, &rows[2], &rows[2].url).unwrap();
    assert_eq!(detail.deadline, None);
    assert!(detail.attachments.is_empty());
}
