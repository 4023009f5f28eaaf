use chrono::NaiveDate;
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};

use crate::dates::find_dates;
use crate::html::{element_text, query_param, resolve_href, select_within_text, selector};
use crate::registry::SourceConfig;
use crate::AdapterError;

/// One announcement row on a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRow {
    pub announcement_id: String,
    pub title: String,
    pub url: String,
    pub agency: Option<String>,
    pub period_text: Option<String>,
    pub posted_at: Option<NaiveDate>,
}

pub fn parse_listing(source: &SourceConfig, html: &str, page_url: &str) -> Result<Vec<ListingRow>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector(&source.listing.row)?;
    let link_sel = selector(&source.listing.link)?;

    let mut rows = Vec::new();
    for row in document.select(&row_sel) {
        let Some(link) = row.select(&link_sel).next() else {
            continue;
        };
        let Some(url) = link.value().attr("href").and_then(|href| resolve_href(page_url, href)) else {
            continue;
        };
        let Some(title) = element_text(link) else {
            continue;
        };
        let announcement_id = query_param(&url, &source.id_param)
            .or_else(|| last_path_segment(&url))
            .unwrap_or_else(|| url.clone());

        let agency = match &source.listing.agency {
            Some(css) => select_within_text(row, css)?,
            None => None,
        };
        let period_text = match &source.listing.period {
            Some(css) => select_within_text(row, css)?,
            None => None,
        };
        let posted_at = match &source.listing.posted_at {
            Some(css) => select_within_text(row, css)?.and_then(|t| find_dates(&t).into_iter().next()),
            None => None,
        };

        rows.push(ListingRow {
            announcement_id,
            title,
            url,
            agency,
            period_text,
            posted_at,
        });
    }
    Ok(rows)
}

fn last_path_segment(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    path.rsplit('/').next().filter(|s| !s.is_empty()).map(ToString::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageCountBasis {
    TotalCount,
    PaginationLinks,
    HardCap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageCount {
    pub total_pages: u32,
    pub basis: PageCountBasis,
}

/// Number of listing pages: the "총 N건" count divided by page size, else the largest
/// page index among pagination links, else the configured hard cap.
pub fn discover_total_pages(source: &SourceConfig, html: &str) -> Result<PageCount, AdapterError> {
    let rule = &source.pagination;
    let cap = rule.max_pages.max(1);
    let document = Html::parse_document(html);
    let text = document.root_element().text().collect::<Vec<_>>().join(" ");

    let count_re = Regex::new(&rule.total_count_pattern)
        .map_err(|e| AdapterError::Config(format!("total_count_pattern for {}: {e}", source.id)))?;
    if let Some(count) = count_re
        .captures(&text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().replace(',', "").parse::<u64>().ok())
    {
        let pages = count.div_ceil(u64::from(rule.page_size));
        return Ok(PageCount {
            total_pages: pages.min(u64::from(cap)) as u32,
            basis: PageCountBasis::TotalCount,
        });
    }

    if let Some(css) = &rule.link_selector {
        let link_sel = selector(css)?;
        let max_link = document
            .select(&link_sel)
            .filter_map(|a| {
                let from_href = a
                    .value()
                    .attr("href")
                    .and_then(|href| resolve_href(&source.base_url, href))
                    .and_then(|url| query_param(&url, &rule.page_param))
                    .and_then(|v| v.parse::<u32>().ok());
                from_href.or_else(|| element_text(a).and_then(|t| t.parse::<u32>().ok()))
            })
            .max();
        if let Some(max_link) = max_link {
            return Ok(PageCount {
                total_pages: max_link.clamp(1, cap),
                basis: PageCountBasis::PaginationLinks,
            });
        }
    }

    Ok(PageCount {
        total_pages: cap,
        basis: PageCountBasis::HardCap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SourceRegistry;

    fn source(link_selector: Option<&str>) -> SourceConfig {
        let yaml = format!(
            r#"
sources:
  - id: test
    display_name: test
    base_url: https://agency.test
    listing_path: /list?page={{page}}
    id_param: id
    listing:
      row: "tr"
      link: "a.subject"
      agency: "td.agency"
    detail:
      title: "h1"
    pagination:
      page_size: 10
      max_pages: 50
      {}
"#,
            link_selector
                .map(|s| format!("link_selector: \"{s}\""))
                .unwrap_or_default()
        );
        SourceRegistry::from_yaml(&yaml).unwrap().sources.remove(0)
    }

    #[test]
    fn total_count_is_divided_by_page_size() {
        let html = "<div>총 <b>1,234</b>건</div>";
        let count = discover_total_pages(&source(None), html).unwrap();
        assert_eq!(count.basis, PageCountBasis::TotalCount);
        assert_eq!(count.total_pages, 50);

        let html = "<p>총 21건</p>";
        assert_eq!(discover_total_pages(&source(None), html).unwrap().total_pages, 3);
    }

    #[test]
    fn falls_back_to_pagination_links_then_cap() {
        let html = r#"<div class="paging"><a href="/list?page=2">2</a><a href="/list?page=7">7</a><a href="javascript:go(9)">9</a></div>"#;
        let count = discover_total_pages(&source(Some("div.paging a")), html).unwrap();
        assert_eq!(count.basis, PageCountBasis::PaginationLinks);
        assert_eq!(count.total_pages, 9);

        let count = discover_total_pages(&source(None), "<p>nothing</p>").unwrap();
        assert_eq!(count.basis, PageCountBasis::HardCap);
        assert_eq!(count.total_pages, 50);
    }

    #[test]
    fn rows_without_links_are_skipped() {
        let html = r#"<table>
            <tr><td colspan="3">검색 결과가 없습니다</td></tr>
            <tr><td><a class="subject" href="/view?id=A-1"> 2026년 창업 지원 </a></td><td class="agency">중소벤처기업부</td></tr>
        </table>"#;
        let rows = parse_listing(&source(None), html, "https://agency.test/list?page=1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].announcement_id, "A-1");
        assert_eq!(rows[0].title, "2026년 창업 지원");
        assert_eq!(rows[0].agency.as_deref(), Some("중소벤처기업부"));
        assert_eq!(rows[0].url, "https://agency.test/view?id=A-1");
    }
}
