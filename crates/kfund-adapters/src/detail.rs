use kfund_core::{AttachmentLink, DetailCapture, DETAIL_PAYLOAD_VERSION};
use scraper::Html;

use crate::dates::parse_period;
use crate::html::{element_text, resolve_href, select_first_text, selector};
use crate::listing::ListingRow;
use crate::registry::SourceConfig;
use crate::AdapterError;

/// Capture the configured detail fields. Listing values fill in whatever the detail
/// page does not carry.
pub fn parse_detail(
    source: &SourceConfig,
    html: &str,
    row: &ListingRow,
    detail_url: &str,
) -> Result<DetailCapture, AdapterError> {
    let document = Html::parse_document(html);
    let selectors = &source.detail;

    let optional = |css: &Option<String>| -> Result<Option<String>, AdapterError> {
        match css {
            Some(css) => select_first_text(&document, css),
            None => Ok(None),
        }
    };

    let title = select_first_text(&document, &selectors.title)?.unwrap_or_else(|| row.title.clone());
    let agency = optional(&selectors.agency)?.or_else(|| row.agency.clone());
    let description = optional(&selectors.description)?;
    let support_target = optional(&selectors.support_target)?;
    let period_text = optional(&selectors.period)?.or_else(|| row.period_text.clone());
    let (application_start, deadline) = period_text
        .as_deref()
        .map(parse_period)
        .unwrap_or((None, None));

    let mut attachments: Vec<AttachmentLink> = Vec::new();
    if let Some(css) = &selectors.attachments {
        let sel = selector(css)?;
        for link in document.select(&sel) {
            let Some(url) = link.value().attr("href").and_then(|href| resolve_href(detail_url, href)) else {
                continue;
            };
            if attachments.iter().any(|a| a.url == url) {
                continue;
            }
            let filename = element_text(link)
                .or_else(|| url.rsplit('/').next().map(ToString::to_string))
                .unwrap_or_else(|| format!("attachment-{}", attachments.len() + 1));
            attachments.push(AttachmentLink { url, filename });
        }
    }

    Ok(DetailCapture {
        payload_version: DETAIL_PAYLOAD_VERSION,
        announcement_id: row.announcement_id.clone(),
        url: detail_url.to_string(),
        title,
        agency,
        description,
        support_target,
        period_text,
        application_start,
        deadline,
        attachments,
        raw_html: html.to_string(),
    })
}
