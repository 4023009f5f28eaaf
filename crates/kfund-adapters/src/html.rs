use reqwest::Url;
use scraper::{ElementRef, Html, Selector};

use crate::AdapterError;

pub(crate) fn selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Whitespace-collapsed text of an element, ignoring script and style bodies; `None`
/// when blank.
pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    let mut parts = Vec::new();
    for node in element.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|el| matches!(el.value().name(), "script" | "style"));
        if !hidden {
            parts.push(&**text);
        }
    }
    collapse_whitespace(&parts.join(" "))
}

pub(crate) fn collapse_whitespace(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).find_map(element_text))
}

pub(crate) fn select_within_text(element: ElementRef<'_>, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(element.select(&sel).find_map(element_text))
}

/// Resolve `href` against `base`. Script and fragment links yield `None`.
pub(crate) fn resolve_href(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.to_ascii_lowercase().starts_with("javascript:") {
        return None;
    }
    let base = Url::parse(base).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

pub(crate) fn query_param(url: &str, name: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_links_and_skips_script_links() {
        assert_eq!(
            resolve_href("https://www.bizinfo.go.kr/web/list.do", "view.do?pblancId=PBLN_1").as_deref(),
            Some("https://www.bizinfo.go.kr/web/view.do?pblancId=PBLN_1")
        );
        assert_eq!(resolve_href("https://a.test/", "javascript:void(0)"), None);
        assert_eq!(resolve_href("https://a.test/", "#top"), None);
    }

    #[test]
    fn reads_query_parameters() {
        let url = "https://a.test/view.do?pblancId=PBLN_000123&x=1";
        assert_eq!(query_param(url, "pblancId").as_deref(), Some("PBLN_000123"));
        assert_eq!(query_param(url, "missing"), None);
    }
}
