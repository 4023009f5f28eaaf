//! Deterministic pattern extraction over title, description and support-target text.

use std::sync::LazyLock;

use async_trait::async_trait;
use kfund_codes::{scale_labels_longest_first, REGIONS};
use kfund_core::{round_revenue, Confidence, ExtractedEligibility, ExtractionTier};
use regex::{Captures, Regex};

use crate::cascade::{ExtractionInput, ExtractorStrategy};
use crate::ExtractError;

/// Agency names that contain a scale label but say nothing about eligibility.
const AGENCY_NAMES: &[&str] = &[
    "중소벤처기업진흥공단",
    "중소기업기술정보진흥원",
    "중소기업진흥공단",
    "중소기업중앙회",
    "중소벤처기업부",
    "중소기업청",
    "소상공인시장진흥공단",
    "중견기업연합회",
];

/// Words that tie a region name to an eligibility condition.
const REGION_KEYWORDS: &str = "소재|지역|관내|본사|주사무소|사업장|거주";

/// Short region names that are also everyday nouns (`경기` is "the economy").
const COMMON_NOUN_REGION_NAMES: &[&str] = &["경기"];

/// Every region spelling, longest first so `서울특별시` wins over `서울`.
static REGION_NAMES: LazyLock<Vec<(&'static str, &'static str)>> = LazyLock::new(|| {
    let mut names = REGIONS
        .iter()
        .flat_map(|r| r.names.iter().map(move |n| (*n, r.key)))
        .collect::<Vec<_>>();
    names.sort_by_key(|(name, _)| std::cmp::Reverse(name.chars().count()));
    names
});

static REGION_ALTERNATION: LazyLock<String> = LazyLock::new(|| {
    REGION_NAMES
        .iter()
        .map(|(name, _)| regex::escape(name))
        .collect::<Vec<_>>()
        .join("|")
});

static BRACKET_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[\[(【〈<]\s*([^\])】〉>]+?)\s*[\])】〉>]").expect("valid bracket regex"));

static YEAR_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\d{{4}}\s*년\s*(?:도\s*)?({})", *REGION_ALTERNATION)).expect("valid year-prefix regex")
});

static REGION_THEN_KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"({})[^\n.,;]{{0,8}}?(?:{REGION_KEYWORDS})", *REGION_ALTERNATION))
        .expect("valid region keyword regex")
});

static KEYWORD_THEN_REGION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?:{REGION_KEYWORDS})[^\n.,;]{{0,8}}?({})", *REGION_ALTERNATION))
        .expect("valid keyword region regex")
});

static EMPLOYEE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:상시\s*)?(?:근로자|종업원|직원|고용인원|고용)[^\d\n]{0,12}?(?P<a>\d[\d,]*)\s*(?:명|인)?\s*(?P<aop>이상|이하|미만|초과)?(?:\s*(?P<sep>[~∼\-])?\s*(?P<b>\d[\d,]*)\s*(?:명|인)\s*(?P<bop>이상|이하|미만|초과)?)?",
    )
    .expect("valid employee regex")
});

const AMOUNT: &str = r"(?:\d[\d,]*(?:\.\d+)?\s*(?:조|억|천만|백만|만)\s*)+";

static REVENUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?:연매출액|연매출|매출액|매출)[^\d\n]{{0,12}}?(?P<a>{AMOUNT})원?\s*(?P<aop>이상|이하|미만|초과)?(?:\s*(?P<sep>[~∼\-])?\s*(?P<b>{AMOUNT})원?\s*(?P<bop>이상|이하|미만|초과)?)?"
    ))
    .expect("valid revenue regex")
});

static AMOUNT_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d[\d,]*(?:\.\d+)?)\s*(조|억|천만|백만|만)").expect("valid amount regex"));

static AGE_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:업력|창업)\s*(?:후\s*)?(\d{1,3})\s*년?\s*[~∼\-]\s*(\d{1,3})\s*년\s*(이하|미만|이내)?")
        .expect("valid age range regex")
});

static AGE_BOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:업력|창업)\s*(?:후\s*)?(\d{1,3})\s*년\s*(이상|이하|미만|이내|초과|경과)(?:\s*(\d{1,3})\s*년\s*(이하|미만|이내))?",
    )
    .expect("valid age bound regex")
});

static AGE_TRAILING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,3})\s*년\s*(이내|이하|미만)(?:의)?\s*(?:\(예비\))?\s*창업").expect("valid trailing age regex")
});

const MAX_BUSINESS_AGE: u32 = 100;

/// Which side of a range a Korean bound word constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    AtLeast,
    MoreThan,
    AtMost,
    LessThan,
}

impl Bound {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "이상" | "경과" => Some(Bound::AtLeast),
            "초과" => Some(Bound::MoreThan),
            "이하" | "이내" => Some(Bound::AtMost),
            "미만" => Some(Bound::LessThan),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Range<T> {
    min: Option<T>,
    max: Option<T>,
}

fn apply_count_bound(range: &mut Range<u32>, value: u32, bound: Bound) {
    match bound {
        Bound::AtLeast => range.min = Some(value),
        Bound::MoreThan => range.min = Some(value.saturating_add(1)),
        Bound::AtMost => range.max = Some(value),
        Bound::LessThan => range.max = Some(value.saturating_sub(1)),
    }
}

fn apply_revenue_bound(range: &mut Range<f64>, value: f64, bound: Bound) {
    let value = round_revenue(value);
    match bound {
        Bound::AtLeast => range.min = Some(value),
        Bound::MoreThan => range.min = Some(round_revenue(value + 0.1)),
        Bound::AtMost => range.max = Some(value),
        Bound::LessThan => range.max = Some(round_revenue((value - 0.1).max(0.0))),
    }
}

fn parse_count(text: &str) -> Option<u32> {
    text.replace(',', "").parse().ok()
}

/// Scale labels in the text. Longer labels are matched and masked first so a
/// shorter label inside them is never reported.
pub fn extract_company_scale(text: &str) -> Vec<String> {
    let mut masked = text.to_string();
    for agency in AGENCY_NAMES {
        masked = masked.replace(agency, " ");
    }

    let mut found = Vec::new();
    for label in scale_labels_longest_first() {
        if masked.contains(label) {
            found.push(label.to_string());
            masked = masked.replace(label, " ");
        }
    }
    found
}

pub fn extract_employees(text: &str) -> (Option<u32>, Option<u32>) {
    for caps in EMPLOYEE_RE.captures_iter(text) {
        if let Some(range) = count_range_from(&caps) {
            return (range.min, range.max);
        }
    }
    (None, None)
}

fn count_range_from(caps: &Captures<'_>) -> Option<Range<u32>> {
    let a = parse_count(&caps["a"])?;
    let a_bound = caps.name("aop").and_then(|m| Bound::parse(m.as_str()));
    let b = caps.name("b").and_then(|m| parse_count(m.as_str()));
    let b_bound = caps.name("bop").and_then(|m| Bound::parse(m.as_str()));

    let mut range = Range::default();
    match (a_bound, b) {
        (Some(bound), _) => {
            apply_count_bound(&mut range, a, bound);
            if let (Some(b), Some(bound)) = (b, b_bound) {
                apply_count_bound(&mut range, b, bound);
            }
        }
        (None, Some(b)) if caps.name("sep").is_some() => {
            range.min = Some(a);
            apply_count_bound(&mut range, b, b_bound.unwrap_or(Bound::AtMost));
        }
        _ => return None,
    }
    Some(range)
}

/// Sum of `N조 M억 K천만` style tokens, in 억원.
pub fn parse_amount_eok(text: &str) -> Option<f64> {
    let mut total = 0.0;
    let mut any = false;
    for caps in AMOUNT_TOKEN_RE.captures_iter(text) {
        let Ok(value) = caps[1].replace(',', "").parse::<f64>() else {
            continue;
        };
        let unit = match &caps[2] {
            "조" => 10_000.0,
            "억" => 1.0,
            "천만" => 0.1,
            "백만" => 0.01,
            "만" => 0.0001,
            _ => continue,
        };
        total += value * unit;
        any = true;
    }
    any.then_some(total)
}

pub fn extract_revenue(text: &str) -> (Option<f64>, Option<f64>) {
    for caps in REVENUE_RE.captures_iter(text) {
        let Some(a) = parse_amount_eok(&caps["a"]) else {
            continue;
        };
        let a_bound = caps.name("aop").and_then(|m| Bound::parse(m.as_str()));
        let b = caps.name("b").and_then(|m| parse_amount_eok(m.as_str()));
        let b_bound = caps.name("bop").and_then(|m| Bound::parse(m.as_str()));

        let mut range = Range::default();
        match (a_bound, b) {
            (Some(bound), _) => {
                apply_revenue_bound(&mut range, a, bound);
                if let (Some(b), Some(bound)) = (b, b_bound) {
                    apply_revenue_bound(&mut range, b, bound);
                }
            }
            (None, Some(b)) if caps.name("sep").is_some() => {
                range.min = Some(round_revenue(a));
                apply_revenue_bound(&mut range, b, b_bound.unwrap_or(Bound::AtMost));
            }
            _ => continue,
        }
        return (range.min, range.max);
    }
    (None, None)
}

pub fn extract_business_age(text: &str) -> (Option<u32>, Option<u32>) {
    let valid = |n: u32| n <= MAX_BUSINESS_AGE;

    if let Some(caps) = AGE_RANGE_RE.captures(text) {
        if let (Some(a), Some(b)) = (parse_count(&caps[1]), parse_count(&caps[2])) {
            if valid(a) && valid(b) && a <= b {
                let mut range = Range {
                    min: Some(a),
                    max: None,
                };
                let bound = caps.get(3).and_then(|m| Bound::parse(m.as_str())).unwrap_or(Bound::AtMost);
                apply_count_bound(&mut range, b, bound);
                return (range.min, range.max);
            }
        }
    }

    if let Some(caps) = AGE_BOUND_RE.captures(text) {
        let mut range = Range::default();
        if let (Some(a), Some(bound)) = (parse_count(&caps[1]), Bound::parse(&caps[2])) {
            if valid(a) {
                apply_count_bound(&mut range, a, bound);
            }
        }
        if let (Some(b), Some(bound)) = (
            caps.get(3).and_then(|m| parse_count(m.as_str())),
            caps.get(4).and_then(|m| Bound::parse(m.as_str())),
        ) {
            if valid(b) {
                apply_count_bound(&mut range, b, bound);
            }
        }
        if range != Range::default() {
            return (range.min, range.max);
        }
    }

    if let Some(caps) = AGE_TRAILING_RE.captures(text) {
        if let (Some(n), Some(bound)) = (parse_count(&caps[1]), Bound::parse(&caps[2])) {
            if valid(n) {
                let mut range = Range::default();
                apply_count_bound(&mut range, n, bound);
                return (range.min, range.max);
            }
        }
    }

    // Life-stage vocabulary.
    if text.contains("창업도약") || text.contains("도약기") {
        return (Some(3), Some(7));
    }
    if text.contains("초기창업") || text.contains("초기 창업") {
        return (None, Some(3));
    }
    (None, None)
}

fn is_hangul_syllable(c: char) -> bool {
    ('\u{AC00}'..='\u{D7A3}').contains(&c)
}

/// Short names like `대전` must not be the start of another word (`대전환`, `부산물`).
/// Returns the matched spelling and its region key.
fn region_at_word_start(text: &str) -> Option<(&'static str, &'static str)> {
    REGION_NAMES.iter().find_map(|(name, key)| {
        let rest = text.strip_prefix(name)?;
        let standalone = name.chars().count() >= 3 || !rest.chars().next().is_some_and(is_hangul_syllable);
        standalone.then_some((*name, *key))
    })
}

/// A region keyword directly before or after the name, with only whitespace between.
fn keyword_adjacent(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].trim_end();
    let after = text[end..].trim_start();
    REGION_KEYWORDS
        .split('|')
        .any(|k| before.ends_with(k) || after.starts_with(k))
}

/// The region named at `start`, if it stands alone as a word. Names that double as
/// common nouns only count when a region keyword sits right next to them.
fn region_mention(text: &str, start: usize) -> Option<&'static str> {
    let (name, key) = region_at_word_start(&text[start..])?;
    if COMMON_NOUN_REGION_NAMES.contains(&name) && !keyword_adjacent(text, start, start + name.len()) {
        return None;
    }
    Some(key)
}

fn push_unique(out: &mut Vec<String>, key: &str) {
    if !out.iter().any(|k| k == key) {
        out.push(key.to_string());
    }
}

/// Regions by precedence: bracketed title prefix, bare leading region name,
/// year-prefixed mention in the title, then region names next to an eligibility
/// keyword anywhere in the text. The first rule that yields a region wins.
pub fn extract_regions(title: &str, text: &str) -> Vec<String> {
    let mut regions = Vec::new();

    if let Some(caps) = BRACKET_PREFIX_RE.captures(title) {
        let inner = &caps[1];
        for part in inner.split(|c: char| matches!(c, '·' | ',' | '/' | '・') || c.is_whitespace()) {
            if let Some((_, key)) = region_at_word_start(part.trim()) {
                push_unique(&mut regions, key);
            }
        }
        if !regions.is_empty() {
            return regions;
        }
    }

    let unbracketed = BRACKET_PREFIX_RE.replace(title, "");
    let unbracketed = unbracketed.trim_start();
    if let Some(key) = region_mention(unbracketed, 0) {
        return vec![key.to_string()];
    }

    for caps in YEAR_PREFIX_RE.captures_iter(title) {
        let Some(m) = caps.get(1) else { continue };
        if let Some(key) = region_mention(title, m.start()) {
            return vec![key.to_string()];
        }
    }

    let mut hits = Vec::new();
    for re in [&*REGION_THEN_KEYWORD_RE, &*KEYWORD_THEN_REGION_RE] {
        for caps in re.captures_iter(text) {
            let Some(m) = caps.get(1) else { continue };
            if let Some(key) = region_mention(text, m.start()) {
                hits.push((m.start(), key));
            }
        }
    }
    hits.sort_by_key(|(pos, _)| *pos);
    for (_, key) in hits {
        push_unique(&mut regions, key);
    }
    regions
}

pub fn confidence_for(populated: usize) -> Confidence {
    match populated {
        0 => Confidence::Low,
        1 | 2 => Confidence::Medium,
        _ => Confidence::High,
    }
}

/// Run every Tier 1 pattern over `title` plus `body`.
pub fn extract_tier1(title: &str, body: &str) -> ExtractedEligibility {
    let text = format!("{title}\n{body}");
    let (min_employees, max_employees) = extract_employees(&text);
    let (min_revenue, max_revenue) = extract_revenue(&text);
    let (min_business_age, max_business_age) = extract_business_age(&text);

    let mut result = ExtractedEligibility {
        regions: extract_regions(title, &text),
        company_scale: extract_company_scale(&text),
        min_employees,
        max_employees,
        min_revenue,
        max_revenue,
        min_business_age,
        max_business_age,
        source_tier: Some(ExtractionTier::Tier1),
        ..Default::default()
    };
    result.confidence = confidence_for(result.populated_field_count());
    result
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Tier1Extractor;

#[async_trait]
impl ExtractorStrategy for Tier1Extractor {
    fn tier(&self) -> ExtractionTier {
        ExtractionTier::Tier1
    }

    async fn extract(&self, input: &ExtractionInput) -> Result<ExtractedEligibility, ExtractError> {
        Ok(extract_tier1(&input.title, &input.short_text_body()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_labels_are_not_split() {
        assert_eq!(extract_company_scale("중소기업 한정"), vec!["중소기업"]);
        assert_eq!(extract_company_scale("소기업 및 소상공인"), vec!["소상공인", "소기업"]);
        assert!(extract_company_scale("중소기업기술정보진흥원 공고").is_empty());
    }

    #[test]
    fn revenue_units_convert_to_eok() {
        let (min, max) = extract_revenue("매출액 100억 미만 기업");
        assert_eq!(min, None);
        let max = max.unwrap();
        assert!(max < 100.0);
        assert_eq!(max, 99.9);

        assert_eq!(extract_revenue("연매출 10억 이상 50억 이하"), (Some(10.0), Some(50.0)));
        assert_eq!(extract_revenue("연매출액 1조 5,000억원 이하"), (None, Some(15_000.0)));
        assert_eq!(extract_revenue("매출 5천만원 이상"), (Some(0.5), None));
        assert_eq!(extract_revenue("매출 10억~50억 기업"), (Some(10.0), Some(50.0)));
        assert_eq!(extract_revenue("매출 증대 2배"), (None, None));
    }

    #[test]
    fn employee_bounds() {
        assert_eq!(extract_employees("상시근로자 5인 이상"), (Some(5), None));
        assert_eq!(extract_employees("직원 수 50명 미만"), (None, Some(49)));
        assert_eq!(extract_employees("종업원 10~299명"), (Some(10), Some(299)));
        assert_eq!(extract_employees("상시 근로자 5명 이상 300명 미만"), (Some(5), Some(299)));
        assert_eq!(extract_employees("고용 2026년 계획"), (None, None));
    }

    #[test]
    fn business_age_forms() {
        assert_eq!(extract_business_age("업력 3년~7년 기업"), (Some(3), Some(7)));
        assert_eq!(extract_business_age("창업 3년 이내"), (None, Some(3)));
        assert_eq!(extract_business_age("업력 7년 이상"), (Some(7), None));
        assert_eq!(extract_business_age("업력 10년 미만"), (None, Some(9)));
        assert_eq!(extract_business_age("창업 후 3년 이상 7년 이하"), (Some(3), Some(7)));
        assert_eq!(extract_business_age("7년 이내 창업기업"), (None, Some(7)));
        assert_eq!(extract_business_age("창업도약패키지"), (Some(3), Some(7)));
        assert_eq!(extract_business_age("초기창업기업 모집"), (None, Some(3)));
    }

    #[test]
    fn bracket_prefix_beats_year_prefixed_region() {
        let title = "[서울] 2026년 대구 협력사업";
        assert_eq!(extract_regions(title, title), vec!["SEOUL"]);
    }

    #[test]
    fn region_rules_in_order() {
        assert_eq!(extract_regions("경기도 스마트공장 지원", ""), vec!["GYEONGGI"]);
        assert_eq!(extract_regions("2026년 부산 창업 지원", ""), vec!["BUSAN"]);
        assert!(extract_regions("대전환 프로젝트 안내", "").is_empty());
        assert_eq!(
            extract_regions("청년 지원사업", "본사가 부산광역시에 있는 기업, 서울 협력 네트워크"),
            vec!["BUSAN"]
        );
        assert_eq!(extract_regions("[서울·경기] 공동 지원", ""), vec!["SEOUL", "GYEONGGI"]);
    }

    #[test]
    fn region_names_inside_other_words_are_ignored() {
        assert!(extract_regions("부산물 재활용 지원", "부산물 처리 지역 업체").is_empty());
        assert!(extract_regions("경기 회복 지원사업", "").is_empty());
        assert!(extract_regions("2026년 경기 활성화 바우처", "").is_empty());
        assert_eq!(extract_regions("경기 소재 제조기업 지원", ""), vec!["GYEONGGI"]);
        assert_eq!(
            extract_regions("판로 지원사업", "부산물 처리 기업 중 부산 소재 기업"),
            vec!["BUSAN"]
        );
    }

    #[test]
    fn end_to_end_fixture_text_is_high_confidence() {
        let result = extract_tier1("청년 기업 지원 공고", "업력 3년~7년 기업 대상, 서울특별시 소재, 중소기업 한정");
        assert_eq!(result.min_business_age, Some(3));
        assert_eq!(result.max_business_age, Some(7));
        assert_eq!(result.regions, vec!["SEOUL"]);
        assert_eq!(result.company_scale, vec!["중소기업"]);
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.populated_field_count(), 4);
    }

    #[test]
    fn empty_text_is_low_confidence() {
        let result = extract_tier1("R&D 과제 안내", "세부 자격요건은 첨부 참고");
        assert!(result.is_empty());
        assert_eq!(result.confidence, Confidence::Low);
    }
}
