//! Versioned contracts for model responses. Responses are validated field by field:
//! unknown fields are ignored and values that fail validation are dropped.

use kfund_codes::{region_by_code, region_by_key, region_by_name, scale_code, scale_label};
use kfund_core::{round_revenue, ExtractedEligibility};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::llm::strip_code_blocks;

pub const RESPONSE_SCHEMA_VERSION: u64 = 1;

/// Model support amounts are requested in 만원.
const MANWON_KRW: u64 = 10_000;

const MAX_EMPLOYEES: u64 = 1_000_000;
const MAX_BUSINESS_AGE: u64 = 200;
/// 억원; one quadrillion won is well past any eligibility bound.
const MAX_REVENUE_EOK: f64 = 10_000_000.0;
const MAX_TEXT_ITEM_CHARS: usize = 200;

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("response is not valid JSON: {0}")]
    Json(String),
    #[error("response is not a JSON object")]
    NotAnObject,
    #[error("unsupported schema_version {0}")]
    UnsupportedVersion(String),
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, SchemaError> {
    let value: Value = serde_json::from_str(strip_code_blocks(raw)).map_err(|e| SchemaError::Json(e.to_string()))?;
    let Value::Object(object) = value else {
        return Err(SchemaError::NotAnObject);
    };
    match object.get("schema_version") {
        None | Some(Value::Null) => {}
        Some(v) if v.as_u64() == Some(RESPONSE_SCHEMA_VERSION) => {}
        Some(v) => return Err(SchemaError::UnsupportedVersion(v.to_string())),
    }
    Ok(object)
}

fn bounded_u64(object: &Map<String, Value>, field: &str, max: u64) -> Option<u64> {
    let value = object.get(field)?;
    let parsed = match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().replace(',', "").parse::<u64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v <= max => Some(v),
        _ => {
            if !value.is_null() {
                debug!(field, value = %value, "dropping invalid numeric field");
            }
            None
        }
    }
}

fn bounded_f64(object: &Map<String, Value>, field: &str, max: f64) -> Option<f64> {
    let value = object.get(field)?;
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() && (0.0..=max).contains(&v) => Some(v),
        _ => {
            if !value.is_null() {
                debug!(field, value = %value, "dropping invalid numeric field");
            }
            None
        }
    }
}

fn string_list(object: &Map<String, Value>, field: &str) -> Vec<String> {
    let items = match object.get(field) {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect::<Vec<_>>(),
        Some(Value::String(s)) => vec![s.as_str()],
        _ => return Vec::new(),
    };
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let item = item.trim();
        if item.is_empty() || item.chars().count() > MAX_TEXT_ITEM_CHARS {
            continue;
        }
        if !out.iter().any(|o| o == item) {
            out.push(item.to_string());
        }
    }
    out
}

fn optional_text(object: &Map<String, Value>, field: &str) -> Option<String> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.chars().count() <= MAX_TEXT_ITEM_CHARS)
        .map(str::to_string)
}

/// `min > max` is contradictory, so both bounds are dropped.
fn ordered<T: PartialOrd + std::fmt::Debug>(field: &str, min: Option<T>, max: Option<T>) -> (Option<T>, Option<T>) {
    match (&min, &max) {
        (Some(lo), Some(hi)) if lo > hi => {
            debug!(field, ?min, ?max, "dropping inverted bounds");
            (None, None)
        }
        _ => (min, max),
    }
}

fn region_keys(values: Vec<String>) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for value in values {
        let region = region_by_key(&value)
            .or_else(|| region_by_name(&value))
            .or_else(|| region_by_code(&value));
        match region {
            Some(region) if !keys.iter().any(|k| k == region.key) => keys.push(region.key.to_string()),
            Some(_) => {}
            None => debug!(region = %value, "dropping unknown region"),
        }
    }
    keys
}

fn scale_labels(values: Vec<String>) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for value in values {
        match scale_code(&value).and_then(scale_label) {
            Some(label) if !labels.iter().any(|l| l == label) => labels.push(label.to_string()),
            Some(_) => {}
            None => debug!(scale = %value, "dropping unknown company scale"),
        }
    }
    labels
}

fn apply_core_fields(object: &Map<String, Value>, out: &mut ExtractedEligibility) {
    out.regions = region_keys(string_list(object, "regions"));
    out.company_scale = scale_labels(string_list(object, "company_scale"));

    let to_u32 = |v: u64| u32::try_from(v).ok();
    (out.min_employees, out.max_employees) = ordered(
        "employees",
        bounded_u64(object, "min_employees", MAX_EMPLOYEES).and_then(to_u32),
        bounded_u64(object, "max_employees", MAX_EMPLOYEES).and_then(to_u32),
    );
    (out.min_revenue, out.max_revenue) = ordered(
        "revenue",
        bounded_f64(object, "min_revenue_eok", MAX_REVENUE_EOK).map(round_revenue),
        bounded_f64(object, "max_revenue_eok", MAX_REVENUE_EOK).map(round_revenue),
    );
    (out.min_business_age, out.max_business_age) = ordered(
        "business_age",
        bounded_u64(object, "min_business_age", MAX_BUSINESS_AGE).and_then(to_u32),
        bounded_u64(object, "max_business_age", MAX_BUSINESS_AGE).and_then(to_u32),
    );
}

/// Short-context response: regions, scale, employee, revenue and business-age bounds.
pub fn parse_tier2_response(raw: &str) -> Result<ExtractedEligibility, SchemaError> {
    let object = parse_object(raw)?;
    let mut out = ExtractedEligibility::default();
    apply_core_fields(&object, &mut out);
    Ok(out)
}

/// Full-document response: the short-context fields plus certifications, industry,
/// exclusions and the support amount range.
pub fn parse_tier3_response(raw: &str) -> Result<ExtractedEligibility, SchemaError> {
    let object = parse_object(raw)?;
    let mut out = ExtractedEligibility::default();
    apply_core_fields(&object, &mut out);

    out.required_certs = string_list(&object, "required_certs");
    out.target_industry = optional_text(&object, "target_industry");
    out.exclusion_conditions = string_list(&object, "exclusion_conditions");

    let to_krw = |manwon: u64| manwon.checked_mul(MANWON_KRW);
    (out.support_amount_min, out.support_amount_max) = ordered(
        "support_amount",
        bounded_u64(&object, "support_amount_min_manwon", u64::MAX / MANWON_KRW).and_then(to_krw),
        bounded_u64(&object, "support_amount_max_manwon", u64::MAX / MANWON_KRW).and_then(to_krw),
    );
    Ok(out)
}
