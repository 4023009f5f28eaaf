//! Canonical agency code tables and the eligibility predicates the matching engine
//! evaluates against them.

use kfund_core::{ExtractedEligibility, NormalizedEligibility};
use serde::Serialize;
use tracing::debug;

mod brackets;
mod certs;
mod regions;
mod scales;

pub use brackets::{
    bracket_for, brackets_for_range, business_age_bracket, check_business_age, check_employees,
    check_revenue, Bracket, BUSINESS_AGE_BRACKETS, EMPLOYEE_BRACKETS, REVENUE_BRACKETS,
};
pub use certs::{cert_code, cert_key, check_certifications, Certification, CERTIFICATIONS, FUZZY_MATCH_THRESHOLD};
pub use regions::{
    check_region, normalize_region_code, region_by_code, region_by_key, region_by_name, region_code, Region,
    NATIONWIDE_CODE, NATIONWIDE_KEY, REGIONS, REGION_CODE_LEN,
};
pub use scales::{scale_code, scale_label, scale_labels_longest_first, CompanyScale, SCALES};

pub const CRATE_NAME: &str = "kfund-codes";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EligibilityCheck {
    pub eligible: bool,
    pub reason: String,
}

impl EligibilityCheck {
    pub fn eligible(reason: impl Into<String>) -> Self {
        Self {
            eligible: true,
            reason: reason.into(),
        }
    }

    pub fn ineligible(reason: impl Into<String>) -> Self {
        Self {
            eligible: false,
            reason: reason.into(),
        }
    }
}

fn push_unique(out: &mut Vec<String>, code: &str) {
    if !out.iter().any(|c| c == code) {
        out.push(code.to_string());
    }
}

/// Map extracted concepts onto canonical codes. Values without a mapping are dropped
/// so code fields never carry free text.
pub fn normalize_eligibility(extracted: &ExtractedEligibility) -> NormalizedEligibility {
    let mut region_codes = Vec::new();
    for region in &extracted.regions {
        match region_code(region) {
            Some(code) => push_unique(&mut region_codes, code),
            None => debug!(region = %region, "dropping unmapped region"),
        }
    }
    // Nationwide subsumes every province.
    if region_codes.iter().any(|c| c == NATIONWIDE_CODE) {
        region_codes = vec![NATIONWIDE_CODE.to_string()];
    }

    let mut scale_codes = Vec::new();
    for label in &extracted.company_scale {
        match scale_code(label) {
            Some(code) => push_unique(&mut scale_codes, code),
            None => debug!(label = %label, "dropping unmapped company scale"),
        }
    }

    let mut cert_codes = Vec::new();
    for cert in &extracted.required_certs {
        match cert_code(cert) {
            Some(code) => push_unique(&mut cert_codes, code),
            None => debug!(cert = %cert, "dropping unmapped certification"),
        }
    }

    NormalizedEligibility {
        region_codes,
        scale_codes,
        cert_codes,
        business_age_brackets: brackets_for_range(
            BUSINESS_AGE_BRACKETS,
            extracted.min_business_age.map(f64::from),
            extracted.max_business_age.map(f64::from),
        ),
        revenue_brackets: brackets_for_range(REVENUE_BRACKETS, extracted.min_revenue, extracted.max_revenue),
        employee_brackets: brackets_for_range(
            EMPLOYEE_BRACKETS,
            extracted.min_employees.map(f64::from),
            extracted.max_employees.map(f64::from),
        ),
        min_employees: extracted.min_employees,
        max_employees: extracted.max_employees,
        min_revenue: extracted.min_revenue,
        max_revenue: extracted.max_revenue,
        min_business_age: extracted.min_business_age,
        max_business_age: extracted.max_business_age,
        target_industry: extracted.target_industry.clone(),
        exclusion_conditions: extracted.exclusion_conditions.clone(),
        support_amount_min: extracted.support_amount_min,
        support_amount_max: extracted.support_amount_max,
    }
}
