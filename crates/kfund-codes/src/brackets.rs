use crate::EligibilityCheck;

/// Half-open interval `[lower, upper)`. A value on a boundary belongs to the upper
/// bracket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bracket {
    pub code: &'static str,
    pub lower: f64,
    pub upper: Option<f64>,
}

impl Bracket {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && self.upper.is_none_or(|upper| value < upper)
    }

    /// Whether any value of the inclusive range `[min, max]` falls in this bracket.
    pub fn overlaps(&self, min: Option<f64>, max: Option<f64>) -> bool {
        let min = min.unwrap_or(0.0);
        let above_lower = max.is_none_or(|max| max >= self.lower);
        let below_upper = self.upper.is_none_or(|upper| min < upper);
        above_lower && below_upper
    }
}

/// Years since founding.
pub const BUSINESS_AGE_BRACKETS: &[Bracket] = &[
    Bracket { code: "AGE_0_3", lower: 0.0, upper: Some(3.0) },
    Bracket { code: "AGE_3_5", lower: 3.0, upper: Some(5.0) },
    Bracket { code: "AGE_5_7", lower: 5.0, upper: Some(7.0) },
    Bracket { code: "AGE_7_10", lower: 7.0, upper: Some(10.0) },
    Bracket { code: "AGE_10_PLUS", lower: 10.0, upper: None },
];

/// Annual revenue in 억원.
pub const REVENUE_BRACKETS: &[Bracket] = &[
    Bracket { code: "REV_UNDER_10", lower: 0.0, upper: Some(10.0) },
    Bracket { code: "REV_10_50", lower: 10.0, upper: Some(50.0) },
    Bracket { code: "REV_50_100", lower: 50.0, upper: Some(100.0) },
    Bracket { code: "REV_100_500", lower: 100.0, upper: Some(500.0) },
    Bracket { code: "REV_500_1000", lower: 500.0, upper: Some(1000.0) },
    Bracket { code: "REV_1000_PLUS", lower: 1000.0, upper: None },
];

pub const EMPLOYEE_BRACKETS: &[Bracket] = &[
    Bracket { code: "EMP_UNDER_5", lower: 0.0, upper: Some(5.0) },
    Bracket { code: "EMP_5_10", lower: 5.0, upper: Some(10.0) },
    Bracket { code: "EMP_10_50", lower: 10.0, upper: Some(50.0) },
    Bracket { code: "EMP_50_300", lower: 50.0, upper: Some(300.0) },
    Bracket { code: "EMP_300_PLUS", lower: 300.0, upper: None },
];

pub fn bracket_for(table: &[Bracket], value: f64) -> Option<&'static str> {
    table.iter().find(|b| b.contains(value)).map(|b| b.code)
}

/// Codes of every bracket the inclusive range touches. No bounds means no constraint,
/// which is expressed as no codes.
pub fn brackets_for_range(table: &[Bracket], min: Option<f64>, max: Option<f64>) -> Vec<String> {
    if min.is_none() && max.is_none() {
        return Vec::new();
    }
    table
        .iter()
        .filter(|b| b.overlaps(min, max))
        .map(|b| b.code.to_string())
        .collect()
}

pub fn business_age_bracket(years: u32) -> Option<&'static str> {
    bracket_for(BUSINESS_AGE_BRACKETS, f64::from(years))
}

fn check_range(
    label: &str,
    unit: &str,
    min: Option<f64>,
    max: Option<f64>,
    value: Option<f64>,
) -> EligibilityCheck {
    if min.is_none() && max.is_none() {
        return EligibilityCheck::eligible(format!("no {label} requirement"));
    }
    let Some(value) = value else {
        return EligibilityCheck::ineligible(format!("{label} unknown"));
    };
    if let Some(min) = min {
        if value < min {
            return EligibilityCheck::ineligible(format!("{label} {value}{unit} is below the minimum {min}{unit}"));
        }
    }
    if let Some(max) = max {
        if value > max {
            return EligibilityCheck::ineligible(format!("{label} {value}{unit} exceeds the maximum {max}{unit}"));
        }
    }
    EligibilityCheck::eligible(format!("{label} {value}{unit} is within range"))
}

/// Revenue bounds and the company's revenue are in 억원.
pub fn check_revenue(min: Option<f64>, max: Option<f64>, revenue: Option<f64>) -> EligibilityCheck {
    check_range("revenue", "억원", min, max, revenue)
}

pub fn check_business_age(min: Option<u32>, max: Option<u32>, years: Option<u32>) -> EligibilityCheck {
    check_range(
        "business age",
        "y",
        min.map(f64::from),
        max.map(f64::from),
        years.map(f64::from),
    )
}

pub fn check_employees(min: Option<u32>, max: Option<u32>, employees: Option<u32>) -> EligibilityCheck {
    check_range(
        "employee count",
        "",
        min.map(f64::from),
        max.map(f64::from),
        employees.map(f64::from),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_values_belong_to_the_upper_bracket() {
        assert_eq!(business_age_bracket(5), Some("AGE_5_7"));
        assert_eq!(business_age_bracket(4), Some("AGE_3_5"));
        assert_eq!(business_age_bracket(0), Some("AGE_0_3"));
        assert_eq!(business_age_bracket(25), Some("AGE_10_PLUS"));
        assert_eq!(bracket_for(REVENUE_BRACKETS, 100.0), Some("REV_100_500"));
        assert_eq!(bracket_for(REVENUE_BRACKETS, 99.9), Some("REV_50_100"));
    }

    #[test]
    fn ranges_cover_every_touched_bracket() {
        let codes = brackets_for_range(BUSINESS_AGE_BRACKETS, Some(3.0), Some(7.0));
        assert_eq!(codes, vec!["AGE_3_5", "AGE_5_7", "AGE_7_10"]);

        let codes = brackets_for_range(REVENUE_BRACKETS, None, Some(99.9));
        assert_eq!(codes, vec!["REV_UNDER_10", "REV_10_50", "REV_50_100"]);

        assert!(brackets_for_range(EMPLOYEE_BRACKETS, None, None).is_empty());
    }

    #[test]
    fn revenue_check_reports_reason() {
        let check = check_revenue(None, Some(99.9), Some(120.0));
        assert!(!check.eligible);
        assert!(check.reason.contains("exceeds"));
        assert!(check_revenue(Some(10.0), Some(50.0), Some(10.0)).eligible);
        assert!(check_revenue(None, None, None).eligible);
        assert!(!check_revenue(Some(10.0), None, None).eligible);
    }
}
