use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})\s*[.\-/년]\s*(\d{1,2})\s*[.\-/월]\s*(\d{1,2})\s*일?").expect("valid date regex")
});

/// All calendar dates found in `text`, in order of appearance.
pub fn find_dates(text: &str) -> Vec<NaiveDate> {
    DATE_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let year = caps[1].parse().ok()?;
            let month = caps[2].parse().ok()?;
            let day = caps[3].parse().ok()?;
            NaiveDate::from_ymd_opt(year, month, day)
        })
        .collect()
}

/// Application window parsed from texts like `2026.01.02 ~ 2026.02.15`.
///
/// A lone date is read as the deadline. Rolling windows (`상시 접수`) yield nothing.
pub fn parse_period(text: &str) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let dates = find_dates(text);
    match dates.as_slice() {
        [] => (None, None),
        [only] => (None, Some(*only)),
        [first, .., last] => {
            if first <= last {
                (Some(*first), Some(*last))
            } else {
                (Some(*last), Some(*first))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn parses_dotted_range() {
        assert_eq!(
            parse_period("2026.01.02 ~ 2026.02.15"),
            (Some(d(2026, 1, 2)), Some(d(2026, 2, 15)))
        );
    }

    #[test]
    fn parses_korean_long_form_and_single_deadline() {
        assert_eq!(parse_period("2026년 3월 5일까지"), (None, Some(d(2026, 3, 5))));
        assert_eq!(
            parse_period("2026-04-01 09:00 ~ 2026-04-30 18:00"),
            (Some(d(2026, 4, 1)), Some(d(2026, 4, 30)))
        );
    }

    #[test]
    fn rolling_and_invalid_dates_yield_nothing() {
        assert_eq!(parse_period("상시 접수"), (None, None));
        assert!(find_dates("2026.13.40").is_empty());
    }
}
