use crate::EligibilityCheck;

pub const NATIONWIDE_KEY: &str = "NATIONWIDE";
pub const NATIONWIDE_CODE: &str = "00";

/// Canonical region codes are the two-digit province prefix of the administrative code.
pub const REGION_CODE_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub key: &'static str,
    pub code: &'static str,
    /// Official name first, then common short forms.
    pub names: &'static [&'static str],
}

impl Region {
    pub fn official_name(&self) -> &'static str {
        self.names[0]
    }
}

pub const REGIONS: &[Region] = &[
    Region { key: "SEOUL", code: "11", names: &["서울특별시", "서울시", "서울"] },
    Region { key: "BUSAN", code: "26", names: &["부산광역시", "부산시", "부산"] },
    Region { key: "DAEGU", code: "27", names: &["대구광역시", "대구시", "대구"] },
    Region { key: "INCHEON", code: "28", names: &["인천광역시", "인천시", "인천"] },
    Region { key: "GWANGJU", code: "29", names: &["광주광역시", "광주시", "광주"] },
    Region { key: "DAEJEON", code: "30", names: &["대전광역시", "대전시", "대전"] },
    Region { key: "ULSAN", code: "31", names: &["울산광역시", "울산시", "울산"] },
    Region { key: "SEJONG", code: "36", names: &["세종특별자치시", "세종시", "세종"] },
    Region { key: "GYEONGGI", code: "41", names: &["경기도", "경기"] },
    Region { key: "GANGWON", code: "42", names: &["강원특별자치도", "강원도", "강원"] },
    Region { key: "CHUNGBUK", code: "43", names: &["충청북도", "충북"] },
    Region { key: "CHUNGNAM", code: "44", names: &["충청남도", "충남"] },
    Region { key: "JEONBUK", code: "45", names: &["전북특별자치도", "전라북도", "전북"] },
    Region { key: "JEONNAM", code: "46", names: &["전라남도", "전남"] },
    Region { key: "GYEONGBUK", code: "47", names: &["경상북도", "경북"] },
    Region { key: "GYEONGNAM", code: "48", names: &["경상남도", "경남"] },
    Region { key: "JEJU", code: "50", names: &["제주특별자치도", "제주도", "제주"] },
    Region { key: NATIONWIDE_KEY, code: NATIONWIDE_CODE, names: &["전국"] },
];

pub fn region_by_key(key: &str) -> Option<&'static Region> {
    REGIONS.iter().find(|r| r.key.eq_ignore_ascii_case(key))
}

pub fn region_by_name(name: &str) -> Option<&'static Region> {
    let name = name.trim();
    REGIONS.iter().find(|r| r.names.contains(&name))
}

/// Look up a region by canonical code. Longer administrative codes (`1168000000`) are
/// truncated to the two-digit prefix first.
pub fn region_by_code(code: &str) -> Option<&'static Region> {
    let code = normalize_region_code(code)?;
    REGIONS.iter().find(|r| r.code == code)
}

pub fn normalize_region_code(code: &str) -> Option<String> {
    let code = code.trim();
    if code.len() < REGION_CODE_LEN || !code.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(code[..REGION_CODE_LEN].to_string())
}

/// Accepts a region key, a Korean name or an administrative code.
pub fn region_code(value: &str) -> Option<&'static str> {
    region_by_key(value)
        .or_else(|| region_by_name(value))
        .or_else(|| region_by_code(value))
        .map(|r| r.code)
}

/// `required` holds canonical region codes. A company code of any length is accepted.
pub fn check_region(required: &[String], company_code: &str) -> EligibilityCheck {
    if required.is_empty() {
        return EligibilityCheck::eligible("no regional restriction");
    }
    if required.iter().any(|c| c == NATIONWIDE_CODE) {
        return EligibilityCheck::eligible("open nationwide");
    }
    let Some(company) = region_by_code(company_code) else {
        return EligibilityCheck::ineligible(format!("unknown company region code {company_code}"));
    };
    if required.iter().any(|c| c == company.code) {
        EligibilityCheck::eligible(format!("located in {}", company.official_name()))
    } else {
        let names = required
            .iter()
            .filter_map(|c| region_by_code(c))
            .map(|r| r.official_name())
            .collect::<Vec<_>>()
            .join(", ");
        EligibilityCheck::ineligible(format!(
            "restricted to {names}; company is in {}",
            company.official_name()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_administrative_codes_are_truncated() {
        assert_eq!(normalize_region_code("1168010100").as_deref(), Some("11"));
        assert_eq!(region_by_code("4113500000").map(|r| r.key), Some("GYEONGGI"));
        assert_eq!(normalize_region_code("1"), None);
        assert_eq!(normalize_region_code("AB12"), None);
    }

    #[test]
    fn mapping_is_bidirectional() {
        assert_eq!(region_code("SEOUL"), Some("11"));
        assert_eq!(region_code("서울특별시"), Some("11"));
        assert_eq!(region_code("제주"), Some("50"));
        assert_eq!(region_by_code("26").map(|r| r.official_name()), Some("부산광역시"));
    }

    #[test]
    fn nationwide_always_passes() {
        let check = check_region(&["00".into()], "4800000000");
        assert!(check.eligible);

        let check = check_region(&["11".into()], "48");
        assert!(!check.eligible);
        assert!(check.reason.contains("서울특별시"));

        assert!(check_region(&[], "99").eligible);
        assert!(check_region(&["11".into()], "1111000000").eligible);
    }
}
