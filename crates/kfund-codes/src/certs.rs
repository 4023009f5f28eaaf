use strsim::jaro_winkler;
use tracing::debug;

use crate::EligibilityCheck;

/// Minimum Jaro-Winkler score for a near-miss spelling to count as a synonym.
pub const FUZZY_MATCH_THRESHOLD: f64 = 0.92;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Certification {
    pub code: &'static str,
    pub name: &'static str,
    pub synonyms: &'static [&'static str],
}

pub const CERTIFICATIONS: &[Certification] = &[
    Certification {
        code: "VENTURE",
        name: "벤처기업",
        synonyms: &["벤처기업", "벤처기업확인", "벤처인증", "벤처확인기업", "venture", "venture company"],
    },
    Certification {
        code: "INNOBIZ",
        name: "이노비즈",
        synonyms: &["이노비즈", "inno-biz", "innobiz", "기술혁신형중소기업", "기술혁신형 중소기업"],
    },
    Certification {
        code: "MAINBIZ",
        name: "메인비즈",
        synonyms: &["메인비즈", "main-biz", "mainbiz", "경영혁신형중소기업", "경영혁신형 중소기업"],
    },
    Certification {
        code: "WOMEN_OWNED",
        name: "여성기업",
        synonyms: &["여성기업", "여성기업확인", "여성기업확인서", "women-owned business"],
    },
    Certification {
        code: "DISABLED_OWNED",
        name: "장애인기업",
        synonyms: &["장애인기업", "장애인기업확인", "장애인기업확인서"],
    },
    Certification {
        code: "SOCIAL_ENTERPRISE",
        name: "사회적기업",
        synonyms: &["사회적기업", "인증사회적기업", "social enterprise"],
    },
    Certification {
        code: "RESEARCH_INSTITUTE",
        name: "기업부설연구소",
        synonyms: &["기업부설연구소", "부설연구소", "연구전담부서", "r&d center"],
    },
];

/// Case, hyphen and whitespace insensitive comparison key.
pub fn cert_key(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '_' | '(' | ')' | '·'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Canonical certification code for a name variant or an existing code.
pub fn cert_code(value: &str) -> Option<&'static str> {
    let key = cert_key(value);
    if key.is_empty() {
        return None;
    }

    for cert in CERTIFICATIONS {
        if cert_key(cert.code) == key || cert.synonyms.iter().any(|s| cert_key(s) == key) {
            return Some(cert.code);
        }
    }

    let key = key.as_str();
    let (best, score) = CERTIFICATIONS
        .iter()
        .flat_map(|cert| cert.synonyms.iter().map(move |s| (cert, jaro_winkler(&cert_key(s), key))))
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    if score >= FUZZY_MATCH_THRESHOLD {
        debug!(value, code = best.code, score, "fuzzy certification match");
        Some(best.code)
    } else {
        None
    }
}

/// Every required certification must be held. Both sides may use any variant.
pub fn check_certifications(required: &[String], held: &[String]) -> EligibilityCheck {
    if required.is_empty() {
        return EligibilityCheck::eligible("no certification required");
    }
    let held_codes = held.iter().filter_map(|h| cert_code(h)).collect::<Vec<_>>();
    let missing = required
        .iter()
        .filter(|r| match cert_code(r) {
            Some(code) => !held_codes.contains(&code),
            None => !held.iter().any(|h| cert_key(h) == cert_key(r)),
        })
        .map(String::as_str)
        .collect::<Vec<_>>();

    if missing.is_empty() {
        EligibilityCheck::eligible(format!("holds {}", required.join(", ")))
    } else {
        EligibilityCheck::ineligible(format!("missing certification: {}", missing.join(", ")))
    }
}
