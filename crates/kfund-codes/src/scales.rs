#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompanyScale {
    pub code: &'static str,
    pub label: &'static str,
}

/// Korean scale labels and their canonical codes. Tier 1 checks these labels longest
/// first so `중소기업` is never read as `소기업`.
pub const SCALES: &[CompanyScale] = &[
    CompanyScale { code: "PRE_STARTUP", label: "예비창업자" },
    CompanyScale { code: "MICRO", label: "소상공인" },
    CompanyScale { code: "MIDSIZE", label: "중견기업" },
    CompanyScale { code: "SME", label: "중소기업" },
    CompanyScale { code: "STARTUP", label: "창업기업" },
    CompanyScale { code: "STARTUP", label: "스타트업" },
    CompanyScale { code: "LARGE", label: "대기업" },
    CompanyScale { code: "SMALL", label: "소기업" },
    CompanyScale { code: "MICRO_MANUFACTURER", label: "소공인" },
];

pub fn scale_code(label: &str) -> Option<&'static str> {
    let label = label.trim();
    SCALES
        .iter()
        .find(|s| s.label == label || s.code.eq_ignore_ascii_case(label))
        .map(|s| s.code)
}

/// Preferred Korean label for a code.
pub fn scale_label(code: &str) -> Option<&'static str> {
    SCALES.iter().find(|s| s.code == code).map(|s| s.label)
}

/// Labels ordered longest first, ties broken by table order.
pub fn scale_labels_longest_first() -> Vec<&'static str> {
    let mut labels = SCALES.iter().map(|s| s.label).collect::<Vec<_>>();
    labels.sort_by_key(|l| std::cmp::Reverse(l.chars().count()));
    labels
}
