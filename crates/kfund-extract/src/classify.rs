use kfund_core::AnnouncementType;

/// Result, change and cancellation notices. Checked first because their titles repeat
/// the funding program's own wording.
const NOTICE_KEYWORDS: &[&str] = &[
    "선정결과",
    "선정 결과",
    "결과 공고",
    "결과공고",
    "최종 선정",
    "최종선정",
    "합격자",
    "변경 공고",
    "변경공고",
    "정정 공고",
    "정정공고",
    "취소 공고",
    "취소공고",
    "연장 공고",
    "연장공고",
    "안내문",
];

const SURVEY_KEYWORDS: &[&str] = &["수요조사", "실태조사", "설문조사", "설문", "의견수렴", "수요 조사"];

const EVENT_KEYWORDS: &[&str] = &[
    "설명회",
    "세미나",
    "박람회",
    "포럼",
    "간담회",
    "교육생 모집",
    "행사",
    "컨퍼런스",
    "시상식",
    "데모데이",
];

/// Keyword classification of an announcement title. Anything not recognised as a
/// notice, survey or event is treated as a funding opportunity.
pub fn classify_announcement(title: &str) -> AnnouncementType {
    let title = title.trim();
    let has_any = |keywords: &[&str]| keywords.iter().any(|k| title.contains(k));

    if has_any(NOTICE_KEYWORDS) {
        AnnouncementType::Notice
    } else if has_any(SURVEY_KEYWORDS) {
        AnnouncementType::Survey
    } else if has_any(EVENT_KEYWORDS) {
        AnnouncementType::Event
    } else {
        AnnouncementType::Funding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_notices_win_over_funding_wording() {
        assert_eq!(
            classify_announcement("2025년 예비창업패키지 최종 선정결과 공고"),
            AnnouncementType::Notice
        );
        assert_eq!(
            classify_announcement("2026년 기술혁신개발사업 시행계획 변경공고"),
            AnnouncementType::Notice
        );
    }

    #[test]
    fn surveys_and_events() {
        assert_eq!(classify_announcement("2026년 스마트공장 수요조사"), AnnouncementType::Survey);
        assert_eq!(classify_announcement("수출바우처 사업 설명회 개최 안내"), AnnouncementType::Event);
        assert_eq!(
            classify_announcement("[서울] 2026년 청년 창업기업 성장 지원사업 공고"),
            AnnouncementType::Funding
        );
    }
}
