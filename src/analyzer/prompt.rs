use crate::framework::Framework;

/// Text beyond this many characters is cut before it goes into the prompt.
pub const MAX_PROMPT_TEXT_CHARS: usize = 30_000;

const SYSTEM_PREAMBLE: &str = "당신은 한국 상장기업의 '기업가치 제고 계획(밸류업)' 공시를 분석하는 전문가입니다.
주어진 공시 문서를 분석하여 프레임워크에 정의된 각 항목별로 정보를 추출해주세요.

## 추출 규칙

1. **level (필수)**
   - 0: 해당 항목에 대한 언급이 전혀 없음
   - 1: 정성적 언급만 있음 (방향/계획만, 예: \"배당 확대 예정\")
   - 2: 정량적 수치가 제시됨 (예: \"배당성향 40% 목표\", \"ROE 15% 달성\")

2. **current_value**: 현재 수치 (보고서 기준연도 또는 최근 실적), 없으면 null
3. **target_value**: 목표 수치, 없으면 null
4. **target_year**: 목표 달성 연도 (예: 2027), 없으면 null
5. **note**: 관련 문장 인용 또는 요약 (50자 이내), 언급이 없으면 빈 문자열

## 주의사항
- 금액 단위는 억원으로 통일 (1조원 = 10000억원)
- 비율은 % 단위, 기호 없이 숫자만
- 불확실한 정보는 추측하지 말고 null로 표시
- level이 0이면 current_value, target_value, target_year는 반드시 null
- Core 항목(is_core=true)은 반드시 분석 시도
- 응답은 반드시 JSON 형식으로만
";

pub fn system_prompt(framework: &Framework) -> String {
    let mut prompt = String::from(SYSTEM_PREAMBLE);

    if !framework.extraction_rules.is_empty() {
        prompt.push_str("\n## 추가 규칙\n");
        for rule in &framework.extraction_rules {
            prompt.push_str(&format!("- {}\n", rule));
        }
    }

    prompt.push_str("\n## 분석 항목\n\n");
    for item in &framework.items {
        let core = if item.is_core { " [CORE]" } else { "" };
        prompt.push_str(&format!(
            "### {}: {} ({}){}\n- 영역: {} > {}\n- 단위: {}\n- 설명: {}\n",
            item.item_id, item.item_name, item.item_name_en, core, item.area_name, item.category_name, item.unit,
            item.description
        ));
        if !item.extraction_keywords.is_empty() {
            prompt.push_str(&format!("- 키워드: {}\n", item.extraction_keywords.join(", ")));
        }
        prompt.push('\n');
    }
    prompt
}

/// User turn carrying the extracted text.
pub fn text_prompt(company: &str, text: &str, framework: &Framework) -> String {
    let clipped: String = text.chars().take(MAX_PROMPT_TEXT_CHARS).collect();
    format!(
        "## 분석 대상\n- 회사명: {company}\n\n## PDF 내용\n```\n{clipped}\n```\n\n{}",
        response_format(company, framework)
    )
}

/// User turn sent alongside an attached PDF.
pub fn document_prompt(company: &str, framework: &Framework) -> String {
    format!(
        "## 분석 대상\n- 회사명: {company}\n\n첨부된 PDF 문서를 분석하여 JSON 형식으로 응답해주세요.\n\n{}",
        response_format(company, framework)
    )
}

fn response_format(company: &str, framework: &Framework) -> String {
    let template = serde_json::json!({
        "company_name": company,
        "analysis_items": framework
            .items
            .iter()
            .map(|item| {
                (
                    item.item_id.clone(),
                    serde_json::json!({
                        "level": 0,
                        "current_value": null,
                        "target_value": null,
                        "target_year": null,
                        "note": ""
                    }),
                )
            })
            .collect::<serde_json::Map<_, _>>(),
        "summary": {
            "total_items_mentioned": 0,
            "core_items_mentioned": 0,
            "key_highlights": []
        }
    });
    let rendered = serde_json::to_string_pretty(&template).unwrap_or_default();
    format!(
        "## 응답 형식\n각 항목에 대해 level, current_value, target_value, target_year, note를 분석해 아래 JSON 형식으로 응답하세요.\n```json\n{rendered}\n```\n\n위 형식을 정확히 따라 JSON으로만 응답해주세요.\n"
    )
}
