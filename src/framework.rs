// =============================================================================
// framework.rs - WHAT WE ASK THE MODEL TO LOOK FOR
// =============================================================================
//
// The analysis framework lives in the `Framework` worksheet so analysts can
// edit it without a deploy. Each row carries a `section` tag:
//
//   META   version / last-modified lines
//   GUIDE  one extraction rule per row, copied into the prompt verbatim
//   ITEM   one framework item (area > category > item)
//
// The sheet is re-read at the start of every run and never mutated.
// =============================================================================

use std::collections::HashMap;

use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FrameworkItem {
    pub area_id: String,
    pub area_name: String,
    pub category_id: String,
    pub category_name: String,
    pub item_id: String,
    pub item_name: String,
    pub item_name_en: String,
    pub unit: String,
    pub is_core: bool,
    pub data_type: String,
    pub description: String,
    pub extraction_keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Framework {
    pub version: String,
    pub last_modified: String,
    pub items: Vec<FrameworkItem>,
    pub extraction_rules: Vec<String>,
}

impl Framework {
    /// Build from raw sheet values: header row first, then one record per
    /// row. Short rows are padded; unknown sections are ignored.
    pub fn from_rows(rows: &[Vec<String>]) -> Self {
        let mut framework = Framework::default();
        let Some((header, records)) = rows.split_first() else {
            warn!("Framework sheet is empty");
            return framework;
        };

        let columns: HashMap<&str, usize> = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim(), i))
            .collect();
        let field = |row: &Vec<String>, name: &str| -> String {
            columns
                .get(name)
                .and_then(|&i| row.get(i))
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };

        for row in records {
            match field(row, "section").as_str() {
                "META" => {
                    let desc = field(row, "description");
                    let value = desc.rsplit(':').next().unwrap_or("").trim().to_string();
                    if desc.contains("버전:") {
                        framework.version = value;
                    } else if desc.contains("최종수정일:") {
                        framework.last_modified = value;
                    }
                }
                "GUIDE" => {
                    let desc = field(row, "description");
                    if !desc.is_empty() && !desc.starts_with("---") {
                        framework.extraction_rules.push(desc);
                    }
                }
                "ITEM" => {
                    let item_id = field(row, "item_id");
                    if item_id.is_empty() {
                        continue;
                    }
                    framework.items.push(FrameworkItem {
                        area_id: field(row, "area_id"),
                        area_name: field(row, "area_name"),
                        category_id: field(row, "category_id"),
                        category_name: field(row, "category_name"),
                        item_id,
                        item_name: field(row, "item_name"),
                        item_name_en: field(row, "item_name_en"),
                        unit: field(row, "unit"),
                        is_core: parse_core_flag(&field(row, "is_core")),
                        data_type: field(row, "data_type"),
                        description: field(row, "description"),
                        extraction_keywords: field(row, "extraction_keywords")
                            .split(';')
                            .map(str::trim)
                            .filter(|k| !k.is_empty())
                            .map(str::to_string)
                            .collect(),
                    });
                }
                _ => {}
            }
        }

        info!(
            items = framework.items.len(),
            core = framework.core_items().count(),
            version = %framework.version,
            "Framework loaded"
        );
        framework
    }

    pub fn core_items(&self) -> impl Iterator<Item = &FrameworkItem> {
        self.items.iter().filter(|i| i.is_core)
    }

    pub fn item(&self, item_id: &str) -> Option<&FrameworkItem> {
        self.items.iter().find(|i| i.item_id == item_id)
    }

    pub fn item_ids(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.item_id.as_str()).collect()
    }

    pub fn is_core(&self, item_id: &str) -> bool {
        self.item(item_id).is_some_and(|i| i.is_core)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn parse_core_flag(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "1.0" | "true")
}

#[cfg(test)]
pub(crate) fn sample_rows() -> Vec<Vec<String>> {
    let header = [
        "section", "area_id", "area_name", "category_id", "category_name", "item_id", "item_name",
        "item_name_en", "unit", "is_core", "data_type", "description", "extraction_keywords",
    ];
    let rows: Vec<Vec<&str>> = vec![
        header.to_vec(),
        vec!["META", "", "", "", "", "", "", "", "", "", "", "프레임워크 버전: v2.1", ""],
        vec!["META", "", "", "", "", "", "", "", "", "", "", "최종수정일: 2024-12-26", ""],
        vec!["GUIDE", "", "", "", "", "", "", "", "", "", "", "level 2: 정량적 수치 제시", ""],
        vec!["GUIDE", "", "", "", "", "", "", "", "", "", "", "--- 구분선 ---", ""],
        vec![
            "ITEM", "A1", "자본효율", "C01", "수익성", "ROE", "자기자본이익률", "roe", "%", "1.0", "numeric",
            "자기자본이익률", "ROE;자기자본이익률; Return on Equity ",
        ],
        vec![
            "ITEM", "A2", "주주환원", "C03", "배당", "DPR", "배당성향", "payout", "%", "0", "numeric",
            "배당성향", "배당성향;payout",
        ],
    ];
    rows.into_iter()
        .map(|r| r.into_iter().map(str::to_string).collect())
        .collect()
}
