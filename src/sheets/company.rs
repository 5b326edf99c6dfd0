// =============================================================================
// sheets/company.rs - ONE WORKBOOK PER COMPANY
// =============================================================================
//
// Every analysed company gets a spreadsheet named "{company}_{code}" in a
// `ValueUp_analysis` folder under the archive folder. Two sheets:
//
// Summary: company info block (A1:H11) and the latest targets from row 12.
//   B6 first report date, B7 latest report date, B8 report count.
//
// Target_History: a pivot that grows sideways. Rows are (item, sub-field)
// pairs, five per item; columns from I onwards are reports, keyed by the
// accession number in row 1 with the report date in row 2:
//
//   A 영역 | B 카테고리 | C 항목ID | D 항목명 | E Core | F 세부분류 | G Level | H label | I.. reports
//
// Writing the same report twice reuses its column, so reruns overwrite
// instead of duplicating. Each write is one values:batchUpdate.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::a1;
use super::{
    cell_at, pad_row, spreadsheet_url, DriveStore, Grid, QuotaSentinel, SheetInfo, SheetKind, SheetStore, ValueRange,
    FOLDER_MIME, SPREADSHEET_MIME,
};
use crate::error::{QuotaKind, StoreError};
use crate::framework::Framework;
use crate::models::{AnalysisResult, DisclosureRecord, Figure, ItemAnalysis};

pub const ANALYSIS_FOLDER: &str = "ValueUp_analysis";

const SUB_FIELDS: [&str; 5] = ["현재값", "목표값", "목표연도", "달성률", "전기대비"];
/// Column H holds the row labels for the two header rows.
const LABEL_COL: usize = 8;
const FIRST_DATA_ROW: usize = 3;
const SUMMARY_WIDTH: usize = 8;
const SUMMARY_TARGETS_ROW: usize = 12;
const COLUMN_HEADROOM: usize = 10;
const ROW_HEADROOM: usize = 100;

fn history_headers() -> Grid {
    vec![
        pad_row(vec![], LABEL_COL - 1)
            .into_iter()
            .chain(["접수번호".to_string()])
            .collect(),
        ["영역", "카테고리", "항목ID", "항목명", "Core", "세부분류", "Level", "보고서일"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    ]
}

fn summary_block(company: &str, stock_code: &str) -> Grid {
    let rows: [&[&str]; 11] = [
        &["기업 기본 정보"],
        &["항목", "값"],
        &["기업명", company],
        &["종목코드", stock_code],
        &["업종", ""],
        &["최초 공시일", ""],
        &["최신 공시일", ""],
        &["총 보고서 수", "0"],
        &[],
        &["최신 목표 현황"],
        &["영역", "카테고리", "항목", "Core", "현재값", "목표값", "목표연도", "비고"],
    ];
    rows.iter()
        .map(|r| pad_row(r.iter().map(|s| s.to_string()).collect(), SUMMARY_WIDTH))
        .collect()
}

fn figure_cell(figure: &Option<Figure>) -> String {
    figure.as_ref().map(Figure::to_cell).unwrap_or_default()
}

/// Sub-field values in SUB_FIELDS order. The two derived fields stay blank.
fn sub_field_values(item: &ItemAnalysis) -> [String; 5] {
    [
        figure_cell(&item.current_value),
        figure_cell(&item.target_value),
        figure_cell(&item.target_year),
        String::new(),
        String::new(),
    ]
}

/// (area, category, name, core flag) for an item id, falling back to the id.
fn item_labels(framework: &Framework, item_id: &str) -> [String; 4] {
    match framework.item(item_id) {
        Some(item) => [
            item.area_name.clone(),
            item.category_name.clone(),
            if item.item_name.is_empty() { item_id.to_string() } else { item.item_name.clone() },
            if item.is_core { "Y".into() } else { String::new() },
        ],
        None => [String::new(), String::new(), item_id.to_string(), String::new()],
    }
}

pub struct CompanyWorkbooks {
    sheets: Arc<dyn SheetStore>,
    drive: Arc<dyn DriveStore>,
    archive_folder_id: Option<String>,
    sentinel: Arc<QuotaSentinel>,
    folder_id: OnceCell<String>,
}

impl CompanyWorkbooks {
    pub fn new(
        sheets: Arc<dyn SheetStore>,
        drive: Arc<dyn DriveStore>,
        archive_folder_id: Option<String>,
        sentinel: Arc<QuotaSentinel>,
    ) -> Self {
        Self {
            sheets,
            drive,
            archive_folder_id,
            sentinel,
            folder_id: OnceCell::new(),
        }
    }

    async fn analysis_folder(&self) -> Result<&str, StoreError> {
        self.folder_id
            .get_or_try_init(|| self.find_or_create_folder())
            .await
            .map(String::as_str)
    }

    async fn find_or_create_folder(&self) -> Result<String, StoreError> {
        let parent = self.archive_folder_id.as_deref();
        if let Some(found) = self.drive.find_file(ANALYSIS_FOLDER, parent, FOLDER_MIME).await? {
            debug!(id = %found.id, "Analysis folder found");
            return Ok(found.id);
        }
        let created = self
            .sentinel
            .guard(QuotaKind::DriveUpload, self.drive.create_file(ANALYSIS_FOLDER, parent, FOLDER_MIME))
            .await?;
        info!(id = %created.id, "Analysis folder created");
        Ok(created.id)
    }

    /// Find the company's workbook, creating and laying it out if needed.
    pub async fn workbook(&self, company: &str, stock_code: &str) -> Result<String, StoreError> {
        let folder = self.analysis_folder().await?.to_string();
        let name = format!("{}_{}", company, stock_code);
        if let Some(existing) = self.drive.find_file(&name, Some(&folder), SPREADSHEET_MIME).await? {
            return Ok(existing.id);
        }

        let created = self
            .sentinel
            .guard(QuotaKind::DriveUpload, self.drive.create_file(&name, Some(&folder), SPREADSHEET_MIME))
            .await?;
        info!(workbook = %name, id = %created.id, "Company workbook created");
        self.lay_out(&created.id, company, stock_code).await?;
        Ok(created.id)
    }

    /// Sheet1 becomes Summary; Target_History is added.
    async fn lay_out(&self, spreadsheet_id: &str, company: &str, stock_code: &str) -> Result<(), StoreError> {
        let existing = self.sheets.sheets(spreadsheet_id).await?;
        let summary = SheetKind::Summary.title();
        let history = SheetKind::TargetHistory.title();

        match existing.iter().find(|s| s.title == summary).or_else(|| existing.first()) {
            Some(first) if first.title != summary => {
                self.sheets.rename_sheet(spreadsheet_id, first.sheet_id, summary).await?
            }
            Some(_) => {}
            None => {
                let (rows, cols) = SheetKind::Summary.initial_size();
                self.sheets.add_sheet(spreadsheet_id, summary, rows, cols).await?;
            }
        }
        if !existing.iter().any(|s| s.title == history) {
            let (rows, cols) = SheetKind::TargetHistory.initial_size();
            self.sheets.add_sheet(spreadsheet_id, history, rows, cols).await?;
        }

        self.write(
            spreadsheet_id,
            vec![
                ValueRange::new(a1::span(summary, 1, 1, SUMMARY_WIDTH, 11), summary_block(company, stock_code)),
                ValueRange::new(a1::span(history, 1, 1, LABEL_COL, 2), history_headers()),
            ],
        )
        .await
    }

    async fn write(&self, spreadsheet_id: &str, data: Vec<ValueRange>) -> Result<(), StoreError> {
        if data.is_empty() {
            return Ok(());
        }
        self.sentinel
            .guard(QuotaKind::SheetWrite, self.sheets.batch_update(spreadsheet_id, data))
            .await
    }

    async fn sheet_info(&self, spreadsheet_id: &str, kind: SheetKind) -> Result<SheetInfo, StoreError> {
        let found = self
            .sheets
            .sheets(spreadsheet_id)
            .await?
            .into_iter()
            .find(|s| s.title == kind.title());
        match found {
            Some(info) => Ok(info),
            None => {
                let (rows, cols) = kind.initial_size();
                self.sheets.add_sheet(spreadsheet_id, kind.title(), rows, cols).await
            }
        }
    }

    /// Record one analysed report in the company's workbook. Returns the
    /// workbook URL.
    pub async fn add_result(
        &self,
        record: &DisclosureRecord,
        result: &AnalysisResult,
        framework: &Framework,
    ) -> Result<String, StoreError> {
        let id = self.workbook(&record.company, &record.stock_code).await?;
        let report_date = record
            .disclosed_date()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| record.disclosed_at.clone());

        self.add_to_history(&id, &record.acptno, &report_date, result, framework).await?;
        self.update_summary(&id, &report_date, result, framework).await?;
        info!(company = %record.company, acptno = %record.acptno, "Company workbook updated");
        Ok(spreadsheet_url(&id))
    }

    async fn add_to_history(
        &self,
        spreadsheet_id: &str,
        acptno: &str,
        report_date: &str,
        result: &AnalysisResult,
        framework: &Framework,
    ) -> Result<(), StoreError> {
        let title = SheetKind::TargetHistory.title();
        let info = self.sheet_info(spreadsheet_id, SheetKind::TargetHistory).await?;
        let mut values = self
            .sheets
            .get_values(spreadsheet_id, &a1::open_column(title, 1, info.column_count.max(LABEL_COL), 1))
            .await?;
        let mut data = Vec::new();
        if values.len() < 2 {
            values = history_headers();
            data.push(ValueRange::new(a1::span(title, 1, 1, LABEL_COL, 2), history_headers()));
        }

        let header = &values[0];
        let report_col = (LABEL_COL + 1..=header.len())
            .find(|&c| cell_at(header, c) == acptno)
            .unwrap_or_else(|| (header.len() + 1).max(LABEL_COL + 1));

        // item id -> sub-field -> row
        let mut rows_by_item: HashMap<&str, HashMap<&str, usize>> = HashMap::new();
        for (i, row) in values.iter().enumerate().skip(FIRST_DATA_ROW - 1) {
            let item_id = cell_at(row, 3);
            if !item_id.is_empty() {
                rows_by_item.entry(item_id).or_default().insert(cell_at(row, 6), i + 1);
            }
        }

        data.push(ValueRange::single(a1::cell(title, report_col, 1), acptno));
        data.push(ValueRange::single(a1::cell(title, report_col, 2), report_date));

        let mut new_rows: Grid = Vec::new();
        for (item_id, item) in result.analysis_items.iter().filter(|(_, i)| i.is_mentioned()) {
            let sub_values = sub_field_values(item);
            match rows_by_item.get(item_id.as_str()) {
                Some(existing) => {
                    for (field, value) in SUB_FIELDS.iter().zip(&sub_values) {
                        if let Some(&row) = existing.get(field) {
                            data.push(ValueRange::single(a1::cell(title, report_col, row), value.clone()));
                        }
                    }
                }
                None => {
                    let [area, category, name, core] = item_labels(framework, item_id);
                    for (field, value) in SUB_FIELDS.iter().zip(sub_values) {
                        let mut row = vec![
                            area.clone(),
                            category.clone(),
                            item_id.clone(),
                            name.clone(),
                            core.clone(),
                            field.to_string(),
                            item.level.to_string(),
                        ];
                        row = pad_row(row, report_col);
                        row[report_col - 1] = value;
                        new_rows.push(row);
                    }
                }
            }
        }

        let start_row = values.len() + 1;
        let end_row = start_row + new_rows.len().saturating_sub(1);
        let needed_rows = if new_rows.is_empty() { values.len() } else { end_row };
        if report_col > info.column_count || needed_rows > info.row_count {
            let cols = info.column_count.max(report_col + COLUMN_HEADROOM);
            let rows = info.row_count.max(needed_rows + ROW_HEADROOM);
            debug!(cols, rows, "Growing Target_History");
            self.sheets.resize_sheet(spreadsheet_id, info.sheet_id, rows, cols).await?;
        }

        let added = new_rows.len();
        if !new_rows.is_empty() {
            data.push(ValueRange::new(a1::span(title, 1, start_row, report_col, end_row), new_rows));
        }
        self.write(spreadsheet_id, data).await?;
        debug!(column = %a1::column_letter(report_col), new_rows = added, "Target_History written");
        Ok(())
    }

    async fn update_summary(
        &self,
        spreadsheet_id: &str,
        report_date: &str,
        result: &AnalysisResult,
        framework: &Framework,
    ) -> Result<(), StoreError> {
        let title = SheetKind::Summary.title();
        let dates = self.sheets.get_values(spreadsheet_id, &a1::span(title, 2, 6, 2, 8)).await?;
        let first_date = dates.first().map(|r| cell_at(r, 1)).unwrap_or("");
        let count: u32 = dates.get(2).map(|r| cell_at(r, 1)).unwrap_or("").trim().parse().unwrap_or(0);

        let mut data = vec![
            ValueRange::single(a1::cell(title, 2, 7), report_date),
            ValueRange::single(a1::cell(title, 2, 8), (count + 1).to_string()),
        ];
        if first_date.trim().is_empty() {
            data.push(ValueRange::single(a1::cell(title, 2, 6), report_date));
        }

        let targets: Grid = result
            .analysis_items
            .iter()
            .filter(|(_, item)| item.is_mentioned())
            .map(|(item_id, item)| {
                let [area, category, name, core] = item_labels(framework, item_id);
                vec![
                    area,
                    category,
                    name,
                    core,
                    figure_cell(&item.current_value),
                    figure_cell(&item.target_value),
                    figure_cell(&item.target_year),
                    item.note.clone(),
                ]
            })
            .collect();

        if !targets.is_empty() {
            let previous = self
                .sheets
                .get_values(spreadsheet_id, &a1::open_column(title, 1, SUMMARY_WIDTH, SUMMARY_TARGETS_ROW))
                .await?
                .len();
            let mut block = targets;
            // Blank out what the previous report left below the new block.
            while block.len() < previous {
                block.push(pad_row(Vec::new(), SUMMARY_WIDTH));
            }
            let end = SUMMARY_TARGETS_ROW + block.len() - 1;
            data.push(ValueRange::new(a1::span(title, 1, SUMMARY_TARGETS_ROW, SUMMARY_WIDTH, end), block));
        }
        self.write(spreadsheet_id, data).await
    }
}
