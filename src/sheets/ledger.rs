// =============================================================================
// sheets/ledger.rs - THE DISCLOSURE LIST AND THE ANALYSIS TABLE
// =============================================================================
//
// Both live on the main spreadsheet.
//
// 밸류업공시목록 (one row per filing, keyed by 접수번호 in column F):
//
//   A 번호 | B 공시일자 | C 회사명 | D 종목코드 | E 공시제목 | F 접수번호 |
//   G 원시PDF링크 | H 구글드라이브링크 | I 수집일시 | J 아티팩트링크 |
//   K 예상토큰수 | L 분석상태 | M 분석일시 | N 분석항목수 | O Core항목수 |
//   P 기업시트링크
//
// The monitor phase appends A–J and fills H after uploading. The analysis
// phase fills K and L–P. Updates are addressed by looking the accession
// number up in column F, then sent as one batch.
//
// 밸류업공시분석 (append-only, one row per analysis attempt): nine fixed
// columns followed by five columns per framework item. A row with status
// `error` still counts as "analysed" for the pending filter, so a filing
// that fails is not retried forever. Delete its row to retry it.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use super::a1;
use super::{cell_at, find_or_add_sheet, pad_row, Grid, QuotaSentinel, SheetInfo, SheetKind, SheetStore, ValueRange};
use crate::dedup::AccessionIndex;
use crate::error::{QuotaKind, StoreError};
use crate::framework::Framework;
use crate::models::{AnalysisResult, DisclosureRecord};

pub const LIST_HEADERS: [&str; 16] = [
    "번호",
    "공시일자",
    "회사명",
    "종목코드",
    "공시제목",
    "접수번호",
    "원시PDF링크",
    "구글드라이브링크",
    "수집일시",
    "아티팩트링크",
    "예상토큰수",
    "분석상태",
    "분석일시",
    "분석항목수",
    "Core항목수",
    "기업시트링크",
];

pub const BASE_HEADERS: [&str; 9] = [
    "접수번호",
    "회사명",
    "종목코드",
    "공시일자",
    "분석일시",
    "분석상태",
    "언급항목수",
    "Core언급수",
    "주요포인트",
];

pub const ITEM_SUFFIXES: [&str; 5] = ["_level", "_current", "_target", "_year", "_note"];

const COL_ACPTNO: usize = 6;
const COL_DRIVE_LINK: usize = 8;
const COL_TOKENS: usize = 11;
const COL_META: usize = 12;
const COL_ANALYSIS_STATUS: usize = 6;
const NOTE_LIMIT: usize = 100;
const HIGHLIGHT_LIMIT: usize = 3;
const ROW_HEADROOM: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStatus {
    Completed,
    Error,
}

impl AnalysisStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Error => "error",
        }
    }
}

/// Columns L–P of the list sheet.
#[derive(Debug, Clone)]
pub struct AnalysisMeta {
    pub status: AnalysisStatus,
    pub analyzed_at: String,
    pub items_mentioned: u32,
    pub core_mentioned: u32,
    pub company_sheet_url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub completed: usize,
    pub error: usize,
}

pub struct DisclosureLedger {
    store: Arc<dyn SheetStore>,
    spreadsheet_id: String,
    sentinel: Arc<QuotaSentinel>,
}

impl DisclosureLedger {
    pub fn new(store: Arc<dyn SheetStore>, spreadsheet_id: impl Into<String>, sentinel: Arc<QuotaSentinel>) -> Self {
        Self {
            store,
            spreadsheet_id: spreadsheet_id.into(),
            sentinel,
        }
    }

    fn list_title() -> &'static str {
        SheetKind::DisclosureList.title()
    }

    fn analysis_title() -> &'static str {
        SheetKind::Analysis.title()
    }

    async fn write(&self, data: Vec<ValueRange>) -> Result<(), StoreError> {
        if data.is_empty() {
            return Ok(());
        }
        self.sentinel
            .guard(QuotaKind::SheetWrite, self.store.batch_update(&self.spreadsheet_id, data))
            .await
    }

    async fn append(&self, title: &str, rows: Grid) -> Result<(), StoreError> {
        self.sentinel
            .guard(QuotaKind::SheetWrite, self.store.append_rows(&self.spreadsheet_id, title, rows))
            .await
    }

    /// Make sure the list sheet exists with all 16 columns and headers.
    pub async fn ensure_list_sheet(&self) -> Result<SheetInfo, StoreError> {
        let (mut info, created) = find_or_add_sheet(self.store.as_ref(), &self.spreadsheet_id, SheetKind::DisclosureList).await?;
        if info.column_count < LIST_HEADERS.len() {
            self.store
                .resize_sheet(&self.spreadsheet_id, info.sheet_id, info.row_count, LIST_HEADERS.len())
                .await?;
            info.column_count = LIST_HEADERS.len();
        }

        let present = if created {
            0
        } else {
            self.store
                .get_values(&self.spreadsheet_id, &a1::span(Self::list_title(), 1, 1, LIST_HEADERS.len(), 1))
                .await?
                .first()
                .map_or(0, Vec::len)
        };
        if present < LIST_HEADERS.len() {
            let missing: Vec<String> = LIST_HEADERS[present..].iter().map(|h| h.to_string()).collect();
            debug!(from_column = present + 1, count = missing.len(), "Writing list headers");
            self.write(vec![ValueRange::new(
                a1::span(Self::list_title(), present + 1, 1, LIST_HEADERS.len(), 1),
                vec![missing],
            )])
            .await?;
        }
        Ok(info)
    }

    /// Accession numbers already in column F, header excluded.
    pub async fn existing_acptnos(&self) -> Result<Vec<String>, StoreError> {
        let column = self
            .store
            .get_values(&self.spreadsheet_id, &a1::open_column(Self::list_title(), COL_ACPTNO, COL_ACPTNO, 2))
            .await?;
        Ok(column
            .iter()
            .map(|row| cell_at(row, 1).trim().to_string())
            .filter(|v| !v.is_empty())
            .collect())
    }

    /// Accession number → 1-based row.
    async fn acptno_rows(&self) -> Result<HashMap<String, usize>, StoreError> {
        let column = self
            .store
            .get_values(&self.spreadsheet_id, &a1::open_column(Self::list_title(), COL_ACPTNO, COL_ACPTNO, 1))
            .await?;
        Ok(column
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(i, row)| {
                let acptno = cell_at(row, 1).trim();
                (!acptno.is_empty()).then(|| (acptno.to_string(), i + 1))
            })
            .collect())
    }

    /// Append every record the index has not seen yet. Returns what was
    /// appended; those records are now part of the index.
    pub async fn append_new(
        &self,
        info: &SheetInfo,
        records: &[DisclosureRecord],
        index: &AccessionIndex,
        collected_at: &str,
    ) -> Result<Vec<DisclosureRecord>, StoreError> {
        let fresh: Vec<DisclosureRecord> = records
            .iter()
            .filter(|r| index.check_and_insert(&r.acptno))
            .cloned()
            .map(|mut r| {
                r.collected_at = collected_at.to_string();
                r
            })
            .collect();
        if fresh.is_empty() {
            info!("No new disclosures to append");
            return Ok(fresh);
        }

        let used = self
            .store
            .get_values(&self.spreadsheet_id, &a1::open_column(Self::list_title(), COL_ACPTNO, COL_ACPTNO, 1))
            .await?
            .len();
        if used + fresh.len() > info.row_count {
            let rows = used + fresh.len() + ROW_HEADROOM;
            info!(from = info.row_count, to = rows, "Growing list sheet");
            self.store
                .resize_sheet(&self.spreadsheet_id, info.sheet_id, rows, info.column_count.max(LIST_HEADERS.len()))
                .await?;
        }

        let rows: Grid = fresh.iter().map(list_row).collect();
        self.append(Self::list_title(), rows).await?;
        info!(count = fresh.len(), "Disclosures appended");
        Ok(fresh)
    }

    /// Write Drive links into column H, one batch.
    pub async fn update_drive_links(&self, links: &[(String, String)]) -> Result<usize, StoreError> {
        if links.is_empty() {
            return Ok(0);
        }
        let rows = self.acptno_rows().await?;
        let data: Vec<ValueRange> = links
            .iter()
            .filter_map(|(acptno, link)| match rows.get(acptno) {
                Some(&row) => Some(ValueRange::single(a1::cell(Self::list_title(), COL_DRIVE_LINK, row), link.clone())),
                None => {
                    warn!(acptno = %acptno, "Accession number not on the list sheet");
                    None
                }
            })
            .collect();
        let count = data.len();
        self.write(data).await?;
        info!(count, "Drive links written");
        Ok(count)
    }

    /// Write estimated token counts into column K, one batch.
    pub async fn update_estimated_tokens(&self, estimates: &[(String, u64)]) -> Result<usize, StoreError> {
        if estimates.is_empty() {
            return Ok(0);
        }
        let rows = self.acptno_rows().await?;
        let data: Vec<ValueRange> = estimates
            .iter()
            .filter_map(|(acptno, tokens)| {
                rows.get(acptno)
                    .map(|&row| ValueRange::single(a1::cell(Self::list_title(), COL_TOKENS, row), tokens.to_string()))
            })
            .collect();
        let count = data.len();
        self.write(data).await?;
        debug!(count, "Token estimates written");
        Ok(count)
    }

    /// Write columns L–P for one filing. `false` when the accession number
    /// is not on the sheet.
    pub async fn update_analysis_meta(&self, acptno: &str, meta: &AnalysisMeta) -> Result<bool, StoreError> {
        let rows = self.acptno_rows().await?;
        let Some(&row) = rows.get(acptno.trim()) else {
            warn!(acptno, "Accession number not on the list sheet; meta not written");
            return Ok(false);
        };
        let values = vec![vec![
            meta.status.as_str().to_string(),
            meta.analyzed_at.clone(),
            meta.items_mentioned.to_string(),
            meta.core_mentioned.to_string(),
            meta.company_sheet_url.clone(),
        ]];
        self.write(vec![ValueRange::new(
            a1::span(Self::list_title(), COL_META, row, COL_META + 4, row),
            values,
        )])
        .await?;
        Ok(true)
    }

    /// Accession numbers with a row on the analysis sheet. Missing sheet
    /// means nothing analysed yet.
    pub async fn analyzed_acptnos(&self) -> Result<HashSet<String>, StoreError> {
        let exists = self
            .store
            .sheets(&self.spreadsheet_id)
            .await?
            .iter()
            .any(|s| s.title == Self::analysis_title());
        if !exists {
            return Ok(HashSet::new());
        }
        let column = self
            .store
            .get_values(&self.spreadsheet_id, &a1::open_column(Self::analysis_title(), 1, 1, 2))
            .await?;
        Ok(column
            .iter()
            .map(|row| cell_at(row, 1).trim().to_string())
            .filter(|v| !v.is_empty())
            .collect())
    }

    /// Filings waiting for analysis: not yet on the analysis sheet, no older
    /// than `days` (unparseable dates pass), and with some document link.
    pub async fn pending(&self, days: u32, today: NaiveDate) -> Result<Vec<DisclosureRecord>, StoreError> {
        let analyzed = self.analyzed_acptnos().await?;
        let rows = self
            .store
            .get_values(&self.spreadsheet_id, &a1::open_column(Self::list_title(), 1, LIST_HEADERS.len(), 2))
            .await?;
        let cutoff = today - chrono::Duration::days(i64::from(days));

        let total = rows.len();
        let pending: Vec<DisclosureRecord> = rows
            .iter()
            .filter_map(|row| record_from_row(row))
            .filter(|r| !analyzed.contains(&r.acptno))
            .filter(|r| r.disclosed_date().map_or(true, |d| d >= cutoff))
            .filter(DisclosureRecord::has_document_link)
            .collect();
        info!(pending = pending.len(), total, analyzed = analyzed.len(), "Pending disclosures");
        Ok(pending)
    }

    /// Rows still waiting for a Drive copy of their PDF (column H empty).
    pub async fn without_drive_link(&self) -> Result<Vec<DisclosureRecord>, StoreError> {
        let rows = self
            .store
            .get_values(&self.spreadsheet_id, &a1::open_column(Self::list_title(), 1, LIST_HEADERS.len(), 2))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| record_from_row(row))
            .filter(|r| r.drive_link.is_empty())
            .collect())
    }

    pub async fn load_framework(&self) -> Result<Framework, StoreError> {
        let rows = self
            .store
            .get_values(&self.spreadsheet_id, &a1::open_column(SheetKind::Framework.title(), 1, 26, 1))
            .await?;
        Ok(Framework::from_rows(&rows))
    }

    /// Create the analysis sheet, or widen its header row when the
    /// framework has grown since it was created.
    pub async fn ensure_analysis_sheet(&self, framework: &Framework) -> Result<Vec<String>, StoreError> {
        let headers = analysis_headers(framework);
        let (info, created) = find_or_add_sheet(self.store.as_ref(), &self.spreadsheet_id, SheetKind::Analysis).await?;
        if info.column_count < headers.len() {
            self.store
                .resize_sheet(&self.spreadsheet_id, info.sheet_id, info.row_count, headers.len())
                .await?;
        }

        let present = if created {
            0
        } else {
            self.store
                .get_values(&self.spreadsheet_id, &a1::open_column(Self::analysis_title(), 1, headers.len(), 1))
                .await?
                .first()
                .map_or(0, Vec::len)
                .min(headers.len())
        };
        if present < headers.len() {
            info!(from = present, to = headers.len(), "Extending analysis sheet headers");
            self.write(vec![ValueRange::new(
                a1::span(Self::analysis_title(), present + 1, 1, headers.len(), 1),
                vec![headers[present..].to_vec()],
            )])
            .await?;
        }
        Ok(headers)
    }

    pub async fn record_analysis(
        &self,
        record: &DisclosureRecord,
        result: &AnalysisResult,
        framework: &Framework,
        analyzed_at: &str,
    ) -> Result<(), StoreError> {
        let row = analysis_row(record, AnalysisStatus::Completed, Some(result), framework, analyzed_at);
        self.append(Self::analysis_title(), vec![row]).await?;
        info!(acptno = %record.acptno, company = %record.company, "Analysis row written");
        Ok(())
    }

    pub async fn record_error(
        &self,
        record: &DisclosureRecord,
        message: &str,
        framework: &Framework,
        analyzed_at: &str,
    ) -> Result<(), StoreError> {
        let failed = AnalysisResult {
            summary: crate::models::AnalysisSummary {
                key_highlights: vec![format!("오류: {}", message)],
                ..Default::default()
            },
            ..Default::default()
        };
        let row = analysis_row(record, AnalysisStatus::Error, Some(&failed), framework, analyzed_at);
        self.append(Self::analysis_title(), vec![row]).await
    }

    /// Counts of the analysis sheet's status column.
    pub async fn analysis_summary(&self) -> Result<StatusCounts, StoreError> {
        let column = self
            .store
            .get_values(
                &self.spreadsheet_id,
                &a1::open_column(Self::analysis_title(), COL_ANALYSIS_STATUS, COL_ANALYSIS_STATUS, 2),
            )
            .await?;
        let mut counts = StatusCounts::default();
        for row in &column {
            counts.total += 1;
            match cell_at(row, 1) {
                "completed" => counts.completed += 1,
                "error" => counts.error += 1,
                _ => {}
            }
        }
        Ok(counts)
    }
}

/// A–J cells for a new list row.
fn list_row(record: &DisclosureRecord) -> Vec<String> {
    vec![
        if record.number == 0 { String::new() } else { record.number.to_string() },
        record.disclosed_at.clone(),
        record.company.clone(),
        record.stock_code.clone(),
        record.title.clone(),
        record.acptno.clone(),
        record.pdf_url.clone(),
        record.drive_link.clone(),
        record.collected_at.clone(),
        record.artifact_link.clone(),
    ]
}

/// Rebuild a record from a list row. Rows without an accession number are
/// skipped.
fn record_from_row(row: &[String]) -> Option<DisclosureRecord> {
    let acptno = cell_at(row, COL_ACPTNO).trim();
    if acptno.is_empty() {
        return None;
    }
    let mut record = DisclosureRecord::new(acptno, cell_at(row, 3).trim(), cell_at(row, 2).trim());
    record.number = cell_at(row, 1).trim().parse().unwrap_or(0);
    record.stock_code = cell_at(row, 4).trim().to_string();
    record.title = cell_at(row, 5).trim().to_string();
    record.pdf_url = cell_at(row, 7).trim().to_string();
    record.drive_link = cell_at(row, COL_DRIVE_LINK).trim().to_string();
    record.collected_at = cell_at(row, 9).trim().to_string();
    record.artifact_link = cell_at(row, 10).trim().to_string();
    Some(record)
}

pub fn analysis_headers(framework: &Framework) -> Vec<String> {
    let mut headers: Vec<String> = BASE_HEADERS.iter().map(|h| h.to_string()).collect();
    for item in &framework.items {
        for suffix in ITEM_SUFFIXES {
            headers.push(format!("{}{}", item.item_id, suffix));
        }
    }
    headers
}

fn analysis_row(
    record: &DisclosureRecord,
    status: AnalysisStatus,
    result: Option<&AnalysisResult>,
    framework: &Framework,
    analyzed_at: &str,
) -> Vec<String> {
    let (mentioned, core, highlights) = result.map_or((0, 0, String::new()), |r| {
        (
            r.summary.total_items_mentioned,
            r.summary.core_items_mentioned,
            r.summary
                .key_highlights
                .iter()
                .take(HIGHLIGHT_LIMIT)
                .cloned()
                .collect::<Vec<_>>()
                .join("; "),
        )
    });

    let mut row = vec![
        record.acptno.clone(),
        record.company.clone(),
        record.stock_code.clone(),
        record.disclosed_at.clone(),
        analyzed_at.to_string(),
        status.as_str().to_string(),
        mentioned.to_string(),
        core.to_string(),
        highlights,
    ];

    for item in &framework.items {
        let analysis = result.and_then(|r| r.item(&item.item_id)).cloned().unwrap_or_default();
        let cell = |f: &Option<crate::models::Figure>| f.as_ref().map(|v| v.to_cell()).unwrap_or_default();
        row.push(analysis.level.to_string());
        row.push(cell(&analysis.current_value));
        row.push(cell(&analysis.target_value));
        row.push(cell(&analysis.target_year));
        row.push(analysis.note.chars().take(NOTE_LIMIT).collect());
    }
    pad_row(row, BASE_HEADERS.len() + framework.items.len() * ITEM_SUFFIXES.len())
}
