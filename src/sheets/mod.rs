// =============================================================================
// sheets/ - THE SPREADSHEET IS THE DATABASE
// =============================================================================
//
// There is no database in this system. The main spreadsheet holds the
// disclosure list, the analysis table and the Framework definition; every
// company gets its own workbook in Drive with a Summary and a pivoted
// Target_History. Idempotency comes from the accession number column, not
// from transactions.
//
// Layout:
//   a1.rs      - column letters and range strings
//   auth.rs    - OAuth refresh / service-account JWT, cached access token
//   google.rs  - REST client implementing SheetStore + DriveStore
//   ledger.rs  - disclosure list + analysis sheet on the main spreadsheet
//   company.rs - per-company workbooks
//   memory.rs  - in-memory store for tests
//
// Google bills quota per call, so writes are batched: one values:batchUpdate
// per logical write, never a call per cell. Sheets are grown before writes
// that would land outside the grid.
// =============================================================================

pub mod a1;
pub mod auth;
pub mod company;
pub mod google;
pub mod ledger;
#[cfg(test)]
pub mod memory;

use std::collections::HashSet;
use std::future::Future;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::error::{QuotaKind, StoreError};

/// Rows of cell values, as the Sheets API returns them (formatted strings).
pub type Grid = Vec<Vec<String>>;

pub const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const PDF_MIME: &str = "application/pdf";

/// Every sheet this system reads or writes. Names are fixed; anything
/// else found in a spreadsheet is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SheetKind {
    DisclosureList,
    Analysis,
    Framework,
    Summary,
    TargetHistory,
}

impl SheetKind {
    pub fn title(self) -> &'static str {
        match self {
            SheetKind::DisclosureList => "밸류업공시목록",
            SheetKind::Analysis => "밸류업공시분석",
            SheetKind::Framework => "Framework",
            SheetKind::Summary => "Summary",
            SheetKind::TargetHistory => "Target_History",
        }
    }

    /// (rows, columns) used when the sheet has to be created.
    pub fn initial_size(self) -> (usize, usize) {
        match self {
            SheetKind::DisclosureList => (1000, 16),
            SheetKind::Analysis => (1000, 9),
            SheetKind::Framework => (200, 12),
            SheetKind::Summary => (100, 8),
            SheetKind::TargetHistory => (500, 50),
        }
    }
}

/// One range/values pair in a batch write.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRange {
    pub range: String,
    pub values: Grid,
}

impl ValueRange {
    pub fn new(range: impl Into<String>, values: Grid) -> Self {
        Self {
            range: range.into(),
            values,
        }
    }

    pub fn single(range: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(range, vec![vec![value.into()]])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetInfo {
    pub sheet_id: i64,
    pub title: String,
    pub row_count: usize,
    pub column_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub web_view_link: Option<String>,
}

/// Spreadsheet operations, addressed by spreadsheet id.
#[async_trait]
pub trait SheetStore: Send + Sync {
    async fn sheets(&self, spreadsheet_id: &str) -> Result<Vec<SheetInfo>, StoreError>;

    async fn add_sheet(&self, spreadsheet_id: &str, title: &str, rows: usize, cols: usize)
        -> Result<SheetInfo, StoreError>;

    async fn rename_sheet(&self, spreadsheet_id: &str, sheet_id: i64, title: &str) -> Result<(), StoreError>;

    async fn resize_sheet(&self, spreadsheet_id: &str, sheet_id: i64, rows: usize, cols: usize)
        -> Result<(), StoreError>;

    async fn get_values(&self, spreadsheet_id: &str, range: &str) -> Result<Grid, StoreError>;

    /// Append after the last row with data, inserting rows as needed.
    async fn append_rows(&self, spreadsheet_id: &str, title: &str, rows: Grid) -> Result<(), StoreError>;

    /// Many ranges, one call.
    async fn batch_update(&self, spreadsheet_id: &str, data: Vec<ValueRange>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DriveStore: Send + Sync {
    async fn find_file(&self, name: &str, parent: Option<&str>, mime_type: &str)
        -> Result<Option<DriveFile>, StoreError>;

    async fn create_file(&self, name: &str, parent: Option<&str>, mime_type: &str) -> Result<DriveFile, StoreError>;

    async fn upload_file(&self, name: &str, parent: Option<&str>, mime_type: &str, bytes: Vec<u8>)
        -> Result<DriveFile, StoreError>;

    async fn share_anyone_reader(&self, file_id: &str) -> Result<(), StoreError>;
}

/// Look a sheet up by title, creating it at its initial size when missing.
pub async fn find_or_add_sheet(
    store: &dyn SheetStore,
    spreadsheet_id: &str,
    kind: SheetKind,
) -> Result<(SheetInfo, bool), StoreError> {
    let existing = store
        .sheets(spreadsheet_id)
        .await?
        .into_iter()
        .find(|s| s.title == kind.title());
    match existing {
        Some(sheet) => Ok((sheet, false)),
        None => {
            let (rows, cols) = kind.initial_size();
            let sheet = store.add_sheet(spreadsheet_id, kind.title(), rows, cols).await?;
            Ok((sheet, true))
        }
    }
}

/// Once a quota error of some kind is seen, every later write of that kind
/// is skipped for the rest of the run instead of failing one by one.
#[derive(Debug, Default)]
pub struct QuotaSentinel {
    tripped: RwLock<HashSet<QuotaKind>>,
}

impl QuotaSentinel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self, kind: QuotaKind) {
        if self.tripped.write().insert(kind) {
            warn!(quota = %kind, "Quota exceeded; skipping further writes of this kind for this run");
        }
    }

    pub fn is_tripped(&self, kind: QuotaKind) -> bool {
        self.tripped.read().contains(&kind)
    }

    pub fn any_tripped(&self) -> bool {
        !self.tripped.read().is_empty()
    }

    /// Run `op` unless `kind` is tripped; trip on a quota error from it.
    pub async fn guard<T, F>(&self, kind: QuotaKind, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        if self.is_tripped(kind) {
            return Err(StoreError::QuotaExceeded(kind));
        }
        let result = op.await;
        if let Err(StoreError::QuotaExceeded(hit)) = &result {
            self.trip(*hit);
        }
        result
    }
}

/// Pad a row out to `width` cells.
pub(crate) fn pad_row(mut row: Vec<String>, width: usize) -> Vec<String> {
    if row.len() < width {
        row.resize(width, String::new());
    }
    row
}

/// Cell `col` (1-based) of a row, or "" past its end.
pub(crate) fn cell_at(row: &[String], col: usize) -> &str {
    row.get(col.saturating_sub(1)).map(String::as_str).unwrap_or("")
}

pub fn spreadsheet_url(spreadsheet_id: &str) -> String {
    format!("https://docs.google.com/spreadsheets/d/{}", spreadsheet_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sentinel_skips_after_trip() {
        let sentinel = QuotaSentinel::new();
        let first: Result<(), _> = sentinel
            .guard(QuotaKind::DriveUpload, async { Err(StoreError::QuotaExceeded(QuotaKind::DriveUpload)) })
            .await;
        assert!(first.is_err());
        assert!(sentinel.is_tripped(QuotaKind::DriveUpload));
        assert!(!sentinel.is_tripped(QuotaKind::SheetWrite));

        let mut ran = false;
        let second = sentinel
            .guard(QuotaKind::DriveUpload, async {
                ran = true;
                Ok(())
            })
            .await;
        assert!(matches!(second, Err(StoreError::QuotaExceeded(QuotaKind::DriveUpload))));
        assert!(!ran);

        let other = sentinel.guard(QuotaKind::SheetWrite, async { Ok(7) }).await.unwrap();
        assert_eq!(other, 7);
    }
}
