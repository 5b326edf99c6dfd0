// In-memory SheetStore + DriveStore. Behaves like the real APIs where it
// matters to callers: writes outside the grid are rejected, appends land
// after the last non-empty row and grow the grid, new spreadsheets start
// with a single "Sheet1".

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::a1::A1Range;
use super::{DriveFile, DriveStore, Grid, SheetInfo, SheetStore, ValueRange, SPREADSHEET_MIME};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct MemSheet {
    info: SheetInfo,
    cells: Grid,
}

impl MemSheet {
    fn used_rows(&self) -> usize {
        self.cells
            .iter()
            .rposition(|row| row.iter().any(|c| !c.is_empty()))
            .map_or(0, |i| i + 1)
    }

    fn write(&mut self, start_row: usize, start_col: usize, values: &Grid) {
        for (r, row) in values.iter().enumerate() {
            let target_row = start_row - 1 + r;
            if self.cells.len() <= target_row {
                self.cells.resize(target_row + 1, Vec::new());
            }
            for (c, value) in row.iter().enumerate() {
                let target_col = start_col - 1 + c;
                let cells = &mut self.cells[target_row];
                if cells.len() <= target_col {
                    cells.resize(target_col + 1, String::new());
                }
                cells[target_col] = value.clone();
            }
        }
    }
}

#[derive(Debug, Clone)]
struct MemFile {
    file: DriveFile,
    parent: Option<String>,
    mime_type: String,
    bytes: usize,
    shared: bool,
}

#[derive(Default)]
struct State {
    spreadsheets: HashMap<String, Vec<MemSheet>>,
    files: Vec<MemFile>,
    next_id: u64,
    value_writes: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a sheet with rows (grid sized to fit plus headroom).
    pub fn insert_sheet(&self, spreadsheet_id: &str, title: &str, rows: Grid) {
        let mut state = self.state.lock();
        state.next_id += 1;
        let cols = rows.iter().map(Vec::len).max().unwrap_or(0).max(16);
        let sheet = MemSheet {
            info: SheetInfo {
                sheet_id: state.next_id as i64,
                title: title.to_string(),
                row_count: rows.len() + 100,
                column_count: cols,
            },
            cells: rows,
        };
        state.spreadsheets.entry(spreadsheet_id.to_string()).or_default().push(sheet);
    }

    /// All cell values of a sheet, trailing empty rows dropped.
    pub fn rows(&self, spreadsheet_id: &str, title: &str) -> Grid {
        let state = self.state.lock();
        state
            .spreadsheets
            .get(spreadsheet_id)
            .and_then(|sheets| sheets.iter().find(|s| s.info.title == title))
            .map(|s| s.cells[..s.used_rows()].to_vec())
            .unwrap_or_default()
    }

    pub fn sheet_info(&self, spreadsheet_id: &str, title: &str) -> Option<SheetInfo> {
        let state = self.state.lock();
        state
            .spreadsheets
            .get(spreadsheet_id)?
            .iter()
            .find(|s| s.info.title == title)
            .map(|s| s.info.clone())
    }

    /// Spreadsheet id of a Drive file by name.
    pub fn file_id(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        state.files.iter().find(|f| f.file.name == name).map(|f| f.file.id.clone())
    }

    pub fn file_count(&self, mime_type: &str) -> usize {
        self.state.lock().files.iter().filter(|f| f.mime_type == mime_type).count()
    }

    pub fn is_shared(&self, file_id: &str) -> bool {
        self.state.lock().files.iter().any(|f| f.file.id == file_id && f.shared)
    }

    pub fn uploaded_bytes(&self, name: &str) -> Option<usize> {
        self.state.lock().files.iter().find(|f| f.file.name == name).map(|f| f.bytes)
    }

    /// Number of append/batch value write calls so far.
    pub fn value_writes(&self) -> usize {
        self.state.lock().value_writes
    }

    fn sheet_mut<'a>(state: &'a mut State, spreadsheet_id: &str, title: &str) -> Result<&'a mut MemSheet, StoreError> {
        state
            .spreadsheets
            .get_mut(spreadsheet_id)
            .ok_or_else(|| StoreError::NotFound(format!("spreadsheet {}", spreadsheet_id)))?
            .iter_mut()
            .find(|s| s.info.title == title)
            .ok_or_else(|| StoreError::Api {
                status: 400,
                body: format!("Unable to parse range: {}", title),
            })
    }
}

#[async_trait]
impl SheetStore for MemoryStore {
    async fn sheets(&self, spreadsheet_id: &str) -> Result<Vec<SheetInfo>, StoreError> {
        let state = self.state.lock();
        state
            .spreadsheets
            .get(spreadsheet_id)
            .map(|sheets| sheets.iter().map(|s| s.info.clone()).collect())
            .ok_or_else(|| StoreError::NotFound(format!("spreadsheet {}", spreadsheet_id)))
    }

    async fn add_sheet(&self, spreadsheet_id: &str, title: &str, rows: usize, cols: usize) -> Result<SheetInfo, StoreError> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let info = SheetInfo {
            sheet_id: state.next_id as i64,
            title: title.to_string(),
            row_count: rows,
            column_count: cols,
        };
        let sheets = state
            .spreadsheets
            .get_mut(spreadsheet_id)
            .ok_or_else(|| StoreError::NotFound(format!("spreadsheet {}", spreadsheet_id)))?;
        if sheets.iter().any(|s| s.info.title == title) {
            return Err(StoreError::Api {
                status: 400,
                body: format!("A sheet with the name \"{}\" already exists", title),
            });
        }
        sheets.push(MemSheet {
            info: info.clone(),
            cells: Vec::new(),
        });
        Ok(info)
    }

    async fn rename_sheet(&self, spreadsheet_id: &str, sheet_id: i64, title: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let sheet = state
            .spreadsheets
            .get_mut(spreadsheet_id)
            .and_then(|sheets| sheets.iter_mut().find(|s| s.info.sheet_id == sheet_id))
            .ok_or_else(|| StoreError::NotFound(format!("sheet {}", sheet_id)))?;
        sheet.info.title = title.to_string();
        Ok(())
    }

    async fn resize_sheet(&self, spreadsheet_id: &str, sheet_id: i64, rows: usize, cols: usize) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let sheet = state
            .spreadsheets
            .get_mut(spreadsheet_id)
            .and_then(|sheets| sheets.iter_mut().find(|s| s.info.sheet_id == sheet_id))
            .ok_or_else(|| StoreError::NotFound(format!("sheet {}", sheet_id)))?;
        sheet.info.row_count = rows;
        sheet.info.column_count = cols;
        Ok(())
    }

    async fn get_values(&self, spreadsheet_id: &str, range: &str) -> Result<Grid, StoreError> {
        let range = A1Range::parse(range)?;
        let mut state = self.state.lock();
        let sheet = Self::sheet_mut(&mut state, spreadsheet_id, &range.title)?;
        let last_row = range.end_row.unwrap_or(usize::MAX).min(sheet.cells.len());

        let mut grid: Grid = (range.start_row..=last_row)
            .filter_map(|r| sheet.cells.get(r - 1))
            .map(|row| {
                let mut slice: Vec<String> = (range.start_col..=range.end_col)
                    .map(|c| row.get(c - 1).cloned().unwrap_or_default())
                    .collect();
                while slice.last().is_some_and(String::is_empty) {
                    slice.pop();
                }
                slice
            })
            .collect();
        while grid.last().is_some_and(Vec::is_empty) {
            grid.pop();
        }
        Ok(grid)
    }

    async fn append_rows(&self, spreadsheet_id: &str, title: &str, rows: Grid) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.value_writes += 1;
        let sheet = Self::sheet_mut(&mut state, spreadsheet_id, title)?;
        let start = sheet.used_rows() + 1;
        let needed = start - 1 + rows.len();
        if needed > sheet.info.row_count {
            sheet.info.row_count = needed;
        }
        sheet.write(start, 1, &rows);
        Ok(())
    }

    async fn batch_update(&self, spreadsheet_id: &str, data: Vec<ValueRange>) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.value_writes += 1;
        let parsed = data
            .iter()
            .map(|vr| A1Range::parse(&vr.range))
            .collect::<Result<Vec<_>, _>>()?;

        // Validate everything before touching anything, like the real call.
        for (range, vr) in parsed.iter().zip(&data) {
            let sheet = Self::sheet_mut(&mut state, spreadsheet_id, &range.title)?;
            let last_row = range.start_row + vr.values.len().saturating_sub(1);
            let last_col = range.start_col + vr.values.iter().map(Vec::len).max().unwrap_or(1).saturating_sub(1);
            if last_row > sheet.info.row_count || last_col > sheet.info.column_count {
                return Err(StoreError::Api {
                    status: 400,
                    body: format!("Range ({}) exceeds grid limits", vr.range),
                });
            }
        }
        for (range, vr) in parsed.iter().zip(&data) {
            let sheet = Self::sheet_mut(&mut state, spreadsheet_id, &range.title)?;
            sheet.write(range.start_row, range.start_col, &vr.values);
        }
        Ok(())
    }
}

#[async_trait]
impl DriveStore for MemoryStore {
    async fn find_file(&self, name: &str, parent: Option<&str>, mime_type: &str) -> Result<Option<DriveFile>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .files
            .iter()
            .find(|f| f.file.name == name && f.mime_type == mime_type && (parent.is_none() || f.parent.as_deref() == parent))
            .map(|f| f.file.clone()))
    }

    async fn create_file(&self, name: &str, parent: Option<&str>, mime_type: &str) -> Result<DriveFile, StoreError> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("file-{}", state.next_id);
        let file = DriveFile {
            id: id.clone(),
            name: name.to_string(),
            web_view_link: Some(format!("https://drive.google.com/open?id={}", id)),
        };
        if mime_type == SPREADSHEET_MIME {
            let sheet = MemSheet {
                info: SheetInfo {
                    sheet_id: 0,
                    title: "Sheet1".into(),
                    row_count: 1000,
                    column_count: 26,
                },
                cells: Vec::new(),
            };
            state.spreadsheets.insert(id.clone(), vec![sheet]);
        }
        state.files.push(MemFile {
            file: file.clone(),
            parent: parent.map(str::to_string),
            mime_type: mime_type.to_string(),
            bytes: 0,
            shared: false,
        });
        Ok(file)
    }

    async fn upload_file(&self, name: &str, parent: Option<&str>, mime_type: &str, bytes: Vec<u8>) -> Result<DriveFile, StoreError> {
        let file = self.create_file(name, parent, mime_type).await?;
        let mut state = self.state.lock();
        if let Some(stored) = state.files.iter_mut().find(|f| f.file.id == file.id) {
            stored.bytes = bytes.len();
        }
        Ok(file)
    }

    async fn share_anyone_reader(&self, file_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let file = state
            .files
            .iter_mut()
            .find(|f| f.file.id == file_id)
            .ok_or_else(|| StoreError::NotFound(file_id.to_string()))?;
        file.shared = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_outside_grid_are_rejected_until_resized() {
        let store = MemoryStore::new();
        store.insert_sheet("s", "Summary", vec![vec!["a".into()]]);
        let info = store.sheet_info("s", "Summary").unwrap();

        let far = ValueRange::single("'Summary'!Q1", "x");
        assert!(store.batch_update("s", vec![far.clone()]).await.is_err());

        store.resize_sheet("s", info.sheet_id, info.row_count, 20).await.unwrap();
        store.batch_update("s", vec![far]).await.unwrap();
        assert_eq!(store.get_values("s", "'Summary'!Q1").await.unwrap(), vec![vec!["x".to_string()]]);
    }

    #[tokio::test]
    async fn test_append_lands_after_last_used_row() {
        let store = MemoryStore::new();
        store.insert_sheet("s", "t", vec![vec!["h".into()], vec!["1".into()]]);
        store.append_rows("s", "t", vec![vec!["2".into()]]).await.unwrap();
        assert_eq!(store.rows("s", "t").len(), 3);
        assert_eq!(store.get_values("s", "'t'!A2:A").await.unwrap(), vec![vec!["1".to_string()], vec!["2".into()]]);
    }
}
