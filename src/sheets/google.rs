// =============================================================================
// sheets/google.rs - SHEETS v4 + DRIVE v3 OVER PLAIN REST
// =============================================================================
//
// No SDK; the handful of endpoints we need are simple JSON calls with a
// bearer token. Error bodies are classified here so callers only ever see
// StoreError:
//
//   403 + storageQuotaExceeded        → QuotaExceeded(DriveUpload)
//   429 / RATE_LIMIT_EXCEEDED on write → QuotaExceeded(SheetWrite)
//   401                               → Auth
//   404                               → NotFound
//   anything else non-2xx             → Api { status, body }
//
// Drive calls pass supportsAllDrives so shared-drive targets work for
// service accounts.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::auth::GoogleAuth;
use super::{DriveFile, DriveStore, Grid, SheetInfo, SheetStore, ValueRange};
use crate::config::Config;
use crate::error::{QuotaKind, StoreError};

const FILE_FIELDS: &str = "id,name,webViewLink";

pub struct GoogleClient {
    client: reqwest::Client,
    auth: Arc<GoogleAuth>,
    sheets_url: String,
    drive_url: String,
    upload_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
    #[serde(default)]
    grid_properties: GridProperties,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridProperties {
    #[serde(default)]
    row_count: usize,
    #[serde(default)]
    column_count: usize,
}

impl From<SheetProperties> for SheetInfo {
    fn from(p: SheetProperties) -> Self {
        SheetInfo {
            sheet_id: p.sheet_id,
            title: p.title,
            row_count: p.grid_properties.row_count,
            column_count: p.grid_properties.column_count,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    id: String,
    #[serde(default)]
    name: String,
    web_view_link: Option<String>,
}

impl From<FileResource> for DriveFile {
    fn from(f: FileResource) -> Self {
        DriveFile {
            id: f.id,
            name: f.name,
            web_view_link: f.web_view_link,
        }
    }
}

impl GoogleClient {
    pub fn new(client: reqwest::Client, auth: Arc<GoogleAuth>, config: &Config) -> Self {
        Self {
            client,
            auth,
            sheets_url: config.sheets_api_url.trim_end_matches('/').to_string(),
            drive_url: config.drive_api_url.trim_end_matches('/').to_string(),
            upload_url: config.drive_upload_url.trim_end_matches('/').to_string(),
        }
    }

    /// Attach the bearer token, send, classify the status, parse JSON.
    /// `quota` names what a quota error on this call means.
    async fn send(&self, request: reqwest::RequestBuilder, quota: Option<QuotaKind>) -> Result<Value, StoreError> {
        let token = self.auth.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        if !(200..300).contains(&status) {
            return Err(classify(status, body, quota));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn spreadsheet_batch(&self, spreadsheet_id: &str, requests: Value) -> Result<Value, StoreError> {
        let url = format!("{}/{}:batchUpdate", self.sheets_url, spreadsheet_id);
        self.send(
            self.client.post(url).json(&json!({ "requests": requests })),
            Some(QuotaKind::SheetWrite),
        )
        .await
    }
}

fn classify(status: u16, body: String, quota: Option<QuotaKind>) -> StoreError {
    if body.contains("storageQuotaExceeded") {
        return StoreError::QuotaExceeded(QuotaKind::DriveUpload);
    }
    if let Some(kind) = quota {
        if status == 429 || body.contains("RATE_LIMIT_EXCEEDED") || body.contains("Quota exceeded") {
            return StoreError::QuotaExceeded(kind);
        }
    }
    match status {
        401 => StoreError::Auth(body),
        404 => StoreError::NotFound(body),
        _ => StoreError::Api { status, body },
    }
}

fn cell_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Escape a literal for a Drive `q` expression.
fn drive_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl SheetStore for GoogleClient {
    async fn sheets(&self, spreadsheet_id: &str) -> Result<Vec<SheetInfo>, StoreError> {
        let url = format!("{}/{}", self.sheets_url, spreadsheet_id);
        let body = self
            .send(self.client.get(url).query(&[("fields", "sheets.properties")]), None)
            .await?;
        let sheets = body["sheets"]
            .as_array()
            .map(|sheets| {
                sheets
                    .iter()
                    .filter_map(|s| serde_json::from_value::<SheetProperties>(s["properties"].clone()).ok())
                    .map(SheetInfo::from)
                    .collect()
            })
            .unwrap_or_default();
        Ok(sheets)
    }

    async fn add_sheet(&self, spreadsheet_id: &str, title: &str, rows: usize, cols: usize) -> Result<SheetInfo, StoreError> {
        let body = self
            .spreadsheet_batch(
                spreadsheet_id,
                json!([{ "addSheet": { "properties": {
                    "title": title,
                    "gridProperties": { "rowCount": rows, "columnCount": cols }
                }}}]),
            )
            .await?;
        let properties: SheetProperties = serde_json::from_value(body["replies"][0]["addSheet"]["properties"].clone())?;
        info!(title, rows, cols, "Sheet created");
        Ok(properties.into())
    }

    async fn rename_sheet(&self, spreadsheet_id: &str, sheet_id: i64, title: &str) -> Result<(), StoreError> {
        self.spreadsheet_batch(
            spreadsheet_id,
            json!([{ "updateSheetProperties": {
                "properties": { "sheetId": sheet_id, "title": title },
                "fields": "title"
            }}]),
        )
        .await?;
        Ok(())
    }

    async fn resize_sheet(&self, spreadsheet_id: &str, sheet_id: i64, rows: usize, cols: usize) -> Result<(), StoreError> {
        self.spreadsheet_batch(
            spreadsheet_id,
            json!([{ "updateSheetProperties": {
                "properties": {
                    "sheetId": sheet_id,
                    "gridProperties": { "rowCount": rows, "columnCount": cols }
                },
                "fields": "gridProperties.rowCount,gridProperties.columnCount"
            }}]),
        )
        .await?;
        debug!(sheet_id, rows, cols, "Sheet resized");
        Ok(())
    }

    async fn get_values(&self, spreadsheet_id: &str, range: &str) -> Result<Grid, StoreError> {
        let url = format!("{}/{}/values/{}", self.sheets_url, spreadsheet_id, urlencoding::encode(range));
        let body = self.send(self.client.get(url), None).await?;
        let grid = body["values"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .map(|row| row.as_array().map(|cells| cells.iter().map(cell_to_string).collect()).unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default();
        Ok(grid)
    }

    async fn append_rows(&self, spreadsheet_id: &str, title: &str, rows: Grid) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let range = format!("{}!A1", super::a1::quote_title(title));
        let url = format!("{}/{}/values/{}:append", self.sheets_url, spreadsheet_id, urlencoding::encode(&range));
        self.send(
            self.client
                .post(url)
                .query(&[("valueInputOption", "USER_ENTERED"), ("insertDataOption", "INSERT_ROWS")])
                .json(&json!({ "values": rows })),
            Some(QuotaKind::SheetWrite),
        )
        .await?;
        Ok(())
    }

    async fn batch_update(&self, spreadsheet_id: &str, data: Vec<ValueRange>) -> Result<(), StoreError> {
        if data.is_empty() {
            return Ok(());
        }
        let ranges = data.len();
        let payload: Vec<Value> = data
            .into_iter()
            .map(|vr| json!({ "range": vr.range, "values": vr.values }))
            .collect();
        let url = format!("{}/{}/values:batchUpdate", self.sheets_url, spreadsheet_id);
        self.send(
            self.client
                .post(url)
                .json(&json!({ "valueInputOption": "USER_ENTERED", "data": payload })),
            Some(QuotaKind::SheetWrite),
        )
        .await?;
        debug!(ranges, "Values batch written");
        Ok(())
    }
}

#[async_trait]
impl DriveStore for GoogleClient {
    async fn find_file(&self, name: &str, parent: Option<&str>, mime_type: &str) -> Result<Option<DriveFile>, StoreError> {
        let mut q = format!(
            "name = '{}' and mimeType = '{}' and trashed = false",
            drive_literal(name),
            drive_literal(mime_type)
        );
        if let Some(parent) = parent {
            q.push_str(&format!(" and '{}' in parents", drive_literal(parent)));
        }
        let url = format!("{}/files", self.drive_url);
        let body = self
            .send(
                self.client.get(url).query(&[
                    ("q", q.as_str()),
                    ("fields", "files(id,name,webViewLink)"),
                    ("supportsAllDrives", "true"),
                    ("includeItemsFromAllDrives", "true"),
                ]),
                None,
            )
            .await?;
        let file = body["files"]
            .as_array()
            .and_then(|files| files.first())
            .and_then(|f| serde_json::from_value::<FileResource>(f.clone()).ok())
            .map(DriveFile::from);
        Ok(file)
    }

    async fn create_file(&self, name: &str, parent: Option<&str>, mime_type: &str) -> Result<DriveFile, StoreError> {
        let mut metadata = json!({ "name": name, "mimeType": mime_type });
        if let Some(parent) = parent {
            metadata["parents"] = json!([parent]);
        }
        let url = format!("{}/files", self.drive_url);
        let body = self
            .send(
                self.client
                    .post(url)
                    .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
                    .json(&metadata),
                Some(QuotaKind::DriveUpload),
            )
            .await?;
        let file: FileResource = serde_json::from_value(body)?;
        info!(name, id = %file.id, mime_type, "Drive file created");
        Ok(file.into())
    }

    async fn upload_file(&self, name: &str, parent: Option<&str>, mime_type: &str, bytes: Vec<u8>) -> Result<DriveFile, StoreError> {
        let mut metadata = json!({ "name": name, "mimeType": mime_type });
        if let Some(parent) = parent {
            metadata["parents"] = json!([parent]);
        }

        // multipart/related: JSON metadata part, then the raw media part.
        let boundary = format!("valueup-{}", uuid::Uuid::new_v4().simple());
        let mut body = Vec::with_capacity(bytes.len() + 512);
        body.extend_from_slice(format!("--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n", boundary).as_bytes());
        body.extend_from_slice(metadata.to_string().as_bytes());
        body.extend_from_slice(format!("\r\n--{}\r\nContent-Type: {}\r\n\r\n", boundary, mime_type).as_bytes());
        body.extend_from_slice(&bytes);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        let response = self
            .send(
                self.client
                    .post(&self.upload_url)
                    .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
                    .header("Content-Type", format!("multipart/related; boundary={}", boundary))
                    .body(body),
                Some(QuotaKind::DriveUpload),
            )
            .await?;
        let file: FileResource = serde_json::from_value(response)?;
        info!(name, id = %file.id, bytes = bytes.len(), "Uploaded to Drive");
        Ok(file.into())
    }

    async fn share_anyone_reader(&self, file_id: &str) -> Result<(), StoreError> {
        let url = format!("{}/files/{}/permissions", self.drive_url, file_id);
        self.send(
            self.client
                .post(url)
                .query(&[("supportsAllDrives", "true")])
                .json(&json!({ "role": "reader", "type": "anyone" })),
            None,
        )
        .await?;
        Ok(())
    }
}
