//! Store adapters for the tracking sheet.
//!
//! Positions are 1-based sheet rows. Row 1 holds the header, so the data row
//! at snapshot index `i` lives at position `i + HEADER_OFFSET`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use billwatch_core::SheetTable;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::{ServiceAccountKey, TokenSource};
use crate::{FetchError, HttpFetcher, ReplayScope};

pub const HEADER_OFFSET: usize = 2;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is not configured: {0}")]
    Config(String),
    #[error("store authentication failed: {0}")]
    Auth(String),
    #[error("sheet request failed: {0}")]
    Request(#[from] FetchError),
    #[error("unexpected sheet response: {0}")]
    Decode(String),
    #[error("local sheet {path}: {message}")]
    Local { path: PathBuf, message: String },
    #[error("row position {0} is outside the sheet")]
    BadPosition(usize),
}

/// Persistent tabular store holding one bill per row.
#[async_trait]
pub trait SheetStore: Send + Sync {
    /// Header row plus every data row, in sheet order.
    async fn read_table(&self) -> Result<SheetTable, StoreError>;

    /// Append rows after the last data row in one call.
    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), StoreError>;

    /// Overwrite the row at 1-based sheet `position`.
    async fn update_row(&self, position: usize, cells: &[String]) -> Result<(), StoreError>;
}

pub fn sheet_position(index: usize) -> usize {
    index + HEADER_OFFSET
}

/// Spreadsheet column name for a 1-based column number (1 -> A, 27 -> AA).
pub fn column_letter(column: usize) -> String {
    let mut n = column.max(1);
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// A1 range covering `width` cells of one row, e.g. `A7:L7`.
pub fn row_range(position: usize, width: usize) -> String {
    format!("A{position}:{}{position}", column_letter(width))
}

/// Range on a named worksheet. The name is always quoted, with embedded
/// quotes doubled, so names with spaces or punctuation stay valid A1 notation.
pub fn worksheet_range(worksheet: &str, range: &str) -> String {
    let quoted = format!("'{}'", worksheet.replace('\'', "''"));
    if range.is_empty() {
        quoted
    } else {
        format!("{quoted}!{range}")
    }
}

fn data_index(position: usize, len: usize) -> Result<usize, StoreError> {
    position
        .checked_sub(HEADER_OFFSET)
        .filter(|idx| *idx < len)
        .ok_or(StoreError::BadPosition(position))
}

/// Render a JSON cell the way the sheet displays it.
pub fn cell_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(true) => "TRUE".to_string(),
        JsonValue::Bool(false) => "FALSE".to_string(),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() && f.fract() == 0.0 => format!("{f:.0}"),
                    Some(f) => f.to_string(),
                    None => n.to_string(),
                }
            }
        }
        other => other.to_string(),
    }
}

fn table_from_values(values: Vec<Vec<JsonValue>>) -> SheetTable {
    let mut rows = values
        .into_iter()
        .map(|row| row.iter().map(cell_to_text).collect::<Vec<_>>());
    let headers = rows.next().unwrap_or_default();
    SheetTable {
        headers,
        rows: rows.collect(),
    }
}

#[derive(Debug, Clone)]
pub struct SheetsApiConfig {
    pub base_url: String,
    pub spreadsheet_id: String,
    pub worksheet: String,
    pub access_token: Option<String>,
    /// Service account key JSON, used when no access token is given.
    pub service_account_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

/// Google Sheets v4 `values` API client for one worksheet.
#[derive(Debug)]
pub struct SheetsApiStore {
    http: HttpFetcher,
    base_url: Url,
    spreadsheet_id: String,
    worksheet: String,
    token: TokenSource,
}

impl SheetsApiStore {
    pub fn new(http: HttpFetcher, config: SheetsApiConfig) -> Result<Self, StoreError> {
        if config.spreadsheet_id.trim().is_empty() {
            return Err(StoreError::Config("spreadsheet id is empty".to_string()));
        }
        let token = match (
            config.access_token.filter(|t| !t.trim().is_empty()),
            config.service_account_json.filter(|j| !j.trim().is_empty()),
        ) {
            (Some(token), _) => TokenSource::Static(token.trim().to_string()),
            (None, Some(json)) => TokenSource::service_account(ServiceAccountKey::from_json(&json)?),
            (None, None) => {
                return Err(StoreError::Auth(
                    "no access token or service account credentials provided".to_string(),
                ))
            }
        };
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| StoreError::Config(format!("invalid sheets base url: {e}")))?;
        Ok(Self {
            http,
            base_url,
            spreadsheet_id: config.spreadsheet_id,
            worksheet: config.worksheet,
            token,
        })
    }

    fn values_url(&self, range: &str) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Config("sheets base url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.spreadsheet_id.as_str(), "values", range]);
        Ok(url)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: Url,
        body: Option<JsonValue>,
    ) -> Result<Vec<u8>, StoreError> {
        let scope = if method == reqwest::Method::POST {
            ReplayScope::RejectedOnly
        } else {
            ReplayScope::AnyTransient
        };
        let access_token = self.token.access_token(&self.http).await?;
        let resp = self
            .http
            .execute_with(url.as_str(), scope, |client| {
                let req = client
                    .request(method.clone(), url.clone())
                    .bearer_auth(&access_token);
                match &body {
                    Some(body) => req.json(body),
                    None => req,
                }
            })
            .await
            .map_err(|err| match err.status() {
                Some(401) | Some(403) => StoreError::Auth(err.to_string()),
                _ => StoreError::Request(err),
            })?;
        Ok(resp.body)
    }
}

#[async_trait]
impl SheetStore for SheetsApiStore {
    async fn read_table(&self) -> Result<SheetTable, StoreError> {
        let mut url = self.values_url(&worksheet_range(&self.worksheet, ""))?;
        url.query_pairs_mut()
            .append_pair("valueRenderOption", "FORMATTED_VALUE");
        let body = self.send(reqwest::Method::GET, url, None).await?;
        let range: ValueRange = serde_json::from_slice(&body)
            .map_err(|e| StoreError::Decode(format!("values response: {e}")))?;
        let table = table_from_values(range.values);
        debug!(rows = table.rows.len(), "read worksheet");
        Ok(table)
    }

    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        // POST is never replayed after a timeout: the rows may already be in.
        let mut url = self.values_url(&format!("{}:append", worksheet_range(&self.worksheet, "A1")))?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        self.send(reqwest::Method::POST, url, Some(json!({ "values": rows })))
            .await?;
        Ok(())
    }

    async fn update_row(&self, position: usize, cells: &[String]) -> Result<(), StoreError> {
        if position < HEADER_OFFSET {
            return Err(StoreError::BadPosition(position));
        }
        let range = worksheet_range(&self.worksheet, &row_range(position, cells.len()));
        let mut url = self.values_url(&range)?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        self.send(
            reqwest::Method::PUT,
            url,
            Some(json!({ "range": range, "values": [cells] })),
        )
        .await?;
        Ok(())
    }
}

/// Replace `path` through a sibling temp file so readers never see a partial sheet.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).await?;
    let temp_path = dir.join(format!(".{}.sheet.tmp", Uuid::new_v4()));
    fs::write(&temp_path, bytes).await?;
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

/// Sheet kept as a JSON file on disk. A missing file reads as an empty sheet
/// with the standard header.
#[derive(Debug)]
pub struct LocalSheetStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LocalSheetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn local_err(&self, message: impl ToString) -> StoreError {
        StoreError::Local {
            path: self.path.clone(),
            message: message.to_string(),
        }
    }

    async fn load(&self) -> Result<SheetTable, StoreError> {
        let exists = fs::try_exists(&self.path)
            .await
            .map_err(|e| self.local_err(e))?;
        if !exists {
            return Ok(SheetTable::standard());
        }
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.local_err(e))?;
        serde_json::from_str(&text).map_err(|e| self.local_err(e))
    }

    async fn save(&self, table: &SheetTable) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(table).map_err(|e| self.local_err(e))?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|e| self.local_err(e))
    }
}

#[async_trait]
impl SheetStore for LocalSheetStore {
    async fn read_table(&self) -> Result<SheetTable, StoreError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut table = self.load().await?;
        table.rows.extend(rows.iter().cloned());
        self.save(&table).await?;
        info!(path = %self.path.display(), appended = rows.len(), "local sheet updated");
        Ok(())
    }

    async fn update_row(&self, position: usize, cells: &[String]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut table = self.load().await?;
        let idx = data_index(position, table.rows.len())?;
        table.rows[idx] = cells.to_vec();
        self.save(&table).await
    }
}

/// In-process sheet.
#[derive(Debug, Default)]
pub struct MemorySheetStore {
    table: Mutex<SheetTable>,
}

impl MemorySheetStore {
    pub fn new(table: SheetTable) -> Self {
        Self {
            table: Mutex::new(table),
        }
    }

    pub async fn table(&self) -> SheetTable {
        self.table.lock().await.clone()
    }
}

#[async_trait]
impl SheetStore for MemorySheetStore {
    async fn read_table(&self) -> Result<SheetTable, StoreError> {
        Ok(self.table.lock().await.clone())
    }

    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.table.lock().await.rows.extend(rows.iter().cloned());
        Ok(())
    }

    async fn update_row(&self, position: usize, cells: &[String]) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        let idx = data_index(position, table.rows.len())?;
        table.rows[idx] = cells.to_vec();
        Ok(())
    }
}
