//! Google Sheets store: Sheets v4 values API over reqwest.
//!
//! Columns are located through the header row (see `SheetLayout`); an empty
//! tab gets the default header on first write. The store remembers which
//! sheet row each id lives on so updates rewrite that row in place; unknown
//! ids are appended. Cells of columns the mirror does not own are sent as
//! `null`, which the API leaves untouched.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::config::env_required;
use crate::error::{ConfigError, SyncError};
use crate::sync::{
    ParsedSheet, SHEET_HEADER, SheetLayout, SheetRow, SpreadsheetStore, SyncSnapshot,
};

const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com/v4";

/// Spreadsheet location and credentials.
#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    pub sheet_name: String,
    /// OAuth bearer token with spreadsheet scope.
    pub access_token: SecretString,
    pub api_base: String,
}

impl SheetsConfig {
    /// Build from `JOB_TRACKER_SHEET_ID`, `JOB_TRACKER_SHEET_NAME` and
    /// `JOB_TRACKER_SHEETS_TOKEN`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            spreadsheet_id: env_required("JOB_TRACKER_SHEET_ID")?,
            sheet_name: std::env::var("JOB_TRACKER_SHEET_NAME")
                .unwrap_or_else(|_| "Applications".into()),
            access_token: SecretString::from(env_required("JOB_TRACKER_SHEETS_TOKEN")?),
            api_base: std::env::var("JOB_TRACKER_SHEETS_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.into()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendResponse {
    updates: Option<AppendUpdates>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendUpdates {
    updated_range: Option<String>,
}

/// Where things are in the tab, as of the last read.
#[derive(Debug, Clone, Default)]
struct SheetIndex {
    layout: SheetLayout,
    has_header: bool,
    /// The tab held no values at all.
    empty: bool,
    /// Application id → 1-based sheet row.
    rows: HashMap<Uuid, usize>,
}

impl SheetIndex {
    fn from_values(values: &[Vec<String>]) -> (SyncSnapshot, Self) {
        let sheet = ParsedSheet::parse(values);
        let index = Self {
            layout: sheet.layout(),
            has_header: sheet.header.is_some(),
            empty: values.is_empty(),
            rows: sheet
                .rows
                .iter()
                .map(|(position, id, _)| (*id, position + 1))
                .collect(),
        };
        (sheet.snapshot(), index)
    }
}

/// `SpreadsheetStore` backed by a Google Sheets tab.
pub struct GoogleSheetsStore {
    client: reqwest::Client,
    config: SheetsConfig,
    /// `None` until the first read.
    index: Mutex<Option<SheetIndex>>,
}

impl GoogleSheetsStore {
    pub fn new(config: SheetsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            index: Mutex::new(None),
        }
    }

    fn values_url(&self, range: &str, suffix: &str) -> Result<Url, SyncError> {
        let mut url = Url::parse(&self.config.api_base)
            .map_err(|e| SyncError::InvalidResponse(format!("bad API base: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidResponse("API base cannot be a base URL".into()))?
            .extend([
                "spreadsheets",
                self.config.spreadsheet_id.as_str(),
                "values",
                &format!("{range}{suffix}"),
            ]);
        Ok(url)
    }

    fn full_range(&self) -> String {
        format!("{}!A:Z", self.config.sheet_name)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, SyncError> {
        let response = request
            .bearer_auth(self.config.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SyncError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn fetch_rows(&self) -> Result<(SyncSnapshot, SheetIndex), SyncError> {
        let url = self.values_url(&self.full_range(), "")?;
        let response = self.send(self.client.get(url)).await?;
        let range: ValueRange = response
            .json()
            .await
            .map_err(|e| SyncError::InvalidResponse(e.to_string()))?;

        let (snapshot, index) = SheetIndex::from_values(&range.values);
        debug!(
            rows = snapshot.len(),
            header = index.has_header,
            "Read spreadsheet snapshot"
        );
        Ok((snapshot, index))
    }

    async fn update_row(
        &self,
        row_number: usize,
        cells: Vec<Option<String>>,
    ) -> Result<(), SyncError> {
        let last = column_letter(cells.len().max(1));
        let range = format!("{}!A{row_number}:{last}{row_number}", self.config.sheet_name);
        let url = self.values_url(&range, "")?;
        let body = serde_json::json!({ "range": range, "values": [cells] });
        self.send(
            self.client
                .put(url)
                .query(&[("valueInputOption", "RAW")])
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn append_row<T: serde::Serialize>(
        &self,
        cells: &[T],
    ) -> Result<Option<usize>, SyncError> {
        let url = self.values_url(&self.full_range(), ":append")?;
        let body = serde_json::json!({ "values": [cells] });
        let response = self
            .send(
                self.client
                    .post(url)
                    .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
                    .json(&body),
            )
            .await?;
        let parsed: AppendResponse = response
            .json()
            .await
            .map_err(|e| SyncError::InvalidResponse(e.to_string()))?;
        Ok(parsed
            .updates
            .and_then(|u| u.updated_range)
            .and_then(|r| row_from_range(&r)))
    }
}

#[async_trait]
impl SpreadsheetStore for GoogleSheetsStore {
    fn name(&self) -> &str {
        "google_sheets"
    }

    async fn upsert(&self, application_id: Uuid, fields: &SheetRow) -> Result<(), SyncError> {
        let mut guard = self.index.lock().await;
        if guard.is_none() {
            let (_, index) = self.fetch_rows().await?;
            *guard = Some(index);
        }
        let index = guard.get_or_insert_with(SheetIndex::default);

        if index.empty {
            self.append_row(&SHEET_HEADER[..]).await?;
            index.layout = SheetLayout::default();
            index.has_header = true;
            index.empty = false;
        }

        let cells = index.layout.to_cells(application_id, fields);
        match index.rows.get(&application_id).copied() {
            Some(row_number) => self.update_row(row_number, cells).await,
            None => {
                if let Some(row_number) = self.append_row(cells.as_slice()).await? {
                    index.rows.insert(application_id, row_number);
                }
                Ok(())
            }
        }
    }

    async fn snapshot(&self) -> Result<SyncSnapshot, SyncError> {
        let (snapshot, index) = self.fetch_rows().await?;
        *self.index.lock().await = Some(index);
        Ok(snapshot)
    }
}

/// A1 column name for a 1-based column number.
fn column_letter(mut column: usize) -> String {
    let mut name = Vec::new();
    while column > 0 {
        let rem = (column - 1) % 26;
        name.push(b'A' + rem as u8);
        column = (column - 1) / 26;
    }
    name.reverse();
    String::from_utf8_lossy(&name).into_owned()
}

/// Row number from an A1 range such as `Applications!A7:F7`.
fn row_from_range(range: &str) -> Option<usize> {
    let cells = range.rsplit('!').next()?;
    let first = cells.split(':').next()?;
    first
        .trim_start_matches(|c: char| c.is_ascii_alphabetic() || c == '$')
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GoogleSheetsStore {
        GoogleSheetsStore::new(SheetsConfig {
            spreadsheet_id: "sheet123".into(),
            sheet_name: "My Applications".into(),
            access_token: SecretString::from("token"),
            api_base: DEFAULT_API_BASE.into(),
        })
    }

    #[test]
    fn row_number_from_updated_range() {
        assert_eq!(row_from_range("Applications!A7:F7"), Some(7));
        assert_eq!(row_from_range("'My Sheet'!$A$12:$F$12"), Some(12));
        assert_eq!(row_from_range("Applications!A:F"), None);
    }

    #[test]
    fn column_letters() {
        assert_eq!(column_letter(1), "A");
        assert_eq!(column_letter(6), "F");
        assert_eq!(column_letter(26), "Z");
        assert_eq!(column_letter(27), "AA");
    }

    #[test]
    fn index_points_at_sheet_rows_below_header() {
        let id = Uuid::new_v4();
        let values = vec![
            vec!["Company".to_string(), "Application ID".to_string()],
            vec!["Acme".to_string(), id.to_string()],
        ];
        let (snapshot, index) = SheetIndex::from_values(&values);
        assert!(index.has_header);
        assert!(!index.empty);
        assert_eq!(index.rows.get(&id), Some(&2));
        assert_eq!(snapshot.get(&id).unwrap().company, "Acme");

        let (_, index) = SheetIndex::from_values(&[]);
        assert!(index.empty);
        assert!(!index.has_header);
    }

    #[test]
    fn values_url_encodes_sheet_name() {
        let s = store();
        let url = s.values_url(&s.full_range(), ":append").unwrap();
        assert_eq!(
            url.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/sheet123/values/My%20Applications!A:Z:append"
        );
    }

    #[test]
    fn value_range_tolerates_missing_values() {
        let parsed: ValueRange = serde_json::from_str(r#"{"range": "A1:F1"}"#).unwrap();
        assert!(parsed.values.is_empty());
    }
}
