//! Spreadsheet mirror of the application registry.
//!
//! One row per application: `application_id` (row key) followed by
//! `company, role, status, last_updated_at, history_summary`. Sheets kept by
//! hand rarely follow that order, so columns are located by header name,
//! with the usual spellings (`Company`, `Job Role`, `JobRole`, ...) accepted.

pub mod reconciler;
pub mod sheets;

pub use reconciler::{SyncOp, SyncOpKind, SyncReconciler, SyncReport, diff};
pub use sheets::{GoogleSheetsStore, SheetsConfig};

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SyncError;
use crate::pipeline::state::ApplicationRecord;

/// Header row written above the data.
pub const SHEET_HEADER: [&str; 6] = [
    "application_id",
    "company",
    "role",
    "status",
    "last_updated_at",
    "history_summary",
];

/// Externally mirrored fields of one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRow {
    pub company: String,
    pub role: String,
    pub status: String,
    pub last_updated_at: String,
    pub history_summary: String,
}

impl SheetRow {
    pub fn from_record(record: &ApplicationRecord) -> Self {
        Self {
            company: record.company.clone(),
            role: record.role.clone(),
            status: record.status().to_string(),
            last_updated_at: record
                .last_updated_at()
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            history_summary: record.history_summary(),
        }
    }
}

/// A mirrored field, as located in the sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    ApplicationId,
    Company,
    Role,
    Status,
    LastUpdatedAt,
    HistorySummary,
}

impl Column {
    /// Match a header cell, ignoring case, spacing and punctuation.
    fn from_header(cell: &str) -> Option<Self> {
        let key: String = cell
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        let column = match key.as_str() {
            "applicationid" | "id" | "appid" => Self::ApplicationId,
            "company" | "companyname" | "employer" => Self::Company,
            "role" | "jobrole" | "jobtitle" | "position" | "title" => Self::Role,
            "status" | "applicationstatus" => Self::Status,
            "lastupdatedat" | "lastupdated" | "updatedat" | "updated" => Self::LastUpdatedAt,
            "historysummary" | "history" => Self::HistorySummary,
            _ => return None,
        };
        Some(column)
    }
}

/// Column positions of the mirrored fields in one sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetLayout {
    application_id: usize,
    company: Option<usize>,
    role: Option<usize>,
    status: Option<usize>,
    last_updated_at: Option<usize>,
    history_summary: Option<usize>,
}

impl Default for SheetLayout {
    /// The `SHEET_HEADER` order.
    fn default() -> Self {
        Self {
            application_id: 0,
            company: Some(1),
            role: Some(2),
            status: Some(3),
            last_updated_at: Some(4),
            history_summary: Some(5),
        }
    }
}

impl SheetLayout {
    /// Locate columns from a header row. `None` when no column holds the
    /// application id, i.e. the row is not a header this mirror can use.
    /// The first matching column wins when a field appears twice.
    pub fn from_header(header: &[String]) -> Option<Self> {
        let mut application_id = None;
        let mut layout = Self {
            application_id: 0,
            company: None,
            role: None,
            status: None,
            last_updated_at: None,
            history_summary: None,
        };
        for (i, cell) in header.iter().enumerate() {
            let slot = match Column::from_header(cell) {
                Some(Column::ApplicationId) => {
                    application_id.get_or_insert(i);
                    continue;
                }
                Some(Column::Company) => &mut layout.company,
                Some(Column::Role) => &mut layout.role,
                Some(Column::Status) => &mut layout.status,
                Some(Column::LastUpdatedAt) => &mut layout.last_updated_at,
                Some(Column::HistorySummary) => &mut layout.history_summary,
                None => continue,
            };
            slot.get_or_insert(i);
        }
        layout.application_id = application_id?;
        Some(layout)
    }

    /// Number of columns spanned by the mirrored fields.
    pub fn width(&self) -> usize {
        [
            Some(self.application_id),
            self.company,
            self.role,
            self.status,
            self.last_updated_at,
            self.history_summary,
        ]
        .into_iter()
        .flatten()
        .max()
        .map_or(0, |last| last + 1)
    }

    /// Parse a data row. Rows without a valid key are not ours and yield
    /// `None`; missing or unmapped cells read as empty.
    pub fn parse_row(&self, cells: &[String]) -> Option<(Uuid, SheetRow)> {
        let id = Uuid::parse_str(cells.get(self.application_id)?.trim()).ok()?;
        let cell = |column: Option<usize>| {
            column
                .and_then(|i| cells.get(i))
                .map(|c| c.trim().to_string())
                .unwrap_or_default()
        };
        Some((
            id,
            SheetRow {
                company: cell(self.company),
                role: cell(self.role),
                status: cell(self.status),
                last_updated_at: cell(self.last_updated_at),
                history_summary: cell(self.history_summary),
            },
        ))
    }

    /// Cells for one row, placed in their columns. Columns this mirror does
    /// not own are `None`, which the store leaves untouched.
    pub fn to_cells(&self, application_id: Uuid, row: &SheetRow) -> Vec<Option<String>> {
        let mut cells = vec![None; self.width()];
        let mut put = |column: Option<usize>, value: &str| {
            if let Some(i) = column {
                cells[i] = Some(value.to_string());
            }
        };
        put(Some(self.application_id), &application_id.to_string());
        put(self.company, &row.company);
        put(self.role, &row.role);
        put(self.status, &row.status);
        put(self.last_updated_at, &row.last_updated_at);
        put(self.history_summary, &row.history_summary);
        cells
    }
}

/// A sheet's rows read through its header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSheet {
    /// `None` when the sheet has no usable header row.
    pub header: Option<SheetLayout>,
    /// `(0-based row position, application id, row)` for every row we own.
    pub rows: Vec<(usize, Uuid, SheetRow)>,
}

impl ParsedSheet {
    /// Read a block of values starting at the sheet's first row.
    ///
    /// The first row is taken as the header when it names an id column;
    /// otherwise every row is read in the default layout.
    pub fn parse(values: &[Vec<String>]) -> Self {
        let header = values.first().and_then(|first| SheetLayout::from_header(first));
        let layout = header.clone().unwrap_or_default();
        let skip = usize::from(header.is_some());
        let rows = values
            .iter()
            .enumerate()
            .skip(skip)
            .filter_map(|(i, cells)| layout.parse_row(cells).map(|(id, row)| (i, id, row)))
            .collect();
        Self { header, rows }
    }

    /// Layout to write new rows with.
    pub fn layout(&self) -> SheetLayout {
        self.header.clone().unwrap_or_default()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot::from_rows(self.rows.iter().map(|(_, id, row)| (*id, row.clone())))
    }
}

/// Last-known mirrored view: application id → row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    rows: BTreeMap<Uuid, SheetRow>,
}

impl SyncSnapshot {
    pub fn from_rows(rows: impl IntoIterator<Item = (Uuid, SheetRow)>) -> Self {
        Self {
            rows: rows.into_iter().collect(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&SheetRow> {
        self.rows.get(id)
    }

    pub fn insert(&mut self, id: Uuid, row: SheetRow) {
        self.rows.insert(id, row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &SheetRow)> {
        self.rows.iter()
    }
}

/// External store holding the mirrored rows.
#[async_trait]
pub trait SpreadsheetStore: Send + Sync {
    /// Store name, for logging.
    fn name(&self) -> &str;

    /// Insert or replace the row for `application_id`. Never deletes.
    async fn upsert(&self, application_id: Uuid, fields: &SheetRow) -> Result<(), SyncError>;

    /// Read every row currently in the store.
    async fn snapshot(&self) -> Result<SyncSnapshot, SyncError>;
}

/// In-process store, for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySheetStore {
    rows: Mutex<BTreeMap<Uuid, SheetRow>>,
}

impl MemorySheetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current rows.
    pub async fn rows(&self) -> BTreeMap<Uuid, SheetRow> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl SpreadsheetStore for MemorySheetStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, application_id: Uuid, fields: &SheetRow) -> Result<(), SyncError> {
        self.rows.lock().await.insert(application_id, fields.clone());
        Ok(())
    }

    async fn snapshot(&self) -> Result<SyncSnapshot, SyncError> {
        Ok(SyncSnapshot::from_rows(self.rows.lock().await.clone()))
    }
}
