//! Core domain model for billwatch: scraped bills, spreadsheet rows and identifiers.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "billwatch-core";

/// Value written for any field the extractor could not locate.
pub const NO_DATA: &str = "S/D";

/// Header labels of the tracking sheet, in column order (A..L).
pub mod columns {
    pub const ID: &str = "ID";
    pub const ORIGIN_CHAMBER: &str = "Cámara de Origen";
    pub const CASE_ID: &str = "Expediente";
    pub const AUTHOR: &str = "Autor";
    pub const START_DATE: &str = "Fecha de inicio";
    pub const PROJECT_TEXT: &str = "Proyecto";
    pub const COMMITTEES: &str = "Comisiones";
    pub const STATUS: &str = "Estado";
    pub const PROBABILITY: &str = "Probabilidad";
    pub const PARTY: &str = "Partido Político";
    pub const PROVINCE: &str = "Provincia";
    pub const NOTES: &str = "Observaciones";

    pub const ALL: [&str; 12] = [
        ID,
        ORIGIN_CHAMBER,
        CASE_ID,
        AUTHOR,
        START_DATE,
        PROJECT_TEXT,
        COMMITTEES,
        STATUS,
        PROBABILITY,
        PARTY,
        PROVINCE,
        NOTES,
    ];
}

/// One bill as observed on the listing page during the current run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedRecord {
    pub origin_chamber: String,
    pub case_id: String,
    pub author: String,
    pub start_date: String,
    pub project_text: String,
    pub committees: String,
    pub party: String,
    pub province: String,
}

impl ScrapedRecord {
    /// A record where every scraped field carries the [`NO_DATA`] marker.
    pub fn no_data(origin_chamber: impl Into<String>) -> Self {
        Self {
            origin_chamber: origin_chamber.into(),
            case_id: NO_DATA.to_string(),
            author: NO_DATA.to_string(),
            start_date: NO_DATA.to_string(),
            project_text: NO_DATA.to_string(),
            committees: NO_DATA.to_string(),
            party: NO_DATA.to_string(),
            province: NO_DATA.to_string(),
        }
    }
}

/// One persisted bill row. `status`, `probability` and `notes` belong to the
/// sheet's human editors.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreRow {
    pub id: String,
    pub origin_chamber: String,
    pub case_id: String,
    pub author: String,
    pub start_date: String,
    pub project_text: String,
    pub committees: String,
    pub status: String,
    pub probability: String,
    pub party: String,
    pub province: String,
    pub notes: String,
}

impl StoreRow {
    /// Cells in sheet column order.
    pub fn to_cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.origin_chamber.clone(),
            self.case_id.clone(),
            self.author.clone(),
            self.start_date.clone(),
            self.project_text.clone(),
            self.committees.clone(),
            self.status.clone(),
            self.probability.clone(),
            self.party.clone(),
            self.province.clone(),
            self.notes.clone(),
        ]
    }
}

/// Raw tabular read of the store: a header row followed by data rows.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SheetTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SheetTable {
    /// Empty table carrying the standard header row.
    pub fn standard() -> Self {
        Self {
            headers: columns::ALL.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.trim() == name)
    }
}

/// Store contents as seen at the start of a run, decoded by header name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreSnapshot {
    pub rows: Vec<StoreRow>,
    pub has_id_column: bool,
    pub has_case_id_column: bool,
}

impl StoreSnapshot {
    pub fn from_rows(rows: Vec<StoreRow>) -> Self {
        Self {
            rows,
            has_id_column: true,
            has_case_id_column: true,
        }
    }

    pub fn from_table(table: &SheetTable) -> Self {
        let idx: Vec<Option<usize>> = columns::ALL
            .iter()
            .map(|name| table.column_index(name))
            .collect();
        let cell = |row: &[String], col: usize| -> String {
            idx[col]
                .and_then(|i| row.get(i))
                .cloned()
                .unwrap_or_default()
        };

        let rows = table
            .rows
            .iter()
            .map(|row| StoreRow {
                id: cell(row, 0),
                origin_chamber: cell(row, 1),
                case_id: cell(row, 2),
                author: cell(row, 3),
                start_date: cell(row, 4),
                project_text: cell(row, 5),
                committees: cell(row, 6),
                status: cell(row, 7),
                probability: cell(row, 8),
                party: cell(row, 9),
                province: cell(row, 10),
                notes: cell(row, 11),
            })
            .collect();

        Self {
            rows,
            has_id_column: idx[0].is_some(),
            has_case_id_column: idx[2].is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Existing identifiers, empty when the sheet has no `ID` column.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        let enabled = self.has_id_column;
        self.rows
            .iter()
            .filter(move |_| enabled)
            .map(|r| r.id.as_str())
    }
}

/// The two identifier layouts that have been written to the sheet over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdFormat {
    /// Bare integer, e.g. `42`.
    Plain,
    /// Prefix plus an integer zero-padded to at least three digits, e.g. `DIP-042`.
    #[default]
    Prefixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("empty identifier")]
    Empty,
    #[error("identifier {0:?} has the prefix but a non-numeric remainder")]
    BadPrefixedRemainder(String),
    #[error("identifier {0:?} is not numeric")]
    NotNumeric(String),
}

/// Numeric payload of an identifier plus the layout it was written in.
///
/// Ordering and equality only look at `value`, so plain and prefixed
/// identifiers compare by number.
#[derive(Debug, Clone, Copy)]
pub struct ParsedIdentifier {
    pub value: u64,
    pub format: IdFormat,
}

impl ParsedIdentifier {
    pub fn new(value: u64, format: IdFormat) -> Self {
        Self { value, format }
    }

    pub fn parse(raw: &str, prefix: &str) -> Result<Self, IdentifierError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(IdentifierError::Empty);
        }

        if let Some(rest) = raw.strip_prefix(prefix).filter(|_| !prefix.is_empty()) {
            if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
                return Err(IdentifierError::BadPrefixedRemainder(raw.to_string()));
            }
            return rest
                .parse::<u64>()
                .map(|value| Self::new(value, IdFormat::Prefixed))
                .map_err(|_| IdentifierError::BadPrefixedRemainder(raw.to_string()));
        }

        raw.parse::<u64>()
            .map(|value| Self::new(value, IdFormat::Plain))
            .map_err(|_| IdentifierError::NotNumeric(raw.to_string()))
    }

    /// Text form; prefixed values pad to three digits and never truncate.
    pub fn render(&self, prefix: &str) -> String {
        match self.format {
            IdFormat::Plain => self.value.to_string(),
            IdFormat::Prefixed => format!("{prefix}{:03}", self.value),
        }
    }
}

impl PartialEq for ParsedIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for ParsedIdentifier {}

impl PartialOrd for ParsedIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParsedIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl fmt::Display for ParsedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}
