use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SlError, SlResult};
use crate::fsutil::sha256_hex;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Globally unique identifier of one logical event. Join key between stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(Uuid);

impl Guid {
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse a stored GUID cell. Blank or malformed text yields `None`.
    #[must_use]
    pub fn from_stored(text: Option<&str>) -> Option<Self> {
        let trimmed = text?.trim();
        if trimmed.is_empty() {
            return None;
        }
        Uuid::parse_str(trimmed).ok().map(Self)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for Guid {
    type Err = SlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|error| SlError::InvalidRequest(format!("invalid guid `{s}`: {error}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Database,
    Spreadsheet,
}

impl StoreKind {
    pub const ALL: [Self; 2] = [Self::Database, Self::Spreadsheet];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Spreadsheet => "spreadsheet",
        }
    }

    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Database => Self::Spreadsheet,
            Self::Spreadsheet => Self::Database,
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of one stored record: the 1-based sheet row for the spreadsheet,
/// the SQLite rowid for the database.
pub type RowRef = u64;

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

pub const TIMESTAMP_DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    /// `text` is the source spelling, written to the stores unchanged.
    Number { value: f64, text: String },
    Timestamp(NaiveDateTime),
    Absent,
}

impl FieldValue {
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Numeric value of `text`, keeping its spelling. `None` when the text
    /// is not a finite number.
    #[must_use]
    pub fn parse_number(text: &str) -> Option<Self> {
        let text = text.trim();
        text.parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .map(|value| Self::Number {
                value,
                text: text.to_owned(),
            })
    }

    #[must_use]
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Text form written to both stores. `None` means an empty cell / NULL.
    #[must_use]
    pub fn to_store_text(&self) -> Option<String> {
        match self {
            Self::Text(text) if text.is_empty() => None,
            Self::Text(text) => Some(text.clone()),
            Self::Number { text, .. } => Some(text.clone()),
            Self::Timestamp(ts) => Some(ts.format(TIMESTAMP_DISPLAY_FORMAT).to_string()),
            Self::Absent => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventField {
    pub name: String,
    pub value: FieldValue,
}

/// A field that could not be resolved when the event was composed. The field
/// itself is stored as absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFailure {
    pub field: String,
    pub error_code: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub guid: Guid,
    /// Host-clock time of composition. Never taken from monitored files.
    pub log_timestamp: DateTime<FixedOffset>,
    pub event_type: String,
    pub event_text: String,
    pub fields: Vec<EventField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_color: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FieldFailure>,
}

impl Event {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case(name))
            .map(|field| &field.value)
    }

    #[must_use]
    pub fn log_timestamp_text(&self) -> String {
        format_log_timestamp(&self.log_timestamp)
    }

    /// Store-neutral projection written by both adapters.
    #[must_use]
    pub fn to_body(&self) -> RecordBody {
        let fields = self
            .fields
            .iter()
            .filter_map(|field| {
                field
                    .value
                    .to_store_text()
                    .map(|text| (field.name.clone(), text))
            })
            .collect();
        RecordBody {
            guid: Some(self.guid),
            log_timestamp: self.log_timestamp_text(),
            event_type: self.event_type.clone(),
            event_text: self.event_text.clone(),
            fields,
            row_color: self.row_color.clone(),
        }
    }
}

#[must_use]
pub fn format_log_timestamp(ts: &DateTime<FixedOffset>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ---------------------------------------------------------------------------
// Store records
// ---------------------------------------------------------------------------

/// Content of a stored row independent of where it lives. Absent values are
/// omitted from `fields`, so a blank cell and a NULL column compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordBody {
    pub guid: Option<Guid>,
    pub log_timestamp: String,
    pub event_type: String,
    pub event_text: String,
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_color: Option<String>,
}

impl RecordBody {
    #[must_use]
    pub fn with_guid(&self, guid: Guid) -> Self {
        Self {
            guid: Some(guid),
            ..self.clone()
        }
    }

    /// SHA-256 over the identity-free content. Copies of one event share a
    /// fingerprint in both stores; GUID and row colour are excluded.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::json!({
            "log_timestamp": self.log_timestamp,
            "event_type": self.event_type,
            "event_text": self.event_text,
            "fields": self.fields,
        });
        sha256_hex(canonical.to_string().as_bytes())
    }

    /// Fields (plus `EventType` / `EventText`) whose value in `self` differs
    /// from `other`, as a patch that turns `other` into `self`.
    #[must_use]
    pub fn patch_against(&self, other: &Self) -> FieldPatch {
        let mut patch = FieldPatch::new();
        if self.event_type != other.event_type {
            patch.insert(
                EVENT_TYPE_COLUMN.to_owned(),
                non_empty(self.event_type.clone()),
            );
        }
        if self.event_text != other.event_text {
            patch.insert(
                EVENT_TEXT_COLUMN.to_owned(),
                non_empty(self.event_text.clone()),
            );
        }
        let names: BTreeSet<&String> = self.fields.keys().chain(other.fields.keys()).collect();
        for name in names {
            let mine = self.fields.get(name);
            if mine != other.fields.get(name) {
                patch.insert(name.clone(), mine.cloned());
            }
        }
        patch
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() { None } else { Some(text) }
}

/// Column name → new value (`None` clears the cell).
pub type FieldPatch = BTreeMap<String, Option<String>>;

pub const GUID_COLUMN: &str = "RecordID";
pub const LOG_TIMESTAMP_COLUMN: &str = "LogTimestamp";
pub const EVENT_TYPE_COLUMN: &str = "EventType";
pub const EVENT_TEXT_COLUMN: &str = "EventText";
pub const ROW_COLOR_COLUMN: &str = "RowColor";

/// Columns every store carries in addition to the mapped fields.
pub const STANDARD_COLUMNS: [&str; 4] = [
    GUID_COLUMN,
    LOG_TIMESTAMP_COLUMN,
    EVENT_TYPE_COLUMN,
    EVENT_TEXT_COLUMN,
];

#[must_use]
pub fn is_standard_column(name: &str) -> bool {
    STANDARD_COLUMNS
        .iter()
        .any(|column| column.eq_ignore_ascii_case(name))
        || ROW_COLOR_COLUMN.eq_ignore_ascii_case(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub store: StoreKind,
    pub row: RowRef,
    pub body: RecordBody,
}

impl StoreRecord {
    #[must_use]
    pub const fn guid(&self) -> Option<Guid> {
        self.body.guid
    }
}

// ---------------------------------------------------------------------------
// Census / reconciliation
// ---------------------------------------------------------------------------

/// `list_guids()` result of one store: occurrence count per GUID plus rows
/// whose GUID cell is blank or malformed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidCensus {
    pub counts: BTreeMap<Guid, usize>,
    pub missing: Vec<RowRef>,
}

impl GuidCensus {
    pub fn record(&mut self, guid: Option<Guid>, row: RowRef) {
        match guid {
            Some(guid) => *self.counts.entry(guid).or_insert(0) += 1,
            None => self.missing.push(row),
        }
    }

    #[must_use]
    pub fn guids(&self) -> BTreeSet<Guid> {
        self.counts.keys().copied().collect()
    }

    #[must_use]
    pub fn count(&self, guid: &Guid) -> usize {
        self.counts.get(guid).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn duplicates(&self) -> BTreeMap<Guid, usize> {
        self.counts
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(guid, count)| (*guid, *count))
            .collect()
    }

    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.counts.values().sum::<usize>() + self.missing.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateCounts {
    pub database: usize,
    pub spreadsheet: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingGuidRow {
    pub store: StoreKind,
    pub row: RowRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    /// Only operator-editable columns differ; repairable by revision.
    Fields,
    /// The authoritative log timestamp differs; needs an operator decision.
    Timestamp,
}

/// Ephemeral result of one sync pass. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub matched: BTreeSet<Guid>,
    pub only_in_spreadsheet: BTreeSet<Guid>,
    pub only_in_database: BTreeSet<Guid>,
    pub duplicates: BTreeMap<Guid, DuplicateCounts>,
    pub missing_guid: Vec<MissingGuidRow>,
    pub diverged: BTreeMap<Guid, DivergenceKind>,
}

impl ReconciliationReport {
    #[must_use]
    pub fn orphan_count(&self) -> usize {
        self.only_in_database.len() + self.only_in_spreadsheet.len()
    }

    #[must_use]
    pub fn needs_repair(&self) -> bool {
        self.orphan_count() > 0
            || !self.missing_guid.is_empty()
            || self
                .diverged
                .values()
                .any(|kind| *kind == DivergenceKind::Fields)
    }

    #[must_use]
    pub fn is_consistent(&self) -> bool {
        !self.needs_repair() && self.duplicates.is_empty() && self.diverged.is_empty()
    }
}
