//! Field resolution: one mapping plus a resolution context in, one typed
//! value out. Resolution reads but never writes, so it is safe to retry.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, SecondsFormat};

use crate::error::{SlError, SlResult};
use crate::mapping::{ColumnMapping, ComputedValue, FieldType, SourceLocator, ValueTransform};
use crate::model::FieldValue;
use crate::textsource::{FolderCache, NO_FILE_MARKER, TextRow};
use crate::workbook::{CellRead, CellSource};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of the log timestamp. Events are stamped by the host clock only.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// Settable clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl FixedClock {
    #[must_use]
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<FixedOffset>) {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a mapping may read, sampled once per event.
#[derive(Clone, Copy)]
pub struct ResolutionContext<'a> {
    /// Latest complete row per text source key.
    pub rows: &'a BTreeMap<String, TextRow>,
    /// Text source selected by the trigger, used by unpinned text columns.
    pub trigger_source: Option<&'a str>,
    pub cells: Option<&'a dyn CellSource>,
    pub folders: Option<&'a FolderCache>,
    pub now: DateTime<FixedOffset>,
}

impl std::fmt::Debug for ResolutionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionContext")
            .field("rows", &self.rows.keys().collect::<Vec<_>>())
            .field("trigger_source", &self.trigger_source)
            .field("cells", &self.cells.is_some())
            .field("now", &self.now)
            .finish_non_exhaustive()
    }
}

impl ResolutionContext<'_> {
    /// Text source a text-column mapping reads: its pinned source, else the
    /// trigger's.
    #[must_use]
    pub fn text_source_for<'m>(&'m self, mapping: &'m ColumnMapping) -> Option<&'m str> {
        mapping.text_source.as_deref().or(self.trigger_source)
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

pub fn resolve(
    mapping: &ColumnMapping,
    locator: &SourceLocator,
    ctx: &ResolutionContext<'_>,
) -> SlResult<FieldValue> {
    let Some(raw) = raw_text(mapping, locator, ctx)? else {
        return Ok(FieldValue::Absent);
    };
    if raw.trim().is_empty() {
        return Ok(FieldValue::Absent);
    }
    let value = coerce(mapping, &raw)?;
    Ok(match &mapping.transform {
        Some(transform) => apply_transform(transform, value),
        None => value,
    })
}

fn unresolved(mapping: &ColumnMapping, detail: impl Into<String>) -> SlError {
    SlError::UnresolvedSource {
        field: mapping.field.clone(),
        detail: detail.into(),
    }
}

fn text_row<'a>(
    mapping: &ColumnMapping,
    source: Option<&str>,
    ctx: &ResolutionContext<'a>,
) -> SlResult<&'a TextRow> {
    let source = source.ok_or_else(|| unresolved(mapping, "no text source selected"))?;
    ctx.rows
        .get(source)
        .ok_or_else(|| unresolved(mapping, format!("text source `{source}` has no complete row")))
}

fn raw_text(
    mapping: &ColumnMapping,
    locator: &SourceLocator,
    ctx: &ResolutionContext<'_>,
) -> SlResult<Option<String>> {
    match locator {
        SourceLocator::Column(column) => {
            let row = text_row(mapping, ctx.text_source_for(mapping), ctx)?;
            row.column(column).map(|value| Some(value.to_owned())).ok_or_else(|| {
                unresolved(
                    mapping,
                    format!(
                        "{column} not present in latest row of {} ({} values)",
                        row.file_name(),
                        row.values.len()
                    ),
                )
            })
        }
        SourceLocator::Cell(cell) => {
            let source = ctx
                .cells
                .ok_or_else(|| unresolved(mapping, "workbook is not available"))?;
            match source.read_cell(cell)? {
                CellRead::Value(value) => Ok(Some(value)),
                CellRead::Empty => Ok(None),
                CellRead::NoSuchSheet => Err(unresolved(
                    mapping,
                    format!("sheet `{}` does not exist", cell.sheet),
                )),
            }
        }
        SourceLocator::Static(value) => Ok(Some(value.clone())),
        SourceLocator::Computed(computed) => computed_text(mapping, computed, ctx).map(Some),
    }
}

fn computed_text(
    mapping: &ColumnMapping,
    computed: &ComputedValue,
    ctx: &ResolutionContext<'_>,
) -> SlResult<String> {
    match computed {
        ComputedValue::HostDate => Ok(ctx.now.format("%Y-%m-%d").to_string()),
        ComputedValue::HostTime => Ok(ctx.now.format("%H:%M:%S").to_string()),
        ComputedValue::HostTimestamp => Ok(ctx.now.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ComputedValue::LatestFile(folder) => {
            let folders = ctx
                .folders
                .ok_or_else(|| unresolved(mapping, "monitored folders are not available"))?;
            let latest = folders
                .latest_name(folder)
                .map_err(|error| unresolved(mapping, error.to_string()))?;
            Ok(latest.unwrap_or_else(|| NO_FILE_MARKER.to_owned()))
        }
        ComputedValue::TextFileName(source) => {
            let source = source.as_deref().or(ctx.trigger_source);
            text_row(mapping, source, ctx).map(TextRow::file_name)
        }
    }
}

const TIMESTAMP_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
];

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.naive_local());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

fn coerce(mapping: &ColumnMapping, raw: &str) -> SlResult<FieldValue> {
    let mismatch = || SlError::TypeMismatch {
        field: mapping.field.clone(),
        expected: mapping.field_type.as_str().to_owned(),
        found: raw.to_owned(),
    };
    match mapping.field_type {
        FieldType::Text => Ok(FieldValue::Text(raw.to_owned())),
        FieldType::Number => FieldValue::parse_number(raw).ok_or_else(mismatch),
        FieldType::Timestamp => parse_timestamp(raw.trim())
            .map(FieldValue::Timestamp)
            .ok_or_else(mismatch),
    }
}

fn apply_transform(transform: &ValueTransform, value: FieldValue) -> FieldValue {
    match (transform, value) {
        (ValueTransform::Trim, FieldValue::Text(text)) => FieldValue::Text(text.trim().to_owned()),
        (ValueTransform::Uppercase, FieldValue::Text(text)) => FieldValue::Text(text.to_uppercase()),
        (ValueTransform::FixedDecimals(places), FieldValue::Number { value, .. }) => {
            FieldValue::Text(format!("{value:.prec$}", prec = usize::from(*places)))
        }
        (ValueTransform::TimestampFormat(format), FieldValue::Timestamp(ts)) => {
            FieldValue::Text(ts.format(format).to_string())
        }
        (_, value) => value,
    }
}
