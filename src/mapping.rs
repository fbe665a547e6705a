//! Column mappings: user-defined bindings from a logical field name to the
//! place its value comes from.

use std::collections::HashSet;
use std::fmt;

use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};

use crate::error::{SlError, SlResult};
use crate::model::is_standard_column;
use crate::workbook::CellRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    TextFileColumn,
    SpreadsheetCell,
    StaticValue,
    Computed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Text,
    Number,
    Timestamp,
}

impl FieldType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Timestamp => "timestamp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "arg", rename_all = "snake_case")]
pub enum ValueTransform {
    Trim,
    Uppercase,
    /// Render a number with a fixed count of decimals, e.g. KP to metres.
    FixedDecimals(u8),
    /// Render a timestamp with a chrono format string.
    TimestampFormat(String),
}

/// Column selector within a text-file row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    Index(usize),
    Header(String),
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(idx) => write!(f, "column {idx}"),
            Self::Header(name) => write!(f, "column `{name}`"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputedValue {
    HostDate,
    HostTime,
    HostTimestamp,
    /// Latest file name in a monitored folder.
    LatestFile(String),
    /// Name of the text file a row was read from. `None` means the
    /// trigger's own text source.
    TextFileName(Option<String>),
}

impl ComputedValue {
    pub fn parse(text: &str) -> SlResult<Self> {
        let trimmed = text.trim();
        let (name, arg) = match trimmed.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (trimmed, None),
        };
        match (name.to_ascii_lowercase().as_str(), arg) {
            ("host_date", None) => Ok(Self::HostDate),
            ("host_time", None) => Ok(Self::HostTime),
            ("host_timestamp", None) => Ok(Self::HostTimestamp),
            ("text_file_name", None) => Ok(Self::TextFileName(None)),
            ("text_file_name", Some(source)) if !source.is_empty() => {
                Ok(Self::TextFileName(Some(source.to_owned())))
            }
            ("latest_file", Some(folder)) if !folder.is_empty() => {
                Ok(Self::LatestFile(folder.to_owned()))
            }
            _ => Err(SlError::Config(format!(
                "unknown computed value `{trimmed}`; expected host_date, host_time, \
                 host_timestamp, text_file_name[:<source>] or latest_file:<folder>"
            ))),
        }
    }
}

/// Parsed form of a mapping's locator string.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceLocator {
    Column(ColumnRef),
    Cell(CellRef),
    Static(String),
    Computed(ComputedValue),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub field: String,
    pub source: SourceKind,
    pub locator: String,
    #[serde(default)]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<ValueTransform>,
    /// Kept in the set but not evaluated.
    #[serde(default)]
    pub skip: bool,
    /// Pins a text-file column to one text source. Unpinned columns read the
    /// source selected by the trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_source: Option<String>,
}

impl ColumnMapping {
    #[must_use]
    pub fn new(field: impl Into<String>, source: SourceKind, locator: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            source,
            locator: locator.into(),
            field_type: FieldType::Text,
            transform: None,
            skip: false,
            text_source: None,
        }
    }

    #[must_use]
    pub fn typed(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    #[must_use]
    pub fn with_transform(mut self, transform: ValueTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    #[must_use]
    pub fn pinned_to(mut self, text_source: impl Into<String>) -> Self {
        self.text_source = Some(text_source.into());
        self
    }

    /// Build a mapping from the `SOURCE,LOCATOR` expression syntax:
    /// `=SHEET2,F4` reads a cell, `=STATIC,WROV` is a literal,
    /// `=COMPUTED,host_date` a computed value, and a bare column name or
    /// index reads the monitored text file.
    pub fn from_expression(field: impl Into<String>, expression: &str) -> SlResult<Self> {
        let field = field.into();
        let trimmed = expression.trim();
        let Some(rest) = trimmed.strip_prefix('=') else {
            let mapping = Self::new(field, SourceKind::TextFileColumn, trimmed);
            mapping.parse_locator()?;
            return Ok(mapping);
        };
        let (source, locator) = rest.split_once(',').ok_or_else(|| {
            SlError::Config(format!(
                "mapping `{field}`: expression `{expression}` must be `=SOURCE,LOCATOR`"
            ))
        })?;
        let source = source.trim();
        let locator = locator.trim();
        let mapping = if source.eq_ignore_ascii_case("static") {
            Self::new(field, SourceKind::StaticValue, locator)
        } else if source.eq_ignore_ascii_case("computed") {
            Self::new(field, SourceKind::Computed, locator)
        } else {
            Self::new(field, SourceKind::SpreadsheetCell, format!("{source}!{locator}"))
        };
        mapping.parse_locator()?;
        Ok(mapping)
    }

    pub fn parse_locator(&self) -> SlResult<SourceLocator> {
        let wrap = |error: SlError| match error {
            SlError::Config(message) => SlError::Config(format!("mapping `{}`: {message}", self.field)),
            other => other,
        };
        match self.source {
            SourceKind::TextFileColumn => {
                let locator = self.locator.trim();
                if locator.is_empty() {
                    return Err(SlError::Config(format!(
                        "mapping `{}`: text column locator is empty",
                        self.field
                    )));
                }
                Ok(SourceLocator::Column(match locator.parse::<usize>() {
                    Ok(idx) => ColumnRef::Index(idx),
                    Err(_) => ColumnRef::Header(locator.to_owned()),
                }))
            }
            SourceKind::SpreadsheetCell => CellRef::parse(&self.locator)
                .map(SourceLocator::Cell)
                .map_err(wrap),
            SourceKind::StaticValue => Ok(SourceLocator::Static(self.locator.clone())),
            SourceKind::Computed => ComputedValue::parse(&self.locator)
                .map(SourceLocator::Computed)
                .map_err(wrap),
        }
    }
}

/// A validated mapping set. Field names are unique case-insensitively because
/// both stores match column names without regard to case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingSet {
    entries: Vec<(ColumnMapping, SourceLocator)>,
}

impl MappingSet {
    pub fn new(mappings: Vec<ColumnMapping>) -> SlResult<Self> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let name = mapping.field.trim();
            if name.is_empty() {
                return Err(SlError::Config("mapping with empty field name".to_owned()));
            }
            if is_standard_column(name) {
                return Err(SlError::Config(format!(
                    "mapping `{name}` collides with a reserved store column"
                )));
            }
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(SlError::Config(format!(
                    "duplicate mapping for field `{name}`"
                )));
            }
            if let Some(transform) = &mapping.transform {
                validate_transform(&mapping, transform)?;
            }
            let locator = mapping.parse_locator()?;
            entries.push((mapping, locator));
        }
        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ColumnMapping, &SourceLocator)> {
        self.entries.iter().map(|(mapping, locator)| (mapping, locator))
    }

    /// Mappings that are evaluated at event time.
    pub fn active(&self) -> impl Iterator<Item = (&ColumnMapping, &SourceLocator)> {
        self.iter().filter(|(mapping, _)| !mapping.skip)
    }

    /// Every field name, in configuration order, including skipped ones:
    /// stores keep a column for each.
    #[must_use]
    pub fn field_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(mapping, _)| mapping.field.trim().to_owned())
            .collect()
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&ColumnMapping> {
        self.entries
            .iter()
            .map(|(mapping, _)| mapping)
            .find(|mapping| mapping.field.trim().eq_ignore_ascii_case(field))
    }

    #[must_use]
    pub fn uses_spreadsheet_cells(&self) -> bool {
        self.active()
            .any(|(_, locator)| matches!(locator, SourceLocator::Cell(_)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_transform(mapping: &ColumnMapping, transform: &ValueTransform) -> SlResult<()> {
    let ok = match transform {
        ValueTransform::Trim | ValueTransform::Uppercase => true,
        ValueTransform::FixedDecimals(_) => mapping.field_type == FieldType::Number,
        ValueTransform::TimestampFormat(format) => {
            mapping.field_type == FieldType::Timestamp
                && !format.trim().is_empty()
                && !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
        }
    };
    if ok {
        Ok(())
    } else {
        Err(SlError::Config(format!(
            "mapping `{}`: transform {transform:?} does not apply to {} fields",
            mapping.field,
            mapping.field_type.as_str()
        )))
    }
}
