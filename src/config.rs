//! Session settings.
//!
//! One JSON document, loaded and validated once per session and then shared
//! read-only (`Arc<Settings>`). Relative paths are resolved against the
//! directory holding the settings file.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::composer::{ButtonSpec, builtin_buttons};
use crate::error::{SlError, SlResult};
use crate::fsutil::atomic_write_bytes;
use crate::mapping::{
    ColumnMapping, ComputedValue, FieldType, MappingSet, SourceKind, SourceLocator,
};

pub const DEFAULT_SETTINGS_FILE: &str = "survey_log.json";
pub const DEFAULT_TEXT_SOURCE: &str = "Main TXT";
/// Text source key that disables text-file reading for a button.
pub const NO_TEXT_SOURCE: &str = "None";

fn default_log_sheet() -> String {
    "Log".to_owned()
}

fn default_table_name() -> String {
    "EventLog".to_owned()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".survey_log")
}

fn default_text_extension() -> String {
    ".txt".to_owned()
}

const fn default_true() -> bool {
    true
}

const fn default_lock_timeout_ms() -> u64 {
    5_000
}

const fn default_io_timeout_ms() -> u64 {
    60_000
}

fn default_kp_field() -> String {
    "KP".to_owned()
}

const fn default_folder_refresh_secs() -> u64 {
    5
}

const fn default_feed_poll_ms() -> u64 {
    1_000
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSourceSettings {
    pub folder: PathBuf,
    #[serde(default = "default_text_extension")]
    pub extension: String,
    #[serde(default)]
    pub has_header: bool,
    /// Button logged automatically whenever the feed receives a new line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_button: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredFolderSettings {
    pub folder: PathBuf,
    /// Empty matches any file.
    #[serde(default)]
    pub extension: String,
    /// Store column receiving the latest file name.
    pub column: String,
    #[serde(default)]
    pub skip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonSettings {
    pub id: String,
    /// Defaults to the id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_text: Option<String>,
    /// `"None"` disables text-file reading for this button.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_source: Option<String>,
    #[serde(default = "default_true")]
    pub include_folder_refs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoEventSettings {
    #[serde(default = "default_true")]
    pub new_day: bool,
    #[serde(default = "default_true")]
    pub hourly_kp: bool,
    #[serde(default = "default_kp_field")]
    pub kp_field: String,
    /// Periodic sync pass; `None` disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_interval_secs: Option<u64>,
    #[serde(default = "default_folder_refresh_secs")]
    pub folder_refresh_secs: u64,
    #[serde(default = "default_feed_poll_ms")]
    pub feed_poll_ms: u64,
}

impl Default for AutoEventSettings {
    fn default() -> Self {
        Self {
            new_day: true,
            hourly_kp: true,
            kp_field: default_kp_field(),
            sync_interval_secs: None,
            folder_refresh_secs: default_folder_refresh_secs(),
            feed_poll_ms: default_feed_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSettings {
    /// Write differing spreadsheet values into the database for matched
    /// GUIDs. When off, such divergence is raised as a conflict.
    #[serde(default = "default_true")]
    pub revise_from_spreadsheet: bool,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            revise_from_spreadsheet: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub workbook_path: PathBuf,
    #[serde(default = "default_log_sheet")]
    pub log_sheet: String,
    pub database_path: PathBuf,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub text_sources: BTreeMap<String, TextSourceSettings>,
    #[serde(default)]
    pub monitored_folders: BTreeMap<String, MonitoredFolderSettings>,
    #[serde(default)]
    pub mappings: Vec<ColumnMapping>,
    #[serde(default)]
    pub buttons: Vec<ButtonSettings>,
    #[serde(default)]
    pub auto_events: AutoEventSettings,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Deadline of a foreground sync pass; repairs left when it expires wait
    /// for the next pass.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
}

impl Settings {
    /// Starter settings rooted at `base`: one text feed, the standard survey
    /// field layout and the built-in buttons only.
    #[must_use]
    pub fn starter(base: &Path) -> Self {
        let mut text_sources = BTreeMap::new();
        text_sources.insert(
            DEFAULT_TEXT_SOURCE.to_owned(),
            TextSourceSettings {
                folder: base.join("nav"),
                extension: default_text_extension(),
                has_header: false,
                trigger_button: None,
            },
        );
        Self {
            workbook_path: base.join("survey_log.workbook.json"),
            log_sheet: default_log_sheet(),
            database_path: base.join("survey_log.sqlite3"),
            table_name: default_table_name(),
            state_dir: base.join(default_state_dir()),
            text_sources,
            monitored_folders: BTreeMap::new(),
            mappings: default_mappings(),
            buttons: Vec::new(),
            auto_events: AutoEventSettings::default(),
            lock_timeout_ms: default_lock_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            reconcile: ReconcileSettings::default(),
        }
    }

    pub fn load(path: &Path) -> SlResult<Self> {
        let text = fs::read_to_string(path).map_err(|error| {
            SlError::Config(format!("cannot read settings {}: {error}", path.display()))
        })?;
        let mut settings: Self = serde_json::from_str(&text).map_err(|error| {
            SlError::Config(format!("invalid settings {}: {error}", path.display()))
        })?;
        settings.resolve_relative(Self::path_base(path));
        settings.validate()?;
        tracing::info!(
            path = %path.display(),
            mappings = settings.mappings.len(),
            buttons = settings.buttons.len(),
            "settings loaded"
        );
        Ok(settings)
    }

    /// Directory that relative paths in the settings file at `config`
    /// resolve against.
    #[must_use]
    pub fn path_base(config: &Path) -> &Path {
        config
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    pub fn save(&self, path: &Path) -> SlResult<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        atomic_write_bytes(path, &bytes)
    }

    fn resolve_relative(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() && !base.as_os_str().is_empty() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.workbook_path);
        resolve(&mut self.database_path);
        resolve(&mut self.state_dir);
        for source in self.text_sources.values_mut() {
            resolve(&mut source.folder);
        }
        for folder in self.monitored_folders.values_mut() {
            resolve(&mut folder.folder);
        }
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("conflicts.json")
    }

    /// Configured mappings plus one latest-file mapping per monitored folder.
    #[must_use]
    pub fn effective_mappings(&self) -> Vec<ColumnMapping> {
        let mut mappings = self.mappings.clone();
        for (name, folder) in &self.monitored_folders {
            let mut mapping = ColumnMapping::new(
                folder.column.clone(),
                SourceKind::Computed,
                format!("latest_file:{name}"),
            );
            mapping.skip = folder.skip;
            mappings.push(mapping);
        }
        mappings
    }

    pub fn mapping_set(&self) -> SlResult<MappingSet> {
        MappingSet::new(self.effective_mappings())
    }

    /// Built-in buttons followed by the configured custom buttons.
    #[must_use]
    pub fn all_buttons(&self) -> Vec<ButtonSpec> {
        let mut buttons = builtin_buttons();
        buttons.extend(self.buttons.iter().map(ButtonSpec::from_settings));
        buttons
    }

    #[must_use]
    pub fn button(&self, id: &str) -> Option<ButtonSpec> {
        self.all_buttons()
            .into_iter()
            .find(|button| button.id.eq_ignore_ascii_case(id.trim()))
    }

    pub fn validate(&self) -> SlResult<()> {
        if self.table_name.trim().is_empty() {
            return Err(SlError::Config("table_name must not be empty".to_owned()));
        }
        if self.log_sheet.trim().is_empty() {
            return Err(SlError::Config("log_sheet must not be empty".to_owned()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(SlError::Config("lock_timeout_ms must be positive".to_owned()));
        }
        if self.auto_events.sync_interval_secs == Some(0) {
            return Err(SlError::Config(
                "auto_events.sync_interval_secs must be positive".to_owned(),
            ));
        }
        if self.text_sources.contains_key(NO_TEXT_SOURCE) {
            return Err(SlError::Config(format!(
                "`{NO_TEXT_SOURCE}` is reserved and cannot name a text source"
            )));
        }

        let set = self.mapping_set()?;
        for (mapping, locator) in set.iter() {
            match locator {
                SourceLocator::Column(_) => {
                    if let Some(source) = &mapping.text_source
                        && !self.text_sources.contains_key(source)
                    {
                        return Err(SlError::Config(format!(
                            "mapping `{}` reads text source `{source}` which has no folder configured",
                            mapping.field
                        )));
                    }
                }
                SourceLocator::Computed(ComputedValue::LatestFile(folder)) => {
                    if !self.monitored_folders.contains_key(folder) {
                        return Err(SlError::Config(format!(
                            "mapping `{}` references unknown monitored folder `{folder}`",
                            mapping.field
                        )));
                    }
                }
                SourceLocator::Computed(ComputedValue::TextFileName(Some(source))) => {
                    if !self.text_sources.contains_key(source) {
                        return Err(SlError::Config(format!(
                            "mapping `{}` references unknown text source `{source}`",
                            mapping.field
                        )));
                    }
                }
                _ => {}
            }
        }

        let mut ids = HashSet::new();
        for button in self.all_buttons() {
            if button.id.trim().is_empty() {
                return Err(SlError::Config("button with empty id".to_owned()));
            }
            if !ids.insert(button.id.to_ascii_lowercase()) {
                return Err(SlError::Config(format!(
                    "duplicate button id `{}`",
                    button.id
                )));
            }
            if let Some(source) = &button.text_source
                && !self.text_sources.contains_key(source)
                && !button.builtin
            {
                return Err(SlError::Config(format!(
                    "button `{}` reads text source `{source}` which has no folder configured",
                    button.id
                )));
            }
            for folder in &button.force_folders {
                if !self.monitored_folders.contains_key(folder) && !button.builtin {
                    return Err(SlError::Config(format!(
                        "button `{}` requires monitored folder `{folder}`",
                        button.id
                    )));
                }
            }
        }

        for (key, source) in &self.text_sources {
            if let Some(trigger) = &source.trigger_button
                && !ids.contains(&trigger.to_ascii_lowercase())
            {
                return Err(SlError::Config(format!(
                    "text source `{key}` triggers unknown button `{trigger}`"
                )));
            }
        }

        if self.auto_events.hourly_kp {
            match set.get(&self.auto_events.kp_field) {
                Some(mapping) if mapping.field_type != FieldType::Timestamp => {}
                _ => {
                    return Err(SlError::Config(format!(
                        "hourly KP logging needs a `{}` mapping",
                        self.auto_events.kp_field
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Standard survey layout: host date and time, then navigation columns read
/// by position from the text feed. Positions 0 and 1 hold the feed's own
/// date and time, which are never used for the log timestamp.
#[must_use]
pub fn default_mappings() -> Vec<ColumnMapping> {
    let mut mappings = vec![
        ColumnMapping::new("Date", SourceKind::Computed, "host_date"),
        ColumnMapping::new("Time", SourceKind::Computed, "host_time"),
    ];
    let text_columns = [
        ("KP", FieldType::Number),
        ("DCC", FieldType::Number),
        ("Line name", FieldType::Text),
        ("Latitude", FieldType::Text),
        ("Longitude", FieldType::Text),
        ("Easting", FieldType::Number),
        ("Northing", FieldType::Number),
    ];
    for (offset, (name, field_type)) in text_columns.into_iter().enumerate() {
        mappings.push(
            ColumnMapping::new(name, SourceKind::TextFileColumn, (offset + 2).to_string())
                .typed(field_type),
        );
    }
    mappings
}
