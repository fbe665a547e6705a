//! Logging session: composes events and writes them to both stores.
//!
//! The database is written first and the spreadsheet second. Each write is
//! attempted regardless of the other's outcome; when exactly one fails the
//! event still counts as logged and the session degrades to
//! single-store-authoritative until the next clean sync pass.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::composer::{EventComposer, HOURLY_KP, NEW_DAY, Trigger, hourly_kp_text, parse_hourly_kp};
use crate::config::Settings;
use crate::conflict::{ConflictLedger, ConflictResolver};
use crate::error::{SlError, SlResult};
use crate::mapping::{MappingSet, SourceLocator};
use crate::model::{Event, FieldValue, RowRef, StoreKind};
use crate::resolver::{Clock, ResolutionContext, SystemClock};
use crate::store::{DatabaseStore, SharedStore, SpreadsheetStore};
use crate::sync::{Reconciler, SyncOptions, SyncSummary};
use crate::textsource::{FolderCache, TextRow, read_source};
use crate::workbook::{CellSource, Workbook};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionHealth {
    Consistent,
    /// Only `store` holds every event logged since `since_rfc3339`.
    SingleStoreAuthoritative {
        store: StoreKind,
        since_rfc3339: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StoreWrite {
    Written { row: RowRef },
    Failed { error_code: String, message: String },
}

impl StoreWrite {
    fn from_result(result: &SlResult<RowRef>) -> Self {
        match result {
            Ok(row) => Self::Written { row: *row },
            Err(error) => Self::Failed {
                error_code: error.error_code().to_owned(),
                message: error.to_string(),
            },
        }
    }

    #[must_use]
    pub const fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogOutcome {
    pub event: Event,
    pub database: StoreWrite,
    pub spreadsheet: StoreWrite,
}

pub struct LoggingSession {
    settings: Arc<Settings>,
    mappings: MappingSet,
    database: SharedStore,
    spreadsheet: SharedStore,
    clock: Arc<dyn Clock>,
    folders: FolderCache,
    health: Mutex<SessionHealth>,
}

impl std::fmt::Debug for LoggingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingSession")
            .field("database", &self.database)
            .field("spreadsheet", &self.spreadsheet)
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

impl LoggingSession {
    pub fn open(settings: Settings) -> SlResult<Self> {
        Self::open_with_clock(settings, Arc::new(SystemClock))
    }

    pub fn open_with_clock(settings: Settings, clock: Arc<dyn Clock>) -> SlResult<Self> {
        let fields = settings.mapping_set()?.field_names();
        let database = DatabaseStore::open(&settings.database_path, &settings.table_name, &fields)?;
        let spreadsheet =
            SpreadsheetStore::open(&settings.workbook_path, &settings.log_sheet, &fields)?;
        let timeout = settings.lock_timeout();
        Self::with_stores(
            Arc::new(settings),
            SharedStore::new(database, timeout),
            SharedStore::new(spreadsheet, timeout),
            clock,
        )
    }

    /// Session over already opened stores.
    pub fn with_stores(
        settings: Arc<Settings>,
        database: SharedStore,
        spreadsheet: SharedStore,
        clock: Arc<dyn Clock>,
    ) -> SlResult<Self> {
        let mappings = settings.mapping_set()?;
        let folders = FolderCache::new(settings.monitored_folders.clone());
        tracing::info!(
            database = %settings.database_path.display(),
            workbook = %settings.workbook_path.display(),
            fields = mappings.len(),
            "logging session opened"
        );
        Ok(Self {
            settings,
            mappings,
            database,
            spreadsheet,
            clock,
            folders,
            health: Mutex::new(SessionHealth::Consistent),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub const fn mappings(&self) -> &MappingSet {
        &self.mappings
    }

    #[must_use]
    pub const fn database(&self) -> &SharedStore {
        &self.database
    }

    #[must_use]
    pub const fn spreadsheet(&self) -> &SharedStore {
        &self.spreadsheet
    }

    #[must_use]
    pub const fn folders(&self) -> &FolderCache {
        &self.folders
    }

    /// Current host time as seen by this session's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<FixedOffset> {
        self.clock.now()
    }

    fn health_guard(&self) -> MutexGuard<'_, SessionHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn health(&self) -> SessionHealth {
        self.health_guard().clone()
    }

    pub fn mark_synced(&self) {
        let mut health = self.health_guard();
        if *health != SessionHealth::Consistent {
            tracing::info!("both stores consistent again");
            *health = SessionHealth::Consistent;
        }
    }

    fn degrade(&self, store: StoreKind, reason: String) {
        let mut health = self.health_guard();
        if let SessionHealth::SingleStoreAuthoritative { store: current, .. } = &*health
            && *current == store
        {
            return;
        }
        tracing::warn!(authoritative = %store, %reason, "session degraded to single-store logging");
        *health = SessionHealth::SingleStoreAuthoritative {
            store,
            since_rfc3339: Utc::now().to_rfc3339(),
            reason,
        };
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    /// Log one press of button `id`; `text` replaces its configured text.
    pub fn log_button(&self, id: &str, text: Option<String>) -> SlResult<LogOutcome> {
        if id.trim().eq_ignore_ascii_case(HOURLY_KP) {
            return self.hourly_kp()?.ok_or_else(|| SlError::UnresolvedSource {
                field: self.settings.auto_events.kp_field.clone(),
                detail: "no numeric KP available for the hourly log".to_owned(),
            });
        }
        let button = self
            .settings
            .button(id)
            .ok_or_else(|| SlError::InvalidRequest(format!("unknown button `{id}`")))?;
        let event = self.compose(&button.trigger(text))?;
        self.write(event)
    }

    pub fn new_day(&self) -> SlResult<LogOutcome> {
        self.log_button(NEW_DAY, None)
    }

    /// Hourly progress event. `None` when the KP cannot be read as a number;
    /// nothing is written then.
    pub fn hourly_kp(&self) -> SlResult<Option<LogOutcome>> {
        let button = self
            .settings
            .button(HOURLY_KP)
            .ok_or_else(|| SlError::Config(format!("button `{HOURLY_KP}` is missing")))?;
        let mut event = self.compose(&button.trigger(None))?;
        let kp_field = &self.settings.auto_events.kp_field;
        let current = match event.field(kp_field) {
            Some(FieldValue::Number { value, .. }) => *value,
            Some(FieldValue::Text(text)) => match text.trim().parse::<f64>() {
                Ok(value) if value.is_finite() => value,
                _ => {
                    tracing::warn!(field = %kp_field, value = %text, "hourly KP skipped: not numeric");
                    return Ok(None);
                }
            },
            _ => {
                tracing::warn!(field = %kp_field, "hourly KP skipped: no KP value");
                return Ok(None);
            }
        };
        let previous = self.previous_hourly_kp()?;
        event.event_text = hourly_kp_text(current, previous);
        self.write(event).map(Some)
    }

    /// KP of the most recent hourly event in the spreadsheet.
    fn previous_hourly_kp(&self) -> SlResult<Option<f64>> {
        let records = self.spreadsheet.with(|store| store.all_records())?;
        Ok(records
            .iter()
            .rev()
            .filter(|record| record.body.event_type.eq_ignore_ascii_case(HOURLY_KP))
            .find_map(|record| parse_hourly_kp(&record.body.event_text)))
    }

    /// Log the button bound to text source `key`, if any.
    pub fn feed_trigger(&self, key: &str) -> SlResult<Option<LogOutcome>> {
        let Some(button) = self
            .settings
            .text_sources
            .get(key)
            .and_then(|source| source.trigger_button.clone())
        else {
            return Ok(None);
        };
        tracing::debug!(source = key, button = %button, "text feed triggered event");
        self.log_button(&button, None).map(Some)
    }

    /// Resolve every mapping for `trigger` against freshly read sources.
    pub fn compose(&self, trigger: &Trigger) -> SlResult<Event> {
        let now = self.clock.now();
        let rows = self.read_text_rows(trigger)?;
        let workbook = if self.mappings.uses_spreadsheet_cells() {
            match Workbook::open(&self.settings.workbook_path) {
                Ok(workbook) => Some(workbook),
                Err(error) => {
                    tracing::warn!(%error, "workbook unreadable; cell mappings left empty");
                    None
                }
            }
        } else {
            None
        };
        let ctx = ResolutionContext {
            rows: &rows,
            trigger_source: trigger.text_source.as_deref(),
            cells: workbook.as_ref().map(|workbook| workbook as &dyn CellSource),
            folders: Some(&self.folders),
            now,
        };
        let event = EventComposer::new(&self.mappings).compose(trigger, &ctx)?;
        tracing::debug!(
            guid = %event.guid,
            button = %trigger.button_id,
            failures = event.failures.len(),
            "event composed"
        );
        Ok(event)
    }

    /// Latest complete row of the trigger's text source and of every source
    /// an active mapping is pinned to.
    fn read_text_rows(&self, trigger: &Trigger) -> SlResult<BTreeMap<String, TextRow>> {
        let mut keys: Vec<&str> = trigger.text_source.as_deref().into_iter().collect();
        for (mapping, locator) in self.mappings.active() {
            if let (SourceLocator::Column(_), Some(pinned)) = (locator, mapping.text_source.as_deref())
                && !keys.contains(&pinned)
            {
                keys.push(pinned);
            }
        }

        let mut rows = BTreeMap::new();
        for key in keys {
            let source = self.settings.text_sources.get(key).ok_or_else(|| {
                SlError::Config(format!("text source `{key}` has no folder configured"))
            })?;
            match read_source(key, source) {
                Ok(Some(row)) => {
                    rows.insert(key.to_owned(), row);
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(source = key, %error, "text source unreadable");
                }
            }
        }
        Ok(rows)
    }

    /// Write `event` to the database, then the spreadsheet.
    pub fn write(&self, event: Event) -> SlResult<LogOutcome> {
        let database = self.database.with(|store| store.append(&event));
        let spreadsheet = self.spreadsheet.with(|store| store.append(&event));

        match (&database, &spreadsheet) {
            (Err(db_error), Err(ss_error)) => {
                tracing::error!(
                    guid = %event.guid,
                    database = %db_error,
                    spreadsheet = %ss_error,
                    "event not logged: both stores failed"
                );
                return Err(SlError::StoreWriteFailure {
                    store: "database and spreadsheet".to_owned(),
                    detail: format!("{db_error}; {ss_error}"),
                });
            }
            (Ok(_), Err(error)) => {
                tracing::warn!(guid = %event.guid, code = error.error_code(), %error, "spreadsheet write failed");
                self.degrade(StoreKind::Database, SlError::store_write("spreadsheet", error).to_string());
            }
            (Err(error), Ok(_)) => {
                tracing::warn!(guid = %event.guid, code = error.error_code(), %error, "database write failed");
                self.degrade(StoreKind::Spreadsheet, SlError::store_write("database", error).to_string());
            }
            (Ok(_), Ok(_)) => {}
        }

        tracing::info!(
            guid = %event.guid,
            event_type = %event.event_type,
            timestamp = %event.log_timestamp_text(),
            "event logged"
        );
        Ok(LogOutcome {
            database: StoreWrite::from_result(&database),
            spreadsheet: StoreWrite::from_result(&spreadsheet),
            event,
        })
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.database.clone(),
            self.spreadsheet.clone(),
            SyncOptions {
                revise_from_spreadsheet: self.settings.reconcile.revise_from_spreadsheet,
                state_dir: self.settings.state_dir.clone(),
            },
        )
    }

    pub fn conflict_resolver(&self) -> SlResult<ConflictResolver> {
        Ok(ConflictResolver::new(
            self.database.clone(),
            self.spreadsheet.clone(),
            ConflictLedger::load(&self.settings.ledger_path())?,
        ))
    }

    /// Run one sync pass; a pass without failed repairs restores
    /// [`SessionHealth::Consistent`].
    pub fn sync(&self, token: &CancellationToken) -> SlResult<SyncSummary> {
        let mut resolver = self.conflict_resolver()?;
        let summary = self.reconciler().sync_pass(&mut resolver, token)?;
        if summary.failed == 0 && !summary.aborted {
            self.mark_synced();
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use chrono::{FixedOffset, TimeZone};
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::config::DEFAULT_TEXT_SOURCE;
    use crate::model::{FieldPatch, GuidCensus, Guid, RecordBody, StoreRecord};
    use crate::resolver::FixedClock;
    use crate::store::EventStore;

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            FixedOffset::east_opt(0)
                .expect("offset")
                .with_ymd_and_hms(2024, 5, 1, 8, 30, 0)
                .single()
                .expect("now"),
        ))
    }

    fn settings(dir: &TempDir) -> Settings {
        let settings = Settings::starter(dir.path());
        fs::create_dir_all(&settings.text_sources[DEFAULT_TEXT_SOURCE].folder).expect("nav dir");
        settings
    }

    fn write_nav(settings: &Settings, line: &str) {
        let folder = &settings.text_sources[DEFAULT_TEXT_SOURCE].folder;
        fs::write(folder.join("nav.txt"), format!("{line}\n")).expect("nav");
    }

    #[derive(Debug)]
    struct OfflineStore(StoreKind);

    impl OfflineStore {
        fn offline<T>(&self) -> SlResult<T> {
            Err(SlError::Storage(format!("{} offline", self.0)))
        }
    }

    impl EventStore for OfflineStore {
        fn kind(&self) -> StoreKind {
            self.0
        }
        fn append_record(&mut self, _body: &RecordBody) -> SlResult<RowRef> {
            self.offline()
        }
        fn records_for_guid(&mut self, _guid: &Guid) -> SlResult<Vec<StoreRecord>> {
            self.offline()
        }
        fn list_guids(&mut self) -> SlResult<GuidCensus> {
            self.offline()
        }
        fn all_records(&mut self) -> SlResult<Vec<StoreRecord>> {
            self.offline()
        }
        fn update(&mut self, _guid: &Guid, _patch: &FieldPatch) -> SlResult<usize> {
            self.offline()
        }
        fn delete_row(&mut self, _row: RowRef) -> SlResult<()> {
            self.offline()
        }
        fn assign_guid(&mut self, _row: RowRef, _guid: Guid) -> SlResult<()> {
            self.offline()
        }
    }

    #[test]
    fn log_button_writes_both_stores_with_host_timestamp() {
        let dir = tempdir().expect("tempdir");
        let settings = settings(&dir);
        write_nav(&settings, "2019-01-01,00:00:00,15.964,2,L01,1.5,2.5,500000.0,6000000.0");
        let session = LoggingSession::open_with_clock(settings, clock()).expect("session");

        let outcome = session.log_button("log on", None).expect("logged");
        assert!(outcome.database.is_written());
        assert!(outcome.spreadsheet.is_written());
        assert_eq!(outcome.event.event_text, "Log on event occurred");
        assert_eq!(outcome.event.log_timestamp_text(), "2024-05-01T08:30:00Z");
        assert_eq!(outcome.event.field("KP").and_then(FieldValue::as_number), Some(15.964));

        let guid = outcome.event.guid;
        let db = session.database().with(|s| s.find_by_guid(&guid)).expect("db").expect("row");
        let ss = session.spreadsheet().with(|s| s.find_by_guid(&guid)).expect("ss").expect("row");
        assert_eq!(db.body.fingerprint(), ss.body.fingerprint());
        assert_eq!(session.health(), SessionHealth::Consistent);
    }

    #[test]
    fn unknown_button_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let session = LoggingSession::open_with_clock(settings(&dir), clock()).expect("session");
        let err = session.log_button("Coffee", None).expect_err("unknown");
        assert_eq!(err.error_code(), "SL-INVALID-REQUEST");
    }

    #[test]
    fn one_failed_store_degrades_session_until_sync() {
        let dir = tempdir().expect("tempdir");
        let settings = settings(&dir);
        let fields = settings.mapping_set().expect("mappings").field_names();
        let database =
            DatabaseStore::open(&settings.database_path, &settings.table_name, &fields).expect("db");
        let session = LoggingSession::with_stores(
            Arc::new(settings),
            SharedStore::new(database, Duration::from_secs(1)),
            SharedStore::new(OfflineStore(StoreKind::Spreadsheet), Duration::from_secs(1)),
            clock(),
        )
        .expect("session");

        let outcome = session.log_button("Event", Some("ROV launched".into())).expect("logged");
        assert!(outcome.database.is_written());
        assert!(matches!(outcome.spreadsheet, StoreWrite::Failed { .. }));
        assert!(matches!(
            session.health(),
            SessionHealth::SingleStoreAuthoritative { store: StoreKind::Database, .. }
        ));
        session.mark_synced();
        assert_eq!(session.health(), SessionHealth::Consistent);
    }

    #[test]
    fn both_stores_failing_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let session = LoggingSession::with_stores(
            Arc::new(settings(&dir)),
            SharedStore::new(OfflineStore(StoreKind::Database), Duration::from_secs(1)),
            SharedStore::new(OfflineStore(StoreKind::Spreadsheet), Duration::from_secs(1)),
            clock(),
        )
        .expect("session");
        let err = session.log_button("Event", None).expect_err("both failed");
        assert_eq!(err.error_code(), "SL-STORE-WRITE");
    }

    #[test]
    fn hourly_kp_reports_progress_since_previous_hour() {
        let dir = tempdir().expect("tempdir");
        let settings = settings(&dir);
        let nav = settings.clone();
        let clock = clock();
        let session = LoggingSession::open_with_clock(settings, clock.clone()).expect("session");

        write_nav(&nav, "d,t,15.844,1");
        let first = session.hourly_kp().expect("first").expect("logged");
        assert_eq!(first.event.event_text, "Current KP: 15.844 | First hourly log");

        clock.advance(chrono::Duration::hours(1));
        write_nav(&nav, "d,t,15.964,1");
        let second = session.hourly_kp().expect("second").expect("logged");
        assert_eq!(
            second.event.event_text,
            "Current KP: 15.964 | Progress last hour: +0.120 km"
        );

        write_nav(&nav, "d,t,unknown,1");
        assert!(session.hourly_kp().expect("skip").is_none());
        let err = session.log_button(HOURLY_KP, None).expect_err("no kp");
        assert_eq!(err.error_code(), "SL-UNRESOLVED-SOURCE");
    }

    #[test]
    fn svp_needs_its_monitored_folder() {
        let dir = tempdir().expect("tempdir");
        let session = LoggingSession::open_with_clock(settings(&dir), clock()).expect("session");
        let err = session.log_button("SVP", None).expect_err("no svp folder");
        assert_eq!(err.error_code(), "SL-CONFIG");
        assert!(err.to_string().contains("monitored folder `SVP`"));
        let census = session.database().with(|s| s.list_guids()).expect("census");
        assert_eq!(census.total_rows(), 0);

        let dir = tempdir().expect("tempdir");
        let mut settings = settings(&dir);
        let svp = dir.path().join("svp");
        fs::create_dir_all(&svp).expect("svp dir");
        fs::write(svp.join("cast_014.svp"), "1500.2").expect("svp file");
        settings.monitored_folders.insert(
            "SVP".to_owned(),
            crate::config::MonitoredFolderSettings {
                folder: svp,
                extension: "svp".to_owned(),
                column: "SVP File".to_owned(),
                skip: true,
            },
        );
        let session = LoggingSession::open_with_clock(settings, clock()).expect("session");
        let outcome = session.log_button("svp", None).expect("logged");
        assert_eq!(
            outcome.event.field("SVP File"),
            Some(&FieldValue::Text("cast_014.svp".to_owned()))
        );
        assert!(outcome.database.is_written());
    }
}
