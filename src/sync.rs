use std::collections::VecDeque;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::conflict::{ConflictKind, ConflictResolver};
use crate::error::{SlError, SlResult};
use crate::model::{
    DivergenceKind, DuplicateCounts, Guid, GuidCensus, MissingGuidRow, ReconciliationReport,
    RowRef, StoreKind, StoreRecord,
};
use crate::store::SharedStore;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// A holder older than this is presumed hung and its lock archived.
const LOCK_STALE_SECONDS: i64 = 300;
const LOCK_FILE_NAME: &str = "stores.lock";

// ---------------------------------------------------------------------------
// Store-pair lock
// ---------------------------------------------------------------------------

/// Why a process holds the store pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPurpose {
    SyncPass,
    ConflictResolution,
}

impl LockPurpose {
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::SyncPass => "a sync pass",
            Self::ConflictResolution => "conflict resolution",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    purpose: LockPurpose,
    started_at_rfc3339: String,
}

/// Cross-process guard held by anything that repairs rows in both stores:
/// sync passes and applied conflict decisions. Event logging does not take
/// it.
#[derive(Debug)]
pub struct SyncLock {
    path: PathBuf,
    released: bool,
}

impl SyncLock {
    pub fn acquire(state_dir: &Path, purpose: LockPurpose) -> SlResult<Self> {
        let locks_dir = state_dir.join("locks");
        fs::create_dir_all(&locks_dir)?;
        let path = locks_dir.join(LOCK_FILE_NAME);

        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str::<LockHolder>(&contents) {
                Ok(holder) if is_lock_stale(&holder) => {
                    tracing::warn!(
                        pid = holder.pid,
                        purpose = holder.purpose.describe(),
                        since = %holder.started_at_rfc3339,
                        "archiving abandoned store lock"
                    );
                    archive_stale_lock(&path, "stale")?;
                }
                Ok(holder) => {
                    return Err(SlError::StoresBusy {
                        holder: holder.purpose.describe().to_owned(),
                        pid: holder.pid,
                        since: holder.started_at_rfc3339,
                        lock: path.display().to_string(),
                    });
                }
                Err(_) => {
                    tracing::warn!(path = %path.display(), "archiving unreadable store lock");
                    archive_stale_lock(&path, "corrupt")?;
                }
            }
        }

        let holder = LockHolder {
            pid: std::process::id(),
            purpose,
            started_at_rfc3339: Utc::now().to_rfc3339(),
        };
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|error| {
                SlError::Storage(format!("cannot create store lock {}: {error}", path.display()))
            })?;
        file.write_all(serde_json::to_string_pretty(&holder)?.as_bytes())?;
        file.sync_all()?;
        tracing::debug!(purpose = purpose.describe(), "store lock acquired");

        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn release(mut self) -> SlResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> SlResult<()> {
        if self.released {
            return Ok(());
        }
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        self.released = true;
        Ok(())
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        if let Err(error) = self.release_inner() {
            tracing::warn!(%error, path = %self.path.display(), "store lock left behind");
        }
    }
}

fn is_lock_stale(holder: &LockHolder) -> bool {
    if !pid_is_alive(holder.pid) {
        return true;
    }
    chrono::DateTime::parse_from_rfc3339(&holder.started_at_rfc3339).is_ok_and(|started| {
        Utc::now().signed_duration_since(started).num_seconds() > LOCK_STALE_SECONDS
    })
}

fn archive_stale_lock(path: &Path, reason: &str) -> SlResult<()> {
    let timestamp = Utc::now().timestamp_millis();
    let archived = path.with_file_name(format!("{LOCK_FILE_NAME}.{reason}.{timestamp}.json"));
    fs::rename(path, archived)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
    GuidAssigned {
        store: StoreKind,
        row: RowRef,
        guid: Guid,
    },
    Copied {
        guid: Guid,
        from: StoreKind,
        to: StoreKind,
    },
    Revised {
        guid: Guid,
        columns: Vec<String>,
    },
    Skipped {
        guid: Guid,
        reason: String,
    },
    Failed {
        guid: Option<Guid>,
        repair: String,
        error_code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairLog {
    pub actions: Vec<RepairAction>,
    /// Cancellation stopped the pass; earlier repairs stay applied.
    pub aborted: bool,
}

impl RepairLog {
    fn count(&self, matches: impl Fn(&RepairAction) -> bool) -> usize {
        self.actions.iter().filter(|action| matches(action)).count()
    }

    #[must_use]
    pub fn copied(&self) -> usize {
        self.count(|action| matches!(action, RepairAction::Copied { .. }))
    }

    #[must_use]
    pub fn assigned(&self) -> usize {
        self.count(|action| matches!(action, RepairAction::GuidAssigned { .. }))
    }

    #[must_use]
    pub fn revised(&self) -> usize {
        self.count(|action| matches!(action, RepairAction::Revised { .. }))
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|action| matches!(action, RepairAction::Failed { .. }))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub matched: usize,
    pub orphans_repaired: usize,
    pub guids_assigned: usize,
    pub revised: usize,
    pub duplicates_pending: usize,
    pub mismatches_pending: usize,
    pub failed: usize,
    pub aborted: bool,
}

impl SyncSummary {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failed == 0
            && !self.aborted
            && self.duplicates_pending == 0
            && self.mismatches_pending == 0
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Write spreadsheet edits of matched events back to the database.
    pub revise_from_spreadsheet: bool,
    pub state_dir: PathBuf,
}

enum Repair {
    AssignGuid(MissingGuidRow),
    Copy { guid: Guid, from: StoreKind },
    Revise(Guid),
}

impl Repair {
    fn guid(&self) -> Option<Guid> {
        match self {
            Self::AssignGuid(_) => None,
            Self::Copy { guid, .. } | Self::Revise(guid) => Some(*guid),
        }
    }

    const fn label(&self) -> &'static str {
        match self {
            Self::AssignGuid(_) => "assign_guid",
            Self::Copy { .. } => "copy",
            Self::Revise(_) => "revise",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    database: SharedStore,
    spreadsheet: SharedStore,
    options: SyncOptions,
}

impl Reconciler {
    #[must_use]
    pub const fn new(database: SharedStore, spreadsheet: SharedStore, options: SyncOptions) -> Self {
        Self {
            database,
            spreadsheet,
            options,
        }
    }

    fn store(&self, kind: StoreKind) -> &SharedStore {
        match kind {
            StoreKind::Database => &self.database,
            StoreKind::Spreadsheet => &self.spreadsheet,
        }
    }

    /// Compare both stores. Both locks are held only while the snapshots
    /// are taken; nothing is written.
    pub fn reconcile(&self) -> SlResult<ReconciliationReport> {
        let (db_census, db_records, ss_census, ss_records) = {
            let mut database = self.database.lock()?;
            let mut spreadsheet = self.spreadsheet.lock()?;
            (
                database.list_guids()?,
                database.all_records()?,
                spreadsheet.list_guids()?,
                spreadsheet.all_records()?,
            )
        };
        let report = classify(&db_census, &db_records, &ss_census, &ss_records);
        tracing::info!(
            matched = report.matched.len(),
            only_in_database = report.only_in_database.len(),
            only_in_spreadsheet = report.only_in_spreadsheet.len(),
            duplicates = report.duplicates.len(),
            missing_guid = report.missing_guid.len(),
            diverged = report.diverged.len(),
            "reconciliation snapshot taken"
        );
        Ok(report)
    }

    /// Carry out the automatic repairs a report calls for. Each repair is
    /// locked on its own and re-checks the stores first, so a stale report
    /// never produces duplicates.
    pub fn apply_repairs(&self, report: &ReconciliationReport, token: &CancellationToken) -> RepairLog {
        let mut queue: VecDeque<Repair> = VecDeque::new();
        queue.extend(report.missing_guid.iter().copied().map(Repair::AssignGuid));
        queue.extend(report.only_in_database.iter().map(|guid| Repair::Copy {
            guid: *guid,
            from: StoreKind::Database,
        }));
        queue.extend(report.only_in_spreadsheet.iter().map(|guid| Repair::Copy {
            guid: *guid,
            from: StoreKind::Spreadsheet,
        }));
        if self.options.revise_from_spreadsheet {
            queue.extend(
                report
                    .diverged
                    .iter()
                    .filter(|(_, kind)| **kind == DivergenceKind::Fields)
                    .map(|(guid, _)| Repair::Revise(*guid)),
            );
        }

        let mut log = RepairLog::default();
        while let Some(repair) = queue.pop_front() {
            if let Err(error) = token.checkpoint() {
                tracing::warn!(pending = queue.len() + 1, %error, "repair pass aborted");
                log.aborted = true;
                break;
            }
            let outcome = match &repair {
                Repair::AssignGuid(missing) => self.assign_missing(*missing).map(|assigned| {
                    assigned.map(|guid| {
                        queue.push_back(Repair::Copy {
                            guid,
                            from: missing.store,
                        });
                        RepairAction::GuidAssigned {
                            store: missing.store,
                            row: missing.row,
                            guid,
                        }
                    })
                }),
                Repair::Copy { guid, from } => self.copy_orphan(*guid, *from).map(Some),
                Repair::Revise(guid) => self.revise(*guid).map(Some),
            };
            match outcome {
                Ok(Some(action)) => log.actions.push(action),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(
                        repair = repair.label(),
                        guid = ?repair.guid().map(|g| g.to_string()),
                        code = error.error_code(),
                        %error,
                        "repair failed"
                    );
                    log.actions.push(RepairAction::Failed {
                        guid: repair.guid(),
                        repair: repair.label().to_owned(),
                        error_code: error.error_code().to_owned(),
                        message: error.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            copied = log.copied(),
            assigned = log.assigned(),
            revised = log.revised(),
            failed = log.failed(),
            aborted = log.aborted,
            "repairs applied"
        );
        log
    }

    /// Fill a blank GUID in place. Returns `None` when the row was given a
    /// GUID or removed since the snapshot.
    fn assign_missing(&self, missing: MissingGuidRow) -> SlResult<Option<Guid>> {
        self.store(missing.store).with(|store| {
            let still_blank = store
                .all_records()?
                .iter()
                .any(|record| record.row == missing.row && record.guid().is_none());
            if !still_blank {
                return Ok(None);
            }
            let guid = Guid::new_random();
            store.assign_guid(missing.row, guid)?;
            tracing::info!(store = %missing.store, row = missing.row, guid = %guid, "guid assigned to row");
            Ok(Some(guid))
        })
    }

    fn copy_orphan(&self, guid: Guid, from: StoreKind) -> SlResult<RepairAction> {
        let to = from.other();
        let copies = self.store(from).with(|store| store.records_for_guid(&guid))?;
        let source = match copies.as_slice() {
            [single] => single.body.clone(),
            [] => {
                return Ok(RepairAction::Skipped {
                    guid,
                    reason: format!("no longer in {from} store"),
                });
            }
            _ => {
                return Ok(RepairAction::Skipped {
                    guid,
                    reason: format!("{} copies in {from} store", copies.len()),
                });
            }
        };
        self.store(to).with(|store| {
            if store.find_by_guid(&guid)?.is_some() {
                return Ok(RepairAction::Skipped {
                    guid,
                    reason: format!("already present in {to} store"),
                });
            }
            store.append_record(&source)?;
            tracing::info!(guid = %guid, from = %from, to = %to, "orphan copied");
            Ok(RepairAction::Copied { guid, from, to })
        })
    }

    fn revise(&self, guid: Guid) -> SlResult<RepairAction> {
        let edited = single_copy(self.spreadsheet.with(|store| store.records_for_guid(&guid))?);
        let Some(edited) = edited else {
            return Ok(RepairAction::Skipped {
                guid,
                reason: "spreadsheet copy is not unique".to_owned(),
            });
        };
        self.database.with(|store| {
            let Some(current) = single_copy(store.records_for_guid(&guid)?) else {
                return Ok(RepairAction::Skipped {
                    guid,
                    reason: "database copy is not unique".to_owned(),
                });
            };
            if current.body.log_timestamp != edited.body.log_timestamp {
                return Ok(RepairAction::Skipped {
                    guid,
                    reason: "log timestamps differ".to_owned(),
                });
            }
            let patch = edited.body.patch_against(&current.body);
            if patch.is_empty() {
                return Ok(RepairAction::Skipped {
                    guid,
                    reason: "copies already agree".to_owned(),
                });
            }
            store.update(&guid, &patch)?;
            let columns: Vec<String> = patch.into_keys().collect();
            tracing::info!(guid = %guid, ?columns, "database revised from spreadsheet");
            Ok(RepairAction::Revised { guid, columns })
        })
    }

    /// One full pass: reconcile, repair, then hand duplicates and
    /// irreparable mismatches to the conflict resolver.
    pub fn sync_pass(
        &self,
        resolver: &mut ConflictResolver,
        token: &CancellationToken,
    ) -> SlResult<SyncSummary> {
        let lock = SyncLock::acquire(&self.options.state_dir, LockPurpose::SyncPass)?;
        token.checkpoint()?;
        let report = self.reconcile()?;
        let log = self.apply_repairs(&report, token);

        let mut summary = SyncSummary {
            matched: report.matched.len(),
            orphans_repaired: log.copied(),
            guids_assigned: log.assigned(),
            revised: log.revised(),
            failed: log.failed(),
            aborted: log.aborted,
            ..SyncSummary::default()
        };
        if !log.aborted {
            for guid in report.duplicates.keys() {
                if resolver.record_detected(*guid, ConflictKind::DuplicateGuid)? {
                    summary.duplicates_pending += 1;
                }
            }
            for (guid, kind) in &report.diverged {
                let irreparable =
                    *kind == DivergenceKind::Timestamp || !self.options.revise_from_spreadsheet;
                if irreparable && resolver.record_detected(*guid, ConflictKind::Mismatch)? {
                    summary.mismatches_pending += 1;
                }
            }
        }
        lock.release()?;
        tracing::info!(?summary, "sync pass finished");
        Ok(summary)
    }
}

fn single_copy(records: Vec<StoreRecord>) -> Option<StoreRecord> {
    let mut records = records.into_iter();
    match (records.next(), records.next()) {
        (Some(record), None) => Some(record),
        _ => None,
    }
}

/// Pure classification of two store snapshots.
#[must_use]
pub fn classify(
    db_census: &GuidCensus,
    db_records: &[StoreRecord],
    ss_census: &GuidCensus,
    ss_records: &[StoreRecord],
) -> ReconciliationReport {
    let db_guids = db_census.guids();
    let ss_guids = ss_census.guids();
    let mut report = ReconciliationReport {
        matched: db_guids.intersection(&ss_guids).copied().collect(),
        only_in_database: db_guids.difference(&ss_guids).copied().collect(),
        only_in_spreadsheet: ss_guids.difference(&db_guids).copied().collect(),
        ..ReconciliationReport::default()
    };

    for guid in db_guids.union(&ss_guids) {
        let counts = DuplicateCounts {
            database: db_census.count(guid),
            spreadsheet: ss_census.count(guid),
        };
        if counts.database > 1 || counts.spreadsheet > 1 {
            report.duplicates.insert(*guid, counts);
        }
    }

    report.missing_guid.extend(db_census.missing.iter().map(|row| MissingGuidRow {
        store: StoreKind::Database,
        row: *row,
    }));
    report.missing_guid.extend(ss_census.missing.iter().map(|row| MissingGuidRow {
        store: StoreKind::Spreadsheet,
        row: *row,
    }));

    for guid in &report.matched {
        if report.duplicates.contains_key(guid) {
            continue;
        }
        let db = db_records.iter().find(|record| record.guid() == Some(*guid));
        let ss = ss_records.iter().find(|record| record.guid() == Some(*guid));
        let (Some(db), Some(ss)) = (db, ss) else {
            continue;
        };
        if db.body.log_timestamp != ss.body.log_timestamp {
            report.diverged.insert(*guid, DivergenceKind::Timestamp);
        } else if db.body.fingerprint() != ss.body.fingerprint() {
            report.diverged.insert(*guid, DivergenceKind::Fields);
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::conflict::ConflictLedger;
    use crate::model::RecordBody;
    use crate::store::{DatabaseStore, SpreadsheetStore};

    struct Fixture {
        dir: TempDir,
        database: SharedStore,
        spreadsheet: SharedStore,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().expect("tempdir");
        let fields = vec!["KP".to_owned(), "Event".to_owned()];
        let database =
            DatabaseStore::open(&dir.path().join("log.sqlite3"), "EventLog", &fields).expect("db");
        let spreadsheet =
            SpreadsheetStore::open(&dir.path().join("log.workbook.json"), "Log", &fields).expect("ss");
        Fixture {
            database: SharedStore::new(database, Duration::from_secs(1)),
            spreadsheet: SharedStore::new(spreadsheet, Duration::from_secs(1)),
            dir,
        }
    }

    fn reconciler(fx: &Fixture, revise: bool) -> Reconciler {
        Reconciler::new(
            fx.database.clone(),
            fx.spreadsheet.clone(),
            SyncOptions {
                revise_from_spreadsheet: revise,
                state_dir: fx.dir.path().join("state"),
            },
        )
    }

    fn body(guid: Option<Guid>, kp: &str) -> RecordBody {
        let mut fields = BTreeMap::new();
        fields.insert("KP".to_owned(), kp.to_owned());
        fields.insert("Event".to_owned(), "WROV".to_owned());
        RecordBody {
            guid,
            log_timestamp: "2024-05-01T08:30:00+00:00".to_owned(),
            event_type: "Event".to_owned(),
            event_text: String::new(),
            fields,
            row_color: None,
        }
    }

    #[test]
    fn store_lock_is_exclusive_across_purposes() {
        let dir = tempdir().expect("tempdir");
        let first = SyncLock::acquire(dir.path(), LockPurpose::ConflictResolution).expect("first");
        let err = SyncLock::acquire(dir.path(), LockPurpose::SyncPass).expect_err("held");
        assert_eq!(err.error_code(), "SL-STORES-BUSY");
        let message = err.to_string();
        assert!(message.contains("conflict resolution"), "{message}");
        assert!(message.contains(&format!("pid {}", std::process::id())), "{message}");
        drop(first);
        SyncLock::acquire(dir.path(), LockPurpose::SyncPass)
            .expect("reacquire")
            .release()
            .expect("release");
        assert!(!dir.path().join("locks/stores.lock").exists());
    }

    #[test]
    fn stale_and_corrupt_locks_are_archived() {
        let dir = tempdir().expect("tempdir");
        let locks = dir.path().join("locks");
        fs::create_dir_all(&locks).expect("locks dir");
        let old = LockHolder {
            pid: std::process::id(),
            purpose: LockPurpose::SyncPass,
            started_at_rfc3339: (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339(),
        };
        fs::write(locks.join("stores.lock"), serde_json::to_string(&old).expect("json")).expect("write");
        drop(SyncLock::acquire(dir.path(), LockPurpose::SyncPass).expect("stale lock replaced"));

        fs::write(locks.join("stores.lock"), "not json").expect("write");
        drop(SyncLock::acquire(dir.path(), LockPurpose::SyncPass).expect("corrupt lock replaced"));

        let archived: Vec<String> = fs::read_dir(&locks)
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(archived.iter().any(|name| name.starts_with("stores.lock.stale.")));
        assert!(archived.iter().any(|name| name.starts_with("stores.lock.corrupt.")));
    }

    #[test]
    fn classify_separates_orphans_duplicates_and_divergence() {
        let shared = Guid::new_random();
        let edited = Guid::new_random();
        let moved = Guid::new_random();
        let lonely = Guid::new_random();
        let twice = Guid::new_random();

        let record = |store, row, guid: Guid, kp: &str| StoreRecord {
            store,
            row,
            body: body(Some(guid), kp),
        };
        let db_records = vec![
            record(StoreKind::Database, 1, shared, "1.0"),
            record(StoreKind::Database, 2, edited, "2.0"),
            record(StoreKind::Database, 3, moved, "3.0"),
            record(StoreKind::Database, 4, lonely, "4.0"),
            record(StoreKind::Database, 5, twice, "5.0"),
        ];
        let mut moved_copy = record(StoreKind::Spreadsheet, 4, moved, "3.0");
        moved_copy.body.log_timestamp = "2024-05-01T09:00:00+00:00".to_owned();
        let ss_records = vec![
            record(StoreKind::Spreadsheet, 2, shared, "1.0"),
            record(StoreKind::Spreadsheet, 3, edited, "2.5"),
            moved_copy,
            record(StoreKind::Spreadsheet, 5, twice, "5.0"),
            record(StoreKind::Spreadsheet, 6, twice, "5.1"),
        ];
        let census = |records: &[StoreRecord], missing: Vec<RowRef>| {
            let mut census = GuidCensus::default();
            for r in records {
                census.record(r.guid(), r.row);
            }
            census.missing = missing;
            census
        };

        let report = classify(
            &census(&db_records, vec![]),
            &db_records,
            &census(&ss_records, vec![7]),
            &ss_records,
        );
        assert_eq!(report.matched.len(), 4);
        assert_eq!(report.only_in_database.iter().copied().collect::<Vec<_>>(), vec![lonely]);
        assert!(report.only_in_spreadsheet.is_empty());
        assert_eq!(
            report.duplicates.get(&twice),
            Some(&DuplicateCounts { database: 1, spreadsheet: 2 })
        );
        assert_eq!(report.diverged.get(&edited), Some(&DivergenceKind::Fields));
        assert_eq!(report.diverged.get(&moved), Some(&DivergenceKind::Timestamp));
        assert!(!report.diverged.contains_key(&shared));
        assert!(!report.diverged.contains_key(&twice));
        assert_eq!(
            report.missing_guid,
            vec![MissingGuidRow { store: StoreKind::Spreadsheet, row: 7 }]
        );
        assert!(report.needs_repair());
    }

    #[test]
    fn revision_writes_spreadsheet_edits_to_database() {
        let fx = fixture();
        let guid = Guid::new_random();
        fx.database
            .with(|s| s.append_record(&body(Some(guid), "15.964")))
            .expect("db");
        fx.spreadsheet
            .with(|s| s.append_record(&body(Some(guid), "15.970")))
            .expect("ss");

        let reconciler = reconciler(&fx, true);
        let report = reconciler.reconcile().expect("report");
        let log = reconciler.apply_repairs(&report, &CancellationToken::new());
        assert_eq!(
            log.actions,
            vec![RepairAction::Revised { guid, columns: vec!["KP".to_owned()] }]
        );
        let db = fx.database.with(|s| s.find_by_guid(&guid)).expect("find").expect("present");
        assert_eq!(db.body.fields["KP"], "15.970");
        assert!(reconciler.reconcile().expect("second").is_consistent());
    }

    #[test]
    fn cancelled_token_aborts_before_any_repair() {
        let fx = fixture();
        fx.database
            .with(|s| s.append_record(&body(Some(Guid::new_random()), "1.0")))
            .expect("db");
        let reconciler = reconciler(&fx, true);
        let report = reconciler.reconcile().expect("report");
        let token = CancellationToken::new();
        token.cancel();
        let log = reconciler.apply_repairs(&report, &token);
        assert!(log.aborted);
        assert!(log.actions.is_empty());
        assert_eq!(fx.spreadsheet.with(|s| s.list_guids()).expect("census").total_rows(), 0);
    }

    #[test]
    fn mismatch_without_revision_goes_to_resolver() {
        let fx = fixture();
        let guid = Guid::new_random();
        fx.database.with(|s| s.append_record(&body(Some(guid), "1.0"))).expect("db");
        fx.spreadsheet.with(|s| s.append_record(&body(Some(guid), "1.1"))).expect("ss");

        let mut resolver = ConflictResolver::new(
            fx.database.clone(),
            fx.spreadsheet.clone(),
            ConflictLedger::load(&fx.dir.path().join("state/conflicts.json")).expect("ledger"),
        );
        let summary = reconciler(&fx, false)
            .sync_pass(&mut resolver, &CancellationToken::new())
            .expect("pass");
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.revised, 0);
        assert_eq!(summary.mismatches_pending, 1);
        assert!(!summary.is_clean());
        assert!(resolver.ledger().open_entry(&guid).is_some());
        let db = fx.database.with(|s| s.find_by_guid(&guid)).expect("find").expect("present");
        assert_eq!(db.body.fields["KP"], "1.0");
    }
}
