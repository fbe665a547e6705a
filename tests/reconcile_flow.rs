mod helpers;

use helpers::{Harness, edit_log_sheet, set_cell};
use survey_log::conflict::{ConflictKind, ConflictState};
use survey_log::model::{DivergenceKind, GuidCensus};
use survey_log::store::SharedStore;
use survey_log::sync::{LockPurpose, SyncLock};
use survey_log::CancellationToken;

fn census(store: &SharedStore) -> GuidCensus {
    store.with(|store| store.list_guids()).expect("census")
}

// ---------------------------------------------------------------------------
// Orphans
// ---------------------------------------------------------------------------

#[test]
fn database_only_event_is_copied_to_spreadsheet() {
    let harness = Harness::new();
    let session = harness.session();
    let event = session
        .compose(
            &session
                .settings()
                .button("Event")
                .expect("event button")
                .trigger(Some("WROV".to_owned())),
        )
        .expect("compose");
    let guid = event.guid;
    session
        .database()
        .with(|store| store.append(&event))
        .expect("database append");

    let report = session.reconciler().reconcile().expect("report");
    assert!(report.only_in_database.contains(&guid));
    assert!(report.only_in_spreadsheet.is_empty());

    let summary = session.sync(&CancellationToken::new()).expect("sync");
    assert_eq!(summary.orphans_repaired, 1);
    assert!(summary.is_clean());

    let db = session.database().with(|s| s.find_by_guid(&guid)).expect("db").expect("db row");
    let ss = session.spreadsheet().with(|s| s.find_by_guid(&guid)).expect("ss").expect("ss row");
    assert_eq!(db.body, ss.body);
    assert_eq!(ss.body.fields["KP"], "15.964");
    assert_eq!(ss.body.event_text, "WROV");
}

#[test]
fn spreadsheet_only_event_is_copied_to_database() {
    let harness = Harness::new();
    let session = harness.session();
    let event = session
        .compose(&session.settings().button("Log on").expect("log on").trigger(None))
        .expect("compose");
    let guid = event.guid;
    session
        .spreadsheet()
        .with(|store| store.append(&event))
        .expect("spreadsheet append");

    let summary = session.sync(&CancellationToken::new()).expect("sync");
    assert_eq!(summary.orphans_repaired, 1);
    let db = session.database().with(|s| s.find_by_guid(&guid)).expect("db").expect("db row");
    assert_eq!(db.body.log_timestamp, "2024-05-01T08:30:00+02:00");
    assert_eq!(census(session.database()).total_rows(), 1);
    assert_eq!(census(session.spreadsheet()).total_rows(), 1);
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

#[test]
fn second_pass_repairs_nothing() {
    let harness = Harness::new();
    let session = harness.session();
    for text in ["first", "second", "third"] {
        session.log_button("Event", Some(text.to_owned())).expect("logged");
    }
    let stray = session
        .compose(&session.settings().button("Event").expect("event").trigger(None))
        .expect("compose");
    session.spreadsheet().with(|s| s.append(&stray)).expect("stray");

    let first = session.sync(&CancellationToken::new()).expect("first pass");
    assert_eq!(first.orphans_repaired, 1);
    assert_eq!(first.matched, 3);

    let second = session.sync(&CancellationToken::new()).expect("second pass");
    assert_eq!(second.matched, 4);
    assert_eq!(second.orphans_repaired, 0);
    assert_eq!(second.guids_assigned, 0);
    assert_eq!(second.revised, 0);
    assert!(second.is_clean());
    assert!(session.reconciler().reconcile().expect("report").is_consistent());
}

// ---------------------------------------------------------------------------
// Missing GUIDs and operator edits
// ---------------------------------------------------------------------------

#[test]
fn row_without_guid_is_identified_and_copied_not_deleted() {
    let harness = Harness::new();
    let session = harness.session();
    session.log_button("Log on", None).expect("logged");

    edit_log_sheet(harness.workbook_path(), |sheet| {
        let number = sheet.last_used_row() + 1;
        sheet.append_row(Default::default());
        set_cell(sheet, number, "LogTimestamp", Some("2024-05-01T08:45:00+02:00"));
        set_cell(sheet, number, "EventType", Some("Event"));
        set_cell(sheet, number, "EventText", Some("Typed by hand"));
    });
    let before = session.reconciler().reconcile().expect("report");
    assert_eq!(before.missing_guid.len(), 1);

    let summary = session.sync(&CancellationToken::new()).expect("sync");
    assert_eq!(summary.guids_assigned, 1);
    assert_eq!(summary.orphans_repaired, 1);

    let ss = census(session.spreadsheet());
    assert!(ss.missing.is_empty());
    assert_eq!(ss.total_rows(), 2);
    let records = session.database().with(|s| s.all_records()).expect("records");
    let manual = records
        .iter()
        .find(|record| record.body.event_text == "Typed by hand")
        .expect("manual row copied");
    assert!(manual.guid().is_some());
    assert!(session.reconciler().reconcile().expect("after").is_consistent());
}

#[test]
fn operator_field_edit_is_revised_into_database() {
    let harness = Harness::new();
    let session = harness.session();
    let guid = session.log_button("Event", Some("Pipe exposed".into())).expect("logged").event.guid;

    edit_log_sheet(harness.workbook_path(), |sheet| set_cell(sheet, 2, "KP", Some("15.970")));
    let report = session.reconciler().reconcile().expect("report");
    assert_eq!(report.diverged.get(&guid), Some(&DivergenceKind::Fields));

    let summary = session.sync(&CancellationToken::new()).expect("sync");
    assert_eq!(summary.revised, 1);
    assert_eq!(summary.mismatches_pending, 0);
    let db = session.database().with(|s| s.find_by_guid(&guid)).expect("db").expect("row");
    assert_eq!(db.body.fields["KP"], "15.970");
}

#[test]
fn edited_timestamp_becomes_a_conflict_instead_of_a_revision() {
    let harness = Harness::new();
    let session = harness.session();
    let guid = session.log_button("Log on", None).expect("logged").event.guid;

    edit_log_sheet(harness.workbook_path(), |sheet| {
        set_cell(sheet, 2, "LogTimestamp", Some("2019-01-01T00:00:00+00:00"));
    });
    let summary = session.sync(&CancellationToken::new()).expect("sync");
    assert_eq!(summary.revised, 0);
    assert_eq!(summary.mismatches_pending, 1);
    assert!(!summary.is_clean());

    let db = session.database().with(|s| s.find_by_guid(&guid)).expect("db").expect("row");
    assert_eq!(db.body.log_timestamp, "2024-05-01T08:30:00+02:00");

    let resolver = session.conflict_resolver().expect("resolver");
    let entry = resolver.ledger().open_entry(&guid).expect("conflict recorded");
    assert_eq!(entry.kind, ConflictKind::Mismatch);
    assert_eq!(entry.state, ConflictState::Detected);
    assert_eq!(entry.variants.len(), 2);
}

// ---------------------------------------------------------------------------
// Concurrency guards
// ---------------------------------------------------------------------------

#[test]
fn sync_is_refused_while_a_conflict_is_being_applied() {
    let harness = Harness::new();
    let session = harness.session();
    session.log_button("Log on", None).expect("logged");

    let held = SyncLock::acquire(&harness.settings.state_dir, LockPurpose::ConflictResolution)
        .expect("lock");
    let err = session.sync(&CancellationToken::new()).expect_err("lock is held");
    assert_eq!(err.error_code(), "SL-STORES-BUSY");
    held.release().expect("release");

    assert!(session.sync(&CancellationToken::new()).expect("sync").is_clean());
}

#[test]
fn cancelled_pass_writes_nothing() {
    let harness = Harness::new();
    let session = harness.session();
    let event = session
        .compose(&session.settings().button("Log off").expect("log off").trigger(None))
        .expect("compose");
    session.database().with(|s| s.append(&event)).expect("append");

    let token = CancellationToken::new();
    token.cancel();
    let outcome = session.sync(&token);
    assert!(outcome.is_err() || outcome.as_ref().is_ok_and(|summary| summary.aborted));
    assert_eq!(census(session.spreadsheet()).total_rows(), 0);
}
