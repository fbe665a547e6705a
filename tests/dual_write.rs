mod helpers;

use std::fs;

use helpers::{Harness, NAV_LINE};
use survey_log::config::{ButtonSettings, DEFAULT_TEXT_SOURCE};
use survey_log::logger::{SessionHealth, StoreWrite};
use survey_log::model::{FieldValue, StoreKind};
use survey_log::CancellationToken;

#[test]
fn event_lands_in_both_stores_with_the_host_timestamp() {
    let harness = Harness::new();
    let session = harness.session();
    let outcome = session.log_button("Log on", None).expect("logged");

    let event = &outcome.event;
    assert_eq!(event.log_timestamp_text(), "2024-05-01T08:30:00+02:00");
    assert_eq!(event.field("Date"), Some(&FieldValue::Text("2024-05-01".to_owned())));
    assert_eq!(event.field("Time"), Some(&FieldValue::Text("08:30:00".to_owned())));
    assert_eq!(event.field("KP").and_then(FieldValue::as_number), Some(15.964));
    assert_eq!(event.field("Line name"), Some(&FieldValue::Text("L01".to_owned())));
    assert!(event.failures.is_empty());

    let StoreWrite::Written { row: db_row } = outcome.database else {
        panic!("database write failed: {:?}", outcome.database);
    };
    let StoreWrite::Written { row: ss_row } = outcome.spreadsheet else {
        panic!("spreadsheet write failed: {:?}", outcome.spreadsheet);
    };
    assert_eq!(ss_row, 2);
    let db = session.database().with(|s| s.find_by_guid(&event.guid)).expect("db").expect("row");
    let ss = session.spreadsheet().with(|s| s.find_by_guid(&event.guid)).expect("ss").expect("row");
    assert_eq!(db.row, db_row);
    assert_eq!(db.body, ss.body);
    assert_eq!(db.body.fields["Date"], "2024-05-01");
}

#[test]
fn half_written_feed_line_is_ignored() {
    let harness = Harness::new();
    let folder = &harness.settings.text_sources[DEFAULT_TEXT_SOURCE].folder;
    fs::write(
        folder.join("nav.txt"),
        format!("{NAV_LINE}\n2019-01-01,00:00:01,16.2"),
    )
    .expect("nav");

    let session = harness.session();
    let outcome = session.log_button("Event", Some("Partial".into())).expect("logged");
    assert_eq!(outcome.event.field("KP").and_then(FieldValue::as_number), Some(15.964));
}

#[test]
fn unreadable_source_leaves_fields_empty_but_still_logs() {
    let harness = Harness::new();
    fs::remove_dir_all(&harness.settings.text_sources[DEFAULT_TEXT_SOURCE].folder).expect("rm nav");
    let session = harness.session();

    let outcome = session.log_button("Log off", None).expect("logged");
    assert!(outcome.database.is_written());
    assert!(outcome.spreadsheet.is_written());
    assert_eq!(outcome.event.field("KP"), Some(&FieldValue::Absent));
    assert!(outcome.event.failures.iter().any(|failure| failure.field == "KP"));
    let db = session
        .database()
        .with(|s| s.find_by_guid(&outcome.event.guid))
        .expect("db")
        .expect("row");
    assert!(!db.body.fields.contains_key("KP"));
}

#[test]
fn custom_button_uses_configured_text_and_colour() {
    let mut harness = Harness::new();
    harness.settings.buttons.push(ButtonSettings {
        id: "Fix Check".to_owned(),
        event_type: Some("QC".to_owned()),
        event_text: None,
        text_source: Some("None".to_owned()),
        include_folder_refs: false,
        row_color: Some("#FFFF00".to_owned()),
    });
    let session = harness.session();

    let outcome = session.log_button("fix check", None).expect("logged");
    assert_eq!(outcome.event.event_type, "QC");
    assert_eq!(outcome.event.event_text, "Fix Check Triggered");
    let ss = session
        .spreadsheet()
        .with(|s| s.find_by_guid(&outcome.event.guid))
        .expect("ss")
        .expect("row");
    assert_eq!(ss.body.row_color.as_deref(), Some("#FFFF00"));
    assert!(!ss.body.fields.contains_key("KP"));
}

#[test]
fn unavailable_workbook_degrades_then_sync_restores_consistency() {
    let harness = Harness::new();
    let session = harness.session();
    session.log_button("Log on", None).expect("first event");

    // The workbook path turns into something the spreadsheet store cannot
    // read or replace.
    let workbook = harness.workbook_path().to_path_buf();
    fs::remove_file(&workbook).expect("remove workbook");
    fs::create_dir(&workbook).expect("block workbook path");

    let outcome = session.log_button("Event", Some("While blocked".into())).expect("logged");
    assert!(outcome.database.is_written());
    assert!(matches!(outcome.spreadsheet, StoreWrite::Failed { .. }));
    assert!(matches!(
        session.health(),
        SessionHealth::SingleStoreAuthoritative { store: StoreKind::Database, .. }
    ));

    fs::remove_dir(&workbook).expect("unblock workbook path");
    let summary = session.sync(&CancellationToken::new()).expect("sync");
    assert!(summary.orphans_repaired >= 1);
    assert!(summary.is_clean());
    assert_eq!(session.health(), SessionHealth::Consistent);
    assert!(
        session
            .spreadsheet()
            .with(|s| s.find_by_guid(&outcome.event.guid))
            .expect("ss")
            .is_some()
    );
}
