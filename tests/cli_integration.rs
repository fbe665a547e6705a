use std::fs;
use std::path::Path;
use std::process::{Command as ProcessCommand, Output};

use serde_json::Value;
use tempfile::tempdir;

use survey_log::cli::{Cli, Command, ConflictsCommand, ResolveAction};
use survey_log::sync::{LockPurpose, SyncLock};
use survey_log::Decision;

use clap::Parser;

fn survey_log(config: &Path, args: &[&str]) -> Output {
    ProcessCommand::new(env!("CARGO_BIN_EXE_survey_log"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env("RUST_LOG", "survey_log=warn")
        .output()
        .expect("spawn survey_log")
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "exit {:?}\nstderr: {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is json")
}

// ---------------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------------

#[test]
fn resolve_arguments_map_to_decisions() {
    let guid = "0f8fad5b-d9cb-469f-a165-70867728950e";
    let cli = Cli::try_parse_from(["survey_log", "conflicts", "resolve", guid, "split-b"])
        .expect("parse");
    let Command::Conflicts {
        command: ConflictsCommand::Resolve(args),
    } = cli.command
    else {
        panic!("expected conflicts resolve");
    };
    assert_eq!(args.action, ResolveAction::SplitB);
    assert_eq!(args.decision().expect("decision"), Decision::SPLIT_B);
    assert_eq!(args.guid().expect("guid").to_string(), guid);

    assert!(Cli::try_parse_from(["survey_log", "conflicts", "resolve", guid, "merge"]).is_err());
}

// ---------------------------------------------------------------------------
// End to end through the binary
// ---------------------------------------------------------------------------

#[test]
fn init_log_and_sync_through_the_binary() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("survey_log.json");

    let init = survey_log(&config, &["config", "init"]);
    assert!(init.status.success(), "{}", String::from_utf8_lossy(&init.stderr));
    let announced = String::from_utf8_lossy(&init.stdout).into_owned();
    assert!(
        announced.contains(&format!("resolve against {}", dir.path().display())),
        "{announced}"
    );
    let saved: Value = serde_json::from_str(&fs::read_to_string(&config).expect("saved settings"))
        .expect("settings json");
    assert_eq!(saved["database_path"], "survey_log.sqlite3");
    assert_eq!(saved["workbook_path"], "survey_log.workbook.json");
    let again = survey_log(&config, &["config", "init"]);
    assert!(!again.status.success());
    assert!(String::from_utf8_lossy(&again.stderr).contains("SL-INVALID-REQUEST"));

    fs::create_dir_all(dir.path().join("nav")).expect("nav dir");
    fs::write(
        dir.path().join("nav/run.txt"),
        "2019-01-01,00:00:00,15.964,2,L01,57.1,1.9,500000.0,6000000.0\n",
    )
    .expect("nav");
    let check = survey_log(&config, &["config", "check"]);
    assert!(check.status.success(), "{}", String::from_utf8_lossy(&check.stderr));

    let logged = stdout_json(&survey_log(
        &config,
        &["log", "Event", "--text", "ROV launched", "--json"],
    ));
    assert_eq!(logged["event"]["event_text"], "ROV launched");
    assert_eq!(logged["database"]["status"], "written");
    assert_eq!(logged["spreadsheet"]["status"], "written");
    assert!(dir.path().join("survey_log.sqlite3").exists());
    assert!(dir.path().join("survey_log.workbook.json").exists());

    let report = stdout_json(&survey_log(&config, &["sync", "--dry-run", "--json"]));
    assert_eq!(report["matched"].as_array().map(Vec::len), Some(1));

    let summary = stdout_json(&survey_log(&config, &["sync", "--json"]));
    assert_eq!(summary["matched"], 1);
    assert_eq!(summary["failed"], 0);
    assert_eq!(summary["aborted"], false);

    let conflicts = stdout_json(&survey_log(&config, &["conflicts", "list", "--json"]));
    assert_eq!(conflicts, Value::Array(Vec::new()));
}

#[test]
fn unknown_button_exits_non_zero_with_code() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("survey_log.json");
    assert!(survey_log(&config, &["config", "init"]).status.success());

    let output = survey_log(&config, &["log", "Coffee"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[SL-INVALID-REQUEST]"));
}

#[test]
fn conflict_resolution_is_refused_while_a_sync_pass_holds_the_stores() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("survey_log.json");
    assert!(survey_log(&config, &["config", "init"]).status.success());

    let held = SyncLock::acquire(&dir.path().join(".survey_log"), LockPurpose::SyncPass)
        .expect("hold lock");
    let output = survey_log(
        &config,
        &["conflicts", "resolve", "0f8fad5b-d9cb-469f-a165-70867728950e", "keep-a"],
    );
    held.release().expect("release");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("[SL-STORES-BUSY]"), "{stderr}");
    assert!(stderr.contains("a sync pass"), "{stderr}");
}

#[test]
fn missing_settings_is_a_config_error() {
    let dir = tempdir().expect("tempdir");
    let output = survey_log(&dir.path().join("absent.json"), &["buttons"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[SL-CONFIG]"));
}
