#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, TimeZone};
use tempfile::{TempDir, tempdir};

use survey_log::config::DEFAULT_TEXT_SOURCE;
use survey_log::resolver::FixedClock;
use survey_log::workbook::{Sheet, SheetRow, Workbook};
use survey_log::{LoggingSession, Settings};

/// Navigation line with KP 15.964 in the standard feed layout.
pub const NAV_LINE: &str = "2019-01-01,00:00:00,15.964,2,L01,57.1,1.9,500000.0,6000000.0";

pub struct Harness {
    pub dir: TempDir,
    pub settings: Settings,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        let mut settings = Settings::starter(dir.path());
        settings.auto_events.new_day = false;
        settings.auto_events.hourly_kp = false;
        fs::create_dir_all(&settings.text_sources[DEFAULT_TEXT_SOURCE].folder).expect("nav dir");
        let clock = Arc::new(FixedClock::new(
            FixedOffset::east_opt(2 * 3600)
                .expect("offset")
                .with_ymd_and_hms(2024, 5, 1, 8, 30, 0)
                .single()
                .expect("now"),
        ));
        let harness = Self { dir, settings, clock };
        harness.write_nav(&[NAV_LINE]);
        harness
    }

    /// Replace the navigation feed with `lines`, each newline terminated.
    pub fn write_nav(&self, lines: &[&str]) {
        let folder = &self.settings.text_sources[DEFAULT_TEXT_SOURCE].folder;
        let mut text = lines.join("\n");
        text.push('\n');
        fs::write(folder.join("nav.txt"), text).expect("write nav");
    }

    pub fn session(&self) -> LoggingSession {
        LoggingSession::open_with_clock(self.settings.clone(), self.clock.clone()).expect("session")
    }

    pub fn workbook_path(&self) -> &Path {
        &self.settings.workbook_path
    }
}

/// Column index of header `name` in the log sheet.
pub fn column(sheet: &Sheet, name: &str) -> usize {
    sheet
        .row(1)
        .expect("header row")
        .cells
        .iter()
        .position(|cell| cell.as_deref() == Some(name))
        .unwrap_or_else(|| panic!("no `{name}` column"))
}

/// Edit the log sheet the way an operator would, outside any store handle.
pub fn edit_log_sheet(path: &Path, edit: impl FnOnce(&mut Sheet)) {
    // Keep the edit's mtime distinct from the last write on coarse clocks.
    std::thread::sleep(Duration::from_millis(20));
    let mut workbook = Workbook::open(path).expect("open workbook");
    let sheet = workbook.doc_mut().sheet_mut("Log").expect("log sheet");
    edit(sheet);
    workbook.save().expect("save workbook");
}

/// Copy of data row `number` appended at the bottom of the sheet.
pub fn duplicate_row(sheet: &mut Sheet, number: usize) -> usize {
    let row: SheetRow = sheet.row(number).expect("row to copy").clone();
    sheet.append_row(row)
}

pub fn set_cell(sheet: &mut Sheet, number: usize, name: &str, value: Option<&str>) {
    let idx = column(sheet, name);
    sheet
        .row_mut(number)
        .expect("row to edit")
        .set_cell(idx, value.map(str::to_owned));
}
