//! File-backed workbook document.
//!
//! A workbook is a JSON document holding named sheets of text cells. It stands
//! in for the operator's spreadsheet: the log sheet receives one row per event
//! and any sheet can be referenced by `SpreadsheetCell` mappings using A1
//! addresses (`Sheet2!F4`). Writes go through a temp file and rename so a
//! concurrent reader never sees a half-written workbook.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{SlError, SlResult};
use crate::fsutil::atomic_write_bytes;

// ---------------------------------------------------------------------------
// Cell addressing
// ---------------------------------------------------------------------------

/// Absolute cell address: sheet name plus 0-based column and 1-based row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellRef {
    pub sheet: String,
    pub column: usize,
    pub row: usize,
}

impl CellRef {
    /// Parse `Sheet2!F4`, `'My Sheet'!F4` or the mapping form `SHEET2,F4`.
    pub fn parse(text: &str) -> SlResult<Self> {
        let trimmed = text.trim().trim_start_matches('=');
        let (sheet, address) = trimmed
            .rsplit_once('!')
            .or_else(|| trimmed.split_once(','))
            .ok_or_else(|| {
                SlError::Config(format!(
                    "cell reference `{text}` must name a sheet, e.g. `Sheet2!F4`"
                ))
            })?;
        let sheet = sheet.trim().trim_matches('\'').trim();
        if sheet.is_empty() {
            return Err(SlError::Config(format!(
                "cell reference `{text}` has an empty sheet name"
            )));
        }
        let (column, row) = parse_a1(address.trim()).ok_or_else(|| {
            SlError::Config(format!(
                "cell reference `{text}` has an invalid address `{}`",
                address.trim()
            ))
        })?;
        Ok(Self {
            sheet: sheet.to_owned(),
            column,
            row,
        })
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}{}", self.sheet, column_letters(self.column), self.row)
    }
}

/// `F4` → (5, 4). Absolute markers (`$F$4`) are accepted.
fn parse_a1(address: &str) -> Option<(usize, usize)> {
    let cleaned: String = address.chars().filter(|c| *c != '$').collect();
    let split = cleaned.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = cleaned.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let row: usize = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    let mut column = 0usize;
    for c in letters.chars() {
        let digit = (c.to_ascii_uppercase() as u8 - b'A') as usize + 1;
        column = column.checked_mul(26)?.checked_add(digit)?;
    }
    Some((column - 1, row))
}

#[must_use]
pub fn column_letters(mut column: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push((b'A' + (column % 26) as u8) as char);
        if column < 26 {
            break;
        }
        column = column / 26 - 1;
    }
    letters.iter().rev().collect()
}

/// Read access to single cells, used by the field resolver.
pub trait CellSource {
    fn read_cell(&self, cell: &CellRef) -> SlResult<CellRead>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellRead {
    Value(String),
    Empty,
    NoSuchSheet,
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SheetRow {
    #[serde(default)]
    pub cells: Vec<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl SheetRow {
    #[must_use]
    pub fn from_cells(cells: Vec<Option<String>>) -> Self {
        Self { cells, color: None }
    }

    #[must_use]
    pub fn cell(&self, column: usize) -> Option<&str> {
        self.cells
            .get(column)
            .and_then(Option::as_deref)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn set_cell(&mut self, column: usize, value: Option<String>) {
        if self.cells.len() <= column {
            self.cells.resize(column + 1, None);
        }
        self.cells[column] = value.filter(|v| !v.is_empty());
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.cells
            .iter()
            .all(|cell| cell.as_deref().is_none_or(|v| v.trim().is_empty()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    /// `rows[0]` is spreadsheet row 1.
    #[serde(default)]
    pub rows: Vec<SheetRow>,
}

impl Sheet {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
        }
    }

    /// 1-based number of the last row holding any value, 0 when empty.
    #[must_use]
    pub fn last_used_row(&self) -> usize {
        self.rows
            .iter()
            .rposition(|row| !row.is_blank())
            .map_or(0, |idx| idx + 1)
    }

    #[must_use]
    pub fn row(&self, number: usize) -> Option<&SheetRow> {
        number.checked_sub(1).and_then(|idx| self.rows.get(idx))
    }

    pub fn row_mut(&mut self, number: usize) -> Option<&mut SheetRow> {
        number.checked_sub(1).and_then(|idx| self.rows.get_mut(idx))
    }

    /// Write `row` right after the last used row and return its number.
    pub fn append_row(&mut self, row: SheetRow) -> usize {
        let number = self.last_used_row() + 1;
        if self.rows.len() < number {
            self.rows.resize_with(number, SheetRow::default);
        }
        self.rows[number - 1] = row;
        number
    }

    /// Remove a row, shifting the rows below it up by one.
    pub fn delete_row(&mut self, number: usize) -> bool {
        match number.checked_sub(1) {
            Some(idx) if idx < self.rows.len() => {
                self.rows.remove(idx);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkbookDoc {
    #[serde(default)]
    pub sheets: Vec<Sheet>,
}

impl WorkbookDoc {
    #[must_use]
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets
            .iter()
            .find(|sheet| sheet.name.eq_ignore_ascii_case(name))
    }

    pub fn sheet_mut(&mut self, name: &str) -> Option<&mut Sheet> {
        self.sheets
            .iter_mut()
            .find(|sheet| sheet.name.eq_ignore_ascii_case(name))
    }

    pub fn ensure_sheet(&mut self, name: &str) -> &mut Sheet {
        if let Some(idx) = self
            .sheets
            .iter()
            .position(|sheet| sheet.name.eq_ignore_ascii_case(name))
        {
            return &mut self.sheets[idx];
        }
        self.sheets.push(Sheet::new(name));
        let last = self.sheets.len() - 1;
        &mut self.sheets[last]
    }
}

impl CellSource for WorkbookDoc {
    fn read_cell(&self, cell: &CellRef) -> SlResult<CellRead> {
        let Some(sheet) = self.sheet(&cell.sheet) else {
            return Ok(CellRead::NoSuchSheet);
        };
        Ok(sheet
            .row(cell.row)
            .and_then(|row| row.cell(cell.column))
            .map_or(CellRead::Empty, |value| CellRead::Value(value.to_owned())))
    }
}

// ---------------------------------------------------------------------------
// File handle
// ---------------------------------------------------------------------------

/// Workbook bound to a file. Re-reads the file when its modification time
/// changes so edits made by the operator outside the logger are picked up.
#[derive(Debug)]
pub struct Workbook {
    path: PathBuf,
    doc: WorkbookDoc,
    loaded_mtime: Option<SystemTime>,
}

impl Workbook {
    /// Open the workbook, creating an empty document when the file is absent.
    pub fn open_or_create(path: &Path) -> SlResult<Self> {
        if path.exists() {
            return Self::open(path);
        }
        let workbook = Self {
            path: path.to_path_buf(),
            doc: WorkbookDoc::default(),
            loaded_mtime: None,
        };
        Ok(workbook)
    }

    pub fn open(path: &Path) -> SlResult<Self> {
        let (doc, mtime) = read_doc(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            doc,
            loaded_mtime: mtime,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn doc(&self) -> &WorkbookDoc {
        &self.doc
    }

    pub fn doc_mut(&mut self) -> &mut WorkbookDoc {
        &mut self.doc
    }

    /// Reload from disk when the file changed since the last load or save.
    pub fn refresh(&mut self) -> SlResult<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let current = fs::metadata(&self.path)?.modified().ok();
        if current.is_some() && current == self.loaded_mtime {
            return Ok(());
        }
        let (doc, mtime) = read_doc(&self.path)?;
        tracing::debug!(path = %self.path.display(), "workbook reloaded from disk");
        self.doc = doc;
        self.loaded_mtime = mtime;
        Ok(())
    }

    pub fn save(&mut self) -> SlResult<()> {
        let bytes = serde_json::to_vec_pretty(&self.doc)?;
        atomic_write_bytes(&self.path, &bytes).map_err(|error| {
            SlError::Storage(format!(
                "failed to save workbook {}: {error}",
                self.path.display()
            ))
        })?;
        self.loaded_mtime = fs::metadata(&self.path)?.modified().ok();
        Ok(())
    }
}

impl CellSource for Workbook {
    fn read_cell(&self, cell: &CellRef) -> SlResult<CellRead> {
        self.doc.read_cell(cell)
    }
}

fn read_doc(path: &Path) -> SlResult<(WorkbookDoc, Option<SystemTime>)> {
    let mtime = fs::metadata(path)?.modified().ok();
    let text = fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Ok((WorkbookDoc::default(), mtime));
    }
    let doc = serde_json::from_str(&text).map_err(|error| {
        SlError::Storage(format!("invalid workbook {}: {error}", path.display()))
    })?;
    Ok((doc, mtime))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn parses_sheet_bang_and_mapping_forms() {
        let bang = CellRef::parse("Sheet2!F4").expect("bang form");
        assert_eq!(bang.sheet, "Sheet2");
        assert_eq!((bang.column, bang.row), (5, 4));

        let mapping = CellRef::parse("=SHEET2,F4").expect("mapping form");
        assert_eq!(mapping.sheet, "SHEET2");
        assert_eq!((mapping.column, mapping.row), (5, 4));

        let quoted = CellRef::parse("'Dive Log'!$AA$10").expect("quoted form");
        assert_eq!(quoted.sheet, "Dive Log");
        assert_eq!((quoted.column, quoted.row), (26, 10));
    }

    #[test]
    fn rejects_invalid_addresses() {
        for bad in ["F4", "Sheet2!", "Sheet2!4F", "Sheet2!F0", "!F4", "Sheet2!F"] {
            assert!(CellRef::parse(bad).is_err(), "`{bad}` should be rejected");
        }
    }

    #[test]
    fn column_letters_round_trip_through_display() {
        for (column, letters) in [(0, "A"), (25, "Z"), (26, "AA"), (27, "AB"), (701, "ZZ")] {
            assert_eq!(column_letters(column), letters);
        }
        let cell = CellRef::parse("Log!AB12").expect("parse");
        assert_eq!(cell.to_string(), "Log!AB12");
    }

    #[test]
    fn append_row_skips_trailing_blank_rows() {
        let mut sheet = Sheet::new("Log");
        sheet.rows.push(SheetRow::from_cells(vec![Some("h".to_owned())]));
        sheet.rows.push(SheetRow::default());
        sheet.rows.push(SheetRow::from_cells(vec![Some(" ".to_owned())]));
        let number = sheet.append_row(SheetRow::from_cells(vec![Some("v".to_owned())]));
        assert_eq!(number, 2);
        assert_eq!(sheet.last_used_row(), 2);
    }

    #[test]
    fn read_cell_distinguishes_missing_sheet_and_empty_cell() {
        let mut doc = WorkbookDoc::default();
        let sheet = doc.ensure_sheet("Sheet2");
        let mut row = SheetRow::default();
        row.set_cell(5, Some("123.4".to_owned()));
        sheet.rows.resize_with(3, SheetRow::default);
        sheet.rows.push(row);

        let hit = CellRef::parse("sheet2!F4").expect("parse");
        assert_eq!(
            doc.read_cell(&hit).expect("read"),
            CellRead::Value("123.4".to_owned())
        );
        let empty = CellRef::parse("Sheet2!A1").expect("parse");
        assert_eq!(doc.read_cell(&empty).expect("read"), CellRead::Empty);
        let missing = CellRef::parse("Sheet9!A1").expect("parse");
        assert_eq!(doc.read_cell(&missing).expect("read"), CellRead::NoSuchSheet);
    }

    #[test]
    fn refresh_picks_up_external_edits() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("log.workbook.json");
        let mut workbook = Workbook::open_or_create(&path).expect("create");
        workbook.doc_mut().ensure_sheet("Log");
        workbook.save().expect("save");

        let mut external = WorkbookDoc::default();
        external.ensure_sheet("Log");
        external.ensure_sheet("Sheet2");
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&path, serde_json::to_vec(&external).expect("serialize")).expect("write");
        // Force a distinct mtime on coarse filesystems.
        workbook.loaded_mtime = None;

        workbook.refresh().expect("refresh");
        assert!(workbook.doc().sheet("Sheet2").is_some());
    }
}
