//! Log sheet of the workbook as an event store.
//!
//! Row 1 is the header; columns are matched by name without regard to case,
//! so the operator may reorder or rename the case of columns freely. The
//! workbook is re-read before every operation when it changed on disk and
//! saved after every mutation.

use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{SlError, SlResult};
use crate::model::{
    EVENT_TEXT_COLUMN, EVENT_TYPE_COLUMN, FieldPatch, GUID_COLUMN, Guid, GuidCensus,
    LOG_TIMESTAMP_COLUMN, ROW_COLOR_COLUMN, RecordBody, RowRef, STANDARD_COLUMNS, StoreKind,
    StoreRecord,
};
use crate::store::EventStore;
use crate::workbook::{Sheet, SheetRow, Workbook};

const HEADER_ROW: usize = 1;

#[derive(Debug)]
pub struct SpreadsheetStore {
    workbook: Workbook,
    sheet: String,
    fields: Vec<String>,
}

fn header_names(sheet: &Sheet) -> Vec<Option<String>> {
    sheet.row(HEADER_ROW).map_or_else(Vec::new, |row| {
        row.cells
            .iter()
            .map(|cell| {
                cell.as_deref()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
            })
            .collect()
    })
}

fn column_index(header: &[Option<String>], name: &str) -> Option<usize> {
    header
        .iter()
        .position(|cell| cell.as_deref().is_some_and(|cell| cell.eq_ignore_ascii_case(name.trim())))
}

/// Make sure every name has a header column; returns the column of each.
fn ensure_columns(sheet: &mut Sheet, names: &[&str]) -> Vec<usize> {
    if sheet.rows.is_empty() {
        sheet.rows.push(SheetRow::default());
    }
    let mut header = header_names(sheet);
    let mut indices = Vec::with_capacity(names.len());
    for name in names {
        let idx = match column_index(&header, name) {
            Some(idx) => idx,
            None => {
                let idx = header.len();
                header.push(Some((*name).trim().to_owned()));
                if let Some(row) = sheet.row_mut(HEADER_ROW) {
                    row.set_cell(idx, Some((*name).trim().to_owned()));
                }
                tracing::info!(sheet = %sheet.name, column = %name, "header column added");
                idx
            }
        };
        indices.push(idx);
    }
    indices
}

impl SpreadsheetStore {
    pub fn open(path: &Path, sheet: &str, fields: &[String]) -> SlResult<Self> {
        let mut store = Self {
            workbook: Workbook::open_or_create(path)?,
            sheet: sheet.to_owned(),
            fields: fields.iter().map(|field| field.trim().to_owned()).collect(),
        };
        let before = store.workbook.doc().clone();
        store.prepare()?;
        if *store.workbook.doc() != before || !path.exists() {
            store.workbook.save()?;
        }
        tracing::debug!(path = %path.display(), sheet, "spreadsheet store opened");
        Ok(store)
    }

    /// Reload external edits and restore any missing header columns.
    fn prepare(&mut self) -> SlResult<()> {
        self.workbook.refresh()?;
        let mut names: Vec<&str> = STANDARD_COLUMNS.to_vec();
        names.extend(self.fields.iter().map(String::as_str));
        let sheet = self.workbook.doc_mut().ensure_sheet(&self.sheet);
        ensure_columns(sheet, &names);
        Ok(())
    }

    fn sheet(&self) -> SlResult<&Sheet> {
        self.workbook
            .doc()
            .sheet(&self.sheet)
            .ok_or_else(|| SlError::Storage(format!("sheet `{}` is missing", self.sheet)))
    }

    fn sheet_mut(&mut self) -> &mut Sheet {
        self.workbook.doc_mut().ensure_sheet(&self.sheet)
    }

    fn save(&mut self) -> SlResult<()> {
        self.workbook.save()
    }

    /// Spelling reported for a header name: the configured field's, when it
    /// names one.
    fn canonical_field(&self, name: &str) -> String {
        self.fields
            .iter()
            .find(|field| field.eq_ignore_ascii_case(name))
            .cloned()
            .unwrap_or_else(|| name.to_owned())
    }

    fn record_at(&self, header: &[Option<String>], number: usize, row: &SheetRow) -> StoreRecord {
        let mut body = RecordBody {
            row_color: row.color.clone(),
            ..RecordBody::default()
        };
        for (idx, name) in header.iter().enumerate() {
            let Some(name) = name else { continue };
            let value = row.cell(idx).map(str::to_owned);
            if name.eq_ignore_ascii_case(GUID_COLUMN) {
                body.guid = Guid::from_stored(value.as_deref());
            } else if name.eq_ignore_ascii_case(LOG_TIMESTAMP_COLUMN) {
                body.log_timestamp = value.unwrap_or_default();
            } else if name.eq_ignore_ascii_case(EVENT_TYPE_COLUMN) {
                body.event_type = value.unwrap_or_default();
            } else if name.eq_ignore_ascii_case(EVENT_TEXT_COLUMN) {
                body.event_text = value.unwrap_or_default();
            } else if let Some(value) = value {
                body.fields.insert(self.canonical_field(name), value);
            }
        }
        StoreRecord {
            store: StoreKind::Spreadsheet,
            row: number as RowRef,
            body,
        }
    }

    /// Data rows (below the header) that hold any value.
    fn records(&self) -> SlResult<Vec<StoreRecord>> {
        let sheet = self.sheet()?;
        let header = header_names(sheet);
        Ok(sheet
            .rows
            .iter()
            .enumerate()
            .skip(HEADER_ROW)
            .filter(|(_, row)| !row.is_blank())
            .map(|(idx, row)| self.record_at(&header, idx + 1, row))
            .collect())
    }

    fn data_row_number(&self, row: RowRef) -> SlResult<usize> {
        let number = usize::try_from(row)
            .map_err(|_| SlError::InvalidRequest(format!("row ref {row} out of range")))?;
        let sheet = self.sheet()?;
        match sheet.row(number) {
            Some(found) if number > HEADER_ROW && !found.is_blank() => Ok(number),
            _ => Err(SlError::Storage(format!(
                "spreadsheet row {row} not found in sheet `{}`",
                self.sheet
            ))),
        }
    }

    fn collision(guid: &Guid) -> SlError {
        SlError::GuidCollision {
            guid: guid.to_string(),
            store: StoreKind::Spreadsheet.to_string(),
        }
    }
}

impl EventStore for SpreadsheetStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Spreadsheet
    }

    fn append_record(&mut self, body: &RecordBody) -> SlResult<RowRef> {
        self.prepare()?;
        let guid = body.guid.ok_or_else(|| SlError::GuidMissing {
            store: StoreKind::Spreadsheet.to_string(),
            row: "new".to_owned(),
        })?;
        if self.records()?.iter().any(|record| record.guid() == Some(guid)) {
            return Err(Self::collision(&guid));
        }

        let mut names: Vec<&str> = STANDARD_COLUMNS.to_vec();
        names.extend(body.fields.keys().map(String::as_str));
        let sheet = self.sheet_mut();
        let columns = ensure_columns(sheet, &names);

        let mut row = SheetRow::default();
        let mut values = vec![
            Some(guid.to_string()),
            Some(body.log_timestamp.clone()),
            Some(body.event_type.clone()),
            Some(body.event_text.clone()),
        ];
        values.extend(body.fields.values().cloned().map(Some));
        for (column, value) in columns.into_iter().zip(values) {
            row.set_cell(column, value);
        }
        row.color.clone_from(&body.row_color);
        let number = sheet.append_row(row);
        self.save()?;
        tracing::debug!(guid = %guid, row = number, "spreadsheet row appended");
        Ok(number as RowRef)
    }

    fn records_for_guid(&mut self, guid: &Guid) -> SlResult<Vec<StoreRecord>> {
        self.prepare()?;
        Ok(self
            .records()?
            .into_iter()
            .filter(|record| record.guid() == Some(*guid))
            .collect())
    }

    fn list_guids(&mut self) -> SlResult<GuidCensus> {
        self.prepare()?;
        let mut census = GuidCensus::default();
        for record in self.records()? {
            census.record(record.guid(), record.row);
        }
        Ok(census)
    }

    fn all_records(&mut self) -> SlResult<Vec<StoreRecord>> {
        self.prepare()?;
        self.records()
    }

    fn update(&mut self, guid: &Guid, patch: &FieldPatch) -> SlResult<usize> {
        if patch.is_empty() {
            return Ok(0);
        }
        if patch.keys().any(|key| key.eq_ignore_ascii_case(GUID_COLUMN)) {
            return Err(SlError::InvalidRequest(
                "guid column cannot be patched; use assign_guid".to_owned(),
            ));
        }
        self.prepare()?;
        let targets: BTreeSet<usize> = self
            .records()?
            .into_iter()
            .filter(|record| record.guid() == Some(*guid))
            .map(|record| record.row as usize)
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let cell_keys: Vec<&str> = patch
            .keys()
            .map(String::as_str)
            .filter(|key| !key.eq_ignore_ascii_case(ROW_COLOR_COLUMN))
            .collect();
        let sheet = self.sheet_mut();
        let columns = ensure_columns(sheet, &cell_keys);
        for number in &targets {
            let Some(row) = sheet.row_mut(*number) else {
                continue;
            };
            for (key, column) in cell_keys.iter().zip(&columns) {
                row.set_cell(*column, patch.get(*key).cloned().flatten());
            }
            if let Some((_, color)) = patch
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(ROW_COLOR_COLUMN))
            {
                row.color.clone_from(color);
            }
        }
        self.save()?;
        tracing::debug!(guid = %guid, columns = patch.len(), changed = targets.len(), "spreadsheet rows updated");
        Ok(targets.len())
    }

    /// Removing a row shifts every row below it up by one; callers deleting
    /// several rows go bottom-up.
    fn delete_row(&mut self, row: RowRef) -> SlResult<()> {
        self.prepare()?;
        let number = self.data_row_number(row)?;
        self.sheet_mut().delete_row(number);
        self.save()
    }

    fn assign_guid(&mut self, row: RowRef, guid: Guid) -> SlResult<()> {
        self.prepare()?;
        let number = self.data_row_number(row)?;
        if self
            .records()?
            .iter()
            .any(|record| record.guid() == Some(guid) && record.row != row)
        {
            return Err(Self::collision(&guid));
        }
        let sheet = self.sheet_mut();
        let column = ensure_columns(sheet, &[GUID_COLUMN])[0];
        if let Some(target) = sheet.row_mut(number) {
            target.set_cell(column, Some(guid.to_string()));
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use super::*;
    use crate::workbook::WorkbookDoc;

    fn fields() -> Vec<String> {
        vec!["KP".to_owned(), "Event".to_owned()]
    }

    fn body(guid: Guid, kp: &str) -> RecordBody {
        let mut fields = BTreeMap::new();
        fields.insert("KP".to_owned(), kp.to_owned());
        fields.insert("Event".to_owned(), "WROV".to_owned());
        RecordBody {
            guid: Some(guid),
            log_timestamp: "2024-05-01T08:30:00Z".to_owned(),
            event_type: "Event".to_owned(),
            event_text: "WROV".to_owned(),
            fields,
            row_color: Some("#C6EFCE".to_owned()),
        }
    }

    #[test]
    fn open_writes_header_with_record_id() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("log.workbook.json");
        SpreadsheetStore::open(&path, "Log", &fields()).expect("open");
        let workbook = Workbook::open(&path).expect("reopen");
        let header = header_names(workbook.doc().sheet("Log").expect("sheet"));
        let names: Vec<_> = header.into_iter().flatten().collect();
        assert_eq!(
            names,
            vec!["RecordID", "LogTimestamp", "EventType", "EventText", "KP", "Event"]
        );
    }

    #[test]
    fn append_then_find_round_trips_body_and_colour() {
        let dir = tempdir().expect("tempdir");
        let mut store =
            SpreadsheetStore::open(&dir.path().join("log.workbook.json"), "Log", &fields()).expect("open");
        let guid = Guid::new_random();
        let row = store.append_record(&body(guid, "15.964")).expect("append");
        assert_eq!(row, 2);
        let found = store.find_by_guid(&guid).expect("find").expect("present");
        assert_eq!(found.body, body(guid, "15.964"));
        let err = store.append_record(&body(guid, "1.0")).expect_err("collision");
        assert_eq!(err.error_code(), "SL-GUID-COLLISION");
    }

    #[test]
    fn operator_layout_and_blank_guid_rows_are_read() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("log.workbook.json");
        let guid = Guid::new_random();
        let mut doc = WorkbookDoc::default();
        let sheet = doc.ensure_sheet("Log");
        sheet.rows.push(SheetRow::from_cells(vec![
            Some("kp".into()),
            Some("recordid".into()),
            Some("Remarks".into()),
        ]));
        sheet.rows.push(SheetRow::from_cells(vec![
            Some("15.964".into()),
            Some(guid.to_string().to_uppercase()),
            Some("ROV launched".into()),
        ]));
        sheet.rows.push(SheetRow::from_cells(vec![Some("16.000".into()), None, None]));
        std::fs::write(&path, serde_json::to_vec(&doc).expect("json")).expect("write");

        let mut store = SpreadsheetStore::open(&path, "Log", &fields()).expect("open");
        let census = store.list_guids().expect("census");
        assert_eq!(census.count(&guid), 1);
        assert_eq!(census.missing, vec![3]);

        let record = store.find_by_guid(&guid).expect("find").expect("present");
        assert_eq!(record.body.fields.get("KP").map(String::as_str), Some("15.964"));
        assert_eq!(record.body.fields.get("Remarks").map(String::as_str), Some("ROV launched"));
    }

    #[test]
    fn external_edits_are_seen_on_next_operation() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("log.workbook.json");
        let mut store = SpreadsheetStore::open(&path, "Log", &fields()).expect("open");
        let guid = Guid::new_random();
        store.append_record(&body(guid, "1.0")).expect("append");

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut external = Workbook::open(&path).expect("external open");
        let sheet = external.doc_mut().sheet_mut("Log").expect("sheet");
        let kp = column_index(&header_names(sheet), "KP").expect("kp column");
        sheet.row_mut(2).expect("row").set_cell(kp, Some("1.25".into()));
        external.save().expect("external save");

        let record = store.find_by_guid(&guid).expect("find").expect("present");
        assert_eq!(record.body.fields.get("KP").map(String::as_str), Some("1.25"));
    }

    #[test]
    fn update_assign_and_delete() {
        let dir = tempdir().expect("tempdir");
        let mut store =
            SpreadsheetStore::open(&dir.path().join("log.workbook.json"), "Log", &fields()).expect("open");
        let first = Guid::new_random();
        let second = Guid::new_random();
        store.append_record(&body(first, "1.0")).expect("a");
        let row_b = store.append_record(&body(second, "2.0")).expect("b");

        let mut patch = FieldPatch::new();
        patch.insert("kp".into(), Some("1.5".into()));
        patch.insert(ROW_COLOR_COLUMN.into(), None);
        assert_eq!(store.update(&first, &patch).expect("update"), 1);
        let record = store.find_by_guid(&first).expect("find").expect("present");
        assert_eq!(record.body.fields.get("KP").map(String::as_str), Some("1.5"));
        assert_eq!(record.body.row_color, None);

        assert_eq!(
            store.assign_guid(row_b, first).expect_err("collision").error_code(),
            "SL-GUID-COLLISION"
        );
        store.delete_row(2).expect("delete first");
        let moved = store.find_by_guid(&second).expect("find").expect("present");
        assert_eq!(moved.row, 2);
        assert!(store.delete_row(1).is_err());
        assert!(store.delete_row(9).is_err());
    }
}
