use std::fs;
use std::path::Path;
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, params, params_from_iter};

use crate::error::{SlError, SlResult};
use crate::model::{
    EVENT_TEXT_COLUMN, EVENT_TYPE_COLUMN, FieldPatch, GUID_COLUMN, Guid, GuidCensus,
    LOG_TIMESTAMP_COLUMN, ROW_COLOR_COLUMN, RecordBody, RowRef, StoreKind, StoreRecord,
};
use crate::store::EventStore;

const ROW_ID_COLUMN: &str = "row_id";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const BUSY_RETRY_ATTEMPTS: usize = 4;
const BUSY_BASE_BACKOFF_MS: u64 = 25;

/// Non-field columns in read order.
const FIXED_COLUMNS: [&str; 5] = [
    GUID_COLUMN,
    LOG_TIMESTAMP_COLUMN,
    EVENT_TYPE_COLUMN,
    EVENT_TEXT_COLUMN,
    ROW_COLOR_COLUMN,
];

fn sql_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            code.code == ErrorCode::ConstraintViolation
                || message.as_deref().is_some_and(|value| {
                    value.contains("UNIQUE constraint failed")
                        || value.contains("PRIMARY KEY constraint failed")
                })
        }
        _ => false,
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == ErrorCode::DatabaseBusy || code.code == ErrorCode::DatabaseLocked
    )
}

fn value_text(value: ValueRef<'_>) -> Option<String> {
    let text = match value {
        ValueRef::Null => return None,
        ValueRef::Integer(int) => int.to_string(),
        ValueRef::Real(real) => real.to_string(),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    };
    if text.trim().is_empty() { None } else { Some(text) }
}

/// SQLite event table. The GUID column carries a unique index unless legacy
/// data already violates it, in which case duplicates are left for the
/// reconciler to report.
pub struct DatabaseStore {
    connection: Connection,
    table: String,
    /// Every column of the table, as spelled in the schema.
    columns: Vec<String>,
    /// `(field name, column name)` for every non-standard column.
    field_columns: Vec<(String, String)>,
    guid_index: bool,
}

impl std::fmt::Debug for DatabaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseStore")
            .field("table", &self.table)
            .field("fields", &self.field_columns.len())
            .field("guid_index", &self.guid_index)
            .finish_non_exhaustive()
    }
}

impl DatabaseStore {
    pub fn open(db_path: &Path, table: &str, fields: &[String]) -> SlResult<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(db_path)?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode answers with the mode in effect, not an error.
        match connection.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get::<_, String>(0)) {
            Ok(mode) if mode.eq_ignore_ascii_case("wal") => {}
            Ok(mode) => tracing::debug!(%mode, path = %db_path.display(), "database kept its journal mode"),
            Err(error) => tracing::debug!(%error, path = %db_path.display(), "WAL journal mode unavailable"),
        }

        let mut store = Self {
            connection,
            table: table.to_owned(),
            columns: Vec::new(),
            field_columns: Vec::new(),
            guid_index: false,
        };
        store.initialize_schema(fields)?;
        tracing::debug!(
            path = %db_path.display(),
            table,
            fields = store.field_columns.len(),
            guid_index = store.guid_index,
            "database store opened"
        );
        Ok(store)
    }

    fn initialize_schema(&mut self, fields: &[String]) -> SlResult<()> {
        let table = sql_ident(&self.table);
        self.connection.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                {} INTEGER PRIMARY KEY AUTOINCREMENT,
                {} TEXT,
                {} TEXT,
                {} TEXT,
                {} TEXT,
                {} TEXT
            );",
            sql_ident(ROW_ID_COLUMN),
            sql_ident(GUID_COLUMN),
            sql_ident(LOG_TIMESTAMP_COLUMN),
            sql_ident(EVENT_TYPE_COLUMN),
            sql_ident(EVENT_TEXT_COLUMN),
            sql_ident(ROW_COLOR_COLUMN),
        ))?;

        self.columns = self.table_columns()?;
        for fixed in FIXED_COLUMNS {
            self.ensure_column(fixed)?;
        }
        self.field_columns = self
            .columns
            .iter()
            .filter(|column| {
                !column.eq_ignore_ascii_case(ROW_ID_COLUMN)
                    && !FIXED_COLUMNS.iter().any(|fixed| fixed.eq_ignore_ascii_case(column))
            })
            .map(|column| (column.clone(), column.clone()))
            .collect();
        for field in fields {
            let field = field.trim();
            self.ensure_field(field)?;
            // Reads report the mapping's spelling of the name.
            if let Some(entry) = self
                .field_columns
                .iter_mut()
                .find(|(_, column)| column.eq_ignore_ascii_case(field))
            {
                entry.0 = field.to_owned();
            }
        }

        let index = sql_ident(&format!("{}_{GUID_COLUMN}_unique", self.table));
        match self.connection.execute_batch(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {index} ON {table} ({});",
            sql_ident(GUID_COLUMN)
        )) {
            Ok(()) => self.guid_index = true,
            Err(error) if is_constraint_violation(&error) => {
                tracing::warn!(
                    table = %self.table,
                    "existing rows share a guid; unique index not created, duplicates will be reported by sync"
                );
                self.guid_index = false;
            }
            Err(error) => return Err(error.into()),
        }
        Ok(())
    }

    fn table_columns(&self) -> SlResult<Vec<String>> {
        let mut stmt = self
            .connection
            .prepare(&format!("PRAGMA table_info({})", sql_ident(&self.table)))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Column name as spelled in the schema, adding the column when missing.
    fn ensure_column(&mut self, name: &str) -> SlResult<String> {
        if let Some(existing) = self.columns.iter().find(|c| c.eq_ignore_ascii_case(name)) {
            return Ok(existing.clone());
        }
        self.connection.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} TEXT;",
            sql_ident(&self.table),
            sql_ident(name)
        ))?;
        tracing::info!(table = %self.table, column = name, "column added");
        self.columns.push(name.to_owned());
        Ok(name.to_owned())
    }

    /// Column backing a field, added when missing.
    fn ensure_field(&mut self, field: &str) -> SlResult<String> {
        let field = field.trim();
        if let Some((_, column)) = self
            .field_columns
            .iter()
            .find(|(_, column)| column.eq_ignore_ascii_case(field))
        {
            return Ok(column.clone());
        }
        let column = self.ensure_column(field)?;
        self.field_columns.push((field.to_owned(), column.clone()));
        Ok(column)
    }

    /// Resolve a patch or body key to a column: one of the fixed columns or
    /// a field column.
    fn column_for(&mut self, key: &str) -> SlResult<String> {
        if key.eq_ignore_ascii_case(GUID_COLUMN) {
            return Err(SlError::InvalidRequest(
                "guid column cannot be patched; use assign_guid".to_owned(),
            ));
        }
        if let Some(fixed) = FIXED_COLUMNS.iter().find(|fixed| fixed.eq_ignore_ascii_case(key)) {
            return self.ensure_column(fixed);
        }
        self.ensure_field(key)
    }

    #[must_use]
    pub const fn has_guid_index(&self) -> bool {
        self.guid_index
    }

    fn select_sql(&self, filter: &str) -> String {
        let mut columns = vec!["rowid".to_owned()];
        columns.extend(FIXED_COLUMNS.iter().map(|fixed| sql_ident(fixed)));
        columns.extend(self.field_columns.iter().map(|(_, column)| sql_ident(column)));
        format!(
            "SELECT {} FROM {} {filter} ORDER BY rowid ASC",
            columns.join(", "),
            sql_ident(&self.table)
        )
    }

    fn read_records(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> SlResult<Vec<StoreRecord>> {
        let mut stmt = self.connection.prepare(&self.select_sql(filter))?;
        let field_names: Vec<&str> = self.field_columns.iter().map(|(name, _)| name.as_str()).collect();
        let records = stmt
            .query_map(args, |row| {
                let rowid: i64 = row.get(0)?;
                let text = |idx: usize| row.get_ref(idx).map(value_text);
                let guid = Guid::from_stored(text(1)?.as_deref());
                let mut body = RecordBody {
                    guid,
                    log_timestamp: text(2)?.unwrap_or_default(),
                    event_type: text(3)?.unwrap_or_default(),
                    event_text: text(4)?.unwrap_or_default(),
                    fields: Default::default(),
                    row_color: text(5)?,
                };
                for (offset, name) in field_names.iter().enumerate() {
                    if let Some(value) = text(6 + offset)? {
                        body.fields.insert((*name).to_owned(), value);
                    }
                }
                Ok(StoreRecord {
                    store: StoreKind::Database,
                    row: u64::try_from(rowid).unwrap_or_default(),
                    body,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn guid_filter() -> String {
        format!("WHERE lower(trim({})) = ?1", sql_ident(GUID_COLUMN))
    }

    fn insert_once(&self, columns: &[String], values: &[Option<String>]) -> rusqlite::Result<i64> {
        let placeholders: Vec<String> = (1..=columns.len()).map(|idx| format!("?{idx}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            sql_ident(&self.table),
            columns.iter().map(|c| sql_ident(c)).collect::<Vec<_>>().join(", "),
            placeholders.join(", ")
        );
        self.connection.execute(&sql, params_from_iter(values.iter()))?;
        Ok(self.connection.last_insert_rowid())
    }
}

fn row_id(row: RowRef) -> SlResult<i64> {
    i64::try_from(row).map_err(|_| SlError::InvalidRequest(format!("row ref {row} out of range")))
}

impl EventStore for DatabaseStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Database
    }

    fn append_record(&mut self, body: &RecordBody) -> SlResult<RowRef> {
        let guid = body.guid.ok_or_else(|| SlError::GuidMissing {
            store: StoreKind::Database.to_string(),
            row: "new".to_owned(),
        })?;
        if !self.guid_index && !self.records_for_guid(&guid)?.is_empty() {
            return Err(SlError::GuidCollision {
                guid: guid.to_string(),
                store: StoreKind::Database.to_string(),
            });
        }

        let mut columns = vec![
            GUID_COLUMN.to_owned(),
            LOG_TIMESTAMP_COLUMN.to_owned(),
            EVENT_TYPE_COLUMN.to_owned(),
            EVENT_TEXT_COLUMN.to_owned(),
            ROW_COLOR_COLUMN.to_owned(),
        ];
        let mut values = vec![
            Some(guid.to_string()),
            Some(body.log_timestamp.clone()),
            Some(body.event_type.clone()).filter(|v| !v.is_empty()),
            Some(body.event_text.clone()).filter(|v| !v.is_empty()),
            body.row_color.clone(),
        ];
        for (name, value) in &body.fields {
            columns.push(self.ensure_field(name)?);
            values.push(Some(value.clone()));
        }

        let mut attempt = 0;
        loop {
            match self.insert_once(&columns, &values) {
                Ok(rowid) => {
                    tracing::debug!(guid = %guid, rowid, "database row appended");
                    return Ok(u64::try_from(rowid).unwrap_or_default());
                }
                Err(error) if is_constraint_violation(&error) => {
                    return Err(SlError::GuidCollision {
                        guid: guid.to_string(),
                        store: StoreKind::Database.to_string(),
                    });
                }
                Err(error) if is_busy(&error) && attempt < BUSY_RETRY_ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(BUSY_BASE_BACKOFF_MS * attempt as u64));
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn records_for_guid(&mut self, guid: &Guid) -> SlResult<Vec<StoreRecord>> {
        let key = guid.to_string();
        self.read_records(&Self::guid_filter(), &[&key])
    }

    fn list_guids(&mut self) -> SlResult<GuidCensus> {
        let mut stmt = self.connection.prepare(&format!(
            "SELECT rowid, {} FROM {} ORDER BY rowid ASC",
            sql_ident(GUID_COLUMN),
            sql_ident(&self.table)
        ))?;
        let mut census = GuidCensus::default();
        let rows = stmt.query_map([], |row| {
            let rowid: i64 = row.get(0)?;
            Ok((rowid, row.get_ref(1).map(value_text)?))
        })?;
        for row in rows {
            let (rowid, text) = row?;
            census.record(
                Guid::from_stored(text.as_deref()),
                u64::try_from(rowid).unwrap_or_default(),
            );
        }
        Ok(census)
    }

    fn all_records(&mut self) -> SlResult<Vec<StoreRecord>> {
        self.read_records("", &[])
    }

    fn update(&mut self, guid: &Guid, patch: &FieldPatch) -> SlResult<usize> {
        if patch.is_empty() {
            return Ok(0);
        }
        let mut assignments = Vec::with_capacity(patch.len());
        let mut values: Vec<Option<String>> = Vec::with_capacity(patch.len() + 1);
        for (key, value) in patch {
            let column = self.column_for(key)?;
            assignments.push(format!("{} = ?{}", sql_ident(&column), values.len() + 1));
            values.push(value.clone());
        }
        values.push(Some(guid.to_string()));
        let sql = format!(
            "UPDATE {} SET {} WHERE lower(trim({})) = ?{}",
            sql_ident(&self.table),
            assignments.join(", "),
            sql_ident(GUID_COLUMN),
            values.len()
        );
        let changed = self.connection.execute(&sql, params_from_iter(values.iter()))?;
        tracing::debug!(guid = %guid, columns = patch.len(), changed, "database rows updated");
        Ok(changed)
    }

    fn delete_row(&mut self, row: RowRef) -> SlResult<()> {
        let changed = self.connection.execute(
            &format!("DELETE FROM {} WHERE rowid = ?1", sql_ident(&self.table)),
            params![row_id(row)?],
        )?;
        if changed == 0 {
            return Err(SlError::Storage(format!("database row {row} not found")));
        }
        Ok(())
    }

    fn assign_guid(&mut self, row: RowRef, guid: Guid) -> SlResult<()> {
        let result = self.connection.execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE rowid = ?2",
                sql_ident(&self.table),
                sql_ident(GUID_COLUMN)
            ),
            params![guid.to_string(), row_id(row)?],
        );
        match result {
            Ok(0) => Err(SlError::Storage(format!("database row {row} not found"))),
            Ok(_) => Ok(()),
            Err(error) if is_constraint_violation(&error) => Err(SlError::GuidCollision {
                guid: guid.to_string(),
                store: StoreKind::Database.to_string(),
            }),
            Err(error) => Err(error.into()),
        }
    }
}
