//! Monitored text feeds and folders.
//!
//! Navigation software appends one comma-separated line per fix to a text
//! file; a new file is started periodically. The logger always reads the
//! newest file (by modification time) and uses its latest *complete* line.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::config::{MonitoredFolderSettings, TextSourceSettings};
use crate::error::{SlError, SlResult};
use crate::mapping::ColumnRef;

const READ_RETRY_ATTEMPTS: usize = 3;
const READ_RETRY_BASE_BACKOFF_MS: u64 = 50;

/// Value written for a monitored folder that holds no matching file.
pub const NO_FILE_MARKER: &str = "N/A";

// ---------------------------------------------------------------------------
// Latest file
// ---------------------------------------------------------------------------

fn extension_matches(path: &Path, extension: &str) -> bool {
    let wanted = extension.trim().trim_start_matches('.');
    if wanted.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted))
}

/// Newest regular file in `folder` whose extension matches. `Ok(None)` when
/// the folder is empty; a missing folder is an error.
pub fn find_latest_file(folder: &Path, extension: &str) -> SlResult<Option<PathBuf>> {
    let entries = fs::read_dir(folder).map_err(|error| {
        SlError::Io(std::io::Error::new(
            error.kind(),
            format!("cannot list {}: {error}", folder.display()),
        ))
    })?;

    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() || !extension_matches(&path, extension) {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        // Ties resolve by name so repeated scans agree.
        let newer = match &latest {
            None => true,
            Some((best, best_path)) => {
                modified > *best || (modified == *best && path > *best_path)
            }
        };
        if newer {
            latest = Some((modified, path));
        }
    }
    Ok(latest.map(|(_, path)| path))
}

// ---------------------------------------------------------------------------
// Latest complete row
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRow {
    pub source_key: String,
    pub file_path: PathBuf,
    pub header: Option<Vec<String>>,
    pub values: Vec<String>,
}

impl TextRow {
    #[must_use]
    pub fn column(&self, column: &ColumnRef) -> Option<&str> {
        let idx = match column {
            ColumnRef::Index(idx) => *idx,
            ColumnRef::Header(name) => self
                .header
                .as_ref()?
                .iter()
                .position(|header| header.eq_ignore_ascii_case(name.trim()))?,
        };
        self.values.get(idx).map(String::as_str)
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn decode(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        // Latin-1 maps every byte to the code point of the same value.
        Err(error) => error.into_bytes().iter().map(|b| char::from(*b)).collect(),
    }
}

fn read_with_retry(path: &Path) -> SlResult<String> {
    let mut attempt = 0;
    loop {
        match fs::read(path) {
            Ok(bytes) => return Ok(decode(bytes)),
            Err(error) if attempt + 1 < READ_RETRY_ATTEMPTS => {
                attempt += 1;
                tracing::debug!(
                    path = %path.display(),
                    attempt,
                    error = %error,
                    "text file read failed; retrying"
                );
                std::thread::sleep(Duration::from_millis(
                    READ_RETRY_BASE_BACKOFF_MS * attempt as u64,
                ));
            }
            Err(error) => return Err(SlError::Io(error)),
        }
    }
}

fn split_fields(line: &str) -> Vec<String> {
    line.split(',').map(|part| part.trim().to_owned()).collect()
}

/// Parse file content into `(header, latest complete row)`.
///
/// A line counts as complete only once its newline has been written, so a
/// fix still being appended is never read half-way.
fn parse_latest(text: &str, has_header: bool) -> (Option<Vec<String>>, Option<Vec<String>>) {
    let complete = match text.rfind('\n') {
        Some(end) => &text[..end],
        None => "",
    };
    let mut lines = complete
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty());

    let header = if has_header {
        lines.next().map(split_fields)
    } else {
        None
    };
    let latest = lines.next_back().map(split_fields);
    (header, latest)
}

/// Read the latest complete row of `path`. `Ok(None)` when the file holds no
/// complete data line yet.
pub fn read_latest_row(source_key: &str, path: &Path, has_header: bool) -> SlResult<Option<TextRow>> {
    let text = read_with_retry(path)?;
    let (header, latest) = parse_latest(&text, has_header);
    Ok(latest.map(|values| TextRow {
        source_key: source_key.to_owned(),
        file_path: path.to_path_buf(),
        header,
        values,
    }))
}

/// Latest row of the newest file of one configured text source.
pub fn read_source(key: &str, source: &TextSourceSettings) -> SlResult<Option<TextRow>> {
    let Some(path) = find_latest_file(&source.folder, &source.extension)? else {
        tracing::debug!(source = key, folder = %source.folder.display(), "no text file in folder");
        return Ok(None);
    };
    read_latest_row(key, &path, source.has_header)
}

// ---------------------------------------------------------------------------
// Monitored folders
// ---------------------------------------------------------------------------

/// Latest file name per monitored folder, refreshed by the scheduler and on
/// demand when a folder has not been scanned yet.
#[derive(Debug, Default)]
pub struct FolderCache {
    folders: BTreeMap<String, MonitoredFolderSettings>,
    latest: Mutex<HashMap<String, Option<String>>>,
}

impl FolderCache {
    #[must_use]
    pub fn new(folders: BTreeMap<String, MonitoredFolderSettings>) -> Self {
        Self {
            folders,
            latest: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.folders.contains_key(name)
    }

    /// Rescan every folder. Folders that cannot be listed are logged and
    /// cached as having no file.
    pub fn refresh_all(&self) {
        for name in self.folders.keys() {
            if let Err(error) = self.refresh(name) {
                tracing::warn!(folder = %name, error = %error, "monitored folder scan failed");
            }
        }
    }

    pub fn refresh(&self, name: &str) -> SlResult<Option<String>> {
        let settings = self.folders.get(name).ok_or_else(|| {
            SlError::Config(format!("monitored folder `{name}` is not configured"))
        })?;
        let scanned = find_latest_file(&settings.folder, &settings.extension);
        let latest = match &scanned {
            Ok(path) => path
                .as_ref()
                .and_then(|path| path.file_name())
                .map(|name| name.to_string_lossy().into_owned()),
            Err(_) => None,
        };
        self.lock().insert(name.to_owned(), latest.clone());
        scanned.map(|_| latest)
    }

    /// Cached latest file name, scanning the folder when not cached yet.
    pub fn latest_name(&self, name: &str) -> SlResult<Option<String>> {
        if let Some(cached) = self.lock().get(name) {
            return Ok(cached.clone());
        }
        self.refresh(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<String>>> {
        self.latest
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Feed watcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct FeedMark {
    path: PathBuf,
    len: u64,
    modified: Option<SystemTime>,
}

/// Detects new data in text sources by polling the newest file's size and
/// modification time.
#[derive(Debug, Default)]
pub struct TextFeedWatcher {
    marks: HashMap<String, FeedMark>,
}

impl TextFeedWatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys of sources whose newest file changed since the previous poll.
    /// The first poll of a source only records its mark.
    pub fn poll<'a>(
        &mut self,
        sources: impl IntoIterator<Item = (&'a String, &'a TextSourceSettings)>,
    ) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, source) in sources {
            let mark = match find_latest_file(&source.folder, &source.extension) {
                Ok(Some(path)) => match fs::metadata(&path) {
                    Ok(metadata) => FeedMark {
                        path,
                        len: metadata.len(),
                        modified: metadata.modified().ok(),
                    },
                    Err(_) => continue,
                },
                Ok(None) => continue,
                Err(error) => {
                    tracing::debug!(source = %key, error = %error, "text feed poll failed");
                    continue;
                }
            };
            match self.marks.insert(key.clone(), mark.clone()) {
                Some(previous) if previous != mark => changed.push(key.clone()),
                _ => {}
            }
        }
        changed
    }
}
