//! Store adapters and the locking wrapper shared by the logger, the
//! reconciler and the conflict resolver.

pub mod database;
pub mod spreadsheet;

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use crate::error::{SlError, SlResult};
use crate::model::{
    Event, FieldPatch, Guid, GuidCensus, RecordBody, RowRef, StoreKind, StoreRecord,
};

pub use database::DatabaseStore;
pub use spreadsheet::SpreadsheetStore;

/// One persisted copy of the event log. Adapters are independent of each
/// other; cross-store consistency is the reconciler's job.
pub trait EventStore: Send {
    fn kind(&self) -> StoreKind;

    fn append(&mut self, event: &Event) -> SlResult<RowRef> {
        self.append_record(&event.to_body())
    }

    /// Append a record preserving its GUID and timestamp. Fails with
    /// `GuidCollision` when the GUID is already stored.
    fn append_record(&mut self, body: &RecordBody) -> SlResult<RowRef>;

    fn find_by_guid(&mut self, guid: &Guid) -> SlResult<Option<StoreRecord>> {
        Ok(self.records_for_guid(guid)?.into_iter().next())
    }

    /// Every copy holding `guid`, in row order.
    fn records_for_guid(&mut self, guid: &Guid) -> SlResult<Vec<StoreRecord>>;

    fn list_guids(&mut self) -> SlResult<GuidCensus>;

    fn all_records(&mut self) -> SlResult<Vec<StoreRecord>>;

    /// Apply `patch` to every row holding `guid`; returns the rows touched.
    fn update(&mut self, guid: &Guid, patch: &FieldPatch) -> SlResult<usize>;

    fn delete_row(&mut self, row: RowRef) -> SlResult<()>;

    /// Give one row a (new) GUID.
    fn assign_guid(&mut self, row: RowRef, guid: Guid) -> SlResult<()>;
}

const LOCK_BACKOFF_START_MS: u64 = 1;
const LOCK_BACKOFF_MAX_MS: u64 = 50;

/// An adapter behind a mutex whose acquisition is bounded by a timeout.
#[derive(Clone)]
pub struct SharedStore {
    kind: StoreKind,
    inner: Arc<Mutex<Box<dyn EventStore>>>,
    timeout: Duration,
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

pub type StoreGuard<'a> = MutexGuard<'a, Box<dyn EventStore>>;

impl SharedStore {
    pub fn new(store: impl EventStore + 'static, timeout: Duration) -> Self {
        Self {
            kind: store.kind(),
            inner: Arc::new(Mutex::new(Box::new(store))),
            timeout,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Acquire the store, polling with exponential backoff until the
    /// configured timeout elapses.
    pub fn lock(&self) -> SlResult<StoreGuard<'_>> {
        let started = Instant::now();
        let mut backoff = Duration::from_millis(LOCK_BACKOFF_START_MS);
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => {
                    tracing::warn!(store = %self.kind, "store lock poisoned; continuing");
                    return Ok(poisoned.into_inner());
                }
                Err(TryLockError::WouldBlock) => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.timeout {
                        return Err(SlError::LockTimeout {
                            target: format!("{} store", self.kind),
                            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                    std::thread::sleep(backoff.min(self.timeout - elapsed));
                    backoff = (backoff * 2).min(Duration::from_millis(LOCK_BACKOFF_MAX_MS));
                }
            }
        }
    }

    /// Run `op` with the lock held only for its duration.
    pub fn with<T>(&self, op: impl FnOnce(&mut dyn EventStore) -> SlResult<T>) -> SlResult<T> {
        let mut guard = self.lock()?;
        op(&mut **guard)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn lock_timeout_surfaces_as_error() {
        let dir = tempdir().expect("tempdir");
        let store = DatabaseStore::open(&dir.path().join("log.sqlite3"), "EventLog", &[])
            .expect("open");
        let shared = SharedStore::new(store, Duration::from_millis(30));

        let held = shared.lock().expect("first lock");
        let started = Instant::now();
        let err = shared.lock().err().expect("second lock must time out");
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(err.error_code(), "SL-LOCK-TIMEOUT");
        drop(held);

        assert!(shared.with(|store| store.list_guids()).is_ok());
    }

    #[test]
    fn lock_is_released_between_operations() {
        let dir = tempdir().expect("tempdir");
        let store = DatabaseStore::open(&dir.path().join("log.sqlite3"), "EventLog", &[])
            .expect("open");
        let shared = SharedStore::new(store, Duration::from_millis(30));
        let other = shared.clone();
        let handle = std::thread::spawn(move || other.with(|store| store.list_guids()).map(|c| c.total_rows()));
        assert_eq!(handle.join().expect("thread").expect("census"), 0);
        assert_eq!(shared.kind(), StoreKind::Database);
    }
}
