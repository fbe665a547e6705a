use thiserror::Error;

pub type SlResult<T> = Result<T, SlError>;

#[derive(Debug, Error)]
pub enum SlError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite failure: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("mapping `{field}` points at unavailable data: {detail}")]
    UnresolvedSource { field: String, detail: String },

    #[error("mapping `{field}` expected {expected} but found `{found}`")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("write to {store} store failed: {detail}")]
    StoreWriteFailure { store: String, detail: String },

    #[error("guid {guid} already present in {store} store")]
    GuidCollision { guid: String, store: String },

    #[error("{store} row {row} has no guid")]
    GuidMissing { store: String, row: String },

    #[error("timed out after {timeout_ms}ms waiting for {target} lock")]
    LockTimeout { target: String, timeout_ms: u64 },

    #[error("stores are busy with {holder} (pid {pid}, started {since}); delete {lock} if that process has exited")]
    StoresBusy {
        holder: String,
        pid: u32,
        since: String,
        lock: String,
    },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("conflict state error: {0}")]
    ConflictState(String),
}

impl SlError {
    #[must_use]
    pub fn store_write(store: impl Into<String>, source: &SlError) -> Self {
        Self::StoreWriteFailure {
            store: store.into(),
            detail: source.to_string(),
        }
    }

    /// Field-level failures never abort an event; they are recorded as an
    /// absent value on the composed event.
    #[must_use]
    pub const fn is_field_local(&self) -> bool {
        matches!(
            self,
            Self::UnresolvedSource { .. } | Self::TypeMismatch { .. }
        )
    }

    /// Stable, unique, machine-readable error code for every variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "SL-IO",
            Self::Json(_) => "SL-JSON",
            Self::Sql(_) => "SL-SQL",
            Self::Config(_) => "SL-CONFIG",
            Self::InvalidRequest(_) => "SL-INVALID-REQUEST",
            Self::Storage(_) => "SL-STORAGE",
            Self::UnresolvedSource { .. } => "SL-UNRESOLVED-SOURCE",
            Self::TypeMismatch { .. } => "SL-TYPE-MISMATCH",
            Self::StoreWriteFailure { .. } => "SL-STORE-WRITE",
            Self::GuidCollision { .. } => "SL-GUID-COLLISION",
            Self::GuidMissing { .. } => "SL-GUID-MISSING",
            Self::LockTimeout { .. } => "SL-LOCK-TIMEOUT",
            Self::StoresBusy { .. } => "SL-STORES-BUSY",
            Self::Cancelled(_) => "SL-CANCELLED",
            Self::ConflictState(_) => "SL-CONFLICT-STATE",
        }
    }
}
