use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::cli::ShutdownController;
use crate::error::{SlError, SlResult};

/// Cooperative cancellation for sync passes and scheduler loops.
///
/// Cancelled by [`cancel`](Self::cancel) on any clone, by an expired
/// deadline, or by the process-wide Ctrl+C flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    deadline: Option<DateTime<Utc>>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_deadline_from_now(duration: std::time::Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Utc::now().checked_add_signed(chrono::Duration::milliseconds(millis)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn checkpoint(&self) -> SlResult<()> {
        if ShutdownController::is_shutting_down() {
            return Err(SlError::Cancelled("cancelled via Ctrl+C".to_owned()));
        }
        if self.flag.load(Ordering::SeqCst) {
            return Err(SlError::Cancelled("cancelled by request".to_owned()));
        }
        if let Some(deadline) = self.deadline
            && Utc::now() >= deadline
        {
            return Err(SlError::Cancelled("deadline exceeded".to_owned()));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.checkpoint().is_err()
    }
}
