//! Background timer tasks of a running session.
//!
//! Every task is a named thread sleeping in short slices so it notices
//! cancellation (or Ctrl+C) within one tick.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Timelike};

use crate::cancel::CancellationToken;
use crate::error::SlResult;
use crate::logger::LoggingSession;
use crate::textsource::TextFeedWatcher;

const TICK: Duration = Duration::from_millis(200);

/// Time until one second past the next local midnight.
#[must_use]
pub fn duration_until_next_midnight(now: DateTime<FixedOffset>) -> Duration {
    let Some(tomorrow) = now.date_naive().succ_opt() else {
        return Duration::ZERO;
    };
    let target = tomorrow.and_time(NaiveTime::from_hms_opt(0, 0, 1).unwrap_or(NaiveTime::MIN));
    now.offset()
        .from_local_datetime(&target)
        .single()
        .and_then(|target| (target - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// Time until the top of the next hour.
#[must_use]
pub fn duration_until_next_hour(now: DateTime<FixedOffset>) -> Duration {
    let into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
    let nanos = u64::from(now.nanosecond().min(999_999_999));
    Duration::from_secs(3600_u64.saturating_sub(into_hour)).saturating_sub(Duration::from_nanos(nanos))
}

/// Sleep `duration` in ticks. Returns `false` when cancelled first.
fn sleep_unless_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if token.is_cancelled() {
            return false;
        }
        let step = remaining.min(TICK);
        thread::sleep(step);
        remaining -= step;
    }
    !token.is_cancelled()
}

pub struct Scheduler {
    token: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.task_names())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Spawn the tasks the session's settings enable.
    pub fn start(session: Arc<LoggingSession>, token: CancellationToken) -> SlResult<Self> {
        let mut scheduler = Self {
            token,
            handles: Vec::new(),
        };
        let auto = session.settings().auto_events.clone();

        if !session.settings().monitored_folders.is_empty() {
            let every = Duration::from_secs(auto.folder_refresh_secs.max(1));
            scheduler.spawn("folder-refresh", &session, move |session, token| {
                while !token.is_cancelled() {
                    session.folders().refresh_all();
                    if !sleep_unless_cancelled(token, every) {
                        break;
                    }
                }
            })?;
        }

        if session
            .settings()
            .text_sources
            .values()
            .any(|source| source.trigger_button.is_some())
        {
            let every = Duration::from_millis(auto.feed_poll_ms.max(10));
            scheduler.spawn("feed-watch", &session, move |session, token| {
                let mut watcher = TextFeedWatcher::new();
                loop {
                    let sources = session
                        .settings()
                        .text_sources
                        .iter()
                        .filter(|(_, source)| source.trigger_button.is_some());
                    for key in watcher.poll(sources) {
                        if let Err(error) = session.feed_trigger(&key) {
                            tracing::warn!(source = %key, code = error.error_code(), %error, "feed event failed");
                        }
                    }
                    if !sleep_unless_cancelled(token, every) {
                        break;
                    }
                }
            })?;
        }

        if auto.new_day {
            scheduler.spawn("new-day", &session, |session, token| {
                while sleep_unless_cancelled(token, duration_until_next_midnight(session.now())) {
                    if let Err(error) = session.new_day() {
                        tracing::warn!(code = error.error_code(), %error, "new day event failed");
                    }
                }
            })?;
        }

        if auto.hourly_kp {
            scheduler.spawn("hourly-kp", &session, |session, token| {
                while sleep_unless_cancelled(token, duration_until_next_hour(session.now())) {
                    if let Err(error) = session.hourly_kp() {
                        tracing::warn!(code = error.error_code(), %error, "hourly KP event failed");
                    }
                }
            })?;
        }

        if let Some(secs) = auto.sync_interval_secs {
            let every = Duration::from_secs(secs);
            scheduler.spawn("periodic-sync", &session, move |session, token| {
                while sleep_unless_cancelled(token, every) {
                    match session.sync(token) {
                        Ok(summary) => tracing::debug!(?summary, "periodic sync finished"),
                        Err(error) if token.is_cancelled() => {
                            tracing::debug!(%error, "periodic sync interrupted");
                            break;
                        }
                        Err(error) => {
                            tracing::warn!(code = error.error_code(), %error, "periodic sync failed");
                        }
                    }
                }
            })?;
        }

        tracing::info!(tasks = ?scheduler.task_names(), "scheduler started");
        Ok(scheduler)
    }

    fn spawn(
        &mut self,
        name: &str,
        session: &Arc<LoggingSession>,
        task: impl FnOnce(&LoggingSession, &CancellationToken) + Send + 'static,
    ) -> SlResult<()> {
        let session = Arc::clone(session);
        let token = self.token.clone();
        let handle = thread::Builder::new()
            .name(format!("survey-log-{name}"))
            .spawn(move || task(&session, &token))?;
        self.handles.push((name.to_owned(), handle));
        Ok(())
    }

    #[must_use]
    pub fn task_names(&self) -> Vec<&str> {
        self.handles.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Wait for every task to finish. Call [`stop`](Self::stop) first unless
    /// the token is cancelled elsewhere.
    pub fn join(self) {
        for (name, handle) in self.handles {
            if handle.join().is_err() {
                tracing::error!(task = %name, "scheduler task panicked");
            }
        }
        tracing::info!("scheduler stopped");
    }
}
