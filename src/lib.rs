#![forbid(unsafe_code)]

pub mod cancel;
pub mod cli;
pub mod composer;
pub mod config;
pub mod conflict;
pub mod error;
mod fsutil;
pub mod logger;
pub mod logging;
pub mod mapping;
pub mod model;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod textsource;
pub mod workbook;

pub use cancel::CancellationToken;
pub use config::Settings;
pub use conflict::{ConflictResolver, Decision};
pub use error::{SlError, SlResult};
pub use logger::{LogOutcome, LoggingSession};
pub use model::{Event, Guid, ReconciliationReport, StoreKind};
pub use sync::{Reconciler, SyncSummary};
