//! Tracing setup for the survey_log binary.
//!
//! Output goes to stderr so `--json` command output on stdout stays
//! machine-readable. `RUST_LOG` overrides the level; `SURVEY_LOG_FORMAT=json`
//! switches to one JSON object per line.

use tracing_subscriber::EnvFilter;

pub const FORMAT_ENV: &str = "SURVEY_LOG_FORMAT";

/// Install the global subscriber. A second call keeps the first subscriber.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_thread_ids(false);

    let installed = if wants_json(std::env::var(FORMAT_ENV).ok().as_deref()) {
        subscriber.json().try_init()
    } else {
        subscriber.compact().try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

const fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "survey_log=debug"
    } else {
        "survey_log=info"
    }
}

fn wants_json(format: Option<&str>) -> bool {
    format.is_some_and(|value| value.trim().eq_ignore_ascii_case("json"))
}
