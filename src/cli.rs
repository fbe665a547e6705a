use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::DEFAULT_SETTINGS_FILE;
use crate::conflict::{ConflictEntry, Decision, DecisionPrompt};
use crate::error::{SlError, SlResult};
use crate::model::Guid;

// ---------------------------------------------------------------------------
// Graceful Ctrl+C shutdown
// ---------------------------------------------------------------------------

/// Global flag indicating that a shutdown signal has been received.
static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

/// Coordinates graceful Ctrl+C shutdown.
///
/// When a signal is received the controller sets a global `AtomicBool` that
/// every [`CancellationToken`](crate::cancel::CancellationToken) observes, so
/// sync passes stop between repairs and scheduler tasks stop at their next
/// tick.
pub struct ShutdownController;

impl ShutdownController {
    /// Install the Ctrl+C signal handler.
    ///
    /// `on_signal` is an optional callback invoked from the signal-handler
    /// context. Errors are non-fatal; callers may log and continue.
    pub fn install(on_signal: Option<Box<dyn Fn() + Send + Sync + 'static>>) -> SlResult<()> {
        ctrlc::set_handler(move || {
            SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
            tracing::info!("shutdown signal received (Ctrl+C)");
            if let Some(ref cb) = on_signal {
                cb();
            }
        })
        .map_err(|e| SlError::Io(std::io::Error::other(format!("ctrlc handler: {e}"))))?;
        Ok(())
    }

    /// Returns `true` once a Ctrl+C (or programmatic trigger) has been received.
    #[must_use]
    pub fn is_shutting_down() -> bool {
        SHUTDOWN_FLAG.load(Ordering::SeqCst)
    }

    pub fn trigger_shutdown() {
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub const fn signal_exit_code() -> i32 {
        130 // 128 + SIGINT(2)
    }
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "survey_log")]
#[command(about = "Survey event logger writing to a workbook and a SQLite database, kept in step by GUID")]
pub struct Cli {
    /// Settings document.
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_FILE)]
    pub config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise; SURVEY_LOG_FORMAT=json for JSON lines.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Log one button press to both stores.
    Log(LogArgs),
    /// List the built-in and configured buttons.
    Buttons,
    /// Reconcile the two stores and repair what can be repaired.
    Sync(SyncArgs),
    Conflicts {
        #[command(subcommand)]
        command: ConflictsCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Run the scheduler (feeds, New Day, Hourly KP, periodic sync) until Ctrl+C.
    Run,
}

#[derive(Debug, Args)]
pub struct LogArgs {
    /// Button id, e.g. "Log on", "Event", "SVP".
    pub button: String,

    /// Replace the button's event text.
    #[arg(long)]
    pub text: Option<String>,

    /// Print the logged event and per-store outcome as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Report differences without repairing or recording conflicts.
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConflictsCommand {
    /// Show conflicts awaiting a decision.
    List {
        /// Include applied conflicts.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Decide one conflict and apply the decision to both stores.
    Resolve(ResolveArgs),
    /// Put a conflict back for the next pass without deciding.
    Dismiss { guid: String },
    /// Walk through every open conflict interactively.
    Review,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    pub guid: String,

    pub action: ResolveAction,

    /// Variant index for `keep` / `split` (0 is A).
    #[arg(long)]
    pub variant: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResolveAction {
    KeepA,
    KeepB,
    SplitA,
    SplitB,
    Keep,
    Split,
}

impl ResolveArgs {
    pub fn guid(&self) -> SlResult<Guid> {
        self.guid.parse()
    }

    pub fn decision(&self) -> SlResult<Decision> {
        let needs_variant = || {
            self.variant.ok_or_else(|| {
                SlError::InvalidRequest("`keep` and `split` need --variant <N>".to_owned())
            })
        };
        Ok(match self.action {
            ResolveAction::KeepA => Decision::KEEP_A,
            ResolveAction::KeepB => Decision::KEEP_B,
            ResolveAction::SplitA => Decision::SPLIT_A,
            ResolveAction::SplitB => Decision::SPLIT_B,
            ResolveAction::Keep => Decision::Keep {
                variant: needs_variant()?,
            },
            ResolveAction::Split => Decision::AssignNewGuid {
                variant: needs_variant()?,
            },
        })
    }
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Load and validate the settings document.
    Check,
    /// Write starter settings next to the given path.
    Init {
        /// Overwrite an existing settings file.
        #[arg(long)]
        force: bool,
    },
}

// ---------------------------------------------------------------------------
// Conflict rendering / interactive decisions
// ---------------------------------------------------------------------------

/// "A", "B", ... for the first 26 variants, then the index.
#[must_use]
pub fn variant_label(index: usize) -> String {
    u8::try_from(index)
        .ok()
        .filter(|index| *index < 26)
        .map_or_else(|| format!("#{index}"), |index| char::from(b'A' + index).to_string())
}

const FIELD_WIDTH: usize = 14;
const VALUE_WIDTH: usize = 26;

fn cell(text: &str) -> String {
    if text.chars().count() > VALUE_WIDTH {
        let cut: String = text.chars().take(VALUE_WIDTH - 1).collect();
        format!("{cut}~")
    } else {
        text.to_owned()
    }
}

/// Conflicting copies side by side, one column per variant.
#[must_use]
pub fn render_conflict(entry: &ConflictEntry) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {:?} [{}] seen {}x since {}",
        entry.guid,
        entry.kind,
        entry.state.as_str(),
        entry.detection_count,
        entry.detected_at_rfc3339
    );

    let mut line = format!("  {:<FIELD_WIDTH$}", "");
    for index in 0..entry.variants.len() {
        let _ = write!(line, " | {:<VALUE_WIDTH$}", variant_label(index));
    }
    let _ = writeln!(out, "{}", line.trim_end());

    let mut rows: Vec<(String, Vec<String>)> = vec![
        (
            "copies".to_owned(),
            entry
                .variants
                .iter()
                .map(|variant| {
                    variant
                        .copies
                        .iter()
                        .map(|copy| format!("{}:{}", &copy.store.as_str()[..2], copy.row))
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect(),
        ),
        (
            "LogTimestamp".to_owned(),
            entry.variants.iter().map(|v| v.body.log_timestamp.clone()).collect(),
        ),
        (
            "EventType".to_owned(),
            entry.variants.iter().map(|v| v.body.event_type.clone()).collect(),
        ),
        (
            "EventText".to_owned(),
            entry.variants.iter().map(|v| v.body.event_text.clone()).collect(),
        ),
    ];
    let names: BTreeSet<&String> = entry
        .variants
        .iter()
        .flat_map(|variant| variant.body.fields.keys())
        .collect();
    for name in names {
        rows.push((
            name.clone(),
            entry
                .variants
                .iter()
                .map(|variant| variant.body.fields.get(name).cloned().unwrap_or_default())
                .collect(),
        ));
    }

    for (name, values) in rows {
        let differs = values.iter().collect::<BTreeSet<_>>().len() > 1;
        let mut line = format!("{} {:<FIELD_WIDTH$}", if differs { "*" } else { " " }, name);
        for value in values {
            let _ = write!(line, " | {:<VALUE_WIDTH$}", cell(&value));
        }
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}

/// Parse one operator answer. `Ok(None)` dismisses.
pub fn parse_answer(answer: &str, variants: usize) -> SlResult<Option<Decision>> {
    let answer = answer.trim().to_ascii_lowercase();
    let (verb, target) = match answer.split_once(|c: char| c == ' ' || c == '-') {
        Some((verb, target)) => (verb.to_owned(), target.trim().to_owned()),
        None => (answer.clone(), String::new()),
    };
    let index = |target: &str| -> SlResult<usize> {
        let index = match target.as_bytes() {
            [letter] if letter.is_ascii_lowercase() => usize::from(letter - b'a'),
            _ => target
                .parse()
                .map_err(|_| SlError::InvalidRequest(format!("unknown variant `{target}`")))?,
        };
        if index < variants {
            Ok(index)
        } else {
            Err(SlError::InvalidRequest(format!("no variant {}", variant_label(index))))
        }
    };
    match verb.as_str() {
        "" | "d" | "dismiss" => Ok(None),
        "keep" | "k" => Ok(Some(Decision::Keep { variant: index(&target)? })),
        "split" | "s" => Ok(Some(Decision::AssignNewGuid { variant: index(&target)? })),
        _ => Err(SlError::InvalidRequest(format!("unrecognised answer `{answer}`"))),
    }
}

/// Asks on a line-oriented terminal. End of input dismisses.
pub struct TerminalPrompt<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> TerminalPrompt<R, W> {
    pub const fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> DecisionPrompt for TerminalPrompt<R, W> {
    fn decide(&mut self, entry: &ConflictEntry) -> SlResult<Option<Decision>> {
        write!(self.output, "\n{}", render_conflict(entry))?;
        loop {
            write!(
                self.output,
                "keep-a | keep-b | split-a | split-b | keep <n> | split <n> | dismiss [dismiss]: "
            )?;
            self.output.flush()?;
            let mut answer = String::new();
            if self.input.read_line(&mut answer)? == 0 {
                return Ok(None);
            }
            match parse_answer(&answer, entry.variants.len()) {
                Ok(decision) => return Ok(decision),
                Err(error) => writeln!(self.output, "{error}")?,
            }
        }
    }
}
