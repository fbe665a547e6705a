use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use survey_log::cli::{
    Cli, Command, ConfigCommand, ConflictsCommand, ShutdownController, TerminalPrompt,
    render_conflict,
};
use survey_log::conflict::ConflictState;
use survey_log::logger::{LogOutcome, LoggingSession, SessionHealth, StoreWrite};
use survey_log::model::Guid;
use survey_log::scheduler::Scheduler;
use survey_log::sync::{LockPurpose, SyncLock};
use survey_log::{CancellationToken, Settings, SlError, SlResult};

fn main() {
    let cli = Cli::parse();
    survey_log::logging::init(cli.verbose);

    if let Err(e) = ShutdownController::install(None) {
        tracing::warn!("failed to install Ctrl+C handler: {e}");
    }

    if let Err(error) = run(cli) {
        if ShutdownController::is_shutting_down() {
            eprintln!("interrupted");
            std::process::exit(ShutdownController::signal_exit_code());
        }
        eprintln!("error: {error} [{}]", error.error_code());
        std::process::exit(1);
    }

    if ShutdownController::is_shutting_down() {
        std::process::exit(ShutdownController::signal_exit_code());
    }
}

fn open_session(config: &Path) -> SlResult<LoggingSession> {
    LoggingSession::open(Settings::load(config)?)
}

fn run(cli: Cli) -> SlResult<()> {
    match cli.command {
        Command::Log(args) => {
            let session = open_session(&cli.config)?;
            let outcome = session.log_button(&args.button, args.text)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
            Ok(())
        }
        Command::Buttons => {
            let settings = Settings::load(&cli.config)?;
            for button in settings.all_buttons() {
                println!(
                    "{:<16} type={:<12} source={:<10} text={:?}",
                    button.id,
                    button.event_type,
                    button.text_source.as_deref().unwrap_or("-"),
                    button.event_text
                );
            }
            Ok(())
        }
        Command::Sync(args) => {
            let session = open_session(&cli.config)?;
            if args.dry_run {
                let report = session.reconciler().reconcile()?;
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!(
                        "matched {}  only-in-database {}  only-in-spreadsheet {}  duplicates {}  missing-guid {}  diverged {}",
                        report.matched.len(),
                        report.only_in_database.len(),
                        report.only_in_spreadsheet.len(),
                        report.duplicates.len(),
                        report.missing_guid.len(),
                        report.diverged.len()
                    );
                }
                return Ok(());
            }
            let token = CancellationToken::with_deadline_from_now(session.settings().io_timeout());
            let summary = session.sync(&token)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "matched {}  orphans repaired {}  guids assigned {}  revised {}  duplicates pending {}  mismatches pending {}  failed {}{}",
                    summary.matched,
                    summary.orphans_repaired,
                    summary.guids_assigned,
                    summary.revised,
                    summary.duplicates_pending,
                    summary.mismatches_pending,
                    summary.failed,
                    if summary.aborted { "  (aborted)" } else { "" }
                );
            }
            Ok(())
        }
        Command::Conflicts { command } => {
            let session = open_session(&cli.config)?;
            let mut resolver = session.conflict_resolver()?;
            match command {
                ConflictsCommand::List { all, json } => {
                    let entries: Vec<_> = resolver
                        .ledger()
                        .entries()
                        .iter()
                        .filter(|entry| all || entry.state != ConflictState::Applied)
                        .collect();
                    if json {
                        println!("{}", serde_json::to_string_pretty(&entries)?);
                    } else if entries.is_empty() {
                        println!("no conflicts");
                    } else {
                        for entry in entries {
                            println!("{}", render_conflict(entry));
                        }
                    }
                    Ok(())
                }
                ConflictsCommand::Resolve(args) => {
                    let guid = args.guid()?;
                    let decision = args.decision()?;
                    let lock = SyncLock::acquire(
                        &session.settings().state_dir,
                        LockPurpose::ConflictResolution,
                    )?;
                    resolver.begin_decision(&guid)?;
                    resolver.decide(&guid, decision)?;
                    let outcome = resolver.apply(&guid)?;
                    lock.release()?;
                    println!(
                        "{guid}: deleted {} re-identified {} copied {}{}",
                        outcome.rows_deleted,
                        outcome.rows_reidentified,
                        outcome.rows_copied,
                        outcome
                            .new_guid
                            .map(|new_guid| format!("  new guid {new_guid}"))
                            .unwrap_or_default()
                    );
                    Ok(())
                }
                ConflictsCommand::Dismiss { guid } => {
                    let guid: Guid = guid.parse()?;
                    resolver.dismiss(&guid)?;
                    println!("{guid}: dismissed");
                    Ok(())
                }
                ConflictsCommand::Review => {
                    let stdin = io::stdin();
                    let lock = SyncLock::acquire(
                        &session.settings().state_dir,
                        LockPurpose::ConflictResolution,
                    )?;
                    let mut prompt = TerminalPrompt::new(stdin.lock(), io::stdout());
                    let summary = resolver.review(&mut prompt)?;
                    lock.release()?;
                    println!("applied {}  dismissed {}", summary.applied, summary.dismissed);
                    Ok(())
                }
            }
        }
        Command::Config { command } => match command {
            ConfigCommand::Check => {
                let settings = Settings::load(&cli.config)?;
                settings.mapping_set()?;
                println!(
                    "{}: ok ({} mappings, {} buttons, {} text sources, {} monitored folders)",
                    cli.config.display(),
                    settings.effective_mappings().len(),
                    settings.all_buttons().len(),
                    settings.text_sources.len(),
                    settings.monitored_folders.len()
                );
                Ok(())
            }
            ConfigCommand::Init { force } => {
                if cli.config.exists() && !force {
                    return Err(SlError::InvalidRequest(format!(
                        "{} exists; pass --force to overwrite",
                        cli.config.display()
                    )));
                }
                Settings::starter(Path::new("")).save(&cli.config)?;
                println!(
                    "wrote {} (data paths resolve against {})",
                    cli.config.display(),
                    Settings::path_base(&cli.config).display()
                );
                Ok(())
            }
        },
        Command::Run => {
            let session = Arc::new(open_session(&cli.config)?);
            let token = CancellationToken::new();
            let scheduler = Scheduler::start(Arc::clone(&session), token.clone())?;
            eprintln!("running; press Ctrl+C to stop");
            while !token.is_cancelled() {
                std::thread::sleep(Duration::from_millis(200));
            }
            scheduler.stop();
            scheduler.join();
            warn_if_degraded(&session);
            Ok(())
        }
    }
}

fn print_outcome(outcome: &LogOutcome) {
    let status = |write: &StoreWrite| match write {
        StoreWrite::Written { row } => format!("row {row}"),
        StoreWrite::Failed { error_code, .. } => format!("FAILED ({error_code})"),
    };
    println!(
        "{} {} {:?} database {} spreadsheet {}",
        outcome.event.guid,
        outcome.event.log_timestamp_text(),
        outcome.event.event_text,
        status(&outcome.database),
        status(&outcome.spreadsheet)
    );
    for failure in &outcome.event.failures {
        println!("  {} left empty: {}", failure.field, failure.message);
    }
}

fn warn_if_degraded(session: &LoggingSession) {
    if let SessionHealth::SingleStoreAuthoritative {
        store,
        since_rfc3339,
        reason,
    } = session.health()
    {
        eprintln!(
            "warning: only the {store} store is complete since {since_rfc3339} ({reason}); run `survey_log sync`"
        );
    }
}
