//! mimo-update - Main entry point
//!
//! Parses the command line, sets up logging and hands off to the updater.
//! Exit status is zero only when the requested operation succeeded.

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use mimo_update::cli::{Cli, Commands};
use mimo_update::error::Result;
use mimo_update::exec::{SharedRunner, SystemRunner};
use mimo_update::paths::SystemPaths;
use mimo_update::sanity::{self, SYSTEM_BINARIES, TARGET_BINARIES};
use mimo_update::updater::{
    resolve_mimo_root, run_system_update, run_target_update, verify_bundle, UpdateContext,
    UpdateOutcome,
};

/// Initialize the tracing subscriber; RUST_LOG overrides the default level
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);
    info!("mimo-update {} starting", env!("CARGO_PKG_VERSION"));
    debug!("CLI arguments parsed: {:?}", cli);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("✗ {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let paths = SystemPaths::default();

    if let Commands::Update { mode } = &cli.command {
        let required = if mode.target {
            TARGET_BINARIES
        } else {
            SYSTEM_BINARIES
        };
        sanity::run_preflight_checks(required)?;
    }

    let persist_root = !cli.dry_run && matches!(cli.command, Commands::Update { .. });
    let mimo_root = resolve_mimo_root(
        std::env::var("MIMO_ROOT").ok(),
        &paths.profile_script,
        persist_root,
    );

    let runner: SharedRunner = Arc::new(SystemRunner);
    let ctx = UpdateContext::new(&cli.bundle, runner)
        .with_work_dir(&cli.work_dir)
        .with_mimo_root(mimo_root)
        .with_paths(paths)
        .dry_run(cli.dry_run)
        .assume_yes(cli.yes);

    match cli.command {
        Commands::Verify => {
            let config = verify_bundle(&ctx)?;
            println!("✓ Bundle verified: {}", ctx.bundle.display());
            println!("  file mappings: {}", config.file_mappings.len());
            if let Some(init) = &config.init {
                println!("  init files:    {}", init.files.iter().filter(|f| !f.is_dir).count());
            }
            println!("  services:      {}", config.init_services().join(", "));
        }
        Commands::Update { mode } => {
            let outcome = if mode.sys {
                run_system_update(&ctx)?
            } else {
                run_target_update(&ctx, &mut io::stdin().lock())?
            };
            report(&outcome);
        }
    }

    Ok(())
}

fn report(outcome: &UpdateOutcome) {
    match outcome {
        UpdateOutcome::Committed { actions } => {
            println!("✓ Update completed ({} actions applied)", actions);
        }
        UpdateOutcome::Planned { actions } => {
            println!("Dry run: {} actions would run", actions.len());
            for (i, name) in actions.iter().enumerate() {
                println!("  {:>2}. {}", i + 1, name);
            }
        }
        UpdateOutcome::Cancelled => println!("Update cancelled"),
    }
}
