use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::Parser;
use dialoguer::Confirm;
use tracing::{info, warn};

use firstrun::cli::{Cli, Command};
use firstrun::config::ProjectConfig;
use firstrun::first_run::{FirstRun, should_continue};
use firstrun::render;
use firstrun::shell_completion;

fn load_config(start: &Path, announce: bool) -> Result<(ProjectConfig, Option<PathBuf>)> {
    let (config, config_path) = ProjectConfig::load(start)?;
    if announce {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .firstrun/config.toml found, using defaults"),
        }
    }
    Ok((config, config_path))
}

/// Ask the operator; a non-interactive stdin declines.
fn confirm_continue(prompt: &str) -> bool {
    if !std::io::stdin().is_terminal() {
        warn!("stdin is not interactive; not continuing (use --yes to override)");
        return false;
    }
    match Confirm::new().with_prompt(prompt).default(false).interact() {
        Ok(answer) => answer,
        Err(e) => {
            warn!("confirmation prompt failed: {e}");
            false
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let is_quiet_command = matches!(
        &cli.command,
        Command::Config { .. } | Command::Paths { .. } | Command::Completions { .. }
    );

    let filter = match cli.verbose {
        0 if is_quiet_command => "firstrun=warn",
        0 => "firstrun=info",
        1 => "firstrun=debug",
        _ => "firstrun=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let announce = !is_quiet_command || cli.verbose > 0;

    match cli.command {
        Command::Init {
            install_path,
            deadline,
            quiet,
            markers,
            yes,
        } => {
            if !install_path.is_dir() {
                bail!("install path not found: {}", install_path.display());
            }
            let (mut config, _) = load_config(&install_path, announce)?;
            if let Some(secs) = deadline {
                config.supervisor.deadline_secs = secs;
            }
            if let Some(secs) = quiet {
                config.supervisor.quiet_secs = secs;
            }
            if !markers.is_empty() {
                config.readiness.markers = markers;
            }

            let cancel = Arc::new(AtomicBool::new(false));
            let cancel_clone = Arc::clone(&cancel);
            ctrlc::set_handler(move || {
                cancel_clone.store(true, Ordering::SeqCst);
            })
            .context("failed to install Ctrl-C handler")?;

            let report = FirstRun::new(&install_path, config)
                .with_cancel(cancel)
                .run();
            print!("{}", render::render_report(&report));

            if should_continue(&report, yes, confirm_continue) {
                return Ok(ExitCode::SUCCESS);
            }
            return Ok(ExitCode::FAILURE);
        }
        Command::Paths { install_path, json } => {
            let (config, _) = load_config(&install_path, announce)?;
            let paths = FirstRun::new(&install_path, config).paths();
            if json {
                println!("{}", render::render_paths_json(&paths)?);
            } else {
                print!("{}", render::render_paths_human(&paths));
            }
        }
        Command::Config { json } => {
            let cwd =
                std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
            let (config, config_path) = load_config(&cwd, announce)?;
            if json {
                println!(
                    "{}",
                    render::render_config_json(&config, config_path.as_deref())?
                );
            } else {
                print!(
                    "{}",
                    render::render_config_human(&config, config_path.as_deref())
                );
            }
        }
        Command::Completions { shell } => {
            shell_completion::print(shell)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
