//! First-run step, the installer-facing entry point.
//!
//! `firstrun init` resolves the install layout, skips everything when the
//! runtime was already unpacked, otherwise launches the bundle's start script
//! under a [`Supervisor`] and writes a JSONL run log alongside. The caller
//! then decides whether a failed run should halt the installation.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::SystemClock;
use crate::config::ProjectConfig;
use crate::launcher::{self, ChildHandle, LaunchError};
use crate::log::{LogEvent, RunLog};
use crate::output::ChildOutput;
use crate::paths::{InstallPaths, LaunchCommand, launch_command};
use crate::process_tree::ProcessTree;
use crate::supervisor::{Outcome, RunReport, Supervisor, SupervisorEvent};
use crate::verify::CompletionVerifier;

pub struct FirstRun {
    install_root: PathBuf,
    config: ProjectConfig,
    cancel: Arc<AtomicBool>,
}

impl FirstRun {
    pub fn new(install_root: impl Into<PathBuf>, config: ProjectConfig) -> Self {
        Self {
            install_root: install_root.into(),
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancellation flag (set from the Ctrl-C handler).
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn paths(&self) -> InstallPaths {
        InstallPaths::resolve(&self.install_root, &self.config.layout)
    }

    fn log_dir(&self) -> PathBuf {
        if self.config.log.dir.is_absolute() {
            self.config.log.dir.clone()
        } else {
            self.install_root.join(&self.config.log.dir)
        }
    }

    fn open_log(&self) -> Option<RunLog> {
        if !self.config.log.enabled {
            return None;
        }
        match RunLog::create_in(&self.log_dir(), Uuid::new_v4()) {
            Ok(log) => {
                info!(path = %log.path().display(), run_id = %log.run_id(), "run log opened");
                Some(log)
            }
            Err(e) => {
                warn!("run log disabled: {e:#}");
                None
            }
        }
    }

    /// Run the first-run step to completion. Never panics on runtime
    /// failures; every outcome comes back as a [`RunReport`].
    pub fn run(&self) -> RunReport {
        let paths = self.paths();
        let settings = &self.config.supervisor;
        let run_log = self.open_log();
        record(
            run_log.as_ref(),
            LogEvent::RunStarted {
                install_root: paths.root.display().to_string(),
                base: paths.base.display().to_string(),
                deadline_secs: settings.deadline_secs,
            },
        );

        let verifier = CompletionVerifier::new(self.config.layout.clone());
        if verifier.exists(&self.install_root) {
            info!(artifact = %paths.artifact.display(), "runtime already initialized, nothing to launch");
            record(
                run_log.as_ref(),
                LogEvent::AlreadyInitialized {
                    artifact: paths.artifact.display().to_string(),
                },
            );
            return finish_without_launch(
                run_log.as_ref(),
                RunReport::not_launched(
                    Outcome::Succeeded,
                    format!(
                        "already initialized: {} is present",
                        paths.artifact.display()
                    ),
                ),
            );
        }

        let (mut child, command) = match self.launch(&paths) {
            Ok(launched) => launched,
            Err(e) => {
                warn!("{e}");
                record(
                    run_log.as_ref(),
                    LogEvent::LaunchFailed {
                        reason: e.to_string(),
                    },
                );
                return finish_without_launch(
                    run_log.as_ref(),
                    RunReport::not_launched(Outcome::Failed, e.to_string()),
                );
            }
        };
        record(
            run_log.as_ref(),
            LogEvent::ProcessLaunched {
                pid: child.pid(),
                command: command.display(),
                work_dir: command.workdir.display().to_string(),
            },
        );
        // A closed queue behaves like a child that never prints.
        let mut output = child.take_output().unwrap_or_else(|| ChildOutput::new().0);

        let (tx, writer) = spawn_log_writer(run_log);
        let tree = ProcessTree::new(settings.grace_period());
        let check = verifier.for_install(&self.install_root);

        let report = Supervisor::new(settings, &self.config.readiness.markers, SystemClock)
            .with_cancel(Arc::clone(&self.cancel))
            .with_events(tx)
            .supervise(&mut child, &mut output, &check, &tree);

        if let Some(writer) = writer
            && writer.join().is_err()
        {
            warn!("run log writer panicked");
        }
        report
    }

    fn launch(
        &self,
        paths: &InstallPaths,
    ) -> Result<(launcher::SupervisedProcess, LaunchCommand), LaunchError> {
        if !paths.launch_script.is_file() {
            return Err(LaunchError::MissingScript {
                path: paths.launch_script.clone(),
            });
        }
        let command = launch_command(&paths.launch_script);
        let child = launcher::start(&command)?;
        info!(pid = child.pid(), script = %paths.launch_script.display(), "first run launched");
        Ok((child, command))
    }
}

fn record(log: Option<&RunLog>, event: LogEvent) {
    if let Some(log) = log
        && let Err(e) = log.log(event)
    {
        warn!("failed to write run log: {e:#}");
    }
}

fn finish_without_launch(log: Option<&RunLog>, report: RunReport) -> RunReport {
    record(
        log,
        LogEvent::RunFinished {
            outcome: report.outcome,
            message: report.message.clone(),
            elapsed_secs: report.elapsed.as_secs_f64(),
        },
    );
    report
}

/// Drain supervisor events into the run log on a background thread. Without
/// a log the events are simply dropped.
fn spawn_log_writer(
    log: Option<RunLog>,
) -> (mpsc::Sender<SupervisorEvent>, Option<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel::<SupervisorEvent>();
    let Some(log) = log else {
        return (tx, None);
    };
    let handle = thread::spawn(move || {
        for event in rx {
            record(Some(&log), LogEvent::from(&event));
        }
    });
    (tx, Some(handle))
}

/// Decide whether the installer should carry on after this run.
///
/// Success always continues. Otherwise `assume_yes` continues without asking,
/// and `confirm` is asked "Continue anyway?" with the failure message.
pub fn should_continue(
    report: &RunReport,
    assume_yes: bool,
    confirm: impl FnOnce(&str) -> bool,
) -> bool {
    if report.succeeded() {
        return true;
    }
    if assume_yes {
        warn!(outcome = %report.outcome, "continuing despite first-run failure (--yes)");
        return true;
    }
    let prompt = format!(
        "First-run initialization {}: {}. Continue anyway?",
        report.outcome, report.message
    );
    confirm(&prompt)
}
