//! First-run supervision loop.
//!
//! Drives one launched runtime from spawn to teardown:
//! 1. Polls child liveness every iteration
//! 2. Pulls output lines with a bounded wait and feeds them to the state machine
//! 3. Verifies the completion artifact when the machine asks for it
//! 4. Tears down the whole process tree before returning, whatever the outcome
//!
//! All decisions live in [`machine::Lifecycle`]; this module only performs
//! the I/O those decisions call for.

pub mod machine;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::SupervisorSettings;
use crate::launcher::ChildHandle;
use crate::output::{LineSource, OutputLine};
use crate::process_tree::{TerminationReport, TreeTerminator};
use crate::verify::ArtifactCheck;

pub use machine::{Directive, Lifecycle, Outcome, Phase, Transition};

/// Upper bound on lines handled per iteration so ticks keep their cadence
/// under a flood of output.
const MAX_LINES_PER_TICK: usize = 512;

/// How long to wait for the root to be reaped after teardown.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SupervisionError {
    #[error("first-run initialization timed out after {:.1}s", elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },
    #[error("first-run initialization cancelled after {:.1}s", elapsed.as_secs_f64())]
    Cancelled { elapsed: Duration },
    #[error("process exited ({exit}) but the completion artifact was not found")]
    ExitedWithoutArtifact { exit: String },
    #[error("readiness detected but the completion artifact never appeared ({attempts} verification attempts)")]
    ArtifactNeverAppeared { attempts: u32 },
    #[error("failed to query supervised process {pid}: {source}")]
    Liveness {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Events emitted during supervision for logging/audit.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Output line from the supervised process.
    Output(String),
    ReadinessDetected { marker: String },
    Quiescent { quiet_for: Duration },
    VerificationReset { attempt: u32 },
    ShutdownStarted { outcome: Outcome, reason: String },
    TreeTerminated(TerminationReport),
    Finished {
        outcome: Outcome,
        message: String,
        elapsed: Duration,
    },
}

impl From<Transition> for SupervisorEvent {
    fn from(t: Transition) -> Self {
        match t {
            Transition::ReadinessDetected { marker } => SupervisorEvent::ReadinessDetected { marker },
            Transition::Quiescent { quiet_for } => SupervisorEvent::Quiescent { quiet_for },
            Transition::VerificationReset { attempt } => {
                SupervisorEvent::VerificationReset { attempt }
            }
        }
    }
}

/// Result of one supervision run, handed back to the caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: Outcome,
    pub message: String,
    /// Start to shutdown decision. Tree teardown is not included.
    pub elapsed: Duration,
    /// False when nothing was started (artifact already present, launch failed).
    pub launched: bool,
    pub pid: Option<u32>,
    pub verification_resets: u32,
    pub termination: Option<TerminationReport>,
}

impl RunReport {
    /// A report for a run that never spawned anything.
    pub fn not_launched(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
            elapsed: Duration::ZERO,
            launched: false,
            pid: None,
            verification_resets: 0,
            termination: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }
}

/// Drives a [`Lifecycle`] against a real (or fake) child.
pub struct Supervisor<'a, C: Clock> {
    settings: &'a SupervisorSettings,
    markers: &'a [String],
    clock: C,
    cancel: Option<Arc<AtomicBool>>,
    events: Option<mpsc::Sender<SupervisorEvent>>,
}

impl<'a, C: Clock> Supervisor<'a, C> {
    pub fn new(settings: &'a SupervisorSettings, markers: &'a [String], clock: C) -> Self {
        Self {
            settings,
            markers,
            clock,
            cancel: None,
            events: None,
        }
    }

    /// Abort the run when `flag` becomes true.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<SupervisorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn handle_line(&self, machine: &mut Lifecycle, line: &OutputLine) {
        info!(stream = %line.stream, "child: {}", line.text);
        self.emit(SupervisorEvent::Output(line.text.clone()));
        machine.on_line(line);
    }

    fn flush_transitions(&self, machine: &mut Lifecycle) {
        for t in machine.take_transitions() {
            self.emit(t.into());
        }
    }

    /// Carry out `VerifyArtifact` directives until the machine says something else.
    fn resolve(
        &self,
        machine: &mut Lifecycle,
        verifier: &dyn ArtifactCheck,
        mut directive: Directive,
    ) -> Directive {
        while directive == Directive::VerifyArtifact {
            let present = verifier.is_complete();
            directive = machine.on_artifact(present, self.clock.now());
        }
        self.flush_transitions(machine);
        directive
    }

    /// Supervise `child` until a terminal outcome, then tear down its tree.
    pub fn supervise(
        &self,
        child: &mut dyn ChildHandle,
        output: &mut dyn LineSource,
        verifier: &dyn ArtifactCheck,
        terminator: &dyn TreeTerminator,
    ) -> RunReport {
        let started = self.clock.now();
        let poll = self.settings.poll_interval();
        let mut machine = Lifecycle::new(self.settings, self.markers, started);
        let pid = child.pid();

        info!(
            pid,
            deadline_secs = self.settings.deadline_secs,
            quiet_secs = self.settings.quiet_secs,
            "supervising first run"
        );

        let mut root_exited = false;
        let (outcome, reason) = loop {
            let mut directive = Directive::Continue;

            if self.cancelled() {
                directive = machine.on_cancel(self.clock.now());
            }

            if directive == Directive::Continue {
                match child.try_exit() {
                    Ok(Some(exit)) => {
                        root_exited = true;
                        // Lines already queued were emitted before the exit.
                        for _ in 0..MAX_LINES_PER_TICK {
                            let Some(line) = output.next_line(Duration::ZERO) else {
                                break;
                            };
                            self.handle_line(&mut machine, &line);
                        }
                        self.flush_transitions(&mut machine);
                        info!(pid, code = ?exit.code, "supervised process exited on its own");
                        let present = verifier.is_complete();
                        directive = machine.on_exit(exit.code, present, self.clock.now());
                    }
                    Ok(None) => {}
                    Err(source) => {
                        directive = machine.on_error(&SupervisionError::Liveness { pid, source });
                    }
                }
            }

            if directive == Directive::Continue {
                let mut wait = poll;
                for _ in 0..MAX_LINES_PER_TICK {
                    let Some(line) = output.next_line(wait) else {
                        break;
                    };
                    self.handle_line(&mut machine, &line);
                    wait = Duration::ZERO;
                }
                self.flush_transitions(&mut machine);
                directive = machine.on_tick(self.clock.now());
            }

            match self.resolve(&mut machine, verifier, directive) {
                Directive::Shutdown { outcome, message } => break (outcome, message),
                Directive::Continue | Directive::VerifyArtifact => {}
            }
        };

        // Teardown time is not part of the run.
        let elapsed = self.clock.now().saturating_duration_since(started);
        self.emit(SupervisorEvent::ShutdownStarted {
            outcome,
            reason: reason.clone(),
        });

        let termination = terminator.terminate(pid, root_exited);
        child.record_descendants(&termination.descendants);
        child.reap(REAP_TIMEOUT);
        debug!(
            descendants = termination.descendants.len(),
            forced = termination.forced(),
            failures = termination.failures(),
            "process tree teardown finished"
        );
        self.emit(SupervisorEvent::TreeTerminated(termination.clone()));

        let (outcome, message) = machine.finish().unwrap_or((outcome, reason));
        info!(
            %outcome,
            elapsed_secs = elapsed.as_secs_f64(),
            "first run finished"
        );
        self.emit(SupervisorEvent::Finished {
            outcome,
            message: message.clone(),
            elapsed,
        });

        RunReport {
            outcome,
            message,
            elapsed,
            launched: true,
            pid: Some(pid),
            verification_resets: machine.verification_resets(),
            termination: Some(termination),
        }
    }
}
