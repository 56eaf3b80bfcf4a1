//! Pure lifecycle state machine.
//!
//! Every input carries the current time; the machine never reads a clock,
//! touches the filesystem, or signals a process. It answers each input with
//! a [`Directive`] that the driver loop carries out.
//!
//! ```text
//! Running ──tick/line──▶ ReadinessPending ──marker──▶ Stabilizing
//!                              ▲                          │ quiet
//!                              │ artifact absent          ▼
//!                              └──────────────── VerifyingCompletion
//!                                                         │ artifact present
//!                                                         ▼
//!     (deadline / exit / cancel / error) ──────────▶ ShuttingDown ──▶ terminal
//! ```

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SupervisorSettings;
use crate::detector::{ReadinessDetector, ReadinessEvent, ReadinessState, ReadinessTracker};
use crate::output::OutputLine;

use super::SupervisionError;

/// Terminal result of a supervision run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    TimedOut,
    Failed,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Succeeded => f.write_str("succeeded"),
            Outcome::TimedOut => f.write_str("timed out"),
            Outcome::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    ReadinessPending,
    Stabilizing,
    VerifyingCompletion,
    ShuttingDown(Outcome),
    Succeeded,
    TimedOut,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::TimedOut | Phase::Failed)
    }
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Continue,
    /// Check the completion artifact and report back via `on_artifact`.
    VerifyArtifact,
    /// Tear down the process tree, then call `finish`.
    Shutdown { outcome: Outcome, message: String },
}

/// Notable transitions, surfaced for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    ReadinessDetected { marker: String },
    Quiescent { quiet_for: Duration },
    VerificationReset { attempt: u32 },
}

pub struct Lifecycle {
    phase: Phase,
    readiness: ReadinessTracker,
    started: Instant,
    deadline: Duration,
    settle_delay: Duration,
    verify_interval: Duration,
    max_resets: u32,
    resets: u32,
    readiness_seen: bool,
    confirmed_at: Option<Instant>,
    last_periodic_check: Instant,
    pending: Option<(Outcome, String)>,
    transitions: Vec<Transition>,
}

impl Lifecycle {
    pub fn new(settings: &SupervisorSettings, markers: &[String], now: Instant) -> Self {
        Self {
            phase: Phase::Running,
            readiness: ReadinessTracker::new(
                ReadinessDetector::new(markers.iter().cloned()),
                settings.quiet_period(),
                settings.stable_observations,
                now,
            ),
            started: now,
            deadline: settings.deadline(),
            settle_delay: settings.settle_delay(),
            verify_interval: settings.verify_interval(),
            max_resets: settings.max_verification_resets,
            resets: 0,
            readiness_seen: false,
            confirmed_at: None,
            last_periodic_check: now,
            pending: None,
            transitions: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn readiness_state(&self) -> ReadinessState {
        self.readiness.state()
    }

    pub fn verification_resets(&self) -> u32 {
        self.resets
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Transitions recorded since the last call.
    pub fn take_transitions(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.transitions)
    }

    fn accepting_input(&self) -> bool {
        !self.phase.is_terminal() && !matches!(self.phase, Phase::ShuttingDown(_))
    }

    fn shutdown(&mut self, outcome: Outcome, message: String) -> Directive {
        match outcome {
            Outcome::Succeeded => info!(%message, "shutting down supervised process"),
            Outcome::TimedOut | Outcome::Failed => warn!(%message, "shutting down supervised process"),
        }
        self.phase = Phase::ShuttingDown(outcome);
        self.pending = Some((outcome, message.clone()));
        Directive::Shutdown { outcome, message }
    }

    fn leave_running(&mut self) {
        if self.phase == Phase::Running {
            self.phase = Phase::ReadinessPending;
        }
    }

    /// Feed one output line, in emission order.
    pub fn on_line(&mut self, line: &OutputLine) -> Directive {
        if !self.accepting_input() {
            return Directive::Continue;
        }
        self.leave_running();

        if let Some(ReadinessEvent::MarkerDetected { marker }) = self.readiness.on_line(line) {
            info!(%marker, "readiness marker detected");
            self.readiness_seen = true;
            self.phase = Phase::Stabilizing;
            self.transitions.push(Transition::ReadinessDetected { marker });
        }
        Directive::Continue
    }

    /// Periodic tick: deadline first, then quiescence, settle, and the
    /// periodic artifact probe.
    pub fn on_tick(&mut self, now: Instant) -> Directive {
        if !self.accepting_input() {
            return Directive::Continue;
        }

        let elapsed = self.elapsed(now);
        if elapsed > self.deadline {
            let message = SupervisionError::Timeout { elapsed }.to_string();
            return self.shutdown(Outcome::TimedOut, message);
        }

        self.leave_running();

        match self.phase {
            Phase::Stabilizing => {
                if let Some(ReadinessEvent::Confirmed { quiet_for }) = self.readiness.tick(now) {
                    info!(
                        quiet_secs = quiet_for.as_secs_f64(),
                        "output quiescent after readiness"
                    );
                    self.transitions.push(Transition::Quiescent { quiet_for });
                    self.phase = Phase::VerifyingCompletion;
                    self.confirmed_at = Some(now);
                    return self.settle_or_verify(now);
                }
            }
            Phase::VerifyingCompletion => return self.settle_or_verify(now),
            _ => {}
        }

        // Only after a verification reset: the runtime announced readiness
        // before, so the artifact may land without a second marker.
        if self.readiness_seen
            && self.phase == Phase::ReadinessPending
            && now.saturating_duration_since(self.last_periodic_check) >= self.verify_interval
        {
            self.last_periodic_check = now;
            return Directive::VerifyArtifact;
        }

        Directive::Continue
    }

    fn settle_or_verify(&self, now: Instant) -> Directive {
        let confirmed_at = self.confirmed_at.unwrap_or(now);
        if now.saturating_duration_since(confirmed_at) >= self.settle_delay {
            Directive::VerifyArtifact
        } else {
            Directive::Continue
        }
    }

    /// Result of a `VerifyArtifact` directive.
    pub fn on_artifact(&mut self, present: bool, now: Instant) -> Directive {
        if !self.accepting_input() {
            return Directive::Continue;
        }

        match (self.phase, present) {
            (Phase::VerifyingCompletion | Phase::ReadinessPending, true) => {
                self.phase = Phase::VerifyingCompletion;
                let message = format!(
                    "first-run initialization completed successfully after {:.1}s",
                    self.elapsed(now).as_secs_f64()
                );
                self.shutdown(Outcome::Succeeded, message)
            }
            (Phase::VerifyingCompletion, false) => {
                self.resets += 1;
                if self.resets > self.max_resets {
                    let message = SupervisionError::ArtifactNeverAppeared {
                        attempts: self.resets,
                    }
                    .to_string();
                    return self.shutdown(Outcome::Failed, message);
                }
                warn!(
                    attempt = self.resets,
                    max = self.max_resets,
                    "readiness detected but completion artifact still missing, waiting"
                );
                self.transitions.push(Transition::VerificationReset {
                    attempt: self.resets,
                });
                self.readiness.reset();
                self.confirmed_at = None;
                self.last_periodic_check = now;
                self.phase = Phase::ReadinessPending;
                Directive::Continue
            }
            (_, false) => {
                debug!("periodic check: completion artifact not present yet");
                Directive::Continue
            }
            _ => Directive::Continue,
        }
    }

    /// The child exited on its own. `artifact_present` is checked at exit time.
    pub fn on_exit(&mut self, code: Option<i32>, artifact_present: bool, now: Instant) -> Directive {
        if !self.accepting_input() {
            return Directive::Continue;
        }
        let secs = self.elapsed(now).as_secs_f64();
        if artifact_present {
            self.shutdown(
                Outcome::Succeeded,
                format!(
                    "first-run initialization completed successfully; process exited ({}) after {secs:.1}s",
                    describe_exit(code)
                ),
            )
        } else {
            self.shutdown(
                Outcome::Failed,
                SupervisionError::ExitedWithoutArtifact {
                    exit: describe_exit(code),
                }
                .to_string(),
            )
        }
    }

    pub fn on_cancel(&mut self, now: Instant) -> Directive {
        if !self.accepting_input() {
            return Directive::Continue;
        }
        let message = SupervisionError::Cancelled {
            elapsed: self.elapsed(now),
        }
        .to_string();
        self.shutdown(Outcome::Failed, message)
    }

    /// Unrecoverable error (e.g. liveness query failed).
    pub fn on_error(&mut self, error: &SupervisionError) -> Directive {
        if !self.accepting_input() {
            return Directive::Continue;
        }
        self.shutdown(Outcome::Failed, error.to_string())
    }

    /// Shutdown has been attempted; move to the terminal phase.
    pub fn finish(&mut self) -> Option<(Outcome, String)> {
        let (outcome, message) = self.pending.take()?;
        self.phase = match outcome {
            Outcome::Succeeded => Phase::Succeeded,
            Outcome::TimedOut => Phase::TimedOut,
            Outcome::Failed => Phase::Failed,
        };
        Some((outcome, message))
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}
