//! Spawn the supervised runtime and hand back a handle to it.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::output::ChildOutput;
use crate::paths::LaunchCommand;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("launch script not found: {}", path.display())]
    MissingScript { path: PathBuf },
    #[error("executable not found: {}", path.display())]
    MissingExecutable { path: PathBuf },
    #[error("working directory not found: {}", path.display())]
    MissingWorkdir { path: PathBuf },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// The controller's view of the running child.
pub trait ChildHandle {
    fn pid(&self) -> u32;

    /// Non-blocking exit check.
    fn try_exit(&mut self) -> io::Result<Option<ExitInfo>>;

    /// Record the descendants found when the tree was torn down.
    fn record_descendants(&mut self, _pids: &[u32]) {}

    /// Collect the exit status after termination so no zombie is left.
    fn reap(&mut self, _timeout: Duration) {}
}

/// A running (or finished) child started by [`start`].
pub struct SupervisedProcess {
    child: Child,
    pid: u32,
    started_at: Instant,
    exit: Option<ExitInfo>,
    descendants: Vec<u32>,
    output: Option<ChildOutput>,
}

impl fmt::Debug for SupervisedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisedProcess")
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("exit", &self.exit)
            .field("descendants", &self.descendants)
            .finish_non_exhaustive()
    }
}

impl SupervisedProcess {
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn exit(&self) -> Option<ExitInfo> {
        self.exit
    }

    /// Descendants snapshot taken at termination time.
    pub fn descendants(&self) -> &[u32] {
        &self.descendants
    }

    /// Take the output monitor. Returns `None` on the second call.
    pub fn take_output(&mut self) -> Option<ChildOutput> {
        self.output.take()
    }
}

impl ChildHandle for SupervisedProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitInfo>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }
        let status = self.child.try_wait()?;
        self.exit = status.map(ExitInfo::from);
        Ok(self.exit)
    }

    fn record_descendants(&mut self, pids: &[u32]) {
        self.descendants = pids.to_vec();
    }

    fn reap(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_exit() {
                Ok(Some(exit)) => {
                    debug!(pid = self.pid, code = ?exit.code, "reaped supervised process");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                Ok(None) => {
                    warn!(pid = self.pid, "supervised process still running after shutdown");
                    return;
                }
                Err(e) => {
                    warn!(pid = self.pid, "failed to reap supervised process: {e}");
                    return;
                }
            }
        }
    }
}

fn looks_like_path(program: &Path) -> bool {
    program.components().count() > 1
}

/// Spawn `command` with its output piped into a fresh [`ChildOutput`].
///
/// Returns as soon as the process exists; it does not wait for output.
pub fn start(command: &LaunchCommand) -> Result<SupervisedProcess, LaunchError> {
    if !command.workdir.is_dir() {
        return Err(LaunchError::MissingWorkdir {
            path: command.workdir.clone(),
        });
    }

    let program = Path::new(&command.program);
    if looks_like_path(program) && !program.exists() {
        return Err(LaunchError::MissingExecutable {
            path: program.to_path_buf(),
        });
    }

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(&command.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group: Ctrl-C in our terminal must not reach the
        // runtime before we get to shut it down in order.
        cmd.process_group(0);
    }

    info!(
        command = %command.display(),
        workdir = %command.workdir.display(),
        "spawning supervised process"
    );

    let mut child = cmd.spawn().map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            LaunchError::MissingExecutable {
                path: program.to_path_buf(),
            }
        } else {
            LaunchError::Spawn {
                program: command.program.to_string_lossy().into_owned(),
                source,
            }
        }
    })?;

    let pid = child.id();
    let output = ChildOutput::spawn(child.stdout.take(), child.stderr.take());
    info!(pid, "supervised process started");

    Ok(SupervisedProcess {
        child,
        pid,
        started_at: Instant::now(),
        exit: None,
        descendants: Vec::new(),
        output: Some(output),
    })
}
