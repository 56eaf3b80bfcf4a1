//! Process-tree teardown: descendants first, then the root.
//!
//! Descendants come from a snapshot of the process table taken when
//! `terminate` is called: the root's transitive children plus every member
//! of the root's process group. Group members survive the root being reaped,
//! so a child that exits on its own does not orphan its workers. On Unix a
//! final group-wide SIGKILL catches anything forked after the snapshot.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

const LIVENESS_POLL: Duration = Duration::from_millis(50);
/// How long to wait for a SIGKILLed process to disappear.
const KILL_SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TerminationError {
    #[error("failed to send {signal} to process {pid}: {source}")]
    Signal {
        pid: u32,
        signal: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("process {pid} still alive after forced termination")]
    Survived { pid: u32 },
}

/// What happened to one process during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessFate {
    AlreadyExited,
    Stopped,
    Killed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    pub root: u32,
    /// Snapshot of descendants, parents before children.
    pub descendants: Vec<u32>,
    pub fates: Vec<(u32, ProcessFate)>,
}

impl TerminationReport {
    pub fn fate_of(&self, pid: u32) -> Option<&ProcessFate> {
        self.fates.iter().find(|(p, _)| *p == pid).map(|(_, f)| f)
    }

    pub fn forced(&self) -> usize {
        self.fates
            .iter()
            .filter(|(_, f)| *f == ProcessFate::Killed)
            .count()
    }

    pub fn failures(&self) -> usize {
        self.fates
            .iter()
            .filter(|(_, f)| matches!(f, ProcessFate::Failed(_)))
            .count()
    }
}

/// Something that can tear down a process tree rooted at a pid.
pub trait TreeTerminator {
    /// `root_exited` is set once the root has been reaped. Its pid may then
    /// belong to an unrelated process and must not be signalled.
    fn terminate(&self, root: u32, root_exited: bool) -> TerminationReport;
}

/// One row of the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub pgid: u32,
}

/// Parse one `ps -axo pid=,ppid=,pgid=` line.
pub fn parse_ps_line(line: &str) -> Option<ProcessEntry> {
    let mut parts = line.split_whitespace();
    let pid = parts.next()?.parse::<u32>().ok()?;
    let ppid = parts.next()?.parse::<u32>().ok()?;
    let pgid = parts.next()?.parse::<u32>().ok()?;
    Some(ProcessEntry { pid, ppid, pgid })
}

/// All transitive descendants of `root` in a snapshot, breadth-first so
/// parents come before their children.
pub fn descendants_of(snapshot: &[ProcessEntry], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in snapshot {
        if entry.pid != entry.ppid {
            children.entry(entry.ppid).or_default().push(entry.pid);
        }
    }

    let mut out = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        if let Some(kids) = children.get(&parent) {
            for &kid in kids {
                if kid != root && !out.contains(&kid) {
                    out.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    out
}

/// Members of process group `pgid` other than its leader.
pub fn group_members(snapshot: &[ProcessEntry], pgid: u32) -> Vec<u32> {
    snapshot
        .iter()
        .filter(|entry| entry.pgid == pgid && entry.pid != pgid)
        .map(|entry| entry.pid)
        .collect()
}

/// Descendants of `root` followed by any group members reparented away
/// from it.
pub fn tree_members(snapshot: &[ProcessEntry], root: u32) -> Vec<u32> {
    let mut members = descendants_of(snapshot, root);
    for pid in group_members(snapshot, root) {
        if !members.contains(&pid) {
            members.push(pid);
        }
    }
    members
}

/// Current process table from `ps`. Empty if `ps` is unavailable.
pub fn process_snapshot() -> Vec<ProcessEntry> {
    let output = match Command::new("ps").args(["-axo", "pid=,ppid=,pgid="]).output() {
        Ok(output) => output,
        Err(e) => {
            warn!("process snapshot unavailable: {e}");
            return Vec::new();
        }
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(parse_ps_line)
        .collect()
}

/// Exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    sys::is_alive(pid)
}

/// Graceful-then-forced process tree terminator using OS signals.
#[derive(Debug, Clone)]
pub struct ProcessTree {
    grace_period: Duration,
}

impl Default for ProcessTree {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ProcessTree {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Stop every descendant of `root`, then `root` itself unless it has
    /// already been reaped.
    ///
    /// Never fails as a whole: per-process errors are logged and recorded in
    /// the report while the sweep carries on.
    pub fn terminate(&self, root: u32, root_exited: bool) -> TerminationReport {
        let snapshot = process_snapshot();
        let descendants = tree_members(&snapshot, root);
        info!(
            root,
            root_exited,
            descendants = descendants.len(),
            "terminating process tree"
        );

        let mut fates: Vec<(u32, ProcessFate)> = Vec::with_capacity(descendants.len() + 1);
        fates.extend(self.stop_group(&descendants));
        if root_exited {
            fates.push((root, ProcessFate::AlreadyExited));
        } else {
            fates.extend(self.stop_group(&[root]));
        }

        // A reaped leader with an empty group leaves nothing to address.
        if !root_exited || !group_members(&snapshot, root).is_empty() {
            match sys::kill_group(root) {
                Ok(true) => debug!(pgid = root, "sent SIGKILL to the process group"),
                Ok(false) => {}
                Err(e) => warn!("{e}"),
            }
        }

        for (pid, fate) in &fates {
            debug!(pid, ?fate, "process teardown result");
        }

        TerminationReport {
            root,
            descendants,
            fates,
        }
    }

    /// Graceful signal to all, shared grace wait, then force the survivors.
    fn stop_group(&self, pids: &[u32]) -> Vec<(u32, ProcessFate)> {
        let mut fates: HashMap<u32, ProcessFate> = HashMap::new();
        let mut signalled = Vec::new();

        for &pid in pids {
            if !sys::is_alive(pid) {
                fates.insert(pid, ProcessFate::AlreadyExited);
                continue;
            }
            match sys::stop(pid) {
                Ok(true) => signalled.push(pid),
                Ok(false) => {
                    fates.insert(pid, ProcessFate::AlreadyExited);
                }
                Err(e) => {
                    // Still try to force it below.
                    warn!("{e}");
                    signalled.push(pid);
                }
            }
        }

        let survivors = wait_for_exit(&signalled, self.grace_period);
        for &pid in &signalled {
            if !survivors.contains(&pid) {
                fates.insert(pid, ProcessFate::Stopped);
            }
        }

        let mut forced = Vec::new();
        for &pid in &survivors {
            match sys::kill(pid) {
                Ok(true) => forced.push(pid),
                Ok(false) => {
                    fates.insert(pid, ProcessFate::Stopped);
                }
                Err(e) => {
                    warn!("{e}");
                    fates.insert(pid, ProcessFate::Failed(e.to_string()));
                }
            }
        }

        let stubborn = wait_for_exit(&forced, KILL_SETTLE);
        for &pid in &forced {
            if stubborn.contains(&pid) {
                let e = TerminationError::Survived { pid };
                warn!("{e}");
                fates.insert(pid, ProcessFate::Failed(e.to_string()));
            } else {
                fates.insert(pid, ProcessFate::Killed);
            }
        }

        pids.iter()
            .filter_map(|pid| fates.remove(pid).map(|fate| (*pid, fate)))
            .collect()
    }
}

impl TreeTerminator for ProcessTree {
    fn terminate(&self, root: u32, root_exited: bool) -> TerminationReport {
        ProcessTree::terminate(self, root, root_exited)
    }
}

/// Interpret a finished `taskkill`: a failure only counts as "already gone"
/// when the process really is gone.
#[cfg(any(not(unix), test))]
fn taskkill_outcome(
    pid: u32,
    signal: &'static str,
    status: Result<(), String>,
    still_alive: bool,
) -> Result<bool, TerminationError> {
    match status {
        Ok(()) => Ok(true),
        Err(_) if !still_alive => Ok(false),
        Err(detail) => Err(TerminationError::Signal {
            pid,
            signal,
            source: io::Error::other(detail),
        }),
    }
}

/// Poll until every pid is gone or `timeout` passes. Returns the survivors.
fn wait_for_exit(pids: &[u32], timeout: Duration) -> Vec<u32> {
    let deadline = Instant::now() + timeout;
    let mut alive: Vec<u32> = pids.to_vec();
    loop {
        alive.retain(|&pid| sys::is_alive(pid));
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        thread::sleep(LIVENESS_POLL);
    }
}

#[cfg(unix)]
mod sys {
    use std::io;
    use std::path::Path;
    use std::process::Command;

    use super::TerminationError;

    fn send(pid: u32, signal: libc::c_int, name: &'static str) -> Result<bool, TerminationError> {
        let Ok(raw) = libc::pid_t::try_from(pid) else {
            return Ok(false);
        };
        if raw <= 0 {
            return Ok(false);
        }
        // SAFETY: kill() has no memory-safety preconditions.
        if unsafe { libc::kill(raw, signal) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(false)
        } else {
            Err(TerminationError::Signal {
                pid,
                signal: name,
                source: err,
            })
        }
    }

    /// `Ok(false)` means the process was already gone.
    pub fn stop(pid: u32) -> Result<bool, TerminationError> {
        send(pid, libc::SIGTERM, "SIGTERM")
    }

    pub fn kill(pid: u32) -> Result<bool, TerminationError> {
        send(pid, libc::SIGKILL, "SIGKILL")
    }

    /// SIGKILL every process in group `pgid`. `Ok(false)` if the group is empty.
    pub fn kill_group(pgid: u32) -> Result<bool, TerminationError> {
        let Ok(raw) = libc::pid_t::try_from(pgid) else {
            return Ok(false);
        };
        if raw <= 1 {
            return Ok(false);
        }
        // SAFETY: kill() has no memory-safety preconditions.
        if unsafe { libc::kill(-raw, libc::SIGKILL) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(false)
        } else {
            Err(TerminationError::Signal {
                pid: pgid,
                signal: "SIGKILL (group)",
                source: err,
            })
        }
    }

    /// Exists and is not a zombie.
    pub fn is_alive(pid: u32) -> bool {
        let Ok(raw) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        // SAFETY: signal 0 only probes for existence.
        let exists = unsafe { libc::kill(raw, 0) } == 0
            || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        exists && !is_zombie(pid)
    }

    fn is_zombie(pid: u32) -> bool {
        if Path::new("/proc/self/stat").exists() {
            // Fields after the parenthesised command name; state comes first.
            return std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|stat| {
                    let rest = &stat[stat.rfind(')')? + 1..];
                    rest.split_whitespace().next().map(|state| state == "Z")
                })
                .unwrap_or(false);
        }
        Command::new("ps")
            .args(["-o", "stat=", "-p", &pid.to_string()])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().starts_with('Z'))
            .unwrap_or(false)
    }
}

#[cfg(not(unix))]
mod sys {
    use std::io;
    use std::process::Command;

    use super::{TerminationError, taskkill_outcome};

    fn taskkill(pid: u32, force: bool, name: &'static str) -> Result<bool, TerminationError> {
        let pid_arg = pid.to_string();
        let mut args = vec!["/T", "/PID", pid_arg.as_str()];
        if force {
            args.insert(0, "/F");
        }
        let status = Command::new("taskkill")
            .args(&args)
            .status()
            .map_err(|source| TerminationError::Signal {
                pid,
                signal: name,
                source,
            })?;
        let status = if status.success() {
            Ok(())
        } else {
            Err(format!("taskkill exited with {status}"))
        };
        taskkill_outcome(pid, name, status, is_alive(pid))
    }

    pub fn stop(pid: u32) -> Result<bool, TerminationError> {
        taskkill(pid, false, "taskkill")
    }

    pub fn kill(pid: u32) -> Result<bool, TerminationError> {
        taskkill(pid, true, "taskkill /F")
    }

    /// `/T` on the root already covers the tree.
    pub fn kill_group(_pgid: u32) -> Result<bool, TerminationError> {
        Ok(false)
    }

    pub fn is_alive(pid: u32) -> bool {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
            .unwrap_or_else(|e: io::Error| {
                tracing::debug!(pid, "tasklist unavailable: {e}");
                false
            })
    }
}
