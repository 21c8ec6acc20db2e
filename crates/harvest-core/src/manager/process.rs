//! Access to the process table: liveness, command lines, signals and
//! spawning. [`SystemProcesses`] talks to the kernel, [`MockProcesses`]
//! keeps an in-memory table for tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::errors::{HarvestError, Result};

pub trait ProcessTable {
    /// `Ok(false)` when no process has this PID.
    fn alive(&self, pid: i32) -> Result<bool>;

    /// Command line with NUL separators replaced by spaces.
    fn cmdline(&self, pid: i32) -> Option<String>;

    /// Sends SIGTERM. `Ok(false)` if the process was already gone.
    fn terminate(&self, pid: i32) -> Result<bool>;

    /// Sends SIGKILL. `Ok(false)` if the process was already gone.
    fn kill(&self, pid: i32) -> Result<bool>;

    /// Every PID currently in the table.
    fn pids(&self) -> Vec<i32>;

    /// Starts `program` detached from the terminal; returns its PID.
    fn spawn(&self, program: &Path, args: &[String]) -> Result<u32>;
}

// ---------------------------------------------------------------------------
// Kernel-backed implementation
// ---------------------------------------------------------------------------

pub struct SystemProcesses {
    proc_path: PathBuf,
}

impl SystemProcesses {
    pub fn new() -> Self {
        Self {
            proc_path: PathBuf::from("/proc"),
        }
    }

    fn send(&self, pid: i32, sig: Option<Signal>) -> Result<bool> {
        match signal::kill(Pid::from_raw(pid), sig) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(Errno::EPERM) => Err(HarvestError::PermissionDenied(format!(
                "insufficient privileges to signal process {}",
                pid
            ))),
            Err(e) => Err(HarvestError::Io(e.into())),
        }
    }
}

impl Default for SystemProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcesses {
    fn alive(&self, pid: i32) -> Result<bool> {
        self.send(pid, None)
    }

    fn cmdline(&self, pid: i32) -> Option<String> {
        let raw = std::fs::read(self.proc_path.join(pid.to_string()).join("cmdline")).ok()?;
        let text = String::from_utf8_lossy(&raw).replace('\0', " ");
        Some(text.trim_end().to_string())
    }

    fn terminate(&self, pid: i32) -> Result<bool> {
        self.send(pid, Some(Signal::SIGTERM))
    }

    fn kill(&self, pid: i32) -> Result<bool> {
        self.send(pid, Some(Signal::SIGKILL))
    }

    fn pids(&self) -> Vec<i32> {
        let Ok(entries) = std::fs::read_dir(&self.proc_path) else {
            return Vec::new();
        };
        let mut pids: Vec<i32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        pids.sort_unstable();
        pids
    }

    fn spawn(&self, program: &Path, args: &[String]) -> Result<u32> {
        use std::os::unix::process::CommandExt;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // own process group: a Ctrl-C at the manager's terminal must not reach pollers
            .process_group(0)
            .spawn()
            .map_err(|e| HarvestError::Config(format!("spawn [{}]: {}", program.display(), e)))?;
        Ok(child.id())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Process table held in memory. Spawned "pollers" write their PID file
/// into `pid_dir` the way a real poller started with `--daemon` does.
#[derive(Debug, Default)]
pub struct MockProcesses {
    procs: Mutex<BTreeMap<i32, String>>,
    next_pid: Mutex<i32>,
    pid_dir: Option<PathBuf>,
    /// Processes ignore SIGTERM.
    stubborn: bool,
}

impl MockProcesses {
    pub fn new() -> Self {
        Self {
            next_pid: Mutex::new(40000),
            ..Self::default()
        }
    }

    pub fn with_pid_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pid_dir = Some(dir.into());
        self
    }

    pub fn stubborn(mut self) -> Self {
        self.stubborn = true;
        self
    }

    pub fn add(&self, pid: i32, cmdline: &str) {
        self.table().insert(pid, cmdline.to_string());
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.table().contains_key(&pid)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, BTreeMap<i32, String>> {
        self.procs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProcessTable for MockProcesses {
    fn alive(&self, pid: i32) -> Result<bool> {
        Ok(self.contains(pid))
    }

    fn cmdline(&self, pid: i32) -> Option<String> {
        self.table().get(&pid).cloned()
    }

    fn terminate(&self, pid: i32) -> Result<bool> {
        if self.stubborn {
            return Ok(self.contains(pid));
        }
        Ok(self.table().remove(&pid).is_some())
    }

    fn kill(&self, pid: i32) -> Result<bool> {
        Ok(self.table().remove(&pid).is_some())
    }

    fn pids(&self) -> Vec<i32> {
        self.table().keys().copied().collect()
    }

    fn spawn(&self, program: &Path, args: &[String]) -> Result<u32> {
        let pid = {
            let mut next = self.next_pid.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };
        let cmdline = std::iter::once(program.display().to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.add(pid, &cmdline);
        let poller = args
            .iter()
            .position(|a| a == "--poller")
            .and_then(|i| args.get(i + 1));
        if let (Some(dir), Some(name)) = (&self.pid_dir, poller)
            && args.iter().any(|a| a == "--daemon")
        {
            std::fs::create_dir_all(dir)?;
            std::fs::write(dir.join(format!("{}.pid", name)), pid.to_string())?;
        }
        Ok(pid as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        let procs = SystemProcesses::new();
        let me = std::process::id() as i32;
        assert!(procs.alive(me).unwrap());
        assert!(procs.pids().contains(&me));
        assert!(procs.cmdline(me).is_some_and(|c| !c.is_empty()));
    }

    #[test]
    fn mock_spawn_writes_pid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let procs = MockProcesses::new().with_pid_dir(dir.path());
        let args: Vec<String> = ["--poller", "p1", "--daemon"].iter().map(|s| s.to_string()).collect();
        let pid = procs.spawn(Path::new("/opt/harvest/bin/poller"), &args).unwrap() as i32;
        assert_eq!(
            procs.cmdline(pid).unwrap(),
            "/opt/harvest/bin/poller --poller p1 --daemon"
        );
        let written = std::fs::read_to_string(dir.path().join("p1.pid")).unwrap();
        assert_eq!(written, pid.to_string());
        assert!(procs.terminate(pid).unwrap());
        assert!(!procs.alive(pid).unwrap());
    }
}
