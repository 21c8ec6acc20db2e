//! Start, stop and status of poller processes through their PID files.
//!
//! A poller started with `--daemon` writes `HARVEST_PIDS/NAME.pid`. Status
//! is read from that file, confirmed by a no-op signal and by matching the
//! process command line against `poller ... --daemon ... --poller NAME`.

mod process;

pub use process::{MockProcesses, ProcessTable, SystemProcesses};

use std::fmt;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::poller::PidFile;

const START_POLLS: u32 = 10;
const START_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_POLLS: u32 = 5;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

static PROM_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--promPort[ =](\d+)").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Running,
    NotRunning,
    Stopped,
    StoppingFailed,
    InvalidPid,
    Killed,
    AlreadyExited,
    Docker,
    /// A live process holds the PID but is not this poller.
    Unmatched,
    Unknown(String),
}

impl Status {
    /// States in which a new instance may be started.
    pub fn startable(&self) -> bool {
        matches!(self, Status::NotRunning | Status::Stopped)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Running => f.write_str("running"),
            Status::NotRunning => f.write_str("not running"),
            Status::Stopped => f.write_str("stopped"),
            Status::StoppingFailed => f.write_str("stopping failed"),
            Status::InvalidPid => f.write_str("invalid pid"),
            Status::Killed => f.write_str("killed"),
            Status::AlreadyExited => f.write_str("already exited"),
            Status::Docker => f.write_str("n/a (docker)"),
            Status::Unmatched => f.write_str("unknown/unmatched"),
            Status::Unknown(reason) => write!(f, "unknown: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerStatus {
    pub pid: Option<i32>,
    /// `--promPort` of the running process, if given.
    pub prom_port: Option<u16>,
    pub status: Status,
}

impl PollerStatus {
    fn new(status: Status) -> Self {
        Self {
            pid: None,
            prom_port: None,
            status,
        }
    }
}

/// True if `cmdline` is a daemonized poller named `name`.
pub fn is_poller_cmdline(cmdline: &str, name: &str) -> bool {
    let mut words = cmdline.split_whitespace();
    if !words.next().is_some_and(|program| program.ends_with("poller")) {
        return false;
    }
    let words: Vec<&str> = words.collect();
    words.contains(&"--daemon")
        && words
            .windows(2)
            .any(|w| w[0] == "--poller" && w[1] == name)
}

/// Options forwarded to a started poller.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub loglevel: u8,
    pub debug: bool,
    pub config: Option<PathBuf>,
    pub collectors: Vec<String>,
    pub objects: Vec<String>,
    pub prom_port: Option<u16>,
}

impl StartOptions {
    /// Command line of the poller, without `--daemon`.
    pub fn args(&self, name: &str) -> Vec<String> {
        let mut args = vec![
            "--poller".to_string(),
            name.to_string(),
            "--loglevel".to_string(),
            self.loglevel.to_string(),
        ];
        if self.debug {
            args.push("--debug".into());
        }
        if let Some(config) = &self.config {
            args.push("--config".into());
            args.push(config.display().to_string());
        }
        if !self.collectors.is_empty() {
            args.push("--collectors".into());
            args.push(self.collectors.join(","));
        }
        if !self.objects.is_empty() {
            args.push("--objects".into());
            args.push(self.objects.join(","));
        }
        if let Some(port) = self.prom_port {
            args.push("--promPort".into());
            args.push(port.to_string());
        }
        args
    }
}

pub struct Manager<P: ProcessTable> {
    procs: P,
    pid_dir: PathBuf,
    poller_bin: PathBuf,
    docker: bool,
}

impl<P: ProcessTable> Manager<P> {
    pub fn new(procs: P, pid_dir: impl Into<PathBuf>, poller_bin: impl Into<PathBuf>) -> Self {
        Self {
            procs,
            pid_dir: pid_dir.into(),
            poller_bin: poller_bin.into(),
            docker: crate::util::is_docker(),
        }
    }

    pub fn docker(mut self, docker: bool) -> Self {
        self.docker = docker;
        self
    }

    pub fn poller_bin(&self) -> &Path {
        &self.poller_bin
    }

    fn pid_path(&self, name: &str) -> PathBuf {
        PidFile::path_for(&self.pid_dir, name)
    }

    /// Removes a PID file left behind; true if there was one.
    fn clean_pid_file(&self, name: &str) -> bool {
        let path = self.pid_path(name);
        match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == IoErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot remove PID file");
                false
            }
        }
    }

    pub fn status(&self, name: &str) -> PollerStatus {
        let mut s = match fs::read_to_string(self.pid_path(name)) {
            Err(_) => PollerStatus::new(Status::NotRunning),
            Ok(text) => match text.trim().parse::<i32>() {
                Ok(pid) if pid > 0 => PollerStatus {
                    pid: Some(pid),
                    prom_port: None,
                    status: Status::Unmatched,
                },
                _ => PollerStatus::new(Status::InvalidPid),
            },
        };
        if self.docker {
            s.status = Status::Docker;
            return s;
        }
        let Some(pid) = s.pid else {
            return s;
        };
        match self.procs.alive(pid) {
            Ok(true) => {}
            Ok(false) => {
                debug!(poller = name, pid, "stale PID file");
                s.status = Status::NotRunning;
                return s;
            }
            Err(e) => {
                s.status = Status::Unknown(e.to_string());
                return s;
            }
        }
        if let Some(cmdline) = self.procs.cmdline(pid)
            && is_poller_cmdline(&cmdline, name)
        {
            s.status = Status::Running;
            s.prom_port = PROM_PORT
                .captures(&cmdline)
                .and_then(|c| c[1].parse().ok());
        }
        s
    }

    /// SIGTERM, then up to a second for the process to go away.
    pub fn stop(&self, name: &str) -> PollerStatus {
        let mut s = self.status(name);
        let Some(pid) = s.pid else {
            return s;
        };
        if s.status != Status::Running {
            if s.status == Status::NotRunning {
                self.clean_pid_file(name);
            }
            return s;
        }
        match self.procs.terminate(pid) {
            Ok(true) => {}
            Ok(false) => {
                s.status = Status::Stopped;
                return s;
            }
            Err(e) => {
                warn!(poller = name, pid, error = %e, "terminate failed");
                s.status = Status::StoppingFailed;
                return s;
            }
        }
        for _ in 0..STOP_POLLS {
            std::thread::sleep(STOP_POLL_INTERVAL);
            if matches!(self.procs.alive(pid), Ok(false)) {
                // a poller removes its own PID file; this covers the ones that could not
                self.clean_pid_file(name);
                s.status = Status::Stopped;
                return s;
            }
        }
        s.status = Status::StoppingFailed;
        s
    }

    /// SIGKILL. Without a usable PID file the process table is searched
    /// for the poller's command line. The PID file is always removed.
    pub fn kill(&self, name: &str) -> PollerStatus {
        let mut s = self.status(name);
        if s.status != Status::Running {
            s.pid = self
                .procs
                .pids()
                .into_iter()
                .find(|pid| {
                    self.procs
                        .cmdline(*pid)
                        .is_some_and(|c| is_poller_cmdline(&c, name))
                });
        }
        if let Some(pid) = s.pid {
            s.status = match self.procs.kill(pid) {
                Ok(true) => Status::Killed,
                Ok(false) => Status::AlreadyExited,
                Err(e) => Status::Unknown(e.to_string()),
            };
        }
        self.clean_pid_file(name);
        s
    }

    /// Spawns `poller --daemon` and waits up to a second for its PID file.
    /// Pollers that are not confirmed stopped are left alone.
    pub fn start(&self, name: &str, options: &StartOptions) -> Result<PollerStatus> {
        let current = self.status(name);
        if !current.status.startable() {
            return Ok(current);
        }
        self.clean_pid_file(name);
        fs::create_dir_all(&self.pid_dir)?;

        let mut args = options.args(name);
        args.push("--daemon".into());
        let pid = self.procs.spawn(&self.poller_bin, &args)?;
        debug!(poller = name, pid, "spawned");

        for _ in 0..START_POLLS {
            let s = self.status(name);
            if s.pid.is_some() {
                return Ok(s);
            }
            std::thread::sleep(START_POLL_INTERVAL);
        }
        Ok(self.status(name))
    }

    pub fn restart(&self, name: &str, options: &StartOptions) -> Result<(PollerStatus, PollerStatus)> {
        let stopped = self.stop(name);
        let started = self.start(name, options)?;
        Ok((stopped, started))
    }
}

// ---------------------------------------------------------------------------
// Status table
// ---------------------------------------------------------------------------

/// Column layout of the status table; name columns fit the longest value.
#[derive(Debug, Clone, Copy)]
pub struct Table {
    datacenter: usize,
    poller: usize,
    long: bool,
}

impl Table {
    pub fn new<'a>(rows: impl IntoIterator<Item = (&'a str, &'a str)>, long: bool) -> Self {
        let (mut datacenter, mut poller) = (20, 20);
        for (dc, name) in rows {
            datacenter = datacenter.max(dc.len());
            poller = poller.max(name.len());
        }
        Self {
            datacenter: datacenter + 1,
            poller: poller + 1,
            long,
        }
    }

    pub fn header(&self) -> String {
        let mut line = format!(
            "{:<dw$} {:<pw$} {:<10} {:<10} ",
            "Datacenter",
            "Poller",
            "PID",
            "PromPort",
            dw = self.datacenter,
            pw = self.poller
        );
        if self.long {
            line.push_str(&format!("{:<10} ", "Running"));
        }
        line.push_str(&format!("{:<20}", "Status"));
        line
    }

    pub fn rule(&self) -> String {
        let mut line = format!("{} {} ++++++++++ ++++++++++ ", "+".repeat(self.datacenter), "+".repeat(self.poller));
        if self.long {
            line.push_str("++++++++++ ");
        }
        line.push_str(&"+".repeat(20));
        line
    }

    /// `port` is the configured Prometheus port; the long form adds the
    /// port the running process was started with.
    pub fn row(&self, datacenter: &str, poller: &str, port: Option<u16>, s: &PollerStatus) -> String {
        let opt = |v: Option<String>| v.unwrap_or_default();
        let mut line = format!(
            "{:<dw$} {:<pw$} {:<10} {:<10} ",
            datacenter,
            poller,
            opt(s.pid.map(|p| p.to_string())),
            opt(port.map(|p| p.to_string())),
            dw = self.datacenter,
            pw = self.poller
        );
        if self.long {
            line.push_str(&format!("{:<10} ", opt(s.prom_port.map(|p| p.to_string()))));
        }
        line.push_str(&s.status.to_string());
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BIN: &str = "/opt/harvest/bin/poller";

    fn manager(dir: &TempDir, procs: MockProcesses) -> Manager<MockProcesses> {
        Manager::new(procs, dir.path(), BIN).docker(false)
    }

    fn write_pid(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(format!("{}.pid", name)), content).unwrap();
    }

    #[test]
    fn poller_identity() {
        assert!(is_poller_cmdline("/opt/harvest/bin/poller --poller p1 --daemon", "p1"));
        assert!(is_poller_cmdline("./poller --daemon --poller p1 --loglevel 2", "p1"));
        assert!(!is_poller_cmdline("/opt/harvest/bin/poller --poller p1", "p1"));
        assert!(!is_poller_cmdline("/opt/harvest/bin/poller --poller p10 --daemon", "p1"));
        assert!(!is_poller_cmdline("/usr/bin/vim --daemon --poller p1", "p1"));
        assert!(!is_poller_cmdline("", "p1"));
    }

    #[test]
    fn status_states() {
        let dir = TempDir::new().unwrap();
        let procs = MockProcesses::new();
        procs.add(12345, "/opt/harvest/bin/poller --daemon --poller NAME --promPort 13001");
        procs.add(222, "/usr/sbin/sshd -D");
        let m = manager(&dir, procs);

        assert_eq!(m.status("NAME").status, Status::NotRunning);

        write_pid(&dir, "NAME", "12345\n");
        let s = m.status("NAME");
        assert_eq!(s.status, Status::Running);
        assert_eq!(s.pid, Some(12345));
        assert_eq!(s.prom_port, Some(13001));

        write_pid(&dir, "NAME", "garbage");
        assert_eq!(m.status("NAME").status, Status::InvalidPid);

        write_pid(&dir, "NAME", "222");
        assert_eq!(m.status("NAME").status, Status::Unmatched);

        write_pid(&dir, "NAME", "999");
        assert_eq!(m.status("NAME").status, Status::NotRunning);
    }

    #[test]
    fn docker_reports_not_applicable() {
        let dir = TempDir::new().unwrap();
        write_pid(&dir, "p1", "12345");
        let m = manager(&dir, MockProcesses::new()).docker(true);
        let s = m.status("p1");
        assert_eq!(s.status.to_string(), "n/a (docker)");
        assert_eq!(s.pid, Some(12345));
    }

    #[test]
    fn start_then_stop() {
        let dir = TempDir::new().unwrap();
        let procs = MockProcesses::new().with_pid_dir(dir.path());
        let m = manager(&dir, procs);
        let options = StartOptions {
            loglevel: 2,
            prom_port: Some(12990),
            ..Default::default()
        };

        let s = m.start("p1", &options).unwrap();
        assert_eq!(s.status, Status::Running);
        assert_eq!(s.prom_port, Some(12990));
        let pid = s.pid.unwrap();

        // already running: left alone
        assert_eq!(m.start("p1", &options).unwrap().pid, Some(pid));

        let s = m.stop("p1");
        assert_eq!(s.status, Status::Stopped);
        assert!(!dir.path().join("p1.pid").exists());
        assert_eq!(m.stop("p1").status, Status::NotRunning);
    }

    #[test]
    fn stop_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let procs = MockProcesses::new().stubborn();
        procs.add(12345, "poller --poller p1 --daemon");
        write_pid(&dir, "p1", "12345");
        let m = manager(&dir, procs);
        assert_eq!(m.stop("p1").status, Status::StoppingFailed);
    }

    #[test]
    fn kill_falls_back_to_process_scan() {
        let dir = TempDir::new().unwrap();
        let procs = MockProcesses::new();
        procs.add(500, "/usr/sbin/sshd -D");
        procs.add(501, "/opt/harvest/bin/poller --poller p1 --daemon");
        let m = manager(&dir, procs);

        let s = m.kill("p1");
        assert_eq!(s.status, Status::Killed);
        assert_eq!(s.pid, Some(501));
        assert!(!m.procs.contains(501));
        assert!(m.procs.contains(500));

        write_pid(&dir, "p1", "501");
        assert_eq!(m.kill("p1").status, Status::NotRunning);
        assert!(!dir.path().join("p1.pid").exists());
    }

    #[test]
    fn start_arguments() {
        let options = StartOptions {
            loglevel: 1,
            debug: true,
            config: Some(PathBuf::from("/etc/harvest.yml")),
            collectors: vec!["Zapi".into(), "Rest".into()],
            objects: vec!["Volume".into()],
            prom_port: None,
        };
        assert_eq!(
            options.args("p1").join(" "),
            "--poller p1 --loglevel 1 --debug --config /etc/harvest.yml --collectors Zapi,Rest --objects Volume"
        );
    }

    #[test]
    fn table_layout() {
        let t = Table::new([("dc1", "a-very-long-poller-name-01")], false);
        let header = t.header();
        assert_eq!(
            header.trim_end(),
            format!("{:<21} {:<27} {:<10} {:<10} Status", "Datacenter", "Poller", "PID", "PromPort")
        );
        let s = PollerStatus {
            pid: Some(12345),
            prom_port: None,
            status: Status::Running,
        };
        let row = t.row("dc1", "a-very-long-poller-name-01", Some(12990), &s);
        assert_eq!(
            row,
            format!("{:<21} {:<27} {:<10} {:<10} running", "dc1", "a-very-long-poller-name-01", 12345, 12990)
        );
        assert_eq!(t.rule().len(), header.len());

        let long = Table::new([("dc1", "p1")], true);
        assert!(long.header().contains("Running"));
    }
}
