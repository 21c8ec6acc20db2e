//! harvest - starts, stops and reports on the pollers of harvest.yml.

use std::path::{Path, PathBuf};
use std::process::{Command as Process, ExitCode};

use clap::{Args, Parser, Subcommand};
use tracing::{Level, debug, error};
use tracing_subscriber::EnvFilter;

use harvest_core::conf::{self, Config};
use harvest_core::manager::{Manager, PollerStatus, ProcessTable, StartOptions, Status, SystemProcesses, Table};

/// Poller manager.
#[derive(Parser, Debug)]
#[command(name = "harvest", about = "Manage your pollers", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file (default: HARVEST_CONF/harvest.yml, then ./harvest.yml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 0=trace, 1=debug, 2=info, 3=warn, 4=error, 5=fatal; also passed to started pollers.
    #[arg(long, global = true, default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=5))]
    loglevel: u8,

    /// Directory of PID files.
    #[arg(long, global = true, env = "HARVEST_PIDS", hide_env_values = true)]
    pid_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the status of pollers.
    Status(Target),
    /// Start pollers that are not running.
    Start(StartArgs),
    /// Stop running pollers.
    Stop(Target),
    /// Stop, then start pollers.
    Restart(StartArgs),
    /// Force-terminate pollers.
    Kill(Target),
}

#[derive(Args, Debug)]
struct Target {
    /// Pollers as named in harvest.yml (default: all).
    pollers: Vec<String>,

    /// Also show the port each running poller was started with.
    #[arg(short, long)]
    long: bool,
}

#[derive(Args, Debug)]
struct StartArgs {
    #[command(flatten)]
    target: Target,

    /// Run exactly one poller attached to this terminal.
    #[arg(short, long)]
    foreground: bool,

    /// Collect without exporting.
    #[arg(short, long)]
    debug: bool,

    /// Only run these collectors (overrides harvest.yml).
    #[arg(long, value_delimiter = ',')]
    collectors: Vec<String>,

    /// Only collect these objects (overrides the collector templates).
    #[arg(long, value_delimiter = ',')]
    objects: Vec<String>,

    /// Port of the Prometheus exporter (overrides harvest.yml).
    #[arg(long = "promPort")]
    prom_port: Option<u16>,
}

impl Command {
    fn target(&self) -> &Target {
        match self {
            Command::Status(t) | Command::Stop(t) | Command::Kill(t) => t,
            Command::Start(s) | Command::Restart(s) => &s.target,
        }
    }
}

/// One configured poller as shown in the table.
#[derive(Debug, Clone)]
struct Row {
    name: String,
    datacenter: String,
    port: Option<u16>,
}

fn init_logging(loglevel: u8) {
    let level = match loglevel {
        0 => Level::TRACE,
        1 => Level::DEBUG,
        2 => Level::INFO,
        3 => Level::WARN,
        _ => Level::ERROR,
    };
    let mut filter = EnvFilter::from_default_env();
    for krate in ["harvest", "harvest_core"] {
        if let Ok(directive) = format!("{}={}", krate, level).parse() {
            filter = filter.add_directive(directive);
        }
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// The `poller` next to this binary, else `HARVEST_HOME/bin/poller`.
fn poller_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        let sibling = exe.with_file_name("poller");
        if sibling.is_file() {
            return sibling;
        }
    }
    conf::harvest_home().join("bin").join("poller")
}

/// Configured pollers, restricted to `names` when given.
fn select_rows(config: &Config, names: &[String]) -> Result<Vec<Row>, String> {
    let undefined: Vec<&str> = names
        .iter()
        .filter(|n| !config.poller_names().contains(&n.as_str()))
        .map(String::as_str)
        .collect();
    if !undefined.is_empty() {
        return Err(format!("poller [{}] not defined", undefined.join(", ")));
    }
    let mut rows = Vec::new();
    for name in config.poller_names() {
        if !names.is_empty() && !names.iter().any(|n| n == name) {
            continue;
        }
        let poller = config.poller(name).map_err(|e| e.to_string())?;
        rows.push(Row {
            name: name.to_string(),
            datacenter: poller.datacenter().to_string(),
            port: config.prometheus_port(&poller),
        });
    }
    Ok(rows)
}

fn start_options(cli: &Cli, args: &StartArgs) -> StartOptions {
    StartOptions {
        loglevel: cli.loglevel,
        debug: args.debug,
        config: cli.config.clone(),
        collectors: args.collectors.clone(),
        objects: args.objects.clone(),
        prom_port: args.prom_port,
    }
}

/// Applies `command` to every row. Returns the printed lines and whether
/// any poller could not be started or stopped.
fn execute<P: ProcessTable>(
    command: &Command,
    options: &StartOptions,
    manager: &Manager<P>,
    rows: &[Row],
) -> (Vec<String>, bool) {
    let table = Table::new(
        rows.iter().map(|r| (r.datacenter.as_str(), r.name.as_str())),
        command.target().long,
    );
    let mut out = vec![table.header(), table.rule()];
    let mut failed = false;
    let mut print = |row: &Row, s: &PollerStatus| {
        out.push(table.row(&row.datacenter, &row.name, row.port, s));
    };

    for row in rows {
        let name = row.name.as_str();
        match command {
            Command::Status(_) => print(row, &manager.status(name)),
            Command::Kill(_) => print(row, &manager.kill(name)),
            Command::Stop(_) => {
                let s = manager.stop(name);
                failed |= s.status == Status::StoppingFailed;
                print(row, &s);
            }
            Command::Start(_) | Command::Restart(_) => {
                let current = if matches!(command, Command::Restart(_)) {
                    let s = manager.stop(name);
                    failed |= s.status == Status::StoppingFailed;
                    print(row, &s);
                    s
                } else {
                    manager.status(name)
                };
                if !current.status.startable() {
                    if current.status != Status::Running {
                        failed = true;
                        error!(poller = name, status = %current.status, "cannot verify status, kill poller and try again");
                    }
                    print(row, &current);
                    continue;
                }
                match manager.start(name, options) {
                    Ok(s) => {
                        failed |= s.status != Status::Running && s.status != Status::Docker;
                        print(row, &s);
                    }
                    Err(e) => {
                        failed = true;
                        error!(poller = name, error = %e, "start failed");
                        print(row, &PollerStatus {
                            pid: None,
                            prom_port: None,
                            status: Status::Unknown(e.to_string()),
                        });
                    }
                }
            }
        }
    }
    out.push(table.rule());
    (out, failed)
}

/// Runs one poller attached to the terminal and returns its exit code.
fn foreground(poller_bin: &Path, name: &str, options: &StartOptions) -> ExitCode {
    println!("starting [{}] in foreground, press Ctrl+C to stop", name);
    debug!(bin = %poller_bin.display(), "exec");
    match Process::new(poller_bin).args(options.args(name)).status() {
        Ok(status) => match status.code() {
            Some(0) => ExitCode::SUCCESS,
            Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
            // terminated by a signal
            None => ExitCode::SUCCESS,
        },
        Err(e) => {
            eprintln!("{}: {}", poller_bin.display(), e);
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.loglevel);

    let config_path = conf::config_path(cli.config.as_deref());
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let rows = match select_rows(&config, &cli.command.target().pollers) {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let options = match &cli.command {
        Command::Start(args) | Command::Restart(args) => start_options(&cli, args),
        _ => StartOptions {
            loglevel: cli.loglevel,
            ..Default::default()
        },
    };

    let poller_bin = poller_binary();
    if let Command::Start(args) | Command::Restart(args) = &cli.command
        && args.foreground
    {
        if !matches!(cli.command, Command::Start(_)) {
            eprintln!("--foreground only works with start");
            return ExitCode::FAILURE;
        }
        let [row] = rows.as_slice() else {
            eprintln!("only one poller can be started in foreground mode");
            return ExitCode::FAILURE;
        };
        return foreground(&poller_bin, &row.name, &options);
    }

    let pid_dir = cli.pid_dir.clone().unwrap_or_else(conf::pid_dir);
    let manager = Manager::new(SystemProcesses::new(), pid_dir, poller_bin);
    let (lines, failed) = execute(&cli.command, &options, &manager, &rows);
    for line in lines {
        println!("{}", line);
    }
    if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}
