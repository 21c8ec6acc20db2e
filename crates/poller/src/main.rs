//! poller - collects metrics of one storage system and exports them.
//!
//! Exit codes: 0 after a normal shutdown, 1 on configuration or startup
//! failure, 2 when no collector could be initialized.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use harvest_core::conf;
use harvest_core::poller::{Poller, PollerArgs, shutdown_on_quit};

const EXIT_CONFIG: u8 = 1;
const EXIT_NO_COLLECTORS: u8 = 2;

/// Storage telemetry poller.
#[derive(Parser, Debug)]
#[command(name = "poller", about = "Collects and exports metrics of one storage system", version)]
struct Args {
    /// Poller name as defined in harvest.yml.
    #[arg(short, long)]
    poller: String,

    /// Run as a daemon: PID file and log file instead of stderr.
    #[arg(long)]
    daemon: bool,

    /// Collect data without exporting it.
    #[arg(short, long)]
    debug: bool,

    /// 0=trace, 1=debug, 2=info, 3=warn, 4=error, 5=fatal.
    #[arg(short, long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=5))]
    loglevel: u8,

    /// Config file (default: HARVEST_CONF/harvest.yml, then ./harvest.yml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only run these collectors (overrides harvest.yml).
    #[arg(long, value_delimiter = ',')]
    collectors: Vec<String>,

    /// Only collect these objects (overrides the collector templates).
    #[arg(long, value_delimiter = ',')]
    objects: Vec<String>,

    /// Port of the Prometheus exporter (overrides harvest.yml).
    #[arg(long = "promPort")]
    prom_port: Option<u16>,

    /// Directory of PID files.
    #[arg(long, env = "HARVEST_PIDS", hide_env_values = true)]
    pid_dir: Option<PathBuf>,

    /// Directory of daemon log files.
    #[arg(long, env = "HARVEST_LOGS", hide_env_values = true)]
    log_dir: Option<PathBuf>,
}

fn level(loglevel: u8) -> Level {
    match loglevel {
        0 => Level::TRACE,
        1 => Level::DEBUG,
        2 => Level::INFO,
        3 => Level::WARN,
        _ => Level::ERROR,
    }
}

/// stderr, or `LOG_DIR/poller_NAME.log` in daemon mode. `RUST_LOG`
/// directives are applied on top of `--loglevel`.
fn init_logging(args: &Args) -> Result<(), String> {
    let level = level(args.loglevel);
    let mut filter = EnvFilter::from_default_env();
    for krate in ["poller", "harvest_core", "tower_http"] {
        if let Ok(directive) = format!("{}={}", krate, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    if !args.daemon {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| e.to_string())?;
        return Ok(());
    }

    let dir = args.log_dir.clone().unwrap_or_else(conf::log_dir);
    fs::create_dir_all(&dir).map_err(|e| format!("log dir [{}]: {}", dir.display(), e))?;
    let path = dir.join(format!("poller_{}.log", args.poller));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("log file [{}]: {}", path.display(), e))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("poller [{}]: {}", args.poller, e);
        return ExitCode::from(EXIT_CONFIG);
    }
    info!(version = %harvest_core::version_string(), poller = %args.poller, "starting");

    let poller_args = PollerArgs {
        config: conf::config_path(args.config.as_deref()),
        pid_dir: args.pid_dir.clone().unwrap_or_else(conf::pid_dir),
        daemon: args.daemon,
        debug: args.debug,
        collectors: args.collectors.clone(),
        objects: args.objects.clone(),
        prom_port: args.prom_port,
        ..PollerArgs::new(args.poller.clone(), PathBuf::new())
    };

    let poller = match Poller::new(&poller_args) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if poller.collector_count() == 0 {
        error!("no collectors initialized, exiting");
        return ExitCode::from(EXIT_NO_COLLECTORS);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!(error = %e, "cannot install signal handler");
    }
    if let Err(e) = shutdown_on_quit(running.clone()) {
        warn!(error = %e, "cannot install SIGQUIT handler");
    }

    match poller.run(&running) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "poller failed");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}
