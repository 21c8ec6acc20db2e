//! Wiring of one poller process.
//!
//! ```text
//!   Poller::new():  harvest.yml ─► PID file (daemon) ─► exporters ─► collectors (init)
//!
//!   Poller::run():  exporters.start()
//!                   ├─ [collector-Zapi:Volume]    collector::run ─┐
//!                   ├─ [collector-ZapiPerf:Lif]   collector::run ─┤ until `running` clears
//!                   └─ main: exporter status every STATUS_INTERVAL ┘
//!                   join workers ─► exporters.stop() ─► drop PID file
//! ```

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use signal_hook::consts::SIGQUIT;
use signal_hook::iterator::Signals;
use tracing::{debug, error, info, warn};

use crate::api::ConnectionParams;
use crate::collector::{self, COLLECTOR_CLASSES, Collector, CollectorBase, Options};
use crate::conf::{self, Config};
use crate::errors::{HarvestError, Result};
use crate::exporter::{self, Exporter, ExporterOptions};
use crate::matrix::Matrix;
use crate::template::{self, TemplateStore};

/// Period of the exporter status export.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);
const SLEEP_SLICE: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// PID file
// ---------------------------------------------------------------------------

/// `DIR/NAME.pid`, created exclusively and removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn path_for(dir: &Path, poller: &str) -> PathBuf {
        dir.join(format!("{}.pid", poller))
    }

    /// Writes the current PID. Fails if the file already exists.
    pub fn create(dir: &Path, poller: &str) -> Result<PidFile> {
        fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, poller);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                IoErrorKind::AlreadyExists => HarvestError::Config(format!(
                    "PID file [{}] exists, is poller [{}] already running?",
                    path.display(),
                    poller
                )),
                _ => HarvestError::Config(format!("create [{}]: {}", path.display(), e)),
            })?;
        write!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "PID file created");
        Ok(PidFile { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "PID file removed"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "cannot remove PID file"),
        }
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Clears `running` on SIGQUIT. SIGINT, SIGTERM and SIGHUP are left to the
/// binary's `ctrlc` handler.
pub fn shutdown_on_quit(running: Arc<AtomicBool>) -> Result<()> {
    let mut signals = Signals::new([SIGQUIT])?;
    std::thread::Builder::new()
        .name("signal-quit".into())
        .spawn(move || {
            for sig in signals.forever() {
                info!(signal = sig, "received shutdown signal");
                running.store(false, Ordering::SeqCst);
            }
        })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// Everything the `poller` command line decides.
#[derive(Debug, Clone)]
pub struct PollerArgs {
    pub name: String,
    pub config: PathBuf,
    pub templates: PathBuf,
    pub pid_dir: PathBuf,
    pub daemon: bool,
    /// Collect without exporting.
    pub debug: bool,
    /// Only these collector classes, if not empty.
    pub collectors: Vec<String>,
    /// Only these objects, if not empty.
    pub objects: Vec<String>,
    pub prom_port: Option<u16>,
}

impl PollerArgs {
    /// Arguments with directories taken from the environment.
    pub fn new(name: impl Into<String>, config: PathBuf) -> Self {
        Self {
            name: name.into(),
            config,
            templates: conf::templates_dir(),
            pid_dir: conf::pid_dir(),
            daemon: false,
            debug: false,
            collectors: Vec::new(),
            objects: Vec::new(),
            prom_port: None,
        }
    }
}

pub struct Poller {
    name: String,
    exporters: Vec<Arc<dyn Exporter>>,
    collectors: Vec<Box<dyn Collector>>,
    pid_file: Option<PidFile>,
}

fn selected(filter: &[String], name: &str) -> bool {
    filter.is_empty() || filter.iter().any(|f| f.eq_ignore_ascii_case(name))
}

impl Poller {
    /// Loads the config and initializes exporters and collectors with
    /// HTTP clients to the monitored system.
    pub fn new(args: &PollerArgs) -> Result<Poller> {
        Self::with_factory(args, collector::new_collector)
    }

    /// Same as [`Poller::new`] with a custom collector constructor.
    pub fn with_factory<F>(args: &PollerArgs, factory: F) -> Result<Poller>
    where
        F: Fn(CollectorBase) -> Result<Box<dyn Collector>>,
    {
        let config = Config::load(&args.config)?;
        let params = config.poller(&args.name)?;
        info!(poller = %args.name, config = %args.config.display(), "configuration loaded");

        let pid_file = if args.daemon {
            Some(PidFile::create(&args.pid_dir, &args.name)?)
        } else {
            None
        };

        let mut options = Options::new(args.name.clone(), TemplateStore::new(&args.templates));
        options.datacenter = params.datacenter().to_string();
        options.labels = params.global_labels();
        options.connection = Some(ConnectionParams::from_poller(&params)?);
        let options = Arc::new(options);

        let exporters = if args.debug {
            info!("debug mode, exporters disabled");
            Vec::new()
        } else {
            Self::load_exporters(&config, &params, args)
        };
        if exporters.is_empty() && !args.debug {
            warn!("no exporters initialized, data will be collected but not exported");
        }

        let collectors = Self::load_collectors(&params, args, &options, &exporters, factory);
        info!(
            collectors = collectors.len(),
            exporters = exporters.len(),
            "poller initialized"
        );
        Ok(Poller {
            name: args.name.clone(),
            exporters,
            collectors,
            pid_file,
        })
    }

    fn load_exporters(config: &Config, params: &conf::Poller, args: &PollerArgs) -> Vec<Arc<dyn Exporter>> {
        let options = ExporterOptions {
            poller: args.name.clone(),
            prom_port: args.prom_port,
        };
        let mut exporters: Vec<Arc<dyn Exporter>> = Vec::new();
        for name in params.exporters() {
            let Some(entry) = config.exporter(name) else {
                warn!(exporter = %name, "exporter not defined in config, skipped");
                continue;
            };
            match exporter::new_exporter(name, entry, &options) {
                Ok(e) => exporters.push(Arc::from(e)),
                Err(e) => error!(exporter = %name, error = %e, "exporter init failed"),
            }
        }
        exporters
    }

    fn load_collectors<F>(
        params: &conf::Poller,
        args: &PollerArgs,
        options: &Arc<Options>,
        exporters: &[Arc<dyn Exporter>],
        factory: F,
    ) -> Vec<Box<dyn Collector>>
    where
        F: Fn(CollectorBase) -> Result<Box<dyn Collector>>,
    {
        let mut collectors = Vec::new();
        for class in params.collectors() {
            if !selected(&args.collectors, class) {
                continue;
            }
            if !COLLECTOR_CLASSES.contains(&class.as_str()) {
                warn!(collector = %class, "unknown collector, skipped");
                continue;
            }
            let template = match options.templates.default_template(class) {
                Ok(t) => t,
                Err(e) => {
                    error!(collector = %class, error = %e, "cannot load default template");
                    continue;
                }
            };
            let objects = template::objects(&template);
            if objects.is_empty() {
                warn!(collector = %class, "template lists no objects");
            }
            for (object, _) in objects {
                if !selected(&args.objects, &object) {
                    continue;
                }
                let mut base = CollectorBase::new(class, &object, template.clone(), options.clone());
                base.exporters = exporters.to_vec();
                let mut c = match factory(base) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(collector = %class, object = %object, error = %e, "cannot create collector");
                        continue;
                    }
                };
                let span = c.base().span().clone();
                let _guard = span.enter();
                match c.init() {
                    Ok(()) => {
                        debug!("initialized");
                        collectors.push(c);
                    }
                    Err(e) => error!(error = %e, "init failed"),
                }
            }
        }
        collectors
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collector_count(&self) -> usize {
        self.collectors.len()
    }

    pub fn exporter_count(&self) -> usize {
        self.exporters.len()
    }

    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file.as_ref().map(PidFile::path)
    }

    fn export_status(&self) {
        let batch: Vec<Matrix> = self
            .exporters
            .iter()
            .map(|e| e.base().status_matrix(&self.name))
            .collect();
        collector::export_all(&self.exporters, &batch);
    }

    /// Runs every collector on its own thread until `running` is cleared
    /// or every collector has stopped, then shuts down. Consumes the
    /// poller; the PID file goes with it.
    pub fn run(mut self, running: &AtomicBool) -> Result<()> {
        if self.collectors.is_empty() {
            return Err(HarvestError::NoCollector(self.name.clone()));
        }
        for e in &self.exporters {
            e.start()?;
        }

        let collectors = std::mem::take(&mut self.collectors);
        std::thread::scope(|s| {
            let mut workers = Vec::new();
            for mut c in collectors {
                let thread_name = format!("collector-{}", c.base().id());
                let spawned = std::thread::Builder::new()
                    .name(thread_name.clone())
                    .spawn_scoped(s, move || collector::run(c.as_mut(), running));
                match spawned {
                    Ok(handle) => workers.push((thread_name, handle)),
                    Err(e) => error!(thread = %thread_name, error = %e, "cannot spawn collector"),
                }
            }
            info!(workers = workers.len(), "poller running");

            let mut last_status = Instant::now();
            while running.load(Ordering::SeqCst) {
                if workers.iter().all(|(_, h)| h.is_finished()) {
                    warn!("all collectors stopped");
                    break;
                }
                std::thread::sleep(SLEEP_SLICE);
                if last_status.elapsed() >= STATUS_INTERVAL {
                    self.export_status();
                    last_status = Instant::now();
                }
            }

            info!("shutting down, waiting for collectors");
            for (thread_name, handle) in workers {
                if handle.join().is_err() {
                    error!(thread = %thread_name, "collector panicked");
                }
            }
        });

        for e in &self.exporters {
            e.stop();
        }
        info!(poller = %self.name, "poller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::ExporterStatus;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const HARVEST_YML: &str = r#"
Exporters:
  prom:
    exporter: Prometheus
    port: 0
    local_http_addr: 127.0.0.1
  broken:
    exporter: Carbon
Pollers:
  p1:
    datacenter: dc1
    addr: 10.0.0.1
    username: admin
    password: secret
    collectors:
      - Zapi
      - Unknown
    exporters:
      - prom
      - broken
      - missing
    labels:
      - org: abc
"#;

    const ZAPI_DEFAULT: &str = r#"
collector: Zapi
schedule:
  - instance: 10m
  - data: 1m
objects:
  Volume: volume.yaml
  Lun: lun.yaml
  Broken: broken.yaml
"#;

    struct Stub {
        base: CollectorBase,
    }

    impl Collector for Stub {
        fn base(&self) -> &CollectorBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut CollectorBase {
            &mut self.base
        }
        fn init(&mut self) -> Result<()> {
            if self.base.object == "Broken" {
                return Err(HarvestError::Template("no such file".into()));
            }
            self.base.finish_init(None)
        }
        fn poll_instance(&mut self) -> Result<Option<Matrix>> {
            Ok(None)
        }
        fn poll_data(&mut self) -> Result<Option<Matrix>> {
            Ok(None)
        }
    }

    fn stub(base: CollectorBase) -> Result<Box<dyn Collector>> {
        Ok(Box::new(Stub { base }))
    }

    fn setup() -> (TempDir, PollerArgs) {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("harvest.yml");
        fs::write(&config, HARVEST_YML).unwrap();
        let templates = dir.path().join("conf");
        fs::create_dir_all(templates.join("zapi")).unwrap();
        fs::write(templates.join("zapi").join("default.yaml"), ZAPI_DEFAULT).unwrap();
        let mut args = PollerArgs::new("p1", config);
        args.templates = templates;
        args.pid_dir = dir.path().join("pids");
        (dir, args)
    }

    #[test]
    fn pid_file_is_exclusive_and_removed() {
        let dir = TempDir::new().unwrap();
        let pid = PidFile::create(dir.path(), "p1").unwrap();
        let content = fs::read_to_string(pid.path()).unwrap();
        assert_eq!(content, std::process::id().to_string());
        assert!(PidFile::create(dir.path(), "p1").is_err());

        let path = pid.path().to_path_buf();
        drop(pid);
        assert!(!path.exists());
    }

    #[test]
    fn init_skips_failed_collectors_and_exporters() {
        let (_dir, args) = setup();
        let poller = Poller::with_factory(&args, stub).unwrap();
        assert_eq!(poller.collector_count(), 2);
        assert_eq!(poller.exporter_count(), 1);
        assert!(poller.pid_file().is_none());

        let c = &poller.collectors[0];
        assert_eq!(c.base().id(), "Zapi:Volume");
        assert_eq!(c.base().matrix.global_labels.value("datacenter"), "dc1");
        assert_eq!(c.base().matrix.global_labels.value("org"), "abc");
        assert_eq!(c.base().exporters.len(), 1);
    }

    #[test]
    fn objects_and_collectors_filters() {
        let (_dir, mut args) = setup();
        args.objects = vec!["lun".into()];
        let poller = Poller::with_factory(&args, stub).unwrap();
        assert_eq!(poller.collector_count(), 1);
        assert_eq!(poller.collectors[0].base().object, "Lun");

        args.objects.clear();
        args.collectors = vec!["Rest".into()];
        let poller = Poller::with_factory(&args, stub).unwrap();
        assert_eq!(poller.collector_count(), 0);
        assert!(matches!(
            poller.run(&AtomicBool::new(true)),
            Err(HarvestError::NoCollector(_))
        ));
    }

    #[test]
    fn debug_mode_skips_exporters() {
        let (_dir, mut args) = setup();
        args.debug = true;
        let poller = Poller::with_factory(&args, stub).unwrap();
        assert_eq!(poller.exporter_count(), 0);
        assert_eq!(poller.collector_count(), 2);
    }

    #[test]
    fn unknown_poller_is_a_config_error() {
        let (_dir, mut args) = setup();
        args.name = "nope".into();
        assert!(Poller::with_factory(&args, stub).is_err());
    }

    #[test]
    fn daemon_holds_pid_file_until_shutdown() {
        let (_dir, mut args) = setup();
        args.daemon = true;
        let poller = Poller::with_factory(&args, stub).unwrap();
        let pid_path = poller.pid_file().unwrap().to_path_buf();
        assert!(pid_path.exists());

        // a second instance of the same poller is refused
        assert!(Poller::with_factory(&args, stub).is_err());

        let running = Arc::new(AtomicBool::new(true));
        let stopper = {
            let running = running.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(300));
                running.store(false, Ordering::SeqCst);
            })
        };
        poller.run(&running).unwrap();
        stopper.join().unwrap();
        assert!(!pid_path.exists());
    }

    #[test]
    fn exporter_status_is_exported() {
        struct Sink {
            base: exporter::ExporterBase,
            seen: Mutex<Vec<String>>,
        }
        impl Exporter for Sink {
            fn base(&self) -> &exporter::ExporterBase {
                &self.base
            }
            fn export(&self, data: &Matrix) -> Result<()> {
                self.seen.lock().unwrap().push(data.object.clone());
                Ok(())
            }
        }
        let sink = Arc::new(Sink {
            base: exporter::ExporterBase::new("sink", "Prometheus"),
            seen: Mutex::new(Vec::new()),
        });
        let poller = Poller {
            name: "p1".into(),
            exporters: vec![sink.clone()],
            collectors: Vec::new(),
            pid_file: None,
        };
        poller.export_status();
        assert_eq!(sink.seen.lock().unwrap().as_slice(), ["metadata_component"]);
        assert_eq!(sink.base.status(), ExporterStatus::Up);
    }

    #[test]
    fn quit_signal_shuts_down_and_removes_pid_file() {
        let (_dir, mut args) = setup();
        args.daemon = true;
        let poller = Poller::with_factory(&args, stub).unwrap();
        let pid_path = poller.pid_file().unwrap().to_path_buf();

        let running = Arc::new(AtomicBool::new(true));
        shutdown_on_quit(running.clone()).unwrap();
        let raiser = std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(200));
            signal_hook::low_level::raise(SIGQUIT).unwrap();
        });
        poller.run(&running).unwrap();
        raiser.join().unwrap();
        assert!(!running.load(Ordering::SeqCst));
        assert!(!pid_path.exists());
    }
}
