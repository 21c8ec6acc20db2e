//! The collector loop: run due tasks, classify failures into standby
//! intervals, push results through plugins and fan them out to exporters.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::{Collector, CollectorBase, CollectorState};
use crate::errors::{ErrorKind, HarvestError};
use crate::exporter::Exporter;
use crate::matrix::Matrix;
use crate::util::micros;

/// Tasks starting this late are logged.
const LAG_WARNING: Duration = Duration::from_millis(50);
/// Upper bound of the doubling backoff after connection errors.
const CONNECTION_BACKOFF_CAP: u64 = 1024;
/// Upper bound of the doubling backoff after rejected requests.
const REJECTED_BACKOFF_CAP: u64 = 64;
const NO_INSTANCE_STANDBY: Duration = Duration::from_secs(5 * 60);
const NO_METRIC_STANDBY: Duration = Duration::from_secs(60 * 60);

enum Flow {
    Continue,
    Standby,
    Stop,
}

/// Runs `collector` until `running` is cleared or the collector fails.
pub fn run(collector: &mut dyn Collector, running: &AtomicBool) {
    let span = collector.base().span().clone();
    let _guard = span.enter();
    info!(tasks = collector.base().schedule.all_tasks().len(), "started");

    loop {
        if !run_once(collector) {
            error!(reason = %collector.base().reason(), "collector stopped");
            break;
        }
        if !collector.base().schedule.sleep(running) {
            break;
        }
    }
    debug!("collector loop finished");
}

/// One pass over the tasks that are due now. Returns `false` once the
/// collector has failed and must not be scheduled again.
pub fn run_once(collector: &mut dyn Collector) -> bool {
    let due = collector.base().schedule.due_tasks(Instant::now());
    if due.is_empty() {
        return true;
    }

    let mut results: Vec<Matrix> = Vec::new();
    for task in &due {
        let started = Instant::now();
        match collector.base_mut().schedule.start(task, started) {
            Ok(lag) if lag >= LAG_WARNING => {
                warn!(task = %task, lag_ms = lag.as_millis() as u64, "task started late");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(task = %task, error = %e, "cannot start task");
                continue;
            }
        }
        collector.base_mut().reset_metadata(task);

        let outcome = collector.poll(task);
        let poll_time = started.elapsed();

        let mut recovered = false;
        let data = match outcome {
            Ok(data) => {
                recovered = on_success(collector.base_mut());
                data
            }
            Err(e) => match on_error(collector.base_mut(), task, &e) {
                Flow::Continue => None,
                Flow::Standby => break,
                Flow::Stop => {
                    export_status(collector.base());
                    return false;
                }
            },
        };

        let base = collector.base_mut();
        base.record(task, "poll_time", micros(poll_time));

        if task == "data"
            && let Some(mut data) = data
        {
            let plugin_start = Instant::now();
            let derived = base.run_plugins(&mut data);
            if !base.plugins.is_empty() {
                base.record(task, "plugin_time", micros(plugin_start.elapsed()));
            }
            results.push(data);
            results.extend(derived);
        }

        match base.schedule.complete(task, Instant::now()) {
            Ok(report) => {
                base.record(task, "task_time", micros(report.duration));
                if report.overrun {
                    warn!(
                        task = %task,
                        duration_ms = report.duration.as_millis() as u64,
                        "task took longer than its interval"
                    );
                }
            }
            Err(e) => warn!(task = %task, error = %e, "cannot complete task"),
        }
        if recovered {
            base.schedule.recover();
            info!(task = %task, "recovered from standby");
        }
    }

    let base = collector.base();
    let mut batch = Vec::with_capacity(results.len() + 2);
    batch.push(base.metadata.clone());
    batch.push(base.status_matrix());
    batch.extend(results);
    export_all(&base.exporters, &batch);
    true
}

/// Resets the backoff; returns true if the schedule has to leave standby.
fn on_success(base: &mut CollectorBase) -> bool {
    if base.state() != CollectorState::Up {
        base.set_state(CollectorState::Up, "running");
    }
    base.retry_delay = 1;
    base.schedule.in_standby()
}

fn on_error(base: &mut CollectorBase, task: &str, err: &HarvestError) -> Flow {
    let (interval, reason) = match err.kind() {
        ErrorKind::Connectivity => (backoff(base, CONNECTION_BACKOFF_CAP), "connection error"),
        ErrorKind::Rejected => (backoff(base, REJECTED_BACKOFF_CAP), "request rejected"),
        ErrorKind::NoInstance => (NO_INSTANCE_STANDBY, "no instances"),
        ErrorKind::NoMetric => (NO_METRIC_STANDBY, "no metrics"),
        ErrorKind::Schema | ErrorKind::Internal | ErrorKind::Export => {
            warn!(task = %task, error = %err, "poll failed");
            return Flow::Continue;
        }
        ErrorKind::Configuration | ErrorKind::Fatal => {
            error!(task = %task, error = %err, "unrecoverable error");
            base.set_state(CollectorState::Failed, err.to_string());
            return Flow::Stop;
        }
    };

    if let Err(e) = base.schedule.set_standby(task, interval) {
        error!(task = %task, error = %e, "cannot enter standby");
        base.set_state(CollectorState::Failed, e.to_string());
        return Flow::Stop;
    }
    warn!(
        task = %task,
        error = %err,
        retry_s = interval.as_secs(),
        "entering standby"
    );
    base.set_state(CollectorState::Standby, reason);
    Flow::Standby
}

/// Current backoff interval; the next one doubles up to `cap` seconds.
fn backoff(base: &mut CollectorBase, cap: u64) -> Duration {
    let current = base.retry_delay.clamp(1, cap);
    base.retry_delay = (current * 2).min(cap);
    Duration::from_secs(current)
}

fn export_status(base: &CollectorBase) {
    let batch = [base.status_matrix()];
    export_all(&base.exporters, &batch);
}

/// Hands `batch` to every exporter, one scoped thread per exporter. An
/// exporter that fails is skipped for the rest of the batch.
pub fn export_all(exporters: &[Arc<dyn Exporter>], batch: &[Matrix]) {
    if exporters.is_empty() || batch.is_empty() {
        return;
    }
    std::thread::scope(|s| {
        for exporter in exporters {
            s.spawn(move || {
                for matrix in batch.iter().filter(|m| m.exportable) {
                    if let Err(e) = exporter.export_tracked(matrix) {
                        warn!(
                            exporter = exporter.name(),
                            object = %matrix.object,
                            error = %e,
                            "export failed, skipping rest of this tick"
                        );
                        break;
                    }
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testutil;
    use crate::errors::Result;
    use crate::exporter::ExporterBase;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const TEMPLATE: &str = r#"
object: volume
schedule:
  - instance: 10m
  - data: 1m
"#;

    struct Scripted {
        base: CollectorBase,
        data: VecDeque<Result<Option<Matrix>>>,
        instance_calls: usize,
    }

    impl Scripted {
        fn new(data: Vec<Result<Option<Matrix>>>) -> Self {
            let mut base = testutil::base("Zapi", "Volume", TEMPLATE);
            base.finish_init(None).unwrap();
            Self {
                base,
                data: data.into(),
                instance_calls: 0,
            }
        }
    }

    impl Collector for Scripted {
        fn base(&self) -> &CollectorBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut CollectorBase {
            &mut self.base
        }
        fn init(&mut self) -> Result<()> {
            Ok(())
        }
        fn poll_instance(&mut self) -> Result<Option<Matrix>> {
            self.instance_calls += 1;
            Ok(None)
        }
        fn poll_data(&mut self) -> Result<Option<Matrix>> {
            self.data.pop_front().unwrap_or(Ok(None))
        }
    }

    struct Recorder {
        base: ExporterBase,
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn new(fail: bool) -> Self {
            Self {
                base: ExporterBase::new("rec", "Recorder"),
                seen: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    impl Exporter for Recorder {
        fn base(&self) -> &ExporterBase {
            &self.base
        }
        fn export(&self, data: &Matrix) -> Result<()> {
            self.seen.lock().unwrap().push(data.object.clone());
            if self.fail {
                return Err(HarvestError::Export("sink down".into()));
            }
            Ok(())
        }
    }

    fn volume_matrix() -> Matrix {
        let mut m = Matrix::new("Zapi", "volume", "");
        m.add_metric("size", "size").unwrap();
        m.add_instance("v1").unwrap();
        m.init_data().unwrap();
        m.set_value("size", "v1", 10.0).unwrap();
        m
    }

    #[test]
    fn data_is_exported_with_metadata() {
        let mut c = Scripted::new(vec![Ok(Some(volume_matrix()))]);
        let rec = Arc::new(Recorder::new(false));
        c.base.exporters.push(rec.clone());

        assert!(run_once(&mut c));
        assert_eq!(c.instance_calls, 1);
        let seen = rec.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["metadata_collector", "metadata_component", "volume"]);
        assert!(c.base.metadata.get_value("poll_time", "data").is_some());
    }

    #[test]
    fn connection_error_enters_standby_with_backoff() {
        let mut c = Scripted::new(vec![Err(HarvestError::Connection("refused".into()))]);
        assert!(run_once(&mut c));
        assert_eq!(c.base.state(), CollectorState::Standby);
        let pinned = c.base.schedule.standby_task().unwrap();
        assert_eq!(pinned.name, "data");
        assert_eq!(pinned.interval(), Duration::from_secs(1));
        assert_eq!(c.base.retry_delay, 2);
    }

    #[test]
    fn backoff_is_capped() {
        let mut base = testutil::base("Zapi", "Volume", TEMPLATE);
        base.retry_delay = 1024;
        assert_eq!(backoff(&mut base, CONNECTION_BACKOFF_CAP), Duration::from_secs(1024));
        assert_eq!(base.retry_delay, 1024);
        base.retry_delay = 48;
        assert_eq!(backoff(&mut base, REJECTED_BACKOFF_CAP), Duration::from_secs(48));
        assert_eq!(base.retry_delay, 64);
    }

    #[test]
    fn no_instance_standby_is_five_minutes() {
        let mut c = Scripted::new(vec![Err(HarvestError::NoInstance("volume".into()))]);
        assert!(run_once(&mut c));
        assert_eq!(
            c.base.schedule.standby_task().unwrap().interval(),
            NO_INSTANCE_STANDBY
        );
        assert_eq!(c.base.reason(), "no instances");
    }

    #[test]
    fn fatal_error_stops_collector() {
        let mut c = Scripted::new(vec![Err(HarvestError::AuthFailed("401".into()))]);
        let rec = Arc::new(Recorder::new(false));
        c.base.exporters.push(rec.clone());
        assert!(!run_once(&mut c));
        assert_eq!(c.base.state(), CollectorState::Failed);
        assert_eq!(
            rec.seen.lock().unwrap().clone(),
            vec!["metadata_component"]
        );
    }

    #[test]
    fn schema_error_is_logged_and_skipped() {
        let mut c = Scripted::new(vec![Err(HarvestError::Schema("attributes-list".into()))]);
        assert!(run_once(&mut c));
        assert_eq!(c.base.state(), CollectorState::Up);
        assert!(!c.base.schedule.in_standby());
    }

    #[test]
    fn success_recovers_from_standby() {
        let mut c = Scripted::new(vec![
            Err(HarvestError::Connection("refused".into())),
            Ok(Some(volume_matrix())),
        ]);
        assert!(run_once(&mut c));
        assert!(c.base.schedule.in_standby());
        // force the pinned task due
        c.base
            .schedule
            .set_standby_at("data", Duration::from_secs(1), Instant::now() - Duration::from_secs(5))
            .unwrap();
        assert!(run_once(&mut c));
        assert!(!c.base.schedule.in_standby());
        assert_eq!(c.base.state(), CollectorState::Up);
        assert_eq!(c.base.retry_delay, 1);
    }

    #[test]
    fn failing_exporter_skips_rest_of_batch() {
        let rec = Arc::new(Recorder::new(true));
        let exporters: Vec<Arc<dyn Exporter>> = vec![rec.clone()];
        export_all(&exporters, &[volume_matrix(), volume_matrix()]);
        assert_eq!(rec.seen.lock().unwrap().len(), 1);
        assert_eq!(rec.base.status(), crate::exporter::ExporterStatus::Failed);
    }
}
