//! Sinks for collected matrices.
//!
//! ```text
//!   collector A ──┐                 ┌──► Prometheus  (cache ◄── HTTP scrape)
//!   collector B ──┼── export(&M) ───┼──► InfluxDB    (line protocol, POST)
//!   collector C ──┘                 └──► Graphite    (plaintext, TCP)
//! ```
//!
//! Exporters are shared by every collector of a poller and called
//! concurrently; each guards its own state and never holds a lock across
//! network I/O.

mod graphite;
mod influxdb;
pub mod prometheus;

pub use graphite::Graphite;
pub use influxdb::InfluxDb;
pub use prometheus::Prometheus;

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use tracing::{Span, debug, info, info_span, warn};

use crate::conf;
use crate::errors::{HarvestError, Result};
use crate::matrix::{ExportOptions, Matrix};

/// Exporter classes this poller can run.
pub const EXPORTER_CLASSES: [&str; 3] = ["Prometheus", "InfluxDB", "Graphite"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterStatus {
    Up,
    Failed,
}

impl ExporterStatus {
    /// Value of the `status` gauge.
    pub fn code(self) -> u8 {
        match self {
            ExporterStatus::Up => 0,
            ExporterStatus::Failed => 3,
        }
    }

    fn from_code(code: u8) -> Self {
        if code == 0 {
            ExporterStatus::Up
        } else {
            ExporterStatus::Failed
        }
    }
}

/// Name, status and counters shared by all exporter kinds.
pub struct ExporterBase {
    pub name: String,
    pub class: String,
    status: AtomicU8,
    exported: AtomicU64,
    span: Span,
}

impl ExporterBase {
    pub fn new(name: &str, class: &str) -> Self {
        Self {
            name: name.to_string(),
            class: class.to_string(),
            status: AtomicU8::new(ExporterStatus::Up.code()),
            exported: AtomicU64::new(0),
            span: info_span!("exporter", name = %name),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn status(&self) -> ExporterStatus {
        ExporterStatus::from_code(self.status.load(Ordering::Relaxed))
    }

    fn set_status(&self, status: ExporterStatus) -> ExporterStatus {
        ExporterStatus::from_code(self.status.swap(status.code(), Ordering::Relaxed))
    }

    /// Adds to the number of exported data points.
    pub fn add_exported(&self, n: u64) {
        self.exported.fetch_add(n, Ordering::Relaxed);
    }

    /// Exported data points since the last call.
    pub fn take_exported(&self) -> u64 {
        self.exported.swap(0, Ordering::Relaxed)
    }

    /// `metadata_component` row of this exporter, same layout as the
    /// collectors' status matrix.
    pub fn status_matrix(&self, poller: &str) -> Matrix {
        let mut m = Matrix::new(&self.class, "metadata_component", "metadata_component");
        m.set_global_label("poller", poller);
        m.export_options = ExportOptions {
            instance_keys: vec!["type".into(), "name".into(), "target".into()],
            instance_labels: vec!["reason".into()],
            include_all_labels: false,
        };
        let key = format!("{}:{}", self.class, self.name);
        let status = self.status();
        if m.add_metric("status", "status").is_ok()
            && m.add_metric("count", "count").is_ok()
            && let Ok(instance) = m.add_instance(&key)
        {
            instance.labels.set("type", "exporter");
            instance.labels.set("name", &self.class);
            instance.labels.set("target", &self.name);
            instance.labels.set("reason", if status == ExporterStatus::Up { "running" } else { "failed" });
            if m.init_data().is_ok() {
                let _ = m.set_value("status", &key, f64::from(status.code()));
                let _ = m.set_value("count", &key, self.take_exported() as f64);
            }
        }
        m
    }
}

pub trait Exporter: Send + Sync {
    fn base(&self) -> &ExporterBase;

    /// Renders and emits one matrix.
    fn export(&self, data: &Matrix) -> Result<()>;

    fn name(&self) -> &str {
        &self.base().name
    }

    /// Starts background parts (the Prometheus HTTP server).
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stops background parts; in-flight requests complete.
    fn stop(&self) {}

    /// [`Exporter::export`] inside the exporter's span, with status
    /// transitions: a failure marks the exporter failed, the next success
    /// brings it back up.
    fn export_tracked(&self, data: &Matrix) -> Result<()> {
        let base = self.base();
        let _guard = base.span().enter();
        match self.export(data) {
            Ok(()) => {
                if base.set_status(ExporterStatus::Up) == ExporterStatus::Failed {
                    info!("exporter recovered");
                }
                Ok(())
            }
            Err(e) => {
                if base.set_status(ExporterStatus::Failed) == ExporterStatus::Up {
                    warn!(error = %e, "exporter failed");
                }
                Err(e)
            }
        }
    }
}

/// Poller-side settings an exporter may need.
#[derive(Debug, Clone, Default)]
pub struct ExporterOptions {
    pub poller: String,
    /// `--promPort` from the command line; wins over the configured port.
    pub prom_port: Option<u16>,
}

/// Builds the exporter named `name` from its config entry.
pub fn new_exporter(
    name: &str,
    params: &conf::Exporter,
    options: &ExporterOptions,
) -> Result<Box<dyn Exporter>> {
    let exporter: Box<dyn Exporter> = match params.exporter.as_str() {
        "Prometheus" => Box::new(Prometheus::new(name, params, options)?),
        "InfluxDB" => Box::new(InfluxDb::new(name, params)?),
        "Graphite" => Box::new(Graphite::new(name, params)?),
        "" => return Err(HarvestError::MissingParam(format!("exporter [{}]: exporter", name))),
        other => {
            return Err(HarvestError::InvalidParam(format!(
                "exporter [{}]: unknown class [{}]",
                name, other
            )));
        }
    };
    debug!(exporter = name, class = %params.exporter, "exporter created");
    Ok(exporter)
}

/// Label pairs of one instance: global labels first, then the instance
/// keys, skipping empty values and keys already present.
pub(crate) fn instance_keys<'a>(data: &'a Matrix, labels: &'a crate::matrix::LabelMap) -> Vec<(&'a str, &'a str)> {
    let candidates = data.global_labels.iter().chain(
        data.export_options
            .instance_keys
            .iter()
            .map(|k| (k.as_str(), labels.value(k))),
    );
    let mut out: Vec<(&str, &str)> = Vec::new();
    for (k, v) in candidates {
        if !v.is_empty() && !out.iter().any(|(seen, _)| *seen == k) {
            out.push((k, v));
        }
    }
    out
}

/// Non-key labels requested for an instance: `instance_labels`, or every
/// remaining label with `include_all_labels`.
pub(crate) fn instance_extra_labels<'a>(
    data: &'a Matrix,
    labels: &'a crate::matrix::LabelMap,
    keys: &[(&str, &str)],
) -> Vec<(&'a str, &'a str)> {
    let taken = |k: &str| keys.iter().any(|(seen, _)| *seen == k);
    if data.export_options.include_all_labels {
        return labels
            .iter()
            .filter(|(k, v)| !v.is_empty() && !taken(k))
            .collect();
    }
    data.export_options
        .instance_labels
        .iter()
        .map(|k| (k.as_str(), labels.value(k)))
        .filter(|(k, v)| !v.is_empty() && !taken(k))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky {
        base: ExporterBase,
        fail: std::sync::atomic::AtomicBool,
    }

    impl Exporter for Flaky {
        fn base(&self) -> &ExporterBase {
            &self.base
        }
        fn export(&self, _data: &Matrix) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(HarvestError::Export("down".into()));
            }
            self.base.add_exported(1);
            Ok(())
        }
    }

    #[test]
    fn status_follows_last_export() {
        let e = Flaky {
            base: ExporterBase::new("sink", "Test"),
            fail: std::sync::atomic::AtomicBool::new(true),
        };
        let m = Matrix::new("Zapi", "volume", "");
        assert!(e.export_tracked(&m).is_err());
        assert_eq!(e.base().status(), ExporterStatus::Failed);
        assert_eq!(e.base().status().code(), 3);

        e.fail.store(false, Ordering::Relaxed);
        e.export_tracked(&m).unwrap();
        assert_eq!(e.base().status(), ExporterStatus::Up);

        let status = e.base().status_matrix("p1");
        assert_eq!(status.get_value("status", "Test:sink"), Some(0.0));
        assert_eq!(status.get_value("count", "Test:sink"), Some(1.0));
        assert_eq!(e.base().take_exported(), 0);
    }

    #[test]
    fn factory_rejects_unknown_class() {
        let params = conf::Exporter {
            exporter: "Splunk".into(),
            ..Default::default()
        };
        assert!(new_exporter("x", &params, &ExporterOptions::default()).is_err());
        let params = conf::Exporter::default();
        assert!(matches!(
            new_exporter("x", &params, &ExporterOptions::default()),
            Err(HarvestError::MissingParam(_))
        ));
    }

    #[test]
    fn keys_and_labels_of_an_instance() {
        let mut m = Matrix::new("Zapi", "volume", "");
        m.set_global_label("cluster", "c1");
        m.export_options = ExportOptions {
            instance_keys: vec!["volume".into(), "svm".into(), "cluster".into()],
            instance_labels: vec!["state".into(), "junction".into()],
            include_all_labels: false,
        };
        let i = m.add_instance("v1").unwrap();
        i.labels.set("volume", "v1");
        i.labels.set("cluster", "other");
        i.labels.set("state", "online");
        let labels = m.instance("v1").unwrap().labels.clone();
        let keys = instance_keys(&m, &labels);
        assert_eq!(keys, vec![("cluster", "c1"), ("volume", "v1")]);
        assert_eq!(instance_extra_labels(&m, &labels, &keys), vec![("state", "online")]);

        let mut all = m.clone();
        all.export_options.include_all_labels = true;
        let keys = instance_keys(&all, &labels);
        assert_eq!(keys, vec![("cluster", "c1"), ("volume", "v1")]);
        assert_eq!(instance_extra_labels(&all, &labels, &keys), vec![("state", "online")]);
    }
}
