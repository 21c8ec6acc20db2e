//! Collector lifecycle.
//!
//! A collector fetches one object (volume, lif, ...) of one family (Zapi,
//! ZapiPerf, Rest) and owns everything it needs for that: the resolved
//! template, its [`Schedule`], the data [`Matrix`], the metadata matrices,
//! its plugin chain and handles to the shared exporters.
//!
//! ```text
//!   init():  default template ─┬─ connect, system identity
//!                              ├─ overlay version sub-template
//!                              ├─ parse counters (collector specific)
//!                              └─ schedule, metadata, plugins (finish_init)
//!
//!   run():   loop { due tasks → poll → plugins → export fan-out → sleep }
//! ```

mod rest;
mod runner;
mod zapi;
mod zapiperf;

pub use rest::RestCollector;
pub use runner::{export_all, run, run_once};
pub use zapi::ZapiCollector;
pub use zapiperf::ZapiPerfCollector;

use std::fmt;
use std::sync::Arc;

use tracing::{Span, debug, info_span, warn};

use crate::api::{ConnectionParams, HttpRestClient, HttpZapiClient, SystemInfo, ZapiClient};
use crate::errors::{HarvestError, Result};
use crate::exporter::Exporter;
use crate::matrix::{ExportOptions, Matrix};
use crate::plugin::{self, Plugin, PluginContext};
use crate::schedule::Schedule;
use crate::template::{self, ClusterModel, TemplateStore, Version};
use crate::tree::Node;

/// Metrics of the per-task metadata matrix, times in microseconds.
pub const METADATA_METRICS: [&str; 7] = [
    "poll_time",
    "task_time",
    "api_time",
    "parse_time",
    "calc_time",
    "plugin_time",
    "count",
];

/// Poller-wide settings every collector receives.
#[derive(Debug, Clone)]
pub struct Options {
    pub poller: String,
    pub datacenter: String,
    pub hostname: String,
    pub version: String,
    /// Extra global labels from the poller config.
    pub labels: Vec<(String, String)>,
    pub templates: TemplateStore,
    /// Connection to the monitored system; `None` when clients are injected.
    pub connection: Option<ConnectionParams>,
}

impl Options {
    pub fn new(poller: impl Into<String>, templates: TemplateStore) -> Self {
        Self {
            poller: poller.into(),
            datacenter: String::new(),
            hostname: crate::util::hostname(),
            version: crate::VERSION.to_string(),
            labels: Vec::new(),
            templates,
            connection: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Up,
    Standby,
    Failed,
}

impl CollectorState {
    /// Value of the `status` gauge.
    pub fn code(self) -> u8 {
        match self {
            CollectorState::Up => 0,
            CollectorState::Standby => 1,
            CollectorState::Failed => 2,
        }
    }
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CollectorState::Up => "up",
            CollectorState::Standby => "standby",
            CollectorState::Failed => "failed",
        })
    }
}

/// State shared by all collector kinds.
pub struct CollectorBase {
    /// Collector class, e.g. `ZapiPerf`.
    pub name: String,
    /// Object as named in the `objects` section, e.g. `Volume`.
    pub object: String,
    pub template: Node,
    pub options: Arc<Options>,
    pub schedule: Schedule,
    pub matrix: Matrix,
    /// `metadata_collector`: per-task timings and counts.
    pub metadata: Matrix,
    pub plugins: Vec<Box<dyn Plugin>>,
    pub exporters: Vec<Arc<dyn Exporter>>,
    pub system: Option<SystemInfo>,
    /// Next standby interval in seconds after a connection or rejection error.
    pub(crate) retry_delay: u64,
    sub_template: Option<String>,
    state: CollectorState,
    reason: String,
    span: Span,
}

impl CollectorBase {
    pub fn new(name: &str, object: &str, template: Node, options: Arc<Options>) -> Self {
        let sub_template = template::objects(&template)
            .into_iter()
            .find(|(o, _)| o == object)
            .map(|(_, file)| file);

        let mut matrix = Matrix::new(name, object, "");
        if !options.datacenter.is_empty() {
            matrix.set_global_label("datacenter", &options.datacenter);
        }
        for (k, v) in &options.labels {
            matrix.set_global_label(k, v);
        }

        let span = info_span!("collector", name = %name, object = %object);
        Self {
            name: name.to_string(),
            object: object.to_string(),
            template,
            options,
            schedule: Schedule::new(),
            matrix,
            metadata: Matrix::new(name, "metadata_collector", "metadata_collector"),
            plugins: Vec::new(),
            exporters: Vec::new(),
            system: None,
            retry_delay: 1,
            sub_template,
            state: CollectorState::Up,
            reason: String::new(),
            span,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// `name:object`, the prefix used in logs and status.
    pub fn id(&self) -> String {
        format!("{}:{}", self.name, self.object)
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn set_state(&mut self, state: CollectorState, reason: impl Into<String>) {
        self.state = state;
        self.reason = reason.into();
    }

    /// Content of a top-level template parameter, empty if absent.
    pub fn param(&self, name: &str) -> &str {
        self.template.child_content(name)
    }

    /// Integer template parameter; invalid values fall back to `default` with a warning.
    pub fn param_usize(&self, name: &str, default: usize) -> usize {
        let raw = self.param(name);
        if raw.is_empty() {
            return default;
        }
        match raw.parse() {
            Ok(n) => n,
            Err(_) => {
                warn!(param = name, value = raw, "invalid integer parameter, using default {}", default);
                default
            }
        }
    }

    /// Records the identity of the system and labels the data matrix with it.
    pub fn set_system(&mut self, system: SystemInfo) {
        self.matrix.set_global_label("cluster", &system.name);
        if system.model == ClusterModel::SevenMode {
            self.matrix.set_global_label("node", &system.name);
        }
        self.system = Some(system);
    }

    /// Overlays the version-specific sub-template of this object.
    pub fn import_sub_template(&mut self, model: ClusterModel, version: Version) -> Result<()> {
        let Some(file) = self.sub_template.clone() else {
            return Ok(());
        };
        let sub = self
            .options
            .templates
            .sub_template(&self.name, model, version, &file)?;
        self.template.overlay(&sub);
        debug!(file = %file, "imported sub-template");
        Ok(())
    }

    /// Schedule, export options, metadata matrix and plugins; the common
    /// tail of every `init()`.
    pub fn finish_init(&mut self, client: Option<Arc<dyn ZapiClient>>) -> Result<()> {
        let tasks = template::schedule(&self.template)?;
        for (task, interval) in &tasks {
            self.schedule.new_task(task, *interval, true)?;
        }

        self.matrix.export_options = template::export_options(&self.template);
        self.metadata = self.metadata_matrix()?;

        if let Some(node) = self.template.child("plugins") {
            let ctx = PluginContext {
                collector: self.name.clone(),
                object: self.object.clone(),
                parent: self.template.clone(),
                client,
            };
            self.plugins = plugin::load_plugins(node, &ctx)?;
        }

        self.set_state(CollectorState::Up, "initialized");
        Ok(())
    }

    fn metadata_matrix(&self) -> Result<Matrix> {
        let mut md = Matrix::new(&self.name, "metadata_collector", "metadata_collector");
        md.set_global_label("hostname", &self.options.hostname);
        md.set_global_label("version", &self.options.version);
        md.set_global_label("poller", &self.options.poller);
        md.set_global_label("collector", &self.name);
        md.set_global_label("object", &self.object);
        for metric in METADATA_METRICS {
            md.add_metric(metric, metric)?;
        }
        for task in self.schedule.all_tasks() {
            let instance = md.add_instance(&task.name)?;
            instance.labels.set("task", &task.name);
            instance
                .labels
                .set("interval", format!("{:.4}", task.interval().as_secs_f64()));
        }
        md.export_options = ExportOptions {
            instance_keys: vec!["task".into()],
            instance_labels: vec!["interval".into()],
            include_all_labels: false,
        };
        md.exportable = true;
        md.init_data()?;
        Ok(md)
    }

    /// Sets one metadata cell; missing task rows are ignored.
    pub fn record(&mut self, task: &str, metric: &str, value: f64) {
        if self.metadata.is_initialized() {
            let _ = self.metadata.set_value(metric, task, value);
        }
    }

    /// Clears the metadata of `task` before it runs.
    pub fn reset_metadata(&mut self, task: &str) {
        if !self.metadata.is_initialized() {
            return;
        }
        for metric in METADATA_METRICS {
            let _ = self.metadata.set_nan(metric, task);
        }
    }

    /// `metadata_component`: one row with the `status` gauge and reason.
    pub fn status_matrix(&self) -> Matrix {
        let mut m = Matrix::new(&self.name, "metadata_component", "metadata_component");
        m.set_global_label("poller", &self.options.poller);
        m.set_global_label("hostname", &self.options.hostname);
        m.set_global_label("version", &self.options.version);
        m.export_options = ExportOptions {
            instance_keys: vec!["type".into(), "name".into(), "target".into()],
            instance_labels: vec!["reason".into()],
            include_all_labels: false,
        };
        let key = self.id();
        if m.add_metric("status", "status").is_ok()
            && let Ok(instance) = m.add_instance(&key)
        {
            instance.labels.set("type", "collector");
            instance.labels.set("name", &self.name);
            instance.labels.set("target", &self.object);
            instance.labels.set("reason", &self.reason);
            if m.init_data().is_ok() {
                let _ = m.set_value("status", &key, f64::from(self.state.code()));
            }
        }
        m
    }

    /// Runs the plugin chain on the data matrix; plugin errors are logged.
    pub fn run_plugins(&mut self, data: &mut Matrix) -> Vec<Matrix> {
        let mut derived = Vec::new();
        for plugin in &mut self.plugins {
            match plugin.run(data) {
                Ok(out) => {
                    if !out.is_empty() {
                        debug!(plugin = plugin.name(), matrices = out.len(), "plugin added data");
                    }
                    derived.extend(out);
                }
                Err(e) => warn!(plugin = plugin.name(), error = %e, "plugin failed"),
            }
        }
        derived
    }
}

/// One collector kind. Implementations hold a [`CollectorBase`] and an API client.
pub trait Collector: Send {
    fn base(&self) -> &CollectorBase;
    fn base_mut(&mut self) -> &mut CollectorBase;

    /// Connects, resolves the template and builds the matrix schema.
    fn init(&mut self) -> Result<()>;

    /// Refreshes counter metadata. Only perf collectors have this task.
    fn poll_counter(&mut self) -> Result<Option<Matrix>> {
        Err(HarvestError::InvalidParam(format!(
            "[{}] has no counter task",
            self.base().name
        )))
    }

    /// Refreshes the instance set.
    fn poll_instance(&mut self) -> Result<Option<Matrix>>;

    /// Collects values; returns the matrix to hand to plugins and exporters.
    fn poll_data(&mut self) -> Result<Option<Matrix>>;

    fn poll(&mut self, task: &str) -> Result<Option<Matrix>> {
        match task {
            "counter" => self.poll_counter(),
            "instance" => self.poll_instance(),
            "data" => self.poll_data(),
            other => Err(HarvestError::InvalidParam(format!("unknown task [{}]", other))),
        }
    }
}

/// Collector classes this poller can run.
pub const COLLECTOR_CLASSES: [&str; 3] = ["Zapi", "ZapiPerf", "Rest"];

/// Builds a collector of `base.name` with an HTTP client from `base.options`.
pub fn new_collector(base: CollectorBase) -> Result<Box<dyn Collector>> {
    let params = base
        .options
        .connection
        .clone()
        .ok_or_else(|| HarvestError::MissingParam("addr".into()))?;
    match base.name.as_str() {
        "Zapi" => {
            let client: Arc<dyn ZapiClient> = Arc::new(HttpZapiClient::new(params)?);
            Ok(Box::new(ZapiCollector::new(base, client)))
        }
        "ZapiPerf" => {
            let client: Arc<dyn ZapiClient> = Arc::new(HttpZapiClient::new(params)?);
            Ok(Box::new(ZapiPerfCollector::new(base, client)))
        }
        "Rest" => {
            let client = Arc::new(HttpRestClient::new(params)?);
            Ok(Box::new(RestCollector::new(base, client)))
        }
        other => Err(HarvestError::InvalidParam(format!(
            "unknown collector [{}]",
            other
        ))),
    }
}

/// One instance as read from a response, before it is written to the matrix.
#[derive(Debug, Default)]
pub(crate) struct StagedInstance {
    pub key: String,
    pub labels: Vec<(String, String)>,
    pub values: Vec<(String, f64)>,
}

/// Replaces the instance set of `matrix` with `staged` and writes the values.
///
/// Existing instances keep their column; stale ones are removed. Labels are
/// rewritten from scratch and every instance is made exportable again.
pub(crate) fn reconcile(matrix: &mut Matrix, staged: Vec<StagedInstance>) -> Result<usize> {
    let keep: std::collections::HashSet<&str> = staged.iter().map(|s| s.key.as_str()).collect();
    let stale: Vec<String> = matrix
        .instance_keys()
        .iter()
        .filter(|k| !keep.contains(k.as_str()))
        .cloned()
        .collect();
    for key in &stale {
        matrix.remove_instance(key);
    }
    for s in &staged {
        if !matrix.has_instance(&s.key) {
            matrix.add_instance(&s.key)?;
        }
        let Some(instance) = matrix.instance_mut(&s.key) else {
            continue;
        };
        instance.labels.clear();
        instance.exportable = true;
        for (k, v) in &s.labels {
            instance.labels.set(k, v);
        }
    }
    if matrix.stride() == 0 || matrix.instance_count() == 0 {
        return Ok(0);
    }
    matrix.init_data()?;
    let mut count = 0;
    for s in staged {
        for (metric, value) in s.values {
            if matrix.set_value(&metric, &s.key, value).is_ok() {
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Splits `"key => display"` style list entries, shared by the collectors.
pub(crate) fn split_display(raw: &str) -> (String, Option<String>) {
    match raw.split_once("=>") {
        Some((k, d)) => (k.trim().to_string(), Some(d.trim().to_string())),
        None => (raw.trim().to_string(), None),
    }
}
