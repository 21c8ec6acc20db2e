//! Performance collector over the ZAPI perf APIs.
//!
//! Three tasks:
//! - `counter`:  `perf-object-counter-list-info` builds the metric schema
//!   (properties, base counters, array labels, deprecations)
//! - `instance`: `perf-object-instance-list-info-iter` refreshes instances
//! - `data`:     `perf-object-get-instances` in batches, cooked against the
//!   raw values of the previous poll (see [`cook`])

mod cook;

pub use cook::{TIMESTAMP, cook};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, trace, warn};

use super::{Collector, CollectorBase, split_display};
use crate::api::ZapiClient;
use crate::errors::{HarvestError, Result};
use crate::matrix::{Matrix, Property};
use crate::template::perf_display;
use crate::tree::Node;
use crate::util::micros;

const DEFAULT_BATCH_SIZE: usize = 100;
/// Step by which the batch shrinks after "resource limit exceeded".
const BATCH_STEP: usize = 100;
/// Polls in a row a counter may be absent from every instance before it is disabled.
const MISSING_LIMIT: u32 = 10;

/// A string counter exported as an instance label.
#[derive(Debug, Clone, PartialEq)]
struct LabelCounter {
    name: String,
    display: String,
}

pub struct ZapiPerfCollector {
    base: CollectorBase,
    client: Arc<dyn ZapiClient>,
    query: String,
    /// `uuid` or `name`: identifies instances in requests and responses.
    instance_key: String,
    batch_size: usize,
    latency_io_reqd: f64,
    /// Counters requested by the template with their display names.
    wanted: Vec<(String, String)>,
    label_counters: Vec<LabelCounter>,
    /// Raw values of the previous data poll.
    prev: Option<Matrix>,
    missing: HashMap<String, u32>,
}

impl ZapiPerfCollector {
    pub fn new(base: CollectorBase, client: Arc<dyn ZapiClient>) -> Self {
        Self {
            base,
            client,
            query: String::new(),
            instance_key: "uuid".into(),
            batch_size: DEFAULT_BATCH_SIZE,
            latency_io_reqd: 0.0,
            wanted: Vec::new(),
            label_counters: Vec::new(),
            prev: None,
            missing: HashMap::new(),
        }
    }

    fn is_clustered(&self) -> bool {
        self.base.system.as_ref().is_none_or(|s| s.is_clustered())
    }

    fn parse_wanted(&mut self) -> Result<()> {
        let counters = self
            .base
            .template
            .child("counters")
            .ok_or_else(|| HarvestError::MissingParam("counters".into()))?;
        let object = self.base.matrix.object.clone();
        self.wanted = counters
            .flat_list(&[])
            .into_iter()
            .map(|(_, raw)| {
                let (name, display) = split_display(raw.trim_start_matches('^'));
                let display = display.unwrap_or_else(|| perf_display(&object, &name));
                (name, display)
            })
            .collect();
        if self.wanted.is_empty() {
            return Err(HarvestError::NoMetric("empty counters".into()));
        }
        Ok(())
    }

    /// Adds or refreshes one counter from its `counter-info` element.
    fn add_counter(
        &mut self,
        info: &Node,
        display: &str,
        exportable: bool,
        overrides: &HashMap<String, String>,
    ) -> Result<bool> {
        let name = info.child_content("name");
        let props = overrides
            .get(name)
            .map(String::as_str)
            .unwrap_or_else(|| info.child_content("properties"));

        if props.split(',').any(|p| p.trim() == "string") {
            if !self.label_counters.iter().any(|l| l.name == name) {
                self.label_counters.push(LabelCounter {
                    name: name.to_string(),
                    display: display.to_string(),
                });
            }
            return Ok(true);
        }
        let Some(property) = Property::from_counter_properties(props) else {
            warn!(counter = name, properties = props, "unsupported counter properties, skipping");
            return Ok(false);
        };

        let (labels, sub_labels) = if info.child_content("type") == "array" {
            array_labels(info)
        } else {
            (Vec::new(), Vec::new())
        };
        if info.child_content("type") == "array" && labels.is_empty() {
            warn!(counter = name, "array counter without labels, skipping");
            return Ok(false);
        }

        let size = labels.len() * sub_labels.len().max(1);
        let stale_shape = self
            .base
            .matrix
            .metric(name)
            .is_some_and(|m| m.labels() != labels.as_slice() || m.sub_labels() != sub_labels.as_slice());
        if stale_shape {
            self.base.matrix.remove_metric(name);
        }
        if !self.base.matrix.has_metric(name) {
            if labels.is_empty() {
                self.base.matrix.add_metric(name, display)?;
            } else {
                self.base
                    .matrix
                    .add_array_metric(name, display, labels, sub_labels)?;
            }
        }

        let base_counter = info.child_content("base-counter");
        let unit = info.child_content("unit");
        let threshold = if name.ends_with("latency") && property == Property::Average {
            self.latency_io_reqd
        } else {
            0.0
        };
        if let Some(metric) = self.base.matrix.metric_mut(name) {
            metric.name = display.to_string();
            metric.property = property;
            metric.base_counter = (!base_counter.is_empty()).then(|| base_counter.to_string());
            metric.unit = (!unit.is_empty()).then(|| unit.to_string());
            metric.exportable = exportable;
            metric.enabled = true;
            metric.threshold = threshold;
            metric.comment = Some(info.child_content("desc").to_string()).filter(|d| !d.is_empty());
        }
        trace!(counter = name, property = %property, size, "added counter");
        Ok(true)
    }

    fn fetch_instance_list(&self) -> Result<Vec<Node>> {
        let mut instances = Vec::new();
        if !self.is_clustered() {
            let mut request = Node::new("perf-object-instance-list-info");
            request.new_child("objectname", self.query.as_str());
            let mut results = self.client.invoke(&request)?;
            if let Some(list) = results.pop_child("instances") {
                instances.extend(list.children);
            }
            return Ok(instances);
        }

        let mut tag: Option<String> = None;
        loop {
            let mut request = Node::new("perf-object-instance-list-info-iter");
            request.new_child("objectname", self.query.as_str());
            request.new_child("max-records", self.batch_size.to_string());
            if let Some(t) = &tag {
                request.new_child("tag", t.as_str());
            }
            let mut results = self.client.invoke(&request)?;
            if let Some(list) = results.pop_child("attributes-list") {
                instances.extend(list.children);
            }
            match results.child_content("next-tag") {
                "" => break,
                next => tag = Some(next.to_string()),
            }
        }
        Ok(instances)
    }

    fn data_request(&self, keys: &[String], counters: &[String]) -> Node {
        let mut request = Node::new("perf-object-get-instances");
        request.new_child("objectname", self.query.as_str());
        let counter_list = request.new_child("counters", "");
        for c in counters {
            counter_list.new_child("counter", c.as_str());
        }
        let (list, item) = if self.instance_key == "name" {
            ("instances", "instance")
        } else {
            ("instance-uuids", "instance-uuid")
        };
        let instance_list = request.new_child(list, "");
        for key in keys {
            instance_list.new_child(item, key.as_str());
        }
        request
    }
}

/// Labels of an array counter: one `label-info` gives a 1-D array, two
/// give a 2-D array whose rows are the cross product.
fn array_labels(info: &Node) -> (Vec<String>, Vec<String>) {
    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .map(String::from)
            .collect()
    };
    let Some(labels) = info.child("labels") else {
        return (Vec::new(), Vec::new());
    };
    let entries = labels.all_child_content();
    match entries.as_slice() {
        [one] => (split(one), Vec::new()),
        [outer, inner, ..] => (split(outer), split(inner)),
        [] => (Vec::new(), Vec::new()),
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Values of one instance taken from a `perf-object-get-instances` response.
struct RawInstance {
    key: String,
    timestamp: f64,
    counters: Vec<(String, String)>,
}

impl Collector for ZapiPerfCollector {
    fn base(&self) -> &CollectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CollectorBase {
        &mut self.base
    }

    fn init(&mut self) -> Result<()> {
        let system = self.client.system()?;
        self.base.import_sub_template(system.model, system.version)?;
        self.base.set_system(system);

        self.query = self.base.param("query").to_string();
        if self.query.is_empty() {
            return Err(HarvestError::MissingParam("query".into()));
        }
        let object = self.base.param("object");
        self.base.matrix.object = if object.is_empty() {
            self.base.object.to_lowercase()
        } else {
            object.to_string()
        };

        self.instance_key = match self.base.param("instance_key") {
            "" | "uuid" => "uuid".into(),
            "name" => "name".into(),
            other => {
                return Err(HarvestError::InvalidParam(format!(
                    "instance_key [{}], expected uuid or name",
                    other
                )));
            }
        };
        self.batch_size = self.base.param_usize("batch_size", DEFAULT_BATCH_SIZE).max(1);
        let reqd = self.base.param("latency_io_reqd");
        if !reqd.is_empty() {
            self.latency_io_reqd = reqd.parse().map_err(|_| {
                HarvestError::InvalidParam(format!("latency_io_reqd [{}]", reqd))
            })?;
        }

        self.parse_wanted()?;
        let ts = self.base.matrix.add_metric(TIMESTAMP, TIMESTAMP)?;
        ts.exportable = false;
        ts.property = Property::Raw;

        self.base.finish_init(Some(self.client.clone()))
    }

    fn poll_counter(&mut self) -> Result<Option<Matrix>> {
        let api_start = Instant::now();
        let mut request = Node::new("perf-object-counter-list-info");
        request.new_child("objectname", self.query.as_str());
        let mut results = self.client.invoke(&request)?;
        let api_time = api_start.elapsed();

        let counters = results
            .pop_child("counters")
            .ok_or_else(|| HarvestError::Schema("counters in perf-object-counter-list-info".into()))?;
        let by_name: HashMap<&str, &Node> = counters
            .children
            .iter()
            .map(|c| (c.child_content("name"), c))
            .collect();

        let overrides: HashMap<String, String> = self
            .base
            .template
            .child("override")
            .map(|o| {
                o.children
                    .iter()
                    .map(|c| (c.name.clone(), c.content.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let mut seen: HashSet<String> = HashSet::new();
        self.label_counters.clear();
        let wanted = self.wanted.clone();
        for (name, display) in &wanted {
            let Some(mut info) = by_name.get(name.as_str()).copied() else {
                debug!(counter = %name, "counter not found on system");
                continue;
            };
            if info.child_content("is-deprecated") == "true" {
                let replacement = info.child_content("replaced-by");
                match by_name.get(replacement) {
                    Some(r) if !wanted.iter().any(|(n, _)| n == replacement) => {
                        info!(counter = %name, replaced_by = replacement, "using replacement of deprecated counter");
                        info = r;
                    }
                    _ => debug!(counter = %name, "counter is deprecated"),
                }
            }
            if self.add_counter(info, display, true, &overrides)? {
                seen.insert(info.child_content("name").to_string());
            }
        }

        // base counters required by wanted counters but not requested themselves
        let missing_bases: Vec<String> = self
            .base
            .matrix
            .metrics()
            .filter(|(k, _)| seen.contains(*k))
            .filter_map(|(_, m)| m.base_counter.clone())
            .filter(|b| !seen.contains(b))
            .collect();
        for base in missing_bases {
            if seen.contains(&base) {
                continue;
            }
            match by_name.get(base.as_str()) {
                Some(info) => {
                    let display = perf_display(&self.base.matrix.object, &base);
                    if self.add_counter(info, &display, false, &overrides)? {
                        seen.insert(base);
                    }
                }
                None => warn!(base = %base, "base counter not found on system"),
            }
        }

        let stale: Vec<String> = self
            .base
            .matrix
            .metric_keys()
            .iter()
            .filter(|k| k.as_str() != TIMESTAMP && !seen.contains(k.as_str()))
            .cloned()
            .collect();
        for key in stale {
            debug!(counter = %key, "removing counter");
            self.base.matrix.remove_metric(&key);
        }

        // dependents whose base could not be resolved are unusable
        let orphans: Vec<String> = self
            .base
            .matrix
            .metrics()
            .filter(|(_, m)| {
                m.property.requires_base()
                    && !m
                        .base_counter
                        .as_deref()
                        .is_some_and(|b| self.base.matrix.has_metric(b))
            })
            .map(|(k, _)| k.to_string())
            .collect();
        for key in orphans {
            warn!(counter = %key, "no base counter, removing");
            self.base.matrix.remove_metric(&key);
        }

        let count = self.base.matrix.metric_count() - 1;
        if count == 0 && self.label_counters.is_empty() {
            return Err(HarvestError::NoMetric(format!(
                "no counters of [{}] found",
                self.query
            )));
        }
        self.base.record("counter", "api_time", micros(api_time));
        self.base.record("counter", "count", count as f64);
        debug!(metrics = count, labels = self.label_counters.len(), "counters updated");
        Ok(None)
    }

    fn poll_instance(&mut self) -> Result<Option<Matrix>> {
        let api_start = Instant::now();
        let list = self.fetch_instance_list()?;
        let api_time = api_start.elapsed();

        let mut keys: Vec<(String, String)> = Vec::with_capacity(list.len());
        for info in &list {
            let key = info.child_content(&self.instance_key);
            if key.is_empty() {
                trace!("instance without key");
                continue;
            }
            keys.push((key.to_string(), info.child_content("name").to_string()));
        }
        if keys.is_empty() {
            return Err(HarvestError::NoInstance(format!(
                "no [{}] instances",
                self.query
            )));
        }

        let keep: HashSet<&str> = keys.iter().map(|(k, _)| k.as_str()).collect();
        let stale: Vec<String> = self
            .base
            .matrix
            .instance_keys()
            .iter()
            .filter(|k| !keep.contains(k.as_str()))
            .cloned()
            .collect();
        for key in &stale {
            self.base.matrix.remove_instance(key);
        }
        let mut added = 0;
        for (key, name) in &keys {
            if !self.base.matrix.has_instance(key) {
                let instance = self.base.matrix.add_instance(key)?;
                if !name.is_empty() {
                    instance.labels.set("instance_name", name.as_str());
                }
                added += 1;
            }
        }

        self.base.record("instance", "api_time", micros(api_time));
        self.base
            .record("instance", "count", self.base.matrix.instance_count() as f64);
        debug!(
            instances = self.base.matrix.instance_count(),
            added,
            removed = stale.len(),
            "instances updated"
        );
        Ok(None)
    }

    fn poll_data(&mut self) -> Result<Option<Matrix>> {
        if self.base.matrix.instance_count() == 0 {
            return Err(HarvestError::NoInstance(format!(
                "no [{}] instances",
                self.query
            )));
        }
        let metric_counters: Vec<String> = self
            .base
            .matrix
            .metrics()
            .filter(|(k, m)| *k != TIMESTAMP && m.enabled)
            .map(|(k, _)| k.to_string())
            .collect();
        if metric_counters.is_empty() && self.label_counters.is_empty() {
            return Err(HarvestError::NoMetric(format!("no counters of [{}]", self.query)));
        }
        let mut requested = metric_counters.clone();
        requested.extend(self.label_counters.iter().map(|l| l.name.clone()));

        let api_start = Instant::now();
        let keys = self.base.matrix.instance_keys().to_vec();
        let key_child = if self.instance_key == "name" { "name" } else { "uuid" };
        let mut raw: Vec<RawInstance> = Vec::with_capacity(keys.len());
        for batch in keys.chunks(self.batch_size) {
            let request = self.data_request(batch, &requested);
            let mut results = match self.client.invoke(&request) {
                Ok(r) => r,
                Err(HarvestError::ApiRejected { reason, errno })
                    if reason.contains("resource limit exceeded") && self.batch_size > BATCH_STEP =>
                {
                    self.batch_size -= BATCH_STEP;
                    warn!(errno = %errno, batch_size = self.batch_size, "resource limit exceeded, reducing batch size");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            let timestamp = results
                .child_content("timestamp")
                .parse::<f64>()
                .unwrap_or_else(|_| now_secs());
            let Some(instances) = results.pop_child("instances") else {
                return Err(HarvestError::Schema("instances in perf-object-get-instances".into()));
            };
            for data in instances.children {
                let key = data.child_content(key_child).to_string();
                let counters = data
                    .child("counters")
                    .map(|c| {
                        c.children
                            .iter()
                            .map(|cd| {
                                (
                                    cd.child_content("name").to_string(),
                                    cd.child_content("value").to_string(),
                                )
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                raw.push(RawInstance {
                    key,
                    timestamp,
                    counters,
                });
            }
        }
        let api_time = api_start.elapsed();

        let parse_start = Instant::now();
        let labels: HashMap<&str, &str> = self
            .label_counters
            .iter()
            .map(|l| (l.name.as_str(), l.display.as_str()))
            .collect();
        for inst in &raw {
            let Some(instance) = self.base.matrix.instance_mut(&inst.key) else {
                continue;
            };
            for (name, value) in &inst.counters {
                if let Some(display) = labels.get(name.as_str()) {
                    instance.labels.set(*display, value.as_str());
                }
            }
        }

        let mut curr = self.base.matrix.clone_without_data();
        curr.init_data()?;
        let mut seen: HashSet<&str> = HashSet::new();
        let mut count = 0usize;
        for inst in &raw {
            if !curr.has_instance(&inst.key) {
                trace!(instance = %inst.key, "unknown instance in response");
                continue;
            }
            curr.set_value(TIMESTAMP, &inst.key, inst.timestamp)?;
            for (name, value) in &inst.counters {
                let Some(metric) = curr.metric(name) else {
                    continue;
                };
                seen.insert(name.as_str());
                if metric.is_scalar() {
                    match curr.set_value_str(name, &inst.key, value) {
                        Ok(()) => count += 1,
                        Err(e) => trace!(error = %e, "skipping value"),
                    }
                    continue;
                }
                let values: std::result::Result<Vec<f64>, _> =
                    value.split(',').map(|v| v.trim().parse::<f64>()).collect();
                match values {
                    Ok(v) if v.len() == metric.size() => {
                        curr.set_array_values(name, &inst.key, &v)?;
                        count += v.len();
                    }
                    _ => debug!(
                        counter = %name,
                        instance = %inst.key,
                        expected = metric.size(),
                        "array value does not match labels"
                    ),
                }
            }
        }
        let parse_time = parse_start.elapsed();

        for name in &metric_counters {
            if seen.contains(name.as_str()) {
                self.missing.remove(name);
                continue;
            }
            let misses = self.missing.entry(name.clone()).or_insert(0);
            *misses += 1;
            if *misses >= MISSING_LIMIT {
                warn!(counter = %name, polls = *misses, "counter absent from responses, disabling");
                if let Some(m) = self.base.matrix.metric_mut(name) {
                    m.enabled = false;
                }
                self.missing.remove(name);
            } else {
                debug!(counter = %name, "counter absent from response");
            }
        }

        self.base.record("data", "api_time", micros(api_time));
        self.base.record("data", "parse_time", micros(parse_time));
        self.base.record("data", "count", count as f64);

        let Some(prev) = self.prev.replace(curr.clone()) else {
            debug!("first poll, caching raw values");
            return Ok(None);
        };
        let calc_start = Instant::now();
        cook(&mut curr, &prev)?;
        self.base.record("data", "calc_time", micros(calc_start.elapsed()));
        Ok(Some(curr))
    }
}
