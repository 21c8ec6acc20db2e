//! Configuration collector over the REST API.
//!
//! Counters are dotted JSON paths into each record (`space.size`,
//! `svm.name`) with the same `^`/`^^` annotations as the ZAPI templates.
//! Optional `filter` entries are passed through as query parameters.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, trace};

use super::{Collector, CollectorBase, StagedInstance, reconcile};
use crate::api::{RestClient, rest_href};
use crate::errors::{HarvestError, Result};
use crate::matrix::Matrix;
use crate::template::{CounterRole, parse_counter};
use crate::util::micros;

const DEFAULT_MAX_RECORDS: usize = 500;

#[derive(Debug, Clone, PartialEq)]
struct Field {
    path: String,
    pointer: String,
    display: String,
}

impl Field {
    fn new(path: &str, display: String) -> Self {
        Self {
            path: path.to_string(),
            pointer: format!("/{}", path.replace('.', "/")),
            display,
        }
    }
}

pub struct RestCollector {
    base: CollectorBase,
    client: Arc<dyn RestClient>,
    href: String,
    keys: Vec<Field>,
    labels: Vec<Field>,
    metrics: Vec<Field>,
}

/// String form of a scalar or an array of scalars; `None` for objects and null.
fn as_label(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(as_label).collect();
            (!parts.is_empty()).then(|| parts.join(","))
        }
        Value::Null | Value::Object(_) => None,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl RestCollector {
    pub fn new(base: CollectorBase, client: Arc<dyn RestClient>) -> Self {
        Self {
            base,
            client,
            href: String::new(),
            keys: Vec::new(),
            labels: Vec::new(),
            metrics: Vec::new(),
        }
    }

    fn parse_counters(&mut self) -> Result<()> {
        let counters = self
            .base
            .template
            .child("counters")
            .ok_or_else(|| HarvestError::MissingParam("counters".into()))?;
        let leaves: Vec<String> = counters
            .flat_list(&[])
            .into_iter()
            .map(|(_, raw)| raw)
            .collect();
        for raw in leaves {
            let parsed = parse_counter(&raw);
            let field = Field::new(&parsed.name, parsed.display_or_default());
            match parsed.role {
                CounterRole::Key => {
                    self.base.matrix.labels.set(&field.path, &field.display);
                    self.keys.push(field);
                }
                CounterRole::Label => {
                    self.base.matrix.labels.set(&field.path, &field.display);
                    self.labels.push(field);
                }
                CounterRole::Metric => {
                    self.base.matrix.add_metric(&field.path, &field.display)?;
                    self.metrics.push(field);
                }
            }
        }
        if self.keys.is_empty() && self.labels.is_empty() && self.metrics.is_empty() {
            return Err(HarvestError::NoMetric("empty counters".into()));
        }
        Ok(())
    }

    fn build_href(&self, query: &str) -> String {
        let fields: Vec<String> = self
            .keys
            .iter()
            .chain(&self.labels)
            .chain(&self.metrics)
            .map(|f| f.path.clone())
            .collect();
        let max_records = self.base.param_usize("max_records", DEFAULT_MAX_RECORDS);
        let mut href = rest_href(query, &fields, Some(max_records));
        if let Some(filter) = self.base.template.child("filter") {
            for f in filter.all_child_content() {
                href.push('&');
                href.push_str(f);
            }
        }
        href
    }

    fn stage(&self, record: &Value) -> Option<StagedInstance> {
        let mut staged = StagedInstance::default();
        let mut parts = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            let value = record.pointer(&key.pointer).and_then(as_label)?;
            staged.labels.push((key.display.clone(), value.clone()));
            parts.push(value);
        }
        staged.key = if parts.is_empty() {
            self.base.matrix.global_labels.value("cluster").to_string()
        } else {
            parts.join(".")
        };
        if staged.key.is_empty() {
            return None;
        }
        for label in &self.labels {
            if let Some(value) = record.pointer(&label.pointer).and_then(as_label) {
                staged.labels.push((label.display.clone(), value));
            }
        }
        for metric in &self.metrics {
            match record.pointer(&metric.pointer).map(|v| (v, as_number(v))) {
                Some((_, Some(n))) => staged.values.push((metric.path.clone(), n)),
                Some((v, None)) => trace!(field = %metric.path, value = %v, "not numeric"),
                None => {}
            }
        }
        Some(staged)
    }
}

impl Collector for RestCollector {
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

        let query = self.base.param("query").to_string();
        if query.is_empty() {
            return Err(HarvestError::MissingParam("query".into()));
        }
        let object = self.base.param("object");
        self.base.matrix.object = if object.is_empty() {
            self.base.object.to_lowercase()
        } else {
            object.to_string()
        };
        self.parse_counters()?;
        self.href = self.build_href(&query);
        debug!(href = %self.href, "built query");
        self.base.finish_init(None)
    }

    fn poll_instance(&mut self) -> Result<Option<Matrix>> {
        Ok(None)
    }

    fn poll_data(&mut self) -> Result<Option<Matrix>> {
        let api_start = Instant::now();
        let records = self.client.fetch_all(&self.href)?;
        let api_time = api_start.elapsed();

        let parse_start = Instant::now();
        let mut staged: Vec<StagedInstance> = Vec::with_capacity(records.len());
        for record in &records {
            if let Some(s) = self.stage(record)
                && !staged.iter().any(|o| o.key == s.key)
            {
                staged.push(s);
            }
        }
        if staged.is_empty() {
            return Err(HarvestError::NoInstance(format!(
                "no [{}] records",
                self.base.matrix.object
            )));
        }
        let count = reconcile(&mut self.base.matrix, staged)?;

        self.base.record("data", "api_time", micros(api_time));
        self.base.record("data", "parse_time", micros(parse_start.elapsed()));
        self.base.record("data", "count", count as f64);
        debug!(records = records.len(), values = count, "collected");
        Ok(Some(self.base.matrix.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockRest;
    use crate::collector::testutil;
    use crate::errors::ErrorKind;
    use serde_json::json;

    const TEMPLATE: &str = r#"
name: Volume
query: api/storage/volumes
object: volume
counters:
  - ^^name => volume
  - ^^svm.name => svm
  - ^state
  - space.size => size
  - space.used
  - is_svm_root
filter:
  - is_constituent=false
schedule:
  - data: 3m
"#;

    fn collector(client: Arc<MockRest>) -> RestCollector {
        client.set(
            "api/cluster",
            json!({"name": "c1", "uuid": "x", "version": {"full": "9.10.1", "generation": 9, "major": 10, "minor": 1}}),
        );
        let base = testutil::base("Rest", "Volume", TEMPLATE);
        let mut c = RestCollector::new(base, client);
        c.init().unwrap();
        c
    }

    #[test]
    fn href_lists_fields_and_filter() {
        let c = collector(Arc::new(MockRest::new()));
        assert_eq!(
            c.href,
            "api/storage/volumes?fields=name,svm.name,state,space.size,space.used,is_svm_root\
             &max_records=500&return_records=true&is_constituent=false"
        );
    }

    #[test]
    fn records_become_instances() {
        let client = Arc::new(MockRest::new());
        let mut c = collector(client.clone());
        client.push(
            "api/storage/volumes",
            json!({
                "records": [
                    {"name": "v1", "svm": {"name": "s1"}, "state": "online",
                     "space": {"size": 1024, "used": 512}, "is_svm_root": false}
                ],
                "_links": {"next": {"href": "/api/storage/volumes?start=1"}}
            }),
        );
        client.push(
            "api/storage/volumes",
            json!({"records": [{"name": "v2", "svm": {"name": "s1"}, "space": {"size": "2048"}}]}),
        );

        let data = c.poll_data().unwrap().unwrap();
        assert_eq!(data.instance_count(), 2);
        assert_eq!(data.get_value("space.size", "v1.s1"), Some(1024.0));
        assert_eq!(data.get_value("space.size", "v2.s1"), Some(2048.0));
        assert_eq!(data.get_value("is_svm_root", "v1.s1"), Some(0.0));
        assert_eq!(data.metric("space.used").unwrap().name, "space_used");
        let v1 = data.instance("v1.s1").unwrap();
        assert_eq!(v1.label("svm"), "s1");
        assert_eq!(v1.label("state"), "online");
        assert_eq!(data.global_labels.value("cluster"), "c1");
    }

    #[test]
    fn empty_records_is_no_instance() {
        let client = Arc::new(MockRest::new());
        let mut c = collector(client.clone());
        client.push("api/storage/volumes", json!({"records": []}));
        assert_eq!(c.poll_data().unwrap_err().kind(), ErrorKind::NoInstance);
    }

    #[test]
    fn label_values_from_arrays() {
        assert_eq!(as_label(&json!(["a", "b"])).as_deref(), Some("a,b"));
        assert_eq!(as_label(&json!({"x": 1})), None);
        assert_eq!(as_number(&json!("12.5")), Some(12.5));
        assert_eq!(as_number(&json!(true)), Some(1.0));
    }
}
