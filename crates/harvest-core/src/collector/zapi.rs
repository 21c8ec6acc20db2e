//! Configuration collector over ZAPI `*-get-iter` queries.
//!
//! The `counters` tree of the template mirrors the attribute tree of the
//! response. Every leaf is a metric (numeric) or, with `^`, an instance
//! label; `^^` leaves form the instance key. All paths share a common
//! prefix that names the per-instance element in `attributes-list`:
//!
//! ```text
//!   counters:                            <attributes-list>
//!     volume-attributes:                   <volume-attributes>        <- instance
//!       - volume-id-attributes:              <volume-id-attributes>
//!         - ^^name => volume                   <name>vol1</name>
//!       - volume-space-attributes:           <volume-space-attributes>
//!         - size                               <size>1024</size>
//! ```

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use super::{Collector, CollectorBase, StagedInstance, reconcile};
use crate::api::ZapiClient;
use crate::errors::{HarvestError, Result};
use crate::matrix::Matrix;
use crate::template::{CounterRole, parse_counter, zapi_display};
use crate::tree::Node;
use crate::util::micros;

const DEFAULT_BATCH_SIZE: usize = 500;

/// A template leaf resolved to its path below the instance element.
#[derive(Debug, Clone, PartialEq)]
struct Attribute {
    /// Full path, joined with `.`; the metric key.
    key: String,
    display: String,
    relative: Vec<String>,
}

pub struct ZapiCollector {
    base: CollectorBase,
    client: Arc<dyn ZapiClient>,
    query: String,
    instance_path: Vec<String>,
    keys: Vec<Attribute>,
    labels: Vec<Attribute>,
    metrics: Vec<Attribute>,
    desired_attributes: Option<Node>,
    batch_size: usize,
}

impl ZapiCollector {
    pub fn new(base: CollectorBase, client: Arc<dyn ZapiClient>) -> Self {
        Self {
            base,
            client,
            query: String::new(),
            instance_path: Vec::new(),
            keys: Vec::new(),
            labels: Vec::new(),
            metrics: Vec::new(),
            desired_attributes: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    fn parse_counters(&mut self) -> Result<()> {
        let counters = self
            .base
            .template
            .child("counters")
            .ok_or_else(|| HarvestError::MissingParam("counters".into()))?;

        let object = self.base.matrix.object.clone();
        let mut leaves: Vec<(Vec<String>, CounterRole, String)> = Vec::new();
        for (parents, raw) in counters.flat_list(&[]) {
            let parsed = parse_counter(&raw);
            let mut path = parents;
            path.push(parsed.name.clone());
            let display = parsed
                .display
                .clone()
                .unwrap_or_else(|| zapi_display(&object, &path));
            leaves.push((path, parsed.role, display));
        }
        if leaves.is_empty() {
            return Err(HarvestError::NoMetric("empty counters".into()));
        }

        self.instance_path = common_parent(leaves.iter().map(|(p, _, _)| p.as_slice()));
        let depth = self.instance_path.len();

        let mut desired = Node::new("desired-attributes");
        for (path, role, display) in leaves {
            insert_path(&mut desired, &path);
            let attr = Attribute {
                key: path.join("."),
                display,
                relative: path[depth..].to_vec(),
            };
            match role {
                CounterRole::Key => {
                    self.base.matrix.labels.set(&attr.key, &attr.display);
                    self.keys.push(attr);
                }
                CounterRole::Label => {
                    self.base.matrix.labels.set(&attr.key, &attr.display);
                    self.labels.push(attr);
                }
                CounterRole::Metric => {
                    self.base.matrix.add_metric(&attr.key, &attr.display)?;
                    self.metrics.push(attr);
                }
            }
        }
        self.desired_attributes = Some(desired);

        debug!(
            keys = self.keys.len(),
            labels = self.labels.len(),
            metrics = self.metrics.len(),
            instance_path = %self.instance_path.join("/"),
            "parsed counters"
        );
        Ok(())
    }

    fn request(&self, tag: Option<&str>) -> Node {
        let mut request = Node::new(self.query.as_str());
        let clustered = self.base.system.as_ref().is_some_and(|s| s.is_clustered());
        if clustered {
            if let Some(desired) = &self.desired_attributes
                && self.base.param("no_desired_attributes") != "true"
            {
                request.add_child(desired.clone());
            }
            if self.base.param("no_max_records") != "true" {
                request.new_child("max-records", self.batch_size.to_string());
            }
        }
        if let Some(tag) = tag {
            request.new_child("tag", tag);
        }
        request
    }

    /// Issues the query, following `next-tag`, and returns the instance elements.
    fn fetch(&self) -> Result<Vec<Node>> {
        let mut elements = Vec::new();
        let mut tag: Option<String> = None;
        loop {
            let mut results = self.client.invoke(&self.request(tag.as_deref()))?;
            let next = results.child_content("next-tag").to_string();
            let container = match results.pop_child("attributes-list") {
                Some(list) => list,
                None => results,
            };
            let found = container.search_children(&self.instance_path);
            trace!(page = found.len(), "fetched instances");
            elements.extend(found.into_iter().cloned());
            if next.is_empty() {
                break;
            }
            tag = Some(next);
        }
        Ok(elements)
    }

    fn stage(&self, element: &Node) -> Option<StagedInstance> {
        let mut staged = StagedInstance::default();
        if self.keys.is_empty() {
            // single-instance objects are keyed by the cluster name
            staged.key = self.base.matrix.global_labels.value("cluster").to_string();
        } else {
            let mut parts = Vec::with_capacity(self.keys.len());
            for key in &self.keys {
                let value = element.content_at(&key.relative)?;
                parts.push(value.to_string());
                staged.labels.push((key.display.clone(), value.to_string()));
            }
            staged.key = parts.join(".");
        }
        if staged.key.is_empty() {
            return None;
        }

        for label in &self.labels {
            let mut values: Vec<&str> = element
                .search_children(&label.relative)
                .into_iter()
                .map(|n| n.content.as_str())
                .filter(|v| !v.is_empty())
                .collect();
            if values.is_empty() {
                continue;
            }
            values.sort_unstable();
            staged.labels.push((label.display.clone(), values.join(",")));
        }

        for metric in &self.metrics {
            let Some(raw) = element.content_at(&metric.relative) else {
                continue;
            };
            match raw.trim().parse::<f64>() {
                Ok(v) => staged.values.push((metric.key.clone(), v)),
                Err(_) => trace!(metric = %metric.key, value = raw, "skipping non-numeric value"),
            }
        }
        Some(staged)
    }
}

/// Longest common prefix of the parent paths of all leaves.
fn common_parent<'a>(paths: impl Iterator<Item = &'a [String]>) -> Vec<String> {
    let mut prefix: Option<Vec<String>> = None;
    for path in paths {
        let parent = &path[..path.len().saturating_sub(1)];
        prefix = Some(match prefix {
            None => parent.to_vec(),
            Some(p) => p
                .iter()
                .zip(parent)
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| a.clone())
                .collect(),
        });
    }
    prefix.unwrap_or_default()
}

fn insert_path(root: &mut Node, path: &[String]) {
    let mut node = root;
    for name in path {
        if !node.has_child(name) {
            node.new_child(name.as_str(), "");
        }
        let Some(next) = node.child_mut(name) else {
            return;
        };
        node = next;
    }
}

impl Collector for ZapiCollector {
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
        self.batch_size = self.base.param_usize("batch_size", DEFAULT_BATCH_SIZE);

        self.parse_counters()?;
        self.base.finish_init(Some(self.client.clone()))
    }

    fn poll_instance(&mut self) -> Result<Option<Matrix>> {
        // instances are refreshed with every data poll
        Ok(None)
    }

    fn poll_data(&mut self) -> Result<Option<Matrix>> {
        let api_start = Instant::now();
        let elements = self.fetch()?;
        let api_time = api_start.elapsed();

        let parse_start = Instant::now();
        let mut staged: Vec<StagedInstance> = Vec::with_capacity(elements.len());
        for element in &elements {
            match self.stage(element) {
                Some(s) if staged.iter().any(|o| o.key == s.key) => {
                    debug!(key = %s.key, "duplicate instance key, skipping");
                }
                Some(s) => staged.push(s),
                None => trace!("element without instance key"),
            }
        }
        if staged.is_empty() {
            return Err(HarvestError::NoInstance(format!(
                "no [{}] instances on cluster",
                self.base.matrix.object
            )));
        }

        let count = reconcile(&mut self.base.matrix, staged)?;
        let parse_time = parse_start.elapsed();

        self.base.record("data", "api_time", micros(api_time));
        self.base.record("data", "parse_time", micros(parse_time));
        self.base.record("data", "count", count as f64);
        debug!(
            instances = self.base.matrix.instance_count(),
            values = count,
            api_ms = api_time.as_millis() as u64,
            "collected"
        );
        Ok(Some(self.base.matrix.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockZapi;
    use crate::collector::testutil;
    use crate::errors::ErrorKind;

    const TEMPLATE: &str = r#"
name: Volume
query: volume-get-iter
object: volume
counters:
  volume-attributes:
    - volume-id-attributes:
      - ^^name => volume
      - ^^owning-vserver-name => svm
      - ^containing-aggregate-name => aggr
    - volume-space-attributes:
      - size
      - size-used
schedule:
  - data: 3m
export_options:
  instance_keys: [volume, svm]
  instance_labels: [aggr]
"#;

    const VERSION: &str = r#"<results status="passed">
        <version>NetApp Release 9.8P1</version><is-clustered>true</is-clustered>
        <version-tuple><system-version-tuple><generation>9</generation><major>8</major><minor>0</minor></system-version-tuple></version-tuple>
    </results>"#;

    const IDENTITY: &str = r#"<results status="passed"><attributes><cluster-identity-info>
        <cluster-name>c1</cluster-name><cluster-serial-number>1-80-000</cluster-serial-number>
    </cluster-identity-info></attributes></results>"#;

    fn volume(name: &str, svm: &str, size: &str) -> String {
        format!(
            "<volume-attributes><volume-id-attributes><name>{name}</name>\
             <owning-vserver-name>{svm}</owning-vserver-name>\
             <containing-aggregate-name>aggr1</containing-aggregate-name></volume-id-attributes>\
             <volume-space-attributes><size>{size}</size><size-used>10</size-used></volume-space-attributes>\
             </volume-attributes>"
        )
    }

    fn collector(client: Arc<MockZapi>) -> ZapiCollector {
        client.set_xml("system-get-version", VERSION);
        client.set_xml("cluster-identity-get", IDENTITY);
        let base = testutil::base("Zapi", "Volume", TEMPLATE);
        let mut c = ZapiCollector::new(base, client);
        c.init().unwrap();
        c
    }

    #[test]
    fn init_parses_counter_paths() {
        let c = collector(Arc::new(MockZapi::new()));
        assert_eq!(c.instance_path, vec!["volume-attributes"]);
        assert_eq!(c.keys.len(), 2);
        assert_eq!(
            c.keys[0].relative,
            vec!["volume-id-attributes".to_string(), "name".to_string()]
        );
        let size = c
            .base
            .matrix
            .metric("volume-attributes.volume-space-attributes.size")
            .unwrap();
        assert_eq!(size.name, "space_size");
        assert_eq!(
            c.base
                .matrix
                .metric("volume-attributes.volume-space-attributes.size-used")
                .unwrap()
                .name,
            "space_size_used"
        );
        assert_eq!(c.base.matrix.global_labels.value("cluster"), "c1");
    }

    #[test]
    fn poll_follows_next_tag() {
        let client = Arc::new(MockZapi::new());
        let mut c = collector(client.clone());
        client.push_xml(
            "volume-get-iter",
            &format!(
                r#"<results status="passed"><attributes-list>{}</attributes-list><next-tag>t1</next-tag></results>"#,
                volume("v1", "svm1", "100")
            ),
        );
        client.push_xml(
            "volume-get-iter",
            &format!(
                r#"<results status="passed"><attributes-list>{}</attributes-list></results>"#,
                volume("v2", "svm1", "200")
            ),
        );

        let data = c.poll_data().unwrap().unwrap();
        assert_eq!(data.instance_count(), 2);
        let key = "volume-attributes.volume-space-attributes.size";
        assert_eq!(data.get_value(key, "v2.svm1"), Some(200.0));
        let v1 = data.instance("v1.svm1").unwrap();
        assert_eq!(v1.label("volume"), "v1");
        assert_eq!(v1.label("aggr"), "aggr1");

        let requests = client.requests_for("volume-get-iter");
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].child_content("max-records"), "500");
        assert!(requests[0].has_child("desired-attributes"));
        assert_eq!(requests[1].child_content("tag"), "t1");
        assert_eq!(c.base.metadata.get_value("count", "data"), Some(4.0));
    }

    #[test]
    fn stale_instances_are_dropped() {
        let client = Arc::new(MockZapi::new());
        let mut c = collector(client.clone());
        client.push_xml(
            "volume-get-iter",
            &format!(
                r#"<results status="passed"><attributes-list>{}{}</attributes-list></results>"#,
                volume("v1", "s", "1"),
                volume("v2", "s", "2")
            ),
        );
        client.push_xml(
            "volume-get-iter",
            &format!(
                r#"<results status="passed"><attributes-list>{}</attributes-list></results>"#,
                volume("v2", "s", "3")
            ),
        );
        c.poll_data().unwrap();
        let data = c.poll_data().unwrap().unwrap();
        assert_eq!(data.instance_keys(), ["v2.s"]);
        assert_eq!(
            data.get_value("volume-attributes.volume-space-attributes.size", "v2.s"),
            Some(3.0)
        );
    }

    #[test]
    fn empty_result_is_no_instance() {
        let client = Arc::new(MockZapi::new());
        let mut c = collector(client.clone());
        client.push_xml(
            "volume-get-iter",
            r#"<results status="passed"><num-records>0</num-records></results>"#,
        );
        assert_eq!(c.poll_data().unwrap_err().kind(), ErrorKind::NoInstance);
    }

    #[test]
    fn missing_query_is_configuration_error() {
        let client = Arc::new(MockZapi::new());
        client.set_xml("system-get-version", VERSION);
        client.set_xml("cluster-identity-get", IDENTITY);
        let base = testutil::base(
            "Zapi",
            "Volume",
            "object: volume\ncounters:\n  - size\nschedule:\n  - data: 1m\n",
        );
        let mut c = ZapiCollector::new(base, client);
        assert_eq!(c.init().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn common_parent_of_paths() {
        let p = |s: &str| s.split('/').map(String::from).collect::<Vec<_>>();
        let paths = [p("a/b/c"), p("a/b/d/e"), p("a/x")];
        assert_eq!(
            common_parent(paths.iter().map(Vec::as_slice)),
            vec!["a".to_string()]
        );
    }
}
