//! Shelf environment: fans, PSUs, temperature sensors, ... as child objects.
//!
//! ```yaml
//! Shelf:
//!   objects:
//!     - shelf-fans => fan:
//!         shelf-fan-info:
//!           - ^^fan-id
//!           - ^fan-location
//!           - fan-rpm-speed
//! ```
//!
//! Every run issues one shelf query and returns one matrix per configured
//! object, keyed by `shelf_id.KEY`.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{Plugin, PluginContext, derived_matrix};
use crate::api::ZapiClient;
use crate::errors::{HarvestError, Result};
use crate::matrix::{ExportOptions, Matrix};
use crate::template::{CounterRole, parse_counter};
use crate::tree::Node;

const CDOT_QUERY: &str = "storage-shelf-info-get-iter";
const SEVEN_MODE_QUERY: &str = "storage-shelf-environment-list-info";

#[derive(Debug, Clone)]
struct ObjectSpec {
    /// Child element of a shelf holding the instances, e.g. `shelf-fans`.
    attribute: String,
    object: String,
    key: Option<(String, String)>,
    labels: Vec<(String, String)>,
    metrics: Vec<(String, String)>,
}

impl ObjectSpec {
    fn parse(node: &Node) -> ObjectSpec {
        let (attribute, object) = match node.name.split_once("=>") {
            Some((a, o)) => (a.trim().to_string(), o.trim().to_string()),
            None => (node.name.clone(), node.name.replace('-', "_")),
        };
        let mut spec = ObjectSpec {
            attribute,
            object,
            key: None,
            labels: Vec::new(),
            metrics: Vec::new(),
        };
        for (_, raw) in node.flat_list(&[]) {
            let parsed = parse_counter(&raw);
            let field = (parsed.name.clone(), parsed.display_or_default());
            match parsed.role {
                CounterRole::Key => spec.key = Some(field),
                CounterRole::Label => spec.labels.push(field),
                CounterRole::Metric => spec.metrics.push(field),
            }
        }
        spec
    }

    fn schema(&self, parent: &Matrix) -> Result<Matrix> {
        let mut m = derived_matrix(parent, &self.object, "Shelf");
        let mut keys = vec!["shelf".to_string(), "shelf_id".to_string()];
        if let Some((_, display)) = &self.key {
            keys.push(display.clone());
        }
        m.export_options = ExportOptions {
            instance_keys: keys,
            instance_labels: self.labels.iter().map(|(_, d)| d.clone()).collect(),
            include_all_labels: false,
        };
        for (field, display) in &self.metrics {
            m.add_metric(field, display)?;
        }
        Ok(m)
    }
}

struct Staged {
    key: String,
    labels: Vec<(String, String)>,
    values: Vec<(String, f64)>,
}

pub struct Shelf {
    client: Arc<dyn ZapiClient>,
    objects: Vec<ObjectSpec>,
    clustered: Option<bool>,
}

impl Shelf {
    pub fn new(config: &Node, ctx: &PluginContext) -> Result<Self> {
        let client = ctx.require_client("Shelf")?;
        let objects: Vec<ObjectSpec> = config
            .child("objects")
            .ok_or_else(|| HarvestError::MissingParam("Shelf: objects".into()))?
            .children
            .iter()
            .map(ObjectSpec::parse)
            .collect();
        debug!(objects = objects.len(), "shelf objects");
        Ok(Self {
            client,
            objects,
            clustered: None,
        })
    }

    fn is_clustered(&mut self) -> Result<bool> {
        if let Some(c) = self.clustered {
            return Ok(c);
        }
        let clustered = self.client.system()?.is_clustered();
        self.clustered = Some(clustered);
        Ok(clustered)
    }

    fn fetch_shelves(&self, clustered: bool) -> Result<Vec<Node>> {
        let query = if clustered { CDOT_QUERY } else { SEVEN_MODE_QUERY };
        let mut results = self.client.invoke(&Node::new(query))?;
        if let Some(list) = results.pop_child("attributes-list") {
            return Ok(list.children);
        }
        let path: Vec<String> = ["shelf-environ-channel-info", "shelf-environ-shelf-list", "shelf-environ-shelf-info"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Ok(results.search_children(&path).into_iter().cloned().collect())
    }

    fn stage(spec: &ObjectSpec, shelf: &Node, shelf_name: &str, shelf_id: &str) -> Vec<Staged> {
        let Some((key_field, key_display)) = &spec.key else {
            return Vec::new();
        };
        let Some(elem) = shelf.child(&spec.attribute) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for item in &elem.children {
            let key = item.child_content(key_field);
            if key.is_empty() {
                continue;
            }
            let mut labels = vec![
                ("shelf".to_string(), shelf_name.to_string()),
                ("shelf_id".to_string(), shelf_id.to_string()),
                (key_display.clone(), key.to_string()),
            ];
            for (field, display) in &spec.labels {
                let v = item.child_content(field);
                if !v.is_empty() {
                    labels.push((display.clone(), v.to_string()));
                }
            }
            let values = spec
                .metrics
                .iter()
                .filter_map(|(field, _)| {
                    // values may carry a unit: "3000 rpm"
                    let raw = item.child_content(field).split(' ').next()?;
                    raw.parse::<f64>().ok().map(|v| (field.clone(), v))
                })
                .collect();
            out.push(Staged {
                key: format!("{}.{}", shelf_id, key),
                labels,
                values,
            });
        }
        out
    }
}

impl Plugin for Shelf {
    fn name(&self) -> &str {
        "Shelf"
    }

    fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>> {
        let clustered = self.is_clustered()?;
        if !clustered {
            for instance in data.instances_mut() {
                let id = instance.label("shelf_id").to_string();
                instance.labels.set("shelf", id);
            }
        }
        let shelves = self.fetch_shelves(clustered)?;
        if shelves.is_empty() {
            return Err(HarvestError::NoInstance("no shelf instances".into()));
        }

        let mut out = Vec::new();
        for spec in &self.objects {
            if spec.key.is_none() {
                warn!(object = %spec.attribute, "no instance key defined, skipped");
                continue;
            }
            let mut staged = Vec::new();
            for shelf in &shelves {
                let (name, id) = if clustered {
                    (shelf.child_content("shelf"), shelf.child_content("shelf-uid"))
                } else {
                    (shelf.child_content("shelf-id"), shelf.child_content("shelf-id"))
                };
                staged.extend(Self::stage(spec, shelf, name, id));
            }
            let mut m = spec.schema(data)?;
            for s in &staged {
                if m.has_instance(&s.key) {
                    continue;
                }
                let instance = m.add_instance(&s.key)?;
                for (k, v) in &s.labels {
                    instance.labels.set(k, v);
                }
            }
            if m.instance_count() == 0 || m.metric_count() == 0 {
                debug!(object = %spec.object, "nothing to export");
                continue;
            }
            m.init_data()?;
            for s in &staged {
                for (field, v) in &s.values {
                    m.set_value(field, &s.key, *v)?;
                }
            }
            out.push(m);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockZapi;
    use crate::tree::yaml;

    const CONFIG: &str = r#"
objects:
  - shelf-fans => fan:
      shelf-fan-info:
        - ^^fan-id
        - ^fan-location
        - fan-rpm-speed => rpm
  - shelf-psus => psu:
      shelf-psu-info:
        - ^^psu-id
        - psu-power-drawn
"#;

    fn client() -> Arc<MockZapi> {
        let client = Arc::new(MockZapi::new());
        client.set_cluster("c1");
        client.set_xml(
            CDOT_QUERY,
            r#"<results status="passed"><attributes-list>
                <storage-shelf-info>
                  <shelf>1.0</shelf><shelf-uid>abc</shelf-uid>
                  <shelf-fans>
                    <storage-shelf-fan-info><fan-id>1</fan-id><fan-location>rear</fan-location><fan-rpm-speed>3000 rpm</fan-rpm-speed></storage-shelf-fan-info>
                    <storage-shelf-fan-info><fan-id>2</fan-id><fan-rpm-speed>3100</fan-rpm-speed></storage-shelf-fan-info>
                  </shelf-fans>
                  <shelf-psus>
                    <storage-shelf-psu-info><psu-id>1</psu-id><psu-power-drawn>120</psu-power-drawn></storage-shelf-psu-info>
                  </shelf-psus>
                </storage-shelf-info>
              </attributes-list></results>"#,
        );
        client
    }

    #[test]
    fn child_objects_per_shelf() {
        let client = client();
        let ctx = PluginContext {
            collector: "Zapi".into(),
            object: "Shelf".into(),
            parent: Node::new("template"),
            client: Some(client),
        };
        let mut p = Shelf::new(&yaml::parse(CONFIG, "Shelf").unwrap(), &ctx).unwrap();
        let mut data = Matrix::new("Zapi", "shelf", "");
        data.set_global_label("cluster", "c1");

        let out = p.run(&mut data).unwrap();
        assert_eq!(out.len(), 2);
        let fans = &out[0];
        assert_eq!(fans.object, "fan");
        assert_eq!(fans.global_labels.value("cluster"), "c1");
        assert_eq!(fans.get_value("fan-rpm-speed", "abc.1"), Some(3000.0));
        assert_eq!(fans.metric("fan-rpm-speed").unwrap().name, "rpm");
        let fan1 = fans.instance("abc.1").unwrap();
        assert_eq!(fan1.label("shelf"), "1.0");
        assert_eq!(fan1.label("fan_location"), "rear");
        assert_eq!(out[1].get_value("psu-power-drawn", "abc.1"), Some(120.0));
    }

    #[test]
    fn missing_objects_is_config_error() {
        let ctx = PluginContext {
            collector: "Zapi".into(),
            object: "Shelf".into(),
            parent: Node::new("template"),
            client: Some(client()),
        };
        assert!(Shelf::new(&Node::new("Shelf"), &ctx).is_err());
    }
}
