//! Fills in SnapMirror node labels that ZAPI leaves empty.
//!
//! Relationships carry `source_vserver`/`source_volume` (and the
//! destination pair) but often no node. A `svm.volume → node` cache built
//! from the volume perf object fills `source_node` / `destination_node`;
//! a per-node cache of SnapMirror meters fills the `*_node_limit` labels.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{Plugin, PluginContext};
use crate::api::{ZapiClient, zapi_request};
use crate::errors::Result;
use crate::matrix::Matrix;
use crate::tree::Node;

/// Runs between refreshes of the node cache.
const NODE_CACHE_RUNS: u32 = 10;
/// Runs between refreshes of the limit cache.
const LIMIT_CACHE_RUNS: u32 = 100;
const DEFAULT_BATCH: &str = "500";

pub struct SnapMirror {
    client: Arc<dyn ZapiClient>,
    batch_size: String,
    runs: u32,
    nodes: HashMap<String, String>,
    dest_limits: HashMap<String, String>,
    src_limits: HashMap<String, String>,
}

/// `counter-data` name → value of one `instance-data` element.
fn perf_counters(instance: &Node) -> HashMap<&str, &str> {
    instance
        .child("counters")
        .map(|c| {
            c.children
                .iter()
                .map(|d| (d.child_content("name"), d.child_content("value")))
                .collect()
        })
        .unwrap_or_default()
}

fn perf_request(object: &str, counters: &[&str], batch: Option<&str>) -> Node {
    let mut request = zapi_request("perf-object-get-instances", &[("objectname", object)]);
    if let Some(batch) = batch {
        request.new_child("max-records", batch);
    }
    request.new_child("instances", "").new_child("instance", "*");
    let list = request.new_child("counters", "");
    for c in counters {
        list.new_child("counter", *c);
    }
    request
}

impl SnapMirror {
    pub fn new(_config: &Node, ctx: &PluginContext) -> Result<Self> {
        let client = ctx.require_client("SnapMirror")?;
        let batch = ctx.parent.child_content("batch_size");
        Ok(Self {
            client,
            batch_size: if batch.is_empty() { DEFAULT_BATCH.into() } else { batch.to_string() },
            runs: 0,
            nodes: HashMap::new(),
            dest_limits: HashMap::new(),
            src_limits: HashMap::new(),
        })
    }

    fn update_node_cache(&mut self) -> Result<()> {
        let mut request = perf_request("volume", &["node_name", "vserver_name"], Some(&self.batch_size));
        let mut tag = String::new();
        let mut count = 0;
        loop {
            if !tag.is_empty() {
                request.set_child_content("tag", tag.as_str());
            }
            let results = self.client.invoke(&request)?;
            if let Some(instances) = results.child("instances") {
                for instance in &instances.children {
                    let counters = perf_counters(instance);
                    let volume = instance.child_content("name");
                    let svm = counters.get("vserver_name").copied().unwrap_or("");
                    let node = counters.get("node_name").copied().unwrap_or("");
                    self.nodes.insert(format!("{}.{}", svm, volume), node.to_string());
                    count += 1;
                }
            }
            let next = results.child_content("next-tag");
            if next.is_empty() {
                break;
            }
            if next == tag {
                warn!("next-tag did not advance");
                break;
            }
            tag = next.to_string();
        }
        debug!(volumes = count, "updated node cache");
        Ok(())
    }

    fn update_limit_cache(&mut self) -> Result<()> {
        let request = perf_request("smc_em", &["node_name", "dest_meter_count", "src_meter_count"], None);
        let results = self.client.invoke(&request)?;
        let mut count = 0;
        if let Some(instances) = results.child("instances") {
            for instance in &instances.children {
                let counters = perf_counters(instance);
                let node = counters.get("node_name").copied().unwrap_or("").to_string();
                if let Some(v) = counters.get("dest_meter_count") {
                    self.dest_limits.insert(node.clone(), v.to_string());
                }
                if let Some(v) = counters.get("src_meter_count") {
                    self.src_limits.insert(node, v.to_string());
                }
                count += 1;
            }
        }
        debug!(nodes = count, "updated limit cache");
        Ok(())
    }
}

impl Plugin for SnapMirror {
    fn name(&self) -> &str {
        "SnapMirror"
    }

    fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>> {
        if self.runs % NODE_CACHE_RUNS == 0 {
            self.update_node_cache()?;
        }
        if self.runs % LIMIT_CACHE_RUNS == 0 {
            self.update_limit_cache()?;
        }
        self.runs = self.runs.wrapping_add(1);

        for instance in data.instances_mut() {
            for side in ["source", "destination"] {
                let node_label = format!("{}_node", side);
                if instance.label(&node_label).is_empty() {
                    let key = format!(
                        "{}.{}",
                        instance.label(&format!("{}_vserver", side)),
                        instance.label(&format!("{}_volume", side))
                    );
                    if let Some(node) = self.nodes.get(&key) {
                        instance.labels.set(node_label.as_str(), node.as_str());
                    }
                }
                let limit_label = format!("{}_node_limit", side);
                let limits = if side == "source" { &self.src_limits } else { &self.dest_limits };
                if instance.label(&limit_label).is_empty()
                    && let Some(limit) = limits.get(instance.label(&node_label))
                {
                    instance.labels.set(limit_label, limit.as_str());
                }
            }
        }
        Ok(Vec::new())
    }
}
