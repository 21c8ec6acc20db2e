//! Per-node CPU summary (`node_cpu`) from per-processor instances.
//!
//! Values are summed over the processors of a node; `busy` and
//! `domain_busy` are divided by the processor count, which is also
//! exported as the `cpus` label.

use std::collections::HashMap;

use super::{Plugin, PluginContext};
use crate::errors::Result;
use crate::matrix::Matrix;
use crate::tree::Node;

const AVERAGED: [&str; 2] = ["busy", "domain_busy"];

pub struct Processor;

impl Processor {
    pub fn new(_config: &Node, _ctx: &PluginContext) -> Result<Self> {
        Ok(Self)
    }
}

impl Plugin for Processor {
    fn name(&self) -> &str {
        "Processor"
    }

    fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>> {
        if !data.is_initialized() {
            return Ok(Vec::new());
        }
        let mut sum = data.clone_schema(true, false);
        sum.object = "node_cpu".into();
        sum.plugin = "Processor".into();
        sum.export_options.instance_keys = vec!["node".into()];
        sum.export_options.instance_labels = vec!["cpus".into()];

        let mut cpus: HashMap<String, usize> = HashMap::new();
        let mut members: Vec<(usize, String)> = Vec::new();
        for (_, instance) in data.instances() {
            let node = instance.label("node");
            if node.is_empty() {
                continue;
            }
            if !sum.has_instance(node) {
                sum.add_instance(node)?.labels.set("node", node);
            }
            *cpus.entry(node.to_string()).or_default() += 1;
            members.push((instance.index(), node.to_string()));
        }
        if sum.instance_count() == 0 {
            return Ok(Vec::new());
        }
        sum.init_data()?;
        for (node, count) in &cpus {
            if let Some(i) = sum.instance_mut(node) {
                i.labels.set("cpus", count.to_string());
            }
        }

        let columns: HashMap<&str, usize> = sum
            .instances()
            .map(|(k, i)| (k, i.index()))
            .collect();
        let members: Vec<(usize, usize, f64)> = members
            .iter()
            .filter_map(|(from, node)| {
                let to = *columns.get(node.as_str())?;
                Some((*from, to, *cpus.get(node)? as f64))
            })
            .collect();

        let metrics: Vec<(std::ops::Range<usize>, bool)> = data
            .metrics()
            .map(|(_, m)| (m.rows(), AVERAGED.contains(&m.name.as_str())))
            .collect();
        for (rows, averaged) in metrics {
            for row in rows {
                let Some(source) = data.row(row) else {
                    continue;
                };
                for &(from, to, count) in &members {
                    let v = source[from];
                    if v.is_nan() {
                        continue;
                    }
                    let v = if averaged { v / count } else { v };
                    let total = sum.value_at(row, to).unwrap_or(0.0) + v;
                    sum.set_value_at(row, to, total)?;
                }
            }
        }
        Ok(vec![sum])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_summary() {
        let mut m = Matrix::new("ZapiPerf", "processor", "");
        m.add_metric("busy", "busy").unwrap();
        m.add_metric("sk_switches", "sk_switches").unwrap();
        for (key, node) in [("p0", "n1"), ("p1", "n1"), ("p2", "n2")] {
            m.add_instance(key).unwrap().labels.set("node", node);
        }
        m.init_data().unwrap();
        for (key, busy, sw) in [("p0", 40.0, 100.0), ("p1", 60.0, 50.0), ("p2", 10.0, 5.0)] {
            m.set_value("busy", key, busy).unwrap();
            m.set_value("sk_switches", key, sw).unwrap();
        }

        let out = Processor.run(&mut m).unwrap();
        let sum = &out[0];
        assert_eq!(sum.object, "node_cpu");
        assert_eq!(sum.get_value("busy", "n1"), Some(50.0));
        assert_eq!(sum.get_value("sk_switches", "n1"), Some(150.0));
        assert_eq!(sum.get_value("busy", "n2"), Some(10.0));
        assert_eq!(sum.instance("n1").unwrap().label("cpus"), "2");
    }
}
