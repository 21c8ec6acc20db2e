//! FlexGroup roll-up.
//!
//! Constituents are named `NAME__0001`, `NAME__0002`, ... and are hidden
//! from export. Their values are summed into one instance per FlexGroup
//! (key `node.svm.NAME`) of a derived matrix; latencies are weighted by the
//! matching ops counter and divided back by the summed ops.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::{Plugin, PluginContext};
use crate::errors::Result;
use crate::matrix::Matrix;
use crate::tree::Node;

static CONSTITUENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*)__(\d{4})$").expect("static regex"));

pub struct Volume;

impl Volume {
    pub fn new(_config: &Node, _ctx: &PluginContext) -> Result<Self> {
        Ok(Self)
    }
}

/// Ops counter that weights a latency counter: `avg_latency` → `total_ops`,
/// `read_latency` → `read_ops`.
fn ops_key(latency: &str) -> String {
    if latency.contains("avg_latency") {
        latency.replacen("avg_latency", "total_ops", 1)
    } else {
        latency.replacen("_latency", "_ops", 1)
    }
}

struct Scalar {
    key: String,
    row: usize,
    /// Row of the weighting ops counter, for latencies.
    ops_row: Option<usize>,
}

impl Plugin for Volume {
    fn name(&self) -> &str {
        "Volume"
    }

    fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>> {
        if !data.is_initialized() {
            return Ok(Vec::new());
        }
        let mut fg = data.clone_schema(true, false);
        fg.plugin = "flexgroup".into();

        let mut members: Vec<(usize, String)> = Vec::new();
        for instance in data.instances_mut() {
            let volume = instance.label("volume").to_string();
            let Some(caps) = CONSTITUENT.captures(&volume) else {
                instance.labels.set("type", "flexvol");
                continue;
            };
            let name = caps[1].to_string();
            let key = format!("{}.{}.{}", instance.label("node"), instance.label("svm"), name);
            if !fg.has_instance(&key) {
                let agg = fg.add_instance(&key)?;
                agg.labels = instance.labels.clone();
                agg.labels.set("volume", name);
                agg.labels.set("type", "flexgroup");
            }
            instance.labels.set("type", "flexgroup_constituent");
            instance.exportable = false;
            members.push((instance.index(), key));
        }
        if fg.instance_count() == 0 {
            return Ok(Vec::new());
        }
        fg.init_data()?;
        debug!(flexgroups = fg.instance_count(), "extracted flexgroup volumes");

        let scalars: Vec<Scalar> = data
            .metrics()
            .filter(|(_, m)| m.is_scalar())
            .map(|(key, m)| Scalar {
                key: key.to_string(),
                row: m.index(),
                ops_row: m
                    .name
                    .ends_with("_latency")
                    .then(|| data.metric(&ops_key(key)).map(|o| o.index()))
                    .flatten(),
            })
            .collect();
        let columns: HashMap<String, usize> = fg
            .instances()
            .map(|(k, i)| (k.to_string(), i.index()))
            .collect();

        for (from, key) in &members {
            let Some(&to) = columns.get(key) else {
                continue;
            };
            for s in &scalars {
                let Some(v) = data.value_at(s.row, *from) else {
                    continue;
                };
                let add = match s.ops_row {
                    Some(ops_row) => match data.value_at(ops_row, *from) {
                        Some(ops) => v * ops,
                        None => continue,
                    },
                    None => v,
                };
                let total = fg.value_at(s.row, to).unwrap_or(0.0) + add;
                fg.set_value_at(s.row, to, total)?;
            }
        }

        for s in scalars.iter().filter(|s| s.ops_row.is_some()) {
            let Some(ops_row) = s.ops_row else {
                continue;
            };
            for &to in columns.values() {
                if fg.value_at(s.row, to).is_none() {
                    continue;
                }
                let value = match fg.value_at(ops_row, to) {
                    Some(ops) if ops != 0.0 => fg.value_at(s.row, to).unwrap_or(0.0) / ops,
                    _ => f64::NAN,
                };
                fg.set_value_at(s.row, to, value)?;
            }
            debug!(metric = %s.key, "weighted latency");
        }
        Ok(vec![fg])
    }
}
