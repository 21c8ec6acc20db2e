//! FC port utilization: `read_percent`, `write_percent` and
//! `util_percent` from `read_data`/`write_data` and the port `speed`.

use tracing::trace;

use super::{Plugin, PluginContext, parse_speed};
use crate::errors::{HarvestError, Result};
use crate::matrix::Matrix;
use crate::tree::Node;

pub struct Fcp;

impl Fcp {
    pub fn new(_config: &Node, _ctx: &PluginContext) -> Result<Self> {
        Ok(Self)
    }
}

/// Key of the first metric present among `candidates`.
fn find_metric<'a>(data: &Matrix, candidates: &[&'a str]) -> Option<&'a str> {
    candidates.iter().copied().find(|k| data.has_metric(k))
}

impl Plugin for Fcp {
    fn name(&self) -> &str {
        "Fcp"
    }

    fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>> {
        let read = find_metric(data, &["read_data", "fcp_read_data"])
            .ok_or_else(|| HarvestError::NoMetric("read_data".into()))?;
        let write = find_metric(data, &["write_data", "fcp_write_data"])
            .ok_or_else(|| HarvestError::NoMetric("write_data".into()))?;
        for name in ["read_percent", "write_percent", "util_percent"] {
            if !data.has_metric(name) {
                data.add_metric(name, name)?;
            }
        }
        for instance in data.instances_mut() {
            if let Some(port) = instance.label("port").strip_prefix("port.") {
                let port = port.to_string();
                instance.labels.set("port", port);
            }
        }
        if !data.is_initialized() {
            return Ok(Vec::new());
        }

        let mut values: Vec<(&str, String, f64)> = Vec::new();
        for (key, instance) in data.instances() {
            let raw = instance.label("speed");
            let Some(speed) = parse_speed(raw).filter(|s| *s > 0.0) else {
                trace!(instance = key, speed = raw, "no usable speed");
                continue;
            };
            let r = data.get_value(read, key).map(|v| v / speed * 100.0);
            let w = data.get_value(write, key).map(|v| v / speed * 100.0);
            if let Some(r) = r {
                values.push(("read_percent", key.to_string(), r));
            }
            if let Some(w) = w {
                values.push(("write_percent", key.to_string(), w));
            }
            if r.is_some() || w.is_some() {
                values.push(("util_percent", key.to_string(), r.unwrap_or(0.0).max(w.unwrap_or(0.0))));
            }
        }
        for (metric, key, v) in values {
            data.set_value(metric, &key, v)?;
        }
        Ok(Vec::new())
    }
}
