//! Link utilization of network ports.
//!
//! Adds `rx_percent`, `tx_percent` and `util_percent` from the cooked
//! `rx_bytes`/`tx_bytes` rates and the `speed` label, plus `nic_state`
//! (0 when the link is up).

use tracing::trace;

use super::{Plugin, PluginContext, parse_speed};
use crate::errors::Result;
use crate::matrix::Matrix;
use crate::tree::Node;

const DERIVED: [&str; 4] = ["rx_percent", "tx_percent", "util_percent", "nic_state"];

pub struct Nic;

impl Nic {
    pub fn new(_config: &Node, _ctx: &PluginContext) -> Result<Self> {
        Ok(Self)
    }
}

impl Plugin for Nic {
    fn name(&self) -> &str {
        "Nic"
    }

    fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>> {
        for name in DERIVED {
            if !data.has_metric(name) {
                data.add_metric(name, name)?;
            }
        }
        if !data.is_initialized() {
            return Ok(Vec::new());
        }

        let mut values: Vec<(&str, String, f64)> = Vec::new();
        for (key, instance) in data.instances() {
            let state = match instance.labels.get("state").or(instance.labels.get("link_current_state")) {
                Some("up") => 0.0,
                _ => 1.0,
            };
            values.push(("nic_state", key.to_string(), state));

            let raw = instance.label("speed");
            let Some(speed) = parse_speed(raw).filter(|s| *s > 0.0) else {
                trace!(instance = key, speed = raw, "no usable speed");
                continue;
            };
            let rx = data.get_value("rx_bytes", key).map(|v| v / speed * 100.0);
            let tx = data.get_value("tx_bytes", key).map(|v| v / speed * 100.0);
            if let Some(rx) = rx {
                values.push(("rx_percent", key.to_string(), rx));
            }
            if let Some(tx) = tx {
                values.push(("tx_percent", key.to_string(), tx));
            }
            if rx.is_some() || tx.is_some() {
                let util = rx.unwrap_or(0.0).max(tx.unwrap_or(0.0));
                values.push(("util_percent", key.to_string(), util));
            }
        }
        for (metric, key, v) in values {
            data.set_value(metric, &key, v)?;
        }
        Ok(Vec::new())
    }
}
