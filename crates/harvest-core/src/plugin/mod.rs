//! Post-processors applied to a collector's data matrix before export.
//!
//! ```text
//!   poll_data ──► Matrix ──► plugin 1 ──► plugin 2 ──► ... ──► exporters
//!                              │              │
//!                              └── derived ───┴──► exported alongside
//! ```
//!
//! A plugin mutates the data matrix in place and may return derived
//! matrices (aggregates, per-shelf children). Plugins are declared under
//! `plugins:` in a template, run in declaration order, and are looked up in
//! a compile-time table by name.

mod aggregator;
mod fcp;
mod label_agent;
mod nic;
mod processor;
mod qos_policy;
mod shelf;
mod snapmirror;
mod volume;

pub use aggregator::Aggregator;
pub use fcp::Fcp;
pub use label_agent::LabelAgent;
pub use nic::Nic;
pub use processor::Processor;
pub use qos_policy::{QosPolicyAdaptive, QosPolicyFixed, parse_throughput};
pub use shelf::Shelf;
pub use snapmirror::SnapMirror;
pub use volume::Volume;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::api::ZapiClient;
use crate::errors::{HarvestError, Result};
use crate::matrix::Matrix;
use crate::tree::Node;

pub trait Plugin: Send {
    fn name(&self) -> &str;

    /// Processes `data` in place; returned matrices are exported after it.
    fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>>;
}

/// What a plugin gets to see of its collector at construction.
#[derive(Clone)]
pub struct PluginContext {
    pub collector: String,
    pub object: String,
    /// The collector's resolved template.
    pub parent: Node,
    /// API handle for plugins that issue their own requests.
    pub client: Option<Arc<dyn ZapiClient>>,
}

impl PluginContext {
    pub(crate) fn require_client(&self, plugin: &str) -> Result<Arc<dyn ZapiClient>> {
        self.client
            .clone()
            .ok_or_else(|| HarvestError::InvalidParam(format!("plugin [{}] requires a ZAPI collector", plugin)))
    }
}

type Constructor = fn(&Node, &PluginContext) -> Result<Box<dyn Plugin>>;

fn boxed<P: Plugin + 'static>(p: Result<P>) -> Result<Box<dyn Plugin>> {
    p.map(|p| Box::new(p) as Box<dyn Plugin>)
}

const REGISTRY: &[(&str, Constructor)] = &[
    ("labelagent", |n, c| boxed(LabelAgent::new(n, c))),
    ("aggregator", |n, c| boxed(Aggregator::new(n, c))),
    ("qospolicyfixed", |n, c| boxed(QosPolicyFixed::new(n, c))),
    ("qospolicyadaptive", |n, c| boxed(QosPolicyAdaptive::new(n, c))),
    ("nic", |n, c| boxed(Nic::new(n, c))),
    ("fcp", |n, c| boxed(Fcp::new(n, c))),
    ("processor", |n, c| boxed(Processor::new(n, c))),
    ("volume", |n, c| boxed(Volume::new(n, c))),
    ("shelf", |n, c| boxed(Shelf::new(n, c))),
    ("snapmirror", |n, c| boxed(SnapMirror::new(n, c))),
];

/// `LabelAgent`, `label_agent` and `label-agent` all map to `labelagent`.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Names of the built-in plugins.
pub fn plugin_names() -> Vec<&'static str> {
    REGISTRY.iter().map(|(n, _)| *n).collect()
}

/// Builds the plugin chain from the `plugins` node of a template.
///
/// Each child is either `Name: <config>` or a bare `Name` list item.
/// Unknown names are skipped with a warning; a known plugin whose config
/// does not parse fails the collector's init.
pub fn load_plugins(node: &Node, ctx: &PluginContext) -> Result<Vec<Box<dyn Plugin>>> {
    let mut plugins = Vec::new();
    for child in &node.children {
        let name = if child.name.is_empty() {
            child.content.as_str()
        } else {
            child.name.as_str()
        };
        let key = normalize(name);
        let Some((_, build)) = REGISTRY.iter().find(|(n, _)| *n == key) else {
            warn!(plugin = name, "unknown plugin, skipped");
            continue;
        };
        let plugin = build(child, ctx)?;
        debug!(plugin = plugin.name(), "loaded plugin");
        plugins.push(plugin);
    }
    Ok(plugins)
}

// ---------------------------------------------------------------------------
// Helpers shared by the built-in plugins
// ---------------------------------------------------------------------------

/// Text of a plugin's config entries: the content of every leaf, in order.
pub(crate) fn rule_lines(node: &Node) -> Vec<String> {
    node.flat_list(&[]).into_iter().map(|(_, line)| line).collect()
}

/// Empty schema for a derived matrix that shares the parent's global labels.
pub(crate) fn derived_matrix(parent: &Matrix, object: &str, plugin: &str) -> Matrix {
    let mut m = Matrix::new(&parent.collector, object, plugin);
    m.global_labels = parent.global_labels.clone();
    m
}

/// Link speed in bytes per second. A bare number is already bytes per
/// second; `K`/`M`/`G` suffixes are bits (`1000M` is 1000 Mbit/s).
pub(crate) fn parse_speed(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let n: f64 = digits.parse().ok()?;
    let bits = match unit.trim() {
        "" => return Some(n),
        "K" | "k" => n * 1_000.0,
        "M" | "m" => n * 1_000_000.0,
        "G" | "g" => n * 1_000_000_000.0,
        _ => return None,
    };
    Some(bits / 8.0)
}
