//! Group-by aggregation of a data matrix into derived matrices.
//!
//! One rule per line:
//!
//! ```text
//!   node                          one instance per node, object node_volume
//!   node<>node_vol                custom object name
//!   node<type=`^rw$`>             only instances whose `type` matches
//!   svm<root=false> aggr,node     keep aggr and node as labels (and key parts)
//!   node ...                      keep every label
//! ```
//!
//! Values are summed; averages, percents and latencies are averaged over
//! the number of instances that contributed a value.

use regex::Regex;
use tracing::{debug, trace, warn};

use super::{Plugin, PluginContext, rule_lines};
use crate::errors::{HarvestError, Result};
use crate::matrix::{ExportOptions, LabelMap, Matrix, Property};
use crate::tree::Node;

#[derive(Debug, Clone)]
enum Check {
    Value(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
struct Rule {
    label: String,
    object: Option<String>,
    check: Option<(String, Check)>,
    include_labels: Vec<String>,
    all_labels: bool,
}

impl Rule {
    fn parse(line: &str) -> Result<Rule> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() || fields.len() > 2 {
            return Err(HarvestError::InvalidParam(format!("aggregation rule [{}]", line)));
        }
        let mut rule = Rule {
            label: String::new(),
            object: None,
            check: None,
            include_labels: Vec::new(),
            all_labels: false,
        };
        match fields[0].split_once('<') {
            None => rule.label = fields[0].to_string(),
            Some((label, rest)) => {
                rule.label = label.trim().to_string();
                let (inner, object) = rest.split_once('>').unwrap_or((rest, ""));
                if !object.is_empty() {
                    rule.object = Some(object.to_lowercase());
                }
                let (check_label, value) = match inner.split_once('=') {
                    Some((l, v)) => (l.to_string(), v),
                    None => (rule.label.clone(), inner),
                };
                if let Some(pattern) = value.strip_prefix('`') {
                    let pattern = pattern.strip_suffix('`').unwrap_or(pattern);
                    let regex = Regex::new(pattern)
                        .map_err(|e| HarvestError::InvalidParam(format!("rule [{}]: {}", line, e)))?;
                    rule.check = Some((check_label, Check::Regex(regex)));
                } else if !value.is_empty() {
                    rule.check = Some((check_label, Check::Value(value.to_string())));
                }
            }
        }
        if rule.label.is_empty() {
            return Err(HarvestError::InvalidParam(format!("aggregation rule [{}]", line)));
        }
        if let Some(extra) = fields.get(1) {
            if *extra == "..." {
                rule.all_labels = true;
            } else {
                rule.include_labels = extra.split(',').map(str::to_string).collect();
            }
        }
        Ok(rule)
    }

    fn accepts(&self, labels: &LabelMap) -> bool {
        match &self.check {
            None => true,
            Some((label, Check::Value(v))) => labels.value(label) == v,
            Some((label, Check::Regex(r))) => r.is_match(labels.value(label)),
        }
    }

    /// Group key and the labels the aggregated instance carries.
    fn group(&self, labels: &LabelMap) -> Option<(String, LabelMap)> {
        let name = labels.value(&self.label);
        if name.is_empty() {
            return None;
        }
        if self.all_labels {
            let key = labels.iter().map(|(_, v)| v).collect::<Vec<_>>().join(".");
            return Some((key, labels.clone()));
        }
        let mut key = name.to_string();
        let mut out = LabelMap::new();
        for k in &self.include_labels {
            key.push('.');
            key.push_str(labels.value(k));
            out.set(k, labels.value(k));
        }
        out.set(&self.label, name);
        Some((key, out))
    }
}

pub struct Aggregator {
    rules: Vec<Rule>,
}

fn averaged(property: Property, display: &str) -> bool {
    matches!(property, Property::Average | Property::Percent)
        || display.contains("average_")
        || display.contains("avg_")
        || display.contains("_latency")
}

impl Aggregator {
    pub fn new(config: &Node, _ctx: &PluginContext) -> Result<Self> {
        let rules = rule_lines(config)
            .iter()
            .map(|line| Rule::parse(line))
            .collect::<Result<Vec<_>>>()?;
        if rules.is_empty() {
            return Err(HarvestError::InvalidParam("Aggregator: no rules".into()));
        }
        debug!(rules = rules.len(), "parsed aggregation rules");
        Ok(Self { rules })
    }

    fn aggregate(rule: &Rule, data: &Matrix) -> Result<Option<Matrix>> {
        let mut out = data.clone_schema(true, false);
        out.plugin = "Aggregator".into();
        out.exportable = true;
        out.object = match &rule.object {
            Some(o) => o.clone(),
            None => format!("{}_{}", rule.label.to_lowercase(), data.object),
        };
        out.export_options = ExportOptions {
            instance_keys: std::iter::once(rule.label.clone())
                .chain(rule.include_labels.iter().cloned())
                .collect(),
            instance_labels: Vec::new(),
            include_all_labels: rule.all_labels,
        };

        // source column -> group column
        let mut members: Vec<(usize, usize)> = Vec::new();
        for (key, instance) in data.instances() {
            if !instance.exportable || !rule.accepts(&instance.labels) {
                continue;
            }
            let Some((group, labels)) = rule.group(&instance.labels) else {
                trace!(instance = key, label = %rule.label, "label missing, skipped");
                continue;
            };
            if !out.has_instance(&group) {
                out.add_instance(&group)?.labels = labels;
            }
            if let Some(target) = out.instance(&group) {
                members.push((instance.index(), target.index()));
            }
        }
        if out.instance_count() == 0 || out.stride() == 0 {
            return Ok(None);
        }
        out.init_data()?;

        let width = out.instance_count();
        let metrics: Vec<(std::ops::Range<usize>, bool)> = data
            .metrics()
            .map(|(_, m)| (m.rows(), averaged(m.property, &m.name)))
            .collect();
        for (rows, average) in metrics {
            for row in rows {
                let Some(source) = data.row(row) else {
                    warn!(row, "row missing in source matrix");
                    continue;
                };
                let mut sums = vec![f64::NAN; width];
                let mut counts = vec![0u32; width];
                for &(from, to) in &members {
                    let v = source[from];
                    if v.is_nan() {
                        continue;
                    }
                    sums[to] = if sums[to].is_nan() { v } else { sums[to] + v };
                    counts[to] += 1;
                }
                for (col, (sum, count)) in sums.into_iter().zip(counts).enumerate() {
                    let value = if average && count > 0 { sum / count as f64 } else { sum };
                    out.set_value_at(row, col, value)?;
                }
            }
        }
        Ok(Some(out))
    }
}

impl Plugin for Aggregator {
    fn name(&self) -> &str {
        "Aggregator"
    }

    fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>> {
        let mut out = Vec::with_capacity(self.rules.len());
        if !data.is_initialized() {
            return Ok(out);
        }
        for rule in &self.rules {
            if let Some(m) = Self::aggregate(rule, data)? {
                debug!(object = %m.object, instances = m.instance_count(), "aggregated");
                out.push(m);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::yaml;

    fn plugin(config: &str) -> Aggregator {
        let node = yaml::parse(config, "Aggregator").unwrap();
        let ctx = PluginContext {
            collector: "ZapiPerf".into(),
            object: "volume".into(),
            parent: Node::new("template"),
            client: None,
        };
        Aggregator::new(&node, &ctx).unwrap()
    }

    fn volumes() -> Matrix {
        let mut m = Matrix::new("ZapiPerf", "volume", "");
        m.set_global_label("cluster", "c1");
        m.add_metric("total_ops", "total_ops").unwrap().property = Property::Rate;
        m.add_metric("read_latency", "read_latency").unwrap().property = Property::Average;
        for (key, node, kind) in [("v1", "n1", "rw"), ("v2", "n1", "dp"), ("v3", "n2", "rw")] {
            let i = m.add_instance(key).unwrap();
            i.labels.set("volume", key);
            i.labels.set("node", node);
            i.labels.set("type", kind);
        }
        m.init_data().unwrap();
        for (key, ops, lat) in [("v1", 10.0, 2.0), ("v2", 30.0, 4.0), ("v3", 5.0, 1.0)] {
            m.set_value("total_ops", key, ops).unwrap();
            m.set_value("read_latency", key, lat).unwrap();
        }
        m
    }

    #[test]
    fn sums_and_averages_per_node() {
        let mut p = plugin("- node\n");
        let out = p.run(&mut volumes()).unwrap();
        assert_eq!(out.len(), 1);
        let agg = &out[0];
        assert_eq!(agg.object, "node_volume");
        assert_eq!(agg.global_labels.value("cluster"), "c1");
        assert_eq!(agg.get_value("total_ops", "n1"), Some(40.0));
        assert_eq!(agg.get_value("read_latency", "n1"), Some(3.0));
        assert_eq!(agg.get_value("total_ops", "n2"), Some(5.0));
        assert_eq!(agg.instance("n1").unwrap().label("node"), "n1");
        assert_eq!(agg.export_options.instance_keys, vec!["node"]);
    }

    #[test]
    fn regex_filter_and_custom_object() {
        let mut p = plugin("- node<type=`^rw$`>node_rw\n");
        let out = p.run(&mut volumes()).unwrap();
        let agg = &out[0];
        assert_eq!(agg.object, "node_rw");
        assert_eq!(agg.get_value("total_ops", "n1"), Some(10.0));
    }

    #[test]
    fn value_filter_and_extra_labels() {
        let mut p = plugin("- node<type=rw> type\n");
        let out = p.run(&mut volumes()).unwrap();
        let agg = &out[0];
        assert_eq!(agg.instance_keys(), ["n1.rw", "n2.rw"]);
        assert_eq!(agg.instance("n2.rw").unwrap().label("type"), "rw");
    }

    #[test]
    fn non_exportable_instances_are_ignored() {
        let mut data = volumes();
        data.instance_mut("v2").unwrap().exportable = false;
        let mut p = plugin("- node\n");
        let out = p.run(&mut data).unwrap();
        assert_eq!(out[0].get_value("total_ops", "n1"), Some(10.0));
    }

    #[test]
    fn rule_syntax() {
        assert!(Rule::parse("a b c").is_err());
        assert!(Rule::parse("node<type=`(`>").is_err());
        let r = Rule::parse("node ...").unwrap();
        assert!(r.all_labels);
    }
}
