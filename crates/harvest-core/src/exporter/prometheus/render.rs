//! Text exposition of one matrix.

use std::collections::HashSet;
use std::fmt::Write;

use tracing::trace;

use crate::exporter::{instance_extra_labels, instance_keys};
use crate::matrix::{Matrix, Metric};

/// Escapes a label value: backslash, double quote and newline.
pub fn escape_label_value(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for c in v.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn format_value(v: f64) -> String {
    if v == f64::INFINITY {
        "+Inf".into()
    } else if v == f64::NEG_INFINITY {
        "-Inf".into()
    } else {
        v.to_string()
    }
}

fn join_labels<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut out = String::new();
    for (k, v) in pairs {
        if !out.is_empty() {
            out.push(',');
        }
        let _ = write!(out, "{}=\"{}\"", k, escape_label_value(v));
    }
    out
}

fn meta_tags(out: &mut Vec<String>, tagged: &mut HashSet<String>, name: &str, object: &str, metric: &Metric) {
    if !tagged.insert(name.to_string()) {
        return;
    }
    let help = metric
        .comment
        .clone()
        .unwrap_or_else(|| format!("Metric for {}", object));
    let kind = metric.metric_type.as_deref().unwrap_or(if metric.is_scalar() {
        "gauge"
    } else {
        "histogram"
    });
    out.push(format!("# HELP {} {}", name, help));
    out.push(format!("# TYPE {} {}", name, kind));
}

/// Renders every exportable instance of `data`, one line per sample.
///
/// Instances with any non-key labels get an `OBJECT_labels{..} 1.0` line
/// first. Array metrics carry their element as `metric="sub"` (and
/// `submetric="sub"` for the second dimension).
pub fn render(data: &Matrix, add_meta_tags: bool) -> Vec<String> {
    let mut out = Vec::new();
    let mut tagged = HashSet::new();
    let prefix = &data.object;

    for (key, instance) in data.instances() {
        if !instance.exportable {
            trace!(instance = key, "not exportable, skipped");
            continue;
        }
        let keys = instance_keys(data, &instance.labels);
        if keys.is_empty() {
            trace!(instance = key, "no keys, skipped");
            continue;
        }
        let key_text = join_labels(keys.iter().copied());
        let extra = instance_extra_labels(data, &instance.labels, &keys);
        if !extra.is_empty() {
            out.push(format!(
                "{}_labels{{{},{}}} 1.0",
                prefix,
                key_text,
                join_labels(extra)
            ));
        }

        let col = instance.index();
        for (_, metric) in data.metrics() {
            if !metric.exportable || !metric.enabled {
                continue;
            }
            let name = format!("{}_{}", prefix, metric.name);
            for (offset, row) in metric.rows().enumerate() {
                let Some(value) = data.value_at(row, col) else {
                    continue;
                };
                if add_meta_tags {
                    meta_tags(&mut out, &mut tagged, &name, &data.object, metric);
                }
                let line = match metric.element_labels(offset) {
                    None => format!("{}{{{}}} {}", name, key_text, format_value(value)),
                    Some((first, second)) => {
                        let mut dims = vec![("metric", first)];
                        if let Some(second) = second {
                            dims.push(("submetric", second));
                        }
                        format!(
                            "{}{{{},{}}} {}",
                            name,
                            key_text,
                            join_labels(dims),
                            format_value(value)
                        )
                    }
                };
                out.push(line);
            }
        }
    }
    trace!(object = %data.object, lines = out.len(), "rendered");
    out
}
