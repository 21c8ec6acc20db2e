//! Template helpers: counter name parsing, display-name derivation,
//! export options and schedule extraction.

mod resolve;

pub use resolve::{ClusterModel, TemplateStore, Version, pick_version};

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::errors::{HarvestError, Result};
use crate::matrix::ExportOptions;
use crate::tree::Node;
use crate::util::parse_duration;

/// Role of a counter leaf in the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterRole {
    /// `^^name`: part of the instance key.
    Key,
    /// `^name`: instance label.
    Label,
    /// Numeric metric.
    Metric,
}

/// A parsed counter leaf such as `^^owning-vserver-name => svm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCounter {
    pub name: String,
    /// Explicit display name given with `=>`, if any.
    pub display: Option<String>,
    pub role: CounterRole,
    /// Optional type in parentheses: `last_transfer_duration(duration) => ...`.
    pub metric_type: Option<String>,
}

impl ParsedCounter {
    /// Display name, falling back to `name` with `.` and `-` turned into `_`.
    pub fn display_or_default(&self) -> String {
        self.display
            .clone()
            .unwrap_or_else(|| self.name.replace(['.', '-'], "_"))
    }
}

static METRIC_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*)\((.*?)\)$").expect("static regex"));

/// Parses a counter leaf: role prefix, `=>` alias and `(type)` suffix.
pub fn parse_counter(raw: &str) -> ParsedCounter {
    let raw = raw.trim();
    let (mut name, display) = match raw.split_once("=>") {
        Some((n, d)) => (n.trim().to_string(), Some(d.trim().to_string())),
        None => (raw.to_string(), None),
    };

    let role = if name.starts_with("^^") {
        name = name.trim_start_matches('^').to_string();
        CounterRole::Key
    } else if name.starts_with('^') {
        name = name.trim_start_matches('^').to_string();
        CounterRole::Label
    } else {
        CounterRole::Metric
    };

    let mut metric_type = None;
    if display.is_some()
        && let Some(caps) = METRIC_TYPE.captures(&name)
    {
        metric_type = Some(caps[2].to_string());
        name = caps[1].to_string();
    }

    ParsedCounter {
        name,
        display: display.map(|d| d.trim_start_matches('^').to_string()),
        role,
        metric_type,
    }
}

const ZAPI_IGNORED_WORDS: [&str; 5] = ["attributes", "info", "list", "details", "storage"];

/// Display name of a ZAPI counter path without an explicit alias.
///
/// Tokens that occur in the object name or in a fixed ignore set are
/// dropped; the rest are split on `-` and joined with `_`, without repeats.
pub fn zapi_display(object: &str, path: &[String]) -> String {
    let object_words: Vec<&str> = object.split('_').collect();
    let mut words: Vec<&str> = Vec::new();
    for attribute in path {
        for word in attribute.split('-') {
            if word.is_empty()
                || word == object
                || object_words.contains(&word)
                || ZAPI_IGNORED_WORDS.contains(&word)
                || words.contains(&word)
            {
                continue;
            }
            words.push(word);
        }
    }
    words.join("_")
}

/// Display name of a perf counter: dashes to underscores and the
/// object prefix (`volume_read_ops` on object `volume`) stripped.
pub fn perf_display(object: &str, counter: &str) -> String {
    let display = counter.replace('-', "_");
    let prefix = format!("{}_", object);
    match display.strip_prefix(&prefix) {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => display,
    }
}

fn list_or_csv(node: &Node) -> Vec<String> {
    if node.children.is_empty() {
        node.content
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    } else {
        node.children
            .iter()
            .map(|c| c.content.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Reads `export_options` from a template.
pub fn export_options(template: &Node) -> ExportOptions {
    let Some(node) = template.child("export_options") else {
        return ExportOptions::default();
    };
    ExportOptions {
        instance_keys: node.child("instance_keys").map(list_or_csv).unwrap_or_default(),
        instance_labels: node
            .child("instance_labels")
            .map(list_or_csv)
            .unwrap_or_default(),
        include_all_labels: node
            .child_content("include_all_labels")
            .eq_ignore_ascii_case("true"),
    }
}

/// Reads `schedule` as `(task, interval)` pairs in declaration order.
pub fn schedule(template: &Node) -> Result<Vec<(String, Duration)>> {
    let node = template
        .child("schedule")
        .ok_or_else(|| HarvestError::MissingParam("schedule".into()))?;
    let mut tasks = Vec::new();
    for child in &node.children {
        if child.name.is_empty() {
            return Err(HarvestError::InvalidParam(format!(
                "schedule entry [{}] has no task name",
                child.content
            )));
        }
        let interval = parse_duration(&child.content).map_err(|e| {
            HarvestError::InvalidParam(format!("schedule [{}]: {}", child.name, e))
        })?;
        tasks.push((child.name.clone(), interval));
    }
    if tasks.is_empty() {
        return Err(HarvestError::MissingParam("schedule".into()));
    }
    Ok(tasks)
}

/// `objects` of a collector default template: `(object, sub-template file)`.
pub fn objects(template: &Node) -> Vec<(String, String)> {
    template
        .child("objects")
        .map(|n| {
            n.children
                .iter()
                .filter(|c| !c.name.is_empty())
                .map(|c| (c.name.clone(), c.content.clone()))
                .collect()
        })
        .unwrap_or_default()
}
