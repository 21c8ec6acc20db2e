//! Declarative rules over instance labels.
//!
//! ```yaml
//! LabelAgent:
//!   split:
//!     - volume `_` project,env
//!   replace_regex:
//!     - node node_short `^(\w+)-(\d+)$` `$1$2`
//!   exclude_equals:
//!     - state `offline`
//!   value_to_num:
//!     - new_status state online online `0`
//! ```
//!
//! Rule kinds run in the order they appear; within a kind, in list order.
//! Malformed rules are logged and skipped.

use regex::Regex;
use tracing::{debug, warn};

use super::{Plugin, PluginContext, rule_lines};
use crate::errors::{HarvestError, Result};
use crate::matrix::{Instance, Matrix};
use crate::tree::Node;

#[derive(Debug, Clone, PartialEq)]
enum Piece {
    Literal(String),
    Group(usize),
}

#[derive(Debug, Clone)]
enum Matcher {
    Equals(String),
    Contains(String),
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Equals(v) => value == v,
            Matcher::Contains(v) => value.contains(v.as_str()),
            Matcher::Regex(r) => r.is_match(value),
        }
    }
}

#[derive(Debug, Clone)]
enum Rule {
    Split {
        source: String,
        sep: String,
        targets: Vec<String>,
    },
    SplitRegex {
        source: String,
        regex: Regex,
        targets: Vec<String>,
    },
    SplitPairs {
        source: String,
        sep: String,
        pair_sep: String,
    },
    Join {
        target: String,
        sep: String,
        sources: Vec<String>,
    },
    Replace {
        source: String,
        target: String,
        old: String,
        new: String,
    },
    ReplaceRegex {
        source: String,
        target: String,
        regex: Regex,
        format: Vec<Piece>,
    },
    Exclude {
        label: String,
        matcher: Matcher,
    },
    /// Instances matching none of the filters are not exported.
    Include(Vec<(String, Matcher)>),
    ValueToNum {
        metric: String,
        label: String,
        mapping: Vec<String>,
        default: Option<f64>,
    },
}

pub struct LabelAgent {
    rules: Vec<Rule>,
    /// Labels created by the rules, for exporters that list label names.
    new_labels: Vec<String>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// `SRC \`SEP\` A,B` → (SRC, SEP, [A, B])
fn parse_sep_rule(rule: &str) -> Option<(String, String, Vec<String>)> {
    let (head, rest) = rule.split_once(" `")?;
    let (sep, tail) = rest.split_once("` ")?;
    let names: Vec<String> = tail.split(',').map(|s| s.trim().to_string()).collect();
    let head = head.trim();
    if head.is_empty() || names.iter().all(String::is_empty) {
        return None;
    }
    Some((head.to_string(), sep.to_string(), names))
}

/// `SRC DST \`A\` \`B\`` → (SRC, DST, A, B)
fn parse_replace_rule(rule: &str) -> Option<(String, String, String, String)> {
    let mut parts = rule.splitn(3, " `");
    let labels: Vec<&str> = parts.next()?.split_whitespace().collect();
    let a = parts.next()?.strip_suffix('`')?;
    let b = parts.next()?.trim_end().strip_suffix('`')?;
    match labels.as_slice() {
        [source, target] => Some((source.to_string(), target.to_string(), a.to_string(), b.to_string())),
        _ => None,
    }
}

/// `LABEL \`VALUE\``
fn parse_filter_rule(rule: &str) -> Option<(String, String)> {
    let (label, value) = rule.split_once(" `")?;
    let value = value.trim_end().strip_suffix('`')?;
    let label = label.trim();
    (!label.is_empty()).then(|| (label.to_string(), value.to_string()))
}

/// Substitution string with `$N` references to capture groups; `\$` is a
/// literal dollar sign.
fn parse_format(raw: &str) -> Option<Vec<Piece>> {
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                chars.next();
                literal.push('$');
            }
            '$' => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    digits.push(*d);
                    chars.next();
                }
                let index: usize = digits.parse().ok().filter(|i| *i > 0)?;
                if !literal.is_empty() {
                    pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                }
                pieces.push(Piece::Group(index));
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        pieces.push(Piece::Literal(literal));
    }
    Some(pieces)
}

fn compile(pattern: &str, kind: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(r) => Some(r),
        Err(e) => {
            warn!(rule = kind, pattern, error = %e, "invalid regex");
            None
        }
    }
}

fn parse_value_to_num(rule: &str) -> Option<Rule> {
    let fields: Vec<&str> = rule.split_whitespace().collect();
    if fields.len() != 4 && fields.len() != 5 {
        return None;
    }
    // `-` separates alternatives
    let mapping = fields[2]
        .split('-')
        .chain(fields[3].split('-'))
        .map(str::to_string)
        .collect();
    let default = match fields.get(4) {
        Some(raw) => Some(raw.trim_matches('`').parse::<u8>().ok()? as f64),
        None => None,
    };
    Some(Rule::ValueToNum {
        metric: fields[0].to_string(),
        label: fields[1].to_string(),
        mapping,
        default,
    })
}

impl LabelAgent {
    pub fn new(config: &Node, _ctx: &PluginContext) -> Result<Self> {
        let mut agent = LabelAgent {
            rules: Vec::new(),
            new_labels: Vec::new(),
        };
        for kind in &config.children {
            let lines = if kind.is_leaf() {
                vec![kind.content.clone()]
            } else {
                rule_lines(kind)
            };
            agent.add_rules(&kind.name, &lines);
        }
        if agent.rules.is_empty() {
            return Err(HarvestError::InvalidParam("LabelAgent: no valid rules".into()));
        }
        debug!(rules = agent.rules.len(), new_labels = ?agent.new_labels, "parsed label rules");
        Ok(agent)
    }

    fn add_rules(&mut self, kind: &str, lines: &[String]) {
        let mut include: Vec<(String, Matcher)> = Vec::new();
        for line in lines.iter().filter(|l| !l.trim().is_empty()) {
            let rule = match kind {
                "split" => parse_sep_rule(line).map(|(source, sep, targets)| Rule::Split { source, sep, targets }),
                "split_regex" => parse_sep_rule(line).and_then(|(source, pattern, targets)| {
                    compile(&pattern, kind).map(|regex| Rule::SplitRegex { source, regex, targets })
                }),
                "split_pairs" => {
                    let fields: Vec<&str> = line.split('`').collect();
                    (fields.len() == 5).then(|| Rule::SplitPairs {
                        source: fields[0].trim().to_string(),
                        sep: fields[1].to_string(),
                        pair_sep: fields[3].to_string(),
                    })
                }
                "join" => parse_sep_rule(line).map(|(target, sep, sources)| Rule::Join { target, sep, sources }),
                "replace" => parse_replace_rule(line).map(|(source, target, old, new)| Rule::Replace {
                    source,
                    target,
                    old,
                    new,
                }),
                "replace_regex" => parse_replace_rule(line).and_then(|(source, target, pattern, sub)| {
                    let regex = compile(&pattern, kind)?;
                    let format = parse_format(&sub)?;
                    Some(Rule::ReplaceRegex { source, target, regex, format })
                }),
                "exclude_equals" | "exclude_contains" | "exclude_regex" | "include_equals"
                | "include_contains" | "include_regex" => {
                    let Some((label, value)) = parse_filter_rule(line) else {
                        warn!(rule = kind, line = %line, "invalid format, skipped");
                        continue;
                    };
                    let matcher = match kind.rsplit('_').next() {
                        Some("equals") => Matcher::Equals(value),
                        Some("contains") => Matcher::Contains(value),
                        _ => match compile(&value, kind) {
                            Some(r) => Matcher::Regex(r),
                            None => continue,
                        },
                    };
                    if kind.starts_with("include") {
                        include.push((label, matcher));
                        continue;
                    }
                    Some(Rule::Exclude { label, matcher })
                }
                "value_to_num" => parse_value_to_num(line),
                other => {
                    warn!(rule = other, "unknown rule kind, skipped");
                    return;
                }
            };
            match rule {
                Some(rule) => {
                    self.note_labels(&rule);
                    self.rules.push(rule);
                }
                None => warn!(rule = kind, line = %line, "invalid format, skipped"),
            }
        }
        if !include.is_empty() {
            self.rules.push(Rule::Include(include));
        }
    }

    fn note_labels(&mut self, rule: &Rule) {
        let names: Vec<&String> = match rule {
            Rule::Split { targets, .. } | Rule::SplitRegex { targets, .. } => targets.iter().collect(),
            Rule::Join { target, .. } | Rule::Replace { target, .. } | Rule::ReplaceRegex { target, .. } => {
                vec![target]
            }
            _ => Vec::new(),
        };
        for name in names {
            if !name.is_empty() && !self.new_labels.contains(name) {
                self.new_labels.push(name.clone());
            }
        }
    }

    pub fn new_labels(&self) -> &[String] {
        &self.new_labels
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

fn apply(rule: &Rule, instance: &mut Instance) {
    match rule {
        Rule::Split { source, sep, targets } => {
            let value = instance.label(source).to_string();
            let parts: Vec<&str> = value.split(sep.as_str()).collect();
            if parts.len() >= targets.len() {
                for (target, part) in targets.iter().zip(parts) {
                    if !target.is_empty() && !part.is_empty() {
                        instance.labels.set(target, part);
                    }
                }
            }
        }
        Rule::SplitRegex { source, regex, targets } => {
            let value = instance.label(source).to_string();
            let Some(caps) = regex.captures(&value) else {
                return;
            };
            if caps.len() != targets.len() + 1 {
                return;
            }
            for (i, target) in targets.iter().enumerate() {
                if let Some(m) = caps.get(i + 1)
                    && !target.is_empty()
                    && !m.as_str().is_empty()
                {
                    instance.labels.set(target, m.as_str());
                }
            }
        }
        Rule::SplitPairs { source, sep, pair_sep } => {
            let value = instance.label(source).to_string();
            if value.is_empty() {
                return;
            }
            for pair in value.split(sep.as_str()) {
                let kv: Vec<&str> = pair.split(pair_sep.as_str()).collect();
                if let [k, v] = kv.as_slice() {
                    instance.labels.set(*k, *v);
                }
            }
        }
        Rule::Join { target, sep, sources } => {
            let values: Vec<&str> = sources
                .iter()
                .map(|s| instance.label(s))
                .filter(|v| !v.is_empty())
                .collect();
            if !values.is_empty() {
                let joined = values.join(sep);
                instance.labels.set(target, joined);
            }
        }
        Rule::Replace { source, target, old, new } => {
            let value = instance.label(source);
            if value.is_empty() {
                return;
            }
            let replaced = value.replace(old.as_str(), new);
            if replaced != value {
                instance.labels.set(target, replaced);
            }
        }
        Rule::ReplaceRegex { source, target, regex, format } => {
            let value = instance.label(source).to_string();
            let Some(caps) = regex.captures(&value) else {
                return;
            };
            let mut out = String::new();
            for piece in format {
                match piece {
                    Piece::Literal(s) => out.push_str(s),
                    Piece::Group(i) => out.push_str(caps.get(*i).map_or("", |m| m.as_str())),
                }
            }
            if !out.is_empty() && out != value {
                instance.labels.set(target, out);
            }
        }
        Rule::Exclude { label, matcher } => {
            if matcher.matches(instance.label(label)) {
                instance.exportable = false;
            }
        }
        Rule::Include(filters) => {
            if instance.exportable {
                instance.exportable = filters.iter().any(|(label, m)| m.matches(instance.label(label)));
            }
        }
        Rule::ValueToNum { .. } => {}
    }
}

fn value_to_num(data: &mut Matrix, metric: &str, label: &str, mapping: &[String], default: Option<f64>) -> Result<()> {
    if !data.has_metric(metric) {
        data.add_metric(metric, metric)?;
    }
    if !data.is_initialized() {
        return Ok(());
    }
    let values: Vec<(String, f64)> = data
        .instances()
        .filter_map(|(key, instance)| {
            let v = instance.label(label);
            if mapping.iter().any(|m| m == v) {
                Some((key.to_string(), 1.0))
            } else {
                default.map(|d| (key.to_string(), d))
            }
        })
        .collect();
    for (key, v) in values {
        data.set_value(metric, &key, v)?;
    }
    Ok(())
}

impl Plugin for LabelAgent {
    fn name(&self) -> &str {
        "LabelAgent"
    }

    fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>> {
        for rule in &self.rules {
            if let Rule::ValueToNum { metric, label, mapping, default } = rule {
                value_to_num(data, metric, label, mapping, *default)?;
                continue;
            }
            for instance in data.instances_mut() {
                apply(rule, instance);
            }
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::yaml;

    fn agent(config: &str) -> LabelAgent {
        let node = yaml::parse(config, "LabelAgent").unwrap();
        let ctx = PluginContext {
            collector: "Zapi".into(),
            object: "volume".into(),
            parent: Node::new("template"),
            client: None,
        };
        LabelAgent::new(&node, &ctx).unwrap()
    }

    fn matrix(instances: &[(&str, &[(&str, &str)])]) -> Matrix {
        let mut m = Matrix::new("Zapi", "volume", "");
        m.add_metric("size", "size").unwrap();
        for (key, labels) in instances {
            let i = m.add_instance(key).unwrap();
            for (k, v) in *labels {
                i.labels.set(*k, *v);
            }
        }
        m.init_data().unwrap();
        m
    }

    #[test]
    fn split_into_project_and_env() {
        let mut a = agent("split:\n  - volume `_` project,env\n");
        let mut m = matrix(&[("v1", &[("volume", "alpha_prod")])]);
        a.run(&mut m).unwrap();
        let i = m.instance("v1").unwrap();
        assert_eq!(i.label("project"), "alpha");
        assert_eq!(i.label("env"), "prod");
        assert_eq!(a.new_labels(), ["project", "env"]);
    }

    #[test]
    fn split_with_fewer_parts_does_nothing() {
        let mut a = agent("split:\n  - volume `_` a,b,c\n");
        let mut m = matrix(&[("v1", &[("volume", "alpha_prod")])]);
        a.run(&mut m).unwrap();
        assert_eq!(m.instance("v1").unwrap().label("a"), "");
    }

    #[test]
    fn split_regex_and_pairs() {
        let mut a = agent(
            "split_regex:\n  - node `^(\\w+)-(\\d+)$` site,num\nsplit_pairs:\n  - tags `,` `=`\n",
        );
        let mut m = matrix(&[("v1", &[("node", "rack-07"), ("tags", "team=db,tier=gold")])]);
        a.run(&mut m).unwrap();
        let i = m.instance("v1").unwrap();
        assert_eq!(i.label("site"), "rack");
        assert_eq!(i.label("num"), "07");
        assert_eq!(i.label("team"), "db");
        assert_eq!(i.label("tier"), "gold");
    }

    #[test]
    fn join_skips_empty_sources() {
        let mut a = agent("join:\n  - path `/` svm,qtree,volume\n");
        let mut m = matrix(&[("v1", &[("svm", "s1"), ("volume", "vol0")])]);
        a.run(&mut m).unwrap();
        assert_eq!(m.instance("v1").unwrap().label("path"), "s1/vol0");
    }

    #[test]
    fn replace_literal_and_regex() {
        let mut a = agent(
            "replace:\n  - svm svm_clean `vs_` ``\nreplace_regex:\n  - node short `^(\\w+)-(\\d+)$` `$2\\$$1`\n",
        );
        let mut m = matrix(&[("v1", &[("svm", "vs_data"), ("node", "rack-07")])]);
        a.run(&mut m).unwrap();
        let i = m.instance("v1").unwrap();
        assert_eq!(i.label("svm_clean"), "data");
        assert_eq!(i.label("short"), "07$rack");
    }

    #[test]
    fn substitution_format() {
        assert_eq!(
            parse_format("a$1-$12\\$"),
            Some(vec![
                Piece::Literal("a".into()),
                Piece::Group(1),
                Piece::Literal("-".into()),
                Piece::Group(12),
                Piece::Literal("$".into()),
            ])
        );
        assert_eq!(parse_format("$x"), None);
        assert_eq!(parse_format("$0"), None);
    }

    #[test]
    fn exclude_and_include() {
        let mut a = agent(
            "exclude_equals:\n  - state `offline`\ninclude_contains:\n  - volume `prod`\n  - volume `stage`\n",
        );
        let mut m = matrix(&[
            ("v1", &[("state", "offline"), ("volume", "prod1")]),
            ("v2", &[("state", "online"), ("volume", "prod2")]),
            ("v3", &[("state", "online"), ("volume", "stage3")]),
            ("v4", &[("state", "online"), ("volume", "dev4")]),
        ]);
        a.run(&mut m).unwrap();
        let exported: Vec<&str> = m
            .instances()
            .filter(|(_, i)| i.exportable)
            .map(|(k, _)| k)
            .collect();
        assert_eq!(exported, vec!["v2", "v3"]);
    }

    #[test]
    fn exclude_regex() {
        let mut a = agent("exclude_regex:\n  - volume `^vol0$`\n");
        let mut m = matrix(&[("v1", &[("volume", "vol0")]), ("v2", &[("volume", "vol01")])]);
        a.run(&mut m).unwrap();
        assert!(!m.instance("v1").unwrap().exportable);
        assert!(m.instance("v2").unwrap().exportable);
    }

    #[test]
    fn value_to_num_with_default() {
        let mut a = agent("value_to_num:\n  - new_status state online ok `0`\n");
        let mut m = matrix(&[
            ("v1", &[("state", "online")]),
            ("v2", &[("state", "ok")]),
            ("v3", &[("state", "offline")]),
        ]);
        a.run(&mut m).unwrap();
        assert_eq!(m.get_value("new_status", "v1"), Some(1.0));
        assert_eq!(m.get_value("new_status", "v2"), Some(1.0));
        assert_eq!(m.get_value("new_status", "v3"), Some(0.0));
    }

    #[test]
    fn invalid_rules_are_skipped() {
        let node = yaml::parse("split:\n  - no separators here\n", "LabelAgent").unwrap();
        let ctx = PluginContext {
            collector: "Zapi".into(),
            object: "volume".into(),
            parent: Node::new("template"),
            client: None,
        };
        assert!(LabelAgent::new(&node, &ctx).is_err());
    }
}
