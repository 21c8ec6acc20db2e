//! YAML codec for templates.

use std::path::Path;

use serde_yaml::{Mapping, Value};

use crate::errors::{HarvestError, Result};

use super::Node;

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn fill(node: &mut Node, value: &Value) {
    match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                let name = scalar_to_string(k).unwrap_or_default();
                let mut child = Node::new(name);
                fill(&mut child, v);
                node.children.push(child);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                match item {
                    // a map inside a list contributes its entries as named children
                    Value::Mapping(map) => {
                        for (k, v) in map {
                            let mut child = Node::new(scalar_to_string(k).unwrap_or_default());
                            fill(&mut child, v);
                            node.children.push(child);
                        }
                    }
                    Value::Sequence(_) => {
                        let mut child = Node::new("");
                        fill(&mut child, item);
                        node.children.push(child);
                    }
                    other => {
                        let content = scalar_to_string(other).unwrap_or_default();
                        node.children.push(Node::with_content("", content));
                    }
                }
            }
        }
        Value::Tagged(tagged) => fill(node, &tagged.value),
        scalar => node.content = scalar_to_string(scalar).unwrap_or_default(),
    }
}

/// Parses a YAML document into a tree whose root is named `root_name`.
pub fn parse(input: &str, root_name: &str) -> Result<Node> {
    let value: Value = serde_yaml::from_str(input)?;
    let mut root = Node::new(root_name);
    fill(&mut root, &value);
    Ok(root)
}

pub fn load(path: &Path) -> Result<Node> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        HarvestError::Template(format!("read [{}]: {}", path.display(), e))
    })?;
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("template");
    parse(&text, name).map_err(|e| HarvestError::Template(format!("[{}]: {}", path.display(), e)))
}

fn to_value(node: &Node) -> Value {
    if node.children.is_empty() {
        return if node.content.is_empty() {
            Value::Null
        } else {
            Value::String(node.content.clone())
        };
    }
    let names_unique = {
        let mut seen = std::collections::HashSet::new();
        node.children
            .iter()
            .all(|c| !c.name.is_empty() && seen.insert(c.name.as_str()))
    };
    if names_unique {
        let mut map = Mapping::new();
        for c in &node.children {
            map.insert(Value::String(c.name.clone()), to_value(c));
        }
        return Value::Mapping(map);
    }
    let items = node
        .children
        .iter()
        .map(|c| {
            if c.name.is_empty() {
                to_value(c)
            } else {
                let mut single = Mapping::new();
                single.insert(Value::String(c.name.clone()), to_value(c));
                Value::Mapping(single)
            }
        })
        .collect();
    Value::Sequence(items)
}

/// Emits the children of `node` as a YAML document.
pub fn to_string(node: &Node) -> Result<String> {
    Ok(serde_yaml::to_string(&to_value(node))?)
}
