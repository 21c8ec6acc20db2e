//! Named tree shared by templates (YAML) and ZAPI requests/responses (XML).
//!
//! A node has a name, text content, attributes and ordered children.
//! YAML sequences become unnamed children carrying only content, so a
//! template list such as `counters: [^^name, size]` is two children with
//! empty names.

pub mod xml;
pub mod yaml;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub content: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_content(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.child(name).is_some()
    }

    /// Content of the named child, or the empty string.
    pub fn child_content(&self, name: &str) -> &str {
        self.child(name).map(|c| c.content.as_str()).unwrap_or("")
    }

    pub fn add_child(&mut self, child: Node) -> &mut Node {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    pub fn new_child(&mut self, name: impl Into<String>, content: impl Into<String>) -> &mut Node {
        self.add_child(Node::with_content(name, content))
    }

    /// Replaces the content of the named child, creating it if missing.
    pub fn set_child_content(&mut self, name: &str, content: impl Into<String>) {
        match self.child_mut(name) {
            Some(c) => c.content = content.into(),
            None => {
                self.new_child(name, content);
            }
        }
    }

    pub fn pop_child(&mut self, name: &str) -> Option<Node> {
        let pos = self.children.iter().position(|c| c.name == name)?;
        Some(self.children.remove(pos))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == name) {
            Some(a) => a.1 = value,
            None => self.attrs.push((name, value)),
        }
    }

    /// Contents of all children (list items in templates).
    pub fn all_child_content(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.content.as_str()).collect()
    }

    pub fn all_child_names(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Overlays `other` onto `self`: a child of `other` replaces the
    /// same-named child of `self` wholesale; new children are appended.
    /// Unnamed children (list items) in `other` replace the whole list.
    pub fn overlay(&mut self, other: &Node) {
        if !other.content.is_empty() {
            self.content = other.content.clone();
        }
        if other.children.iter().any(|c| c.name.is_empty()) {
            self.children = other.children.clone();
            return;
        }
        for child in &other.children {
            match self.children.iter_mut().find(|c| c.name == child.name) {
                Some(existing) => *existing = child.clone(),
                None => self.children.push(child.clone()),
            }
        }
    }

    /// Descendants reached by following `path` from this node's children.
    ///
    /// `path[0]` is matched against the children of `self`.
    pub fn search_children(&self, path: &[String]) -> Vec<&Node> {
        let Some((first, rest)) = path.split_first() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for child in self.children.iter().filter(|c| &c.name == first) {
            if rest.is_empty() {
                out.push(child);
            } else {
                out.extend(child.search_children(rest));
            }
        }
        out
    }

    /// Content of the first descendant at `path` relative to this node.
    pub fn content_at(&self, path: &[String]) -> Option<&str> {
        let mut node = self;
        for name in path {
            node = node.child(name)?;
        }
        Some(node.content.as_str())
    }

    /// Paths of all leaf contents, each as `prefix + ancestors + content`.
    ///
    /// Used to flatten the `counters` sub-tree of a template.
    pub fn flat_list(&self, prefix: &[String]) -> Vec<(Vec<String>, String)> {
        let mut out = Vec::new();
        for child in &self.children {
            if child.children.is_empty() {
                if !child.content.is_empty() {
                    let mut path = prefix.to_vec();
                    if !child.name.is_empty() {
                        path.push(child.name.clone());
                    }
                    out.push((path, child.content.clone()));
                }
            } else {
                let mut path = prefix.to_vec();
                if !child.name.is_empty() {
                    path.push(child.name.clone());
                }
                out.extend(child.flat_list(&path));
            }
        }
        out
    }

    /// Indented debug rendering.
    pub fn print(&self) -> String {
        let mut out = String::new();
        self.print_into(0, &mut out);
        out
    }

    fn print_into(&self, depth: usize, out: &mut String) {
        out.push_str(&"  ".repeat(depth));
        if self.name.is_empty() {
            out.push('-');
        } else {
            out.push_str(&self.name);
        }
        if !self.content.is_empty() {
            out.push_str(" = ");
            out.push_str(&self.content);
        }
        out.push('\n');
        for c in &self.children {
            c.print_into(depth + 1, out);
        }
    }
}
