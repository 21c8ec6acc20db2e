//! XML codec for ZAPI requests and responses.

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use crate::errors::{HarvestError, Result};

use super::Node;

fn node_from_start(e: &BytesStart<'_>) -> Result<Node> {
    let name = std::str::from_utf8(e.local_name().as_ref())
        .map_err(|err| HarvestError::Parse(format!("element name: {}", err)))?
        .to_string();
    let mut node = Node::new(name);
    for attr in e.attributes() {
        let attr = attr.map_err(|err| HarvestError::Parse(format!("attribute: {}", err)))?;
        let key = std::str::from_utf8(attr.key.local_name().as_ref())
            .map_err(|err| HarvestError::Parse(format!("attribute name: {}", err)))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|err| HarvestError::Parse(format!("attribute value: {}", err)))?;
        node.attrs.push((key, value.into_owned()));
    }
    Ok(node)
}

/// Parses an XML document into a tree rooted at the document element.
pub fn parse(input: &str) -> Result<Node> {
    let mut reader = Reader::from_str(input);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| HarvestError::Parse(format!("xml at {}: {}", reader.buffer_position(), e)))?;
        match event {
            Event::Start(e) => stack.push(node_from_start(&e)?),
            Event::Empty(e) => {
                let node = node_from_start(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| HarvestError::Parse("unbalanced end tag".into()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::Text(t) => {
                if let Some(current) = stack.last_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| HarvestError::Parse(format!("text: {}", e)))?;
                    current.content.push_str(&text);
                }
            }
            Event::CData(t) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .content
                        .push_str(&String::from_utf8_lossy(t.as_ref()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(HarvestError::Parse("unexpected end of document".into()));
    }
    root.ok_or_else(|| HarvestError::Parse("empty document".into()))
}

/// Serializes a tree without XML declaration.
pub fn to_string(node: &Node) -> String {
    let mut out = String::new();
    write_node(node, &mut out);
    out
}

fn write_node(node: &Node, out: &mut String) {
    out.push('<');
    out.push_str(&node.name);
    for (k, v) in &node.attrs {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(&escape(v.as_str()));
        out.push('"');
    }
    if node.children.is_empty() && node.content.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    out.push_str(&escape(node.content.as_str()));
    for c in &node.children {
        write_node(c, out);
    }
    out.push_str("</");
    out.push_str(&node.name);
    out.push('>');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_zapi_response() {
        let doc = r#"<?xml version="1.0" encoding="UTF-8"?>
<netapp version="1.3" xmlns="http://www.netapp.com/filer/admin">
  <results status="passed">
    <attributes-list>
      <volume-attributes>
        <volume-id-attributes>
          <name>vol &amp; co</name>
        </volume-id-attributes>
      </volume-attributes>
    </attributes-list>
    <num-records>1</num-records>
    <next-tag/>
  </results>
</netapp>"#;
        let root = parse(doc).unwrap();
        assert_eq!(root.name, "netapp");
        let results = root.child("results").unwrap();
        assert_eq!(results.attr("status"), Some("passed"));
        assert_eq!(results.child_content("num-records"), "1");
        assert!(results.has_child("next-tag"));
        let name = results
            .child("attributes-list")
            .and_then(|l| l.child("volume-attributes"))
            .and_then(|v| v.content_at(&["volume-id-attributes".into(), "name".into()]));
        assert_eq!(name, Some("vol & co"));
    }

    #[test]
    fn writes_nested_request() {
        let mut req = Node::new("perf-object-get-instances");
        req.new_child("objectname", "volume");
        let counters = req.new_child("counters", "");
        counters.new_child("counter", "read_ops");
        assert_eq!(
            to_string(&req),
            "<perf-object-get-instances><objectname>volume</objectname>\
             <counters><counter>read_ops</counter></counters></perf-object-get-instances>"
        );
    }

    #[test]
    fn escapes_content() {
        let node = Node::with_content("query", "a<b");
        assert_eq!(to_string(&node), "<query>a&lt;b</query>");
        assert_eq!(parse(&to_string(&node)).unwrap().content, "a<b");
    }

    #[test]
    fn rejects_truncated_document() {
        assert!(parse("<netapp><results>").is_err());
    }
}
