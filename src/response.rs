/// Response model: the raw transport output, its XML form, an owned node
/// arena built from it and the flattened text view the extraction operators
/// count against.
use std::sync::OnceLock;

use regex::Regex;
use roxmltree::Document;

use crate::error::{ReciteError, Result};

pub type NodeId = usize;

// Rendered as a blank line; later siblings lose one indentation step
const WRAPPERS: [&str; 6] = [
    "Results",
    "Envelope",
    "Body",
    "PullResponse",
    "Items",
    "EnumerateResponse",
];
const SKIPPED: [&str; 3] = ["Header", "EndOfSequence", "EnumerationContext"];

#[derive(Debug, Clone)]
pub struct Node {
    /// `prefix:local` as written in the document.
    pub name: String,
    pub local: String,
    pub attrs: Vec<(String, String)>,
    /// Trimmed text; `Some` only for nodes without element children.
    pub text: Option<String>,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
}

impl Node {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Parse a normalised XML string into an owned arena. The root element is
    /// always node 0.
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml).map_err(|e| ReciteError::MalformedResponse(e.to_string()))?;
        let mut tree = Tree { nodes: Vec::new() };
        tree.copy(doc.root_element(), None);
        Ok(tree)
    }

    fn copy(&mut self, node: roxmltree::Node, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        let tag = node.tag_name();
        let local = tag.name().to_string();
        let name = match tag.namespace().and_then(|ns| node.lookup_prefix(ns)) {
            Some(prefix) if !prefix.is_empty() => format!("{}:{}", prefix, local),
            _ => local.clone(),
        };
        let attrs = node
            .attributes()
            .map(|a| (a.name().to_string(), a.value().to_string()))
            .collect();

        let has_elements = node.children().any(|c| c.is_element());
        let text = if has_elements {
            None
        } else {
            let joined: String = node
                .children()
                .filter(|c| c.is_text())
                .filter_map(|c| c.text())
                .collect();
            Some(joined.trim().to_string())
        };

        self.nodes.push(Node {
            name,
            local,
            attrs,
            text,
            children: Vec::new(),
            parent,
        });

        for child in node.children().filter(|c| c.is_element()) {
            let child_id = self.copy(child, Some(id));
            self.nodes[id].children.push(child_id);
        }

        id
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True when `id` is `ancestor` or lies beneath it.
    pub fn is_within(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self.nodes[node].parent;
        }
        false
    }

    /// Indented plain-text view of the whole tree.
    pub fn flatten(&self) -> String {
        let mut out = String::new();
        self.flatten_level(&[self.root()], "", &mut out);

        let out = blank_run_regex().replace_all(&out, "\n\n");
        let out = out.trim();
        if out.is_empty() {
            String::new()
        } else {
            format!("{}\n\n", out)
        }
    }

    fn flatten_level(&self, ids: &[NodeId], depth: &str, out: &mut String) {
        let mut offset = "  ";
        for (i, &id) in ids.iter().enumerate() {
            let node = &self.nodes[id];
            let local = node.local.as_str();
            if SKIPPED.contains(&local) {
                continue;
            }

            if local == "Selector" {
                for (_, value) in &node.attrs {
                    out.push_str(depth);
                    out.push_str(value);
                }
            } else if WRAPPERS.contains(&local) {
                offset = "";
            } else {
                out.push_str(depth);
                out.push_str(local);
            }

            if let Some(text) = node.text.as_deref().filter(|t| !t.is_empty()) {
                out.push_str(" = ");
                out.push_str(text);
            }
            out.push('\n');

            let next_depth = format!("{}{}", depth, offset);
            self.flatten_level(&node.children, &next_depth, out);

            if depth.is_empty() && i + 1 < ids.len() {
                out.push('\n');
            }
        }
    }

    /// Field names observed in the document, first-seen order: the local
    /// names of leaf elements (the `Name` attribute for selectors), without
    /// class-name entries.
    pub fn fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        for node in self.nodes.iter().skip(1) {
            if node.text.is_none() {
                continue;
            }
            let name = if node.local == "Selector" {
                match node.attr("Name") {
                    Some(n) => n,
                    None => continue,
                }
            } else {
                node.local.as_str()
            };
            if name.contains("DCIM_") || fields.iter().any(|f| f == name) {
                continue;
            }
            fields.push(name.to_string());
        }
        fields
    }
}

/// One transport round trip, kept until the next call replaces it.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub raw: String,
    /// Prologue-stripped, line-joined XML (the raw text when not XML).
    pub xml: String,
    /// Flattened text; the raw output when it was not XML.
    pub text: String,
    pub tree: Option<Tree>,
}

impl Response {
    pub fn from_output(raw: &str) -> Self {
        let mut xml = raw.to_string();
        if prologue_regex().is_match(&xml) {
            xml = format!("<Results>{}</Results>", prologue_regex().replace_all(&xml, ""));
        }
        let xml: String = xml.lines().map(str::trim).collect();

        match Tree::parse(&xml) {
            Ok(tree) => Self {
                raw: raw.to_string(),
                text: tree.flatten(),
                xml,
                tree: Some(tree),
            },
            Err(e) => {
                log::debug!("Output kept as text: {}", e);
                Self {
                    raw: raw.to_string(),
                    xml,
                    text: raw.to_string(),
                    tree: None,
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Number of blank-line separated chunks.
    pub fn chunks(&self) -> usize {
        self.text.matches("\n\n").count()
    }

    /// Output as selected by `$FORMAT`.
    pub fn render(&self, format: &str) -> String {
        match format {
            "xml" => format!("{}\n", self.xml),
            "prettyxml" if self.tree.is_some() => pretty_xml(&self.xml),
            _ => self.text.clone(),
        }
    }
}

/// Re-indent compact XML one space per level, keeping text inline with its
/// element.
pub fn pretty_xml(xml: &str) -> String {
    let mut out = String::new();
    let mut level: usize = 0;
    let mut rest = xml;

    while let Some(start) = rest.find('<') {
        let text = rest[..start].trim();
        let Some(end) = rest[start..].find('>').map(|e| start + e + 1) else {
            break;
        };
        let tag = &rest[start..end];
        rest = &rest[end..];

        if !text.is_empty() {
            // text always sits between an opening and its closing tag
            out.push_str(text);
        }

        if tag.starts_with("</") {
            level = level.saturating_sub(1);
            if text.is_empty() && out.ends_with('\n') {
                out.push_str(&" ".repeat(level));
            }
            out.push_str(tag);
            out.push('\n');
        } else if tag.starts_with("<?") || tag.starts_with("<!") || tag.ends_with("/>") {
            out.push_str(&" ".repeat(level));
            out.push_str(tag);
            out.push('\n');
        } else {
            out.push_str(&" ".repeat(level));
            out.push_str(tag);
            level += 1;
            if !rest.trim_start().starts_with('<') || rest.trim_start().starts_with("</") {
                continue;
            }
            out.push('\n');
        }
    }

    out
}

fn prologue_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<\?xml version=.*?>").unwrap())
}

fn blank_run_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\n+").unwrap())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const ENUMERATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:wsen="http://schemas.xmlsoap.org/ws/2004/09/enumeration" xmlns:n1="http://schemas.dell.com/wbem/wscim/1/cim-schema/2/DCIM_ControllerView">
  <s:Header>
    <wsa:Action xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing">PullResponse</wsa:Action>
  </s:Header>
  <s:Body>
    <wsen:PullResponse>
      <wsen:Items>
        <n1:DCIM_ControllerView>
          <n1:FQDD>RAID.Integrated.1-1</n1:FQDD>
          <n1:ProductName>PERC H710P</n1:ProductName>
          <n1:RollupStatus>1</n1:RollupStatus>
        </n1:DCIM_ControllerView>
        <n1:DCIM_ControllerView>
          <n1:FQDD>AHCI.Embedded.1-1</n1:FQDD>
          <n1:ProductName>S110</n1:ProductName>
          <n1:RollupStatus>2</n1:RollupStatus>
        </n1:DCIM_ControllerView>
      </wsen:Items>
      <wsen:EndOfSequence/>
    </wsen:PullResponse>
  </s:Body>
</s:Envelope>
"#;

    #[test]
    fn prologue_output_is_wrapped_in_results() {
        let response = Response::from_output(ENUMERATION);
        let tree = response.tree.as_ref().unwrap();

        assert_eq!(tree.node(tree.root()).local, "Results");
        assert!(response.xml.starts_with("<Results><s:Envelope"));
        assert!(!response.xml.contains('\n'));
    }

    #[test]
    fn flatten_renders_one_chunk_per_instance() {
        let response = Response::from_output(ENUMERATION);
        let expected = "\
DCIM_ControllerView
  FQDD = RAID.Integrated.1-1
  ProductName = PERC H710P
  RollupStatus = 1

DCIM_ControllerView
  FQDD = AHCI.Embedded.1-1
  ProductName = S110
  RollupStatus = 2

";
        assert_eq!(response.text, expected);
        assert_eq!(response.chunks(), 2);
    }

    #[test]
    fn qualified_names_and_text() {
        let response = Response::from_output(ENUMERATION);
        let tree = response.tree.as_ref().unwrap();
        let fqdd = (0..tree.len())
            .find(|&id| tree.node(id).local == "FQDD")
            .unwrap();

        assert_eq!(tree.node(fqdd).name, "n1:FQDD");
        assert_eq!(tree.node(fqdd).text.as_deref(), Some("RAID.Integrated.1-1"));
        let parent = tree.node(fqdd).parent.unwrap();
        assert_eq!(tree.node(parent).local, "DCIM_ControllerView");
        assert!(tree.node(parent).text.is_none());
    }

    #[test]
    fn selectors_render_attribute_values() {
        let xml = r#"<a:Root xmlns:a="urn:x"><a:Ref><a:SelectorSet><a:Selector Name="InstanceID">JID_1</a:Selector></a:SelectorSet></a:Ref></a:Root>"#;
        let response = Response::from_output(xml);
        assert_eq!(response.text, "Root\n  Ref\n    SelectorSet\n      InstanceID = JID_1\n\n");
    }

    #[test]
    fn non_xml_output_is_kept_verbatim() {
        let response = Response::from_output("Connection failed. response code = 0\n");
        assert!(response.tree.is_none());
        assert_eq!(response.text, "Connection failed. response code = 0\n");
        assert!(!response.is_empty());

        assert!(Response::from_output("").is_empty());
    }

    #[test]
    fn fields_skip_class_names() {
        let response = Response::from_output(ENUMERATION);
        let fields = response.tree.unwrap().fields();
        assert_eq!(fields, vec!["Action", "FQDD", "ProductName", "RollupStatus", "EndOfSequence"]);
    }

    #[test]
    fn pretty_xml_indents_nested_elements() {
        let pretty = pretty_xml("<a><b>1</b><c><d>2</d></c></a>");
        assert_eq!(pretty, "<a>\n <b>1</b>\n <c>\n  <d>2</d>\n </c>\n</a>\n");
    }
}
