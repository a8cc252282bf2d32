use anyhow::{anyhow, bail};

use super::xml::XmlEvent;

/// Stable identity of an element, assigned in document order when a part is
/// loaded. Ids are never reused or renumbered while the tree lives, so a
/// range of ids keeps describing the same elements after siblings are removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

#[derive(Clone, Debug)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
    Other(XmlEvent),
}

#[derive(Clone, Debug)]
pub struct XmlElement {
    pub id: NodeId,
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    self_closing: bool,
}

impl XmlElement {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets an attribute. `value` is stored as raw attribute text and must
    /// already be escaped.
    pub fn set_attr(&mut self, key: &str, value: &str) {
        for (k, v) in self.attrs.iter_mut() {
            if k == key {
                *v = value.to_string();
                return;
            }
        }
        self.attrs.push((key.to_string(), value.to_string()));
    }

    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|c| match c {
            XmlNode::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut XmlElement> {
        self.children.iter_mut().filter_map(|c| match c {
            XmlNode::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|e| e.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut XmlElement> {
        self.elements_mut().find(|e| e.name == name)
    }

    /// Direct character data of this element.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for c in &self.children {
            match c {
                XmlNode::Text(t) => out.push_str(t),
                XmlNode::Other(XmlEvent::CData { text }) => out.push_str(text),
                _ => {}
            }
        }
        out
    }

    /// Replaces the character data of a leaf text element.
    pub fn set_text(&mut self, text: &str) {
        self.children.retain(|c| {
            !matches!(c, XmlNode::Text(_) | XmlNode::Other(XmlEvent::CData { .. }))
        });
        self.children.insert(0, XmlNode::Text(text.to_string()));
    }

    /// Depth-first search over this element and its descendants.
    pub fn any(&self, pred: &dyn Fn(&XmlElement) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        self.elements().any(|e| e.any(pred))
    }

    fn push_events(&self, out: &mut Vec<XmlEvent>) {
        let has_content = self.children.iter().any(|c| match c {
            XmlNode::Text(t) => !t.is_empty(),
            _ => true,
        });
        if self.self_closing && !has_content {
            out.push(XmlEvent::Empty {
                name: self.name.clone(),
                attrs: self.attrs.clone(),
            });
            return;
        }
        out.push(XmlEvent::Start {
            name: self.name.clone(),
            attrs: self.attrs.clone(),
        });
        flatten_into(&self.children, out);
        out.push(XmlEvent::End {
            name: self.name.clone(),
        });
    }
}

/// Builds an element tree from a flat event stream. `next_id` is the arena
/// counter shared by every part of one document.
pub fn build_nodes(events: &[XmlEvent], next_id: &mut usize) -> anyhow::Result<Vec<XmlNode>> {
    let mut top: Vec<XmlNode> = Vec::new();
    let mut stack: Vec<XmlElement> = Vec::new();

    fn attach(top: &mut Vec<XmlNode>, stack: &mut [XmlElement], node: XmlNode) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => top.push(node),
        }
    }

    for ev in events {
        match ev {
            XmlEvent::Start { name, attrs } => {
                let id = NodeId(*next_id);
                *next_id += 1;
                stack.push(XmlElement {
                    id,
                    name: name.clone(),
                    attrs: attrs.clone(),
                    children: Vec::new(),
                    self_closing: false,
                });
            }
            XmlEvent::Empty { name, attrs } => {
                let id = NodeId(*next_id);
                *next_id += 1;
                let el = XmlElement {
                    id,
                    name: name.clone(),
                    attrs: attrs.clone(),
                    children: Vec::new(),
                    self_closing: true,
                };
                attach(&mut top, &mut stack, XmlNode::Element(el));
            }
            XmlEvent::End { name } => {
                let el = stack
                    .pop()
                    .ok_or_else(|| anyhow!("unexpected closing tag </{name}>"))?;
                if el.name != *name {
                    bail!("mismatched closing tag </{name}> for <{}>", el.name);
                }
                attach(&mut top, &mut stack, XmlNode::Element(el));
            }
            XmlEvent::Text { text } => {
                attach(&mut top, &mut stack, XmlNode::Text(text.clone()));
            }
            other => attach(&mut top, &mut stack, XmlNode::Other(other.clone())),
        }
    }

    if let Some(open) = stack.last() {
        bail!("unterminated element <{}>", open.name);
    }
    Ok(top)
}

pub fn flatten(nodes: &[XmlNode]) -> Vec<XmlEvent> {
    let mut out = Vec::new();
    flatten_into(nodes, &mut out);
    out
}

fn flatten_into(nodes: &[XmlNode], out: &mut Vec<XmlEvent>) {
    for node in nodes {
        match node {
            XmlNode::Element(e) => e.push_events(out),
            XmlNode::Text(t) => out.push(XmlEvent::Text { text: t.clone() }),
            XmlNode::Other(ev) => out.push(ev.clone()),
        }
    }
}
