use std::collections::HashMap;

use anyhow::{anyhow, Context};

use super::package::DocxPackage;
use super::tree::{build_nodes, flatten, XmlElement, XmlNode};
use super::xml::{content_hash, parse_xml_part, write_events};

pub const MAIN_PART: &str = "word/document.xml";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartKind {
    Body,
    Header,
    Footer,
}

impl PartKind {
    fn of(name: &str) -> Option<Self> {
        if name == MAIN_PART {
            return Some(Self::Body);
        }
        let file = name.strip_prefix("word/")?;
        if file.contains('/') || !file.ends_with(".xml") {
            return None;
        }
        if file.starts_with("header") {
            Some(Self::Header)
        } else if file.starts_with("footer") {
            Some(Self::Footer)
        } else {
            None
        }
    }
}

/// One loaded XML part. `baseline` is the content hash at load time; a part
/// whose events still hash to it is written back with its original bytes.
#[derive(Clone)]
pub struct PartTree {
    pub name: String,
    pub kind: PartKind,
    pub nodes: Vec<XmlNode>,
    baseline: String,
}

impl PartTree {
    pub fn root(&self) -> Option<&XmlElement> {
        self.nodes.iter().find_map(|n| match n {
            XmlNode::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn root_mut(&mut self) -> Option<&mut XmlElement> {
        self.nodes.iter_mut().find_map(|n| match n {
            XmlNode::Element(e) => Some(e),
            _ => None,
        })
    }

    /// The element whose children are this part's top-level blocks:
    /// `w:body` for the main document, the `w:hdr` / `w:ftr` root otherwise.
    pub fn block_container(&self) -> Option<&XmlElement> {
        let root = self.root()?;
        match self.kind {
            PartKind::Body => root.child("w:body"),
            PartKind::Header | PartKind::Footer => Some(root),
        }
    }

    pub fn block_container_mut(&mut self) -> Option<&mut XmlElement> {
        let kind = self.kind;
        let root = self.root_mut()?;
        match kind {
            PartKind::Body => root.child_mut("w:body"),
            PartKind::Header | PartKind::Footer => Some(root),
        }
    }

    pub fn is_modified(&self) -> bool {
        content_hash(&flatten(&self.nodes)) != self.baseline
    }
}

/// In-memory document: the package plus every part the engines edit. Both
/// the structural engine and the raw textbox engine write through the same
/// element trees, so no part is ever held in two representations.
#[derive(Clone)]
pub struct DocumentTree {
    package: DocxPackage,
    parts: Vec<PartTree>,
}

impl DocumentTree {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let package = DocxPackage::from_bytes(bytes).context("open package")?;
        package
            .entry(MAIN_PART)
            .ok_or_else(|| anyhow!("package has no {MAIN_PART}"))?;

        let mut next_id = 0usize;
        let mut parts = Vec::new();
        for ent in package.xml_entries() {
            let Some(kind) = PartKind::of(&ent.name) else {
                continue;
            };
            let xml = parse_xml_part(&ent.name, &ent.data)
                .with_context(|| format!("parse xml: {}", ent.name))?;
            let baseline = content_hash(&xml.events);
            let nodes = build_nodes(&xml.events, &mut next_id)
                .with_context(|| format!("build tree: {}", ent.name))?;
            parts.push(PartTree {
                name: ent.name.clone(),
                kind,
                nodes,
                baseline,
            });
        }
        // Body first, then headers and footers in package order.
        parts.sort_by_key(|p| p.kind != PartKind::Body);

        let tree = Self { package, parts };
        tree.body()
            .and_then(|b| b.block_container())
            .ok_or_else(|| anyhow!("{MAIN_PART} has no w:body"))?;
        Ok(tree)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut replacements: HashMap<String, Vec<u8>> = HashMap::new();
        for part in &self.parts {
            if !part.is_modified() {
                continue;
            }
            let bytes = write_events(&flatten(&part.nodes))
                .with_context(|| format!("serialize xml: {}", part.name))?;
            replacements.insert(part.name.clone(), bytes);
        }
        self.package.write_with_replacements(&replacements)
    }

    pub fn parts(&self) -> &[PartTree] {
        &self.parts
    }

    pub fn parts_mut(&mut self) -> &mut [PartTree] {
        &mut self.parts
    }

    pub fn body(&self) -> Option<&PartTree> {
        self.parts.iter().find(|p| p.kind == PartKind::Body)
    }

    pub fn body_mut(&mut self) -> Option<&mut PartTree> {
        self.parts.iter_mut().find(|p| p.kind == PartKind::Body)
    }

    /// Every structural paragraph of every part, body first.
    pub fn for_each_paragraph(&self, f: &mut dyn FnMut(&str, &XmlElement)) {
        for part in &self.parts {
            if let Some(container) = part.block_container() {
                visit_paragraphs(container, &mut |p| f(&part.name, p));
            }
        }
    }

    /// Every textbox and drawing paragraph of every part.
    pub fn for_each_raw_paragraph(&self, f: &mut dyn FnMut(&str, &XmlElement)) {
        for part in &self.parts {
            if let Some(root) = part.root() {
                visit_raw_paragraphs(root, false, &mut |p| f(&part.name, p));
            }
        }
    }
}

/// Visits the structural paragraphs below `container`: direct paragraphs,
/// paragraphs in table cells (nested tables included) and paragraphs in
/// block-level content controls. Textbox and drawing paragraphs are not
/// structural and are left to the raw engine.
pub fn visit_paragraphs(container: &XmlElement, f: &mut dyn FnMut(&XmlElement)) {
    for el in container.elements() {
        match el.name.as_str() {
            "w:p" => f(el),
            "w:tbl" => {
                for row in el.elements().filter(|e| e.name == "w:tr") {
                    for cell in row.elements().filter(|e| e.name == "w:tc") {
                        visit_paragraphs(cell, f);
                    }
                }
            }
            "w:sdt" => {
                if let Some(content) = el.child("w:sdtContent") {
                    visit_paragraphs(content, f);
                }
            }
            _ => {}
        }
    }
}

pub fn visit_paragraphs_mut(container: &mut XmlElement, f: &mut dyn FnMut(&mut XmlElement)) {
    for el in container.elements_mut() {
        if el.name == "w:p" {
            f(el);
        } else if el.name == "w:tbl" {
            for row in el.elements_mut().filter(|e| e.name == "w:tr") {
                for cell in row.elements_mut().filter(|e| e.name == "w:tc") {
                    visit_paragraphs_mut(cell, f);
                }
            }
        } else if el.name == "w:sdt" {
            if let Some(content) = el.child_mut("w:sdtContent") {
                visit_paragraphs_mut(content, f);
            }
        }
    }
}

pub fn visit_raw_paragraphs(el: &XmlElement, in_textbox: bool, f: &mut dyn FnMut(&XmlElement)) {
    for c in el.elements() {
        if c.name == "a:p" || (in_textbox && c.name == "w:p") {
            f(c);
            visit_raw_paragraphs(c, in_textbox, f);
        } else {
            visit_raw_paragraphs(c, in_textbox || c.name == "w:txbxContent", f);
        }
    }
}

/// Visits raw paragraph-like nodes below `el`: paragraphs inside textbox
/// content (VML and DrawingML) and DrawingML text paragraphs.
pub fn visit_raw_paragraphs_mut(
    el: &mut XmlElement,
    in_textbox: bool,
    f: &mut dyn FnMut(&mut XmlElement),
) {
    for c in el.elements_mut() {
        if c.name == "a:p" || (in_textbox && c.name == "w:p") {
            f(c);
            // Paragraphs can anchor further textboxes.
            visit_raw_paragraphs_mut(c, in_textbox, f);
        } else if c.name == "w:txbxContent" {
            visit_raw_paragraphs_mut(c, true, f);
        } else {
            visit_raw_paragraphs_mut(c, in_textbox, f);
        }
    }
}
