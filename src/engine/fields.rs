//! Marks computed fields (tables of contents, cross references, captions)
//! dirty so the word processor recomputes them on open.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::docx::document::DocumentTree;
use crate::docx::tree::{NodeId, XmlElement};

pub const REFRESHED_FIELDS: &[&str] = &["TOC", "TOF", "TOT", "REF", "PAGEREF", "SEQ"];

fn wants_refresh(code: &str) -> bool {
    code.split_whitespace()
        .next()
        .map(|kw| REFRESHED_FIELDS.contains(&kw.to_ascii_uppercase().as_str()))
        .unwrap_or(false)
}

/// A complex field being read: the id of its `begin` marker, the code
/// collected so far, and whether its code section is still open.
struct OpenField {
    begin: NodeId,
    code: String,
    in_code: bool,
}

fn scan(el: &XmlElement, open: &mut Vec<OpenField>, hits: &mut HashSet<NodeId>) {
    match el.name.as_str() {
        "w:fldChar" => match el.attr("w:fldCharType") {
            Some("begin") => open.push(OpenField {
                begin: el.id,
                code: String::new(),
                in_code: true,
            }),
            Some("separate") => {
                if let Some(f) = open.last_mut() {
                    f.in_code = false;
                }
            }
            Some("end") => {
                if let Some(f) = open.pop() {
                    if wants_refresh(&f.code) {
                        debug!(code = %f.code.trim(), "field marked for refresh");
                        hits.insert(f.begin);
                    }
                }
            }
            _ => {}
        },
        "w:instrText" => {
            if let Some(f) = open.last_mut().filter(|f| f.in_code) {
                f.code.push_str(&el.text());
            }
        }
        "w:fldSimple" => {
            if el.attr("w:instr").is_some_and(wants_refresh) {
                hits.insert(el.id);
            }
        }
        _ => {}
    }
    for c in el.elements() {
        scan(c, open, hits);
    }
}

fn mark(el: &mut XmlElement, hits: &HashSet<NodeId>) {
    if hits.contains(&el.id) {
        el.set_attr("w:dirty", "true");
    }
    for c in el.elements_mut() {
        mark(c, hits);
    }
}

/// Sets `w:dirty="true"` on every field whose code starts with one of
/// [`REFRESHED_FIELDS`]. Returns how many fields were marked.
pub fn refresh_fields(tree: &mut DocumentTree) -> usize {
    let mut total = 0;
    for part in tree.parts_mut() {
        let Some(root) = part.root() else {
            continue;
        };
        let mut hits = HashSet::new();
        scan(root, &mut Vec::new(), &mut hits);
        if hits.is_empty() {
            continue;
        }
        total += hits.len();
        debug!(part = %part.name, fields = hits.len(), "refreshing fields");
        if let Some(root) = part.root_mut() {
            mark(root, &hits);
        }
    }
    if total > 0 {
        info!(fields = total, "marked fields for update");
    }
    total
}
