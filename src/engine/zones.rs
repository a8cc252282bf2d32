//! Conditional sections delimited by `{{SegmentN_Start}}` / `{{SegmentN_End}}`.
//!
//! Zones are ranges of body-level blocks. A zone starts at the first
//! top-level paragraph carrying the Start marker while no zone of that
//! segment is open, and ends at the next paragraph carrying the End marker,
//! which may be the Start paragraph itself.
//! Ranges are kept as element ids, so removing one zone never shifts the
//! bounds of another.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::docx::document::{visit_paragraphs_mut, DocumentTree, PartKind};
use crate::docx::text::{collapse_into_first, paragraph_text};
use crate::docx::tree::{NodeId, XmlElement, XmlNode};
use crate::record::MAX_SEGMENTS;

use super::textbox::blank_raw_matches;

static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{Segment[1-6]_(?:Start|End)\}\}").expect("marker regex"));

pub fn start_marker(segment: usize) -> String {
    format!("{{{{Segment{segment}_Start}}}}")
}

pub fn end_marker(segment: usize) -> String {
    format!("{{{{Segment{segment}_End}}}}")
}

/// Inclusive range of top-level blocks, from the Start paragraph to the End
/// paragraph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Zone {
    pub segment: usize,
    pub start: NodeId,
    pub end: NodeId,
}

#[derive(Debug, thiserror::Error)]
#[error("{{{{Segment{segment}_Start}}}} has no matching {{{{Segment{segment}_End}}}}")]
pub struct UnmatchedStart {
    pub segment: usize,
}

/// Zones of one segment in the body's top-level blocks.
pub fn find_zones(body: &XmlElement, segment: usize) -> Result<Vec<Zone>, UnmatchedStart> {
    let start = start_marker(segment);
    let end = end_marker(segment);
    let mut zones = Vec::new();
    let mut open: Option<NodeId> = None;
    for el in body.elements().filter(|e| e.name == "w:p") {
        let text = paragraph_text(el);
        if open.is_none() && text.contains(&start) {
            open = Some(el.id);
        }
        if let Some(from) = open {
            if text.contains(&end) {
                zones.push(Zone {
                    segment,
                    start: from,
                    end: el.id,
                });
                open = None;
            }
        }
    }
    match open {
        Some(_) => Err(UnmatchedStart { segment }),
        None => Ok(zones),
    }
}

/// Removes the zones of every segment number not in `present`. Every
/// segment's markers are checked for pairing first, so a corrupt template
/// fails before anything is removed.
pub fn remove_absent_zones(tree: &mut DocumentTree, present: &[usize]) -> Result<usize, UnmatchedStart> {
    let Some(body) = tree.body_mut().and_then(|b| b.block_container_mut()) else {
        return Ok(0);
    };

    let mut absent = Vec::new();
    for segment in 1..=MAX_SEGMENTS {
        let zones = find_zones(body, segment)?;
        if !present.contains(&segment) {
            absent.extend(zones);
        }
    }
    absent.sort_by(|a, b| b.start.cmp(&a.start));

    let mut removed = 0;
    for zone in &absent {
        let before = body.children.len();
        body.children.retain(|node| match node {
            XmlNode::Element(e) => e.id < zone.start || e.id > zone.end,
            _ => true,
        });
        let n = before - body.children.len();
        debug!(segment = zone.segment, blocks = n, "removed conditional zone");
        removed += n;
    }
    if !absent.is_empty() {
        info!(zones = absent.len(), blocks = removed, "removed sections of absent segments");
    }
    Ok(removed)
}

/// Removes every remaining Start/End marker. Body-level paragraphs left
/// without text are deleted unless they hold embedded content or a section
/// break; anywhere else, textboxes included, the marker text is blanked and
/// the paragraph kept.
pub fn strip_markers(tree: &mut DocumentTree) -> usize {
    let mut stripped = 0;
    for part in tree.parts_mut() {
        let kind = part.kind;
        let Some(container) = part.block_container_mut() else {
            continue;
        };
        if kind == PartKind::Body {
            let mut gone = BTreeSet::new();
            for el in container.elements().filter(|e| e.name == "w:p") {
                let text = paragraph_text(el);
                if MARKER_RE.is_match(&text)
                    && MARKER_RE.replace_all(&text, "").trim().is_empty()
                    && !has_embedded_content(el)
                {
                    gone.insert(el.id);
                }
            }
            stripped += gone.len();
            container.children.retain(|node| match node {
                XmlNode::Element(e) => !gone.contains(&e.id),
                _ => true,
            });
        }
        visit_paragraphs_mut(container, &mut |p| {
            let text = paragraph_text(p);
            if MARKER_RE.is_match(&text) {
                collapse_into_first(p, &MARKER_RE.replace_all(&text, ""));
                stripped += 1;
            }
        });
    }
    stripped += blank_raw_matches(tree, &MARKER_RE);
    if stripped > 0 {
        debug!(paragraphs = stripped, "stripped section markers");
    }
    stripped
}

fn has_embedded_content(paragraph: &XmlElement) -> bool {
    let section_break = paragraph
        .child("w:pPr")
        .is_some_and(|ppr| ppr.child("w:sectPr").is_some());
    section_break
        || paragraph.any(&|e| matches!(e.name.as_str(), "w:drawing" | "w:pict" | "w:object"))
}
