//! Segment and sub-segment placeholders, and removal of the blocks whose
//! placeholders were left without a value.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::docx::document::DocumentTree;
use crate::docx::text::{container_text, paragraph_text};
use crate::docx::tree::{XmlElement, XmlNode};
use crate::error::Warning;
use crate::record::{segment_key, sub_segment_key, Segment};

use super::substitute::substitute;
use super::textbox::blank_raw_matches;

/// Any segment or sub-segment token, in either sub-segment spelling.
static SEGMENT_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{Segment[1-6](?:Sub-[Ss]egment(?:10|[1-9]))?\}\}").expect("segment token regex")
});

pub fn has_segment_token(text: &str) -> bool {
    SEGMENT_TOKEN_RE.is_match(text)
}

pub fn token(key: &str) -> String {
    format!("{{{{{key}}}}}")
}

/// Substitutes `{{SegmentI}}` and `{{SegmentISub-segmentJ}}` for every
/// materialized segment. Blank names are skipped so that their placeholders
/// are pruned afterwards.
pub fn substitute_segments(tree: &mut DocumentTree, segments: &[Segment]) -> Vec<Warning> {
    let mut warnings = Vec::new();
    for (i, seg) in segments.iter().enumerate() {
        if !seg.is_present() {
            continue;
        }
        let res = substitute(tree, &token(&segment_key(i + 1)), &seg.name);
        warnings.extend(res.warnings);
        for (j, sub) in seg.sub_segments.iter().enumerate() {
            if sub.is_empty() {
                continue;
            }
            let res = substitute(tree, &token(&sub_segment_key(i + 1, j + 1)), sub);
            warnings.extend(res.warnings);
        }
    }
    warnings
}

/// Counts of blocks removed by [`prune_empty`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pruned {
    pub paragraphs: usize,
    pub rows: usize,
    pub tables: usize,
    /// Textbox and drawing paragraphs whose tokens were blanked.
    pub raw: usize,
}

/// Removes every paragraph still holding a segment token, and every table row
/// with such a token in any of its cells. Tables left without rows go too.
/// Textbox and drawing paragraphs keep their place and lose only the tokens.
pub fn prune_empty(tree: &mut DocumentTree) -> Pruned {
    let mut pruned = Pruned::default();
    for part in tree.parts_mut() {
        let name = part.name.clone();
        let Some(container) = part.block_container_mut() else {
            continue;
        };
        let before = pruned;
        prune_blocks(container, &mut pruned);
        if pruned != before {
            debug!(part = %name, ?pruned, "pruned unresolved segment blocks");
        }
    }
    pruned.raw = blank_raw_matches(tree, &SEGMENT_TOKEN_RE);
    if pruned != Pruned::default() {
        info!(
            paragraphs = pruned.paragraphs,
            rows = pruned.rows,
            tables = pruned.tables,
            raw = pruned.raw,
            "removed blocks with unresolved segment placeholders"
        );
    }
    pruned
}

fn prune_blocks(container: &mut XmlElement, pruned: &mut Pruned) {
    container.children.retain_mut(|node| {
        let XmlNode::Element(el) = node else {
            return true;
        };
        if el.name == "w:p" {
            if has_segment_token(&paragraph_text(el)) {
                pruned.paragraphs += 1;
                return false;
            }
        } else if el.name == "w:tbl" {
            prune_rows(el, pruned);
            if !el.elements().any(|e| e.name == "w:tr") {
                pruned.tables += 1;
                return false;
            }
        } else if el.name == "w:sdt" {
            if let Some(content) = el.child_mut("w:sdtContent") {
                prune_blocks(content, pruned);
            }
        }
        true
    });
}

fn prune_rows(table: &mut XmlElement, pruned: &mut Pruned) {
    table.children.retain(|node| {
        let XmlNode::Element(row) = node else {
            return true;
        };
        if row.name != "w:tr" {
            return true;
        }
        let stale = row
            .elements()
            .filter(|c| c.name == "w:tc")
            .any(|cell| has_segment_token(&container_text(cell)));
        if stale {
            pruned.rows += 1;
        }
        !stale
    });
}
