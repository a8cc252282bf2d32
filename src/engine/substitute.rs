use tracing::{debug, warn};

use crate::docx::document::{visit_paragraphs_mut, DocumentTree};
use crate::docx::text::{collapse_into_first, paragraph_text};
use crate::error::Warning;

/// Result of one substitution call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Substitution {
    pub matched: bool,
    pub occurrences: usize,
    pub warnings: Vec<Warning>,
}

/// Replaces every occurrence of `token` in the structural paragraphs of all
/// parts (body, table cells, headers, footers) with `value`.
///
/// Matching runs on the paragraph's concatenated run text, so a token split
/// over several runs is still found. A matching paragraph's new text goes to
/// its first run; the other runs are emptied. An absent token yields a
/// `PlaceholderUnresolved` warning.
pub fn substitute(tree: &mut DocumentTree, token: &str, value: &str) -> Substitution {
    let mut out = Substitution::default();
    if token.is_empty() {
        return out;
    }
    for part in tree.parts_mut() {
        let part_name = part.name.clone();
        let Some(container) = part.block_container_mut() else {
            continue;
        };
        visit_paragraphs_mut(container, &mut |p| {
            let text = paragraph_text(p);
            let count = text.matches(token).count();
            if count == 0 {
                return;
            }
            let replaced = text.replace(token, value);
            if collapse_into_first(p, &replaced) {
                debug!(part = %part_name, token, "replaced in paragraph");
                out.occurrences += count;
            }
        });
    }
    out.matched = out.occurrences > 0;
    if !out.matched {
        warn!(token, "no occurrences found in the document for replacement");
        out.warnings.push(Warning::PlaceholderUnresolved {
            token: token.to_string(),
        });
    }
    out
}
