//! Substitution inside raw markup: textbox content and DrawingML text.
//!
//! These nodes sit below runs (`w:drawing`, `w:pict`, `mc:AlternateContent`)
//! and are not reachable as structural paragraphs. Authored templates spell
//! their tokens inconsistently here, so each canonical token is matched
//! through a set of aliases, and a best-effort pass repairs tokens whose
//! text was mangled inside the braces.

use regex::Regex;
use tracing::{debug, info, warn};

use crate::docx::document::{visit_raw_paragraphs_mut, DocumentTree};
use crate::docx::text::{collapse_into_first, paragraph_text};
use crate::error::Warning;

/// Ordered (pattern, value) pairs applied to raw paragraphs.
#[derive(Clone, Debug, Default)]
pub struct RawReplacements {
    pairs: Vec<(String, String)>,
    /// Whether mangled tokens are matched by prefix when nothing else applied.
    repair: bool,
}

impl RawReplacements {
    /// Exact tokens only, e.g. `("{{market_name}}", "Drones")`. No repair:
    /// prefixes of numbered tokens such as `{{Segment1}}` are ambiguous.
    pub fn literal<T: AsRef<str>, V: AsRef<str>>(pairs: &[(T, V)]) -> Self {
        let mut out = Self::default();
        for (token, value) in pairs {
            out.push(token.as_ref(), value.as_ref());
        }
        out
    }

    /// Canonical names (`market_name`, `region`, ...) expanded to every alias
    /// spelling, with repair of mangled tokens.
    pub fn with_aliases(names: &[(&str, &str)]) -> Self {
        let mut out = Self {
            repair: true,
            ..Self::default()
        };
        for (name, value) in names {
            for alias in aliases(name) {
                out.push(&alias, value);
            }
        }
        out
    }

    fn push(&mut self, pattern: &str, value: &str) {
        if !self.pairs.iter().any(|(p, _)| p == pattern) {
            self.pairs.push((pattern.to_string(), value.to_string()));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Spellings a canonical token is recognised by.
pub fn aliases(name: &str) -> Vec<String> {
    let bare = name.replace('_', "");
    let mut out = vec![
        format!("{{{{{name}}}}}"),
        format!("{{ {{{name}}} }}"),
        format!("{{{{{bare}}}}}"),
        format!("{{{{{}}}}}", bare.to_lowercase()),
        format!("{{{{{}}}}}", name.to_lowercase()),
    ];
    let mut seen = std::collections::HashSet::new();
    out.retain(|a| seen.insert(a.clone()));
    out
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawOutcome {
    pub matched: bool,
    pub paragraphs: usize,
    pub warnings: Vec<Warning>,
}

/// Applies `repl` to the textbox and drawing paragraphs of every part.
pub fn substitute_raw(tree: &mut DocumentTree, repl: &RawReplacements) -> RawOutcome {
    let mut out = RawOutcome::default();
    if repl.is_empty() {
        warn!("no replacement values provided");
        return out;
    }
    for part in tree.parts_mut() {
        let part_name = part.name.clone();
        let Some(root) = part.root_mut() else {
            out.warnings.push(Warning::RawPartSkipped {
                part: part_name,
                reason: "no root element".to_string(),
            });
            continue;
        };
        let before = out.paragraphs;
        visit_raw_paragraphs_mut(root, false, &mut |p| {
            let text = paragraph_text(p);
            let Some(processed) = rewrite(&text, repl) else {
                return;
            };
            if collapse_into_first(p, &processed) {
                debug!(part = %part_name, from = %text, to = %processed, "raw paragraph updated");
                out.paragraphs += 1;
            }
        });
        if out.paragraphs > before {
            info!(part = %part_name, paragraphs = out.paragraphs - before, "updated raw content");
        }
    }
    out.matched = out.paragraphs > 0;
    if !out.matched {
        debug!("no raw replacements were made");
    }
    out
}

/// New text for a raw paragraph, or `None` when nothing applies.
fn rewrite(text: &str, repl: &RawReplacements) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let mut processed = text.to_string();
    for (pattern, value) in &repl.pairs {
        if processed.contains(pattern.as_str()) {
            processed = processed.replace(pattern.as_str(), value);
        }
    }
    if repl.repair && processed == text && text.contains("{{") {
        for (pattern, value) in &repl.pairs {
            if let Some(repaired) = repair_fragment(&processed, pattern, value) {
                processed = repaired;
            }
        }
    }
    (processed != text).then_some(processed)
}

/// Deletes every match of `re` from raw paragraphs in all parts. Returns the
/// number of paragraphs changed.
pub fn blank_raw_matches(tree: &mut DocumentTree, re: &Regex) -> usize {
    let mut blanked = 0;
    for part in tree.parts_mut() {
        let Some(root) = part.root_mut() else {
            continue;
        };
        visit_raw_paragraphs_mut(root, false, &mut |p| {
            let text = paragraph_text(p);
            if re.is_match(&text) && collapse_into_first(p, &re.replace_all(&text, "")) {
                blanked += 1;
            }
        });
    }
    if blanked > 0 {
        debug!(paragraphs = blanked, pattern = re.as_str(), "blanked raw tokens");
    }
    blanked
}

/// Locates a mangled occurrence of `pattern` (e.g. `{{mar ket_name}}`) by a
/// prefix of its bare name that directly follows `{{`, and replaces the
/// span from that `{{` to the next `}}`.
fn repair_fragment(text: &str, pattern: &str, value: &str) -> Option<String> {
    if !pattern.starts_with("{{") {
        return None;
    }
    let core = pattern.trim_matches(|c| c == '{' || c == '}');
    let mut len = 3;
    while len < core.len() {
        let fragment = core.get(..len)?;
        for (start, _) in text.match_indices(fragment) {
            let head = &text[..start];
            if start >= 2 && !head.ends_with("{{") {
                continue;
            }
            let Some(close) = text[start..].find("}}") else {
                continue;
            };
            let open = head.rfind("{{").unwrap_or(0);
            let end = start + close + 2;
            debug!(pattern, fragment, "repaired fragmented placeholder");
            return Some(format!("{}{}{}", &text[..open], value, &text[end..]));
        }
        len += 3;
    }
    None
}
