//! Paragraph-level text access shared by the structural and raw engines.
//!
//! A paragraph's text is the concatenation of its own run text elements
//! (`w:t` for WordprocessingML, `a:t` for DrawingML). Content anchored inside
//! the paragraph but owned by another text flow (textboxes, drawings,
//! alternate content, embedded objects) is not part of it.

use super::tree::XmlElement;

const OPAQUE: &[&str] = &[
    "w:p",
    "a:p",
    "w:txbxContent",
    "w:drawing",
    "w:pict",
    "w:object",
    "mc:AlternateContent",
];

fn is_text_element(name: &str) -> bool {
    name == "w:t" || name == "a:t"
}

fn collect<'a>(el: &'a XmlElement, out: &mut Vec<&'a XmlElement>) {
    for c in el.elements() {
        if is_text_element(&c.name) {
            out.push(c);
        } else if !OPAQUE.contains(&c.name.as_str()) {
            collect(c, out);
        }
    }
}

fn collect_mut<'a>(el: &'a mut XmlElement, out: &mut Vec<&'a mut XmlElement>) {
    for c in el.elements_mut() {
        if is_text_element(&c.name) {
            out.push(c);
        } else if !OPAQUE.contains(&c.name.as_str()) {
            collect_mut(c, out);
        }
    }
}

/// Text fragments of a paragraph, in reading order.
pub fn fragments(paragraph: &XmlElement) -> Vec<String> {
    let mut elems = Vec::new();
    collect(paragraph, &mut elems);
    elems.iter().map(|e| e.text()).collect()
}

pub fn paragraph_text(paragraph: &XmlElement) -> String {
    fragments(paragraph).concat()
}

/// Writes `text` into the paragraph's first text fragment and blanks every
/// other fragment. Returns false when the paragraph has no text fragment to
/// hold the result.
pub fn collapse_into_first(paragraph: &mut XmlElement, text: &str) -> bool {
    let mut elems = Vec::new();
    collect_mut(paragraph, &mut elems);
    let mut iter = elems.into_iter();
    let Some(first) = iter.next() else {
        return false;
    };
    first.set_text(text);
    if first.name == "w:t" && (text.starts_with(char::is_whitespace) || text.ends_with(char::is_whitespace)) {
        first.set_attr("xml:space", "preserve");
    }
    for rest in iter {
        rest.set_text("");
    }
    true
}

/// Text of a table cell or any other container: every structural paragraph's
/// text joined by newlines.
pub fn container_text(container: &XmlElement) -> String {
    let mut parts = Vec::new();
    super::document::visit_paragraphs(container, &mut |p| parts.push(paragraph_text(p)));
    parts.join("\n")
}
