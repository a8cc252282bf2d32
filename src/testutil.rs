//! In-memory DOCX fixtures for unit tests.

use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const NAMESPACES: &str = concat!(
    r#"xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main" "#,
    r#"xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships" "#,
    r#"xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" "#,
    r#"xmlns:wp="http://schemas.openxmlformats.org/drawingml/2006/wordprocessingDrawing" "#,
    r#"xmlns:wps="http://schemas.microsoft.com/office/word/2010/wordprocessingShape" "#,
    r#"xmlns:mc="http://schemas.openxmlformats.org/markup-compatibility/2006" "#,
    r#"xmlns:v="urn:schemas-microsoft-com:vml""#,
);

const DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;

pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// A paragraph with a single run.
pub fn para(text: &str) -> String {
    runs(&[text])
}

/// A paragraph whose text is split over one run per fragment.
pub fn runs(fragments: &[&str]) -> String {
    let mut out = String::from("<w:p>");
    for f in fragments {
        out.push_str(&format!(
            r#"<w:r><w:rPr><w:b/></w:rPr><w:t xml:space="preserve">{}</w:t></w:r>"#,
            escape(f)
        ));
    }
    out.push_str("</w:p>");
    out
}

pub fn table(rows: &[&[&str]]) -> String {
    let mut out = String::from("<w:tbl><w:tblPr/>");
    for row in rows {
        out.push_str("<w:tr>");
        for cell in row.iter() {
            out.push_str(&format!("<w:tc><w:tcPr/>{}</w:tc>", para(cell)));
        }
        out.push_str("</w:tr>");
    }
    out.push_str("</w:tbl>");
    out
}

/// A paragraph carrying a DrawingML textbox with the given paragraphs.
pub fn textbox(paragraphs: &[String]) -> String {
    format!(
        "<w:p><w:r><mc:AlternateContent><mc:Choice Requires=\"wps\"><w:drawing><wp:anchor><wps:wsp><wps:txbx><w:txbxContent>{}</w:txbxContent></wps:txbx></wps:wsp></wp:anchor></w:drawing></mc:Choice></mc:AlternateContent></w:r></w:p>",
        paragraphs.concat()
    )
}

pub struct DocxBuilder {
    body: Option<String>,
    headers: Vec<String>,
    footers: Vec<String>,
}

impl DocxBuilder {
    pub fn new() -> Self {
        Self {
            body: Some(String::new()),
            headers: Vec::new(),
            footers: Vec::new(),
        }
    }

    pub fn body(mut self, xml: &str) -> Self {
        self.body = Some(xml.to_string());
        self
    }

    pub fn without_body(mut self) -> Self {
        self.body = None;
        self
    }

    pub fn header(mut self, xml: &str) -> Self {
        self.headers.push(xml.to_string());
        self
    }

    pub fn footer(mut self, xml: &str) -> Self {
        self.footers.push(xml.to_string());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut zout = ZipWriter::new(Cursor::new(Vec::new()));
        let mut put = |name: &str, data: &str| {
            let opts =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            zout.start_file(name, opts).expect("start file");
            zout.write_all(data.as_bytes()).expect("write file");
        };

        put(
            "[Content_Types].xml",
            &format!(
                r#"{DECL}<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="xml" ContentType="application/xml"/></Types>"#
            ),
        );
        put(
            "_rels/.rels",
            &format!(
                r#"{DECL}<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/></Relationships>"#
            ),
        );
        if let Some(body) = &self.body {
            put(
                "word/document.xml",
                &format!(
                    r#"{DECL}<w:document {NAMESPACES}><w:body>{body}<w:sectPr/></w:body></w:document>"#
                ),
            );
        }
        for (i, h) in self.headers.iter().enumerate() {
            put(
                &format!("word/header{}.xml", i + 1),
                &format!("{DECL}<w:hdr {NAMESPACES}>{h}</w:hdr>"),
            );
        }
        for (i, f) in self.footers.iter().enumerate() {
            put(
                &format!("word/footer{}.xml", i + 1),
                &format!("{DECL}<w:ftr {NAMESPACES}>{f}</w:ftr>"),
            );
        }
        zout.finish().expect("finish zip").into_inner()
    }
}

/// A report template using every token of the closed vocabulary.
/// `scope_token` is `{{region}}` or `{{country}}`.
pub fn report_template(scope_token: &str) -> Vec<u8> {
    let mut body = vec![
        para("{{market_name}} Market Report"),
        para(&format!("Scope: {scope_token}")),
        r#"<w:p><w:r><w:fldChar w:fldCharType="begin"/></w:r><w:r><w:instrText xml:space="preserve"> TOC \o "1-3" \h </w:instrText></w:r><w:r><w:fldChar w:fldCharType="separate"/></w:r><w:r><w:t>Contents</w:t></w:r><w:r><w:fldChar w:fldCharType="end"/></w:r></w:p>"#.to_string(),
    ];
    for n in 1..=6 {
        body.push(para(&format!("{{{{Segment{n}_Start}}}}")));
        let label = format!("Segment {n}: ");
        let tail = format!("ment{n}}}}}");
        body.push(runs(&[label.as_str(), "{{Seg", tail.as_str()]));
        body.push(para(&format!("{{{{Segment{n}Sub-segment1}}}}")));
        body.push(para(&format!("{{{{Segment{n}Sub-segment2}}}}")));
        body.push(para(&format!("{{{{Segment{n}_End}}}}")));
    }
    body.push(table(&[
        &["Segment", "Leading sub-segment"],
        &["{{Segment1}}", "{{Segment1Sub-segment1}}"],
        &["{{Segment2}}", "{{Segment2Sub-segment1}}"],
        &["{{Segment3}}", "{{Segment3Sub-segment1}}"],
    ]));
    for i in 1..=10 {
        body.push(para(&format!("Company: {{{{Company{i}}}}}")));
    }
    body.push(textbox(&[
        para(&format!("{{{{market_name}}}} in {scope_token}")),
        para("{{Segment1}}: {{Segment1Sub-segment1}}"),
        para("{{Segment6}}{{Segment6_End}}"),
        para("Top: {{Company1}}{{Company9}}"),
    ]));
    let scope_alias = scope_token.replace("{{", "{ {").replace("}}", "} }");
    let header = textbox(&[runs(&["{{market", "_name}} ", "Market"]), para(&scope_alias)]);
    DocxBuilder::new()
        .body(&body.concat())
        .header(&header)
        .footer(&para("Confidential"))
        .build()
}

/// Every `w:t`/`a:t` text of a part in document order, joined by `|`.
pub fn part_text(docx: &[u8], part: &str) -> String {
    use crate::docx::package::DocxPackage;
    use crate::docx::xml::{parse_xml_part, XmlEvent};

    let pkg = DocxPackage::from_bytes(docx).expect("package");
    let ent = pkg.entry(part).expect("part");
    let xml = parse_xml_part(part, &ent.data).expect("xml");
    let mut out = Vec::new();
    let mut in_text = false;
    for ev in &xml.events {
        match ev {
            XmlEvent::Start { name, .. } if name == "w:t" || name == "a:t" => in_text = true,
            XmlEvent::End { name } if name == "w:t" || name == "a:t" => in_text = false,
            XmlEvent::Text { text } if in_text && !text.is_empty() => out.push(text.clone()),
            _ => {}
        }
    }
    out.join("|")
}

pub fn part_xml(docx: &[u8], part: &str) -> String {
    let pkg = crate::docx::package::DocxPackage::from_bytes(docx).expect("package");
    String::from_utf8(pkg.entry(part).expect("part").data.clone()).expect("utf8")
}
