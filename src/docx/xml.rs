use anyhow::Context;
use quick_xml::events::{BytesDecl, BytesStart, Event};
use quick_xml::Reader;
use sha2::{Digest, Sha256};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XmlEvent {
    Decl {
        version: String,
        encoding: Option<String>,
        standalone: Option<String>,
    },
    Start {
        name: String,
        attrs: Vec<(String, String)>,
    },
    End {
        name: String,
    },
    Empty {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Text {
        text: String,
    },
    CData {
        text: String,
    },
    Comment {
        text: String,
    },
    PI {
        content: String,
    },
    DocType {
        text: String,
    },
}

/// One XML part of a package as a flat, lossless event stream.
#[derive(Clone, Debug)]
pub struct XmlPart {
    pub name: String,
    pub events: Vec<XmlEvent>,
}

pub fn parse_xml_part(name: &str, xml_bytes: &[u8]) -> anyhow::Result<XmlPart> {
    let mut reader = Reader::from_reader(xml_bytes);
    reader.config_mut().trim_text(false);

    let mut events: Vec<XmlEvent> = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let ev = reader
            .read_event_into(&mut buf)
            .with_context(|| format!("read xml event in {name}"))?;
        match ev {
            Event::Eof => break,
            Event::Decl(d) => {
                let version = bytes_to_string(d.version().context("decl version")?);
                let encoding = d
                    .encoding()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                let standalone = d
                    .standalone()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                events.push(XmlEvent::Decl {
                    version,
                    encoding,
                    standalone,
                });
            }
            Event::Start(s) => {
                events.push(XmlEvent::Start {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs: collect_attrs(&s)?,
                });
            }
            Event::End(e) => {
                events.push(XmlEvent::End {
                    name: bytes_to_string(e.name().as_ref()),
                });
            }
            Event::Empty(s) => {
                events.push(XmlEvent::Empty {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs: collect_attrs(&s)?,
                });
            }
            Event::Text(t) => {
                let txt = t.unescape().context("unescape text")?.into_owned();
                events.push(XmlEvent::Text { text: txt });
            }
            Event::CData(t) => {
                events.push(XmlEvent::CData {
                    text: bytes_to_string(t.into_inner()),
                });
            }
            Event::Comment(t) => {
                events.push(XmlEvent::Comment {
                    text: bytes_to_string(t.into_inner()),
                });
            }
            Event::PI(t) => {
                let target = bytes_to_string(t.target());
                let content = bytes_to_string(t.content());
                events.push(XmlEvent::PI {
                    content: format!("{target}{content}"),
                });
            }
            Event::DocType(t) => {
                events.push(XmlEvent::DocType {
                    text: bytes_to_string(t.into_inner()),
                });
            }
        }
    }

    Ok(XmlPart {
        name: name.to_string(),
        events,
    })
}

fn collect_attrs(s: &BytesStart<'_>) -> anyhow::Result<Vec<(String, String)>> {
    let mut attrs: Vec<(String, String)> = Vec::new();
    for a in s.attributes() {
        let a = a.context("attr")?;
        // Raw (still escaped) value: VML attributes such as `o:gfxdata` carry
        // character references that must survive a round trip unchanged.
        attrs.push((
            bytes_to_string(a.key.as_ref()),
            bytes_to_string(a.value.as_ref()),
        ));
    }
    Ok(attrs)
}

fn bytes_to_string(bytes: impl AsRef<[u8]>) -> String {
    String::from_utf8_lossy(bytes.as_ref()).into_owned()
}

/// Serializes an event stream. Text is escaped; attribute values and the
/// bodies of comments, CDATA and processing instructions are written as stored.
pub fn write_events(events: &[XmlEvent]) -> anyhow::Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::with_capacity(events.len() * 16);
    for ev in events {
        match ev {
            XmlEvent::Decl {
                version,
                encoding,
                standalone,
            } => {
                let mut writer = quick_xml::Writer::new(&mut out);
                writer
                    .write_event(Event::Decl(BytesDecl::new(
                        version.as_str(),
                        encoding.as_deref(),
                        standalone.as_deref(),
                    )))
                    .context("write decl")?;
            }
            XmlEvent::Start { name, attrs } => push_tag(&mut out, name, attrs, b">"),
            XmlEvent::Empty { name, attrs } => push_tag(&mut out, name, attrs, b"/>"),
            XmlEvent::End { name } => push_wrapped(&mut out, b"</", name, b">"),
            XmlEvent::Text { text } => push_escaped(&mut out, text),
            XmlEvent::CData { text } => push_wrapped(&mut out, b"<![CDATA[", text, b"]]>"),
            XmlEvent::Comment { text } => push_wrapped(&mut out, b"<!--", text, b"-->"),
            XmlEvent::PI { content } => push_wrapped(&mut out, b"<?", content, b"?>"),
            XmlEvent::DocType { text } => push_wrapped(&mut out, b"<!DOCTYPE", text, b">"),
        }
    }
    Ok(out)
}

fn push_wrapped(out: &mut Vec<u8>, open: &[u8], body: &str, close: &[u8]) {
    out.extend_from_slice(open);
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(close);
}

fn push_tag(out: &mut Vec<u8>, name: &str, attrs: &[(String, String)], close: &[u8]) {
    out.push(b'<');
    out.extend_from_slice(name.as_bytes());
    for (k, v) in attrs {
        out.push(b' ');
        out.extend_from_slice(k.as_bytes());
        push_wrapped(out, b"=\"", v, b"\"");
    }
    out.extend_from_slice(close);
}

fn push_escaped(out: &mut Vec<u8>, text: &str) {
    let mut rest = text;
    while let Some(i) = rest.find(['&', '<', '>']) {
        out.extend_from_slice(rest[..i].as_bytes());
        out.extend_from_slice(match rest.as_bytes()[i] {
            b'&' => b"&amp;".as_slice(),
            b'<' => b"&lt;".as_slice(),
            _ => b"&gt;".as_slice(),
        });
        rest = &rest[i + 1..];
    }
    out.extend_from_slice(rest.as_bytes());
}

/// Hash of every event, text and attribute included. Two event streams with the
/// same hash serialize to the same bytes.
pub fn content_hash(events: &[XmlEvent]) -> String {
    let mut hasher = Sha256::new();
    for ev in events {
        match ev {
            XmlEvent::Start { name, attrs } => hash_start_like(&mut hasher, b"S:", name, attrs),
            XmlEvent::Empty { name, attrs } => hash_start_like(&mut hasher, b"Z:", name, attrs),
            XmlEvent::End { name } => {
                hasher.update(b"E:");
                hasher.update(name.as_bytes());
                hasher.update(b"\n");
            }
            XmlEvent::Text { text } => hash_tagged(&mut hasher, b"T:", text),
            XmlEvent::Decl {
                version,
                encoding,
                standalone,
            } => {
                hasher.update(b"D:");
                hasher.update(version.as_bytes());
                hasher.update(b"|");
                if let Some(e) = encoding.as_ref() {
                    hasher.update(e.as_bytes());
                }
                hasher.update(b"|");
                if let Some(s) = standalone.as_ref() {
                    hasher.update(s.as_bytes());
                }
                hasher.update(b"\n");
            }
            XmlEvent::CData { text } => hash_tagged(&mut hasher, b"C:", text),
            XmlEvent::Comment { text } => hash_tagged(&mut hasher, b"M:", text),
            XmlEvent::PI { content } => hash_tagged(&mut hasher, b"P:", content),
            XmlEvent::DocType { text } => hash_tagged(&mut hasher, b"Y:", text),
        }
    }
    hex::encode(hasher.finalize())
}

fn hash_tagged(hasher: &mut Sha256, tag: &[u8], text: &str) {
    hasher.update(tag);
    hasher.update((text.len() as u64).to_le_bytes());
    hasher.update(text.as_bytes());
}

fn hash_start_like(hasher: &mut Sha256, tag: &[u8], name: &str, attrs: &[(String, String)]) {
    hasher.update(tag);
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    // Attribute order is significant for byte output, so it is hashed as-is.
    for (k, v) in attrs {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b";");
    }
    hasher.update(b"\n");
}
