//! Decoding and parsing of the bulk input table (CSV with a header row).

use std::borrow::Cow;

use tracing::{debug, info};

use crate::error::BulkError;

/// A parsed table. Every row has exactly as many cells as there are headers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub encoding: &'static str,
}

impl Table {
    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }

    /// (column, value) pairs of one row.
    pub fn cells<'a>(&'a self, row: &'a [String]) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.headers
            .iter()
            .map(String::as_str)
            .zip(row.iter().map(String::as_str))
    }
}

/// Candidate decodings, in the order they are tried.
fn decodings(bytes: &[u8]) -> Vec<(&'static str, Option<Cow<'_, str>>)> {
    // A BOM-prefixed file is left to the BOM-aware decoder below.
    let strict = if bytes.starts_with(b"\xEF\xBB\xBF") {
        None
    } else {
        std::str::from_utf8(bytes).ok().map(Cow::Borrowed)
    };
    let mut out = vec![("utf-8", strict)];
    if let Some((enc, bom_len)) = encoding_rs::Encoding::for_bom(bytes) {
        let text = enc.decode_without_bom_handling_and_without_replacement(&bytes[bom_len..]);
        out.push((enc.name(), text));
    }
    out.push((
        "windows-1252",
        encoding_rs::WINDOWS_1252.decode_without_bom_handling_and_without_replacement(bytes),
    ));
    out
}

/// Decodes `bytes` with the first encoding that yields a parseable table.
pub fn decode_table(bytes: &[u8]) -> Result<Table, BulkError> {
    let mut last_err = String::from("no decodable content");
    for (encoding, text) in decodings(bytes) {
        let Some(text) = text else {
            debug!(encoding, "table is not valid in this encoding");
            continue;
        };
        match parse_table(&text) {
            Ok((headers, rows)) => {
                info!(encoding, rows = rows.len(), "read input table");
                return Ok(Table {
                    headers,
                    rows,
                    encoding,
                });
            }
            Err(e) => {
                debug!(encoding, error = %e, "table did not parse");
                last_err = format!("{encoding}: {e}");
            }
        }
    }
    Err(BulkError::UnreadableTable(last_err))
}

fn parse_table(text: &str) -> Result<(Vec<String>, Vec<Vec<String>>), String> {
    let mut records = parse_csv(text)?.into_iter();
    let headers: Vec<String> = records
        .next()
        .ok_or_else(|| "missing header row".to_string())?
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut rows = Vec::new();
    for (i, mut row) in records.enumerate() {
        if row.len() > headers.len() {
            return Err(format!(
                "row {} has {} fields, header has {}",
                i + 1,
                row.len(),
                headers.len()
            ));
        }
        row.resize(headers.len(), String::new());
        rows.push(row);
    }
    Ok((headers, rows))
}

/// RFC 4180 records. Quoted fields may hold separators, doubled quotes and
/// line breaks, and must end at a separator or line break; blank lines are
/// skipped.
fn parse_csv(text: &str) -> Result<Vec<Vec<String>>, String> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    fn end_record(records: &mut Vec<Vec<String>>, record: &mut Vec<String>, field: &mut String, quoted: bool) {
        record.push(std::mem::take(field));
        let row = std::mem::take(record);
        let blank = row.len() == 1 && row[0].is_empty() && !quoted;
        if !blank {
            records.push(row);
        }
    }

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }
        match c {
            '"' if field.is_empty() && !quoted => {
                in_quotes = true;
                quoted = true;
            }
            ',' => {
                record.push(std::mem::take(&mut field));
                quoted = false;
            }
            '\r' | '\n' => {
                if c == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                end_record(&mut records, &mut record, &mut field, quoted);
                quoted = false;
            }
            _ if quoted => {
                return Err(format!(
                    "unexpected {c:?} after closing quote in record {}",
                    records.len() + 1
                ));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    if !field.is_empty() || !record.is_empty() || quoted {
        end_record(&mut records, &mut record, &mut field, quoted);
    }
    Ok(records)
}
