//! One document per table row, packed into a ZIP archive.
//!
//! Rows are rendered in parallel. Archive entries, metadata updates and the
//! report are produced afterwards in row order, so the output does not depend
//! on scheduling.

use std::collections::HashSet;
use std::io::{Cursor, Write};

use anyhow::Context;
use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{BulkError, RowError};
use crate::metadata::{BulkJobRecord, BulkJobUpdate, FileEntry, GenerationType, JobStatus, UserIdentity};
use crate::record::{
    company_key, segment_key, sub_segment_key, FlatRecord, InputRecord, Scope, TemplateClass,
    MAX_COMPANIES, MAX_SEGMENTS, MAX_SUB_SEGMENTS,
};

use super::single::Synthesizer;
use super::table::{decode_table, Table};

pub const REQUIRED_COLUMNS: [&str; 2] = ["template_type", "market_name"];
pub const DEFAULT_ARCHIVE_NAME: &str = "generated_documents.zip";
pub const UNDEFINED_FILE_NAME: &str = "undefined_file.docx";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Success,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct RowOutcome {
    /// 1-based data row number (the header row is not counted).
    pub index: usize,
    pub filename: String,
    pub status: RowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkStatus {
    Completed,
    PartialFailure,
    CompleteFailure,
}

#[derive(Clone, Debug, Serialize)]
pub struct BulkReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub encoding: &'static str,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub status: BulkStatus,
    pub rows: Vec<RowOutcome>,
}

#[derive(Clone, Debug)]
pub struct BulkOutput {
    pub archive: Vec<u8>,
    pub report: BulkReport,
}

#[derive(Clone, Debug, Default)]
pub struct BulkOptions {
    /// Worker threads for row rendering; `None` uses rayon's global pool.
    pub threads: Option<usize>,
}

/// Result of rendering one row, before it is written out.
struct RowResult {
    index: usize,
    filename: String,
    outcome: Result<(InputRecord, Vec<u8>), RowError>,
}

impl Synthesizer {
    /// Synthesizes one document per row of `table` (CSV bytes).
    ///
    /// A failing row is recorded in the report and skipped. The call fails
    /// only for an unreadable table, missing required columns, or when no
    /// row succeeds.
    pub fn synthesize_bulk(
        &self,
        table: &[u8],
        user: &UserIdentity,
        opts: &BulkOptions,
    ) -> Result<BulkOutput, BulkError> {
        let table = decode_table(table)?;
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|c| !table.has_column(c))
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(BulkError::MissingColumns(missing));
        }

        let job_id = match self.metadata().record_bulk_job(&BulkJobRecord::started(user)) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "failed to store bulk job");
                None
            }
        };
        info!(job = job_id.as_deref().unwrap_or("-"), rows = table.rows.len(), "starting bulk generation");

        let results = self.render_rows(&table, user, opts)?;

        let mut zout = ZipWriter::new(Cursor::new(Vec::new()));
        let mut names = HashSet::new();
        let mut rows = Vec::with_capacity(results.len());
        let mut succeeded = 0;
        for res in results {
            let outcome = match res.outcome {
                Ok((record, bytes)) => {
                    let filename = unique_name(&mut names, &res.filename);
                    write_entry(&mut zout, &filename, &bytes).map_err(BulkError::Archive)?;
                    let document_id = self.record_document(
                        &record,
                        user,
                        &filename,
                        GenerationType::Bulk,
                        job_id.as_deref(),
                    );
                    succeeded += 1;
                    info!(row = res.index, filename = %filename, "row generated");
                    RowOutcome {
                        index: res.index,
                        filename,
                        status: RowStatus::Success,
                        error: None,
                        error_kind: None,
                        document_id,
                    }
                }
                Err(e) => {
                    error!(row = res.index, error = %e, "row failed");
                    RowOutcome {
                        index: res.index,
                        filename: res.filename,
                        status: RowStatus::Failed,
                        error: Some(e.to_string()),
                        error_kind: Some(e.kind()),
                        document_id: None,
                    }
                }
            };
            if let Some(id) = &job_id {
                self.update_job(
                    id,
                    &BulkJobUpdate::File(FileEntry {
                        filename: outcome.filename.clone(),
                        status: outcome.status,
                        error: outcome.error.clone(),
                        document_id: outcome.document_id.clone(),
                    }),
                );
            }
            rows.push(outcome);
        }

        let total = rows.len();
        let failed = total - succeeded;
        let status = if failed == 0 {
            BulkStatus::Completed
        } else if succeeded == 0 {
            BulkStatus::CompleteFailure
        } else {
            BulkStatus::PartialFailure
        };
        if let Some(id) = &job_id {
            let job_status = match status {
                BulkStatus::CompleteFailure => JobStatus::Failed,
                _ => JobStatus::Completed,
            };
            self.update_job(
                id,
                &BulkJobUpdate::Finished {
                    status: job_status,
                    completed_at: Utc::now(),
                },
            );
        }
        let report = BulkReport {
            job_id,
            encoding: table.encoding,
            total,
            succeeded,
            failed,
            status,
            rows,
        };
        info!(total, succeeded, failed, ?status, "bulk generation finished");

        if status == BulkStatus::CompleteFailure {
            return Err(BulkError::CompleteFailure(Box::new(report)));
        }
        let archive = zout
            .finish()
            .context("finish archive")
            .map_err(BulkError::Archive)?
            .into_inner();
        Ok(BulkOutput { archive, report })
    }

    fn render_rows(
        &self,
        table: &Table,
        user: &UserIdentity,
        opts: &BulkOptions,
    ) -> Result<Vec<RowResult>, BulkError> {
        let work = || -> Vec<RowResult> {
            table
                .rows
                .par_iter()
                .enumerate()
                .map(|(i, row)| self.render_row(i + 1, &row_to_flat(table, row), user))
                .collect()
        };
        match opts.threads.filter(|n| *n > 0) {
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .context("build worker pool")
                    .map_err(BulkError::Archive)?;
                Ok(pool.install(work))
            }
            None => Ok(work()),
        }
    }

    fn render_row(&self, index: usize, flat: &FlatRecord, user: &UserIdentity) -> RowResult {
        let record = match validate_row(index, flat) {
            Ok(record) => record,
            Err(e) => {
                return RowResult {
                    index,
                    filename: UNDEFINED_FILE_NAME.to_string(),
                    outcome: Err(e),
                }
            }
        };
        let filename = sanitize_file_name(&bulk_file_name(&record));
        let outcome = self
            .render(&record, user)
            .map(|r| (record, r.bytes))
            .map_err(RowError::from);
        RowResult {
            index,
            filename,
            outcome,
        }
    }

    fn update_job(&self, job_id: &str, update: &BulkJobUpdate) {
        if let Err(e) = self.metadata().update_bulk_job(job_id, update) {
            warn!(job = job_id, error = %format!("{e:#}"), "failed to update bulk job");
        }
    }
}

/// Maps the table's lowercase columns to the flat record keys. Values are
/// trimmed; blank cells are left out.
fn row_to_flat(table: &Table, row: &[String]) -> FlatRecord {
    let mut flat = FlatRecord::new();
    for (column, value) in table.cells(row) {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        if let Some(key) = column_key(column) {
            flat.insert(key, value.to_string());
        }
    }
    flat
}

fn column_key(column: &str) -> Option<String> {
    match column {
        "template_type" | "market_name" | "region" | "country" => return Some(column.to_string()),
        _ => {}
    }
    if let Some(n) = column.strip_prefix("company") {
        return index_in(n, MAX_COMPANIES).map(company_key);
    }
    let rest = column.strip_prefix("segment")?;
    match rest.split_once("_sub") {
        Some((i, j)) => {
            let i = index_in(i, MAX_SEGMENTS)?;
            let j = index_in(j, MAX_SUB_SEGMENTS)?;
            Some(sub_segment_key(i, j))
        }
        None => index_in(rest, MAX_SEGMENTS).map(segment_key),
    }
}

fn index_in(s: &str, max: usize) -> Option<usize> {
    s.parse::<usize>().ok().filter(|n| (1..=max).contains(n))
}

fn validate_row(index: usize, flat: &FlatRecord) -> Result<InputRecord, RowError> {
    let class_name = flat.get("template_type").map(String::as_str).unwrap_or("");
    let class: TemplateClass = class_name.parse().map_err(|_| {
        RowError::Validation(format!(
            "row {index}: invalid template_type {class_name:?} (expected Global, Regional or Country)"
        ))
    })?;
    let required = match class {
        TemplateClass::Regional => Some("region"),
        TemplateClass::Country => Some("country"),
        TemplateClass::Global => None,
    };
    if let Some(field) = required {
        if !flat.contains_key(field) {
            return Err(RowError::Validation(format!(
                "row {index}: {field} is required for {class} template"
            )));
        }
    }
    Ok(InputRecord::from_flat(flat)?)
}

/// Archive name of a row's document, before sanitizing.
pub fn bulk_file_name(record: &InputRecord) -> String {
    let market = record.market_name();
    match record.scope() {
        Scope::Global => format!("{market}_Global_Market.docx"),
        Scope::Regional(r) => format!("{}_{market}_Market.docx", r.label()),
        Scope::Country(c) => format!("{c}_{market}_Market.docx"),
    }
}

/// Keeps alphanumerics, spaces, `_`, `-` and `.`.
pub fn sanitize_file_name(name: &str) -> String {
    let clean: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.'))
        .collect();
    if clean.trim_matches(|c| c == '.' || c == ' ').is_empty() {
        UNDEFINED_FILE_NAME.to_string()
    } else {
        clean
    }
}

fn unique_name(taken: &mut HashSet<String>, name: &str) -> String {
    if taken.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) => (s, format!(".{e}")),
        None => (name, String::new()),
    };
    let mut n = 2;
    loop {
        let candidate = format!("{stem} ({n}){ext}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn write_entry(zout: &mut ZipWriter<Cursor<Vec<u8>>>, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
    let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zout.start_file(name, opts)
        .with_context(|| format!("zip start_file: {name}"))?;
    zout.write_all(bytes)
        .with_context(|| format!("zip write: {name}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{column_key, sanitize_file_name, unique_name, BulkOptions, BulkStatus, RowStatus};
    use crate::docx::package::DocxPackage;
    use crate::error::BulkError;
    use crate::metadata::{BulkJobUpdate, GenerationType, JobStatus, MemoryStore, UserIdentity};
    use crate::pipeline::Synthesizer;
    use crate::record::{Region, TemplateClass};
    use crate::template::{resolve, MemoryTemplateStore};
    use crate::testutil::{part_text, report_template};

    fn synthesizer(meta: Arc<MemoryStore>) -> Synthesizer {
        let mut store = MemoryTemplateStore::new();
        store.insert(
            resolve(TemplateClass::Global, None).expect("asset"),
            report_template("{{region}}"),
        );
        store.insert(
            resolve(TemplateClass::Country, None).expect("asset"),
            report_template("{{country}}"),
        );
        store.insert(
            resolve(TemplateClass::Regional, Some(Region::Europe)).expect("asset"),
            report_template("{{region}}"),
        );
        Synthesizer::new(Arc::new(store), meta)
    }

    fn entry_names(archive: &[u8]) -> Vec<String> {
        DocxPackage::from_bytes(archive)
            .expect("archive")
            .entries
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    const FIVE_ROWS: &str = "template_type,market_name,region,country,segment1,segment1_sub1,company1\n\
Global,Drones,,,Consumer,Hobby,Acme\n\
Regional,Drones,Europe,,,,\n\
Regional,Robots,,,,,\n\
Country,Drones,,India,Military,,\n\
Global, Sensors ,,,,,\n";

    #[test]
    fn failing_row_does_not_stop_the_batch() {
        let meta = Arc::new(MemoryStore::new());
        let synth = synthesizer(meta.clone());
        let out = synth
            .synthesize_bulk(FIVE_ROWS.as_bytes(), &UserIdentity::default(), &BulkOptions::default())
            .expect("bulk");

        let report = &out.report;
        assert_eq!((report.total, report.succeeded, report.failed), (5, 4, 1));
        assert_eq!(report.status, BulkStatus::PartialFailure);
        let failed = &report.rows[2];
        assert_eq!(failed.index, 3);
        assert_eq!(failed.status, RowStatus::Failed);
        assert_eq!(failed.error_kind, Some("RowValidationError"));
        assert_eq!(failed.filename, "undefined_file.docx");
        assert!(failed.error.as_deref().unwrap_or("").contains("row 3"));

        assert_eq!(
            entry_names(&out.archive),
            vec![
                "Drones_Global_Market.docx",
                "Europe_Drones_Market.docx",
                "India_Drones_Market.docx",
                "Sensors_Global_Market.docx",
            ]
        );
        let indices: Vec<usize> = report.rows.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);

        let pkg = DocxPackage::from_bytes(&out.archive).expect("archive");
        let first = &pkg.entry("Drones_Global_Market.docx").expect("entry").data;
        let body = part_text(first, "word/document.xml");
        assert!(body.contains("Segment 1: Consumer|Hobby"), "{body}");
        assert!(body.contains("Company: Acme"), "{body}");

        let docs = meta.documents.lock().expect("lock");
        assert_eq!(docs.len(), 4);
        assert!(docs.iter().all(|d| d.generation_type == GenerationType::Bulk));
        assert!(docs.iter().all(|d| d.bulk_id == report.job_id));
        let updates = meta.updates.lock().expect("lock");
        assert_eq!(updates.len(), 6);
        assert!(matches!(
            updates.last().map(|(_, u)| u),
            Some(BulkJobUpdate::Finished {
                status: JobStatus::Completed,
                ..
            })
        ));
    }

    #[test]
    fn windows_1252_table_matches_utf8_table() {
        let synth = synthesizer(Arc::new(MemoryStore::new()));
        let utf8 = "template_type,market_name\nGlobal,Café\n";
        let cp1252 = b"template_type,market_name\nGlobal,Caf\xe9\n";
        let a = synth
            .synthesize_bulk(utf8.as_bytes(), &UserIdentity::default(), &BulkOptions::default())
            .expect("utf8");
        let b = synth
            .synthesize_bulk(cp1252, &UserIdentity::default(), &BulkOptions { threads: Some(2) })
            .expect("cp1252");
        assert_eq!(b.report.encoding, "windows-1252");
        assert_eq!(entry_names(&a.archive), vec!["Café_Global_Market.docx"]);
        assert_eq!(entry_names(&a.archive), entry_names(&b.archive));

        let pkg = DocxPackage::from_bytes(&b.archive).expect("archive");
        let doc = &pkg.entry("Café_Global_Market.docx").expect("entry").data;
        assert!(part_text(doc, "word/document.xml").starts_with("Café Market Report"));
    }

    #[test]
    fn missing_required_column_fails_the_job() {
        let synth = synthesizer(Arc::new(MemoryStore::new()));
        let err = synth
            .synthesize_bulk(b"template_type,region\nGlobal,\n", &UserIdentity::default(), &BulkOptions::default())
            .unwrap_err();
        assert!(matches!(err, BulkError::MissingColumns(cols) if cols == vec!["market_name"]));
    }

    #[test]
    fn all_rows_failing_is_a_complete_failure() {
        let meta = Arc::new(MemoryStore::new());
        let synth = synthesizer(meta.clone());
        let err = synth
            .synthesize_bulk(
                b"template_type,market_name\nPlanetary,Drones\nCountry,Drones\n",
                &UserIdentity::default(),
                &BulkOptions::default(),
            )
            .unwrap_err();
        let BulkError::CompleteFailure(report) = err else {
            panic!("expected complete failure");
        };
        assert_eq!(report.failed, 2);
        assert_eq!(report.status, BulkStatus::CompleteFailure);
        assert!(report.rows[0].error.as_deref().unwrap_or("").contains("Planetary"));
        let updates = meta.updates.lock().expect("lock");
        assert!(matches!(
            updates.last().map(|(_, u)| u),
            Some(BulkJobUpdate::Finished {
                status: JobStatus::Failed,
                ..
            })
        ));
    }

    #[test]
    fn empty_table_yields_empty_archive() {
        let synth = synthesizer(Arc::new(MemoryStore::new()));
        let out = synth
            .synthesize_bulk(b"template_type,market_name\n", &UserIdentity::default(), &BulkOptions::default())
            .expect("bulk");
        assert_eq!(out.report.status, BulkStatus::Completed);
        assert!(entry_names(&out.archive).is_empty());
    }

    #[test]
    fn duplicate_names_get_a_counter() {
        let synth = synthesizer(Arc::new(MemoryStore::new()));
        let out = synth
            .synthesize_bulk(
                b"template_type,market_name\nGlobal,Drones\nGlobal,Drones\nGlobal,Drones\n",
                &UserIdentity::default(),
                &BulkOptions::default(),
            )
            .expect("bulk");
        assert_eq!(
            entry_names(&out.archive),
            vec![
                "Drones_Global_Market.docx",
                "Drones_Global_Market (2).docx",
                "Drones_Global_Market (3).docx",
            ]
        );
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(
            sanitize_file_name("Middle East & Africa_Drones/UAV_Market.docx"),
            "Middle East  Africa_DronesUAV_Market.docx"
        );
        assert_eq!(sanitize_file_name("//"), "undefined_file.docx");
        let mut taken = std::collections::HashSet::new();
        assert_eq!(unique_name(&mut taken, "a"), "a");
        assert_eq!(unique_name(&mut taken, "a"), "a (2)");
    }

    #[test]
    fn columns_map_to_record_keys() {
        assert_eq!(column_key("segment2").as_deref(), Some("Segment2"));
        assert_eq!(column_key("segment2_sub10").as_deref(), Some("Segment2Sub-segment10"));
        assert_eq!(column_key("company10").as_deref(), Some("Company10"));
        assert_eq!(column_key("segment7"), None);
        assert_eq!(column_key("notes"), None);
    }
}
