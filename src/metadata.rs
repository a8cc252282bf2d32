//! Write-only sink for records about generated documents and bulk jobs.
//!
//! Writes are fire-and-forget from the synthesizer's point of view: a failed
//! write is logged and never fails the document it describes.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::RowStatus;
use crate::record::{FlatRecord, TemplateClass};

/// An already-authenticated caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub username: String,
    pub role: String,
}

impl Default for UserIdentity {
    fn default() -> Self {
        Self {
            id: "local".to_string(),
            username: "local".to_string(),
            role: "user".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationType {
    Single,
    Bulk,
}

#[derive(Clone, Debug, Serialize)]
pub struct DocumentRecord {
    pub user_id: String,
    pub input_data: FlatRecord,
    pub filename: String,
    pub template_class: TemplateClass,
    pub generation_type: GenerationType,
    pub created_at: DateTime<Utc>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulk_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct BulkJobRecord {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub total_files: usize,
    pub successful_files: usize,
    pub failed_files: usize,
}

impl BulkJobRecord {
    pub fn started(user: &UserIdentity) -> Self {
        Self {
            user_id: user.id.clone(),
            created_at: Utc::now(),
            status: JobStatus::Processing,
            total_files: 0,
            successful_files: 0,
            failed_files: 0,
        }
    }
}

/// One processed row of a bulk job.
#[derive(Clone, Debug, Serialize)]
pub struct FileEntry {
    pub filename: String,
    pub status: RowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BulkJobUpdate {
    /// Increments `total_files` and the success or failure count.
    File(FileEntry),
    Finished {
        status: JobStatus,
        completed_at: DateTime<Utc>,
    },
}

pub trait MetadataStore: Send + Sync {
    fn record_document(&self, record: &DocumentRecord) -> anyhow::Result<String>;
    fn record_bulk_job(&self, job: &BulkJobRecord) -> anyhow::Result<String>;
    fn update_bulk_job(&self, job_id: &str, update: &BulkJobUpdate) -> anyhow::Result<()>;
}

/// Discards every record and hands out fresh ids.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullStore;

impl MetadataStore for NullStore {
    fn record_document(&self, _record: &DocumentRecord) -> anyhow::Result<String> {
        Ok(Uuid::new_v4().to_string())
    }

    fn record_bulk_job(&self, _job: &BulkJobRecord) -> anyhow::Result<String> {
        Ok(Uuid::new_v4().to_string())
    }

    fn update_bulk_job(&self, _job_id: &str, _update: &BulkJobUpdate) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct Line<'a, T: Serialize> {
    kind: &'static str,
    id: &'a str,
    logged_at: DateTime<Utc>,
    #[serde(flatten)]
    body: &'a T,
}

/// Appends one JSON object per write to a log file.
#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create metadata dir: {}", dir.display()))?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    fn append<T: Serialize>(&self, kind: &'static str, id: &str, body: &T) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&Line {
            kind,
            id,
            logged_at: Utc::now(),
            body,
        })
        .context("serialize metadata record")?;
        line.push(b'\n');

        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("metadata log lock poisoned"))?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open metadata log: {}", self.path.display()))?;
        f.write_all(&line)
            .with_context(|| format!("write metadata log: {}", self.path.display()))?;
        Ok(())
    }
}

impl MetadataStore for JsonlStore {
    fn record_document(&self, record: &DocumentRecord) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        self.append("document", &id, record)?;
        Ok(id)
    }

    fn record_bulk_job(&self, job: &BulkJobRecord) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        self.append("bulk_job", &id, job)?;
        Ok(id)
    }

    fn update_bulk_job(&self, job_id: &str, update: &BulkJobUpdate) -> anyhow::Result<()> {
        self.append("bulk_job_update", job_id, update)
    }
}

/// Keeps every write in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub documents: Mutex<Vec<DocumentRecord>>,
    pub jobs: Mutex<Vec<BulkJobRecord>>,
    pub updates: Mutex<Vec<(String, BulkJobUpdate)>>,
    /// When set, every write fails.
    pub failing: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing {
            return Err(anyhow!("metadata store unavailable"));
        }
        Ok(())
    }
}

fn push<T>(m: &Mutex<Vec<T>>, item: T) -> anyhow::Result<()> {
    m.lock()
        .map_err(|_| anyhow!("metadata store lock poisoned"))?
        .push(item);
    Ok(())
}

impl MetadataStore for MemoryStore {
    fn record_document(&self, record: &DocumentRecord) -> anyhow::Result<String> {
        self.check()?;
        push(&self.documents, record.clone())?;
        Ok(Uuid::new_v4().to_string())
    }

    fn record_bulk_job(&self, job: &BulkJobRecord) -> anyhow::Result<String> {
        self.check()?;
        push(&self.jobs, job.clone())?;
        Ok(Uuid::new_v4().to_string())
    }

    fn update_bulk_job(&self, job_id: &str, update: &BulkJobUpdate) -> anyhow::Result<()> {
        self.check()?;
        push(&self.updates, (job_id.to_string(), update.clone()))
    }
}
