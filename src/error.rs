//! Error and warning types for document synthesis.

use std::path::PathBuf;

use crate::pipeline::BulkReport;

/// Fatal errors of a single-document synthesis. None of them leaves a partial
/// artifact behind.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("template file not found: {asset} ({})", path.display())]
    TemplateNotFound { asset: String, path: PathBuf },

    /// The asset exists but could not be read.
    #[error("unable to read template {asset} ({}): {source}", path.display())]
    TemplateUnreadable {
        asset: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid template type: {0:?} (expected Global, Regional or Country)")]
    InvalidTemplateType(String),

    #[error("invalid region: {0:?} (expected one of North America, Europe, Asia Pacific, Middle East & Africa, Latin America)")]
    InvalidRegion(String),

    #[error("{field} is required for {class} template")]
    MissingScopeField { class: String, field: &'static str },

    #[error("template {asset} is corrupt: {reason}")]
    TemplateCorrupt { asset: String, reason: String },

    /// Any other failure, carrying the context of the attempt.
    #[error("document generation failed for user {user} ({template_class} template): {source:#}")]
    Internal {
        user: String,
        template_class: String,
        #[source]
        source: anyhow::Error,
    },
}

impl SynthesisError {
    pub fn corrupt(asset: &str, reason: impl std::fmt::Display) -> Self {
        Self::TemplateCorrupt {
            asset: asset.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Stable kind name, used in reports and metadata records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TemplateNotFound { .. } => "TemplateNotFound",
            Self::TemplateUnreadable { .. } => "TemplateUnreadable",
            Self::InvalidTemplateType(_) => "InvalidTemplateType",
            Self::InvalidRegion(_) => "InvalidRegion",
            Self::MissingScopeField { .. } => "MissingScopeField",
            Self::TemplateCorrupt { .. } => "TemplateCorrupt",
            Self::Internal { .. } => "Internal",
        }
    }
}

/// Failure of one bulk row. Recorded in the report; never stops the batch.
#[derive(Debug, thiserror::Error)]
pub enum RowError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
}

impl RowError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "RowValidationError",
            Self::Synthesis(e) => e.kind(),
        }
    }
}

/// Errors that end a bulk job as a whole.
#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("unable to read table: {0}")]
    UnreadableTable(String),

    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    /// Every row failed. The report lists why; there is no archive.
    #[error("failed to generate any documents ({} rows failed)", .0.failed)]
    CompleteFailure(Box<BulkReport>),

    #[error("bulk archive error: {0:#}")]
    Archive(anyhow::Error),
}

/// Non-fatal findings collected while synthesizing.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// A token was substituted but never found in the document.
    PlaceholderUnresolved { token: String },
    /// A raw part could not be patched and was left as it was.
    RawPartSkipped { part: String, reason: String },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlaceholderUnresolved { token } => {
                write!(f, "no occurrences of {token} found in the document")
            }
            Self::RawPartSkipped { part, reason } => write!(f, "skipped {part}: {reason}"),
        }
    }
}
