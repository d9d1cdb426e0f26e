//! Core data models shared by the download, search, and context stages.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Dimension agreed on by the embedding model and the stored vectors.
pub const EMBEDDING_DIM: usize = 384;

/// Snapshot of the local artifact file. Recomputed on every check.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactStatus {
    pub exists: bool,
    pub size_bytes: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
    /// `None` when the file does not exist and validation was not attempted.
    pub is_valid: Option<bool>,
    pub local_path: PathBuf,
    pub file_name: String,
}

/// Progress of one transfer, recomputed on every progress tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DownloadProgress {
    pub bytes_written: u64,
    pub bytes_expected: Option<u64>,
    pub speed_bytes_per_sec: Option<f64>,
    pub eta_seconds: Option<f64>,
}

impl DownloadProgress {
    /// Completed fraction in `[0, 1]`, when the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_expected {
            Some(0) | None => None,
            Some(total) => Some((self.bytes_written as f64 / total as f64).min(1.0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Idle,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl DownloadState {
    /// States in which no transfer task is alive.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            DownloadState::Idle
                | DownloadState::Completed
                | DownloadState::Cancelled
                | DownloadState::Error
        )
    }
}

/// Record kind, used both for stored rows and for citations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Document,
    Qa,
}

impl RecordKind {
    pub fn table(self) -> &'static str {
        match self {
            RecordKind::Document => "documents",
            RecordKind::Qa => "medical_qa",
        }
    }
}

/// A medical reference document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub url: Option<String>,
    pub year: Option<i64>,
    pub specialty: Option<String>,
}

/// A question/answer pair derived from a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QaPair {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub document_id: Option<String>,
}

/// A stored row. The embedding lives in the store and is not carried here.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VectorRecord {
    Document(Document),
    Qa(QaPair),
}

impl VectorRecord {
    pub fn id(&self) -> &str {
        match self {
            VectorRecord::Document(d) => &d.id,
            VectorRecord::Qa(q) => &q.id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            VectorRecord::Document(_) => RecordKind::Document,
            VectorRecord::Qa(_) => RecordKind::Qa,
        }
    }
}

/// A record with its cosine similarity to the query, in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub record: VectorRecord,
    pub similarity: f32,
}

/// Equality filters applied to both the index and the full scan.
///
/// For Q&A rows the filters match the owning document's attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub specialty: Option<String>,
    pub year: Option<i64>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.specialty.is_none() && self.year.is_none()
    }

    pub fn matches(&self, specialty: Option<&str>, year: Option<i64>) -> bool {
        if let Some(ref wanted) = self.specialty {
            if specialty != Some(wanted.as_str()) {
                return false;
            }
        }
        if let Some(wanted) = self.year {
            if year != Some(wanted) {
                return false;
            }
        }
        true
    }
}

/// Citation-facing projection of a stored record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: String,
    pub title: String,
    pub excerpt: String,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub similarity: Option<f32>,
    pub url: Option<String>,
    pub year: Option<i64>,
    pub specialty: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    /// Quality results were found and assembled.
    Answered,
    /// Nothing failed, but nothing relevant was found.
    NoResults,
    /// Embedding, search, or lookup failed.
    Failed,
}

/// Prompt-ready context for one query. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagContext {
    pub text: String,
    pub sources: Vec<Source>,
    pub success: bool,
    pub error: Option<String>,
    pub status: ContextStatus,
    /// Set when `text` was cut to the length limit; the text then ends
    /// with the truncation marker.
    pub truncated: bool,
}

impl RagContext {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            sources: Vec::new(),
            success: false,
            error: Some(error.into()),
            status: ContextStatus::Failed,
            truncated: false,
        }
    }
}
