//! Data model shared by the pipeline stages, plus the serialisable
//! report and failure payload handed back to callers.
//!
//! A document moves through three shapes:
//!
//! ```text
//! InputDocument ──▶ ConversionJob ──(worker)──▶ JobRecord { JobOutcome }
//!  (extracted)       (queued)                    (Success(OutputDocument) | Failure(JobError))
//! ```
//!
//! [`ConversionJob::complete`] consumes the job, so an outcome can only be
//! recorded once and only by whoever owns the job (the worker that claimed it).

use crate::error::{BatchError, JobError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// A document materialised from the inbound archive into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDocument {
    /// Position among eligible entries, in archive order. Identity for matching outcomes.
    pub id: usize,
    /// Entry name as declared in the archive. Used for filtering and naming only.
    pub name: String,
    /// Sandbox-local absolute path of the extracted file.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// A successfully converted document waiting to be packaged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDocument {
    /// Entry name in the outbound archive.
    pub name: String,
    /// Archive name of the input it was converted from.
    pub source: String,
    /// Sandbox-local absolute path of the converted file.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// The outcome of one conversion job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success(OutputDocument),
    Failure(JobError),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success(_))
    }
}

/// One unit of work: convert `input` into `output_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionJob {
    pub input: InputDocument,
    /// Where the converter must write its result (inside the sandbox).
    pub output_path: PathBuf,
    /// Proposed entry name in the outbound archive (may be disambiguated later).
    pub entry_name: String,
}

impl ConversionJob {
    /// Record the job's outcome. Consumes the job so it happens exactly once.
    pub fn complete(self, outcome: JobOutcome, duration_ms: u64) -> JobRecord {
        JobRecord {
            input: self.input,
            outcome,
            duration_ms,
        }
    }
}

/// A finished job: its input identity and what happened to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub input: InputDocument,
    pub outcome: JobOutcome,
    pub duration_ms: u64,
}

/// Every outcome the worker pool produced for one request.
///
/// `records.len() + cancelled.len() == total`: a job that was never run is
/// listed in `cancelled`, never silently dropped. Record order is
/// completion order, not archive order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub total: usize,
    pub records: Vec<JobRecord>,
    pub cancelled: Vec<InputDocument>,
    /// The request deadline (or an external cancellation) cut the batch short.
    pub interrupted: bool,
    /// Number of workers the pool started.
    pub workers: usize,
}

impl BatchOutcome {
    pub fn successes(&self) -> impl Iterator<Item = &OutputDocument> {
        self.records.iter().filter_map(|r| match &r.outcome {
            JobOutcome::Success(doc) => Some(doc),
            JobOutcome::Failure(_) => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobError> {
        self.records.iter().filter_map(|r| match &r.outcome {
            JobOutcome::Success(_) => None,
            JobOutcome::Failure(err) => Some(err),
        })
    }

    /// Whether every input is accounted for exactly once.
    pub fn is_accounted(&self) -> bool {
        let mut ids: Vec<usize> = self
            .records
            .iter()
            .map(|r| r.input.id)
            .chain(self.cancelled.iter().map(|d| d.id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len() == self.total && self.records.len() + self.cancelled.len() == self.total
    }
}

// ── Caller-facing report ─────────────────────────────────────────────────

/// A converted document as listed in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertedEntry {
    /// Entry name inside the output archive.
    pub entry: String,
    /// Archive name of the source document.
    pub source: String,
    pub bytes: u64,
}

/// A failed document as listed in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDocument {
    pub document: String,
    pub error: String,
    pub detail: JobError,
}

impl From<&JobError> for FailedDocument {
    fn from(err: &JobError) -> Self {
        Self {
            document: err.document().to_string(),
            error: err.to_string(),
            detail: err.clone(),
        }
    }
}

/// Timing and size figures for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub input_bytes: usize,
    pub output_bytes: usize,
    pub workers: usize,
    pub extract_duration_ms: u64,
    pub convert_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Metadata returned alongside the output archive.
///
/// Failures and cancellations are surfaced here instead of failing the
/// whole response when at least one document converted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub request_id: Uuid,
    pub total_documents: usize,
    pub converted: Vec<ConvertedEntry>,
    pub failed: Vec<FailedDocument>,
    pub cancelled: Vec<String>,
    pub deadline_exceeded: bool,
    pub stats: BatchStats,
}

impl BatchReport {
    /// At least one success and at least one failure or cancellation.
    pub fn is_partial(&self) -> bool {
        !self.converted.is_empty() && (!self.failed.is_empty() || !self.cancelled.is_empty())
    }
}

/// Result of a batch that produced an archive.
#[derive(Debug, Clone)]
pub struct BatchOutput {
    /// The outbound zip archive.
    pub archive: Vec<u8>,
    pub report: BatchReport,
}

impl BatchOutput {
    pub fn is_partial(&self) -> bool {
        self.report.is_partial()
    }
}

/// Structured payload describing a request that produced no archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureResponse {
    pub error: String,
    pub kind: String,
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailedDocument>,
}

impl FailureResponse {
    pub fn new(request_id: Uuid, err: &BatchError) -> Self {
        let failures = match err {
            BatchError::BatchFailed { failures, .. } => {
                failures.iter().map(FailedDocument::from).collect()
            }
            _ => Vec::new(),
        };
        Self {
            error: err.to_string(),
            kind: err.kind().to_string(),
            id: request_id,
            failures,
        }
    }
}
