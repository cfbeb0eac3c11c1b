//! Error types for the docbatch library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`BatchError`]: **Fatal**: the request cannot produce an archive at
//!   all (malformed upload, path traversal, nothing to convert, every job
//!   failed). Returned as `Err(BatchError)` from the top-level `convert*`
//!   functions.
//!
//! * [`JobError`]: **Non-fatal**: a single document failed to convert
//!   (converter crashed, timed out, wrote nothing) but its siblings are
//!   unaffected. Stored inside [`crate::output::JobOutcome::Failure`] so
//!   callers can inspect a partial success instead of losing the whole
//!   batch to one bad document.

use crate::config::ArchiveKind;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the docbatch library.
///
/// Per-document failures use [`JobError`] and are reported inside
/// [`crate::output::BatchReport`] rather than propagated here.
#[derive(Debug, Error)]
pub enum BatchError {
    // ── Archive errors ────────────────────────────────────────────────────
    /// The upload is too small to hold an archive of the detected format.
    #[error("Archive too small: {size} bytes (minimum {minimum} bytes)")]
    ArchiveTooSmall { size: usize, minimum: usize },

    /// The bytes are not a valid instance of the detected or declared format.
    #[error("Malformed archive{}: {detail}", .kind.as_ref().map(|k| format!(" ({k})")).unwrap_or_default())]
    MalformedArchive {
        kind: Option<ArchiveKind>,
        detail: String,
    },

    /// An entry would resolve outside the request sandbox.
    #[error("Archive entry '{entry}' escapes the sandbox")]
    PathTraversal { entry: String },

    /// The archive decoded cleanly but contained no eligible documents.
    #[error("No '.{extension}' documents found among {entries} archive entries")]
    NoEligibleDocuments { extension: String, entries: usize },

    // ── Batch errors ──────────────────────────────────────────────────────
    /// The request deadline elapsed before any document converted.
    #[error("Request deadline of {timeout_ms}ms exceeded: {completed} finished, {cancelled} cancelled, none succeeded")]
    DeadlineExceeded {
        timeout_ms: u64,
        completed: usize,
        cancelled: usize,
    },

    /// The request was cancelled while the archive was still being extracted.
    #[error("Request cancelled during extraction after {documents} documents")]
    Cancelled { documents: usize },

    /// The batch produced no output (zero successes, or any failure under
    /// [`crate::config::FailurePolicy::AllOrNothing`]).
    #[error("Batch failed: {failed}/{total} documents failed.\nFirst error: {first_error}")]
    BatchFailed {
        total: usize,
        failed: usize,
        first_error: String,
        failures: Vec<JobError>,
    },

    // ── Converter errors ──────────────────────────────────────────────────
    /// No conversion adapter or command was configured.
    #[error("No converter configured.\n{hint}")]
    ConverterNotConfigured { hint: String },

    /// The converter failed its readiness probe.
    #[error("Converter '{program}' is not available: {detail}")]
    ConverterUnavailable { program: String, detail: String },

    // ── Workspace errors ──────────────────────────────────────────────────
    /// The per-request sandbox could not be created.
    #[error("Failed to create sandbox under '{root}': {source}")]
    Sandbox {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing an extracted entry into the sandbox failed.
    #[error("Failed to {operation} '{path}': {source}")]
    Extract {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Building the outbound zip failed.
    #[error("Failed to encode output archive: {detail}")]
    Encode { detail: String },

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Archive not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output archive file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BatchError {
    /// Stable machine-readable code for the failure payload.
    pub fn kind(&self) -> &'static str {
        match self {
            BatchError::ArchiveTooSmall { .. } => "archive_too_small",
            BatchError::MalformedArchive { .. } => "malformed_archive",
            BatchError::PathTraversal { .. } => "path_traversal",
            BatchError::NoEligibleDocuments { .. } => "no_eligible_documents",
            BatchError::DeadlineExceeded { .. } => "deadline_exceeded",
            BatchError::Cancelled { .. } => "cancelled",
            BatchError::BatchFailed { .. } => "batch_failed",
            BatchError::ConverterNotConfigured { .. } => "converter_not_configured",
            BatchError::ConverterUnavailable { .. } => "converter_unavailable",
            BatchError::Sandbox { .. } => "sandbox",
            BatchError::Extract { .. } => "extract",
            BatchError::Encode { .. } => "encode",
            BatchError::FileNotFound { .. } => "file_not_found",
            BatchError::PermissionDenied { .. } => "permission_denied",
            BatchError::DownloadFailed { .. } => "download_failed",
            BatchError::DownloadTimeout { .. } => "download_timeout",
            BatchError::OutputWriteFailed { .. } => "output_write_failed",
            BatchError::InvalidConfig(_) => "invalid_config",
            BatchError::Internal(_) => "internal",
        }
    }

    /// Whether the caller sent something unusable (as opposed to a server-side failure).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BatchError::ArchiveTooSmall { .. }
                | BatchError::MalformedArchive { .. }
                | BatchError::PathTraversal { .. }
                | BatchError::NoEligibleDocuments { .. }
        )
    }
}

/// A non-fatal error for a single document.
///
/// Stored in [`crate::output::JobOutcome::Failure`]. The batch continues
/// unless every document fails.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobError {
    /// The converter process could not be started.
    #[error("{document}: failed to start converter: {detail}")]
    SpawnFailed { document: String, detail: String },

    /// The converter exited unsuccessfully.
    #[error("{document}: converter exited with {}: {stderr}", .status.as_ref().map(|s| format!("status {s}")).unwrap_or_else(|| "a signal".to_string()))]
    ConverterFailed {
        document: String,
        status: Option<i32>,
        stderr: String,
    },

    /// The converter reported success but left no output behind.
    #[error("{document}: converter produced no output")]
    EmptyOutput { document: String },

    /// The job ran past its deadline and was terminated.
    #[error("{document}: conversion timed out after {elapsed_ms}ms")]
    Timeout { document: String, elapsed_ms: u64 },

    /// The request was cancelled while this job was running.
    #[error("{document}: conversion cancelled")]
    Cancelled { document: String },

    /// Reading or writing the job's files failed.
    #[error("{document}: I/O error: {detail}")]
    Io { document: String, detail: String },

    /// The worker running this job stopped without recording an outcome.
    #[error("{document}: worker stopped before recording an outcome")]
    WorkerLost { document: String },
}

impl JobError {
    /// The archive name of the document this error belongs to.
    pub fn document(&self) -> &str {
        match self {
            JobError::SpawnFailed { document, .. }
            | JobError::ConverterFailed { document, .. }
            | JobError::EmptyOutput { document }
            | JobError::Timeout { document, .. }
            | JobError::Cancelled { document }
            | JobError::Io { document, .. }
            | JobError::WorkerLost { document } => document,
        }
    }

    /// Whether the job was stopped by the deadline or cancellation rather than failing on its own.
    pub fn is_interruption(&self) -> bool {
        matches!(self, JobError::Timeout { .. } | JobError::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_failed_display() {
        let e = BatchError::BatchFailed {
            total: 5,
            failed: 5,
            first_error: "a.norg: converter produced no output".into(),
            failures: vec![],
        };
        let msg = e.to_string();
        assert!(msg.contains("5/5"), "got: {msg}");
        assert!(msg.contains("a.norg"), "got: {msg}");
    }

    #[test]
    fn malformed_archive_display_with_kind() {
        let e = BatchError::MalformedArchive {
            kind: Some(ArchiveKind::Zip),
            detail: "invalid central directory".into(),
        };
        assert!(e.to_string().contains("(zip)"));
        assert!(e.to_string().contains("central directory"));
    }

    #[test]
    fn malformed_archive_display_without_kind() {
        let e = BatchError::MalformedArchive {
            kind: None,
            detail: "unrecognised format".into(),
        };
        assert_eq!(e.to_string(), "Malformed archive: unrecognised format");
    }

    #[test]
    fn client_errors_are_classified() {
        assert!(BatchError::PathTraversal {
            entry: "../x".into()
        }
        .is_client_error());
        assert!(!BatchError::Internal("boom".into()).is_client_error());
        assert_eq!(
            BatchError::NoEligibleDocuments {
                extension: "norg".into(),
                entries: 3
            }
            .kind(),
            "no_eligible_documents"
        );
    }

    #[test]
    fn converter_failed_display() {
        let e = JobError::ConverterFailed {
            document: "notes/a.norg".into(),
            status: Some(2),
            stderr: "parse error".into(),
        };
        assert_eq!(
            e.to_string(),
            "notes/a.norg: converter exited with status 2: parse error"
        );
        let killed = JobError::ConverterFailed {
            document: "b.norg".into(),
            status: None,
            stderr: String::new(),
        };
        assert!(killed.to_string().contains("a signal"));
    }

    #[test]
    fn job_error_serialises_tagged() {
        let e = JobError::Timeout {
            document: "a.norg".into(),
            elapsed_ms: 1500,
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "timeout");
        assert_eq!(json["document"], "a.norg");
        assert_eq!(e.document(), "a.norg");
        assert!(e.is_interruption());
    }
}
