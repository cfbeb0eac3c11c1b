//! Result aggregation: turn a [`BatchOutcome`] into the set of documents
//! to package, or into the error that ends the request.
//!
//! | Successes | Failures / cancellations | PartialSuccess       | AllOrNothing         |
//! |-----------|--------------------------|----------------------|----------------------|
//! | ≥ 1       | none                     | archive              | archive              |
//! | ≥ 1       | some                     | archive + report     | error                |
//! | 0         | any                      | error                | error                |
//!
//! The error is [`BatchError::DeadlineExceeded`] when the deadline cut the
//! batch short, [`BatchError::BatchFailed`] otherwise.
//!
//! Entry names are assigned here, in archive order, so the output never
//! depends on which worker finished first.

use crate::config::{BatchConfig, FailurePolicy, OutputNaming};
use crate::error::{BatchError, JobError};
use crate::output::{BatchOutcome, FailedDocument, JobOutcome, OutputDocument};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// What survives aggregation.
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    /// Converted documents with final, unique entry names, in archive order.
    pub documents: Vec<OutputDocument>,
    /// Failed documents, in archive order.
    pub failed: Vec<FailedDocument>,
    /// Archive names of documents that never ran.
    pub cancelled: Vec<String>,
    pub interrupted: bool,
}

/// Proposed output entry name for an input entry name.
///
/// `notes/daily/a.norg` becomes `a.md` under [`OutputNaming::BaseName`]
/// and `notes/daily/a.md` under [`OutputNaming::PreserveDirs`].
pub fn entry_name(input_name: &str, naming: OutputNaming, output_extension: &str) -> String {
    let path = Path::new(input_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let file = format!("{stem}.{output_extension}");

    match naming {
        OutputNaming::BaseName => file,
        OutputNaming::PreserveDirs => match path.parent().map(|p| p.to_string_lossy()) {
            Some(dir) if !dir.is_empty() => format!("{}/{file}", dir.replace('\\', "/")),
            _ => file,
        },
    }
}

/// Make `name` unique against `taken` by appending `-1`, `-2`, … to the stem.
///
/// Comparison ignores ASCII case so the archive also unpacks cleanly on
/// case-insensitive filesystems.
fn claim_unique(name: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.to_ascii_lowercase()) {
        return name.to_string();
    }
    let (base, ext) = match name.rfind('.') {
        Some(dot) if dot > name.rfind('/').map_or(0, |s| s + 1) => name.split_at(dot),
        _ => (name, ""),
    };
    (1..)
        .map(|n| format!("{base}-{n}{ext}"))
        .find(|candidate| taken.insert(candidate.to_ascii_lowercase()))
        .unwrap_or_else(|| name.to_string())
}

/// Apply the failure policy and assign final entry names.
pub fn aggregate(outcome: BatchOutcome, config: &BatchConfig) -> Result<Aggregation, BatchError> {
    let BatchOutcome {
        total,
        mut records,
        mut cancelled,
        interrupted,
        ..
    } = outcome;
    records.sort_by_key(|r| r.input.id);
    cancelled.sort_by_key(|d| d.id);

    let mut successes = Vec::new();
    let mut failures: Vec<JobError> = Vec::new();
    for record in records {
        match record.outcome {
            JobOutcome::Success(doc) => successes.push(doc),
            JobOutcome::Failure(err) => failures.push(err),
        }
    }
    let cancelled: Vec<String> = cancelled.into_iter().map(|d| d.name).collect();

    let incomplete = !failures.is_empty() || !cancelled.is_empty();
    let rejected = successes.is_empty()
        || (incomplete && config.failure_policy == FailurePolicy::AllOrNothing);
    if rejected {
        if interrupted {
            return Err(BatchError::DeadlineExceeded {
                timeout_ms: config.request_timeout.as_millis() as u64,
                completed: successes.len() + failures.len(),
                cancelled: cancelled.len(),
            });
        }
        let first_error = failures
            .first()
            .map(ToString::to_string)
            .unwrap_or_else(|| "no document produced output".to_string());
        return Err(BatchError::BatchFailed {
            total,
            failed: failures.len(),
            first_error,
            failures,
        });
    }

    let mut taken = HashSet::with_capacity(successes.len());
    let documents: Vec<OutputDocument> = successes
        .into_iter()
        .map(|mut doc| {
            let unique = claim_unique(&doc.name, &mut taken);
            if unique != doc.name {
                debug!(source = %doc.source, proposed = %doc.name, entry = %unique, "Renamed colliding output entry");
                doc.name = unique;
            }
            doc
        })
        .collect();

    if incomplete {
        info!(
            converted = documents.len(),
            failed = failures.len(),
            cancelled = cancelled.len(),
            "Returning partial result"
        );
    }

    Ok(Aggregation {
        documents,
        failed: failures.iter().map(FailedDocument::from).collect(),
        cancelled,
        interrupted,
    })
}
