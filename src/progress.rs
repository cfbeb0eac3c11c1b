//! Progress-callback trait for per-document conversion events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::BatchConfigBuilder::progress_callback`] to receive
//! events as the worker pool processes each document.
//!
//! # Example
//!
//! ```rust
//! use docbatch::{BatchConfig, BatchProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for CountingCallback {
//!     fn on_job_complete(&self, document: &str, total: usize, output_bytes: u64) {
//!         let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{done}/{total} {document} ({output_bytes} bytes)");
//!     }
//! }
//!
//! let config = BatchConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the batch pipeline as it processes each document.
///
/// Workers run in parallel, so every method may be called concurrently
/// from different threads. All methods default to no-ops.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once after extraction, before any worker starts.
    fn on_batch_start(&self, total_documents: usize) {
        let _ = total_documents;
    }

    /// Called when a worker claims a document, just before the converter runs.
    fn on_job_start(&self, document: &str, total_documents: usize) {
        let _ = (document, total_documents);
    }

    /// Called when a document converted successfully.
    fn on_job_complete(&self, document: &str, total_documents: usize, output_bytes: u64) {
        let _ = (document, total_documents, output_bytes);
    }

    /// Called when a document failed, timed out or was interrupted.
    fn on_job_error(&self, document: &str, total_documents: usize, error: &str) {
        let _ = (document, total_documents, error);
    }

    /// Called once after the pool has drained.
    ///
    /// `succeeded + failed + cancelled == total_documents`.
    fn on_batch_complete(
        &self,
        total_documents: usize,
        succeeded: usize,
        failed: usize,
        cancelled: usize,
    ) {
        let _ = (total_documents, succeeded, failed, cancelled);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::BatchConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;
