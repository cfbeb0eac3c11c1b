//! # docbatch
//!
//! Convert every document in an archive with an external converter, in
//! parallel, and get back a zip of the results.
//!
//! ## Why this crate?
//!
//! Running a converter over an uploaded archive looks like a shell
//! one-liner until the archive contains `../../etc/passwd`, the converter
//! hangs on one file, or one bad document throws away ninety good ones.
//! This crate handles those cases: entries are validated before anything
//! is written, every request gets a private sandbox that is always
//! removed, conversions run in a bounded pool under a shared deadline,
//! and failures are reported per document instead of failing the batch.
//!
//! ## Pipeline Overview
//!
//! ```text
//! archive bytes (tar | tar.gz | zip)
//!  │
//!  ├─ 1. Detect    magic bytes first, declared kind as fallback
//!  ├─ 2. Extract   validated, flat, uniquely named files in the sandbox
//!  ├─ 3. Convert   W = min(documents, max_concurrency) workers, one
//!  │               converter process per document, request + job deadlines
//!  ├─ 4. Aggregate partial success by default, unique entry names
//!  └─ 5. Package   deflated zip + BatchReport
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docbatch::{convert_file, BatchConfig, CommandSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BatchConfig::builder()
//!         .converter_command(CommandSpec::parse("norg2md {input} {output}")?)
//!         .max_concurrency(4)
//!         .build()?;
//!     let report = convert_file("wiki.tar.gz", "wiki-md.zip", &config).await?;
//!     eprintln!("{} converted, {} failed", report.converted.len(), report.failed.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docbatch` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! docbatch = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod workspace;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ArchiveKind, BatchConfig, BatchConfigBuilder, FailurePolicy, OutputNaming};
pub use convert::{
    check_converter, convert, convert_archive, convert_bytes, convert_file, convert_sync,
    resolve_adapter, BatchRequest,
};
pub use error::{BatchError, JobError};
pub use output::{
    BatchOutcome, BatchOutput, BatchReport, BatchStats, ConversionJob, ConvertedEntry,
    FailedDocument, FailureResponse, InputDocument, JobOutcome, JobRecord, OutputDocument,
};
pub use pipeline::adapter::{CommandAdapter, CommandSpec, ConversionAdapter};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use workspace::{Deadline, RequestContext, Sandbox};
