//! Request-level entry points.
//!
//! One call to [`convert_archive`] is one request: it owns a fresh
//! sandbox and deadline ([`RequestContext`]) and runs every stage in
//! order. The sandbox is removed on every exit path, including when the
//! returned future is dropped before completion.

use crate::config::{ArchiveKind, BatchConfig};
use crate::error::BatchError;
use crate::output::{BatchOutput, BatchReport, BatchStats, ConversionJob, ConvertedEntry, OutputDocument};
use crate::pipeline::adapter::{CommandAdapter, ConversionAdapter, CONVERTER_ENV};
use crate::pipeline::scheduler::Scheduler;
use crate::pipeline::{aggregate, archive, extract, input};
use crate::workspace::RequestContext;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

/// One inbound archive plus request metadata.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    id: Uuid,
    bytes: Vec<u8>,
    hint: Option<ArchiveKind>,
    cancel: CancellationToken,
}

impl BatchRequest {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            bytes,
            hint: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Declared archive kind, used only if magic bytes are inconclusive.
    pub fn with_hint(mut self, hint: Option<ArchiveKind>) -> Self {
        self.hint = hint;
        self
    }

    /// Declared content type, e.g. an HTTP `Content-Type` header.
    pub fn with_content_type(self, content_type: &str) -> Self {
        self.with_hint(ArchiveKind::from_content_type(content_type))
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Abort the request from outside by cancelling `token`.
    ///
    /// Cancellation counts as the deadline passing: finished documents
    /// are still returned.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Convert every eligible document in an archive and package the results.
///
/// # Errors
/// Returns `Err(BatchError)` only when no archive can be produced:
/// - the upload is too small, malformed, or tries to escape the sandbox
/// - nothing in it matches `config.input_extension`
/// - no converter is configured
/// - the request is cancelled while the archive is being extracted
/// - no document converted (or any failed under
///   [`crate::config::FailurePolicy::AllOrNothing`])
///
/// Individual failures otherwise land in [`BatchReport::failed`].
pub async fn convert_archive(
    request: BatchRequest,
    config: &BatchConfig,
) -> Result<BatchOutput, BatchError> {
    let span = info_span!("batch", request_id = %request.id);
    async move {
        let adapter = resolve_adapter(config)?;
        let BatchRequest {
            id,
            bytes,
            hint,
            cancel,
        } = request;

        info!(bytes = bytes.len(), converter = adapter.name(), "Starting batch");
        let ctx = RequestContext::create(id, config, &cancel)?;
        let result = run_batch(&ctx, bytes, hint, adapter, config).await;
        let elapsed_ms = ctx.elapsed_ms();
        ctx.finish().await;

        match &result {
            Ok(output) => info!(
                converted = output.report.converted.len(),
                failed = output.report.failed.len(),
                cancelled = output.report.cancelled.len(),
                elapsed_ms,
                "Batch complete"
            ),
            Err(e) => info!(kind = e.kind(), elapsed_ms, error = %e, "Batch failed"),
        }
        result
    }
    .instrument(span)
    .await
}

async fn run_batch(
    ctx: &RequestContext,
    bytes: Vec<u8>,
    hint: Option<ArchiveKind>,
    adapter: Arc<dyn ConversionAdapter>,
    config: &BatchConfig,
) -> Result<BatchOutput, BatchError> {
    let input_bytes = bytes.len();

    // ── Step 1: Extract ──────────────────────────────────────────────────
    let extract_start = Instant::now();
    let extraction = extract::extract_archive(
        bytes,
        hint,
        ctx.sandbox(),
        config,
        ctx.deadline().token().clone(),
    )
    .await?;
    let extract_duration_ms = extract_start.elapsed().as_millis() as u64;
    info!(
        kind = ?extraction.kind,
        documents = extraction.documents.len(),
        skipped = extraction.skipped,
        extract_duration_ms,
        "Archive extracted"
    );

    // ── Step 2: Plan one job per document ────────────────────────────────
    let outputs_dir = ctx.sandbox().outputs_dir();
    let jobs: Vec<ConversionJob> = extraction
        .documents
        .into_iter()
        .map(|input| {
            let entry_name =
                aggregate::entry_name(&input.name, config.output_naming, &config.output_extension);
            let output_path = outputs_dir.join(format!(
                "{}_{}",
                input.id,
                Path::new(&entry_name)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ));
            ConversionJob {
                input,
                output_path,
                entry_name,
            }
        })
        .collect();
    let total_documents = jobs.len();

    // ── Step 3: Convert ──────────────────────────────────────────────────
    let convert_start = Instant::now();
    let outcome = Scheduler::new(adapter, config).run(jobs, ctx.deadline()).await;
    let workers = outcome.workers;
    let convert_duration_ms = convert_start.elapsed().as_millis() as u64;

    // ── Step 4: Aggregate ────────────────────────────────────────────────
    let aggregation = aggregate::aggregate(outcome, config)?;

    // ── Step 5: Package ──────────────────────────────────────────────────
    let (zip, documents) = encode(aggregation.documents).await?;
    debug!(entries = documents.len(), bytes = zip.len(), "Output archive encoded");

    let report = BatchReport {
        request_id: ctx.id(),
        total_documents,
        converted: documents
            .iter()
            .map(|doc| ConvertedEntry {
                entry: doc.name.clone(),
                source: doc.source.clone(),
                bytes: doc.size,
            })
            .collect(),
        failed: aggregation.failed,
        cancelled: aggregation.cancelled,
        deadline_exceeded: aggregation.interrupted,
        stats: BatchStats {
            input_bytes,
            output_bytes: zip.len(),
            workers,
            extract_duration_ms,
            convert_duration_ms,
            total_duration_ms: ctx.elapsed_ms(),
        },
    };

    Ok(BatchOutput {
        archive: zip,
        report,
    })
}

/// Zip on the blocking pool; hands the documents back for the report.
async fn encode(
    documents: Vec<OutputDocument>,
) -> Result<(Vec<u8>, Vec<OutputDocument>), BatchError> {
    tokio::task::spawn_blocking(move || archive::encode_zip(&documents).map(|zip| (zip, documents)))
        .await
        .map_err(|e| BatchError::Internal(format!("encoder task failed: {e}")))?
}

/// Convert an in-memory archive with a fresh request id.
pub async fn convert_bytes(bytes: Vec<u8>, config: &BatchConfig) -> Result<BatchOutput, BatchError> {
    convert_archive(BatchRequest::new(bytes), config).await
}

/// Convert an archive given as a local path, an HTTP(S) URL, or `-` for stdin.
pub async fn convert(input_str: impl AsRef<str>, config: &BatchConfig) -> Result<BatchOutput, BatchError> {
    let resolved = input::resolve_input(input_str.as_ref(), config.download_timeout_secs).await?;
    debug!(source = %resolved.source, hint = ?resolved.hint, "Input resolved");
    convert_archive(
        BatchRequest::new(resolved.bytes).with_hint(resolved.hint),
        config,
    )
    .await
}

/// Convert an archive and write the output zip directly to a file.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn convert_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &BatchConfig,
) -> Result<BatchReport, BatchError> {
    let output = convert(input_str, config).await?;
    write_atomic(output_path.as_ref(), &output.archive).await?;
    Ok(output.report)
}

/// Write `bytes` to `path` through a sibling temp file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BatchError> {
    let write_err = |source| BatchError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.zip".to_string());
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    if let Err(e) = tokio::fs::write(&tmp_path, bytes).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(write_err(e));
    }
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(write_err(e));
    }
    Ok(())
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(input_str: impl AsRef<str>, config: &BatchConfig) -> Result<BatchOutput, BatchError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| BatchError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(convert(input_str, config))
}

/// Run the configured converter's readiness probe.
pub async fn check_converter(config: &BatchConfig) -> Result<(), BatchError> {
    let adapter = resolve_adapter(config)?;
    adapter.check_available().await?;
    info!(converter = adapter.name(), "Converter is ready");
    Ok(())
}

/// Resolve the conversion adapter, from most-specific to least-specific.
///
/// 1. **Pre-built adapter** (`config.converter`): used as-is. Lets tests
///    and embedders plug in anything implementing [`ConversionAdapter`].
/// 2. **Command** (`config.converter_command`): wrapped in a [`CommandAdapter`].
/// 3. **Environment** (`DOCBATCH_CONVERTER`): a whitespace-separated
///    command line, for deployments configured entirely through env vars.
pub fn resolve_adapter(config: &BatchConfig) -> Result<Arc<dyn ConversionAdapter>, BatchError> {
    if let Some(ref adapter) = config.converter {
        return Ok(Arc::clone(adapter));
    }

    if let Some(ref spec) = config.converter_command {
        return Ok(Arc::new(CommandAdapter::new(spec.clone())));
    }

    if let Some(adapter) = CommandAdapter::from_env() {
        return Ok(Arc::new(adapter?));
    }

    Err(BatchError::ConverterNotConfigured {
        hint: format!(
            "Pass --converter \"<program> {{input}} {{output}}\", set {CONVERTER_ENV}, \
             or set BatchConfig::converter_command."
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::pipeline::adapter::CommandSpec;
    use crate::workspace::Deadline;
    use async_trait::async_trait;

    struct Upper;

    #[async_trait]
    impl ConversionAdapter for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn convert(&self, job: &ConversionJob, _: &Deadline) -> Result<(), JobError> {
            let text = tokio::fs::read_to_string(&job.input.path).await.unwrap();
            tokio::fs::write(&job.output_path, text.to_uppercase())
                .await
                .unwrap();
            Ok(())
        }
    }

    fn zip_of(files: &[(&str, &str)]) -> Vec<u8> {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, body) in files {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn explicit_adapter_wins() {
        let config = BatchConfig::builder()
            .converter(Arc::new(Upper))
            .converter_command(CommandSpec::new("never-used"))
            .build()
            .unwrap();
        assert_eq!(resolve_adapter(&config).unwrap().name(), "upper");
    }

    #[test]
    fn command_spec_is_second() {
        let config = BatchConfig::builder()
            .converter_command(CommandSpec::parse("norg2md {input} {output}").unwrap())
            .build()
            .unwrap();
        assert_eq!(resolve_adapter(&config).unwrap().name(), "norg2md");
    }

    #[tokio::test]
    async fn request_id_names_the_report() {
        let root = tempfile::tempdir().unwrap();
        let config = BatchConfig::builder()
            .converter(Arc::new(Upper))
            .sandbox_root(root.path())
            .build()
            .unwrap();
        let id = Uuid::new_v4();
        let request = BatchRequest::new(zip_of(&[("a.norg", "* a")]))
            .with_content_type("application/zip")
            .with_id(id);

        let output = convert_archive(request, &config).await.unwrap();
        assert_eq!(output.report.request_id, id);
        assert_eq!(output.report.converted[0].entry, "a.md");
        assert_eq!(output.report.stats.workers, 1);
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.zip");
        write_atomic(&path, b"PK\x05\x06").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"PK\x05\x06");
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, ["out.zip"]);
    }
}
