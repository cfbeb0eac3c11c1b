//! Configuration types for batch archive conversion.
//!
//! All batch behaviour is controlled through [`BatchConfig`], built via its
//! [`BatchConfigBuilder`]. One struct holds every knob so a config can be
//! shared across concurrent requests and printed in logs as a unit.

use crate::error::BatchError;
use crate::pipeline::adapter::{CommandSpec, ConversionAdapter};
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for one or more batch conversions.
///
/// Built via [`BatchConfig::builder()`] or using [`BatchConfig::default()`].
///
/// # Example
/// ```rust
/// use docbatch::{BatchConfig, CommandSpec};
///
/// let config = BatchConfig::builder()
///     .max_concurrency(3)
///     .request_timeout_secs(120)
///     .extensions("norg", "md")
///     .converter_command(CommandSpec::parse("norg2md {input} {output}").unwrap())
///     .build()
///     .unwrap();
/// assert_eq!(config.max_concurrency, 3);
/// ```
#[derive(Clone)]
pub struct BatchConfig {
    /// Ceiling on concurrent converter invocations per request. Default: 4.
    ///
    /// Each job spawns an external process, so this bounds process spawns
    /// rather than tracking the host CPU count. A request with fewer
    /// documents than the ceiling starts one worker per document.
    pub max_concurrency: usize,

    /// Request-wide deadline. Default: 300 s.
    ///
    /// Once it elapses no further jobs are claimed, running converters are
    /// terminated, and whatever finished is aggregated as a partial result.
    pub request_timeout: Duration,

    /// Per-job deadline, clipped to the request deadline. Default: 60 s.
    pub job_timeout: Duration,

    /// Extension (without dot) of eligible documents. Default: `norg`.
    pub input_extension: String,

    /// Extension (without dot) given to converted documents. Default: `md`.
    pub output_extension: String,

    /// Directory under which per-request sandboxes are created.
    /// Default: the OS temp directory.
    pub sandbox_root: PathBuf,

    /// What to do when some documents fail. Default: [`FailurePolicy::PartialSuccess`].
    pub failure_policy: FailurePolicy,

    /// How output archive entries are named. Default: [`OutputNaming::BaseName`].
    pub output_naming: OutputNaming,

    /// Pre-constructed adapter. Takes precedence over `converter_command`.
    pub converter: Option<Arc<dyn ConversionAdapter>>,

    /// External command used to convert one document.
    /// If None along with `converter`, `DOCBATCH_CONVERTER` is consulted.
    pub converter_command: Option<CommandSpec>,

    /// Optional observer for batch and job events.
    pub progress_callback: Option<ProgressCallback>,

    /// Timeout for fetching a URL input. Default: 120 s.
    pub download_timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            request_timeout: Duration::from_secs(300),
            job_timeout: Duration::from_secs(60),
            input_extension: "norg".to_string(),
            output_extension: "md".to_string(),
            sandbox_root: std::env::temp_dir(),
            failure_policy: FailurePolicy::default(),
            output_naming: OutputNaming::default(),
            converter: None,
            converter_command: None,
            progress_callback: None,
            download_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConfig")
            .field("max_concurrency", &self.max_concurrency)
            .field("request_timeout", &self.request_timeout)
            .field("job_timeout", &self.job_timeout)
            .field("input_extension", &self.input_extension)
            .field("output_extension", &self.output_extension)
            .field("sandbox_root", &self.sandbox_root)
            .field("failure_policy", &self.failure_policy)
            .field("output_naming", &self.output_naming)
            .field("converter", &self.converter.as_ref().map(|_| "<dyn ConversionAdapter>"))
            .field("converter_command", &self.converter_command)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn BatchProgressCallback>"),
            )
            .field("download_timeout_secs", &self.download_timeout_secs)
            .finish()
    }
}

impl BatchConfig {
    /// Create a new builder for `BatchConfig`.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder {
            config: Self::default(),
        }
    }

    /// Whether an archive entry (by name or sanitised path) is an eligible
    /// document.
    pub fn is_eligible(&self, name: impl AsRef<Path>) -> bool {
        name.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.input_extension))
    }
}

/// Builder for [`BatchConfig`].
#[derive(Debug)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.config.max_concurrency = n.max(1);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn request_timeout_secs(self, secs: u64) -> Self {
        self.request_timeout(Duration::from_secs(secs))
    }

    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout = timeout;
        self
    }

    pub fn job_timeout_secs(self, secs: u64) -> Self {
        self.job_timeout(Duration::from_secs(secs))
    }

    /// Set the eligible input extension and the output extension (dots are stripped).
    pub fn extensions(mut self, input: impl AsRef<str>, output: impl AsRef<str>) -> Self {
        self.config.input_extension = input.as_ref().trim_start_matches('.').to_string();
        self.config.output_extension = output.as_ref().trim_start_matches('.').to_string();
        self
    }

    pub fn sandbox_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.sandbox_root = root.into();
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    pub fn output_naming(mut self, naming: OutputNaming) -> Self {
        self.config.output_naming = naming;
        self
    }

    pub fn converter(mut self, adapter: Arc<dyn ConversionAdapter>) -> Self {
        self.config.converter = Some(adapter);
        self
    }

    pub fn converter_command(mut self, spec: CommandSpec) -> Self {
        self.config.converter_command = Some(spec);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<BatchConfig, BatchError> {
        let c = &self.config;
        if c.max_concurrency == 0 {
            return Err(BatchError::InvalidConfig(
                "max_concurrency must be ≥ 1".into(),
            ));
        }
        if c.request_timeout.is_zero() {
            return Err(BatchError::InvalidConfig(
                "request_timeout must be greater than zero".into(),
            ));
        }
        if c.job_timeout.is_zero() {
            return Err(BatchError::InvalidConfig(
                "job_timeout must be greater than zero".into(),
            ));
        }
        for (field, ext) in [
            ("input_extension", &c.input_extension),
            ("output_extension", &c.output_extension),
        ] {
            if ext.is_empty() || ext.contains(['/', '\\']) {
                return Err(BatchError::InvalidConfig(format!(
                    "{field} must be a bare extension, got '{ext}'"
                )));
            }
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Inbound archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    /// Plain ustar / GNU tar.
    Tar,
    /// Gzip-compressed tar.
    TarGz,
    /// PKZIP archive.
    Zip,
}

impl ArchiveKind {
    /// Smallest byte length a non-empty archive of this kind can have.
    ///
    /// tar: one 512-byte header block; gzip: 10-byte header + 8-byte
    /// trailer; zip: 22-byte end-of-central-directory record.
    pub fn minimum_size(self) -> usize {
        match self {
            ArchiveKind::Tar => 512,
            ArchiveKind::TarGz => 18,
            ArchiveKind::Zip => 22,
        }
    }

    /// Map a declared content type (e.g. an HTTP `Content-Type`) to a hint.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "application/x-tar" | "application/tar" => Some(ArchiveKind::Tar),
            "application/gzip"
            | "application/x-gzip"
            | "application/x-gtar"
            | "application/x-compressed-tar"
            | "application/tar+gzip" => Some(ArchiveKind::TarGz),
            "application/zip" | "application/x-zip-compressed" | "application/x-zip" => {
                Some(ArchiveKind::Zip)
            }
            _ => None,
        }
    }

    /// Map a file name to a hint by its extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else {
            None
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveKind::Tar => "tar",
            ArchiveKind::TarGz => "tar.gz",
            ArchiveKind::Zip => "zip",
        })
    }
}

/// How a batch with some failed documents is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Return every successful document; failures go into the report.
    /// Only a batch with zero successes fails. (default)
    #[default]
    PartialSuccess,
    /// Any failed or cancelled document fails the whole batch and
    /// discards completed output.
    AllOrNothing,
}

/// How converted documents are named inside the output archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputNaming {
    /// `<stem>.<output_extension>` only; colliding names get `-1`, `-2`, …
    /// suffixes in archive order. (default)
    #[default]
    BaseName,
    /// Keep the sanitised relative directory of the input entry.
    PreserveDirs,
}
