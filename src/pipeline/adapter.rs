//! Conversion adapter: the seam between the scheduler and the converter.
//!
//! The scheduler only knows [`ConversionAdapter`]. The shipped
//! implementation, [`CommandAdapter`], runs an external program once per
//! document:
//!
//! ```text
//! CommandSpec "norg2md {input} {output}"
//!      │ expand placeholders (output → staging path)
//!      ▼
//! spawn (kill_on_drop) ──race── job deadline / cancellation
//!      │ exit 0 + non-empty staging file
//!      ▼
//! rename staging → output
//! ```
//!
//! A converter that crashes, hangs or writes nothing never leaves a
//! half-written output where the aggregator could pick it up.

use crate::error::{BatchError, JobError};
use crate::output::ConversionJob;
use crate::workspace::Deadline;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Environment variable holding a converter command line.
pub const CONVERTER_ENV: &str = "DOCBATCH_CONVERTER";

/// Upper bound on the readiness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bytes of converter stderr kept in a [`JobError::ConverterFailed`].
const MAX_STDERR_BYTES: usize = 2048;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(input|output|input_dir|output_dir|stem)\}").unwrap());

/// Converts one document from its input format to the output format.
///
/// Implementations must write the result to `job.output_path` and return
/// `Ok(())` only once that file is complete. They must stop promptly
/// when `deadline` expires.
#[async_trait]
pub trait ConversionAdapter: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn convert(&self, job: &ConversionJob, deadline: &Deadline) -> Result<(), JobError>;

    /// Readiness probe. The default assumes the adapter is always ready.
    async fn check_available(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

// ── CommandSpec ──────────────────────────────────────────────────────────

/// How to invoke an external converter.
///
/// Arguments may contain placeholders, substituted per job:
///
/// | Placeholder    | Value                                   |
/// |----------------|-----------------------------------------|
/// | `{input}`      | absolute path of the extracted document |
/// | `{output}`     | path the converter must write           |
/// | `{input_dir}`  | directory holding `{input}`             |
/// | `{output_dir}` | directory holding `{output}`            |
/// | `{stem}`       | input file name without extension       |
///
/// If neither `{input}` nor `{output}` appears, the two paths are
/// appended as the final arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment variables, added to the inherited environment.
    pub env: Vec<(String, String)>,
    /// Working directory of the converter. Default: inherited.
    pub working_dir: Option<PathBuf>,
    /// Arguments for the readiness probe. Empty disables the probe.
    pub probe_args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            probe_args: vec!["--version".to_string()],
        }
    }

    /// Parse a whitespace-separated command line such as
    /// `"pandoc -f norg -t gfm {input} -o {output}"`.
    ///
    /// No shell quoting is interpreted; use [`CommandSpec::new`] and
    /// [`CommandSpec::args`] for arguments containing spaces.
    pub fn parse(line: &str) -> Result<Self, BatchError> {
        let mut words = line.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| BatchError::InvalidConfig("converter command is empty".into()))?;
        Ok(Self::new(program).args(words))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn probe_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.probe_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Substitute placeholders for one job.
    pub fn expand_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let dir_of = |p: &Path| {
            p.parent()
                .map(|d| d.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        let input_s = input.to_string_lossy().into_owned();
        let output_s = output.to_string_lossy().into_owned();
        let input_dir = dir_of(input);
        let output_dir = dir_of(output);
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let has_paths = self
            .args
            .iter()
            .flat_map(|a| PLACEHOLDER.captures_iter(a))
            .any(|c| matches!(&c[1], "input" | "output"));

        let mut expanded: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                PLACEHOLDER
                    .replace_all(arg, |caps: &Captures| match &caps[1] {
                        "input" => input_s.clone(),
                        "output" => output_s.clone(),
                        "input_dir" => input_dir.clone(),
                        "output_dir" => output_dir.clone(),
                        _ => stem.clone(),
                    })
                    .into_owned()
            })
            .collect();

        if !has_paths {
            expanded.push(input_s);
            expanded.push(output_s);
        }
        expanded
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

// ── CommandAdapter ───────────────────────────────────────────────────────

/// Runs an external converter process per document.
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    spec: CommandSpec,
}

impl CommandAdapter {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    /// Build from [`CONVERTER_ENV`], if set.
    pub fn from_env() -> Option<Result<Self, BatchError>> {
        let line = std::env::var(CONVERTER_ENV).ok()?;
        if line.trim().is_empty() {
            return None;
        }
        Some(CommandSpec::parse(&line).map(Self::new))
    }
}

/// Staging file next to `output`, keeping its extension so converters
/// that infer the format from the output name still work.
fn staging_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!(".staging-{name}"))
}

/// Keep the tail of a stream, where converters usually put the error.
fn truncate_tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= MAX_STDERR_BYTES {
        return text.to_string();
    }
    let mut cut = text.len() - MAX_STDERR_BYTES;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    format!("…{}", &text[cut..])
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove staging file");
        }
    }
}

#[async_trait]
impl ConversionAdapter for CommandAdapter {
    fn name(&self) -> &str {
        &self.spec.program
    }

    async fn convert(&self, job: &ConversionJob, deadline: &Deadline) -> Result<(), JobError> {
        let document = job.input.name.clone();
        let staging = staging_path(&job.output_path);
        let args = self.spec.expand_args(&job.input.path, &staging);
        let started = Instant::now();

        debug!(document = %document, program = %self.spec.program, ?args, "Spawning converter");
        let child = self
            .spec
            .command(&args)
            .spawn()
            .map_err(|e| JobError::SpawnFailed {
                document: document.clone(),
                detail: format!("{}: {e}", self.spec.program),
            })?;

        // Dropping the wait future drops the child, and kill_on_drop
        // terminates it.
        let output = tokio::select! {
            biased;
            result = child.wait_with_output() => result.map_err(|e| JobError::Io {
                document: document.clone(),
                detail: format!("waiting for converter: {e}"),
            }),
            _ = deadline.expired() => {
                discard(&staging).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                return Err(if deadline.is_cancelled() {
                    JobError::Cancelled { document }
                } else {
                    JobError::Timeout { document, elapsed_ms }
                });
            }
        };
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                discard(&staging).await;
                return Err(e);
            }
        };

        if !output.stdout.is_empty() {
            debug!(document = %document, stdout = %truncate_tail(&output.stdout), "Converter stdout");
        }
        if !output.status.success() {
            discard(&staging).await;
            return Err(JobError::ConverterFailed {
                document,
                status: output.status.code(),
                stderr: truncate_tail(&output.stderr),
            });
        }

        let size = match tokio::fs::metadata(&staging).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        };
        if size == 0 {
            discard(&staging).await;
            return Err(JobError::EmptyOutput { document });
        }

        tokio::fs::rename(&staging, &job.output_path)
            .await
            .map_err(|e| JobError::Io {
                document: document.clone(),
                detail: format!("moving converter output into place: {e}"),
            })?;

        debug!(
            document = %document,
            bytes = size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Converter finished"
        );
        Ok(())
    }

    async fn check_available(&self) -> Result<(), BatchError> {
        let unavailable = |detail: String| BatchError::ConverterUnavailable {
            program: self.spec.program.clone(),
            detail,
        };

        if self.spec.probe_args.is_empty() {
            debug!(program = %self.spec.program, "Readiness probe disabled");
            return Ok(());
        }

        let child = self
            .spec
            .command(&self.spec.probe_args)
            .spawn()
            .map_err(|e| unavailable(format!("cannot start: {e}")))?;

        match tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output()).await {
            Err(_) => Err(unavailable(format!(
                "probe did not finish within {}s",
                PROBE_TIMEOUT.as_secs()
            ))),
            Ok(Err(e)) => Err(unavailable(e.to_string())),
            Ok(Ok(out)) if out.status.success() => {
                debug!(
                    program = %self.spec.program,
                    version = %truncate_tail(&out.stdout),
                    "Converter is available"
                );
                Ok(())
            }
            Ok(Ok(out)) => Err(unavailable(format!(
                "probe exited with {}: {}",
                out.status,
                truncate_tail(&out.stderr)
            ))),
        }
    }
}
