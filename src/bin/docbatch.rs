//! CLI binary for docbatch.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `BatchConfig`, writes the output zip, and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use docbatch::convert::write_atomic;
use docbatch::pipeline::input;
use docbatch::{
    check_converter, convert_archive, ArchiveKind, BatchConfig, BatchProgressCallback,
    BatchReport, BatchRequest, CommandSpec, FailurePolicy, FailureResponse, OutputNaming,
    ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live bar plus one log line per document.
/// Documents complete out of order, so start times are keyed by name.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
}

impl CliProgressCallback {
    /// Spinner until `on_batch_start` reports how many documents there are.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Extracting archive…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} documents  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, document: &str) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut times| times.remove(document))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Tear the bar down when the batch ends before `on_batch_complete`.
    fn abandon(&self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_documents: usize) {
        self.activate_bar(total_documents);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Converting {total_documents} documents…"))
        ));
    }

    fn on_job_start(&self, document: &str, _total: usize) {
        if let Ok(mut times) = self.start_times.lock() {
            times.insert(document.to_string(), Instant::now());
        }
        self.bar.set_message(document.to_string());
    }

    fn on_job_complete(&self, document: &str, _total: usize, output_bytes: u64) {
        let secs = self.elapsed_secs(document);
        self.bar.println(format!(
            "  {} {:<48}  {:<10}  {}",
            green("✓"),
            document,
            dim(&format!("{output_bytes:>7} B")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_job_error(&self, document: &str, _total: usize, error: &str) {
        let secs = self.elapsed_secs(document);

        // Truncate very long error messages to keep output tidy.
        let msg = match error.char_indices().nth(79) {
            Some((cut, _)) => format!("{}\u{2026}", &error[..cut]),
            None => error.to_string(),
        };

        self.bar.println(format!(
            "  {} {:<48}  {}  {}",
            red("✗"),
            document,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total: usize, succeeded: usize, failed: usize, cancelled: usize) {
        self.bar.finish_and_clear();

        if succeeded == total {
            eprintln!(
                "{} {} documents converted successfully",
                green("✔"),
                bold(&succeeded.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} documents converted  ({} failed, {} cancelled)",
                if succeeded == 0 { red("✘") } else { cyan("⚠") },
                bold(&succeeded.to_string()),
                total,
                red(&failed.to_string()),
                cancelled,
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert every .norg file in a tarball to Markdown
  docbatch --converter "norg2md {input} {output}" wiki.tar.gz -o wiki-md.zip

  # Read from stdin, write the zip to stdout
  cat wiki.zip | docbatch --converter "norg2md {input} {output}" - > out.zip

  # Download, 8 workers, 10 minute request deadline
  docbatch -c 8 --timeout 600 https://example.com/exports/wiki.tgz -o out.zip

  # Other formats: any converter that takes an input and an output path
  docbatch --input-ext rst --output-ext html \
           --converter "pandoc -f rst -t html {input} -o {output}" docs.zip -o html.zip

  # Keep directory structure, fail if any document fails
  docbatch --preserve-dirs --all-or-nothing wiki.tar -o out.zip

  # Machine-readable report (FailureResponse JSON on error)
  docbatch --json wiki.tar.gz -o out.zip > report.json

  # Check the converter is installed and runs
  docbatch --check --converter "norg2md {input} {output}"

CONVERTER PLACEHOLDERS:
  {input}       extracted document path
  {output}      path the converter must write
  {input_dir}   directory of {input}
  {output_dir}  directory of {output}
  {stem}        input file name without extension

  Without {input}/{output} the two paths are appended to the command.

ENVIRONMENT VARIABLES:
  DOCBATCH_CONVERTER      Converter command line (same as --converter)
  DOCBATCH_CONCURRENCY    Worker ceiling
  DOCBATCH_TIMEOUT        Request deadline in seconds
  LOG_FORMAT              text (default) or json
  RUST_LOG                Tracing filter; overrides --verbose / --quiet
"#;

/// Convert every document in an archive with an external converter.
#[derive(Parser, Debug)]
#[command(
    name = "docbatch",
    version,
    about = "Convert every document in an archive with an external converter",
    long_about = "Convert every eligible document in a tar, tar.gz or zip archive by running an \
external converter once per document, in a bounded pool of workers under a shared deadline. \
Entries are validated before extraction, each run uses a private sandbox that is always removed, \
and successful conversions are returned as a zip even when some documents fail.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Archive path, HTTP/HTTPS URL, or `-` for stdin.
    #[arg(required_unless_present = "check")]
    input: Option<String>,

    /// Write the output zip to this file instead of stdout.
    #[arg(short, long, env = "DOCBATCH_OUTPUT")]
    output: Option<PathBuf>,

    /// Converter command line, e.g. "norg2md {input} {output}".
    #[arg(long, env = "DOCBATCH_CONVERTER")]
    converter: Option<String>,

    /// Extra environment variable for the converter (KEY=VALUE, repeatable).
    #[arg(long = "converter-env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    converter_env: Vec<(String, String)>,

    /// Working directory for the converter.
    #[arg(long, env = "DOCBATCH_CONVERTER_CWD")]
    converter_cwd: Option<PathBuf>,

    /// Maximum concurrent converter processes.
    #[arg(short, long, env = "DOCBATCH_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Request deadline in seconds.
    #[arg(long, env = "DOCBATCH_TIMEOUT", default_value_t = 300)]
    timeout: u64,

    /// Per-document deadline in seconds.
    #[arg(long, env = "DOCBATCH_JOB_TIMEOUT", default_value_t = 60)]
    job_timeout: u64,

    /// Extension of documents to convert.
    #[arg(long, env = "DOCBATCH_INPUT_EXT", default_value = "norg")]
    input_ext: String,

    /// Extension given to converted documents.
    #[arg(long, env = "DOCBATCH_OUTPUT_EXT", default_value = "md")]
    output_ext: String,

    /// Directory in which per-run sandboxes are created.
    #[arg(long, env = "DOCBATCH_SANDBOX_ROOT")]
    sandbox_root: Option<PathBuf>,

    /// Declared archive content type (hint only; magic bytes win).
    #[arg(long, env = "DOCBATCH_CONTENT_TYPE")]
    content_type: Option<String>,

    /// Fail the whole run if any document fails or is cancelled.
    #[arg(long, env = "DOCBATCH_ALL_OR_NOTHING")]
    all_or_nothing: bool,

    /// Keep each document's directory inside the output zip.
    #[arg(long, env = "DOCBATCH_PRESERVE_DIRS")]
    preserve_dirs: bool,

    /// Write the JSON report to this file.
    #[arg(long, env = "DOCBATCH_REPORT")]
    report: Option<PathBuf>,

    /// Print the JSON report (or failure payload) to stdout.
    #[arg(long, env = "DOCBATCH_JSON", requires = "output")]
    json: bool,

    /// Probe the converter and exit.
    #[arg(long)]
    check: bool,

    /// Disable progress bar.
    #[arg(long, env = "DOCBATCH_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCBATCH_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCBATCH_QUIET")]
    quiet: bool,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "DOCBATCH_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.check;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    match cli.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init(),
    }

    // ── Converter check mode ─────────────────────────────────────────────
    if cli.check {
        let config = build_config(&cli, None)?;
        check_converter(&config)
            .await
            .context("Converter check failed")?;
        if !cli.quiet {
            eprintln!("{} converter is ready", green("✔"));
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress = show_progress.then(CliProgressCallback::new_dynamic);
    let config = build_config(
        &cli,
        progress
            .as_ref()
            .map(|cb| Arc::clone(cb) as ProgressCallback),
    )?;

    // ── Resolve input ────────────────────────────────────────────────────
    let input_str = cli.input.as_deref().context("An input archive is required")?;
    let resolved = input::resolve_input(input_str, cli.download_timeout)
        .await
        .with_context(|| format!("Failed to read {input_str}"))?;
    let hint = cli
        .content_type
        .as_deref()
        .and_then(ArchiveKind::from_content_type)
        .or(resolved.hint);

    // Ctrl-C stops the run; documents already converted are still written.
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let request = BatchRequest::new(resolved.bytes)
        .with_hint(hint)
        .with_cancel(cancel);
    let request_id = request.id();

    // ── Run conversion ───────────────────────────────────────────────────
    let result = convert_archive(request, &config).await;
    if let Some(ref cb) = progress {
        cb.abandon();
    }

    let output = match result {
        Ok(output) => output,
        Err(e) => {
            if cli.json {
                let payload = FailureResponse::new(request_id, &e);
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload).context("Failed to serialise failure")?
                );
                std::process::exit(1);
            }
            return Err(anyhow::Error::new(e).context("Conversion failed"));
        }
    };

    match cli.output {
        Some(ref path) => write_atomic(path, &output.archive)
            .await
            .context("Failed to write output archive")?,
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(&output.archive)
                .context("Failed to write to stdout")?;
            handle.flush().context("Failed to write to stdout")?;
        }
    }

    if let Some(ref path) = cli.report {
        let json = serde_json::to_vec_pretty(&output.report).context("Failed to serialise report")?;
        write_atomic(path, &json)
            .await
            .context("Failed to write report")?;
    }

    if cli.json {
        let json =
            serde_json::to_string_pretty(&output.report).context("Failed to serialise report")?;
        println!("{json}");
    }

    if !cli.quiet {
        print_summary(&output.report, cli.output.as_ref(), !show_progress);
    }
    Ok(())
}

fn print_summary(report: &BatchReport, output: Option<&PathBuf>, with_failures: bool) {
    let stats = &report.stats;
    let target = output
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "stdout".to_string());
    eprintln!(
        "{}  {}/{} documents  {}ms  →  {}",
        if report.is_partial() { cyan("⚠") } else { green("✔") },
        report.converted.len(),
        report.total_documents,
        stats.total_duration_ms,
        bold(&target),
    );
    eprintln!(
        "   {} workers  /  {} in  /  {} out  /  request {}",
        dim(&stats.workers.to_string()),
        dim(&format!("{} B", stats.input_bytes)),
        dim(&format!("{} B", stats.output_bytes)),
        dim(&report.request_id.to_string()),
    );

    // The progress callback already printed per-document failures.
    if with_failures {
        for failed in &report.failed {
            eprintln!("   {} {}", red("✗"), failed.error);
        }
    }
    if !report.cancelled.is_empty() {
        eprintln!(
            "   {} {} documents not converted before the deadline",
            cyan("⚠"),
            report.cancelled.len()
        );
    }
}

/// Map CLI args to `BatchConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<BatchConfig> {
    let mut builder = BatchConfig::builder()
        .max_concurrency(cli.concurrency)
        .request_timeout_secs(cli.timeout)
        .job_timeout_secs(cli.job_timeout)
        .extensions(&cli.input_ext, &cli.output_ext)
        .download_timeout_secs(cli.download_timeout)
        .failure_policy(if cli.all_or_nothing {
            FailurePolicy::AllOrNothing
        } else {
            FailurePolicy::PartialSuccess
        })
        .output_naming(if cli.preserve_dirs {
            OutputNaming::PreserveDirs
        } else {
            OutputNaming::BaseName
        });

    if let Some(ref root) = cli.sandbox_root {
        builder = builder.sandbox_root(root);
    }

    if let Some(ref line) = cli.converter {
        let mut spec = CommandSpec::parse(line).context("Invalid --converter")?;
        for (key, value) in &cli.converter_env {
            spec = spec.env(key, value);
        }
        if let Some(ref dir) = cli.converter_cwd {
            spec = spec.working_dir(dir);
        }
        builder = builder.converter_command(spec);
    }

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
