//! Integration tests for the batch pipeline, driven through the public API.
//!
//! A scripted in-process adapter stands in for the converter so these run
//! anywhere; the `/bin/sh` test at the bottom exercises a real process on
//! unix.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use docbatch::{
    convert_archive, convert_bytes, ArchiveKind, BatchConfig, BatchError, BatchRequest,
    CommandSpec, ConversionAdapter, ConversionJob, Deadline, FailurePolicy, FailureResponse,
    JobError, OutputNaming,
};
use std::collections::BTreeSet;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Route library logs through the test harness; `RUST_LOG` adds more.
fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("docbatch=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Adapter whose behaviour is scripted per document name.
#[derive(Default)]
struct ScriptedAdapter {
    delay: Duration,
    /// Documents whose name contains one of these substrings fail.
    fail: Vec<&'static str>,
    /// Documents that take this long instead of `delay`.
    slow: Vec<(&'static str, Duration)>,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
}

impl ScriptedAdapter {
    fn delay_for(&self, name: &str) -> Duration {
        self.slow
            .iter()
            .find(|(needle, _)| name.contains(needle))
            .map(|(_, d)| *d)
            .unwrap_or(self.delay)
    }
}

#[async_trait]
impl ConversionAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn convert(&self, job: &ConversionJob, deadline: &Deadline) -> Result<(), JobError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);

        let delay = self.delay_for(&job.input.name);
        let waited = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = deadline.expired() => false,
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let document = job.input.name.clone();
        if !waited {
            return Err(JobError::Cancelled { document });
        }
        if self.fail.iter().any(|needle| document.contains(needle)) {
            return Err(JobError::ConverterFailed {
                document,
                status: Some(2),
                stderr: "parse error".into(),
            });
        }

        let source = tokio::fs::read_to_string(&job.input.path)
            .await
            .map_err(|e| JobError::Io {
                document: document.clone(),
                detail: e.to_string(),
            })?;
        tokio::fs::write(&job.output_path, format!("# converted\n{source}"))
            .await
            .map_err(|e| JobError::Io {
                document,
                detail: e.to_string(),
            })
    }
}

fn config_with(adapter: Arc<ScriptedAdapter>, sandbox_root: &Path) -> BatchConfig {
    BatchConfig::builder()
        .converter(adapter)
        .sandbox_root(sandbox_root)
        .max_concurrency(3)
        .build()
        .unwrap()
}

fn tar_of(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, body.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap()
}

fn tar_gz_of(files: &[(&str, &str)]) -> Vec<u8> {
    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    gz.write_all(&tar_of(files)).unwrap();
    gz.finish().unwrap()
}

fn zip_of(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    for (name, body) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Entry names and contents of an output zip.
fn unzip(bytes: &[u8]) -> Vec<(String, String)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut file = archive.by_index(i).unwrap();
            let mut body = String::new();
            file.read_to_string(&mut body).unwrap();
            (file.name().to_string(), body)
        })
        .collect()
}

fn assert_empty_dir(dir: &Path) {
    let leftovers: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert!(leftovers.is_empty(), "sandbox left behind: {leftovers:?}");
}

// ── Extraction ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn only_eligible_documents_are_converted() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::default());
    let config = config_with(adapter, root.path());

    let archive = tar_gz_of(&[
        ("wiki/index.norg", "* Index"),
        ("wiki/notes/todo.norg", "- [ ] write tests"),
        ("wiki/README.md", "not a norg file"),
        ("wiki/image.png", "\u{89}PNG"),
        ("wiki/archive.NORG.bak", "nope"),
    ]);

    let output = convert_bytes(archive, &config).await.unwrap();
    assert_eq!(output.report.total_documents, 2);
    assert_eq!(output.report.converted.len(), 2);
    assert!(!output.is_partial());

    let names: BTreeSet<_> = unzip(&output.archive).into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, BTreeSet::from(["index.md".to_string(), "todo.md".to_string()]));
    assert_empty_dir(root.path());
}

#[tokio::test]
async fn traversal_entry_rejects_the_archive() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let config = config_with(Arc::new(ScriptedAdapter::default()), root.path());

    let escape = format!("../../{}/pwned.norg", outside.path().display());
    let archive = zip_of(&[("ok.norg", "* fine"), (escape.as_str(), "* evil")]);

    let err = convert_bytes(archive, &config).await.unwrap_err();
    assert!(matches!(err, BatchError::PathTraversal { .. }), "{err:?}");
    assert!(err.is_client_error());
    assert!(!outside.path().join("pwned.norg").exists());
    assert_empty_dir(root.path());
}

#[tokio::test]
async fn archive_without_documents_is_rejected() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with(Arc::new(ScriptedAdapter::default()), root.path());

    let archive = tar_of(&[("README.md", "hello"), ("src/main.rs", "fn main() {}")]);
    let err = convert_bytes(archive, &config).await.unwrap_err();
    assert!(
        matches!(err, BatchError::NoEligibleDocuments { entries: 2, .. }),
        "{err:?}"
    );
    assert_empty_dir(root.path());
}

#[tokio::test]
async fn garbage_input_is_a_client_error() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with(Arc::new(ScriptedAdapter::default()), root.path());

    let err = convert_bytes(vec![0x00, 0x01], &config).await.unwrap_err();
    assert!(matches!(err, BatchError::ArchiveTooSmall { .. }));

    let err = convert_bytes(vec![0x42; 600], &config).await.unwrap_err();
    assert!(matches!(err, BatchError::MalformedArchive { .. }), "{err:?}");
}

#[tokio::test]
async fn magic_bytes_beat_a_wrong_content_type() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with(Arc::new(ScriptedAdapter::default()), root.path());

    let request = BatchRequest::new(zip_of(&[("a.norg", "* A")])).with_hint(Some(ArchiveKind::TarGz));
    let output = convert_archive(request, &config).await.unwrap();
    assert_eq!(output.report.converted.len(), 1);
}

// ── Conversion ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn round_trip_keeps_content_and_base_names() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with(Arc::new(ScriptedAdapter::default()), root.path());

    let files: Vec<(String, String)> = (0..7)
        .map(|i| (format!("notes/day{i}.norg"), format!("* Day {i}")))
        .collect();
    let refs: Vec<(&str, &str)> = files.iter().map(|(n, b)| (n.as_str(), b.as_str())).collect();

    let output = convert_bytes(zip_of(&refs), &config).await.unwrap();
    let mut entries = unzip(&output.archive);
    entries.sort();

    assert_eq!(entries.len(), 7);
    for (i, (name, body)) in entries.iter().enumerate() {
        assert_eq!(name, &format!("day{i}.md"));
        assert_eq!(body, &format!("# converted\n* Day {i}"));
    }
}

#[tokio::test]
async fn colliding_base_names_stay_distinct() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with(Arc::new(ScriptedAdapter::default()), root.path());

    let archive = tar_of(&[("a/index.norg", "A"), ("b/index.norg", "B"), ("c/Index.norg", "C")]);
    let output = convert_bytes(archive, &config).await.unwrap();

    let names: BTreeSet<_> = unzip(&output.archive).into_iter().map(|(n, _)| n).collect();
    assert_eq!(names.len(), 3);
    assert!(names.contains("index.md"));
}

#[tokio::test]
async fn preserve_dirs_keeps_structure() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = BatchConfig::builder()
        .converter(Arc::new(ScriptedAdapter::default()))
        .sandbox_root(root.path())
        .output_naming(OutputNaming::PreserveDirs)
        .build()
        .unwrap();

    let archive = tar_of(&[("a/index.norg", "A"), ("b/index.norg", "B")]);
    let output = convert_bytes(archive, &config).await.unwrap();

    let names: BTreeSet<_> = unzip(&output.archive).into_iter().map(|(n, _)| n).collect();
    assert_eq!(
        names,
        BTreeSet::from(["a/index.md".to_string(), "b/index.md".to_string()])
    );
}

#[tokio::test]
async fn concurrency_never_exceeds_the_ceiling() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter {
        delay: Duration::from_millis(40),
        ..Default::default()
    });
    let config = config_with(Arc::clone(&adapter), root.path());

    let files: Vec<(String, String)> = (0..10).map(|i| (format!("{i}.norg"), format!("{i}"))).collect();
    let refs: Vec<(&str, &str)> = files.iter().map(|(n, b)| (n.as_str(), b.as_str())).collect();

    let output = convert_bytes(tar_of(&refs), &config).await.unwrap();
    assert_eq!(output.report.converted.len(), 10);
    assert_eq!(output.report.stats.workers, 3);
    let high_water = adapter.high_water.load(Ordering::SeqCst);
    assert!(high_water <= 3, "high water mark {high_water}");
    assert!(high_water >= 2, "workers never overlapped");
}

#[tokio::test]
async fn failures_do_not_sink_the_batch() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter {
        fail: vec!["doc2", "doc4"],
        ..Default::default()
    });
    let config = config_with(adapter, root.path());

    let archive = tar_of(&[
        ("doc1.norg", "1"),
        ("doc2.norg", "2"),
        ("doc3.norg", "3"),
        ("doc4.norg", "4"),
        ("doc5.norg", "5"),
    ]);
    let output = convert_bytes(archive, &config).await.unwrap();

    assert!(output.is_partial());
    assert_eq!(output.report.converted.len(), 3);
    assert_eq!(output.report.failed.len(), 2);
    let failed: BTreeSet<_> = output.report.failed.iter().map(|f| f.document.as_str()).collect();
    assert_eq!(failed, BTreeSet::from(["doc2.norg", "doc4.norg"]));
    assert!(output.report.failed[0].error.contains("parse error"));

    let names: BTreeSet<_> = unzip(&output.archive).into_iter().map(|(n, _)| n).collect();
    assert_eq!(
        names,
        BTreeSet::from(["doc1.md".to_string(), "doc3.md".to_string(), "doc5.md".to_string()])
    );
    assert_empty_dir(root.path());
}

#[tokio::test]
async fn all_or_nothing_turns_one_failure_into_an_error() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = BatchConfig::builder()
        .converter(Arc::new(ScriptedAdapter {
            fail: vec!["bad"],
            ..Default::default()
        }))
        .sandbox_root(root.path())
        .failure_policy(FailurePolicy::AllOrNothing)
        .build()
        .unwrap();

    let archive = tar_of(&[("good.norg", "1"), ("bad.norg", "2")]);
    let err = convert_bytes(archive, &config).await.unwrap_err();
    assert!(
        matches!(err, BatchError::BatchFailed { failed: 1, total: 2, .. }),
        "{err:?}"
    );
    assert_empty_dir(root.path());
}

// ── Deadlines and cancellation ───────────────────────────────────────────────

#[tokio::test]
async fn expired_deadline_returns_promptly_and_cleans_up() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = BatchConfig::builder()
        .converter(Arc::new(ScriptedAdapter {
            delay: Duration::from_secs(30),
            ..Default::default()
        }))
        .sandbox_root(root.path())
        .request_timeout(Duration::from_millis(200))
        .build()
        .unwrap();

    let started = Instant::now();
    let archive = tar_of(&[("a.norg", "a"), ("b.norg", "b"), ("c.norg", "c")]);
    let err = convert_bytes(archive, &config).await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, BatchError::DeadlineExceeded { .. }), "{err:?}");
    assert_empty_dir(root.path());
}

#[tokio::test]
async fn deadline_keeps_documents_that_finished() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = BatchConfig::builder()
        .converter(Arc::new(ScriptedAdapter {
            slow: vec![("slow", Duration::from_secs(30))],
            ..Default::default()
        }))
        .sandbox_root(root.path())
        .request_timeout(Duration::from_millis(500))
        .build()
        .unwrap();

    let archive = tar_of(&[("fast.norg", "f"), ("slow.norg", "s")]);
    let output = convert_bytes(archive, &config).await.unwrap();

    assert!(output.report.deadline_exceeded);
    assert_eq!(output.report.converted.len(), 1);
    assert_eq!(output.report.converted[0].entry, "fast.md");
    assert_eq!(output.report.failed.len() + output.report.cancelled.len(), 1);
}

#[tokio::test]
async fn caller_cancellation_stops_the_run() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = BatchConfig::builder()
        .converter(Arc::new(ScriptedAdapter {
            delay: Duration::from_secs(30),
            ..Default::default()
        }))
        .sandbox_root(root.path())
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let request = BatchRequest::new(tar_of(&[("a.norg", "a")])).with_cancel(cancel.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let err = convert_archive(request, &config).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, BatchError::DeadlineExceeded { .. }), "{err:?}");
    assert_empty_dir(root.path());
}

#[tokio::test]
async fn dropped_request_leaves_no_sandbox_behind() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with(Arc::new(ScriptedAdapter::default()), root.path());

    // One large, highly compressible document keeps extraction busy on the
    // blocking pool; the directory entry after it must never be created.
    let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
        Vec::new(),
        flate2::Compression::fast(),
    ));
    let big_size: u64 = 96 * 1024 * 1024;
    let mut header = tar::Header::new_gnu();
    header.set_size(big_size);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "big.norg", std::io::repeat(b'*').take(big_size))
        .unwrap();
    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o755);
    dir.set_cksum();
    builder
        .append_data(&mut dir, "late/nested/", std::io::empty())
        .unwrap();
    let archive = builder.into_inner().unwrap().finish().unwrap();

    let dropped = tokio::time::timeout(Duration::from_millis(30), convert_bytes(archive, &config))
        .await
        .is_err();
    assert!(dropped, "extraction finished before the request was dropped");

    let give_up = Instant::now() + Duration::from_secs(30);
    loop {
        let leftovers: Vec<_> = std::fs::read_dir(root.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        if leftovers.is_empty() {
            break;
        }
        assert!(
            Instant::now() < give_up,
            "sandbox survived the dropped request: {leftovers:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Stays empty once the blocking task has wound down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_empty_dir(root.path());
}

// ── Failure payload ──────────────────────────────────────────────────────────

#[tokio::test]
async fn failure_response_carries_the_request_id() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = config_with(Arc::new(ScriptedAdapter::default()), root.path());

    let request = BatchRequest::new(vec![0x00; 3]);
    let id = request.id();
    let err = convert_archive(request, &config).await.unwrap_err();

    let payload = serde_json::to_value(FailureResponse::new(id, &err)).unwrap();
    assert_eq!(payload["id"], id.to_string());
    assert_eq!(payload["kind"], "archive_too_small");
    assert!(payload["error"].as_str().unwrap().contains("too small"));
}

#[tokio::test]
async fn missing_converter_is_reported_before_extraction() {
    init_test_logging();
    // Set by some developer machines; would be picked up as a fallback.
    if std::env::var_os("DOCBATCH_CONVERTER").is_some() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let config = BatchConfig::builder()
        .sandbox_root(root.path())
        .build()
        .unwrap();

    let err = convert_bytes(tar_of(&[("a.norg", "a")]), &config).await.unwrap_err();
    assert!(matches!(err, BatchError::ConverterNotConfigured { .. }), "{err:?}");
    assert_empty_dir(root.path());
}

// ── Real converter process ───────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn shell_converter_end_to_end() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let spec = CommandSpec::new("/bin/sh")
        .args(["-c", "tr a-z A-Z < \"$1\" > \"$2\"", "norg2md"])
        .probe_args(Vec::<String>::new());
    let config = BatchConfig::builder()
        .converter_command(spec)
        .sandbox_root(root.path())
        .build()
        .unwrap();

    let archive = tar_gz_of(&[("one.norg", "* hello"), ("dir/two.norg", "* world")]);
    let output = convert_bytes(archive, &config).await.unwrap();

    let mut entries = unzip(&output.archive);
    entries.sort();
    assert_eq!(
        entries,
        vec![
            ("one.md".to_string(), "* HELLO".to_string()),
            ("two.md".to_string(), "* WORLD".to_string()),
        ]
    );
    assert_empty_dir(root.path());
}

#[cfg(unix)]
#[tokio::test]
async fn shell_converter_failure_is_per_document() {
    init_test_logging();
    let root = tempfile::tempdir().unwrap();
    let spec = CommandSpec::new("/bin/sh")
        .args([
            "-c",
            "case \"$1\" in *broken*) echo 'unexpected token' >&2; exit 3;; esac; cp \"$1\" \"$2\"",
            "norg2md",
        ])
        .probe_args(Vec::<String>::new());
    let config = BatchConfig::builder()
        .converter_command(spec)
        .sandbox_root(root.path())
        .build()
        .unwrap();

    let archive = zip_of(&[("fine.norg", "ok"), ("broken.norg", "??")]);
    let output = convert_bytes(archive, &config).await.unwrap();

    assert_eq!(output.report.converted.len(), 1);
    assert_eq!(output.report.failed.len(), 1);
    let failure = &output.report.failed[0];
    assert_eq!(failure.document, "broken.norg");
    assert!(failure.error.contains("unexpected token"), "{}", failure.error);
}
