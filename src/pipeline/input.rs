//! Input resolution: load the inbound archive from a path, a URL or stdin.
//!
//! The archive is read into memory whole, since the codec sniffs the
//! leading bytes and zip needs random access to its central directory.
//! Besides the bytes, resolution yields a *hint* for the archive kind:
//! the file extension for paths, the `Content-Type` header (falling back
//! to the URL path) for downloads. The hint is only consulted when magic
//! bytes are inconclusive.

use crate::config::ArchiveKind;
use crate::error::BatchError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Sentinel input meaning "read the archive from stdin".
pub const STDIN_INPUT: &str = "-";

/// An inbound archive loaded into memory.
#[derive(Debug, Clone)]
pub struct ResolvedArchive {
    pub bytes: Vec<u8>,
    pub hint: Option<ArchiveKind>,
    /// Where the bytes came from, for logs.
    pub source: String,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a CLI-style input string to archive bytes.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedArchive, BatchError> {
    if input == STDIN_INPUT {
        read_stdin().await
    } else if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(Path::new(input)).await
    }
}

/// Read a local archive, mapping the common failures to friendly errors.
pub async fn read_local(path: &Path) -> Result<ResolvedArchive, BatchError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => BatchError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => BatchError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;

    debug!(path = %path.display(), bytes = bytes.len(), "Read local archive");
    Ok(ResolvedArchive {
        bytes,
        hint: ArchiveKind::from_path(path),
        source: path.display().to_string(),
    })
}

async fn read_stdin() -> Result<ResolvedArchive, BatchError> {
    let bytes = tokio::task::spawn_blocking(|| {
        let mut buf = Vec::new();
        std::io::stdin().lock().read_to_end(&mut buf).map(|_| buf)
    })
    .await
    .map_err(|e| BatchError::Internal(format!("stdin reader failed: {e}")))?
    .map_err(|e| BatchError::Internal(format!("reading stdin: {e}")))?;

    debug!(bytes = bytes.len(), "Read archive from stdin");
    Ok(ResolvedArchive {
        bytes,
        hint: None,
        source: "<stdin>".to_string(),
    })
}

/// Download an archive; the response's content type becomes the hint.
async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedArchive, BatchError> {
    info!("Downloading archive from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| BatchError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let download_err = |e: reqwest::Error| {
        if e.is_timeout() {
            BatchError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            BatchError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let response = client.get(url).send().await.map_err(download_err)?;

    if !response.status().is_success() {
        return Err(BatchError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let hint = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(ArchiveKind::from_content_type)
        .or_else(|| hint_from_url(url));

    let bytes = response.bytes().await.map_err(download_err)?.to_vec();
    info!(bytes = bytes.len(), hint = ?hint, "Downloaded archive");

    Ok(ResolvedArchive {
        bytes,
        hint,
        source: url.to_string(),
    })
}

/// Use the last URL path segment as a file name hint.
fn hint_from_url(url: &str) -> Option<ArchiveKind> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    ArchiveKind::from_path(&PathBuf::from(last))
}
