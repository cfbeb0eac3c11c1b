//! Secure extraction of eligible archive entries into the sandbox.
//!
//! Every entry name is normalised lexically before anything touches the
//! disk. An entry whose name is absolute, carries a drive prefix, or
//! climbs above the archive root with `..` fails the whole request with
//! [`BatchError::PathTraversal`], whether or not it would have been
//! extracted.
//!
//! Eligible files land flat in `inputs/` as `<unique-prefix>_<base-name>`:
//! the archive's directory layout never influences where a file is
//! written, and the prefix keeps same-named files from different
//! directories apart. Files are opened with `create_new`, so an existing
//! path (or a planted symlink) is never followed or overwritten.
//!
//! Symlinks, hard links and device entries are never materialised, and
//! neither are directory entries: with a flat layout there is nothing to
//! put in them.
//!
//! Extraction is all-or-nothing: on any error `inputs/` is emptied before
//! the error propagates. Cancelling the request stops it between entries
//! and between copy chunks.

use crate::config::{ArchiveKind, BatchConfig};
use crate::error::BatchError;
use crate::output::InputDocument;
use crate::pipeline::archive::{self, ArchiveEntry, EntryKind};
use crate::workspace::Sandbox;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// What extraction produced.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub kind: Option<ArchiveKind>,
    /// Eligible documents, in archive order (`id` = position).
    pub documents: Vec<InputDocument>,
    /// Entries seen in the archive, of any type.
    pub entries: usize,
    /// Entries not materialised as documents (directories, ineligible, links, specials).
    pub skipped: usize,
    /// Total bytes written to `inputs/`.
    pub bytes: u64,
}

/// Normalise an archive entry name into a relative path under the root.
///
/// Backslashes are treated as separators (zip tools on Windows emit them).
/// `.` and empty segments are dropped; `..` pops a segment and fails if
/// there is nothing left to pop.
pub fn sanitize_entry_name(name: &str) -> Result<PathBuf, BatchError> {
    let traversal = || BatchError::PathTraversal {
        entry: name.to_string(),
    };

    if name.contains('\0') {
        return Err(traversal());
    }
    let unified = name.replace('\\', "/");
    let path = Path::new(&unified);

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => {
                // `C:foo` is a drive-relative path on Windows.
                if segment.to_string_lossy().contains(':') {
                    return Err(traversal());
                }
                parts.push(segment);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(traversal());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(traversal()),
        }
    }
    Ok(parts.into_iter().collect())
}

/// Extract into the sandbox's `inputs/` on the blocking pool.
///
/// The blocking task holds a [`crate::workspace::SandboxLease`], so if this
/// future is dropped mid-extraction the sandbox is removed only once the
/// task has stopped writing. `cancel` makes it stop early.
pub async fn extract_archive(
    bytes: Vec<u8>,
    hint: Option<ArchiveKind>,
    sandbox: &Sandbox,
    config: &BatchConfig,
    cancel: CancellationToken,
) -> Result<Extraction, BatchError> {
    let lease = sandbox
        .lease()
        .ok_or_else(|| BatchError::Internal("sandbox removed before extraction".into()))?;
    let inputs_dir = sandbox.inputs_dir();
    let config = config.clone();

    tokio::task::spawn_blocking(move || {
        let result = extract_blocking(&bytes, hint, &inputs_dir, &config, &cancel);
        drop(lease);
        result
    })
    .await
    .map_err(|e| BatchError::Internal(format!("extraction task failed: {e}")))?
}

/// Detect the format, then materialise every eligible entry into `inputs_dir`.
///
/// Fails with [`BatchError::NoEligibleDocuments`] if the archive decoded
/// cleanly but held nothing to convert.
pub fn extract_blocking(
    bytes: &[u8],
    hint: Option<ArchiveKind>,
    inputs_dir: &Path,
    config: &BatchConfig,
    cancel: &CancellationToken,
) -> Result<Extraction, BatchError> {
    let kind = archive::detect_kind(bytes, hint)?;
    debug!(%kind, bytes = bytes.len(), "Extracting archive");

    let result = extract_entries(bytes, kind, inputs_dir, config, cancel).and_then(|ex| {
        if ex.documents.is_empty() {
            Err(BatchError::NoEligibleDocuments {
                extension: config.input_extension.clone(),
                entries: ex.entries,
            })
        } else {
            Ok(ex)
        }
    });

    if result.is_err() {
        rollback(inputs_dir);
    }
    result
}

fn extract_entries(
    bytes: &[u8],
    kind: ArchiveKind,
    inputs_dir: &Path,
    config: &BatchConfig,
    cancel: &CancellationToken,
) -> Result<Extraction, BatchError> {
    let mut extraction = Extraction {
        kind: Some(kind),
        ..Extraction::default()
    };
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    let entries = archive::for_each_entry(bytes, kind, |entry| {
        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled {
                documents: extraction.documents.len(),
            });
        }
        let relative = sanitize_entry_name(&entry.name)?;

        match entry.kind {
            EntryKind::Directory => {
                extraction.skipped += 1;
            }
            EntryKind::Other => {
                debug!(entry = %entry.name, "Skipping link or special entry");
                extraction.skipped += 1;
            }
            EntryKind::File if !config.is_eligible(&relative) => {
                extraction.skipped += 1;
            }
            EntryKind::File => {
                let document = write_document(
                    entry,
                    &relative,
                    inputs_dir,
                    kind,
                    extraction.documents.len(),
                    &mut buf,
                    cancel,
                )?;
                extraction.bytes += document.size;
                extraction.documents.push(document);
            }
        }
        Ok(())
    })?;
    extraction.entries = entries;

    debug!(
        entries = extraction.entries,
        documents = extraction.documents.len(),
        skipped = extraction.skipped,
        bytes = extraction.bytes,
        "Archive extracted"
    );
    Ok(extraction)
}

fn ensure_contained(inputs_dir: &Path, dest: &Path, entry: &str) -> Result<(), BatchError> {
    if dest.starts_with(inputs_dir) && dest != inputs_dir {
        Ok(())
    } else {
        Err(BatchError::PathTraversal {
            entry: entry.to_string(),
        })
    }
}

fn write_document(
    entry: ArchiveEntry<'_>,
    relative: &Path,
    inputs_dir: &Path,
    kind: ArchiveKind,
    id: usize,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<InputDocument, BatchError> {
    let base = relative
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dest = inputs_dir.join(format!("{}_{base}", Uuid::new_v4().simple()));
    ensure_contained(inputs_dir, &dest, &entry.name)?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&dest)
        .map_err(|source| BatchError::Extract {
            operation: "create",
            path: dest.clone(),
            source,
        })?;
    let size = stream_entry(entry.reader, &mut file, &dest, &entry.name, kind, buf, cancel)
        .map_err(|e| match e {
            BatchError::Cancelled { .. } => BatchError::Cancelled { documents: id },
            other => other,
        })?;

    if size != entry.size {
        warn!(
            entry = %entry.name,
            declared = entry.size,
            actual = size,
            "Entry size differs from its header"
        );
    }

    Ok(InputDocument {
        id,
        name: relative.to_string_lossy().replace('\\', "/"),
        path: dest,
        size,
    })
}

/// Copy one entry to disk in fixed-size chunks.
///
/// Read failures mean the archive is corrupt; write failures are local I/O.
fn stream_entry(
    reader: &mut dyn Read,
    file: &mut File,
    dest: &Path,
    entry: &str,
    kind: ArchiveKind,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<u64, BatchError> {
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled { documents: 0 });
        }
        let n = match reader.read(buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(BatchError::MalformedArchive {
                    kind: Some(kind),
                    detail: format!("reading entry '{entry}': {e}"),
                })
            }
        };
        file.write_all(&buf[..n])
            .map_err(|source| BatchError::Extract {
                operation: "write",
                path: dest.to_path_buf(),
                source,
            })?;
        total += n as u64;
    }
    file.flush().map_err(|source| BatchError::Extract {
        operation: "flush",
        path: dest.to_path_buf(),
        source,
    })?;
    Ok(total)
}

/// Empty `inputs_dir` after a failed extraction. Best effort.
///
/// Removes the directory's contents rather than the directory, so a
/// rollback never recreates anything.
fn rollback(inputs_dir: &Path) {
    let result = fs::read_dir(inputs_dir).and_then(|entries| {
        entries.into_iter().try_for_each(|entry| {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())
            } else {
                fs::remove_file(entry.path())
            }
        })
    });
    match result {
        Ok(()) => debug!(dir = %inputs_dir.display(), "Rolled back partial extraction"),
        Err(e) => warn!(dir = %inputs_dir.display(), error = %e, "Extraction rollback failed"),
    }
}
