//! Archive codec: tar / tar.gz / zip in, zip out.
//!
//! The format is sniffed from magic bytes first and the declared kind is
//! only a fallback, so a `.tar.gz` uploaded as `application/zip` still
//! decodes. Decoding is streaming: [`for_each_entry`] hands each entry to
//! a visitor together with a reader over its contents, so no entry is
//! buffered whole.

use crate::config::ArchiveKind;
use crate::error::BatchError;
use crate::output::OutputDocument;
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Cursor, Read};
use tracing::{debug, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Bytes needed before any format can be recognised.
const MIN_PROBE_LEN: usize = 4;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGICS: [&[u8; 4]; 3] = [b"PK\x03\x04", b"PK\x05\x06", b"PK\x07\x08"];
const USTAR_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8; 5] = b"ustar";

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// What an archive entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Symlinks, hard links, devices, FIFOs. Never materialised.
    Other,
}

/// One decoded entry, valid for the duration of a visitor call.
pub struct ArchiveEntry<'a> {
    /// Name as declared in the archive. Untrusted.
    pub name: String,
    pub kind: EntryKind,
    /// Declared uncompressed size.
    pub size: u64,
    pub reader: &'a mut dyn Read,
}

/// Recognise the archive format from its leading bytes.
pub fn sniff(bytes: &[u8]) -> Option<ArchiveKind> {
    if bytes.starts_with(&GZIP_MAGIC) {
        return Some(ArchiveKind::TarGz);
    }
    if ZIP_MAGICS.iter().any(|magic| bytes.starts_with(*magic)) {
        return Some(ArchiveKind::Zip);
    }
    if bytes.len() >= USTAR_OFFSET + USTAR_MAGIC.len()
        && &bytes[USTAR_OFFSET..USTAR_OFFSET + USTAR_MAGIC.len()] == USTAR_MAGIC
    {
        return Some(ArchiveKind::Tar);
    }
    None
}

/// Decide the archive kind and apply the minimum-size guard.
///
/// Magic bytes win; `hint` is used only when sniffing fails (e.g. a
/// pre-POSIX tar without the `ustar` marker).
pub fn detect_kind(bytes: &[u8], hint: Option<ArchiveKind>) -> Result<ArchiveKind, BatchError> {
    if bytes.len() < MIN_PROBE_LEN {
        return Err(BatchError::ArchiveTooSmall {
            size: bytes.len(),
            minimum: MIN_PROBE_LEN,
        });
    }

    let kind = match (sniff(bytes), hint) {
        (Some(sniffed), Some(declared)) if sniffed != declared => {
            warn!(%sniffed, %declared, "Declared archive kind does not match content; using content");
            sniffed
        }
        (Some(sniffed), _) => sniffed,
        (None, Some(declared)) => {
            debug!(%declared, "No magic bytes recognised; trusting declared kind");
            declared
        }
        (None, None) => {
            return Err(BatchError::MalformedArchive {
                kind: None,
                detail: "unrecognised archive format (expected tar, tar.gz or zip)".into(),
            })
        }
    };

    if bytes.len() < kind.minimum_size() {
        return Err(BatchError::ArchiveTooSmall {
            size: bytes.len(),
            minimum: kind.minimum_size(),
        });
    }
    Ok(kind)
}

/// Walk every entry of the archive, in archive order.
///
/// Returns the number of entries visited. Decoding errors surface as
/// [`BatchError::MalformedArchive`]; visitor errors are passed through and
/// stop the walk.
pub fn for_each_entry<F>(bytes: &[u8], kind: ArchiveKind, mut visit: F) -> Result<usize, BatchError>
where
    F: FnMut(ArchiveEntry<'_>) -> Result<(), BatchError>,
{
    match kind {
        ArchiveKind::Tar => visit_tar(tar::Archive::new(bytes), kind, &mut visit),
        ArchiveKind::TarGz => visit_tar(tar::Archive::new(GzDecoder::new(bytes)), kind, &mut visit),
        ArchiveKind::Zip => visit_zip(bytes, &mut visit),
    }
}

fn malformed(kind: ArchiveKind, detail: impl ToString) -> BatchError {
    BatchError::MalformedArchive {
        kind: Some(kind),
        detail: detail.to_string(),
    }
}

fn visit_tar<R, F>(mut archive: tar::Archive<R>, kind: ArchiveKind, visit: &mut F) -> Result<usize, BatchError>
where
    R: Read,
    F: FnMut(ArchiveEntry<'_>) -> Result<(), BatchError>,
{
    let mut count = 0;
    for entry in archive.entries().map_err(|e| malformed(kind, e))? {
        let mut entry = entry.map_err(|e| malformed(kind, e))?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let entry_type = entry.header().entry_type();
        let entry_kind = if entry_type.is_dir() {
            EntryKind::Directory
        } else if entry_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        let size = entry.size();
        count += 1;
        visit(ArchiveEntry {
            name,
            kind: entry_kind,
            size,
            reader: &mut entry,
        })?;
    }
    Ok(count)
}

fn visit_zip<F>(bytes: &[u8], visit: &mut F) -> Result<usize, BatchError>
where
    F: FnMut(ArchiveEntry<'_>) -> Result<(), BatchError>,
{
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| malformed(ArchiveKind::Zip, e))?;

    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| malformed(ArchiveKind::Zip, e))?;
        let is_link = file
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK);
        let entry_kind = if file.is_dir() {
            EntryKind::Directory
        } else if is_link {
            EntryKind::Other
        } else {
            EntryKind::File
        };
        let name = file.name().to_string();
        let size = file.size();
        visit(ArchiveEntry {
            name,
            kind: entry_kind,
            size,
            reader: &mut file,
        })?;
    }
    Ok(archive.len())
}

/// Package converted documents into a deflate-compressed zip.
///
/// Entry names must already be unique; every byte of every document is
/// streamed from disk exactly once.
pub fn encode_zip(documents: &[OutputDocument]) -> Result<Vec<u8>, BatchError> {
    let encode_err = |detail: String| BatchError::Encode { detail };

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    let mut seen = HashSet::with_capacity(documents.len());

    for doc in documents {
        if !seen.insert(doc.name.as_str()) {
            return Err(encode_err(format!("duplicate entry name '{}'", doc.name)));
        }

        let mut file = File::open(&doc.path)
            .map_err(|e| encode_err(format!("open '{}': {e}", doc.path.display())))?;
        writer
            .start_file(doc.name.as_str(), options)
            .map_err(|e| encode_err(format!("start entry '{}': {e}", doc.name)))?;
        let written = io::copy(&mut file, &mut writer)
            .map_err(|e| encode_err(format!("write entry '{}': {e}", doc.name)))?;

        if written != doc.size {
            return Err(encode_err(format!(
                "'{}' changed size while packaging ({} → {written} bytes)",
                doc.name, doc.size
            )));
        }
        debug!(entry = %doc.name, bytes = written, "Added entry to output archive");
    }

    let cursor = writer
        .finish()
        .map_err(|e| encode_err(format!("finish archive: {e}")))?;
    Ok(cursor.into_inner())
}
