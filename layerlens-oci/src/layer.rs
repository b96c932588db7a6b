//! Reading file listings and single files out of layer archives.
//!
//! Layers are read straight from the blob store, decompressing on the fly;
//! nothing is unpacked to disk. Archive paths are normalized to the form
//! used everywhere else in the crate: forward slashes, no leading `/` or
//! `./`, no trailing `/`.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, warn};

use crate::error::{OciError, Result};

/// Hard links may point at other hard links; stop following after this many.
const MAX_LINK_HOPS: usize = 8;

/// Normalize an archive or user-supplied path. Returns `None` for the root.
pub fn normalize_path(raw: &str) -> Option<String> {
    let unified = raw.replace('\\', "/");
    let mut path = unified.as_str();
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest;
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest;
        } else {
            break;
        }
    }
    let path = path.trim_end_matches('/');
    if path.is_empty() || path == "." {
        None
    } else {
        Some(path.to_string())
    }
}

/// List every non-directory entry of the layer at `path`.
pub fn list_files(path: &Path, media_type: &str) -> Result<BTreeSet<String>> {
    let mut archive = open_archive(path, media_type)?;
    let mut files = BTreeSet::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let kind = entry.header().entry_type();
        if kind.is_dir() || is_extension_header(kind) {
            continue;
        }
        let raw = entry.path()?;
        if let Some(name) = normalize_path(&raw.to_string_lossy()) {
            files.insert(name);
        }
    }
    debug!(path = %path.display(), files = files.len(), "indexed layer");
    Ok(files)
}

/// Copy the contents of `target` from the layer at `path` into `out`.
/// Returns `false` if the layer has no such entry. Hard links are followed
/// within the same layer.
pub fn extract_file<W: Write>(
    path: &Path,
    media_type: &str,
    target: &str,
    out: &mut W,
) -> Result<bool> {
    let Some(mut wanted) = normalize_path(target) else {
        return Err(OciError::Layer("cannot extract the root directory".to_string()));
    };

    for _ in 0..MAX_LINK_HOPS {
        match copy_entry(path, media_type, &wanted, out)? {
            Lookup::Copied => return Ok(true),
            Lookup::Missing => return Ok(false),
            Lookup::HardLink(next) => {
                debug!(from = %wanted, to = %next, "following hard link");
                wanted = next;
            }
        }
    }
    Err(OciError::Layer(format!(
        "too many hard link hops resolving {target}"
    )))
}

enum Lookup {
    Copied,
    Missing,
    HardLink(String),
}

fn copy_entry<W: Write>(path: &Path, media_type: &str, wanted: &str, out: &mut W) -> Result<Lookup> {
    let mut archive = open_archive(path, media_type)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        if normalize_path(&name).as_deref() != Some(wanted) {
            continue;
        }

        let kind = entry.header().entry_type();
        match kind {
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                io::copy(&mut entry, out)?;
                return Ok(Lookup::Copied);
            }
            EntryType::Link => {
                let link = entry
                    .link_name()?
                    .map(|l| l.to_string_lossy().to_string())
                    .and_then(|l| normalize_path(&l))
                    .ok_or_else(|| OciError::Layer(format!("hard link {wanted} has no target")))?;
                return Ok(Lookup::HardLink(link));
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()?
                    .map(|l| l.to_string_lossy().to_string())
                    .unwrap_or_default();
                return Err(OciError::Layer(format!("{wanted} is a symlink to {link}")));
            }
            EntryType::Directory => {
                return Err(OciError::Layer(format!("{wanted} is a directory")));
            }
            other => {
                return Err(OciError::Layer(format!(
                    "{wanted} is not a regular file ({other:?})"
                )));
            }
        }
    }
    Ok(Lookup::Missing)
}

/// [`list_files`] on the blocking pool.
pub async fn list_files_async(path: PathBuf, media_type: String) -> Result<BTreeSet<String>> {
    tokio::task::spawn_blocking(move || list_files(&path, &media_type))
        .await
        .map_err(|e| OciError::Layer(format!("index task panicked: {}", e)))?
}

/// [`extract_file`] into memory, on the blocking pool.
pub async fn read_file_async(
    path: PathBuf,
    media_type: String,
    target: String,
) -> Result<Option<Vec<u8>>> {
    tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        let found = extract_file(&path, &media_type, &target, &mut buf)?;
        Ok(found.then_some(buf))
    })
    .await
    .map_err(|e| OciError::Layer(format!("extract task panicked: {}", e)))?
}

// ---------------------------------------------------------------------------
// Compression helpers
// ---------------------------------------------------------------------------

fn open_archive(path: &Path, media_type: &str) -> Result<Archive<Box<dyn Read>>> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            OciError::NotFound(format!("layer blob {}", path.display()))
        } else {
            e.into()
        }
    })?;
    let reader = decompressor(media_type, BufReader::new(file))?;
    Ok(Archive::new(reader))
}

/// Return a `Read`er that decompresses `data` according to the OCI media type.
fn decompressor<'a, R: Read + 'a>(media_type: &str, data: R) -> Result<Box<dyn Read + 'a>> {
    if media_type.contains("gzip") {
        Ok(Box::new(GzDecoder::new(data)))
    } else if media_type.contains("zstd") {
        let decoder =
            zstd::Decoder::new(data).map_err(|e| OciError::Layer(format!("zstd init: {}", e)))?;
        Ok(Box::new(decoder))
    } else if media_type.ends_with("tar") {
        Ok(Box::new(data))
    } else {
        warn!(media_type, "unknown compression; assuming gzip");
        Ok(Box::new(GzDecoder::new(data)))
    }
}

fn is_extension_header(kind: EntryType) -> bool {
    matches!(
        kind,
        EntryType::XGlobalHeader | EntryType::XHeader | EntryType::GNULongName | EntryType::GNULongLink
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
