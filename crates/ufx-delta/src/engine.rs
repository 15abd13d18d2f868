//! Patch generation over a directory of numbered jars.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::gdiff;

/// Errors from patch generation
#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no jars to diff in {0}")]
    NoArtifacts(PathBuf),
}

/// Metadata describing one generated patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    /// Version the patch produces
    pub version: u32,
    /// Patch file written to the output directory
    pub path: PathBuf,
    /// Size of the patch file in bytes
    pub patch_size: u64,
    /// SHA-256 of the previous jar
    pub pre_hash: [u8; 32],
    /// SHA-256 of the patch file bytes as written
    pub patch_hash: [u8; 32],
    /// SHA-256 of the target jar
    pub post_hash: [u8; 32],
}

impl PatchRecord {
    /// Whether the patch file was gzip-compressed.
    pub fn is_gzipped(&self, gzip_from: i64) -> bool {
        i64::from(self.version) >= gzip_from
    }
}

/// Compute patches for every consecutive pair of jars in `in_dir`.
///
/// Starts from the lowest numbered jar and stops at the first gap.
pub fn process_all(in_dir: &Path, out_dir: &Path, gzip_from: i64) -> Result<Vec<PatchRecord>, DeltaError> {
    let first = lowest_version(in_dir)?.ok_or_else(|| DeltaError::NoArtifacts(in_dir.to_path_buf()))?;

    let mut results = Vec::new();
    let mut last = first;
    while let Some(num) = last.checked_add(1) {
        let prev = in_dir.join(format!("{}.jar", last));
        let cur = in_dir.join(format!("{}.jar", num));
        if !(prev.is_file() && cur.is_file()) {
            break;
        }
        results.push(process_pair(&prev, &cur, out_dir, num, gzip_from)?);
        last = num;
    }
    Ok(results)
}

/// Compute the patch from `prev` to `cur`, written as `<version>.jar.bpatch`.
pub fn process_pair(
    prev: &Path,
    cur: &Path,
    out_dir: &Path,
    version: u32,
    gzip_from: i64,
) -> Result<PatchRecord, DeltaError> {
    info!(prev = %prev.display(), cur = %cur.display(), "calculating delta");

    let source = read(prev)?;
    let target = read(cur)?;
    let patch_path = out_dir.join(format!("{}.jar.bpatch", version));
    let gzipping = i64::from(version) >= gzip_from;

    let patch = encode_patch(&source, &target, gzipping).map_err(|source| DeltaError::Io {
        path: patch_path.clone(),
        source,
    })?;

    if patch_path.exists() {
        fs::remove_file(&patch_path).map_err(|source| DeltaError::Io {
            path: patch_path.clone(),
            source,
        })?;
    }
    fs::write(&patch_path, &patch).map_err(|source| DeltaError::Io {
        path: patch_path.clone(),
        source,
    })?;

    let record = PatchRecord {
        version,
        path: patch_path,
        patch_size: patch.len() as u64,
        pre_hash: sha256(&source),
        patch_hash: sha256(&patch),
        post_hash: sha256(&target),
    };
    debug!(
        version,
        size_kb = record.patch_size as f64 / 1024.0,
        gzipped = gzipping,
        patch_hash = %hex::encode(record.patch_hash),
        "delta written"
    );
    Ok(record)
}

fn encode_patch(source: &[u8], target: &[u8], gzip: bool) -> io::Result<Vec<u8>> {
    if gzip {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        gdiff::write_diff(source, target, encoder)?.finish()
    } else {
        gdiff::write_diff(source, target, Vec::new())
    }
}

fn lowest_version(dir: &Path) -> Result<Option<u32>, DeltaError> {
    let entries = fs::read_dir(dir).map_err(|source| DeltaError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut lowest = None;
    for entry in entries {
        let entry = entry.map_err(|source| DeltaError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let version = name
            .to_str()
            .and_then(|n| n.strip_suffix(".jar"))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(v) = version {
            lowest = Some(lowest.map_or(v, |l: u32| l.min(v)));
        }
    }
    Ok(lowest)
}

fn read(path: &Path) -> Result<Vec<u8>, DeltaError> {
    fs::read(path).map_err(|source| DeltaError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
