//! Jar canonicalization
//!
//! Rewrites a jar so that every entry carries the zero timestamp and is
//! stored uncompressed, which keeps binary deltas between successive
//! versions limited to real content changes. A jar that already contains a
//! zero-timestamp entry is treated as canonical as a whole and copied through
//! byte for byte; a rewrite is only ever committed complete.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

/// Errors for canonicalization
#[derive(Debug, Error)]
pub enum CanonicalizeError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("zip error in {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: ZipError,
    },
}

impl CanonicalizeError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn zip(path: &Path) -> impl FnOnce(ZipError) -> Self + '_ {
        move |source| Self::Zip {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What canonicalization did with an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalizeOutcome {
    /// Every entry was rewritten with zero timestamps and stored method.
    Rewritten { entries: usize },
    /// A zero-timestamp entry was found; the input was copied verbatim.
    AlreadyCanonical,
}

/// The timestamp written to, and recognised on, canonical entries.
///
/// This is the DOS epoch, the smallest time a zip entry can carry.
pub fn zero_timestamp() -> DateTime {
    DateTime::default()
}

/// Whether `t` is the canonical zero timestamp.
pub fn is_zero_timestamp(t: &DateTime) -> bool {
    let zero = zero_timestamp();
    t.datepart() == zero.datepart() && t.timepart() == zero.timepart()
}

/// Canonicalize the jar at `input` into `output`.
pub fn canonicalize(input: &Path, output: &Path) -> Result<CanonicalizeOutcome, CanonicalizeError> {
    let file = File::open(input).map_err(CanonicalizeError::io(input))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(CanonicalizeError::zip(input))?;

    let staging_dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let staged = NamedTempFile::new_in(staging_dir).map_err(CanonicalizeError::io(staging_dir))?;
    let mut writer = ZipWriter::new(staged);

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(CanonicalizeError::zip(input))?;

        if entry.last_modified().is_some_and(|t| is_zero_timestamp(&t)) {
            debug!(path = %input.display(), entry = entry.name(), "zero timestamp found, copying verbatim");
            drop(entry);
            drop(writer);
            copy_verbatim(input, output)?;
            return Ok(CanonicalizeOutcome::AlreadyCanonical);
        }

        if i == 0 {
            info!(path = %input.display(), "processing");
        }

        let mut options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(zero_timestamp())
            .large_file(entry.size() >= u64::from(u32::MAX));
        if let Some(mode) = entry.unix_mode() {
            options = options.unix_permissions(mode);
        }

        let name = entry.name().to_string();
        if entry.is_dir() {
            writer
                .add_directory(name, options)
                .map_err(CanonicalizeError::zip(output))?;
        } else {
            writer
                .start_file(name, options)
                .map_err(CanonicalizeError::zip(output))?;
            io::copy(&mut entry, &mut writer).map_err(CanonicalizeError::io(input))?;
        }
    }

    let entries = archive.len();
    let staged = writer.finish().map_err(CanonicalizeError::zip(output))?;
    staged
        .persist(output)
        .map_err(|e| CanonicalizeError::io(output)(e.error))?;

    Ok(CanonicalizeOutcome::Rewritten { entries })
}

fn copy_verbatim(input: &Path, output: &Path) -> Result<(), CanonicalizeError> {
    fs::copy(input, output).map_err(CanonicalizeError::io(output))?;
    Ok(())
}
