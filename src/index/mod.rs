//! Update index building
//!
//! Prepares artifacts for diffing, asks the Delta Engine for patches and
//! assembles the unsigned [`Updates`] index.
//!
//! Artifacts at or above the gzip threshold are canonicalized into
//! `builds/processed/`; older ones are copied unchanged so that their patches
//! (and hashes) stay what deployed clients already know.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex_lite::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};
use ufx_protocol::{Update, Updates, INDEX_FORMAT_VERSION};
use walkdir::WalkDir;
use zip::result::ZipError;

use crate::canonical::{canonicalize, CanonicalizeError, CanonicalizeOutcome};
use crate::config::BaseUrl;
use crate::delta::{DeltaEngine, DeltaError, PatchRecord};
use crate::description::{read_description, BuildWarning, UpdateDescriptor};
use crate::layout::WorkingDir;

/// Errors while building an index
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Working directory must have a builds subdirectory: {0}")]
    MissingBuilds(PathBuf),

    #[error("artifact name is not <version>.jar: {0}")]
    BadArtifactName(PathBuf),

    #[error("no artifacts found in {0}")]
    NoArtifacts(PathBuf),

    #[error("artifact for version {version} not found at {path}")]
    MissingArtifact { version: u32, path: PathBuf },

    #[error("version {version} needs the prepared artifact of version {previous} at {path}; run a full build first")]
    MissingPrevious {
        version: u32,
        previous: u32,
        path: PathBuf,
    },

    #[error("incremental build needs version >= 2, got {0}")]
    NoPreviousVersion(u32),

    #[error("version {0} does not fit the index (maximum 2147483647)")]
    VersionOutOfRange(u32),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("canonicalization failed: {0}")]
    Canonicalize(#[from] CanonicalizeError),

    #[error("delta engine failed: {0}")]
    Delta(#[from] DeltaError),

    #[error("invalid artifact pattern: {0}")]
    Pattern(#[from] regex_lite::Error),

    #[error("cannot read description of {path}: {source}")]
    Description {
        path: PathBuf,
        #[source]
        source: ZipError,
    },
}

/// Largest version the wire index can carry.
pub const MAX_VERSION: u32 = i32::MAX as u32;

/// Unsigned index plus the soft faults noticed on the way
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltIndex {
    pub updates: Updates,
    /// One per prepared artifact lacking a usable description, whether or
    /// not that version received a patch.
    pub warnings: Vec<BuildWarning>,
}

/// Builds update indexes for one working directory.
pub struct IndexBuilder<'a, E: DeltaEngine + ?Sized> {
    layout: &'a WorkingDir,
    engine: &'a E,
    urls: &'a [BaseUrl],
    gzip_from: i64,
}

impl<'a, E: DeltaEngine + ?Sized> IndexBuilder<'a, E> {
    pub fn new(layout: &'a WorkingDir, engine: &'a E, urls: &'a [BaseUrl], gzip_from: i64) -> Self {
        Self {
            layout,
            engine,
            urls,
            gzip_from,
        }
    }

    fn gzip_eligible(&self, version: u32) -> bool {
        i64::from(version) >= self.gzip_from
    }

    /// Versions a full build would prepare.
    ///
    /// Reads only; every artifact-level rejection of [`Self::build_full`] happens here.
    pub fn check_full(&self) -> Result<Vec<u32>, BuildError> {
        let builds = self.layout.builds();
        let versions = discover_artifacts(&builds)?;
        if versions.is_empty() {
            return Err(BuildError::NoArtifacts(builds));
        }
        Ok(versions)
    }

    /// Version whose prepared artifact `version` is diffed against.
    ///
    /// Reads only; every artifact-level rejection of [`Self::build_incremental`] happens here.
    pub fn check_incremental(&self, version: u32) -> Result<u32, BuildError> {
        let builds = self.layout.builds();
        if !builds.is_dir() {
            return Err(BuildError::MissingBuilds(builds));
        }
        if version > MAX_VERSION {
            return Err(BuildError::VersionOutOfRange(version));
        }
        let prior = version.checked_sub(1).filter(|v| *v > 0).ok_or(BuildError::NoPreviousVersion(version))?;

        let artifact = self.layout.artifact(version);
        if !artifact.is_file() {
            return Err(BuildError::MissingArtifact { version, path: artifact });
        }
        let prior_prepared = self.layout.processed_artifact(prior);
        if !prior_prepared.is_file() {
            return Err(BuildError::MissingPrevious {
                version,
                previous: prior,
                path: prior_prepared,
            });
        }
        Ok(prior)
    }

    /// Rebuild every patch and the whole index.
    pub fn build_full(&self) -> Result<BuiltIndex, BuildError> {
        let versions = self.check_full()?;

        let processed = self.layout.processed();
        create_dir(&processed)?;
        remove_files_with_suffix(&processed, ".jar")?;
        let site = self.layout.site();
        create_dir(&site)?;
        remove_files_with_suffix(&site, ufx_protocol::PATCH_SUFFIX)?;

        let mut warnings = Vec::new();
        let mut descriptors = Vec::with_capacity(versions.len());
        for &version in &versions {
            let prepared = self.prepare(version)?;
            descriptors.push((version, self.describe(&prepared, version, &mut warnings)?));
        }

        let records = self.engine.process_all(&processed, &site, self.gzip_from)?;

        let updates = records
            .iter()
            .map(|record| {
                let description = descriptors
                    .iter()
                    .find(|(v, _)| *v == record.version)
                    .and_then(|(_, d)| d.clone());
                self.entry(record, description)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(BuiltIndex {
            updates: Updates {
                version: INDEX_FORMAT_VERSION,
                updates,
            },
            warnings,
        })
    }

    /// Add or replace the entry for `version`, keeping every other entry of `previous`.
    pub fn build_incremental(&self, version: u32, previous: &Updates) -> Result<BuiltIndex, BuildError> {
        let prior = self.check_incremental(version)?;
        let prior_prepared = self.layout.processed_artifact(prior);

        let prepared = self.prepare(version)?;
        let mut warnings = Vec::new();
        let description = self.describe(&prepared, version, &mut warnings)?;

        let site = self.layout.site();
        create_dir(&site)?;
        let record = self
            .engine
            .process_pair(&prior_prepared, &prepared, &site, version, self.gzip_from)?;

        let mut updates: Vec<Update> = previous
            .updates
            .iter()
            .filter(|u| i64::from(u.version) != i64::from(version))
            .cloned()
            .collect();
        let replaced = updates.len() != previous.updates.len();
        updates.push(self.entry(&record, description)?);
        info!(version, replaced, entries = updates.len(), "merged incremental update");

        Ok(BuiltIndex {
            updates: Updates {
                version: INDEX_FORMAT_VERSION,
                updates,
            },
            warnings,
        })
    }

    /// Put `builds/N.jar` into `builds/processed/N.jar`.
    fn prepare(&self, version: u32) -> Result<PathBuf, BuildError> {
        let source = self.layout.artifact(version);
        let target = self.layout.processed_artifact(version);
        create_dir(&self.layout.processed())?;

        if self.gzip_eligible(version) {
            match canonicalize(&source, &target)? {
                CanonicalizeOutcome::Rewritten { entries } => {
                    debug!(version, entries, "canonicalized artifact")
                }
                CanonicalizeOutcome::AlreadyCanonical => debug!(version, "artifact already canonical"),
            }
        } else {
            fs::copy(&source, &target).map_err(|e| io_error(&target, e))?;
            debug!(version, "copied artifact below gzip threshold");
        }
        Ok(target)
    }

    fn describe(
        &self,
        jar: &Path,
        version: u32,
        warnings: &mut Vec<BuildWarning>,
    ) -> Result<Option<UpdateDescriptor>, BuildError> {
        let found = read_description(jar, version).map_err(|source| BuildError::Description {
            path: jar.to_path_buf(),
            source,
        })?;
        match found {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(warning) => {
                warn!(%warning, "no update description");
                warnings.push(warning);
                Ok(None)
            }
        }
    }

    fn entry(&self, record: &PatchRecord, description: Option<UpdateDescriptor>) -> Result<Update, BuildError> {
        let version = i32::try_from(record.version).map_err(|_| BuildError::VersionOutOfRange(record.version))?;
        Ok(Update {
            version,
            patch_size: record.patch_size as i64,
            pre_hash: record.pre_hash.to_vec(),
            patch_hash: record.patch_hash.to_vec(),
            post_hash: record.post_hash.to_vec(),
            urls: self.urls.iter().map(|base| base.patch_url(record.version)).collect(),
            description: description.iter().map(UpdateDescriptor::to_wire).collect(),
            gzipped: record.is_gzipped(self.gzip_from),
        })
    }
}

/// Versions of the `N.jar` files directly inside `builds`, ascending.
pub fn discover_artifacts(builds: &Path) -> Result<Vec<u32>, BuildError> {
    if !builds.is_dir() {
        return Err(BuildError::MissingBuilds(builds.to_path_buf()));
    }

    let pattern = Regex::new(ARTIFACT_PATTERN)?;
    let mut versions = Vec::new();
    for entry in WalkDir::new(builds).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().map_or_else(|| builds.to_path_buf(), Path::to_path_buf);
            io_error(&path, io::Error::from(e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(".jar") {
            continue;
        }
        let version = pattern
            .captures(&name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .ok_or_else(|| BuildError::BadArtifactName(entry.path().to_path_buf()))?;
        if version > MAX_VERSION {
            return Err(BuildError::VersionOutOfRange(version));
        }
        versions.push(version);
    }
    versions.sort_unstable();
    Ok(versions)
}

/// File names accepted as artifacts.
const ARTIFACT_PATTERN: &str = r"^(\d+)\.jar$";

/// Remove stale outputs of an earlier full build.
fn remove_files_with_suffix(dir: &Path, suffix: &str) -> Result<(), BuildError> {
    let entries = fs::read_dir(dir).map_err(|e| io_error(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| io_error(dir, e))?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(suffix));
        if matches && path.is_file() {
            debug!(path = %path.display(), "removing stale file");
            fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
        }
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<(), BuildError> {
    fs::create_dir_all(path).map_err(|e| io_error(path, e))
}

fn io_error(path: &Path, source: io::Error) -> BuildError {
    BuildError::Io {
        path: path.to_path_buf(),
        source,
    }
}
