//! Prepare job orchestration
//!
//! One run of the tool:
//! - Check preconditions (artifact names, previous index and prepared
//!   artifact in incremental mode, bridge program)
//! - Open or create the signing backend
//! - Build the unsigned index (full or incremental)
//! - Sign it and write `site/index`
//! - Report the signing key, then any soft warnings
//!
//! Everything that can be rejected up front is rejected before the first
//! write to the working directory.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};
use ufx_protocol::Updates;

use crate::config::{BuildMode, ConfigError, PrepareConfig, SigningBackend};
use crate::console::Console;
use crate::delta::DeltaEngine;
use crate::description::BuildWarning;
use crate::index::{BuildError, BuiltIndex, IndexBuilder};
use crate::manifest::{read_index, sign_manifest, ManifestError};
use crate::signer::hardware::{BridgeDevice, HardwareSigner};
use crate::signer::keystore::{ensure_keystore, KeystoreError, KeystoreSigner};
use crate::signer::{DeviceError, PublicKey, Signer, SignerError};

/// Prepare job errors
#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("build error: {0}")]
    Build(#[from] BuildError),

    #[error("keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("{0}")]
    Signer(#[from] SignerError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("incremental build needs an existing index at {0}")]
    MissingPreviousIndex(PathBuf),

    #[error("cannot read previous index: {0}")]
    PreviousIndex(#[source] ManifestError),
}

impl PrepareError {
    /// Get the exit code for this error
    ///
    /// 1 configuration or precondition, 2 I/O, 3 user abort, 4 signing fault.
    pub fn exit_code(&self) -> i32 {
        match self {
            PrepareError::Config(ConfigError::Io { .. }) => 2,
            PrepareError::Config(_) => 1,
            PrepareError::Build(e) => build_exit_code(e),
            PrepareError::Keystore(e) => keystore_exit_code(e),
            PrepareError::Signer(e) => signer_exit_code(e),
            PrepareError::Manifest(e) => manifest_exit_code(e),
            PrepareError::MissingPreviousIndex(_) => 1,
            PrepareError::PreviousIndex(ManifestError::Io { .. }) => 2,
            PrepareError::PreviousIndex(_) => 1,
        }
    }

    /// Whether the user chose to stop (closed input, mismatched confirmation).
    pub fn is_abort(&self) -> bool {
        self.exit_code() == 3
    }
}

fn build_exit_code(e: &BuildError) -> i32 {
    match e {
        BuildError::Io { .. }
        | BuildError::Canonicalize(_)
        | BuildError::Delta(_)
        | BuildError::Description { .. } => 2,
        _ => 1,
    }
}

fn keystore_exit_code(e: &KeystoreError) -> i32 {
    match e {
        KeystoreError::Io { .. } => 2,
        _ => 1,
    }
}

fn signer_exit_code(e: &SignerError) -> i32 {
    match e {
        SignerError::Keystore(e) => keystore_exit_code(e),
        SignerError::Aborted(_) => 3,
        SignerError::Device(DeviceError::Spawn { .. }) => 1,
        SignerError::Signature(_) | SignerError::Device(_) | SignerError::Protocol(_) => 4,
    }
}

fn manifest_exit_code(e: &ManifestError) -> i32 {
    match e {
        ManifestError::Signer(e) => signer_exit_code(e),
        ManifestError::Io { .. } => 2,
        ManifestError::Wire(_) => 1,
        ManifestError::Signature(_) | ManifestError::KeyMismatch { .. } | ManifestError::Unsigned => 4,
    }
}

/// Result type for prepare operations
pub type PrepareResult<T> = Result<T, PrepareError>;

/// What a successful run produced
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareReport {
    pub signing_key: PublicKey,
    pub updates: Updates,
    pub warnings: Vec<BuildWarning>,
}

/// A single build job over one working directory.
pub struct PrepareJob<'a, C: Console + ?Sized, E: DeltaEngine + ?Sized> {
    config: &'a PrepareConfig,
    console: &'a C,
    engine: &'a E,
}

impl<'a, C: Console + ?Sized, E: DeltaEngine + ?Sized> PrepareJob<'a, C, E> {
    pub fn new(config: &'a PrepareConfig, console: &'a C, engine: &'a E) -> Self {
        Self {
            config,
            console,
            engine,
        }
    }

    /// Run with the signing backend named by the configuration.
    pub fn run(&self) -> PrepareResult<PrepareReport> {
        let previous = self.check_preconditions()?;

        match &self.config.signing {
            SigningBackend::Keystore { key_index } => {
                // May create the wallet, so it runs only after every check passed.
                let keystore = ensure_keystore(
                    &self.config.working.wallet(),
                    self.console,
                    self.config.kdf_iterations,
                )?;
                let mut signer = KeystoreSigner::new(keystore, *key_index, self.console)?;
                self.execute(previous, &mut signer)
            }
            SigningBackend::Hardware {
                expected_key,
                key_path,
                bridge,
            } => {
                let device = BridgeDevice::from_command_line(bridge).ok_or(ConfigError::EmptyBridgeCommand)?;
                let program = device.locate().map_err(SignerError::from)?;
                debug!(program = %program.display(), "found device bridge");
                let mut signer =
                    HardwareSigner::new(device, self.console, expected_key.clone()).with_key_path(*key_path);
                self.execute(previous, &mut signer)
            }
        }
    }

    /// Run with an explicitly supplied signer.
    pub fn run_with_signer<S: Signer + ?Sized>(&self, signer: &mut S) -> PrepareResult<PrepareReport> {
        let previous = self.check_preconditions()?;
        self.execute(previous, signer)
    }

    /// Returns the previous index in incremental mode.
    ///
    /// Reads only.
    fn check_preconditions(&self) -> PrepareResult<Option<Updates>> {
        let builds = self.config.working.builds();
        if !builds.is_dir() {
            return Err(BuildError::MissingBuilds(builds).into());
        }

        let builder = self.builder();
        match self.config.mode {
            BuildMode::Full => {
                let versions = builder.check_full()?;
                debug!(artifacts = versions.len(), "artifacts found");
                Ok(None)
            }
            BuildMode::Incremental(version) => {
                let path = self.config.working.index();
                if !path.is_file() {
                    return Err(PrepareError::MissingPreviousIndex(path));
                }
                let (_, updates) = read_index(&path).map_err(PrepareError::PreviousIndex)?;
                builder.check_incremental(version)?;
                Ok(Some(updates))
            }
        }
    }

    fn builder(&self) -> IndexBuilder<'a, E> {
        IndexBuilder::new(
            &self.config.working,
            self.engine,
            &self.config.urls,
            self.config.gzip_from,
        )
    }

    fn execute<S: Signer + ?Sized>(&self, previous: Option<Updates>, signer: &mut S) -> PrepareResult<PrepareReport> {
        let builder = self.builder();

        let BuiltIndex { updates, warnings } = match (self.config.mode, previous) {
            (BuildMode::Incremental(version), Some(previous)) => {
                info!(version, "building incremental update");
                builder.build_incremental(version, &previous)?
            }
            (BuildMode::Incremental(_), None) => {
                return Err(PrepareError::MissingPreviousIndex(self.config.working.index()))
            }
            (BuildMode::Full, _) => {
                info!(working = %self.config.working.root().display(), "building full index");
                builder.build_full()?
            }
        };

        for update in &updates.updates {
            info!(version = update.version, patch_hash = %update.patch_hash_hex(), "index entry");
        }

        let manifest = sign_manifest(&updates, signer)?;
        manifest.write(&self.config.working.index())?;

        let signing_key = manifest.signing_key().clone();
        self.console.say(&format!("Signed with public key {}", signing_key));
        for warning in &warnings {
            warn!(%warning, "build warning");
            self.console.say(&format!("Warning: {}", warning));
        }

        Ok(PrepareReport {
            signing_key,
            updates,
            warnings,
        })
    }
}
