//! UpdateFX release preparation
//!
//! Turns a directory of numbered application jars into a signed update
//! site: canonical jars, binary patches between consecutive versions, and
//! a signed protobuf index describing them.

pub mod canonical;
pub mod config;
pub mod console;
pub mod delta;
pub mod description;
pub mod index;
pub mod layout;
pub mod manifest;
pub mod pipeline;
pub mod signer;

pub use config::{BuildMode, CliOverrides, ConfigError, PrepareConfig, SigningBackend};
pub use console::{Console, ScriptedConsole, TerminalConsole};
pub use delta::{DeltaEngine, GdiffEngine};
pub use layout::WorkingDir;
pub use manifest::{read_index, render_index, sign_manifest, verify, ManifestError, SignedManifest};
pub use pipeline::{PrepareError, PrepareJob, PrepareReport, PrepareResult};
pub use signer::{PublicKey, RecoverableSignature, Signer, SignerError};
