//! Working directory layout
//!
//! ```text
//! <working>/
//!   builds/            N.jar artifacts (read-only input)
//!   builds/processed/  artifacts prepared for diffing
//!   site/              N.jar.bpatch patches and the signed index
//!   wallet             keystore file
//!   ufx.toml           optional configuration
//! ```

use std::path::{Path, PathBuf};

/// Paths inside a working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDir {
    root: PathBuf,
}

impl WorkingDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn builds(&self) -> PathBuf {
        self.root.join("builds")
    }

    pub fn processed(&self) -> PathBuf {
        self.builds().join("processed")
    }

    pub fn site(&self) -> PathBuf {
        self.root.join("site")
    }

    pub fn index(&self) -> PathBuf {
        self.site().join("index")
    }

    pub fn wallet(&self) -> PathBuf {
        self.root.join("wallet")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("ufx.toml")
    }

    /// Artifact `N.jar` in `builds/`.
    pub fn artifact(&self, version: u32) -> PathBuf {
        self.builds().join(jar_name(version))
    }

    /// Prepared artifact `N.jar` in `builds/processed/`.
    pub fn processed_artifact(&self, version: u32) -> PathBuf {
        self.processed().join(jar_name(version))
    }
}

pub fn jar_name(version: u32) -> String {
    format!("{}.jar", version)
}
