//! Configuration layering
//!
//! Resolves the effective settings of one build from three layers:
//! 1. Built-in defaults
//! 2. Working directory config (`<working>/ufx.toml`, optional)
//! 3. CLI flags
//!
//! Base URLs are validated here, so a malformed URL fails the run before
//! anything on disk is touched.

mod base_url;
mod defaults;
mod file;

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

pub use base_url::BaseUrl;
pub use defaults::{BuiltinDefaults, DEFAULT_DEVICE_BRIDGE};
pub use file::{ConfigFile, HardwareSection};

use crate::layout::WorkingDir;
use crate::signer::hardware::KeyPath;
use crate::signer::PublicKey;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("You must specify at least one --url")]
    NoUrls,

    #[error("Base URL is malformed: {url} ({reason})")]
    MalformedUrl { url: String, reason: String },

    #[error("invalid expected public key {key}: {reason}")]
    BadExpectedKey { key: String, reason: String },

    #[error("device bridge command is empty")]
    EmptyBridgeCommand,
}

/// Which artifacts a build covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Every artifact in `builds/`; regenerates all patches.
    Full,
    /// Only the given version, merged into the existing index.
    Incremental(u32),
}

/// Where the signature comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningBackend {
    /// Local keystore at `<working>/wallet`.
    Keystore { key_index: usize },
    /// External device reached through the bridge command.
    Hardware {
        expected_key: Option<PublicKey>,
        key_path: KeyPath,
        bridge: String,
    },
}

/// Values given on the command line; `None` means "not given".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOverrides {
    pub urls: Vec<String>,
    pub gzip_from: Option<i64>,
    pub version: Option<u32>,
    /// `--trezor` given, with its optional expected key.
    pub hardware: Option<Option<String>>,
    pub device_bridge: Option<String>,
    pub key_index: Option<usize>,
}

/// Effective configuration of one build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareConfig {
    pub working: WorkingDir,
    pub urls: Vec<BaseUrl>,
    pub gzip_from: i64,
    pub mode: BuildMode,
    pub signing: SigningBackend,
    pub kdf_iterations: u32,
}

impl PrepareConfig {
    /// Resolve the configuration for `working`, reading its `ufx.toml` if present.
    pub fn resolve(working: impl Into<PathBuf>, cli: CliOverrides) -> Result<Self, ConfigError> {
        let working = WorkingDir::new(working);
        let file = ConfigFile::load(&working.config_file())?;
        if file.is_some() {
            debug!(path = %working.config_file().display(), "loaded config file");
        }
        Self::from_layers(working, BuiltinDefaults::default(), file.unwrap_or_default(), cli)
    }

    /// PBKDF2 rounds named by the working directory's config file, if any.
    ///
    /// Used by `--change-password`, which needs no URLs.
    pub fn file_kdf_iterations(working: &WorkingDir) -> Result<Option<u32>, ConfigError> {
        Ok(ConfigFile::load(&working.config_file())?.and_then(|file| file.kdf_iterations))
    }

    /// Merge explicit layers; later layers win.
    pub fn from_layers(
        working: WorkingDir,
        defaults: BuiltinDefaults,
        file: ConfigFile,
        cli: CliOverrides,
    ) -> Result<Self, ConfigError> {
        // URL lists replace rather than merge.
        let raw_urls = if cli.urls.is_empty() { file.urls } else { cli.urls };
        if raw_urls.is_empty() {
            return Err(ConfigError::NoUrls);
        }
        let urls = raw_urls
            .iter()
            .map(|raw| BaseUrl::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let gzip_from = cli.gzip_from.or(file.gzip_from).unwrap_or(defaults.gzip_from);
        let mode = cli.version.map_or(BuildMode::Full, BuildMode::Incremental);

        let hardware_section = file.hardware.unwrap_or_default();
        let signing = match cli.hardware {
            Some(cli_key) => Self::hardware_backend(cli_key, cli.device_bridge, hardware_section, &defaults)?,
            None if hardware_section.enabled => {
                Self::hardware_backend(None, cli.device_bridge, hardware_section, &defaults)?
            }
            None => SigningBackend::Keystore {
                key_index: cli.key_index.or(file.key_index).unwrap_or(defaults.key_index),
            },
        };

        Ok(Self {
            working,
            urls,
            gzip_from,
            mode,
            signing,
            kdf_iterations: file.kdf_iterations.unwrap_or(defaults.kdf_iterations),
        })
    }

    fn hardware_backend(
        cli_key: Option<String>,
        cli_bridge: Option<String>,
        section: HardwareSection,
        defaults: &BuiltinDefaults,
    ) -> Result<SigningBackend, ConfigError> {
        let expected_key = cli_key
            .or(section.expected_key)
            .map(|key| {
                key.parse::<PublicKey>().map_err(|e| ConfigError::BadExpectedKey {
                    key: key.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let bridge = cli_bridge
            .or(section.bridge)
            .unwrap_or_else(|| defaults.device_bridge.clone());
        if bridge.trim().is_empty() {
            return Err(ConfigError::EmptyBridgeCommand);
        }

        Ok(SigningBackend::Hardware {
            expected_key,
            key_path: KeyPath {
                account: section.account.unwrap_or(0),
                index: section.index.unwrap_or(0),
            },
            bridge,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::keystore::Keystore;
    use std::fs;
    use tempfile::TempDir;

    fn cli_with_url() -> CliOverrides {
        CliOverrides {
            urls: vec!["https://cli.example.com".to_string()],
            ..Default::default()
        }
    }

    fn resolve(file: ConfigFile, cli: CliOverrides) -> Result<PrepareConfig, ConfigError> {
        PrepareConfig::from_layers(WorkingDir::new("/w"), BuiltinDefaults::default(), file, cli)
    }

    #[test]
    fn test_defaults() {
        let config = resolve(ConfigFile::default(), cli_with_url()).unwrap();
        assert_eq!(config.gzip_from, -1);
        assert_eq!(config.mode, BuildMode::Full);
        assert_eq!(config.signing, SigningBackend::Keystore { key_index: 0 });
        assert_eq!(config.urls[0].as_str(), "https://cli.example.com");
    }

    #[test]
    fn test_no_urls() {
        assert!(matches!(
            resolve(ConfigFile::default(), CliOverrides::default()),
            Err(ConfigError::NoUrls)
        ));
    }

    #[test]
    fn test_malformed_url() {
        let cli = CliOverrides {
            urls: vec!["https://ok.example.com".to_string(), "bad url".to_string()],
            ..Default::default()
        };
        let err = resolve(ConfigFile::default(), cli).unwrap_err();
        assert!(err.to_string().starts_with("Base URL is malformed: bad url"));
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = ConfigFile {
            urls: vec!["https://file.example.com".to_string()],
            gzip_from: Some(3),
            key_index: Some(2),
            ..Default::default()
        };
        let cli = CliOverrides {
            gzip_from: Some(7),
            version: Some(9),
            ..cli_with_url()
        };
        let config = resolve(file, cli).unwrap();
        assert_eq!(config.gzip_from, 7);
        assert_eq!(config.mode, BuildMode::Incremental(9));
        assert_eq!(config.urls.len(), 1);
        assert_eq!(config.urls[0].as_str(), "https://cli.example.com");
        assert_eq!(config.signing, SigningBackend::Keystore { key_index: 2 });
    }

    #[test]
    fn test_file_urls_used_when_cli_has_none() {
        let file = ConfigFile {
            urls: vec!["https://file.example.com".to_string()],
            ..Default::default()
        };
        let config = resolve(file, CliOverrides::default()).unwrap();
        assert_eq!(config.urls[0].as_str(), "https://file.example.com");
    }

    #[test]
    fn test_hardware_with_expected_key() {
        let key = Keystore::create().public_key(0).unwrap().clone();
        let cli = CliOverrides {
            hardware: Some(Some(key.to_hex())),
            ..cli_with_url()
        };
        let config = resolve(ConfigFile::default(), cli).unwrap();
        assert_eq!(
            config.signing,
            SigningBackend::Hardware {
                expected_key: Some(key),
                key_path: KeyPath::default(),
                bridge: DEFAULT_DEVICE_BRIDGE.to_string(),
            }
        );
    }

    #[test]
    fn test_hardware_bad_key() {
        let cli = CliOverrides {
            hardware: Some(Some("abcd".to_string())),
            ..cli_with_url()
        };
        assert!(matches!(
            resolve(ConfigFile::default(), cli),
            Err(ConfigError::BadExpectedKey { .. })
        ));
    }

    #[test]
    fn test_hardware_enabled_from_file() {
        let file = ConfigFile {
            hardware: Some(HardwareSection {
                enabled: true,
                bridge: Some("my-bridge --usb".to_string()),
                index: Some(3),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = resolve(file, cli_with_url()).unwrap();
        match config.signing {
            SigningBackend::Hardware {
                expected_key,
                key_path,
                bridge,
            } => {
                assert_eq!(expected_key, None);
                assert_eq!(key_path, KeyPath { account: 0, index: 3 });
                assert_eq!(bridge, "my-bridge --usb");
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_resolve_reads_working_dir_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("ufx.toml"),
            "urls = [\"https://file.example.com/\"]\ngzip_from = 2\n",
        )
        .unwrap();

        let config = PrepareConfig::resolve(dir.path(), CliOverrides::default()).unwrap();
        assert_eq!(config.gzip_from, 2);
        assert_eq!(config.urls[0].patch_url(4), "https://file.example.com/4.jar.bpatch");
    }
}
