//! Optional `ufx.toml` in the working directory
//!
//! ```toml
//! urls = ["https://updates.example.com/app"]
//! gzip_from = 12
//! key_index = 0
//!
//! [hardware]
//! enabled = true
//! expected_key = "02ab..."
//! bridge = "trezor-ufx-bridge --usb"
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::ConfigError;

/// File layer; every field is optional and overridden by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub urls: Vec<String>,
    pub gzip_from: Option<i64>,
    pub key_index: Option<usize>,
    pub kdf_iterations: Option<u32>,
    pub hardware: Option<HardwareSection>,
}

/// `[hardware]` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareSection {
    #[serde(default)]
    pub enabled: bool,
    pub expected_key: Option<String>,
    pub bridge: Option<String>,
    pub account: Option<u32>,
    pub index: Option<u32>,
}

impl ConfigFile {
    /// Load `path` if it exists.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
            .map(Some)
            .map_err(|message| ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            })
    }

    pub fn parse(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|e| format!("TOML parse error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_file() {
        let file = ConfigFile::parse(
            r#"
            urls = ["https://a.example.com", "https://b.example.com/"]
            gzip_from = 4
            key_index = 1

            [hardware]
            enabled = true
            bridge = "bridge --usb"
            "#,
        )
        .unwrap();

        assert_eq!(file.urls.len(), 2);
        assert_eq!(file.gzip_from, Some(4));
        assert_eq!(file.key_index, Some(1));
        let hardware = file.hardware.unwrap();
        assert!(hardware.enabled);
        assert_eq!(hardware.bridge.as_deref(), Some("bridge --usb"));
        assert_eq!(hardware.expected_key, None);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(ConfigFile::parse("gzip_form = 3").is_err());
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(ConfigFile::load(&dir.path().join("ufx.toml")).unwrap(), None);
    }

    #[test]
    fn test_bad_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ufx.toml");
        fs::write(&path, "urls = 3").unwrap();
        let err = ConfigFile::load(&path).unwrap_err();
        assert!(err.to_string().contains("ufx.toml"));
    }
}
