//! Base URLs patches are served from

use std::fmt;

use url::Url;

use super::ConfigError;

/// A validated base URL.
///
/// The text is kept as given so that patch URLs come out exactly as the
/// operator wrote the base; validation only rejects what cannot be a base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUrl {
    raw: String,
}

impl BaseUrl {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let malformed = |reason: String| ConfigError::MalformedUrl {
            url: raw.to_string(),
            reason,
        };
        let parsed = Url::parse(raw).map_err(|e| malformed(e.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(malformed("cannot be used as a base".to_string()));
        }
        Ok(Self { raw: raw.to_string() })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `<base>/<version>.jar.bpatch`, inserting the `/` only when missing.
    pub fn patch_url(&self, version: u32) -> String {
        let separator = if self.raw.ends_with('/') { "" } else { "/" };
        format!("{}{}{}", self.raw, separator, ufx_protocol::patch_file_name(version))
    }
}

impl fmt::Display for BaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
