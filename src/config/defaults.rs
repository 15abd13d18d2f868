//! Built-in defaults (lowest layer)

use crate::signer::keystore::DEFAULT_KDF_ITERATIONS;

/// Program started when no device bridge is configured.
pub const DEFAULT_DEVICE_BRIDGE: &str = "ufx-device-bridge";

/// Built-in default configuration values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinDefaults {
    /// Versions at or above this are canonicalized and gzipped (default: -1, all)
    pub gzip_from: i64,

    /// Keystore entry used for signing (default: 0)
    pub key_index: usize,

    /// PBKDF2 rounds for newly encrypted keystores
    pub kdf_iterations: u32,

    /// Device bridge command line
    pub device_bridge: String,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            gzip_from: -1,
            key_index: 0,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            device_bridge: DEFAULT_DEVICE_BRIDGE.to_string(),
        }
    }
}
