//! UFX Protocol Types
//!
//! Defines the protobuf messages that make up a signed update index as served
//! from an update site and consumed by the updater.

pub mod error;
pub mod messages;

pub use error::WireError;
pub use messages::{SignedUpdates, Update, UpdateDescription, Updates};

/// Format version written into every `Updates` message.
pub const INDEX_FORMAT_VERSION: i32 = 1;

/// Suffix appended to the target version to name a patch file.
pub const PATCH_SUFFIX: &str = ".jar.bpatch";

/// Name of the patch file for the given target version.
pub fn patch_file_name(version: u32) -> String {
    format!("{}{}", version, PATCH_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_file_name() {
        assert_eq!(patch_file_name(7), "7.jar.bpatch");
    }
}
