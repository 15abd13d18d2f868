//! Protobuf messages of the signed update index.
//!
//! Tag numbers are part of the wire contract with deployed updaters and must
//! never be renumbered.

use std::collections::HashSet;

use prost::Message;

use crate::error::WireError;

/// Outer envelope stored at `site/index`.
#[derive(Clone, PartialEq, Message)]
pub struct SignedUpdates {
    /// Base64 compact recoverable signatures over `updates`.
    #[prost(string, repeated, tag = "1")]
    pub signatures: Vec<String>,
    /// Encoded `Updates` message, signed byte-for-byte.
    #[prost(bytes = "vec", tag = "2")]
    pub updates: Vec<u8>,
}

/// The update index itself.
#[derive(Clone, PartialEq, Message)]
pub struct Updates {
    #[prost(int32, tag = "1")]
    pub version: i32,
    #[prost(message, repeated, tag = "2")]
    pub updates: Vec<Update>,
}

/// One patch taking the previous version to `version`.
#[derive(Clone, PartialEq, Message)]
pub struct Update {
    #[prost(int32, tag = "1")]
    pub version: i32,
    #[prost(int64, tag = "2")]
    pub patch_size: i64,
    #[prost(bytes = "vec", tag = "3")]
    pub pre_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub patch_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub post_hash: Vec<u8>,
    #[prost(string, repeated, tag = "6")]
    pub urls: Vec<String>,
    /// Zero or one description.
    #[prost(message, repeated, tag = "7")]
    pub description: Vec<UpdateDescription>,
    #[prost(bool, tag = "8")]
    pub gzipped: bool,
}

/// Human readable notes shown to users before they apply an update.
#[derive(Clone, PartialEq, Message)]
pub struct UpdateDescription {
    #[prost(string, tag = "1")]
    pub one_liner: String,
    #[prost(string, tag = "2")]
    pub description: String,
}

impl SignedUpdates {
    /// Decode the outer envelope from raw index bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        Self::decode(bytes).map_err(|source| WireError::Decode {
            message: "SignedUpdates",
            source,
        })
    }

    /// Decode and validate the embedded `Updates` message.
    pub fn decode_updates(&self) -> Result<Updates, WireError> {
        let updates = Updates::decode(self.updates.as_slice()).map_err(|source| {
            WireError::Decode {
                message: "Updates",
                source,
            }
        })?;
        updates.validate()?;
        Ok(updates)
    }
}

impl Updates {
    /// Check structural invariants: unique versions, at most one description.
    pub fn validate(&self) -> Result<(), WireError> {
        let mut seen = HashSet::new();
        for update in &self.updates {
            if !seen.insert(update.version) {
                return Err(WireError::DuplicateVersion(update.version));
            }
            if update.description.len() > 1 {
                return Err(WireError::TooManyDescriptions {
                    version: update.version,
                    count: update.description.len(),
                });
            }
        }
        Ok(())
    }

    /// Find the entry for a target version.
    pub fn find(&self, version: i32) -> Option<&Update> {
        self.updates.iter().find(|u| u.version == version)
    }
}

impl Update {
    /// Lowercase hex of the pre-image hash.
    pub fn pre_hash_hex(&self) -> String {
        hex::encode(&self.pre_hash)
    }

    /// Lowercase hex of the patch hash.
    pub fn patch_hash_hex(&self) -> String {
        hex::encode(&self.patch_hash)
    }

    /// Lowercase hex of the post-image hash.
    pub fn post_hash_hex(&self) -> String {
        hex::encode(&self.post_hash)
    }
}
