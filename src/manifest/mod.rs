//! Signed manifest
//!
//! The index is encoded to its protobuf wire form, hashed with SHA-256 and
//! signed. Keys are never trusted from storage: the signing key is
//! recovered from each signature and compared with what the signer expected.

use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use prost::Message;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};
use ufx_protocol::{SignedUpdates, Updates, WireError};

use crate::signer::{PublicKey, RecoverableSignature, SignatureError, Signer, SignerError};

/// Errors for manifest signing and reading
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("signature recovers to {actual}, expected {expected}")]
    KeyMismatch { expected: PublicKey, actual: PublicKey },

    #[error("index has no signatures")]
    Unsigned,

    #[error("invalid index: {0}")]
    Wire(#[from] WireError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An index together with its signature.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedManifest {
    updates_bytes: Vec<u8>,
    hash: [u8; 32],
    signature: RecoverableSignature,
    signing_key: PublicKey,
}

/// Sign `index` with `signer`.
///
/// Fails with [`ManifestError::KeyMismatch`] if the signer announced an
/// expected key and the signature recovers to a different one.
pub fn sign_manifest<S: Signer + ?Sized>(index: &Updates, signer: &mut S) -> Result<SignedManifest, ManifestError> {
    let updates_bytes = index.encode_to_vec();
    let hash: [u8; 32] = Sha256::digest(&updates_bytes).into();
    debug!(hash = %hex::encode(hash), size = updates_bytes.len(), "signing index");

    let signature = signer.sign(&hash)?;
    let signing_key = signature.recover(&hash)?;
    if let Some(expected) = signer.expected_key() {
        if expected != &signing_key {
            return Err(ManifestError::KeyMismatch {
                expected: expected.clone(),
                actual: signing_key,
            });
        }
    }

    Ok(SignedManifest {
        updates_bytes,
        hash,
        signature,
        signing_key,
    })
}

impl SignedManifest {
    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Key recovered from the signature.
    pub fn signing_key(&self) -> &PublicKey {
        &self.signing_key
    }

    pub fn signature(&self) -> &RecoverableSignature {
        &self.signature
    }

    pub fn to_wire(&self) -> SignedUpdates {
        SignedUpdates {
            signatures: vec![self.signature.to_base64()],
            updates: self.updates_bytes.clone(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_wire().encode_to_vec()
    }

    /// Write to `path`, replacing it atomically.
    pub fn write(&self, path: &Path) -> Result<(), ManifestError> {
        let io_err = |source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staged = NamedTempFile::new_in(dir).map_err(io_err)?;
        staged.write_all(&self.encode()).map_err(io_err)?;
        staged.persist(path).map_err(|e| io_err(e.error))?;
        info!(path = %path.display(), "index written");
        Ok(())
    }
}

/// Read a signed index file.
pub fn read_index(path: &Path) -> Result<(SignedUpdates, Updates), ManifestError> {
    let bytes = fs::read(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let signed = SignedUpdates::from_bytes(&bytes)?;
    let updates = signed.decode_updates()?;
    Ok((signed, updates))
}

/// Recover the key behind every signature of `signed`.
pub fn verify(signed: &SignedUpdates) -> Result<Vec<PublicKey>, ManifestError> {
    if signed.signatures.is_empty() {
        return Err(ManifestError::Unsigned);
    }
    let hash: [u8; 32] = Sha256::digest(&signed.updates).into();
    signed
        .signatures
        .iter()
        .map(|text| {
            let signature = RecoverableSignature::from_base64(text)?;
            Ok(signature.recover(&hash)?)
        })
        .collect()
}

/// Human readable listing of an index.
pub fn render_index(updates: &Updates) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "UpdateFX index (v{}): {} updates defined:",
        updates.version,
        updates.updates.len()
    );
    for update in &updates.updates {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Update {} ({} bytes{})",
            update.version,
            update.patch_size,
            if update.gzipped { " gzipped" } else { "" }
        );
        if let Some(description) = update.description.first() {
            let _ = writeln!(out, "{}", description.one_liner);
            if !description.description.is_empty() {
                let _ = writeln!(out, "{}", description.description);
            }
        }
        let _ = writeln!(out, "PreHash:    {}", update.pre_hash_hex());
        let _ = writeln!(out, "Patch hash: {}", update.patch_hash_hex());
        let _ = writeln!(out, "PostHash:   {}", update.post_hash_hex());
        for url in &update.urls {
            let _ = writeln!(out, "  {}", url);
        }
        let _ = writeln!(out, "----------");
    }
    out
}
