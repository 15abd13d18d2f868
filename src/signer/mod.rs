//! Signing backends
//!
//! A [`Signer`] turns the SHA-256 of a serialized index into a compact
//! recoverable secp256k1 signature. The hash is signed as a Bitcoin-style
//! signed message over its lowercase hex form, so the result can be checked
//! with any tool that understands signed messages.
//!
//! Two backends exist:
//! - [`keystore::KeystoreSigner`]: a key held in the local password-protected keystore
//! - [`hardware::HardwareSigner`]: an external signing device driven by an event protocol

pub mod hardware;
pub mod keystore;

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use hardware::{DeviceError, SigningFailure};
pub use keystore::KeystoreError;

/// Prefix mixed into every signed message digest.
pub const MESSAGE_MAGIC: &[u8] = b"\x18Bitcoin Signed Message:\n";

/// Length of a compact recoverable signature.
pub const COMPACT_SIGNATURE_LEN: usize = 65;

const HEADER_BASE: u8 = 27;
const HEADER_COMPRESSED: u8 = 4;

/// Errors decoding or recovering signatures
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature must be {COMPACT_SIGNATURE_LEN} bytes, got {0}")]
    Length(usize),

    #[error("invalid signature header byte {0}")]
    Header(u8),

    #[error("invalid base64 signature: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid public key: {0}")]
    PublicKey(String),

    #[error("ECDSA error: {0}")]
    Ecdsa(#[from] k256::ecdsa::Error),
}

/// Errors from a signing backend
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("signing failed: {0}")]
    Protocol(SigningFailure),

    #[error("aborted: {0}")]
    Aborted(String),
}

/// Capability to sign a manifest hash.
pub trait Signer {
    /// Sign the 32-byte manifest hash.
    fn sign(&mut self, hash: &[u8; 32]) -> Result<RecoverableSignature, SignerError>;

    /// Key the signature is expected to recover to, when known up front.
    fn expected_key(&self) -> Option<&PublicKey> {
        None
    }
}

impl<S: Signer + ?Sized> Signer for Box<S> {
    fn sign(&mut self, hash: &[u8; 32]) -> Result<RecoverableSignature, SignerError> {
        (**self).sign(hash)
    }

    fn expected_key(&self) -> Option<&PublicKey> {
        (**self).expected_key()
    }
}

/// A secp256k1 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_verifying_key(key: VerifyingKey) -> Self {
        Self(key)
    }

    /// Parse SEC1 bytes, compressed or not.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        VerifyingKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|e| SignatureError::PublicKey(e.to_string()))
    }

    /// Compressed SEC1 encoding.
    pub fn to_compressed(&self) -> Vec<u8> {
        self.0.to_encoded_point(true).as_bytes().to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_compressed())
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| SignatureError::PublicKey(e.to_string()))?;
        Self::from_sec1_bytes(&bytes)
    }
}

/// A 65-byte compact signature: header byte, then `r` and `s`.
#[derive(Clone, PartialEq, Eq)]
pub struct RecoverableSignature {
    signature: Signature,
    recovery_id: RecoveryId,
}

impl RecoverableSignature {
    pub fn new(signature: Signature, recovery_id: RecoveryId) -> Self {
        Self {
            signature,
            recovery_id,
        }
    }

    /// Parse the compact form.
    ///
    /// Headers 27..=34 are accepted; a high `s` is normalized and the
    /// recovery id adjusted so the same key is recovered.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        if bytes.len() != COMPACT_SIGNATURE_LEN {
            return Err(SignatureError::Length(bytes.len()));
        }
        let header = bytes[0];
        if !(HEADER_BASE..HEADER_BASE + 8).contains(&header) {
            return Err(SignatureError::Header(header));
        }
        let recid = (header - HEADER_BASE) & 3;
        let mut recovery_id = RecoveryId::from_byte(recid).ok_or(SignatureError::Header(header))?;
        let mut signature = Signature::from_slice(&bytes[1..])?;

        if let Some(normalized) = signature.normalize_s() {
            signature = normalized;
            recovery_id = RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced());
        }
        Ok(Self::new(signature, recovery_id))
    }

    pub fn from_base64(text: &str) -> Result<Self, SignatureError> {
        Self::from_bytes(&BASE64.decode(text.trim())?)
    }

    /// Compact form with the compressed-key header.
    pub fn to_bytes(&self) -> [u8; COMPACT_SIGNATURE_LEN] {
        let mut out = [0u8; COMPACT_SIGNATURE_LEN];
        out[0] = HEADER_BASE + HEADER_COMPRESSED + self.recovery_id.to_byte();
        out[1..].copy_from_slice(&self.signature.to_bytes());
        out
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// Recover the key that signed the manifest `hash`.
    pub fn recover(&self, hash: &[u8; 32]) -> Result<PublicKey, SignatureError> {
        let digest = signed_message_digest(&message_for_hash(hash));
        let key = VerifyingKey::recover_from_prehash(&digest, &self.signature, self.recovery_id)?;
        Ok(PublicKey(key))
    }
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoverableSignature({})", self.to_base64())
    }
}

/// Text that is actually signed for a manifest hash.
pub fn message_for_hash(hash: &[u8; 32]) -> String {
    hex::encode(hash)
}

/// Double SHA-256 of the magic prefix, the varint length and the message.
pub fn signed_message_digest(message: &str) -> [u8; 32] {
    let mut buf = Vec::with_capacity(MESSAGE_MAGIC.len() + 9 + message.len());
    buf.extend_from_slice(MESSAGE_MAGIC);
    write_varint(&mut buf, message.len() as u64);
    buf.extend_from_slice(message.as_bytes());
    Sha256::digest(Sha256::digest(&buf)).into()
}

fn write_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// Sign a manifest hash with a local key.
pub fn sign_hash(key: &SigningKey, hash: &[u8; 32]) -> Result<RecoverableSignature, SignatureError> {
    let digest = signed_message_digest(&message_for_hash(hash));
    let (signature, recovery_id) = key.sign_prehash_recoverable(&digest)?;
    Ok(RecoverableSignature::new(signature, recovery_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn hash_of(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    #[test]
    fn test_varint_boundaries() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0xfc);
        assert_eq!(buf, vec![0xfc]);

        buf.clear();
        write_varint(&mut buf, 0xfd);
        assert_eq!(buf, vec![0xfd, 0xfd, 0x00]);

        buf.clear();
        write_varint(&mut buf, 0x1_0000);
        assert_eq!(buf, vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_message_is_lowercase_hex() {
        let hash = [0xabu8; 32];
        let message = message_for_hash(&hash);
        assert_eq!(message.len(), 64);
        assert_eq!(message, "ab".repeat(32));
    }

    #[test]
    fn test_sign_and_recover() {
        let key = SigningKey::random(&mut OsRng);
        let expected = PublicKey::from_verifying_key(key.verifying_key().clone());
        let hash = hash_of(b"index bytes");

        let sig = sign_hash(&key, &hash).unwrap();
        assert_eq!(sig.recover(&hash).unwrap(), expected);

        let other = hash_of(b"other bytes");
        assert_ne!(sig.recover(&other).ok(), Some(expected.clone()));
    }

    #[test]
    fn test_compact_form_header_and_base64() {
        let key = SigningKey::random(&mut OsRng);
        let hash = hash_of(b"x");
        let sig = sign_hash(&key, &hash).unwrap();

        let bytes = sig.to_bytes();
        assert!((31..=34).contains(&bytes[0]));

        let parsed = RecoverableSignature::from_base64(&sig.to_base64()).unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn test_uncompressed_header_still_recovers() {
        let key = SigningKey::random(&mut OsRng);
        let expected = PublicKey::from_verifying_key(key.verifying_key().clone());
        let hash = hash_of(b"y");
        let mut bytes = sign_hash(&key, &hash).unwrap().to_bytes();
        bytes[0] -= HEADER_COMPRESSED;

        let parsed = RecoverableSignature::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.recover(&hash).unwrap(), expected);
    }

    #[test]
    fn test_high_s_is_normalized() {
        let key = SigningKey::random(&mut OsRng);
        let expected = PublicKey::from_verifying_key(key.verifying_key().clone());
        let hash = hash_of(b"z");
        let sig = sign_hash(&key, &hash).unwrap();

        // Replace s with n - s and flip the parity bit, as some signers emit.
        let (r, s) = sig.signature.split_scalars();
        let high = Signature::from_scalars(r.to_bytes(), (-*s).to_bytes()).unwrap();
        let flipped = RecoveryId::new(!sig.recovery_id.is_y_odd(), sig.recovery_id.is_x_reduced());
        let mut bytes = [0u8; COMPACT_SIGNATURE_LEN];
        bytes[0] = HEADER_BASE + HEADER_COMPRESSED + flipped.to_byte();
        bytes[1..].copy_from_slice(&high.to_bytes());

        let parsed = RecoverableSignature::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.recover(&hash).unwrap(), expected);
    }

    #[test]
    fn test_rejects_bad_length_and_header() {
        assert!(matches!(
            RecoverableSignature::from_bytes(&[0u8; 64]),
            Err(SignatureError::Length(64))
        ));
        let mut bytes = [1u8; 65];
        bytes[0] = 40;
        assert!(matches!(
            RecoverableSignature::from_bytes(&bytes),
            Err(SignatureError::Header(40))
        ));
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let key = SigningKey::random(&mut OsRng);
        let public = PublicKey::from_verifying_key(key.verifying_key().clone());
        let hex = public.to_hex();
        assert_eq!(hex.len(), 66);
        assert_eq!(hex.parse::<PublicKey>().unwrap(), public);
        assert!("zz".parse::<PublicKey>().is_err());
    }
}
