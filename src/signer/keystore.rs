//! Local keystore backend
//!
//! The keystore is a JSON file holding an ordered list of secp256k1 keys.
//! Public keys are always readable; secrets are either plain hex or, once a
//! password is set, sealed with ChaCha20-Poly1305 under a key derived with
//! PBKDF2-HMAC-SHA256:
//!
//! ```json
//! {
//!   "version": 1,
//!   "created_at": "2024-05-17T13:45:10Z",
//!   "encryption": {
//!     "kdf": "PBKDF2-HMAC-SHA256",
//!     "kdf_iterations": 100000,
//!     "aead": "ChaCha20-Poly1305",
//!     "salt_hex": "..."
//!   },
//!   "keys": [
//!     { "public_key": "02...", "secret": { "kind": "encrypted", "nonce_hex": "...", "ciphertext_hex": "..." } }
//!   ]
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use super::{sign_hash, PublicKey, RecoverableSignature, Signer, SignerError};
use crate::console::Console;

/// Keystore file format version
pub const KEYSTORE_VERSION: u32 = 1;

/// Default PBKDF2 iteration count for newly encrypted keystores
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

const KDF_NAME: &str = "PBKDF2-HMAC-SHA256";
const AEAD_NAME: &str = "ChaCha20-Poly1305";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Shown when an entered password does not unlock the keystore.
pub const WRONG_PASSWORD_MESSAGE: &str = "Password is incorrect, please try again";

/// Errors for keystore operations
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("keystore not found at {0}")]
    NotFound(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid keystore: {0}")]
    Parse(String),

    #[error("unsupported keystore version {0}")]
    UnsupportedVersion(u32),

    #[error("wrong password")]
    WrongPassword,

    #[error("keystore is encrypted and no password was given")]
    PasswordRequired,

    #[error("keystore is already encrypted")]
    AlreadyEncrypted,

    #[error("key index {index} out of range, keystore holds {len} keys")]
    KeyIndex { index: usize, len: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Encryption {
    kdf: String,
    kdf_iterations: u32,
    aead: String,
    salt_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum KeySecret {
    Plain { secret_hex: String },
    Encrypted { nonce_hex: String, ciphertext_hex: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyEntry {
    public_key: String,
    secret: KeySecret,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeystoreFile {
    version: u32,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encryption: Option<Encryption>,
    keys: Vec<KeyEntry>,
}

/// An ordered collection of signing keys.
#[derive(Debug, Clone)]
pub struct Keystore {
    file: KeystoreFile,
    public_keys: Vec<PublicKey>,
    kdf_iterations: u32,
}

impl Keystore {
    /// A new, unencrypted keystore holding one fresh key.
    pub fn create() -> Self {
        let key = SigningKey::random(&mut OsRng);
        let public = PublicKey::from_verifying_key(key.verifying_key().clone());
        let entry = KeyEntry {
            public_key: public.to_hex(),
            secret: KeySecret::Plain {
                secret_hex: hex::encode(key.to_bytes()),
            },
        };
        Self {
            file: KeystoreFile {
                version: KEYSTORE_VERSION,
                created_at: Utc::now(),
                encryption: None,
                keys: vec![entry],
            },
            public_keys: vec![public],
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
        }
    }

    /// Iteration count used by the next [`Keystore::encrypt`].
    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = iterations.max(1);
        self
    }

    /// Load a keystore file.
    pub fn load(path: &Path) -> Result<Self, KeystoreError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(KeystoreError::NotFound(path.to_path_buf()))
            }
            Err(source) => {
                return Err(KeystoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let file: KeystoreFile =
            serde_json::from_slice(&bytes).map_err(|e| KeystoreError::Parse(e.to_string()))?;
        if file.version != KEYSTORE_VERSION {
            return Err(KeystoreError::UnsupportedVersion(file.version));
        }
        if file.keys.is_empty() {
            return Err(KeystoreError::Parse("keystore holds no keys".to_string()));
        }

        let public_keys = file
            .keys
            .iter()
            .map(|entry| {
                entry
                    .public_key
                    .parse::<PublicKey>()
                    .map_err(|e| KeystoreError::Parse(format!("bad public key: {}", e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let kdf_iterations = file
            .encryption
            .as_ref()
            .map_or(DEFAULT_KDF_ITERATIONS, |e| e.kdf_iterations);

        debug!(path = %path.display(), keys = public_keys.len(), "keystore loaded");
        Ok(Self {
            file,
            public_keys,
            kdf_iterations,
        })
    }

    /// Write the keystore, replacing any existing file atomically.
    pub fn save(&self, path: &Path) -> Result<(), KeystoreError> {
        let io_err = |source| KeystoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_vec_pretty(&self.file).map_err(|e| KeystoreError::Parse(e.to_string()))?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staged = NamedTempFile::new_in(dir).map_err(io_err)?;
        io::Write::write_all(&mut staged, &json).map_err(io_err)?;
        staged.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.file.encryption.is_some()
    }

    pub fn len(&self) -> usize {
        self.public_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.public_keys.is_empty()
    }

    pub fn public_key(&self, index: usize) -> Result<&PublicKey, KeystoreError> {
        self.public_keys.get(index).ok_or(KeystoreError::KeyIndex {
            index,
            len: self.public_keys.len(),
        })
    }

    /// Seal every secret under `password`.
    pub fn encrypt(&mut self, password: &SecretString) -> Result<(), KeystoreError> {
        if self.is_encrypted() {
            return Err(KeystoreError::AlreadyEncrypted);
        }

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let cipher = cipher_for(password, &salt, self.kdf_iterations);

        for entry in &mut self.file.keys {
            let KeySecret::Plain { secret_hex } = &entry.secret else {
                continue;
            };
            let secret = hex::decode(secret_hex).map_err(|e| KeystoreError::Parse(e.to_string()))?;
            let mut nonce = [0u8; NONCE_LEN];
            OsRng.fill_bytes(&mut nonce);
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&nonce), secret.as_slice())
                .map_err(|_| KeystoreError::Parse("encryption failed".to_string()))?;
            entry.secret = KeySecret::Encrypted {
                nonce_hex: hex::encode(nonce),
                ciphertext_hex: hex::encode(ciphertext),
            };
        }

        self.file.encryption = Some(Encryption {
            kdf: KDF_NAME.to_string(),
            kdf_iterations: self.kdf_iterations,
            aead: AEAD_NAME.to_string(),
            salt_hex: hex::encode(salt),
        });
        Ok(())
    }

    /// Remove encryption, leaving plain secrets in memory.
    pub fn decrypt(&mut self, password: &SecretString) -> Result<(), KeystoreError> {
        let secrets = (0..self.len())
            .map(|i| self.secret_bytes(i, Some(password)))
            .collect::<Result<Vec<_>, _>>()?;
        for (entry, secret) in self.file.keys.iter_mut().zip(secrets) {
            entry.secret = KeySecret::Plain {
                secret_hex: hex::encode(secret),
            };
        }
        self.file.encryption = None;
        Ok(())
    }

    /// The signing key at `index`, decrypting with `password` if needed.
    pub fn signing_key(&self, index: usize, password: Option<&SecretString>) -> Result<SigningKey, KeystoreError> {
        let secret = self.secret_bytes(index, password)?;
        let key = SigningKey::from_slice(&secret).map_err(|e| KeystoreError::Parse(e.to_string()))?;
        if PublicKey::from_verifying_key(key.verifying_key().clone()) != self.public_keys[index] {
            return Err(KeystoreError::Parse(format!("key {} does not match its public key", index)));
        }
        Ok(key)
    }

    fn secret_bytes(&self, index: usize, password: Option<&SecretString>) -> Result<Vec<u8>, KeystoreError> {
        let entry = self.file.keys.get(index).ok_or(KeystoreError::KeyIndex {
            index,
            len: self.file.keys.len(),
        })?;

        match (&entry.secret, &self.file.encryption) {
            (KeySecret::Plain { secret_hex }, _) => {
                hex::decode(secret_hex).map_err(|e| KeystoreError::Parse(e.to_string()))
            }
            (KeySecret::Encrypted { .. }, None) => Err(KeystoreError::Parse(
                "encrypted key without encryption parameters".to_string(),
            )),
            (KeySecret::Encrypted { nonce_hex, ciphertext_hex }, Some(params)) => {
                let password = password.ok_or(KeystoreError::PasswordRequired)?;
                let salt = hex::decode(&params.salt_hex).map_err(|e| KeystoreError::Parse(e.to_string()))?;
                let nonce = hex::decode(nonce_hex).map_err(|e| KeystoreError::Parse(e.to_string()))?;
                if nonce.len() != NONCE_LEN {
                    return Err(KeystoreError::Parse(format!(
                        "invalid nonce size: expected {}, got {}",
                        NONCE_LEN,
                        nonce.len()
                    )));
                }
                let ciphertext =
                    hex::decode(ciphertext_hex).map_err(|e| KeystoreError::Parse(e.to_string()))?;

                cipher_for(password, &salt, params.kdf_iterations)
                    .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
                    .map_err(|_| KeystoreError::WrongPassword)
            }
        }
    }
}

fn cipher_for(password: &SecretString, salt: &[u8], iterations: u32) -> ChaCha20Poly1305 {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.expose_secret().as_bytes(), salt, iterations, &mut key);
    ChaCha20Poly1305::new(Key::from_slice(&key))
}

/// Prompt until `attempt` accepts a password.
///
/// Wrong passwords are reported and asked again; a closed console aborts.
fn with_password_retry<T, C>(
    console: &C,
    mut attempt: impl FnMut(&SecretString) -> Result<T, KeystoreError>,
) -> Result<T, SignerError>
where
    C: Console + ?Sized,
{
    loop {
        let password = console
            .read_secret("Password: ")
            .map_err(|e| SignerError::Aborted(format!("no password entered: {}", e)))?;
        match attempt(&password) {
            Ok(value) => return Ok(value),
            Err(KeystoreError::WrongPassword) => console.say(WRONG_PASSWORD_MESSAGE),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Ask for a new password twice; `None` if the two entries differ.
fn read_new_password<C: Console + ?Sized>(console: &C) -> Result<Option<SecretString>, SignerError> {
    let aborted = |e: io::Error| SignerError::Aborted(format!("no password entered: {}", e));
    let first = console.read_secret("New password: ").map_err(aborted)?;
    let second = console.read_secret("Repeat password: ").map_err(aborted)?;
    if first.expose_secret() == second.expose_secret() {
        Ok(Some(first))
    } else {
        Ok(None)
    }
}

/// Load the keystore at `path`, creating and encrypting one if absent.
///
/// A mismatched password confirmation aborts before anything is written.
pub fn ensure_keystore<C>(path: &Path, console: &C, kdf_iterations: u32) -> Result<Keystore, SignerError>
where
    C: Console + ?Sized,
{
    match Keystore::load(path) {
        Ok(keystore) => return Ok(keystore),
        Err(KeystoreError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    console.say("Creating a new keystore. Choose a password to protect it.");
    let password = read_new_password(console)?
        .ok_or_else(|| SignerError::Aborted("passwords do not match".to_string()))?;

    let mut keystore = Keystore::create().with_kdf_iterations(kdf_iterations);
    if !password.expose_secret().is_empty() {
        keystore.encrypt(&password)?;
    }
    keystore.save(path)?;
    info!(path = %path.display(), "created keystore");
    Ok(keystore)
}

/// Change the password of the keystore at `path`.
///
/// The old password is asked for (with retries) when the keystore is
/// encrypted. The new password must be non-empty; an empty or mismatched one
/// leaves the file untouched.
pub fn change_password<C>(path: &Path, console: &C, kdf_iterations: u32) -> Result<(), SignerError>
where
    C: Console + ?Sized,
{
    let mut keystore = Keystore::load(path)?.with_kdf_iterations(kdf_iterations);
    if keystore.is_encrypted() {
        keystore = with_password_retry(console, |password| {
            let mut unlocked = keystore.clone();
            unlocked.decrypt(password)?;
            Ok(unlocked)
        })?;
    }

    let password = read_new_password(console)?
        .ok_or_else(|| SignerError::Aborted("passwords do not match".to_string()))?;
    if password.expose_secret().is_empty() {
        return Err(SignerError::Aborted("new password must not be empty".to_string()));
    }
    keystore.encrypt(&password)?;
    keystore.save(path)?;
    info!(path = %path.display(), "keystore password changed");
    Ok(())
}

/// Signs with one key of the local keystore.
pub struct KeystoreSigner<'c, C: Console + ?Sized> {
    keystore: Keystore,
    key_index: usize,
    expected: PublicKey,
    console: &'c C,
}

impl<'c, C: Console + ?Sized> KeystoreSigner<'c, C> {
    pub fn new(keystore: Keystore, key_index: usize, console: &'c C) -> Result<Self, KeystoreError> {
        let expected = keystore.public_key(key_index)?.clone();
        Ok(Self {
            keystore,
            key_index,
            expected,
            console,
        })
    }

    fn unlock(&self) -> Result<SigningKey, SignerError> {
        if !self.keystore.is_encrypted() {
            return Ok(self.keystore.signing_key(self.key_index, None)?);
        }
        with_password_retry(self.console, |password| {
            self.keystore.signing_key(self.key_index, Some(password))
        })
    }
}

impl<C: Console + ?Sized> Signer for KeystoreSigner<'_, C> {
    fn sign(&mut self, hash: &[u8; 32]) -> Result<RecoverableSignature, SignerError> {
        let key = self.unlock()?;
        Ok(sign_hash(&key, hash)?)
    }

    fn expected_key(&self) -> Option<&PublicKey> {
        Some(&self.expected)
    }
}
