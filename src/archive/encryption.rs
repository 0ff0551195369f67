//! Password-based payload encryption
//!
//! Encrypted payloads carry a self-describing envelope so a reader only needs
//! the password:
//!
//! ```text
//! [algorithm u16][key length u16][iterations u32][salt 16][nonce 12][ciphertext||tag]
//! ```
//!
//! The key is derived with PBKDF2-HMAC-SHA256 and the payload sealed with
//! AES-GCM. Compression, when requested, happens before encryption.

use crate::error::{Result, VfsError};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Aes256Gcm, Nonce,
};
use sha2::Sha256;
use std::fmt;

/// Default PBKDF2 iteration count
pub const DEFAULT_ITERATION_COUNT: u32 = 100_000;

/// Default cipher name
pub const DEFAULT_ALGORITHM: &str = "aes-gcm";

/// Default key length in bytes
pub const DEFAULT_KEY_LENGTH: u16 = 32;

/// Envelope bytes preceding the ciphertext
pub const ENVELOPE_HEADER_SIZE: usize = 2 + 2 + 4 + SALT_SIZE + NONCE_SIZE;

const ALGORITHM_AES_GCM: u16 = 1;
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Container-level encryption parameters
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionParams {
    pub password: String,
    pub algorithm: String,
    /// Key length in bytes
    pub key_length: u16,
    pub iteration_count: u32,
}

impl fmt::Debug for EncryptionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionParams")
            .field("password", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("key_length", &self.key_length)
            .field("iteration_count", &self.iteration_count)
            .finish()
    }
}

impl EncryptionParams {
    /// Parameters with the default algorithm, key length and iteration count
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            algorithm: DEFAULT_ALGORITHM.to_string(),
            key_length: DEFAULT_KEY_LENGTH,
            iteration_count: DEFAULT_ITERATION_COUNT,
        }
    }

    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = algorithm.into();
        self
    }

    pub fn with_key_length(mut self, key_length: u16) -> Self {
        self.key_length = key_length;
        self
    }

    pub fn with_iteration_count(mut self, iteration_count: u32) -> Self {
        self.iteration_count = iteration_count;
        self
    }

    /// Reject parameters this build cannot honour
    pub fn validate(&self) -> Result<()> {
        let key_ok = match self.algorithm.to_ascii_lowercase().as_str() {
            "aes-gcm" => matches!(self.key_length, 16 | 32),
            "aes-128-gcm" => self.key_length == 16,
            "aes-256-gcm" => self.key_length == 32,
            other => {
                return Err(VfsError::Unsupported(format!(
                    "encryption algorithm {}",
                    other
                )))
            }
        };
        if !key_ok {
            return Err(VfsError::Unsupported(format!(
                "{} with a {}-byte key",
                self.algorithm, self.key_length
            )));
        }
        if self.iteration_count == 0 {
            return Err(VfsError::InvalidConfig(
                "iteration count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn derive_key(password: &str, salt: &[u8], iterations: u32, key_length: usize) -> Vec<u8> {
    let mut key = vec![0u8; key_length];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

fn seal(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    #[allow(deprecated)]
    let nonce = Nonce::from_slice(nonce);
    let sealed = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| VfsError::EncryptionFailed)?
            .encrypt(nonce, plaintext),
        _ => Aes256Gcm::new_from_slice(key)
            .map_err(|_| VfsError::EncryptionFailed)?
            .encrypt(nonce, plaintext),
    };
    sealed.map_err(|_| VfsError::EncryptionFailed)
}

fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    #[allow(deprecated)]
    let nonce = Nonce::from_slice(nonce);
    let opened = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| VfsError::DecryptionFailed)?
            .decrypt(nonce, ciphertext),
        _ => Aes256Gcm::new_from_slice(key)
            .map_err(|_| VfsError::DecryptionFailed)?
            .decrypt(nonce, ciphertext),
    };
    opened.map_err(|_| VfsError::DecryptionFailed)
}

/// Encrypt `plaintext` into a self-describing envelope
pub fn encrypt(params: &EncryptionParams, plaintext: &[u8]) -> Result<Vec<u8>> {
    params.validate()?;

    let salt: [u8; SALT_SIZE] = rand::random();
    let nonce: [u8; NONCE_SIZE] = rand::random();
    let key = derive_key(
        &params.password,
        &salt,
        params.iteration_count,
        params.key_length as usize,
    );
    let ciphertext = seal(&key, &nonce, plaintext)?;

    let mut payload = Vec::with_capacity(ENVELOPE_HEADER_SIZE + ciphertext.len());
    payload.extend_from_slice(&ALGORITHM_AES_GCM.to_le_bytes());
    payload.extend_from_slice(&params.key_length.to_le_bytes());
    payload.extend_from_slice(&params.iteration_count.to_le_bytes());
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(payload)
}

/// Open an envelope produced by [`encrypt`]
pub fn decrypt(password: &str, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < ENVELOPE_HEADER_SIZE + TAG_SIZE {
        return Err(VfsError::DecryptionFailed);
    }

    let algorithm = u16::from_le_bytes([payload[0], payload[1]]);
    let key_length = u16::from_le_bytes([payload[2], payload[3]]);
    let iterations = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    if algorithm != ALGORITHM_AES_GCM {
        return Err(VfsError::Unsupported(format!(
            "encryption algorithm id {}",
            algorithm
        )));
    }
    if !matches!(key_length, 16 | 32) || iterations == 0 {
        return Err(VfsError::DecryptionFailed);
    }

    let salt = &payload[8..8 + SALT_SIZE];
    let nonce = &payload[8 + SALT_SIZE..ENVELOPE_HEADER_SIZE];
    let key = derive_key(password, salt, iterations, key_length as usize);
    open(&key, nonce, &payload[ENVELOPE_HEADER_SIZE..])
}
