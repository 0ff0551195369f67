//! Detached archive signatures
//!
//! Signing never touches the payload of other subfiles. A manifest listing
//! every non-signature subfile with its SHA-256 is stored alongside a
//! signature over the manifest's own hash, both as ordinary subfiles under
//! [`SIGNATURE_PREFIX`]:
//!
//! ```text
//! archive.zip
//! ├── META-INF/MANIFEST.json   (path, sha256, size per subfile)
//! ├── META-INF/RELEASE.SIG     (algorithm, certificate chain, signature)
//! ├── models/panda.egg
//! └── textures/panda.png
//! ```
//!
//! Verification rebuilds the manifest from the current contents and checks
//! both that it matches the stored one and that the signature holds.

use crate::error::{Result, VfsError};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Reserved name prefix for signature material
pub const SIGNATURE_PREFIX: &str = "META-INF/";

/// Subfile holding the signed manifest
pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.json";

/// Extension of per-signer signature subfiles
pub const SIGNATURE_EXTENSION: &str = ".SIG";

const MANIFEST_VERSION: &str = "1.0";
const MAX_ALIAS_LENGTH: usize = 8;

/// External signing collaborator
pub trait ArchiveSigner {
    /// Name the signature subfile is stored under
    fn alias(&self) -> &str;

    /// Algorithm identifier, e.g. "ed25519"
    fn algorithm(&self) -> &str;

    /// Certificate chain, leaf first
    fn certificate_chain(&self) -> Vec<Vec<u8>>;

    /// Sign a manifest digest
    fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>>;
}

/// Bundled Ed25519 signer; its certificate is the raw verifying key
pub struct Ed25519Signer {
    key: SigningKey,
    alias: String,
}

impl Ed25519Signer {
    pub fn new(key: SigningKey, alias: impl Into<String>) -> Self {
        Self {
            key,
            alias: alias.into(),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl ArchiveSigner for Ed25519Signer {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn algorithm(&self) -> &str {
        "ed25519"
    }

    fn certificate_chain(&self) -> Vec<Vec<u8>> {
        vec![self.key.verifying_key().to_bytes().to_vec()]
    }

    fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>> {
        Ok(self.key.sign(digest).to_bytes().to_vec())
    }
}

/// Inventory of the signed subfiles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureManifest {
    pub version: String,

    #[serde(default)]
    pub files: Vec<FileEntry>,
}

/// File entry in manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Subfile name
    pub path: String,

    /// SHA-256 hash of uncompressed content
    pub sha256: String,

    /// Uncompressed size
    pub size: u64,
}

/// Stored signature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEntry {
    /// Signature algorithm (e.g., "ed25519")
    pub algorithm: String,

    pub alias: String,

    /// Certificates, leaf first (hex-encoded)
    pub certificate_chain: Vec<String>,

    /// Signature over the manifest hash (hex-encoded)
    pub signature: String,

    /// Timestamp when signature was created
    pub timestamp: u64,
}

/// Result of checking one signature subfile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    Valid,
    /// Archive contents no longer match the signed manifest
    ManifestMismatch,
    BadSignature,
    UnsupportedAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCheck {
    pub alias: String,
    pub status: SignatureStatus,
}

impl SignatureManifest {
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            files: Vec::new(),
        }
    }

    /// Add a file entry to the manifest
    pub fn add_file(&mut self, path: impl Into<String>, data: &[u8]) {
        self.files.push(FileEntry {
            path: path.into(),
            sha256: hex::encode(Sha256::digest(data)),
            size: data.len() as u64,
        });
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(VfsError::from)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(VfsError::from)
    }

    /// Hash of the canonical (compact, path-sorted) manifest
    pub fn canonical_hash(&self) -> Result<[u8; 32]> {
        let mut canonical = self.clone();
        canonical.files.sort_by(|a, b| a.path.cmp(&b.path));
        let json = serde_json::to_vec(&canonical)?;
        Ok(Sha256::digest(&json).into())
    }
}

impl Default for SignatureManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureEntry {
    /// Sign `manifest` with `signer`
    pub fn create(manifest: &SignatureManifest, signer: &dyn ArchiveSigner, timestamp: u64) -> Result<Self> {
        let hash = manifest.canonical_hash()?;
        let signature = signer.sign(&hash)?;
        Ok(Self {
            algorithm: signer.algorithm().to_string(),
            alias: sanitize_alias(signer.alias()),
            certificate_chain: signer.certificate_chain().iter().map(hex::encode).collect(),
            signature: hex::encode(signature),
            timestamp,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(VfsError::from)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(VfsError::from)
    }

    /// Verify this signature over `hash`
    pub fn verify(&self, hash: &[u8; 32]) -> Result<()> {
        if self.algorithm != "ed25519" {
            return Err(VfsError::Unsupported(format!(
                "signature algorithm {}",
                self.algorithm
            )));
        }

        let leaf = self
            .certificate_chain
            .first()
            .ok_or(VfsError::InvalidPublicKey)?;
        let public_key_bytes = hex::decode(leaf).map_err(|_| VfsError::InvalidPublicKey)?;
        let public_key_array: [u8; 32] = public_key_bytes
            .try_into()
            .map_err(|_| VfsError::InvalidPublicKey)?;
        let public_key = VerifyingKey::from_bytes(&public_key_array)?;

        let signature_bytes =
            hex::decode(&self.signature).map_err(|_| VfsError::InvalidSignature)?;
        let signature_array: [u8; 64] = signature_bytes
            .try_into()
            .map_err(|_| VfsError::InvalidSignature)?;
        let signature = Signature::from_bytes(&signature_array);

        public_key.verify(hash, &signature)?;
        Ok(())
    }
}

/// Uppercase, `[A-Z0-9_-]` only, at most eight characters
pub fn sanitize_alias(alias: &str) -> String {
    let cleaned: String = alias
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_ALIAS_LENGTH)
        .collect();
    if cleaned.is_empty() {
        "SIGNER".to_string()
    } else {
        cleaned
    }
}

/// Subfile name for a signer's signature entry
pub fn signature_subfile_name(alias: &str) -> String {
    format!(
        "{}{}{}",
        SIGNATURE_PREFIX,
        sanitize_alias(alias),
        SIGNATURE_EXTENSION
    )
}

/// True for names under the reserved signature prefix
pub fn is_signature_name(name: &str) -> bool {
    name.starts_with(SIGNATURE_PREFIX)
}
