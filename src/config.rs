//! Configuration for the default mount table and archive defaults
//!
//! Configuration is TOML. Every field has a default, so an empty document is
//! a valid configuration:
//!
//! ```toml
//! case_sensitive = false
//! implicit_pz = true
//! mount_system_root = true
//! mounts = ["$HOME/game/models.mf /models ro", "/srv/assets /assets"]
//! ramdisks = ["/tmp ro"]
//!
//! [archive]
//! record_timestamp = true
//! scale_factor = 1
//!
//! [encryption]
//! algorithm = "aes-gcm"
//! key_length = 32
//! iteration_count = 100000
//!
//! [stream]
//! window_buffer_size = 4096
//! ```

use crate::archive::encryption::{
    EncryptionParams, DEFAULT_ALGORITHM, DEFAULT_ITERATION_COUNT, DEFAULT_KEY_LENGTH,
};
use crate::error::{Result, VfsError};
use crate::mount::MountFlags;
use crate::stream::DEFAULT_WINDOW_BUFFER_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Environment variable naming a TOML configuration file
pub const CONFIG_ENV: &str = "LAYERFS_CONFIG";

/// Environment variable holding extra `;`-separated mount descriptors
pub const MOUNT_ENV: &str = "LAYERFS_MOUNT";

fn default_true() -> bool {
    true
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// Native mounts reject names whose case differs from the disk
    pub case_sensitive: bool,

    /// A missing `name` may be served from a zlib-compressed `name.pz`
    pub implicit_pz: bool,

    /// Mount the host root at `/` in the default table
    pub mount_system_root: bool,

    /// Initial working directory; the process directory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Mount descriptors, `<system-path> <mount-point> [options]`
    pub mounts: Vec<String>,

    /// In-memory mounts, `<mount-point> [options]`
    pub ramdisks: Vec<String>,

    pub archive: ArchiveConfig,
    pub encryption: EncryptionConfig,
    pub stream: StreamConfig,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            implicit_pz: true,
            mount_system_root: true,
            cwd: None,
            mounts: Vec::new(),
            ramdisks: Vec::new(),
            archive: ArchiveConfig::default(),
            encryption: EncryptionConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

/// Defaults applied to archive containers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    #[serde(default = "default_true")]
    pub record_timestamp: bool,
    pub scale_factor: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            record_timestamp: true,
            scale_factor: 1,
        }
    }
}

/// Parameters for encrypting new subfiles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub algorithm: String,
    pub key_length: u16,
    pub iteration_count: u32,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            algorithm: DEFAULT_ALGORITHM.to_string(),
            key_length: DEFAULT_KEY_LENGTH,
            iteration_count: DEFAULT_ITERATION_COUNT,
        }
    }
}

impl EncryptionConfig {
    /// Encryption parameters for `password` using these settings
    pub fn params(&self, password: impl Into<String>) -> Result<EncryptionParams> {
        let params = EncryptionParams::new(password)
            .with_algorithm(self.algorithm.clone())
            .with_key_length(self.key_length)
            .with_iteration_count(self.iteration_count);
        params.validate()?;
        Ok(params)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Buffer size of windowed subfile readers
    pub window_buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            window_buffer_size: DEFAULT_WINDOW_BUFFER_SIZE,
        }
    }
}

impl VfsConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: VfsConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Configuration from the process environment
    ///
    /// Reads the file named by `LAYERFS_CONFIG` when set, then appends the
    /// descriptors in `LAYERFS_MOUNT`. An unreadable file is logged and the
    /// defaults are used in its place.
    pub fn from_env() -> Self {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(&path).unwrap_or_else(|err| {
                warn!(path = %path, error = %err, "ignoring unreadable configuration");
                Self::default()
            }),
            _ => Self::default(),
        };
        if let Ok(extra) = std::env::var(MOUNT_ENV) {
            config.mounts.extend(
                extra
                    .split(';')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string),
            );
        }
        debug!(mounts = config.mounts.len(), ramdisks = config.ramdisks.len(), "loaded configuration");
        config
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.archive.scale_factor == 0 {
            return Err(VfsError::InvalidConfig("archive.scale_factor must be at least 1".into()));
        }
        if self.stream.window_buffer_size == 0 {
            return Err(VfsError::InvalidConfig(
                "stream.window_buffer_size must be at least 1".into(),
            ));
        }
        self.encryption.params(String::new()).map(|_| ())
    }
}

/// Options field of a mount descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub read_only: bool,
    /// Archive decryption password (`pw:<password>`)
    pub password: Option<String>,
}

impl MountOptions {
    /// Parse a comma-separated option list; unknown options are ignored
    pub fn parse(options: &str) -> Self {
        let mut parsed = MountOptions::default();
        for option in options.split(',') {
            match option {
                "" | "0" => {}
                "ro" => parsed.read_only = true,
                _ => match option.strip_prefix("pw:") {
                    Some(password) => parsed.password = Some(password.to_string()),
                    None => warn!(option, "ignoring unknown mount option"),
                },
            }
        }
        parsed
    }

    pub fn flags(&self) -> MountFlags {
        if self.read_only {
            MountFlags::READ_ONLY
        } else {
            MountFlags::empty()
        }
    }
}

/// One parsed `<system-path> <mount-point> [options]` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountDescriptor {
    pub physical: String,
    pub mount_point: String,
    pub options: MountOptions,
}

/// Split off the last space-separated token, dropping the run of spaces before it
fn split_last(text: &str) -> Option<(&str, &str)> {
    let space = text.rfind(' ')?;
    Some((text[..space].trim_end(), &text[space + 1..]))
}

impl MountDescriptor {
    /// Parse a descriptor
    ///
    /// The last token is the mount point. When another space precedes it,
    /// that last token is the options field and the one before it is the
    /// mount point. Whatever remains, spaces included, is the system path,
    /// with `$NAME` and `${NAME}` expanded from the environment.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (rest, last) = split_last(line).ok_or_else(|| {
            VfsError::InvalidConfig(format!("no space in mount descriptor: {}", line))
        })?;
        let (physical, mount_point, options) = match split_last(rest) {
            Some((physical, mount_point)) => (physical, mount_point, last),
            None => (rest, last, ""),
        };
        if physical.is_empty() || mount_point.is_empty() {
            return Err(VfsError::InvalidConfig(format!("malformed mount descriptor: {}", line)));
        }
        Ok(Self {
            physical: expand_env(physical),
            mount_point: mount_point.to_string(),
            options: MountOptions::parse(options),
        })
    }
}

/// Parse a ramdisk line, `<mount-point> [options]`
pub fn parse_ramdisk(line: &str) -> (String, MountOptions) {
    let line = line.trim();
    match split_last(line) {
        Some((mount_point, options)) => (mount_point.to_string(), MountOptions::parse(options)),
        None => (line.to_string(), MountOptions::default()),
    }
}

/// Expand `$NAME` and `${NAME}` from the environment; unset names expand to ""
pub fn expand_env(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(dollar) = rest.find('$') {
        out.push_str(&rest[..dollar]);
        let after = &rest[dollar + 1..];
        let (name, tail) = match after.strip_prefix('{') {
            Some(braced) => match braced.find('}') {
                Some(end) => (&braced[..end], &braced[end + 1..]),
                None => ("", after),
            },
            None => {
                let end = after
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                    .unwrap_or(after.len());
                (&after[..end], &after[end..])
            }
        };
        if name.is_empty() {
            out.push('$');
            rest = after;
            continue;
        }
        out.push_str(&std::env::var(name).unwrap_or_default());
        rest = tail;
    }
    out.push_str(rest);
    out
}
