use super::compression::{CompressionMethod, DEFAULT_COMPRESSION_LEVEL};
use super::encryption::{self, EncryptionParams};
use super::linear::{self, IndexEntry, LinearHeader, ENTRY_FLAG_DELETED, FLAGS_OFFSET};
use super::signature::{
    is_signature_name, signature_subfile_name, ArchiveSigner, SignatureCheck, SignatureEntry,
    SignatureManifest, SignatureStatus, MANIFEST_NAME, SIGNATURE_EXTENSION, SIGNATURE_PREFIX,
};
use super::subfile::{standardize_name, SubfileFlags, SubfileOptions, SubfileRecord};
use super::wire::pad_to;
use super::zip::{self, CentralEntry};
use crate::config::ArchiveConfig;
use crate::error::{Result, VfsError};
use crate::stream::{LockedStream, WindowedStream, DEFAULT_WINDOW_BUFFER_SIZE};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Chunk size for copying payloads during a repack
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Bytes inspected when sniffing the container format
const DETECT_WINDOW: usize = 4096;

/// Number of times a flush may push the index forward to reach the true end
const MAX_INDEX_SHIFTS: usize = 3;

/// On-disk layout of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Legacy linear index with scale-factor offsets
    Linear,
    /// ZIP-compatible central directory
    Zip,
}

/// Lifecycle state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Closed,
    ReadValid,
    WriteValid,
    ReadWriteValid,
}

impl ContainerState {
    fn readable(self) -> bool {
        matches!(self, Self::ReadValid | Self::ReadWriteValid)
    }

    fn writable(self) -> bool {
        matches!(self, Self::WriteValid | Self::ReadWriteValid)
    }
}

/// One subfile that failed verification
#[derive(Debug)]
pub struct VerifyFailure {
    pub name: String,
    pub error: VfsError,
}

/// Outcome of [`ArchiveContainer::verify`]
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub failures: Vec<VerifyFailure>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
struct LinearLayout {
    header: LinearHeader,
    first_index: u64,
    /// Last entry of the on-disk chain; `None` while the chain is empty
    last_index: Option<u64>,
    /// Header to apply on the next repack (scale factor or prefix changed)
    pending_header: Option<LinearHeader>,
}

impl LinearLayout {
    fn new(scale_factor: u32, timestamp: u32) -> Self {
        let header = LinearHeader::new(scale_factor, timestamp);
        Self {
            first_index: linear::first_index_offset(&header),
            header,
            last_index: None,
            pending_header: None,
        }
    }

    fn scale(&self) -> u64 {
        self.header.scale_factor as u64
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Archive container holding named subfiles
///
/// Records live in an arena addressed by integer id; `live` holds the ids of
/// current subfiles sorted by name, and `removed` the ids replaced or removed
/// since the last flush. Payloads are written eagerly when a subfile is
/// added; the index only switches over on flush.
///
/// Mutating operations take `&mut self`, so callers serialize them. Reads
/// take `&self` and may run concurrently from many threads.
pub struct ArchiveContainer {
    state: ContainerState,
    format: ArchiveFormat,
    stream: Option<LockedStream>,
    path: Option<PathBuf>,
    records: Vec<SubfileRecord>,
    live: Vec<usize>,
    removed: Vec<usize>,
    needs_repack: bool,
    index_changed: bool,
    /// Where the next payload (or the next index) is written
    append_cursor: u64,
    /// Highest offset known to hold archive bytes
    file_end: u64,
    comment: Vec<u8>,
    linear: LinearLayout,
    encryption: Option<EncryptionParams>,
    password: Option<String>,
    record_timestamp: bool,
    window_buffer_size: usize,
}

impl std::fmt::Debug for ArchiveContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveContainer")
            .field("state", &self.state)
            .field("format", &self.format)
            .field("path", &self.path)
            .field("subfiles", &self.live.len())
            .field("needs_repack", &self.needs_repack)
            .finish()
    }
}

impl ArchiveContainer {
    fn closed(format: ArchiveFormat) -> Self {
        Self {
            state: ContainerState::Closed,
            format,
            stream: None,
            path: None,
            records: Vec::new(),
            live: Vec::new(),
            removed: Vec::new(),
            needs_repack: false,
            index_changed: false,
            append_cursor: 0,
            file_end: 0,
            comment: Vec::new(),
            linear: LinearLayout::new(1, 0),
            encryption: None,
            password: None,
            record_timestamp: true,
            window_buffer_size: DEFAULT_WINDOW_BUFFER_SIZE,
        }
    }

    /// Open an existing archive file for reading
    pub fn open_read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)?;
        let stream = LockedStream::owned(crate::stream::ReadOnly(file));
        let container = Self::load(stream, ContainerState::ReadValid, Some(path.to_path_buf()))?;
        info!(path = %path.display(), subfiles = container.live.len(), "opened archive for reading");
        Ok(container)
    }

    /// Read an archive from an existing stream
    pub fn open_read_stream(stream: LockedStream) -> Result<Self> {
        Self::load(stream, ContainerState::ReadValid, None)
    }

    /// Create (or truncate) an archive file
    pub fn open_write<P: AsRef<Path>>(path: P, format: ArchiveFormat) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let container = Self::create(
            LockedStream::owned(file),
            format,
            ContainerState::WriteValid,
            Some(path.to_path_buf()),
        )?;
        info!(path = %path.display(), ?format, "created archive");
        Ok(container)
    }

    /// Write a new archive into an existing stream
    pub fn open_write_stream(stream: LockedStream, format: ArchiveFormat) -> Result<Self> {
        Self::create(stream, format, ContainerState::WriteValid, None)
    }

    /// Open an archive file for modification, creating it if missing or empty
    ///
    /// `format` only applies to a newly created archive; an existing one keeps
    /// its own format.
    pub fn open_read_write<P: AsRef<Path>>(path: P, format: ArchiveFormat) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let container = Self::open_read_write_inner(
            LockedStream::owned(file),
            format,
            Some(path.to_path_buf()),
        )?;
        info!(path = %path.display(), format = ?container.format, "opened archive for update");
        Ok(container)
    }

    /// Modify an archive held in an existing stream
    pub fn open_read_write_stream(stream: LockedStream, format: ArchiveFormat) -> Result<Self> {
        Self::open_read_write_inner(stream, format, None)
    }

    fn open_read_write_inner(
        stream: LockedStream,
        format: ArchiveFormat,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        if stream.seek_to_end()? == 0 {
            Self::create(stream, format, ContainerState::ReadWriteValid, path)
        } else {
            Self::load(stream, ContainerState::ReadWriteValid, path)
        }
    }

    fn detect_format(stream: &LockedStream) -> Result<ArchiveFormat> {
        let mut head = vec![0u8; DETECT_WINDOW];
        let outcome = stream.atomic_seek_read(0, &mut head)?;
        head.truncate(outcome.count);
        if LinearHeader::detect(&head) {
            Ok(ArchiveFormat::Linear)
        } else {
            Ok(ArchiveFormat::Zip)
        }
    }

    fn load(stream: LockedStream, state: ContainerState, path: Option<PathBuf>) -> Result<Self> {
        let format = Self::detect_format(&stream)?;
        let mut container = Self::closed(format);

        match format {
            ArchiveFormat::Zip => {
                let index = zip::read_index(&stream)?;
                container.comment = index.comment;
                container.append_cursor = index.directory_offset;
                container.file_end = index.file_end;
                container.install_records(index.records);
            }
            ArchiveFormat::Linear => {
                let index = linear::read_index(&stream)?;
                container.linear = LinearLayout {
                    first_index: index.first_index,
                    last_index: index.last_index,
                    pending_header: None,
                    header: index.header,
                };
                container.append_cursor = pad_to(index.file_end, container.linear.scale());
                container.file_end = index.file_end;
                container.needs_repack = index.needs_repack;
                container.install_records(index.records);
            }
        }

        container.stream = Some(stream);
        container.path = path;
        container.state = state;
        Ok(container)
    }

    fn create(
        stream: LockedStream,
        format: ArchiveFormat,
        state: ContainerState,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let mut container = Self::closed(format);
        container.file_end = stream.seek_to_end()?;

        match format {
            ArchiveFormat::Zip => {
                // An empty archive still needs its end record
                container.index_changed = true;
            }
            ArchiveFormat::Linear => {
                container.linear = LinearLayout::new(1, now() as u32);
                container.write_fresh_linear_header(&stream)?;
            }
        }

        container.stream = Some(stream);
        container.path = path;
        container.state = state;
        Ok(container)
    }

    fn write_fresh_linear_header(&mut self, stream: &LockedStream) -> Result<()> {
        let bytes = linear::encode_empty(&self.linear.header)?;
        stream.atomic_seek_write(0, &bytes)?;
        self.linear.first_index = linear::first_index_offset(&self.linear.header);
        self.linear.last_index = None;
        self.append_cursor = bytes.len() as u64;
        self.file_end = self.file_end.max(self.append_cursor);
        Ok(())
    }

    /// Sort loaded records by name; a later duplicate shadows an earlier one
    fn install_records(&mut self, records: Vec<SubfileRecord>) {
        let base = self.records.len();
        self.records.extend(records);
        let mut ids: Vec<usize> = (base..self.records.len()).collect();
        ids.sort_by(|&a, &b| self.records[a].name.cmp(&self.records[b].name));

        for id in ids {
            let duplicate = self
                .live
                .last()
                .is_some_and(|&last| self.records[last].name == self.records[id].name);
            if duplicate {
                if let Some(shadowed) = self.live.pop() {
                    warn!(name = %self.records[id].name, "duplicate subfile name in index");
                    self.removed.push(shadowed);
                    self.needs_repack = true;
                }
            }
            self.live.push(id);
        }
    }

    /// Apply archive defaults from configuration
    pub fn configure(&mut self, config: &ArchiveConfig) -> Result<()> {
        self.record_timestamp = config.record_timestamp;
        if self.format == ArchiveFormat::Linear && self.state.writable() {
            self.set_scale_factor(config.scale_factor)?;
        }
        Ok(())
    }

    // ---- state ----

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// True once removed or replaced subfiles left space only a repack reclaims
    pub fn needs_repack(&self) -> bool {
        self.needs_repack
    }

    fn stream(&self) -> Result<&LockedStream> {
        if self.state == ContainerState::Closed {
            return Err(VfsError::InvalidState("reading"));
        }
        self.stream.as_ref().ok_or(VfsError::InvalidState("reading"))
    }

    fn readable_stream(&self) -> Result<&LockedStream> {
        if !self.state.readable() {
            return Err(VfsError::InvalidState("reading"));
        }
        self.stream()
    }

    /// A borrowed handle, so `self` stays free for mutation
    fn writable_stream(&self) -> Result<LockedStream> {
        if !self.state.writable() {
            return Err(VfsError::InvalidState("writing"));
        }
        self.stream
            .as_ref()
            .map(LockedStream::borrow)
            .ok_or(VfsError::InvalidState("writing"))
    }

    // ---- settings ----

    /// Record modification timestamps on new subfiles (default on)
    pub fn set_record_timestamp(&mut self, record_timestamp: bool) {
        self.record_timestamp = record_timestamp;
    }

    /// Encrypt subfiles added from now on
    pub fn set_encryption(&mut self, params: Option<EncryptionParams>) -> Result<()> {
        if let Some(params) = &params {
            params.validate()?;
        }
        self.encryption = params;
        Ok(())
    }

    /// Password used to decrypt encrypted subfiles
    pub fn set_password(&mut self, password: Option<String>) {
        self.password = password;
    }

    pub fn set_window_buffer_size(&mut self, size: usize) {
        self.window_buffer_size = size.max(1);
    }

    /// Archive comment (ZIP format only)
    pub fn set_comment(&mut self, comment: &[u8]) -> Result<()> {
        self.writable_stream()?;
        if self.format != ArchiveFormat::Zip {
            return Err(VfsError::Unsupported(
                "comments require the ZIP format".to_string(),
            ));
        }
        if comment.len() > zip::MAX_COMMENT_LENGTH {
            return Err(VfsError::InvalidConfig(format!(
                "comment of {} bytes exceeds {}",
                comment.len(),
                zip::MAX_COMMENT_LENGTH
            )));
        }
        if self.comment != comment {
            self.comment = comment.to_vec();
            self.index_changed = true;
        }
        Ok(())
    }

    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    /// Change the offset quantum (linear format only)
    ///
    /// Applies immediately to an archive with nothing written yet; otherwise
    /// the archive is rewritten on the next repack or close.
    pub fn set_scale_factor(&mut self, scale_factor: u32) -> Result<()> {
        if scale_factor == 0 {
            return Err(VfsError::InvalidConfig("scale factor must be positive".to_string()));
        }
        let mut header = self.linear_header_for_update()?;
        header.scale_factor = scale_factor;
        self.apply_linear_header(header)
    }

    pub fn scale_factor(&self) -> u32 {
        self.linear
            .pending_header
            .as_ref()
            .unwrap_or(&self.linear.header)
            .scale_factor
    }

    /// Replace the `#` comment lines before the magic (linear format only)
    pub fn set_header_prefix(&mut self, prefix: &str) -> Result<()> {
        let mut header = self.linear_header_for_update()?;
        header.prefix = linear::normalize_prefix(prefix)?;
        self.apply_linear_header(header)
    }

    fn linear_header_for_update(&self) -> Result<LinearHeader> {
        self.writable_stream()?;
        if self.format != ArchiveFormat::Linear {
            return Err(VfsError::Unsupported(
                "header settings require the linear format".to_string(),
            ));
        }
        Ok(self
            .linear
            .pending_header
            .clone()
            .unwrap_or_else(|| self.linear.header.clone()))
    }

    fn apply_linear_header(&mut self, header: LinearHeader) -> Result<()> {
        if header == self.linear.header {
            self.linear.pending_header = None;
            return Ok(());
        }
        if self.records.is_empty() && self.linear.last_index.is_none() {
            let stream = self.writable_stream()?;
            let previous = std::mem::replace(&mut self.linear.header, header);
            if let Err(err) = self.write_fresh_linear_header(&stream) {
                self.linear.header = previous;
                return Err(err);
            }
            self.linear.pending_header = None;
            return Ok(());
        }
        self.linear.pending_header = Some(header);
        self.needs_repack = true;
        Ok(())
    }

    // ---- lookup ----

    fn position_of(&self, name: &str) -> std::result::Result<usize, usize> {
        self.live
            .binary_search_by(|&id| self.records[id].name.as_str().cmp(name))
    }

    /// Index of the named subfile, if present
    pub fn find_subfile(&self, name: &str) -> Option<usize> {
        let name = standardize_name(name).ok()?;
        self.position_of(&name).ok()
    }

    pub fn num_subfiles(&self) -> usize {
        self.live.len()
    }

    /// Record of the subfile at `index`
    pub fn subfile(&self, index: usize) -> Result<&SubfileRecord> {
        self.live
            .get(index)
            .map(|&id| &self.records[id])
            .ok_or_else(|| VfsError::NotFound(format!("subfile index {}", index)))
    }

    pub fn subfile_name(&self, index: usize) -> Result<&str> {
        Ok(&self.subfile(index)?.name)
    }

    /// Uncompressed length
    pub fn subfile_length(&self, index: usize) -> Result<u64> {
        Ok(self.subfile(index)?.uncompressed_length)
    }

    pub fn subfile_timestamp(&self, index: usize) -> Result<u64> {
        Ok(self.subfile(index)?.timestamp)
    }

    pub fn is_subfile_compressed(&self, index: usize) -> Result<bool> {
        Ok(self.subfile(index)?.is_compressed())
    }

    pub fn is_subfile_encrypted(&self, index: usize) -> Result<bool> {
        Ok(self.subfile(index)?.is_encrypted())
    }

    pub fn is_subfile_text(&self, index: usize) -> Result<bool> {
        Ok(self.subfile(index)?.is_text())
    }

    pub fn is_subfile_signature(&self, index: usize) -> Result<bool> {
        Ok(self.subfile(index)?.is_signature())
    }

    fn directory_prefix(dir: &str) -> Option<String> {
        match standardize_name(dir) {
            Ok(name) => Some(format!("{}/", name)),
            // Root
            Err(_) if dir.trim_matches(|c| c == '/' || c == '.').is_empty() => Some(String::new()),
            Err(_) => None,
        }
    }

    /// Index of the first live record at or after `prefix`
    fn lower_bound(&self, prefix: &str) -> usize {
        self.live
            .partition_point(|&id| self.records[id].name.as_str() < prefix)
    }

    /// True if some subfile lives below `dir`; the root always exists
    pub fn has_directory(&self, dir: &str) -> bool {
        let Some(prefix) = Self::directory_prefix(dir) else {
            return false;
        };
        if prefix.is_empty() {
            return true;
        }
        self.live
            .get(self.lower_bound(&prefix))
            .is_some_and(|&id| self.records[id].name.starts_with(&prefix))
    }

    /// Immediate children of `dir`, files and subdirectories, sorted
    pub fn scan_directory(&self, dir: &str) -> Vec<String> {
        let Some(prefix) = Self::directory_prefix(dir) else {
            return Vec::new();
        };
        let mut children: Vec<String> = Vec::new();
        for &id in &self.live[self.lower_bound(&prefix)..] {
            let name = &self.records[id].name;
            let Some(rest) = name.strip_prefix(prefix.as_str()) else {
                break;
            };
            let child = rest.split('/').next().unwrap_or(rest);
            if children.last().map(String::as_str) != Some(child) {
                children.push(child.to_string());
            }
        }
        children.sort();
        children.dedup();
        children
    }

    // ---- reading ----

    fn read_method(&self, record: &SubfileRecord) -> Result<CompressionMethod> {
        match self.format {
            ArchiveFormat::Zip => zip::read_method(record),
            ArchiveFormat::Linear => Ok(record.method),
        }
    }

    /// Absolute payload start; parses the ZIP local header on demand
    fn data_start(&self, stream: &LockedStream, record: &SubfileRecord) -> Result<u64> {
        if self.format == ArchiveFormat::Linear || record.data_start != 0 {
            return Ok(record.data_start);
        }
        let (_, data_start) = zip::read_local_header(stream, record)?;
        Ok(data_start)
    }

    fn read_payload(&self, stream: &LockedStream, record: &SubfileRecord, data_start: u64) -> Result<Vec<u8>> {
        let end = data_start.checked_add(record.data_length);
        if end.map_or(true, |end| end > self.file_end) {
            return Err(VfsError::CorruptIndex(format!(
                "payload of {} extends past end of archive",
                record.name
            )));
        }
        let mut payload = vec![0u8; record.data_length as usize];
        let outcome = stream.atomic_seek_read(data_start, &mut payload)?;
        if outcome.count < payload.len() {
            return Err(VfsError::CorruptIndex(format!(
                "payload of {} is truncated",
                record.name
            )));
        }
        Ok(payload)
    }

    fn decryption_password(&self) -> Option<&str> {
        self.password
            .as_deref()
            .or_else(|| self.encryption.as_ref().map(|p| p.password.as_str()))
    }

    /// Undo encryption then compression
    fn decode_payload(&self, record: &SubfileRecord, payload: Vec<u8>) -> Result<Vec<u8>> {
        let method = self.read_method(record)?;
        let mut data = payload;
        if record.is_encrypted() {
            let password = self.decryption_password().ok_or(VfsError::MissingPassword)?;
            data = encryption::decrypt(password, &data)?;
        }
        if record.is_compressed() {
            data = method.decompress(&data, record.uncompressed_length)?;
        }
        Ok(data)
    }

    /// Whole contents of the subfile at `index`
    pub fn read_subfile(&self, index: usize) -> Result<Vec<u8>> {
        let stream = self.readable_stream()?;
        self.read_record(stream, self.subfile(index)?)
    }

    fn read_record(&self, stream: &LockedStream, record: &SubfileRecord) -> Result<Vec<u8>> {
        let data_start = self.data_start(stream, record)?;
        let payload = self.read_payload(stream, record, data_start)?;
        let data = self.decode_payload(record, payload)?;
        if data.len() as u64 != record.uncompressed_length {
            return Err(VfsError::CorruptIndex(format!(
                "{} decoded to {} bytes, index says {}",
                record.name,
                data.len(),
                record.uncompressed_length
            )));
        }
        Ok(data)
    }

    /// Streaming reader over the subfile at `index`
    ///
    /// The stream lock is held only while the local header is parsed; the
    /// payload is then read through a window of its own. Encrypted subfiles
    /// are decrypted up front since the tag covers the whole payload.
    pub fn open_read_subfile(&self, index: usize) -> Result<Box<dyn Read + Send>> {
        let stream = self.readable_stream()?;
        let record = self.subfile(index)?;
        if record.is_encrypted() {
            return Ok(Box::new(Cursor::new(self.read_record(stream, record)?)));
        }

        let method = self.read_method(record)?;
        let start = self.data_start(stream, record)?;
        let window = WindowedStream::with_capacity(
            stream,
            start,
            Some(start + record.data_length),
            self.window_buffer_size,
        );
        if record.is_compressed() {
            method.decoder(window)
        } else {
            Ok(Box::new(window))
        }
    }

    /// Write the subfile at `index` to a host file, creating parent directories
    pub fn extract_subfile<P: AsRef<Path>>(&self, index: usize, path: P) -> Result<()> {
        let data = self.read_subfile(index)?;
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }

    /// True if the subfile at `index` matches a host file byte for byte
    pub fn compare_subfile<P: AsRef<Path>>(&self, index: usize, path: P) -> Result<bool> {
        let on_disk = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        Ok(self.read_subfile(index)? == on_disk)
    }

    // ---- writing ----

    /// Add a subfile; `compression_level` 0 stores it
    ///
    /// Returns the standardized name.
    pub fn add_subfile(&mut self, name: &str, data: &[u8], compression_level: u32) -> Result<String> {
        self.add_subfile_with_options(name, data, &SubfileOptions::level(compression_level))
    }

    pub fn add_subfile_from_path<P: AsRef<Path>>(
        &mut self,
        name: &str,
        path: P,
        compression_level: u32,
    ) -> Result<String> {
        let data = fs::read(path)?;
        self.add_subfile(name, &data, compression_level)
    }

    /// Add a subfile only if the archive does not already hold identical content
    pub fn update_subfile(&mut self, name: &str, data: &[u8], compression_level: u32) -> Result<String> {
        let standardized = standardize_name(name)?;
        if let Ok(index) = self.position_of(&standardized) {
            if self.state.readable() && self.read_subfile(index).ok().as_deref() == Some(data) {
                debug!(name = %standardized, "subfile unchanged, skipping update");
                return Ok(standardized);
            }
        }
        self.add_subfile(&standardized, data, compression_level)
    }

    fn resolve_method(&self, options: &SubfileOptions) -> Result<CompressionMethod> {
        let method = match options.method {
            Some(method) => method,
            None if options.compression_level == 0 => CompressionMethod::Stored,
            None => match self.format {
                ArchiveFormat::Zip => CompressionMethod::Deflate,
                ArchiveFormat::Linear => CompressionMethod::Zlib,
            },
        };
        let supported = match self.format {
            ArchiveFormat::Zip => method.zip_code().is_some(),
            ArchiveFormat::Linear => {
                matches!(method, CompressionMethod::Stored | CompressionMethod::Zlib)
            }
        };
        if !supported {
            return Err(VfsError::Unsupported(format!(
                "{:?} compression in the {:?} format",
                method, self.format
            )));
        }
        Ok(method)
    }

    fn check_collision(&self, name: &str) -> Result<()> {
        if self.has_directory(name) {
            return Err(VfsError::NameCollision(format!(
                "{} is already a directory",
                name
            )));
        }
        let mut dir = name;
        while let Some((parent, _)) = dir.rsplit_once('/') {
            if self.position_of(parent).is_ok() {
                return Err(VfsError::NameCollision(format!(
                    "{} is already a file",
                    parent
                )));
            }
            dir = parent;
        }
        Ok(())
    }

    pub fn add_subfile_with_options(
        &mut self,
        name: &str,
        data: &[u8],
        options: &SubfileOptions,
    ) -> Result<String> {
        let stream = self.writable_stream()?;
        let name = standardize_name(name)?;
        self.check_collision(&name)?;
        let method = self.resolve_method(options)?;
        let level = if options.compression_level == 0 {
            DEFAULT_COMPRESSION_LEVEL
        } else {
            options.compression_level
        };

        let mut payload = method.compress(data, level)?;
        let signature = is_signature_name(&name);
        let encrypt = self.encryption.as_ref().filter(|_| !signature);
        if let Some(params) = encrypt {
            payload = encryption::encrypt(params, &payload)?;
        }

        let mut record = SubfileRecord::new(name);
        record.flags.set(SubfileFlags::COMPRESSED, method.is_compressed());
        record.flags.set(SubfileFlags::ENCRYPTED, encrypt.is_some());
        record.flags.set(SubfileFlags::TEXT, options.text);
        record.flags.set(SubfileFlags::SIGNATURE, signature);
        record.method = method;
        record.compression_level = level;
        record.uncompressed_length = data.len() as u64;
        record.data_length = payload.len() as u64;
        record.checksum = Some(crc32fast::hash(data));
        record.timestamp = options
            .timestamp
            .unwrap_or_else(|| if self.record_timestamp { now() } else { 0 });

        match self.format {
            ArchiveFormat::Zip => {
                record.zip_method = method.zip_code().unwrap_or(0);
                record.zip_flags = zip::general_flags(method, level, encrypt.is_some());
                self.write_zip_payload(&stream, &mut record, &payload)?;
            }
            ArchiveFormat::Linear => {
                record.checksum = None;
                self.write_linear_payload(&stream, &mut record, &payload)?;
            }
        }

        debug!(
            name = %record.name,
            method = ?record.method,
            stored = record.data_length,
            length = record.uncompressed_length,
            "added subfile"
        );
        let name = record.name.clone();
        self.register(record);
        Ok(name)
    }

    fn write_zip_payload(&mut self, stream: &LockedStream, record: &mut SubfileRecord, payload: &[u8]) -> Result<()> {
        let header = zip::local_header_for(record);
        let header_len = header.size_on_disk() as u64;
        let cursor = self.append_cursor;
        let padding = if record.method == CompressionMethod::Stored && !record.is_encrypted() {
            zip::alignment_padding(cursor, header_len)
        } else {
            0
        };

        let mut bytes = vec![0u8; padding as usize];
        bytes.reserve(header_len as usize + payload.len());
        header.write_to(&mut bytes)?;
        bytes.extend_from_slice(payload);
        stream.atomic_seek_write(cursor, &bytes)?;

        record.index_start = cursor + padding;
        record.index_length = header_len;
        record.data_start = record.index_start + header_len;
        self.append_cursor = cursor + bytes.len() as u64;
        self.file_end = self.file_end.max(self.append_cursor);
        Ok(())
    }

    /// Make sure the chain starts with an anchor entry new entries can link from
    fn ensure_linear_anchor(&mut self, stream: &LockedStream) -> Result<()> {
        if self.linear.last_index.is_some() {
            return Ok(());
        }
        let mut bytes = Vec::new();
        IndexEntry::anchor().write_to(&mut bytes)?;
        stream.atomic_seek_write(self.linear.first_index, &bytes)?;
        self.linear.last_index = Some(self.linear.first_index);
        let anchor_end = pad_to(
            self.linear.first_index + bytes.len() as u64,
            self.linear.scale(),
        );
        self.append_cursor = self.append_cursor.max(anchor_end);
        self.file_end = self.file_end.max(self.linear.first_index + bytes.len() as u64);
        Ok(())
    }

    fn write_linear_payload(&mut self, stream: &LockedStream, record: &mut SubfileRecord, payload: &[u8]) -> Result<()> {
        if u32::try_from(payload.len()).is_err() || u32::try_from(record.uncompressed_length).is_err() {
            return Err(VfsError::Unsupported(format!(
                "{} exceeds the 4 GiB subfile limit of the linear format",
                record.name
            )));
        }
        self.ensure_linear_anchor(stream)?;

        let scale = self.linear.scale();
        let cursor = self.append_cursor;
        let data_start = pad_to(cursor, scale);
        linear::scaled(data_start, scale)?;

        let mut bytes = vec![0u8; (data_start - cursor) as usize];
        bytes.extend_from_slice(payload);
        stream.atomic_seek_write(cursor, &bytes)?;

        record.data_start = data_start;
        self.append_cursor = data_start + payload.len() as u64;
        self.file_end = self.file_end.max(self.append_cursor);
        Ok(())
    }

    fn register(&mut self, record: SubfileRecord) {
        let id = self.records.len();
        let position = self.position_of(&record.name);
        self.records.push(record);
        match position {
            Ok(pos) => {
                let replaced = std::mem::replace(&mut self.live[pos], id);
                self.removed.push(replaced);
                self.needs_repack = true;
            }
            Err(pos) => self.live.insert(pos, id),
        }
        self.index_changed = true;
    }

    /// Remove the subfile at `index`; its space is reclaimed by [`repack`](Self::repack)
    pub fn remove_subfile(&mut self, index: usize) -> Result<()> {
        self.writable_stream()?;
        if index >= self.live.len() {
            return Err(VfsError::NotFound(format!("subfile index {}", index)));
        }
        let id = self.live.remove(index);
        debug!(name = %self.records[id].name, "removed subfile");
        self.removed.push(id);
        self.index_changed = true;
        self.needs_repack = true;
        Ok(())
    }

    /// Write the index; does nothing if nothing changed since the last flush
    pub fn flush(&mut self) -> Result<()> {
        let stream = self.writable_stream()?;
        if !self.index_changed {
            return Ok(());
        }
        match self.format {
            ArchiveFormat::Zip => self.flush_zip(&stream)?,
            ArchiveFormat::Linear => self.flush_linear(&stream)?,
        }
        self.index_changed = false;
        Ok(())
    }

    fn central_entries(&self) -> Vec<CentralEntry> {
        self.live
            .iter()
            .map(|&id| zip::central_entry_for(&self.records[id], self.record_timestamp))
            .collect()
    }

    fn flush_zip(&mut self, stream: &LockedStream) -> Result<()> {
        let entries = self.central_entries();
        let mut start = self.append_cursor;
        let mut index = zip::encode_index(&entries, start, &self.comment)?;

        // Readers find the index from the true end of the file, so it must end there
        let mut shifted = false;
        for _ in 0..MAX_INDEX_SHIFTS {
            let end = start + index.len() as u64;
            if end >= self.file_end {
                break;
            }
            start += self.file_end - end;
            index = zip::encode_index(&entries, start, &self.comment)?;
            shifted = true;
        }

        stream.atomic_seek_write(start, &index)?;
        stream.flush()?;
        debug!(
            entries = entries.len(),
            directory_offset = start,
            shifted,
            "wrote central directory"
        );

        for &id in &self.live {
            self.records[id].indexed = true;
        }
        self.removed.clear();
        self.append_cursor = start;
        self.file_end = self.file_end.max(start + index.len() as u64);
        if shifted {
            self.needs_repack = true;
        }
        Ok(())
    }

    fn flush_linear(&mut self, stream: &LockedStream) -> Result<()> {
        let scale = self.linear.scale();
        let pending: Vec<usize> = self
            .live
            .iter()
            .copied()
            .filter(|&id| !self.records[id].indexed)
            .collect();

        if !pending.is_empty() {
            let link_from = self.linear.last_index.ok_or_else(|| {
                VfsError::CorruptIndex("index chain has no entry to link from".to_string())
            })?;
            let mut entries = pending
                .iter()
                .map(|&id| linear::entry_for(&self.records[id], scale))
                .collect::<Result<Vec<_>>>()?;
            let start = pad_to(self.append_cursor, scale);
            let chain = linear::encode_chain(&mut entries, start, scale)?;

            stream.atomic_seek_write(start, &chain.bytes)?;
            // Commit point: the last existing entry now links to the new ones
            let link = linear::scaled(chain.positions[0], scale)?;
            stream.atomic_seek_write(link_from, &link.to_le_bytes())?;

            for ((&id, &pos), entry) in pending.iter().zip(&chain.positions).zip(&entries) {
                let record = &mut self.records[id];
                record.indexed = true;
                record.index_start = pos;
                record.index_length = entry.size_on_disk() as u64;
            }
            self.linear.last_index = chain.positions.last().copied();
            self.append_cursor = chain.end();
            self.file_end = self.file_end.max(chain.end());
            debug!(entries = entries.len(), start, "appended index entries");
        }

        while let Some(&id) = self.removed.last() {
            let record = &self.records[id];
            if record.indexed {
                let flags = record.flags.bits() | ENTRY_FLAG_DELETED;
                stream.atomic_seek_write(record.index_start + FLAGS_OFFSET, &flags.to_le_bytes())?;
            }
            self.records[id].indexed = false;
            self.removed.pop();
        }

        if self.record_timestamp {
            if let Some(offset) = self.linear.header.timestamp_offset() {
                let timestamp = now() as u32;
                stream.atomic_seek_write(offset, &timestamp.to_le_bytes())?;
                self.linear.header.timestamp = timestamp;
            }
        }
        stream.flush()?;
        Ok(())
    }

    /// Flush, or repack if a header change is pending, then release the stream
    pub fn close(&mut self) -> Result<()> {
        if self.state == ContainerState::Closed {
            return Ok(());
        }

        let result = if self.state.writable() {
            if self.linear.pending_header.is_some() && self.path.is_some() {
                self.repack()
            } else {
                self.flush()
            }
        } else {
            Ok(())
        };

        let released = match self.stream.take() {
            Some(stream) => stream.release(),
            None => Ok(()),
        };
        if let Some(path) = &self.path {
            info!(path = %path.display(), "closed archive");
        }

        self.state = ContainerState::Closed;
        self.records.clear();
        self.live.clear();
        self.removed.clear();
        self.index_changed = false;
        self.needs_repack = false;

        result?;
        released?;
        Ok(())
    }

    // ---- repack ----

    /// Rewrite the archive without holes and swap it in place of the original
    pub fn repack(&mut self) -> Result<()> {
        self.writable_stream()?;
        let path = self.path.clone().ok_or_else(|| {
            VfsError::Unsupported("repack requires a file-backed archive".to_string())
        })?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut temp = tempfile::Builder::new()
            .prefix(".repack")
            .tempfile_in(dir)?;
        {
            let mut out = BufWriter::new(temp.as_file_mut());
            match self.format {
                ArchiveFormat::Zip => self.repack_zip_into(&mut out)?,
                ArchiveFormat::Linear => self.repack_linear_into(&mut out)?,
            }
            out.flush()?;
        }
        temp.as_file().sync_all()?;

        if let Some(stream) = self.stream.take() {
            stream.release()?;
        }
        if let Err(err) = temp.persist(&path) {
            self.reopen(&path)?;
            return Err(err.error.into());
        }
        self.reopen(&path)?;
        info!(path = %path.display(), subfiles = self.live.len(), "repacked archive");
        Ok(())
    }

    fn reopen(&mut self, path: &Path) -> Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut fresh = Self::load(
            LockedStream::owned(file),
            ContainerState::ReadWriteValid,
            Some(path.to_path_buf()),
        )?;
        fresh.encryption = self.encryption.take();
        fresh.password = self.password.take();
        fresh.record_timestamp = self.record_timestamp;
        fresh.window_buffer_size = self.window_buffer_size;

        // The old value must not flush on drop
        self.state = ContainerState::Closed;
        self.stream = None;
        *self = fresh;
        Ok(())
    }

    fn copy_range<W: Write>(&self, stream: &LockedStream, start: u64, len: u64, out: &mut W) -> Result<()> {
        let mut buf = vec![0u8; COPY_CHUNK_SIZE];
        let mut pos = start;
        let end = start + len;
        while pos < end {
            let want = ((end - pos) as usize).min(COPY_CHUNK_SIZE);
            let outcome = stream.atomic_seek_read(pos, &mut buf[..want])?;
            if outcome.count < want {
                return Err(VfsError::CorruptIndex(format!(
                    "archive data truncated at {}",
                    pos + outcome.count as u64
                )));
            }
            out.write_all(&buf[..want])?;
            pos += want as u64;
        }
        Ok(())
    }

    fn repack_zip_into<W: Write>(&self, out: &mut W) -> Result<()> {
        let stream = self.stream()?;
        let mut written = 0u64;
        let mut entries = Vec::with_capacity(self.live.len());

        for &id in &self.live {
            let record = &self.records[id];
            let data_start = self.data_start(stream, record)?;
            let header_len = data_start - record.index_start;
            let padding = if record.zip_method == 0 && !record.is_encrypted() {
                zip::alignment_padding(written, header_len)
            } else {
                0
            };
            out.write_all(&vec![0u8; padding as usize])?;
            written += padding;

            let mut entry = zip::central_entry_for(record, self.record_timestamp);
            entry.header_offset = written;
            self.copy_range(stream, record.index_start, header_len + record.data_length, out)?;
            written += header_len + record.data_length;
            entries.push(entry);
        }

        out.write_all(&zip::encode_index(&entries, written, &self.comment)?)?;
        Ok(())
    }

    fn repack_linear_into<W: Write>(&self, out: &mut W) -> Result<()> {
        let stream = self.stream()?;
        let mut header = self
            .linear
            .pending_header
            .clone()
            .unwrap_or_else(|| self.linear.header.clone());
        header.minor = linear::CURRENT_MINOR_VERSION;
        if self.record_timestamp {
            header.timestamp = now() as u32;
        }
        let scale = header.scale_factor as u64;
        let first_index = linear::first_index_offset(&header);

        // The index sits in front of the data, so lay out the entries first
        let mut entries: Vec<IndexEntry> = Vec::with_capacity(self.live.len());
        let mut index_size = 0u64;
        let mut pos = first_index;
        for &id in &self.live {
            let mut entry = linear::entry_for(&self.records[id], self.linear.scale())?;
            entry.data_start = 0;
            let size = entry.size_on_disk() as u64;
            pos = pad_to(pos + size, scale);
            index_size += size;
            entries.push(entry);
        }
        let terminator_end = pos + 4;

        let mut data_starts = Vec::with_capacity(self.live.len());
        let mut data_pos = pad_to(terminator_end, scale);
        for &id in &self.live {
            data_starts.push(data_pos);
            data_pos = pad_to(data_pos + self.records[id].data_length, scale);
        }
        for (entry, &data_start) in entries.iter_mut().zip(&data_starts) {
            entry.data_start = linear::scaled(data_start, scale)?;
        }
        let chain = linear::encode_chain(&mut entries, first_index, scale)?;
        debug_assert_eq!(chain.end(), terminator_end);
        debug!(entries = entries.len(), index_size, scale, "laid out repacked index");

        let mut prefix = Vec::with_capacity(first_index as usize);
        header.write_to(&mut prefix)?;
        prefix.resize(first_index as usize, 0);
        out.write_all(&prefix)?;
        out.write_all(&chain.bytes)?;

        let mut written = chain.end();
        for (&id, &data_start) in self.live.iter().zip(&data_starts) {
            let record = &self.records[id];
            out.write_all(&vec![0u8; (data_start - written) as usize])?;
            self.copy_range(stream, record.data_start, record.data_length, out)?;
            written = data_start + record.data_length;
        }
        Ok(())
    }

    // ---- verification ----

    /// Recompute every live subfile's checksum without changing anything
    pub fn verify(&self) -> Result<VerifyReport> {
        let stream = self.readable_stream()?;
        let mut report = VerifyReport::default();
        for &id in &self.live {
            let record = &self.records[id];
            report.checked += 1;
            if let Err(error) = self.verify_record(stream, record) {
                warn!(name = %record.name, %error, "subfile failed verification");
                report.failures.push(VerifyFailure {
                    name: record.name.clone(),
                    error,
                });
            }
        }
        Ok(report)
    }

    fn verify_record(&self, stream: &LockedStream, record: &SubfileRecord) -> Result<()> {
        let data_start = match self.format {
            ArchiveFormat::Zip => {
                let (header, data_start) = zip::read_local_header(stream, record)?;
                zip::check_local_header(&header, record)?;
                data_start
            }
            ArchiveFormat::Linear => record.data_start,
        };
        let payload = self.read_payload(stream, record, data_start)?;
        let data = self.decode_payload(record, payload)?;
        if data.len() as u64 != record.uncompressed_length {
            return Err(VfsError::CorruptIndex(format!(
                "{} decoded to {} bytes, index says {}",
                record.name,
                data.len(),
                record.uncompressed_length
            )));
        }
        if let Some(expected) = record.checksum {
            let actual = crc32fast::hash(&data);
            if actual != expected {
                return Err(VfsError::CrcMismatch { expected, actual });
            }
        }
        Ok(())
    }

    // ---- signatures ----

    fn build_manifest(&self) -> Result<SignatureManifest> {
        let stream = self.stream()?;
        let mut manifest = SignatureManifest::new();
        for &id in &self.live {
            let record = &self.records[id];
            if record.is_signature() {
                continue;
            }
            manifest.add_file(record.name.clone(), &self.read_record(stream, record)?);
        }
        Ok(manifest)
    }

    /// Sign every non-signature subfile and store the manifest and signature
    pub fn add_signature(&mut self, signer: &dyn ArchiveSigner) -> Result<()> {
        self.writable_stream()?;
        let manifest = self.build_manifest()?;
        let entry = SignatureEntry::create(&manifest, signer, now())?;
        self.add_subfile(MANIFEST_NAME, &manifest.to_json()?, 0)?;
        let name = self.add_subfile(&signature_subfile_name(signer.alias()), &entry.to_json()?, 0)?;
        info!(name = %name, files = manifest.files.len(), "signed archive");
        Ok(())
    }

    /// Stored signature entries
    pub fn signatures(&self) -> Result<Vec<SignatureEntry>> {
        let stream = self.stream()?;
        let mut entries = Vec::new();
        for &id in &self.live[self.lower_bound(SIGNATURE_PREFIX)..] {
            let record = &self.records[id];
            if !record.name.starts_with(SIGNATURE_PREFIX) {
                break;
            }
            if record.name.ends_with(SIGNATURE_EXTENSION) {
                entries.push(SignatureEntry::from_json(&self.read_record(stream, record)?)?);
            }
        }
        Ok(entries)
    }

    /// Check each stored signature against the current contents
    pub fn verify_signatures(&self) -> Result<Vec<SignatureCheck>> {
        let entries = self.signatures()?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let stream = self.stream()?;
        let stored = match self.position_of(MANIFEST_NAME) {
            Ok(index) => Some(SignatureManifest::from_json(
                &self.read_record(stream, &self.records[self.live[index]])?,
            )?),
            Err(_) => None,
        };
        let current_hash = self.build_manifest()?.canonical_hash()?;
        let stored_hash = match &stored {
            Some(manifest) => Some(manifest.canonical_hash()?),
            None => None,
        };

        Ok(entries
            .into_iter()
            .map(|entry| {
                let status = match stored_hash {
                    Some(hash) if hash == current_hash => match entry.verify(&hash) {
                        Ok(()) => SignatureStatus::Valid,
                        Err(VfsError::Unsupported(_)) => SignatureStatus::UnsupportedAlgorithm,
                        Err(_) => SignatureStatus::BadSignature,
                    },
                    _ => SignatureStatus::ManifestMismatch,
                };
                SignatureCheck {
                    alias: entry.alias,
                    status,
                }
            })
            .collect())
    }
}

impl Drop for ArchiveContainer {
    fn drop(&mut self) {
        if self.state != ContainerState::Closed {
            if let Err(error) = self.close() {
                warn!(%error, "failed to close archive on drop");
            }
        }
    }
}
