use super::{BackendKind, MountBackend};
use crate::archive::ArchiveContainer;
use crate::error::{Result, VfsError};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read-only view of one archive container
///
/// Local paths map straight onto subfile names. Directories exist wherever
/// some subfile name continues with `<path>/`.
#[derive(Debug)]
pub struct ArchiveBackend {
    archive: Arc<ArchiveContainer>,
    physical: Option<PathBuf>,
}

impl ArchiveBackend {
    pub fn new(archive: Arc<ArchiveContainer>) -> Self {
        let physical = archive.path().map(Path::to_path_buf);
        Self { archive, physical }
    }

    pub fn archive(&self) -> &Arc<ArchiveContainer> {
        &self.archive
    }

    fn index(&self, path: &str) -> Result<usize> {
        if self.is_directory(path) {
            return Err(VfsError::IsDirectory(path.to_string()));
        }
        self.archive
            .find_subfile(path)
            .ok_or_else(|| VfsError::NotFound(path.to_string()))
    }
}

impl MountBackend for ArchiveBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Archive
    }

    fn physical_path(&self) -> Option<&Path> {
        self.physical.as_deref()
    }

    fn exists(&self, path: &str) -> bool {
        self.is_regular_file(path) || self.is_directory(path)
    }

    fn is_directory(&self, path: &str) -> bool {
        path.is_empty() || self.archive.has_directory(path)
    }

    fn is_regular_file(&self, path: &str) -> bool {
        !path.is_empty() && self.archive.find_subfile(path).is_some()
    }

    fn open_for_read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        self.archive.open_read_subfile(self.index(path)?)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.archive.read_subfile(self.index(path)?)
    }

    fn size(&self, path: &str) -> Result<u64> {
        self.archive.subfile_length(self.index(path)?)
    }

    fn timestamp(&self, path: &str) -> Result<u64> {
        if self.is_directory(path) {
            // Directories take the archive file's own time
            return Ok(self
                .physical
                .as_ref()
                .and_then(|p| std::fs::metadata(p).ok())
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0));
        }
        self.archive.subfile_timestamp(self.index(path)?)
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        if self.is_directory(path) {
            Ok(self.archive.scan_directory(path))
        } else if self.is_regular_file(path) {
            Err(VfsError::NotDirectory(path.to_string()))
        } else {
            Err(VfsError::NotFound(path.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveFormat;
    use crate::stream::LockedStream;
    use std::io::Cursor;

    fn backend() -> ArchiveBackend {
        let stream = LockedStream::owned(Cursor::new(Vec::new()));
        let mut archive =
            ArchiveContainer::open_read_write_stream(stream.borrow(), ArchiveFormat::Zip).unwrap();
        archive.add_subfile("models/box.egg", b"box", 0).unwrap();
        archive.add_subfile("models/sub/ball.egg", b"ball", 6).unwrap();
        archive.add_subfile("readme", b"hi", 0).unwrap();
        archive.flush().unwrap();
        drop(archive);
        ArchiveBackend::new(Arc::new(ArchiveContainer::open_read_stream(stream).unwrap()))
    }

    #[test]
    fn test_archive_mount_queries() {
        let backend = backend();
        assert!(backend.is_directory(""));
        assert!(backend.is_directory("models"));
        assert!(backend.is_directory("models/sub"));
        assert!(!backend.is_directory("model"));
        assert!(backend.is_regular_file("readme"));
        assert_eq!(backend.read_file("models/sub/ball.egg").unwrap(), b"ball");
        assert_eq!(backend.size("models/box.egg").unwrap(), 3);
        assert_eq!(
            backend.list_children("models").unwrap(),
            vec!["box.egg", "sub"]
        );
        assert_eq!(backend.list_children("").unwrap(), vec!["models", "readme"]);
    }

    #[test]
    fn test_archive_mount_errors() {
        let backend = backend();
        assert!(matches!(
            backend.open_for_read("models"),
            Err(VfsError::IsDirectory(_))
        ));
        assert!(matches!(
            backend.read_file("nope"),
            Err(VfsError::NotFound(_))
        ));
        assert!(matches!(
            backend.list_children("readme"),
            Err(VfsError::NotDirectory(_))
        ));
        assert!(matches!(
            backend.write_file("new", b"x"),
            Err(VfsError::Unsupported(_))
        ));
    }
}
