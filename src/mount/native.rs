use super::{BackendKind, CasOutcome, MountBackend};
use crate::error::{Result, VfsError};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Host directory tree below a physical root
#[derive(Debug)]
pub struct NativeBackend {
    root: PathBuf,
    case_sensitive: bool,
    /// Serializes compare-and-swap against other swaps and atomic reads
    cas_lock: Mutex<()>,
}

fn host_error(err: io::Error, path: &str) -> VfsError {
    match err.kind() {
        io::ErrorKind::NotFound => VfsError::NotFound(path.to_string()),
        _ => VfsError::Io(err),
    }
}

impl NativeBackend {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            case_sensitive: false,
            cas_lock: Mutex::new(()),
        }
    }

    /// Reject lookups whose case differs from the name on disk
    pub fn with_case_check(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path for a local path; refuses anything that would leave the root
    fn host_path(&self, path: &str) -> Result<PathBuf> {
        let mut host = self.root.clone();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => return Err(VfsError::InvalidPath(path.to_string())),
                other => {
                    // A component such as "C:" or one with an embedded separator
                    let mut components = Path::new(other).components();
                    match (components.next(), components.next()) {
                        (Some(Component::Normal(_)), None) => host.push(other),
                        _ => return Err(VfsError::InvalidPath(path.to_string())),
                    }
                }
            }
        }
        Ok(host)
    }

    /// Every component below the root exists with exactly this spelling
    fn case_matches(&self, path: &str) -> bool {
        if !self.case_sensitive {
            return true;
        }
        let mut dir = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            let found = fs::read_dir(&dir)
                .map(|entries| {
                    entries
                        .filter_map(|entry| entry.ok())
                        .any(|entry| entry.file_name() == part)
                })
                .unwrap_or(false);
            if !found {
                return false;
            }
            dir.push(part);
        }
        true
    }

    fn metadata(&self, path: &str) -> Option<fs::Metadata> {
        let host = self.host_path(path).ok()?;
        let metadata = fs::metadata(host).ok()?;
        self.case_matches(path).then_some(metadata)
    }

    fn checked_host_path(&self, path: &str) -> Result<PathBuf> {
        let host = self.host_path(path)?;
        if host.exists() && !self.case_matches(path) {
            return Err(VfsError::NotFound(path.to_string()));
        }
        Ok(host)
    }

    /// Write through a temporary sibling so readers never see a partial file
    fn replace_contents(host: &Path, data: &[u8]) -> Result<()> {
        let dir = host
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(data)?;
        temp.as_file().sync_all()?;
        temp.persist(host).map_err(|e| VfsError::Io(e.error))?;
        Ok(())
    }
}

impl MountBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn physical_path(&self) -> Option<&Path> {
        Some(&self.root)
    }

    fn exists(&self, path: &str) -> bool {
        self.metadata(path).is_some()
    }

    fn is_directory(&self, path: &str) -> bool {
        self.metadata(path).is_some_and(|m| m.is_dir())
    }

    fn is_regular_file(&self, path: &str) -> bool {
        self.metadata(path).is_some_and(|m| m.is_file())
    }

    fn open_for_read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let host = self.checked_host_path(path)?;
        if host.is_dir() {
            return Err(VfsError::IsDirectory(path.to_string()));
        }
        let file = File::open(&host).map_err(|e| host_error(e, path))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let host = self.checked_host_path(path)?;
        if host.is_dir() {
            return Err(VfsError::IsDirectory(path.to_string()));
        }
        fs::read(&host).map_err(|e| host_error(e, path))
    }

    fn size(&self, path: &str) -> Result<u64> {
        self.metadata(path)
            .map(|m| m.len())
            .ok_or_else(|| VfsError::NotFound(path.to_string()))
    }

    fn timestamp(&self, path: &str) -> Result<u64> {
        let metadata = self
            .metadata(path)
            .ok_or_else(|| VfsError::NotFound(path.to_string()))?;
        Ok(metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0))
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let host = self.checked_host_path(path)?;
        if host.is_file() {
            return Err(VfsError::NotDirectory(path.to_string()));
        }
        let mut names: Vec<String> = fs::read_dir(&host)
            .map_err(|e| host_error(e, path))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let host = self.checked_host_path(path)?;
        if host.is_dir() {
            return Err(VfsError::NameCollision(format!("{} is a directory", path)));
        }
        fs::write(&host, data).map_err(|e| host_error(e, path))
    }

    fn make_directory(&self, path: &str) -> Result<()> {
        let host = self.checked_host_path(path)?;
        if host.is_file() {
            return Err(VfsError::NameCollision(format!("{} is a file", path)));
        }
        match fs::create_dir(&host) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(host_error(err, path)),
        }
    }

    fn delete_file(&self, path: &str) -> Result<()> {
        let host = self.checked_host_path(path)?;
        if host.is_dir() {
            return Err(VfsError::IsDirectory(path.to_string()));
        }
        fs::remove_file(&host).map_err(|e| host_error(e, path))
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let source = self.checked_host_path(from)?;
        let target = self.checked_host_path(to)?;
        fs::rename(source, target).map_err(|e| host_error(e, from))
    }

    fn atomic_compare_and_exchange_contents(
        &self,
        path: &str,
        expected: &[u8],
        new: &[u8],
    ) -> Result<CasOutcome> {
        let host = self.checked_host_path(path)?;
        let _guard = self.cas_lock.lock();
        let previous = fs::read(&host).map_err(|e| host_error(e, path))?;
        let swapped = previous == expected;
        if swapped {
            Self::replace_contents(&host, new)?;
        }
        Ok(CasOutcome { swapped, previous })
    }

    fn atomic_read_contents(&self, path: &str) -> Result<Vec<u8>> {
        let host = self.checked_host_path(path)?;
        let _guard = self.cas_lock.lock();
        fs::read(&host).map_err(|e| host_error(e, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_native_queries() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/file.txt"), b"native").unwrap();
        let backend = NativeBackend::new(dir.path());

        assert!(backend.is_directory(""));
        assert!(backend.is_directory("sub"));
        assert!(backend.is_regular_file("sub/file.txt"));
        assert!(!backend.exists("missing"));
        assert_eq!(backend.size("sub/file.txt").unwrap(), 6);
        assert_eq!(backend.read_file("sub/file.txt").unwrap(), b"native");
        assert_eq!(backend.list_children("sub").unwrap(), vec!["file.txt"]);
        assert!(backend.timestamp("sub/file.txt").unwrap() > 0);
    }

    #[test]
    fn test_escaping_root_is_refused() {
        let dir = tempdir().unwrap();
        let backend = NativeBackend::new(dir.path().join("inner"));
        assert!(matches!(
            backend.open_for_read("../secret"),
            Err(VfsError::InvalidPath(_))
        ));
        assert!(!backend.exists("../"));
    }

    #[test]
    fn test_case_check() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Readme.txt"), b"x").unwrap();
        let backend = NativeBackend::new(dir.path()).with_case_check(true);
        assert!(backend.exists("Readme.txt"));
        assert!(!backend.exists("README.TXT"));
    }

    #[test]
    fn test_compare_and_exchange() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("counter"), b"1").unwrap();
        let backend = NativeBackend::new(dir.path());

        let miss = backend
            .atomic_compare_and_exchange_contents("counter", b"0", b"2")
            .unwrap();
        assert!(!miss.swapped);
        assert_eq!(miss.previous, b"1");

        let hit = backend
            .atomic_compare_and_exchange_contents("counter", b"1", b"2")
            .unwrap();
        assert!(hit.swapped);
        assert_eq!(backend.atomic_read_contents("counter").unwrap(), b"2");

        assert!(matches!(
            backend.atomic_compare_and_exchange_contents("absent", b"", b"x"),
            Err(VfsError::NotFound(_))
        ));
    }
}
