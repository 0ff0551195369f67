use super::{BackendKind, MountBackend};
use crate::error::{Result, VfsError};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::{Cursor, Read};
use std::sync::Arc;

/// An opened asset: its length and a reader over its bytes
pub struct Asset {
    pub length: u64,
    pub reader: Box<dyn Read + Send>,
}

/// Platform asset facility (an application bundle, a packaged resource set)
///
/// Existence is only knowable by trying to open: a name that opens as an
/// asset is a file, one that lists as a directory is a directory.
pub trait AssetStore: Send + Sync + Debug {
    fn open_asset(&self, path: &str) -> Option<Asset>;

    /// Entry names of a directory, or `None` if there is no such directory
    fn open_dir(&self, path: &str) -> Option<Vec<String>>;
}

/// Asset store backed by a fixed in-process table
#[derive(Debug, Default, Clone)]
pub struct StaticAssets {
    files: BTreeMap<String, Arc<[u8]>>,
}

impl StaticAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, data: &[u8]) -> Self {
        self.insert(path, data);
        self
    }

    pub fn insert(&mut self, path: &str, data: &[u8]) {
        let name = path.trim_matches('/').to_string();
        self.files.insert(name, Arc::from(data));
    }
}

impl AssetStore for StaticAssets {
    fn open_asset(&self, path: &str) -> Option<Asset> {
        let data = self.files.get(path)?;
        Some(Asset {
            length: data.len() as u64,
            reader: Box::new(Cursor::new(Arc::clone(data))),
        })
    }

    fn open_dir(&self, path: &str) -> Option<Vec<String>> {
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let mut names: Vec<String> = self
            .files
            .range(prefix.clone()..)
            .take_while(|(name, _)| name.starts_with(&prefix))
            .filter_map(|(name, _)| name[prefix.len()..].split('/').next())
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        if names.is_empty() && !path.is_empty() {
            None
        } else {
            Some(names)
        }
    }
}

/// Read-only mount over an [`AssetStore`]
#[derive(Debug, Clone)]
pub struct AssetBundleBackend {
    store: Arc<dyn AssetStore>,
}

impl AssetBundleBackend {
    pub fn new(store: impl AssetStore + 'static) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn from_shared(store: Arc<dyn AssetStore>) -> Self {
        Self { store }
    }

    fn open(&self, path: &str) -> Result<Asset> {
        if let Some(asset) = self.store.open_asset(path) {
            return Ok(asset);
        }
        if self.is_directory(path) {
            Err(VfsError::IsDirectory(path.to_string()))
        } else {
            Err(VfsError::NotFound(path.to_string()))
        }
    }
}

impl MountBackend for AssetBundleBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::AssetBundle
    }

    fn exists(&self, path: &str) -> bool {
        self.is_regular_file(path) || self.is_directory(path)
    }

    fn is_directory(&self, path: &str) -> bool {
        path.is_empty() || self.store.open_dir(path).is_some()
    }

    fn is_regular_file(&self, path: &str) -> bool {
        !path.is_empty() && self.store.open_asset(path).is_some()
    }

    fn open_for_read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(self.open(path)?.reader)
    }

    fn size(&self, path: &str) -> Result<u64> {
        Ok(self.open(path)?.length)
    }

    /// Assets carry no modification time
    fn timestamp(&self, path: &str) -> Result<u64> {
        if self.exists(path) {
            Ok(0)
        } else {
            Err(VfsError::NotFound(path.to_string()))
        }
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        match self.store.open_dir(path) {
            Some(names) => Ok(names),
            None if self.is_regular_file(path) => Err(VfsError::NotDirectory(path.to_string())),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> AssetBundleBackend {
        AssetBundleBackend::new(
            StaticAssets::new()
                .with_file("textures/grass.png", b"png")
                .with_file("textures/ui/button.png", b"button")
                .with_file("boot.cfg", b"fullscreen 1"),
        )
    }

    #[test]
    fn test_asset_queries() {
        let bundle = bundle();
        assert!(bundle.is_directory(""));
        assert!(bundle.is_directory("textures/ui"));
        assert!(bundle.is_regular_file("boot.cfg"));
        assert!(!bundle.exists("textures/missing.png"));
        assert_eq!(bundle.size("textures/ui/button.png").unwrap(), 6);
        assert_eq!(bundle.read_file("boot.cfg").unwrap(), b"fullscreen 1");
        assert_eq!(bundle.timestamp("boot.cfg").unwrap(), 0);
        assert_eq!(bundle.list_children("").unwrap(), vec!["boot.cfg", "textures"]);
        assert_eq!(
            bundle.list_children("textures").unwrap(),
            vec!["grass.png", "ui"]
        );
    }

    #[test]
    fn test_asset_errors() {
        let bundle = bundle();
        assert!(matches!(bundle.read_file("textures"), Err(VfsError::IsDirectory(_))));
        assert!(matches!(bundle.size("nope"), Err(VfsError::NotFound(_))));
        assert!(matches!(
            bundle.list_children("boot.cfg"),
            Err(VfsError::NotDirectory(_))
        ));
    }
}
