use crate::error::{Result, VfsError};
use crate::mount::MountBackend;
use crate::path;
use flate2::read::ZlibDecoder;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

/// One mount's contribution to a resolved path
#[derive(Clone)]
pub(crate) struct Component {
    pub(crate) backend: Arc<dyn MountBackend>,
    pub(crate) local_path: String,
    /// Served from a zlib-compressed `<name>.pz` sibling
    pub(crate) implicit_pz: bool,
    /// Writes must not reach this component
    pub(crate) read_only: bool,
}

/// A path resolved through a [`MountTable`](super::MountTable)
///
/// A regular file has exactly one component. A directory has one component
/// per mount that supplies it, most recently mounted first. A directory with
/// no components at all is a synthetic ancestor of some mount point.
#[derive(Clone)]
pub struct VirtualFile {
    path: String,
    components: Vec<Component>,
    directory: bool,
    /// Names of mount points one level below this directory
    mount_children: Vec<String>,
}

impl fmt::Debug for VirtualFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualFile")
            .field("path", &self.path)
            .field("directory", &self.directory)
            .field("components", &self.components.len())
            .finish()
    }
}

impl VirtualFile {
    pub(crate) fn file(path: String, component: Component) -> Self {
        Self {
            path,
            components: vec![component],
            directory: false,
            mount_children: Vec::new(),
        }
    }

    pub(crate) fn directory(path: String, components: Vec<Component>, mount_children: Vec<String>) -> Self {
        Self {
            path,
            components,
            directory: true,
            mount_children,
        }
    }

    /// Absolute virtual path this handle was resolved from
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_directory(&self) -> bool {
        self.directory
    }

    pub fn is_regular_file(&self) -> bool {
        !self.directory
    }

    /// A directory merged from more than one mount
    pub fn is_composite(&self) -> bool {
        self.directory && self.components.len() > 1
    }

    /// Served transparently from a compressed `.pz` sibling
    pub fn is_implicit_pz(&self) -> bool {
        self.components.first().is_some_and(|c| c.implicit_pz)
    }

    /// Backend of the highest-precedence component
    pub fn backend(&self) -> Option<&Arc<dyn MountBackend>> {
        self.components.first().map(|c| &c.backend)
    }

    /// Path local to [`backend`](Self::backend)
    pub fn local_path(&self) -> Option<&str> {
        self.components.first().map(|c| c.local_path.as_str())
    }

    pub(crate) fn primary(&self) -> Option<&Component> {
        self.components.first()
    }

    fn regular(&self) -> Result<&Component> {
        match (self.directory, self.components.first()) {
            (false, Some(component)) => Ok(component),
            _ => Err(VfsError::IsDirectory(self.path.clone())),
        }
    }

    /// Length in bytes; directories report 0
    pub fn size(&self) -> Result<u64> {
        if self.directory {
            return Ok(0);
        }
        let component = self.regular()?;
        if component.implicit_pz {
            // The stored length is the compressed one
            let mut counter = io::sink();
            return Ok(io::copy(&mut self.open_read()?, &mut counter)?);
        }
        component.backend.size(&component.local_path)
    }

    /// Modification time in seconds since the UNIX epoch; 0 when unknown
    pub fn timestamp(&self) -> Result<u64> {
        match self.components.first() {
            Some(component) => component.backend.timestamp(&component.local_path),
            None => Ok(0),
        }
    }

    pub fn open_read(&self) -> Result<Box<dyn Read + Send>> {
        let component = self.regular()?;
        let reader = component.backend.open_for_read(&component.local_path)?;
        if component.implicit_pz {
            Ok(Box::new(ZlibDecoder::new(reader)))
        } else {
            Ok(reader)
        }
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        let component = self.regular()?;
        if !component.implicit_pz {
            return component.backend.read_file(&component.local_path);
        }
        let mut data = Vec::new();
        self.open_read()?
            .read_to_end(&mut data)
            .map_err(|e| VfsError::DecompressionFailed(format!("{}: {}", self.path, e)))?;
        Ok(data)
    }

    /// Names of the entries of this directory, sorted and without duplicates
    pub fn child_names(&self) -> Result<Vec<String>> {
        Ok(self.children()?.into_iter().map(|(name, _)| name).collect())
    }

    /// Entries of this directory
    ///
    /// Each entry belongs to the most recently mounted component listing it.
    /// Mount points directly below this directory appear as directories even
    /// when no component lists them.
    pub fn scan_directory(&self) -> Result<Vec<VirtualFile>> {
        let entries = self
            .children()?
            .into_iter()
            .map(|(name, owner)| {
                let child_path = path::join(&self.path, &name);
                match owner {
                    Some(component) => {
                        let local = if component.local_path.is_empty() {
                            name
                        } else {
                            format!("{}/{}", component.local_path, name)
                        };
                        let child = Component {
                            backend: Arc::clone(&component.backend),
                            local_path: local,
                            implicit_pz: false,
                            read_only: component.read_only,
                        };
                        if child.backend.is_directory(&child.local_path) {
                            VirtualFile::directory(child_path, vec![child], Vec::new())
                        } else {
                            VirtualFile::file(child_path, child)
                        }
                    }
                    None => VirtualFile::directory(child_path, Vec::new(), Vec::new()),
                }
            })
            .collect();
        Ok(entries)
    }

    /// Union of the components' listings plus mount children, with owners
    fn children(&self) -> Result<Vec<(String, Option<&Component>)>> {
        if !self.directory {
            return Err(VfsError::NotDirectory(self.path.clone()));
        }
        let mut merged: Vec<(String, Option<&Component>)> = Vec::new();
        for component in &self.components {
            for name in component.backend.list_children(&component.local_path)? {
                if !merged.iter().any(|(seen, _)| *seen == name) {
                    merged.push((name, Some(component)));
                }
            }
        }
        for name in &self.mount_children {
            if !merged.iter().any(|(seen, _)| seen == name) {
                merged.push((name.clone(), None));
            }
        }
        merged.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(merged)
    }
}
