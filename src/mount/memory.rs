use super::{BackendKind, CasOutcome, MountBackend};
use crate::error::{Result, VfsError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug)]
enum Node {
    File { data: Vec<u8>, timestamp: u64 },
    Directory { children: BTreeMap<String, Node>, timestamp: u64 },
}

impl Node {
    fn empty_directory() -> Self {
        Node::Directory {
            children: BTreeMap::new(),
            timestamp: now(),
        }
    }

    fn timestamp(&self) -> u64 {
        match self {
            Node::File { timestamp, .. } | Node::Directory { timestamp, .. } => *timestamp,
        }
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty() && *p != ".").collect()
}

/// Split into parent components and leaf name; `None` for the root
fn split_leaf(path: &str) -> Option<(Vec<&str>, &str)> {
    let mut parts = components(path);
    let leaf = parts.pop()?;
    Some((parts, leaf))
}

/// Mutable in-memory hierarchy ("ramdisk")
///
/// The whole tree sits behind one lock, so every operation, including
/// compare-and-swap, is atomic with respect to the others.
#[derive(Debug)]
pub struct MemoryTree {
    root: Mutex<Node>,
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTree {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(Node::empty_directory()),
        }
    }

    fn find<'a>(root: &'a Node, path: &str) -> Option<&'a Node> {
        let mut node = root;
        for part in components(path) {
            match node {
                Node::Directory { children, .. } => node = children.get(part)?,
                Node::File { .. } => return None,
            }
        }
        Some(node)
    }

    /// Children map of the directory at `parts`
    fn directory_mut<'a>(
        root: &'a mut Node,
        parts: &[&str],
        path: &str,
    ) -> Result<&'a mut BTreeMap<String, Node>> {
        let mut node = root;
        for part in parts {
            node = match node {
                Node::Directory { children, .. } => children
                    .get_mut(*part)
                    .ok_or_else(|| VfsError::NotFound(path.to_string()))?,
                Node::File { .. } => return Err(VfsError::NotDirectory(path.to_string())),
            };
        }
        match node {
            Node::Directory { children, .. } => Ok(children),
            Node::File { .. } => Err(VfsError::NotDirectory(path.to_string())),
        }
    }

    fn file_contents(root: &Node, path: &str) -> Result<Vec<u8>> {
        match Self::find(root, path) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            Some(Node::Directory { .. }) => Err(VfsError::IsDirectory(path.to_string())),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }
}

impl MountBackend for MemoryTree {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn exists(&self, path: &str) -> bool {
        Self::find(&self.root.lock(), path).is_some()
    }

    fn is_directory(&self, path: &str) -> bool {
        matches!(Self::find(&self.root.lock(), path), Some(Node::Directory { .. }))
    }

    fn is_regular_file(&self, path: &str) -> bool {
        matches!(Self::find(&self.root.lock(), path), Some(Node::File { .. }))
    }

    fn open_for_read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.read_file(path)?)))
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        Self::file_contents(&self.root.lock(), path)
    }

    fn size(&self, path: &str) -> Result<u64> {
        match Self::find(&self.root.lock(), path) {
            Some(Node::File { data, .. }) => Ok(data.len() as u64),
            Some(Node::Directory { .. }) => Ok(0),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    fn timestamp(&self, path: &str) -> Result<u64> {
        Self::find(&self.root.lock(), path)
            .map(Node::timestamp)
            .ok_or_else(|| VfsError::NotFound(path.to_string()))
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        match Self::find(&self.root.lock(), path) {
            Some(Node::Directory { children, .. }) => Ok(children.keys().cloned().collect()),
            Some(Node::File { .. }) => Err(VfsError::NotDirectory(path.to_string())),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let (parents, leaf) =
            split_leaf(path).ok_or_else(|| VfsError::IsDirectory(path.to_string()))?;
        let mut root = self.root.lock();
        let children = Self::directory_mut(&mut root, &parents, path)?;
        if let Some(Node::Directory { .. }) = children.get(leaf) {
            return Err(VfsError::NameCollision(format!("{} is a directory", path)));
        }
        children.insert(
            leaf.to_string(),
            Node::File {
                data: data.to_vec(),
                timestamp: now(),
            },
        );
        Ok(())
    }

    fn make_directory(&self, path: &str) -> Result<()> {
        let Some((parents, leaf)) = split_leaf(path) else {
            return Ok(());
        };
        let mut root = self.root.lock();
        let children = Self::directory_mut(&mut root, &parents, path)?;
        match children.get(leaf) {
            Some(Node::Directory { .. }) => Ok(()),
            Some(Node::File { .. }) => {
                Err(VfsError::NameCollision(format!("{} is a file", path)))
            }
            None => {
                children.insert(leaf.to_string(), Node::empty_directory());
                Ok(())
            }
        }
    }

    fn delete_file(&self, path: &str) -> Result<()> {
        let (parents, leaf) =
            split_leaf(path).ok_or_else(|| VfsError::IsDirectory(path.to_string()))?;
        let mut root = self.root.lock();
        let children = Self::directory_mut(&mut root, &parents, path)?;
        match children.get(leaf) {
            Some(Node::File { .. }) => {
                children.remove(leaf);
                Ok(())
            }
            Some(Node::Directory { .. }) => Err(VfsError::IsDirectory(path.to_string())),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let (from_parents, from_leaf) =
            split_leaf(from).ok_or_else(|| VfsError::InvalidPath(from.to_string()))?;
        let (to_parents, to_leaf) =
            split_leaf(to).ok_or_else(|| VfsError::InvalidPath(to.to_string()))?;
        let mut root = self.root.lock();

        // Validate the destination before detaching anything
        {
            let target = Self::directory_mut(&mut root, &to_parents, to)?;
            if let Some(Node::Directory { .. }) = target.get(to_leaf) {
                return Err(VfsError::NameCollision(format!("{} is a directory", to)));
            }
        }
        let node = Self::directory_mut(&mut root, &from_parents, from)?
            .remove(from_leaf)
            .ok_or_else(|| VfsError::NotFound(from.to_string()))?;
        if let Node::Directory { .. } = &node {
            // Moving a directory inside itself would orphan it
            let from_parts = components(from);
            let to_parts = components(to);
            if to_parts.len() > from_parts.len() && to_parts.starts_with(&from_parts) {
                Self::directory_mut(&mut root, &from_parents, from)?
                    .insert(from_leaf.to_string(), node);
                return Err(VfsError::InvalidPath(to.to_string()));
            }
        }
        Self::directory_mut(&mut root, &to_parents, to)?.insert(to_leaf.to_string(), node);
        Ok(())
    }

    fn atomic_compare_and_exchange_contents(
        &self,
        path: &str,
        expected: &[u8],
        new: &[u8],
    ) -> Result<CasOutcome> {
        let mut root = self.root.lock();
        let (parents, leaf) =
            split_leaf(path).ok_or_else(|| VfsError::IsDirectory(path.to_string()))?;
        let children = Self::directory_mut(&mut root, &parents, path)?;
        match children.get_mut(leaf) {
            Some(Node::File { data, timestamp }) => {
                let previous = data.clone();
                let swapped = previous == expected;
                if swapped {
                    *data = new.to_vec();
                    *timestamp = now();
                }
                Ok(CasOutcome { swapped, previous })
            }
            Some(Node::Directory { .. }) => Err(VfsError::IsDirectory(path.to_string())),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    fn atomic_read_contents(&self, path: &str) -> Result<Vec<u8>> {
        Self::file_contents(&self.root.lock(), path)
    }
}
