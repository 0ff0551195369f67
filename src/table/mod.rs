//! Mount table and path resolution
//!
//! Mounts are kept in insertion order. Resolution walks them from the most
//! recent to the oldest: the first regular file found wins outright, while
//! directories found along the way merge into one composite view.
//!
//! ```no_run
//! use layerfs_rs::{MemoryTree, MountFlags, MountTable};
//! use std::sync::Arc;
//!
//! # fn main() -> layerfs_rs::Result<()> {
//! let table = MountTable::new();
//! table.mount(Arc::new(MemoryTree::new()), "/scratch", MountFlags::empty());
//! table.write_file("/scratch/notes.txt", b"hello")?;
//! assert_eq!(table.read_file("/scratch/notes.txt")?, b"hello");
//! # Ok(())
//! # }
//! ```

mod virtual_file;

pub use virtual_file::VirtualFile;

use crate::archive::ArchiveContainer;
use crate::config::{parse_ramdisk, ArchiveConfig, MountDescriptor, VfsConfig};
use crate::error::{Result, VfsError};
use crate::mount::{ArchiveBackend, CasOutcome, MemoryTree, MountBackend, MountFlags, NativeBackend};
use crate::path;
use crate::stream::{LockedStream, ReadOnly, DEFAULT_WINDOW_BUFFER_SIZE};
use parking_lot::RwLock;
use std::fmt;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};
use virtual_file::Component;

static GLOBAL: OnceLock<MountTable> = OnceLock::new();

/// One backend attached under a mount point
#[derive(Clone)]
pub struct Mount {
    mount_point: String,
    backend: Arc<dyn MountBackend>,
    flags: MountFlags,
    sequence: u64,
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("mount_point", &self.mount_point)
            .field("kind", &self.backend.kind())
            .field("flags", &self.flags)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl Mount {
    /// Standardized absolute mount point
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    pub fn backend(&self) -> &Arc<dyn MountBackend> {
        &self.backend
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    /// Insertion order; higher wins on conflict
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Writes are never routed here
    pub fn is_read_only(&self) -> bool {
        self.flags.contains(MountFlags::READ_ONLY) || !self.backend.is_writable()
    }

    fn component(&self, local_path: String, implicit_pz: bool) -> Component {
        Component {
            backend: Arc::clone(&self.backend),
            local_path,
            implicit_pz,
            read_only: self.is_read_only(),
        }
    }
}

fn same_backend(a: &Arc<dyn MountBackend>, b: &Arc<dyn MountBackend>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Parent of a mount-local path; `""` is the backend root
fn local_parent(local: &str) -> &str {
    local.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

#[derive(Debug)]
struct TableState {
    mounts: Vec<Mount>,
    cwd: String,
    mount_seq: u64,
    next_sequence: u64,
}

/// Ordered set of mounts forming one virtual file system
pub struct MountTable {
    state: RwLock<TableState>,
    implicit_pz: bool,
    case_sensitive: bool,
    archive: ArchiveConfig,
    window_buffer_size: usize,
}

impl fmt::Debug for MountTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("MountTable")
            .field("mounts", &state.mounts)
            .field("cwd", &state.cwd)
            .field("implicit_pz", &self.implicit_pz)
            .finish()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable {
    /// Empty table with the working directory at the root
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TableState {
                mounts: Vec::new(),
                cwd: "/".to_string(),
                mount_seq: 0,
                next_sequence: 0,
            }),
            implicit_pz: true,
            case_sensitive: false,
            archive: ArchiveConfig::default(),
            window_buffer_size: DEFAULT_WINDOW_BUFFER_SIZE,
        }
    }

    /// Table populated from configuration
    ///
    /// Mounts that fail are logged and skipped, so one bad descriptor does
    /// not take the rest of the table down with it.
    pub fn from_config(config: &VfsConfig) -> Self {
        let mut table = Self::new();
        table.implicit_pz = config.implicit_pz;
        table.case_sensitive = config.case_sensitive;
        table.archive = config.archive.clone();
        table.window_buffer_size = config.stream.window_buffer_size;

        if config.mount_system_root {
            let root = NativeBackend::new("/").with_case_check(config.case_sensitive);
            table.mount(Arc::new(root), "/", MountFlags::empty());
        }

        let cwd = config.cwd.clone().or_else(|| {
            std::env::current_dir()
                .ok()
                .map(|dir| dir.to_string_lossy().replace('\\', "/"))
        });
        if let Some(cwd) = cwd {
            if let Err(err) = table.chdir(&cwd) {
                debug!(cwd = %cwd, error = %err, "initial working directory not available");
            }
        }

        for line in &config.mounts {
            let result = MountDescriptor::parse(line).and_then(|desc| {
                let password = desc.options.password.as_deref();
                table
                    .mount_path(&desc.physical, &desc.mount_point, desc.options.flags(), password)
                    .map(|_| ())
            });
            if let Err(err) = result {
                warn!(descriptor = %line, error = %err, "skipping mount");
            }
        }

        for line in &config.ramdisks {
            let (mount_point, options) = parse_ramdisk(line);
            table.mount(Arc::new(MemoryTree::new()), &mount_point, options.flags());
        }
        table
    }

    /// Serve a missing `name` from a compressed `name.pz` sibling
    pub fn with_implicit_pz(mut self, enabled: bool) -> Self {
        self.implicit_pz = enabled;
        self
    }

    /// The process-wide table, built from the environment on first use
    pub fn global() -> &'static MountTable {
        GLOBAL.get_or_init(|| {
            let table = MountTable::from_config(&VfsConfig::from_env());
            info!(mounts = table.num_mounts(), "initialized default mount table");
            table
        })
    }

    /// Unmount everything from the process-wide table, if it was ever built
    pub fn shutdown_global() -> usize {
        match GLOBAL.get() {
            Some(table) => table.unmount_all(),
            None => 0,
        }
    }

    // ---- mounting ----

    /// Attach `backend` under `mount_point`, taking precedence over every
    /// existing mount
    pub fn mount(&self, backend: Arc<dyn MountBackend>, mount_point: &str, flags: MountFlags) {
        let mut state = self.state.write();
        let mount_point = path::resolve(mount_point, &state.cwd);
        info!(mount_point = %mount_point, kind = ?backend.kind(), flags = flags.bits(), "mount");
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.mounts.push(Mount {
            mount_point,
            backend,
            flags,
            sequence,
        });
        state.mount_seq += 1;
    }

    /// Mount a host directory, or a host archive file read-only
    pub fn mount_path<P: AsRef<Path>>(
        &self,
        physical: P,
        mount_point: &str,
        flags: MountFlags,
        password: Option<&str>,
    ) -> Result<Arc<dyn MountBackend>> {
        let physical = physical.as_ref();
        let metadata = std::fs::metadata(physical).map_err(|_| {
            warn!(path = %physical.display(), "attempt to mount a missing path");
            VfsError::NotFound(physical.display().to_string())
        })?;

        if metadata.is_dir() {
            let backend: Arc<dyn MountBackend> =
                Arc::new(NativeBackend::new(physical).with_case_check(self.case_sensitive));
            self.mount(Arc::clone(&backend), mount_point, flags);
            return Ok(backend);
        }

        let mut archive = ArchiveContainer::open_read(physical)?;
        self.prepare_archive(&mut archive, password)?;
        let backend: Arc<dyn MountBackend> = Arc::new(ArchiveBackend::new(Arc::new(archive)));
        self.mount(Arc::clone(&backend), mount_point, flags | MountFlags::READ_ONLY);
        Ok(backend)
    }

    /// Mount an archive that is itself a file inside this table
    pub fn mount_loop(
        &self,
        virtual_path: &str,
        mount_point: &str,
        flags: MountFlags,
        password: Option<&str>,
    ) -> Result<Arc<dyn MountBackend>> {
        let file = self
            .get_file(virtual_path)
            .ok_or_else(|| VfsError::NotFound(virtual_path.to_string()))?;
        if file.is_directory() {
            return Err(VfsError::IsDirectory(virtual_path.to_string()));
        }
        let data = file.read_all()?;
        let stream = LockedStream::owned(ReadOnly(Cursor::new(data)));
        let mut archive = ArchiveContainer::open_read_stream(stream)?;
        self.prepare_archive(&mut archive, password)?;
        let backend: Arc<dyn MountBackend> = Arc::new(ArchiveBackend::new(Arc::new(archive)));
        self.mount(Arc::clone(&backend), mount_point, flags | MountFlags::READ_ONLY);
        Ok(backend)
    }

    fn prepare_archive(&self, archive: &mut ArchiveContainer, password: Option<&str>) -> Result<()> {
        archive.configure(&self.archive)?;
        archive.set_window_buffer_size(self.window_buffer_size);
        archive.set_password(password.map(str::to_string));
        Ok(())
    }

    fn remove_where<F: Fn(&Mount) -> bool>(&self, predicate: F) -> usize {
        let mut state = self.state.write();
        let before = state.mounts.len();
        state.mounts.retain(|mount| {
            let remove = predicate(mount);
            if remove {
                info!(mount_point = %mount.mount_point, kind = ?mount.backend.kind(), "unmount");
            }
            !remove
        });
        state.mount_seq += 1;
        before - state.mounts.len()
    }

    /// Remove every appearance of `backend`
    pub fn unmount(&self, backend: &Arc<dyn MountBackend>) -> usize {
        self.remove_where(|mount| same_backend(&mount.backend, backend))
    }

    /// Remove every mount of the host directory or archive at `physical`
    pub fn unmount_path<P: AsRef<Path>>(&self, physical: P) -> usize {
        let physical = physical.as_ref();
        self.remove_where(|mount| mount.backend.physical_path() == Some(physical))
    }

    /// Remove every mount attached at `mount_point`
    pub fn unmount_point(&self, mount_point: &str) -> usize {
        let target = path::resolve(mount_point, &self.cwd());
        self.remove_where(|mount| mount.mount_point == target)
    }

    pub fn unmount_all(&self) -> usize {
        self.remove_where(|_| true)
    }

    /// Snapshot of the mounts, oldest first
    pub fn mounts(&self) -> Vec<Mount> {
        self.state.read().mounts.clone()
    }

    pub fn num_mounts(&self) -> usize {
        self.state.read().mounts.len()
    }

    /// Counter bumped by every mount and unmount
    pub fn mount_sequence(&self) -> u64 {
        self.state.read().mount_seq
    }

    // ---- working directory ----

    /// Change the directory relative paths resolve against
    pub fn chdir(&self, dir: &str) -> Result<()> {
        let target = path::resolve(dir, &self.cwd());
        if target != "/" {
            match self.get_file(&target) {
                Some(file) if file.is_directory() => {}
                Some(_) => return Err(VfsError::NotDirectory(target)),
                None => return Err(VfsError::NotFound(target)),
            }
        }
        self.state.write().cwd = target;
        Ok(())
    }

    pub fn cwd(&self) -> String {
        self.state.read().cwd.clone()
    }

    fn absolute(&self, path: &str) -> String {
        path::resolve(path, &self.cwd())
    }

    // ---- resolution ----

    /// Resolve `path` against the mounts
    ///
    /// Returns `None` when nothing supplies the path. An empty path is a
    /// caller error.
    pub fn get_file(&self, path: &str) -> Option<VirtualFile> {
        debug_assert!(!path.is_empty(), "get_file called with an empty path");
        if path.is_empty() {
            return None;
        }
        let (mounts, cwd) = {
            let state = self.state.read();
            (state.mounts.clone(), state.cwd.clone())
        };
        let target = path::resolve(path, &cwd);

        let mut directories: Vec<Component> = Vec::new();
        'mounts: for mount in mounts.iter().rev() {
            let Some(local) = path::strip_mount_point(&target, &mount.mount_point) else {
                continue;
            };
            let mut candidates = vec![(local.to_string(), false)];
            if self.implicit_pz && !local.is_empty() {
                candidates.push((format!("{}.pz", local), true));
            }
            for (local, implicit_pz) in candidates {
                let backend = &mount.backend;
                if backend.is_directory(&local) {
                    // Directories named `x.pz` never stand in for `x`
                    if !implicit_pz {
                        directories.push(mount.component(local, false));
                    }
                } else if backend.exists(&local) {
                    if directories.is_empty() {
                        return Some(VirtualFile::file(target, mount.component(local, implicit_pz)));
                    }
                    // A file below directories already found ends the search
                    break 'mounts;
                }
            }
        }

        let mount_children = Self::mount_children(&mounts, &target);
        let is_ancestor = target == "/" || !mount_children.is_empty();
        if directories.is_empty() && !is_ancestor {
            return None;
        }
        Some(VirtualFile::directory(target, directories, mount_children))
    }

    /// Names of the mount points one level below `dir`
    fn mount_children(mounts: &[Mount], dir: &str) -> Vec<String> {
        let mut names: Vec<String> = mounts
            .iter()
            .filter_map(|mount| path::child_toward(dir, &mount.mount_point))
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn exists(&self, path: &str) -> bool {
        self.get_file(path).is_some()
    }

    pub fn is_directory(&self, path: &str) -> bool {
        self.get_file(path).is_some_and(|f| f.is_directory())
    }

    pub fn is_regular_file(&self, path: &str) -> bool {
        self.get_file(path).is_some_and(|f| f.is_regular_file())
    }

    fn require(&self, path: &str) -> Result<VirtualFile> {
        self.get_file(path)
            .ok_or_else(|| VfsError::NotFound(self.absolute(path)))
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.require(path)?.read_all()
    }

    pub fn open_read_file(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        self.require(path)?.open_read()
    }

    /// First match for a relative `path` under each search directory in turn
    ///
    /// Absolute paths ignore the search path.
    pub fn find_file(&self, path: &str, search_path: &[&str]) -> Option<VirtualFile> {
        if path.starts_with('/') {
            return self.get_file(path);
        }
        search_path
            .iter()
            .find_map(|dir| self.get_file(&path::join(&path::resolve(dir, &self.cwd()), path)))
    }

    /// Entries of a directory, each resolved with full mount precedence
    pub fn scan_directory(&self, path: &str) -> Result<Vec<VirtualFile>> {
        let dir = self.require(path)?;
        let names = dir.child_names()?;
        Ok(names
            .iter()
            .filter_map(|name| self.get_file(&path::join(dir.path(), name)))
            .collect())
    }

    // ---- writing ----

    /// Most recent writable mount holding the parent directory of `path`
    fn write_target(&self, path: &str) -> Result<(Mount, String)> {
        let target = self.absolute(path);
        let mut inside_any = false;
        for mount in self.mounts().into_iter().rev() {
            let Some(local) = path::strip_mount_point(&target, &mount.mount_point) else {
                continue;
            };
            if local.is_empty() {
                continue;
            }
            inside_any = true;
            if mount.is_read_only() || !mount.backend.is_directory(local_parent(local)) {
                continue;
            }
            let local = local.to_string();
            return Ok((mount, local));
        }
        if inside_any {
            Err(VfsError::ReadOnly(target))
        } else {
            Err(VfsError::NotFound(target))
        }
    }

    /// The visible regular file at `path`, which must be writable
    fn writable_file(&self, path: &str) -> Result<(VirtualFile, Component)> {
        let file = self.require(path)?;
        let component = match file.primary() {
            Some(component) if file.is_regular_file() => component.clone(),
            _ => return Err(VfsError::IsDirectory(file.path().to_string())),
        };
        if component.read_only || component.implicit_pz {
            return Err(VfsError::ReadOnly(file.path().to_string()));
        }
        Ok((file, component))
    }

    /// Create or replace a regular file
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let (mount, local) = self.write_target(path)?;
        debug!(path, mount_point = %mount.mount_point, bytes = data.len(), "write file");
        mount.backend.write_file(&local, data)
    }

    /// Create one directory; succeeds if it already exists
    pub fn make_directory(&self, path: &str) -> Result<()> {
        if self.is_directory(path) {
            return Ok(());
        }
        let (mount, local) = self.write_target(path)?;
        mount.backend.make_directory(&local)
    }

    /// Create a directory and any missing ancestors
    pub fn make_directory_full(&self, path: &str) -> Result<()> {
        let target = self.absolute(path);
        let mut prefix = String::new();
        for part in target.split('/').filter(|p| !p.is_empty()) {
            prefix.push('/');
            prefix.push_str(part);
            if prefix.len() < target.len() {
                // An ancestor may already exist somewhere unwritable
                let _ = self.make_directory(&prefix);
            }
        }
        self.make_directory(&target)
    }

    pub fn delete_file(&self, path: &str) -> Result<()> {
        let (_, component) = self.writable_file(path)?;
        component.backend.delete_file(&component.local_path)
    }

    /// Move a regular file
    ///
    /// Within one mount this is a rename. Across mounts the file is copied
    /// and then deleted from its old mount.
    pub fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let (source, component) = self.writable_file(from)?;
        let (mount, local) = self.write_target(to)?;
        if same_backend(&component.backend, &mount.backend) {
            return component.backend.rename_file(&component.local_path, &local);
        }
        let data = source.read_all()?;
        mount.backend.write_file(&local, &data)?;
        component.backend.delete_file(&component.local_path)
    }

    /// Replace the contents of `path` only if they currently equal `expected`
    pub fn atomic_compare_and_exchange_contents(
        &self,
        path: &str,
        expected: &[u8],
        new: &[u8],
    ) -> Result<CasOutcome> {
        let (_, component) = self.writable_file(path)?;
        component
            .backend
            .atomic_compare_and_exchange_contents(&component.local_path, expected, new)
    }

    pub fn atomic_read_contents(&self, path: &str) -> Result<Vec<u8>> {
        let file = self.require(path)?;
        match file.primary() {
            Some(component) if file.is_regular_file() && !component.implicit_pz => {
                component.backend.atomic_read_contents(&component.local_path)
            }
            Some(_) if file.is_regular_file() => file.read_all(),
            _ => Err(VfsError::IsDirectory(file.path().to_string())),
        }
    }
}
