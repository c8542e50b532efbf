//! # Filesystems
//!
//! Guest paths carry a drive prefix (`ms0:/PSP/SAVEDATA`, `umd0:/data.bin`).
//! [`MetaFileSystem`] owns one backend per drive and routes every call:
//!
//! ```text
//!   "ms0:\\PSP\\.\\GAME\\..\\SAVE"
//!        │ fix_path
//!        ▼
//!   ("ms0:", "/PSP/SAVE") ──▶ mounts["ms0:"] : dyn FileSystem
//! ```
//!
//! Handles returned by the meta filesystem are its own and never collide
//! between drives.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;

use thiserror::Error;
use tracing::{debug, warn};

use super::error;

pub const O_RDONLY: u32 = 0x0001;
pub const O_WRONLY: u32 = 0x0002;
pub const O_RDWR: u32 = O_RDONLY | O_WRONLY;
pub const O_APPEND: u32 = 0x0100;
pub const O_CREAT: u32 = 0x0200;
pub const O_TRUNC: u32 = 0x0400;
pub const O_EXCL: u32 = 0x0800;

pub const STAT_MODE_DIRECTORY: u32 = 0x1000;
pub const STAT_MODE_FILE: u32 = 0x2000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("bad file handle {0}")]
    BadHandle(u32),
    #[error("no device mounted for {0}")]
    NoDevice(String),
    #[error("file opened without {0} access")]
    Access(&'static str),
}

impl FsError {
    /// Status code the guest sees for this error.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::NotFound(_) | Self::NoDevice(_) => error::NOFILE,
            Self::AlreadyExists(_) => error::FILE_EXISTS,
            Self::NotADirectory(_) => error::NOT_DIRECTORY,
            Self::IsADirectory(_) => error::IS_DIRECTORY,
            Self::DirectoryNotEmpty(_) => error::DIRECTORY_NOT_EMPTY,
            Self::BadHandle(_) | Self::Access(_) => error::BADF,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileType {
    File,
    Directory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub file_type: FileType,
}

impl FileInfo {
    /// `st_mode` of a `SceIoStat`: type bits plus rwx for everybody.
    #[must_use]
    pub const fn mode(&self) -> u32 {
        match self.file_type {
            FileType::File => STAT_MODE_FILE | 0o777,
            FileType::Directory => STAT_MODE_DIRECTORY | 0o777,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// One storage backend. Paths are absolute within the drive, like `/a/b`.
pub trait FileSystem {
    fn open_file(&mut self, path: &str, flags: u32) -> FsResult<u32>;
    fn close_file(&mut self, handle: u32) -> FsResult<()>;
    fn read(&mut self, handle: u32, buf: &mut [u8]) -> FsResult<usize>;
    fn write(&mut self, handle: u32, data: &[u8]) -> FsResult<usize>;
    fn seek(&mut self, handle: u32, position: SeekFrom) -> FsResult<u64>;
    fn open_directory(&mut self, path: &str) -> FsResult<Vec<FileInfo>>;
    fn create_directory(&mut self, path: &str) -> FsResult<()>;
    fn get_stat(&self, path: &str) -> FsResult<FileInfo>;
    fn rename(&mut self, from: &str, to: &str) -> FsResult<()>;
    fn remove_file(&mut self, path: &str) -> FsResult<()>;
    fn remove_directory(&mut self, path: &str) -> FsResult<()>;
}

/// Collapses `.`, `..`, duplicate and back slashes into `/a/b` form.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

enum Node {
    File(Vec<u8>),
    Directory,
}

struct OpenHandle {
    path: String,
    position: u64,
    flags: u32,
}

/// Backend that keeps the whole tree in host memory.
pub struct MemoryFileSystem {
    nodes: BTreeMap<String, Node>,
    handles: HashMap<u32, OpenHandle>,
    next_handle: u32,
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileSystem {
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::from("/"), Node::Directory);
        Self {
            nodes,
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Stores `data` at `path`, creating parent directories.
    pub fn insert_file(&mut self, path: &str, data: Vec<u8>) {
        let path = normalize_path(path);
        let mut parent = parent_of(&path).to_string();
        let mut missing = Vec::new();
        while !self.nodes.contains_key(&parent) {
            missing.push(parent.clone());
            parent = parent_of(&parent).to_string();
        }
        for dir in missing {
            self.nodes.insert(dir, Node::Directory);
        }
        self.nodes.insert(path, Node::File(data));
    }

    fn require_directory(&self, path: &str) -> FsResult<()> {
        match self.nodes.get(path) {
            Some(Node::Directory) => Ok(()),
            Some(Node::File(_)) => Err(FsError::NotADirectory(path.to_string())),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    fn children<'a>(&'a self, path: &'a str) -> impl Iterator<Item = (&'a String, &'a Node)> + 'a {
        let prefix = if path == "/" { String::from("/") } else { format!("{path}/") };
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter(move |(k, _)| k.len() > path.len() + 1 || path == "/")
            .filter(|(k, _)| k.as_str() != "/")
            .filter(move |(k, _)| {
                let rest = if path == "/" { &k[1..] } else { &k[path.len() + 1..] };
                !rest.contains('/')
            })
    }

    fn handle(&mut self, handle: u32) -> FsResult<&mut OpenHandle> {
        self.handles.get_mut(&handle).ok_or(FsError::BadHandle(handle))
    }
}

impl FileSystem for MemoryFileSystem {
    fn open_file(&mut self, path: &str, flags: u32) -> FsResult<u32> {
        let path = normalize_path(path);
        match self.nodes.get_mut(&path) {
            Some(Node::Directory) => return Err(FsError::IsADirectory(path)),
            Some(Node::File(_)) if flags & O_CREAT != 0 && flags & O_EXCL != 0 => {
                return Err(FsError::AlreadyExists(path));
            }
            Some(Node::File(data)) => {
                if flags & O_TRUNC != 0 && flags & O_WRONLY != 0 {
                    data.clear();
                }
            }
            None if flags & O_CREAT != 0 => {
                self.require_directory(parent_of(&path))?;
                self.nodes.insert(path.clone(), Node::File(Vec::new()));
            }
            None => return Err(FsError::NotFound(path)),
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(
            handle,
            OpenHandle {
                path,
                position: 0,
                flags,
            },
        );
        Ok(handle)
    }

    fn close_file(&mut self, handle: u32) -> FsResult<()> {
        self.handles
            .remove(&handle)
            .map(|_| ())
            .ok_or(FsError::BadHandle(handle))
    }

    fn read(&mut self, handle: u32, buf: &mut [u8]) -> FsResult<usize> {
        let open = self.handles.get_mut(&handle).ok_or(FsError::BadHandle(handle))?;
        if open.flags & O_RDONLY == 0 {
            return Err(FsError::Access("read"));
        }
        let Some(Node::File(data)) = self.nodes.get(&open.path) else {
            return Err(FsError::NotFound(open.path.clone()));
        };
        let start = usize::try_from(open.position).unwrap_or(usize::MAX).min(data.len());
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        open.position += len as u64;
        Ok(len)
    }

    fn write(&mut self, handle: u32, bytes: &[u8]) -> FsResult<usize> {
        let open = self.handles.get_mut(&handle).ok_or(FsError::BadHandle(handle))?;
        if open.flags & O_WRONLY == 0 {
            return Err(FsError::Access("write"));
        }
        let Some(Node::File(data)) = self.nodes.get_mut(&open.path) else {
            return Err(FsError::NotFound(open.path.clone()));
        };
        if open.flags & O_APPEND != 0 {
            open.position = data.len() as u64;
        }
        let start = usize::try_from(open.position).unwrap_or(usize::MAX);
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        open.position = end as u64;
        Ok(bytes.len())
    }

    fn seek(&mut self, handle: u32, position: SeekFrom) -> FsResult<u64> {
        let open = self.handles.get(&handle).ok_or(FsError::BadHandle(handle))?;
        let size = match self.nodes.get(&open.path) {
            Some(Node::File(data)) => data.len() as u64,
            _ => 0,
        };
        let open = self.handle(handle)?;
        let target = match position {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => open.position.checked_add_signed(delta),
            SeekFrom::End(delta) => size.checked_add_signed(delta),
        };
        // Seeking before the start leaves the position untouched.
        if let Some(target) = target {
            open.position = target;
        }
        Ok(open.position)
    }

    fn open_directory(&mut self, path: &str) -> FsResult<Vec<FileInfo>> {
        let path = normalize_path(path);
        self.require_directory(&path)?;
        Ok(self
            .children(&path)
            .map(|(name, node)| FileInfo {
                name: file_name(name).to_string(),
                size: match node {
                    Node::File(data) => data.len() as u64,
                    Node::Directory => 0,
                },
                file_type: match node {
                    Node::File(_) => FileType::File,
                    Node::Directory => FileType::Directory,
                },
            })
            .collect())
    }

    fn create_directory(&mut self, path: &str) -> FsResult<()> {
        let path = normalize_path(path);
        if self.nodes.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        self.require_directory(parent_of(&path))?;
        self.nodes.insert(path, Node::Directory);
        Ok(())
    }

    fn get_stat(&self, path: &str) -> FsResult<FileInfo> {
        let path = normalize_path(path);
        match self.nodes.get(&path) {
            Some(Node::File(data)) => Ok(FileInfo {
                name: file_name(&path).to_string(),
                size: data.len() as u64,
                file_type: FileType::File,
            }),
            Some(Node::Directory) => Ok(FileInfo {
                name: file_name(&path).to_string(),
                size: 0,
                file_type: FileType::Directory,
            }),
            None => Err(FsError::NotFound(path)),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> FsResult<()> {
        let from = normalize_path(from);
        let to = normalize_path(to);
        if self.nodes.contains_key(&to) {
            return Err(FsError::AlreadyExists(to));
        }
        self.require_directory(parent_of(&to))?;
        let node = self.nodes.remove(&from).ok_or_else(|| FsError::NotFound(from.clone()))?;
        if matches!(node, Node::Directory) {
            let prefix = format!("{from}/");
            let moved: Vec<String> = self
                .nodes
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .collect();
            for old in moved {
                if let Some(child) = self.nodes.remove(&old) {
                    self.nodes.insert(format!("{to}{}", &old[from.len()..]), child);
                }
            }
        }
        for open in self.handles.values_mut().filter(|h| h.path == from) {
            open.path.clone_from(&to);
        }
        self.nodes.insert(to, node);
        Ok(())
    }

    fn remove_file(&mut self, path: &str) -> FsResult<()> {
        let path = normalize_path(path);
        match self.nodes.get(&path) {
            Some(Node::File(_)) => {
                self.nodes.remove(&path);
                Ok(())
            }
            Some(Node::Directory) => Err(FsError::IsADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    fn remove_directory(&mut self, path: &str) -> FsResult<()> {
        let path = normalize_path(path);
        self.require_directory(&path)?;
        if self.children(&path).next().is_some() {
            return Err(FsError::DirectoryNotEmpty(path));
        }
        self.nodes.remove(&path);
        Ok(())
    }
}

/// Drive-prefix router over several backends.
pub struct MetaFileSystem {
    mounts: Vec<(String, Box<dyn FileSystem>)>,
    aliases: HashMap<String, String>,
    current_directory: String,
    handles: HashMap<u32, (usize, u32)>,
    next_handle: u32,
}

impl Default for MetaFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaFileSystem {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mounts: Vec::new(),
            aliases: HashMap::new(),
            current_directory: String::new(),
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Mounts `backend` under `drive`, e.g. `"ms0:"`.
    pub fn mount(&mut self, drive: &str, backend: Box<dyn FileSystem>) {
        debug!("mounting {drive}");
        let drive = drive.to_ascii_lowercase();
        self.mounts.retain(|(d, _)| *d != drive);
        self.mounts.push((drive, backend));
    }

    /// Makes `drive` another name for the already mounted `target`.
    pub fn alias(&mut self, drive: &str, target: &str) {
        self.aliases
            .insert(drive.to_ascii_lowercase(), target.to_ascii_lowercase());
    }

    #[must_use]
    pub fn current_directory(&self) -> &str {
        &self.current_directory
    }

    pub fn change_directory(&mut self, path: &str) -> FsResult<()> {
        let (mount, inner) = self.fix_path(path)?;
        let drive = self.mounts[mount].0.clone();
        if self.mounts[mount].1.get_stat(&inner)?.file_type != FileType::Directory {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        self.current_directory = format!("{drive}{inner}");
        Ok(())
    }

    /// Resolves a guest path to a mount index and a normalized path inside
    /// that mount. Relative paths start at the current directory.
    pub fn fix_path(&self, path: &str) -> FsResult<(usize, String)> {
        let absolute = if path.contains(':') {
            path.to_string()
        } else if path.starts_with(['/', '\\']) {
            let drive = self.current_directory.split(':').next().unwrap_or_default();
            format!("{drive}:{path}")
        } else {
            format!("{}/{path}", self.current_directory)
        };
        let Some((drive, rest)) = absolute.split_once(':') else {
            return Err(FsError::NoDevice(path.to_string()));
        };
        let mut drive = format!("{}:", drive.to_ascii_lowercase());
        if let Some(target) = self.aliases.get(&drive) {
            drive.clone_from(target);
        }
        let mount = self
            .mounts
            .iter()
            .position(|(d, _)| *d == drive)
            .ok_or_else(|| FsError::NoDevice(path.to_string()))?;
        Ok((mount, normalize_path(rest)))
    }

    fn resolve_handle(&self, handle: u32) -> FsResult<(usize, u32)> {
        self.handles.get(&handle).copied().ok_or(FsError::BadHandle(handle))
    }
}

impl FileSystem for MetaFileSystem {
    fn open_file(&mut self, path: &str, flags: u32) -> FsResult<u32> {
        let (mount, inner) = self.fix_path(path)?;
        let inner_handle = self.mounts[mount].1.open_file(&inner, flags)?;
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, (mount, inner_handle));
        debug!("opened {path} as {handle}");
        Ok(handle)
    }

    fn close_file(&mut self, handle: u32) -> FsResult<()> {
        let (mount, inner) = self.resolve_handle(handle)?;
        self.handles.remove(&handle);
        self.mounts[mount].1.close_file(inner)
    }

    fn read(&mut self, handle: u32, buf: &mut [u8]) -> FsResult<usize> {
        let (mount, inner) = self.resolve_handle(handle)?;
        self.mounts[mount].1.read(inner, buf)
    }

    fn write(&mut self, handle: u32, data: &[u8]) -> FsResult<usize> {
        let (mount, inner) = self.resolve_handle(handle)?;
        self.mounts[mount].1.write(inner, data)
    }

    fn seek(&mut self, handle: u32, position: SeekFrom) -> FsResult<u64> {
        let (mount, inner) = self.resolve_handle(handle)?;
        self.mounts[mount].1.seek(inner, position)
    }

    fn open_directory(&mut self, path: &str) -> FsResult<Vec<FileInfo>> {
        let (mount, inner) = self.fix_path(path)?;
        self.mounts[mount].1.open_directory(&inner)
    }

    fn create_directory(&mut self, path: &str) -> FsResult<()> {
        let (mount, inner) = self.fix_path(path)?;
        self.mounts[mount].1.create_directory(&inner)
    }

    fn get_stat(&self, path: &str) -> FsResult<FileInfo> {
        let (mount, inner) = self.fix_path(path)?;
        self.mounts[mount].1.get_stat(&inner)
    }

    fn rename(&mut self, from: &str, to: &str) -> FsResult<()> {
        let (mount, from) = self.fix_path(from)?;
        let (to_mount, to) = self.fix_path(to)?;
        if mount != to_mount {
            warn!("cross-device rename {from} -> {to}");
            return Err(FsError::NoDevice(to));
        }
        self.mounts[mount].1.rename(&from, &to)
    }

    fn remove_file(&mut self, path: &str) -> FsResult<()> {
        let (mount, inner) = self.fix_path(path)?;
        self.mounts[mount].1.remove_file(&inner)
    }

    fn remove_directory(&mut self, path: &str) -> FsResult<()> {
        let (mount, inner) = self.fix_path(path)?;
        self.mounts[mount].1.remove_directory(&inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn meta() -> MetaFileSystem {
        let mut fs = MetaFileSystem::new();
        let mut umd = MemoryFileSystem::new();
        umd.insert_file("/PSP_GAME/data.bin", b"0123456789".to_vec());
        fs.mount("ms0:", Box::new(MemoryFileSystem::new()));
        fs.mount("umd0:", Box::new(umd));
        fs.alias("disc0:", "umd0:");
        fs
    }

    #[test]
    fn paths_are_normalized() {
        assert_eq!(normalize_path("\\PSP\\.\\GAME\\..\\SAVE//x"), "/PSP/SAVE/x");
        assert_eq!(normalize_path("/../.."), "/");
        let mut fs = meta();
        fs.change_directory("umd0:/PSP_GAME").unwrap();
        let (mount, inner) = fs.fix_path("data.bin").unwrap();
        assert_eq!(mount, 1);
        assert_eq!(inner, "/PSP_GAME/data.bin");
        assert_eq!(fs.fix_path("/x").unwrap(), (1, String::from("/x")));
        assert_eq!(fs.fix_path("DISC0:/a").unwrap().0, 1);
        assert!(matches!(fs.fix_path("flash9:/x"), Err(FsError::NoDevice(_))));
    }

    #[test]
    fn read_seek_write() {
        let mut fs = meta();
        let handle = fs.open_file("disc0:/PSP_GAME/data.bin", O_RDONLY).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(handle, &mut buf), Ok(4));
        assert_eq!(&buf, b"0123");
        assert_eq!(fs.seek(handle, SeekFrom::End(-2)), Ok(8));
        assert_eq!(fs.read(handle, &mut buf), Ok(2));
        assert_eq!(fs.write(handle, b"x"), Err(FsError::Access("write")));
        fs.close_file(handle).unwrap();
        assert_eq!(fs.read(handle, &mut buf), Err(FsError::BadHandle(handle)));

        let out = fs.open_file("ms0:/save.dat", O_WRONLY | O_CREAT).unwrap();
        assert_eq!(fs.write(out, b"abc"), Ok(3));
        assert_eq!(fs.get_stat("ms0:/save.dat").unwrap().size, 3);
        assert_eq!(
            fs.open_file("ms0:/save.dat", O_WRONLY | O_CREAT | O_EXCL),
            Err(FsError::AlreadyExists(String::from("/save.dat")))
        );
    }

    #[test]
    fn directories() {
        let mut fs = meta();
        fs.create_directory("ms0:/PSP").unwrap();
        fs.create_directory("ms0:/PSP/SAVEDATA").unwrap();
        let f = fs.open_file("ms0:/PSP/readme", O_WRONLY | O_CREAT).unwrap();
        fs.close_file(f).unwrap();

        let mut names: Vec<_> = fs
            .open_directory("ms0:/PSP")
            .unwrap()
            .into_iter()
            .map(|i| (i.name, i.file_type))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                (String::from("SAVEDATA"), FileType::Directory),
                (String::from("readme"), FileType::File),
            ]
        );
        assert!(matches!(
            fs.remove_directory("ms0:/PSP"),
            Err(FsError::DirectoryNotEmpty(_))
        ));
        fs.rename("ms0:/PSP", "ms0:/GAME").unwrap();
        assert!(fs.get_stat("ms0:/GAME/SAVEDATA").is_ok());
        fs.remove_file("ms0:/GAME/readme").unwrap();
        fs.remove_directory("ms0:/GAME/SAVEDATA").unwrap();
        fs.remove_directory("ms0:/GAME").unwrap();
        assert_eq!(fs.open_directory("ms0:/").unwrap(), Vec::new());
    }

    #[test]
    fn errors_map_to_guest_codes() {
        assert_eq!(FsError::NotFound(String::new()).code(), error::NOFILE);
        assert_eq!(FsError::BadHandle(3).code(), error::BADF);
        assert_eq!(FsError::AlreadyExists(String::new()).code(), error::FILE_EXISTS);
    }
}
