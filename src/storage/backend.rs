//! Volume backends behind the filesystem facade.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use enum_dispatch::enum_dispatch;
use parking_lot::Mutex;

use super::StorageError;

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate.
    Write,
    /// Create if absent, cursor at end.
    Append,
}

/// Uniform operations every backend provides.
///
/// Paths are absolute and `/`-rooted; write-mode opens create missing
/// parent directories.
#[enum_dispatch]
pub trait Volume {
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, StorageError>;
    fn exists(&self, path: &str) -> bool;
    fn remove(&mut self, path: &str) -> Result<(), StorageError>;
    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError>;
    fn mkdir(&mut self, path: &str) -> Result<(), StorageError>;
    fn rmdir(&mut self, path: &str) -> Result<(), StorageError>;
    fn file_size(&self, path: &str) -> Result<u64, StorageError>;
}

/// The concrete backend set, dispatched without virtual calls.
#[enum_dispatch(Volume)]
pub enum VolumeKind {
    Host(HostVolume),
    Mem(MemVolume),
}

fn normalise(path: &str) -> Result<&str, StorageError> {
    if !path.starts_with('/') {
        return Err(StorageError::RelativePath(path.to_string()));
    }
    Ok(path)
}

/// Backend over the host filesystem, rooted at a base directory.
pub struct HostVolume {
    base: PathBuf,
}

impl HostVolume {
    /// Mounts at `base`, which must exist and be a directory.
    pub fn mount(base: &Path) -> Result<Self, StorageError> {
        if !base.is_dir() {
            return Err(StorageError::MountFailed(base.display().to_string()));
        }
        Ok(HostVolume {
            base: base.to_path_buf(),
        })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let rel = normalise(path)?.trim_start_matches('/');
        Ok(self.base.join(rel))
    }
}

impl Volume for HostVolume {
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, StorageError> {
        let full = self.resolve(path)?;
        if mode != OpenMode::Read {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = match mode {
            OpenMode::Read => fs::File::open(&full)?,
            OpenMode::Write => fs::File::create(&full)?,
            OpenMode::Append => {
                let mut f = fs::OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .open(&full)?;
                f.seek(SeekFrom::End(0))?;
                f
            }
        };
        Ok(FileHandle::Host(file))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        Ok(fs::remove_file(self.resolve(path)?)?)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        Ok(fs::rename(self.resolve(from)?, self.resolve(to)?)?)
    }

    fn mkdir(&mut self, path: &str) -> Result<(), StorageError> {
        Ok(fs::create_dir_all(self.resolve(path)?)?)
    }

    fn rmdir(&mut self, path: &str) -> Result<(), StorageError> {
        Ok(fs::remove_dir(self.resolve(path)?)?)
    }

    fn file_size(&self, path: &str) -> Result<u64, StorageError> {
        Ok(fs::metadata(self.resolve(path)?)?.len())
    }
}

type MemFile = Arc<Mutex<Vec<u8>>>;

/// In-RAM backend simulating the on-chip flash volume.
///
/// Doubles as the default fallback target and the storage test double.
/// Enforces a total byte quota across all files the way the flash
/// partition does.
pub struct MemVolume {
    files: HashMap<String, MemFile>,
    dirs: HashSet<String>,
    quota: usize,
}

impl MemVolume {
    pub fn new(quota: usize) -> Self {
        let mut dirs = HashSet::new();
        dirs.insert("/".to_string());
        MemVolume {
            files: HashMap::new(),
            dirs,
            quota,
        }
    }

    fn used(&self) -> usize {
        self.files.values().map(|f| f.lock().len()).sum()
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    fn add_parents(&mut self, path: &str) {
        let mut at = String::new();
        for part in path.trim_start_matches('/').split('/').collect::<Vec<_>>() {
            if part.is_empty() {
                continue;
            }
            at.push('/');
            at.push_str(part);
        }
        // Everything but the final component is a directory.
        if let Some(idx) = at.rfind('/') {
            if idx > 0 {
                let mut dir = String::new();
                for part in at[1..idx].split('/') {
                    dir.push('/');
                    dir.push_str(part);
                    self.dirs.insert(dir.clone());
                }
            }
        }
    }
}

impl Volume for MemVolume {
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, StorageError> {
        let path = normalise(path)?.to_string();
        match mode {
            OpenMode::Read => {
                let data = self
                    .files
                    .get(&path)
                    .cloned()
                    .ok_or_else(|| StorageError::NotFound(path.clone()))?;
                Ok(FileHandle::Mem(MemHandle {
                    data,
                    pos: 0,
                    quota: self.quota,
                    shared_used: 0,
                }))
            }
            OpenMode::Write | OpenMode::Append => {
                self.add_parents(&path);
                let data = self
                    .files
                    .entry(path)
                    .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
                    .clone();
                if mode == OpenMode::Write {
                    data.lock().clear();
                }
                let pos = data.lock().len() as u64;
                // Quota headroom excludes this file's own bytes, which
                // rewriting may reuse.
                let others = self.used() - data.lock().len();
                Ok(FileHandle::Mem(MemHandle {
                    data,
                    pos,
                    quota: self.quota,
                    shared_used: others,
                }))
            }
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.dirs.contains(path)
    }

    fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        self.files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        let data = self
            .files
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        self.add_parents(to);
        self.files.insert(to.to_string(), data);
        Ok(())
    }

    fn mkdir(&mut self, path: &str) -> Result<(), StorageError> {
        let path = normalise(path)?;
        self.add_parents(&format!("{}/.", path));
        self.dirs.insert(path.to_string());
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> Result<(), StorageError> {
        if self.files.keys().any(|f| f.starts_with(&format!("{path}/"))) {
            return Err(StorageError::DirectoryNotEmpty(path.to_string()));
        }
        self.dirs.remove(path);
        Ok(())
    }

    fn file_size(&self, path: &str) -> Result<u64, StorageError> {
        self.files
            .get(path)
            .map(|f| f.lock().len() as u64)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }
}

/// Open file, uniform across backends.
///
/// Implements the std IO traits so format code can stay backend-blind;
/// dropping the handle closes it.
pub enum FileHandle {
    Host(fs::File),
    Mem(MemHandle),
}

pub struct MemHandle {
    data: MemFile,
    pos: u64,
    quota: usize,
    shared_used: usize,
}

impl FileHandle {
    pub fn size(&self) -> Result<u64, StorageError> {
        match self {
            FileHandle::Host(f) => Ok(f.metadata()?.len()),
            FileHandle::Mem(h) => Ok(h.data.lock().len() as u64),
        }
    }

    pub fn tell(&mut self) -> Result<u64, StorageError> {
        match self {
            FileHandle::Host(f) => Ok(f.stream_position()?),
            FileHandle::Mem(h) => Ok(h.pos),
        }
    }
}

impl Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileHandle::Host(f) => f.read(buf),
            FileHandle::Mem(h) => {
                let data = h.data.lock();
                let start = (h.pos as usize).min(data.len());
                let n = (data.len() - start).min(buf.len());
                buf[..n].copy_from_slice(&data[start..start + n]);
                h.pos += n as u64;
                Ok(n)
            }
        }
    }
}

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileHandle::Host(f) => f.write(buf),
            FileHandle::Mem(h) => {
                let mut data = h.data.lock();
                let end = h.pos as usize + buf.len();
                if h.shared_used + end > h.quota {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "flash volume quota exceeded",
                    ));
                }
                if end > data.len() {
                    data.resize(end, 0);
                }
                data[h.pos as usize..end].copy_from_slice(buf);
                h.pos = end as u64;
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileHandle::Host(f) => f.flush(),
            FileHandle::Mem(_) => Ok(()),
        }
    }
}

impl Seek for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            FileHandle::Host(f) => f.seek(pos),
            FileHandle::Mem(h) => {
                let len = h.data.lock().len() as i64;
                let target = match pos {
                    SeekFrom::Start(n) => n as i64,
                    SeekFrom::End(delta) => len + delta,
                    SeekFrom::Current(delta) => h.pos as i64 + delta,
                };
                if target < 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "seek before start",
                    ));
                }
                h.pos = target as u64;
                Ok(h.pos)
            }
        }
    }
}
