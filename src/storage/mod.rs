//! Filesystem facade over the board's storage backends.
//!
//! One mount call selects a backend; every later open/read/write goes
//! through the same [`FileSystem`] handle regardless of whether bytes
//! land in flash, on an SD card or in a host directory. A failed mount
//! of a non-default backend falls back to the flash-log backend and
//! records the substitution rather than failing the boot.

use std::path::PathBuf;

use thiserror::Error;

mod backend;

pub use backend::{FileHandle, HostVolume, MemVolume, OpenMode, Volume, VolumeKind};

/// Dataset file quota on flash-backed storage.
pub const FLASH_DATASET_QUOTA: usize = 512 * 1024;
/// Inference-log quota on flash-backed storage.
pub const FLASH_LOG_QUOTA: usize = 64 * 1024;
/// Dataset file quota on SD-backed storage.
pub const SD_DATASET_QUOTA: usize = 50 * 1024 * 1024;
/// Inference-log quota on SD-backed storage.
pub const SD_LOG_QUOTA: usize = 10 * 1024 * 1024;

/// Timeout budget for bulk dataset reads, in milliseconds.
pub const DATASET_READ_TIMEOUT_MS: u64 = 30_000;
/// Timeout budget for control-message exchanges, in milliseconds.
pub const CONTROL_TIMEOUT_MS: u64 = 5_000;

/// Selectable storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StorageKind {
    /// Log-structured internal flash; the default and fallback target.
    FlashLog,
    /// FAT partition on internal flash.
    FlashFat,
    /// SD card on the native host interface.
    SdNative,
    /// SD card over SPI.
    SdSpi,
    /// Host directory, for tests and tooling.
    Host,
}

/// Mount-time parameters.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base directory for [`StorageKind::Host`].
    pub host_base: Option<PathBuf>,
    /// Byte capacity of the simulated flash volume.
    pub flash_capacity: usize,
    /// Whether an SD card is present.
    pub sd_available: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            host_base: None,
            flash_capacity: FLASH_DATASET_QUOTA + FLASH_LOG_QUOTA,
            sd_available: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path must be absolute: {0}")]
    RelativePath(String),
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("mount failed: {0}")]
    MountFailed(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
}

/// The mounted facade.
pub struct FileSystem {
    volume: VolumeKind,
    kind: StorageKind,
    requested: StorageKind,
}

impl FileSystem {
    /// Mounts the requested backend, falling back to [`StorageKind::FlashLog`]
    /// when it cannot be brought up.
    pub fn mount(kind: StorageKind, config: &StorageConfig) -> Self {
        match Self::try_mount(kind, config) {
            Ok(volume) => FileSystem {
                volume,
                kind,
                requested: kind,
            },
            Err(err) => {
                log::warn!("mount of {kind:?} failed ({err}), falling back to flash");
                FileSystem {
                    volume: VolumeKind::Mem(MemVolume::new(config.flash_capacity)),
                    kind: StorageKind::FlashLog,
                    requested: kind,
                }
            }
        }
    }

    fn try_mount(kind: StorageKind, config: &StorageConfig) -> Result<VolumeKind, StorageError> {
        match kind {
            StorageKind::FlashLog | StorageKind::FlashFat => {
                Ok(VolumeKind::Mem(MemVolume::new(config.flash_capacity)))
            }
            StorageKind::SdNative | StorageKind::SdSpi => {
                if !config.sd_available {
                    return Err(StorageError::MountFailed("no SD card present".into()));
                }
                match &config.host_base {
                    Some(base) => Ok(VolumeKind::Host(HostVolume::mount(base)?)),
                    None => Err(StorageError::MountFailed("SD mount point missing".into())),
                }
            }
            StorageKind::Host => {
                let base = config
                    .host_base
                    .as_ref()
                    .ok_or_else(|| StorageError::MountFailed("host base dir missing".into()))?;
                Ok(VolumeKind::Host(HostVolume::mount(base)?))
            }
        }
    }

    /// The backend actually serving requests.
    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    /// True when mount fell back to the default backend.
    pub fn fell_back(&self) -> bool {
        self.kind != self.requested
    }

    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, StorageError> {
        log::trace!("open {path} ({mode:?}) on {:?}", self.kind);
        self.volume.open(path, mode)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.volume.exists(path)
    }

    pub fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        self.volume.remove(path)
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        self.volume.rename(from, to)
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), StorageError> {
        self.volume.mkdir(path)
    }

    pub fn rmdir(&mut self, path: &str) -> Result<(), StorageError> {
        self.volume.rmdir(path)
    }

    pub fn file_size(&self, path: &str) -> Result<u64, StorageError> {
        self.volume.file_size(path)
    }

    /// Reads a whole file into memory.
    pub fn read_all(&mut self, path: &str) -> Result<Vec<u8>, StorageError> {
        use std::io::Read;
        let mut handle = self.open(path, OpenMode::Read)?;
        let mut out = Vec::new();
        handle.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Creates or replaces a file with the given bytes.
    pub fn write_all(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        use std::io::Write;
        let mut handle = self.open(path, OpenMode::Write)?;
        handle.write_all(bytes)?;
        handle.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn flash() -> FileSystem {
        FileSystem::mount(StorageKind::FlashLog, &StorageConfig::default())
    }

    #[test]
    fn write_read_round_trip() {
        let mut fs = flash();
        fs.write_all("/models/a.bin", b"abc123").unwrap();
        assert!(fs.exists("/models/a.bin"));
        assert!(fs.exists("/models"));
        assert_eq!(fs.read_all("/models/a.bin").unwrap(), b"abc123");
        assert_eq!(fs.file_size("/models/a.bin").unwrap(), 6);
    }

    #[test]
    fn seek_and_append() {
        let mut fs = flash();
        fs.write_all("/log.txt", b"hello").unwrap();
        let mut handle = fs.open("/log.txt", OpenMode::Append).unwrap();
        assert_eq!(handle.tell().unwrap(), 5);
        handle.write_all(b" world").unwrap();
        handle.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        handle.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn missing_sd_falls_back_to_flash() {
        let fs = FileSystem::mount(StorageKind::SdSpi, &StorageConfig::default());
        assert!(fs.fell_back());
        assert_eq!(fs.kind(), StorageKind::FlashLog);
    }

    #[test]
    fn relative_paths_are_rejected() {
        let mut fs = flash();
        assert!(matches!(
            fs.open("data.csv", OpenMode::Read),
            Err(StorageError::RelativePath(_))
        ));
    }

    #[test]
    fn quota_is_enforced() {
        let mut fs = FileSystem::mount(
            StorageKind::FlashLog,
            &StorageConfig {
                flash_capacity: 16,
                ..StorageConfig::default()
            },
        );
        let mut handle = fs.open("/big.bin", OpenMode::Write).unwrap();
        assert!(handle.write_all(&[0u8; 64]).is_err());
    }

    #[test]
    fn host_volume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = FileSystem::mount(
            StorageKind::Host,
            &StorageConfig {
                host_base: Some(dir.path().to_path_buf()),
                ..StorageConfig::default()
            },
        );
        assert!(!fs.fell_back());
        fs.write_all("/deep/nested/f.bin", b"42").unwrap();
        assert_eq!(fs.read_all("/deep/nested/f.bin").unwrap(), b"42");
        fs.rename("/deep/nested/f.bin", "/deep/g.bin").unwrap();
        assert!(fs.exists("/deep/g.bin"));
        assert_eq!(fs.file_size("/deep/g.bin").unwrap(), 2);
        fs.remove("/deep/g.bin").unwrap();
        assert!(!fs.exists("/deep/g.bin"));
    }

    #[test]
    fn rename_and_remove() {
        let mut fs = flash();
        fs.write_all("/a", b"x").unwrap();
        fs.rename("/a", "/b").unwrap();
        assert!(!fs.exists("/a"));
        assert_eq!(fs.read_all("/b").unwrap(), b"x");
        fs.remove("/b").unwrap();
        assert!(!fs.exists("/b"));
    }
}
