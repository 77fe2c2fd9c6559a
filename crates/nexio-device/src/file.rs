//! Flat file backed device
//!
//! A thick device: every block is backed by the file, so unallocated ranges
//! cannot be told apart from zeroes and reads always return data. No
//! reservation or snapshot support.

use crate::device::{
    BlockDevice, DeviceCapabilities, DeviceEvent, DeviceGeometry, DeviceHandle, ReadMode,
    ReadOutcome,
};
use crate::error::{DeviceError, DeviceResult};
use crate::stats::{IoStats, IoStatsSnapshot, IoType};

use async_trait::async_trait;
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task;
use tracing::debug;

/// Largest zero buffer written per `write_zeroes` chunk
const ZERO_CHUNK: u64 = 1024 * 1024;

/// Device backed by a regular file
pub struct FileDevice {
    name: String,
    path: PathBuf,
    geometry: DeviceGeometry,
    events: broadcast::Sender<DeviceEvent>,
    stats: Arc<IoStats>,
}

impl FileDevice {
    /// Open (creating and sizing if needed) the file at `path`.
    ///
    /// With `size_bytes = None` the existing file length is used.
    pub fn create(
        path: impl AsRef<Path>,
        size_bytes: Option<u64>,
        block_size: u32,
    ) -> DeviceResult<Self> {
        let path = path.as_ref().to_path_buf();
        let name = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| DeviceError::OpenFailed {
                device: name.clone(),
                reason: e.to_string(),
            })?;

        let current = file
            .metadata()
            .map_err(|e| DeviceError::io(&name, e.to_string()))?
            .len();
        let size = match size_bytes {
            Some(size) if size != current => {
                file.set_len(size)
                    .map_err(|e| DeviceError::io(&name, e.to_string()))?;
                size
            }
            Some(size) => size,
            None => current,
        };
        if size < u64::from(block_size) {
            return Err(DeviceError::OpenFailed {
                device: name,
                reason: format!("file is smaller than one {block_size} byte block"),
            });
        }

        let geometry = DeviceGeometry::new(block_size, size / u64::from(block_size));
        debug!("File device {}: {} blocks", name, geometry.num_blocks);
        let (events, _) = broadcast::channel(4);
        Ok(Self {
            name,
            path,
            geometry,
            events,
            stats: Arc::new(IoStats::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BlockDevice for FileDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn capabilities(&self) -> DeviceCapabilities {
        FILE_CAPABILITIES
    }

    async fn open(&self, read_write: bool) -> DeviceResult<Arc<dyn DeviceHandle>> {
        let path = self.path.clone();
        let name = self.name.clone();
        let file = task::spawn_blocking(move || {
            OpenOptions::new().read(true).write(read_write).open(path)
        })
        .await
        .map_err(|e| DeviceError::OpenFailed {
            device: name.clone(),
            reason: e.to_string(),
        })?
        .map_err(|e| DeviceError::OpenFailed {
            device: name.clone(),
            reason: e.to_string(),
        })?;

        Ok(Arc::new(FileHandle {
            name,
            file: Arc::new(file),
            geometry: self.geometry,
            read_write,
            stats: Arc::clone(&self.stats),
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

const FILE_CAPABILITIES: DeviceCapabilities = DeviceCapabilities {
    unmap: false,
    write_zeroes: true,
    reservations: false,
    reports_unwritten: false,
    snapshots: false,
};

struct FileHandle {
    name: String,
    file: Arc<File>,
    geometry: DeviceGeometry,
    read_write: bool,
    stats: Arc<IoStats>,
}

impl FileHandle {
    fn check(&self, offset: u64, length: u64, write: bool) -> DeviceResult<()> {
        if write && !self.read_write {
            return Err(DeviceError::ReadOnly(self.name.clone()));
        }
        self.geometry.check_io(offset, length)
    }

    /// Run a blocking file operation on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> DeviceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> std::io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        let result = task::spawn_blocking(move || op(&file))
            .await
            .map_err(|e| DeviceError::io(&self.name, e.to_string()))?;
        result.map_err(|e| {
            self.stats.record_error();
            DeviceError::io(&self.name, e.to_string())
        })
    }
}

#[async_trait]
impl DeviceHandle for FileHandle {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn capabilities(&self) -> DeviceCapabilities {
        FILE_CAPABILITIES
    }

    async fn read(&self, offset: u64, length: u64, _mode: ReadMode) -> DeviceResult<ReadOutcome> {
        let started = Instant::now();
        self.check(offset, length, false)?;
        let data = self
            .blocking(move |file| {
                let mut buf = vec![0u8; length as usize];
                file.read_exact_at(&mut buf, offset)?;
                Ok(buf)
            })
            .await?;
        self.stats.record(IoType::Read, length, started);
        Ok(ReadOutcome::Data(Bytes::from(data)))
    }

    async fn write(&self, offset: u64, data: Bytes) -> DeviceResult<()> {
        let started = Instant::now();
        let length = data.len() as u64;
        self.check(offset, length, true)?;
        self.blocking(move |file| file.write_all_at(&data, offset))
            .await?;
        self.stats.record(IoType::Write, length, started);
        Ok(())
    }

    async fn unmap(&self, _offset: u64, _length: u64) -> DeviceResult<()> {
        Err(self.unsupported("unmap"))
    }

    async fn write_zeroes(&self, offset: u64, length: u64) -> DeviceResult<()> {
        let started = Instant::now();
        self.check(offset, length, true)?;
        self.blocking(move |file| {
            let zeroes = vec![0u8; length.min(ZERO_CHUNK) as usize];
            let mut written = 0;
            while written < length {
                let chunk = (length - written).min(ZERO_CHUNK) as usize;
                file.write_all_at(&zeroes[..chunk], offset + written)?;
                written += chunk as u64;
            }
            Ok(())
        })
        .await?;
        self.stats.record(IoType::WriteZeroes, length, started);
        Ok(())
    }

    async fn flush(&self) -> DeviceResult<()> {
        let started = Instant::now();
        if !self.read_write {
            return Err(DeviceError::ReadOnly(self.name.clone()));
        }
        self.blocking(File::sync_data).await?;
        self.stats.record(IoType::Flush, 0, started);
        Ok(())
    }

    fn stats(&self) -> IoStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[tokio::test]
    async fn test_file_device_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::create(dir.path().join("disk0"), Some(1024 * 1024), 512).unwrap();
        assert_eq!(BlockDevice::geometry(&device).num_blocks, 2048);

        let handle = device.open(true).await.unwrap();
        let mut payload = vec![0u8; 8192];
        rand::thread_rng().fill_bytes(&mut payload);
        handle
            .write(65536, Bytes::from(payload.clone()))
            .await
            .unwrap();
        handle.flush().await.unwrap();

        let data = handle
            .read(65536, 8192, ReadMode::UnwrittenAsStatus)
            .await
            .unwrap();
        // Thick device never reports unwritten
        assert_eq!(data, ReadOutcome::Data(Bytes::from(payload)));

        handle.write_zeroes(65536, 4096).await.unwrap();
        let data = handle
            .read(65536, 4096, ReadMode::Normal)
            .await
            .unwrap()
            .into_bytes(4096);
        assert!(data.iter().all(|&b| b == 0));
        assert_eq!(handle.stats().write_ops, 1);
    }

    #[tokio::test]
    async fn test_file_device_reopen_keeps_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk1");
        FileDevice::create(&path, Some(64 * 1024), 4096).unwrap();
        let device = FileDevice::create(&path, None, 4096).unwrap();
        assert_eq!(BlockDevice::geometry(&device).size_bytes(), 64 * 1024);
    }

    #[tokio::test]
    async fn test_file_device_rejects_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::create(dir.path().join("disk2"), Some(64 * 1024), 512).unwrap();
        let handle = device.open(true).await.unwrap();
        assert!(matches!(
            handle.unmap(0, 512).await,
            Err(DeviceError::Unsupported { .. })
        ));
        assert!(matches!(
            handle.reservation_register(1).await,
            Err(DeviceError::Unsupported { .. })
        ));
        assert!(matches!(
            handle.read(0, 100, ReadMode::Normal).await,
            Err(DeviceError::Misaligned { .. })
        ));
    }
}
