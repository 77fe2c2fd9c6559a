//! URI based device factory
//!
//! Supported schemes:
//!
//! - `malloc:///<name>?size_mb=<n>&blk_size=<b>` thin memory device. The
//!   factory keeps a registry, so creating the same name twice returns the
//!   same backing store.
//! - `file:///<path>?blk_size=<b>&size_mb=<n>` flat file device. `size_mb`
//!   is optional for existing files.

use crate::device::BlockDevice;
use crate::error::{DeviceError, DeviceResult};
use crate::file::FileDevice;
use crate::memory::MemoryDevice;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use url::Url;

const DEFAULT_BLOCK_SIZE: u32 = 512;
const DEFAULT_MALLOC_SIZE_MB: u64 = 64;
const MIB: u64 = 1024 * 1024;

/// Resolves backend addresses into devices
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    /// Create (or look up) the device behind `uri`
    async fn create(&self, uri: &str) -> DeviceResult<Arc<dyn BlockDevice>>;

    /// Release the device behind `uri`
    async fn destroy(&self, uri: &str) -> DeviceResult<()>;
}

/// Factory for the `malloc` and `file` schemes
#[derive(Default)]
pub struct UriDeviceFactory {
    memory: Mutex<HashMap<String, MemoryDevice>>,
}

struct ParsedUri {
    scheme: String,
    path: String,
    /// Requested size in bytes, from `size_mb`
    size: Option<u64>,
    block_size: u32,
}

fn parse_uri(uri: &str) -> DeviceResult<ParsedUri> {
    let invalid = |reason: String| DeviceError::InvalidUri {
        uri: uri.to_string(),
        reason,
    };
    let url = Url::parse(uri).map_err(|e| invalid(e.to_string()))?;

    let mut size = None;
    let mut block_size = DEFAULT_BLOCK_SIZE;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "size_mb" => {
                let mb: u64 = value
                    .parse()
                    .map_err(|_| invalid(format!("bad size_mb '{value}'")))?;
                size = Some(
                    mb.checked_mul(MIB)
                        .ok_or_else(|| invalid(format!("size_mb {mb} is too large")))?,
                );
            }
            "blk_size" => {
                block_size = value
                    .parse()
                    .map_err(|_| invalid(format!("bad blk_size '{value}'")))?;
            }
            // Identity hints are opaque to the factory
            "uuid" => {}
            other => return Err(invalid(format!("unknown parameter '{other}'"))),
        }
    }
    if block_size == 0 || !block_size.is_power_of_two() {
        return Err(invalid(format!(
            "blk_size {block_size} is not a power of two"
        )));
    }

    let path = url.path().to_string();
    if path.len() <= 1 {
        return Err(invalid("missing device path".to_string()));
    }
    Ok(ParsedUri {
        scheme: url.scheme().to_string(),
        path,
        size,
        block_size,
    })
}

impl UriDeviceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a memory device created through this factory
    pub fn memory_device(&self, name: &str) -> Option<MemoryDevice> {
        self.memory.lock().get(name).cloned()
    }
}

#[async_trait]
impl DeviceFactory for UriDeviceFactory {
    async fn create(&self, uri: &str) -> DeviceResult<Arc<dyn BlockDevice>> {
        let parsed = parse_uri(uri)?;
        match parsed.scheme.as_str() {
            "malloc" => {
                let name = parsed.path.trim_start_matches('/').to_string();
                let size = parsed.size.unwrap_or(DEFAULT_MALLOC_SIZE_MB * MIB);
                let mut memory = self.memory.lock();
                let device = memory
                    .entry(name.clone())
                    .or_insert_with(|| {
                        info!("Creating memory device {} ({} bytes)", name, size);
                        MemoryDevice::new(name.clone(), size, parsed.block_size)
                    })
                    .clone();
                Ok(Arc::new(device))
            }
            "file" => {
                let size = parsed.size;
                let path = parsed.path;
                let block_size = parsed.block_size;
                let device = tokio::task::spawn_blocking(move || {
                    FileDevice::create(path, size, block_size)
                })
                .await
                .map_err(|e| DeviceError::OpenFailed {
                    device: uri.to_string(),
                    reason: e.to_string(),
                })??;
                Ok(Arc::new(device))
            }
            other => Err(DeviceError::InvalidUri {
                uri: uri.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            }),
        }
    }

    async fn destroy(&self, uri: &str) -> DeviceResult<()> {
        let parsed = parse_uri(uri)?;
        if parsed.scheme == "malloc" {
            let name = parsed.path.trim_start_matches('/');
            if self.memory.lock().remove(name).is_none() {
                return Err(DeviceError::NotFound(uri.to_string()));
            }
            info!("Destroyed memory device {}", name);
        }
        // File devices leave their backing file in place
        Ok(())
    }
}
