//! Registry of the nexuses served by one process

use crate::error::{NexusError, NexusResult};
use crate::nexus::{Nexus, NexusInfo};

use nexio_common::NexusConfig;
use nexio_device::DeviceFactory;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Nexus registry
pub struct NexusManager {
    /// Resolves child URIs for every nexus
    factory: Arc<dyn DeviceFactory>,
    /// Nexuses by name
    nexuses: RwLock<HashMap<String, Arc<Nexus>>>,
}

impl NexusManager {
    pub fn new(factory: Arc<dyn DeviceFactory>) -> Self {
        Self {
            factory,
            nexuses: RwLock::new(HashMap::new()),
        }
    }

    pub fn factory(&self) -> Arc<dyn DeviceFactory> {
        Arc::clone(&self.factory)
    }

    /// Create and open a nexus
    pub async fn create_nexus(
        &self,
        name: &str,
        size_bytes: u64,
        children: &[String],
        config: NexusConfig,
    ) -> NexusResult<Arc<Nexus>> {
        // Check for duplicate name
        if self.nexuses.read().contains_key(name) {
            return Err(NexusError::NexusExists(name.to_string()));
        }

        let nexus = Nexus::create(
            name,
            size_bytes,
            children,
            config,
            Arc::clone(&self.factory),
        )
        .await?;

        // Lost a race with a concurrent create of the same name
        let raced = {
            let mut nexuses = self.nexuses.write();
            if nexuses.contains_key(name) {
                true
            } else {
                nexuses.insert(name.to_string(), Arc::clone(&nexus));
                false
            }
        };
        if raced {
            nexus.close().await?;
            return Err(NexusError::NexusExists(name.to_string()));
        }

        info!("Created nexus '{}' with {} children", name, children.len());
        Ok(nexus)
    }

    /// Get a nexus by name
    pub fn get(&self, name: &str) -> NexusResult<Arc<Nexus>> {
        self.nexuses
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NexusError::NexusNotFound(name.to_string()))
    }

    /// List all nexuses
    pub fn list(&self) -> Vec<NexusInfo> {
        let mut infos: Vec<_> = self.nexuses.read().values().map(|n| n.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Shut a nexus down and forget it
    pub async fn destroy_nexus(&self, name: &str) -> NexusResult<()> {
        let nexus = self
            .nexuses
            .write()
            .remove(name)
            .ok_or_else(|| NexusError::NexusNotFound(name.to_string()))?;
        nexus.shutdown().await?;
        info!("Destroyed nexus '{}'", name);
        Ok(())
    }

    /// Shut every nexus down
    pub async fn shutdown(&self) {
        let nexuses: Vec<_> = self.nexuses.write().drain().map(|(_, n)| n).collect();
        for nexus in nexuses {
            if let Err(e) = nexus.shutdown().await {
                tracing::warn!("{:?}: shutdown failed: {}", nexus, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexio_device::UriDeviceFactory;

    fn manager() -> NexusManager {
        NexusManager::new(Arc::new(UriDeviceFactory::new()))
    }

    fn config() -> NexusConfig {
        NexusConfig {
            io_channels: 1,
            reconnect_interval_ms: 0,
            ..NexusConfig::default()
        }
    }

    #[tokio::test]
    async fn test_create_nexus() {
        let manager = manager();
        let children = vec!["malloc:///m0?size_mb=2".to_string()];
        let nexus = manager
            .create_nexus("nexus-a", 1024 * 1024, &children, config())
            .await
            .unwrap();

        assert_eq!(nexus.name(), "nexus-a");
        assert!(Arc::ptr_eq(&manager.get("nexus-a").unwrap(), &nexus));
        assert_eq!(manager.list().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_nexus_name() {
        let manager = manager();
        let children = vec!["malloc:///m0?size_mb=2".to_string()];
        manager
            .create_nexus("nexus-a", 1024 * 1024, &children, config())
            .await
            .unwrap();

        let result = manager
            .create_nexus("nexus-a", 1024 * 1024, &children, config())
            .await;
        assert!(matches!(result, Err(NexusError::NexusExists(_))));
    }

    #[tokio::test]
    async fn test_destroy_nexus() {
        let manager = manager();
        let children = vec!["malloc:///m0?size_mb=2".to_string()];
        let nexus = manager
            .create_nexus("nexus-a", 1024 * 1024, &children, config())
            .await
            .unwrap();

        manager.destroy_nexus("nexus-a").await.unwrap();
        assert!(matches!(
            manager.get("nexus-a"),
            Err(NexusError::NexusNotFound(_))
        ));
        assert_eq!(nexus.state(), crate::nexus::NexusState::Shutdown);
        assert!(matches!(
            manager.destroy_nexus("nexus-a").await,
            Err(NexusError::NexusNotFound(_))
        ));
    }
}
