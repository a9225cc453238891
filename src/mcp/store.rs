//! Persisted MCP server configurations.

use crate::config::{ConfigOrchestrator, McpServerConfig};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn list(&self) -> Result<Vec<McpServerConfig>>;

    async fn get(&self, id: Uuid) -> Result<Option<McpServerConfig>>;

    /// Inserts or replaces the configuration with the same id.
    async fn put(&self, config: McpServerConfig) -> Result<()>;

    /// Returns whether an entry was removed.
    async fn remove(&self, id: Uuid) -> Result<bool>;
}

/// Stores servers in the `[[mcp_servers]]` section of the config file.
pub struct ConfigServerStore {
    orchestrator: Arc<ConfigOrchestrator>,
}

impl ConfigServerStore {
    pub fn new(orchestrator: Arc<ConfigOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ServerStore for ConfigServerStore {
    async fn list(&self) -> Result<Vec<McpServerConfig>> {
        Ok(self.orchestrator.load_with_cache()?.mcp_servers)
    }

    async fn get(&self, id: Uuid) -> Result<Option<McpServerConfig>> {
        Ok(self.orchestrator.load_with_cache()?.server(id).cloned())
    }

    async fn put(&self, config: McpServerConfig) -> Result<()> {
        self.orchestrator.mutate(|current| {
            current.upsert_server(config);
            Ok(())
        })
    }

    async fn remove(&self, id: Uuid) -> Result<bool> {
        self.orchestrator
            .mutate(|current| Ok(current.remove_server(id)))
    }
}

/// Process-local store, used when no config file is wanted.
#[derive(Default)]
pub struct MemoryServerStore {
    servers: Mutex<BTreeMap<Uuid, McpServerConfig>>,
}

impl MemoryServerStore {
    pub fn new(servers: impl IntoIterator<Item = McpServerConfig>) -> Self {
        Self {
            servers: Mutex::new(servers.into_iter().map(|s| (s.id, s)).collect()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Uuid, McpServerConfig>> {
        self.servers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ServerStore for MemoryServerStore {
    async fn list(&self) -> Result<Vec<McpServerConfig>> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<McpServerConfig>> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn put(&self, config: McpServerConfig) -> Result<()> {
        self.lock().insert(config.id, config);
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<bool> {
        Ok(self.lock().remove(&id).is_some())
    }
}
