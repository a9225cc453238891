//! Bridge services exposing the MCP managers to the UI process.
//!
//! `mcp.*` covers server configuration and connection lifecycle;
//! `tools.*`, `prompts.*` and `resources.*` serve the cached catalogs.

use crate::bridge::service::{decode_params, encode_value, projection_source};
use crate::bridge::{BridgeError, BridgeService, ErrorKind, Router, ValueSource};
use crate::config::McpServerConfig;
use crate::mcp::{
    CapabilityKind, CapabilityManager, ConnectionManager, Prompts, PromptsManager, Resources,
    ResourcesManager, Tools, ToolsManager,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Deserialize)]
struct ServerId {
    id: Uuid,
}

fn no_params(params: &Value) -> Result<(), BridgeError> {
    match params {
        Value::Null => Ok(()),
        Value::Object(map) if map.is_empty() => Ok(()),
        _ => Err(BridgeError::invalid_params("method takes no parameters")),
    }
}

/// `mcp.*`: server CRUD and activation.
pub struct McpService {
    manager: ConnectionManager,
}

impl McpService {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Activation runs in its own task so that it outlives the call; if the
    /// call is cancelled first the server is deactivated, which aborts the
    /// handshake.
    async fn activate(&self, id: Uuid, cancel: CancellationToken) -> Result<Value, BridgeError> {
        let manager = self.manager.clone();
        let (done, outcome) = oneshot::channel();
        tokio::spawn(async move {
            let activation = manager.activate_server(id);
            tokio::pin!(activation);
            let result = tokio::select! {
                result = &mut activation => result,
                _ = cancel.cancelled() => {
                    debug!(server_id = %id, "Activation call cancelled");
                    match manager.deactivate_server(id).await {
                        Ok(()) => (&mut activation).await,
                        Err(err) => Err(err),
                    }
                }
            };
            let _ = done.send(result);
        });
        outcome
            .await
            .map_err(|_| BridgeError::new(ErrorKind::IllegalState, "activation task dropped"))??;
        Ok(Value::Null)
    }
}

#[async_trait]
impl BridgeService for McpService {
    async fn call(
        &self,
        method: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value, BridgeError> {
        match method {
            "list_servers" => {
                no_params(&params)?;
                encode_value(&self.manager.servers().await?)
            }
            "create_server" => {
                let config: McpServerConfig = decode_params(params)?;
                self.manager.create_server(config).await?;
                Ok(Value::Null)
            }
            "update_server" => {
                let config: McpServerConfig = decode_params(params)?;
                self.manager.update_server(config).await?;
                Ok(Value::Null)
            }
            "delete_server" => {
                let ServerId { id } = decode_params(params)?;
                encode_value(&self.manager.delete_server(id).await?)
            }
            "activate" => {
                let ServerId { id } = decode_params(params)?;
                self.activate(id, cancel).await
            }
            "deactivate" => {
                let ServerId { id } = decode_params(params)?;
                self.manager.deactivate_server(id).await?;
                Ok(Value::Null)
            }
            "activate_all" => {
                no_params(&params)?;
                self.manager.activate_all().await?;
                Ok(Value::Null)
            }
            "active" => {
                no_params(&params)?;
                encode_value(&self.manager.active_ids())
            }
            other => Err(BridgeError::unknown_method(other)),
        }
    }

    fn open_stream(&self, method: &str, params: Value) -> Result<ValueSource, BridgeError> {
        no_params(&params)?;
        match method {
            "connections" => Ok(projection_source(self.manager.connections())),
            "connections_raw" => Ok(projection_source(self.manager.watch_raw())),
            other => Err(BridgeError::unknown_method(other)),
        }
    }
}

/// Per-kind calls beyond listing.
pub trait CatalogService: CapabilityKind + Sized {
    fn call_kind<'a>(
        manager: &'a CapabilityManager<Self>,
        method: &'a str,
        params: Value,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Value, BridgeError>>;
}

#[derive(Deserialize)]
struct ToolCall {
    uri: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

#[derive(Serialize)]
struct AddressedTool {
    uri: String,
    tool: rust_mcp_schema::Tool,
}

impl CatalogService for Tools {
    fn call_kind<'a>(
        manager: &'a ToolsManager,
        method: &'a str,
        params: Value,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Value, BridgeError>> {
        Box::pin(async move {
            match method {
                "call_tool" => {
                    let ToolCall { uri, arguments } = decode_params(params)?;
                    encode_value(&manager.call_tool(&uri, arguments, cancel).await?)
                }
                "all" => {
                    no_params(&params)?;
                    let tools: Vec<AddressedTool> = manager
                        .tools()
                        .into_iter()
                        .map(|(uri, tool)| AddressedTool {
                            uri: uri.to_string(),
                            tool,
                        })
                        .collect();
                    encode_value(&tools)
                }
                other => Err(BridgeError::unknown_method(other)),
            }
        })
    }
}

#[derive(Deserialize)]
struct PromptRequest {
    id: Uuid,
    name: String,
    #[serde(default)]
    arguments: HashMap<String, String>,
}

impl CatalogService for Prompts {
    fn call_kind<'a>(
        manager: &'a PromptsManager,
        method: &'a str,
        params: Value,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Value, BridgeError>> {
        Box::pin(async move {
            match method {
                "get_prompt" => {
                    let PromptRequest {
                        id,
                        name,
                        arguments,
                    } = decode_params(params)?;
                    encode_value(&manager.get_prompt(id, &name, arguments, cancel).await?)
                }
                other => Err(BridgeError::unknown_method(other)),
            }
        })
    }
}

#[derive(Deserialize)]
struct ResourceRequest {
    id: Uuid,
    uri: String,
}

impl CatalogService for Resources {
    fn call_kind<'a>(
        manager: &'a ResourcesManager,
        method: &'a str,
        params: Value,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Value, BridgeError>> {
        Box::pin(async move {
            match method {
                "read_resource" => {
                    let ResourceRequest { id, uri } = decode_params(params)?;
                    encode_value(&manager.read_resource(id, &uri, cancel).await?)
                }
                other => Err(BridgeError::unknown_method(other)),
            }
        })
    }
}

/// `<kind>.*`: one catalog manager.
pub struct CapabilityService<K: CatalogService> {
    manager: CapabilityManager<K>,
}

impl<K: CatalogService> CapabilityService<K> {
    pub fn new(manager: CapabilityManager<K>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl<K: CatalogService> BridgeService for CapabilityService<K> {
    async fn call(
        &self,
        method: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value, BridgeError> {
        match method {
            "list" => {
                let ServerId { id } = decode_params(params)?;
                encode_value(&self.manager.list(id, &cancel).await?)
            }
            "refresh" => {
                let ServerId { id } = decode_params(params)?;
                self.manager.refresh(id)?;
                Ok(Value::Null)
            }
            "state" => {
                no_params(&params)?;
                encode_value(&*self.manager.state())
            }
            other => K::call_kind(&self.manager, other, params, &cancel).await,
        }
    }

    fn open_stream(&self, method: &str, params: Value) -> Result<ValueSource, BridgeError> {
        no_params(&params)?;
        match method {
            "state" => Ok(projection_source(self.manager.watch())),
            "state_raw" => Ok(projection_source(self.manager.watch_raw())),
            other => Err(BridgeError::unknown_method(other)),
        }
    }
}

/// The connection manager with its three catalog managers attached.
#[derive(Clone)]
pub struct Backend {
    pub connections: ConnectionManager,
    pub tools: ToolsManager,
    pub prompts: PromptsManager,
    pub resources: ResourcesManager,
}

impl Backend {
    pub fn new(connections: ConnectionManager) -> Self {
        Self {
            tools: CapabilityManager::new(&connections),
            prompts: CapabilityManager::new(&connections),
            resources: CapabilityManager::new(&connections),
            connections,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .register("mcp", Arc::new(McpService::new(self.connections.clone())))
            .register(
                Tools::NAME,
                Arc::new(CapabilityService::new(self.tools.clone())),
            )
            .register(
                Prompts::NAME,
                Arc::new(CapabilityService::new(self.prompts.clone())),
            )
            .register(
                Resources::NAME,
                Arc::new(CapabilityService::new(self.resources.clone())),
            )
    }
}

#[cfg(test)]
mod tests;
