//! Transport-agnostic view of a connected MCP server.

use super::connection::{Capabilities, ServerInfo};
use crate::config::McpServerConfig;
use crate::error::Result;
use async_trait::async_trait;
use rust_mcp_schema::{CallToolResult, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// One page of a paginated list call.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Catalog change announced by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerNotice {
    ToolsChanged,
    PromptsChanged,
    ResourcesChanged,
}

impl ServerNotice {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "notifications/tools/list_changed" => Some(Self::ToolsChanged),
            "notifications/prompts/list_changed" => Some(Self::PromptsChanged),
            "notifications/resources/list_changed" => Some(Self::ResourcesChanged),
            _ => None,
        }
    }
}

/// Operations the capability managers need from a connected server.
///
/// Every call takes the caller's cancellation token; implementations stop
/// waiting for the server once it fires and return [`crate::Error::Aborted`].
#[async_trait]
pub trait McpClient: Send + Sync {
    async fn list_tools(
        &self,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Page<Tool>>;

    async fn list_prompts(
        &self,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Page<Prompt>>;

    async fn list_resources(
        &self,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Page<Resource>>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult>;

    async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<GetPromptResult>;

    async fn read_resource(&self, uri: &str, cancel: &CancellationToken)
        -> Result<ReadResourceResult>;

    /// List-changed announcements. Each call returns a fresh receiver.
    fn notices(&self) -> broadcast::Receiver<ServerNotice>;

    /// Resolves once the underlying transport has gone away.
    async fn closed(&self);

    /// Tears the transport down. Idempotent.
    async fn close(&self);
}

/// Outcome of a successful capability negotiation.
pub struct Handshake {
    pub client: Arc<dyn McpClient>,
    pub capabilities: Capabilities,
    pub server_info: Option<ServerInfo>,
}

/// Opens a transport to a configured server and negotiates capabilities.
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(
        &self,
        config: &McpServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Handshake>;
}
