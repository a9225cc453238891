//! Concrete MCP transports.
//!
//! Each transport only moves JSON-RPC messages; [`McpSession`] turns any of
//! them into an [`McpClient`] so the managers never see transport details.

use super::client::{Handshake, McpClient, McpConnector, Page, ServerNotice};
use super::connection::{Capabilities, ServerInfo};
use super::protocol;
use crate::config::McpServerConfig;
use crate::error::{Error, Result};
use crate::sync::run_cancellable;
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult,
    ListPromptsResult, ListResourcesResult, ListToolsResult, Prompt, ReadResourceRequestParams,
    ReadResourceResult, Resource, Tool,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod http;
pub mod sse;
pub mod stdio;

const NOTICE_CAPACITY: usize = 32;

/// Supported MCP transport backends.
///
/// - [`McpTransportKind::Stdio`] for locally spawned processes.
/// - [`McpTransportKind::StreamableHttp`] for remote servers over HTTP/SSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpTransportKind {
    StreamableHttp,
    Stdio,
}

impl McpTransportKind {
    /// Resolves transport type from config, defaulting to streamable HTTP.
    pub fn from_config(config: &McpServerConfig) -> Result<Self> {
        let transport = config
            .transport
            .as_deref()
            .unwrap_or("streamable-http")
            .to_ascii_lowercase();
        match transport.as_str() {
            "streamable-http" | "streamable_http" | "http" => Ok(McpTransportKind::StreamableHttp),
            "stdio" => Ok(McpTransportKind::Stdio),
            other => Err(Error::Config(format!("Unsupported MCP transport: {other}"))),
        }
    }
}

/// Moves JSON-RPC messages to and from one server.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage>;

    async fn notify(&self, notification: NotificationFromClient) -> Result<()>;

    fn notices(&self) -> broadcast::Receiver<ServerNotice>;

    async fn closed(&self);

    async fn close(&self);
}

pub(crate) fn notice_channel() -> broadcast::Sender<ServerNotice> {
    broadcast::channel(NOTICE_CAPACITY).0
}

/// [`McpClient`] over any [`RpcTransport`].
pub struct McpSession<T> {
    transport: T,
}

impl<T: RpcTransport> McpSession<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Runs the initialize request and the initialized notification.
    pub async fn initialize(
        &self,
        config: &McpServerConfig,
    ) -> Result<rust_mcp_schema::InitializeResult> {
        let response = self
            .transport
            .request(RequestFromClient::InitializeRequest(
                protocol::client_details_for(config),
            ))
            .await?;
        let result = protocol::parse_initialize_result(response)?;
        self.transport
            .notify(NotificationFromClient::InitializedNotification(None))
            .await?;
        Ok(result)
    }

    async fn call<R: serde::de::DeserializeOwned>(
        &self,
        request: RequestFromClient,
        cancel: &CancellationToken,
    ) -> Result<R> {
        run_cancellable(Some(cancel), async {
            let response = self.transport.request(request).await?;
            protocol::parse_response(response)
        })
        .await
    }
}

#[async_trait]
impl<T: RpcTransport> McpClient for McpSession<T> {
    async fn list_tools(
        &self,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Page<Tool>> {
        let request = RequestFromClient::ListToolsRequest(protocol::paginated_params(cursor));
        let list: ListToolsResult = self.call(request, cancel).await?;
        Ok(Page {
            items: list.tools,
            next_cursor: list.next_cursor,
        })
    }

    async fn list_prompts(
        &self,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Page<Prompt>> {
        let request = RequestFromClient::ListPromptsRequest(protocol::paginated_params(cursor));
        let list: ListPromptsResult = self.call(request, cancel).await?;
        Ok(Page {
            items: list.prompts,
            next_cursor: list.next_cursor,
        })
    }

    async fn list_resources(
        &self,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Page<Resource>> {
        let request = RequestFromClient::ListResourcesRequest(protocol::paginated_params(cursor));
        let list: ListResourcesResult = self.call(request, cancel).await?;
        Ok(Page {
            items: list.resources,
            next_cursor: list.next_cursor,
        })
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult> {
        let mut params = CallToolRequestParams::new(name);
        if let Some(arguments) = arguments {
            params = params.with_arguments(arguments);
        }
        self.call(RequestFromClient::CallToolRequest(params), cancel)
            .await
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<GetPromptResult> {
        let params = GetPromptRequestParams {
            name: name.to_string(),
            arguments: (!arguments.is_empty()).then_some(arguments),
            meta: None,
        };
        self.call(RequestFromClient::GetPromptRequest(params), cancel)
            .await
    }

    async fn read_resource(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<ReadResourceResult> {
        let params = ReadResourceRequestParams {
            meta: None,
            uri: uri.to_string(),
        };
        self.call(RequestFromClient::ReadResourceRequest(params), cancel)
            .await
    }

    fn notices(&self) -> broadcast::Receiver<ServerNotice> {
        self.transport.notices()
    }

    async fn closed(&self) {
        self.transport.closed().await
    }

    async fn close(&self) {
        self.transport.close().await
    }
}

/// Production connector: picks the transport from config and runs the
/// initialize handshake.
#[derive(Clone)]
pub struct TransportConnector {
    http_client: reqwest::Client,
}

impl TransportConnector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http_client: http::build_mcp_http_client()?,
        })
    }
}

async fn negotiate<T: RpcTransport>(
    session: McpSession<T>,
    config: &McpServerConfig,
    cancel: &CancellationToken,
) -> Result<Handshake> {
    match run_cancellable(Some(cancel), session.initialize(config)).await {
        Ok(initialize) => {
            info!(
                server_id = %config.id,
                server = %initialize.server_info.name,
                protocol_version = %initialize.protocol_version,
                "MCP handshake complete"
            );
            Ok(Handshake {
                capabilities: Capabilities::from_initialize(&initialize),
                server_info: Some(ServerInfo::from_initialize(&initialize)),
                client: Arc::new(session),
            })
        }
        Err(err) => {
            session.close().await;
            Err(err)
        }
    }
}

#[async_trait]
impl McpConnector for TransportConnector {
    async fn connect(
        &self,
        config: &McpServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Handshake> {
        let kind = McpTransportKind::from_config(config)?;
        debug!(server_id = %config.id, transport = ?kind, "Opening MCP transport");
        match kind {
            McpTransportKind::Stdio => {
                let transport = stdio::StdioTransport::spawn(config)?;
                negotiate(McpSession::new(transport), config, cancel).await
            }
            McpTransportKind::StreamableHttp => {
                let transport = http::HttpTransport::new(self.http_client.clone(), config)?;
                let session = McpSession::new(transport.clone());
                let handshake = negotiate(session, config, cancel).await?;
                transport.spawn_listener();
                Ok(handshake)
            }
        }
    }
}
