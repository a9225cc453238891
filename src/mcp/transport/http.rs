use super::sse::{drain_event_stream, is_event_stream_content_type};
use super::{notice_channel, RpcTransport};
use crate::config::McpServerConfig;
use crate::error::{Error, Result};
use crate::mcp::client::ServerNotice;
use crate::mcp::protocol::{self, Incoming};
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const MCP_JSON_CONTENT_TYPE: &str = "application/json";
const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const MCP_SESSION_HEADER: &str = "mcp-session-id";
const MCP_HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const MCP_HTTP_REQUEST_TIMEOUT_SECONDS: u64 = 60;
const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

pub fn build_mcp_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(MCP_HTTP_CONNECT_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| Error::transport(format!("Failed to build HTTP client: {err}")))
}

fn require_http_base_url(config: &McpServerConfig) -> Result<String> {
    config
        .base_url
        .clone()
        .ok_or_else(|| Error::Config("MCP base_url is required for HTTP transports.".to_string()))
}

fn apply_streamable_http_protocol_version_header(
    request: reqwest::RequestBuilder,
    protocol_version: Option<&str>,
) -> reqwest::RequestBuilder {
    match protocol_version {
        Some(protocol_version) if !protocol_version.trim().is_empty() => {
            request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version)
        }
        _ => request,
    }
}

#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    negotiated_protocol_version: Option<String>,
}

struct HttpShared {
    server_id: Uuid,
    client: reqwest::Client,
    base_url: String,
    headers: HashMap<String, String>,
    requested_protocol_version: String,
    session: Mutex<SessionState>,
    next_request_id: AtomicI64,
    notices: broadcast::Sender<ServerNotice>,
    closed: CancellationToken,
}

/// Streamable HTTP: one POST per message, replies as JSON or SSE, plus an
/// optional GET event stream for server-initiated notifications.
#[derive(Clone)]
pub struct HttpTransport {
    shared: Arc<HttpShared>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, config: &McpServerConfig) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(HttpShared {
                server_id: config.id,
                client,
                base_url: require_http_base_url(config)?,
                headers: config.headers.clone().unwrap_or_default(),
                requested_protocol_version: protocol::requested_protocol_version(config),
                session: Mutex::default(),
                next_request_id: AtomicI64::new(0),
                notices: notice_channel(),
                closed: CancellationToken::new(),
            }),
        })
    }

    fn session(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.shared
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn session_id(&self) -> Option<String> {
        self.session().session_id.clone()
    }

    fn effective_protocol_version(&self) -> String {
        match &self.session().negotiated_protocol_version {
            Some(version) if !version.trim().is_empty() => version.clone(),
            _ => self.shared.requested_protocol_version.clone(),
        }
    }

    fn decorate(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request = apply_streamable_http_protocol_version_header(
            request,
            Some(self.effective_protocol_version().as_str()),
        );
        for (name, value) in &self.shared.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(session_id) = self.session_id() {
            request = request.header(MCP_SESSION_HEADER, session_id);
        }
        request
    }

    fn remember_session(&self, response: &reqwest::Response) {
        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            self.session().session_id = Some(session_id.to_string());
        }
    }

    fn publish_notice(&self, method: &str) {
        debug!(server_id = %self.shared.server_id, method = %method, "Received MCP HTTP notification");
        if let Some(notice) = ServerNotice::from_method(method) {
            let _ = self.shared.notices.send(notice);
        }
    }

    async fn post(&self, message: &ClientMessage) -> Result<reqwest::Response> {
        let payload =
            serde_json::to_string(message).map_err(|err| Error::transport(err.to_string()))?;
        let request = self
            .decorate(self.shared.client.post(&self.shared.base_url))
            .header("Content-Type", MCP_JSON_CONTENT_TYPE)
            .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
            .timeout(Duration::from_secs(MCP_HTTP_REQUEST_TIMEOUT_SECONDS))
            .body(payload);
        let response = request
            .send()
            .await
            .map_err(|err| Error::transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::transport(format!("HTTP error: {}", response.status())));
        }
        self.remember_session(&response);
        Ok(response)
    }

    fn content_type(response: &reqwest::Response) -> String {
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string()
    }

    /// Opens the server's GET event stream and forwards list-changed
    /// notifications until the transport is closed.
    pub fn spawn_listener(&self) {
        let transport = self.clone();
        tokio::spawn(async move {
            let closed = transport.shared.closed.clone();
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = transport.listen() => {}
            }
        });
    }

    async fn listen(&self) {
        let request = self
            .decorate(self.shared.client.get(&self.shared.base_url))
            .header("Accept", "text/event-stream");
        let response = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(server_id = %self.shared.server_id, status = %response.status(), "MCP server offers no event stream");
                return;
            }
            Err(err) => {
                debug!(server_id = %self.shared.server_id, error = %err, "MCP event stream unavailable");
                return;
            }
        };
        if !is_event_stream_content_type(&Self::content_type(&response)) {
            return;
        }
        let outcome = drain_event_stream(response, |payload| {
            if let Incoming::Notification { method } = protocol::classify(&payload) {
                self.publish_notice(method);
            }
            false
        })
        .await;
        if let Err(err) = outcome {
            debug!(server_id = %self.shared.server_id, error = %err, "MCP event stream ended");
        }
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage> {
        if self.shared.closed.is_cancelled() {
            return Err(Error::transport("MCP HTTP session closed."));
        }
        let is_initialize = matches!(request, RequestFromClient::InitializeRequest(_));
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::SeqCst);
        debug!(server_id = %self.shared.server_id, request_id, url = %self.shared.base_url, "Sending MCP HTTP request");
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(RequestId::Integer(request_id)),
        )
        .map_err(|err| Error::transport(err.to_string()))?;

        let response = self.post(&message).await?;
        let reply = if is_event_stream_content_type(&Self::content_type(&response)) {
            let mut reply = None;
            drain_event_stream(response, |payload| match protocol::classify(&payload) {
                Incoming::Notification { method } => {
                    self.publish_notice(method);
                    false
                }
                Incoming::Request { method, .. } => {
                    warn!(server_id = %self.shared.server_id, method = %method, "Ignoring MCP server request on HTTP reply stream");
                    false
                }
                Incoming::Reply => {
                    reply = Some(payload);
                    true
                }
            })
            .await
            .map_err(Error::transport)?;
            reply.ok_or_else(|| Error::transport("Empty event-stream response."))?
        } else {
            response
                .json::<Value>()
                .await
                .map_err(|err| Error::transport(err.to_string()))?
        };

        if is_initialize {
            if let Some(version) = reply
                .pointer("/result/protocolVersion")
                .and_then(Value::as_str)
            {
                self.session().negotiated_protocol_version = Some(version.to_string());
            }
        }
        serde_json::from_value::<ServerMessage>(reply)
            .map_err(|err| Error::transport(err.to_string()))
    }

    async fn notify(&self, notification: NotificationFromClient) -> Result<()> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| Error::transport(err.to_string()))?;
        self.post(&message).await.map(|_| ())
    }

    fn notices(&self) -> broadcast::Receiver<ServerNotice> {
        self.shared.notices.subscribe()
    }

    async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    async fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        self.shared.closed.cancel();
        if self.session_id().is_some() {
            let request = self.decorate(self.shared.client.delete(&self.shared.base_url));
            if let Err(err) = request.send().await {
                debug!(server_id = %self.shared.server_id, error = %err, "MCP session teardown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpTransport {
        let mut config = McpServerConfig::http("Remote", "https://mcp.example.com/mcp");
        config.headers = Some(HashMap::from([(
            "Authorization".to_string(),
            "Bearer token".to_string(),
        )]));
        HttpTransport::new(reqwest::Client::new(), &config).expect("transport")
    }

    #[test]
    fn protocol_header_ignored_when_blank() {
        let client = reqwest::Client::new();
        let req = apply_streamable_http_protocol_version_header(
            client.post("https://example.com"),
            Some("  "),
        )
        .build()
        .unwrap();
        assert!(req.headers().get(MCP_PROTOCOL_VERSION_HEADER).is_none());
    }

    #[test]
    fn requests_carry_configured_headers_and_session() {
        let transport = transport();
        transport.session().session_id = Some("abc".to_string());
        transport.session().negotiated_protocol_version = Some("2025-06-18".to_string());
        let req = transport
            .decorate(reqwest::Client::new().post("https://mcp.example.com/mcp"))
            .build()
            .unwrap();
        assert_eq!(req.headers()["authorization"], "Bearer token");
        assert_eq!(req.headers()[MCP_SESSION_HEADER], "abc");
        assert_eq!(req.headers()[MCP_PROTOCOL_VERSION_HEADER], "2025-06-18");
    }

    #[test]
    fn http_requires_base_url() {
        let mut config = McpServerConfig::http("Remote", "https://mcp.example.com");
        config.base_url = None;
        assert!(matches!(
            HttpTransport::new(reqwest::Client::new(), &config),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn closed_transport_refuses_requests() {
        let transport = transport();
        transport.close().await;
        transport.closed().await;
        let err = transport
            .request(RequestFromClient::PingRequest(None))
            .await
            .expect_err("closed");
        assert!(matches!(err, Error::Transport(_)));
    }
}
