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
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const STDIO_REQUEST_TIMEOUT_SECONDS: u64 = 60;
const STDIO_WRITE_TIMEOUT_SECONDS: u64 = 10;

type PendingReplies = HashMap<RequestId, oneshot::Sender<ServerMessage>>;
type PendingMap = Arc<StdMutex<PendingReplies>>;

fn require_stdio_command(config: &McpServerConfig) -> Result<String> {
    config
        .command
        .clone()
        .ok_or_else(|| Error::Config("MCP command is required for stdio transport.".to_string()))
}

struct StdioShared {
    server_id: Uuid,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    notices: broadcast::Sender<ServerNotice>,
    /// Fires once the child exits or its stdout closes.
    closed: CancellationToken,
    /// Fired by `close()`; asks the supervisor to kill the child.
    shutdown: CancellationToken,
}

impl StdioShared {
    async fn write_line(&self, payload: &str) -> Result<()> {
        let write_timeout = Duration::from_secs(STDIO_WRITE_TIMEOUT_SECONDS);
        let mut stdin = tokio::time::timeout(write_timeout, self.stdin.lock())
            .await
            .map_err(|_| Error::transport("Timed out waiting for MCP stdio stdin lock."))?;
        let write = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        tokio::time::timeout(write_timeout, write)
            .await
            .map_err(|_| Error::transport("Timed out writing MCP stdio message."))?
            .map_err(|err| Error::transport(err.to_string()))
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingReplies> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn dispatch(&self, value: Value) {
        match protocol::classify(&value) {
            Incoming::Notification { method } => {
                debug!(server_id = %self.server_id, method = %method, "Received MCP stdio notification");
                if let Some(notice) = ServerNotice::from_method(method) {
                    let _ = self.notices.send(notice);
                }
            }
            Incoming::Request { id, method } => {
                debug!(server_id = %self.server_id, method = %method, "Answering MCP stdio server request");
                let reply = protocol::reply_to_server_request(id, method).to_string();
                if let Err(err) = self.write_line(&reply).await {
                    warn!(server_id = %self.server_id, error = %err, "Failed to answer MCP server request");
                }
            }
            Incoming::Reply => match serde_json::from_value::<ServerMessage>(value) {
                Ok(ServerMessage::Response(response)) => {
                    if let Some(tx) = self.lock_pending().remove(&response.id) {
                        let _ = tx.send(ServerMessage::Response(response));
                    }
                }
                Ok(ServerMessage::Error(error)) => {
                    debug!(
                        server_id = %self.server_id,
                        error_id = ?error.id,
                        error_code = error.error.code,
                        "Received MCP stdio error"
                    );
                    let sender = error.id.as_ref().and_then(|id| self.lock_pending().remove(id));
                    if let Some(tx) = sender {
                        let _ = tx.send(ServerMessage::Error(error));
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(server_id = %self.server_id, error = %err, "Skipping undecodable MCP stdio message")
                }
            },
        }
    }
}

/// Newline-delimited JSON-RPC over a spawned server's stdin/stdout.
pub struct StdioTransport {
    shared: Arc<StdioShared>,
    next_request_id: AtomicI64,
}

impl StdioTransport {
    pub fn spawn(config: &McpServerConfig) -> Result<Self> {
        let command = require_stdio_command(config)?;
        let args = config.args.clone().unwrap_or_default();
        debug!(server_id = %config.id, command = %command, args = ?args, "Starting MCP stdio server");
        let mut cmd = Command::new(&command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = &config.env {
            cmd.envs(env);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| Error::transport(format!("Failed to start {command}: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::transport("Unable to retrieve stdin."))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport("Unable to retrieve stdout."))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::transport("Unable to retrieve stderr."))?;

        let shared = Arc::new(StdioShared {
            server_id: config.id,
            stdin: Mutex::new(stdin),
            pending: Arc::default(),
            notices: notice_channel(),
            closed: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        });

        Self::spawn_stdout_reader(shared.clone(), stdout);
        Self::spawn_stderr_drain(config.id, stderr);
        Self::spawn_supervisor(shared.clone(), child);

        Ok(Self {
            shared,
            next_request_id: AtomicI64::new(0),
        })
    }

    fn spawn_stdout_reader(shared: Arc<StdioShared>, stdout: ChildStdout) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let value = match serde_json::from_str::<Value>(&line) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                match value {
                    Value::Array(items) => {
                        for item in items {
                            shared.dispatch(item).await;
                        }
                    }
                    value => shared.dispatch(value).await,
                }
            }
            debug!(server_id = %shared.server_id, "MCP stdio stdout closed");
            shared.lock_pending().clear();
            shared.closed.cancel();
        });
    }

    fn spawn_stderr_drain(server_id: Uuid, stderr: tokio::process::ChildStderr) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(server_id = %server_id, line = %line, "MCP stdio stderr");
            }
        });
    }

    fn spawn_supervisor(shared: Arc<StdioShared>, mut child: Child) {
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!(server_id = %shared.server_id, status = ?status, "MCP stdio server exited");
                }
                _ = shared.shutdown.cancelled() => {
                    if let Err(err) = child.kill().await {
                        warn!(server_id = %shared.server_id, error = %err, "Failed to stop MCP stdio server");
                    }
                }
            }
            shared.lock_pending().clear();
            shared.closed.cancel();
        });
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }
}

// A transport dropped mid-handshake never sees `close()`; the child must not
// outlive it.
impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[async_trait]
impl RpcTransport for StdioTransport {
    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage> {
        if self.shared.closed.is_cancelled() {
            return Err(Error::transport("MCP stdio server is not running."));
        }
        let request_id = self.next_request_id();
        debug!(server_id = %self.shared.server_id, request_id = ?request_id, "Sending MCP stdio request");
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| Error::transport(err.to_string()))?;
        let payload =
            serde_json::to_string(&message).map_err(|err| Error::transport(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.lock_pending().insert(request_id.clone(), tx);
        // Dropping this future (cancellation) must not leak the pending slot.
        struct PendingSlot<'a> {
            shared: &'a StdioShared,
            id: RequestId,
        }
        impl Drop for PendingSlot<'_> {
            fn drop(&mut self) {
                self.shared.lock_pending().remove(&self.id);
            }
        }
        let _slot = PendingSlot {
            shared: &self.shared,
            id: request_id.clone(),
        };

        self.shared.write_line(&payload).await?;

        let timeout = Duration::from_secs(STDIO_REQUEST_TIMEOUT_SECONDS);
        tokio::select! {
            result = rx => result.map_err(|_| Error::transport("MCP stdio server closed the connection.")),
            _ = tokio::time::sleep(timeout) => {
                debug!(server_id = %self.shared.server_id, request_id = ?request_id, "MCP stdio request timed out");
                Err(Error::transport("MCP stdio request timed out."))
            }
        }
    }

    async fn notify(&self, notification: NotificationFromClient) -> Result<()> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| Error::transport(err.to_string()))?;
        let payload =
            serde_json::to_string(&message).map_err(|err| Error::transport(err.to_string()))?;
        self.shared.write_line(&payload).await
    }

    fn notices(&self) -> broadcast::Receiver<ServerNotice> {
        self.shared.notices.subscribe()
    }

    async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    async fn close(&self) {
        self.shared.shutdown.cancel();
        self.shared.closed.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_requires_command() {
        let mut config = McpServerConfig::stdio("Files", "mcp-files", &[]);
        config.command = None;
        assert!(matches!(
            require_stdio_command(&config),
            Err(Error::Config(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_server_reports_closed() {
        let config = McpServerConfig::stdio("Short", "sh", &["-c", "exit 0"]);
        let transport = StdioTransport::spawn(&config).expect("spawn sh");
        tokio::time::timeout(Duration::from_secs(5), transport.closed())
            .await
            .expect("closed after exit");
        let err = transport
            .request(RequestFromClient::PingRequest(None))
            .await
            .expect_err("server gone");
        assert!(matches!(err, Error::Transport(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_kills_running_server() {
        let config = McpServerConfig::stdio("Sleeper", "sh", &["-c", "sleep 30"]);
        let transport = StdioTransport::spawn(&config).expect("spawn sh");
        tokio::time::timeout(Duration::from_secs(5), transport.close())
            .await
            .expect("close resolves");
        transport.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropping_transport_stops_server() {
        let config = McpServerConfig::stdio("Sleeper", "sh", &["-c", "sleep 30"]);
        let transport = StdioTransport::spawn(&config).expect("spawn sh");
        let shared = transport.shared.clone();
        drop(transport);
        tokio::time::timeout(Duration::from_secs(5), shared.closed.cancelled())
            .await
            .expect("server stopped after drop");
    }
}
