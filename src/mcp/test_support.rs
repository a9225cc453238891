//! In-memory MCP server doubles shared by the manager and service tests.

use super::client::{Handshake, McpClient, McpConnector, Page, ServerNotice};
use super::connection::{Capabilities, ServerInfo};
use crate::config::McpServerConfig;
use crate::error::{Error, Result};
use crate::mcp::protocol::MCP_METHOD_NOT_FOUND;
use async_trait::async_trait;
use rust_mcp_schema::{CallToolResult, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub fn tool(name: &str) -> Tool {
    serde_json::from_value(json!({
        "name": name,
        "inputSchema": {"type": "object"}
    }))
    .expect("tool")
}

pub fn prompt(name: &str) -> Prompt {
    serde_json::from_value(json!({"name": name})).expect("prompt")
}

pub fn resource(uri: &str) -> Resource {
    serde_json::from_value(json!({"uri": uri, "name": uri})).expect("resource")
}

pub fn all_capabilities() -> Capabilities {
    Capabilities {
        tools: true,
        tools_list_changed: true,
        prompts: true,
        prompts_list_changed: true,
        resources: true,
        resources_list_changed: true,
    }
}

#[derive(Clone, Default)]
pub struct Catalog {
    pub tools: Vec<Tool>,
    pub prompts: Vec<Prompt>,
    pub resources: Vec<Resource>,
}

/// Serves a mutable catalog one item per page.
pub struct FakeClient {
    catalog: Mutex<Catalog>,
    /// Page size; `0` means everything on one page.
    pub page_size: AtomicUsize,
    /// Always hands out another cursor.
    pub endless: AtomicBool,
    /// List calls fail with a transport error.
    pub failing: AtomicBool,
    unsupported: Mutex<HashSet<&'static str>>,
    stalls: Mutex<HashMap<&'static str, usize>>,
    pub release: Notify,
    list_calls: Mutex<HashMap<&'static str, usize>>,
    pub tool_calls: Mutex<Vec<(String, Option<Map<String, Value>>)>>,
    notices: broadcast::Sender<ServerNotice>,
    closed: CancellationToken,
    pub close_calls: AtomicUsize,
}

impl FakeClient {
    pub fn new(catalog: Catalog) -> Arc<Self> {
        Arc::new(Self {
            catalog: Mutex::new(catalog),
            page_size: AtomicUsize::new(0),
            endless: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            unsupported: Mutex::new(HashSet::new()),
            stalls: Mutex::new(HashMap::new()),
            release: Notify::new(),
            list_calls: Mutex::new(HashMap::new()),
            tool_calls: Mutex::new(Vec::new()),
            notices: broadcast::channel(16).0,
            closed: CancellationToken::new(),
            close_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_catalog(&self, catalog: Catalog) {
        *self.catalog.lock().unwrap() = catalog;
    }

    /// The next `count` calls of `method` block until
    /// [`FakeClient::release`] is notified and then answer with the catalog
    /// as it was when they began.
    pub fn stall(&self, method: &'static str, count: usize) {
        self.stalls.lock().unwrap().insert(method, count);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.list_calls
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    pub fn unsupported(&self, method: &'static str) {
        self.unsupported.lock().unwrap().insert(method);
    }

    pub fn announce(&self, notice: ServerNotice) {
        let _ = self.notices.send(notice);
    }

    /// Simulates the server going away without a local close.
    pub fn drop_transport(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn page<T: Clone>(
        &self,
        method: &'static str,
        select: impl Fn(&Catalog) -> Vec<T>,
        cursor: Option<String>,
    ) -> Result<Page<T>> {
        *self.list_calls.lock().unwrap().entry(method).or_default() += 1;
        if self.unsupported.lock().unwrap().contains(method) {
            return Err(Error::Rpc {
                code: MCP_METHOD_NOT_FOUND,
                message: "Method not found".to_string(),
            });
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::transport("listing failed"));
        }
        let items = select(&self.catalog.lock().unwrap());
        let stalled = match self.stalls.lock().unwrap().get_mut(method) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if stalled {
            self.release.notified().await;
        }

        let start: usize = cursor.as_deref().map_or(0, |c| c.parse().unwrap_or(0));
        if self.endless.load(Ordering::SeqCst) {
            return Ok(Page {
                items: items.into_iter().take(1).collect(),
                next_cursor: Some((start + 1).to_string()),
            });
        }
        let size = match self.page_size.load(Ordering::SeqCst) {
            0 => items.len().max(1),
            size => size,
        };
        let end = (start + size).min(items.len());
        let next_cursor = (end < items.len()).then(|| end.to_string());
        Ok(Page {
            items: items.get(start..end).map(<[T]>::to_vec).unwrap_or_default(),
            next_cursor,
        })
    }
}

#[async_trait]
impl McpClient for FakeClient {
    async fn list_tools(
        &self,
        cursor: Option<String>,
        _cancel: &CancellationToken,
    ) -> Result<Page<Tool>> {
        self.page("tools/list", |c| c.tools.clone(), cursor).await
    }

    async fn list_prompts(
        &self,
        cursor: Option<String>,
        _cancel: &CancellationToken,
    ) -> Result<Page<Prompt>> {
        self.page("prompts/list", |c| c.prompts.clone(), cursor)
            .await
    }

    async fn list_resources(
        &self,
        cursor: Option<String>,
        _cancel: &CancellationToken,
    ) -> Result<Page<Resource>> {
        self.page("resources/list", |c| c.resources.clone(), cursor)
            .await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        _cancel: &CancellationToken,
    ) -> Result<CallToolResult> {
        self.tool_calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments));
        Ok(serde_json::from_value(json!({
            "content": [{"type": "text", "text": format!("ran {name}")}]
        }))?)
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
        _cancel: &CancellationToken,
    ) -> Result<GetPromptResult> {
        let topic = arguments.get("topic").cloned().unwrap_or_default();
        Ok(serde_json::from_value(json!({
            "description": name,
            "messages": [{"role": "user", "content": {"type": "text", "text": topic}}]
        }))?)
    }

    async fn read_resource(
        &self,
        uri: &str,
        _cancel: &CancellationToken,
    ) -> Result<ReadResourceResult> {
        Ok(serde_json::from_value(json!({
            "contents": [{"uri": uri, "text": "contents"}]
        }))?)
    }

    fn notices(&self) -> broadcast::Receiver<ServerNotice> {
        self.notices.subscribe()
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }
}

type Setup = Box<dyn Fn(&FakeClient) + Send + Sync>;

/// Hands out a fresh [`FakeClient`] per successful handshake.
pub struct FakeConnector {
    setup: Mutex<Option<Setup>>,
    pub catalog: Mutex<Catalog>,
    pub capabilities: Mutex<Capabilities>,
    failing: Mutex<HashSet<Uuid>>,
    hanging: Mutex<HashSet<Uuid>>,
    delay: Mutex<Option<Duration>>,
    pub connects: AtomicUsize,
    clients: Mutex<HashMap<Uuid, Arc<FakeClient>>>,
}

impl FakeConnector {
    pub fn new(catalog: Catalog) -> Arc<Self> {
        Arc::new(Self {
            setup: Mutex::new(None),
            catalog: Mutex::new(catalog),
            capabilities: Mutex::new(all_capabilities()),
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            delay: Mutex::new(None),
            connects: AtomicUsize::new(0),
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Runs `setup` on every client before its handshake completes.
    pub fn configure(&self, setup: impl Fn(&FakeClient) + Send + Sync + 'static) {
        *self.setup.lock().unwrap() = Some(Box::new(setup));
    }

    pub fn fail(&self, id: Uuid) {
        self.failing.lock().unwrap().insert(id);
    }

    pub fn heal(&self, id: Uuid) {
        self.failing.lock().unwrap().remove(&id);
        self.hanging.lock().unwrap().remove(&id);
    }

    /// Handshakes for `id` never complete.
    pub fn hang(&self, id: Uuid) {
        self.hanging.lock().unwrap().insert(id);
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Client handed out by the latest successful handshake for `id`.
    pub fn client(&self, id: Uuid) -> Arc<FakeClient> {
        self.clients
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .expect("no client for server")
    }
}

#[async_trait]
impl McpConnector for FakeConnector {
    async fn connect(
        &self,
        config: &McpServerConfig,
        _cancel: &CancellationToken,
    ) -> Result<Handshake> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.hanging.lock().unwrap().contains(&config.id) {
            std::future::pending::<()>().await;
        }
        if self.failing.lock().unwrap().contains(&config.id) {
            return Err(Error::transport("connection refused"));
        }
        let client = FakeClient::new(self.catalog.lock().unwrap().clone());
        if let Some(setup) = self.setup.lock().unwrap().as_ref() {
            setup(&client);
        }
        self.clients
            .lock()
            .unwrap()
            .insert(config.id, client.clone());
        let capabilities = *self.capabilities.lock().unwrap();
        Ok(Handshake {
            client,
            capabilities,
            server_info: Some(ServerInfo {
                name: config.display_name.clone(),
                version: "1.0.0".to_string(),
                protocol_version: "2025-11-25".to_string(),
            }),
        })
    }
}

/// Polls `check` until it holds or a second elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
