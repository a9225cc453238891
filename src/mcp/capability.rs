//! Cached tool, prompt and resource catalogs per connection.
//!
//! A [`CapabilityManager`] follows the [`ConnectionManager`]'s events: a new
//! client with the capability advertised triggers a fetch (and, when the
//! server announces list changes, a listener that refetches); a client going
//! away cancels everything for that connection and drops its entry.
//!
//! Each fetch carries a generation number. Starting a fetch cancels the
//! previous one for the same connection, and only the newest generation may
//! commit its result.

use super::client::{McpClient, Page, ServerNotice};
use super::connection::Capabilities;
use super::manager::{ConnectionEvent, ConnectionManager};
use super::protocol;
use super::tool_uri::ToolUri;
use crate::config::McpPolicy;
use crate::error::{Error, Result};
use crate::state::{Projection, StateContainer, StateUpdate, Subscription};
use crate::sync::{deadline_token, run_cancellable};
use futures_util::future::BoxFuture;
use rust_mcp_schema::{
    CallToolResult, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// One catalog kind: how to detect it, page through it and bound it.
pub trait CapabilityKind: Send + Sync + 'static {
    type Item: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    const NAME: &'static str;
    const NOTICE: ServerNotice;

    fn advertised(capabilities: &Capabilities) -> bool;

    fn list_changed(capabilities: &Capabilities) -> bool;

    fn page_limit(policy: &McpPolicy) -> usize;

    fn fetch_page<'a>(
        client: &'a dyn McpClient,
        cursor: Option<String>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Page<Self::Item>>>;
}

pub struct Tools;
pub struct Prompts;
pub struct Resources;

impl CapabilityKind for Tools {
    type Item = Tool;

    const NAME: &'static str = "tools";
    const NOTICE: ServerNotice = ServerNotice::ToolsChanged;

    fn advertised(capabilities: &Capabilities) -> bool {
        capabilities.tools
    }

    fn list_changed(capabilities: &Capabilities) -> bool {
        capabilities.tools_list_changed
    }

    fn page_limit(policy: &McpPolicy) -> usize {
        policy.tools_page_limit
    }

    fn fetch_page<'a>(
        client: &'a dyn McpClient,
        cursor: Option<String>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Page<Tool>>> {
        client.list_tools(cursor, cancel)
    }
}

impl CapabilityKind for Prompts {
    type Item = Prompt;

    const NAME: &'static str = "prompts";
    const NOTICE: ServerNotice = ServerNotice::PromptsChanged;

    fn advertised(capabilities: &Capabilities) -> bool {
        capabilities.prompts
    }

    fn list_changed(capabilities: &Capabilities) -> bool {
        capabilities.prompts_list_changed
    }

    fn page_limit(policy: &McpPolicy) -> usize {
        policy.prompts_page_limit
    }

    fn fetch_page<'a>(
        client: &'a dyn McpClient,
        cursor: Option<String>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Page<Prompt>>> {
        client.list_prompts(cursor, cancel)
    }
}

impl CapabilityKind for Resources {
    type Item = Resource;

    const NAME: &'static str = "resources";
    const NOTICE: ServerNotice = ServerNotice::ResourcesChanged;

    fn advertised(capabilities: &Capabilities) -> bool {
        capabilities.resources
    }

    fn list_changed(capabilities: &Capabilities) -> bool {
        capabilities.resources_list_changed
    }

    fn page_limit(policy: &McpPolicy) -> usize {
        policy.resources_page_limit
    }

    fn fetch_page<'a>(
        client: &'a dyn McpClient,
        cursor: Option<String>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Page<Resource>>> {
        client.list_resources(cursor, cancel)
    }
}

/// Catalog state of one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Collection<T> {
    Loading,
    Loaded { items: Vec<T> },
    Error { message: String },
}

pub type Collections<T> = BTreeMap<Uuid, Collection<T>>;

struct InFlight {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    /// Cancel any fetch in flight and start over.
    Supersede,
    /// Join the fetch in flight, if there is one.
    Join,
}

struct Attached {
    client: Arc<dyn McpClient>,
    capabilities: Capabilities,
    listener: Option<CancellationToken>,
    request: Option<InFlight>,
}

impl Attached {
    fn shutdown(self) {
        if let Some(listener) = self.listener {
            listener.cancel();
        }
        if let Some(request) = self.request {
            request.cancel.cancel();
        }
    }
}

struct Inner<K: CapabilityKind> {
    collections: StateContainer<Collections<K::Item>>,
    attached: Mutex<HashMap<Uuid, Attached>>,
    policy: McpPolicy,
    next_generation: AtomicU64,
    events: Mutex<Option<Subscription>>,
    _kind: PhantomData<K>,
}

/// Catalog cache for one [`CapabilityKind`].
pub struct CapabilityManager<K: CapabilityKind> {
    inner: Arc<Inner<K>>,
}

impl<K: CapabilityKind> Clone for CapabilityManager<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub type ToolsManager = CapabilityManager<Tools>;
pub type PromptsManager = CapabilityManager<Prompts>;
pub type ResourcesManager = CapabilityManager<Resources>;

/// Pages through a catalog until the server stops handing out cursors or
/// `limit` pages have been read.
async fn fetch_all<K: CapabilityKind>(
    id: Uuid,
    client: &dyn McpClient,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<Vec<K::Item>> {
    let mut items = Vec::new();
    let mut cursor = None;
    let mut pages = 0;
    loop {
        if pages >= limit {
            error!(
                server_id = %id,
                kind = K::NAME,
                pages,
                "MCP server exceeded the page ceiling; keeping partial list"
            );
            break;
        }
        let page = match K::fetch_page(client, cursor.take(), cancel).await {
            Ok(page) => page,
            Err(err) if protocol::is_method_not_found(&err) => {
                debug!(server_id = %id, kind = K::NAME, "MCP server does not implement list");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };
        pages += 1;
        items.extend(page.items);
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => break,
        }
    }
    Ok(items)
}

impl<K: CapabilityKind> CapabilityManager<K> {
    /// Follows `connections` from now on, attaching to servers that are
    /// already connected.
    pub fn new(connections: &ConnectionManager) -> Self {
        let manager = Self {
            inner: Arc::new(Inner {
                collections: StateContainer::new(Collections::new()),
                attached: Mutex::new(HashMap::new()),
                policy: connections.policy().clone(),
                next_generation: AtomicU64::new(0),
                events: Mutex::new(None),
                _kind: PhantomData,
            }),
        };

        let weak = Arc::downgrade(&manager.inner);
        let subscription = connections.subscribe_events(move |event| {
            let Some(inner) = weak.upgrade() else { return };
            let manager = CapabilityManager { inner };
            match event {
                ConnectionEvent::Connected {
                    id,
                    client,
                    capabilities,
                } => manager.attach(*id, client.clone(), *capabilities),
                ConnectionEvent::Disconnected { id } => manager.detach(*id),
            }
        });
        *manager.lock_events() = Some(subscription);

        for (id, client, capabilities) in connections.connected() {
            manager.attach(id, client, capabilities);
        }
        manager
    }

    fn lock_attached(&self) -> MutexGuard<'_, HashMap<Uuid, Attached>> {
        self.inner
            .attached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_events(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> Arc<Collections<K::Item>> {
        self.inner.collections.state()
    }

    pub fn watch(&self) -> Projection<Collections<K::Item>> {
        self.inner.collections.project(Clone::clone)
    }

    pub fn watch_raw(&self) -> Projection<StateUpdate> {
        self.inner.collections.watch_raw()
    }

    pub fn is_attached(&self, id: Uuid) -> bool {
        self.lock_attached().contains_key(&id)
    }

    fn attach(&self, id: Uuid, client: Arc<dyn McpClient>, capabilities: Capabilities) {
        let advertised = K::advertised(&capabilities);
        {
            let mut attached = self.lock_attached();
            if attached
                .get(&id)
                .is_some_and(|entry| Arc::ptr_eq(&entry.client, &client))
            {
                return;
            }
            if let Some(previous) = attached.remove(&id) {
                previous.shutdown();
            }
            let listener = (advertised && K::list_changed(&capabilities))
                .then(|| self.spawn_listener(id, &client));
            attached.insert(
                id,
                Attached {
                    client,
                    capabilities,
                    listener,
                    request: None,
                },
            );
        }
        if advertised {
            let _ = self.start_fetch(id, FetchMode::Supersede);
        }
    }

    fn detach(&self, id: Uuid) {
        let removed = self.lock_attached().remove(&id);
        if let Some(entry) = removed {
            debug!(server_id = %id, kind = K::NAME, "Dropping MCP catalog");
            entry.shutdown();
        }
        if self.state().contains_key(&id) {
            self.inner.collections.update(|collections| {
                collections.remove(&id);
            });
        }
    }

    fn spawn_listener(&self, id: Uuid, client: &Arc<dyn McpClient>) -> CancellationToken {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let mut notices = client.notices();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let notice = tokio::select! {
                    _ = stop.cancelled() => break,
                    notice = notices.recv() => notice,
                };
                let refetch = match notice {
                    Ok(notice) => notice == K::NOTICE,
                    Err(RecvError::Lagged(_)) => true,
                    Err(RecvError::Closed) => break,
                };
                if !refetch {
                    continue;
                }
                let Some(inner) = weak.upgrade() else { break };
                debug!(server_id = %id, kind = K::NAME, "MCP list changed; refetching");
                let _ = CapabilityManager::<K> { inner }.start_fetch(id, FetchMode::Supersede);
            }
        });
        token
    }

    fn is_current(&self, id: Uuid, generation: u64) -> bool {
        self.lock_attached()
            .get(&id)
            .and_then(|entry| entry.request.as_ref())
            .is_some_and(|request| request.generation == generation)
    }

    /// Starts a fetch for `id`. In [`FetchMode::Join`] an in-flight fetch is
    /// left alone and nothing new is started; the check and the claim happen
    /// under one lock, so concurrent joiners issue a single request.
    ///
    /// Returns `Ok(false)` when the server does not offer this catalog.
    fn start_fetch(&self, id: Uuid, mode: FetchMode) -> Result<bool> {
        let cancel = CancellationToken::new();
        let (generation, client) = {
            let mut attached = self.lock_attached();
            let entry = attached
                .get_mut(&id)
                .ok_or_else(|| Error::not_found(format!("MCP connection {id}")))?;
            if !K::advertised(&entry.capabilities) {
                return Ok(false);
            }
            if mode == FetchMode::Join && entry.request.is_some() {
                return Ok(true);
            }
            let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
            let previous = entry.request.replace(InFlight {
                generation,
                cancel: cancel.clone(),
            });
            if let Some(previous) = previous {
                debug!(
                    server_id = %id,
                    kind = K::NAME,
                    generation = previous.generation,
                    "Superseding MCP fetch"
                );
                previous.cancel.cancel();
            }
            (generation, entry.client.clone())
        };

        self.inner.collections.update(|collections| {
            if self.is_current(id, generation) {
                collections.insert(id, Collection::Loading);
            }
        });

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_fetch(id, generation, client, cancel).await;
        });
        Ok(true)
    }

    async fn run_fetch(
        &self,
        id: Uuid,
        generation: u64,
        client: Arc<dyn McpClient>,
        cancel: CancellationToken,
    ) {
        let timeout = self.inner.policy.fetch_timeout();
        let deadline = deadline_token(&cancel, timeout);
        let limit = K::page_limit(&self.inner.policy);
        let outcome = run_cancellable(
            Some(&deadline),
            fetch_all::<K>(id, client.as_ref(), limit, &deadline),
        )
        .await;
        deadline.cancel();

        let next = match outcome {
            Ok(items) => {
                debug!(server_id = %id, kind = K::NAME, count = items.len(), "Fetched MCP catalog");
                Collection::Loaded { items }
            }
            Err(Error::Aborted) if cancel.is_cancelled() => return,
            Err(Error::Aborted) => {
                warn!(server_id = %id, kind = K::NAME, "Timed out fetching MCP catalog");
                Collection::Error {
                    message: format!("Timed out listing {} after {}s", K::NAME, timeout.as_secs()),
                }
            }
            Err(err) => {
                warn!(server_id = %id, kind = K::NAME, error = %err, "Failed to fetch MCP catalog");
                Collection::Error {
                    message: err.to_string(),
                }
            }
        };
        self.commit(id, generation, next);
    }

    fn commit(&self, id: Uuid, generation: u64, next: Collection<K::Item>) -> bool {
        if !self.is_current(id, generation) {
            return false;
        }
        // The request is released in the same step that publishes the result,
        // so a lister that sees the result never finds a finished fetch still
        // claimed.
        let mut committed = false;
        self.inner.collections.update(|collections| {
            let mut attached = self.lock_attached();
            let Some(entry) = attached.get_mut(&id) else {
                return;
            };
            if entry
                .request
                .as_ref()
                .is_some_and(|request| request.generation == generation)
            {
                entry.request = None;
                collections.insert(id, next);
                committed = true;
            }
        });
        committed
    }

    /// Returns the catalog of `id`, waiting for a fetch in flight or
    /// starting one if nothing is cached. Concurrent callers share a fetch.
    pub async fn list(&self, id: Uuid, cancel: &CancellationToken) -> Result<Vec<K::Item>> {
        let advertised = match self.lock_attached().get(&id) {
            Some(entry) => K::advertised(&entry.capabilities),
            None => return Err(Error::not_found(format!("MCP connection {id}"))),
        };
        if !advertised {
            return Ok(Vec::new());
        }

        let mut watch = self
            .inner
            .collections
            .project(move |collections| collections.get(&id).cloned());
        let mut started = false;
        loop {
            let current = run_cancellable(Some(cancel), async {
                watch
                    .recv()
                    .await
                    .ok_or_else(|| Error::illegal_state("catalog state closed"))
            })
            .await?;
            match current {
                Some(Collection::Loaded { items }) => return Ok(items),
                Some(Collection::Loading) => {}
                Some(Collection::Error { message }) if started => {
                    return Err(Error::Transport(message))
                }
                None if started => {
                    return Err(Error::not_found(format!("MCP connection {id}")));
                }
                Some(Collection::Error { .. }) | None => {
                    started = true;
                    if !self.start_fetch(id, FetchMode::Join)? {
                        return Ok(Vec::new());
                    }
                }
            }
        }
    }

    /// Forces a refetch of `id`'s catalog.
    pub fn refresh(&self, id: Uuid) -> Result<()> {
        self.start_fetch(id, FetchMode::Supersede).map(|_| ())
    }

    fn client_for(&self, id: Uuid) -> Result<Arc<dyn McpClient>> {
        self.lock_attached()
            .get(&id)
            .map(|entry| entry.client.clone())
            .ok_or_else(|| Error::not_found(format!("MCP connection {id}")))
    }

    fn loaded_items(&self, id: Uuid) -> Vec<K::Item> {
        match self.state().get(&id) {
            Some(Collection::Loaded { items }) => items.clone(),
            _ => Vec::new(),
        }
    }
}

impl CapabilityManager<Tools> {
    /// Every loaded tool with the URI that addresses it.
    pub fn tools(&self) -> Vec<(ToolUri, Tool)> {
        self.state()
            .iter()
            .flat_map(|(id, collection)| match collection {
                Collection::Loaded { items } => items
                    .iter()
                    .map(|tool| (ToolUri::new(*id, tool.name.clone()), tool.clone()))
                    .collect::<Vec<_>>(),
                _ => Vec::new(),
            })
            .collect()
    }

    /// Resolves `uri` against the loaded catalogs and calls the tool.
    /// Unknown connections, unparseable URIs and tools missing from the
    /// loaded catalog are all [`Error::NotFound`].
    pub async fn call_tool(
        &self,
        uri: &str,
        arguments: Option<Map<String, Value>>,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult> {
        let resolved = ToolUri::resolve(uri)
            .ok_or_else(|| Error::not_found(format!("unknown tool URI: {uri}")))?;
        let known = self
            .loaded_items(resolved.connection_id)
            .iter()
            .any(|tool| tool.name == resolved.name);
        if !known {
            return Err(Error::not_found(format!("unknown tool: {uri}")));
        }
        let client = self.client_for(resolved.connection_id)?;
        debug!(server_id = %resolved.connection_id, tool = %resolved.name, "Calling MCP tool");
        run_cancellable(
            Some(cancel),
            client.call_tool(&resolved.name, arguments, cancel),
        )
        .await
    }
}

impl CapabilityManager<Prompts> {
    pub async fn get_prompt(
        &self,
        id: Uuid,
        name: &str,
        arguments: HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<GetPromptResult> {
        let client = self.client_for(id)?;
        run_cancellable(Some(cancel), client.get_prompt(name, arguments, cancel)).await
    }
}

impl CapabilityManager<Resources> {
    pub async fn read_resource(
        &self,
        id: Uuid,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<ReadResourceResult> {
        let client = self.client_for(id)?;
        run_cancellable(Some(cancel), client.read_resource(uri, cancel)).await
    }
}

#[cfg(test)]
mod tests;
