//! Lifecycle of every configured MCP server connection.
//!
//! One [`Connection`] entry per server id lives in a [`StateContainer`]:
//! `connecting` while the handshake runs, then `connected` or `error`.
//! Deactivation and transport loss remove the entry. Which servers are
//! active is kept in a separate (optionally persisted) set so a restart can
//! bring the same servers back with [`ConnectionManager::activate_all`].

use super::client::{McpClient, McpConnector};
use super::connection::{Capabilities, Connection, ConnectionView};
use super::store::ServerStore;
use crate::config::{McpPolicy, McpServerConfig};
use crate::error::{Error, Result};
use crate::state::{PersistentContainer, Projection, StateContainer, StateUpdate, Subscription};
use crate::sync::{deadline_token, run_cancellable, Mutex};
use futures_util::{stream, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the persisted store holding the active server ids.
pub const SESSION_STORE: &str = "mcp-session";

pub type Connections = BTreeMap<Uuid, Connection>;

/// Typed connection lifecycle notification derived from state transitions.
#[derive(Clone)]
pub enum ConnectionEvent {
    Connected {
        id: Uuid,
        client: Arc<dyn McpClient>,
        capabilities: Capabilities,
    },
    Disconnected {
        id: Uuid,
    },
}

impl ConnectionEvent {
    pub fn id(&self) -> Uuid {
        match self {
            ConnectionEvent::Connected { id, .. } | ConnectionEvent::Disconnected { id } => *id,
        }
    }
}

fn same_client(a: &Arc<dyn McpClient>, b: &Arc<dyn McpClient>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Events implied by moving from `prev` to `next`. Disconnects come first so
/// a replaced client is always torn down before its successor is announced.
fn connection_events(prev: &Connections, next: &Connections) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    for (id, before) in prev {
        if let Some(old) = before.client() {
            let kept = next
                .get(id)
                .and_then(Connection::client)
                .is_some_and(|new| same_client(old, new));
            if !kept {
                events.push(ConnectionEvent::Disconnected { id: *id });
            }
        }
    }
    for (id, after) in next {
        if let Connection::Connected {
            client,
            capabilities,
            ..
        } = after
        {
            let known = prev
                .get(id)
                .and_then(Connection::client)
                .is_some_and(|old| same_client(old, client));
            if !known {
                events.push(ConnectionEvent::Connected {
                    id: *id,
                    client: client.clone(),
                    capabilities: *capabilities,
                });
            }
        }
    }
    events
}

enum ActiveSet {
    Memory(StateContainer<BTreeSet<Uuid>>),
    Persistent(PersistentContainer<BTreeSet<Uuid>>),
}

impl Deref for ActiveSet {
    type Target = StateContainer<BTreeSet<Uuid>>;

    fn deref(&self) -> &Self::Target {
        match self {
            ActiveSet::Memory(container) => container,
            ActiveSet::Persistent(container) => container.container(),
        }
    }
}

struct Handshake {
    attempt: u64,
    cancel: CancellationToken,
}

struct Inner {
    connections: StateContainer<Connections>,
    active: ActiveSet,
    store: Arc<dyn ServerStore>,
    connector: Arc<dyn McpConnector>,
    policy: McpPolicy,
    crud: Mutex,
    handshakes: StdMutex<HashMap<Uuid, Handshake>>,
    watchers: StdMutex<HashMap<Uuid, CancellationToken>>,
    next_attempt: AtomicU64,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Manager whose active set lives only in memory.
    pub fn new(
        store: Arc<dyn ServerStore>,
        connector: Arc<dyn McpConnector>,
        policy: McpPolicy,
    ) -> Self {
        Self::build(
            store,
            connector,
            policy,
            ActiveSet::Memory(StateContainer::new(BTreeSet::new())),
        )
    }

    /// Manager whose active set is written through to `state_dir`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn persistent(
        store: Arc<dyn ServerStore>,
        connector: Arc<dyn McpConnector>,
        policy: McpPolicy,
        state_dir: &Path,
    ) -> Self {
        let session = PersistentContainer::open(state_dir, SESSION_STORE, BTreeSet::new());
        Self::build(store, connector, policy, ActiveSet::Persistent(session))
    }

    fn build(
        store: Arc<dyn ServerStore>,
        connector: Arc<dyn McpConnector>,
        policy: McpPolicy,
        active: ActiveSet,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connections: StateContainer::new(Connections::new()),
                active,
                store,
                connector,
                policy,
                crud: Mutex::new(),
                handshakes: StdMutex::new(HashMap::new()),
                watchers: StdMutex::new(HashMap::new()),
                next_attempt: AtomicU64::new(0),
            }),
        }
    }

    fn lock_handshakes(&self) -> MutexGuard<'_, HashMap<Uuid, Handshake>> {
        self.inner
            .handshakes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_watchers(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.inner
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn policy(&self) -> &McpPolicy {
        &self.inner.policy
    }

    pub fn state(&self) -> Arc<Connections> {
        self.inner.connections.state()
    }

    /// UI projection: one map of views now and one per transition.
    pub fn connections(&self) -> Projection<BTreeMap<Uuid, ConnectionView>> {
        self.inner.connections.project(|connections| {
            connections
                .iter()
                .map(|(id, connection)| (*id, connection.view()))
                .collect()
        })
    }

    pub fn watch_raw(&self) -> Projection<StateUpdate> {
        self.inner.connections.watch_raw()
    }

    pub fn client(&self, id: Uuid) -> Option<Arc<dyn McpClient>> {
        self.state().get(&id).and_then(Connection::client).cloned()
    }

    /// Currently connected servers with their clients and capabilities.
    pub fn connected(&self) -> Vec<(Uuid, Arc<dyn McpClient>, Capabilities)> {
        self.state()
            .iter()
            .filter_map(|(id, connection)| match connection {
                Connection::Connected {
                    client,
                    capabilities,
                    ..
                } => Some((*id, client.clone(), *capabilities)),
                _ => None,
            })
            .collect()
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.inner.active.state().contains(&id)
    }

    pub fn active_ids(&self) -> BTreeSet<Uuid> {
        (*self.inner.active.state()).clone()
    }

    pub async fn servers(&self) -> Result<Vec<McpServerConfig>> {
        self.inner.store.list().await
    }

    /// Delivers a [`ConnectionEvent`] for every client that appears or goes
    /// away, in commit order.
    pub fn subscribe_events<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.connections.subscribe(move |transition| {
            for event in connection_events(&transition.prev, &transition.next) {
                listener(&event);
            }
        })
    }

    pub async fn create_server(&self, config: McpServerConfig) -> Result<()> {
        let _guard = self.inner.crud.lock(None).await?;
        info!(server_id = %config.id, name = %config.display_name, "Adding MCP server");
        self.inner.store.put(config.clone()).await?;
        self.activate_config(config).await
    }

    /// Replaces a stored configuration. An active server reconnects with it.
    pub async fn update_server(&self, config: McpServerConfig) -> Result<()> {
        let _guard = self.inner.crud.lock(None).await?;
        let id = config.id;
        if self.inner.store.get(id).await?.is_none() {
            return Err(Error::not_found(format!("MCP server {id}")));
        }
        self.inner.store.put(config.clone()).await?;
        let live = self.state().contains_key(&id);
        if live || self.is_active(id) {
            debug!(server_id = %id, "Reconnecting updated MCP server");
            self.disconnect(id, false).await;
            self.activate_config(config).await?;
        }
        Ok(())
    }

    /// Deactivates and forgets a server. Returns whether it was stored.
    pub async fn delete_server(&self, id: Uuid) -> Result<bool> {
        let _guard = self.inner.crud.lock(None).await?;
        self.disconnect(id, true).await;
        let removed = self.inner.store.remove(id).await?;
        if removed {
            info!(server_id = %id, "Removed MCP server");
        }
        Ok(removed)
    }

    /// Connects a stored server unless it is already connecting or
    /// connected. Handshake failures are recorded as `error` state, not
    /// returned.
    pub async fn activate_server(&self, id: Uuid) -> Result<()> {
        let config = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("MCP server {id}")))?;
        self.activate_config(config).await
    }

    pub async fn deactivate_server(&self, id: Uuid) -> Result<()> {
        self.disconnect(id, true).await;
        Ok(())
    }

    /// Reconnects every server remembered in the active set. Ids whose
    /// configuration no longer exists are dropped from the set.
    pub async fn activate_all(&self) -> Result<()> {
        let servers = self.inner.store.list().await?;
        let active = self.inner.active.state();
        let known: BTreeSet<Uuid> = servers.iter().map(|server| server.id).collect();
        if active.iter().any(|id| !known.contains(id)) {
            self.inner
                .active
                .update(|ids| ids.retain(|id| known.contains(id)));
        }

        let targets: Vec<McpServerConfig> = servers
            .into_iter()
            .filter(|server| active.contains(&server.id))
            .collect();
        let concurrency = self.inner.policy.startup_concurrency.max(1);
        info!(count = targets.len(), concurrency, "Activating MCP servers");
        stream::iter(targets)
            .map(|config| {
                let manager = self.clone();
                async move {
                    let id = config.id;
                    if let Err(err) = manager.activate_config(config).await {
                        warn!(server_id = %id, error = %err, "MCP server activation failed");
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<()>>()
            .await;
        Ok(())
    }

    /// Disconnects everything while keeping the active set, so the same
    /// servers come back on the next [`ConnectionManager::activate_all`].
    pub async fn close_all(&self) {
        let mut ids: BTreeSet<Uuid> = self.state().keys().copied().collect();
        ids.extend(self.lock_handshakes().keys().copied());
        for id in ids {
            self.disconnect(id, false).await;
        }
    }

    fn holds_attempt(&self, id: Uuid, attempt: u64) -> bool {
        matches!(
            self.state().get(&id),
            Some(Connection::Connecting { attempt: current }) if *current == attempt
        )
    }

    async fn activate_config(&self, config: McpServerConfig) -> Result<()> {
        let id = config.id;
        if self.state().get(&id).is_some_and(Connection::is_live) {
            debug!(server_id = %id, "MCP server already active");
            return Ok(());
        }

        let attempt = self.inner.next_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let mut claimed = false;
        self.inner.connections.update(|connections| {
            if !connections.get(&id).is_some_and(Connection::is_live) {
                connections.insert(id, Connection::Connecting { attempt });
                claimed = true;
            }
        });
        if !claimed {
            return Ok(());
        }
        if !self.is_active(id) {
            self.inner.active.update(|ids| {
                ids.insert(id);
            });
        }

        let timeout = self.inner.policy.handshake_timeout();
        let cancel = deadline_token(&CancellationToken::new(), timeout);
        if let Some(previous) = self.lock_handshakes().insert(
            id,
            Handshake {
                attempt,
                cancel: cancel.clone(),
            },
        ) {
            previous.cancel.cancel();
        }

        info!(server_id = %id, name = %config.display_name, attempt, "Connecting to MCP server");
        let outcome = run_cancellable(
            Some(&cancel),
            self.inner.connector.connect(&config, &cancel),
        )
        .await;
        {
            let mut handshakes = self.lock_handshakes();
            if handshakes
                .get(&id)
                .is_some_and(|handshake| handshake.attempt == attempt)
            {
                handshakes.remove(&id);
            }
        }
        cancel.cancel();

        let next = match &outcome {
            Ok(handshake) => Connection::Connected {
                capabilities: handshake.capabilities,
                server_info: handshake.server_info.clone(),
                project_id: config.project_id.clone(),
                client: handshake.client.clone(),
            },
            Err(Error::Aborted) => Connection::Error {
                message: format!("Handshake timed out after {}s", timeout.as_secs()),
            },
            Err(err) => Connection::Error {
                message: err.to_string(),
            },
        };

        let mut committed = false;
        if self.holds_attempt(id, attempt) {
            self.inner.connections.update(|connections| {
                let current = matches!(
                    connections.get(&id),
                    Some(Connection::Connecting { attempt: current }) if *current == attempt
                );
                if current {
                    connections.insert(id, next);
                    committed = true;
                }
            });
        }

        match outcome {
            Ok(handshake) if committed => {
                info!(server_id = %id, capabilities = ?handshake.capabilities, "MCP server connected");
                self.spawn_watcher(id, handshake.client);
                Ok(())
            }
            Ok(handshake) => {
                debug!(server_id = %id, attempt, "Discarding superseded MCP handshake");
                handshake.client.close().await;
                Err(Error::Aborted)
            }
            Err(err) if committed => {
                warn!(server_id = %id, error = %err, "MCP handshake failed");
                Ok(())
            }
            Err(_) => Err(Error::Aborted),
        }
    }

    fn spawn_watcher(&self, id: Uuid, client: Arc<dyn McpClient>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.lock_watchers().insert(id, token.clone()) {
            previous.cancel();
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = client.closed() => {}
            }
            if let Some(inner) = weak.upgrade() {
                ConnectionManager { inner }.on_transport_closed(id, &client);
            }
        });
    }

    fn on_transport_closed(&self, id: Uuid, client: &Arc<dyn McpClient>) {
        let owns = |connections: &Connections| {
            connections
                .get(&id)
                .and_then(Connection::client)
                .is_some_and(|current| same_client(current, client))
        };
        if !owns(&self.state()) {
            return;
        }
        warn!(server_id = %id, "MCP server transport closed");
        self.inner.connections.update(|connections| {
            if owns(connections) {
                connections.remove(&id);
            }
        });
        self.lock_watchers().remove(&id);
    }

    /// Cancels any handshake, removes the entry and closes its client.
    /// `forget` also drops the id from the active set.
    async fn disconnect(&self, id: Uuid, forget: bool) {
        if let Some(handshake) = self.lock_handshakes().remove(&id) {
            handshake.cancel.cancel();
        }
        if let Some(watcher) = self.lock_watchers().remove(&id) {
            watcher.cancel();
        }

        let mut removed = None;
        if self.state().contains_key(&id) {
            self.inner.connections.update(|connections| {
                removed = connections.remove(&id);
            });
        }
        if forget && self.is_active(id) {
            self.inner.active.update(|ids| {
                ids.remove(&id);
            });
        }
        if let Some(client) = removed.as_ref().and_then(Connection::client) {
            info!(server_id = %id, "Closing MCP connection");
            client.close().await;
        }
    }

    /// Waits until every persisted write of the active set has landed.
    pub async fn flush(&self) {
        if let ActiveSet::Persistent(session) = &self.inner.active {
            session.flush().await;
        }
    }
}
