//! `cordage status`: one-shot connection and catalog summary.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigOrchestrator, McpServerConfig};
use crate::error::{Error, Result};
use crate::mcp::{ConfigServerStore, ConnectionManager, ConnectionView, TransportConnector};
use crate::services::Backend;
use crate::sync::deadline_token;

/// Connects every configured server without touching the saved session.
pub async fn run(
    orchestrator: Arc<ConfigOrchestrator>,
    config: &Config,
    wait: Duration,
) -> std::result::Result<(), Box<dyn StdError>> {
    let store = Arc::new(ConfigServerStore::new(orchestrator));
    let connections = ConnectionManager::new(
        store,
        Arc::new(TransportConnector::new()?),
        config.mcp.clone(),
    );
    let servers = connections.servers().await?;
    if servers.is_empty() {
        println!("No MCP servers configured.");
        return Ok(());
    }

    let backend = Backend::new(connections.clone());
    for line in summarize(&backend, &servers, wait).await {
        println!("{line}");
    }
    connections.close_all().await;
    Ok(())
}

/// One line per server, in configuration order.
pub async fn summarize(
    backend: &Backend,
    servers: &[McpServerConfig],
    wait: Duration,
) -> Vec<String> {
    let concurrency = backend.connections.policy().startup_concurrency.max(1);
    stream::iter(servers.iter().map(|server| server.id))
        .map(|id| {
            let connections = backend.connections.clone();
            async move {
                let _ = connections.activate_server(id).await;
            }
        })
        .buffer_unordered(concurrency)
        .collect::<Vec<()>>()
        .await;

    let mut lines = Vec::with_capacity(servers.len());
    for server in servers {
        let view = backend
            .connections
            .state()
            .get(&server.id)
            .map(|connection| connection.view());
        let detail = match view {
            Some(ConnectionView::Connected { server_info, .. }) => {
                let catalogs = catalogs(backend, server.id, wait).await;
                match server_info {
                    Some(info) => format!(
                        "connected to {} {}: {catalogs}",
                        info.name, info.version
                    ),
                    None => format!("connected: {catalogs}"),
                }
            }
            Some(ConnectionView::Error { message }) => format!("error: {message}"),
            Some(ConnectionView::Connecting) | None => "not connected".to_string(),
        };
        lines.push(format!("{} ({}): {detail}", server.display_name, server.id));
    }
    lines
}

async fn catalogs(backend: &Backend, id: uuid::Uuid, wait: Duration) -> String {
    let root = CancellationToken::new();
    let tools = backend
        .tools
        .list(id, &deadline_token(&root, wait))
        .await
        .map(|items| items.len());
    let prompts = backend
        .prompts
        .list(id, &deadline_token(&root, wait))
        .await
        .map(|items| items.len());
    let resources = backend
        .resources
        .list(id, &deadline_token(&root, wait))
        .await
        .map(|items| items.len());
    [
        catalog_part("tools", tools),
        catalog_part("prompts", prompts),
        catalog_part("resources", resources),
    ]
    .join(", ")
}

fn catalog_part(kind: &str, listed: Result<usize>) -> String {
    match listed {
        Ok(count) => format!("{count} {kind}"),
        Err(Error::Aborted) => format!("{kind} timed out"),
        Err(err) => format!("{kind} failed ({err})"),
    }
}
