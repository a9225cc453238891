use super::*;
use crate::bridge::{BridgeClient, BridgeServer, StateMirror};
use crate::config::McpPolicy;
use crate::mcp::test_support::{eventually, prompt, resource, tool, Catalog, FakeConnector};
use crate::mcp::{ConnectionView, MemoryServerStore};
use crate::state::StateUpdate;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tokio::task::JoinHandle;

struct Harness {
    client: BridgeClient,
    backend: Backend,
    connector: Arc<FakeConnector>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

fn harness(servers: &[McpServerConfig]) -> Harness {
    let connector = FakeConnector::new(Catalog {
        tools: vec![tool("search")],
        prompts: vec![prompt("summarize")],
        resources: vec![resource("file:///notes.md")],
    });
    let store = Arc::new(MemoryServerStore::new(servers.iter().cloned()));
    let backend = Backend::new(ConnectionManager::new(
        store,
        connector.clone(),
        McpPolicy::default(),
    ));
    let router = backend.router();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_io);
    let (client_read, client_write) = tokio::io::split(client_io);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let server = tokio::spawn(async move {
        BridgeServer::new(router)
            .serve(server_read, server_write, token)
            .await;
    });

    Harness {
        client: BridgeClient::connect(client_read, client_write),
        backend,
        connector,
        shutdown,
        server,
    }
}

impl Harness {
    async fn stop(self) {
        self.shutdown.cancel();
        self.server.await.expect("server task");
        self.backend.connections.close_all().await;
    }
}

#[tokio::test]
async fn server_crud_and_activation_cross_the_bridge() {
    let h = harness(&[]);
    let server = McpServerConfig::stdio("Files", "mcp-files", &[]);
    let id = server.id;

    h.client
        .call("mcp.create_server", serde_json::to_value(&server).unwrap())
        .await
        .expect("create");
    let listed: Vec<McpServerConfig> = h
        .client
        .call_as("mcp.list_servers", &Value::Null)
        .await
        .expect("list");
    assert_eq!(listed, vec![server.clone()]);
    let active: BTreeSet<Uuid> = h.client.call_as("mcp.active", &Value::Null).await.unwrap();
    assert_eq!(active, BTreeSet::from([id]));

    let mut connections = h.client.open_stream("mcp.connections", Value::Null);
    let views: BTreeMap<Uuid, ConnectionView> =
        connections.next_as().await.expect("snapshot").expect("ok");
    assert!(matches!(views.get(&id), Some(ConnectionView::Connected { .. })));

    h.client
        .call("mcp.deactivate", json!({"id": id}))
        .await
        .expect("deactivate");
    let views: BTreeMap<Uuid, ConnectionView> =
        connections.next_as().await.expect("update").expect("ok");
    assert!(views.is_empty());
    connections.stop().await;

    let removed = h
        .client
        .call("mcp.delete_server", json!({"id": id}))
        .await
        .expect("delete");
    assert_eq!(removed, json!(true));
    let removed = h
        .client
        .call("mcp.delete_server", json!({"id": id}))
        .await
        .expect("delete again");
    assert_eq!(removed, json!(false));
    h.stop().await;
}

#[tokio::test]
async fn cancelled_activation_aborts_the_handshake() {
    let server = McpServerConfig::stdio("Slow", "mcp-slow", &[]);
    let id = server.id;
    let h = harness(std::slice::from_ref(&server));
    h.connector.hang(id);

    let cancel = CancellationToken::new();
    let call = tokio::spawn({
        let client = h.client.clone();
        let cancel = cancel.clone();
        async move {
            client
                .call_with_cancel("mcp.activate", json!({"id": id}), Some(&cancel))
                .await
        }
    });
    let connections = h.backend.connections.clone();
    eventually(|| {
        connections.state().get(&id).map(|connection| connection.view())
            == Some(ConnectionView::Connecting)
    })
    .await;

    cancel.cancel();
    let err = call.await.unwrap().expect_err("cancelled");
    assert_eq!(err.kind, ErrorKind::Aborted);
    eventually(|| connections.state().get(&id).is_none() && !connections.is_active(id)).await;
    h.stop().await;
}

#[tokio::test]
async fn tools_are_listed_and_called_through_uris() {
    let server = McpServerConfig::stdio("Files", "mcp-files", &[]);
    let id = server.id;
    let h = harness(std::slice::from_ref(&server));
    h.client
        .call("mcp.activate", json!({"id": id}))
        .await
        .expect("activate");

    let tools = h
        .client
        .call("tools.list", json!({"id": id}))
        .await
        .expect("list");
    assert_eq!(tools[0]["name"], "search");

    let all = h.client.call("tools.all", Value::Null).await.expect("all");
    let uri = format!("mcp-tool://{id}/search");
    assert_eq!(all[0]["uri"], json!(uri));
    assert_eq!(all[0]["tool"]["name"], "search");

    let result = h
        .client
        .call(
            "tools.call_tool",
            json!({"uri": uri, "arguments": {"query": "rust"}}),
        )
        .await
        .expect("call");
    assert_eq!(result["content"][0]["text"], "ran search");
    let calls = h.connector.client(id).tool_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "search");
    assert_eq!(calls[0].1.as_ref().unwrap()["query"], "rust");

    let err = h
        .client
        .call(
            "tools.call_tool",
            json!({"uri": format!("mcp-tool://{id}/missing")}),
        )
        .await
        .expect_err("unknown tool");
    assert_eq!(err.kind, ErrorKind::NotFound);
    h.stop().await;
}

#[tokio::test]
async fn prompts_and_resources_are_served() {
    let server = McpServerConfig::stdio("Files", "mcp-files", &[]);
    let id = server.id;
    let h = harness(std::slice::from_ref(&server));
    h.client
        .call("mcp.activate", json!({"id": id}))
        .await
        .expect("activate");

    let prompts = h
        .client
        .call("prompts.list", json!({"id": id}))
        .await
        .expect("prompts");
    assert_eq!(prompts[0]["name"], "summarize");
    let rendered = h
        .client
        .call(
            "prompts.get_prompt",
            json!({"id": id, "name": "summarize", "arguments": {"topic": "rust"}}),
        )
        .await
        .expect("get prompt");
    assert_eq!(rendered["messages"][0]["content"]["text"], "rust");

    let resources = h
        .client
        .call("resources.list", json!({"id": id}))
        .await
        .expect("resources");
    assert_eq!(resources[0]["uri"], "file:///notes.md");
    let read = h
        .client
        .call(
            "resources.read_resource",
            json!({"id": id, "uri": "file:///notes.md"}),
        )
        .await
        .expect("read");
    assert_eq!(read["contents"][0]["text"], "contents");

    let err = h
        .client
        .call("tools.get_prompt", json!({"id": id, "name": "summarize"}))
        .await
        .expect_err("prompt call on tools");
    assert_eq!(err.kind, ErrorKind::UnknownMethod);
    h.stop().await;
}

#[tokio::test]
async fn catalog_state_is_mirrored_from_raw_stream() {
    let server = McpServerConfig::stdio("Files", "mcp-files", &[]);
    let id = server.id;
    let h = harness(std::slice::from_ref(&server));
    let mut raw = h.client.open_stream("mcp.connections_raw", Value::Null);
    let mut mirror = StateMirror::<BTreeMap<Uuid, ConnectionView>>::new();
    let first: StateUpdate = raw.next_as().await.expect("snapshot").expect("ok");
    mirror.ingest(first).expect("seed");

    h.client
        .call("mcp.activate", json!({"id": id}))
        .await
        .expect("activate");
    loop {
        let update: StateUpdate = raw.next_as().await.expect("update").expect("ok");
        let state = mirror.ingest(update).expect("ingest");
        if matches!(state.get(&id), Some(ConnectionView::Connected { .. })) {
            break;
        }
    }
    raw.stop().await;

    let mut state = h.client.open_stream("tools.state", Value::Null);
    loop {
        let collections = state.next().await.expect("state").expect("ok");
        if collections[id.to_string()]["status"] == "loaded" {
            assert_eq!(collections[id.to_string()]["items"][0]["name"], "search");
            break;
        }
    }
    state.stop().await;
    h.stop().await;
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let h = harness(&[]);
    let err = h
        .client
        .call("mcp.activate", json!({"server": "nope"}))
        .await
        .expect_err("bad params");
    assert_eq!(err.kind, ErrorKind::InvalidParams);

    let err = h
        .client
        .call("mcp.list_servers", json!([1]))
        .await
        .expect_err("unexpected params");
    assert_eq!(err.kind, ErrorKind::InvalidParams);

    let err = h
        .client
        .call("tools.list", json!({"id": Uuid::new_v4()}))
        .await
        .expect_err("unknown connection");
    assert_eq!(err.kind, ErrorKind::NotFound);

    let err = h
        .client
        .call("mcp.reboot", Value::Null)
        .await
        .expect_err("unknown method");
    assert_eq!(err.kind, ErrorKind::UnknownMethod);
    h.stop().await;
}
