use super::*;
use crate::config::McpServerConfig;
use crate::mcp::store::MemoryServerStore;
use crate::mcp::test_support::{
    eventually, prompt, resource, tool, Catalog, FakeClient, FakeConnector,
};
use std::time::Duration;

struct Fixture {
    connections: ConnectionManager,
    connector: Arc<FakeConnector>,
    tools: ToolsManager,
    prompts: PromptsManager,
    resources: ResourcesManager,
    server: McpServerConfig,
}

fn catalog() -> Catalog {
    Catalog {
        tools: vec![tool("search"), tool("fetch")],
        prompts: vec![prompt("summarize")],
        resources: vec![resource("file:///notes.md")],
    }
}

fn fixture_with(policy: McpPolicy) -> Fixture {
    let server = McpServerConfig::stdio("Files", "mcp-files", &[]);
    let connector = FakeConnector::new(catalog());
    let store = Arc::new(MemoryServerStore::new([server.clone()]));
    let connections = ConnectionManager::new(store, connector.clone(), policy);
    Fixture {
        tools: ToolsManager::new(&connections),
        prompts: PromptsManager::new(&connections),
        resources: ResourcesManager::new(&connections),
        connections,
        connector,
        server,
    }
}

fn fixture() -> Fixture {
    fixture_with(McpPolicy::default())
}

fn names<K: CapabilityKind>(manager: &CapabilityManager<K>, id: Uuid) -> Option<Vec<String>> {
    match manager.state().get(&id) {
        Some(Collection::Loaded { items }) => Some(
            items
                .iter()
                .map(|item| {
                    serde_json::to_value(item).unwrap()["name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string()
                })
                .collect(),
        ),
        _ => None,
    }
}

fn loaded<K: CapabilityKind>(manager: &CapabilityManager<K>, id: Uuid) -> bool {
    names(manager, id).is_some()
}

#[tokio::test]
async fn connect_fetches_and_deactivate_clears() {
    let fx = fixture();
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();

    eventually(|| loaded(&fx.tools, id)).await;
    assert_eq!(
        names(&fx.tools, id),
        Some(vec!["search".to_string(), "fetch".to_string()])
    );
    eventually(|| loaded(&fx.prompts, id) && loaded(&fx.resources, id)).await;

    fx.connections.deactivate_server(id).await.unwrap();
    assert!(fx.connections.state().get(&id).is_none());
    assert!(fx.tools.state().get(&id).is_none());
    assert!(fx.prompts.state().get(&id).is_none());
    assert!(fx.resources.state().get(&id).is_none());
}

#[tokio::test]
async fn reactivation_starts_without_stale_catalog() {
    let fx = fixture();
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();
    eventually(|| loaded(&fx.tools, id)).await;
    fx.connections.deactivate_server(id).await.unwrap();

    fx.connector
        .configure(|client| client.stall("tools/list", 1));
    let mut watch = fx.tools.watch();
    assert!(watch.recv().await.unwrap().get(&id).is_none());
    fx.connections.activate_server(id).await.unwrap();
    assert!(matches!(
        watch.recv().await.unwrap().get(&id),
        Some(Collection::Loading)
    ));
    let client = fx.connector.client(id);
    eventually(|| client.calls("tools/list") == 1).await;
    client.release.notify_waiters();
    eventually(|| loaded(&fx.tools, id)).await;
}

#[tokio::test]
async fn page_ceiling_keeps_partial_result() {
    let fx = fixture_with(McpPolicy {
        tools_page_limit: 3,
        ..McpPolicy::default()
    });
    fx.connector
        .configure(|client| client.endless.store(true, Ordering::SeqCst));
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();

    let tools = tokio::time::timeout(
        Duration::from_secs(5),
        fx.tools.list(id, &CancellationToken::new()),
    )
    .await
    .expect("page ceiling bounds the fetch")
    .unwrap();
    assert_eq!(tools.len(), 3);
}

#[tokio::test]
async fn pages_are_accumulated_in_order() {
    let fx = fixture();
    fx.connector
        .configure(|client| client.page_size.store(1, Ordering::SeqCst));
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();

    let tools = fx.tools.list(id, &CancellationToken::new()).await.unwrap();
    let names: Vec<_> = tools.into_iter().map(|tool| tool.name).collect();
    assert_eq!(names, vec!["search", "fetch"]);
}

#[tokio::test]
async fn second_fetch_supersedes_first() {
    let fx = fixture();
    fx.connector
        .configure(|client| client.stall("prompts/list", 2));
    let id = fx.server.id;
    let mut watch = fx.prompts.watch();
    fx.connections.activate_server(id).await.unwrap();
    let client = fx.connector.client(id);
    eventually(|| client.calls("prompts/list") == 1).await;

    client.set_catalog(Catalog {
        prompts: vec![prompt("translate")],
        ..catalog()
    });
    fx.prompts.refresh(id).unwrap();
    eventually(|| client.calls("prompts/list") == 2).await;
    client.release.notify_waiters();

    eventually(|| loaded(&fx.prompts, id)).await;
    assert_eq!(names(&fx.prompts, id), Some(vec!["translate".to_string()]));

    let mut results = Vec::new();
    while let Some(state) = watch.try_recv() {
        if let Some(collection) = state.get(&id) {
            if !matches!(collection, Collection::Loading) {
                results.push(collection.clone());
            }
        }
    }
    assert_eq!(results.len(), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(names(&fx.prompts, id), Some(vec!["translate".to_string()]));
}

#[tokio::test]
async fn stale_generation_cannot_commit() {
    let fx = fixture();
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();
    eventually(|| loaded(&fx.tools, id)).await;

    let stale = fx.tools.inner.next_generation.load(Ordering::SeqCst);
    fx.tools.refresh(id).unwrap();
    assert!(!fx.tools.commit(
        id,
        stale,
        Collection::Error {
            message: "late".into()
        }
    ));
}

#[tokio::test]
async fn concurrent_lists_share_one_fetch() {
    let fx = fixture();
    fx.connector
        .configure(|client| client.stall("tools/list", 1));
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();
    let client = fx.connector.client(id);

    let cancel = CancellationToken::new();
    let (first, second) = tokio::join!(fx.tools.list(id, &cancel), async {
        let listed = fx.tools.list(id, &cancel);
        tokio::pin!(listed);
        tokio::select! {
            biased;
            result = &mut listed => result,
            _ = tokio::time::sleep(Duration::from_millis(20)) => {
                client.release.notify_waiters();
                listed.await
            }
        }
    });
    assert_eq!(first.unwrap().len(), 2);
    assert_eq!(second.unwrap().len(), 2);
    assert_eq!(client.calls("tools/list"), 1);

    fx.tools.list(id, &cancel).await.unwrap();
    assert_eq!(client.calls("tools/list"), 1);
}

#[tokio::test]
async fn list_wait_is_cancellable() {
    let fx = fixture();
    fx.connector
        .configure(|client| client.stall("tools/list", 1));
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        fx.tools.list(id, &cancel).await,
        Err(Error::Aborted)
    ));
}

#[tokio::test]
async fn unknown_and_unadvertised_connections() {
    let fx = fixture();
    fx.connector.capabilities.lock().unwrap().resources = false;
    let id = fx.server.id;
    let cancel = CancellationToken::new();
    assert!(matches!(
        fx.tools.list(id, &cancel).await,
        Err(Error::NotFound(_))
    ));

    fx.connections.activate_server(id).await.unwrap();
    assert!(fx.resources.list(id, &cancel).await.unwrap().is_empty());
    assert!(fx.resources.state().get(&id).is_none());
}

#[tokio::test]
async fn method_not_found_yields_empty_catalog() {
    let fx = fixture();
    fx.connector
        .configure(|client| client.unsupported("prompts/list"));
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();

    let prompts = fx.prompts.list(id, &CancellationToken::new()).await.unwrap();
    assert!(prompts.is_empty());
    assert!(loaded(&fx.prompts, id));
}

#[tokio::test]
async fn fetch_failure_is_error_state_and_list_retries() {
    let fx = fixture();
    fx.connector
        .configure(|client| client.failing.store(true, Ordering::SeqCst));
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();
    eventually(|| {
        matches!(
            fx.tools.state().get(&id),
            Some(Collection::Error { .. })
        )
    })
    .await;

    let client = fx.connector.client(id);
    let err = fx
        .tools
        .list(id, &CancellationToken::new())
        .await
        .expect_err("still failing");
    assert!(matches!(err, Error::Transport(_)));

    client.failing.store(false, Ordering::SeqCst);
    let tools = fx.tools.list(id, &CancellationToken::new()).await.unwrap();
    assert_eq!(tools.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_lists_after_failure_issue_one_request() {
    let fx = fixture();
    fx.connector
        .configure(|client| client.failing.store(true, Ordering::SeqCst));
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();
    eventually(|| {
        matches!(
            fx.tools.state().get(&id),
            Some(Collection::Error { .. })
        )
    })
    .await;

    let client = fx.connector.client(id);
    assert_eq!(client.calls("tools/list"), 1);
    client.failing.store(false, Ordering::SeqCst);
    client.stall("tools/list", 1);

    let listers: Vec<_> = (0..8)
        .map(|_| {
            let tools = fx.tools.clone();
            tokio::spawn(async move { tools.list(id, &CancellationToken::new()).await })
        })
        .collect();
    eventually(|| client.calls("tools/list") == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.calls("tools/list"), 2);

    client.release.notify_one();
    for lister in listers {
        assert_eq!(lister.await.unwrap().unwrap().len(), 2);
    }
    assert_eq!(client.calls("tools/list"), 2);
}

#[tokio::test]
async fn fetch_timeout_becomes_error_state() {
    let fx = fixture_with(McpPolicy {
        fetch_timeout_secs: 1,
        ..McpPolicy::default()
    });
    fx.connector
        .configure(|client| client.stall("tools/list", 1));
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(Collection::Error { message }) = fx.tools.state().get(&id) {
                assert!(message.contains("Timed out"));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("fetch bounded by timeout");
}

#[tokio::test]
async fn list_changed_notice_refetches() {
    let fx = fixture();
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();
    eventually(|| loaded(&fx.tools, id)).await;

    let client = fx.connector.client(id);
    client.set_catalog(Catalog {
        tools: vec![tool("deploy")],
        ..catalog()
    });
    client.announce(ServerNotice::PromptsChanged);
    client.announce(ServerNotice::ToolsChanged);
    eventually(|| names(&fx.tools, id) == Some(vec!["deploy".to_string()])).await;
}

#[tokio::test]
async fn transport_drop_clears_catalogs() {
    let fx = fixture();
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();
    eventually(|| loaded(&fx.tools, id)).await;

    fx.connector.client(id).drop_transport();
    eventually(|| fx.tools.state().get(&id).is_none()).await;
    assert!(!fx.tools.is_attached(id));
}

#[tokio::test]
async fn manager_created_late_attaches_existing_connections() {
    let fx = fixture();
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();

    let late = ToolsManager::new(&fx.connections);
    let tools = late.list(id, &CancellationToken::new()).await.unwrap();
    assert_eq!(tools.len(), 2);
}

#[tokio::test]
async fn tool_calls_resolve_through_uris() {
    let fx = fixture();
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();
    eventually(|| loaded(&fx.tools, id)).await;
    let cancel = CancellationToken::new();

    let (uri, _) = fx
        .tools
        .tools()
        .into_iter()
        .find(|(_, tool)| tool.name == "search")
        .unwrap();
    let mut arguments = Map::new();
    arguments.insert("query".into(), Value::from("rust"));
    let result = fx
        .tools
        .call_tool(&uri.to_string(), Some(arguments.clone()), &cancel)
        .await
        .unwrap();
    assert!(!result.content.is_empty());

    let client: Arc<FakeClient> = fx.connector.client(id);
    assert_eq!(
        client.tool_calls.lock().unwrap().as_slice(),
        &[("search".to_string(), Some(arguments))]
    );

    let missing = ToolUri::new(id, "rm-rf").to_string();
    assert!(matches!(
        fx.tools.call_tool(&missing, None, &cancel).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        fx.tools.call_tool("mcp-tool://garbage", None, &cancel).await,
        Err(Error::NotFound(_))
    ));
    let elsewhere = ToolUri::new(Uuid::new_v4(), "search").to_string();
    assert!(matches!(
        fx.tools.call_tool(&elsewhere, None, &cancel).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn prompts_and_resources_are_fetched_from_the_connection() {
    let fx = fixture();
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();
    let cancel = CancellationToken::new();

    let prompt = fx
        .prompts
        .get_prompt(
            id,
            "summarize",
            HashMap::from([("topic".to_string(), "rust".to_string())]),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(prompt.messages.len(), 1);

    let read = fx
        .resources
        .read_resource(id, "file:///notes.md", &cancel)
        .await
        .unwrap();
    assert_eq!(read.contents.len(), 1);

    assert!(matches!(
        fx.resources
            .read_resource(Uuid::new_v4(), "file:///x", &cancel)
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn raw_state_stream_tags_collections() {
    let fx = fixture();
    let id = fx.server.id;
    fx.connections.activate_server(id).await.unwrap();
    eventually(|| loaded(&fx.tools, id)).await;

    let mut raw = fx.tools.watch_raw();
    let first = raw.recv().await.unwrap();
    let entry = &first.state[id.to_string()];
    assert_eq!(entry["status"], "loaded");
    assert_eq!(entry["items"][0]["name"], "search");
}
