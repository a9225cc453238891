use super::client::McpClient;
use rust_mcp_schema::InitializeResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Which catalogs a server offers and whether it announces changes to them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub tools: bool,
    pub tools_list_changed: bool,
    pub prompts: bool,
    pub prompts_list_changed: bool,
    pub resources: bool,
    pub resources_list_changed: bool,
}

impl Capabilities {
    pub fn from_initialize(result: &InitializeResult) -> Self {
        let caps = serde_json::to_value(&result.capabilities).unwrap_or(Value::Null);
        let advertised = |name: &str| caps.get(name).is_some_and(|value| !value.is_null());
        let list_changed = |name: &str| {
            caps.get(name)
                .and_then(|value| value.get("listChanged"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        Self {
            tools: advertised("tools"),
            tools_list_changed: list_changed("tools"),
            prompts: advertised("prompts"),
            prompts_list_changed: list_changed("prompts"),
            resources: advertised("resources"),
            resources_list_changed: list_changed("resources"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
}

impl ServerInfo {
    pub fn from_initialize(result: &InitializeResult) -> Self {
        Self {
            name: result.server_info.name.clone(),
            version: result.server_info.version.clone(),
            protocol_version: result.protocol_version.clone(),
        }
    }
}

/// Status of one configured server. Replaced wholesale on every change.
///
/// Serializes to exactly its [`ConnectionView`]: the client handle and the
/// attempt counter never leave the process.
#[derive(Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Connection {
    Connecting {
        #[serde(skip)]
        attempt: u64,
    },
    #[serde(rename_all = "camelCase")]
    Connected {
        capabilities: Capabilities,
        server_info: Option<ServerInfo>,
        project_id: Option<String>,
        #[serde(skip)]
        client: Arc<dyn McpClient>,
    },
    Error {
        message: String,
    },
}

impl Connection {
    pub fn is_live(&self) -> bool {
        matches!(self, Connection::Connecting { .. } | Connection::Connected { .. })
    }

    pub fn client(&self) -> Option<&Arc<dyn McpClient>> {
        match self {
            Connection::Connected { client, .. } => Some(client),
            _ => None,
        }
    }

    pub fn view(&self) -> ConnectionView {
        match self {
            Connection::Connecting { .. } => ConnectionView::Connecting,
            Connection::Connected {
                capabilities,
                server_info,
                project_id,
                ..
            } => ConnectionView::Connected {
                capabilities: *capabilities,
                server_info: server_info.clone(),
                project_id: project_id.clone(),
            },
            Connection::Error { message } => ConnectionView::Error {
                message: message.clone(),
            },
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.view(), f)
    }
}

/// What the UI process sees of a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionView {
    Connecting,
    #[serde(rename_all = "camelCase")]
    Connected {
        capabilities: Capabilities,
        server_info: Option<ServerInfo>,
        project_id: Option<String>,
    },
    Error {
        message: String,
    },
}
