use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// One configured MCP server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct McpServerConfig {
    pub id: Uuid,
    pub display_name: String,
    /// `stdio` or `streamable-http` (the default).
    pub transport: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub base_url: Option<String>,
    /// Extra HTTP headers sent with every request, e.g. `Authorization`.
    pub headers: Option<HashMap<String, String>>,
    pub protocol_version: Option<String>,
    /// Project the server is scoped to, if any.
    pub project_id: Option<String>,
}

impl McpServerConfig {
    pub fn stdio(display_name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.to_string(),
            transport: Some("stdio".to_string()),
            command: Some(command.to_string()),
            args: Some(args.iter().map(|arg| arg.to_string()).collect()),
            env: None,
            base_url: None,
            headers: None,
            protocol_version: None,
            project_id: None,
        }
    }

    pub fn http(display_name: &str, base_url: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.to_string(),
            transport: Some("streamable-http".to_string()),
            command: None,
            args: None,
            env: None,
            base_url: Some(base_url.to_string()),
            headers: None,
            protocol_version: None,
            project_id: None,
        }
    }
}

/// Limits applied to every MCP server. The page ceilings guard against
/// servers that never stop returning a next cursor.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct McpPolicy {
    pub tools_page_limit: usize,
    pub prompts_page_limit: usize,
    pub resources_page_limit: usize,
    pub handshake_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Servers activated at once during startup.
    pub startup_concurrency: usize,
}

impl Default for McpPolicy {
    fn default() -> Self {
        Self {
            tools_page_limit: 10,
            prompts_page_limit: 16,
            resources_page_limit: 16,
            handshake_timeout_secs: 30,
            fetch_timeout_secs: 60,
            startup_concurrency: 3,
        }
    }
}

impl McpPolicy {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Tracing filter used when `RUST_LOG` is unset (e.g. "info", "cordage=debug").
    pub log_level: Option<String>,
    /// Directory for persisted state stores. Defaults to the platform data dir.
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub mcp: McpPolicy,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

impl Config {
    pub fn server(&self, id: Uuid) -> Option<&McpServerConfig> {
        self.mcp_servers.iter().find(|server| server.id == id)
    }

    /// Replaces the server with the same id, or appends it.
    pub fn upsert_server(&mut self, server: McpServerConfig) {
        match self.mcp_servers.iter_mut().find(|existing| existing.id == server.id) {
            Some(existing) => *existing = server,
            None => self.mcp_servers.push(server),
        }
    }

    pub fn remove_server(&mut self, id: Uuid) -> bool {
        let before = self.mcp_servers.len();
        self.mcp_servers.retain(|server| server.id != id);
        self.mcp_servers.len() != before
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
