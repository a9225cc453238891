//! TOML configuration: MCP server definitions and runtime policy.

pub mod data;
pub mod io;
pub mod orchestrator;

pub use data::{path_display, Config, McpPolicy, McpServerConfig};
pub use io::ConfigError;
pub use orchestrator::ConfigOrchestrator;
