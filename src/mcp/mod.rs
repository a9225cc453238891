//! Model Context Protocol connections and their cached catalogs.
//!
//! [`manager::ConnectionManager`] owns one connection per configured server;
//! [`capability::CapabilityManager`] instances follow its events and keep the
//! tool, prompt and resource catalogs of every connected server.

pub mod capability;
pub mod client;
pub mod connection;
pub mod manager;
pub mod protocol;
pub mod store;
pub mod tool_uri;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use capability::{
    CapabilityKind, CapabilityManager, Collection, Prompts, PromptsManager, Resources,
    ResourcesManager, Tools, ToolsManager,
};
pub use client::{Handshake, McpClient, McpConnector, Page, ServerNotice};
pub use connection::{Capabilities, Connection, ConnectionView, ServerInfo};
pub use manager::{ConnectionEvent, ConnectionManager};
pub use store::{ConfigServerStore, MemoryServerStore, ServerStore};
pub use tool_uri::ToolUri;
pub use transport::TransportConnector;
