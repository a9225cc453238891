//! Cordage is the backend half of an MCP-aware chat client: it keeps
//! connections to Model Context Protocol servers, caches what they offer and
//! serves all of it to a UI process over a streaming bridge.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`state`] holds observable, patch-producing state containers that every
//!   service publishes through.
//! - [`bridge`] carries request/response calls and cancellable value streams
//!   between processes, and mirrors remote state locally.
//! - [`mcp`] owns server connections ([`mcp::ConnectionManager`]) and the
//!   tool, prompt and resource catalogs built on top of them.
//! - [`services`] exposes those managers as bridge services.
//! - [`sync`] provides the cancellable mutex and cancellation helpers used
//!   throughout.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod mcp;
pub mod services;
pub mod state;
pub mod sync;

pub use error::{Error, Result};
