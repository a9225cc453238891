//! Streaming bridge between the backend and the UI process.
//!
//! Two call shapes cross the boundary: request/response ([`BridgeClient::call`])
//! and request/stream ([`BridgeClient::open_stream`]). Streams are pull-based,
//! single-consumer and cancellable from either side; values arrive in the
//! order the producer emitted them.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

pub mod client;
pub mod mirror;
pub mod server;
pub mod service;
pub mod stream;
pub mod wire;


pub use client::{BridgeClient, RemoteStream};
pub use mirror::StateMirror;
pub use server::BridgeServer;
pub use service::{BridgeService, Router, ValueSource};
pub use stream::ValueStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Rpc,
    Aborted,
    ProtocolGuard,
    IllegalState,
    Persistence,
    NotFound,
    Config,
    UnknownMethod,
    InvalidParams,
    Disconnected,
}

/// Error as it travels across the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ThisError)]
#[error("{message}")]
pub struct BridgeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BridgeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "operation aborted")
    }

    pub fn disconnected() -> Self {
        Self::new(ErrorKind::Disconnected, "bridge connection closed")
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(ErrorKind::UnknownMethod, format!("unknown method: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams, message)
    }
}

impl From<Error> for BridgeError {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Transport(_) => ErrorKind::Transport,
            Error::Rpc { .. } => ErrorKind::Rpc,
            Error::Aborted => ErrorKind::Aborted,
            Error::ProtocolGuard(_) => ErrorKind::ProtocolGuard,
            Error::IllegalState(_) => ErrorKind::IllegalState,
            Error::Persistence(_) => ErrorKind::Persistence,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Config(_) => ErrorKind::Config,
        };
        Self::new(kind, err.to_string())
    }
}
