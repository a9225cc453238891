//! Error taxonomy shared by the state, bridge and MCP layers.
//!
//! Connection and catalog failures are normally recorded as tagged state
//! rather than returned; these variants surface for direct calls and for
//! programmer errors.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Handshake, socket or process failure for one MCP server.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON-RPC error returned by an MCP server.
    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Cancellation observed mid-operation. A clean stop, not a failure.
    #[error("operation aborted")]
    Aborted,

    /// A misbehaving peer tripped a guard (pagination ceiling, bad URI).
    #[error("protocol guard: {0}")]
    ProtocolGuard(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport(message.into())
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ProtocolGuard(err.to_string())
    }
}
