//! Opaque identifiers for tools exposed to the model.

use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const SCHEME: &str = "mcp-tool://";

/// `mcp-tool://<connection uuid>/<tool name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolUri {
    pub connection_id: Uuid,
    pub name: String,
}

impl ToolUri {
    pub fn new(connection_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            connection_id,
            name: name.into(),
        }
    }

    /// Parses `uri`, returning `None` for anything that is not a well-formed
    /// tool URI.
    pub fn resolve(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix(SCHEME)?;
        let (id, name) = rest.split_once('/')?;
        if name.is_empty() {
            return None;
        }
        let connection_id = Uuid::parse_str(id).ok()?;
        Some(Self::new(connection_id, name))
    }
}

impl fmt::Display for ToolUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}/{}", self.connection_id, self.name)
    }
}

impl FromStr for ToolUri {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::resolve(s).ok_or_else(|| crate::Error::not_found(format!("unknown tool URI: {s}")))
    }
}
