//! JSON-RPC message helpers shared by the MCP transports.

use crate::config::McpServerConfig;
use crate::error::{Error, Result};
use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult,
    PaginatedRequestParams, RpcError, LATEST_PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

pub fn requested_protocol_version(config: &McpServerConfig) -> String {
    config
        .protocol_version
        .clone()
        .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string())
}

pub fn client_details_for(config: &McpServerConfig) -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "cordage".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Cordage MCP Client".to_string()),
            description: Some("Cordage backend MCP connection manager".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: requested_protocol_version(config),
    }
}

pub fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

pub fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult> {
    let result: InitializeResult = parse_response(message)?;
    if result.protocol_version.trim().is_empty() {
        return Err(Error::transport("Unexpected initialize response."));
    }
    Ok(result)
}

pub fn parse_response<T: DeserializeOwned>(message: ServerMessage) -> Result<T> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<T>(value)
        .map_err(|err| Error::transport(format!("Malformed MCP response: {err}")))
}

pub fn parse_response_value(message: ServerMessage) -> Result<Value> {
    match message {
        ServerMessage::Response(response) => serde_json::to_value(&response.result)
            .map_err(|err| Error::transport(err.to_string())),
        ServerMessage::Error(error) => Err(Error::Rpc {
            code: error.error.code,
            message: format_rpc_error(&error.error),
        }),
        other => Err(Error::transport(format!(
            "Unexpected MCP server message: {other:?}"
        ))),
    }
}

pub fn is_method_not_found(err: &Error) -> bool {
    matches!(err, Error::Rpc { code, .. } if *code == MCP_METHOD_NOT_FOUND)
}

pub fn format_rpc_error(error: &RpcError) -> String {
    let mut output = error.message.clone();
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string_pretty(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}

/// Classifies a raw JSON-RPC payload by its `method` and `id` members.
#[derive(Debug, PartialEq)]
pub enum Incoming<'a> {
    Notification { method: &'a str },
    Request { id: &'a Value, method: &'a str },
    Reply,
}

pub fn classify(value: &Value) -> Incoming<'_> {
    match (value.get("method").and_then(Value::as_str), value.get("id")) {
        (Some(method), None) => Incoming::Notification { method },
        (Some(method), Some(id)) => Incoming::Request { id, method },
        (None, _) => Incoming::Reply,
    }
}

/// Reply to a server-initiated request. Only `ping` is answered with a
/// result; everything else is refused as unsupported.
pub fn reply_to_server_request(id: &Value, method: &str) -> Value {
    if method == "ping" {
        serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
    } else {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": MCP_METHOD_NOT_FOUND,
                "message": format!("Method not supported by client: {method}")
            }
        })
    }
}
