//! Shared types for the supervisor.
//!
//! JSON-RPC 2.0 envelopes, server descriptors, and the structured results
//! and status snapshots handed back to callers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::errors::SupervisorError;

/// Parameters supplied by the query interpreter, keyed by standard name.
pub type QueryParameters = serde_json::Map<String, serde_json::Value>;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    #[serde(default)]
    pub jsonrpc: String,
    pub id: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

// ─── Tools ───────────────────────────────────────────────────────────────────

/// A tool as discovered from a remote server at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "input_schema")]
    pub input_schema: Option<serde_json::Value>,
}

/// `tools/list` result payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<Tool>,
}

// ─── Descriptors ─────────────────────────────────────────────────────────────

/// Maps standard parameter names onto one tool's own parameter names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMapping {
    #[serde(alias = "tool_name")]
    pub tool_name: String,
    #[serde(default, alias = "parameter_mapping")]
    pub parameter_mapping: HashMap<String, String>,
}

/// Static description of one remote server. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Declared tool preferences, in priority order.
    #[serde(default, alias = "tool_mappings", alias = "toolMappings")]
    pub tools: Vec<ToolMapping>,
    #[serde(default, alias = "default_tool")]
    pub default_tool: Option<String>,
}

impl ServerDescriptor {
    /// Minimal descriptor with just a name and endpoint.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            description: String::new(),
            keywords: Vec::new(),
            tools: Vec::new(),
            default_tool: None,
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tool_mapping(mut self, mapping: ToolMapping) -> Self {
        self.tools.push(mapping);
        self
    }

    pub fn with_default_tool(mut self, tool: impl Into<String>) -> Self {
        self.default_tool = Some(tool.into());
        self
    }

    /// Reject descriptors that cannot possibly be connected to.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        let invalid = |reason: &str| SupervisorError::InvalidDescriptor {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("missing name"));
        }
        if self.url.trim().is_empty() {
            return Err(invalid("missing url"));
        }

        let parsed = reqwest::Url::parse(self.url.trim())
            .map_err(|e| invalid(&format!("unparseable url '{}': {e}", self.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(&format!(
                "unsupported url scheme '{}'",
                parsed.scheme()
            )));
        }

        Ok(())
    }
}

// ─── Connection State ────────────────────────────────────────────────────────

/// Externally observable connection state. There is no "connecting" state:
/// connect is awaited to completion or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

// ─── Query Results ───────────────────────────────────────────────────────────

/// Category of a failed query, mirroring the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryErrorKind {
    Connection,
    ToolDiscovery,
    ToolSelection,
    InvalidArguments,
    Execution,
    Routing,
}

/// Outcome of running a query against one server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<QueryErrorKind>,
    pub server_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_used: Option<String>,
    pub execution_time_ms: u64,
}

/// Server name carried by the synthetic result returned when routing finds
/// nothing to ask.
pub const NO_SERVER: &str = "none";

impl QueryResult {
    pub fn ok(
        server_name: &str,
        tool_used: &str,
        data: serde_json::Value,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
            server_name: server_name.to_string(),
            tool_used: Some(tool_used.to_string()),
            execution_time_ms,
        }
    }

    pub fn failed(server_name: &str, kind: QueryErrorKind, error: impl ToString) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            error_kind: Some(kind),
            server_name: server_name.to_string(),
            tool_used: None,
            execution_time_ms: 0,
        }
    }

    pub fn with_tool(mut self, tool: &str) -> Self {
        self.tool_used = Some(tool.to_string());
        self
    }

    pub fn with_elapsed(mut self, ms: u64) -> Self {
        self.execution_time_ms = ms;
        self
    }

    /// The single result returned when no server can answer a query.
    pub fn no_relevant_servers() -> Self {
        Self::failed(
            NO_SERVER,
            QueryErrorKind::Routing,
            "No relevant servers available for this query",
        )
    }

    pub fn is_connection_failure(&self) -> bool {
        self.error_kind == Some(QueryErrorKind::Connection)
    }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Backoff progress for a disconnected server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionInfo {
    pub attempt_count: u32,
    pub seconds_until_next_retry: u64,
    pub next_retry_delay_ms: u64,
    pub last_attempt_at: chrono::DateTime<chrono::Utc>,
}

/// Per-server status for the upward status API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    pub connected: bool,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnection_info: Option<ReconnectionInfo>,
}

/// Aggregate counts across the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total_servers: usize,
    pub connected_servers: usize,
    pub disconnected_servers: usize,
    pub reconnection_active: bool,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
