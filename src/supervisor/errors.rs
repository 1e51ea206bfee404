//! Supervisor error types.

use thiserror::Error;

/// Substrings that mark an otherwise unstructured error message as a
/// connection-class failure. Only consulted for variants that do not carry
/// their own category (see [`SupervisorError::is_connection_class`]).
const CONNECTION_SIGNATURES: &[&str] = &[
    "not connected",
    "connection refused",
    "econnrefused",
    "econnreset",
    "connection reset",
    "broken pipe",
    "timed out",
    "timeout",
    "socket hang up",
    "transport closed",
    "stream closed",
];

/// Errors that can occur while supervising remote tool servers.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A server descriptor is missing required fields or is malformed.
    #[error("invalid server descriptor '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },

    /// Every transport strategy failed to establish a session.
    #[error("failed to connect to server '{server}': {reason}")]
    ConnectionFailed { server: String, reason: String },

    /// I/O or framing failure on an established session.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A remote operation exceeded its time budget.
    #[error("{operation} on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// `tools/list` failed on a session believed to be healthy.
    #[error("tool discovery failed for server '{server}': {reason}")]
    ToolDiscoveryFailed { server: String, reason: String },

    /// No discovered tool satisfies the selection policy.
    #[error("no suitable tool on server '{server}' (available: [{}])", .available.join(", "))]
    NoToolAvailable {
        server: String,
        available: Vec<String>,
    },

    /// Mapped arguments do not match the tool's declared input schema.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The tool ran but reported a failure.
    #[error("tool '{tool}' failed: {reason}")]
    ToolExecutionFailed { tool: String, reason: String },

    /// An operation needed a live session but there was none.
    #[error("server '{server}' is not connected")]
    NotConnected { server: String },

    /// Configuration error (missing file, bad YAML).
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl SupervisorError {
    /// Whether this error means the session itself is gone or unusable.
    ///
    /// Structured transport variants are classified by construction. Text
    /// matching is the fallback for errors reported by the remote side.
    pub fn is_connection_class(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. }
            | Self::TransportError { .. }
            | Self::Timeout { .. }
            | Self::NotConnected { .. } => true,
            Self::ServerError { message, .. } => matches_connection_signature(message),
            Self::ToolExecutionFailed { reason, .. } => matches_connection_signature(reason),
            _ => false,
        }
    }
}

/// Case-insensitive check against the known connection-failure phrases.
pub fn matches_connection_signature(text: &str) -> bool {
    let lower = text.to_lowercase();
    CONNECTION_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
