//! Transport boundary for remote tool servers.
//!
//! A [`TransportStrategy`] knows one way of opening a session with a server
//! endpoint. Connections try an ordered list of strategies until one
//! succeeds, so adding a third protocol never touches the connection logic.
//!
//! Both shipped strategies speak JSON-RPC 2.0 over HTTP. They only differ in
//! how requests are carried ([`JsonRpcChannel`]); the protocol methods on top
//! (`initialize`, `tools/list`, `tools/call`) live in [`RpcSession`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::errors::SupervisorError;
use super::types::{JsonRpcResponse, ListToolsResult, Tool};

/// Protocol revision announced during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// An established session with one server.
#[async_trait]
pub trait ToolSession: Send + Sync {
    /// Fetch the server's current tool list.
    async fn list_tools(&self) -> Result<Vec<Tool>, SupervisorError>;

    /// Invoke a tool and return its raw result payload.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, SupervisorError>;

    /// Release the session. Best-effort; never fails.
    async fn close(&self);
}

/// One way of opening a [`ToolSession`] against an endpoint.
#[async_trait]
pub trait TransportStrategy: Send + Sync {
    /// Short label used in logs and error messages.
    fn name(&self) -> &'static str;

    async fn connect(
        &self,
        server: &str,
        url: &str,
    ) -> Result<Arc<dyn ToolSession>, SupervisorError>;
}

/// Request/response plumbing underneath an [`RpcSession`].
#[async_trait]
pub trait JsonRpcChannel: Send + Sync {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, SupervisorError>;

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), SupervisorError>;

    async fn shutdown(&self);
}

// ─── RpcSession ──────────────────────────────────────────────────────────────

/// Tool-protocol session over any [`JsonRpcChannel`].
pub struct RpcSession<C> {
    server: String,
    channel: C,
}

impl<C: JsonRpcChannel> RpcSession<C> {
    /// Run the `initialize` handshake and return a ready session.
    pub async fn establish(server: &str, channel: C) -> Result<Self, SupervisorError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let response = channel.request("initialize", Some(params)).await?;
        extract_result(response)?;
        channel.notify("notifications/initialized", None).await?;

        tracing::debug!(server = server, "session initialized");

        Ok(Self {
            server: server.to_string(),
            channel,
        })
    }
}

#[async_trait]
impl<C: JsonRpcChannel + 'static> ToolSession for RpcSession<C> {
    async fn list_tools(&self) -> Result<Vec<Tool>, SupervisorError> {
        let response = self.channel.request("tools/list", None).await?;
        let result = extract_result(response)?;
        let parsed: ListToolsResult =
            serde_json::from_value(result).map_err(|e| SupervisorError::TransportError {
                server: self.server.clone(),
                reason: format!("malformed tools/list result: {e}"),
            })?;
        Ok(parsed.tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, SupervisorError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let response = self.channel.request("tools/call", Some(params)).await?;
        let result = extract_result(response)?;

        if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
            return Err(SupervisorError::ToolExecutionFailed {
                tool: name.to_string(),
                reason: content_text(&result).unwrap_or_else(|| "tool reported an error".into()),
            });
        }

        Ok(result)
    }

    async fn close(&self) {
        self.channel.shutdown().await;
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `SupervisorError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, SupervisorError> {
    if let Some(err) = response.error {
        return Err(SupervisorError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(SupervisorError::ServerError {
        code: -32603,
        message: "response missing both result and error".into(),
        data: None,
    })
}

/// Join the `text` items of a tool result's `content` array.
fn content_text(result: &serde_json::Value) -> Option<String> {
    let items = result.get("content")?.as_array()?;
    let text: Vec<&str> = items
        .iter()
        .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text.join("\n"))
    }
}

// ─── SSE Framing ─────────────────────────────────────────────────────────────

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the server did not name one.
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence or a
/// `\r\n` pair, so undecoded input is carried over between calls.
#[derive(Debug, Default)]
pub struct SseParser {
    pending_bytes: Vec<u8>,
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event completed by them.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending_bytes.extend_from_slice(bytes);

        let valid = match std::str::from_utf8(&self.pending_bytes) {
            Ok(s) => s.len(),
            // Incomplete trailing sequence: keep it for the next chunk.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending_bytes.len(),
        };

        let text = String::from_utf8_lossy(&self.pending_bytes[..valid]).into_owned();
        self.pending_bytes.drain(..valid);
        self.push_str(&text)
    }

    /// Feed decoded text, returning every event completed by it.
    pub fn push_str(&mut self, text: &str) -> Vec<SseEvent> {
        self.buffer.push_str(text);
        if self.buffer.contains("\r\n") {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_event_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_event_block(&rest)
    }
}

/// Parse one blank-line-delimited event block. Comment-only blocks yield `None`.
fn parse_event_block(block: &str) -> Option<SseEvent> {
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::types::JsonRpcError;

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(1),
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            SupervisorError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(1),
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp),
            Err(SupervisorError::ServerError { .. })
        ));
    }

    #[test]
    fn test_content_text_joins_text_items() {
        let result = serde_json::json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "line two"}
            ]
        });
        assert_eq!(content_text(&result).unwrap(), "line one\nline two");
        assert!(content_text(&serde_json::json!({})).is_none());
    }

    #[test]
    fn test_sse_parser_named_and_default_events() {
        let mut parser = SseParser::new();
        let events = parser.push_str("event: endpoint\ndata: /messages?id=1\n\ndata: {\"a\":1}\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "endpoint".into(),
                    data: "/messages?id=1".into()
                },
                SseEvent {
                    event: "message".into(),
                    data: "{\"a\":1}".into()
                },
            ]
        );
    }

    #[test]
    fn test_sse_parser_handles_split_chunks_and_crlf() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("event: message\r\nda").is_empty());
        assert!(parser.push_str("ta: hello\r").is_empty());
        let events = parser.push_str("\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_sse_parser_multiline_data_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.push_str(": keep-alive\n\ndata: a\ndata: b\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn test_sse_parser_split_utf8_sequence() {
        let mut parser = SseParser::new();
        let bytes = "data: café\n\n".as_bytes();
        // Split inside the two-byte 'é'.
        let cut = bytes.len() - 3;
        assert!(parser.push_bytes(&bytes[..cut]).is_empty());
        let events = parser.push_bytes(&bytes[cut..]);
        assert_eq!(events[0].data, "café");
    }

    #[test]
    fn test_sse_parser_finish_flushes_tail() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        assert_eq!(parser.finish().unwrap().data, "tail");
        assert!(parser.finish().is_none());
    }
}
