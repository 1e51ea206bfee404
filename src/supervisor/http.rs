//! Streamable HTTP transport.
//!
//! Every JSON-RPC message is a POST to the server URL. The server may answer
//! with a plain JSON body or with a short `text/event-stream` whose `message`
//! events carry the response. A session id handed out on `initialize` is
//! echoed on every later request.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client as HttpClient;

use super::errors::SupervisorError;
use super::transport::{
    next_request_id, JsonRpcChannel, RpcSession, SseParser, ToolSession, TransportStrategy,
};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// TCP connection timeout.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Header carrying the server-assigned session id.
const SESSION_HEADER: &str = "mcp-session-id";

// ─── Strategy ────────────────────────────────────────────────────────────────

/// Primary transport: JSON-RPC over individual HTTP POSTs.
pub struct StreamableHttpTransport {
    http: HttpClient,
}

impl StreamableHttpTransport {
    pub fn new() -> Result<Self, SupervisorError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SupervisorError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }
}

#[async_trait]
impl TransportStrategy for StreamableHttpTransport {
    fn name(&self) -> &'static str {
        "streamable-http"
    }

    async fn connect(
        &self,
        server: &str,
        url: &str,
    ) -> Result<Arc<dyn ToolSession>, SupervisorError> {
        let channel = HttpChannel {
            server: server.to_string(),
            url: url.to_string(),
            http: self.http.clone(),
            session_id: Mutex::new(None),
        };
        let session = RpcSession::establish(server, channel).await?;
        Ok(Arc::new(session))
    }
}

// ─── Channel ─────────────────────────────────────────────────────────────────

struct HttpChannel {
    server: String,
    url: String,
    http: HttpClient,
    session_id: Mutex<Option<String>>,
}

impl HttpChannel {
    fn transport_error(&self, reason: String) -> SupervisorError {
        SupervisorError::TransportError {
            server: self.server.clone(),
            reason,
        }
    }

    fn current_session(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<reqwest::Response, SupervisorError> {
        let mut request = self
            .http
            .post(&self.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.current_session() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(format!("POST {} failed: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.transport_error(format!("HTTP {status} from {}", self.url)));
        }

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self
                .session_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(session.to_string());
        }

        Ok(response)
    }
}

#[async_trait]
impl JsonRpcChannel for HttpChannel {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, SupervisorError> {
        let id = next_request_id();
        let response = self.post(&JsonRpcRequest::new(id, method, params)).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(format!("failed to read response body: {e}")))?;

        parse_response_body(&content_type, &body, id).map_err(|reason| self.transport_error(reason))
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), SupervisorError> {
        self.post(&JsonRpcNotification::new(method, params)).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        let Some(session) = self.current_session() else {
            return;
        };
        // Best-effort: servers without session support answer 405.
        let _ = self
            .http
            .delete(&self.url)
            .header(SESSION_HEADER, session)
            .send()
            .await;
    }
}

// ─── Response Parsing ────────────────────────────────────────────────────────

/// Decode a POST response body into the JSON-RPC response for `expected_id`.
pub(crate) fn parse_response_body(
    content_type: &str,
    body: &str,
    expected_id: u64,
) -> Result<JsonRpcResponse, String> {
    if content_type.starts_with("text/event-stream") {
        let mut parser = SseParser::new();
        let mut events = parser.push_str(body);
        events.extend(parser.finish());

        return events
            .into_iter()
            .filter(|event| event.event == "message")
            .filter_map(|event| serde_json::from_str::<JsonRpcResponse>(&event.data).ok())
            .find(|resp| resp.id == Some(expected_id))
            .ok_or_else(|| format!("event stream closed without a response to request {expected_id}"));
    }

    let response: JsonRpcResponse =
        serde_json::from_str(body).map_err(|e| format!("malformed JSON-RPC response: {e}"))?;
    if response.id.is_some() && response.id != Some(expected_id) {
        return Err(format!(
            "response id {:?} does not match request {expected_id}",
            response.id
        ));
    }
    Ok(response)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
