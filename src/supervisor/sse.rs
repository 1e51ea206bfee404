//! HTTP+SSE transport (legacy fallback).
//!
//! A GET opens a long-lived event stream. The first `endpoint` event names
//! the URL requests are POSTed to; responses come back as `message` events
//! on the stream and are matched to waiting callers by request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client as HttpClient, Url};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::SupervisorError;
use super::http::CONNECT_TIMEOUT;
use super::transport::{
    next_request_id, JsonRpcChannel, RpcSession, SseEvent, SseParser, ToolSession,
    TransportStrategy,
};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

type ResponseSender = oneshot::Sender<Result<JsonRpcResponse, SupervisorError>>;
type PendingMap = Arc<Mutex<HashMap<u64, ResponseSender>>>;

// ─── Strategy ────────────────────────────────────────────────────────────────

/// Secondary transport: requests by POST, responses over a GET event stream.
pub struct SseTransport {
    http: HttpClient,
}

impl SseTransport {
    pub fn new() -> Result<Self, SupervisorError> {
        // No overall request timeout: the event stream stays open for the
        // lifetime of the session.
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SupervisorError::ConfigError {
                reason: format!("failed to build SSE HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }
}

#[async_trait]
impl TransportStrategy for SseTransport {
    fn name(&self) -> &'static str {
        "sse"
    }

    async fn connect(
        &self,
        server: &str,
        url: &str,
    ) -> Result<Arc<dyn ToolSession>, SupervisorError> {
        let channel = SseChannel::open(server, url, self.http.clone()).await?;
        let session = RpcSession::establish(server, channel).await?;
        Ok(Arc::new(session))
    }
}

// ─── Channel ─────────────────────────────────────────────────────────────────

struct SseChannel {
    server: String,
    http: HttpClient,
    endpoint: Url,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader: ReaderTask,
}

/// The event-stream reader. Aborted when dropped, so a connect abandoned
/// before the endpoint arrives (e.g. by the caller's timeout) closes the
/// stream with it.
struct ReaderTask(JoinHandle<()>);

impl ReaderTask {
    fn abort(&self) {
        self.0.abort();
    }
}

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl SseChannel {
    async fn open(server: &str, url: &str, http: HttpClient) -> Result<Self, SupervisorError> {
        let connect_error = |reason: String| SupervisorError::ConnectionFailed {
            server: server.to_string(),
            reason,
        };

        let base = Url::parse(url).map_err(|e| connect_error(format!("bad url '{url}': {e}")))?;

        let response = http
            .get(base.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| connect_error(format!("GET {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(connect_error(format!("HTTP {status} opening event stream")));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let reader = ReaderTask(tokio::spawn(read_events(
            server.to_string(),
            base,
            response,
            endpoint_tx,
            Arc::clone(&pending),
            Arc::clone(&closed),
        )));

        let Ok(endpoint) = endpoint_rx.await else {
            return Err(connect_error(
                "event stream closed before announcing an endpoint".into(),
            ));
        };

        tracing::debug!(server = server, endpoint = %endpoint, "SSE endpoint announced");

        Ok(Self {
            server: server.to_string(),
            http,
            endpoint,
            pending,
            closed,
            reader,
        })
    }

    fn transport_error(&self, reason: impl Into<String>) -> SupervisorError {
        SupervisorError::TransportError {
            server: self.server.clone(),
            reason: reason.into(),
        }
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<(), SupervisorError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(format!("POST {} failed: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.transport_error(format!("HTTP {status} from {}", self.endpoint)));
        }
        Ok(())
    }
}

/// Removes a request's pending slot however the wait ends (response,
/// error, or the caller's timeout dropping the future).
struct PendingGuard {
    pending: PendingMap,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[async_trait]
impl JsonRpcChannel for SseChannel {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, SupervisorError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.transport_error("stream closed"));
        }

        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id,
        };

        // The reader may have drained the map between the check and insert.
        if self.closed.load(Ordering::Acquire) {
            return Err(self.transport_error("stream closed"));
        }

        self.post(&JsonRpcRequest::new(id, method, params)).await?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.transport_error("stream closed")),
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), SupervisorError> {
        self.post(&JsonRpcNotification::new(method, params)).await
    }

    async fn shutdown(&self) {
        self.reader.abort();
        self.closed.store(true, Ordering::Release);
        fail_pending(&self.pending, &self.server, "transport closed");
    }
}

// ─── Reader Task ─────────────────────────────────────────────────────────────

async fn read_events(
    server: String,
    base: Url,
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<Url>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();

    let reason = loop {
        let events = match stream.next().await {
            Some(Ok(bytes)) => parser.push_bytes(&bytes),
            Some(Err(e)) => break format!("stream read error: {e}"),
            None => {
                if let Some(event) = parser.finish() {
                    dispatch_event(&server, &base, event, &mut endpoint_tx, &pending);
                }
                break "stream closed by server".to_string();
            }
        };
        for event in events {
            dispatch_event(&server, &base, event, &mut endpoint_tx, &pending);
        }
    };

    tracing::debug!(server = %server, reason = %reason, "SSE stream ended");
    closed.store(true, Ordering::Release);
    fail_pending(&pending, &server, &reason);
}

fn dispatch_event(
    server: &str,
    base: &Url,
    event: SseEvent,
    endpoint_tx: &mut Option<oneshot::Sender<Url>>,
    pending: &PendingMap,
) {
    match event.event.as_str() {
        "endpoint" => {
            let Some(tx) = endpoint_tx.take() else {
                return;
            };
            match base.join(event.data.trim()) {
                Ok(url) => {
                    let _ = tx.send(url);
                }
                Err(e) => {
                    tracing::warn!(server = server, data = %event.data, error = %e, "unusable SSE endpoint");
                }
            }
        }
        "message" => {
            let response: JsonRpcResponse = match serde_json::from_str(&event.data) {
                Ok(r) => r,
                Err(_) => return, // not a response (server log line, notification)
            };
            let Some(id) = response.id else {
                return;
            };
            let sender = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            if let Some(sender) = sender {
                let _ = sender.send(Ok(response));
            }
        }
        _ => {}
    }
}

/// Fail every waiting request, e.g. after the stream dropped.
fn fail_pending(pending: &PendingMap, server: &str, reason: &str) {
    let drained: Vec<ResponseSender> = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .map(|(_, tx)| tx)
        .collect();
    for tx in drained {
        let _ = tx.send(Err(SupervisorError::TransportError {
            server: server.to_string(),
            reason: reason.to_string(),
        }));
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn base() -> Url {
        Url::parse("http://localhost:9000/sse").unwrap()
    }

    #[test]
    fn test_endpoint_event_resolves_relative_url() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        let mut endpoint_tx = Some(tx);

        let event = SseEvent {
            event: "endpoint".into(),
            data: "/messages?sessionId=abc".into(),
        };
        dispatch_event("s", &base(), event, &mut endpoint_tx, &pending);

        assert!(endpoint_tx.is_none());
        let url = rx.try_recv().unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/messages?sessionId=abc");
    }

    #[test]
    fn test_message_event_routes_to_pending_request() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(42, tx);

        let event = SseEvent {
            event: "message".into(),
            data: r#"{"jsonrpc":"2.0","id":42,"result":{"tools":[]}}"#.into(),
        };
        dispatch_event("s", &base(), event, &mut None, &pending);

        let resp = rx.try_recv().unwrap().unwrap();
        assert_eq!(resp.id, Some(42));
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fail_pending_drains_with_transport_error() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(1, tx);

        fail_pending(&pending, "s", "stream closed by server");

        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(err.is_connection_class());
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pending_guard_removes_slot() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, _rx) = oneshot::channel();
        pending.lock().unwrap().insert(5, tx);
        drop(PendingGuard {
            pending: Arc::clone(&pending),
            id: 5,
        });
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_connect_closes_event_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Opens the stream but never announces an endpoint, then reports
        // whether the client hung up.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let mut head = Vec::new();
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                head.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                      cache-control: no-cache\r\n\r\n: keep-alive\n\n",
                )
                .await
                .unwrap();
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        });

        let transport = SseTransport::new().unwrap();
        let url = format!("http://{addr}/sse");
        let attempt =
            tokio::time::timeout(Duration::from_millis(300), transport.connect("s", &url)).await;
        assert!(attempt.is_err(), "no endpoint was ever announced");

        tokio::time::timeout(Duration::from_secs(3), server)
            .await
            .expect("event stream left open after the connect was abandoned")
            .unwrap();
    }
}
