//! In-memory transport and observer doubles for supervisor tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::connection::ConnectionObserver;
use super::errors::SupervisorError;
use super::transport::{ToolSession, TransportStrategy};
use super::types::{QueryParameters, Tool};

/// Build query parameters from a JSON object literal.
pub fn params(value: Value) -> QueryParameters {
    value.as_object().cloned().expect("params must be a JSON object")
}

/// How a mocked remote operation should fail.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// The transport drops: a structured connection-class error.
    Connection,
    /// The server answers with a JSON-RPC error carrying this message.
    Remote(String),
    /// The call never completes.
    Hang,
}

// ─── MockServer ──────────────────────────────────────────────────────────────

/// Scriptable stand-in for one remote server.
pub struct MockServer {
    name: String,
    reachable: AtomicBool,
    connect_hangs: AtomicBool,
    tools: Mutex<Vec<Tool>>,
    list_failure: Mutex<Option<MockFailure>>,
    call_failure: Mutex<Option<MockFailure>>,
    calls: Mutex<Vec<(String, Value)>>,
    closes: AtomicUsize,
}

impl MockServer {
    fn new(name: &str, tools: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            reachable: AtomicBool::new(true),
            connect_hangs: AtomicBool::new(false),
            tools: Mutex::new(
                tools
                    .iter()
                    .map(|t| Tool {
                        name: (*t).to_string(),
                        description: None,
                        input_schema: None,
                    })
                    .collect(),
            ),
            list_failure: Mutex::new(None),
            call_failure: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    /// Unreachable servers refuse new sessions and fail every call on
    /// existing ones.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// New sessions never finish opening while set.
    pub fn hang_connects(&self, hang: bool) {
        self.connect_hangs.store(hang, Ordering::SeqCst);
    }

    pub fn set_tools(&self, tools: Vec<Tool>) {
        *self.tools.lock().unwrap() = tools;
    }

    pub fn fail_listing(&self, failure: Option<MockFailure>) {
        *self.list_failure.lock().unwrap() = failure;
    }

    pub fn fail_calls(&self, failure: Option<MockFailure>) {
        *self.call_failure.lock().unwrap() = failure;
    }

    /// Every `tools/call` received, as `(tool, arguments)`.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn refused(&self) -> SupervisorError {
        SupervisorError::TransportError {
            server: self.name.clone(),
            reason: "connection refused".into(),
        }
    }

    async fn apply(&self, failure: Option<MockFailure>) -> Result<(), SupervisorError> {
        match failure {
            None => Ok(()),
            Some(MockFailure::Connection) => Err(SupervisorError::TransportError {
                server: self.name.clone(),
                reason: "connection reset by peer".into(),
            }),
            Some(MockFailure::Remote(message)) => Err(SupervisorError::ServerError {
                code: -32000,
                message,
                data: None,
            }),
            Some(MockFailure::Hang) => std::future::pending().await,
        }
    }
}

struct MockSession {
    server: Arc<MockServer>,
}

#[async_trait]
impl ToolSession for MockSession {
    async fn list_tools(&self) -> Result<Vec<Tool>, SupervisorError> {
        if !self.server.is_reachable() {
            return Err(self.server.refused());
        }
        let failure = self.server.list_failure.lock().unwrap().clone();
        self.server.apply(failure).await?;
        Ok(self.server.tools.lock().unwrap().clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, SupervisorError> {
        if !self.server.is_reachable() {
            return Err(self.server.refused());
        }
        self.server
            .calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));
        let failure = self.server.call_failure.lock().unwrap().clone();
        self.server.apply(failure).await?;
        Ok(json!({
            "content": [{"type": "text", "text": format!("{name} ok")}],
            "server": self.server.name,
            "arguments": arguments,
        }))
    }

    async fn close(&self) {
        self.server.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ─── MockTransport ───────────────────────────────────────────────────────────

/// Transport strategy backed by [`MockServer`]s, keyed by server name.
/// Servers never added are refused.
pub struct MockTransport {
    label: &'static str,
    refuse_all: bool,
    servers: Mutex<HashMap<String, Arc<MockServer>>>,
    attempts: AtomicUsize,
}

impl MockTransport {
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            refuse_all: false,
            servers: Mutex::new(HashMap::new()),
            attempts: AtomicUsize::new(0),
        })
    }

    /// A strategy that never succeeds, for exercising fallback.
    pub fn refusing(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            refuse_all: true,
            servers: Mutex::new(HashMap::new()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn add_server(&self, name: &str, tools: &[&str]) -> Arc<MockServer> {
        let server = Arc::new(MockServer::new(name, tools));
        self.servers
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&server));
        server
    }

    pub fn strategy(self: &Arc<Self>) -> Arc<dyn TransportStrategy> {
        Arc::clone(self) as Arc<dyn TransportStrategy>
    }

    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportStrategy for MockTransport {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn connect(
        &self,
        server: &str,
        _url: &str,
    ) -> Result<Arc<dyn ToolSession>, SupervisorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = || SupervisorError::ConnectionFailed {
            server: server.to_string(),
            reason: "connection refused".into(),
        };
        if self.refuse_all {
            return Err(refused());
        }

        let mock = self.servers.lock().unwrap().get(server).cloned();
        match mock {
            Some(mock) if mock.is_reachable() => {
                if mock.connect_hangs.load(Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
                Ok(Arc::new(MockSession { server: mock }))
            }
            _ => Err(refused()),
        }
    }
}

// ─── RecordingObserver ───────────────────────────────────────────────────────

/// Records transitions as `"disconnect:<name>"` / `"reconnect:<name>"`.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ConnectionObserver for RecordingObserver {
    fn on_disconnect(&self, server: &str) {
        self.events.lock().unwrap().push(format!("disconnect:{server}"));
    }

    fn on_reconnect(&self, server: &str) {
        self.events.lock().unwrap().push(format!("reconnect:{server}"));
    }
}
