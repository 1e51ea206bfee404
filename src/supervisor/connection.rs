//! One supervised server connection.
//!
//! A [`ServerConnection`] owns the session with a single remote server and
//! everything needed to run a query against it: transport fallback on
//! connect, tool discovery and selection, parameter mapping, and error
//! classification. It never returns an error from a query; every failure
//! becomes a structured [`QueryResult`].
//!
//! State transitions are reported through a [`ConnectionObserver`] so the
//! owner can track reconnection without the connection reaching into any
//! shared registry.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::errors::SupervisorError;
use super::schema::validate_arguments;
use super::transport::{ToolSession, TransportStrategy};
use super::types::{
    ConnectionState, QueryErrorKind, QueryParameters, QueryResult, ServerDescriptor, Tool,
};

// ─── Observer ────────────────────────────────────────────────────────────────

/// Receives Connected/Disconnected transitions. Each transition is reported
/// exactly once; repeated connects or disconnects are silent.
pub trait ConnectionObserver: Send + Sync {
    fn on_disconnect(&self, server: &str);
    fn on_reconnect(&self, server: &str);
}

/// Time budgets for remote operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    /// Per transport strategy attempt.
    pub connect: Duration,
    /// Per `tools/list`, `tools/call`, or health probe.
    pub call: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            call: Duration::from_secs(30),
        }
    }
}

// ─── ServerConnection ────────────────────────────────────────────────────────

struct Link {
    state: ConnectionState,
    session: Option<Arc<dyn ToolSession>>,
    /// Bumped on every successful connect so a failure observed on an old
    /// session cannot tear down a newer one.
    generation: u64,
}

/// Connection to one remote tool server.
pub struct ServerConnection {
    descriptor: ServerDescriptor,
    transports: Vec<Arc<dyn TransportStrategy>>,
    observer: Arc<dyn ConnectionObserver>,
    timeouts: ConnectionTimeouts,
    link: Mutex<Link>,
    /// Serializes connect attempts: at most one in flight per server.
    connect_lock: tokio::sync::Mutex<()>,
}

impl ServerConnection {
    /// Create a disconnected connection. `transports` are tried in order.
    pub fn new(
        descriptor: ServerDescriptor,
        transports: Vec<Arc<dyn TransportStrategy>>,
        observer: Arc<dyn ConnectionObserver>,
        timeouts: ConnectionTimeouts,
    ) -> Self {
        Self {
            descriptor,
            transports,
            observer,
            timeouts,
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                session: None,
                generation: 0,
            }),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        self.link().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn link(&self) -> std::sync::MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect using the first transport strategy that succeeds.
    ///
    /// A no-op when already connected. Fires `on_reconnect` on the
    /// Disconnected → Connected transition.
    pub async fn connect(&self) -> Result<(), SupervisorError> {
        let _attempt = self.connect_lock.lock().await;

        // Another caller may have connected while we waited for the lock.
        if self.is_connected() {
            return Ok(());
        }

        let name = self.name();
        let url = self.descriptor.url.as_str();
        let mut failures = Vec::with_capacity(self.transports.len());

        for transport in &self.transports {
            let attempt = tokio::time::timeout(self.timeouts.connect, transport.connect(name, url));
            match attempt.await {
                Ok(Ok(session)) => {
                    self.install(session, transport.name());
                    return Ok(());
                }
                Ok(Err(e)) => {
                    tracing::debug!(
                        server = name,
                        transport = transport.name(),
                        error = %e,
                        "transport strategy failed"
                    );
                    failures.push(format!("{}: {e}", transport.name()));
                }
                Err(_) => {
                    tracing::debug!(
                        server = name,
                        transport = transport.name(),
                        timeout_ms = self.timeouts.connect.as_millis() as u64,
                        "transport strategy timed out"
                    );
                    failures.push(format!(
                        "{}: timed out after {}ms",
                        transport.name(),
                        self.timeouts.connect.as_millis()
                    ));
                }
            }
        }

        let reason = if failures.is_empty() {
            "no transport strategies configured".to_string()
        } else {
            failures.join("; ")
        };
        Err(SupervisorError::ConnectionFailed {
            server: name.to_string(),
            reason,
        })
    }

    fn install(&self, session: Arc<dyn ToolSession>, transport: &str) {
        let prior = {
            let mut link = self.link();
            let prior = link.state;
            link.state = ConnectionState::Connected;
            link.session = Some(session);
            link.generation += 1;
            prior
        };

        tracing::info!(server = self.name(), transport = transport, "connected");

        if prior == ConnectionState::Disconnected {
            self.observer.on_reconnect(self.name());
        }
    }

    /// Close the session (if any) and mark the connection Disconnected.
    ///
    /// Fires `on_disconnect` only on the Connected → Disconnected transition.
    pub async fn disconnect(&self) {
        self.teardown(None).await;
    }

    /// Tear down the session. With `generation`, only if that session is
    /// still the current one. Returns whether a transition happened.
    async fn teardown(&self, generation: Option<u64>) -> bool {
        let (prior, session) = {
            let mut link = self.link();
            if let Some(expected) = generation {
                if link.generation != expected || link.state != ConnectionState::Connected {
                    return false;
                }
            }
            let prior = link.state;
            link.state = ConnectionState::Disconnected;
            (prior, link.session.take())
        };

        if let Some(session) = session {
            session.close().await;
        }

        if prior == ConnectionState::Connected {
            tracing::info!(server = self.name(), "disconnected");
            self.observer.on_disconnect(self.name());
            true
        } else {
            false
        }
    }

    fn current_session(&self) -> Option<(Arc<dyn ToolSession>, u64)> {
        let link = self.link();
        match (&link.state, &link.session) {
            (ConnectionState::Connected, Some(session)) => {
                Some((Arc::clone(session), link.generation))
            }
            _ => None,
        }
    }

    async fn timed<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T, SupervisorError>>,
    ) -> Result<T, SupervisorError> {
        match tokio::time::timeout(self.timeouts.call, fut).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::Timeout {
                server: self.name().to_string(),
                operation: operation.to_string(),
                timeout_ms: self.timeouts.call.as_millis() as u64,
            }),
        }
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// Run a query against this server. Never fails; see [`QueryResult`].
    ///
    /// Steps:
    /// 1. Connect lazily if disconnected
    /// 2. Discover the current tool list
    /// 3. Select a tool and map parameters onto it
    /// 4. Validate against the tool's input schema and call it
    pub async fn execute_query(&self, parameters: &QueryParameters) -> QueryResult {
        let start = Instant::now();
        let name = self.name();
        let elapsed = || start.elapsed().as_millis() as u64;

        if !self.is_connected() {
            if let Err(e) = self.connect().await {
                return QueryResult::failed(name, QueryErrorKind::Connection, e).with_elapsed(elapsed());
            }
        }

        let Some((session, generation)) = self.current_session() else {
            // Dropped by a concurrent probe or query between connect and here.
            let err = SupervisorError::NotConnected {
                server: name.to_string(),
            };
            return QueryResult::failed(name, QueryErrorKind::Connection, err).with_elapsed(elapsed());
        };

        let tools = match self.timed("tools/list", session.list_tools()).await {
            Ok(tools) => tools,
            Err(e) => {
                if e.is_connection_class() {
                    self.teardown(Some(generation)).await;
                }
                let err = SupervisorError::ToolDiscoveryFailed {
                    server: name.to_string(),
                    reason: e.to_string(),
                };
                return QueryResult::failed(name, QueryErrorKind::ToolDiscovery, err)
                    .with_elapsed(elapsed());
            }
        };

        let Some(tool) = select_tool(&self.descriptor, &tools) else {
            let err = SupervisorError::NoToolAvailable {
                server: name.to_string(),
                available: tools.iter().map(|t| t.name.clone()).collect(),
            };
            return QueryResult::failed(name, QueryErrorKind::ToolSelection, err).with_elapsed(elapsed());
        };

        let arguments = map_parameters(&self.descriptor, &tool.name, parameters);
        if let Err(e) = validate_arguments(tool, &arguments) {
            return QueryResult::failed(name, QueryErrorKind::InvalidArguments, e)
                .with_tool(&tool.name)
                .with_elapsed(elapsed());
        }

        tracing::debug!(server = name, tool = %tool.name, "calling tool");

        let call = session.call_tool(&tool.name, serde_json::Value::Object(arguments));
        match self.timed("tools/call", call).await {
            Ok(data) => QueryResult::ok(name, &tool.name, data, elapsed()),
            Err(e) if e.is_connection_class() => {
                tracing::warn!(
                    server = name,
                    tool = %tool.name,
                    error = %e,
                    "tool call lost the connection"
                );
                self.teardown(Some(generation)).await;
                QueryResult::failed(name, QueryErrorKind::Connection, e)
                    .with_tool(&tool.name)
                    .with_elapsed(elapsed())
            }
            Err(e) => QueryResult::failed(name, QueryErrorKind::Execution, e)
                .with_tool(&tool.name)
                .with_elapsed(elapsed()),
        }
    }

    /// Liveness check via the cheapest remote call (`tools/list`).
    ///
    /// Returns `false` without doing anything when already disconnected. Any
    /// failure tears the session down.
    pub async fn health_probe(&self) -> bool {
        let Some((session, generation)) = self.current_session() else {
            return false;
        };

        match self.timed("tools/list", session.list_tools()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(server = self.name(), error = %e, "health probe failed");
                self.teardown(Some(generation)).await;
                false
            }
        }
    }
}

// ─── Tool Selection ──────────────────────────────────────────────────────────

/// Pick the tool a query should run on.
///
/// Precedence: the first configured mapping (in declaration order) whose
/// tool was discovered, then `default_tool` if discovered, then the first
/// discovered tool.
pub fn select_tool<'a>(descriptor: &ServerDescriptor, discovered: &'a [Tool]) -> Option<&'a Tool> {
    let find = |name: &str| discovered.iter().find(|t| t.name == name);

    descriptor
        .tools
        .iter()
        .find_map(|mapping| find(&mapping.tool_name))
        .or_else(|| descriptor.default_tool.as_deref().and_then(find))
        .or_else(|| discovered.first())
}

/// Rename standard parameter names to the tool's own names. Keys without a
/// mapping pass through unchanged.
pub fn map_parameters(
    descriptor: &ServerDescriptor,
    tool_name: &str,
    parameters: &QueryParameters,
) -> QueryParameters {
    let Some(mapping) = descriptor.tools.iter().find(|m| m.tool_name == tool_name) else {
        return parameters.clone();
    };

    parameters
        .iter()
        .map(|(key, value)| {
            let target = mapping.parameter_mapping.get(key).unwrap_or(key);
            (target.clone(), value.clone())
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
