//! Connection manager: the supervisor's public face.
//!
//! Owns the server registry and the reconnection registry, composes the
//! router, scheduler and health monitor, and runs the two background timers.
//!
//! Nothing here fails a query as a whole. Per-server failures come back as
//! [`QueryResult`]s; the only hard error is an invalid descriptor at
//! registration time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures::future::join_all;
use tokio::time::Instant;

use super::config::SupervisorSettings;
use super::connection::{ConnectionObserver, ServerConnection};
use super::errors::SupervisorError;
use super::health::{HealthMonitor, HealthReport};
use super::periodic::PeriodicTask;
use super::router::QueryRouter;
use super::scheduler::{ReconnectionRegistry, ReconnectionScheduler};
use super::transport::TransportStrategy;
use super::types::{ConnectionStats, QueryParameters, QueryResult, ServerDescriptor, ServerStatus};

const RECONNECT_TASK: &str = "reconnection";
const HEALTH_TASK: &str = "health-check";

// ─── Observer Link ───────────────────────────────────────────────────────────

/// Forwards one connection's transitions to the registry until detached.
/// A replaced connection is detached so its late callbacks cannot touch
/// the record of the connection that replaced it.
struct RegistryLink {
    registry: Arc<ReconnectionRegistry>,
    detached: AtomicBool,
}

impl RegistryLink {
    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    fn is_attached(&self) -> bool {
        !self.detached.load(Ordering::Acquire)
    }
}

impl ConnectionObserver for RegistryLink {
    fn on_disconnect(&self, server: &str) {
        if self.is_attached() {
            self.registry.on_disconnect(server);
        }
    }

    fn on_reconnect(&self, server: &str) {
        if self.is_attached() {
            self.registry.on_reconnect(server);
        }
    }
}

struct Entry {
    connection: Arc<ServerConnection>,
    link: Arc<RegistryLink>,
}

// ─── Shared State ────────────────────────────────────────────────────────────

/// State reachable from the background timers.
struct Shared {
    settings: SupervisorSettings,
    transports: Vec<Arc<dyn TransportStrategy>>,
    /// Registration order is preserved; routing returns servers in it.
    servers: RwLock<Vec<Entry>>,
    registry: Arc<ReconnectionRegistry>,
    scheduler: ReconnectionScheduler,
    monitor: HealthMonitor,
    router: QueryRouter,
    shutting_down: Arc<AtomicBool>,
}

impl Shared {
    fn connections(&self) -> Vec<Arc<ServerConnection>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| Arc::clone(&e.connection))
            .collect()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Whether `conn` is still the registered connection for its name.
    fn is_registered(&self, conn: &Arc<ServerConnection>) -> bool {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|e| Arc::ptr_eq(&e.connection, conn))
    }

    /// Enroll a server after a failure seen on `conn`.
    ///
    /// Skipped when `conn` was replaced while it ran, so a successor that was
    /// never attempted gets no record, and when something else reconnected
    /// it in the meantime.
    fn enroll_failed(&self, conn: &Arc<ServerConnection>) {
        if conn.is_connected() || !self.is_registered(conn) {
            tracing::debug!(server = conn.name(), "stale failure, not enrolling");
            return;
        }
        self.registry.enroll(conn.name());
    }

    async fn reconnection_tick(&self) -> usize {
        if self.is_shutting_down() {
            return 0;
        }
        self.scheduler.tick(&self.connections()).await
    }

    async fn health_tick(&self) -> HealthReport {
        if self.is_shutting_down() {
            return HealthReport::default();
        }
        self.monitor.tick(&self.connections()).await
    }
}

// ─── ConnectionManager ───────────────────────────────────────────────────────

/// Supervises a set of remote tool servers.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    timers: Mutex<Vec<PeriodicTask>>,
}

impl ConnectionManager {
    /// Create a manager using the default transport strategies
    /// (streamable HTTP, then HTTP+SSE).
    pub fn new(settings: SupervisorSettings) -> Result<Self, SupervisorError> {
        Self::with_transports(settings, super::default_transports()?)
    }

    /// Create a manager with an explicit, ordered transport list.
    pub fn with_transports(
        settings: SupervisorSettings,
        transports: Vec<Arc<dyn TransportStrategy>>,
    ) -> Result<Self, SupervisorError> {
        settings.validate()?;

        let shutting_down = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(ReconnectionRegistry::new(
            settings.backoff(),
            Arc::clone(&shutting_down),
        ));

        let shared = Shared {
            scheduler: ReconnectionScheduler::new(Arc::clone(&registry)),
            monitor: HealthMonitor::new(Arc::clone(&shutting_down)),
            router: QueryRouter::new(),
            settings,
            transports,
            servers: RwLock::new(Vec::new()),
            registry,
            shutting_down,
        };

        Ok(Self {
            shared: Arc::new(shared),
            timers: Mutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    fn timers(&self) -> MutexGuard<'_, Vec<PeriodicTask>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    // ─── Registry ────────────────────────────────────────────────────────

    /// Register a server. Re-registering a name replaces the old connection,
    /// which is disconnected in the background.
    pub fn register_server(&self, descriptor: ServerDescriptor) -> Result<(), SupervisorError> {
        descriptor.validate()?;

        let link = Arc::new(RegistryLink {
            registry: Arc::clone(&self.shared.registry),
            detached: AtomicBool::new(false),
        });
        let connection = Arc::new(ServerConnection::new(
            descriptor,
            self.shared.transports.clone(),
            Arc::clone(&link) as Arc<dyn ConnectionObserver>,
            self.shared.settings.timeouts(),
        ));
        let name = connection.name().to_string();

        let replaced = {
            let mut servers = self
                .shared
                .servers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let entry = Entry { connection, link };
            match servers.iter_mut().find(|e| e.connection.name() == name) {
                Some(existing) => Some(std::mem::replace(existing, entry)),
                None => {
                    servers.push(entry);
                    None
                }
            }
        };

        match replaced {
            Some(old) => {
                old.link.detach();
                self.shared.registry.remove(&name);
                tracing::info!(server = %name, "server re-registered, replacing previous connection");
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    runtime.spawn(async move { old.connection.disconnect().await });
                }
            }
            None => tracing::info!(server = %name, "server registered"),
        }

        Ok(())
    }

    pub fn server_names(&self) -> Vec<String> {
        self.shared
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.connection.name().to_string())
            .collect()
    }

    pub fn get_server(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.shared
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.connection.name() == name)
            .map(|e| Arc::clone(&e.connection))
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every registered server concurrently and start the
    /// background timers.
    ///
    /// Returns the servers that failed; each is left enrolled for
    /// reconnection. One server's failure never blocks another.
    pub async fn initialize_all(&self) -> Vec<(String, SupervisorError)> {
        if self.is_shutting_down() {
            tracing::warn!("initialize_all called after shutdown, ignoring");
            return Vec::new();
        }

        let servers = self.shared.connections();
        tracing::info!(count = servers.len(), "connecting to servers");

        let outcomes = join_all(servers.iter().map(|conn| conn.connect())).await;

        let mut failures = Vec::new();
        for (conn, outcome) in servers.iter().zip(outcomes) {
            if let Err(e) = outcome {
                tracing::warn!(server = conn.name(), error = %e, "initial connection failed");
                self.shared.enroll_failed(conn);
                failures.push((conn.name().to_string(), e));
            }
        }

        tracing::info!(
            connected = servers.len() - failures.len(),
            failed = failures.len(),
            "initialization complete"
        );

        self.start_background_tasks();
        failures
    }

    fn start_background_tasks(&self) {
        let mut timers = self.timers();
        if !timers.is_empty() || self.is_shutting_down() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        timers.push(PeriodicTask::start(
            RECONNECT_TASK,
            self.shared.settings.reconnect_interval(),
            move || {
                let shared = Arc::clone(&shared);
                async move {
                    shared.reconnection_tick().await;
                }
            },
        ));

        let shared = Arc::clone(&self.shared);
        timers.push(PeriodicTask::start(
            HEALTH_TASK,
            self.shared.settings.health_check_interval(),
            move || {
                let shared = Arc::clone(&shared);
                async move {
                    shared.health_tick().await;
                }
            },
        ));
    }

    /// Stop the timers, forget all reconnection state, and disconnect every
    /// server. Idempotent.
    pub async fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("shutting down supervisor");

        let timers = std::mem::take(&mut *self.timers());
        for timer in timers {
            timer.stop().await;
        }

        self.shared.registry.clear();

        let servers = self.shared.connections();
        join_all(servers.iter().map(|conn| conn.disconnect())).await;

        tracing::info!(servers = servers.len(), "supervisor shut down");
    }

    /// Run one reconnection pass now. Returns how many servers reconnected.
    pub async fn run_reconnection_tick(&self) -> usize {
        self.shared.reconnection_tick().await
    }

    /// Run one health pass now.
    pub async fn run_health_check(&self) -> HealthReport {
        self.shared.health_tick().await
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// Route a query by keywords and run it on every selected server.
    ///
    /// Always returns at least one result: one per selected server, in
    /// selection order, or a single routing failure when nothing was
    /// selected.
    pub async fn route_and_execute(
        &self,
        parameters: &QueryParameters,
        keywords: &[String],
    ) -> Vec<QueryResult> {
        let selected = self
            .shared
            .router
            .select(&self.shared.connections(), keywords);

        if selected.is_empty() {
            tracing::info!(keywords = ?keywords, "no relevant servers for query");
            return vec![QueryResult::no_relevant_servers()];
        }

        tracing::debug!(
            servers = ?selected.iter().map(|c| c.name()).collect::<Vec<_>>(),
            "dispatching query"
        );

        let results = join_all(selected.iter().map(|conn| conn.execute_query(parameters))).await;

        for (conn, result) in selected.iter().zip(&results) {
            if result.is_connection_failure() {
                self.shared.enroll_failed(conn);
            }
        }

        results
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn get_server_status(&self) -> Vec<ServerStatus> {
        let now = Instant::now();
        self.shared
            .connections()
            .iter()
            .map(|conn| {
                let connected = conn.is_connected();
                ServerStatus {
                    name: conn.name().to_string(),
                    connected,
                    url: conn.descriptor().url.clone(),
                    reconnection_info: if connected {
                        None
                    } else {
                        self.shared.registry.get(conn.name()).map(|r| r.info(now))
                    },
                }
            })
            .collect()
    }

    pub fn get_connection_stats(&self) -> ConnectionStats {
        let servers = self.shared.connections();
        let connected = servers.iter().filter(|c| c.is_connected()).count();
        let reconnection_active = !self.is_shutting_down()
            && self
                .timers()
                .iter()
                .any(|t| t.name() == RECONNECT_TASK && t.is_running());

        ConnectionStats {
            total_servers: servers.len(),
            connected_servers: connected,
            disconnected_servers: servers.len() - connected,
            reconnection_active,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
