//! Connection supervision and query fan-out for remote tool servers.
//!
//! Keeps one long-lived session per configured server, repairs dropped
//! sessions in the background with exponential backoff, and runs each query
//! concurrently on the servers whose keywords match it.
//!
//! Architecture:
//! - `transport`: strategy traits plus JSON-RPC session and SSE framing
//! - `http` / `sse`: the two shipped transport strategies
//! - `connection`: one server's lifecycle, tool selection and execution
//! - `router`: keyword-based server selection
//! - `scheduler` / `health`: the reconnection and liveness passes
//! - `periodic`: cancellable timers that drive those passes
//! - `manager`: registry owner and public API

pub mod config;
pub mod connection;
pub mod errors;
pub mod health;
pub mod http;
pub mod manager;
pub mod periodic;
pub mod router;
pub mod scheduler;
pub mod schema;
pub mod sse;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

use std::sync::Arc;

pub use config::{load_config, SupervisorConfig, SupervisorSettings};
pub use connection::{ConnectionObserver, ConnectionTimeouts, ServerConnection};
pub use errors::SupervisorError;
pub use health::{HealthMonitor, HealthReport};
pub use manager::ConnectionManager;
pub use router::QueryRouter;
pub use scheduler::{backoff_delay, BackoffPolicy, ReconnectionRegistry, ReconnectionScheduler};
pub use transport::{ToolSession, TransportStrategy};
pub use types::{
    ConnectionState, ConnectionStats, QueryErrorKind, QueryParameters, QueryResult,
    ReconnectionInfo, ServerDescriptor, ServerStatus, Tool, ToolMapping,
};

/// The default transport order: streamable HTTP first, then legacy
/// HTTP+SSE.
pub fn default_transports() -> Result<Vec<Arc<dyn TransportStrategy>>, SupervisorError> {
    let streamable: Arc<dyn TransportStrategy> = Arc::new(http::StreamableHttpTransport::new()?);
    let legacy: Arc<dyn TransportStrategy> = Arc::new(sse::SseTransport::new()?);
    Ok(vec![streamable, legacy])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_transport_order() {
        let names: Vec<&str> = default_transports()
            .unwrap()
            .iter()
            .map(|t| t.name())
            .collect();
        assert_eq!(names, vec!["streamable-http", "sse"]);
    }
}
