//! Periodic liveness probing of connected servers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;

use super::connection::ServerConnection;

/// Outcome of one health pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub probed: usize,
    pub healthy: usize,
}

impl HealthReport {
    pub fn failed(&self) -> usize {
        self.probed - self.healthy
    }
}

/// Probes every connected server; failures disconnect through the normal
/// connection contract, which enrolls them for reconnection.
pub struct HealthMonitor {
    shutting_down: Arc<AtomicBool>,
}

impl HealthMonitor {
    pub fn new(shutting_down: Arc<AtomicBool>) -> Self {
        Self { shutting_down }
    }

    pub async fn tick(&self, servers: &[Arc<ServerConnection>]) -> HealthReport {
        if self.shutting_down.load(Ordering::Acquire) {
            return HealthReport::default();
        }

        let connected: Vec<&Arc<ServerConnection>> =
            servers.iter().filter(|c| c.is_connected()).collect();
        let outcomes = join_all(connected.iter().map(|c| c.health_probe())).await;

        let report = HealthReport {
            probed: outcomes.len(),
            healthy: outcomes.iter().filter(|ok| **ok).count(),
        };
        if report.failed() > 0 {
            tracing::warn!(
                probed = report.probed,
                failed = report.failed(),
                "health check found dead connections"
            );
        } else {
            tracing::debug!(probed = report.probed, "health check passed");
        }
        report
    }
}
