//! Reconnection with exponential backoff.
//!
//! [`ReconnectionRegistry`] holds one [`ReconnectionRecord`] per server that
//! is disconnected and has failed at least once. It is the observer wired
//! into every [`ServerConnection`], so disconnects enroll and reconnects
//! clear without the connection knowing about the registry.
//!
//! [`ReconnectionScheduler::tick`] retries every record whose backoff window
//! has elapsed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use super::connection::{ConnectionObserver, ServerConnection};
use super::types::ReconnectionInfo;

/// Delay before the next retry after `failures` consecutive failures:
/// `initial * 2^(failures - 1)`, capped at `max`.
pub fn backoff_delay(failures: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    initial.saturating_mul(1u32 << exponent).min(max)
}

/// Backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(5_000),
            max: Duration::from_millis(300_000),
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Backoff state for one disconnected server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionRecord {
    /// Monotonic time of the last failure (enrollment counts as one).
    pub last_attempt: Instant,
    /// Wall-clock twin of `last_attempt`, for status reporting.
    pub last_attempt_at: chrono::DateTime<chrono::Utc>,
    /// Failed scheduled retries. Zero right after enrollment.
    pub attempt_count: u32,
    pub next_retry_delay: Duration,
    in_flight: bool,
}

impl ReconnectionRecord {
    fn enrolled(policy: &BackoffPolicy) -> Self {
        Self {
            last_attempt: Instant::now(),
            last_attempt_at: chrono::Utc::now(),
            attempt_count: 0,
            next_retry_delay: backoff_delay(1, policy.initial, policy.max),
            in_flight: false,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_attempt) >= self.next_retry_delay
    }

    pub fn time_until_retry(&self, now: Instant) -> Duration {
        (self.last_attempt + self.next_retry_delay).saturating_duration_since(now)
    }

    pub fn info(&self, now: Instant) -> ReconnectionInfo {
        let remaining = self.time_until_retry(now);
        ReconnectionInfo {
            attempt_count: self.attempt_count,
            seconds_until_next_retry: remaining.as_millis().div_ceil(1000) as u64,
            next_retry_delay_ms: self.next_retry_delay.as_millis() as u64,
            last_attempt_at: self.last_attempt_at,
        }
    }
}

/// Shared map of reconnection records, keyed by server name.
pub struct ReconnectionRegistry {
    policy: BackoffPolicy,
    records: Mutex<HashMap<String, ReconnectionRecord>>,
    shutting_down: Arc<AtomicBool>,
}

impl ReconnectionRegistry {
    /// `shutting_down` is the owner's shutdown flag; enrollment is ignored
    /// once it is set.
    pub fn new(policy: BackoffPolicy, shutting_down: Arc<AtomicBool>) -> Self {
        Self {
            policy,
            records: Mutex::new(HashMap::new()),
            shutting_down,
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, ReconnectionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Start tracking `server`. Already-enrolled servers keep their count.
    pub fn enroll(&self, server: &str) {
        if self.is_shutting_down() {
            return;
        }
        let mut records = self.records();
        if records.contains_key(server) {
            return;
        }
        let record = ReconnectionRecord::enrolled(&self.policy);
        tracing::info!(
            server = server,
            delay_ms = record.next_retry_delay.as_millis() as u64,
            "enrolled for reconnection"
        );
        records.insert(server.to_string(), record);
    }

    pub fn remove(&self, server: &str) -> bool {
        self.records().remove(server).is_some()
    }

    pub fn clear(&self) {
        self.records().clear();
    }

    pub fn get(&self, server: &str) -> Option<ReconnectionRecord> {
        self.records().get(server).cloned()
    }

    pub fn contains(&self, server: &str) -> bool {
        self.records().contains_key(server)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Mark every due, idle record as in flight and return their names.
    fn claim_due(&self, now: Instant) -> Vec<String> {
        let mut records = self.records();
        let mut due: Vec<String> = records
            .iter_mut()
            .filter(|(_, r)| !r.in_flight && r.is_due(now))
            .map(|(name, r)| {
                r.in_flight = true;
                name.clone()
            })
            .collect();
        due.sort();
        due
    }

    fn release(&self, server: &str) {
        if let Some(record) = self.records().get_mut(server) {
            record.in_flight = false;
        }
    }

    /// Count one more failed retry and push the next one out.
    ///
    /// Returns the updated record, or `None` if the server was reconnected
    /// or the registry cleared while the attempt ran.
    pub fn record_failure(&self, server: &str) -> Option<ReconnectionRecord> {
        let mut records = self.records();
        let record = records.get_mut(server)?;
        record.attempt_count = record.attempt_count.saturating_add(1);
        // Enrollment was the first failure, so this is failure n + 1.
        record.next_retry_delay = backoff_delay(
            record.attempt_count.saturating_add(1),
            self.policy.initial,
            self.policy.max,
        );
        record.last_attempt = Instant::now();
        record.last_attempt_at = chrono::Utc::now();
        Some(record.clone())
    }
}

impl ConnectionObserver for ReconnectionRegistry {
    fn on_disconnect(&self, server: &str) {
        self.enroll(server);
    }

    fn on_reconnect(&self, server: &str) {
        if self.remove(server) {
            tracing::debug!(server = server, "reconnection record cleared");
        }
    }
}

/// Clears a record's in-flight mark however the attempt ends.
struct AttemptGuard<'a> {
    registry: &'a ReconnectionRegistry,
    server: String,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.server);
    }
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

/// Retries disconnected servers once their backoff window has elapsed.
pub struct ReconnectionScheduler {
    registry: Arc<ReconnectionRegistry>,
}

impl ReconnectionScheduler {
    pub fn new(registry: Arc<ReconnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Run one pass over `servers`. Returns how many reconnected.
    ///
    /// Each due server gets exactly one attempt. Attempts run concurrently
    /// and a failure only affects its own record.
    pub async fn tick(&self, servers: &[Arc<ServerConnection>]) -> usize {
        if self.registry.is_shutting_down() {
            return 0;
        }

        let due = self.registry.claim_due(Instant::now());
        if due.is_empty() {
            return 0;
        }

        let mut attempts = Vec::with_capacity(due.len());
        for name in due {
            match servers.iter().find(|c| c.name() == name) {
                Some(conn) => attempts.push(self.attempt(Arc::clone(conn))),
                None => {
                    // Replaced or never registered under this name.
                    self.registry.remove(&name);
                }
            }
        }

        join_all(attempts).await.into_iter().filter(|ok| *ok).count()
    }

    async fn attempt(&self, conn: Arc<ServerConnection>) -> bool {
        let name = conn.name().to_string();
        let _guard = AttemptGuard {
            registry: &self.registry,
            server: name.clone(),
        };

        // State may have moved on since the record was claimed.
        if conn.is_connected() {
            self.registry.remove(&name);
            return true;
        }
        let Some(record) = self.registry.get(&name) else {
            return false;
        };

        tracing::info!(
            server = %name,
            attempt = record.attempt_count + 1,
            "attempting reconnection"
        );

        match conn.connect().await {
            Ok(()) => {
                // Connect fires on_reconnect; this covers a record
                // re-added by a racing disconnect.
                self.registry.remove(&name);
                if self.registry.is_shutting_down() {
                    conn.disconnect().await;
                    return false;
                }
                tracing::info!(server = %name, "reconnected");
                true
            }
            Err(e) => {
                if let Some(updated) = self.registry.record_failure(&name) {
                    tracing::warn!(
                        server = %name,
                        attempt = updated.attempt_count,
                        delay_ms = updated.next_retry_delay.as_millis() as u64,
                        error = %e,
                        "reconnection failed"
                    );
                }
                false
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::connection::ConnectionTimeouts;
    use crate::supervisor::test_utils::MockTransport;
    use crate::supervisor::types::ServerDescriptor;

    fn registry() -> Arc<ReconnectionRegistry> {
        Arc::new(ReconnectionRegistry::new(
            BackoffPolicy::default(),
            Arc::new(AtomicBool::new(false)),
        ))
    }

    fn connection(
        transport: &Arc<MockTransport>,
        registry: &Arc<ReconnectionRegistry>,
        name: &str,
    ) -> Arc<ServerConnection> {
        Arc::new(ServerConnection::new(
            ServerDescriptor::new(name, format!("http://{name}")),
            vec![transport.strategy()],
            Arc::clone(registry) as Arc<dyn ConnectionObserver>,
            ConnectionTimeouts::default(),
        ))
    }

    #[test]
    fn test_backoff_sequence() {
        let initial = Duration::from_millis(5_000);
        let max = Duration::from_millis(300_000);
        let delays: Vec<u128> = (1..=9)
            .map(|n| backoff_delay(n, initial, max).as_millis())
            .collect();
        assert_eq!(
            delays,
            vec![5_000, 10_000, 20_000, 40_000, 80_000, 160_000, 300_000, 300_000, 300_000]
        );
    }

    #[test]
    fn test_backoff_never_overflows() {
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(u32::MAX, Duration::from_secs(5), max), max);
        assert_eq!(backoff_delay(0, Duration::from_secs(5), max), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_failure_follows_backoff_sequence() {
        let registry = registry();
        registry.enroll("a");
        assert_eq!(registry.get("a").unwrap().next_retry_delay, Duration::from_secs(5));

        let delays: Vec<u64> = (0..7)
            .map(|_| registry.record_failure("a").unwrap().next_retry_delay.as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![10_000, 20_000, 40_000, 80_000, 160_000, 300_000, 300_000]
        );
        assert_eq!(registry.get("a").unwrap().attempt_count, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enrollment_is_idempotent() {
        let registry = registry();
        registry.enroll("a");
        registry.record_failure("a");
        registry.record_failure("a");

        registry.enroll("a");
        registry.on_disconnect("a");

        let record = registry.get("a").unwrap();
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.next_retry_delay, Duration::from_secs(20));

        registry.on_reconnect("a");
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enroll_ignored_while_shutting_down() {
        let flag = Arc::new(AtomicBool::new(false));
        let registry = ReconnectionRegistry::new(BackoffPolicy::default(), Arc::clone(&flag));
        flag.store(true, Ordering::Release);
        registry.enroll("a");
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_info_counts_down() {
        let registry = registry();
        registry.enroll("a");
        let record = registry.get("a").unwrap();

        assert_eq!(record.info(Instant::now()).seconds_until_next_retry, 5);
        tokio::time::advance(Duration::from_millis(3_500)).await;
        assert_eq!(record.info(Instant::now()).seconds_until_next_retry, 2);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(record.info(Instant::now()).seconds_until_next_retry, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_waits_for_backoff_window() {
        let transport = MockTransport::new("mock");
        let server = transport.add_server("a", &["t1"]);
        server.set_reachable(false);
        let registry = registry();
        let conn = connection(&transport, &registry, "a");
        let scheduler = ReconnectionScheduler::new(Arc::clone(&registry));

        registry.enroll("a");
        assert_eq!(scheduler.tick(&[Arc::clone(&conn)]).await, 0);
        assert_eq!(transport.connect_attempts(), 0, "not due yet");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(scheduler.tick(&[Arc::clone(&conn)]).await, 0);
        assert_eq!(transport.connect_attempts(), 1);
        let record = registry.get("a").unwrap();
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.next_retry_delay, Duration::from_secs(10));

        // Next window is 10s from the failed attempt.
        tokio::time::advance(Duration::from_secs(9)).await;
        scheduler.tick(&[Arc::clone(&conn)]).await;
        assert_eq!(transport.connect_attempts(), 1);

        server.set_reachable(true);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(scheduler.tick(&[Arc::clone(&conn)]).await, 1);
        assert!(conn.is_connected());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_attempts_are_independent() {
        let transport = MockTransport::new("mock");
        transport.add_server("up", &["t1"]);
        let down = transport.add_server("down", &["t1"]);
        down.set_reachable(false);
        let registry = registry();
        let servers = vec![
            connection(&transport, &registry, "up"),
            connection(&transport, &registry, "down"),
        ];
        let scheduler = ReconnectionScheduler::new(Arc::clone(&registry));

        registry.enroll("up");
        registry.enroll("down");
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(scheduler.tick(&servers).await, 1);
        assert!(servers[0].is_connected());
        assert!(!registry.contains("up"));
        assert_eq!(registry.get("down").unwrap().attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_in_flight_per_server() {
        let transport = MockTransport::new("mock");
        let server = transport.add_server("a", &["t1"]);
        server.hang_connects(true);
        let registry = registry();
        let conn = connection(&transport, &registry, "a");
        let scheduler = ReconnectionScheduler::new(Arc::clone(&registry));
        let servers = vec![Arc::clone(&conn)];

        registry.enroll("a");
        tokio::time::advance(Duration::from_secs(5)).await;

        // The first attempt hangs until the connect timeout; a tick that
        // runs meanwhile must leave the server alone.
        let (first, second) = tokio::join!(scheduler.tick(&servers), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(registry.get("a").unwrap().in_flight);
            scheduler.tick(&servers).await
        });

        assert_eq!((first, second), (0, 0));
        assert_eq!(transport.connect_attempts(), 1);
        let record = registry.get("a").unwrap();
        assert!(!record.in_flight, "released after the attempt");
        assert_eq!(record.attempt_count, 1);

        // Once due again the server is retried.
        server.hang_connects(false);
        tokio::time::advance(record.next_retry_delay).await;
        assert_eq!(scheduler.tick(&servers).await, 1);
        assert_eq!(transport.connect_attempts(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_drops_records_for_already_connected_servers() {
        let transport = MockTransport::new("mock");
        transport.add_server("a", &["t1"]);
        let registry = registry();
        let conn = connection(&transport, &registry, "a");
        let scheduler = ReconnectionScheduler::new(Arc::clone(&registry));

        conn.connect().await.unwrap();
        // Stale enrollment, e.g. from a failure reported after a reconnect.
        registry.enroll("a");
        tokio::time::advance(Duration::from_secs(5)).await;

        scheduler.tick(&[Arc::clone(&conn)]).await;
        assert!(registry.is_empty());
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_forgets_unknown_servers() {
        let registry = registry();
        let scheduler = ReconnectionScheduler::new(Arc::clone(&registry));
        registry.enroll("ghost");
        tokio::time::advance(Duration::from_secs(5)).await;

        scheduler.tick(&[]).await;
        assert!(registry.is_empty());
    }
}
