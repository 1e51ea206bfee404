//! Supervisor configuration loading.
//!
//! Reads `supervisor.yaml` (timer settings plus the server list) and
//! resolves `${VAR}` / `${VAR:-default}` references from the environment
//! before parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::connection::ConnectionTimeouts;
use super::errors::SupervisorError;
use super::scheduler::BackoffPolicy;
use super::types::ServerDescriptor;

/// File name searched for when no path is given.
pub const CONFIG_FILE_NAME: &str = "supervisor.yaml";

/// Environment variable naming the config file explicitly.
pub const CONFIG_ENV_VAR: &str = "TOOL_SUPERVISOR_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Timer and timeout settings. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorSettings {
    /// Reconnection scheduler tick.
    #[serde(alias = "reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Health monitor tick.
    #[serde(alias = "health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(alias = "initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(alias = "max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Budget for each transport strategy's connect attempt.
    #[serde(alias = "connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Budget for each `tools/list`, `tools/call`, or health probe.
    #[serde(alias = "call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 10_000,
            health_check_interval_ms: 30_000,
            initial_retry_delay_ms: 5_000,
            max_retry_delay_ms: 300_000,
            connect_timeout_ms: 30_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl SupervisorSettings {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.initial_retry_delay_ms),
            max: Duration::from_millis(self.max_retry_delay_ms),
        }
    }

    pub fn timeouts(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            call: Duration::from_millis(self.call_timeout_ms),
        }
    }

    /// Reject values the timers cannot run with.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        let nonzero = [
            ("reconnectIntervalMs", self.reconnect_interval_ms),
            ("healthCheckIntervalMs", self.health_check_interval_ms),
            ("initialRetryDelayMs", self.initial_retry_delay_ms),
            ("connectTimeoutMs", self.connect_timeout_ms),
            ("callTimeoutMs", self.call_timeout_ms),
        ];
        if let Some((key, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(SupervisorError::ConfigError {
                reason: format!("{key} must be greater than zero"),
            });
        }
        if self.max_retry_delay_ms < self.initial_retry_delay_ms {
            return Err(SupervisorError::ConfigError {
                reason: format!(
                    "maxRetryDelayMs ({}) is below initialRetryDelayMs ({})",
                    self.max_retry_delay_ms, self.initial_retry_delay_ms
                ),
            });
        }
        Ok(())
    }
}

/// Top-level config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub settings: SupervisorSettings,
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Order: `explicit` (usually the CLI argument), then `TOOL_SUPERVISOR_CONFIG`,
/// then `supervisor.yaml` in `start` or any of its ancestors.
pub fn find_config_path(explicit: Option<&Path>, start: &Path) -> Result<PathBuf, SupervisorError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(SupervisorError::ConfigError {
            reason: format!("config file not found: {}", path.display()),
        });
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} does not name a file, searching");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(SupervisorError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<SupervisorConfig, SupervisorError> {
    let raw = std::fs::read_to_string(path).map_err(|e| SupervisorError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse config text (YAML or JSON) after environment interpolation.
pub fn parse_config(raw: &str) -> Result<SupervisorConfig, SupervisorError> {
    let interpolated = interpolate_env_vars(raw);

    let config: SupervisorConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| SupervisorError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;
    config.settings.validate()?;

    Ok(config)
}

fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let var_expr: String = chars.by_ref().take_while(|c| *c != '}').collect();
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset variables without a default
/// become empty.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
