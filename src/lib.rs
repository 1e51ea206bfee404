pub mod supervisor;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use supervisor::{
    load_config, ConnectionManager, QueryParameters, QueryResult, ServerDescriptor,
    SupervisorConfig, SupervisorError, SupervisorSettings,
};

/// Overrides the log directory.
pub const LOG_DIR_ENV_VAR: &str = "TOOL_SUPERVISOR_LOG_DIR";

const LOG_FILE_NAME: &str = "supervisor.log";

/// Return the platform-standard data directory for the supervisor.
///
/// - macOS: `~/Library/Application Support/tool-supervisor/`
/// - Windows: `{FOLDERID_RoamingAppData}\tool-supervisor\`
/// - Linux: `$XDG_DATA_HOME/tool-supervisor/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.tool-supervisor/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("tool-supervisor");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tool-supervisor")
}

fn log_dir() -> PathBuf {
    match std::env::var(LOG_DIR_ENV_VAR) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => data_dir(),
    }
}

/// Initialize the tracing subscriber, writing to a rotated `supervisor.log`.
///
/// On each start:
/// 1. Rotates existing logs (supervisor.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh supervisor.log with a line-flushing writer.
/// 3. Logs a startup banner naming the log file.
///
/// Returns the log file path. `RUST_LOG` overrides the default filter.
pub fn init_tracing() -> io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = log_dir();
    std::fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tool_supervisor=info,warn"));

    // A subscriber installed earlier (e.g. by an embedding process) wins.
    let _ = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== tool-supervisor starting ==="
    );

    Ok(log_path)
}

/// `supervisor.log.{n}`: the log from `n` starts ago.
fn rotated_path(base_path: &Path, n: u32) -> PathBuf {
    let mut name = base_path.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Shift the previous runs' logs down one slot before a new run starts.
///
/// `supervisor.log` becomes `.1`, `.1` becomes `.2`, and so on up to
/// `.{keep}`; whatever was at `.{keep}` is deleted. Gaps in the chain are
/// skipped, and rotation failures never stop the daemon from starting.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let _ = std::fs::remove_file(rotated_path(base_path, keep));

    for i in (1..keep).rev() {
        let _ = std::fs::rename(rotated_path(base_path, i), rotated_path(base_path, i + 1));
    }

    if base_path.exists() {
        let _ = std::fs::rename(base_path, rotated_path(base_path, 1));
    }
}

/// Log sink that pushes every line to disk as soon as it is written.
///
/// The supervisor is a long-running daemon whose most useful log lines are
/// the last ones before it died. Flushing per write keeps them out of
/// process buffers; at a few reconnect and health lines per tick the cost
/// is negligible.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    /// A panic mid-write poisons the lock but leaves the file usable.
    fn file(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file();
        let n = file.write(buf)?;
        file.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_log_file_keeps_three() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        let read = |suffix: &str| {
            std::fs::read_to_string(format!("{}{suffix}", base.display())).ok()
        };

        for run in 0..5 {
            rotate_log_file(&base, 3);
            std::fs::write(&base, format!("run {run}")).unwrap();
        }

        assert_eq!(read("").as_deref(), Some("run 4"));
        assert_eq!(read(".1").as_deref(), Some("run 3"));
        assert_eq!(read(".2").as_deref(), Some("run 2"));
        assert_eq!(read(".3").as_deref(), Some("run 1"));
        assert!(read(".4").is_none());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);

        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }
}
