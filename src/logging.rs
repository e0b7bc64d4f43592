//! Structured logging setup.
//!
//! Console plus a daily-rolling file under `{data_dir}/logs`, filtered by
//! `RUST_LOG` with a sensible default. The embedding app calls
//! [`init_logging`] once before starting the engine; a second call is a
//! no-op so tests and multi-engine hosts do not fight over the global
//! subscriber.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Daily files beyond this count are pruned at startup.
const MAX_LOG_FILES: usize = 14;

const LOG_FILE_PREFIX: &str = "brightcart";

/// Log directory under the engine's data root.
pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Initialize console + rolling-file logging. Returns false when a global
/// subscriber was already installed.
pub fn init_logging(data_dir: &Path) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,brightcart_core=debug"));

    // Prune old log files before setting up the appender
    let log_dir = log_dir(data_dir);
    prune_old_logs(&log_dir);
    fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        // The guard flushes on drop; the engine logs until process exit.
        std::mem::forget(guard);
    }
    installed
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if name.starts_with(LOG_FILE_PREFIX) {
                        let modified = entry
                            .metadata()
                            .ok()
                            .and_then(|m| m.modified().ok())
                            .unwrap_or(std::time::UNIX_EPOCH);
                        log_files.push((path, modified));
                    }
                }
            }
        }
    }

    // Sort newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_dir_is_under_data_root() {
        let dir = log_dir(Path::new("/data/brightcart"));
        assert_eq!(dir, PathBuf::from("/data/brightcart/logs"));
    }

    #[test]
    fn test_prune_keeps_newest_and_ignores_foreign_files() {
        let dir = std::env::temp_dir().join(format!(
            "brightcart-log-prune-{}",
            uuid::Uuid::new_v4()
        ));
        fs::create_dir_all(&dir).unwrap();

        for i in 0..MAX_LOG_FILES + 3 {
            let path = dir.join(format!("{LOG_FILE_PREFIX}.2026-01-{:02}", i + 1));
            fs::write(&path, b"log").unwrap();
        }
        fs::write(dir.join("unrelated.txt"), b"keep me").unwrap();

        prune_old_logs(&dir);

        let remaining = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with(LOG_FILE_PREFIX)
            })
            .count();
        assert_eq!(remaining, MAX_LOG_FILES);
        assert!(dir.join("unrelated.txt").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_prune_on_missing_dir_is_a_noop() {
        prune_old_logs(Path::new("/definitely/not/a/real/dir"));
    }
}
