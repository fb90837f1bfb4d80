//! File-based logging for the CLI.
//!
//! Logs go to `~/.local/state/sshforge/debug.log` through a daily rolling
//! appender. Stderr output is added when `RUST_LOG` is set. Stdout never
//! carries logs: it is the remote session's output.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// The directory under the state dir where logs are stored.
const LOG_DIR_NAME: &str = "sshforge";

/// The base filename for the rolling log file.
const LOG_FILE_NAME: &str = "debug.log";

/// Dependencies whose debug output drowns ours.
const QUIET_TARGETS: &[&str] = &["russh=warn", "tokio=warn"];

/// Initialise the tracing subscriber with file + optional stderr layers.
///
/// The returned guard must live until exit; dropping it flushes the file.
pub fn init_logging() -> WorkerGuard {
    let log_dir = log_directory();

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!(
            "warning: could not create log directory {}: {e}",
            log_dir.display()
        );
    }

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let stderr_layer = std::env::var("RUST_LOG").is_ok().then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
    });

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(stderr_layer)
        .init();

    guard
}

/// `RUST_LOG` if set, otherwise `info`, with noisy dependencies held at warn.
fn env_filter() -> EnvFilter {
    QUIET_TARGETS
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            EnvFilter::add_directive,
        )
}

/// `dirs::state_dir()/sshforge`, falling back to `~/.local/state/sshforge`
/// where the platform has no state dir (macOS, Windows).
fn log_directory() -> std::path::PathBuf {
    if let Some(state) = dirs::state_dir() {
        return state.join(LOG_DIR_NAME);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".local").join("state").join(LOG_DIR_NAME);
    }
    std::path::PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_directory_ends_with_app_name() {
        let dir = log_directory();
        assert!(
            dir.ends_with(LOG_DIR_NAME),
            "log directory should end with '{LOG_DIR_NAME}': {}",
            dir.display()
        );
    }

    #[test]
    fn log_directory_is_absolute_or_fallback() {
        let dir = log_directory();
        assert!(
            dir.is_absolute() || dir == std::path::Path::new("."),
            "log directory should be absolute or current dir fallback: {}",
            dir.display()
        );
    }

    #[test]
    fn quiet_targets_parse() {
        for target in QUIET_TARGETS {
            assert!(target.parse::<Directive>().is_ok(), "bad directive {target}");
        }
    }
}
