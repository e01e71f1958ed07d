//! Tracing subscriber setup.
//!
//! Console output is human-readable. When a log directory is given, a
//! daily-rotating file receives the same events as JSON lines through a
//! non-blocking writer; keep the returned guard alive until exit or the
//! tail of the log is lost.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Noisy dependencies capped at `warn` unless `RUST_LOG` says otherwise.
const QUIET_TARGETS: [&str; 3] = ["hyper_util", "reqwest", "tungstenite"];

/// `RUST_LOG` when set, else `level` with [`QUIET_TARGETS`] capped.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

fn default_directives(level: &str) -> String {
    let mut directives = level.trim().to_ascii_lowercase();
    if directives.is_empty() {
        directives.push_str("info");
    }
    for target in QUIET_TARGETS {
        directives.push_str(&format!(",{target}=warn"));
    }
    directives
}

/// Install the global subscriber. A second call only reports the error.
///
/// - `log_level`: default directive when `RUST_LOG` is unset
/// - `log_dir`: directory for `{module_name}.YYYY-MM-DD` JSON files
/// - `module_name`: file prefix, e.g. `"mirror-runner"`
pub fn init_logging(log_level: &str, log_dir: Option<&str>, module_name: &str) -> Option<WorkerGuard> {
    let console = fmt::layer().with_target(true).with_thread_ids(true).with_ansi(true);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, module_name));
            let layer = fmt::layer().json().with_writer(writer).with_target(true).with_thread_ids(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(build_filter(log_level))
        .with(console)
        .with(file)
        .try_init();
    if let Err(e) = result {
        eprintln!("logging already initialised: {e}");
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_cap_dependencies() {
        let d = default_directives(" DEBUG ");
        assert!(d.starts_with("debug,"));
        assert!(d.contains("reqwest=warn"));
        assert!(default_directives("").starts_with("info,"));
        // every directive must parse
        assert!(EnvFilter::try_new(d).is_ok());
    }
}
