//! Logging and observability helpers.

use std::fs;

use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "qoredb-gateway.log";
const DEFAULT_FILTER: &str = "qoredb_gateway=info";

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = config.filter.as_deref().unwrap_or(DEFAULT_FILTER);
        EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    })
}

/// Installs the global subscriber. Later calls are no-ops.
///
/// Logs go to a daily-rolling file when `log_dir` is set and can be
/// created, otherwise to stderr.
pub fn init_tracing(config: &LoggingConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_span_events(FmtSpan::CLOSE);

    match config.log_dir.as_ref().filter(|dir| fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let file_appender: RollingFileAppender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let _ = builder.with_writer(file_appender).with_ansi(false).try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = LoggingConfig {
            log_dir: Some(dir.path().join("logs")),
            filter: Some("qoredb_gateway=debug".to_string()),
        };

        init_tracing(&config);
        init_tracing(&LoggingConfig::default());
        assert!(dir.path().join("logs").is_dir());
    }
}
