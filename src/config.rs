//! Gateway configuration.
//!
//! Defaults are persisted to a per-user config file. Environment variables
//! override any stored values so managed deployments can pin limits.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-engine-kind connection ceiling and connect deadlines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections_per_engine: usize,
    pub connect_timeout_ms: u64,
    pub test_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_engine: 10,
            connect_timeout_ms: 15_000,
            test_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryServiceConfig {
    pub enable_validation: bool,
    pub default_limit: u64,
    pub max_limit: u64,
    pub query_timeout_ms: u64,
    pub enable_history: bool,
    pub max_history_size: usize,
    pub enable_performance_tracking: bool,
    pub max_metrics_size: usize,
}

impl Default for QueryServiceConfig {
    fn default() -> Self {
        Self {
            enable_validation: true,
            default_limit: 1000,
            max_limit: 10_000,
            query_timeout_ms: 30_000,
            enable_history: true,
            max_history_size: 1000,
            enable_performance_tracking: true,
            max_metrics_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaServiceConfig {
    pub cache_ttl_secs: u64,
    pub max_cache_size: usize,
    pub auto_refresh: bool,
    pub refresh_interval_secs: u64,
}

impl Default for SchemaServiceConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            max_cache_size: 50,
            auto_refresh: false,
            refresh_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Daily-rolling log files go here; stderr when unset
    pub log_dir: Option<PathBuf>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub pool: PoolConfig,
    pub query: QueryServiceConfig,
    pub schema: SchemaServiceConfig,
    pub logging: LoggingConfig,
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_opt<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

fn default_config_path() -> PathBuf {
    if cfg!(windows) {
        let appdata = std::env::var_os("APPDATA")
            .unwrap_or_else(|| std::env::var_os("USERPROFILE").unwrap_or_default());
        let mut path = PathBuf::from(appdata);
        path.push("QoreDB");
        path.push("gateway.json");
        path
    } else {
        let home = std::env::var_os("HOME").unwrap_or_default();
        let mut path = PathBuf::from(home);
        path.push(".qoredb");
        path.push("gateway.json");
        path
    }
}

/// Config file location, honouring `QOREDB_GATEWAY_CONFIG`
pub fn config_path() -> PathBuf {
    std::env::var_os("QOREDB_GATEWAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path)
}

impl GatewayConfig {
    /// Reads a config file. Missing sections fall back to defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, then the config file if readable, then environment overrides.
    pub fn load() -> Self {
        let mut config = Self::load_from(&config_path()).unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = parse_opt(lookup("QOREDB_MAX_CONNECTIONS_PER_ENGINE")) {
            self.pool.max_connections_per_engine = value;
        }
        if let Some(value) = parse_opt(lookup("QOREDB_QUERY_TIMEOUT_MS")) {
            self.query.query_timeout_ms = value;
        }
        if let Some(value) = parse_opt(lookup("QOREDB_DEFAULT_LIMIT")) {
            self.query.default_limit = value;
        }
        if let Some(value) = parse_opt(lookup("QOREDB_MAX_LIMIT")) {
            self.query.max_limit = value;
        }
        if let Some(value) = lookup("QOREDB_ENABLE_VALIDATION") {
            self.query.enable_validation = parse_bool(&value);
        }
        if let Some(value) = lookup("QOREDB_ENABLE_HISTORY") {
            self.query.enable_history = parse_bool(&value);
        }
        if let Some(value) = parse_opt(lookup("QOREDB_MAX_HISTORY")) {
            self.query.max_history_size = value;
        }
        if let Some(value) = parse_opt(lookup("QOREDB_SCHEMA_CACHE_TTL_SECS")) {
            self.schema.cache_ttl_secs = value;
        }
        if let Some(value) = parse_opt(lookup("QOREDB_SCHEMA_CACHE_SIZE")) {
            self.schema.max_cache_size = value;
        }
        if let Some(value) = lookup("QOREDB_LOG_DIR").filter(|v| !v.trim().is_empty()) {
            self.logging.log_dir = Some(PathBuf::from(value));
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let payload = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, payload).map_err(io_error)
    }

    pub fn save_to_file(&self) -> Result<(), ConfigError> {
        self.save_to(&config_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.pool.max_connections_per_engine, 10);
        assert_eq!(config.query.default_limit, 1000);
        assert_eq!(config.query.max_limit, 10_000);
        assert_eq!(config.query.query_timeout_ms, 30_000);
        assert!(config.query.enable_validation);
        assert_eq!(config.schema.cache_ttl_secs, 300);
        assert_eq!(config.schema.max_cache_size, 50);
        assert!(!config.schema.auto_refresh);
    }

    #[test]
    fn environment_overrides_stored_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("QOREDB_MAX_CONNECTIONS_PER_ENGINE", "3"),
            ("QOREDB_MAX_LIMIT", "500"),
            ("QOREDB_ENABLE_HISTORY", "off"),
            ("QOREDB_DEFAULT_LIMIT", "not-a-number"),
        ]);
        let mut config = GatewayConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.pool.max_connections_per_engine, 3);
        assert_eq!(config.query.max_limit, 500);
        assert!(!config.query.enable_history);
        // Unparseable values leave the stored value alone
        assert_eq!(config.query.default_limit, 1000);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.json");
        fs::write(&path, r#"{"query": {"max_limit": 250}}"#).expect("write");

        let config = GatewayConfig::load_from(&path).expect("load");
        assert_eq!(config.query.max_limit, 250);
        assert_eq!(config.query.default_limit, 1000);
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("gateway.json");
        let mut config = GatewayConfig::default();
        config.schema.auto_refresh = true;

        config.save_to(&path).expect("save");
        assert_eq!(GatewayConfig::load_from(&path).expect("load"), config);
    }

    #[test]
    fn invalid_file_reports_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.json");
        fs::write(&path, "{ nope").expect("write");

        assert!(matches!(
            GatewayConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
