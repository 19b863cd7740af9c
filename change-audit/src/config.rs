//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: `CHANGE_AUDIT_`, nested keys split on `__`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/change-audit/config.toml
//! 4. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "CHANGE_AUDIT_";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Change-capture configuration
    #[serde(default)]
    pub audit: AuditConfig,

    /// Storage backend configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name, used in log output
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level filter (trace, debug, info, warn, error or a full EnvFilter directive)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

/// Change-capture configuration
///
/// Controls which objects are audited and how the request context is captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Enable change capture (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Resource types that are never audited
    ///
    /// The audit record type itself is always excluded, whether listed or not.
    #[serde(default)]
    pub excluded_resource_types: Vec<String>,

    /// Capture the request body into the request context (default: true)
    #[serde(default = "default_true")]
    pub capture_request_body: bool,

    /// Largest request body the middleware buffers, in bytes (default: 64 KiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Top-level JSON keys masked in `request_body_json`
    #[serde(default = "default_redacted_body_fields")]
    pub redacted_body_fields: Vec<String>,

    /// Routes for which the middleware skips body capture (default: ["/health", "/ready", "/metrics"])
    #[serde(default = "default_excluded_routes")]
    pub excluded_routes: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            excluded_resource_types: Vec::new(),
            capture_request_body: true,
            max_body_bytes: default_max_body_bytes(),
            redacted_body_fields: default_redacted_body_fields(),
            excluded_routes: default_excluded_routes(),
        }
    }
}

impl AuditConfig {
    /// Whether objects of the given resource type are excluded from capture
    pub fn is_excluded(&self, resource_type: &str) -> bool {
        self.excluded_resource_types
            .iter()
            .any(|excluded| excluded == resource_type)
    }

    /// Whether the middleware should skip body capture for a path
    pub fn is_route_excluded(&self, path: &str) -> bool {
        self.excluded_routes.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix("/*") {
                path.starts_with(prefix) && path.len() > prefix.len()
            } else {
                path == pattern
            }
        })
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local store, lost on exit
    Memory,
    /// libsql database file (requires the `turso` feature)
    Turso,
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to open (default: memory)
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Database path for the turso backend (default: ":memory:")
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long a turso transaction waits for the writer lock (default: 5000ms)
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

fn default_service_name() -> String {
    "change-audit".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_redacted_body_fields() -> Vec<String> {
    vec![
        "password".to_string(),
        "token".to_string(),
        "secret".to_string(),
    ]
}

fn default_excluded_routes() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/ready".to_string(),
        "/metrics".to_string(),
    ]
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_store_path() -> PathBuf {
    PathBuf::from(":memory:")
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Searches for config files in this order (first found wins on conflicts):
    /// 1. Current working directory: ./config.toml
    /// 2. XDG config directory: ~/.config/change-audit/config.toml
    ///
    /// Environment variables (`CHANGE_AUDIT_` prefix) override all file-based configs.
    pub fn load() -> Result<Self> {
        let config_paths = Self::find_config_paths();

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Lowest priority first so higher priority files override
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// This bypasses XDG directories and loads directly from the given path.
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Find all possible config file paths, highest priority first
    fn find_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let xdg_dirs = xdg::BaseDirectories::with_prefix("change-audit");
        if let Some(path) = xdg_dirs.find_config_file("config.toml") {
            paths.push(path);
        }

        paths
    }
}
