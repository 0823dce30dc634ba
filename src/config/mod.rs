//! Configuration management.
//!
//! petrel configuration can come from:
//! - Environment variables (PETREL_*)
//! - Config file (~/.config/petrel/config.toml)
//!
//! The loaded `Config` is passed explicitly into the components that need it
//! (the net translator for callback URL construction, the coordinator and
//! clients for service endpoints); nothing reads the environment at runtime.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// petrel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// External service endpoints
    #[serde(default)]
    pub services: ServicesConfig,

    /// Outbound notification dispatch tuning
    #[serde(default)]
    pub outbox: OutboxConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Base URL advertised to the execution substrate for callbacks.
    /// Defaults to `http://{host}:{port}` when unset.
    #[serde(default)]
    pub callback_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            callback_base_url: None,
        }
    }
}

fn default_port() -> u16 {
    8082
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// External service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Net-execution substrate endpoint (compiled plans are submitted here)
    #[serde(default = "default_net_url")]
    pub net_url: String,

    /// Default job service endpoint, used when a job method omits serviceUrl
    #[serde(default = "default_job_url")]
    pub job_url: String,

    /// Timeout for blocking submit-and-acknowledge calls (seconds)
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_seconds: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            net_url: default_net_url(),
            job_url: default_job_url(),
            submit_timeout_seconds: default_submit_timeout(),
        }
    }
}

fn default_net_url() -> String {
    "http://localhost:8081/v1".to_string()
}

fn default_job_url() -> String {
    "http://localhost:8083/v1".to_string()
}

fn default_submit_timeout() -> u64 {
    30
}

/// Outbound notification dispatch tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Maximum delivery attempts before a notification is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between redelivery attempts (seconds, doubled per attempt)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,

    /// Poll interval of the dispatcher loop (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_seconds: default_retry_delay(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    500
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("petrel"))
            .unwrap_or_else(|| PathBuf::from(".petrel"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("petrel"))
            .unwrap_or_else(|| PathBuf::from(".petrel"))
    }

    /// Path of the SQLite database (configured or default).
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("petrel.db"))
    }

    /// Base URL the substrate uses to call back into this service.
    pub fn callback_base_url(&self) -> String {
        self.server
            .callback_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.server.host, self.server.port))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PETREL_SERVER_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                self.server.port = parsed;
            }
        }
        if let Ok(host) = std::env::var("PETREL_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(url) = std::env::var("PETREL_CALLBACK_BASE_URL") {
            self.server.callback_base_url = Some(url);
        }
        if let Ok(url) = std::env::var("PETREL_NET_URL") {
            self.services.net_url = url;
        }
        if let Ok(url) = std::env::var("PETREL_JOB_URL") {
            self.services.job_url = url;
        }
        if let Ok(path) = std::env::var("PETREL_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(server) = partial.server {
            self.server = server;
        }
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(services) = partial.services {
            self.services = services;
        }
        if let Some(outbox) = partial.outbox {
            self.outbox = outbox;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    server: Option<ServerConfig>,
    storage: Option<StorageConfig>,
    services: Option<ServicesConfig>,
    outbox: Option<OutboxConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8082);
        assert_eq!(config.outbox.max_attempts, 5);
        assert!(config.services.net_url.starts_with("http://"));
    }

    #[test]
    fn test_callback_base_url_falls_back_to_bind_address() {
        let config = Config::default();
        assert_eq!(config.callback_base_url(), "http://127.0.0.1:8082");

        let mut config = Config::default();
        config.server.callback_base_url = Some("https://petrel.example.com".into());
        assert_eq!(config.callback_base_url(), "https://petrel.example.com");
    }

    #[test]
    fn test_partial_toml_overrides() {
        let mut config = Config::default();
        let partial: PartialConfig = toml::from_str(
            r#"
            [services]
            net_url = "http://net.internal/v1"
            "#,
        )
        .unwrap();
        config.apply_partial(partial);
        assert_eq!(config.services.net_url, "http://net.internal/v1");
        // untouched sections keep their defaults
        assert_eq!(config.server.port, 8082);
    }
}
