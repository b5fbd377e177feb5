//! Server configuration

use crate::cli::Cli;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tagstream_classifiers::DEFAULT_FAILED_TAG_LIMIT;
use tagstream_core::Credentials;
use tagstream_engine::EngineOptions;
use tagstream_store::ItemCacheOptions;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Only this peer may connect when set
    #[serde(default)]
    pub allowed_ip: Option<IpAddr>,

    /// Largest request body accepted, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Item store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Classification engine configuration
    #[serde(default)]
    pub engine: EngineOptions,

    /// Tagger cache configuration
    #[serde(default)]
    pub tagger_cache: TaggerCacheConfig,

    /// Shared secret for signed requests; absent leaves endpoints open
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl ServerConfig {
    /// Load configuration from file and CLI overrides
    pub fn load(config_path: &str, cli: &Cli) -> anyhow::Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let content = std::fs::read_to_string(config_path)?;
            serde_yaml::from_str(&content)?
        } else {
            Self::default()
        };

        if let Some(listen) = &cli.listen {
            config.listen = listen.clone();
        }

        if let Some(port) = cli.port {
            config.port = port;
        }

        if let Some(store) = &cli.store {
            config.store.path = store.clone();
        }

        Ok(config)
    }

    /// Credentials that actually gate requests
    pub fn active_credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref().filter(|c| c.is_configured())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            allowed_ip: None,
            max_body_bytes: default_max_body_bytes(),
            store: StoreConfig::default(),
            engine: EngineOptions::default(),
            tagger_cache: TaggerCacheConfig::default(),
            credentials: None,
        }
    }
}

/// Item store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store directory
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    #[serde(flatten)]
    pub options: ItemCacheOptions,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            options: ItemCacheOptions::default(),
        }
    }
}

/// Tagger cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggerCacheConfig {
    /// Threads dedicated to fetching tag definitions
    #[serde(default = "default_fetch_threads")]
    pub fetch_threads: usize,

    /// Timeout for tag definition and tagging requests
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Failed tags remembered before the oldest become fetchable again
    #[serde(default = "default_max_failed_tags")]
    pub max_failed_tags: usize,
}

impl Default for TaggerCacheConfig {
    fn default() -> Self {
        Self {
            fetch_threads: default_fetch_threads(),
            http_timeout_secs: default_http_timeout(),
            max_failed_tags: default_max_failed_tags(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8008
}

fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/store")
}

fn default_fetch_threads() -> usize {
    2
}

fn default_http_timeout() -> u64 {
    30
}

fn default_max_failed_tags() -> usize {
    DEFAULT_FAILED_TAG_LIMIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: ServerConfig = serde_yaml::from_str("port: 9000\n").unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.listen, "0.0.0.0");
        assert_eq!(config.store.path, PathBuf::from("data/store"));
        assert_eq!(config.engine.positive_threshold, 0.9);
        assert_eq!(config.tagger_cache.max_failed_tags, 1024);
        assert!(config.active_credentials().is_none());
    }

    #[test]
    fn test_nested_sections() {
        let yaml = r#"
allowed_ip: 127.0.0.1
store:
  path: /var/lib/tagstream
  min_tokens: 5
engine:
  worker_threads: 3
credentials:
  access_id: collector
  secret: s3cret
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.allowed_ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(config.store.options.min_tokens, 5);
        assert_eq!(config.store.options.background_sample_size, 1000);
        assert_eq!(config.engine.worker_threads, 3);
        assert_eq!(config.active_credentials().unwrap().access_id, "collector");
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = Cli {
            port: Some(7000),
            store: Some(PathBuf::from("/tmp/store")),
            ..Default::default()
        };
        let config = ServerConfig::load("/nonexistent/tagstream.yaml", &cli).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.store.path, PathBuf::from("/tmp/store"));
        assert_eq!(config.listen, "0.0.0.0");
    }

    #[test]
    fn test_empty_credentials_leave_server_open() {
        let config: ServerConfig =
            serde_yaml::from_str("credentials:\n  access_id: \"\"\n  secret: \"\"\n").unwrap();
        assert!(config.credentials.is_some());
        assert!(config.active_credentials().is_none());
    }
}
