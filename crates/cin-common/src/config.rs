use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "/etc/cin-dhcp-manager/config.json";
const DEFAULT_KEA_ENDPOINT: &str = "http://localhost:8000";

/// Path of the manager config file, overridable through `CIN_DHCP_CONFIG_PATH`.
pub fn config_path() -> PathBuf {
    PathBuf::from(
        std::env::var("CIN_DHCP_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub kea: KeaConfig,
    #[serde(default)]
    pub leases: LeaseConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeaConfig {
    /// Kea Control Agents, tried in ascending `priority` order.
    #[serde(default)]
    pub servers: Vec<KeaServerConfig>,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Config backend type sent in the `remote` argument of `remote-*` commands.
    #[serde(default = "default_remote_type")]
    pub remote_type: String,
    #[serde(default = "default_server_tags")]
    pub server_tags: Vec<String>,
    /// When set, successful subnet writes are followed by `config-write` to this file.
    #[serde(default)]
    pub config_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeaServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".into()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/cin-dhcp-manager/cin.db")
}

fn default_service() -> String {
    "dhcp6".into()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_remote_type() -> String {
    "mysql".into()
}

fn default_server_tags() -> Vec<String> {
    vec!["all".into()]
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_max_page_size() -> u32 {
    1000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            database_path: default_database_path(),
            log_format: LogFormat::default(),
            kea: KeaConfig::default(),
            leases: LeaseConfig::default(),
        }
    }
}

impl Default for KeaConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            service: default_service(),
            timeout_secs: default_timeout_secs(),
            remote_type: default_remote_type(),
            server_tags: default_server_tags(),
            config_file: None,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl ManagerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: ManagerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            info!("No config file found at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }
}

impl KeaConfig {
    /// Active servers sorted by ascending priority.
    ///
    /// An empty server list falls back to a single `primary` server at
    /// `KEA_API_ENDPOINT` (or `http://localhost:8000`).
    pub fn active_servers(&self) -> Vec<KeaServerConfig> {
        if self.servers.is_empty() {
            let url = std::env::var("KEA_API_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_KEA_ENDPOINT.to_string());
            return vec![KeaServerConfig {
                name: "primary".into(),
                url,
                priority: 0,
                active: true,
            }];
        }

        let mut servers: Vec<KeaServerConfig> =
            self.servers.iter().filter(|s| s.active).cloned().collect();
        servers.sort_by_key(|s| s.priority);
        servers
    }

    /// Config for a single server at `url`, used by tests and one-shot tools.
    pub fn single(url: impl Into<String>) -> Self {
        Self {
            servers: vec![KeaServerConfig {
                name: "primary".into(),
                url: url.into(),
                priority: 0,
                active: true,
            }],
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_gives_defaults() {
        let config: ManagerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen_address, "0.0.0.0:8080");
        assert_eq!(config.kea.service, "dhcp6");
        assert_eq!(config.kea.server_tags, vec!["all".to_string()]);
        assert_eq!(config.leases.cache_ttl_secs, 60);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.kea.config_file.is_none());
    }

    #[test]
    fn test_active_servers_sorted_by_priority() {
        let config: KeaConfig = serde_json::from_str(
            r#"{
                "servers": [
                    {"name": "secondary", "url": "http://b:8000", "priority": 2},
                    {"name": "disabled", "url": "http://c:8000", "priority": 0, "active": false},
                    {"name": "primary", "url": "http://a:8000", "priority": 1}
                ]
            }"#,
        )
        .unwrap();

        let names: Vec<String> = config.active_servers().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["primary", "secondary"]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"listen_address": "127.0.0.1:9000", "log_format": "json", "kea": {"config_file": "/opt/kea/etc/kea/kea-dhcp6.conf"}}"#,
        )
        .unwrap();

        let config = ManagerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:9000");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.kea.config_file.as_deref(), Some("/opt/kea/etc/kea/kea-dhcp6.conf"));
        assert_eq!(config.kea.timeout_secs, 10);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ManagerConfig::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.leases.max_page_size, 1000);
    }
}
