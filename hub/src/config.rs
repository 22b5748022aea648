//! Hub configuration: defaults, overridden by an optional TOML file,
//! overridden again by `HUB_*` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Hostname/IP the target cloud side reaches this Hub at — used to
    /// build NBD locators (spec §4.L5). Distinct from `host`, which is the
    /// local bind address and is commonly `0.0.0.0`.
    pub public_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8443, public_host: "hub.local".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite:///var/lib/hub/hub.db".to_string(), max_connections: 32 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub user: String,
    pub port: u16,
    pub authorized_keys_path: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            user: "tunnel".to_string(),
            port: 443,
            authorized_keys_path: "/home/tunnel/.ssh/authorized_keys".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_seconds: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json_format: false }
    }
}

/// Target cloud (CloudStack/OSSEA) API credentials (spec §4.L4). Kept as
/// plain config rather than a vault integration — out of scope per spec §1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub api_url: String,
    pub api_key: String,
    pub secret_key: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self { api_url: "http://localhost:8080/client/api".to_string(), api_key: String::new(), secret_key: String::new() }
    }
}

/// A statically configured node registry: which Hub-local loopback port the
/// tunnel's remote forward exposes for each enrolled node, keyed by the
/// vCenter host the node fronts. Dynamic node discovery through the
/// enrolment flow is out of `HubConfig`'s scope; this is the seam an
/// operator fills in once a node is approved (spec §4.L2/§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRegistryConfig {
    pub nodes: HashMap<String, String>,
}

/// vCenter service-account credentials per stored `credential_id` (spec
/// §4.M2's `CredentialResolver` seam). Out-of-scope for real secret
/// vaulting, same rationale as `CloudConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub entries: HashMap<String, CredentialEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub vcenter: String,
    pub username: String,
    pub password: String,
}

/// Per-context network mappings an operator configures ahead of a failover
/// (spec §4.M3's `NetworkMappingResolver` seam).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworksConfig {
    pub mappings: HashMap<String, Vec<NetworkMappingEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMappingEntry {
    pub source_network: String,
    pub target_network_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub tunnel: TunnelConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    pub cloud: CloudConfig,
    #[serde(default)]
    pub node_registry: NodeRegistryConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub networks: NetworksConfig,
}

#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, String),
    Parse(String),
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, msg) => write!(f, "failed to read {}: {msg}", path.display()),
            ConfigError::Parse(msg) => write!(f, "failed to parse config: {msg}"),
            ConfigError::Validation(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl HubConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = Self::find_config_file() {
            config = Self::load_from_file(&path)?;
        }
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("HUB_CONFIG") {
            return Some(PathBuf::from(path));
        }
        for candidate in ["/etc/hub/config.toml", "./config.toml", "./hub.toml"] {
            let path = Path::new(candidate);
            if path.exists() {
                return Some(path.to_path_buf());
            }
        }
        None
    }

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e.to_string()))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HUB_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("HUB_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("HUB_DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("HUB_TUNNEL_PORT") {
            if let Ok(port) = v.parse() {
                self.tunnel.port = port;
            }
        }
        if let Ok(v) = std::env::var("RUST_LOG") {
            self.logging.level = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("server.port must not be 0".to_string()));
        }
        if self.database.url.is_empty() {
            return Err(ConfigError::Validation("database.url must not be empty".to_string()));
        }
        if self.tunnel.port == 0 {
            return Err(ConfigError::Validation("tunnel.port must not be 0".to_string()));
        }
        Ok(())
    }

    pub fn generate_sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = HubConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_port_fails_validation() {
        let mut config = HubConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sample_round_trips() {
        let sample = HubConfig::generate_sample();
        let parsed: HubConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.server.port, HubConfig::default().server.port);
    }
}
