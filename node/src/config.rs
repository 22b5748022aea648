//! Node configuration: defaults, overridden by an optional TOML file,
//! overridden again by `NODE_*` environment variables (mirrors `hub`'s
//! `config.rs`).
//!
//! Also owns the small persisted state file spec §6 describes under
//! "Filesystem state on Node": `OMA_HOST`, `OMA_PORT=443`, the local control
//! API port, the tunnel's local port, and the enrolment id once approved.
//! That file is distinct from `NodeConfig` itself — it is written by the
//! enrolment flow at runtime, not edited by an operator ahead of time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the Node's local control API. Never a public
    /// address (spec §1/§6): only reachable through the tunnel's remote
    /// forward, so binding to loopback is the expected deployment.
    pub host: String,
    pub port: u16,
    /// This node's identity as presented during enrolment (`node_name` in
    /// `EnrollRequest`) and embedded as the OpenSSH key comment.
    pub node_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 9201, node_name: "node".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// `OMA_HOST` — the Hub's reachable address.
    pub oma_host: String,
    /// `OMA_PORT` — fixed at 443 per spec §6, kept configurable for tests.
    pub oma_port: u16,
    pub tunnel_user: String,
    pub private_key_path: String,
    /// Local port the Hub can reach this Node's control API on, once the
    /// remote forward is up.
    pub remote_forward_port: u16,
    /// Local port NBD data-plane traffic is forwarded through (local
    /// forward, Hub -> Node direction from the Node's viewpoint).
    pub local_forward_port: u16,
    pub server_alive_interval_seconds: u64,
    pub server_alive_count_max: u32,
    pub backoff_cap_seconds: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            oma_host: "hub.local".to_string(),
            oma_port: 443,
            tunnel_user: "tunnel".to_string(),
            private_key_path: "/etc/node/tunnel_key".to_string(),
            remote_forward_port: 9201,
            local_forward_port: 10809,
            server_alive_interval_seconds: 15,
            server_alive_count_max: 3,
            backoff_cap_seconds: 60,
        }
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

/// Where the Node's data-mover helper binary lives and how it's invoked
/// (spec §4.M1). The binary itself is out of core scope (spec §1); this is
/// just the seam the supervisor shells out through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoverConfig {
    pub binary_path: String,
    pub chunk_size_bytes: u64,
    pub throughput_cap_mbps: Option<u64>,
    pub max_retries: u32,
    pub retry_backoff_seconds: u64,
}

impl Default for MoverConfig {
    fn default() -> Self {
        Self {
            binary_path: "/usr/local/bin/node-mover".to_string(),
            chunk_size_bytes: 4 * 1024 * 1024,
            throughput_cap_mbps: None,
            max_retries: 3,
            retry_backoff_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub server: ServerConfig,
    pub tunnel: TunnelConfig,
    pub logging: LoggingConfig,
    pub mover: MoverConfig,
    /// The vCenter connection used for VM-scoped operations that aren't
    /// part of an in-flight replicate job (power control, spec-diff,
    /// ad-hoc CBT probes) and therefore carry no per-request credential of
    /// their own. Discover/replicate calls always bring their own
    /// credential and never consult this.
    #[serde(default)]
    pub default_credential: Option<common::wire::VCenterCredential>,
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

impl NodeConfig {
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
        if let Ok(path) = std::env::var("NODE_CONFIG") {
            return Some(PathBuf::from(path));
        }
        for candidate in ["/etc/node/config.toml", "./config.toml", "./node.toml"] {
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
        if let Ok(v) = std::env::var("NODE_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("NODE_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("OMA_HOST") {
            self.tunnel.oma_host = v;
        }
        if let Ok(v) = std::env::var("OMA_PORT") {
            if let Ok(port) = v.parse() {
                self.tunnel.oma_port = port;
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
        if self.tunnel.oma_port == 0 {
            return Err(ConfigError::Validation("tunnel.oma_port must not be 0".to_string()));
        }
        if self.mover.max_retries == 0 {
            return Err(ConfigError::Validation("mover.max_retries must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn generate_sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Filesystem state on the Node (spec §6): written once enrolment approves,
/// read back by the tunnel supervisor at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelState {
    pub oma_host: String,
    pub oma_port: u16,
    pub local_api_port: u16,
    pub tunnel_local_port: u16,
    pub enrollment_id: String,
}

impl TunnelState {
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e.to_string()))?;
        toml::from_str(&contents).map(Some).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e.to_string()))?;
        }
        std::fs::write(path, contents).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_oma_port_fails_validation() {
        let mut config = NodeConfig::default();
        config.tunnel.oma_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sample_round_trips() {
        let sample = NodeConfig::generate_sample();
        let parsed: NodeConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.server.port, NodeConfig::default().server.port);
    }

    #[test]
    fn tunnel_state_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        let state = TunnelState {
            oma_host: "hub.example.com".into(),
            oma_port: 443,
            local_api_port: 9201,
            tunnel_local_port: 10809,
            enrollment_id: "enr-1".into(),
        };
        state.save(&path).unwrap();
        let loaded = TunnelState::load(&path).unwrap().unwrap();
        assert_eq!(loaded.enrollment_id, "enr-1");
    }

    #[test]
    fn tunnel_state_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(TunnelState::load(&path).unwrap().is_none());
    }
}
