// Server configuration loaded from a JSON file at startup

use crate::server::store::MSG_QUEUE_QUOTA;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub tcp_port: u16,
    /// Optional WebSocket listener alongside the TLS listener.
    #[serde(default)]
    pub ws_port: Option<u16>,
    #[serde(default = "default_host")]
    pub bind_host: String,
    pub tls_private_key_file: PathBuf,
    pub tls_certificate_file: PathBuf,
    pub sqlite_database: PathBuf,
    #[serde(default = "default_quota")]
    pub message_quota_per_queue: usize,
    #[serde(default = "default_max_queues")]
    pub max_active_queues: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_quota() -> usize {
    MSG_QUEUE_QUOTA
}

fn default_max_queues() -> usize {
    100_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_idle_timeout() -> u64 {
    30
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&data).context("parsing server config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let json = r#"{
            "tcp_port": 5223,
            "tls_private_key_file": "/etc/smp/key.pem",
            "tls_certificate_file": "/etc/smp/cert.pem",
            "sqlite_database": "/var/lib/smp/queues.db"
        }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.message_quota_per_queue, MSG_QUEUE_QUOTA);
        assert_eq!(config.idle_timeout_secs, 30);
        assert_eq!(config.ws_port, None);
        assert_eq!(config.bind_host, "0.0.0.0");
    }
}
