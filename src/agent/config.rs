// Agent configuration loaded from a JSON file at startup

use crate::smp::address::SmpServer;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub database: PathBuf,
    /// Servers known at startup (used by clients that name no server).
    #[serde(default)]
    pub servers: Vec<SmpServer>,
    /// "on" or "off": what a bare JOIN without a reply argument means.
    #[serde(default = "default_reply_mode")]
    pub default_reply_mode: String,
    /// Port for the local client wire; absent for in-process use.
    #[serde(default)]
    pub tcp_port: Option<u16>,
    #[serde(default = "default_host")]
    pub bind_host: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_reply_mode() -> String {
    "on".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&data).context("parsing agent config")
    }

    /// An in-process config over the given database path.
    pub fn local(database: PathBuf) -> Self {
        Self {
            database,
            servers: Vec::new(),
            default_reply_mode: default_reply_mode(),
            tcp_port: None,
            bind_host: default_host(),
            log_level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let json = r#"{"database": "/var/lib/smp/agent.db", "tcp_port": 5224}"#;
        let config: AgentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.default_reply_mode, "on");
        assert!(config.servers.is_empty());
        assert_eq!(config.tcp_port, Some(5224));
    }

    #[test]
    fn test_servers_parse() {
        let json = r#"{
            "database": "agent.db",
            "servers": ["localhost:5223", "smp.example.com"]
        }"#;
        let config: AgentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].port, Some(5223));
    }
}
