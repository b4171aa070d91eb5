//! Configuration file parser for the FdxTunnel agent
//!
//! Supports fdxtunnel.yml with the server address, the target id to
//! register under, and pipeline tuning.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};

use fdxtunnel_shared::protocol::DEFAULT_QUEUE_CAPACITY;

use crate::pipeline::PipelineOptions;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Server address (`host:port` or a ws:// URL)
    #[serde(default = "default_server")]
    pub server: String,

    /// Target identifier registered to the server
    #[serde(default = "default_target")]
    pub target: String,

    /// Capacity of the inbound and outbound queues
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Timeout for each forwarded request (unbounded when absent)
    #[serde(default)]
    pub forward_timeout_secs: Option<u64>,

    /// Bound on concurrent forwards (unbounded when absent)
    #[serde(default)]
    pub max_in_flight: Option<usize>,
}

fn default_server() -> String {
    "localhost:8080".to_string()
}

fn default_target() -> String {
    "localhost:5000".to_string()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            target: default_target(),
            queue_capacity: default_queue_capacity(),
            forward_timeout_secs: None,
            max_in_flight: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            anyhow::bail!("Server address cannot be empty");
        }
        if self.target.trim().is_empty() {
            anyhow::bail!("Target identifier cannot be empty");
        }
        if self.target.contains('/') {
            anyhow::bail!("Target identifier '{}' cannot contain '/'", self.target);
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("Queue capacity must be positive");
        }
        if self.max_in_flight == Some(0) {
            anyhow::bail!("max_in_flight must be positive when set");
        }
        Ok(())
    }

    pub fn forward_timeout(&self) -> Option<Duration> {
        self.forward_timeout_secs.map(Duration::from_secs)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            queue_capacity: self.queue_capacity,
            max_in_flight: self.max_in_flight,
        }
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<std::path::PathBuf> {
        let candidates = [
            "fdxtunnel.yml",
            "fdxtunnel.yaml",
            ".fdxtunnel.yml",
            ".fdxtunnel.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = std::path::PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
server: relay.example.com:8080
target: device-42
queue_capacity: 32
forward_timeout_secs: 15
max_in_flight: 8
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server, "relay.example.com:8080");
        assert_eq!(config.target, "device-42");
        assert_eq!(config.forward_timeout(), Some(Duration::from_secs(15)));
        let opts = config.pipeline_options();
        assert_eq!(opts.queue_capacity, 32);
        assert_eq!(opts.max_in_flight, Some(8));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: AgentConfig = serde_yaml::from_str("target: t1\n").unwrap();
        assert_eq!(config.server, "localhost:8080");
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.forward_timeout(), None);
        assert_eq!(config.max_in_flight, None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AgentConfig::default();
        config.target = String::new();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.target = "a/b".into();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.max_in_flight = Some(0);
        assert!(config.validate().is_err());
    }
}
