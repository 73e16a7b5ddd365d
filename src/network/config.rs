//! Static cluster topology, loaded from a TOML file (SPEC_FULL.md §10.3).
//! Substitutes the embedded-scripting `the_network` Lua table the
//! original reads in `network.cpp::Network::init` — same shape, a
//! different loader.

use crate::error::GxError;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "instance")]
    pub instances: Vec<InstanceConfig>,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub connect_retry_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_rpc_timeout_ms() -> u64 {
    3000
}
fn default_retry_interval_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    3000
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    pub host: String,
    pub port: u16,
    pub node_type: u32,
    pub node_name: String,
    pub node_id: u32,
    #[serde(default)]
    pub ap: bool,
    #[serde(default)]
    pub servlets: Vec<u32>,
}

impl NetworkConfig {
    pub fn load(path: &Path) -> Result<Self, GxError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| GxError::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_topology() {
        let toml_text = r#"
            [[instance]]
            host = "127.0.0.1"
            port = 9001
            node_type = 1
            node_name = "game"
            node_id = 0
            servlets = [65537]

            [[instance]]
            host = "127.0.0.1"
            port = 9002
            node_type = 1
            node_name = "game"
            node_id = 1
            ap = true
        "#;
        let cfg: NetworkConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.instances.len(), 2);
        assert_eq!(cfg.instances[0].servlets, vec![65537]);
        assert!(cfg.instances[1].ap);
        assert_eq!(cfg.rpc_timeout_ms, 3000);
    }
}
