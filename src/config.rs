//! Configuration file support for the Meridian node.
//!
//! Loads optional `meridian.toml` from the data directory. CLI flags
//! override config file values; missing files and missing keys fall back to
//! defaults.

use std::path::Path;

use serde::Deserialize;

use crate::constants;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    pub node: NodeSection,
    pub forging: ForgingSection,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub data_dir: String,
    pub p2p_port: u16,
    /// Peer addresses handed to the transport layer.
    pub peers: Vec<String>,
    /// Run on the in-memory storage engine (dev networks).
    pub in_memory: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            data_dir: "./meridian-data".into(),
            p2p_port: constants::DEFAULT_P2P_PORT,
            peers: vec![],
            in_memory: false,
        }
    }
}

/// Forging configuration section.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ForgingSection {
    /// Secrets of the delegates this node forges for.
    pub secrets: Vec<String>,
}

impl MeridianConfig {
    /// Load configuration from `meridian.toml` in the given directory.
    /// Returns defaults if the file doesn't exist or fails to parse.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("meridian.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeridianConfig::load(dir.path());
        assert_eq!(config.node.p2p_port, constants::DEFAULT_P2P_PORT);
        assert!(config.forging.secrets.is_empty());
    }

    #[test]
    fn parses_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("meridian.toml"),
            "[forging]\nsecrets = [\"tide anchor ledger\"]\n",
        )
        .unwrap();
        let config = MeridianConfig::load(dir.path());
        assert_eq!(config.forging.secrets.len(), 1);
        assert_eq!(config.node.data_dir, "./meridian-data");
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("meridian.toml"), "not [valid toml").unwrap();
        let config = MeridianConfig::load(dir.path());
        assert!(config.node.peers.is_empty());
    }
}
