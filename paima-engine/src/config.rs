// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Node configuration
//!
//! Two files are loaded at boot: the node config (networks, heights, timing) and the
//! extension config (one entry per chain data extension).

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use paima_config::Config;
use paima_funnel::cde::ExtensionConfig;
use paima_funnel::config::{EmulatedBlocksConfig, NetworkConfig};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    pub networks: Vec<NetworkConfig>,
    /// First main-chain block fed to the STF
    pub start_block_height: u64,
    #[serde(default)]
    pub emulated_blocks: Option<EmulatedBlocksConfig>,
    #[serde(default)]
    pub randomness: RandomnessConfig,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_funnel_timeout")]
    pub funnel_timeout: Duration,
    /// Stop cleanly after committing this height
    #[serde(default)]
    pub stop_block_height: Option<u64>,
}

impl Config for NodeConfig {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RandomnessProtocol {
    #[default]
    ChainDataSeed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RandomnessConfig {
    #[serde(default)]
    pub protocol: RandomnessProtocol,
    /// Number of previous seeds mixed into each new one
    #[serde(default = "default_seed_history")]
    pub seed_history: usize,
}

impl Default for RandomnessConfig {
    fn default() -> Self {
        Self {
            protocol: RandomnessProtocol::default(),
            seed_history: default_seed_history(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_funnel_timeout() -> Duration {
    paima_funnel::error::DEFAULT_FUNNEL_TIMEOUT
}

fn default_seed_history() -> usize {
    25
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        let mains = self.networks.iter().filter(|n| n.is_main()).count();
        if mains != 1 {
            bail!("expected exactly one main network, found {}", mains);
        }

        let mut names = HashSet::new();
        for network in &self.networks {
            if !names.insert(network.name.as_str()) {
                bail!("duplicate network name {}", network.name);
            }
        }

        if let Some(emulated) = &self.emulated_blocks {
            if emulated.block_time_secs == 0 {
                bail!("emulated-blocks.block-time-secs must be positive");
            }
        }

        if let Some(stop) = self.stop_block_height {
            if stop < self.start_block_height && self.emulated_blocks.is_none() {
                bail!(
                    "stop-block-height {} is below start-block-height {}",
                    stop,
                    self.start_block_height
                );
            }
        }

        if self.funnel_timeout.is_zero() {
            bail!("funnel-timeout must be positive");
        }
        Ok(())
    }

    pub fn main_network(&self) -> Result<&NetworkConfig> {
        self.networks
            .iter()
            .find(|n| n.is_main())
            .ok_or_else(|| anyhow!("no main network configured"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExtensionsConfig {
    #[serde(default)]
    pub extensions: Vec<ExtensionConfig>,
}

impl Config for ExtensionsConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use paima_config::ConfigFormat;

    const NODE_YAML: &str = r#"
networks:
  - name: evmMain
    type: evm-main
    rpc-url: http://localhost:8545
    chain-id: 31337
    paima-l2-contract-address: "0x5FbDB2315678afecb367f032d93F642f64180aa3"
  - name: arbitrum
    type: evm-other
    rpc-url: http://localhost:8546
    chain-id: 42161
start-block-height: 120
emulated-blocks:
  block-time-secs: 4
poll-interval: 2500
"#;

    #[test]
    fn test_parse_node_config_with_defaults() {
        let config = NodeConfig::parse(NODE_YAML, ConfigFormat::Yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.start_block_height, 120);
        assert_eq!(config.poll_interval, Duration::from_millis(2500));
        assert_eq!(config.funnel_timeout, Duration::from_secs(40));
        assert_eq!(config.randomness.seed_history, 25);
        assert_eq!(config.randomness.protocol, RandomnessProtocol::ChainDataSeed);
        assert_eq!(config.emulated_blocks.unwrap().block_time_secs, 4);
        assert_eq!(config.emulated_blocks.unwrap().start_timestamp, None);
        assert_eq!(config.main_network().unwrap().name, "evmMain");
        assert_eq!(config.stop_block_height, None);
    }

    #[test]
    fn test_validate_rejects_two_main_networks() {
        let mut config = NodeConfig::parse(NODE_YAML, ConfigFormat::Yaml).unwrap();
        let mut second = config.networks[0].clone();
        second.name = "otherMain".into();
        config.networks.push(second);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = NodeConfig::parse(NODE_YAML, ConfigFormat::Yaml).unwrap();
        config.networks[1].name = "evmMain".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_block_time() {
        let mut config = NodeConfig::parse(NODE_YAML, ConfigFormat::Yaml).unwrap();
        config.emulated_blocks = Some(EmulatedBlocksConfig {
            block_time_secs: 0,
            start_timestamp: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_extensions_config_roundtrips_through_file() {
        let yaml = r#"
extensions:
  - name: gold
    type: erc20
    network: evmMain
    start-block-height: 50
    scheduled-prefix: gold
    contract-address: "0x0000000000000000000000000000000000000001"
"#;
        let config = ExtensionsConfig::parse(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.extensions.len(), 1);
        assert_eq!(config.extensions[0].scheduled_prefix.as_deref(), Some("gold"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extensions.json");
        config.save(&path).unwrap();
        assert_eq!(ExtensionsConfig::load(&path).unwrap(), config);
    }
}
