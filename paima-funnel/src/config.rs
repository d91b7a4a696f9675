// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Network configuration for the funnel
//!
//! Exactly one network is the main chain (`evm-main` or `avail-main`). Every other
//! entry is read in parallel and aligned to the main chain by timestamp.

use serde::{Deserialize, Serialize};

use crate::sources::carp::CardanoNetwork;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkConfig {
    /// Key used by extensions to pick their network
    pub name: String,
    #[serde(flatten)]
    pub kind: NetworkKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NetworkKind {
    #[serde(rename_all = "kebab-case")]
    EvmMain {
        rpc_url: String,
        chain_id: u64,
        paima_l2_contract_address: String,
        #[serde(default = "default_confirmations")]
        confirmations: u64,
        #[serde(default = "default_funnel_block_group_size")]
        funnel_block_group_size: u64,
        #[serde(default = "default_presync_step_size")]
        presync_step_size: u64,
    },
    #[serde(rename_all = "kebab-case")]
    EvmOther {
        rpc_url: String,
        chain_id: u64,
        #[serde(default = "default_confirmations")]
        confirmations: u64,
        #[serde(default = "default_presync_step_size")]
        presync_step_size: u64,
    },
    #[serde(rename_all = "kebab-case")]
    AvailMain {
        light_client_url: String,
        genesis_hash: String,
        app_id: u32,
        #[serde(default = "default_funnel_block_group_size")]
        funnel_block_group_size: u64,
    },
    #[serde(rename_all = "kebab-case")]
    AvailOther {
        light_client_url: String,
        genesis_hash: String,
        app_id: u32,
    },
    #[serde(rename_all = "kebab-case")]
    Cardano {
        carp_url: String,
        network: CardanoNetwork,
        #[serde(default = "default_cardano_confirmation_depth")]
        confirmation_depth: u64,
        #[serde(default = "default_page_size")]
        page_size: u64,
    },
    #[serde(rename_all = "kebab-case")]
    Mina {
        archive_url: String,
        #[serde(default = "default_mina_network")]
        network_id: String,
        #[serde(default = "default_mina_confirmation_depth")]
        confirmation_depth: u64,
        #[serde(default = "default_page_size")]
        page_size: u64,
    },
}

fn default_confirmations() -> u64 {
    0
}

fn default_funnel_block_group_size() -> u64 {
    100
}

fn default_presync_step_size() -> u64 {
    1000
}

fn default_cardano_confirmation_depth() -> u64 {
    15
}

fn default_page_size() -> u64 {
    1000
}

fn default_mina_network() -> String {
    "devnet".to_string()
}

fn default_mina_confirmation_depth() -> u64 {
    15
}

impl NetworkConfig {
    pub fn is_main(&self) -> bool {
        matches!(
            self.kind,
            NetworkKind::EvmMain { .. } | NetworkKind::AvailMain { .. }
        )
    }

    pub fn is_evm(&self) -> bool {
        matches!(
            self.kind,
            NetworkKind::EvmMain { .. } | NetworkKind::EvmOther { .. }
        )
    }

    /// CAIP-2 chain id, used as the `network` of emitted blocks and datums.
    pub fn caip2(&self) -> String {
        match &self.kind {
            NetworkKind::EvmMain { chain_id, .. } | NetworkKind::EvmOther { chain_id, .. } => {
                format!("eip155:{}", chain_id)
            }
            NetworkKind::AvailMain { genesis_hash, .. }
            | NetworkKind::AvailOther { genesis_hash, .. } => {
                let hash: String = genesis_hash.trim_start_matches("0x").chars().take(32).collect();
                format!("polkadot:{}", hash)
            }
            NetworkKind::Cardano { network, .. } => network.caip2().to_string(),
            NetworkKind::Mina { network_id, .. } => format!("mina:{}", network_id),
        }
    }
}

/// Fixed-duration block emulation on top of the main chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EmulatedBlocksConfig {
    pub block_time_secs: u64,
    /// Unix seconds of emulated block 0. Defaults to the main start block's timestamp.
    #[serde(default)]
    pub start_timestamp: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_networks_yaml() {
        let yaml = r#"
- name: evmMain
  type: evm-main
  rpc-url: http://localhost:8545
  chain-id: 31337
  paima-l2-contract-address: "0x5FbDB2315678afecb367f032d93F642f64180aa3"
- name: cardano
  type: cardano
  carp-url: http://localhost:3000
  network: preview
- name: mina
  type: mina
  archive-url: http://localhost:8282
"#;
        let networks: Vec<NetworkConfig> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(networks.len(), 3);
        assert!(networks[0].is_main());
        assert!(networks[0].is_evm());
        assert_eq!(networks[0].caip2(), "eip155:31337");
        match &networks[0].kind {
            NetworkKind::EvmMain {
                funnel_block_group_size,
                confirmations,
                ..
            } => {
                assert_eq!(*funnel_block_group_size, 100);
                assert_eq!(*confirmations, 0);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(networks[1].caip2(), "cip34:0-2");
        assert_eq!(networks[2].caip2(), "mina:devnet");
        assert!(!networks[2].is_main());
    }

    #[test]
    fn test_avail_caip2_truncates_genesis() {
        let network = NetworkConfig {
            name: "avail".into(),
            kind: NetworkKind::AvailOther {
                light_client_url: "http://localhost:7007".into(),
                genesis_hash: "0xd3d2f3a3495dc597434a99d7d449ebad6616db45e4e4f178f31cc6fa14378b70"
                    .into(),
                app_id: 0,
            },
        };
        assert_eq!(network.caip2(), "polkadot:d3d2f3a3495dc597434a99d7d449ebad");
    }
}
