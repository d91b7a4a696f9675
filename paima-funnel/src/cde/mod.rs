// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Chain data extensions
//!
//! An extension is a configured side-channel source (token contract, generic event,
//! Cardano policy, Mina zkApp, ...). Readers in the submodules turn a position range on the
//! extension's network into [`CdeDatum`]s.
//!
//! Ordering rules:
//! - within one extension, datums keep the order of their source streams, combined with
//!   [`merge_sorted`];
//! - across extensions of a block, datums are ordered by `(block_number, cde_id)`.

pub mod cardano;
pub mod evm;
pub mod mina;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;
use tokio::sync::RwLock;

use crate::config::NetworkConfig;
use crate::error::{FunnelError, FunnelResult};

/// One entry of the extension config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExtensionConfig {
    pub name: String,
    /// Name of the network (see `NetworkConfig::name`) the extension reads from.
    pub network: String,
    pub start_block_height: u64,
    #[serde(default)]
    pub scheduled_prefix: Option<String>,
    #[serde(flatten)]
    pub kind: ExtensionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, AsRefStr)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ExtensionKind {
    #[serde(rename_all = "kebab-case")]
    Erc20 { contract_address: String },
    #[serde(rename_all = "kebab-case")]
    Erc721 {
        contract_address: String,
        #[serde(default)]
        burn_scheduled_prefix: Option<String>,
    },
    #[serde(rename_all = "kebab-case")]
    Erc1155 {
        contract_address: String,
        #[serde(default)]
        burn_scheduled_prefix: Option<String>,
    },
    #[serde(rename_all = "kebab-case")]
    Generic {
        contract_address: String,
        /// ABI JSON fragment of the event to track
        event_abi: serde_json::Value,
    },
    #[serde(rename_all = "kebab-case")]
    DynamicEvmPrimitive {
        contract_address: String,
        event_abi: serde_json::Value,
        /// Event parameter holding the address of the announced contract
        address_field: String,
        target: DynamicTarget,
    },
    #[serde(rename_all = "kebab-case")]
    CardanoPool { pools: Vec<String> },
    #[serde(rename_all = "kebab-case")]
    CardanoMintBurn { policy_ids: Vec<String> },
    #[serde(rename_all = "kebab-case")]
    CardanoTransfer { credential: String },
    #[serde(rename_all = "kebab-case")]
    MinaEvent { address: String },
    #[serde(rename_all = "kebab-case")]
    MinaAction { address: String },
}

/// Template instantiated for every contract a dynamic primitive announces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DynamicTarget {
    #[serde(default)]
    pub scheduled_prefix: Option<String>,
    #[serde(flatten)]
    pub kind: DynamicTargetKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DynamicTargetKind {
    Erc20,
    #[serde(rename_all = "kebab-case")]
    Erc721 {
        #[serde(default)]
        burn_scheduled_prefix: Option<String>,
    },
    #[serde(rename_all = "kebab-case")]
    Erc1155 {
        #[serde(default)]
        burn_scheduled_prefix: Option<String>,
    },
    #[serde(rename_all = "kebab-case")]
    Generic { event_abi: serde_json::Value },
}

impl DynamicTarget {
    /// Extension config for a contract announced at `block_height` by `parent`.
    pub fn instantiate(
        &self,
        parent: &ExtensionConfig,
        contract_address: &str,
        block_height: u64,
    ) -> ExtensionConfig {
        let contract_address = contract_address.to_lowercase();
        let kind = match &self.kind {
            DynamicTargetKind::Erc20 => ExtensionKind::Erc20 {
                contract_address: contract_address.clone(),
            },
            DynamicTargetKind::Erc721 {
                burn_scheduled_prefix,
            } => ExtensionKind::Erc721 {
                contract_address: contract_address.clone(),
                burn_scheduled_prefix: burn_scheduled_prefix.clone(),
            },
            DynamicTargetKind::Erc1155 {
                burn_scheduled_prefix,
            } => ExtensionKind::Erc1155 {
                contract_address: contract_address.clone(),
                burn_scheduled_prefix: burn_scheduled_prefix.clone(),
            },
            DynamicTargetKind::Generic { event_abi } => ExtensionKind::Generic {
                contract_address: contract_address.clone(),
                event_abi: event_abi.clone(),
            },
        };
        ExtensionConfig {
            name: format!("{}-{}", parent.name, contract_address),
            network: parent.network.clone(),
            start_block_height: block_height + 1,
            scheduled_prefix: self.scheduled_prefix.clone(),
            kind,
        }
    }
}

impl ExtensionKind {
    pub fn is_evm(&self) -> bool {
        matches!(
            self,
            ExtensionKind::Erc20 { .. }
                | ExtensionKind::Erc721 { .. }
                | ExtensionKind::Erc1155 { .. }
                | ExtensionKind::Generic { .. }
                | ExtensionKind::DynamicEvmPrimitive { .. }
        )
    }

    pub fn is_cardano(&self) -> bool {
        matches!(
            self,
            ExtensionKind::CardanoPool { .. }
                | ExtensionKind::CardanoMintBurn { .. }
                | ExtensionKind::CardanoTransfer { .. }
        )
    }

    pub fn is_mina(&self) -> bool {
        matches!(
            self,
            ExtensionKind::MinaEvent { .. } | ExtensionKind::MinaAction { .. }
        )
    }
}

/// A registered extension with its stable ordering id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDataExtension {
    pub cde_id: u32,
    pub config: ExtensionConfig,
}

impl ChainDataExtension {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn network(&self) -> &str {
        &self.config.network
    }

    pub fn start_block_height(&self) -> u64 {
        self.config.start_block_height
    }

    pub fn cde_type(&self) -> &str {
        self.config.kind.as_ref()
    }

    /// Hash of the full config; any change to an extension changes it.
    pub fn config_hash(&self) -> FunnelResult<String> {
        let encoded = serde_json::to_vec(&self.config)
            .map_err(|e| FunnelError::Config(format!("unencodable extension: {}", e)))?;
        Ok(format!("0x{}", hex::encode(keccak256(encoded))))
    }

    /// Clamp `[from, to]` to the extension's start height. `None` when nothing remains.
    pub fn clamp(&self, from: u64, to: u64) -> Option<(u64, u64)> {
        clamp_range(self.start_block_height(), from, to)
    }

    pub fn new_datum(&self, source_position: u64, payload: CdeDatumPayload) -> CdeDatum {
        CdeDatum {
            cde_id: self.cde_id,
            cde_name: self.config.name.clone(),
            network: self.config.network.clone(),
            block_number: source_position,
            source_position,
            tx_hash: None,
            scheduled_prefix: self.config.scheduled_prefix.clone(),
            burn_scheduled_prefix: match &self.config.kind {
                ExtensionKind::Erc721 {
                    burn_scheduled_prefix,
                    ..
                }
                | ExtensionKind::Erc1155 {
                    burn_scheduled_prefix,
                    ..
                } => burn_scheduled_prefix.clone(),
                _ => None,
            },
            payload,
        }
    }
}

/// `[from, to]` clamped up to `start`. Empty when `to < start`.
pub fn clamp_range(start: u64, from: u64, to: u64) -> Option<(u64, u64)> {
    if to < start {
        return None;
    }
    let from = from.max(start);
    (from <= to).then_some((from, to))
}

/// Row of the persisted extension snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdeSnapshot {
    pub cde_id: u32,
    pub cde_name: String,
    pub cde_type: String,
    pub network: String,
    pub config_hash: String,
    pub start_block_height: u64,
}

/// All extensions known to this run. Dynamic primitives append to it while syncing.
#[derive(Debug, Clone, Default)]
pub struct CdeRegistry {
    extensions: Vec<ChainDataExtension>,
    static_count: usize,
}

pub type SharedCdeRegistry = Arc<RwLock<CdeRegistry>>;

impl CdeRegistry {
    /// Registry over the static config; `cde_id` is the position in the file.
    pub fn new(configs: Vec<ExtensionConfig>, networks: &[NetworkConfig]) -> FunnelResult<Self> {
        let mut names = HashSet::new();
        let mut extensions = Vec::with_capacity(configs.len());
        for (i, config) in configs.into_iter().enumerate() {
            if !names.insert(config.name.clone()) {
                return Err(FunnelError::Config(format!(
                    "duplicate extension name {}",
                    config.name
                )));
            }
            validate_extension(&config, networks)?;
            extensions.push(ChainDataExtension {
                cde_id: i as u32,
                config,
            });
        }
        let static_count = extensions.len();
        Ok(Self {
            extensions,
            static_count,
        })
    }

    pub fn shared(self) -> SharedCdeRegistry {
        Arc::new(RwLock::new(self))
    }

    pub fn all(&self) -> &[ChainDataExtension] {
        &self.extensions
    }

    pub fn for_network(&self, network: &str) -> Vec<ChainDataExtension> {
        self.extensions
            .iter()
            .filter(|e| e.network() == network)
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&ChainDataExtension> {
        self.extensions.iter().find(|e| e.name() == name)
    }

    pub fn next_cde_id(&self) -> u32 {
        self.extensions.len() as u32
    }

    /// Snapshot of the extensions loaded from config, compared against the database at boot.
    pub fn static_snapshot(&self) -> FunnelResult<Vec<CdeSnapshot>> {
        self.extensions[..self.static_count]
            .iter()
            .map(|e| {
                Ok(CdeSnapshot {
                    cde_id: e.cde_id,
                    cde_name: e.name().to_string(),
                    cde_type: e.cde_type().to_string(),
                    network: e.network().to_string(),
                    config_hash: e.config_hash()?,
                    start_block_height: e.start_block_height(),
                })
            })
            .collect()
    }

    /// Add an extension discovered by a dynamic primitive. Ids must arrive in order.
    pub fn register_dynamic(&mut self, cde_id: u32, config: ExtensionConfig) -> FunnelResult<()> {
        if self.extensions.iter().any(|e| e.name() == config.name) {
            return Ok(());
        }
        if cde_id != self.next_cde_id() {
            return Err(FunnelError::Config(format!(
                "dynamic extension {} has id {}, expected {}",
                config.name,
                cde_id,
                self.next_cde_id()
            )));
        }
        self.extensions.push(ChainDataExtension { cde_id, config });
        Ok(())
    }
}

fn validate_extension(config: &ExtensionConfig, networks: &[NetworkConfig]) -> FunnelResult<()> {
    let network = networks
        .iter()
        .find(|n| n.name == config.network)
        .ok_or_else(|| {
            FunnelError::Config(format!(
                "extension {} references unknown network {}",
                config.name, config.network
            ))
        })?;

    let matches_network = match &config.kind {
        k if k.is_evm() => network.is_evm(),
        k if k.is_cardano() => matches!(network.kind, crate::config::NetworkKind::Cardano { .. }),
        k if k.is_mina() => matches!(network.kind, crate::config::NetworkKind::Mina { .. }),
        _ => false,
    };
    if !matches_network {
        return Err(FunnelError::Config(format!(
            "extension {} of type {} cannot read from network {}",
            config.name,
            config.kind.as_ref(),
            config.network
        )));
    }

    if let ExtensionKind::DynamicEvmPrimitive { .. } = config.kind {
        if !network.is_main() {
            return Err(FunnelError::Config(format!(
                "dynamic primitive {} must live on the main network",
                config.name
            )));
        }
    }
    Ok(())
}

/// One observed side-channel event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdeDatum {
    pub cde_id: u32,
    pub cde_name: String,
    pub network: String,
    /// Block the datum is delivered in. Starts as `source_position` and is rewritten
    /// when the datum is aligned to the main chain or an emulated block.
    pub block_number: u64,
    /// Height or slot on the extension's own network.
    pub source_position: u64,
    pub tx_hash: Option<String>,
    pub scheduled_prefix: Option<String>,
    pub burn_scheduled_prefix: Option<String>,
    pub payload: CdeDatumPayload,
}

impl CdeDatum {
    pub fn with_tx_hash(mut self, tx_hash: Option<String>) -> Self {
        self.tx_hash = tx_hash;
        self
    }

    pub fn datum_type(&self) -> &str {
        self.payload.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, AsRefStr)]
pub enum CdeDatumPayload {
    Erc20Transfer {
        from: String,
        to: String,
        value: String,
    },
    Erc721Transfer {
        from: String,
        to: String,
        token_id: String,
    },
    Erc721Mint {
        to: String,
        token_id: String,
    },
    Erc1155Transfer {
        operator: String,
        from: String,
        to: String,
        ids: Vec<String>,
        values: Vec<String>,
    },
    Generic {
        data: serde_json::Value,
    },
    DynamicEvmPrimitive {
        contract_address: String,
        target: DynamicTarget,
    },
    CardanoPool {
        address: String,
        pool: Option<String>,
        epoch: u64,
    },
    CardanoMintBurn {
        tx_id: String,
        metadata: Option<String>,
        assets: serde_json::Value,
        input_addresses: serde_json::Value,
        output_addresses: serde_json::Value,
    },
    CardanoTransfer {
        tx_id: String,
        raw_tx: String,
        metadata: Option<String>,
    },
    MinaGeneric {
        data: serde_json::Value,
    },
}

/// Stable merge of two streams already sorted by `key`. Ties take from `a` first.
pub fn merge_sorted<T, K, F>(a: Vec<T>, b: Vec<T>, key: F) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        let take_a = match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => key(x) <= key(y),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_a { a.next() } else { b.next() };
        out.extend(next);
    }
    out
}

/// Order datums by `(block_number, cde_id)`, keeping arrival order inside each group.
pub fn order_datums(datums: Vec<CdeDatum>) -> Vec<CdeDatum> {
    let mut groups: BTreeMap<(u64, u32), Vec<CdeDatum>> = BTreeMap::new();
    for datum in datums {
        groups
            .entry((datum.block_number, datum.cde_id))
            .or_default()
            .push(datum);
    }
    groups.into_values().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkKind;

    fn networks() -> Vec<NetworkConfig> {
        vec![
            NetworkConfig {
                name: "main".into(),
                kind: NetworkKind::EvmMain {
                    rpc_url: "http://localhost:8545".into(),
                    chain_id: 31337,
                    paima_l2_contract_address: "0x01".into(),
                    confirmations: 0,
                    funnel_block_group_size: 100,
                    presync_step_size: 1000,
                },
            },
            NetworkConfig {
                name: "arb".into(),
                kind: NetworkKind::EvmOther {
                    rpc_url: "http://localhost:8546".into(),
                    chain_id: 42161,
                    confirmations: 0,
                    presync_step_size: 1000,
                },
            },
        ]
    }

    fn erc20(name: &str, network: &str, start: u64) -> ExtensionConfig {
        ExtensionConfig {
            name: name.into(),
            network: network.into(),
            start_block_height: start,
            scheduled_prefix: None,
            kind: ExtensionKind::Erc20 {
                contract_address: "0xaa".into(),
            },
        }
    }

    fn datum(block: u64, cde_id: u32, tag: &str) -> CdeDatum {
        CdeDatum {
            cde_id,
            cde_name: tag.into(),
            network: "main".into(),
            block_number: block,
            source_position: block,
            tx_hash: None,
            scheduled_prefix: None,
            burn_scheduled_prefix: None,
            payload: CdeDatumPayload::Generic {
                data: serde_json::json!(tag),
            },
        }
    }

    #[test]
    fn test_clamp_to_start_height() {
        assert_eq!(clamp_range(50, 10, 40), None);
        assert_eq!(clamp_range(50, 10, 60), Some((50, 60)));
        assert_eq!(clamp_range(50, 55, 60), Some((55, 60)));
        assert_eq!(clamp_range(50, 50, 50), Some((50, 50)));
        assert_eq!(clamp_range(0, 7, 3), None);
    }

    #[test]
    fn test_merge_sorted_is_stable_and_complete() {
        let mints = vec![(1, "m1"), (3, "m3"), (3, "m3b")];
        let transfers = vec![(1, "t1"), (2, "t2"), (3, "t3"), (5, "t5")];
        let merged = merge_sorted(mints.clone(), transfers.clone(), |x| x.0);

        assert_eq!(merged.len(), mints.len() + transfers.len());
        assert!(merged.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(
            merged.iter().map(|x| x.1).collect::<Vec<_>>(),
            vec!["m1", "t1", "t2", "m3", "m3b", "t3", "t5"]
        );
    }

    #[test]
    fn test_merge_with_empty_side() {
        let merged = merge_sorted(Vec::new(), vec![1, 2, 3], |x| *x);
        assert_eq!(merged, vec![1, 2, 3]);
        let merged: Vec<u64> = merge_sorted(vec![4], Vec::new(), |x| *x);
        assert_eq!(merged, vec![4]);
    }

    #[test]
    fn test_order_datums_by_block_then_cde_id() {
        let datums = vec![
            datum(2, 1, "b2-second"),
            datum(2, 0, "a2"),
            datum(1, 1, "b1"),
            datum(2, 1, "b2-first-after"),
            datum(1, 0, "a1"),
        ];
        let ordered: Vec<_> = order_datums(datums)
            .into_iter()
            .map(|d| d.cde_name)
            .collect();
        assert_eq!(ordered, vec!["a1", "b1", "a2", "b2-second", "b2-first-after"]);
    }

    #[test]
    fn test_registry_assigns_ids_in_file_order() {
        let registry = CdeRegistry::new(
            vec![erc20("gold", "main", 10), erc20("gems", "arb", 20)],
            &networks(),
        )
        .unwrap();
        assert_eq!(registry.get("gold").unwrap().cde_id, 0);
        assert_eq!(registry.get("gems").unwrap().cde_id, 1);
        assert_eq!(registry.for_network("arb").len(), 1);

        let snapshot = registry.static_snapshot().unwrap();
        assert_eq!(snapshot[0].cde_type, "erc20");
        assert_eq!(snapshot[1].network, "arb");
        assert_ne!(snapshot[0].config_hash, snapshot[1].config_hash);
    }

    #[test]
    fn test_registry_rejects_bad_config() {
        let dup = CdeRegistry::new(vec![erc20("x", "main", 0), erc20("x", "main", 0)], &networks());
        assert!(matches!(dup, Err(FunnelError::Config(_))));

        let unknown = CdeRegistry::new(vec![erc20("x", "nowhere", 0)], &networks());
        assert!(matches!(unknown, Err(FunnelError::Config(_))));

        let wrong_chain = CdeRegistry::new(
            vec![ExtensionConfig {
                kind: ExtensionKind::CardanoPool { pools: vec![] },
                ..erc20("pool", "main", 0)
            }],
            &networks(),
        );
        assert!(matches!(wrong_chain, Err(FunnelError::Config(_))));

        let dynamic_off_main = CdeRegistry::new(
            vec![ExtensionConfig {
                kind: ExtensionKind::DynamicEvmPrimitive {
                    contract_address: "0xf0".into(),
                    event_abi: serde_json::json!({}),
                    address_field: "nft".into(),
                    target: DynamicTarget {
                        scheduled_prefix: None,
                        kind: DynamicTargetKind::Erc20,
                    },
                },
                ..erc20("factory", "arb", 0)
            }],
            &networks(),
        );
        assert!(matches!(dynamic_off_main, Err(FunnelError::Config(_))));
    }

    #[test]
    fn test_dynamic_registration_is_ordered_and_idempotent() {
        let mut registry = CdeRegistry::new(vec![erc20("gold", "main", 0)], &networks()).unwrap();
        let parent = registry.get("gold").unwrap().config.clone();
        let target = DynamicTarget {
            scheduled_prefix: Some("nft".into()),
            kind: DynamicTargetKind::Erc721 {
                burn_scheduled_prefix: None,
            },
        };
        let child = target.instantiate(&parent, "0xABC", 41);
        assert_eq!(child.name, "gold-0xabc");
        assert_eq!(child.start_block_height, 42);

        assert!(registry.register_dynamic(5, child.clone()).is_err());
        registry.register_dynamic(1, child.clone()).unwrap();
        registry.register_dynamic(1, child).unwrap();
        assert_eq!(registry.all().len(), 2);
        // dynamic entries are not part of the static snapshot
        assert_eq!(registry.static_snapshot().unwrap().len(), 1);
    }

    #[test]
    fn test_extension_config_yaml() {
        let yaml = r#"
- name: tarochi-gold
  type: erc20
  network: main
  contract-address: "0x1234"
  start-block-height: 100
  scheduled-prefix: gold
- name: genesis-trainers
  type: erc721
  network: main
  contract-address: "0x5678"
  start-block-height: 0
  burn-scheduled-prefix: burn
"#;
        let configs: Vec<ExtensionConfig> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(configs[0].scheduled_prefix.as_deref(), Some("gold"));
        assert_eq!(
            configs[1].kind,
            ExtensionKind::Erc721 {
                contract_address: "0x5678".into(),
                burn_scheduled_prefix: Some("burn".into())
            }
        );
    }
}
