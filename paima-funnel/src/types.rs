// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Data handed from the funnel to the state machine.

use serde::{Deserialize, Serialize};

use crate::cde::CdeDatum;

/// Header fields every block source can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    /// Unix seconds
    pub timestamp: u64,
    pub hash: [u8; 32],
}

impl BlockHeader {
    pub fn hash_hex(&self) -> String {
        format!("0x{}", hex::encode(self.hash))
    }
}

/// Confirmed head of a secondary chain, in that chain's own position unit
/// (block height or slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub position: u64,
    /// Unix seconds
    pub timestamp: u64,
}

/// Where an input came from. Every field is empty for timers created by the STF.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputOrigin {
    pub tx_hash: Option<String>,
    pub caip2: Option<String>,
    pub contract_address: Option<String>,
    pub primitive_name: Option<String>,
}

/// A single STF input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedData {
    /// Wallet that authored the input. `None` for scheduled or primitive inputs.
    pub real_address: Option<String>,
    pub input_data: String,
    pub input_nonce: String,
    /// Decimal amount of native token attached to the transaction.
    pub supplied_value: String,
    pub scheduled: bool,
    pub origin: InputOrigin,
}

/// Persisted pairing between an emulated block and the real chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatedBlockInfo {
    /// Highest deployment-chain block folded into this or an earlier emulated block.
    pub deployment_chain_block_height: u64,
}

/// One deterministic unit of work for the STF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainData {
    pub block_number: u64,
    /// Unix seconds
    pub timestamp: u64,
    pub block_hash: String,
    /// caip2 id of the chain the block was read from.
    pub network: String,
    pub submitted_data: Vec<SubmittedData>,
    pub extension_datums: Vec<CdeDatum>,
    pub emulated: Option<EmulatedBlockInfo>,
}

impl ChainData {
    pub fn from_header(header: &BlockHeader, network: &str) -> Self {
        Self {
            block_number: header.number,
            timestamp: header.timestamp,
            block_hash: header.hash_hex(),
            network: network.to_string(),
            submitted_data: Vec::new(),
            extension_datums: Vec::new(),
            emulated: None,
        }
    }
}

/// Per-extension pagination state persisted in `cde_tracking_cursor`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub cursor: Option<String>,
    pub finished: bool,
}

/// Cursor advance produced by one presync page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub cde_name: String,
    pub cursor: String,
    pub finished: bool,
}

/// Data read for one network during presync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresyncChainData {
    pub network: String,
    /// Last position covered, for networks tracked by window.
    pub to_position: Option<u64>,
    pub extension_datums: Vec<CdeDatum>,
    pub cursors: Vec<CursorUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresyncResult {
    Data(PresyncChainData),
    Finished,
}

impl PresyncResult {
    pub fn is_finished(&self) -> bool {
        matches!(self, PresyncResult::Finished)
    }
}

/// Presync progress loaded from the database before each presync step.
#[derive(Debug, Clone, Default)]
pub struct PresyncState {
    /// Next position to read, keyed by network name.
    pub positions: std::collections::HashMap<String, u64>,
    /// Pagination cursors keyed by extension name.
    pub cursors: std::collections::HashMap<String, CursorState>,
}
