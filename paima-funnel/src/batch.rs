// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Batched input encoding
//!
//! A batch is `B` followed by `~`-prefixed subunits. Each subunit is
//! `addressType/userAddress/userSignature/gameInput/millisecondTimestamp`.
//!
//! ```text
//! B~1/0xabc.../0xsig.../j|1|move/1700000000000~1/0xdef.../0xsig.../c|2/1700000000500
//! ```

use serde::{Deserialize, Serialize};

use crate::input::AddressType;

pub const BATCH_PREFIX: char = 'B';
pub const OUTER_BATCH_DIVIDER: char = '~';
pub const INNER_BATCH_DIVIDER: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSubunit {
    pub address_type: AddressType,
    pub user_address: String,
    pub user_signature: String,
    pub game_input: String,
    pub millisecond_timestamp: u64,
}

impl BatchSubunit {
    /// Encoded form, or `None` when a field contains a divider and cannot be packed.
    pub fn encode(&self) -> Option<String> {
        let fields = [
            self.user_address.as_str(),
            self.user_signature.as_str(),
            self.game_input.as_str(),
        ];
        if fields
            .iter()
            .any(|f| f.contains(OUTER_BATCH_DIVIDER) || f.contains(INNER_BATCH_DIVIDER))
        {
            return None;
        }
        Some(format!(
            "{}{d}{}{d}{}{d}{}{d}{}",
            self.address_type as u8,
            self.user_address,
            self.user_signature,
            self.game_input,
            self.millisecond_timestamp,
            d = INNER_BATCH_DIVIDER
        ))
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let parts: Vec<&str> = encoded.split(INNER_BATCH_DIVIDER).collect();
        let [address_type, user_address, user_signature, game_input, timestamp] = parts[..] else {
            return None;
        };
        Some(Self {
            address_type: AddressType::try_from(address_type.parse::<u8>().ok()?).ok()?,
            user_address: user_address.to_string(),
            user_signature: user_signature.to_string(),
            game_input: game_input.to_string(),
            millisecond_timestamp: timestamp.parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchBuildResult {
    pub data: String,
    pub selected_inputs: Vec<BatchSubunit>,
}

/// Pack the longest prefix of `inputs` whose encoding fits in `max_size` bytes.
///
/// Packing stops at the first input that would overflow or cannot be encoded, so the
/// selection is always a prefix. When nothing fits the result is empty.
pub fn build_batch_data(max_size: usize, inputs: &[BatchSubunit]) -> BatchBuildResult {
    let mut data = String::from(BATCH_PREFIX);
    let mut selected_inputs = Vec::new();

    for input in inputs {
        let Some(encoded) = input.encode() else {
            break;
        };
        if data.len() + OUTER_BATCH_DIVIDER.len_utf8() + encoded.len() > max_size {
            break;
        }
        data.push(OUTER_BATCH_DIVIDER);
        data.push_str(&encoded);
        selected_inputs.push(input.clone());
    }

    if selected_inputs.is_empty() {
        return BatchBuildResult::default();
    }
    BatchBuildResult {
        data,
        selected_inputs,
    }
}

pub fn is_batch(data: &str) -> bool {
    data.starts_with(BATCH_PREFIX) && data[BATCH_PREFIX.len_utf8()..].starts_with(OUTER_BATCH_DIVIDER)
}

/// Split a batch into its subunits. Malformed subunits are dropped; non-batch data yields
/// nothing.
pub fn extract_batches(data: &str) -> Vec<BatchSubunit> {
    if !is_batch(data) {
        return Vec::new();
    }
    data[BATCH_PREFIX.len_utf8()..]
        .split(OUTER_BATCH_DIVIDER)
        .filter(|s| !s.is_empty())
        .filter_map(BatchSubunit::decode)
        .collect()
}
