// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Turning raw on-chain payloads into [`SubmittedData`]
//!
//! Direct inputs are attributed to the transaction sender. Batched inputs carry their own
//! author and signature per subunit, and each subunit is checked by the verifier
//! registered for its address type.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use ethers::types::{Address, Signature};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::batch::{extract_batches, is_batch, BatchSubunit};
use crate::types::{InputOrigin, SubmittedData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AddressType {
    Evm = 1,
    Cardano = 2,
    Polkadot = 3,
    Algorand = 4,
    Mina = 5,
}

impl TryFrom<u8> for AddressType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AddressType::Evm),
            2 => Ok(AddressType::Cardano),
            3 => Ok(AddressType::Polkadot),
            4 => Ok(AddressType::Algorand),
            5 => Ok(AddressType::Mina),
            other => Err(other),
        }
    }
}

/// Checks that `signature` over `message` was produced by `address`.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, address: &str, message: &str, signature: &str) -> bool;
}

/// EIP-191 `personal_sign` verification.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvmSignatureVerifier;

impl SignatureVerifier for EvmSignatureVerifier {
    fn verify(&self, address: &str, message: &str, signature: &str) -> bool {
        let (Ok(address), Ok(signature)) =
            (Address::from_str(address), Signature::from_str(signature))
        else {
            return false;
        };
        signature.verify(message, address).is_ok()
    }
}

/// Message a wallet signs for a batched input.
pub fn batch_signing_message(subunit: &BatchSubunit) -> String {
    format!(
        "{}{}{}",
        subunit.millisecond_timestamp,
        subunit.user_address.to_lowercase(),
        subunit.game_input
    )
}

fn hash_hex(data: &str) -> String {
    format!("0x{}", hex::encode(keccak256(data.as_bytes())))
}

/// Nonce of a direct (non-batched) input.
pub fn direct_input_nonce(block_height: u64, user_address: &str, input_data: &str) -> String {
    hash_hex(&format!(
        "{}{}{}",
        block_height,
        user_address.to_lowercase(),
        input_data
    ))
}

/// Nonce of a batched input. Independent of the block it lands in.
pub fn batched_input_nonce(subunit: &BatchSubunit) -> String {
    hash_hex(&format!(
        "{}{}{}",
        subunit.millisecond_timestamp,
        subunit.user_address.to_lowercase(),
        subunit.game_input
    ))
}

/// A payload observed on chain before extraction.
#[derive(Debug, Clone)]
pub struct RawInput {
    pub block_height: u64,
    pub input_data: String,
    /// Transaction sender, when the chain exposes one.
    pub sender: Option<String>,
    pub supplied_value: String,
    pub origin: InputOrigin,
}

#[derive(Clone)]
pub struct InputExtractor {
    verifiers: HashMap<AddressType, Arc<dyn SignatureVerifier>>,
}

impl Default for InputExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl InputExtractor {
    /// Extractor with the EVM verifier registered.
    pub fn new() -> Self {
        let mut verifiers: HashMap<AddressType, Arc<dyn SignatureVerifier>> = HashMap::new();
        verifiers.insert(AddressType::Evm, Arc::new(EvmSignatureVerifier));
        Self { verifiers }
    }

    pub fn with_verifier(
        mut self,
        address_type: AddressType,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        self.verifiers.insert(address_type, verifier);
        self
    }

    /// Expand a raw payload into zero or more inputs.
    pub fn extract(&self, raw: &RawInput) -> Vec<SubmittedData> {
        if is_batch(&raw.input_data) {
            return extract_batches(&raw.input_data)
                .into_iter()
                .filter(|subunit| self.verify_subunit(subunit))
                .map(|subunit| SubmittedData {
                    input_nonce: batched_input_nonce(&subunit),
                    real_address: Some(subunit.user_address.to_lowercase()),
                    input_data: subunit.game_input,
                    supplied_value: "0".to_string(),
                    scheduled: false,
                    origin: raw.origin.clone(),
                })
                .collect();
        }

        match &raw.sender {
            Some(sender) => vec![SubmittedData {
                real_address: Some(sender.to_lowercase()),
                input_nonce: direct_input_nonce(raw.block_height, sender, &raw.input_data),
                input_data: raw.input_data.clone(),
                supplied_value: raw.supplied_value.clone(),
                scheduled: false,
                origin: raw.origin.clone(),
            }],
            None => {
                debug!(
                    "Skipping unsigned non-batch payload at block {}",
                    raw.block_height
                );
                Vec::new()
            }
        }
    }

    fn verify_subunit(&self, subunit: &BatchSubunit) -> bool {
        let Some(verifier) = self.verifiers.get(&subunit.address_type) else {
            warn!(
                "No signature verifier for address type {:?}, dropping input from {}",
                subunit.address_type, subunit.user_address
            );
            return false;
        };
        let ok = verifier.verify(
            &subunit.user_address,
            &batch_signing_message(subunit),
            &subunit.user_signature,
        );
        if !ok {
            warn!(
                "Invalid signature on batched input from {}",
                subunit.user_address
            );
        }
        ok
    }
}
