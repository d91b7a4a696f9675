// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Avail adapter over the light client HTTP API
//!
//! Avail blocks carry no timestamp in their header, so the time of a block is derived from
//! the BABE slot in its pre-runtime digest. Only blobs submitted under the configured app id
//! are returned by the light client, and each blob must be a batched input.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::batch::is_batch;
use crate::cde::ChainDataExtension;
use crate::error::{with_timeout, FunnelError, FunnelResult};
use crate::input::{InputExtractor, RawInput};
use crate::sources::{
    fetch_block_prefix, search_position_at, BlockSource, ParallelData, ParallelSource,
};
use crate::types::{
    BlockHeader, ChainData, ChainTip, InputOrigin, PresyncResult, PresyncState, SubmittedData,
};

/// Seconds per BABE slot.
pub const AVAIL_SLOT_DURATION_SECS: u64 = 20;

const BABE_ENGINE_ID: &[u8; 4] = b"BABE";

#[derive(Debug, Deserialize)]
struct StatusResponse {
    blocks: StatusBlocks,
}

#[derive(Debug, Deserialize)]
struct StatusBlocks {
    available: Option<AvailableRange>,
}

#[derive(Debug, Deserialize)]
struct AvailableRange {
    first: u64,
    last: u64,
}

#[derive(Debug, Deserialize)]
pub struct HeaderResponse {
    pub hash: String,
    pub number: u64,
    pub digest: Digest,
}

#[derive(Debug, Deserialize)]
pub struct Digest {
    pub logs: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct BlockDataResponse {
    #[serde(default)]
    data_transactions: Vec<DataTransaction>,
}

#[derive(Debug, Deserialize)]
struct DataTransaction {
    data: String,
}

/// BABE slot of a header, read from its `PreRuntime` digest item.
///
/// The pre-digest is a one byte variant, a u32 authority index and then the u64 slot, all
/// SCALE (little endian) encoded.
pub fn babe_slot(digest: &Digest) -> FunnelResult<u64> {
    for log in &digest.logs {
        let Some(pre_runtime) = log.get("PreRuntime").and_then(|v| v.as_array()) else {
            continue;
        };
        let [engine, data] = pre_runtime.as_slice() else {
            continue;
        };
        let engine: Vec<u8> = serde_json::from_value(engine.clone()).unwrap_or_default();
        if engine.as_slice() != BABE_ENGINE_ID {
            continue;
        }
        let bytes = match data {
            serde_json::Value::String(s) => hex::decode(s.trim_start_matches("0x"))
                .map_err(|e| FunnelError::InvalidResponse(format!("bad pre-digest hex: {}", e)))?,
            other => serde_json::from_value::<Vec<u8>>(other.clone())
                .map_err(|e| FunnelError::InvalidResponse(format!("bad pre-digest: {}", e)))?,
        };
        let slot_bytes: [u8; 8] = bytes
            .get(5..13)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| FunnelError::InvalidResponse("pre-digest too short".to_string()))?;
        return Ok(u64::from_le_bytes(slot_bytes));
    }
    Err(FunnelError::InvalidResponse(
        "header has no BABE pre-runtime digest".to_string(),
    ))
}

pub struct AvailClient {
    http: reqwest::Client,
    base_url: url::Url,
    name: String,
    network: String,
    app_id: u32,
    timeout: Duration,
    extractor: Arc<InputExtractor>,
}

impl AvailClient {
    pub fn new(
        light_client_url: &str,
        name: &str,
        network: &str,
        app_id: u32,
        timeout: Duration,
        extractor: Arc<InputExtractor>,
    ) -> FunnelResult<Self> {
        let base_url = url::Url::parse(light_client_url).map_err(|e| {
            FunnelError::Config(format!(
                "invalid light client url {}: {}",
                light_client_url, e
            ))
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            name: name.to_string(),
            network: network.to_string(),
            app_id,
            timeout,
            extractor,
        })
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> FunnelResult<R> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| FunnelError::Config(format!("invalid path {}: {}", path, e)))?;
        with_timeout(self.timeout, path, async {
            let response = self.http.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FunnelError::Indexer(format!(
                    "light client {} returned {}",
                    path, status
                )));
            }
            Ok(response.json::<R>().await?)
        })
        .await
    }

    async fn available(&self) -> FunnelResult<AvailableRange> {
        let status: StatusResponse = self.get("v2/status").await?;
        status
            .blocks
            .available
            .ok_or_else(|| FunnelError::Indexer("light client has no verified blocks".into()))
    }

    async fn header(&self, number: u64) -> FunnelResult<BlockHeader> {
        let header: HeaderResponse = self.get(&format!("v2/blocks/{}/header", number)).await?;
        if header.number != number {
            return Err(FunnelError::InvalidResponse(format!(
                "asked for header {} got {}",
                number, header.number
            )));
        }
        let hash_bytes = hex::decode(header.hash.trim_start_matches("0x"))
            .map_err(|e| FunnelError::InvalidResponse(format!("bad block hash: {}", e)))?;
        let hash: [u8; 32] = hash_bytes
            .try_into()
            .map_err(|_| FunnelError::InvalidResponse("block hash is not 32 bytes".into()))?;
        Ok(BlockHeader {
            number,
            timestamp: babe_slot(&header.digest)? * AVAIL_SLOT_DURATION_SECS,
            hash,
        })
    }

    /// Inputs submitted under the app id in block `number`.
    async fn inputs(&self, number: u64) -> FunnelResult<Vec<SubmittedData>> {
        let data: BlockDataResponse = self
            .get(&format!("v2/blocks/{}/data?fields=data", number))
            .await?;
        let mut inputs = Vec::new();
        for tx in data.data_transactions {
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&tx.data) else {
                warn!("[{}] Undecodable blob in block {}", self.name, number);
                continue;
            };
            let Ok(payload) = String::from_utf8(bytes) else {
                continue;
            };
            if !is_batch(&payload) {
                debug!("[{}] Ignoring non-batch blob in block {}", self.name, number);
                continue;
            }
            let raw = RawInput {
                block_height: number,
                input_data: payload,
                sender: None,
                supplied_value: "0".to_string(),
                origin: InputOrigin {
                    tx_hash: None,
                    caip2: Some(self.network.clone()),
                    contract_address: Some(self.app_id.to_string()),
                    primitive_name: None,
                },
            };
            inputs.extend(self.extractor.extract(&raw));
        }
        Ok(inputs)
    }

    async fn block(&self, number: u64) -> FunnelResult<ChainData> {
        let (header, inputs) = futures::try_join!(self.header(number), self.inputs(number))?;
        let mut data = ChainData::from_header(&header, &self.network);
        data.submitted_data = inputs;
        Ok(data)
    }
}

#[async_trait]
impl BlockSource for AvailClient {
    fn network(&self) -> &str {
        &self.network
    }

    async fn confirmed_tip(&self) -> FunnelResult<u64> {
        Ok(self.available().await?.last)
    }

    async fn block_header(&self, number: u64) -> FunnelResult<BlockHeader> {
        self.header(number).await
    }

    async fn fetch_blocks(&self, from: u64, to: u64) -> FunnelResult<Vec<ChainData>> {
        fetch_block_prefix(from, to, |n| self.block(n)).await
    }
}

#[async_trait]
impl ParallelSource for AvailClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn network(&self) -> &str {
        &self.network
    }

    async fn tip(&self) -> FunnelResult<ChainTip> {
        let last = self.available().await?.last;
        Ok(ChainTip {
            position: last,
            timestamp: self.header(last).await?.timestamp,
        })
    }

    async fn position_at(&self, timestamp: u64) -> FunnelResult<Option<u64>> {
        let range = self.available().await?;
        search_position_at(range.first, range.last, timestamp, |n| async move {
            Ok(self.header(n).await?.timestamp)
        })
        .await
    }

    async fn read_parallel_data(
        &self,
        _extensions: &[ChainDataExtension],
        from: u64,
        to: u64,
    ) -> FunnelResult<ParallelData> {
        let blocks = fetch_block_prefix(from, to, |n| async move {
            Ok((n, self.inputs(n).await?))
        })
        .await?;
        if blocks.len() as u64 != to - from + 1 {
            // alignment needs the complete range
            return Err(FunnelError::Indexer(format!(
                "[{}] only {} of #{}-{} readable",
                self.name,
                blocks.len(),
                from,
                to
            )));
        }
        Ok(ParallelData {
            datums: Vec::new(),
            submitted: blocks
                .into_iter()
                .flat_map(|(n, inputs)| inputs.into_iter().map(move |i| (n, i)))
                .collect(),
        })
    }

    async fn read_presync(
        &self,
        _extensions: &[ChainDataExtension],
        _sentinel: u64,
        _state: &PresyncState,
    ) -> FunnelResult<PresyncResult> {
        // no extension type reads from Avail
        Ok(PresyncResult::Finished)
    }
}
