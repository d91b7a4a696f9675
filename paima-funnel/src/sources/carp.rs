// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Cardano adapter over a Carp indexer
//!
//! Positions on Cardano are slots. Since the Shelley era one slot lasts one second, so
//! slot and unix time convert with a per-network offset and no RPC round trip.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cde::{cardano, ChainDataExtension};
use crate::error::{with_timeout, FunnelError, FunnelResult};
use crate::sources::{ParallelData, ParallelSource};
use crate::types::{ChainTip, PresyncResult, PresyncState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CardanoNetwork {
    Mainnet,
    Preprod,
    Preview,
    Sanchonet,
}

impl CardanoNetwork {
    pub fn caip2(&self) -> &'static str {
        match self {
            CardanoNetwork::Mainnet => "cip34:1-764824073",
            CardanoNetwork::Preprod => "cip34:0-1",
            CardanoNetwork::Preview => "cip34:0-2",
            CardanoNetwork::Sanchonet => "cip34:0-4",
        }
    }

    /// Unix time of slot 0, extrapolated backwards from the Shelley era.
    pub fn slot_offset(&self) -> u64 {
        match self {
            CardanoNetwork::Mainnet => 1591566291,
            CardanoNetwork::Preprod => 1655683200,
            CardanoNetwork::Preview => 1666656000,
            CardanoNetwork::Sanchonet => 1686789000,
        }
    }

    pub fn slot_to_unix(&self, slot: u64) -> u64 {
        slot + self.slot_offset()
    }

    /// Slot in progress at `timestamp`, or `None` before the network existed.
    pub fn unix_to_slot(&self, timestamp: u64) -> Option<u64> {
        timestamp.checked_sub(self.slot_offset())
    }

    pub fn epoch_from_slot(&self, slot: u64) -> u64 {
        match self {
            CardanoNetwork::Mainnet => slot.saturating_sub(4492800) / 432000 + 208,
            CardanoNetwork::Preprod => slot.saturating_sub(86400) / 432000 + 4,
            CardanoNetwork::Preview | CardanoNetwork::Sanchonet => slot / 86400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CarpBlock {
    pub hash: String,
    pub height: u64,
    pub epoch: u64,
    pub slot: u64,
}

#[derive(Debug, Deserialize)]
struct LatestBlockResponse {
    block: CarpBlock,
}

#[derive(Serialize)]
struct LatestBlockRequest {
    offset: u64,
}

pub struct CarpClient {
    http: reqwest::Client,
    base_url: url::Url,
    name: String,
    network: CardanoNetwork,
    confirmation_depth: u64,
    page_size: u64,
    timeout: Duration,
}

impl CarpClient {
    pub fn new(
        carp_url: &str,
        name: &str,
        network: CardanoNetwork,
        confirmation_depth: u64,
        page_size: u64,
        timeout: Duration,
    ) -> FunnelResult<Self> {
        let base_url = url::Url::parse(carp_url)
            .map_err(|e| FunnelError::Config(format!("invalid carp url {}: {}", carp_url, e)))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            name: name.to_string(),
            network,
            confirmation_depth,
            page_size: page_size.max(1),
            timeout,
        })
    }

    pub fn cardano_network(&self) -> CardanoNetwork {
        self.network
    }

    pub fn name_str(&self) -> &str {
        &self.name
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// POST a JSON body to a Carp endpoint.
    pub async fn post<B, R>(&self, path: &str, body: &B) -> FunnelResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| FunnelError::Config(format!("invalid carp path {}: {}", path, e)))?;
        with_timeout(self.timeout, path, async {
            let response = self.http.post(url).json(body).send().await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(FunnelError::Indexer(format!(
                    "carp {} returned {}: {}",
                    path, status, text
                )));
            }
            Ok(response.json::<R>().await?)
        })
        .await
    }

    pub async fn latest_block(&self, offset: u64) -> FunnelResult<CarpBlock> {
        let response: LatestBlockResponse = self
            .post("block/latest", &LatestBlockRequest { offset })
            .await?;
        Ok(response.block)
    }
}

#[async_trait]
impl ParallelSource for CarpClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn network(&self) -> &str {
        self.network.caip2()
    }

    async fn tip(&self) -> FunnelResult<ChainTip> {
        let block = self.latest_block(self.confirmation_depth).await?;
        debug!(
            "[{}] confirmed tip slot {} height {}",
            self.name, block.slot, block.height
        );
        Ok(ChainTip {
            position: block.slot,
            timestamp: self.network.slot_to_unix(block.slot),
        })
    }

    async fn position_at(&self, timestamp: u64) -> FunnelResult<Option<u64>> {
        Ok(self.network.unix_to_slot(timestamp))
    }

    async fn read_parallel_data(
        &self,
        extensions: &[ChainDataExtension],
        from: u64,
        to: u64,
    ) -> FunnelResult<ParallelData> {
        Ok(ParallelData {
            datums: cardano::fetch_extensions(self, extensions, from, to).await?,
            submitted: Vec::new(),
        })
    }

    async fn read_presync(
        &self,
        extensions: &[ChainDataExtension],
        sentinel: u64,
        state: &PresyncState,
    ) -> FunnelResult<PresyncResult> {
        cardano::presync_page(self, extensions, sentinel, state).await
    }
}
