// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Mina adapter over an archive node GraphQL API
//!
//! Positions are block heights. Timestamps come back in milliseconds and are floored to
//! seconds before alignment.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::cde::{mina, ChainDataExtension};
use crate::error::{with_timeout, FunnelError, FunnelResult};
use crate::sources::{search_position_at, ParallelData, ParallelSource};
use crate::types::{ChainTip, PresyncResult, PresyncState};

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

const NETWORK_STATE_QUERY: &str =
    "query { networkState { maxBlockHeight { canonicalMaxBlockHeight pendingMaxBlockHeight } } }";

const BLOCK_QUERY: &str = "query($height: Int!) { \
    blocks(query: { blockHeight: $height, canonical: true }, limit: 1) { \
    protocolState { blockchainState { utcDate } } } }";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkStateData {
    network_state: NetworkState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkState {
    max_block_height: MaxBlockHeight,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaxBlockHeight {
    canonical_max_block_height: u64,
    pending_max_block_height: u64,
}

#[derive(Debug, Deserialize)]
struct BlocksData {
    blocks: Vec<MinaBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MinaBlock {
    protocol_state: ProtocolState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolState {
    blockchain_state: BlockchainState,
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockchainState {
    /// Milliseconds since the unix epoch, as a string
    #[serde_as(as = "DisplayFromStr")]
    utc_date: u64,
}

pub struct MinaArchiveClient {
    http: reqwest::Client,
    url: url::Url,
    name: String,
    network: String,
    confirmation_depth: u64,
    /// Blocks per events or actions page
    page_size: u64,
    timeout: Duration,
}

impl MinaArchiveClient {
    pub fn new(
        archive_url: &str,
        name: &str,
        network: &str,
        confirmation_depth: u64,
        page_size: u64,
        timeout: Duration,
    ) -> FunnelResult<Self> {
        let url = url::Url::parse(archive_url).map_err(|e| {
            FunnelError::Config(format!("invalid archive url {}: {}", archive_url, e))
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            url,
            name: name.to_string(),
            network: network.to_string(),
            confirmation_depth,
            page_size: page_size.max(1),
            timeout,
        })
    }

    pub fn name_str(&self) -> &str {
        &self.name
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Run a GraphQL query. Any reported error fails the whole query.
    pub async fn query<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> FunnelResult<T> {
        let response: GraphQlResponse<T> = with_timeout(self.timeout, "mina graphql", async {
            Ok(self
                .http
                .post(self.url.clone())
                .json(&GraphQlRequest { query, variables })
                .send()
                .await?
                .json()
                .await?)
        })
        .await?;
        if let Some(error) = response.errors.first() {
            return Err(FunnelError::Indexer(format!(
                "[{}] graphql error: {}",
                self.name, error.message
            )));
        }
        response
            .data
            .ok_or_else(|| FunnelError::InvalidResponse(format!("[{}] empty graphql data", self.name)))
    }

    async fn confirmed_height(&self) -> FunnelResult<u64> {
        let state: NetworkStateData = self
            .query(NETWORK_STATE_QUERY, serde_json::Value::Null)
            .await?;
        let heights = state.network_state.max_block_height;
        Ok(heights.canonical_max_block_height.min(
            heights
                .pending_max_block_height
                .saturating_sub(self.confirmation_depth),
        ))
    }

    /// Unix seconds of the canonical block at `height`.
    async fn block_timestamp(&self, height: u64) -> FunnelResult<u64> {
        let data: BlocksData = self
            .query(BLOCK_QUERY, serde_json::json!({ "height": height }))
            .await?;
        let block = data
            .blocks
            .into_iter()
            .next()
            .ok_or(FunnelError::BlockNotFound(height))?;
        Ok(block.protocol_state.blockchain_state.utc_date / 1000)
    }
}

#[async_trait]
impl ParallelSource for MinaArchiveClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn network(&self) -> &str {
        &self.network
    }

    async fn tip(&self) -> FunnelResult<ChainTip> {
        let position = self.confirmed_height().await?;
        Ok(ChainTip {
            position,
            timestamp: self.block_timestamp(position).await?,
        })
    }

    async fn position_at(&self, timestamp: u64) -> FunnelResult<Option<u64>> {
        let tip = self.confirmed_height().await?;
        // mina heights start at 1
        search_position_at(1, tip.max(1), timestamp, |h| self.block_timestamp(h)).await
    }

    async fn read_parallel_data(
        &self,
        extensions: &[ChainDataExtension],
        from: u64,
        to: u64,
    ) -> FunnelResult<ParallelData> {
        Ok(ParallelData {
            datums: mina::fetch_extensions(self, extensions, from, to).await?,
            submitted: Vec::new(),
        })
    }

    async fn read_presync(
        &self,
        extensions: &[ChainDataExtension],
        sentinel: u64,
        state: &PresyncState,
    ) -> FunnelResult<PresyncResult> {
        mina::presync_page(self, extensions, sentinel, state).await
    }
}
