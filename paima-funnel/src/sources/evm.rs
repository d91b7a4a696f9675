// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! EVM adapter over an `ethers` provider
//!
//! As the main chain it reads `PaimaGameInteraction` events from the L2 contract; as a
//! parallel chain it only serves extension data.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::contract::{parse_log, EthEvent};
use ethers::providers::{Http, JsonRpcClient, Middleware, Provider};
use ethers::types::{Address, Bytes, Filter, Log, U256};
use tracing::{debug, warn};

use crate::cde::{self, ChainDataExtension};
use crate::error::{with_timeout, FunnelError, FunnelResult};
use crate::input::{InputExtractor, RawInput};
use crate::sources::{
    fetch_block_prefix, presync_window, search_position_at, BlockSource, ParallelData,
    ParallelSource,
};
use crate::types::{
    BlockHeader, ChainData, ChainTip, InputOrigin, PresyncChainData, PresyncResult, PresyncState,
};

#[derive(Clone, Debug, EthEvent)]
#[ethevent(
    name = "PaimaGameInteraction",
    abi = "PaimaGameInteraction(address,bytes,uint256)"
)]
pub struct PaimaGameInteraction {
    #[ethevent(indexed)]
    pub user_address: Address,
    pub data: Bytes,
    pub value: U256,
}

pub struct EvmClient<P> {
    provider: Provider<P>,
    name: String,
    network: String,
    l2_contract: Option<Address>,
    confirmations: u64,
    presync_step_size: u64,
    timeout: Duration,
    extractor: Arc<InputExtractor>,
}

impl EvmClient<Http> {
    pub fn new(
        rpc_url: &str,
        name: &str,
        network: &str,
        confirmations: u64,
        timeout: Duration,
    ) -> FunnelResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| FunnelError::Config(format!("invalid rpc url {}: {}", rpc_url, e)))?;
        Ok(Self::with_provider(
            provider,
            name,
            network,
            confirmations,
            timeout,
        ))
    }
}

impl<P> EvmClient<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn with_provider(
        provider: Provider<P>,
        name: &str,
        network: &str,
        confirmations: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            name: name.to_string(),
            network: network.to_string(),
            l2_contract: None,
            confirmations,
            presync_step_size: 1000,
            timeout,
            extractor: Arc::new(InputExtractor::new()),
        }
    }

    /// Read game inputs from the given L2 contract.
    pub fn with_l2_contract(mut self, address: &str, extractor: Arc<InputExtractor>) -> FunnelResult<Self> {
        self.l2_contract = Some(parse_address(address)?);
        self.extractor = extractor;
        Ok(self)
    }

    pub fn with_presync_step_size(mut self, step: u64) -> Self {
        self.presync_step_size = step.max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn chain_id(&self) -> FunnelResult<u64> {
        let id = with_timeout(self.timeout, "eth_chainId", async {
            Ok(self.provider.get_chainid().await?)
        })
        .await?;
        Ok(id.as_u64())
    }

    pub async fn get_logs(&self, filter: &Filter) -> FunnelResult<Vec<Log>> {
        with_timeout(self.timeout, "eth_getLogs", async {
            Ok(self.provider.get_logs(filter).await?)
        })
        .await
    }

    async fn header(&self, number: u64) -> FunnelResult<BlockHeader> {
        let block = with_timeout(self.timeout, "eth_getBlockByNumber", async {
            Ok(self.provider.get_block(number).await?)
        })
        .await?
        .ok_or(FunnelError::BlockNotFound(number))?;
        let hash = block
            .hash
            .ok_or_else(|| FunnelError::InvalidResponse(format!("block {} has no hash", number)))?;
        Ok(BlockHeader {
            number,
            timestamp: block.timestamp.as_u64(),
            hash: hash.0,
        })
    }

    async fn latest_confirmed(&self) -> FunnelResult<u64> {
        let latest = with_timeout(self.timeout, "eth_blockNumber", async {
            Ok(self.provider.get_block_number().await?)
        })
        .await?;
        Ok(latest.as_u64().saturating_sub(self.confirmations))
    }

    async fn interaction_inputs(
        &self,
        from: u64,
        to: u64,
    ) -> FunnelResult<BTreeMap<u64, Vec<crate::types::SubmittedData>>> {
        let mut by_block: BTreeMap<u64, Vec<_>> = BTreeMap::new();
        let Some(contract) = self.l2_contract else {
            return Ok(by_block);
        };
        let filter = Filter::new()
            .address(contract)
            .topic0(PaimaGameInteraction::signature())
            .from_block(from)
            .to_block(to);
        for log in self.get_logs(&filter).await? {
            let (Some(block_number), tx_hash) = (log.block_number, log.transaction_hash) else {
                continue;
            };
            let event = match parse_log::<PaimaGameInteraction>(log) {
                Ok(e) => e,
                Err(e) => {
                    warn!("[{}] Undecodable game interaction: {}", self.name, e);
                    continue;
                }
            };
            let Ok(input_data) = String::from_utf8(event.data.to_vec()) else {
                warn!(
                    "[{}] Non UTF-8 input in block {}, skipping",
                    self.name, block_number
                );
                continue;
            };
            let raw = RawInput {
                block_height: block_number.as_u64(),
                input_data,
                sender: Some(format!("{:?}", event.user_address)),
                supplied_value: event.value.to_string(),
                origin: InputOrigin {
                    tx_hash: tx_hash.map(|h| format!("{:?}", h)),
                    caip2: Some(self.network.clone()),
                    contract_address: Some(format!("{:?}", contract)),
                    primitive_name: None,
                },
            };
            by_block
                .entry(block_number.as_u64())
                .or_default()
                .extend(self.extractor.extract(&raw));
        }
        Ok(by_block)
    }
}

pub fn parse_address(address: &str) -> FunnelResult<Address> {
    Address::from_str(address)
        .map_err(|e| FunnelError::Config(format!("invalid address {}: {}", address, e)))
}

#[async_trait]
impl<P> BlockSource for EvmClient<P>
where
    P: JsonRpcClient + 'static,
{
    fn network(&self) -> &str {
        &self.network
    }

    async fn confirmed_tip(&self) -> FunnelResult<u64> {
        self.latest_confirmed().await
    }

    async fn block_header(&self, number: u64) -> FunnelResult<BlockHeader> {
        self.header(number).await
    }

    async fn fetch_blocks(&self, from: u64, to: u64) -> FunnelResult<Vec<ChainData>> {
        let headers = fetch_block_prefix(from, to, |n| self.header(n));
        let inputs = self.interaction_inputs(from, to);
        let (headers, mut inputs) = futures::try_join!(headers, inputs)?;

        debug!(
            "[{}] fetched {} headers for #{}-{}",
            self.name,
            headers.len(),
            from,
            to
        );
        Ok(headers
            .iter()
            .map(|header| {
                let mut data = ChainData::from_header(header, &self.network);
                data.submitted_data = inputs.remove(&header.number).unwrap_or_default();
                data
            })
            .collect())
    }
}

#[async_trait]
impl<P> ParallelSource for EvmClient<P>
where
    P: JsonRpcClient + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn network(&self) -> &str {
        &self.network
    }

    async fn tip(&self) -> FunnelResult<ChainTip> {
        let position = self.latest_confirmed().await?;
        let header = self.header(position).await?;
        Ok(ChainTip {
            position,
            timestamp: header.timestamp,
        })
    }

    async fn position_at(&self, timestamp: u64) -> FunnelResult<Option<u64>> {
        let tip = self.latest_confirmed().await?;
        search_position_at(0, tip, timestamp, |n| async move {
            Ok(self.header(n).await?.timestamp)
        })
        .await
    }

    async fn read_parallel_data(
        &self,
        extensions: &[ChainDataExtension],
        from: u64,
        to: u64,
    ) -> FunnelResult<ParallelData> {
        Ok(ParallelData {
            datums: cde::evm::fetch_extensions(self, extensions, from, to).await?,
            submitted: Vec::new(),
        })
    }

    async fn read_presync(
        &self,
        extensions: &[ChainDataExtension],
        sentinel: u64,
        state: &PresyncState,
    ) -> FunnelResult<PresyncResult> {
        window_presync(self, extensions, sentinel, state, self.presync_step_size).await
    }
}

/// Window-based presync shared by block-numbered EVM networks.
pub async fn window_presync<P>(
    client: &EvmClient<P>,
    extensions: &[ChainDataExtension],
    sentinel: u64,
    state: &PresyncState,
    step: u64,
) -> FunnelResult<PresyncResult>
where
    P: JsonRpcClient + 'static,
{
    let Some((from, to)) = presync_window(&client.name, extensions, sentinel, state, step) else {
        return Ok(PresyncResult::Finished);
    };
    let datums = cde::evm::fetch_extensions(client, extensions, from, to).await?;
    debug!(
        "[{}] presync #{}-{}: {} datums",
        client.name,
        from,
        to,
        datums.len()
    );
    Ok(PresyncResult::Data(PresyncChainData {
        network: client.name.clone(),
        to_position: Some(to),
        extension_datums: datums,
        cursors: Vec::new(),
    }))
}
