// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Funnel assembly
//!
//! Builds one block source per configured network and lays them out as funnel stages:
//! the main network feeds blocks, every other network becomes a parallel stage, and
//! extensions on the main network are attached by the aggregation stage.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use paima_funnel::cde::SharedCdeRegistry;
use paima_funnel::config::{NetworkConfig, NetworkKind};
use paima_funnel::input::InputExtractor;
use paima_funnel::sources::avail::AvailClient;
use paima_funnel::sources::carp::CarpClient;
use paima_funnel::sources::evm::EvmClient;
use paima_funnel::sources::mina::MinaArchiveClient;
use paima_funnel::sources::{BlockSource, ParallelSource};
use paima_funnel::stages::{CdeAggregateStage, EmulatedStage, MainBlockStage, ParallelStage};
use paima_funnel::FunnelChain;
use tracing::info;

use crate::config::NodeConfig;

/// How long boot waits for the main chain to return the start block header.
const START_HEADER_MAX_ELAPSED: Duration = Duration::from_secs(300);

struct MainSources {
    blocks: Arc<dyn BlockSource>,
    /// Reader for extensions living on the main network itself
    extensions: Option<Arc<dyn ParallelSource>>,
    group_size: u64,
}

fn main_sources(
    network: &NetworkConfig,
    timeout: Duration,
    extractor: Arc<InputExtractor>,
) -> Result<MainSources> {
    let caip2 = network.caip2();
    match &network.kind {
        NetworkKind::EvmMain {
            rpc_url,
            paima_l2_contract_address,
            confirmations,
            funnel_block_group_size,
            presync_step_size,
            ..
        } => {
            let client = Arc::new(
                EvmClient::new(rpc_url, &network.name, &caip2, *confirmations, timeout)?
                    .with_l2_contract(paima_l2_contract_address, extractor)?
                    .with_presync_step_size(*presync_step_size),
            );
            let blocks: Arc<dyn BlockSource> = client.clone();
            let extensions: Arc<dyn ParallelSource> = client;
            Ok(MainSources {
                blocks,
                extensions: Some(extensions),
                group_size: *funnel_block_group_size,
            })
        }
        NetworkKind::AvailMain {
            light_client_url,
            app_id,
            funnel_block_group_size,
            ..
        } => {
            let client = Arc::new(AvailClient::new(
                light_client_url,
                &network.name,
                &caip2,
                *app_id,
                timeout,
                extractor,
            )?);
            Ok(MainSources {
                blocks: client,
                extensions: None,
                group_size: *funnel_block_group_size,
            })
        }
        _ => anyhow::bail!("network {} cannot be the main network", network.name),
    }
}

fn parallel_source(
    network: &NetworkConfig,
    timeout: Duration,
    extractor: Arc<InputExtractor>,
) -> Result<Arc<dyn ParallelSource>> {
    let caip2 = network.caip2();
    let source: Arc<dyn ParallelSource> = match &network.kind {
        NetworkKind::EvmOther {
            rpc_url,
            confirmations,
            presync_step_size,
            ..
        } => Arc::new(
            EvmClient::new(rpc_url, &network.name, &caip2, *confirmations, timeout)?
                .with_presync_step_size(*presync_step_size),
        ),
        NetworkKind::AvailOther {
            light_client_url,
            app_id,
            ..
        } => Arc::new(AvailClient::new(
            light_client_url,
            &network.name,
            &caip2,
            *app_id,
            timeout,
            extractor,
        )?),
        NetworkKind::Cardano {
            carp_url,
            network: cardano,
            confirmation_depth,
            page_size,
        } => Arc::new(CarpClient::new(
            carp_url,
            &network.name,
            *cardano,
            *confirmation_depth,
            *page_size,
            timeout,
        )?),
        NetworkKind::Mina {
            archive_url,
            confirmation_depth,
            page_size,
            ..
        } => Arc::new(MinaArchiveClient::new(
            archive_url,
            &network.name,
            &caip2,
            *confirmation_depth,
            *page_size,
            timeout,
        )?),
        NetworkKind::EvmMain { .. } | NetworkKind::AvailMain { .. } => {
            anyhow::bail!("network {} is a second main network", network.name)
        }
    };
    Ok(source)
}

/// Build the funnel for `config`. Only talks to the main chain when block emulation is on
/// and no start timestamp is configured.
pub async fn build_funnel(config: &NodeConfig, registry: SharedCdeRegistry) -> Result<FunnelChain> {
    let main = config.main_network()?;
    let extractor = Arc::new(InputExtractor::new());
    let sources = main_sources(main, config.funnel_timeout, extractor.clone())?;

    let mut parallel = Vec::new();
    for network in config.networks.iter().filter(|n| !n.is_main()) {
        let source = parallel_source(network, config.funnel_timeout, extractor.clone())
            .with_context(|| format!("building network {}", network.name))?;
        parallel.push(ParallelStage::new(source));
    }

    let chain = FunnelChain::new(
        MainBlockStage::new(sources.blocks.clone(), &main.name, sources.group_size),
        parallel,
        CdeAggregateStage::new(sources.extensions, &main.name),
        registry,
        config.start_block_height,
    );

    let Some(emulated) = config.emulated_blocks else {
        info!("[node] funnel: {:?}", chain.stage_names());
        return Ok(chain);
    };
    let start_timestamp = match emulated.start_timestamp {
        Some(ts) => ts,
        None => {
            let start = config.start_block_height;
            let header = paima_funnel::retry_recoverable(
                "start block header",
                START_HEADER_MAX_ELAPSED,
                || sources.blocks.block_header(start),
            )
            .await
            .with_context(|| {
                format!(
                    "could not read start block #{} from {} for block emulation",
                    start, main.name
                )
            })?;
            header.timestamp
        }
    };
    let stage = EmulatedStage::new(emulated.block_time_secs, start_timestamp, &main.caip2())?;
    info!(
        "[node] funnel: {:?}, emulating {}s blocks from {}",
        chain.stage_names(),
        emulated.block_time_secs,
        start_timestamp
    );
    Ok(chain.with_emulated(stage))
}
