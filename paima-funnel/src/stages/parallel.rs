// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Alignment of a secondary network onto main-chain blocks
//!
//! Main block `B` receives the data at positions `(position_at(ts(B-1)), position_at(ts(B))]`
//! of the secondary network. Blocks newer than the network's confirmed tip are dropped from
//! the read so they are retried once the network catches up.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{FunnelCacheManager, ParallelFunnelCacheEntry, ParallelNetworkState};
use crate::cde::ChainDataExtension;
use crate::error::FunnelResult;
use crate::sources::ParallelSource;
use crate::stages::{FunnelRead, PresyncContext};
use crate::types::PresyncResult;

pub struct ParallelStage {
    source: Arc<dyn ParallelSource>,
    tag: String,
}

impl ParallelStage {
    pub fn new(source: Arc<dyn ParallelSource>) -> Self {
        let tag = source.name().to_string();
        Self { source, tag }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn extensions(&self, all: &[ChainDataExtension]) -> Vec<ChainDataExtension> {
        all.iter()
            .filter(|e| e.network() == self.source.name())
            .cloned()
            .collect()
    }

    async fn position_at(
        &self,
        state: &mut ParallelNetworkState,
        timestamp: u64,
    ) -> FunnelResult<Option<u64>> {
        if let Some(position) = state.positions.get(&timestamp) {
            return Ok(*position);
        }
        let position = self.source.position_at(timestamp).await?;
        state.positions.insert(timestamp, position);
        Ok(position)
    }

    pub async fn read_data(
        &self,
        mut read: FunnelRead,
        extensions: &[ChainDataExtension],
        cache: &mut FunnelCacheManager,
    ) -> FunnelResult<FunnelRead> {
        let Some(last_timestamp) = read.blocks.last().map(|b| b.timestamp) else {
            return Ok(read);
        };
        let state = cache
            .get_or_init::<ParallelFunnelCacheEntry>()?
            .network(self.source.name());

        let tip = match state.tip {
            Some(tip) if tip.timestamp >= last_timestamp => tip,
            _ => {
                let tip = self.source.tip().await?;
                state.tip = Some(tip);
                tip
            }
        };
        let keep = read
            .blocks
            .iter()
            .position(|b| b.timestamp > tip.timestamp)
            .unwrap_or(read.blocks.len());
        if keep < read.blocks.len() {
            debug!(
                "[{}] holding back {} blocks until tip passes {}",
                self.tag,
                read.blocks.len() - keep,
                tip.timestamp
            );
            read.blocks.truncate(keep);
        }
        if read.blocks.is_empty() {
            return Ok(read);
        }

        let lower = match read.previous_timestamp {
            Some(ts) => self.position_at(state, ts).await?.map_or(0, |p| p + 1),
            None => 0,
        };
        let mut uppers = Vec::with_capacity(read.blocks.len());
        for block in &read.blocks {
            uppers.push(self.position_at(state, block.timestamp).await?);
        }
        if let Some(ts) = read.previous_timestamp {
            state.prune_before(ts);
        }

        let Some(upper) = uppers.last().copied().flatten() else {
            return Ok(read);
        };
        if upper < lower {
            return Ok(read);
        }

        let extensions = self.extensions(extensions);
        let data = self
            .source
            .read_parallel_data(&extensions, lower, upper)
            .await?;
        debug!(
            "[{}] positions #{}-{}: {} datums, {} inputs",
            self.tag,
            lower,
            upper,
            data.datums.len(),
            data.submitted.len()
        );

        let slot_of = |position: u64| {
            uppers
                .iter()
                .position(|upper| matches!(upper, Some(upper) if position <= *upper))
        };
        for mut datum in data.datums {
            if let Some(i) = slot_of(datum.source_position) {
                datum.block_number = read.blocks[i].block_number;
                read.blocks[i].extension_datums.push(datum);
            }
        }
        for (position, input) in data.submitted {
            if let Some(i) = slot_of(position) {
                read.blocks[i].submitted_data.push(input);
            }
        }
        Ok(read)
    }

    pub async fn read_presync(
        &self,
        ctx: &PresyncContext<'_>,
        cache: &mut FunnelCacheManager,
    ) -> FunnelResult<Option<PresyncResult>> {
        let extensions = self.extensions(ctx.extensions);
        if extensions.is_empty() {
            return Ok(None);
        }
        let state = cache
            .get_or_init::<ParallelFunnelCacheEntry>()?
            .network(self.source.name());
        let sentinel = match state.presync_sentinel {
            Some(sentinel) => sentinel,
            None => {
                let sentinel = self.source.position_at(ctx.sentinel_timestamp).await?;
                info!(
                    "[{}] presync up to position {:?} (main #{})",
                    self.tag, sentinel, ctx.main_sentinel
                );
                state.presync_sentinel = Some(sentinel);
                sentinel
            }
        };
        let Some(sentinel) = sentinel else {
            return Ok(Some(PresyncResult::Finished));
        };
        Ok(Some(
            self.source
                .read_presync(&extensions, sentinel, ctx.state)
                .await?,
        ))
    }
}
