// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Funnel chain
//!
//! Owns the stages, the emulated-block layer and the cache for one continuous run. The
//! runtime asks for data starting at a height and gets back a possibly empty, gap-free run
//! of blocks starting exactly at that height.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{EmulatedBlocksCacheEntry, FunnelCacheEntry, FunnelCacheManager, RpcCacheEntry};
use crate::cde::{ChainDataExtension, SharedCdeRegistry};
use crate::error::{FunnelError, FunnelResult};
use crate::sources::BlockSource;
use crate::stages::{
    CdeAggregateStage, EmulatedStage, FunnelRead, FunnelStage, MainBlockStage, ParallelStage,
    PresyncContext,
};
use crate::types::{ChainData, PresyncResult, PresyncState};

pub struct FunnelChain {
    main: Arc<dyn BlockSource>,
    stages: Vec<FunnelStage>,
    emulated: Option<EmulatedStage>,
    registry: SharedCdeRegistry,
    cache: FunnelCacheManager,
    start_block_height: u64,
}

impl FunnelChain {
    /// Stages are laid out as base, main, every parallel network, then aggregation.
    pub fn new(
        main: MainBlockStage,
        parallel: Vec<ParallelStage>,
        aggregate: CdeAggregateStage,
        registry: SharedCdeRegistry,
        start_block_height: u64,
    ) -> Self {
        let main_source = main.source().clone();
        let mut stages = vec![FunnelStage::Base, FunnelStage::MainBlock(main)];
        stages.extend(parallel.into_iter().map(FunnelStage::Parallel));
        stages.push(FunnelStage::CdeAggregate(aggregate));
        Self {
            main: main_source,
            stages,
            emulated: None,
            registry,
            cache: FunnelCacheManager::new(),
            start_block_height,
        }
    }

    pub fn with_emulated(mut self, emulated: EmulatedStage) -> Self {
        self.emulated = Some(emulated);
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn is_emulated(&self) -> bool {
        self.emulated.is_some()
    }

    pub fn start_block_height(&self) -> u64 {
        self.start_block_height
    }

    /// First height handed to the STF on a fresh database.
    pub fn initial_block_height(&self) -> u64 {
        if self.is_emulated() {
            0
        } else {
            self.start_block_height
        }
    }

    /// Forget everything cached during this run.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Position the emulated layer after a restart. `next_real` is the first real block not
    /// yet folded into a committed emulated block.
    pub fn resume_emulated(&mut self, next_emulated: u64, next_real: u64) -> FunnelResult<()> {
        if self.emulated.is_none() {
            return Ok(());
        }
        let entry = self.cache.get_or_init::<EmulatedBlocksCacheEntry>()?;
        entry.clear();
        entry.next_emulated = Some(next_emulated);
        entry.next_real = next_real;
        entry.last_consumed_real = next_real.checked_sub(1);
        info!(
            "[emulated] resuming at block #{} from real block #{}",
            next_emulated, next_real
        );
        Ok(())
    }

    async fn extensions(&self) -> Vec<ChainDataExtension> {
        self.registry.read().await.all().to_vec()
    }

    /// Blocks starting at `block_height`, empty when nothing new is ready.
    pub async fn read_data(&mut self, block_height: u64) -> FunnelResult<Vec<ChainData>> {
        let Some(emulated) = self.emulated.clone() else {
            return self.read_real(block_height).await;
        };

        let entry = self.cache.get_or_init::<EmulatedBlocksCacheEntry>()?;
        if entry.next_emulated != Some(block_height) {
            return Err(FunnelError::Config(format!(
                "emulated funnel not resumed at #{} (next {:?})",
                block_height, entry.next_emulated
            )));
        }
        let blocks = emulated.drain(entry)?;
        if !blocks.is_empty() {
            return Ok(blocks);
        }

        let next_real = entry.next_real;
        let real = self.read_real(next_real).await?;
        let entry = self.cache.get_or_init::<EmulatedBlocksCacheEntry>()?;
        if let Some(last) = real.last() {
            entry.next_real = last.block_number + 1;
        }
        entry.buffer.extend(real);
        emulated.drain(entry)
    }

    async fn read_real(&mut self, block_height: u64) -> FunnelResult<Vec<ChainData>> {
        let extensions = self.extensions().await;
        let mut read = FunnelRead::new(block_height);
        for stage in &self.stages {
            read = stage.read_data(read, &extensions, &mut self.cache).await?;
            if read.blocks.is_empty() && !matches!(stage, FunnelStage::Base) {
                break;
            }
        }
        if let Some(last) = read.blocks.last() {
            self.cache
                .get_or_init::<RpcCacheEntry>()?
                .set_anchor(last.block_number, last.timestamp);
        }
        Ok(read.blocks)
    }

    async fn timestamp_of(&mut self, number: u64) -> FunnelResult<u64> {
        if let Some(ts) = self
            .cache
            .get_or_init::<RpcCacheEntry>()?
            .anchor_timestamp(number)
        {
            return Ok(ts);
        }
        Ok(self.main.block_header(number).await?.timestamp)
    }

    /// One presync step for every network with extensions that started before
    /// `start_block_height`. Presync is over once every result is `Finished`.
    pub async fn read_presync_data(
        &mut self,
        state: &PresyncState,
    ) -> FunnelResult<Vec<PresyncResult>> {
        let Some(main_sentinel) = self.start_block_height.checked_sub(1) else {
            return Ok(Vec::new());
        };
        let extensions = self.extensions().await;
        let sentinel_timestamp = self.timestamp_of(main_sentinel).await?;
        let ctx = PresyncContext {
            extensions: &extensions,
            state,
            main_sentinel,
            sentinel_timestamp,
        };
        let mut results = Vec::new();
        for stage in &self.stages {
            if let Some(result) = stage.read_presync(&ctx, &mut self.cache).await? {
                debug!(
                    "[{}] presync step: {}",
                    stage.name(),
                    if result.is_finished() { "finished" } else { "data" }
                );
                results.push(result);
            }
        }
        Ok(results)
    }
}
