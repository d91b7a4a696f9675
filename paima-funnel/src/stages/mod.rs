// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Funnel stages
//!
//! A read is folded through the stages in a fixed order. Each stage receives what the
//! stages before it produced and may add data to it or drop a suffix of its blocks, never
//! anything else:
//!
//! 1. `Base` starts an empty read at the requested height.
//! 2. `MainBlock` reads a group of main-chain blocks with their inputs.
//! 3. `Parallel` stages attach data from secondary networks, aligned by timestamp, and
//!    hold back blocks the network has not caught up with.
//! 4. `CdeAggregate` attaches main-network extension data and orders every block's datums.
//!
//! Emulated blocks sit outside the fold; see [`emulated`].

pub mod cde_aggregate;
pub mod emulated;
pub mod main_block;
pub mod parallel;

#[cfg(test)]
pub(crate) mod testing;

use crate::cache::FunnelCacheManager;
use crate::cde::ChainDataExtension;
use crate::error::FunnelResult;
use crate::types::{ChainData, PresyncResult, PresyncState};

pub use cde_aggregate::CdeAggregateStage;
pub use emulated::EmulatedStage;
pub use main_block::MainBlockStage;
pub use parallel::ParallelStage;

/// Read in progress.
#[derive(Debug, Clone, PartialEq)]
pub struct FunnelRead {
    /// First height asked for.
    pub block_height: u64,
    /// Timestamp of the block before `block_height`, `None` at genesis.
    pub previous_timestamp: Option<u64>,
    pub blocks: Vec<ChainData>,
}

impl FunnelRead {
    pub fn new(block_height: u64) -> Self {
        Self {
            block_height,
            previous_timestamp: None,
            blocks: Vec::new(),
        }
    }
}

/// Inputs shared by every stage's presync step.
pub struct PresyncContext<'a> {
    pub extensions: &'a [ChainDataExtension],
    pub state: &'a PresyncState,
    /// Last main-chain height covered by presync (`start_block_height - 1`).
    pub main_sentinel: u64,
    /// Timestamp of the main block at `main_sentinel`.
    pub sentinel_timestamp: u64,
}

pub enum FunnelStage {
    Base,
    MainBlock(MainBlockStage),
    Parallel(ParallelStage),
    CdeAggregate(CdeAggregateStage),
}

impl FunnelStage {
    pub fn name(&self) -> &str {
        match self {
            FunnelStage::Base => "base",
            FunnelStage::MainBlock(stage) => stage.tag(),
            FunnelStage::Parallel(stage) => stage.tag(),
            FunnelStage::CdeAggregate(_) => "cde",
        }
    }

    pub async fn read_data(
        &self,
        read: FunnelRead,
        extensions: &[ChainDataExtension],
        cache: &mut FunnelCacheManager,
    ) -> FunnelResult<FunnelRead> {
        match self {
            FunnelStage::Base => Ok(FunnelRead::new(read.block_height)),
            FunnelStage::MainBlock(stage) => stage.read_data(read, cache).await,
            FunnelStage::Parallel(stage) => stage.read_data(read, extensions, cache).await,
            FunnelStage::CdeAggregate(stage) => stage.read_data(read, extensions).await,
        }
    }

    /// One presync step, `None` for stages with nothing to presync.
    pub async fn read_presync(
        &self,
        ctx: &PresyncContext<'_>,
        cache: &mut FunnelCacheManager,
    ) -> FunnelResult<Option<PresyncResult>> {
        match self {
            FunnelStage::Base | FunnelStage::MainBlock(_) => Ok(None),
            FunnelStage::Parallel(stage) => stage.read_presync(ctx, cache).await,
            FunnelStage::CdeAggregate(stage) => stage.read_presync(ctx).await,
        }
    }
}
