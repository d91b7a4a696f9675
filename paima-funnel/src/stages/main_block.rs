// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{FunnelCacheManager, RpcCacheEntry};
use crate::error::FunnelResult;
use crate::sources::BlockSource;
use crate::stages::FunnelRead;

/// Reads main-chain blocks in groups of at most `group_size`.
pub struct MainBlockStage {
    source: Arc<dyn BlockSource>,
    tag: String,
    group_size: u64,
}

impl MainBlockStage {
    pub fn new(source: Arc<dyn BlockSource>, tag: &str, group_size: u64) -> Self {
        Self {
            source,
            tag: tag.to_string(),
            group_size: group_size.max(1),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn source(&self) -> &Arc<dyn BlockSource> {
        &self.source
    }

    pub async fn read_data(
        &self,
        read: FunnelRead,
        cache: &mut FunnelCacheManager,
    ) -> FunnelResult<FunnelRead> {
        let from = read.block_height;
        let network = self.source.network().to_string();
        let rpc = cache.get_or_init::<RpcCacheEntry>()?;

        // the cached tip is only refreshed once reads catch up with it
        let tip = match rpc.tip(&network) {
            Some(tip) if from <= tip => tip,
            _ => {
                let tip = self.source.confirmed_tip().await?;
                rpc.update_tip(&network, tip);
                tip
            }
        };
        if from > tip {
            debug!("[{}] waiting for block #{} (tip #{})", self.tag, from, tip);
            return Ok(read);
        }
        let to = from.saturating_add(self.group_size - 1).min(tip);
        info!("[{}] block funnel #{}-{}", self.tag, from, to);

        let previous_timestamp = match from.checked_sub(1) {
            None => None,
            Some(previous) => match rpc.anchor_timestamp(previous) {
                Some(ts) => Some(ts),
                None => Some(self.source.block_header(previous).await?.timestamp),
            },
        };
        let blocks = self.source.fetch_blocks(from, to).await?;
        Ok(FunnelRead {
            block_height: from,
            previous_timestamp,
            blocks,
        })
    }
}
