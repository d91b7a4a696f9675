// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::debug;

use crate::cde::{order_datums, ChainDataExtension};
use crate::error::FunnelResult;
use crate::sources::ParallelSource;
use crate::stages::{FunnelRead, PresyncContext};
use crate::types::PresyncResult;

/// Attaches extension data read from the main network itself, then orders the datums of
/// every block by `(block_number, cde_id)`.
pub struct CdeAggregateStage {
    /// Main network reader, `None` when the main chain carries no extensions (Avail).
    source: Option<Arc<dyn ParallelSource>>,
    network_name: String,
}

impl CdeAggregateStage {
    pub fn new(source: Option<Arc<dyn ParallelSource>>, network_name: &str) -> Self {
        Self {
            source,
            network_name: network_name.to_string(),
        }
    }

    fn extensions(&self, all: &[ChainDataExtension]) -> Vec<ChainDataExtension> {
        all.iter()
            .filter(|e| e.network() == self.network_name)
            .cloned()
            .collect()
    }

    pub async fn read_data(
        &self,
        mut read: FunnelRead,
        extensions: &[ChainDataExtension],
    ) -> FunnelResult<FunnelRead> {
        let extensions = self.extensions(extensions);
        let range = read
            .blocks
            .first()
            .zip(read.blocks.last())
            .map(|(first, last)| (first.block_number, last.block_number));

        if let (Some(source), Some((from, to)), false) =
            (&self.source, range, extensions.is_empty())
        {
            let data = source.read_parallel_data(&extensions, from, to).await?;
            debug!(
                "[cde] {} datums for #{}-{} from {} extensions",
                data.datums.len(),
                from,
                to,
                extensions.len()
            );
            for datum in data.datums {
                let Ok(i) = read
                    .blocks
                    .binary_search_by_key(&datum.source_position, |b| b.block_number)
                else {
                    continue;
                };
                read.blocks[i].extension_datums.push(datum);
            }
        }

        for block in &mut read.blocks {
            let datums = std::mem::take(&mut block.extension_datums);
            block.extension_datums = order_datums(datums);
        }
        Ok(read)
    }

    pub async fn read_presync(
        &self,
        ctx: &PresyncContext<'_>,
    ) -> FunnelResult<Option<PresyncResult>> {
        let extensions = self.extensions(ctx.extensions);
        let Some(source) = &self.source else {
            return Ok(None);
        };
        if extensions.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            source
                .read_presync(&extensions, ctx.main_sentinel, ctx.state)
                .await?,
        ))
    }
}
