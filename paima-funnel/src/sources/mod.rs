// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Block source adapters
//!
//! One adapter per chain kind. The main chain is read through [`BlockSource`]; every
//! other network is read through [`ParallelSource`], which maps main-chain timestamps to
//! the network's own positions (block height or slot).

pub mod avail;
pub mod carp;
pub mod evm;
pub mod mina;

use std::future::Future;

use async_trait::async_trait;
use futures::future::join_all;

use crate::cde::{CdeDatum, ChainDataExtension};
use crate::error::{FunnelError, FunnelResult};
use crate::types::{BlockHeader, ChainData, ChainTip, PresyncResult, PresyncState, SubmittedData};

/// Adapter over the chain the game is deployed on.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// caip2 id of the chain
    fn network(&self) -> &str;

    /// Highest block considered confirmed.
    async fn confirmed_tip(&self) -> FunnelResult<u64>;

    async fn block_header(&self, number: u64) -> FunnelResult<BlockHeader>;

    /// Blocks `[from, to]` with their submitted inputs. `to` must not exceed the tip.
    /// Stops at the first block that fails and returns the prefix read before it.
    async fn fetch_blocks(&self, from: u64, to: u64) -> FunnelResult<Vec<ChainData>>;

    /// Like [`BlockSource::fetch_blocks`], clamping `to` to the confirmed tip first.
    async fn read_block_range(&self, from: u64, to: u64) -> FunnelResult<Vec<ChainData>> {
        let tip = self.confirmed_tip().await?;
        let to = to.min(tip);
        if from > to {
            return Ok(Vec::new());
        }
        self.fetch_blocks(from, to).await
    }
}

/// Side data read from a secondary network for a position range.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParallelData {
    pub datums: Vec<CdeDatum>,
    /// Inputs with the position they were observed at.
    pub submitted: Vec<(u64, SubmittedData)>,
}

/// Adapter over a network read alongside the main chain.
#[async_trait]
pub trait ParallelSource: Send + Sync {
    /// Network name from config
    fn name(&self) -> &str;

    /// caip2 id of the network
    fn network(&self) -> &str;

    async fn tip(&self) -> FunnelResult<ChainTip>;

    /// Last position whose time is at or before `timestamp`, or `None` when the
    /// network has no position that early.
    async fn position_at(&self, timestamp: u64) -> FunnelResult<Option<u64>>;

    /// Extension data and inputs at positions `[from, to]`, each datum tagged with its
    /// source position.
    async fn read_parallel_data(
        &self,
        extensions: &[ChainDataExtension],
        from: u64,
        to: u64,
    ) -> FunnelResult<ParallelData>;

    /// One presync step for this network's extensions, bounded by `sentinel`.
    async fn read_presync(
        &self,
        extensions: &[ChainDataExtension],
        sentinel: u64,
        state: &PresyncState,
    ) -> FunnelResult<PresyncResult>;
}

/// Fetch `from..=to` concurrently and keep the results up to the first failure.
///
/// A failure on the very first block is returned as the error, since an empty prefix
/// would be indistinguishable from "no new blocks".
pub async fn fetch_block_prefix<T, F, Fut>(from: u64, to: u64, fetch_one: F) -> FunnelResult<Vec<T>>
where
    F: Fn(u64) -> Fut,
    Fut: Future<Output = FunnelResult<T>>,
{
    if from > to {
        return Ok(Vec::new());
    }
    let results = join_all((from..=to).map(&fetch_one)).await;
    truncate_at_first_failure(results)
}

pub fn truncate_at_first_failure<T>(results: Vec<FunnelResult<T>>) -> FunnelResult<Vec<T>> {
    let mut out = Vec::with_capacity(results.len());
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(v) => out.push(v),
            Err(e) if i == 0 => return Err(e),
            Err(e) => {
                tracing::warn!(
                    "Block fetch failed after {} good blocks, returning prefix: {}",
                    i,
                    e
                );
                break;
            }
        }
    }
    Ok(out)
}

/// Binary search for the last position in `[lo, hi]` whose timestamp is at or before
/// `target`. Timestamps must be non-decreasing in position.
pub async fn search_position_at<F, Fut>(
    lo: u64,
    hi: u64,
    target: u64,
    timestamp_of: F,
) -> FunnelResult<Option<u64>>
where
    F: Fn(u64) -> Fut,
    Fut: Future<Output = FunnelResult<u64>>,
{
    if lo > hi {
        return Err(FunnelError::Other(format!(
            "empty search range [{}, {}]",
            lo, hi
        )));
    }
    if timestamp_of(lo).await? > target {
        return Ok(None);
    }
    let (mut lo, mut hi) = (lo, hi);
    // invariant: ts(lo) <= target
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if timestamp_of(mid).await? <= target {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(Some(lo))
}

/// Next presync window `[from, to]` of a block-numbered network, or `None` once the saved
/// position has passed `sentinel`. Starts at the earliest extension start height.
pub fn presync_window(
    network_name: &str,
    extensions: &[ChainDataExtension],
    sentinel: u64,
    state: &PresyncState,
    step: u64,
) -> Option<(u64, u64)> {
    let earliest = extensions.iter().map(|e| e.start_block_height()).min()?;
    let from = state
        .positions
        .get(network_name)
        .copied()
        .unwrap_or(earliest);
    if from > sentinel {
        return None;
    }
    Some((from, from.saturating_add(step.max(1) - 1).min(sentinel)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_partial_failure_returns_prefix() {
        let blocks = fetch_block_prefix(1, 5, |n| async move {
            if n == 3 {
                Err(FunnelError::Rpc(format!("block {} rejected", n)))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(blocks, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_first_block_failure_is_an_error() {
        let result = fetch_block_prefix(1, 3, |n| async move {
            if n == 1 {
                Err(FunnelError::Timeout("slow".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert!(matches!(result, Err(FunnelError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_empty_range() {
        let blocks: Vec<u64> = fetch_block_prefix(5, 4, |n| async move { Ok(n) })
            .await
            .unwrap();
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_presync_window() {
        use crate::cde::{ExtensionConfig, ExtensionKind};
        let ext = |start| ChainDataExtension {
            cde_id: 0,
            config: ExtensionConfig {
                name: format!("erc20-{}", start),
                network: "main".into(),
                start_block_height: start,
                scheduled_prefix: None,
                kind: ExtensionKind::Erc20 {
                    contract_address: "0x01".into(),
                },
            },
        };
        let extensions = vec![ext(50), ext(10)];
        let mut state = PresyncState::default();

        assert_eq!(presync_window("main", &[], 99, &state, 10), None);
        assert_eq!(
            presync_window("main", &extensions, 99, &state, 25),
            Some((10, 34))
        );
        state.positions.insert("main".into(), 90);
        assert_eq!(
            presync_window("main", &extensions, 99, &state, 25),
            Some((90, 99))
        );
        state.positions.insert("main".into(), 100);
        assert_eq!(presync_window("main", &extensions, 99, &state, 25), None);
    }

    #[tokio::test]
    async fn test_search_position_at() {
        let timestamps = [100u64, 110, 110, 130, 150, 190];
        let ts = |n: u64| {
            let t = timestamps[n as usize];
            async move { Ok(t) }
        };
        assert_eq!(search_position_at(0, 5, 99, ts).await.unwrap(), None);
        assert_eq!(search_position_at(0, 5, 100, ts).await.unwrap(), Some(0));
        assert_eq!(search_position_at(0, 5, 115, ts).await.unwrap(), Some(2));
        assert_eq!(search_position_at(0, 5, 149, ts).await.unwrap(), Some(3));
        assert_eq!(search_position_at(0, 5, 1000, ts).await.unwrap(), Some(5));
        assert_eq!(search_position_at(3, 5, 160, ts).await.unwrap(), Some(4));
    }
}
