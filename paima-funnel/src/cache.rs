// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Funnel cache manager
//!
//! Process-local state owned by the funnel chain for one continuous run. Each stage keeps
//! its own entry type, looked up by a stable kind key. Entries are never persisted and are
//! cleared whenever the runtime loop restarts.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::error::{FunnelError, FunnelResult};
use crate::types::{ChainData, ChainTip};

/// Behaviour every cache entry provides.
pub trait FunnelCacheEntry: Any + Send + Sync {
    fn initialized(&self) -> bool;
    fn clear(&mut self);
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Stable key of an entry type.
pub trait CacheKind {
    const KIND: &'static str;
}

#[derive(Default)]
pub struct FunnelCacheManager {
    entries: HashMap<&'static str, Box<dyn FunnelCacheEntry>>,
}

impl FunnelCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry of type `T`, created empty on first use.
    pub fn get_or_init<T>(&mut self) -> FunnelResult<&mut T>
    where
        T: FunnelCacheEntry + CacheKind + Default,
    {
        let entry = self
            .entries
            .entry(T::KIND)
            .or_insert_with(|| Box::new(T::default()));
        entry.as_any_mut().downcast_mut::<T>().ok_or_else(|| {
            FunnelError::Other(format!("cache kind {} holds another entry type", T::KIND))
        })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    /// Clear every entry, keeping the allocations.
    pub fn clear(&mut self) {
        for entry in self.entries.values_mut() {
            entry.clear();
        }
    }
}

/// Latest confirmed heights of block sources and the last block handed out.
#[derive(Debug, Default)]
pub struct RpcCacheEntry {
    tips: HashMap<String, u64>,
    /// `(number, timestamp)` of the last emitted block
    anchor: Option<(u64, u64)>,
}

impl CacheKind for RpcCacheEntry {
    const KIND: &'static str = "RpcCacheEntry";
}

impl RpcCacheEntry {
    pub fn tip(&self, network: &str) -> Option<u64> {
        self.tips.get(network).copied()
    }

    pub fn update_tip(&mut self, network: &str, tip: u64) {
        self.tips.insert(network.to_string(), tip);
    }

    /// Timestamp of block `number`, when it is the one remembered.
    pub fn anchor_timestamp(&self, number: u64) -> Option<u64> {
        self.anchor
            .filter(|(n, _)| *n == number)
            .map(|(_, timestamp)| timestamp)
    }

    pub fn set_anchor(&mut self, number: u64, timestamp: u64) {
        self.anchor = Some((number, timestamp));
    }
}

impl FunnelCacheEntry for RpcCacheEntry {
    fn initialized(&self) -> bool {
        !self.tips.is_empty()
    }

    fn clear(&mut self) {
        self.tips.clear();
        self.anchor = None;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-network state of a parallel chain.
#[derive(Debug, Default, Clone)]
pub struct ParallelNetworkState {
    pub tip: Option<ChainTip>,
    /// Memo of main-chain timestamp to the last parallel position at or before it.
    pub positions: BTreeMap<u64, Option<u64>>,
    /// Position bounding presync, resolved once per run.
    pub presync_sentinel: Option<Option<u64>>,
}

#[derive(Debug, Default)]
pub struct ParallelFunnelCacheEntry {
    networks: HashMap<String, ParallelNetworkState>,
}

impl CacheKind for ParallelFunnelCacheEntry {
    const KIND: &'static str = "ParallelFunnelCacheEntry";
}

impl ParallelFunnelCacheEntry {
    pub fn network(&mut self, network: &str) -> &mut ParallelNetworkState {
        self.networks.entry(network.to_string()).or_default()
    }
}

impl ParallelNetworkState {
    /// Drop memoized positions older than `timestamp`; reads only move forward.
    pub fn prune_before(&mut self, timestamp: u64) {
        self.positions = self.positions.split_off(&timestamp);
    }
}

impl FunnelCacheEntry for ParallelFunnelCacheEntry {
    fn initialized(&self) -> bool {
        !self.networks.is_empty()
    }

    fn clear(&mut self) {
        self.networks.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Real blocks read but not yet folded into an emulated block.
#[derive(Debug, Default)]
pub struct EmulatedBlocksCacheEntry {
    /// Next emulated height the chain will be asked for.
    pub next_emulated: Option<u64>,
    /// Next real height to read from the inner stages.
    pub next_real: u64,
    /// Highest real height already folded into an emitted emulated block.
    pub last_consumed_real: Option<u64>,
    pub buffer: VecDeque<ChainData>,
}

impl CacheKind for EmulatedBlocksCacheEntry {
    const KIND: &'static str = "EmulatedBlocksCacheEntry";
}

impl FunnelCacheEntry for EmulatedBlocksCacheEntry {
    fn initialized(&self) -> bool {
        self.next_emulated.is_some()
    }

    fn clear(&mut self) {
        self.next_emulated = None;
        self.next_real = 0;
        self.last_consumed_real = None;
        self.buffer.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_lazily_created_per_kind() {
        let mut cache = FunnelCacheManager::new();
        assert!(!cache.contains(RpcCacheEntry::KIND));

        let rpc = cache.get_or_init::<RpcCacheEntry>().unwrap();
        assert!(!rpc.initialized());
        rpc.update_tip("eip155:1", 100);
        assert!(rpc.initialized());

        let parallel = cache.get_or_init::<ParallelFunnelCacheEntry>().unwrap();
        parallel.network("cardano").tip = Some(ChainTip {
            position: 5,
            timestamp: 50,
        });

        assert_eq!(
            cache.get_or_init::<RpcCacheEntry>().unwrap().tip("eip155:1"),
            Some(100)
        );
        assert!(cache.contains(ParallelFunnelCacheEntry::KIND));
    }

    #[test]
    fn test_clear_resets_every_entry() {
        let mut cache = FunnelCacheManager::new();
        cache
            .get_or_init::<RpcCacheEntry>()
            .unwrap()
            .update_tip("eip155:1", 7);
        let emulated = cache.get_or_init::<EmulatedBlocksCacheEntry>().unwrap();
        emulated.next_emulated = Some(3);
        emulated.next_real = 40;

        cache.clear();

        assert!(!cache.get_or_init::<RpcCacheEntry>().unwrap().initialized());
        let emulated = cache.get_or_init::<EmulatedBlocksCacheEntry>().unwrap();
        assert!(!emulated.initialized());
        assert_eq!(emulated.next_real, 0);
    }

    #[test]
    fn test_anchor_only_matches_its_number() {
        let mut entry = RpcCacheEntry::default();
        entry.set_anchor(9, 90);
        assert_eq!(entry.anchor_timestamp(9), Some(90));
        assert_eq!(entry.anchor_timestamp(10), None);
    }

    #[test]
    fn test_prune_keeps_newer_positions() {
        let mut state = ParallelNetworkState::default();
        state.positions.insert(10, Some(1));
        state.positions.insert(20, Some(2));
        state.positions.insert(30, None);
        state.prune_before(20);
        assert_eq!(state.positions.keys().copied().collect::<Vec<_>>(), vec![20, 30]);
    }
}
