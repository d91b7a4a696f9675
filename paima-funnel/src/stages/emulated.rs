// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Emulated blocks
//!
//! Real blocks are re-bucketed into fixed-duration blocks: emulated block `E` covers
//! `[start + E * block_time, start + (E + 1) * block_time)` and takes every real block whose
//! timestamp falls in that window (earlier blocks fall into block 0). `E` is emitted only
//! once a real block at or past the end of its window has been read, so no confirmed real
//! block can still arrive for it.

use ethers::utils::keccak256;
use tracing::debug;

use crate::cache::EmulatedBlocksCacheEntry;
use crate::error::{FunnelError, FunnelResult};
use crate::types::{ChainData, EmulatedBlockInfo};

#[derive(Debug, Clone)]
pub struct EmulatedStage {
    block_time_secs: u64,
    start_timestamp: u64,
    network: String,
}

impl EmulatedStage {
    pub fn new(block_time_secs: u64, start_timestamp: u64, network: &str) -> FunnelResult<Self> {
        if block_time_secs == 0 {
            return Err(FunnelError::Config(
                "emulated block time must be positive".to_string(),
            ));
        }
        Ok(Self {
            block_time_secs,
            start_timestamp,
            network: network.to_string(),
        })
    }

    pub fn block_time_secs(&self) -> u64 {
        self.block_time_secs
    }

    pub fn start_timestamp(&self) -> u64 {
        self.start_timestamp
    }

    /// Emulated height containing `timestamp`.
    pub fn emulated_height(&self, timestamp: u64) -> u64 {
        timestamp.saturating_sub(self.start_timestamp) / self.block_time_secs
    }

    fn window_start(&self, height: u64) -> u64 {
        self.start_timestamp + height * self.block_time_secs
    }

    /// Emit every emulated block whose window is closed by the buffered real blocks.
    pub fn drain(&self, entry: &mut EmulatedBlocksCacheEntry) -> FunnelResult<Vec<ChainData>> {
        let mut next = entry
            .next_emulated
            .ok_or_else(|| FunnelError::Config("emulated funnel not resumed".to_string()))?;
        let mut emitted = Vec::new();
        loop {
            let window_end = self.window_start(next + 1);
            let closed = entry
                .buffer
                .back()
                .is_some_and(|latest| latest.timestamp >= window_end);
            if !closed {
                break;
            }
            let mut members = Vec::new();
            while entry
                .buffer
                .front()
                .is_some_and(|b| b.timestamp < window_end)
            {
                if let Some(block) = entry.buffer.pop_front() {
                    members.push(block);
                }
            }
            if let Some(last) = members.last() {
                entry.last_consumed_real = Some(last.block_number);
            }
            emitted.push(self.merge(next, members, entry.last_consumed_real.unwrap_or(0)));
            next += 1;
        }
        entry.next_emulated = Some(next);
        Ok(emitted)
    }

    /// Build emulated block `height` from its real members.
    pub fn merge(&self, height: u64, members: Vec<ChainData>, deployment_height: u64) -> ChainData {
        let mut preimage = height.to_be_bytes().to_vec();
        for member in &members {
            preimage.extend_from_slice(member.block_hash.as_bytes());
        }
        let mut block = ChainData {
            block_number: height,
            timestamp: self.window_start(height),
            block_hash: format!("0x{}", hex::encode(keccak256(preimage))),
            network: self.network.clone(),
            submitted_data: Vec::new(),
            extension_datums: Vec::new(),
            emulated: Some(EmulatedBlockInfo {
                deployment_chain_block_height: deployment_height,
            }),
        };
        debug!(
            "[emulated] block #{} from {} real blocks",
            height,
            members.len()
        );
        for member in members {
            block.submitted_data.extend(member.submitted_data);
            block
                .extension_datums
                .extend(member.extension_datums.into_iter().map(|mut d| {
                    d.block_number = height;
                    d
                }));
        }
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{datum, extension, header, input, MAIN_NETWORK};

    fn real(number: u64, timestamp: u64) -> ChainData {
        ChainData::from_header(&header(number, timestamp), MAIN_NETWORK)
    }

    fn entry(next_emulated: u64) -> EmulatedBlocksCacheEntry {
        EmulatedBlocksCacheEntry {
            next_emulated: Some(next_emulated),
            ..Default::default()
        }
    }

    #[test]
    fn test_emulated_height() {
        let stage = EmulatedStage::new(50, 100, "emulated").unwrap();
        assert_eq!(stage.emulated_height(40), 0);
        assert_eq!(stage.emulated_height(149), 0);
        assert_eq!(stage.emulated_height(150), 1);
        assert_eq!(stage.emulated_height(260), 3);
    }

    #[test]
    fn test_windows_close_only_when_a_later_block_arrives() {
        let stage = EmulatedStage::new(50, 100, "emulated").unwrap();
        let mut entry = entry(0);
        let mut first = real(10, 100);
        first.submitted_data.push(input("a"));
        let mut second = real(11, 150);
        let ext = extension(0, "ext", "main", 0);
        second.extension_datums.push(datum(&ext, 11, "d"));
        entry.buffer.extend([first, second, real(12, 260)]);

        let blocks = stage.drain(&mut entry).unwrap();
        let summary: Vec<(u64, u64, usize, u64)> = blocks
            .iter()
            .map(|b| {
                (
                    b.block_number,
                    b.timestamp,
                    b.submitted_data.len() + b.extension_datums.len(),
                    b.emulated.map(|e| e.deployment_chain_block_height).unwrap(),
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![(0, 100, 1, 10), (1, 150, 1, 11), (2, 200, 0, 11)]
        );
        assert_eq!(blocks[1].extension_datums[0].block_number, 1);
        assert_eq!(entry.next_emulated, Some(3));
        assert_eq!(entry.buffer.len(), 1);

        // block 3 waits for a real block at or after 300
        assert!(stage.drain(&mut entry).unwrap().is_empty());
        entry.buffer.push_back(real(13, 300));
        let blocks = stage.drain(&mut entry).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_number, 3);
        assert_eq!(
            blocks[0].emulated.map(|e| e.deployment_chain_block_height),
            Some(12)
        );
    }

    #[test]
    fn test_hundred_second_blocks_over_three_real_blocks() {
        let stage = EmulatedStage::new(100, 100, "emulated").unwrap();
        let mut entry = entry(0);
        let mut a = real(1, 100);
        a.submitted_data.push(input("a"));
        let mut b = real(2, 150);
        b.submitted_data.push(input("b"));
        let mut c = real(3, 260);
        c.submitted_data.push(input("c"));

        entry.buffer.extend([a, b]);
        assert!(stage.drain(&mut entry).unwrap().is_empty());

        entry.buffer.push_back(c);
        let blocks = stage.drain(&mut entry).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_number, 0);
        assert_eq!(blocks[0].timestamp, 100);
        let data: Vec<&str> = blocks[0]
            .submitted_data
            .iter()
            .map(|d| d.input_data.as_str())
            .collect();
        assert_eq!(data, vec!["a", "b"]);
        assert_eq!(
            blocks[0].emulated.map(|e| e.deployment_chain_block_height),
            Some(2)
        );

        // the 260 block stays buffered until a block closes [200, 300)
        assert!(stage.drain(&mut entry).unwrap().is_empty());
        entry.buffer.push_back(real(4, 300));
        let blocks = stage.drain(&mut entry).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_number, 1);
        assert_eq!(blocks[0].timestamp, 200);
        assert_eq!(blocks[0].submitted_data[0].input_data, "c");
        assert_eq!(
            blocks[0].emulated.map(|e| e.deployment_chain_block_height),
            Some(3)
        );
        assert_eq!(entry.next_emulated, Some(2));
    }

    #[test]
    fn test_blocks_before_start_fold_into_block_zero() {
        let stage = EmulatedStage::new(10, 1000, "emulated").unwrap();
        let mut entry = entry(0);
        entry.buffer.extend([real(1, 990), real(2, 1005), real(3, 1010)]);
        let blocks = stage.drain(&mut entry).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(
            blocks[0].emulated.map(|e| e.deployment_chain_block_height),
            Some(2)
        );
    }

    #[test]
    fn test_drain_requires_resume() {
        let stage = EmulatedStage::new(10, 0, "emulated").unwrap();
        let mut entry = EmulatedBlocksCacheEntry::default();
        assert!(matches!(
            stage.drain(&mut entry),
            Err(FunnelError::Config(_))
        ));
        assert!(EmulatedStage::new(0, 0, "emulated").is_err());
    }

    #[test]
    fn test_hash_depends_on_members() {
        let stage = EmulatedStage::new(10, 0, "emulated").unwrap();
        let a = stage.merge(4, vec![real(1, 40)], 1);
        let b = stage.merge(4, vec![real(2, 40)], 2);
        let c = stage.merge(4, vec![real(1, 40)], 1);
        assert_ne!(a.block_hash, b.block_hash);
        assert_eq!(a.block_hash, c.block_hash);
    }
}
