// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! In-memory sources for stage and chain tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cde::{CdeDatum, CdeDatumPayload, ChainDataExtension, ExtensionConfig, ExtensionKind};
use crate::error::{FunnelError, FunnelResult};
use crate::sources::{presync_window, BlockSource, ParallelData, ParallelSource};
use crate::types::{
    BlockHeader, ChainData, ChainTip, InputOrigin, PresyncChainData, PresyncResult, PresyncState,
    SubmittedData,
};

pub const MAIN_NETWORK: &str = "eip155:31337";

pub fn header(number: u64, timestamp: u64) -> BlockHeader {
    let mut hash = [0u8; 32];
    hash[24..].copy_from_slice(&number.to_be_bytes());
    BlockHeader {
        number,
        timestamp,
        hash,
    }
}

pub fn input(data: &str) -> SubmittedData {
    SubmittedData {
        real_address: Some("0xabc".into()),
        input_data: data.into(),
        input_nonce: format!("nonce-{}", data),
        supplied_value: "0".into(),
        scheduled: false,
        origin: InputOrigin::default(),
    }
}

pub fn extension(cde_id: u32, name: &str, network: &str, start: u64) -> ChainDataExtension {
    ChainDataExtension {
        cde_id,
        config: ExtensionConfig {
            name: name.into(),
            network: network.into(),
            start_block_height: start,
            scheduled_prefix: Some(name.into()),
            kind: ExtensionKind::Generic {
                contract_address: "0x01".into(),
                event_abi: serde_json::Value::Null,
            },
        },
    }
}

pub fn datum(extension: &ChainDataExtension, position: u64, tag: &str) -> CdeDatum {
    extension.new_datum(
        position,
        CdeDatumPayload::Generic {
            data: serde_json::json!(tag),
        },
    )
}

/// Main chain with fixed blocks; the tip can be moved forward by tests.
pub struct MockBlockSource {
    pub headers: Vec<BlockHeader>,
    pub inputs: BTreeMap<u64, Vec<SubmittedData>>,
    pub tip: AtomicU64,
    pub fail_at: Option<u64>,
    pub header_calls: AtomicU64,
}

impl MockBlockSource {
    /// Blocks numbered from 0 with the given timestamps.
    pub fn with_timestamps(timestamps: &[u64]) -> Self {
        let headers: Vec<BlockHeader> = timestamps
            .iter()
            .enumerate()
            .map(|(i, ts)| header(i as u64, *ts))
            .collect();
        let tip = headers.len().saturating_sub(1) as u64;
        Self {
            headers,
            inputs: BTreeMap::new(),
            tip: AtomicU64::new(tip),
            fail_at: None,
            header_calls: AtomicU64::new(0),
        }
    }

    pub fn set_tip(&self, tip: u64) {
        self.tip.store(tip, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlockSource for MockBlockSource {
    fn network(&self) -> &str {
        MAIN_NETWORK
    }

    async fn confirmed_tip(&self) -> FunnelResult<u64> {
        Ok(self.tip.load(Ordering::SeqCst))
    }

    async fn block_header(&self, number: u64) -> FunnelResult<BlockHeader> {
        self.header_calls.fetch_add(1, Ordering::SeqCst);
        self.headers
            .get(number as usize)
            .copied()
            .ok_or(FunnelError::BlockNotFound(number))
    }

    async fn fetch_blocks(&self, from: u64, to: u64) -> FunnelResult<Vec<ChainData>> {
        let mut out = Vec::new();
        for n in from..=to {
            if Some(n) == self.fail_at {
                if out.is_empty() {
                    return Err(FunnelError::Rpc(format!("block {} unavailable", n)));
                }
                break;
            }
            let header = self
                .headers
                .get(n as usize)
                .ok_or(FunnelError::BlockNotFound(n))?;
            let mut data = ChainData::from_header(header, MAIN_NETWORK);
            data.submitted_data = self.inputs.get(&n).cloned().unwrap_or_default();
            out.push(data);
        }
        Ok(out)
    }
}

/// Secondary network whose positions have fixed timestamps.
pub struct MockParallelSource {
    pub name: String,
    /// Timestamp of each position, position = index
    pub timestamps: Vec<u64>,
    pub tip: Mutex<ChainTip>,
    pub datums: Vec<CdeDatum>,
    pub submitted: Vec<(u64, SubmittedData)>,
    pub reads: Mutex<Vec<(u64, u64)>>,
}

impl MockParallelSource {
    pub fn new(name: &str, timestamps: &[u64]) -> Self {
        let last = timestamps.len().saturating_sub(1);
        Self {
            name: name.into(),
            timestamps: timestamps.to_vec(),
            tip: Mutex::new(ChainTip {
                position: last as u64,
                timestamp: timestamps.get(last).copied().unwrap_or_default(),
            }),
            datums: Vec::new(),
            submitted: Vec::new(),
            reads: Mutex::new(Vec::new()),
        }
    }

    pub fn set_tip(&self, position: u64) {
        if let Ok(mut tip) = self.tip.lock() {
            *tip = ChainTip {
                position,
                timestamp: self.timestamps[position as usize],
            };
        }
    }

    pub fn reads(&self) -> Vec<(u64, u64)> {
        self.reads.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ParallelSource for MockParallelSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn network(&self) -> &str {
        "mock:parallel"
    }

    async fn tip(&self) -> FunnelResult<ChainTip> {
        self.tip
            .lock()
            .map(|t| *t)
            .map_err(|_| FunnelError::Other("poisoned".into()))
    }

    async fn position_at(&self, timestamp: u64) -> FunnelResult<Option<u64>> {
        Ok(self
            .timestamps
            .iter()
            .rposition(|ts| *ts <= timestamp)
            .map(|p| p as u64))
    }

    async fn read_parallel_data(
        &self,
        extensions: &[ChainDataExtension],
        from: u64,
        to: u64,
    ) -> FunnelResult<ParallelData> {
        if let Ok(mut reads) = self.reads.lock() {
            reads.push((from, to));
        }
        let names: Vec<&str> = extensions.iter().map(|e| e.name()).collect();
        Ok(ParallelData {
            datums: self
                .datums
                .iter()
                .filter(|d| (from..=to).contains(&d.source_position))
                .filter(|d| names.contains(&d.cde_name.as_str()))
                .cloned()
                .collect(),
            submitted: self
                .submitted
                .iter()
                .filter(|(p, _)| (from..=to).contains(p))
                .cloned()
                .collect(),
        })
    }

    async fn read_presync(
        &self,
        extensions: &[ChainDataExtension],
        sentinel: u64,
        state: &PresyncState,
    ) -> FunnelResult<PresyncResult> {
        let Some((from, to)) = presync_window(&self.name, extensions, sentinel, state, 10) else {
            return Ok(PresyncResult::Finished);
        };
        Ok(PresyncResult::Data(PresyncChainData {
            network: self.name.clone(),
            to_position: Some(to),
            extension_datums: self.read_parallel_data(extensions, from, to).await?.datums,
            cursors: Vec::new(),
        }))
    }
}
