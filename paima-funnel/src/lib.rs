// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Paima funnel
//!
//! Reads the main chain and every configured secondary network and turns them into one
//! ordered, gap-free stream of [`ChainData`] blocks for the game state machine.

pub mod batch;
pub mod cache;
pub mod cde;
pub mod chain;
pub mod config;
pub mod error;
pub mod input;
pub mod sources;
pub mod stages;
pub mod types;

pub use chain::FunnelChain;
pub use error::{retry_recoverable, FunnelError, FunnelResult};
pub use types::{
    BlockHeader, ChainData, CursorState, CursorUpdate, EmulatedBlockInfo, InputOrigin,
    PresyncChainData, PresyncResult, PresyncState, SubmittedData,
};
