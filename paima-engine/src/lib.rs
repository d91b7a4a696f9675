// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0
pub mod cde_processing;
pub mod config;
pub mod error;
pub mod metrics;
pub mod node;
pub mod progress;
pub mod randomness;
pub mod runtime;
pub mod scheduled;
pub mod state_machine;
pub mod stf;
