// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Runtime loop
//!
//! Drives the funnel and the state machine:
//! 1. presync: replay extension history from before the start block until every network
//!    reports it is finished
//! 2. sync: read blocks from the last committed height and apply them one by one
//!
//! Recoverable errors restart the loop from the last committed block after a backoff
//! delay. Fatal errors end the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use diesel_async::AsyncPgConnection;
use paima_funnel::{ChainData, FunnelChain, FunnelError, PresyncResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{SmError, SmResult};
use crate::metrics::EngineMetrics;
use crate::progress;
use crate::state_machine::StateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Cancelled,
    /// The configured stop height was committed.
    ReachedStopHeight(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// Delay between funnel reads once the node is caught up
    pub poll_interval: Duration,
    pub stop_block_height: Option<u64>,
}

pub struct Runtime {
    chain: FunnelChain,
    state_machine: Arc<StateMachine>,
    options: RuntimeOptions,
    metrics: EngineMetrics,
    cancel: CancellationToken,
}

enum Step {
    Continue,
    Exit(RunExit),
}

/// Delay sequence between loop restarts: 0.4s doubling up to 30s, never giving up.
pub fn restart_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: Duration::from_millis(400),
        initial_interval: Duration::from_millis(400),
        randomization_factor: 0.1,
        multiplier: 2.0,
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Whether `block_height` lies past the configured stop height.
pub fn past_stop_height(stop_block_height: Option<u64>, block_height: u64) -> bool {
    matches!(stop_block_height, Some(stop) if block_height > stop)
}

/// The funnel hands out gap-free runs. Anything else means its cache is stale.
fn check_contiguous(expected: u64, block: &ChainData) -> SmResult<()> {
    if block.block_number != expected {
        return Err(FunnelError::InvalidResponse(format!(
            "expected block #{} from the funnel, got #{}",
            expected, block.block_number
        ))
        .into());
    }
    Ok(())
}

impl Runtime {
    pub fn new(
        chain: FunnelChain,
        state_machine: Arc<StateMachine>,
        options: RuntimeOptions,
        metrics: EngineMetrics,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            chain,
            state_machine,
            options,
            metrics,
            cancel,
        }
    }

    pub async fn run(mut self) -> SmResult<RunExit> {
        info!("[runtime] funnel stages: {:?}", self.chain.stage_names());
        let mut backoff = restart_backoff();

        loop {
            if self.cancel.is_cancelled() {
                return Ok(RunExit::Cancelled);
            }
            match self.presync_step().await {
                Ok(true) => break,
                Ok(false) => backoff.reset(),
                Err(e) => {
                    if !self.recover(e, &mut backoff).await? {
                        return Ok(RunExit::Cancelled);
                    }
                }
            }
        }
        info!("[runtime] presync finished");

        let mut next = None;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(RunExit::Cancelled);
            }
            let block_height = match next {
                Some(h) => h,
                None => match self.resume().await {
                    Ok(h) => h,
                    Err(e) => {
                        if !self.recover(e, &mut backoff).await? {
                            return Ok(RunExit::Cancelled);
                        }
                        continue;
                    }
                },
            };
            if past_stop_height(self.options.stop_block_height, block_height) {
                let stop = block_height - 1;
                info!("[runtime] reached stop block #{}", stop);
                return Ok(RunExit::ReachedStopHeight(stop));
            }

            match self.sync_step(block_height).await {
                Ok((resume_at, Step::Continue)) => {
                    backoff.reset();
                    next = resume_at;
                }
                Ok((_, Step::Exit(exit))) => return Ok(exit),
                Err(e) => {
                    next = None;
                    if !self.recover(e, &mut backoff).await? {
                        return Ok(RunExit::Cancelled);
                    }
                }
            }
        }
    }

    /// Next height to hand to the funnel, from committed progress.
    async fn resume(&mut self) -> SmResult<u64> {
        let point = {
            let mut pooled = self
                .state_machine
                .db()
                .connect()
                .await
                .map_err(SmError::db)?;
            let conn: &mut AsyncPgConnection = &mut pooled;
            progress::resume_point(
                conn,
                self.chain.initial_block_height(),
                self.chain.start_block_height(),
                self.chain.is_emulated(),
            )
            .await?
        };
        self.chain.clear_cache();
        self.chain
            .resume_emulated(point.next_block_height, point.next_real_block_height)?;
        Ok(point.next_block_height)
    }

    /// One presync read across all networks. Returns true once every network is done.
    async fn presync_step(&mut self) -> SmResult<bool> {
        let state = {
            let mut pooled = self
                .state_machine
                .db()
                .connect()
                .await
                .map_err(SmError::db)?;
            let conn: &mut AsyncPgConnection = &mut pooled;
            progress::load_presync_state(conn).await?
        };

        let started = Instant::now();
        let results = self.chain.read_presync_data(&state).await?;
        self.metrics
            .funnel_read_latency
            .with_label_values(&["presync"])
            .observe(started.elapsed().as_secs_f64());

        if results.iter().all(PresyncResult::is_finished) {
            return Ok(true);
        }
        let mut registered = false;
        for result in results {
            if let PresyncResult::Data(data) = result {
                let new_extensions = self.state_machine.process_presync(&data).await?;
                registered |= !new_extensions.is_empty();
            }
        }
        if registered {
            debug!("[runtime] presync registered new extensions, clearing funnel cache");
            self.chain.clear_cache();
        }
        Ok(false)
    }

    /// Read and apply one batch starting at `block_height`.
    ///
    /// Returns where to continue: `Some(h)` to keep reading from `h`, `None` to resume from
    /// committed progress with a fresh cache.
    async fn sync_step(&mut self, block_height: u64) -> SmResult<(Option<u64>, Step)> {
        let started = Instant::now();
        let blocks = self.chain.read_data(block_height).await?;
        self.metrics
            .funnel_read_latency
            .with_label_values(&["sync"])
            .observe(started.elapsed().as_secs_f64());

        if blocks.is_empty() {
            if !self.wait(self.options.poll_interval).await {
                return Ok((None, Step::Exit(RunExit::Cancelled)));
            }
            return Ok((Some(block_height), Step::Continue));
        }

        let mut next = block_height;
        for block in &blocks {
            if past_stop_height(self.options.stop_block_height, block.block_number) {
                break;
            }
            check_contiguous(next, block)?;
            let outcome = self.state_machine.process_block(block).await?;
            next = block.block_number + 1;
            if !outcome.new_extensions.is_empty() {
                info!(
                    "[runtime] block #{} registered {} extensions, re-reading from #{}",
                    block.block_number,
                    outcome.new_extensions.len(),
                    next
                );
                return Ok((None, Step::Continue));
            }
            if self.cancel.is_cancelled() {
                return Ok((Some(next), Step::Exit(RunExit::Cancelled)));
            }
        }
        Ok((Some(next), Step::Continue))
    }

    /// Log and count `e`, wait out the backoff delay and drop cached funnel state.
    /// Returns false when cancelled while waiting.
    async fn recover(&mut self, e: SmError, backoff: &mut ExponentialBackoff) -> SmResult<bool> {
        self.metrics
            .funnel_errors
            .with_label_values(&[e.kind()])
            .inc();
        if e.is_fatal() {
            error!("[runtime] fatal error, stopping: {}", e);
            return Err(e);
        }
        let delay = backoff
            .next_backoff()
            .unwrap_or_else(|| restart_backoff().max_interval);
        warn!(
            "[runtime] {} error: {}, restarting from last committed block in {:?}",
            e.kind(),
            e,
            delay
        );
        self.metrics.loop_restarts.inc();
        self.chain.clear_cache();
        Ok(self.wait(delay).await)
    }

    /// Sleep unless cancelled first. Returns false when cancelled.
    async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}


#[cfg(test)]
mod db_tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use paima_funnel::cde::CdeRegistry;
    use paima_funnel::stages::{CdeAggregateStage, MainBlockStage};
    use paima_funnel::sources::BlockSource;
    use paima_funnel::{BlockHeader, FunnelResult, SubmittedData, InputOrigin};
    use paima_pg_db::{Db, DbArgs};
    use paima_schema::MIGRATIONS;
    use url::Url;

    use crate::config::RandomnessConfig;
    use crate::randomness::RandomnessSource;
    use crate::stf::{LoggingStf, StfRouter};

    const NETWORK: &str = "eip155:31337";

    /// Main chain of fixed blocks, each carrying one input.
    struct FixedChain {
        blocks: u64,
        tip: AtomicU64,
    }

    impl FixedChain {
        fn header(&self, number: u64) -> BlockHeader {
            let mut hash = [0u8; 32];
            hash[24..].copy_from_slice(&number.to_be_bytes());
            BlockHeader {
                number,
                timestamp: 1_700_000_000 + number * 2,
                hash,
            }
        }
    }

    #[async_trait]
    impl BlockSource for FixedChain {
        fn network(&self) -> &str {
            NETWORK
        }

        async fn confirmed_tip(&self) -> FunnelResult<u64> {
            Ok(self.tip.load(Ordering::SeqCst))
        }

        async fn block_header(&self, number: u64) -> FunnelResult<BlockHeader> {
            if number >= self.blocks {
                return Err(FunnelError::BlockNotFound(number));
            }
            Ok(self.header(number))
        }

        async fn fetch_blocks(&self, from: u64, to: u64) -> FunnelResult<Vec<ChainData>> {
            let mut out = Vec::new();
            for n in from..=to {
                let mut data = ChainData::from_header(&self.block_header(n).await?, NETWORK);
                data.submitted_data = vec![SubmittedData {
                    real_address: Some("0x00000000000000000000000000000000000000a1".into()),
                    input_data: format!("tick|{}", n),
                    input_nonce: format!("nonce-{}", n),
                    supplied_value: "0".into(),
                    scheduled: false,
                    origin: InputOrigin::default(),
                }];
                out.push(data);
            }
            Ok(out)
        }
    }

    async fn state_machine() -> Arc<StateMachine> {
        let url: Url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL environment variable must be set")
            .parse()
            .expect("Invalid database URL format");
        paima_pg_db::reset_database(url.clone(), DbArgs::default(), Some(&MIGRATIONS))
            .await
            .unwrap();
        let db = Db::for_write(url.clone(), DbArgs::default()).await.unwrap();
        let read_db = Db::for_read(url, DbArgs::default()).await.unwrap();
        Arc::new(StateMachine::new(
            db,
            read_db,
            StfRouter::single(Arc::new(LoggingStf)),
            RandomnessSource::new(RandomnessConfig::default()),
            CdeRegistry::default().shared(),
            EngineMetrics::new_for_testing(),
        ))
    }

    fn runtime(sm: Arc<StateMachine>, stop: u64) -> Runtime {
        let source = Arc::new(FixedChain {
            blocks: 20,
            tip: AtomicU64::new(19),
        });
        let chain = FunnelChain::new(
            MainBlockStage::new(source, NETWORK, 4),
            vec![],
            CdeAggregateStage::new(None, "evmMain"),
            sm.registry().clone(),
            2,
        );
        Runtime::new(
            chain,
            sm,
            RuntimeOptions {
                poll_interval: Duration::from_millis(10),
                stop_block_height: Some(stop),
            },
            EngineMetrics::new_for_testing(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    #[serial_test::serial]
    async fn test_sync_stops_at_stop_height_and_resumes() {
        let sm = state_machine().await;

        let exit = runtime(sm.clone(), 9).run().await.unwrap();
        assert_eq!(exit, RunExit::ReachedStopHeight(9));
        assert_eq!(sm.latest_processed_block_height().await.unwrap(), Some(9));

        // A restart picks up after the last committed block.
        let exit = runtime(sm.clone(), 13).run().await.unwrap();
        assert_eq!(exit, RunExit::ReachedStopHeight(13));
        assert_eq!(sm.latest_processed_block_height().await.unwrap(), Some(13));
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    #[serial_test::serial]
    async fn test_cancel_stops_waiting_runtime() {
        let sm = state_machine().await;
        let rt = runtime(sm.clone(), 1_000);
        let cancel = rt.cancel.clone();
        let handle = tokio::spawn(rt.run());
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, RunExit::Cancelled);
        assert_eq!(sm.latest_processed_block_height().await.unwrap(), Some(19));
    }
}
