// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const FINE_GRAINED_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.15, 0.2, 0.25, 0.3, 0.35, 0.4, 0.45, 0.5, 0.6, 0.7, 0.8, 0.9,
    1.0, 1.2, 1.4, 1.6, 1.8, 2.0, 2.5, 3.0, 3.5, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10., 15., 20., 25.,
    30., 40., 50., 60.,
];

#[derive(Clone, Debug)]
pub struct EngineMetrics {
    pub(crate) latest_processed_block: IntGauge,
    pub(crate) blocks_processed: IntCounter,
    pub(crate) inputs_processed: IntCounterVec,
    pub(crate) inputs_rejected: IntCounterVec,
    pub(crate) funnel_errors: IntCounterVec,
    pub(crate) funnel_read_latency: HistogramVec,
    pub(crate) loop_restarts: IntCounter,
    pub(crate) presync_datums: IntCounterVec,
}

impl EngineMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            latest_processed_block: register_int_gauge_with_registry!(
                "paima_latest_processed_block_height",
                "Highest block committed with done = true",
                registry,
            )?,
            blocks_processed: register_int_counter_with_registry!(
                "paima_blocks_processed",
                "Total number of blocks committed by the state machine",
                registry,
            )?,
            inputs_processed: register_int_counter_vec_with_registry!(
                "paima_inputs_processed",
                "Total number of inputs applied, by kind",
                &["kind"],
                registry,
            )?,
            inputs_rejected: register_int_counter_vec_with_registry!(
                "paima_inputs_rejected",
                "Total number of inputs skipped, by reason",
                &["reason"],
                registry,
            )?,
            funnel_errors: register_int_counter_vec_with_registry!(
                "paima_funnel_errors",
                "Total number of runtime loop errors, by kind",
                &["kind"],
                registry,
            )?,
            funnel_read_latency: register_histogram_vec_with_registry!(
                "paima_funnel_read_latency",
                "Latency of one funnel read in seconds",
                &["phase"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )?,
            loop_restarts: register_int_counter_with_registry!(
                "paima_loop_restarts",
                "Total number of runtime loop restarts after an error",
                registry,
            )?,
            presync_datums: register_int_counter_vec_with_registry!(
                "paima_presync_datums",
                "Total number of extension datums applied during presync, by network",
                &["network"],
                registry,
            )?,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry).expect("metrics register on a fresh registry")
    }
}

#[derive(Clone)]
struct MetricsState {
    registry: Registry,
}

async fn metrics_handler(State(state): State<MetricsState>) -> (StatusCode, String) {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    match encoder.encode(&state.registry.gather(), &mut buffer) {
        Ok(()) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

pub fn metrics_router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(MetricsState { registry })
}

/// Serve `/metrics` and `/health` until `cancel` fires.
pub async fn start_metrics_server(
    address: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("[metrics] listening on {}", address);
    let router = metrics_router(registry);
    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("[metrics] server error: {:?}", e);
        }
    }))
}
