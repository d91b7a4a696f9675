// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;
use tracing::debug;

/// Error type for funnel reads
#[derive(Debug, Clone, thiserror::Error)]
pub enum FunnelError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Funnel timeout: {0}")]
    Timeout(String),

    #[error("Block not found: {0}")]
    BlockNotFound(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Indexer error: {0}")]
    Indexer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl FunnelError {
    /// Whether the runtime loop should retry after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FunnelError::Rpc(_)
                | FunnelError::Timeout(_)
                | FunnelError::BlockNotFound(_)
                | FunnelError::Indexer(_)
                | FunnelError::InvalidResponse(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FunnelError::Timeout(_))
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            FunnelError::Rpc(_) => "rpc",
            FunnelError::Timeout(_) => "timeout",
            FunnelError::BlockNotFound(_) => "block_not_found",
            FunnelError::InvalidResponse(_) => "invalid_response",
            FunnelError::Indexer(_) => "indexer",
            FunnelError::Config(_) => "config",
            FunnelError::Other(_) => "other",
        }
    }
}

impl From<ethers::providers::ProviderError> for FunnelError {
    fn from(e: ethers::providers::ProviderError) -> Self {
        FunnelError::Rpc(e.to_string())
    }
}

impl From<reqwest::Error> for FunnelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FunnelError::Timeout(e.to_string())
        } else if e.is_decode() {
            FunnelError::InvalidResponse(e.to_string())
        } else {
            FunnelError::Indexer(e.to_string())
        }
    }
}

pub type FunnelResult<T> = Result<T, FunnelError>;

/// Default timeout applied to every network call made by a funnel.
pub const DEFAULT_FUNNEL_TIMEOUT: Duration = Duration::from_secs(40);

/// Run `fut`, failing with [`FunnelError::Timeout`] once `duration` elapses.
pub async fn with_timeout<T, F>(duration: Duration, what: &str, fut: F) -> FunnelResult<T>
where
    F: Future<Output = FunnelResult<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(FunnelError::Timeout(format!(
            "{} did not complete within {:?}",
            what, duration
        ))),
    }
}

/// Retry `op` while it fails with a recoverable error, giving up after `max_elapsed`.
///
/// Delays start at 0.4s and double up to 2 minutes, with 10% jitter. Errors that are
/// not recoverable are returned on the first attempt.
pub async fn retry_recoverable<T, F, Fut>(
    what: &str,
    max_elapsed: Duration,
    mut op: F,
) -> FunnelResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FunnelResult<T>>,
{
    let policy = ExponentialBackoff {
        current_interval: Duration::from_millis(400),
        initial_interval: Duration::from_millis(400),
        randomization_factor: 0.1,
        multiplier: 2.0,
        max_interval: Duration::from_secs(120),
        max_elapsed_time: Some(max_elapsed),
        ..Default::default()
    };
    backoff::future::retry(policy, || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e| {
                if e.is_recoverable() {
                    debug!("[funnel] {} failed, retrying: {}", what, e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}
