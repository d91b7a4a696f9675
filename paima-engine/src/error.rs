// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

use paima_funnel::FunnelError;

use crate::stf::StfError;

/// Error type for the state machine and runtime loop
#[derive(Debug, thiserror::Error)]
pub enum SmError {
    #[error("Database error: {0}")]
    Db(String),

    #[error(transparent)]
    Funnel(#[from] FunnelError),

    #[error("STF error: {0}")]
    Stf(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl SmError {
    /// Whether the runtime loop must exit instead of restarting from the last committed block.
    pub fn is_fatal(&self) -> bool {
        match self {
            SmError::Config(_) | SmError::Fatal(_) => true,
            SmError::Funnel(e) => !e.is_recoverable(),
            SmError::Db(_) | SmError::Stf(_) => false,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SmError::Db(_) => "db",
            SmError::Funnel(e) => e.kind(),
            SmError::Stf(_) => "stf",
            SmError::Config(_) => "config",
            SmError::Fatal(_) => "fatal",
        }
    }

    pub fn db(e: impl std::fmt::Display) -> Self {
        SmError::Db(e.to_string())
    }
}

impl From<diesel::result::Error> for SmError {
    fn from(e: diesel::result::Error) -> Self {
        SmError::Db(e.to_string())
    }
}

impl From<StfError> for SmError {
    fn from(e: StfError) -> Self {
        SmError::Stf(e.to_string())
    }
}

pub type SmResult<T> = Result<T, SmError>;
