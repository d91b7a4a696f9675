// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! State transition functions
//!
//! The STF is supplied by the game. It sees one input at a time, may read committed state
//! through the read pool, and returns the writes to apply. The engine never looks inside
//! the writes; it runs them in the block's transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use diesel::pg::Pg;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::sql_types::{BigInt, Bool, Jsonb, Nullable, Text};
use paima_funnel::SubmittedData;
use paima_pg_db::Db;
use rand_chacha::ChaCha20Rng;
use tracing::info;

/// One bound parameter of a [`SqlUpdate`].
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Bool(bool),
    Int(i64),
    Text(String),
    Json(serde_json::Value),
    OptInt(Option<i64>),
    OptText(Option<String>),
}

/// A prepared statement with positional (`$1`, `$2`, ...) parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlUpdate {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl SqlUpdate {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, param: SqlParam) -> Self {
        self.params.push(param);
        self
    }

    pub fn text(self, value: impl Into<String>) -> Self {
        self.bind(SqlParam::Text(value.into()))
    }

    pub fn int(self, value: i64) -> Self {
        self.bind(SqlParam::Int(value))
    }

    pub(crate) fn to_query(&self) -> BoxedSqlQuery<'static, Pg, SqlQuery> {
        let mut query = diesel::sql_query(self.sql.clone()).into_boxed::<Pg>();
        for param in &self.params {
            query = match param.clone() {
                SqlParam::Bool(v) => query.bind::<Bool, _>(v),
                SqlParam::Int(v) => query.bind::<BigInt, _>(v),
                SqlParam::Text(v) => query.bind::<Text, _>(v),
                SqlParam::Json(v) => query.bind::<Jsonb, _>(v),
                SqlParam::OptInt(v) => query.bind::<Nullable<BigInt>, _>(v),
                SqlParam::OptText(v) => query.bind::<Nullable<Text>, _>(v),
            };
        }
        query
    }
}

/// What the STF sees for one input.
#[derive(Debug, Clone)]
pub struct StfInput {
    pub block_height: u64,
    /// Unix seconds of the block
    pub timestamp: u64,
    pub data: SubmittedData,
}

#[derive(Debug, thiserror::Error)]
pub enum StfError {
    /// The input is rejected; the block carries on with the next one.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The block cannot be processed and its transaction is rolled back.
    #[error("{0}")]
    Fatal(String),
}

#[async_trait]
pub trait StateTransition: Send + Sync {
    async fn apply(
        &self,
        input: &StfInput,
        rng: &mut ChaCha20Rng,
        read_db: &Db,
    ) -> Result<Vec<SqlUpdate>, StfError>;
}

/// STF versions keyed by the first block height they apply to.
#[derive(Clone, Default)]
pub struct StfRouter {
    versions: BTreeMap<u64, Arc<dyn StateTransition>>,
}

impl StfRouter {
    pub fn single(stf: Arc<dyn StateTransition>) -> Self {
        Self::default().with_version(0, stf)
    }

    pub fn with_version(mut self, from_height: u64, stf: Arc<dyn StateTransition>) -> Self {
        self.versions.insert(from_height, stf);
        self
    }

    /// The latest version starting at or below `block_height`.
    pub fn route(&self, block_height: u64) -> Option<Arc<dyn StateTransition>> {
        self.versions
            .range(..=block_height)
            .next_back()
            .map(|(_, stf)| stf.clone())
    }
}

/// Accepts every input and writes nothing. Used when the node runs without game logic,
/// e.g. to index extension data.
pub struct LoggingStf;

#[async_trait]
impl StateTransition for LoggingStf {
    async fn apply(
        &self,
        input: &StfInput,
        _rng: &mut ChaCha20Rng,
        _read_db: &Db,
    ) -> Result<Vec<SqlUpdate>, StfError> {
        info!(
            "[stf] #{} input from {:?}: {}",
            input.block_height, input.data.real_address, input.data.input_data
        );
        Ok(Vec::new())
    }
}
