// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

use diesel::{Insertable, Queryable, Selectable};
use serde::{Deserialize, Serialize};

use crate::schema::{
    block_heights, cde_config, cde_dynamic_primitive_config, cde_tracking, cde_tracking_cursor,
    emulated_block_heights, nonces, scheduled_data,
};

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = block_heights, check_for_backend(diesel::pg::Pg))]
pub struct BlockHeight {
    pub block_height: i64,
    pub seed: String,
    pub done: bool,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = nonces, check_for_backend(diesel::pg::Pg))]
pub struct Nonce {
    pub nonce: String,
    pub block_height: i64,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = scheduled_data, check_for_backend(diesel::pg::Pg))]
pub struct ScheduledData {
    pub id: i64,
    pub block_height: Option<i64>,
    pub future_ms_timestamp: Option<i64>,
    pub input_data: String,
    pub cde_name: Option<String>,
    pub tx_hash: Option<String>,
    pub network: Option<String>,
    pub contract_address: Option<String>,
}

/// A timer row before the database assigns it an id.
#[derive(Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = scheduled_data)]
pub struct NewScheduledData {
    pub block_height: Option<i64>,
    pub future_ms_timestamp: Option<i64>,
    pub input_data: String,
    pub cde_name: Option<String>,
    pub tx_hash: Option<String>,
    pub network: Option<String>,
    pub contract_address: Option<String>,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = emulated_block_heights, check_for_backend(diesel::pg::Pg))]
pub struct EmulatedBlockHeight {
    pub emulated_block_height: i64,
    pub deployment_chain_block_height: i64,
    pub second: i64,
}

#[derive(
    Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
)]
#[diesel(table_name = cde_config, check_for_backend(diesel::pg::Pg))]
pub struct CdeConfigRow {
    pub cde_id: i32,
    pub cde_name: String,
    pub cde_type: String,
    pub network: String,
    pub config_hash: String,
    pub start_block_height: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = cde_tracking, check_for_backend(diesel::pg::Pg))]
pub struct CdeTracking {
    pub network: String,
    pub block_height: i64,
    pub datum_count: i32,
    pub done: bool,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = cde_tracking_cursor, check_for_backend(diesel::pg::Pg))]
pub struct CdeTrackingCursor {
    pub cde_name: String,
    pub cursor: String,
    pub finished: bool,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = cde_dynamic_primitive_config, check_for_backend(diesel::pg::Pg))]
pub struct DynamicPrimitiveConfig {
    pub cde_name: String,
    pub cde_id: i32,
    pub parent_name: String,
    pub config: serde_json::Value,
    pub block_height: i64,
}
