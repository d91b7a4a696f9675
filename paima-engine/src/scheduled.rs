// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Scheduled inputs
//!
//! Timers are rows of `scheduled_data` keyed either by block height or by a millisecond
//! timestamp. A block runs every timer at or below its height or time, in insertion order,
//! and deletes each one in the same transaction.

use diesel::{BoolExpressionMethods, ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use paima_funnel::{InputOrigin, SubmittedData};
use paima_schema::models::{NewScheduledData, ScheduledData};
use paima_schema::schema::scheduled_data;

use crate::error::SmResult;
use crate::stf::{SqlParam, SqlUpdate};

/// Write for an STF that wants `input_data` to run at `block_height`.
pub fn schedule_at_height(block_height: u64, input_data: &str) -> SqlUpdate {
    SqlUpdate::new("INSERT INTO scheduled_data (block_height, input_data) VALUES ($1, $2)")
        .int(block_height as i64)
        .text(input_data)
}

/// Write for an STF that wants `input_data` to run in the first block at or after `ms`.
pub fn schedule_at_timestamp(future_ms_timestamp: u64, input_data: &str) -> SqlUpdate {
    SqlUpdate::new(
        "INSERT INTO scheduled_data (future_ms_timestamp, input_data) VALUES ($1, $2)",
    )
    .int(future_ms_timestamp as i64)
    .text(input_data)
}

/// Write removing every timer at `block_height` with exactly this input.
pub fn unschedule_at_height(block_height: u64, input_data: &str) -> SqlUpdate {
    SqlUpdate::new("DELETE FROM scheduled_data WHERE block_height = $1 AND input_data = $2")
        .bind(SqlParam::Int(block_height as i64))
        .text(input_data)
}

/// The STF view of a due timer.
pub fn to_submitted(row: &ScheduledData) -> SubmittedData {
    SubmittedData {
        real_address: None,
        input_data: row.input_data.clone(),
        input_nonce: String::new(),
        supplied_value: "0".to_string(),
        scheduled: true,
        origin: InputOrigin {
            tx_hash: row.tx_hash.clone(),
            caip2: row.network.clone(),
            contract_address: row.contract_address.clone(),
            primitive_name: row.cde_name.clone(),
        },
    }
}

pub async fn insert_scheduled(
    conn: &mut AsyncPgConnection,
    rows: &[NewScheduledData],
) -> SmResult<()> {
    if rows.is_empty() {
        return Ok(());
    }
    diesel::insert_into(scheduled_data::table)
        .values(rows)
        .execute(conn)
        .await?;
    Ok(())
}

/// Timers due in a block at `block_height` with time `timestamp` (unix seconds).
pub async fn due_inputs(
    conn: &mut AsyncPgConnection,
    block_height: u64,
    timestamp: u64,
) -> SmResult<Vec<ScheduledData>> {
    let now_ms = timestamp.saturating_mul(1000) as i64;
    Ok(scheduled_data::table
        .filter(
            scheduled_data::block_height
                .le(block_height as i64)
                .or(scheduled_data::future_ms_timestamp.le(now_ms)),
        )
        .order(scheduled_data::id.asc())
        .select(ScheduledData::as_select())
        .load(conn)
        .await?)
}

pub async fn delete_scheduled(conn: &mut AsyncPgConnection, id: i64) -> SmResult<()> {
    diesel::delete(scheduled_data::table.filter(scheduled_data::id.eq(id)))
        .execute(conn)
        .await?;
    Ok(())
}
