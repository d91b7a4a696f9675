// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Sync progress
//!
//! Progress lives in the same tables the state machine writes, so it commits atomically
//! with each block:
//! - `block_heights`: highest `done = true` row is the last processed block
//! - `emulated_block_heights`: real block folded into each emulated block
//! - `cde_tracking` / `cde_tracking_cursor`: presync position per network and per extension
//!
//! On restart, syncing starts from `max(initial_block_height, latest_done + 1)`.

use std::collections::HashMap;

use diesel::dsl::max;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use paima_funnel::{CursorState, CursorUpdate, PresyncState};
use paima_schema::models::{CdeTracking, CdeTrackingCursor};
use paima_schema::schema::{block_heights, cde_tracking, cde_tracking_cursor, emulated_block_heights};
use tracing::{debug, info};

use crate::error::SmResult;

/// Where the runtime loop resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    /// Next height handed to the STF
    pub next_block_height: u64,
    /// First real block not yet folded into a committed emulated block
    pub next_real_block_height: u64,
}

/// Next height to process given the configured initial height and the highest done block.
pub fn compute_start_block(initial_block_height: u64, latest_done: Option<u64>) -> u64 {
    let done_next = latest_done.map(|h| h.saturating_add(1)).unwrap_or(0);
    std::cmp::max(initial_block_height, done_next)
}

/// Resume point for an emulated run. `last_deployment` is the deployment-chain height
/// recorded for the emulated block before `next_emulated`.
pub fn compute_emulated_resume(
    next_emulated: u64,
    last_deployment: Option<u64>,
    start_block_height: u64,
) -> ResumePoint {
    let next_real = match last_deployment {
        Some(h) if next_emulated > 0 => std::cmp::max(h.saturating_add(1), start_block_height),
        _ => start_block_height,
    };
    ResumePoint {
        next_block_height: next_emulated,
        next_real_block_height: next_real,
    }
}

/// Fold persisted presync rows into the state handed to the funnel.
pub fn presync_state_from_rows(
    tracking: &[CdeTracking],
    cursors: &[CdeTrackingCursor],
) -> PresyncState {
    let mut positions: HashMap<String, u64> = HashMap::new();
    for row in tracking.iter().filter(|r| r.done) {
        let next = (row.block_height as u64).saturating_add(1);
        positions
            .entry(row.network.clone())
            .and_modify(|p| *p = (*p).max(next))
            .or_insert(next);
    }
    let cursors = cursors
        .iter()
        .map(|row| {
            (
                row.cde_name.clone(),
                CursorState {
                    cursor: (!row.cursor.is_empty()).then(|| row.cursor.clone()),
                    finished: row.finished,
                },
            )
        })
        .collect();
    PresyncState { positions, cursors }
}

pub async fn latest_processed_block_height(conn: &mut AsyncPgConnection) -> SmResult<Option<u64>> {
    let latest: Option<i64> = block_heights::table
        .filter(block_heights::done.eq(true))
        .select(max(block_heights::block_height))
        .first(conn)
        .await?;
    Ok(latest.map(|h| h as u64))
}

pub async fn emulated_deployment_height(
    conn: &mut AsyncPgConnection,
    emulated_block_height: u64,
) -> SmResult<Option<u64>> {
    let height: Option<i64> = emulated_block_heights::table
        .filter(emulated_block_heights::emulated_block_height.eq(emulated_block_height as i64))
        .select(emulated_block_heights::deployment_chain_block_height)
        .first(conn)
        .await
        .optional()?;
    Ok(height.map(|h| h as u64))
}

/// Resume point for the runtime loop, logged the way operators read it at boot.
pub async fn resume_point(
    conn: &mut AsyncPgConnection,
    initial_block_height: u64,
    start_block_height: u64,
    emulated: bool,
) -> SmResult<ResumePoint> {
    let latest = latest_processed_block_height(conn).await?;
    let next = compute_start_block(initial_block_height, latest);
    let point = if emulated {
        let last_deployment = match next.checked_sub(1) {
            Some(previous) => emulated_deployment_height(conn, previous).await?,
            None => None,
        };
        compute_emulated_resume(next, last_deployment, start_block_height)
    } else {
        ResumePoint {
            next_block_height: next,
            next_real_block_height: next,
        }
    };
    info!(
        "[progress] resuming at #{} (latest done {:?}, real #{})",
        point.next_block_height, latest, point.next_real_block_height
    );
    Ok(point)
}

pub async fn load_presync_state(conn: &mut AsyncPgConnection) -> SmResult<PresyncState> {
    let tracking: Vec<CdeTracking> = cde_tracking::table.load(conn).await?;
    let cursors: Vec<CdeTrackingCursor> = cde_tracking_cursor::table.load(conn).await?;
    Ok(presync_state_from_rows(&tracking, &cursors))
}

/// Record a finished presync window for `network`.
pub async fn mark_presync_window(
    conn: &mut AsyncPgConnection,
    network: &str,
    to_position: u64,
    datum_count: usize,
) -> SmResult<()> {
    diesel::insert_into(cde_tracking::table)
        .values(CdeTracking {
            network: network.to_string(),
            block_height: to_position as i64,
            datum_count: datum_count as i32,
            done: true,
        })
        .on_conflict((cde_tracking::network, cde_tracking::block_height))
        .do_update()
        .set((
            cde_tracking::datum_count.eq(datum_count as i32),
            cde_tracking::done.eq(true),
        ))
        .execute(conn)
        .await?;
    debug!(
        "[progress] presync {} up to #{} ({} datums)",
        network, to_position, datum_count
    );
    Ok(())
}

pub async fn save_cursor(conn: &mut AsyncPgConnection, update: &CursorUpdate) -> SmResult<()> {
    diesel::insert_into(cde_tracking_cursor::table)
        .values(CdeTrackingCursor {
            cde_name: update.cde_name.clone(),
            cursor: update.cursor.clone(),
            finished: update.finished,
        })
        .on_conflict(cde_tracking_cursor::cde_name)
        .do_update()
        .set((
            cde_tracking_cursor::cursor.eq(&update.cursor),
            cde_tracking_cursor::finished.eq(update.finished),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracking(network: &str, block_height: i64, done: bool) -> CdeTracking {
        CdeTracking {
            network: network.into(),
            block_height,
            datum_count: 0,
            done,
        }
    }

    #[test]
    fn test_fresh_start_uses_initial_height() {
        assert_eq!(compute_start_block(100, None), 100);
        assert_eq!(compute_start_block(0, None), 0);
    }

    #[test]
    fn test_resumes_after_latest_done() {
        assert_eq!(compute_start_block(100, Some(500)), 501);
        assert_eq!(compute_start_block(0, Some(0)), 1);
    }

    #[test]
    fn test_never_resumes_below_initial_height() {
        // Operator moved the start height forward.
        assert_eq!(compute_start_block(1000, Some(500)), 1000);
    }

    #[test]
    fn test_saturating_resume() {
        assert_eq!(compute_start_block(0, Some(u64::MAX)), u64::MAX);
    }

    #[test]
    fn test_emulated_fresh_start() {
        let point = compute_emulated_resume(0, None, 120);
        assert_eq!(point.next_block_height, 0);
        assert_eq!(point.next_real_block_height, 120);
    }

    #[test]
    fn test_emulated_resume_after_deployment_height() {
        let point = compute_emulated_resume(8, Some(150), 120);
        assert_eq!(point.next_block_height, 8);
        assert_eq!(point.next_real_block_height, 151);
    }

    #[test]
    fn test_emulated_resume_missing_mapping_restarts_from_start() {
        let point = compute_emulated_resume(8, None, 120);
        assert_eq!(point.next_real_block_height, 120);
    }

    #[test]
    fn test_presync_state_takes_highest_done_window() {
        let rows = vec![
            tracking("evmMain", 99, true),
            tracking("evmMain", 199, true),
            tracking("evmMain", 299, false),
            tracking("cardano", 5000, true),
        ];
        let cursors = vec![
            CdeTrackingCursor {
                cde_name: "pool".into(),
                cursor: "".into(),
                finished: true,
            },
            CdeTrackingCursor {
                cde_name: "mints".into(),
                cursor: r#"{"tx":"ab","block":"cd"}"#.into(),
                finished: false,
            },
        ];
        let state = presync_state_from_rows(&rows, &cursors);
        assert_eq!(state.positions.get("evmMain"), Some(&200));
        assert_eq!(state.positions.get("cardano"), Some(&5001));
        assert_eq!(state.cursors["pool"].cursor, None);
        assert!(state.cursors["pool"].finished);
        assert_eq!(
            state.cursors["mints"].cursor.as_deref(),
            Some(r#"{"tx":"ab","block":"cd"}"#)
        );
        assert!(!state.cursors["mints"].finished);
    }
}
