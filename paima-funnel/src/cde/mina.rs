// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Mina zkApp event and action readers
//!
//! Both readers page by block: `limit` caps the number of blocks per response and the
//! cursor is the last height read, so a page never splits a block.

use std::future::Future;

use futures::future::try_join_all;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use tracing::debug;

use crate::cde::{merge_sorted, CdeDatum, CdeDatumPayload, ChainDataExtension, ExtensionKind};
use crate::error::{FunnelError, FunnelResult};
use crate::sources::mina::MinaArchiveClient;
use crate::types::{CursorUpdate, PresyncChainData, PresyncResult, PresyncState};

const EVENTS_QUERY: &str = "query($address: String!, $from: Int!, $to: Int!, $limit: Int!) { \
    events(input: { address: $address, from: $from, to: $to, limit: $limit }) { \
    blockInfo { height timestamp } \
    eventData { data transactionInfo { transactionHash } } } }";

const ACTIONS_QUERY: &str = "query($address: String!, $from: Int!, $to: Int!, $limit: Int!) { \
    actions(input: { address: $address, from: $from, to: $to, limit: $limit }) { \
    blockInfo { height timestamp } \
    actionData { data transactionInfo { transactionHash } } } }";

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct BlockInfo {
    pub height: u64,
    /// Milliseconds
    #[serde_as(as = "DisplayFromStr")]
    pub timestamp: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub transaction_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub data: Vec<String>,
    pub transaction_info: Option<TransactionInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventGroup {
    pub block_info: BlockInfo,
    #[serde(alias = "actionData")]
    pub event_data: Vec<EventData>,
}

#[derive(Debug, Deserialize)]
struct EventsData {
    events: Vec<EventGroup>,
}

#[derive(Debug, Deserialize)]
struct ActionsData {
    actions: Vec<EventGroup>,
}

/// One datum per event, in block order.
pub fn group_datums(extension: &ChainDataExtension, mut groups: Vec<EventGroup>) -> Vec<CdeDatum> {
    groups.sort_by_key(|g| g.block_info.height);
    groups
        .into_iter()
        .flat_map(|group| {
            let height = group.block_info.height;
            let timestamp = group.block_info.timestamp / 1000;
            group.event_data.into_iter().map(move |event| {
                let tx_hash = event
                    .transaction_info
                    .as_ref()
                    .map(|t| t.transaction_hash.clone());
                extension
                    .new_datum(
                        height,
                        CdeDatumPayload::MinaGeneric {
                            data: serde_json::json!({
                                "data": event.data,
                                "height": height,
                                "timestamp": timestamp,
                            }),
                        },
                    )
                    .with_tx_hash(tx_hash)
            })
        })
        .collect()
}

/// Blocks with events of `extension` in `[from, to]`, at most one page of them.
async fn page(
    client: &MinaArchiveClient,
    extension: &ChainDataExtension,
    from: u64,
    to: u64,
) -> FunnelResult<Vec<EventGroup>> {
    let variables = |address: &str| {
        serde_json::json!({
            "address": address,
            "from": from,
            "to": to,
            "limit": client.page_size(),
        })
    };
    match &extension.config.kind {
        ExtensionKind::MinaEvent { address } => Ok(client
            .query::<EventsData>(EVENTS_QUERY, variables(address.as_str()))
            .await?
            .events),
        ExtensionKind::MinaAction { address } => Ok(client
            .query::<ActionsData>(ACTIONS_QUERY, variables(address.as_str()))
            .await?
            .actions),
        other => Err(FunnelError::Config(format!(
            "extension {} of type {} is not a Mina extension",
            extension.name(),
            other.as_ref()
        ))),
    }
}

/// Last height of a page, or `None` for an empty page.
fn page_end(groups: &[EventGroup], from: u64) -> FunnelResult<Option<u64>> {
    let Some(last) = groups.iter().map(|g| g.block_info.height).max() else {
        return Ok(None);
    };
    if last < from {
        return Err(FunnelError::InvalidResponse(format!(
            "archive returned height {} for a page starting at {}",
            last, from
        )));
    }
    Ok(Some(last))
}

/// Pages of `[from, to]`, each resuming after the last height seen, until one is empty.
async fn drain_pages<F, Fut>(from: u64, to: u64, mut next_page: F) -> FunnelResult<Vec<EventGroup>>
where
    F: FnMut(u64, u64) -> Fut,
    Fut: Future<Output = FunnelResult<Vec<EventGroup>>>,
{
    let mut groups = Vec::new();
    let mut next = from;
    while next <= to {
        let page = next_page(next, to).await?;
        let Some(last) = page_end(&page, next)? else {
            break;
        };
        next = last + 1;
        groups.extend(page);
    }
    Ok(groups)
}

/// Datums of one Mina extension for heights `[from, to]`.
pub async fn fetch_extension(
    client: &MinaArchiveClient,
    extension: &ChainDataExtension,
    from: u64,
    to: u64,
) -> FunnelResult<Vec<CdeDatum>> {
    let Some((from, to)) = extension.clamp(from, to) else {
        return Ok(Vec::new());
    };
    let groups = drain_pages(from, to, |from, to| page(client, extension, from, to)).await?;
    Ok(group_datums(extension, groups))
}

fn parse_cursor(extension: &ChainDataExtension, cursor: &str) -> FunnelResult<u64> {
    cursor.parse().map_err(|_| {
        FunnelError::InvalidResponse(format!(
            "bad mina cursor {} for {}",
            cursor,
            extension.name()
        ))
    })
}

/// Cursor after reading `page_end` from a page over `[.., to]`.
fn next_cursor(
    extension: &ChainDataExtension,
    saved: Option<String>,
    page_end: Option<u64>,
    to: u64,
) -> CursorUpdate {
    let cde_name = extension.name().to_string();
    match page_end {
        Some(last) => CursorUpdate {
            cde_name,
            cursor: last.to_string(),
            finished: last >= to,
        },
        None => CursorUpdate {
            cde_name,
            cursor: saved.unwrap_or_default(),
            finished: true,
        },
    }
}

/// One presync step: a page per unfinished extension, from its cursor to `sentinel`.
pub async fn presync_page(
    client: &MinaArchiveClient,
    extensions: &[ChainDataExtension],
    sentinel: u64,
    state: &PresyncState,
) -> FunnelResult<PresyncResult> {
    let mut datums = Vec::new();
    let mut cursors = Vec::new();
    for extension in extensions.iter().filter(|e| e.config.kind.is_mina()) {
        let saved = state.cursors.get(extension.name()).cloned().unwrap_or_default();
        if saved.finished {
            continue;
        }
        let resume = match saved.cursor.as_deref() {
            Some(cursor) => parse_cursor(extension, cursor)? + 1,
            None => extension.start_block_height(),
        };
        let Some((from, to)) = extension.clamp(resume, sentinel) else {
            cursors.push(next_cursor(extension, saved.cursor, None, sentinel));
            continue;
        };
        let groups = page(client, extension, from, to).await?;
        let end = page_end(&groups, from)?;
        debug!(
            "[{}] presync page for {} from #{}: {} blocks",
            client.name_str(),
            extension.name(),
            from,
            groups.len()
        );
        datums = merge_sorted(datums, group_datums(extension, groups), |d| {
            d.source_position
        });
        cursors.push(next_cursor(extension, saved.cursor, end, to));
    }

    if cursors.is_empty() {
        return Ok(PresyncResult::Finished);
    }
    Ok(PresyncResult::Data(PresyncChainData {
        network: client.name_str().to_string(),
        to_position: None,
        extension_datums: datums,
        cursors,
    }))
}

pub async fn fetch_extensions(
    client: &MinaArchiveClient,
    extensions: &[ChainDataExtension],
    from: u64,
    to: u64,
) -> FunnelResult<Vec<CdeDatum>> {
    let streams = try_join_all(
        extensions
            .iter()
            .filter(|e| e.config.kind.is_mina())
            .map(|e| fetch_extension(client, e, from, to)),
    )
    .await?;
    Ok(streams
        .into_iter()
        .fold(Vec::new(), |acc, s| merge_sorted(acc, s, |d| d.source_position)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cde::ExtensionConfig;

    #[test]
    fn test_group_datums_orders_by_height() {
        let extension = ChainDataExtension {
            cde_id: 3,
            config: ExtensionConfig {
                name: "zkapp".into(),
                network: "mina".into(),
                start_block_height: 0,
                scheduled_prefix: Some("zk".into()),
                kind: ExtensionKind::MinaAction {
                    address: "B62q".into(),
                },
            },
        };
        let groups: Vec<EventGroup> = serde_json::from_value(serde_json::json!([
            {
                "blockInfo": {"height": 12, "timestamp": "1700000012000"},
                "actionData": [{"data": ["3"], "transactionInfo": {"transactionHash": "5Jt"}}]
            },
            {
                "blockInfo": {"height": 10, "timestamp": "1700000010000"},
                "actionData": [
                    {"data": ["1"], "transactionInfo": null},
                    {"data": ["2"], "transactionInfo": null}
                ]
            }
        ]))
        .unwrap();

        let datums = group_datums(&extension, groups);
        let positions: Vec<u64> = datums.iter().map(|d| d.source_position).collect();
        assert_eq!(positions, vec![10, 10, 12]);
        assert_eq!(datums[2].tx_hash.as_deref(), Some("5Jt"));
        assert_eq!(
            datums[0].payload,
            CdeDatumPayload::MinaGeneric {
                data: serde_json::json!({"data": ["1"], "height": 10, "timestamp": 1700000010u64})
            }
        );
    }

    fn group(height: u64) -> EventGroup {
        EventGroup {
            block_info: BlockInfo {
                height,
                timestamp: height * 1000,
            },
            event_data: vec![EventData {
                data: vec![height.to_string()],
                transaction_info: None,
            }],
        }
    }

    /// Archive holding one event at each of `heights`, answering `limit` blocks per page.
    fn archive(
        heights: Vec<u64>,
        limit: usize,
    ) -> impl FnMut(u64, u64) -> std::future::Ready<FunnelResult<Vec<EventGroup>>> {
        move |from, to| {
            let page = heights
                .iter()
                .filter(|h| (from..=to).contains(*h))
                .take(limit)
                .map(|h| group(*h))
                .collect();
            std::future::ready(Ok(page))
        }
    }

    #[tokio::test]
    async fn test_sync_reads_every_page() {
        let heights = vec![3, 4, 9, 15, 21, 22];
        let groups = drain_pages(1, 20, archive(heights, 2)).await.unwrap();
        let read: Vec<u64> = groups.iter().map(|g| g.block_info.height).collect();
        assert_eq!(read, vec![3, 4, 9, 15]);
    }

    #[tokio::test]
    async fn test_empty_range_makes_one_request() {
        let mut calls = 0;
        let mut server = archive(vec![50], 2);
        let groups = drain_pages(1, 20, |from, to| {
            calls += 1;
            server(from, to)
        })
        .await
        .unwrap();
        assert!(groups.is_empty());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_page_below_cursor_is_rejected() {
        let result = drain_pages(10, 20, |_, _| std::future::ready(Ok(vec![group(4)]))).await;
        assert!(matches!(result, Err(FunnelError::InvalidResponse(_))));
    }

    #[test]
    fn test_presync_cursor_moves_per_page() {
        let extension = ChainDataExtension {
            cde_id: 0,
            config: ExtensionConfig {
                name: "zkapp".into(),
                network: "mina".into(),
                start_block_height: 1,
                scheduled_prefix: None,
                kind: ExtensionKind::MinaEvent {
                    address: "B62q".into(),
                },
            },
        };
        let partial = next_cursor(&extension, None, Some(40), 100);
        assert_eq!(partial.cursor, "40");
        assert!(!partial.finished);
        assert_eq!(parse_cursor(&extension, &partial.cursor).unwrap() + 1, 41);

        let last = next_cursor(&extension, Some("40".into()), Some(100), 100);
        assert!(last.finished);

        let drained = next_cursor(&extension, Some("40".into()), None, 100);
        assert_eq!(drained.cursor, "40");
        assert!(drained.finished);

        assert!(parse_cursor(&extension, "forty").is_err());
    }
}
