// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Cardano extension readers backed by Carp

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cde::{merge_sorted, CdeDatum, CdeDatumPayload, ChainDataExtension, ExtensionKind};
use crate::error::{FunnelError, FunnelResult};
use crate::sources::carp::CarpClient;
use crate::types::{CursorUpdate, PresyncChainData, PresyncResult, PresyncState};

/// Pagination cursor understood by Carp: the last transaction and block seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarpCursor {
    pub tx: String,
    pub block: String,
}

impl CarpCursor {
    pub fn encode(&self) -> FunnelResult<String> {
        serde_json::to_string(self)
            .map_err(|e| FunnelError::Other(format!("unencodable cursor: {}", e)))
    }

    pub fn decode(s: &str) -> FunnelResult<Self> {
        serde_json::from_str(s)
            .map_err(|e| FunnelError::InvalidResponse(format!("bad carp cursor {}: {}", s, e)))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SlotRange {
    min_slot: u64,
    max_slot: u64,
}

#[derive(Serialize)]
struct PoolRequest<'a> {
    pools: &'a [String],
    range: SlotRange,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDelegation {
    pub credential: String,
    pub pool: Option<String>,
    pub slot: u64,
    pub tx_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MintBurnRequest<'a> {
    policy_ids: &'a [String],
    slots: SlotRange,
    after: Option<CarpCursor>,
    limit: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintBurnEntry {
    pub tx_id: String,
    pub block: String,
    pub action_slot: u64,
    pub metadata: Option<String>,
    pub assets: serde_json::Value,
    pub input_addresses: serde_json::Value,
    pub output_addresses: serde_json::Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionHistoryRequest<'a> {
    addresses: [&'a str; 1],
    slot_limits: SlotRange,
    after: Option<CarpCursor>,
    limit: u64,
}

#[derive(Debug, Deserialize)]
struct TransactionHistoryResponse {
    transactions: Vec<TransactionHistoryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionHistoryEntry {
    pub block: HistoryBlock,
    pub transaction: HistoryTransaction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryBlock {
    pub hash: String,
    pub slot: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryTransaction {
    pub hash: String,
    pub payload: String,
    pub metadata: Option<String>,
}

/// A page of entries convertible to datums.
trait CarpEntry {
    fn cursor(&self) -> CarpCursor;
    fn into_datum(self, client: &CarpClient, extension: &ChainDataExtension) -> CdeDatum;
}

impl CarpEntry for MintBurnEntry {
    fn cursor(&self) -> CarpCursor {
        CarpCursor {
            tx: self.tx_id.clone(),
            block: self.block.clone(),
        }
    }

    fn into_datum(self, _client: &CarpClient, extension: &ChainDataExtension) -> CdeDatum {
        let tx_hash = Some(self.tx_id.clone());
        extension
            .new_datum(
                self.action_slot,
                CdeDatumPayload::CardanoMintBurn {
                    tx_id: self.tx_id,
                    metadata: self.metadata,
                    assets: self.assets,
                    input_addresses: self.input_addresses,
                    output_addresses: self.output_addresses,
                },
            )
            .with_tx_hash(tx_hash)
    }
}

impl CarpEntry for TransactionHistoryEntry {
    fn cursor(&self) -> CarpCursor {
        CarpCursor {
            tx: self.transaction.hash.clone(),
            block: self.block.hash.clone(),
        }
    }

    fn into_datum(self, _client: &CarpClient, extension: &ChainDataExtension) -> CdeDatum {
        let tx_hash = Some(self.transaction.hash.clone());
        extension
            .new_datum(
                self.block.slot,
                CdeDatumPayload::CardanoTransfer {
                    tx_id: self.transaction.hash,
                    raw_tx: self.transaction.payload,
                    metadata: self.transaction.metadata,
                },
            )
            .with_tx_hash(tx_hash)
    }
}

fn pool_datum(
    client: &CarpClient,
    extension: &ChainDataExtension,
    delegation: PoolDelegation,
) -> CdeDatum {
    let epoch = client.cardano_network().epoch_from_slot(delegation.slot);
    extension
        .new_datum(
            delegation.slot,
            CdeDatumPayload::CardanoPool {
                address: delegation.credential,
                pool: delegation.pool,
                epoch,
            },
        )
        .with_tx_hash(Some(delegation.tx_id))
}

async fn pool_delegations(
    client: &CarpClient,
    pools: &[String],
    from: u64,
    to: u64,
) -> FunnelResult<Vec<PoolDelegation>> {
    let mut delegations: Vec<PoolDelegation> = client
        .post(
            "delegation/pool",
            &PoolRequest {
                pools,
                range: SlotRange {
                    min_slot: from,
                    max_slot: to,
                },
            },
        )
        .await?;
    delegations.sort_by_key(|d| d.slot);
    Ok(delegations)
}

async fn page(
    client: &CarpClient,
    extension: &ChainDataExtension,
    from: u64,
    to: u64,
    after: Option<CarpCursor>,
) -> FunnelResult<Vec<Box<dyn CarpEntryBoxed>>> {
    let slots = SlotRange {
        min_slot: from,
        max_slot: to,
    };
    let limit = client.page_size();
    match &extension.config.kind {
        ExtensionKind::CardanoMintBurn { policy_ids } => {
            let entries: Vec<MintBurnEntry> = client
                .post(
                    "asset/mint-burn-history",
                    &MintBurnRequest {
                        policy_ids,
                        slots,
                        after,
                        limit,
                    },
                )
                .await?;
            Ok(entries.into_iter().map(boxed).collect())
        }
        ExtensionKind::CardanoTransfer { credential } => {
            let response: TransactionHistoryResponse = client
                .post(
                    "transaction/history",
                    &TransactionHistoryRequest {
                        addresses: [credential.as_str()],
                        slot_limits: slots,
                        after,
                        limit,
                    },
                )
                .await?;
            Ok(response.transactions.into_iter().map(boxed).collect())
        }
        other => Err(FunnelError::Config(format!(
            "extension {} of type {} is not paginated",
            extension.name(),
            other.as_ref()
        ))),
    }
}

/// Object-safe view of [`CarpEntry`] so one pager serves every endpoint.
trait CarpEntryBoxed: Send {
    fn cursor(&self) -> CarpCursor;
    fn into_datum(self: Box<Self>, client: &CarpClient, extension: &ChainDataExtension) -> CdeDatum;
}

impl<T: CarpEntry + Send> CarpEntryBoxed for T {
    fn cursor(&self) -> CarpCursor {
        CarpEntry::cursor(self)
    }

    fn into_datum(self: Box<Self>, client: &CarpClient, extension: &ChainDataExtension) -> CdeDatum {
        CarpEntry::into_datum(*self, client, extension)
    }
}

fn boxed<T: CarpEntry + Send + 'static>(entry: T) -> Box<dyn CarpEntryBoxed> {
    Box::new(entry)
}

/// Follow cursors until a page comes back empty. Short pages are not the end: Carp may
/// cap `limit` below the configured page size.
async fn drain_pages<T, F, Fut>(
    mut next_page: F,
    cursor: impl Fn(&T) -> CarpCursor,
) -> FunnelResult<Vec<T>>
where
    F: FnMut(Option<CarpCursor>) -> Fut,
    Fut: std::future::Future<Output = FunnelResult<Vec<T>>>,
{
    let mut all = Vec::new();
    let mut after = None;
    loop {
        let entries = next_page(after.take()).await?;
        let Some(last) = entries.last() else {
            break;
        };
        after = Some(cursor(last));
        all.extend(entries);
    }
    Ok(all)
}

/// Every page of a paginated extension for `[from, to]`, in Carp's order.
async fn paginate(
    client: &CarpClient,
    extension: &ChainDataExtension,
    from: u64,
    to: u64,
) -> FunnelResult<Vec<CdeDatum>> {
    let entries = drain_pages(
        |after| page(client, extension, from, to, after),
        |e: &Box<dyn CarpEntryBoxed>| e.cursor(),
    )
    .await?;
    Ok(entries
        .into_iter()
        .map(|e| e.into_datum(client, extension))
        .collect())
}

/// Datums of one Cardano extension for slots `[from, to]`.
pub async fn fetch_extension(
    client: &CarpClient,
    extension: &ChainDataExtension,
    from: u64,
    to: u64,
) -> FunnelResult<Vec<CdeDatum>> {
    let Some((from, to)) = extension.clamp(from, to) else {
        return Ok(Vec::new());
    };
    match &extension.config.kind {
        ExtensionKind::CardanoPool { pools } => Ok(pool_delegations(client, pools, from, to)
            .await?
            .into_iter()
            .map(|d| pool_datum(client, extension, d))
            .collect()),
        ExtensionKind::CardanoMintBurn { .. } | ExtensionKind::CardanoTransfer { .. } => {
            paginate(client, extension, from, to).await
        }
        other => Err(FunnelError::Config(format!(
            "extension {} of type {} is not a Cardano extension",
            extension.name(),
            other.as_ref()
        ))),
    }
}

pub async fn fetch_extensions(
    client: &CarpClient,
    extensions: &[ChainDataExtension],
    from: u64,
    to: u64,
) -> FunnelResult<Vec<CdeDatum>> {
    let streams = try_join_all(
        extensions
            .iter()
            .filter(|e| e.config.kind.is_cardano())
            .map(|e| fetch_extension(client, e, from, to)),
    )
    .await?;
    Ok(streams
        .into_iter()
        .fold(Vec::new(), |acc, s| merge_sorted(acc, s, |d| d.source_position)))
}

/// One presync step: a page per unfinished extension, from its start slot to `sentinel`.
///
/// Pool delegations are not paginated, so a single request finishes them.
pub async fn presync_page(
    client: &CarpClient,
    extensions: &[ChainDataExtension],
    sentinel: u64,
    state: &PresyncState,
) -> FunnelResult<PresyncResult> {
    let mut datums = Vec::new();
    let mut cursors = Vec::new();
    for extension in extensions.iter().filter(|e| e.config.kind.is_cardano()) {
        let saved = state.cursors.get(extension.name()).cloned().unwrap_or_default();
        if saved.finished {
            continue;
        }
        let Some((from, to)) = extension.clamp(extension.start_block_height(), sentinel) else {
            cursors.push(CursorUpdate {
                cde_name: extension.name().to_string(),
                cursor: saved.cursor.unwrap_or_default(),
                finished: true,
            });
            continue;
        };
        if let ExtensionKind::CardanoPool { pools } = &extension.config.kind {
            let delegations = pool_delegations(client, pools, from, to).await?;
            datums.extend(
                delegations
                    .into_iter()
                    .map(|d| pool_datum(client, extension, d)),
            );
            cursors.push(CursorUpdate {
                cde_name: extension.name().to_string(),
                cursor: to.to_string(),
                finished: true,
            });
            continue;
        }

        let after = saved.cursor.as_deref().map(CarpCursor::decode).transpose()?;
        let entries = page(client, extension, from, to, after).await?;
        let update = match entries.last() {
            Some(last) => CursorUpdate {
                cde_name: extension.name().to_string(),
                cursor: last.cursor().encode()?,
                finished: false,
            },
            None => CursorUpdate {
                cde_name: extension.name().to_string(),
                cursor: saved.cursor.unwrap_or_default(),
                finished: true,
            },
        };
        debug!(
            "[{}] presync page for {}: {} entries",
            client.name_str(),
            extension.name(),
            entries.len()
        );
        datums.extend(entries.into_iter().map(|e| e.into_datum(client, extension)));
        cursors.push(update);
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
