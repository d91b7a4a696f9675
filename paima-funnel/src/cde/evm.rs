// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! EVM extension readers (ERC20, ERC721, ERC1155, generic events, dynamic primitives)

use ethers::abi::{Event, RawLog, Token};
use ethers::contract::{parse_log, EthEvent, EthLogDecode};
use ethers::providers::JsonRpcClient;
use ethers::types::{Address, Filter, Log, H256, I256, U256};
use futures::future::try_join_all;
use tracing::warn;

use crate::cde::{merge_sorted, CdeDatum, CdeDatumPayload, ChainDataExtension, ExtensionKind};
use crate::error::{FunnelError, FunnelResult};
use crate::sources::evm::{parse_address, EvmClient};

#[derive(Clone, Debug, EthEvent)]
#[ethevent(name = "Transfer", abi = "Transfer(address,address,uint256)")]
pub struct Erc20TransferEvent {
    #[ethevent(indexed)]
    pub from: Address,
    #[ethevent(indexed)]
    pub to: Address,
    pub value: U256,
}

#[derive(Clone, Debug, EthEvent)]
#[ethevent(name = "Transfer", abi = "Transfer(address,address,uint256)")]
pub struct Erc721TransferEvent {
    #[ethevent(indexed)]
    pub from: Address,
    #[ethevent(indexed)]
    pub to: Address,
    #[ethevent(indexed)]
    pub token_id: U256,
}

#[derive(Clone, Debug, EthEvent)]
#[ethevent(
    name = "TransferSingle",
    abi = "TransferSingle(address,address,address,uint256,uint256)"
)]
pub struct TransferSingleEvent {
    #[ethevent(indexed)]
    pub operator: Address,
    #[ethevent(indexed)]
    pub from: Address,
    #[ethevent(indexed)]
    pub to: Address,
    pub id: U256,
    pub value: U256,
}

#[derive(Clone, Debug, EthEvent)]
#[ethevent(
    name = "TransferBatch",
    abi = "TransferBatch(address,address,address,uint256[],uint256[])"
)]
pub struct TransferBatchEvent {
    #[ethevent(indexed)]
    pub operator: Address,
    #[ethevent(indexed)]
    pub from: Address,
    #[ethevent(indexed)]
    pub to: Address,
    pub ids: Vec<U256>,
    pub values: Vec<U256>,
}

/// Position of a log inside the chain, used to merge per-event streams.
type LogKey = (u64, u64);

/// `None` for pending logs, which carry no block number and cannot be placed.
fn log_key(log: &Log) -> Option<LogKey> {
    let block = log.block_number?.as_u64();
    Some((block, log.log_index.map(|i| i.as_u64()).unwrap_or_default()))
}

fn placed_log_key(extension: &ChainDataExtension, log: &Log) -> Option<LogKey> {
    let key = log_key(log);
    if key.is_none() {
        warn!(
            "[{}] skipping log without a block number (tx {:?})",
            extension.name(),
            log.transaction_hash
        );
    }
    key
}

fn hex_address(address: &Address) -> String {
    format!("{:?}", address)
}

/// Read every EVM extension in `extensions` for `[from, to]`.
pub async fn fetch_extensions<P>(
    client: &EvmClient<P>,
    extensions: &[ChainDataExtension],
    from: u64,
    to: u64,
) -> FunnelResult<Vec<CdeDatum>>
where
    P: JsonRpcClient + 'static,
{
    let streams = try_join_all(
        extensions
            .iter()
            .filter(|e| e.config.kind.is_evm())
            .map(|e| fetch_extension(client, e, from, to)),
    )
    .await?;
    Ok(streams.into_iter().flatten().collect())
}

/// Datums of one extension for `[from, to]`, clamped to its start height.
pub async fn fetch_extension<P>(
    client: &EvmClient<P>,
    extension: &ChainDataExtension,
    from: u64,
    to: u64,
) -> FunnelResult<Vec<CdeDatum>>
where
    P: JsonRpcClient + 'static,
{
    let Some((from, to)) = extension.clamp(from, to) else {
        return Ok(Vec::new());
    };

    match &extension.config.kind {
        ExtensionKind::Erc20 { contract_address } => {
            let logs = client
                .get_logs(&filter(contract_address, Erc20TransferEvent::signature(), from, to)?)
                .await?;
            Ok(decode_logs::<Erc20TransferEvent>(extension, logs)
                .into_iter()
                .map(|(block, tx, e)| {
                    extension
                        .new_datum(
                            block,
                            CdeDatumPayload::Erc20Transfer {
                                from: hex_address(&e.from),
                                to: hex_address(&e.to),
                                value: e.value.to_string(),
                            },
                        )
                        .with_tx_hash(tx)
                })
                .collect())
        }
        ExtensionKind::Erc721 {
            contract_address, ..
        } => {
            let logs = client
                .get_logs(&filter(contract_address, Erc721TransferEvent::signature(), from, to)?)
                .await?;
            let events = decode_logs::<Erc721TransferEvent>(extension, logs);
            let mints: Vec<CdeDatum> = events
                .iter()
                .filter(|(_, _, e)| e.from == Address::zero())
                .map(|(block, tx, e)| {
                    extension
                        .new_datum(
                            *block,
                            CdeDatumPayload::Erc721Mint {
                                to: hex_address(&e.to),
                                token_id: e.token_id.to_string(),
                            },
                        )
                        .with_tx_hash(tx.clone())
                })
                .collect();
            let transfers: Vec<CdeDatum> = events
                .into_iter()
                .map(|(block, tx, e)| {
                    extension
                        .new_datum(
                            block,
                            CdeDatumPayload::Erc721Transfer {
                                from: hex_address(&e.from),
                                to: hex_address(&e.to),
                                token_id: e.token_id.to_string(),
                            },
                        )
                        .with_tx_hash(tx)
                })
                .collect();
            Ok(merge_sorted(mints, transfers, |d| d.source_position))
        }
        ExtensionKind::Erc1155 {
            contract_address, ..
        } => {
            let single_filter =
                filter(contract_address, TransferSingleEvent::signature(), from, to)?;
            let batch_filter = filter(contract_address, TransferBatchEvent::signature(), from, to)?;
            let (single, batch) = futures::try_join!(
                client.get_logs(&single_filter),
                client.get_logs(&batch_filter),
            )?;
            let single: Vec<(LogKey, CdeDatum)> = keyed_logs::<TransferSingleEvent>(extension, single)
                .into_iter()
                .map(|(key, tx, e)| {
                    let datum = extension.new_datum(
                        key.0,
                        CdeDatumPayload::Erc1155Transfer {
                            operator: hex_address(&e.operator),
                            from: hex_address(&e.from),
                            to: hex_address(&e.to),
                            ids: vec![e.id.to_string()],
                            values: vec![e.value.to_string()],
                        },
                    );
                    (key, datum.with_tx_hash(tx))
                })
                .collect();
            let batch: Vec<(LogKey, CdeDatum)> = keyed_logs::<TransferBatchEvent>(extension, batch)
                .into_iter()
                .map(|(key, tx, e)| {
                    let datum = extension.new_datum(
                        key.0,
                        CdeDatumPayload::Erc1155Transfer {
                            operator: hex_address(&e.operator),
                            from: hex_address(&e.from),
                            to: hex_address(&e.to),
                            ids: e.ids.iter().map(U256::to_string).collect(),
                            values: e.values.iter().map(U256::to_string).collect(),
                        },
                    );
                    (key, datum.with_tx_hash(tx))
                })
                .collect();
            Ok(merge_sorted(single, batch, |(key, _)| *key)
                .into_iter()
                .map(|(_, d)| d)
                .collect())
        }
        ExtensionKind::Generic {
            contract_address,
            event_abi,
        } => {
            let event = parse_event_abi(extension, event_abi)?;
            let logs = client
                .get_logs(&filter(contract_address, event.signature(), from, to)?)
                .await?;
            Ok(decode_generic(extension, &event, logs)
                .into_iter()
                .map(|(block, tx, data)| {
                    extension
                        .new_datum(block, CdeDatumPayload::Generic { data })
                        .with_tx_hash(tx)
                })
                .collect())
        }
        ExtensionKind::DynamicEvmPrimitive {
            contract_address,
            event_abi,
            address_field,
            target,
        } => {
            let event = parse_event_abi(extension, event_abi)?;
            let logs = client
                .get_logs(&filter(contract_address, event.signature(), from, to)?)
                .await?;
            let mut datums = Vec::new();
            for (block, tx, data) in decode_generic(extension, &event, logs) {
                let Some(announced) = data.get(address_field).and_then(|v| v.as_str()) else {
                    warn!(
                        "[{}] event has no address field {}",
                        extension.name(),
                        address_field
                    );
                    continue;
                };
                datums.push(
                    extension
                        .new_datum(
                            block,
                            CdeDatumPayload::DynamicEvmPrimitive {
                                contract_address: announced.to_lowercase(),
                                target: target.clone(),
                            },
                        )
                        .with_tx_hash(tx),
                );
            }
            Ok(datums)
        }
        other => Err(FunnelError::Config(format!(
            "extension {} of type {} is not an EVM extension",
            extension.name(),
            other.as_ref()
        ))),
    }
}

fn filter(contract_address: &str, topic0: H256, from: u64, to: u64) -> FunnelResult<Filter> {
    Ok(Filter::new()
        .address(parse_address(contract_address)?)
        .topic0(topic0)
        .from_block(from)
        .to_block(to))
}

fn keyed_logs<E: EthLogDecode>(
    extension: &ChainDataExtension,
    logs: Vec<Log>,
) -> Vec<(LogKey, Option<String>, E)> {
    logs.into_iter()
        .filter_map(|log| {
            let key = placed_log_key(extension, &log)?;
            let tx = log.transaction_hash.map(|h| format!("{:?}", h));
            match parse_log::<E>(log) {
                Ok(event) => Some((key, tx, event)),
                Err(e) => {
                    // a contract emitting the same topic with another layout
                    warn!("[{}] skipping undecodable log: {}", extension.name(), e);
                    None
                }
            }
        })
        .collect()
}

fn decode_logs<E: EthLogDecode>(
    extension: &ChainDataExtension,
    logs: Vec<Log>,
) -> Vec<(u64, Option<String>, E)> {
    keyed_logs(extension, logs)
        .into_iter()
        .map(|(key, tx, e)| (key.0, tx, e))
        .collect()
}

fn parse_event_abi(extension: &ChainDataExtension, abi: &serde_json::Value) -> FunnelResult<Event> {
    serde_json::from_value(abi.clone()).map_err(|e| {
        FunnelError::Config(format!(
            "extension {} has an invalid event abi: {}",
            extension.name(),
            e
        ))
    })
}

fn decode_generic(
    extension: &ChainDataExtension,
    event: &Event,
    logs: Vec<Log>,
) -> Vec<(u64, Option<String>, serde_json::Value)> {
    logs.into_iter()
        .filter_map(|log| {
            let (block, _) = placed_log_key(extension, &log)?;
            let tx = log.transaction_hash.map(|h| format!("{:?}", h));
            let raw = RawLog {
                topics: log.topics,
                data: log.data.to_vec(),
            };
            match event.parse_log(raw) {
                Ok(parsed) => {
                    let fields: serde_json::Map<String, serde_json::Value> = parsed
                        .params
                        .into_iter()
                        .map(|p| (p.name, token_to_json(p.value)))
                        .collect();
                    Some((block, tx, serde_json::Value::Object(fields)))
                }
                Err(e) => {
                    warn!("[{}] skipping undecodable log: {}", extension.name(), e);
                    None
                }
            }
        })
        .collect()
}

/// JSON rendering of an ABI value. Integers become decimal strings so no precision is lost.
pub fn token_to_json(token: Token) -> serde_json::Value {
    use serde_json::Value;
    match token {
        Token::Address(a) => Value::String(hex_address(&a)),
        Token::FixedBytes(b) | Token::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        Token::Uint(v) => Value::String(v.to_string()),
        Token::Int(v) => Value::String(I256::from_raw(v).to_string()),
        Token::Bool(b) => Value::Bool(b),
        Token::String(s) => Value::String(s),
        Token::FixedArray(items) | Token::Array(items) | Token::Tuple(items) => {
            Value::Array(items.into_iter().map(token_to_json).collect())
        }
    }
}
