// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Turn extension datums into state writes
//!
//! Each datum maps to a fixed set of upserts on its extension's table, plus an optional
//! scheduled input for the STF when the extension has a `scheduled-prefix`. Nothing here
//! touches the database; the state machine runs the returned writes in the block's
//! transaction.

use paima_funnel::cde::{CdeDatum, CdeDatumPayload, DynamicTarget};
use paima_schema::models::NewScheduledData;
use serde_json::json;

use crate::stf::{SqlParam, SqlUpdate};

pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Contract announced by a dynamic primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicAnnouncement {
    pub parent_name: String,
    pub contract_address: String,
    pub target: DynamicTarget,
}

/// Everything one datum causes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CdeEffects {
    pub updates: Vec<SqlUpdate>,
    pub scheduled: Vec<NewScheduledData>,
    pub announcements: Vec<DynamicAnnouncement>,
}

impl CdeEffects {
    fn extend(&mut self, other: CdeEffects) {
        self.updates.extend(other.updates);
        self.scheduled.extend(other.scheduled);
        self.announcements.extend(other.announcements);
    }
}

fn is_zero(address: &str) -> bool {
    address.eq_ignore_ascii_case(ZERO_ADDRESS)
}

/// Effects of all datums of a block, in datum order.
pub fn process_datums(datums: &[CdeDatum], block_height: u64, presync: bool) -> CdeEffects {
    let mut effects = CdeEffects::default();
    for datum in datums {
        effects.extend(process_datum(datum, block_height, presync));
    }
    effects
}

/// Effects of one datum delivered at `block_height`. During presync no inputs are scheduled.
pub fn process_datum(datum: &CdeDatum, block_height: u64, presync: bool) -> CdeEffects {
    let name = datum.cde_name.as_str();
    let height = block_height as i64;

    let mut scheduled = Vec::new();
    let mut schedule = |prefix: Option<&String>, body: String| {
        if presync {
            return;
        }
        if let Some(prefix) = prefix {
            scheduled.push(NewScheduledData {
                block_height: Some(height),
                future_ms_timestamp: None,
                input_data: format!("{}|{}", prefix, body),
                cde_name: Some(name.to_string()),
                tx_hash: datum.tx_hash.clone(),
                network: Some(datum.network.clone()),
                contract_address: None,
            });
        }
    };

    let mut updates = Vec::new();
    let mut announcements = Vec::new();
    match &datum.payload {
        CdeDatumPayload::Erc20Transfer { from, to, value } => {
            if !is_zero(from) {
                updates.push(debit_balance("cde_erc20_data", name, from, None, value));
            }
            if !is_zero(to) {
                updates.push(credit_balance("cde_erc20_data", name, to, None, value));
            }
            schedule(
                datum.scheduled_prefix.as_ref(),
                format!("{}|{}|{}", from, to, value),
            );
        }
        CdeDatumPayload::Erc721Mint { to, token_id } => {
            schedule(
                datum.scheduled_prefix.as_ref(),
                format!("{}|{}", to, token_id),
            );
        }
        CdeDatumPayload::Erc721Transfer { from, to, token_id } => {
            if is_zero(to) {
                updates.push(
                    SqlUpdate::new(
                        "INSERT INTO cde_erc721_burn (cde_name, token_id, nft_owner, block_height) \
                         VALUES ($1, $2, $3, $4) \
                         ON CONFLICT (cde_name, token_id) \
                         DO UPDATE SET nft_owner = EXCLUDED.nft_owner, block_height = EXCLUDED.block_height",
                    )
                    .text(name)
                    .text(token_id)
                    .text(from)
                    .int(height),
                );
                updates.push(
                    SqlUpdate::new(
                        "DELETE FROM cde_erc721_data WHERE cde_name = $1 AND token_id = $2",
                    )
                    .text(name)
                    .text(token_id),
                );
                schedule(
                    datum.burn_scheduled_prefix.as_ref(),
                    format!("{}|{}", from, token_id),
                );
            } else {
                updates.push(
                    SqlUpdate::new(
                        "INSERT INTO cde_erc721_data (cde_name, token_id, nft_owner) \
                         VALUES ($1, $2, $3) \
                         ON CONFLICT (cde_name, token_id) DO UPDATE SET nft_owner = EXCLUDED.nft_owner",
                    )
                    .text(name)
                    .text(token_id)
                    .text(to),
                );
            }
        }
        CdeDatumPayload::Erc1155Transfer {
            operator,
            from,
            to,
            ids,
            values,
        } => {
            for (id, value) in ids.iter().zip(values) {
                if !is_zero(from) {
                    updates.push(debit_balance("cde_erc1155_data", name, from, Some(id), value));
                }
                if is_zero(to) {
                    updates.push(credit_balance("cde_erc1155_burn", name, from, Some(id), value));
                } else {
                    updates.push(credit_balance("cde_erc1155_data", name, to, Some(id), value));
                }
            }
            let body = format!(
                "{}|{}|{}|{}|{}",
                operator,
                from,
                to,
                ids.join(","),
                values.join(",")
            );
            if is_zero(to) {
                schedule(datum.burn_scheduled_prefix.as_ref(), body.clone());
            }
            schedule(datum.scheduled_prefix.as_ref(), body);
        }
        CdeDatumPayload::Generic { data } | CdeDatumPayload::MinaGeneric { data } => {
            updates.push(
                SqlUpdate::new(
                    "INSERT INTO cde_generic_data (cde_name, block_height, event_data) VALUES ($1, $2, $3)",
                )
                .text(name)
                .int(height)
                .bind(SqlParam::Json(data.clone())),
            );
            schedule(datum.scheduled_prefix.as_ref(), data.to_string());
        }
        CdeDatumPayload::DynamicEvmPrimitive {
            contract_address,
            target,
        } => {
            announcements.push(DynamicAnnouncement {
                parent_name: name.to_string(),
                contract_address: contract_address.clone(),
                target: target.clone(),
            });
        }
        CdeDatumPayload::CardanoPool {
            address,
            pool,
            epoch,
        } => {
            updates.push(
                SqlUpdate::new(
                    "INSERT INTO cde_cardano_pool_delegation (cde_name, address, epoch, pool) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (cde_name, address, epoch) DO UPDATE SET pool = EXCLUDED.pool",
                )
                .text(name)
                .text(address)
                .int(*epoch as i64)
                .bind(SqlParam::OptText(pool.clone())),
            );
            schedule(
                datum.scheduled_prefix.as_ref(),
                format!("{}|{}", address, pool.clone().unwrap_or_default()),
            );
        }
        CdeDatumPayload::CardanoMintBurn {
            tx_id,
            metadata,
            assets,
            input_addresses,
            output_addresses,
        } => {
            updates.push(
                SqlUpdate::new(
                    "INSERT INTO cde_cardano_mint_burn \
                     (cde_name, tx_id, metadata, assets, input_addresses, output_addresses, block_height) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) \
                     ON CONFLICT (cde_name, tx_id) DO NOTHING",
                )
                .text(name)
                .text(tx_id)
                .bind(SqlParam::OptText(metadata.clone()))
                .bind(SqlParam::Json(assets.clone()))
                .bind(SqlParam::Json(input_addresses.clone()))
                .bind(SqlParam::Json(output_addresses.clone()))
                .int(height),
            );
            let body = json!({
                "txId": tx_id,
                "metadata": metadata,
                "assets": assets,
                "inputAddresses": input_addresses,
                "outputAddresses": output_addresses,
            });
            schedule(datum.scheduled_prefix.as_ref(), body.to_string());
        }
        CdeDatumPayload::CardanoTransfer {
            tx_id,
            raw_tx,
            metadata,
        } => {
            updates.push(
                SqlUpdate::new(
                    "INSERT INTO cde_cardano_transfer (cde_name, tx_id, raw_tx, metadata, block_height) \
                     VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT (cde_name, tx_id) DO NOTHING",
                )
                .text(name)
                .text(tx_id)
                .text(raw_tx)
                .bind(SqlParam::OptText(metadata.clone()))
                .int(height),
            );
            let body = json!({
                "txId": tx_id,
                "rawTx": raw_tx,
                "metadata": metadata,
            });
            schedule(datum.scheduled_prefix.as_ref(), body.to_string());
        }
    }
    CdeEffects {
        updates,
        scheduled,
        announcements,
    }
}

fn credit_balance(
    table: &str,
    name: &str,
    wallet: &str,
    token_id: Option<&String>,
    value: &str,
) -> SqlUpdate {
    match token_id {
        None => SqlUpdate::new(format!(
            "INSERT INTO {table} (cde_name, wallet_address, balance) VALUES ($1, $2, $3) \
             ON CONFLICT (cde_name, wallet_address) \
             DO UPDATE SET balance = ({table}.balance::NUMERIC + EXCLUDED.balance::NUMERIC)::TEXT"
        ))
        .text(name)
        .text(wallet)
        .text(value),
        Some(token_id) => SqlUpdate::new(format!(
            "INSERT INTO {table} (cde_name, token_id, wallet_address, balance) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (cde_name, token_id, wallet_address) \
             DO UPDATE SET balance = ({table}.balance::NUMERIC + EXCLUDED.balance::NUMERIC)::TEXT"
        ))
        .text(name)
        .text(token_id.as_str())
        .text(wallet)
        .text(value),
    }
}

fn debit_balance(
    table: &str,
    name: &str,
    wallet: &str,
    token_id: Option<&String>,
    value: &str,
) -> SqlUpdate {
    match token_id {
        None => SqlUpdate::new(format!(
            "UPDATE {table} SET balance = (balance::NUMERIC - $3::NUMERIC)::TEXT \
             WHERE cde_name = $1 AND wallet_address = $2"
        ))
        .text(name)
        .text(wallet)
        .text(value),
        Some(token_id) => SqlUpdate::new(format!(
            "UPDATE {table} SET balance = (balance::NUMERIC - $4::NUMERIC)::TEXT \
             WHERE cde_name = $1 AND token_id = $2 AND wallet_address = $3"
        ))
        .text(name)
        .text(token_id.as_str())
        .text(wallet)
        .text(value),
    }
}
