// Copyright (c) Paima Studios
// SPDX-License-Identifier: Apache-2.0

//! Game state machine
//!
//! Applies one [`ChainData`] block in a single database transaction. The order of work
//! inside a block is part of consensus:
//! 1. seed row for the block (`done = false`)
//! 2. extension datum writes, which may schedule inputs at this height
//! 3. scheduled inputs due at this height or time, deleted as they run
//! 4. user inputs, skipping nonces seen before
//! 5. emulated block mapping
//! 6. `done = true`
//!
//! An input the STF rejects is skipped. Any other failure rolls back the whole block.

use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use paima_funnel::cde::{
    order_datums, CdeDatumPayload, CdeRegistry, CdeSnapshot, ChainDataExtension,
    SharedCdeRegistry,
};
use paima_funnel::{ChainData, PresyncChainData};
use paima_pg_db::Db;
use paima_schema::models::{
    BlockHeight, CdeConfigRow, DynamicPrimitiveConfig, EmulatedBlockHeight, Nonce,
};
use paima_schema::schema::{
    block_heights, cde_config, cde_dynamic_primitive_config, emulated_block_heights, nonces,
};
use rand_chacha::ChaCha20Rng;
use tracing::{debug, info, warn};

use crate::cde_processing::{process_datum, process_datums, DynamicAnnouncement};
use crate::error::{SmError, SmResult};
use crate::metrics::EngineMetrics;
use crate::progress;
use crate::randomness::{rng_from_seed, RandomnessSource};
use crate::scheduled::{delete_scheduled, due_inputs, insert_scheduled, to_submitted};
use crate::stf::{StateTransition, StfError, StfInput, StfRouter};

/// Extension created by a dynamic primitive while processing a block.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicExtension {
    pub parent_name: String,
    pub announced_at: u64,
    pub extension: ChainDataExtension,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockOutcome {
    pub block_height: u64,
    pub scheduled_inputs: usize,
    pub user_inputs: usize,
    pub rejected_nonce: usize,
    pub rejected_stf: usize,
    /// Extensions registered by this block. The funnel must re-read after it.
    pub new_extensions: Vec<ChainDataExtension>,
}

#[derive(Debug, Default)]
struct InputCounts {
    scheduled: usize,
    user: usize,
    rejected_nonce: usize,
    rejected_stf: usize,
}

pub struct StateMachine {
    db: Db,
    read_db: Db,
    router: StfRouter,
    randomness: RandomnessSource,
    registry: SharedCdeRegistry,
    metrics: EngineMetrics,
}

impl StateMachine {
    pub fn new(
        db: Db,
        read_db: Db,
        router: StfRouter,
        randomness: RandomnessSource,
        registry: SharedCdeRegistry,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            db,
            read_db,
            router,
            randomness,
            registry,
            metrics,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn registry(&self) -> &SharedCdeRegistry {
        &self.registry
    }

    pub async fn latest_processed_block_height(&self) -> SmResult<Option<u64>> {
        let mut pooled = self.db.connect().await.map_err(SmError::db)?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        progress::latest_processed_block_height(conn).await
    }

    /// Compare the configured extensions with the snapshot saved on first boot.
    pub async fn check_cde_config(&self) -> SmResult<()> {
        let configured = self.registry.read().await.static_snapshot()?;
        let mut pooled = self.db.connect().await.map_err(SmError::db)?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let persisted: Vec<CdeConfigRow> = cde_config::table
            .order(cde_config::cde_id.asc())
            .select(CdeConfigRow::as_select())
            .load(conn)
            .await?;

        if persisted.is_empty() {
            let rows: Vec<CdeConfigRow> = configured.iter().map(snapshot_row).collect();
            diesel::insert_into(cde_config::table)
                .values(&rows)
                .execute(conn)
                .await?;
            info!("[cde] saved config snapshot of {} extensions", rows.len());
            return Ok(());
        }

        match diff_cde_config(&persisted, &configured) {
            Some(diff) => Err(SmError::Config(format!(
                "extension config differs from the synced database ({}); resync from scratch",
                diff
            ))),
            None => {
                info!("[cde] config snapshot matches {} extensions", persisted.len());
                Ok(())
            }
        }
    }

    /// Register extensions created by dynamic primitives in earlier runs.
    pub async fn load_dynamic_extensions(&self) -> SmResult<usize> {
        let mut pooled = self.db.connect().await.map_err(SmError::db)?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let rows: Vec<DynamicPrimitiveConfig> = cde_dynamic_primitive_config::table
            .order(cde_dynamic_primitive_config::cde_id.asc())
            .select(DynamicPrimitiveConfig::as_select())
            .load(conn)
            .await?;
        let mut registry = self.registry.write().await;
        for row in &rows {
            let config = serde_json::from_value(row.config.clone()).map_err(|e| {
                SmError::Fatal(format!("unreadable dynamic extension {}: {}", row.cde_name, e))
            })?;
            registry.register_dynamic(row.cde_id as u32, config)?;
        }
        if !rows.is_empty() {
            info!("[cde] restored {} dynamic extensions", rows.len());
        }
        Ok(rows.len())
    }

    /// Apply one block atomically.
    pub async fn process_block(&self, block: &ChainData) -> SmResult<BlockOutcome> {
        let block_height = block.block_number;
        let stf = self.router.route(block_height).ok_or_else(|| {
            SmError::Config(format!("no STF version covers block #{}", block_height))
        })?;
        let effects = process_datums(&block.extension_datums, block_height, false);
        let announced: Vec<(u64, DynamicAnnouncement)> = effects
            .announcements
            .iter()
            .map(|a| (block_height, a.clone()))
            .collect();
        let dynamic = self.resolve_announcements(&announced).await?;

        let mut pooled = self.db.connect().await.map_err(SmError::db)?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let effects = &effects;
        let dynamic_ref = &dynamic;
        let stf: &dyn StateTransition = stf.as_ref();

        let counts = conn
            .transaction::<_, SmError, _>(|conn| {
                async move {
                    let seed = self
                        .randomness
                        .seed_for_block(conn, block_height, &block.block_hash)
                        .await?;
                    upsert_block_seed(conn, block_height, &seed).await?;
                    let mut rng = rng_from_seed(&seed);

                    for update in &effects.updates {
                        update.to_query().execute(conn).await?;
                    }
                    insert_scheduled(conn, &effects.scheduled).await?;
                    for dynamic in dynamic_ref {
                        persist_dynamic(conn, dynamic).await?;
                    }

                    let mut counts = InputCounts::default();
                    for row in due_inputs(conn, block_height, block.timestamp).await? {
                        let input = StfInput {
                            block_height,
                            timestamp: block.timestamp,
                            data: to_submitted(&row),
                        };
                        if self.apply_input(conn, stf, &input, &mut rng).await? {
                            counts.scheduled += 1;
                        } else {
                            counts.rejected_stf += 1;
                        }
                        delete_scheduled(conn, row.id).await?;
                    }

                    for data in &block.submitted_data {
                        if !data.input_nonce.is_empty()
                            && !insert_nonce(conn, &data.input_nonce, block_height).await?
                        {
                            debug!(
                                "[sm] #{} skipping input with used nonce {}",
                                block_height, data.input_nonce
                            );
                            counts.rejected_nonce += 1;
                            continue;
                        }
                        let input = StfInput {
                            block_height,
                            timestamp: block.timestamp,
                            data: data.clone(),
                        };
                        if self.apply_input(conn, stf, &input, &mut rng).await? {
                            counts.user += 1;
                        } else {
                            counts.rejected_stf += 1;
                        }
                    }

                    if let Some(emulated) = &block.emulated {
                        upsert_emulated_mapping(
                            conn,
                            block_height,
                            emulated.deployment_chain_block_height,
                            block.timestamp,
                        )
                        .await?;
                    }

                    diesel::update(
                        block_heights::table.filter(block_heights::block_height.eq(block_height as i64)),
                    )
                    .set(block_heights::done.eq(true))
                    .execute(conn)
                    .await?;
                    Ok(counts)
                }
                .scope_boxed()
            })
            .await?;

        let new_extensions = self.register_dynamic(&dynamic).await?;
        self.record_block(block_height, &counts);
        Ok(BlockOutcome {
            block_height,
            scheduled_inputs: counts.scheduled,
            user_inputs: counts.user,
            rejected_nonce: counts.rejected_nonce,
            rejected_stf: counts.rejected_stf,
            new_extensions,
        })
    }

    /// Apply one presync step: state writes only, plus the progress rows.
    ///
    /// When a dynamic primitive fires inside a window, the window is cut at that block so
    /// the next step re-reads the rest with the new extension registered.
    pub async fn process_presync(&self, data: &PresyncChainData) -> SmResult<Vec<ChainDataExtension>> {
        let mut datums = order_datums(data.extension_datums.clone());
        let mut to_position = data.to_position;
        if to_position.is_some() {
            if let Some(cut) = datums
                .iter()
                .find(|d| matches!(d.payload, CdeDatumPayload::DynamicEvmPrimitive { .. }))
                .map(|d| d.block_number)
            {
                datums.retain(|d| d.block_number <= cut);
                to_position = Some(cut);
            }
        }

        let mut updates = Vec::new();
        let mut announced = Vec::new();
        for datum in &datums {
            let effects = process_datum(datum, datum.block_number, true);
            updates.extend(effects.updates);
            announced.extend(
                effects
                    .announcements
                    .into_iter()
                    .map(|a| (datum.block_number, a)),
            );
        }
        // One pass over the whole window so ids stay consecutive.
        let dynamic = self.resolve_announcements(&announced).await?;

        let mut pooled = self.db.connect().await.map_err(SmError::db)?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let updates = &updates;
        let dynamic_ref = &dynamic;
        let datum_count = datums.len();
        conn.transaction::<_, SmError, _>(|conn| {
            async move {
                for update in updates {
                    update.to_query().execute(conn).await?;
                }
                for dynamic in dynamic_ref {
                    persist_dynamic(conn, dynamic).await?;
                }
                if let Some(to) = to_position {
                    progress::mark_presync_window(conn, &data.network, to, datum_count).await?;
                }
                for cursor in &data.cursors {
                    progress::save_cursor(conn, cursor).await?;
                }
                Ok(())
            }
            .scope_boxed()
        })
        .await?;

        self.metrics
            .presync_datums
            .with_label_values(&[data.network.as_str()])
            .inc_by(datum_count as u64);
        self.register_dynamic(&dynamic).await
    }

    /// Returns whether the STF accepted the input.
    async fn apply_input(
        &self,
        conn: &mut AsyncPgConnection,
        stf: &dyn StateTransition,
        input: &StfInput,
        rng: &mut ChaCha20Rng,
    ) -> SmResult<bool> {
        match stf.apply(input, rng, &self.read_db).await {
            Ok(updates) => {
                for update in &updates {
                    update.to_query().execute(conn).await?;
                }
                Ok(true)
            }
            Err(StfError::InvalidInput(reason)) => {
                warn!(
                    "[sm] #{} input rejected by STF: {} ({})",
                    input.block_height, reason, input.data.input_data
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_announcements(
        &self,
        announced: &[(u64, DynamicAnnouncement)],
    ) -> SmResult<Vec<DynamicExtension>> {
        if announced.is_empty() {
            return Ok(Vec::new());
        }
        let registry = self.registry.read().await;
        resolve_announcements(&registry, announced)
    }

    async fn register_dynamic(&self, dynamic: &[DynamicExtension]) -> SmResult<Vec<ChainDataExtension>> {
        if dynamic.is_empty() {
            return Ok(Vec::new());
        }
        let mut registry = self.registry.write().await;
        for d in dynamic {
            registry.register_dynamic(d.extension.cde_id, d.extension.config.clone())?;
            info!(
                "[cde] {} registered {} (id {}) from block #{}",
                d.parent_name,
                d.extension.name(),
                d.extension.cde_id,
                d.extension.start_block_height()
            );
        }
        Ok(dynamic.iter().map(|d| d.extension.clone()).collect())
    }

    fn record_block(&self, block_height: u64, counts: &InputCounts) {
        self.metrics.latest_processed_block.set(block_height as i64);
        self.metrics.blocks_processed.inc();
        self.metrics
            .inputs_processed
            .with_label_values(&["scheduled"])
            .inc_by(counts.scheduled as u64);
        self.metrics
            .inputs_processed
            .with_label_values(&["user"])
            .inc_by(counts.user as u64);
        self.metrics
            .inputs_rejected
            .with_label_values(&["nonce"])
            .inc_by(counts.rejected_nonce as u64);
        self.metrics
            .inputs_rejected
            .with_label_values(&["stf"])
            .inc_by(counts.rejected_stf as u64);
        debug!(
            "[sm] committed #{} ({} scheduled, {} user, {} rejected)",
            block_height,
            counts.scheduled,
            counts.user,
            counts.rejected_nonce + counts.rejected_stf
        );
    }
}

fn snapshot_row(snapshot: &CdeSnapshot) -> CdeConfigRow {
    CdeConfigRow {
        cde_id: snapshot.cde_id as i32,
        cde_name: snapshot.cde_name.clone(),
        cde_type: snapshot.cde_type.clone(),
        network: snapshot.network.clone(),
        config_hash: snapshot.config_hash.clone(),
        start_block_height: snapshot.start_block_height as i64,
    }
}

/// First difference between the persisted and the configured extension set.
pub fn diff_cde_config(persisted: &[CdeConfigRow], configured: &[CdeSnapshot]) -> Option<String> {
    if persisted.len() != configured.len() {
        return Some(format!(
            "{} extensions synced, {} configured",
            persisted.len(),
            configured.len()
        ));
    }
    persisted
        .iter()
        .zip(configured.iter().map(snapshot_row))
        .find(|(saved, current)| *saved != current)
        .map(|(saved, current)| {
            format!(
                "extension #{} was {} ({}), now {} ({})",
                saved.cde_id, saved.cde_name, saved.cde_type, current.cde_name, current.cde_type
            )
        })
}

async fn upsert_block_seed(
    conn: &mut AsyncPgConnection,
    block_height: u64,
    seed: &str,
) -> SmResult<()> {
    diesel::insert_into(block_heights::table)
        .values(BlockHeight {
            block_height: block_height as i64,
            seed: seed.to_string(),
            done: false,
        })
        .on_conflict(block_heights::block_height)
        .do_update()
        .set((block_heights::seed.eq(seed), block_heights::done.eq(false)))
        .execute(conn)
        .await?;
    Ok(())
}

/// Returns false when the nonce was already used.
async fn insert_nonce(conn: &mut AsyncPgConnection, nonce: &str, block_height: u64) -> SmResult<bool> {
    let inserted = diesel::insert_into(nonces::table)
        .values(Nonce {
            nonce: nonce.to_string(),
            block_height: block_height as i64,
        })
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    Ok(inserted == 1)
}

async fn upsert_emulated_mapping(
    conn: &mut AsyncPgConnection,
    emulated_block_height: u64,
    deployment_chain_block_height: u64,
    timestamp: u64,
) -> SmResult<()> {
    diesel::insert_into(emulated_block_heights::table)
        .values(EmulatedBlockHeight {
            emulated_block_height: emulated_block_height as i64,
            deployment_chain_block_height: deployment_chain_block_height as i64,
            second: timestamp as i64,
        })
        .on_conflict(emulated_block_heights::emulated_block_height)
        .do_update()
        .set((
            emulated_block_heights::deployment_chain_block_height
                .eq(deployment_chain_block_height as i64),
            emulated_block_heights::second.eq(timestamp as i64),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// Extensions for announcements made at the paired block heights, in order. Ids continue
/// from the registry and repeated contracts resolve once.
pub fn resolve_announcements(
    registry: &CdeRegistry,
    announced: &[(u64, DynamicAnnouncement)],
) -> SmResult<Vec<DynamicExtension>> {
    let mut next_id = registry.next_cde_id();
    let mut resolved: Vec<DynamicExtension> = Vec::new();
    for (block_height, announcement) in announced {
        let parent = registry.get(&announcement.parent_name).ok_or_else(|| {
            SmError::Fatal(format!(
                "dynamic primitive {} is not registered",
                announcement.parent_name
            ))
        })?;
        let config = announcement.target.instantiate(
            &parent.config,
            &announcement.contract_address,
            *block_height,
        );
        let known = registry.get(&config.name).is_some()
            || resolved.iter().any(|d| d.extension.name() == config.name);
        if known {
            continue;
        }
        resolved.push(DynamicExtension {
            parent_name: announcement.parent_name.clone(),
            announced_at: *block_height,
            extension: ChainDataExtension {
                cde_id: next_id,
                config,
            },
        });
        next_id += 1;
    }
    Ok(resolved)
}

async fn persist_dynamic(conn: &mut AsyncPgConnection, dynamic: &DynamicExtension) -> SmResult<()> {
    let config = serde_json::to_value(&dynamic.extension.config)
        .map_err(|e| SmError::Fatal(format!("unencodable dynamic extension: {}", e)))?;
    diesel::insert_into(cde_dynamic_primitive_config::table)
        .values(DynamicPrimitiveConfig {
            cde_name: dynamic.extension.name().to_string(),
            cde_id: dynamic.extension.cde_id as i32,
            parent_name: dynamic.parent_name.clone(),
            config,
            block_height: dynamic.announced_at as i64,
        })
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use paima_funnel::cde::ExtensionKind;

    fn snapshot(cde_id: u32, name: &str, hash: &str) -> CdeSnapshot {
        CdeSnapshot {
            cde_id,
            cde_name: name.into(),
            cde_type: "erc20".into(),
            network: "evmMain".into(),
            config_hash: hash.into(),
            start_block_height: 10,
        }
    }

    #[test]
    fn test_identical_config_has_no_diff() {
        let configured = vec![snapshot(0, "gold", "0x01"), snapshot(1, "silver", "0x02")];
        let persisted: Vec<CdeConfigRow> = configured.iter().map(snapshot_row).collect();
        assert_eq!(diff_cde_config(&persisted, &configured), None);
    }

    #[test]
    fn test_changed_hash_is_a_diff() {
        let persisted = vec![snapshot_row(&snapshot(0, "gold", "0x01"))];
        let configured = vec![snapshot(0, "gold", "0x99")];
        let diff = diff_cde_config(&persisted, &configured).unwrap();
        assert!(diff.contains("extension #0"));
    }

    #[test]
    fn test_added_extension_is_a_diff() {
        let persisted = vec![snapshot_row(&snapshot(0, "gold", "0x01"))];
        let configured = vec![snapshot(0, "gold", "0x01"), snapshot(1, "silver", "0x02")];
        assert_eq!(
            diff_cde_config(&persisted, &configured).as_deref(),
            Some("1 extensions synced, 2 configured")
        );
    }

    pub(super) fn factory_registry() -> CdeRegistry {
        use paima_funnel::cde::{DynamicTarget, DynamicTargetKind, ExtensionConfig};
        use paima_funnel::config::{NetworkConfig, NetworkKind};

        let networks = vec![NetworkConfig {
            name: "evmMain".into(),
            kind: NetworkKind::EvmMain {
                rpc_url: "http://localhost:8545".into(),
                chain_id: 31337,
                paima_l2_contract_address: "0x01".into(),
                confirmations: 0,
                funnel_block_group_size: 100,
                presync_step_size: 1000,
            },
        }];
        let factory = ExtensionConfig {
            name: "factory".into(),
            network: "evmMain".into(),
            start_block_height: 0,
            scheduled_prefix: None,
            kind: ExtensionKind::DynamicEvmPrimitive {
                contract_address: "0x00000000000000000000000000000000000000ff".into(),
                event_abi: serde_json::json!({}),
                address_field: "token".into(),
                target: DynamicTarget {
                    scheduled_prefix: None,
                    kind: DynamicTargetKind::Erc20,
                },
            },
        };
        CdeRegistry::new(vec![factory], &networks).unwrap()
    }

    pub(super) fn announcement(registry: &CdeRegistry, contract_address: &str) -> DynamicAnnouncement {
        let Some(ExtensionKind::DynamicEvmPrimitive { target, .. }) =
            registry.get("factory").map(|e| e.config.kind.clone())
        else {
            panic!("factory is not a dynamic primitive");
        };
        DynamicAnnouncement {
            parent_name: "factory".into(),
            contract_address: contract_address.into(),
            target,
        }
    }

    #[test]
    fn test_announcements_in_one_pass_get_consecutive_ids() {
        let registry = factory_registry();
        let announced = vec![
            (5, announcement(&registry, "0xAA")),
            (5, announcement(&registry, "0xbb")),
            (6, announcement(&registry, "0xaa")),
        ];
        let resolved = resolve_announcements(&registry, &announced).unwrap();
        let ids: Vec<(u32, &str, u64)> = resolved
            .iter()
            .map(|d| (d.extension.cde_id, d.extension.name(), d.announced_at))
            .collect();
        assert_eq!(ids, vec![(1, "factory-0xaa", 5), (2, "factory-0xbb", 5)]);
        assert_eq!(resolved[0].extension.start_block_height(), 6);

        let mut registry = registry;
        for d in &resolved {
            registry
                .register_dynamic(d.extension.cde_id, d.extension.config.clone())
                .unwrap();
        }
        assert_eq!(registry.next_cde_id(), 3);
    }

    #[test]
    fn test_unknown_parent_is_fatal() {
        let registry = factory_registry();
        let mut orphan = announcement(&registry, "0xaa");
        orphan.parent_name = "missing".into();
        assert!(matches!(
            resolve_announcements(&registry, &[(5, orphan)]),
            Err(SmError::Fatal(_))
        ));
    }

    #[test]
    fn test_reordered_extensions_are_a_diff() {
        let persisted = vec![
            snapshot_row(&snapshot(0, "gold", "0x01")),
            snapshot_row(&snapshot(1, "silver", "0x02")),
        ];
        let configured = vec![snapshot(0, "silver", "0x02"), snapshot(1, "gold", "0x01")];
        assert!(diff_cde_config(&persisted, &configured).is_some());
    }
}

#[cfg(test)]
mod db_tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use diesel::sql_types::BigInt;
    use diesel::QueryableByName;
    use paima_funnel::cde::{CdeDatum, CdeDatumPayload, CdeRegistry};
    use paima_funnel::{InputOrigin, SubmittedData};
    use paima_pg_db::DbArgs;
    use paima_schema::MIGRATIONS;
    use rand::Rng;
    use url::Url;

    use crate::config::RandomnessConfig;
    use crate::stf::SqlUpdate;

    #[derive(QueryableByName)]
    struct Count {
        #[diesel(sql_type = BigInt)]
        cnt: i64,
    }

    struct RecordingStf;

    #[async_trait]
    impl StateTransition for RecordingStf {
        async fn apply(
            &self,
            input: &StfInput,
            rng: &mut ChaCha20Rng,
            _read_db: &Db,
        ) -> Result<Vec<SqlUpdate>, StfError> {
            match input.data.input_data.as_str() {
                "bad" => Err(StfError::InvalidInput("unknown command".into())),
                "crash" => Err(StfError::Fatal("corrupt state".into())),
                data => Ok(vec![SqlUpdate::new(
                    "INSERT INTO stf_log (block_height, input_data, roll) VALUES ($1, $2, $3)",
                )
                .int(input.block_height as i64)
                .text(data)
                .int(rng.gen_range(0..1_000_000))]),
            }
        }
    }

    async fn setup() -> StateMachine {
        setup_with_registry(CdeRegistry::default()).await
    }

    async fn setup_with_registry(registry: CdeRegistry) -> StateMachine {
        let url: Url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL environment variable must be set")
            .parse()
            .expect("Invalid database URL format");
        paima_pg_db::reset_database(url.clone(), DbArgs::default(), Some(&MIGRATIONS))
            .await
            .unwrap();
        let db = Db::for_write(url.clone(), DbArgs::default()).await.unwrap();
        let read_db = Db::for_read(url, DbArgs::default()).await.unwrap();
        {
            let mut pooled = db.connect().await.unwrap();
            let conn: &mut AsyncPgConnection = &mut pooled;
            diesel::sql_query(
                "CREATE TABLE stf_log (block_height BIGINT NOT NULL, input_data TEXT NOT NULL, roll BIGINT NOT NULL)",
            )
            .execute(conn)
            .await
            .unwrap();
        }
        StateMachine::new(
            db,
            read_db,
            StfRouter::single(Arc::new(RecordingStf)),
            RandomnessSource::new(RandomnessConfig::default()),
            registry.shared(),
            EngineMetrics::new_for_testing(),
        )
    }

    async fn count(sm: &StateMachine, sql: &str) -> i64 {
        let mut pooled = sm.db().connect().await.unwrap();
        let conn: &mut AsyncPgConnection = &mut pooled;
        let row: Count = diesel::sql_query(sql).get_result(conn).await.unwrap();
        row.cnt
    }

    fn user_input(data: &str, nonce: &str) -> SubmittedData {
        SubmittedData {
            real_address: Some("0x00000000000000000000000000000000000000a1".into()),
            input_data: data.into(),
            input_nonce: nonce.into(),
            supplied_value: "0".into(),
            scheduled: false,
            origin: InputOrigin::default(),
        }
    }

    fn block(number: u64, inputs: Vec<SubmittedData>) -> ChainData {
        ChainData {
            block_number: number,
            timestamp: 1_700_000_000 + number * 2,
            block_hash: format!("0x{:064x}", number),
            network: "eip155:31337".into(),
            submitted_data: inputs,
            extension_datums: Vec::new(),
            emulated: None,
        }
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    #[serial_test::serial]
    async fn test_reused_nonce_is_skipped() {
        let sm = setup().await;
        let first = sm
            .process_block(&block(1, vec![user_input("move", "n1")]))
            .await
            .unwrap();
        assert_eq!(first.user_inputs, 1);

        let second = sm
            .process_block(&block(2, vec![user_input("move", "n1"), user_input("jump", "n2")]))
            .await
            .unwrap();
        assert_eq!(second.user_inputs, 1);
        assert_eq!(second.rejected_nonce, 1);
        assert_eq!(count(&sm, "SELECT COUNT(*) AS cnt FROM stf_log").await, 2);
        assert_eq!(sm.latest_processed_block_height().await.unwrap(), Some(2));
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    #[serial_test::serial]
    async fn test_rejected_input_does_not_abort_block() {
        let sm = setup().await;
        let outcome = sm
            .process_block(&block(5, vec![user_input("bad", "a"), user_input("ok", "b")]))
            .await
            .unwrap();
        assert_eq!(outcome.rejected_stf, 1);
        assert_eq!(outcome.user_inputs, 1);
        assert_eq!(
            count(&sm, "SELECT COUNT(*) AS cnt FROM block_heights WHERE done").await,
            1
        );
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    #[serial_test::serial]
    async fn test_fatal_stf_error_rolls_back_block() {
        let sm = setup().await;
        let result = sm
            .process_block(&block(5, vec![user_input("ok", "a"), user_input("crash", "b")]))
            .await;
        assert!(matches!(result, Err(SmError::Stf(_))));
        assert_eq!(count(&sm, "SELECT COUNT(*) AS cnt FROM stf_log").await, 0);
        assert_eq!(count(&sm, "SELECT COUNT(*) AS cnt FROM nonces").await, 0);
        assert_eq!(sm.latest_processed_block_height().await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    #[serial_test::serial]
    async fn test_datum_schedules_input_in_same_block() {
        let sm = setup().await;
        let mut b = block(7, vec![user_input("after", "n")]);
        b.extension_datums = vec![CdeDatum {
            cde_id: 0,
            cde_name: "gold".into(),
            network: "evmMain".into(),
            block_number: 7,
            source_position: 7,
            tx_hash: None,
            scheduled_prefix: Some("gold".into()),
            burn_scheduled_prefix: None,
            payload: CdeDatumPayload::Erc20Transfer {
                from: crate::cde_processing::ZERO_ADDRESS.into(),
                to: "0x00000000000000000000000000000000000000b2".into(),
                value: "100".into(),
            },
        }];
        let outcome = sm.process_block(&b).await.unwrap();
        assert_eq!(outcome.scheduled_inputs, 1);
        assert_eq!(outcome.user_inputs, 1);
        assert_eq!(count(&sm, "SELECT COUNT(*) AS cnt FROM scheduled_data").await, 0);
        assert_eq!(
            count(&sm, "SELECT COUNT(*) AS cnt FROM cde_erc20_data WHERE balance = '100'").await,
            1
        );
        // Scheduled inputs run before user inputs.
        assert_eq!(
            count(
                &sm,
                "SELECT COUNT(*) AS cnt FROM stf_log WHERE input_data LIKE 'gold|%'"
            )
            .await,
            1
        );
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    #[serial_test::serial]
    async fn test_replay_is_deterministic() {
        async fn run() -> Vec<i64> {
            let sm = setup().await;
            for n in 1..=3 {
                sm.process_block(&block(n, vec![user_input("roll", &format!("n{}", n))]))
                    .await
                    .unwrap();
            }
            let mut pooled = sm.db().connect().await.unwrap();
            let conn: &mut AsyncPgConnection = &mut pooled;
            #[derive(QueryableByName)]
            struct Roll {
                #[diesel(sql_type = BigInt)]
                roll: i64,
            }
            let rolls: Vec<Roll> = diesel::sql_query("SELECT roll FROM stf_log ORDER BY block_height")
                .load(conn)
                .await
                .unwrap();
            rolls.into_iter().map(|r| r.roll).collect()
        }
        assert_eq!(run().await, run().await);
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    #[serial_test::serial]
    async fn test_presync_window_with_two_announcements_in_one_block() {
        let registry = super::tests::factory_registry();
        let target = super::tests::announcement(&registry, "0x00").target;
        let sm = setup_with_registry(registry).await;
        let announce = |address: &str| CdeDatum {
            cde_id: 0,
            cde_name: "factory".into(),
            network: "evmMain".into(),
            block_number: 5,
            source_position: 5,
            tx_hash: None,
            scheduled_prefix: None,
            burn_scheduled_prefix: None,
            payload: CdeDatumPayload::DynamicEvmPrimitive {
                contract_address: address.into(),
                target: target.clone(),
            },
        };
        let data = PresyncChainData {
            network: "evmMain".into(),
            to_position: Some(10),
            extension_datums: vec![announce("0xaa"), announce("0xbb")],
            cursors: Vec::new(),
        };

        let registered = sm.process_presync(&data).await.unwrap();
        let ids: Vec<(u32, String)> = registered
            .iter()
            .map(|e| (e.cde_id, e.name().to_string()))
            .collect();
        assert_eq!(
            ids,
            vec![(1, "factory-0xaa".to_string()), (2, "factory-0xbb".to_string())]
        );
        assert_eq!(
            count(
                &sm,
                "SELECT COUNT(*) AS cnt FROM cde_dynamic_primitive_config WHERE block_height = 5"
            )
            .await,
            2
        );
        assert_eq!(sm.registry().read().await.next_cde_id(), 3);
    }
}
