//! Step implementations for [`super::RemapPipeline`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::artifact::{write_json_artifact, ArtifactSink, FsArtifactSink};
use crate::catalog::build_catalog;
use crate::db::{IsolationLevel, LoadSession};
use crate::error::{RemapError, Result};
use crate::mapper::{build_user_map, redact, UserMapReport};
use crate::report::{build_dry_run_summary, PostLoadValidationReport};
use crate::schema::{SchemaForeignKey, SchemaGraph, SchemaTable};
use crate::snapshot::SnapshotStore;
use crate::state::RemapState;

use super::RemapPipeline;

impl RemapPipeline {
    /// Discover the target schema and derive the load order and catalog.
    pub(super) async fn discover(&self, state: &mut RemapState) -> Result<String> {
        let graph = SchemaGraph::discover(self.db.as_ref()).await?;

        if !graph.tables().contains(&self.ctx.user_table) {
            return Err(RemapError::Discovery(format!(
                "user table {} does not exist in the target database",
                self.ctx.user_table.full_name()
            )));
        }

        state.load_order = graph.topo_sorted_tables();
        state.foreign_keys = graph.foreign_keys().to_vec();
        state.catalog = build_catalog(&graph, &self.ctx.user_table);

        Ok(format!(
            "{} tables, {} foreign keys, {} user-keyed columns",
            state.load_order.len(),
            state.foreign_keys.len(),
            state.catalog.len()
        ))
    }

    /// Provision ctl.* bookkeeping and stg.* clones, then publish the catalog.
    pub(super) async fn provision(&self, state: &mut RemapState) -> Result<String> {
        self.db.ensure_control_schema().await?;

        let tables = self.stage_set(state);
        for table in &tables {
            self.db.ensure_staging_table(table).await?;
        }
        self.db.replace_fk_catalog(&state.catalog).await?;

        Ok(format!("{} staging tables ready", tables.len()))
    }

    /// Load snapshot files into their staging tables, up to
    /// `parallelism` tables at a time.
    ///
    /// A missing snapshot for the user table is fatal; any other table is
    /// skipped with a warning and excluded from the swap.
    pub(super) async fn stage(
        &self,
        state: &mut RemapState,
        cancel: &watch::Receiver<bool>,
    ) -> Result<String> {
        let store = SnapshotStore::new(&self.ctx.snapshot_path);

        // Resolve files up front so a missing user-table snapshot fails
        // before any rows move.
        let mut to_stage = Vec::new();
        for table in self.stage_set(state) {
            if store.locate(&table).is_none() {
                if table == self.ctx.user_table {
                    return Err(RemapError::Snapshot(format!(
                        "snapshot has no file for the user table {}",
                        table.full_name()
                    )));
                }
                warn!(
                    table = %table.full_name(),
                    "no snapshot file, table keeps its current target rows"
                );
                state.skipped_tables.push(table.full_name());
                continue;
            }
            to_stage.push(table);
        }

        let semaphore = Arc::new(Semaphore::new(self.ctx.parallelism.max(1)));
        let mut workers: JoinSet<Result<(String, u64)>> = JoinSet::new();
        for table in to_stage {
            if *cancel.borrow() {
                return Err(RemapError::Cancelled);
            }
            let semaphore = Arc::clone(&semaphore);
            let db = Arc::clone(&self.db);
            let snapshot_path = self.ctx.snapshot_path.clone();
            let batch_size = self.ctx.batch_size.max(1);
            workers.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| {
                    RemapError::staging(table.full_name(), "staging pool closed")
                })?;
                let columns = db.fetch_columns(&table).await?;
                let data = SnapshotStore::new(snapshot_path).load_table(&table, &columns)?;
                let mut inserted = 0u64;
                for chunk in data.rows.chunks(batch_size) {
                    inserted += db
                        .insert_staging_rows(&table, &data.columns, chunk)
                        .await?;
                }
                Ok((table.full_name(), inserted))
            });
        }

        while let Some(joined) = workers.join_next().await {
            let (table, inserted) = joined
                .map_err(|e| RemapError::pool(e.to_string(), "staging worker"))??;
            state.staged_row_counts.insert(table, inserted);
        }

        Ok(format!(
            "{} rows staged across {} tables ({} skipped)",
            state.total_staged_rows(),
            state.staged_row_counts.len(),
            state.skipped_tables.len()
        ))
    }

    /// Resolve the source-to-target identity map, or reuse the persisted one.
    pub(super) async fn build_map(&self, state: &mut RemapState) -> Result<String> {
        if !self.ctx.rebuild_map {
            let existing = self.db.fetch_user_map(&self.ctx.source_env).await?;
            if !existing.is_empty() {
                let mut report = UserMapReport {
                    total_source_users: existing.len(),
                    ..Default::default()
                };
                for entry in &existing {
                    *report
                        .matched_by_reason
                        .entry(entry.match_reason.clone())
                        .or_insert(0) += 1;
                }
                info!(entries = existing.len(), "reusing persisted user map");
                state.map_report = Some(report);
                return Ok(format!("reused {} persisted mappings", existing.len()));
            }
            debug!("no persisted map to reuse, building a fresh one");
        }

        let sources = self
            .db
            .fetch_staged_source_users(&self.ctx.user_table)
            .await?;
        let targets = self.db.fetch_target_users(&self.ctx.user_table).await?;
        let (entries, report) = build_user_map(
            &sources,
            &targets,
            &self.ctx.match_rules,
            self.ctx.fallback_user_id,
            self.ctx.include_pii,
        );
        self.db
            .replace_user_map(&self.ctx.source_env, &entries)
            .await?;

        let detail = format!(
            "{} of {} source users resolved",
            report.resolved_count(),
            report.total_source_users
        );
        state.map_report = Some(report);
        Ok(detail)
    }

    /// Rewrite every cataloged column in staging.
    pub(super) async fn rewrite(
        &self,
        state: &mut RemapState,
        cancel: &watch::Receiver<bool>,
    ) -> Result<String> {
        for entry in &state.catalog {
            if *cancel.borrow() {
                return Err(RemapError::Cancelled);
            }
            let table = entry.table();
            if table == self.ctx.user_table {
                // The user table itself is never swapped; its staged rows
                // only feed map building.
                debug!(column = %entry.column_name, "skipping rewrite on the user table");
                continue;
            }
            if !state.staged_row_counts.contains_key(&table.full_name()) {
                debug!(
                    table = %table.full_name(),
                    "table was not staged, skipping rewrite"
                );
                continue;
            }

            let summary = self
                .db
                .rewrite_staged_column(
                    entry,
                    self.ctx.policy,
                    self.ctx.fallback_user_id,
                    &self.ctx.source_env,
                )
                .await?;
            state.rewrite_summaries.push((entry.clone(), summary));
        }

        let remapped: i64 = state
            .rewrite_summaries
            .iter()
            .map(|(_, s)| s.remapped_rows)
            .sum();
        Ok(format!(
            "{} columns rewritten, {} rows remapped",
            state.rewrite_summaries.len(),
            remapped
        ))
    }

    /// Aggregate the per-column outcomes into the operator-facing summary.
    pub(super) async fn report(&self, state: &mut RemapState) -> Result<String> {
        let summary = build_dry_run_summary(
            self.ctx.dry_run_hash(),
            self.ctx.dry_run,
            &state.rewrite_summaries,
        );
        let detail = format!(
            "{} remapped / {} reassigned / {} pruned / {} unmapped",
            summary.total_remapped,
            summary.total_reassigned,
            summary.total_pruned,
            summary.total_unmapped
        );
        state.dry_run_summary = Some(summary);
        Ok(detail)
    }

    /// Swap rewritten staging rows into the target inside one transaction.
    /// Cancellation between tables rolls the whole transaction back.
    pub(super) async fn load(
        &self,
        state: &mut RemapState,
        cancel: &watch::Receiver<bool>,
    ) -> Result<String> {
        let swap = self.swap_set(state);
        if swap.is_empty() {
            return Ok("nothing to load".to_string());
        }
        let fks = self.fks_touching(&swap, state);

        let mut session = match self.db.begin_load(IsolationLevel::Snapshot).await {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    error = %e,
                    "snapshot isolation unavailable, retrying with read committed"
                );
                self.db.begin_load(IsolationLevel::ReadCommitted).await?
            }
        };

        match self
            .load_within(&mut session, &swap, &fks, state, cancel)
            .await
        {
            Ok(()) => {
                session.commit().await?;
                Ok(format!(
                    "{} rows loaded into {} tables",
                    state.total_loaded_rows(),
                    swap.len()
                ))
            }
            Err(e) => {
                state.loaded_row_counts.clear();
                if let Err(rollback_err) = session.rollback().await {
                    warn!(error = %rollback_err, "rollback after load failure also failed");
                }
                Err(e)
            }
        }
    }

    async fn load_within(
        &self,
        session: &mut Box<dyn LoadSession>,
        swap: &[SchemaTable],
        fks: &[SchemaForeignKey],
        state: &mut RemapState,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        for fk in fks {
            session.disable_constraint(fk).await?;
        }

        let mut counts = BTreeMap::new();
        for table in swap {
            if *cancel.borrow() {
                return Err(RemapError::Cancelled);
            }
            let loaded = session.swap_in_staged_rows(table).await?;
            counts.insert(table.full_name(), loaded);
        }

        // WITH CHECK here is the first integrity gate: a bad rewrite fails
        // revalidation and rolls the whole load back.
        for fk in fks {
            session.enable_constraint(fk).await?;
        }

        state.loaded_row_counts = counts;
        Ok(())
    }

    /// Verify constraint health after a committed load.
    pub(super) async fn validate(&self, state: &mut RemapState) -> Result<String> {
        let swap = self.swap_set(state);
        let fks = self.fks_touching(&swap, state);

        let mut report = PostLoadValidationReport {
            disabled_foreign_keys: self.db.count_disabled_foreign_keys().await?,
            untrusted_foreign_keys: self.db.count_untrusted_foreign_keys().await?,
            referential_integrity_verified: true,
            validation_errors: Vec::new(),
        };

        if report.disabled_foreign_keys > 0 {
            report.validation_errors.push(format!(
                "{} foreign keys are still disabled",
                report.disabled_foreign_keys
            ));
        }
        if report.untrusted_foreign_keys > 0 {
            report.validation_errors.push(format!(
                "{} foreign keys are enabled but untrusted",
                report.untrusted_foreign_keys
            ));
        }

        for fk in &fks {
            let orphans = self.db.count_orphan_rows(fk).await?;
            if orphans > 0 {
                report.referential_integrity_verified = false;
                report.validation_errors.push(format!(
                    "{}: {} orphaned rows in {}.{}",
                    fk.name,
                    orphans,
                    fk.table.full_name(),
                    fk.column
                ));
            }
        }

        let clean = report.is_clean();
        let detail = if clean {
            format!("{} foreign keys verified", fks.len())
        } else {
            report.validation_errors.join("; ")
        };
        state.validation_report = Some(report);

        if clean {
            Ok(detail)
        } else {
            Err(RemapError::Validation(detail))
        }
    }

    /// Write every report the run produced, plus the step record.
    pub(super) async fn emit_artifacts(
        &self,
        state: &RemapState,
        sink: &FsArtifactSink,
    ) -> Result<()> {
        if let Some(summary) = &state.dry_run_summary {
            write_json_artifact(sink, "dry_run_report.json", summary)?;
        }
        if let Some(report) = &state.map_report {
            write_json_artifact(sink, "user_map_report.json", report)?;
        }
        if let Some(report) = &state.validation_report {
            write_json_artifact(sink, "validation_report.json", report)?;
        }
        if !state.catalog.is_empty() {
            write_json_artifact(sink, "fk_catalog.json", &state.catalog)?;
        }
        write_json_artifact(sink, "steps.json", &state.step_outcomes)?;

        // The map CSV comes from the persisted map; if the database is
        // unreachable at this point the other artifacts still land.
        match self.db.fetch_user_map(&self.ctx.source_env).await {
            Ok(entries) if !entries.is_empty() => {
                let mask = |value: &Option<String>| match value {
                    Some(v) if self.ctx.include_pii => v.clone(),
                    Some(v) => redact(v),
                    None => String::new(),
                };
                let rows: Vec<Vec<String>> = entries
                    .iter()
                    .map(|e| {
                        vec![
                            e.source_user_id.to_string(),
                            mask(&e.source_email),
                            mask(&e.source_user_name),
                            mask(&e.source_employee_number),
                            e.target_user_id.to_string(),
                            e.match_reason.clone(),
                        ]
                    })
                    .collect();
                sink.write_csv(
                    "user_map.csv",
                    &[
                        "SourceUserId",
                        "SourceEmail",
                        "SourceUserName",
                        "SourceEmployeeNumber",
                        "TargetUserId",
                        "MatchReason",
                    ],
                    &rows,
                )?;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not read persisted map for the CSV artifact"),
        }

        Ok(())
    }

    /// Tables that get a staging clone: every table in load order. Tables
    /// without a user-keyed column still carry snapshot rows the target
    /// needs, so nothing is filtered out here; the rewrite confines itself
    /// to cataloged columns.
    fn stage_set(&self, state: &RemapState) -> Vec<SchemaTable> {
        state.load_order.clone()
    }

    /// Tables whose staged rows replace the target rows: everything that
    /// actually staged, in load order. The user table is excluded: the
    /// target's identity inventory stays authoritative.
    fn swap_set(&self, state: &RemapState) -> Vec<SchemaTable> {
        self.stage_set(state)
            .into_iter()
            .filter(|table| *table != self.ctx.user_table)
            .filter(|table| state.staged_row_counts.contains_key(&table.full_name()))
            .collect()
    }

    /// Foreign keys that must be disabled around the swap: every constraint
    /// with either end on a swapped table.
    fn fks_touching(&self, swap: &[SchemaTable], state: &RemapState) -> Vec<SchemaForeignKey> {
        state
            .foreign_keys
            .iter()
            .filter(|fk| swap.contains(&fk.table) || swap.contains(&fk.ref_table))
            .cloned()
            .collect()
    }
}
