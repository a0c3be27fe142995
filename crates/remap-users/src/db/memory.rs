//! In-memory [`RemapDb`] backend.
//!
//! Backs integration tests and offline rehearsals with the same trait
//! surface as the SQL Server backend. The load transaction is modeled by
//! cloning the whole state at `begin_load` and writing it back on commit,
//! so an aborted session leaves the shared state untouched.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::catalog::UserFkCatalogEntry;
use crate::config::RemapPolicy;
use crate::db::{ColumnDef, IsolationLevel, LoadSession, RemapDb, SqlLit};
use crate::error::{RemapError, Result};
use crate::mapper::{SourceUser, TargetUser, UserMappingEntry};
use crate::report::ColumnRewriteSummary;
use crate::schema::{SchemaForeignKey, SchemaTable, TableKey};

/// One row, keyed by column name.
pub type MemoryRow = HashMap<String, SqlLit>;

fn get_ci<'a>(row: &'a MemoryRow, name: &str) -> Option<&'a SqlLit> {
    row.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

fn text_of(value: Option<&SqlLit>) -> Option<String> {
    match value {
        Some(SqlLit::Text(s)) => Some(s.clone()),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: Vec<SchemaTable>,
    columns: HashMap<TableKey, Vec<ColumnDef>>,
    foreign_keys: Vec<SchemaForeignKey>,
    target_rows: HashMap<TableKey, Vec<MemoryRow>>,
    staging_rows: HashMap<TableKey, Vec<MemoryRow>>,
    user_map: HashMap<String, Vec<UserMappingEntry>>,
    fk_catalog: Vec<UserFkCatalogEntry>,
    audit_rows: usize,
    disabled_constraints: HashSet<String>,
    untrusted_constraints: HashSet<String>,
    control_ready: bool,
}

#[derive(Debug, Clone, Default)]
struct FailPoints {
    enable_constraint: Option<String>,
    commit: bool,
    snapshot_isolation: bool,
}

/// Shared-state test double for the target database.
#[derive(Clone, Default)]
pub struct MemoryDb {
    state: Arc<Mutex<MemoryState>>,
    fail: Arc<Mutex<FailPoints>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| RemapError::pool("state mutex poisoned", "memory"))
    }

    fn lock_fail(&self) -> Result<MutexGuard<'_, FailPoints>> {
        self.fail
            .lock()
            .map_err(|_| RemapError::pool("fail-point mutex poisoned", "memory"))
    }

    // ----- test setup -----

    /// Register a table with its column metadata.
    pub fn add_table(&self, table: SchemaTable, columns: Vec<ColumnDef>) {
        if let Ok(mut state) = self.state.lock() {
            state.columns.insert(table.key(), columns);
            state.tables.push(table);
        }
    }

    pub fn add_foreign_key(&self, fk: SchemaForeignKey) {
        if let Ok(mut state) = self.state.lock() {
            state.foreign_keys.push(fk);
        }
    }

    pub fn set_target_rows(&self, table: &SchemaTable, rows: Vec<MemoryRow>) {
        if let Ok(mut state) = self.state.lock() {
            state.target_rows.insert(table.key(), rows);
        }
    }

    /// Make the next `enable_constraint` for this key fail.
    pub fn fail_on_enable_constraint(&self, fk_name: &str) {
        if let Ok(mut fail) = self.fail.lock() {
            fail.enable_constraint = Some(fk_name.to_string());
        }
    }

    pub fn fail_on_commit(&self) {
        if let Ok(mut fail) = self.fail.lock() {
            fail.commit = true;
        }
    }

    /// Reject `begin_load(Snapshot)` so callers exercise the
    /// read-committed fallback.
    pub fn reject_snapshot_isolation(&self) {
        if let Ok(mut fail) = self.fail.lock() {
            fail.snapshot_isolation = true;
        }
    }

    // ----- test inspection -----

    pub fn target_rows(&self, table: &SchemaTable) -> Vec<MemoryRow> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.target_rows.get(&table.key()).cloned())
            .unwrap_or_default()
    }

    pub fn staged_rows(&self, table: &SchemaTable) -> Vec<MemoryRow> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.staging_rows.get(&table.key()).cloned())
            .unwrap_or_default()
    }

    pub fn persisted_user_map(&self, source_env: &str) -> Vec<UserMappingEntry> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.user_map.get(source_env).cloned())
            .unwrap_or_default()
    }

    pub fn fk_catalog(&self) -> Vec<UserFkCatalogEntry> {
        self.state
            .lock()
            .ok()
            .map(|s| s.fk_catalog.clone())
            .unwrap_or_default()
    }

    pub fn audit_row_count(&self) -> usize {
        self.state.lock().ok().map(|s| s.audit_rows).unwrap_or(0)
    }

    fn users_from_rows(rows: &[MemoryRow]) -> Vec<SourceUser> {
        let mut users: Vec<SourceUser> = rows
            .iter()
            .filter_map(|row| {
                get_ci(row, "Id").and_then(SqlLit::as_identity).map(|id| SourceUser {
                    id,
                    email: text_of(get_ci(row, "Email")),
                    user_name: text_of(get_ci(row, "UserName")),
                    employee_number: text_of(get_ci(row, "EmployeeNumber")),
                })
            })
            .collect();
        users.sort_by_key(|u| u.id);
        users
    }
}

#[async_trait]
impl RemapDb for MemoryDb {
    async fn fetch_tables(&self) -> Result<Vec<SchemaTable>> {
        Ok(self.lock()?.tables.clone())
    }

    async fn fetch_foreign_keys(&self) -> Result<Vec<SchemaForeignKey>> {
        Ok(self.lock()?.foreign_keys.clone())
    }

    async fn fetch_columns(&self, table: &SchemaTable) -> Result<Vec<ColumnDef>> {
        self.lock()?
            .columns
            .get(&table.key())
            .cloned()
            .ok_or_else(|| {
                RemapError::Discovery(format!("unknown table {}", table.full_name()))
            })
    }

    async fn ensure_control_schema(&self) -> Result<()> {
        self.lock()?.control_ready = true;
        Ok(())
    }

    async fn ensure_staging_table(&self, table: &SchemaTable) -> Result<()> {
        let mut state = self.lock()?;
        if !state.columns.contains_key(&table.key()) {
            return Err(RemapError::staging(
                table.full_name(),
                "table does not exist in target",
            ));
        }
        state.staging_rows.insert(table.key(), Vec::new());
        Ok(())
    }

    async fn replace_fk_catalog(&self, entries: &[UserFkCatalogEntry]) -> Result<()> {
        let mut state = self.lock()?;
        if !state.control_ready {
            return Err(RemapError::Staging {
                table: "ctl.UserFkCatalog".into(),
                message: "control schema not provisioned".into(),
            });
        }
        state.fk_catalog = entries.to_vec();
        Ok(())
    }

    async fn insert_staging_rows(
        &self,
        table: &SchemaTable,
        columns: &[String],
        rows: &[Vec<SqlLit>],
    ) -> Result<u64> {
        let mut state = self.lock()?;
        let staged = state.staging_rows.get_mut(&table.key()).ok_or_else(|| {
            RemapError::staging(table.full_name(), "staging table not provisioned")
        })?;

        for row in rows {
            if row.len() != columns.len() {
                return Err(RemapError::staging(
                    table.full_name(),
                    format!("row has {} values for {} columns", row.len(), columns.len()),
                ));
            }
            staged.push(columns.iter().cloned().zip(row.iter().cloned()).collect());
        }
        Ok(rows.len() as u64)
    }

    async fn fetch_staged_source_users(
        &self,
        user_table: &SchemaTable,
    ) -> Result<Vec<SourceUser>> {
        let state = self.lock()?;
        let rows = state
            .staging_rows
            .get(&user_table.key())
            .ok_or_else(|| {
                RemapError::staging(user_table.full_name(), "staging table not provisioned")
            })?;
        Ok(Self::users_from_rows(rows))
    }

    async fn fetch_target_users(&self, user_table: &SchemaTable) -> Result<Vec<TargetUser>> {
        let state = self.lock()?;
        let rows = state
            .target_rows
            .get(&user_table.key())
            .cloned()
            .unwrap_or_default();
        Ok(Self::users_from_rows(&rows)
            .into_iter()
            .map(|u| TargetUser {
                id: u.id,
                email: u.email,
                user_name: u.user_name,
                employee_number: u.employee_number,
            })
            .collect())
    }

    async fn fetch_user_map(&self, source_env: &str) -> Result<Vec<UserMappingEntry>> {
        Ok(self
            .lock()?
            .user_map
            .get(source_env)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_user_map(
        &self,
        source_env: &str,
        entries: &[UserMappingEntry],
    ) -> Result<()> {
        self.lock()?
            .user_map
            .insert(source_env.to_string(), entries.to_vec());
        Ok(())
    }

    async fn rewrite_staged_column(
        &self,
        entry: &UserFkCatalogEntry,
        policy: RemapPolicy,
        fallback_user_id: Option<i64>,
        source_env: &str,
    ) -> Result<ColumnRewriteSummary> {
        let table = entry.table();
        let mut state = self.lock()?;

        let nullable = state
            .columns
            .get(&table.key())
            .and_then(|cols| {
                cols.iter()
                    .find(|c| c.name.eq_ignore_ascii_case(&entry.column_name))
            })
            .map(|c| c.is_nullable)
            .ok_or_else(|| {
                RemapError::rewrite(
                    table.full_name(),
                    &entry.column_name,
                    "column not found in target schema",
                )
            })?;

        let map: HashMap<i64, i64> = state
            .user_map
            .get(source_env)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| (e.source_user_id, e.target_user_id))
                    .collect()
            })
            .unwrap_or_default();

        let rows = state.staging_rows.get_mut(&table.key()).ok_or_else(|| {
            RemapError::staging(table.full_name(), "staging table not provisioned")
        })?;

        let mut summary = ColumnRewriteSummary {
            remapped_rows: 0,
            reassigned_rows: 0,
            pruned_rows: 0,
            unmapped_rows: 0,
            policy,
        };
        let mut audited = 0usize;
        let mut keep = Vec::with_capacity(rows.len());

        for mut row in rows.drain(..) {
            let value = get_ci(&row, &entry.column_name).and_then(SqlLit::as_identity);
            let Some(source_id) = value else {
                keep.push(row);
                continue;
            };

            let key = row
                .keys()
                .find(|k| k.eq_ignore_ascii_case(&entry.column_name))
                .cloned()
                .unwrap_or_else(|| entry.column_name.clone());

            match map.get(&source_id) {
                Some(target_id) => {
                    if *target_id != source_id {
                        audited += 1;
                    }
                    row.insert(key, SqlLit::Int(*target_id));
                    summary.remapped_rows += 1;
                    keep.push(row);
                }
                None => match policy {
                    RemapPolicy::Reassign => {
                        let fallback = fallback_user_id.ok_or_else(|| {
                            RemapError::rewrite(
                                table.full_name(),
                                &entry.column_name,
                                "reassign policy requires a fallback user id",
                            )
                        })?;
                        row.insert(key, SqlLit::Int(fallback));
                        summary.reassigned_rows += 1;
                        audited += 1;
                        keep.push(row);
                    }
                    RemapPolicy::Prune => {
                        summary.pruned_rows += 1;
                        audited += 1;
                        if nullable {
                            row.insert(key, SqlLit::Null);
                            keep.push(row);
                        }
                    }
                },
            }
        }
        *rows = keep;
        state.audit_rows += audited;

        debug!(
            table = %table.full_name(),
            column = %entry.column_name,
            remapped = summary.remapped_rows,
            "rewrote staged column"
        );
        Ok(summary)
    }

    async fn begin_load(&self, isolation: IsolationLevel) -> Result<Box<dyn LoadSession>> {
        if isolation == IsolationLevel::Snapshot && self.lock_fail()?.snapshot_isolation {
            return Err(RemapError::Load(
                "snapshot isolation is not enabled on this database".into(),
            ));
        }

        let working = self.lock()?.clone();
        Ok(Box::new(MemoryLoadSession {
            shared: Arc::clone(&self.state),
            fail: Arc::clone(&self.fail),
            working,
        }))
    }

    async fn count_disabled_foreign_keys(&self) -> Result<i64> {
        Ok(self.lock()?.disabled_constraints.len() as i64)
    }

    async fn count_untrusted_foreign_keys(&self) -> Result<i64> {
        Ok(self.lock()?.untrusted_constraints.len() as i64)
    }

    async fn count_orphan_rows(&self, fk: &SchemaForeignKey) -> Result<i64> {
        let state = self.lock()?;
        let parents: HashSet<i64> = state
            .target_rows
            .get(&fk.ref_table.key())
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| get_ci(r, &fk.ref_column).and_then(SqlLit::as_identity))
                    .collect()
            })
            .unwrap_or_default();

        let orphans = state
            .target_rows
            .get(&fk.table.key())
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| get_ci(r, &fk.column).and_then(SqlLit::as_identity))
                    .filter(|id| !parents.contains(id))
                    .count()
            })
            .unwrap_or(0);
        Ok(orphans as i64)
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    async fn close(&self) {}
}

struct MemoryLoadSession {
    shared: Arc<Mutex<MemoryState>>,
    fail: Arc<Mutex<FailPoints>>,
    working: MemoryState,
}

#[async_trait]
impl LoadSession for MemoryLoadSession {
    async fn disable_constraint(&mut self, fk: &SchemaForeignKey) -> Result<()> {
        self.working.disabled_constraints.insert(fk.name.clone());
        Ok(())
    }

    async fn swap_in_staged_rows(&mut self, table: &SchemaTable) -> Result<u64> {
        let staged = self
            .working
            .staging_rows
            .get(&table.key())
            .cloned()
            .ok_or_else(|| {
                RemapError::Load(format!(
                    "no staged rows for {}",
                    table.full_name()
                ))
            })?;
        let count = staged.len() as u64;
        self.working.target_rows.insert(table.key(), staged);
        Ok(count)
    }

    async fn enable_constraint(&mut self, fk: &SchemaForeignKey) -> Result<()> {
        let should_fail = self
            .fail
            .lock()
            .ok()
            .map(|f| f.enable_constraint.as_deref() == Some(fk.name.as_str()))
            .unwrap_or(false);
        if should_fail {
            return Err(RemapError::Load(format!(
                "constraint {} failed revalidation",
                fk.name
            )));
        }
        self.working.disabled_constraints.remove(&fk.name);
        self.working.untrusted_constraints.remove(&fk.name);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let commit_fails = self
            .fail
            .lock()
            .ok()
            .map(|f| f.commit)
            .unwrap_or(false);
        if commit_fails {
            return Err(RemapError::Load("commit rejected".into()));
        }
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| RemapError::pool("state mutex poisoned", "memory"))?;
        *shared = self.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // Working copy is simply dropped.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_table() -> SchemaTable {
        SchemaTable::parse("dbo.User")
    }

    fn user_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef {
                name: "Id".into(),
                data_type: "bigint".into(),
                is_nullable: false,
            },
            ColumnDef {
                name: "Email".into(),
                data_type: "nvarchar".into(),
                is_nullable: true,
            },
        ]
    }

    fn row(pairs: &[(&str, SqlLit)]) -> MemoryRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_staging_round_trip() {
        let db = MemoryDb::new();
        db.add_table(user_table(), user_columns());

        db.ensure_staging_table(&user_table()).await.unwrap();
        let inserted = db
            .insert_staging_rows(
                &user_table(),
                &["Id".into(), "Email".into()],
                &[vec![SqlLit::Int(1), SqlLit::Text("a@b.com".into())]],
            )
            .await
            .unwrap();

        assert_eq!(inserted, 1);
        let users = db.fetch_staged_source_users(&user_table()).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].email.as_deref(), Some("a@b.com"));
    }

    #[tokio::test]
    async fn test_uncommitted_session_changes_nothing() {
        let db = MemoryDb::new();
        db.add_table(user_table(), user_columns());
        db.set_target_rows(&user_table(), vec![row(&[("Id", SqlLit::Int(1))])]);
        db.ensure_staging_table(&user_table()).await.unwrap();

        let mut session = db.begin_load(IsolationLevel::Snapshot).await.unwrap();
        session.swap_in_staged_rows(&user_table()).await.unwrap();
        session.rollback().await.unwrap();

        assert_eq!(db.target_rows(&user_table()).len(), 1);
    }

    #[tokio::test]
    async fn test_commit_publishes_working_state() {
        let db = MemoryDb::new();
        db.add_table(user_table(), user_columns());
        db.set_target_rows(&user_table(), vec![row(&[("Id", SqlLit::Int(1))])]);
        db.ensure_staging_table(&user_table()).await.unwrap();
        db.insert_staging_rows(
            &user_table(),
            &["Id".into()],
            &[vec![SqlLit::Int(10)], vec![SqlLit::Int(11)]],
        )
        .await
        .unwrap();

        let mut session = db.begin_load(IsolationLevel::Snapshot).await.unwrap();
        let swapped = session.swap_in_staged_rows(&user_table()).await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(swapped, 2);
        assert_eq!(db.target_rows(&user_table()).len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_isolation_rejection() {
        let db = MemoryDb::new();
        db.reject_snapshot_isolation();

        assert!(db.begin_load(IsolationLevel::Snapshot).await.is_err());
        assert!(db.begin_load(IsolationLevel::ReadCommitted).await.is_ok());
    }

    #[tokio::test]
    async fn test_prune_deletes_rows_for_non_nullable_column() {
        let db = MemoryDb::new();
        let orders = SchemaTable::parse("dbo.Order");
        db.add_table(
            orders.clone(),
            vec![
                ColumnDef {
                    name: "Id".into(),
                    data_type: "bigint".into(),
                    is_nullable: false,
                },
                ColumnDef {
                    name: "CreatedBy".into(),
                    data_type: "bigint".into(),
                    is_nullable: false,
                },
            ],
        );
        db.ensure_staging_table(&orders).await.unwrap();
        db.insert_staging_rows(
            &orders,
            &["Id".into(), "CreatedBy".into()],
            &[
                vec![SqlLit::Int(1), SqlLit::Int(100)],
                vec![SqlLit::Int(2), SqlLit::Int(999)],
            ],
        )
        .await
        .unwrap();
        db.replace_user_map(
            "PROD",
            &[UserMappingEntry {
                source_user_id: 100,
                source_email: None,
                source_user_name: None,
                source_employee_number: None,
                target_user_id: 7,
                match_reason: "Email".into(),
            }],
        )
        .await
        .unwrap();

        let entry = UserFkCatalogEntry {
            table_schema: "dbo".into(),
            table_name: "Order".into(),
            column_name: "CreatedBy".into(),
            path_segments: vec![],
        };
        let summary = db
            .rewrite_staged_column(&entry, RemapPolicy::Prune, None, "PROD")
            .await
            .unwrap();

        assert_eq!(summary.remapped_rows, 1);
        assert_eq!(summary.pruned_rows, 1);
        assert_eq!(db.staged_rows(&orders).len(), 1);
    }
}
