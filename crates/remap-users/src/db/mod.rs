//! Database abstraction for the remap engine.
//!
//! [`RemapDb`] is the seam between the pipeline steps and a concrete
//! backend: [`mssql::MssqlDb`] for SQL Server and [`memory::MemoryDb`] for
//! tests and offline rehearsals. [`LoadSession`] scopes the transactional
//! cutover so the loader step owns the disable/swap/enable/commit state
//! machine while backends own the statements.

pub mod memory;
pub mod mssql;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::UserFkCatalogEntry;
use crate::config::RemapPolicy;
use crate::error::Result;
use crate::mapper::{SourceUser, TargetUser, UserMappingEntry};
use crate::report::ColumnRewriteSummary;
use crate::schema::{SchemaForeignKey, SchemaTable};

/// Column metadata used for snapshot value coercion and rewrite decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,

    /// Data type (e.g. "int", "nvarchar", "datetime2").
    pub data_type: String,

    /// Whether the column allows NULL.
    pub is_nullable: bool,
}

/// A coerced scalar ready to be written into a staging table.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlLit {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlLit {
    /// Render as a T-SQL literal. Single quotes are doubled; text uses the
    /// `N''` Unicode form.
    pub fn to_mssql_literal(&self) -> String {
        match self {
            SqlLit::Null => "NULL".to_string(),
            SqlLit::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            SqlLit::Int(v) => v.to_string(),
            SqlLit::Float(v) => v.to_string(),
            SqlLit::Text(v) => format!("N'{}'", v.replace('\'', "''")),
        }
    }

    /// Identity value carried by this literal, if it is one.
    pub fn as_identity(&self) -> Option<i64> {
        match self {
            SqlLit::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlLit::Null)
    }
}

/// Transaction isolation requested for the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Snapshot,
    ReadCommitted,
}

/// Target database operations used by the pipeline steps.
#[async_trait]
pub trait RemapDb: Send + Sync {
    // ===== Schema discovery =====

    /// All user tables, excluding the `ctl` and `stg` schemas.
    async fn fetch_tables(&self) -> Result<Vec<SchemaTable>>;

    /// All foreign keys between discovered tables.
    async fn fetch_foreign_keys(&self) -> Result<Vec<SchemaForeignKey>>;

    /// Column metadata for a table, in ordinal order.
    async fn fetch_columns(&self, table: &SchemaTable) -> Result<Vec<ColumnDef>>;

    // ===== Provisioning =====

    /// Idempotently create the `ctl` schema and its bookkeeping tables.
    async fn ensure_control_schema(&self) -> Result<()>;

    /// Idempotently create `stg.<table>` as an empty structural clone;
    /// truncate it if it already exists.
    async fn ensure_staging_table(&self, table: &SchemaTable) -> Result<()>;

    /// Replace the contents of `ctl.UserFkCatalog` with this run's catalog.
    async fn replace_fk_catalog(&self, entries: &[UserFkCatalogEntry]) -> Result<()>;

    // ===== Staging =====

    /// Bulk-insert coerced snapshot rows into `stg.<table>`.
    async fn insert_staging_rows(
        &self,
        table: &SchemaTable,
        columns: &[String],
        rows: &[Vec<SqlLit>],
    ) -> Result<u64>;

    // ===== Identity map =====

    /// Read the staged source-environment identity inventory.
    async fn fetch_staged_source_users(&self, user_table: &SchemaTable)
        -> Result<Vec<SourceUser>>;

    /// Read the target environment's identity inventory.
    async fn fetch_target_users(&self, user_table: &SchemaTable) -> Result<Vec<TargetUser>>;

    /// Read a previously persisted map for the environment.
    async fn fetch_user_map(&self, source_env: &str) -> Result<Vec<UserMappingEntry>>;

    /// Replace the persisted map for the environment.
    async fn replace_user_map(
        &self,
        source_env: &str,
        entries: &[UserMappingEntry],
    ) -> Result<()>;

    // ===== Rewrite =====

    /// Set-based rewrite of one cataloged column in staging, applying the
    /// policy to unmapped rows and appending audit rows to
    /// `ctl.UserKeyChanges`.
    async fn rewrite_staged_column(
        &self,
        entry: &UserFkCatalogEntry,
        policy: RemapPolicy,
        fallback_user_id: Option<i64>,
        source_env: &str,
    ) -> Result<ColumnRewriteSummary>;

    // ===== Load & validation =====

    /// Open the single load transaction at the requested isolation level.
    async fn begin_load(&self, isolation: IsolationLevel) -> Result<Box<dyn LoadSession>>;

    /// Count foreign keys currently disabled.
    async fn count_disabled_foreign_keys(&self) -> Result<i64>;

    /// Count foreign keys enabled but not trusted.
    async fn count_untrusted_foreign_keys(&self) -> Result<i64>;

    /// Count child rows whose referenced parent row does not exist.
    async fn count_orphan_rows(&self, fk: &SchemaForeignKey) -> Result<i64>;

    // ===== Utility =====

    /// Probe connectivity.
    async fn ping(&self) -> Result<()>;

    /// Close the connection pool.
    async fn close(&self);
}

/// One open load transaction.
///
/// Every operation executes inside the same transaction; `commit` or
/// `rollback` consumes the session. Dropping an uncommitted session must
/// leave the target unchanged.
#[async_trait]
pub trait LoadSession: Send {
    /// `ALTER TABLE .. NOCHECK CONSTRAINT` for one foreign key.
    async fn disable_constraint(&mut self, fk: &SchemaForeignKey) -> Result<()>;

    /// Replace the target table's rows with its rewritten staging rows.
    /// Returns the number of rows now in the target table.
    async fn swap_in_staged_rows(&mut self, table: &SchemaTable) -> Result<u64>;

    /// `ALTER TABLE .. WITH CHECK CHECK CONSTRAINT` for one foreign key.
    async fn enable_constraint(&mut self, fk: &SchemaForeignKey) -> Result<()>;

    /// Commit the transaction.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll the transaction back.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_literals() {
        assert_eq!(SqlLit::Null.to_mssql_literal(), "NULL");
        assert_eq!(SqlLit::Bool(true).to_mssql_literal(), "1");
        assert_eq!(SqlLit::Int(42).to_mssql_literal(), "42");
        assert_eq!(
            SqlLit::Text("O'Brien".into()).to_mssql_literal(),
            "N'O''Brien'"
        );
    }

    #[test]
    fn test_identity_extraction() {
        assert_eq!(SqlLit::Int(7).as_identity(), Some(7));
        assert_eq!(SqlLit::Text("7".into()).as_identity(), None);
        assert!(SqlLit::Null.is_null());
    }
}
