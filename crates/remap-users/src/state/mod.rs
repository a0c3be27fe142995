//! Mutable state accumulated while a run executes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::UserFkCatalogEntry;
use crate::mapper::UserMapReport;
use crate::report::{ColumnRewriteSummary, DryRunSummary, PostLoadValidationReport};
use crate::schema::{SchemaForeignKey, SchemaTable};

/// Terminal status of a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
}

/// Record of one executed (or skipped) step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    pub started_at_utc: DateTime<Utc>,
    pub finished_at_utc: DateTime<Utc>,
    pub detail: Option<String>,
}

/// Everything the steps produce and hand forward.
///
/// Owned by the pipeline, mutated step by step; reports pull from it at the
/// end regardless of how far the run got.
#[derive(Debug, Default)]
pub struct RemapState {
    /// Unique id for this run; names the artifact directory.
    pub run_id: String,

    /// Deterministic table load order from the schema graph.
    pub load_order: Vec<SchemaTable>,

    /// Discovered foreign keys.
    pub foreign_keys: Vec<SchemaForeignKey>,

    /// Transitive user FK catalog.
    pub catalog: Vec<UserFkCatalogEntry>,

    /// Rows staged per table, keyed by `schema.table`.
    pub staged_row_counts: BTreeMap<String, u64>,

    /// Tables that had no snapshot file and were skipped.
    pub skipped_tables: Vec<String>,

    /// Mapping coverage report.
    pub map_report: Option<UserMapReport>,

    /// Per-column rewrite outcomes, in catalog order.
    pub rewrite_summaries: Vec<(UserFkCatalogEntry, ColumnRewriteSummary)>,

    /// Rows loaded per table during the commit transaction.
    pub loaded_row_counts: BTreeMap<String, u64>,

    /// The dry-run summary, built whether or not this run was a dry run.
    pub dry_run_summary: Option<DryRunSummary>,

    /// Post-load integrity report (commit runs only).
    pub validation_report: Option<PostLoadValidationReport>,

    /// Step-by-step execution record.
    pub step_outcomes: Vec<StepOutcome>,
}

impl RemapState {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    /// Total rows staged across all tables.
    pub fn total_staged_rows(&self) -> u64 {
        self.staged_row_counts.values().sum()
    }

    /// Total rows loaded into the target.
    pub fn total_loaded_rows(&self) -> u64 {
        self.loaded_row_counts.values().sum()
    }
}

/// Final result handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemapRunResult {
    pub run_id: String,
    pub dry_run: bool,
    pub parameter_hash: String,
    pub started_at_utc: DateTime<Utc>,
    pub finished_at_utc: DateTime<Utc>,
    pub tables_staged: usize,
    pub total_staged_rows: u64,
    pub total_loaded_rows: u64,
    pub columns_rewritten: usize,
    pub map_resolved: usize,
    pub map_unresolved: usize,
    pub validation_clean: Option<bool>,
    pub steps: Vec<StepOutcome>,
    pub artifact_dir: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(RemapState::new().run_id, RemapState::new().run_id);
    }

    #[test]
    fn test_row_totals() {
        let mut state = RemapState::new();
        state.staged_row_counts.insert("dbo.User".into(), 10);
        state.staged_row_counts.insert("dbo.Order".into(), 32);
        assert_eq!(state.total_staged_rows(), 42);
        assert_eq!(state.total_loaded_rows(), 0);
    }
}
