//! Run reports: per-column rewrite outcomes, the dry-run preview, and the
//! post-load integrity report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::UserFkCatalogEntry;
use crate::config::RemapPolicy;

/// Outcome counters for rewriting one catalog entry.
///
/// `remapped + reassigned + pruned + unmapped` equals the number of
/// non-null values the column held in staging before rewriting. After a
/// policy has been applied, `unmapped` should be zero; anything else is a
/// policy/schema mismatch and is surfaced as a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRewriteSummary {
    /// Rows whose identity was found in the map and replaced.
    pub remapped_rows: i64,

    /// Rows reassigned to the fallback identity.
    pub reassigned_rows: i64,

    /// Rows nulled or removed from staging.
    pub pruned_rows: i64,

    /// Rows left holding an unmapped identity.
    pub unmapped_rows: i64,

    /// Policy that was in effect.
    pub policy: RemapPolicy,
}

impl ColumnRewriteSummary {
    /// Total rows that referenced the column before rewriting.
    pub fn total_rows(&self) -> i64 {
        self.remapped_rows + self.reassigned_rows + self.pruned_rows + self.unmapped_rows
    }
}

/// One row of the dry-run report: a catalog column and what rewriting it
/// did (or would do).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDelta {
    pub table_schema: String,
    pub table_name: String,
    pub column_name: String,
    pub path_hint: Option<String>,
    pub remapped_rows: i64,
    pub reassigned_rows: i64,
    pub pruned_rows: i64,
    pub unmapped_rows: i64,
}

/// Aggregated rewrite preview an operator reviews before authorizing a
/// commit run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunSummary {
    /// Parameter hash of the run that produced this summary.
    pub parameter_hash: String,

    /// Whether the producing run was a dry run.
    pub dry_run: bool,

    /// When the summary was generated.
    pub generated_at_utc: DateTime<Utc>,

    /// Per-column deltas, in catalog order.
    pub columns: Vec<ColumnDelta>,

    pub total_remapped: i64,
    pub total_reassigned: i64,
    pub total_pruned: i64,
    pub total_unmapped: i64,

    /// Residual findings (e.g. columns left with unmapped rows).
    pub findings: Vec<String>,
}

/// Aggregate every per-column summary into a [`DryRunSummary`].
pub fn build_dry_run_summary(
    parameter_hash: String,
    dry_run: bool,
    summaries: &[(UserFkCatalogEntry, ColumnRewriteSummary)],
) -> DryRunSummary {
    let mut out = DryRunSummary {
        parameter_hash,
        dry_run,
        generated_at_utc: Utc::now(),
        columns: Vec::with_capacity(summaries.len()),
        total_remapped: 0,
        total_reassigned: 0,
        total_pruned: 0,
        total_unmapped: 0,
        findings: Vec::new(),
    };

    for (entry, summary) in summaries {
        out.total_remapped += summary.remapped_rows;
        out.total_reassigned += summary.reassigned_rows;
        out.total_pruned += summary.pruned_rows;
        out.total_unmapped += summary.unmapped_rows;

        if summary.unmapped_rows > 0 {
            out.findings.push(format!(
                "{}.{}.{}: {} rows still hold unmapped identities after policy {:?}",
                entry.table_schema,
                entry.table_name,
                entry.column_name,
                summary.unmapped_rows,
                summary.policy
            ));
        }

        out.columns.push(ColumnDelta {
            table_schema: entry.table_schema.clone(),
            table_name: entry.table_name.clone(),
            column_name: entry.column_name.clone(),
            path_hint: entry.path_hint(),
            remapped_rows: summary.remapped_rows,
            reassigned_rows: summary.reassigned_rows,
            pruned_rows: summary.pruned_rows,
            unmapped_rows: summary.unmapped_rows,
        });
    }

    out
}

/// Post-hoc integrity proof produced after a committed load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostLoadValidationReport {
    /// Foreign keys still disabled (must be 0).
    pub disabled_foreign_keys: i64,

    /// Foreign keys enabled but untrusted (must be 0).
    pub untrusted_foreign_keys: i64,

    /// Whether the explicit orphaned-row check passed.
    pub referential_integrity_verified: bool,

    /// Detail for every violation found.
    pub validation_errors: Vec<String>,
}

impl PostLoadValidationReport {
    /// True when every check passed.
    pub fn is_clean(&self) -> bool {
        self.disabled_foreign_keys == 0
            && self.untrusted_foreign_keys == 0
            && self.referential_integrity_verified
            && self.validation_errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(table: &str, column: &str) -> UserFkCatalogEntry {
        UserFkCatalogEntry {
            table_schema: "dbo".into(),
            table_name: table.into(),
            column_name: column.into(),
            path_segments: vec![],
        }
    }

    fn summary(remapped: i64, reassigned: i64, pruned: i64, unmapped: i64) -> ColumnRewriteSummary {
        ColumnRewriteSummary {
            remapped_rows: remapped,
            reassigned_rows: reassigned,
            pruned_rows: pruned,
            unmapped_rows: unmapped,
            policy: RemapPolicy::Reassign,
        }
    }

    #[test]
    fn test_summary_conservation() {
        let s = summary(10, 3, 2, 1);
        assert_eq!(s.total_rows(), 16);
    }

    #[test]
    fn test_dry_run_totals() {
        let summaries = vec![
            (entry("Order", "CreatedBy"), summary(5, 1, 0, 0)),
            (entry("Comment", "AuthorId"), summary(7, 0, 2, 0)),
        ];
        let report = build_dry_run_summary("hash".into(), true, &summaries);

        assert_eq!(report.columns.len(), 2);
        assert_eq!(report.total_remapped, 12);
        assert_eq!(report.total_reassigned, 1);
        assert_eq!(report.total_pruned, 2);
        assert_eq!(report.total_unmapped, 0);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_residual_unmapped_becomes_finding() {
        let summaries = vec![(entry("Order", "CreatedBy"), summary(5, 0, 0, 3))];
        let report = build_dry_run_summary("hash".into(), false, &summaries);

        assert_eq!(report.total_unmapped, 3);
        assert_eq!(report.findings.len(), 1);
        assert!(report.findings[0].contains("dbo.Order.CreatedBy"));
    }

    #[test]
    fn test_validation_report_is_clean() {
        let clean = PostLoadValidationReport {
            referential_integrity_verified: true,
            ..Default::default()
        };
        assert!(clean.is_clean());

        let dirty = PostLoadValidationReport {
            disabled_foreign_keys: 1,
            referential_integrity_verified: true,
            ..Default::default()
        };
        assert!(!dirty.is_clean());
    }
}
