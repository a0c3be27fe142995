//! Snapshot directory reader.
//!
//! A snapshot is a directory of JSON files exported from the source
//! environment, one array-of-objects file per table. Files are located by
//! convention, in order of preference:
//!
//! 1. `<schema>.<table>.json`
//! 2. `<schema>/<table>.json`
//! 3. `<table>.json`
//!
//! Values are coerced against the target column types before staging;
//! object keys with no matching target column are ignored with a warning.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::db::{ColumnDef, SqlLit};
use crate::error::{RemapError, Result};
use crate::schema::SchemaTable;

/// Rows for one table, aligned to a fixed column list.
#[derive(Debug, Clone)]
pub struct SnapshotTableData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlLit>>,
}

impl SnapshotTableData {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Reader over one snapshot directory.
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find the snapshot file for a table, if one exists.
    pub fn locate(&self, table: &SchemaTable) -> Option<PathBuf> {
        let candidates = [
            self.root.join(format!("{}.{}.json", table.schema, table.name)),
            self.root.join(&table.schema).join(format!("{}.json", table.name)),
            self.root.join(format!("{}.json", table.name)),
        ];
        candidates.into_iter().find(|p| p.is_file())
    }

    /// Load and coerce a table's snapshot rows.
    ///
    /// The column list is the target table's columns restricted to keys the
    /// snapshot actually carries, so absent columns take their target-side
    /// defaults at insert time instead of explicit NULLs.
    pub fn load_table(
        &self,
        table: &SchemaTable,
        columns: &[ColumnDef],
    ) -> Result<SnapshotTableData> {
        let path = self.locate(table).ok_or_else(|| {
            RemapError::Snapshot(format!(
                "no snapshot file for {} under {:?}",
                table.full_name(),
                self.root
            ))
        })?;

        let content = std::fs::read_to_string(&path).map_err(|e| {
            RemapError::Snapshot(format!("cannot read {:?}: {}", path, e))
        })?;
        let parsed: Value = serde_json::from_str(&content).map_err(|e| {
            RemapError::Snapshot(format!("{:?} is not valid JSON: {}", path, e))
        })?;
        let objects = parsed.as_array().ok_or_else(|| {
            RemapError::Snapshot(format!("{:?} must be a JSON array of objects", path))
        })?;

        // Columns present in the snapshot, in target ordinal order.
        let present: Vec<&ColumnDef> = columns
            .iter()
            .filter(|col| {
                objects.iter().filter_map(|o| o.as_object()).any(|obj| {
                    obj.keys().any(|k| k.eq_ignore_ascii_case(&col.name))
                })
            })
            .collect();

        let mut unknown_warned = false;
        let mut rows = Vec::with_capacity(objects.len());
        for (idx, object) in objects.iter().enumerate() {
            let obj = object.as_object().ok_or_else(|| {
                RemapError::Snapshot(format!(
                    "{:?} element {} is not a JSON object",
                    path, idx
                ))
            })?;

            if !unknown_warned {
                for key in obj.keys() {
                    if !columns.iter().any(|c| c.name.eq_ignore_ascii_case(key)) {
                        warn!(
                            table = %table.full_name(),
                            column = %key,
                            "snapshot carries a column the target does not have, ignoring"
                        );
                        unknown_warned = true;
                    }
                }
            }

            let mut row = Vec::with_capacity(present.len());
            for col in &present {
                let value = obj
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(&col.name))
                    .map(|(_, v)| v)
                    .unwrap_or(&Value::Null);
                row.push(coerce_value(value, col, table, idx)?);
            }
            rows.push(row);
        }

        debug!(
            table = %table.full_name(),
            file = ?path,
            rows = rows.len(),
            "loaded snapshot table"
        );
        Ok(SnapshotTableData {
            columns: present.iter().map(|c| c.name.clone()).collect(),
            rows,
        })
    }
}

/// Coerce one JSON value to the target column's type.
fn coerce_value(
    value: &Value,
    col: &ColumnDef,
    table: &SchemaTable,
    row_idx: usize,
) -> Result<SqlLit> {
    let mismatch = |detail: &str| {
        RemapError::Snapshot(format!(
            "{}.{} row {}: {}",
            table.full_name(),
            col.name,
            row_idx,
            detail
        ))
    };

    if value.is_null() {
        return Ok(SqlLit::Null);
    }

    let data_type = col.data_type.to_lowercase();
    match data_type.as_str() {
        "bit" => match value {
            Value::Bool(b) => Ok(SqlLit::Bool(*b)),
            Value::Number(n) => Ok(SqlLit::Bool(n.as_i64() == Some(1))),
            _ => Err(mismatch("expected a boolean")),
        },
        "tinyint" | "smallint" | "int" | "bigint" => match value {
            Value::Number(n) => n
                .as_i64()
                .map(SqlLit::Int)
                .ok_or_else(|| mismatch("integer out of range")),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(SqlLit::Int)
                .map_err(|_| mismatch("string is not an integer")),
            _ => Err(mismatch("expected an integer")),
        },
        "float" | "real" | "decimal" | "numeric" | "money" | "smallmoney" => match value {
            Value::Number(n) => n
                .as_f64()
                .map(SqlLit::Float)
                .ok_or_else(|| mismatch("number out of range")),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(SqlLit::Float)
                .map_err(|_| mismatch("string is not numeric")),
            _ => Err(mismatch("expected a number")),
        },
        // Dates, GUIDs and everything textual travel as strings.
        _ => match value {
            Value::String(s) => Ok(SqlLit::Text(s.clone())),
            Value::Number(n) => Ok(SqlLit::Text(n.to_string())),
            Value::Bool(b) => Ok(SqlLit::Text(b.to_string())),
            _ => Err(mismatch("expected a scalar")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn columns() -> Vec<ColumnDef> {
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
            ColumnDef {
                name: "IsActive".into(),
                data_type: "bit".into(),
                is_nullable: false,
            },
        ]
    }

    #[test]
    fn test_locate_prefers_qualified_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("User.json"), b"[]").unwrap();
        std::fs::write(dir.path().join("dbo.User.json"), b"[]").unwrap();

        let store = SnapshotStore::new(dir.path());
        let found = store.locate(&SchemaTable::parse("dbo.User")).unwrap();
        assert!(found.ends_with("dbo.User.json"));
    }

    #[test]
    fn test_locate_falls_back_to_subdirectory_then_bare() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sales")).unwrap();
        std::fs::write(dir.path().join("sales").join("Order.json"), b"[]").unwrap();
        std::fs::write(dir.path().join("Invoice.json"), b"[]").unwrap();

        let store = SnapshotStore::new(dir.path());
        let order = store.locate(&SchemaTable::parse("sales.Order")).unwrap();
        assert!(order.ends_with("sales/Order.json") || order.ends_with("sales\\Order.json"));

        let invoice = store.locate(&SchemaTable::parse("sales.Invoice")).unwrap();
        assert!(invoice.ends_with("Invoice.json"));

        assert!(store.locate(&SchemaTable::parse("dbo.Missing")).is_none());
    }

    #[test]
    fn test_load_coerces_values() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("dbo.User.json"),
            br#"[
                {"Id": 1, "Email": "a@b.com", "IsActive": true},
                {"Id": "2", "Email": null, "IsActive": 0}
            ]"#,
        )
        .unwrap();

        let store = SnapshotStore::new(dir.path());
        let data = store
            .load_table(&SchemaTable::parse("dbo.User"), &columns())
            .unwrap();

        assert_eq!(data.columns, vec!["Id", "Email", "IsActive"]);
        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.rows[0][0], SqlLit::Int(1));
        assert_eq!(data.rows[0][2], SqlLit::Bool(true));
        assert_eq!(data.rows[1][0], SqlLit::Int(2));
        assert_eq!(data.rows[1][1], SqlLit::Null);
        assert_eq!(data.rows[1][2], SqlLit::Bool(false));
    }

    #[test]
    fn test_absent_columns_are_dropped_from_the_insert() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("dbo.User.json"), br#"[{"Id": 5}]"#).unwrap();

        let store = SnapshotStore::new(dir.path());
        let data = store
            .load_table(&SchemaTable::parse("dbo.User"), &columns())
            .unwrap();
        assert_eq!(data.columns, vec!["Id"]);
        assert_eq!(data.rows[0], vec![SqlLit::Int(5)]);
    }

    #[test]
    fn test_unknown_snapshot_columns_are_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("dbo.User.json"),
            br#"[{"Id": 5, "LegacyFlag": "x"}]"#,
        )
        .unwrap();

        let store = SnapshotStore::new(dir.path());
        let data = store
            .load_table(&SchemaTable::parse("dbo.User"), &columns())
            .unwrap();
        assert_eq!(data.columns, vec!["Id"]);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("dbo.User.json"), b"{not json").unwrap();

        let store = SnapshotStore::new(dir.path());
        let err = store.load_table(&SchemaTable::parse("dbo.User"), &columns());
        assert!(err.is_err());
    }

    #[test]
    fn test_type_mismatch_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("dbo.User.json"),
            br#"[{"Id": "not-a-number"}]"#,
        )
        .unwrap();

        let store = SnapshotStore::new(dir.path());
        let err = store.load_table(&SchemaTable::parse("dbo.User"), &columns());
        assert!(err.is_err());
    }
}
