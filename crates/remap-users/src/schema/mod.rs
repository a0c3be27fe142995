//! Schema metadata types and the target-database schema graph.
//!
//! [`SchemaTable`] and [`SchemaForeignKey`] are immutable, created once per
//! discovery. [`graph::SchemaGraph`] layers the deterministic topological
//! load order on top of them.

pub mod graph;

pub use graph::SchemaGraph;

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Lowercased `(schema, name)` pair used as a map key.
pub type TableKey = (String, String);

/// A table in the target database, identified by its schema and name.
///
/// Identity is the case-insensitive `(schema, name)` pair: SQL Server
/// catalogs are case-preserving but case-insensitive, so `dbo.Users` and
/// `DBO.USERS` are the same table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaTable {
    /// Schema name (e.g. "dbo").
    pub schema: String,

    /// Table name.
    pub name: String,
}

impl SchemaTable {
    /// Create a new table reference.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse a `schema.table` string; a bare name defaults to `dbo`.
    pub fn parse(qualified: &str) -> Self {
        match qualified.split_once('.') {
            Some((schema, name)) => Self::new(schema.trim(), name.trim()),
            None => Self::new("dbo", qualified.trim()),
        }
    }

    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Case-insensitive identity/sort key.
    pub fn key(&self) -> (String, String) {
        (self.schema.to_lowercase(), self.name.to_lowercase())
    }
}

impl PartialEq for SchemaTable {
    fn eq(&self, other: &Self) -> bool {
        self.schema.eq_ignore_ascii_case(&other.schema)
            && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for SchemaTable {}

impl Hash for SchemaTable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.schema.to_lowercase().hash(state);
        self.name.to_lowercase().hash(state);
    }
}

impl PartialOrd for SchemaTable {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchemaTable {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// A foreign-key constraint in the target database.
///
/// One value per physical constraint; multi-column constraints are
/// represented by their first column pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaForeignKey {
    /// Constraint name.
    pub name: String,

    /// Referencing (child) table.
    pub table: SchemaTable,

    /// Referencing column.
    pub column: String,

    /// Referenced (parent) table.
    pub ref_table: SchemaTable,

    /// Referenced column.
    pub ref_column: String,
}

impl SchemaForeignKey {
    /// Create a new foreign key descriptor.
    pub fn new(
        name: impl Into<String>,
        table: SchemaTable,
        column: impl Into<String>,
        ref_table: SchemaTable,
        ref_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table,
            column: column.into(),
            ref_table,
            ref_column: ref_column.into(),
        }
    }

    /// Whether the constraint references its own table.
    pub fn is_self_referencing(&self) -> bool {
        self.table == self.ref_table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_table_identity_is_case_insensitive() {
        let a = SchemaTable::new("dbo", "Users");
        let b = SchemaTable::new("DBO", "USERS");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_table_parse() {
        let t = SchemaTable::parse("sales.Order");
        assert_eq!(t.schema, "sales");
        assert_eq!(t.name, "Order");

        let bare = SchemaTable::parse("Order");
        assert_eq!(bare.schema, "dbo");
        assert_eq!(bare.full_name(), "dbo.Order");
    }

    #[test]
    fn test_table_ordering() {
        let mut tables = vec![
            SchemaTable::new("sales", "Order"),
            SchemaTable::new("dbo", "zeta"),
            SchemaTable::new("dbo", "Alpha"),
        ];
        tables.sort();
        assert_eq!(tables[0].full_name(), "dbo.Alpha");
        assert_eq!(tables[1].full_name(), "dbo.zeta");
        assert_eq!(tables[2].full_name(), "sales.Order");
    }

    #[test]
    fn test_self_referencing_fk() {
        let emp = SchemaTable::new("dbo", "Employee");
        let fk = SchemaForeignKey::new(
            "FK_Employee_Manager",
            emp.clone(),
            "ManagerId",
            emp,
            "Id",
        );
        assert!(fk.is_self_referencing());
    }
}
