//! Foreign-key catalog: every column that provably holds a user identity.
//!
//! The builder walks the schema graph backward from the identity table,
//! so both direct references (`Order.CreatedBy -> User.Id`) and transitive
//! ones (`Order.CreatedBy -> Employee.UserId -> User.Id`) are discovered.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::schema::{SchemaGraph, SchemaTable};

/// One `(table, column)` hop in a transitive identity-reference chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
    /// Fully qualified intermediate table name.
    pub table: String,

    /// Referenced column on that table.
    pub column: String,
}

impl PathSegment {
    fn render(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

/// A column proven to hold an identity value, plus the chain of hops used
/// to prove it. Direct foreign keys have an empty path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFkCatalogEntry {
    /// Schema of the referencing table.
    pub table_schema: String,

    /// Name of the referencing table.
    pub table_name: String,

    /// Referencing column.
    pub column_name: String,

    /// Intermediate hops between this column and the identity table,
    /// nearest first. Empty for direct references.
    pub path_segments: Vec<PathSegment>,
}

impl UserFkCatalogEntry {
    /// The table this entry's column lives on.
    pub fn table(&self) -> SchemaTable {
        SchemaTable::new(self.table_schema.clone(), self.table_name.clone())
    }

    /// Case-insensitive identity key `(schema, table, column)`.
    pub fn key(&self) -> (String, String, String) {
        (
            self.table_schema.to_lowercase(),
            self.table_name.to_lowercase(),
            self.column_name.to_lowercase(),
        )
    }

    /// Human-readable `" > "`-joined path, or `None` for direct references.
    pub fn path_hint(&self) -> Option<String> {
        if self.path_segments.is_empty() {
            None
        } else {
            Some(
                self.path_segments
                    .iter()
                    .map(PathSegment::render)
                    .collect::<Vec<_>>()
                    .join(" > "),
            )
        }
    }
}

impl PartialEq for UserFkCatalogEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for UserFkCatalogEntry {}

/// Build the full identity-reference catalog for a schema graph.
///
/// Performs a breadth-first walk over reverse foreign-key edges starting at
/// `user_table`, so the shortest proof path wins when a column is reachable
/// more than one way. The result is deterministically ordered by
/// `(table_schema, table_name, column_name)` and re-running against an
/// unchanged graph reproduces an identical catalog.
pub fn build_catalog(graph: &SchemaGraph, user_table: &SchemaTable) -> Vec<UserFkCatalogEntry> {
    // Sort edges up front so same-depth ties resolve identically every run.
    let mut fks: Vec<_> = graph.foreign_keys().iter().collect();
    fks.sort_by(|a, b| {
        (a.table.key(), a.column.to_lowercase())
            .cmp(&(b.table.key(), b.column.to_lowercase()))
            .then_with(|| a.name.cmp(&b.name))
    });

    // Known identity-carrying (table, column) nodes mapped to their proof
    // path. The identity table itself seeds the walk with an empty path.
    let mut proven: HashMap<(String, String, String), Vec<PathSegment>> = HashMap::new();
    let mut queue: VecDeque<(SchemaTable, String, Vec<PathSegment>)> = VecDeque::new();
    let mut entries: Vec<UserFkCatalogEntry> = Vec::new();

    // Level 0: direct references to the identity table.
    for fk in &fks {
        if &fk.ref_table == user_table {
            push_entry(fk.table.clone(), fk.column.clone(), Vec::new(), &mut proven, &mut queue, &mut entries);
        }
    }

    // Transitive levels: an FK whose referenced column is itself a proven
    // identity column extends the chain by one hop.
    while let Some((table, column, path)) = queue.pop_front() {
        for fk in &fks {
            if fk.ref_table == table && fk.ref_column.eq_ignore_ascii_case(&column) {
                let mut extended = vec![PathSegment {
                    table: table.full_name(),
                    column: column.clone(),
                }];
                extended.extend(path.iter().cloned());
                push_entry(
                    fk.table.clone(),
                    fk.column.clone(),
                    extended,
                    &mut proven,
                    &mut queue,
                    &mut entries,
                );
            }
        }
    }

    entries.sort_by(|a, b| a.key().cmp(&b.key()));
    debug!(entries = entries.len(), "built user FK catalog");
    entries
}

fn push_entry(
    table: SchemaTable,
    column: String,
    path: Vec<PathSegment>,
    proven: &mut HashMap<(String, String, String), Vec<PathSegment>>,
    queue: &mut VecDeque<(SchemaTable, String, Vec<PathSegment>)>,
    entries: &mut Vec<UserFkCatalogEntry>,
) {
    let key = (
        table.schema.to_lowercase(),
        table.name.to_lowercase(),
        column.to_lowercase(),
    );
    if proven.contains_key(&key) {
        return;
    }
    proven.insert(key, path.clone());
    queue.push_back((table.clone(), column.clone(), path.clone()));
    entries.push(UserFkCatalogEntry {
        table_schema: table.schema,
        table_name: table.name,
        column_name: column,
        path_segments: path,
    });
}
