//! Schema graph discovery and deterministic topological load order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::db::RemapDb;
use crate::error::Result;

use super::{SchemaForeignKey, SchemaTable, TableKey};

/// Tables and foreign keys of the target database, with a deterministic
/// dependency-respecting table ordering.
pub struct SchemaGraph {
    tables: Vec<SchemaTable>,
    foreign_keys: Vec<SchemaForeignKey>,
}

impl SchemaGraph {
    /// Build a graph from already-known metadata.
    pub fn new(tables: Vec<SchemaTable>, foreign_keys: Vec<SchemaForeignKey>) -> Self {
        Self {
            tables,
            foreign_keys,
        }
    }

    /// Discover the graph from the target database.
    ///
    /// Any underlying query failure propagates; no partial graph is returned.
    pub async fn discover(db: &dyn RemapDb) -> Result<Self> {
        let tables = db.fetch_tables().await?;
        let foreign_keys = db.fetch_foreign_keys().await?;
        debug!(
            tables = tables.len(),
            foreign_keys = foreign_keys.len(),
            "discovered target schema"
        );
        Ok(Self::new(tables, foreign_keys))
    }

    /// All discovered tables.
    pub fn tables(&self) -> &[SchemaTable] {
        &self.tables
    }

    /// All discovered foreign keys.
    pub fn foreign_keys(&self) -> &[SchemaForeignKey] {
        &self.foreign_keys
    }

    /// Compute the topological load order via Kahn's algorithm.
    ///
    /// A table becomes ready once every table it references has been
    /// emitted, so parents always precede children. Ties break on the
    /// case-insensitive `(schema, name)` pair, which makes the order
    /// byte-identical across runs against an unchanged schema. If a cycle
    /// prevents some tables from ever becoming ready, the remainder is
    /// appended in plain alphabetical order.
    pub fn topo_sorted_tables(&self) -> Vec<SchemaTable> {
        let by_key: BTreeMap<TableKey, &SchemaTable> =
            self.tables.iter().map(|t| (t.key(), t)).collect();

        // Collapse duplicate edges (multi-column FKs between the same pair
        // count once). Self-references cannot influence ordering and are
        // skipped rather than forcing the table into the cyclic remainder.
        let mut edges: BTreeSet<(TableKey, TableKey)> = BTreeSet::new();
        for fk in &self.foreign_keys {
            if fk.is_self_referencing() {
                continue;
            }
            let child = fk.table.key();
            let parent = fk.ref_table.key();
            if !by_key.contains_key(&child) || !by_key.contains_key(&parent) {
                warn!(constraint = %fk.name, "foreign key references undiscovered table, ignoring");
                continue;
            }
            edges.insert((child, parent));
        }

        // in_degree[t] = number of distinct tables t references.
        let mut in_degree: HashMap<TableKey, usize> =
            by_key.keys().map(|k| (k.clone(), 0)).collect();
        let mut dependents: HashMap<TableKey, Vec<TableKey>> = HashMap::new();
        for (child, parent) in &edges {
            if let Some(d) = in_degree.get_mut(child) {
                *d += 1;
            }
            dependents
                .entry(parent.clone())
                .or_default()
                .push(child.clone());
        }

        // Ready queue ordered by the case-insensitive (schema, name) pair.
        let mut ready: BTreeSet<TableKey> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| k.clone())
            .collect();

        let mut order: Vec<SchemaTable> = Vec::with_capacity(self.tables.len());
        let mut emitted: BTreeSet<TableKey> = BTreeSet::new();

        while let Some(key) = ready.iter().next().cloned() {
            ready.remove(&key);
            order.push((*by_key[&key]).clone());
            emitted.insert(key.clone());

            if let Some(children) = dependents.get(&key) {
                for child in children {
                    if let Some(d) = in_degree.get_mut(child) {
                        *d -= 1;
                        if *d == 0 {
                            ready.insert(child.clone());
                        }
                    }
                }
            }
        }

        if order.len() < self.tables.len() {
            // Cyclic remainder: plain alphabetical order.
            let mut rest: Vec<SchemaTable> = by_key
                .iter()
                .filter(|(k, _)| !emitted.contains(*k))
                .map(|(_, t)| (*t).clone())
                .collect();
            rest.sort();
            warn!(
                cyclic = rest.len(),
                "foreign-key cycle detected, appending remainder alphabetically"
            );
            order.extend(rest);
        }

        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(schema: &str, name: &str) -> SchemaTable {
        SchemaTable::new(schema, name)
    }

    fn fk(name: &str, child: &SchemaTable, col: &str, parent: &SchemaTable) -> SchemaForeignKey {
        SchemaForeignKey::new(name, child.clone(), col, parent.clone(), "Id")
    }

    fn names(order: &[SchemaTable]) -> Vec<String> {
        order.iter().map(|t| t.full_name()).collect()
    }

    #[test]
    fn test_parents_precede_children() {
        let user = t("dbo", "User");
        let order = t("dbo", "Order");
        let line = t("dbo", "OrderLine");
        let graph = SchemaGraph::new(
            vec![line.clone(), order.clone(), user.clone()],
            vec![
                fk("FK_Order_User", &order, "CreatedBy", &user),
                fk("FK_OrderLine_Order", &line, "OrderId", &order),
            ],
        );

        assert_eq!(
            names(&graph.topo_sorted_tables()),
            vec!["dbo.User", "dbo.Order", "dbo.OrderLine"]
        );
    }

    #[test]
    fn test_order_is_deterministic() {
        let tables: Vec<SchemaTable> = ["Zeta", "Alpha", "Mid", "User"]
            .iter()
            .map(|n| t("dbo", n))
            .collect();
        let fks = vec![
            fk("FK_Mid_User", &tables[2], "UserId", &tables[3]),
            fk("FK_Zeta_Mid", &tables[0], "MidId", &tables[2]),
        ];
        let graph = SchemaGraph::new(tables.clone(), fks.clone());
        let first = names(&graph.topo_sorted_tables());
        for _ in 0..5 {
            let again = SchemaGraph::new(tables.clone(), fks.clone());
            assert_eq!(names(&again.topo_sorted_tables()), first);
        }
        // Independent tables come out in (schema, name) order.
        assert_eq!(first, vec!["dbo.Alpha", "dbo.User", "dbo.Mid", "dbo.Zeta"]);
    }

    #[test]
    fn test_cyclic_remainder_is_alphabetical() {
        let a = t("dbo", "Beta");
        let b = t("dbo", "Alpha");
        let free = t("dbo", "Free");
        let graph = SchemaGraph::new(
            vec![a.clone(), b.clone(), free.clone()],
            vec![
                fk("FK_Beta_Alpha", &a, "AlphaId", &b),
                fk("FK_Alpha_Beta", &b, "BetaId", &a),
            ],
        );

        assert_eq!(
            names(&graph.topo_sorted_tables()),
            vec!["dbo.Free", "dbo.Alpha", "dbo.Beta"]
        );
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let user = t("dbo", "User");
        let audit = t("dbo", "Audit");
        let graph = SchemaGraph::new(
            vec![audit.clone(), user.clone()],
            vec![
                fk("FK_Audit_CreatedBy", &audit, "CreatedBy", &user),
                fk("FK_Audit_UpdatedBy", &audit, "UpdatedBy", &user),
            ],
        );

        assert_eq!(
            names(&graph.topo_sorted_tables()),
            vec!["dbo.User", "dbo.Audit"]
        );
    }

    #[test]
    fn test_self_reference_does_not_demote_table() {
        let emp = t("dbo", "Employee");
        let graph = SchemaGraph::new(
            vec![emp.clone()],
            vec![fk("FK_Employee_Manager", &emp, "ManagerId", &emp)],
        );
        assert_eq!(names(&graph.topo_sorted_tables()), vec!["dbo.Employee"]);
    }

    #[test]
    fn test_case_insensitive_tie_break() {
        let graph = SchemaGraph::new(
            vec![t("dbo", "beta"), t("DBO", "Alpha")],
            vec![],
        );
        assert_eq!(
            names(&graph.topo_sorted_tables()),
            vec!["DBO.Alpha", "dbo.beta"]
        );
    }
}
