//! Table schemas and the canonical/accessor name registry.
//!
//! A [`TableSchema`] is immutable for the lifetime of a connection: it is
//! supplied once (by the generated bindings layer, out of scope here) when a
//! table handle is registered, and never mutated afterward. The registry
//! indexes schemas (and their caches, see [`crate::client_cache`]) by *both*
//! the canonical wire name and the accessor name a table was declared with,
//! since the server may refer to a table by the former while application
//! code looks it up by the latter (spec regression obligation S6).

use crate::bsatn::ProductType;
use std::collections::HashMap;
use std::sync::Arc;

/// One btree (or future: other algorithm) index declared on a table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: String,
    pub algorithm: IndexAlgorithm,
    /// Column indexes (into `row_type.elements`) making up the index key, in order.
    pub columns: Vec<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexAlgorithm {
    BTree,
}

/// Immutable per-connection description of one table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    /// The name the server uses to refer to this table on the wire.
    pub canonical_name: String,
    /// The name application code uses, e.g. `.db.reports` for a table whose
    /// canonical name is `"report"`. May equal `canonical_name`.
    pub accessor_name: String,
    pub row_type: ProductType,
    /// Column index of the declared primary key, if any.
    pub primary_key: Option<usize>,
    pub unique_columns: Vec<usize>,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    pub fn new(canonical_name: impl Into<String>, accessor_name: impl Into<String>, row_type: ProductType) -> Self {
        TableSchema {
            canonical_name: canonical_name.into(),
            accessor_name: accessor_name.into(),
            row_type,
            primary_key: None,
            unique_columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, column: usize) -> Self {
        self.primary_key = Some(column);
        self
    }

    pub fn with_unique_column(mut self, column: usize) -> Self {
        self.unique_columns.push(column);
        self
    }

    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }
}

/// Maps both canonical and accessor table names onto the same [`TableSchema`],
/// populated once at schema-materialization time (spec.md §9's replacement
/// for dynamic dispatch-by-attribute-probing: a registry keyed by name,
/// built up front, rather than structural field lookup at call time).
#[derive(Clone, Default)]
pub struct TableRegistry {
    by_name: HashMap<String, Arc<TableSchema>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        TableRegistry::default()
    }

    pub fn register(&mut self, schema: TableSchema) -> Arc<TableSchema> {
        let schema = Arc::new(schema);
        self.by_name.insert(schema.canonical_name.clone(), schema.clone());
        self.by_name.insert(schema.accessor_name.clone(), schema.clone());
        schema
    }

    /// Look up a table by either its canonical (wire) name or its accessor name.
    pub fn get(&self, name: &str) -> Option<&Arc<TableSchema>> {
        self.by_name.get(name)
    }

    pub fn iter_unique(&self) -> impl Iterator<Item = &Arc<TableSchema>> {
        let mut seen = std::collections::HashSet::new();
        self.by_name.values().filter(move |s| seen.insert(s.canonical_name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsatn::AlgebraicType;

    // S6: table declared with canonical name "report" and accessor "reports";
    // both must resolve to the same schema.
    #[test]
    fn wire_name_and_accessor_both_resolve() {
        let mut registry = TableRegistry::new();
        let row_type = ProductType::from(vec![("id", AlgebraicType::U64)]);
        registry.register(TableSchema::new("report", "reports", row_type));

        let by_wire = registry.get("report").unwrap();
        let by_accessor = registry.get("reports").unwrap();
        assert!(Arc::ptr_eq(by_wire, by_accessor));
    }
}
