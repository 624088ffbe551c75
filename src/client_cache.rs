//! A local mirror of the subscribed rows of the database: one [`TableCache`]
//! per table, refcounted by row identity, indexed for O(1) unique/primary-key
//! lookup and for declared btree indexes.
//!
//! Rows are generic [`ProductValue`]s rather than generated Rust structs,
//! since there is no per-module codegen in this crate; callers identify
//! tables and columns by name and position against a [`TableSchema`] fetched
//! once at connection time.

use crate::bsatn::{value, AlgebraicValue, ProductValue};
use crate::table::TableSchema;
use im::HashMap as ImHashMap;
use std::collections::{BTreeMap, HashMap, HashSet};

/// One pending row-level event, accumulated while a transaction's operations
/// are being applied and invoked only once the whole update has settled and
/// a fresh `Arc<ClientCache>` snapshot is ready to hand to listeners.
#[derive(Clone, Debug)]
pub enum RowCallback {
    Insert(ProductValue),
    Delete(ProductValue),
    Update(ProductValue, ProductValue),
}

/// Accumulates [`RowCallback`]s for every table touched by one incoming
/// update, keyed by canonical table name, so they can be invoked together
/// after the whole update has been applied to the cache.
#[derive(Default)]
pub struct RowCallbackReminders {
    by_table: HashMap<String, Vec<RowCallback>>,
}

impl RowCallbackReminders {
    pub fn new() -> Self {
        RowCallbackReminders::default()
    }

    pub(crate) fn reminders_for(&mut self, table: &str) -> &mut Vec<RowCallback> {
        self.by_table.entry(table.to_string()).or_default()
    }

    /// Consume `self`, handing every table's accumulated callbacks to
    /// `dispatch` for invocation against a settled cache snapshot.
    pub fn drain(self, mut dispatch: impl FnMut(&str, RowCallback)) {
        for (table, callbacks) in self.by_table {
            for callback in callbacks {
                dispatch(&table, callback);
            }
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    refcount: u32,
    row: ProductValue,
}

/// The refcounted multiset of rows subscribed for one table.
#[derive(Clone, Default)]
pub struct TableCache {
    entries: ImHashMap<Vec<u8>, CacheEntry>,
    /// Unique (non-primary-key) column index: column -> (encoded value bytes -> row id key).
    unique_indexes: HashMap<usize, HashMap<Vec<u8>, Vec<u8>>>,
    /// Declared btree indexes, by index name: encoded key bytes -> row id keys with that key.
    btree_indexes: HashMap<String, BTreeMap<Vec<u8>, HashSet<Vec<u8>>>>,
}

impl TableCache {
    pub fn new() -> Self {
        TableCache::default()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProductValue> {
        self.entries.values().map(|e| &e.row)
    }

    pub fn find_by_unique(&self, column: usize, key: &AlgebraicValue) -> Option<&ProductValue> {
        let encoded = value::to_vec_untyped(key);
        let row_id_key = self.unique_indexes.get(&column)?.get(&encoded)?;
        self.entries.get(row_id_key).map(|e| &e.row)
    }

    pub fn find_by_index(&self, index_name: &str, key: &AlgebraicValue) -> Vec<&ProductValue> {
        let encoded = value::to_vec_untyped(key);
        let Some(tree) = self.btree_indexes.get(index_name) else {
            return Vec::new();
        };
        let Some(ids) = tree.get(&encoded) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| self.entries.get(id)).map(|e| &e.row).collect()
    }

    fn row_id_key(schema: &TableSchema, row: &ProductValue) -> Vec<u8> {
        match schema.primary_key {
            Some(col) => {
                let mut out = Vec::new();
                value::encode(&schema.row_type.elements[col].1, &row.elements[col], &mut out);
                out
            }
            None => encode_row(schema, row),
        }
    }

    fn index_row(&mut self, schema: &TableSchema, row_id_key: &[u8], row: &ProductValue) {
        for &column in &schema.unique_columns {
            let mut encoded = Vec::new();
            value::encode(&schema.row_type.elements[column].1, &row.elements[column], &mut encoded);
            self.unique_indexes.entry(column).or_default().insert(encoded, row_id_key.to_vec());
        }
        for index in &schema.indexes {
            let mut encoded = Vec::new();
            for &column in &index.columns {
                value::encode(&schema.row_type.elements[column].1, &row.elements[column], &mut encoded);
            }
            self.btree_indexes
                .entry(index.name.clone())
                .or_default()
                .entry(encoded)
                .or_default()
                .insert(row_id_key.to_vec());
        }
    }

    fn unindex_row(&mut self, schema: &TableSchema, row_id_key: &[u8], row: &ProductValue) {
        for &column in &schema.unique_columns {
            let mut encoded = Vec::new();
            value::encode(&schema.row_type.elements[column].1, &row.elements[column], &mut encoded);
            if let Some(map) = self.unique_indexes.get_mut(&column) {
                map.remove(&encoded);
            }
        }
        for index in &schema.indexes {
            let mut encoded = Vec::new();
            for &column in &index.columns {
                value::encode(&schema.row_type.elements[column].1, &row.elements[column], &mut encoded);
            }
            if let Some(tree) = self.btree_indexes.get_mut(&index.name) {
                if let Some(ids) = tree.get_mut(&encoded) {
                    ids.remove(row_id_key);
                    if ids.is_empty() {
                        tree.remove(&encoded);
                    }
                }
            }
        }
    }

    /// Apply one table's insert/delete row deltas from a single update,
    /// emitting row callbacks into `reminders` as appropriate.
    ///
    /// Rows are grouped by row id key (primary key bytes, or the full
    /// encoded row when there is no primary key). A group with exactly one
    /// insert and one delete whose rows differ is an `Update` on primary-key
    /// tables; otherwise net refcount delta decides whether this is a fresh
    /// `Insert`, a plain refcount bump, a `Delete`, or a no-op.
    pub fn apply_operations(
        &mut self,
        schema: &TableSchema,
        inserts: Vec<ProductValue>,
        deletes: Vec<ProductValue>,
        reminders: &mut Vec<RowCallback>,
    ) {
        struct Group {
            insert_count: u32,
            delete_count: u32,
            insert_row: Option<ProductValue>,
            delete_row: Option<ProductValue>,
        }

        let mut groups: HashMap<Vec<u8>, Group> = HashMap::new();

        for row in inserts {
            let key = Self::row_id_key(schema, &row);
            let group = groups.entry(key).or_insert(Group {
                insert_count: 0,
                delete_count: 0,
                insert_row: None,
                delete_row: None,
            });
            group.insert_count += 1;
            group.insert_row = Some(row);
        }
        for row in deletes {
            let key = Self::row_id_key(schema, &row);
            let group = groups.entry(key).or_insert(Group {
                insert_count: 0,
                delete_count: 0,
                insert_row: None,
                delete_row: None,
            });
            group.delete_count += 1;
            group.delete_row = Some(row);
        }

        for (key, group) in groups {
            let is_pk_update = schema.primary_key.is_some()
                && group.insert_count == 1
                && group.delete_count == 1
                && group
                    .insert_row
                    .as_ref()
                    .zip(group.delete_row.as_ref())
                    .map(|(new, old)| encode_row(schema, new) != encode_row(schema, old))
                    .unwrap_or(false);

            if is_pk_update {
                let new = group.insert_row.unwrap();
                let old = group.delete_row.unwrap();
                let existing = self.entries.get(&key).cloned();
                let refcount = existing.as_ref().map(|e| e.refcount).unwrap_or(1).max(1);
                if let Some(existing) = &existing {
                    self.unindex_row(schema, &key, &existing.row);
                }
                self.index_row(schema, &key, &new);
                self.entries.insert(key, CacheEntry { refcount, row: new.clone() });
                reminders.push(RowCallback::Update(old, new));
                continue;
            }

            let delta = group.insert_count as i64 - group.delete_count as i64;
            match self.entries.get(&key) {
                None => {
                    if delta <= 0 {
                        if delta < 0 {
                            log::warn!("refcount underflow applying operations to a row absent from the cache; clamping to 0");
                        }
                        continue;
                    }
                    let row = group.insert_row.expect("positive delta implies at least one insert");
                    self.index_row(schema, &key, &row);
                    reminders.push(RowCallback::Insert(row.clone()));
                    self.entries.insert(key, CacheEntry { refcount: delta as u32, row });
                }
                Some(existing) => {
                    let new_refcount = existing.refcount as i64 + delta;
                    if new_refcount <= 0 {
                        if new_refcount < 0 {
                            log::warn!("refcount underflow applying operations; clamping to 0 before removal");
                        }
                        let row = existing.row.clone();
                        self.unindex_row(schema, &key, &row);
                        self.entries.remove(&key);
                        reminders.push(RowCallback::Delete(row));
                    } else {
                        let row = group.insert_row.unwrap_or_else(|| existing.row.clone());
                        self.entries.insert(
                            key,
                            CacheEntry {
                                refcount: new_refcount as u32,
                                row,
                            },
                        );
                    }
                }
            }
        }
    }

    /// Replace the table's contents wholesale with `new_rows` (a
    /// resubscribe's full snapshot): previously-present rows not in the new
    /// set are deleted, brand-new rows are inserted, and rows present in
    /// both do not fire a callback. Exact duplicate rows within `new_rows`
    /// are deduplicated rather than accumulating refcount, since this path
    /// represents "the current full set" rather than a delta.
    pub fn reinitialize(&mut self, schema: &TableSchema, new_rows: Vec<ProductValue>, reminders: &mut Vec<RowCallback>) {
        let previous = std::mem::take(&mut self.entries);
        self.unique_indexes.clear();
        self.btree_indexes.clear();

        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        for row in new_rows {
            let key = Self::row_id_key(schema, &row);
            if !seen.insert(key.clone()) {
                log::warn!("received duplicate row in resubscribe snapshot; ignoring the duplicate");
                continue;
            }
            if let Some(entry) = previous.get(&key) {
                self.index_row(schema, &key, &entry.row);
                self.entries.insert(key, CacheEntry {
                    refcount: entry.refcount,
                    row: entry.row.clone(),
                });
            } else {
                self.index_row(schema, &key, &row);
                reminders.push(RowCallback::Insert(row.clone()));
                self.entries.insert(key, CacheEntry { refcount: 1, row });
            }
        }

        for (key, entry) in previous.iter() {
            if !seen.contains(key) {
                reminders.push(RowCallback::Delete(entry.row.clone()));
            }
        }
    }
}

fn encode_row(schema: &TableSchema, row: &ProductValue) -> Vec<u8> {
    let ty = crate::bsatn::AlgebraicType::Product(schema.row_type.clone());
    let mut out = Vec::new();
    value::encode(&ty, &AlgebraicValue::Product(row.clone()), &mut out);
    out
}

/// The whole local mirror of the subscribed database, one [`TableCache`] per
/// table, looked up by canonical table name.
#[derive(Clone, Default)]
pub struct ClientCache {
    tables: HashMap<String, TableCache>,
}

impl ClientCache {
    pub fn new() -> Self {
        ClientCache::default()
    }

    pub fn table_mut(&mut self, canonical_name: &str) -> &mut TableCache {
        self.tables.entry(canonical_name.to_string()).or_default()
    }

    pub fn table(&self, canonical_name: &str) -> Option<&TableCache> {
        self.tables.get(canonical_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsatn::{AlgebraicType, ProductType};
    use crate::table::TableSchema;

    fn report_schema(with_pk: bool) -> TableSchema {
        let row_type = ProductType::from(vec![("id", AlgebraicType::U64), ("body", AlgebraicType::String)]);
        let schema = TableSchema::new("report", "reports", row_type);
        if with_pk {
            schema.with_primary_key(0)
        } else {
            schema
        }
    }

    fn row(id: u64, body: &str) -> ProductValue {
        ProductValue {
            elements: vec![AlgebraicValue::U64(id), AlgebraicValue::String(body.to_string())],
        }
    }

    // S3: two inserts of the same row in one batch accumulate refcount
    // rather than deduplicating, on a table without a primary key.
    #[test]
    fn duplicate_inserts_without_primary_key_accumulate_refcount() {
        let schema = report_schema(false);
        let mut cache = TableCache::new();
        let mut reminders = Vec::new();
        cache.apply_operations(&schema, vec![row(1, "a"), row(1, "a")], vec![], &mut reminders);
        assert_eq!(cache.count(), 1);
        assert_eq!(reminders.len(), 1); // only fires Insert once, on the 0->1 transition

        let mut reminders = Vec::new();
        cache.apply_operations(&schema, vec![], vec![row(1, "a")], &mut reminders);
        assert_eq!(cache.count(), 1, "refcount 2 drops to 1, row should remain");
        assert!(reminders.is_empty());
    }

    // S4: one of the two refcounts is deleted, bringing the row back to
    // refcount 0 and a Delete event.
    #[test]
    fn refcount_reaching_zero_emits_delete() {
        let schema = report_schema(false);
        let mut cache = TableCache::new();
        let mut reminders = Vec::new();
        cache.apply_operations(&schema, vec![row(1, "a"), row(1, "a")], vec![], &mut reminders);
        let mut reminders = Vec::new();
        cache.apply_operations(&schema, vec![], vec![row(1, "a"), row(1, "a")], &mut reminders);
        assert_eq!(cache.count(), 0);
        assert_eq!(reminders.len(), 1);
        assert!(matches!(reminders[0], RowCallback::Delete(_)));
    }

    #[test]
    fn paired_insert_delete_on_primary_key_table_is_an_update() {
        let schema = report_schema(true);
        let mut cache = TableCache::new();
        let mut reminders = Vec::new();
        cache.apply_operations(&schema, vec![row(1, "a")], vec![], &mut reminders);

        let mut reminders = Vec::new();
        cache.apply_operations(&schema, vec![row(1, "b")], vec![row(1, "a")], &mut reminders);
        assert_eq!(cache.count(), 1);
        assert_eq!(reminders.len(), 1);
        match &reminders[0] {
            RowCallback::Update(old, new) => {
                assert_eq!(old.elements[1], AlgebraicValue::String("a".to_string()));
                assert_eq!(new.elements[1], AlgebraicValue::String("b".to_string()));
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn negative_refcount_is_clamped_with_a_warning_not_a_panic() {
        let schema = report_schema(false);
        let mut cache = TableCache::new();
        let mut reminders = Vec::new();
        cache.apply_operations(&schema, vec![], vec![row(1, "a")], &mut reminders);
        assert_eq!(cache.count(), 0);
        assert!(reminders.is_empty());
    }

    // S5: a resubscribe snapshot dedupes identical rows rather than
    // accumulating refcount (unlike the general apply path above).
    #[test]
    fn resubscribe_snapshot_dedupes_identical_rows() {
        let schema = report_schema(false);
        let mut cache = TableCache::new();
        let mut reminders = Vec::new();
        cache.reinitialize(&schema, vec![row(1, "a"), row(1, "a")], &mut reminders);
        assert_eq!(cache.count(), 1);
        assert_eq!(reminders.len(), 1);
    }

    #[test]
    fn resubscribe_snapshot_preserves_rows_present_in_both_sets() {
        let schema = report_schema(false);
        let mut cache = TableCache::new();
        let mut reminders = Vec::new();
        cache.reinitialize(&schema, vec![row(1, "a"), row(2, "b")], &mut reminders);

        let mut reminders = Vec::new();
        cache.reinitialize(&schema, vec![row(1, "a"), row(3, "c")], &mut reminders);
        assert_eq!(cache.count(), 2);
        // row 1 stays silently; row 2 deleted; row 3 inserted.
        assert_eq!(reminders.len(), 2);
    }
}
