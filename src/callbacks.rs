//! Listener registries for row and reducer callbacks.
//!
//! These replace the autogenerated, type-keyed `DbCallbacks`/`ReducerCallbacks`
//! the CLI used to produce one of per table/reducer: here everything is
//! keyed by name instead, since row and reducer shapes aren't known as Rust
//! types in this crate (there is no per-module codegen here). Listeners fire
//! in registration order and a registration can be undone by the id handed
//! back from it.

use crate::bsatn::ProductValue;
use crate::client_cache::ClientCache;
use crate::identity::{ConnectionId, Identity, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;

/// Handed back from every `on_*` registration; pass it to the matching
/// `remove_*` to stop receiving callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type RowListener = Box<dyn Fn(&ProductValue, &Arc<ClientCache>) + Send + Sync>;
type UpdateListener = Box<dyn Fn(&ProductValue, &ProductValue, &Arc<ClientCache>) + Send + Sync>;

#[derive(Default)]
struct TableCallbacks {
    on_insert: Vec<(CallbackId, RowListener)>,
    on_delete: Vec<(CallbackId, RowListener)>,
    on_update: Vec<(CallbackId, UpdateListener)>,
}

/// Row-level listeners, one bucket per table, looked up by canonical name.
///
/// Autogenerated call sites (out of scope here) would reach this through the
/// connection handle's table accessors; this struct itself is not meant to
/// be constructed by application code.
#[derive(Default)]
pub struct DbCallbacks {
    tables: HashMap<String, TableCallbacks>,
    next_id: u64,
}

impl DbCallbacks {
    pub fn new() -> Self {
        DbCallbacks::default()
    }

    fn fresh_id(&mut self) -> CallbackId {
        self.next_id += 1;
        CallbackId(self.next_id)
    }

    pub fn on_insert(
        &mut self,
        table: &str,
        listener: impl Fn(&ProductValue, &Arc<ClientCache>) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.fresh_id();
        self.tables.entry(table.to_string()).or_default().on_insert.push((id, Box::new(listener)));
        id
    }

    pub fn on_delete(
        &mut self,
        table: &str,
        listener: impl Fn(&ProductValue, &Arc<ClientCache>) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.fresh_id();
        self.tables.entry(table.to_string()).or_default().on_delete.push((id, Box::new(listener)));
        id
    }

    pub fn on_update(
        &mut self,
        table: &str,
        listener: impl Fn(&ProductValue, &ProductValue, &Arc<ClientCache>) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.fresh_id();
        self.tables.entry(table.to_string()).or_default().on_update.push((id, Box::new(listener)));
        id
    }

    pub fn remove(&mut self, table: &str, id: CallbackId) {
        if let Some(callbacks) = self.tables.get_mut(table) {
            callbacks.on_insert.retain(|(cid, _)| *cid != id);
            callbacks.on_delete.retain(|(cid, _)| *cid != id);
            callbacks.on_update.retain(|(cid, _)| *cid != id);
        }
    }

    pub(crate) fn invoke_on_insert(&self, table: &str, row: &ProductValue, db_state: &Arc<ClientCache>) {
        if let Some(callbacks) = self.tables.get(table) {
            for (_, listener) in &callbacks.on_insert {
                listener(row, db_state);
            }
        }
    }

    pub(crate) fn invoke_on_delete(&self, table: &str, row: &ProductValue, db_state: &Arc<ClientCache>) {
        if let Some(callbacks) = self.tables.get(table) {
            for (_, listener) in &callbacks.on_delete {
                listener(row, db_state);
            }
        }
    }

    pub(crate) fn invoke_on_update(&self, table: &str, old: &ProductValue, new: &ProductValue, db_state: &Arc<ClientCache>) {
        if let Some(callbacks) = self.tables.get(table) {
            for (_, listener) in &callbacks.on_update {
                listener(old, new, db_state);
            }
        }
    }
}

/// Why a reducer call's effects did or didn't take hold; the application-
/// facing counterpart of [`crate::message::UpdateStatus`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReducerStatus {
    Committed,
    Failed(String),
    OutOfEnergy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReducerEvent {
    pub reducer_name: String,
    pub status: ReducerStatus,
    pub timestamp: Timestamp,
    pub caller_identity: Identity,
    pub caller_connection_id: ConnectionId,
    pub energy_quanta_used: u64,
    pub host_duration_micros: u64,
}

type ReducerListener = Box<dyn Fn(&ReducerEvent, &Arc<ClientCache>) + Send + Sync>;

/// Reducer-result listeners, one bucket per reducer name.
#[derive(Default)]
pub struct ReducerCallbacks {
    by_name: HashMap<String, Vec<(CallbackId, ReducerListener)>>,
    next_id: u64,
}

impl ReducerCallbacks {
    pub fn new() -> Self {
        ReducerCallbacks::default()
    }

    fn fresh_id(&mut self) -> CallbackId {
        self.next_id += 1;
        CallbackId(self.next_id)
    }

    pub fn on_reducer(
        &mut self,
        reducer_name: &str,
        listener: impl Fn(&ReducerEvent, &Arc<ClientCache>) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.fresh_id();
        self.by_name.entry(reducer_name.to_string()).or_default().push((id, Box::new(listener)));
        id
    }

    pub fn remove(&mut self, reducer_name: &str, id: CallbackId) {
        if let Some(listeners) = self.by_name.get_mut(reducer_name) {
            listeners.retain(|(cid, _)| *cid != id);
        }
    }

    pub(crate) fn invoke(&self, event: &ReducerEvent, db_state: &Arc<ClientCache>) {
        if let Some(listeners) = self.by_name.get(&event.reducer_name) {
            for (_, listener) in listeners {
                listener(event, db_state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsatn::ProductValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_fire_in_registration_order_and_can_be_removed() {
        let mut callbacks = DbCallbacks::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let first = callbacks.on_insert("report", move |_, _| o1.lock().unwrap().push(1));
        callbacks.on_insert("report", move |_, _| o2.lock().unwrap().push(2));

        let db_state = Arc::new(ClientCache::new());
        let row = ProductValue { elements: vec![] };
        callbacks.invoke_on_insert("report", &row, &db_state);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);

        callbacks.remove("report", first);
        order.lock().unwrap().clear();
        callbacks.invoke_on_insert("report", &row, &db_state);
        assert_eq!(*order.lock().unwrap(), vec![2]);
    }

    #[test]
    fn unrelated_table_listeners_do_not_fire() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut callbacks = DbCallbacks::new();
        let calls2 = calls.clone();
        callbacks.on_insert("report", move |_, _| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        let db_state = Arc::new(ClientCache::new());
        let row = ProductValue { elements: vec![] };
        callbacks.invoke_on_insert("other_table", &row, &db_state);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
