//! Tracks logical connections keyed by `${uri}::${module_name}`, refcounted
//! by `retain`/`release` rather than owned by a single global slot.
//!
//! The one-connection-per-process model (a bare `RwLock<Option<Connection>>`)
//! doesn't survive a UI remounting its component tree (React StrictMode's
//! deliberate mount/unmount/mount churn in development): a naive release on
//! unmount would tear down and reopen the socket every render. Instead,
//! release defers actual teardown briefly, and a subsequent retain for the
//! same key before the deferred teardown runs cancels it — the underlying
//! connection never notices the blip.

use crate::identity::{ConnectionId, Identity};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Anything a managed connection needs to support: the manager only cares
/// about lifecycle, not about `T`'s own state.
pub trait ManagedConnection: Send + Sync + 'static {
    fn disconnect(&self);
}

/// The observable state of one logical connection, published as it changes
/// and readable at any time via [`ConnectionManager::get_snapshot`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub is_active: bool,
    pub identity: Option<Identity>,
    pub token: Option<String>,
    pub connection_id: Option<ConnectionId>,
    pub connection_error: Option<String>,
}

type StateListener = Box<dyn Fn(&ConnectionState) + Send>;

struct Entry<T> {
    connection: Arc<T>,
    refcount: u32,
    /// Bumped on every `release`; a deferred teardown checks this hasn't
    /// changed (i.e. nobody retained again) before actually tearing down.
    generation: u64,
    state: ConnectionState,
    listeners: Vec<StateListener>,
}

/// Holds every live logical connection for a process, keyed by
/// `${uri}::${module_name}`.
pub struct ConnectionManager<T: ManagedConnection> {
    entries: Mutex<HashMap<String, Entry<T>>>,
}

impl<T: ManagedConnection> Default for ConnectionManager<T> {
    fn default() -> Self {
        ConnectionManager { entries: Mutex::new(HashMap::new()) }
    }
}

pub fn connection_key(uri: &str, module_name: &str) -> String {
    format!("{uri}::{module_name}")
}

impl<T: ManagedConnection> ConnectionManager<T> {
    pub fn new() -> Self {
        ConnectionManager::default()
    }

    /// Retain the connection for `key`, creating it via `make` if this is
    /// the first retain. `make` is only invoked on the first retain for a
    /// given key (building a connection is the one part of this that can
    /// fail, e.g. a handshake error) — every subsequent retain just bumps
    /// the refcount and hands back the existing handle. Returns the shared
    /// connection handle.
    pub fn retain<E>(&self, key: &str, make: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.refcount += 1;
            entry.generation += 1;
            Ok(entry.connection.clone())
        } else {
            let connection = Arc::new(make()?);
            entries.insert(
                key.to_string(),
                Entry {
                    connection: connection.clone(),
                    refcount: 1,
                    generation: 0,
                    state: ConnectionState::default(),
                    listeners: Vec::new(),
                },
            );
            Ok(connection)
        }
    }

    /// Update the published state for `key` and notify every subscriber.
    /// A no-op if `key` has no entry (the connection already tore down).
    pub fn publish(&self, key: &str, update: impl FnOnce(&mut ConnectionState)) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(key) else { return };
        update(&mut entry.state);
        let snapshot = entry.state.clone();
        for listener in &entry.listeners {
            listener(&snapshot);
        }
    }

    /// Register a listener invoked on every subsequent [`ConnectionManager::publish`]
    /// for `key`. Does not fire immediately with the current state; pair with
    /// [`ConnectionManager::get_snapshot`] for that.
    pub fn subscribe(&self, key: &str, listener: impl Fn(&ConnectionState) + Send + 'static) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(key) {
            entry.listeners.push(Box::new(listener));
        }
    }

    pub fn get_snapshot(&self, key: &str) -> Option<ConnectionState> {
        self.entries.lock().unwrap().get(key).map(|e| e.state.clone())
    }

    /// Release one reference to the connection for `key`. If this was the
    /// last reference, teardown is deferred by `grace_period`; a `retain`
    /// for the same key before then cancels it (the `generation` check).
    pub fn release(self: &Arc<Self>, key: &str, grace_period: Duration, spawn_deferred: impl FnOnce(Box<dyn FnOnce() + Send>)) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return;
        }
        let expected_generation = entry.generation;
        drop(entries);

        let manager: Weak<Self> = Arc::downgrade(self);
        let key = key.to_string();
        spawn_deferred(Box::new(move || {
            std::thread::sleep(grace_period);
            let Some(manager) = manager.upgrade() else { return };
            let mut entries = manager.entries.lock().unwrap();
            if let Some(entry) = entries.get(&key) {
                if entry.refcount == 0 && entry.generation == expected_generation {
                    let entry = entries.remove(&key).unwrap();
                    drop(entries);
                    entry.connection.disconnect();
                }
            }
        }));
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.lock().unwrap().get(key).map(|e| e.connection.clone())
    }

    pub fn snapshot_keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConnection {
        disconnects: Arc<AtomicUsize>,
    }
    impl ManagedConnection for CountingConnection {
        fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    // S8: a release immediately followed by a retain for the same key (the
    // StrictMode remount pattern) must not tear the connection down.
    #[test]
    fn retain_after_release_within_grace_period_cancels_teardown() {
        let manager = Arc::new(ConnectionManager::<CountingConnection>::new());
        let disconnects = Arc::new(AtomicUsize::new(0));
        let key = connection_key("ws://localhost:3000", "my_module");

        let d2 = disconnects.clone();
        let conn = manager.retain(&key, || Ok::<_, std::convert::Infallible>(CountingConnection { disconnects: d2 })).unwrap();
        assert_eq!(Arc::strong_count(&conn), 2); // one held here, one in the manager's entry

        let (tx, rx) = std::sync::mpsc::channel::<Box<dyn FnOnce() + Send>>();
        manager.release(&key, Duration::from_millis(20), move |deferred| {
            tx.send(deferred).unwrap();
        });

        // Simulate the remount: retain again before the deferred teardown runs.
        let d3 = disconnects.clone();
        let _conn2 = manager
            .retain(&key, || Ok::<_, std::convert::Infallible>(CountingConnection { disconnects: d3 }))
            .unwrap();

        let deferred = rx.recv().unwrap();
        deferred();

        assert_eq!(disconnects.load(Ordering::SeqCst), 0, "retained connection must not be disconnected");
        assert!(manager.get(&key).is_some());
    }

    #[test]
    fn release_with_no_subsequent_retain_tears_down() {
        let manager = Arc::new(ConnectionManager::<CountingConnection>::new());
        let disconnects = Arc::new(AtomicUsize::new(0));
        let key = connection_key("ws://localhost:3000", "my_module");

        let d2 = disconnects.clone();
        let _conn = manager.retain(&key, || Ok::<_, std::convert::Infallible>(CountingConnection { disconnects: d2 })).unwrap();

        let (tx, rx) = std::sync::mpsc::channel::<Box<dyn FnOnce() + Send>>();
        manager.release(&key, Duration::from_millis(0), move |deferred| {
            tx.send(deferred).unwrap();
        });
        let deferred = rx.recv().unwrap();
        deferred();

        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(manager.get(&key).is_none());
    }

    #[test]
    fn publish_updates_snapshot_and_notifies_subscribers() {
        let manager = Arc::new(ConnectionManager::<CountingConnection>::new());
        let key = connection_key("ws://localhost:3000", "my_module");
        let _conn = manager
            .retain(&key, || Ok::<_, std::convert::Infallible>(CountingConnection { disconnects: Arc::new(AtomicUsize::new(0)) }))
            .unwrap();

        assert_eq!(manager.get_snapshot(&key), Some(ConnectionState::default()));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        manager.subscribe(&key, move |state| seen2.lock().unwrap().push(state.is_active));

        manager.publish(&key, |state| {
            state.is_active = true;
            state.identity = Some(Identity([7; 32]));
        });

        assert_eq!(*seen.lock().unwrap(), vec![true]);
        let snapshot = manager.get_snapshot(&key).unwrap();
        assert!(snapshot.is_active);
        assert_eq!(snapshot.identity, Some(Identity([7; 32])));
    }
}
