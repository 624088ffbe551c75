//! The public, application-facing connection surface: `DbConnectionBuilder`
//! and the `Connection` handle it produces.
//!
//! This is the thin layer spec.md §6 describes on top of the engine in
//! [`crate::background_connection`]: a builder with `.with_uri`/`.build()`,
//! and a connection handle exposing `.table(name)`, `.reducer(name)`, and
//! `.subscription_builder()`. Per-module generated bindings (out of scope
//! here) would wrap each of these in typed, per-table/per-reducer accessors;
//! this crate only goes as far as name-addressed handles.
//!
//! Every `Connection` is backed by a logical connection retained from a
//! process-wide [`ConnectionManager`], keyed by `${uri}::${module_name}`
//! (spec.md §4.5): building a second `Connection` for the same key while
//! the first is still alive reuses the same underlying socket and
//! dispatcher rather than opening a new one, and dropping a `Connection`
//! releases (rather than immediately tears down) that reference, so a UI
//! remount cycle never needs to reconnect.

use crate::background_connection::BackgroundConnection;
use crate::bsatn::{AlgebraicValue, ProductValue};
use crate::callbacks::{CallbackId, ReducerEvent};
use crate::client_cache::ClientCache;
use crate::connection_manager::{connection_key, ConnectionManager, ConnectionState, ManagedConnection};
use crate::error::Error;
use crate::identity::{ConnectionId, Identity};
use crate::reducer::ReducerCallError;
use crate::subscription::SubscriptionHandle;
use crate::table::TableSchema;
use crate::websocket::CompressionPreference;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

impl ManagedConnection for Arc<BackgroundConnection> {
    fn disconnect(&self) {
        BackgroundConnection::disconnect(self)
    }
}

/// How long `release()` waits before actually tearing a connection down,
/// giving a subsequent `retain()` for the same key (a UI remount) a chance
/// to cancel the teardown. See spec.md §4.5 and §9's StrictMode rationale.
const RELEASE_GRACE_PERIOD: Duration = Duration::from_millis(50);

static CONNECTION_MANAGER: Lazy<ConnectionManager<Arc<BackgroundConnection>>> = Lazy::new(ConnectionManager::new);

/// Builds a [`Connection`]. Mirrors the fluent builder surface spec.md §6
/// lists: `.withUri`/`.withModuleName`/`.withToken`/`.withCompression`/
/// `.withLightMode`, `.onConnect`/`.onConnectError`/`.onDisconnect`, `.build()`.
#[derive(Default)]
pub struct DbConnectionBuilder {
    uri: String,
    module_name: String,
    token: Option<String>,
    compression: Option<CompressionPreference>,
    light_mode: bool,
    tables: Vec<TableSchema>,
    on_connect: Option<Box<dyn FnOnce(Identity, &str, ConnectionId) + Send>>,
    on_connect_error: Option<Box<dyn FnOnce(String) + Send>>,
    on_disconnect: Option<Box<dyn FnOnce(Option<String>) + Send>>,
}

impl DbConnectionBuilder {
    pub fn new() -> Self {
        DbConnectionBuilder::default()
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn with_module_name(mut self, module_name: impl Into<String>) -> Self {
        self.module_name = module_name.into();
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_compression(mut self, compression: CompressionPreference) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_light_mode(mut self, light_mode: bool) -> Self {
        self.light_mode = light_mode;
        self
    }

    /// Register a table schema this connection should know about before the
    /// handshake completes. Called once per table by the (out-of-scope)
    /// generated bindings layer.
    pub fn with_table(mut self, schema: TableSchema) -> Self {
        self.tables.push(schema);
        self
    }

    pub fn on_connect(mut self, cb: impl FnOnce(Identity, &str, ConnectionId) + Send + 'static) -> Self {
        self.on_connect = Some(Box::new(cb));
        self
    }

    pub fn on_connect_error(mut self, cb: impl FnOnce(String) + Send + 'static) -> Self {
        self.on_connect_error = Some(Box::new(cb));
        self
    }

    pub fn on_disconnect(mut self, cb: impl FnOnce(Option<String>) + Send + 'static) -> Self {
        self.on_disconnect = Some(Box::new(cb));
        self
    }

    /// Establish (or join) the logical connection for `${uri}::${module_name}`.
    pub fn build(self) -> anyhow::Result<Connection> {
        let key = connection_key(&self.uri, &self.module_name);
        let uri = self.uri;
        let module_name = self.module_name;
        let token = self.token;
        let compression = self.compression.unwrap_or(CompressionPreference::None);
        let light_mode = self.light_mode;
        let tables = self.tables.clone();

        // `ConnectionManager<Arc<BackgroundConnection>>::retain` hands back
        // `Arc<Arc<BackgroundConnection>>` (the manager's own refcounting
        // Arc wrapping the self-referential one `connect()` builds); unwrap
        // one layer to the plain handle the rest of this module works with.
        let managed = CONNECTION_MANAGER.retain(&key, move || {
            BackgroundConnection::connect(&uri, &module_name, token.as_deref(), compression, light_mode, tables, None, None, None)
        })?;
        let conn: Arc<BackgroundConnection> = (*managed).clone();

        // A connection that already existed (a remount joining a live
        // socket) still needs this builder's tables registered: the first
        // builder's set may not be a superset of a later one's.
        for schema in self.tables {
            conn.register_table(schema);
        }

        let key_for_connect = key.clone();
        conn.add_on_connect(Box::new(move |identity, token, connection_id| {
            CONNECTION_MANAGER.publish(&key_for_connect, |state| {
                state.is_active = true;
                state.identity = Some(identity);
                state.token = Some(token.to_string());
                state.connection_id = Some(connection_id);
                state.connection_error = None;
            });
        }));
        if let Some(cb) = self.on_connect {
            conn.add_on_connect(cb);
        }

        let key_for_error = key.clone();
        conn.add_on_connect_error(Box::new(move |reason| {
            CONNECTION_MANAGER.publish(&key_for_error, |state| {
                state.is_active = false;
                state.connection_error = Some(reason);
            });
        }));
        if let Some(cb) = self.on_connect_error {
            conn.add_on_connect_error(cb);
        }

        let key_for_disconnect = key.clone();
        conn.add_on_disconnect(Box::new(move |reason| {
            CONNECTION_MANAGER.publish(&key_for_disconnect, |state| {
                state.is_active = false;
                state.connection_error = reason;
            });
        }));
        if let Some(cb) = self.on_disconnect {
            conn.add_on_disconnect(cb);
        }

        Ok(Connection { inner: conn, key })
    }
}

/// A handle to a table's rows and row-level callbacks, addressed by name
/// (spec.md §6's `.db.<table>`). Per-module generated bindings would wrap
/// this in a typed accessor per table; this crate stops at name lookup.
pub struct TableHandle<'a> {
    conn: &'a Connection,
    name: String,
}

impl<'a> TableHandle<'a> {
    pub fn count(&self) -> usize {
        self.conn.inner.table_count(&self.name)
    }

    pub fn iter(&self) -> impl Iterator<Item = ProductValue> {
        self.conn.inner.table_rows(&self.name).into_iter()
    }

    pub fn find_by_unique(&self, column: usize, key: &AlgebraicValue) -> Option<ProductValue> {
        self.conn.inner.find_by_unique(&self.name, column, key)
    }

    pub fn find_by_index(&self, index_name: &str, key: &AlgebraicValue) -> Vec<ProductValue> {
        self.conn.inner.find_by_index(&self.name, index_name, key)
    }

    pub fn on_insert(&self, f: impl Fn(&ProductValue, &Arc<ClientCache>) + Send + Sync + 'static) -> CallbackId {
        self.conn.inner.on_insert(&self.name, f)
    }

    pub fn on_delete(&self, f: impl Fn(&ProductValue, &Arc<ClientCache>) + Send + Sync + 'static) -> CallbackId {
        self.conn.inner.on_delete(&self.name, f)
    }

    pub fn on_update(&self, f: impl Fn(&ProductValue, &ProductValue, &Arc<ClientCache>) + Send + Sync + 'static) -> CallbackId {
        self.conn.inner.on_update(&self.name, f)
    }

    pub fn remove_callback(&self, id: CallbackId) {
        self.conn.inner.remove_db_callback(&self.name, id);
    }
}

/// A handle to call one reducer and observe its transactions (spec.md §6's
/// `.reducers.<name>`/`.reducers.on<Name>`).
pub struct ReducerHandle<'a> {
    conn: &'a Connection,
    name: String,
}

impl<'a> ReducerHandle<'a> {
    /// Invoke this reducer with already-BSATN-encoded arguments. The
    /// returned future resolves with the reducer's raw return bytes once
    /// `ReducerResult` or a matching `TransactionUpdate` arrives, after the
    /// row callbacks this call's own deltas triggered have already fired
    /// (spec.md §4.4's ordering contract).
    pub fn call(&self, arg_bytes: Vec<u8>) -> impl Future<Output = Result<Vec<u8>, ReducerCallError>> {
        self.conn.inner.call_reducer(self.name.clone(), arg_bytes, 0)
    }

    pub fn on(&self, f: impl Fn(&ReducerEvent, &Arc<ClientCache>) + Send + Sync + 'static) -> CallbackId {
        self.conn.inner.on_reducer(&self.name, f)
    }

    pub fn remove_callback(&self, id: CallbackId) {
        self.conn.inner.remove_reducer_callback(&self.name, id);
    }
}

/// Builds a single-query subscription (spec.md §6's `.subscriptionBuilder()`).
pub struct SubscriptionBuilder<'a> {
    conn: &'a Connection,
    on_applied: Option<Box<dyn FnOnce() + Send>>,
    on_error: Option<Box<dyn FnOnce(String) + Send>>,
}

impl<'a> SubscriptionBuilder<'a> {
    pub fn on_applied(mut self, cb: impl FnOnce() + Send + 'static) -> Self {
        self.on_applied = Some(Box::new(cb));
        self
    }

    pub fn on_error(mut self, cb: impl FnOnce(String) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(cb));
        self
    }

    pub fn subscribe(self, query: impl Into<String>) -> SubscriptionHandle {
        let handle = self.conn.inner.subscribe_single(query);
        if let Some(cb) = self.on_applied {
            handle.on_applied(cb);
        }
        if let Some(cb) = self.on_error {
            handle.on_error(cb);
        }
        handle
    }
}

/// One logical connection to a module, shared by every `Connection` handle
/// retained for the same `${uri}::${module_name}` key.
///
/// Dropping a `Connection` releases its share of the underlying socket
/// (deferred, see [`RELEASE_GRACE_PERIOD`]); call [`Connection::disconnect`]
/// to tear the whole logical connection down immediately, for every holder.
pub struct Connection {
    inner: Arc<BackgroundConnection>,
    key: String,
}

impl Connection {
    pub fn builder() -> DbConnectionBuilder {
        DbConnectionBuilder::new()
    }

    pub fn table(&self, name: impl Into<String>) -> TableHandle<'_> {
        TableHandle { conn: self, name: name.into() }
    }

    pub fn reducer(&self, name: impl Into<String>) -> ReducerHandle<'_> {
        ReducerHandle { conn: self, name: name.into() }
    }

    pub fn subscription_builder(&self) -> SubscriptionBuilder<'_> {
        SubscriptionBuilder { conn: self, on_applied: None, on_error: None }
    }

    /// The legacy whole-connection subscription: a bundle of query strings
    /// with only an `onApplied` callback (spec.md §4.4's `LegacyActive`).
    pub fn subscribe_to_all_tables(&self, queries: &[&str]) -> SubscriptionHandle {
        self.inner.subscribe_all_tables(queries)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.inner.unsubscribe(handle);
    }

    pub fn one_off_query(&self, query: impl Into<String>) -> impl Future<Output = Result<HashMap<String, Vec<ProductValue>>, Error>> {
        self.inner.one_off_query(query)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.identity()
    }

    pub fn token(&self) -> Option<String> {
        self.inner.token()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection_id()
    }

    pub fn is_active(&self) -> bool {
        CONNECTION_MANAGER.get_snapshot(&self.key).map(|s| s.is_active).unwrap_or(false)
    }

    /// Observe this logical connection's `{isActive, identity, token,
    /// connectionId, connectionError}` state (spec.md §4.5). Does not fire
    /// immediately with the current value; call [`Connection::snapshot`]
    /// first if you need that.
    pub fn subscribe_to_state(&self, listener: impl Fn(&ConnectionState) + Send + 'static) {
        CONNECTION_MANAGER.subscribe(&self.key, listener);
    }

    pub fn snapshot(&self) -> ConnectionState {
        CONNECTION_MANAGER.get_snapshot(&self.key).unwrap_or_default()
    }

    /// Tear this logical connection down immediately, for every `Connection`
    /// handle retained against the same key: closes the transport, rejects
    /// every in-flight reducer call, and ends every subscription (spec.md
    /// §5). This bypasses the refcounted deferred-release path `Drop` uses;
    /// it is the explicit, terminal action an application asks for.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        CONNECTION_MANAGER.release(&self.key, RELEASE_GRACE_PERIOD, |deferred| {
            std::thread::spawn(deferred);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsatn::{AlgebraicType, ProductType};

    fn report_schema() -> TableSchema {
        TableSchema::new("report", "reports", ProductType::from(vec![("id", AlgebraicType::U64)])).with_primary_key(0)
    }

    // Building against an unreachable host must fail the builder, not panic,
    // and must not leave a dangling entry in the connection manager.
    #[test]
    fn build_against_unreachable_host_fails_cleanly() {
        let key = connection_key("ws://127.0.0.1:1", "nonexistent_module_for_tests");
        let result = DbConnectionBuilder::new()
            .with_uri("ws://127.0.0.1:1")
            .with_module_name("nonexistent_module_for_tests")
            .with_table(report_schema())
            .build();
        assert!(result.is_err());
        assert!(CONNECTION_MANAGER.get(&key).is_none());
    }
}
