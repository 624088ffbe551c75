//! The message-pipeline engine: owns the background runtime, the decoded
//! connection state (cache, schemas, subscriptions, in-flight reducer
//! calls), and the dispatcher that drives everything forward as
//! [`ServerMessage`](crate::message::ServerMessage)s arrive.
//!
//! [`crate::connection::Connection`] is the public-facing handle built on
//! top of this; this module doesn't know about builders or `.db.<table>`
//! accessors, only about the wire and the state it produces.

use crate::bsatn::value;
use crate::bsatn::{AlgebraicType, AlgebraicValue, ProductValue};
use crate::callbacks::{CallbackId, DbCallbacks, ReducerCallbacks, ReducerEvent};
use crate::client_cache::{ClientCache, RowCallback, RowCallbackReminders};
use crate::error::{DecodeError, Error};
use crate::identity::{ConnectionId, Identity, Timestamp};
use crate::message::{
    ClientMessage, QueryRows, QuerySetUpdate, ReducerOutcome, RowList, ServerMessage, TableUpdate, TransactionUpdate, TransactionUpdateLight,
};
use crate::reducer::{reducer_event_from_transaction_update, ReducerCallError, ReducerCallTracker, ReducerResultListener};
use crate::stats::{QueryIdAllocator, RequestIdAllocator};
use crate::subscription::{SubscriptionHandle, SubscriptionState};
use crate::table::{TableRegistry, TableSchema};
use crate::websocket::{self, CompressionPreference, DbConnection};
use futures::StreamExt;
use futures_channel::{mpsc, oneshot};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime;

pub(crate) type ConnectCallback = Box<dyn FnOnce(Identity, &str, ConnectionId) + Send>;
pub(crate) type ConnectErrorCallback = Box<dyn FnOnce(String) + Send>;
pub(crate) type DisconnectCallback = Box<dyn FnOnce(Option<String>) + Send>;

struct ConnectionState {
    tables: TableRegistry,
    cache: ClientCache,
    db_callbacks: DbCallbacks,
    reducer_callbacks: ReducerCallbacks,
    reducer_tracker: ReducerCallTracker,
    subscriptions: HashMap<u64, SubscriptionHandle>,
    legacy_subscription: Option<SubscriptionHandle>,
    identity: Option<Identity>,
    token: Option<String>,
    connection_id: ConnectionId,
}

/// A background `tokio` runtime to drive the socket on, either borrowed from
/// whatever runtime the caller is already inside (if any) or spun up fresh.
/// A caller that already has an async runtime running (e.g. an `async fn
/// main`) gets its socket I/O scheduled there instead of paying for a
/// second one.
enum BackgroundRuntime {
    Borrowed(runtime::Handle),
    Owned(runtime::Runtime),
}

impl BackgroundRuntime {
    fn handle(&self) -> runtime::Handle {
        match self {
            BackgroundRuntime::Borrowed(handle) => handle.clone(),
            BackgroundRuntime::Owned(rt) => rt.handle().clone(),
        }
    }

    /// Run `fut` to completion from a context that may or may not already be
    /// inside this runtime. Borrowing an existing runtime means the calling
    /// thread is already inside it, so this must hop to a blocking thread
    /// (`block_in_place`) rather than block the executor; an owned runtime
    /// was built fresh and the calling thread is not inside it, so it can
    /// block directly.
    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        match self {
            BackgroundRuntime::Borrowed(handle) => tokio::task::block_in_place(|| handle.block_on(fut)),
            BackgroundRuntime::Owned(rt) => rt.block_on(fut),
        }
    }
}

fn enter_or_create_runtime() -> anyhow::Result<BackgroundRuntime> {
    if let Ok(handle) = runtime::Handle::try_current() {
        Ok(BackgroundRuntime::Borrowed(handle))
    } else {
        let rt = runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("spacetimedb-sdk")
            .enable_all()
            .build()?;
        Ok(BackgroundRuntime::Owned(rt))
    }
}

/// Owns one logical connection's runtime, wire state, and dispatcher.
pub(crate) struct BackgroundConnection {
    _runtime: BackgroundRuntime,
    send_chan: mpsc::UnboundedSender<ClientMessage>,
    state: Mutex<ConnectionState>,
    request_ids: RequestIdAllocator,
    query_ids: QueryIdAllocator,
    connected: AtomicBool,
    on_connect: Mutex<Option<ConnectCallback>>,
    on_connect_error: Mutex<Option<ConnectErrorCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    one_off_queries: Mutex<HashMap<Vec<u8>, oneshot::Sender<Result<HashMap<String, Vec<ProductValue>>, Error>>>>,
}

impl BackgroundConnection {
    /// Establish the WebSocket handshake synchronously and start the
    /// background message loop and dispatcher. `onConnect`/`onConnectError`
    /// fire later, asynchronously, once the server's `InitialConnection`
    /// arrives (or the transport fails first).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn connect(
        uri: &str,
        module_name: &str,
        token: Option<&str>,
        compression: CompressionPreference,
        light_mode: bool,
        tables: Vec<TableSchema>,
        on_connect: Option<ConnectCallback>,
        on_connect_error: Option<ConnectErrorCallback>,
        on_disconnect: Option<DisconnectCallback>,
    ) -> anyhow::Result<Arc<Self>> {
        let runtime = enter_or_create_runtime()?;
        let handle = runtime.handle();
        let connection_id = ConnectionId::random();

        let mut registry = TableRegistry::new();
        for schema in tables {
            registry.register(schema);
        }

        let state = Mutex::new(ConnectionState {
            tables: registry,
            cache: ClientCache::new(),
            db_callbacks: DbCallbacks::new(),
            reducer_callbacks: ReducerCallbacks::new(),
            reducer_tracker: ReducerCallTracker::new(),
            subscriptions: HashMap::new(),
            legacy_subscription: None,
            identity: None,
            token: token.map(str::to_string),
            connection_id,
        });

        let db_connection = runtime.block_on(DbConnection::connect(uri, module_name, connection_id, compression, light_mode, token))?;
        let (_read_write_loop, incoming, outgoing) = db_connection.spawn_message_loop(&handle);

        let conn = Arc::new(BackgroundConnection {
            _runtime: runtime,
            send_chan: outgoing,
            state,
            request_ids: RequestIdAllocator::new(),
            query_ids: QueryIdAllocator::new(),
            connected: AtomicBool::new(false),
            on_connect: Mutex::new(on_connect),
            on_connect_error: Mutex::new(on_connect_error),
            on_disconnect: Mutex::new(on_disconnect),
            one_off_queries: Mutex::new(HashMap::new()),
        });

        let dispatcher = conn.clone();
        handle.spawn(async move {
            let mut incoming = incoming;
            while let Some(msg) = incoming.next().await {
                dispatcher.dispatch(msg);
            }
            dispatcher.handle_transport_closed();
        });

        Ok(conn)
    }

    fn send(&self, msg: ClientMessage) {
        if self.send_chan.unbounded_send(msg).is_err() {
            log::warn!("attempted to send a message after the connection's outbound channel closed");
        }
    }

    // ---- dispatch ----------------------------------------------------

    fn dispatch(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::InitialConnection {
                identity,
                token,
                connection_id,
            } => self.handle_initial_connection(identity, token, connection_id),
            ServerMessage::InitialSubscription { query_sets, request_id: _ } => self.handle_initial_subscription(query_sets),
            ServerMessage::SubscribeApplied { query_id, request_id: _, rows } => self.handle_subscribe_applied(query_id, rows),
            ServerMessage::UnsubscribeApplied { query_id, request_id: _, rows } => self.handle_unsubscribe_applied(query_id, rows),
            ServerMessage::SubscriptionError { query_id, request_id: _, error } => self.handle_subscription_error(query_id, error),
            ServerMessage::TransactionUpdate(update) => self.handle_transaction_update(update),
            ServerMessage::TransactionUpdateLight(update) => self.handle_transaction_update_light(update),
            ServerMessage::ReducerResult { request_id, timestamp, result } => self.handle_reducer_result(request_id, timestamp, result),
            ServerMessage::OneOffQueryResponse { message_id, tables, error } => self.handle_one_off_response(message_id, tables, error),
        }
    }

    fn handle_initial_connection(&self, identity: Identity, token: Box<str>, connection_id: ConnectionId) {
        crate::stats::METRICS.record_message_kind("InitialConnection");
        {
            let mut state = self.state.lock().unwrap();
            state.identity = Some(identity);
            state.token = Some(token.to_string());
            state.connection_id = connection_id;
        }
        self.connected.store(true, Ordering::SeqCst);
        if let Some(cb) = self.on_connect.lock().unwrap().take() {
            cb(identity, &token, connection_id);
        }
    }

    fn handle_initial_subscription(&self, query_sets: Vec<QuerySetUpdate>) {
        crate::stats::METRICS.record_message_kind("InitialSubscription");
        let mut reminders = RowCallbackReminders::new();
        let legacy_handle = {
            let mut state = self.state.lock().unwrap();
            for query_set in &query_sets {
                for table_update in &query_set.tables {
                    apply_table_update(&mut state, table_update, &mut reminders, ApplyMode::Snapshot);
                }
            }
            state.legacy_subscription.clone()
        };
        self.drain_reminders(reminders);
        match legacy_handle {
            Some(handle) => {
                crate::stats::METRICS.active_subscriptions.inc();
                handle.mark_legacy_active();
            }
            None => log::warn!("received InitialSubscription with no pending legacy subscription handle"),
        }
    }

    fn handle_subscribe_applied(&self, query_id: u64, rows: QueryRows) {
        crate::stats::METRICS.record_message_kind("SubscribeApplied");
        let mut reminders = RowCallbackReminders::new();
        let handle = {
            let mut state = self.state.lock().unwrap();
            for table_update in &rows.tables {
                apply_table_update(&mut state, table_update, &mut reminders, ApplyMode::Delta);
            }
            state.subscriptions.get(&query_id).cloned()
        };
        self.drain_reminders(reminders);
        match handle {
            Some(handle) => {
                crate::stats::METRICS.active_subscriptions.inc();
                handle.mark_active(query_id);
            }
            None => log::warn!("SubscribeApplied for unknown query_id {query_id}"),
        }
    }

    fn handle_unsubscribe_applied(&self, query_id: u64, rows: QueryRows) {
        crate::stats::METRICS.record_message_kind("UnsubscribeApplied");
        let mut reminders = RowCallbackReminders::new();
        let handle = {
            let mut state = self.state.lock().unwrap();
            for table_update in &rows.tables {
                apply_table_update(&mut state, table_update, &mut reminders, ApplyMode::Delta);
            }
            state.subscriptions.remove(&query_id)
        };
        self.drain_reminders(reminders);
        match handle {
            Some(handle) => handle.mark_ended(),
            None => log::warn!("UnsubscribeApplied for unknown query_id {query_id}"),
        }
    }

    fn handle_subscription_error(&self, query_id: Option<u64>, error: Box<str>) {
        crate::stats::METRICS.record_message_kind("SubscriptionError");
        match query_id {
            Some(query_id) => {
                let handle = self.state.lock().unwrap().subscriptions.remove(&query_id);
                match handle {
                    Some(handle) => handle.mark_error(error.to_string()),
                    None => log::warn!("SubscriptionError for unknown query_id {query_id}: {error}"),
                }
            }
            // No query_id to attribute the error to: the server considers it
            // fatal to the whole connection, not to one subscription.
            None => {
                log::error!("unattributed subscription error, tearing down the connection: {error}");
                self.fail_connection(error.to_string());
            }
        }
    }

    fn handle_transaction_update(&self, update: TransactionUpdate) {
        crate::stats::METRICS.record_message_kind("TransactionUpdate");
        let mut reminders = RowCallbackReminders::new();
        let resolved = {
            let mut state = self.state.lock().unwrap();
            for query_set in &update.query_sets {
                for table_update in &query_set.tables {
                    apply_table_update(&mut state, table_update, &mut reminders, ApplyMode::Delta);
                }
            }
            match state.identity {
                Some(our_identity) if our_identity == update.caller_identity && state.connection_id == update.caller_connection_id => {
                    state.reducer_tracker.resolve_transaction_update(&update, our_identity, state.connection_id)
                }
                _ => None,
            }
        };
        // Row callbacks for the rows this reducer touched fire before its
        // own resolution/reducer-name callback, regardless of which path
        // resolved it.
        self.drain_reminders(reminders);
        let event = resolved.unwrap_or_else(|| reducer_event_from_transaction_update(&update));
        let state = self.state.lock().unwrap();
        let snapshot = Arc::new(state.cache.clone());
        state.reducer_callbacks.invoke(&event, &snapshot);
    }

    fn handle_transaction_update_light(&self, update: TransactionUpdateLight) {
        crate::stats::METRICS.record_message_kind("TransactionUpdateLight");
        let mut reminders = RowCallbackReminders::new();
        {
            let mut state = self.state.lock().unwrap();
            for query_set in &update.query_sets {
                for table_update in &query_set.tables {
                    apply_table_update(&mut state, table_update, &mut reminders, ApplyMode::Delta);
                }
            }
        }
        self.drain_reminders(reminders);
    }

    fn handle_reducer_result(&self, request_id: u32, timestamp: Timestamp, result: ReducerOutcome) {
        crate::stats::METRICS.record_message_kind("ReducerResult");
        let mut reminders = RowCallbackReminders::new();
        let event = {
            let mut state = self.state.lock().unwrap();
            if let ReducerOutcome::Ok { transaction_update, .. } = &result {
                for query_set in &transaction_update.query_sets {
                    for table_update in &query_set.tables {
                        apply_table_update(&mut state, table_update, &mut reminders, ApplyMode::Delta);
                    }
                }
            }
            state.reducer_tracker.resolve_reducer_result(request_id, timestamp, result)
        };
        self.drain_reminders(reminders);
        if let Some(event) = event {
            let state = self.state.lock().unwrap();
            let snapshot = Arc::new(state.cache.clone());
            state.reducer_callbacks.invoke(&event, &snapshot);
        }
    }

    fn handle_one_off_response(&self, message_id: Box<[u8]>, tables: QueryRows, error: Option<Box<str>>) {
        crate::stats::METRICS.record_message_kind("OneOffQueryResponse");
        let sender = self.one_off_queries.lock().unwrap().remove(message_id.as_ref());
        let Some(sender) = sender else {
            log::warn!("OneOffQueryResponse for an id we weren't tracking (reply arrived after teardown?)");
            return;
        };
        if let Some(error) = error {
            let _ = sender.send(Err(Error::SubscriptionError(error.to_string())));
            return;
        }
        let state = self.state.lock().unwrap();
        let mut out = HashMap::with_capacity(tables.tables.len());
        for table_update in &tables.tables {
            let Some(schema) = state.tables.get(&table_update.table_name).cloned() else {
                log::warn!("one-off query result referenced unknown table {:?}", table_update.table_name);
                continue;
            };
            match decode_table_update_rows(&schema, table_update) {
                Ok((inserts, _deletes)) => {
                    out.insert(schema.canonical_name.clone(), inserts);
                }
                Err(e) => log::error!("failed to decode one-off query rows for {:?}: {e}", table_update.table_name),
            }
        }
        drop(state);
        let _ = sender.send(Ok(out));
    }

    fn drain_reminders(&self, reminders: RowCallbackReminders) {
        let state = self.state.lock().unwrap();
        let snapshot = Arc::new(state.cache.clone());
        reminders.drain(|table, callback| match callback {
            RowCallback::Insert(row) => state.db_callbacks.invoke_on_insert(table, &row, &snapshot),
            RowCallback::Delete(row) => state.db_callbacks.invoke_on_delete(table, &row, &snapshot),
            RowCallback::Update(old, new) => state.db_callbacks.invoke_on_update(table, &old, &new, &snapshot),
        });
    }

    // ---- teardown ------------------------------------------------------

    /// Reject every in-flight reducer call and one-off query, end every
    /// subscription, and clear the cache. Shared by an explicit
    /// `disconnect()`, a fatal unattributed `SubscriptionError`, and the
    /// transport read loop ending on its own.
    fn teardown(&self, reason: &str, disconnect_payload: Option<String>, fire_connect_error: bool) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap();
            let subscriptions: Vec<_> = state.subscriptions.drain().map(|(_, handle)| handle).collect();
            let legacy = state.legacy_subscription.take();
            state.reducer_tracker.fail_all(reason);
            state.cache = ClientCache::new();
            drop(state);
            for handle in subscriptions.into_iter().chain(legacy) {
                handle.mark_error(reason.to_string());
            }
        }
        for (_, tx) in self.one_off_queries.lock().unwrap().drain() {
            let _ = tx.send(Err(Error::ConnectionError(reason.to_string())));
        }
        self.send_chan.close_channel();

        if was_connected {
            if let Some(cb) = self.on_disconnect.lock().unwrap().take() {
                cb(disconnect_payload);
            }
        } else if fire_connect_error {
            if let Some(cb) = self.on_connect_error.lock().unwrap().take() {
                cb(reason.to_string());
            }
        }
    }

    fn fail_connection(&self, reason: String) {
        self.teardown(&reason, Some(reason.clone()), true);
    }

    fn handle_transport_closed(&self) {
        self.teardown("the connection's transport closed", Some("the connection's transport closed".to_string()), true);
    }

    pub(crate) fn disconnect(&self) {
        self.teardown("disconnect() was called", None, false);
    }

    // ---- outbound calls -------------------------------------------------

    pub(crate) fn subscribe_single(&self, query: impl Into<String>) -> SubscriptionHandle {
        let request_id = self.request_ids.next();
        let query_id = self.query_ids.next();
        let handle = SubscriptionHandle::new(request_id);
        self.state.lock().unwrap().subscriptions.insert(query_id, handle.clone());
        self.send(ClientMessage::SubscribeSingle {
            request_id,
            query: query.into().into_boxed_str(),
            query_id,
        });
        handle
    }

    pub(crate) fn subscribe_all_tables(&self, queries: &[&str]) -> SubscriptionHandle {
        let request_id = self.request_ids.next();
        let handle = SubscriptionHandle::new(request_id);
        self.state.lock().unwrap().legacy_subscription = Some(handle.clone());
        self.send(ClientMessage::Subscribe {
            request_id,
            query_strings: queries.iter().map(|q| Box::from(*q)).collect(),
        });
        handle
    }

    pub(crate) fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let query_id = match handle.state() {
            SubscriptionState::Active { query_id } => query_id,
            other => {
                log::warn!("unsubscribe() called on a subscription that is not Active ({other:?})");
                return;
            }
        };
        let request_id = self.request_ids.next();
        self.send(ClientMessage::Unsubscribe { request_id, query_id });
    }

    pub(crate) fn call_reducer(
        &self,
        reducer_name: impl Into<String>,
        arg_bytes: Vec<u8>,
        flags: u8,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, ReducerCallError>> {
        let request_id = self.request_ids.next();
        let reducer_name = reducer_name.into();
        let (tx, rx) = oneshot::channel();
        let listener: ReducerResultListener = Box::new(move |result| {
            let _ = tx.send(result);
        });
        self.state.lock().unwrap().reducer_tracker.register(request_id, reducer_name.clone(), listener);
        self.send(ClientMessage::CallReducer {
            reducer_name: reducer_name.into_boxed_str(),
            arg_bytes: bytes::Bytes::from(arg_bytes),
            request_id,
            flags,
        });
        async move { rx.await.unwrap_or_else(|_| Err(ReducerCallError::Failed("connection torn down before a reply arrived".to_string()))) }
    }

    pub(crate) fn one_off_query(
        &self,
        query: impl Into<String>,
    ) -> impl std::future::Future<Output = Result<HashMap<String, Vec<ProductValue>>, Error>> {
        let mut message_id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut message_id);
        let message_id = message_id.to_vec();
        let (tx, rx) = oneshot::channel();
        self.one_off_queries.lock().unwrap().insert(message_id.clone(), tx);
        self.send(ClientMessage::OneOffQuery {
            message_id: message_id.into_boxed_slice(),
            query: query.into().into_boxed_str(),
        });
        async move { rx.await.unwrap_or_else(|_| Err(Error::ConnectionError("connection torn down before a reply arrived".to_string()))) }
    }

    // ---- accessors used by the public connection surface ---------------

    pub(crate) fn identity(&self) -> Option<Identity> {
        self.state.lock().unwrap().identity
    }

    pub(crate) fn token(&self) -> Option<String> {
        self.state.lock().unwrap().token.clone()
    }

    pub(crate) fn connection_id(&self) -> ConnectionId {
        self.state.lock().unwrap().connection_id
    }

    pub(crate) fn register_table(&self, schema: TableSchema) {
        self.state.lock().unwrap().tables.register(schema);
    }

    pub(crate) fn has_table(&self, name: &str) -> bool {
        self.state.lock().unwrap().tables.get(name).is_some()
    }

    pub(crate) fn table_count(&self, name: &str) -> usize {
        let state = self.state.lock().unwrap();
        let Some(schema) = state.tables.get(name) else { return 0 };
        state.cache.table(&schema.canonical_name).map(|t| t.count()).unwrap_or(0)
    }

    pub(crate) fn table_rows(&self, name: &str) -> Vec<ProductValue> {
        let state = self.state.lock().unwrap();
        let Some(schema) = state.tables.get(name) else { return Vec::new() };
        state.cache.table(&schema.canonical_name).map(|t| t.iter().cloned().collect()).unwrap_or_default()
    }

    pub(crate) fn find_by_unique(&self, name: &str, column: usize, key: &AlgebraicValue) -> Option<ProductValue> {
        let state = self.state.lock().unwrap();
        let schema = state.tables.get(name)?;
        state.cache.table(&schema.canonical_name)?.find_by_unique(column, key).cloned()
    }

    pub(crate) fn find_by_index(&self, name: &str, index_name: &str, key: &AlgebraicValue) -> Vec<ProductValue> {
        let state = self.state.lock().unwrap();
        let Some(schema) = state.tables.get(name) else { return Vec::new() };
        state
            .cache
            .table(&schema.canonical_name)
            .map(|t| t.find_by_index(index_name, key).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn on_insert(&self, table: &str, f: impl Fn(&ProductValue, &Arc<ClientCache>) + Send + Sync + 'static) -> CallbackId {
        self.state.lock().unwrap().db_callbacks.on_insert(table, f)
    }

    pub(crate) fn on_delete(&self, table: &str, f: impl Fn(&ProductValue, &Arc<ClientCache>) + Send + Sync + 'static) -> CallbackId {
        self.state.lock().unwrap().db_callbacks.on_delete(table, f)
    }

    pub(crate) fn on_update(
        &self,
        table: &str,
        f: impl Fn(&ProductValue, &ProductValue, &Arc<ClientCache>) + Send + Sync + 'static,
    ) -> CallbackId {
        self.state.lock().unwrap().db_callbacks.on_update(table, f)
    }

    pub(crate) fn remove_db_callback(&self, table: &str, id: CallbackId) {
        self.state.lock().unwrap().db_callbacks.remove(table, id);
    }

    pub(crate) fn on_reducer(&self, reducer_name: &str, f: impl Fn(&ReducerEvent, &Arc<ClientCache>) + Send + Sync + 'static) -> CallbackId {
        self.state.lock().unwrap().reducer_callbacks.on_reducer(reducer_name, f)
    }

    pub(crate) fn remove_reducer_callback(&self, reducer_name: &str, id: CallbackId) {
        self.state.lock().unwrap().reducer_callbacks.remove(reducer_name, id);
    }

    /// Register (or, if the connection already has an identity, fire
    /// immediately) a late `onConnect` listener. Used when a builder for an
    /// already-`retain`ed connection key adds its own callbacks after the
    /// underlying socket connected.
    pub(crate) fn add_on_connect(&self, cb: ConnectCallback) {
        let state = self.state.lock().unwrap();
        if let Some(identity) = state.identity {
            let token = state.token.clone().unwrap_or_default();
            let connection_id = state.connection_id;
            drop(state);
            cb(identity, &token, connection_id);
        } else {
            drop(state);
            *self.on_connect.lock().unwrap() = Some(cb);
        }
    }

    pub(crate) fn add_on_connect_error(&self, cb: ConnectErrorCallback) {
        if !self.connected.load(Ordering::SeqCst) {
            *self.on_connect_error.lock().unwrap() = Some(cb);
        }
    }

    pub(crate) fn add_on_disconnect(&self, cb: DisconnectCallback) {
        *self.on_disconnect.lock().unwrap() = Some(cb);
    }
}

/// Whether a `TableUpdate` replaces the table's whole tracked set (an
/// initial/legacy subscription snapshot) or applies as an insert/delete
/// delta against the existing refcounted multiset.
enum ApplyMode {
    Snapshot,
    Delta,
}

fn decode_row_list(row_type: &AlgebraicType, list: &RowList) -> Result<Vec<ProductValue>, DecodeError> {
    let decompressed = websocket::decompress(list.data.compression, &list.data.bytes).map_err(|e| DecodeError::Decompression(e.to_string()))?;
    let slices = RowList::split_rows(&decompressed, &list.size_hint)?;
    let mut rows = Vec::with_capacity(slices.len());
    for slice in slices {
        let mut buf = slice;
        match value::decode(row_type, &mut buf)? {
            AlgebraicValue::Product(row) => rows.push(row),
            other => unreachable!("a table row schema is always a Product type, got {other:?}"),
        }
    }
    Ok(rows)
}

fn decode_table_update_rows(schema: &TableSchema, update: &TableUpdate) -> Result<(Vec<ProductValue>, Vec<ProductValue>), DecodeError> {
    let row_type = AlgebraicType::Product(schema.row_type.clone());
    let inserts = decode_row_list(&row_type, &update.inserts)?;
    let deletes = decode_row_list(&row_type, &update.deletes)?;
    Ok((inserts, deletes))
}

fn apply_table_update(state: &mut ConnectionState, table_update: &TableUpdate, reminders: &mut RowCallbackReminders, mode: ApplyMode) {
    let Some(schema) = state.tables.get(&table_update.table_name).cloned() else {
        log::warn!("server referenced unknown table {:?}; dropping delta", table_update.table_name);
        return;
    };
    let (inserts, deletes) = match decode_table_update_rows(&schema, table_update) {
        Ok(rows) => rows,
        Err(e) => {
            log::error!("failed to decode table update for {:?}: {e}", table_update.table_name);
            return;
        }
    };
    let table_reminders = reminders.reminders_for(&schema.canonical_name);
    match mode {
        ApplyMode::Snapshot => {
            if !deletes.is_empty() {
                log::warn!(
                    "initial subscription snapshot for {:?} unexpectedly carried {} delete(s); tolerating",
                    schema.canonical_name,
                    deletes.len()
                );
            }
            state.cache.table_mut(&schema.canonical_name).reinitialize(&schema, inserts, table_reminders);
        }
        ApplyMode::Delta => {
            state.cache.table_mut(&schema.canonical_name).apply_operations(&schema, inserts, deletes, table_reminders);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsatn::ProductType;
    use crate::message::{CompressableBytes, Compression, RowSizeHint};
    use crate::table::TableSchema;

    fn report_schema() -> TableSchema {
        let row_type = ProductType::from(vec![("id", AlgebraicType::U64), ("body", AlgebraicType::String)]);
        TableSchema::new("report", "reports", row_type).with_primary_key(0)
    }

    fn row_list_of(schema: &TableSchema, rows: &[ProductValue]) -> RowList {
        let row_type = AlgebraicType::Product(schema.row_type.clone());
        let mut bytes = Vec::new();
        let mut offsets = vec![0u64];
        let mut acc = 0u64;
        for row in rows {
            let before = bytes.len();
            value::encode(&row_type, &AlgebraicValue::Product(row.clone()), &mut bytes);
            acc += (bytes.len() - before) as u64;
            offsets.push(acc);
        }
        RowList {
            size_hint: RowSizeHint::RowOffsets(offsets),
            data: CompressableBytes {
                compression: Compression::None,
                bytes: bytes.into(),
            },
        }
    }

    fn row(id: u64, body: &str) -> ProductValue {
        ProductValue {
            elements: vec![AlgebraicValue::U64(id), AlgebraicValue::String(body.to_string())],
        }
    }

    fn fresh_state(schema: &TableSchema) -> ConnectionState {
        let mut registry = TableRegistry::new();
        registry.register(schema.clone());
        ConnectionState {
            tables: registry,
            cache: ClientCache::new(),
            db_callbacks: DbCallbacks::new(),
            reducer_callbacks: ReducerCallbacks::new(),
            reducer_tracker: ReducerCallTracker::new(),
            subscriptions: HashMap::new(),
            legacy_subscription: None,
            identity: None,
            token: None,
            connection_id: ConnectionId([0; 16]),
        }
    }

    #[test]
    fn delta_insert_applies_to_cache_and_reminds() {
        let schema = report_schema();
        let mut state = fresh_state(&schema);
        let update = TableUpdate {
            table_name: "report".into(),
            inserts: row_list_of(&schema, &[row(1, "hello")]),
            deletes: row_list_of(&schema, &[]),
        };
        let mut reminders = RowCallbackReminders::new();
        apply_table_update(&mut state, &update, &mut reminders, ApplyMode::Delta);
        assert_eq!(state.cache.table("report").unwrap().count(), 1);
        let mut seen = Vec::new();
        reminders.drain(|table, cb| seen.push((table.to_string(), matches!(cb, RowCallback::Insert(_)))));
        assert_eq!(seen, vec![("report".to_string(), true)]);
    }

    #[test]
    fn snapshot_mode_tolerates_and_logs_unexpected_deletes() {
        let schema = report_schema();
        let mut state = fresh_state(&schema);
        let update = TableUpdate {
            table_name: "report".into(),
            inserts: row_list_of(&schema, &[row(1, "a")]),
            deletes: row_list_of(&schema, &[row(9, "ghost")]),
        };
        let mut reminders = RowCallbackReminders::new();
        apply_table_update(&mut state, &update, &mut reminders, ApplyMode::Snapshot);
        // The snapshot still wins: row 1 present, the spurious delete is ignored.
        assert_eq!(state.cache.table("report").unwrap().count(), 1);
    }

    #[test]
    fn unknown_table_update_is_dropped_not_panicking() {
        let schema = report_schema();
        let mut state = fresh_state(&schema);
        let update = TableUpdate {
            table_name: "nonexistent".into(),
            inserts: row_list_of(&schema, &[row(1, "a")]),
            deletes: row_list_of(&schema, &[]),
        };
        let mut reminders = RowCallbackReminders::new();
        apply_table_update(&mut state, &update, &mut reminders, ApplyMode::Delta);
        assert!(state.cache.table("nonexistent").is_none());
    }

    #[test]
    fn reducer_tracker_fail_all_rejects_every_pending_call() {
        let mut tracker = ReducerCallTracker::new();
        let (tx1, rx1) = std::sync::mpsc::channel();
        let (tx2, rx2) = std::sync::mpsc::channel();
        tracker.register(1, "a".to_string(), Box::new(move |r| tx1.send(r).unwrap()));
        tracker.register(2, "b".to_string(), Box::new(move |r| tx2.send(r).unwrap()));
        tracker.fail_all("connection closed");
        assert!(rx1.recv().unwrap().is_err());
        assert!(rx2.recv().unwrap().is_err());
    }

    #[test]
    fn row_list_round_trips_through_decode_helper() {
        let schema = report_schema();
        let list = row_list_of(&schema, &[row(1, "a"), row(2, "b")]);
        let row_type = AlgebraicType::Product(schema.row_type.clone());
        let decoded = decode_row_list(&row_type, &list).unwrap();
        assert_eq!(decoded, vec![row(1, "a"), row(2, "b")]);
    }
}
