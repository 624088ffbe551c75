//! Client-side SDK core: the message-pipeline engine that sits behind a
//! generated module's typed bindings.
//!
//! This crate implements, independent of any one SpacetimeDB module's
//! generated code:
//!
//! - [`bsatn`] — the binary, self-describing-by-schema value codec.
//! - [`message`] — the fixed wire message types built on top of it.
//! - [`client_cache`] — the refcounted multiset table cache.
//! - [`subscription`] and [`reducer`] — the per-query and per-call state
//!   machines.
//! - [`background_connection`] — the dispatcher that ties the above
//!   together behind one logical connection.
//! - [`connection_manager`] and [`connection`] — the refcounted,
//!   remount-surviving public connection surface applications build
//!   against.
//!
//! Per-module typed table/reducer bindings, the SQL query-builder DSL, and
//! the code generator that produces those bindings are out of scope: this
//! crate only implements the wire protocol and the generic engine that
//! drives it.

pub mod background_connection;
pub mod bsatn;
pub mod callbacks;
pub mod client_cache;
pub mod connection;
pub mod connection_manager;
pub mod error;
pub mod identity;
pub mod message;
pub mod reducer;
pub mod stats;
pub mod subscription;
pub mod table;
pub mod websocket;

pub use connection::{Connection, DbConnectionBuilder, ReducerHandle, SubscriptionBuilder, TableHandle};
pub use error::{DecodeError, Error};
pub use identity::{ConnectionId, Identity, Timestamp};
pub use reducer::ReducerCallError;
pub use subscription::SubscriptionHandle;
pub use websocket::CompressionPreference;
