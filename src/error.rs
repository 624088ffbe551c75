//! The error taxonomy for the SDK core.
//!
//! Each variant corresponds to one row of the error-kind table: errors
//! attributable to a single subscription or reducer call never tear down
//! the connection; errors on the shared transport do.

/// A single BSATN decode failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated input: expected at least {expected} more byte(s), got {actual}")]
    TruncatedInput { expected: usize, actual: usize },

    #[error("unknown sum-type variant tag {tag} (type has {variant_count} variant(s))")]
    UnknownVariantTag { tag: u8, variant_count: usize },

    #[error("invalid UTF-8 in string payload")]
    InvalidUtf8,

    #[error("length prefix {0} overflows usize/available input")]
    LengthOverflow(u32),

    #[error("decompression failed: {0}")]
    Decompression(String),
}

/// The error taxonomy exposed to applications.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A reducer call returned a user-level error (`ReducerOutcome::Err`).
    /// Propagation: rejects the caller's future only.
    #[error("reducer returned an error: {0}")]
    SenderError(String),

    /// A reducer call failed unrecoverably inside the host.
    /// Propagation: rejects the caller's future only.
    #[error("reducer failed internally: {0}")]
    InternalError(String),

    /// The transport failed before or after the handshake.
    /// Propagation: `onConnectError` / `onDisconnect`; rejects all in-flight calls.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// The server reported that a query failed.
    /// Propagation: `onError` on the specific subscription handle, or
    /// disconnects the whole connection if unattributed (no request id).
    #[error("subscription error: {0}")]
    SubscriptionError(String),

    /// A frame failed to decode. The frame is dropped; the connection continues.
    #[error("codec error: {0}")]
    CodecError(#[from] DecodeError),

    /// The server referenced a table name with no matching local handle.
    /// The delta is dropped; the connection continues.
    #[error("unknown table: {0}")]
    UnknownTable(String),
}
