//! The fixed, statically-known wire message types: frame compression, the
//! `ClientMessage`/`ServerMessage` sums, and their payloads (spec.md §4.2).
//!
//! These have hand-written [`Encode`]/[`Decode`] impls rather than derived
//! ones (the derive macro that does this in the original is an out-of-scope
//! code-generation collaborator, per spec.md §1) and never consult an
//! `AlgebraicType` — their shape is fixed at compile time. Row *payloads*
//! nested inside them stay as raw bytes here; decoding those against a
//! table's schema happens one layer up, in the dispatcher.

use crate::bsatn::{Decode, Encode};
use crate::error::DecodeError;
use crate::identity::{ConnectionId, Identity, Timestamp};
use bytes::Bytes;

/// The 1-byte discriminant every inbound frame and every embedded
/// compressed payload begins with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None = 0,
    Brotli = 1,
    Gzip = 2,
}

impl Encode for Compression {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        (*self as u8).bsatn_encode(out);
    }
}

impl Decode for Compression {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::bsatn_decode(buf)? {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Brotli),
            2 => Ok(Compression::Gzip),
            tag => Err(DecodeError::UnknownVariantTag { tag, variant_count: 3 }),
        }
    }
}

/// A compression tag paired with the (possibly compressed) bytes it describes.
/// Used both for the outermost frame and for each per-table row blob, which
/// "repeats the same compression discriminant" per spec.md §4.2.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressableBytes {
    pub compression: Compression,
    pub bytes: Bytes,
}

impl Encode for CompressableBytes {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.compression.bsatn_encode(out);
        self.bytes.bsatn_encode(out);
    }
}

impl Decode for CompressableBytes {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let compression = Compression::bsatn_decode(buf)?;
        let bytes = Bytes::bsatn_decode(buf)?;
        Ok(CompressableBytes { compression, bytes })
    }
}

/// A RowList's size hint: either every row is exactly `n` bytes, or a
/// prefix-sum list of offsets into the blob delimits each row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RowSizeHint {
    FixedSize(u64),
    RowOffsets(Vec<u64>),
}

impl Encode for RowSizeHint {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        match self {
            RowSizeHint::FixedSize(n) => {
                0u8.bsatn_encode(out);
                n.bsatn_encode(out);
            }
            RowSizeHint::RowOffsets(offsets) => {
                1u8.bsatn_encode(out);
                offsets.bsatn_encode(out);
            }
        }
    }
}

impl Decode for RowSizeHint {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::bsatn_decode(buf)? {
            0 => Ok(RowSizeHint::FixedSize(u64::bsatn_decode(buf)?)),
            1 => Ok(RowSizeHint::RowOffsets(Vec::<u64>::bsatn_decode(buf)?)),
            tag => Err(DecodeError::UnknownVariantTag { tag, variant_count: 2 }),
        }
    }
}

/// A set of rows as delivered on the wire: a size hint plus the (possibly
/// compressed) concatenated row bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowList {
    pub size_hint: RowSizeHint,
    pub data: CompressableBytes,
}

impl Encode for RowList {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.size_hint.bsatn_encode(out);
        self.data.bsatn_encode(out);
    }
}

impl Decode for RowList {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let size_hint = RowSizeHint::bsatn_decode(buf)?;
        let data = CompressableBytes::bsatn_decode(buf)?;
        Ok(RowList { size_hint, data })
    }
}

impl RowList {
    /// Split decompressed row bytes into per-row slices, honoring either
    /// size-hint form (spec.md §4.2: "the decoder MUST honor both").
    pub fn split_rows(decompressed: &[u8], hint: &RowSizeHint) -> Result<Vec<&[u8]>, DecodeError> {
        match hint {
            RowSizeHint::FixedSize(n) => {
                let n = *n as usize;
                if n == 0 {
                    return Ok(Vec::new());
                }
                if decompressed.len() % n != 0 {
                    return Err(DecodeError::TruncatedInput {
                        expected: n,
                        actual: decompressed.len() % n,
                    });
                }
                Ok(decompressed.chunks(n).collect())
            }
            RowSizeHint::RowOffsets(offsets) => {
                let mut rows = Vec::with_capacity(offsets.len().saturating_sub(1));
                for w in offsets.windows(2) {
                    let (start, end) = (w[0] as usize, w[1] as usize);
                    if end > decompressed.len() || start > end {
                        return Err(DecodeError::TruncatedInput {
                            expected: end,
                            actual: decompressed.len(),
                        });
                    }
                    rows.push(&decompressed[start..end]);
                }
                Ok(rows)
            }
        }
    }
}

/// Per-table insert/delete row deltas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableUpdate {
    pub table_name: Box<str>,
    pub inserts: RowList,
    pub deletes: RowList,
}

impl Encode for TableUpdate {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.table_name.bsatn_encode(out);
        self.inserts.bsatn_encode(out);
        self.deletes.bsatn_encode(out);
    }
}

impl Decode for TableUpdate {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(TableUpdate {
            table_name: Box::<str>::bsatn_decode(buf)?,
            inserts: RowList::bsatn_decode(buf)?,
            deletes: RowList::bsatn_decode(buf)?,
        })
    }
}

/// A set of table deltas delivered together, e.g. all tables touched by one
/// query in one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct QuerySetUpdate {
    pub tables: Vec<TableUpdate>,
}

impl Encode for QuerySetUpdate {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.tables.bsatn_encode(out);
    }
}

impl Decode for QuerySetUpdate {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(QuerySetUpdate {
            tables: Vec::<TableUpdate>::bsatn_decode(buf)?,
        })
    }
}

/// Why a reducer-triggered transaction did or didn't commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateStatus {
    Committed,
    Failed(Box<str>),
    OutOfEnergy,
}

impl Encode for UpdateStatus {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        match self {
            UpdateStatus::Committed => 0u8.bsatn_encode(out),
            UpdateStatus::Failed(reason) => {
                1u8.bsatn_encode(out);
                reason.bsatn_encode(out);
            }
            UpdateStatus::OutOfEnergy => 2u8.bsatn_encode(out),
        }
    }
}

impl Decode for UpdateStatus {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::bsatn_decode(buf)? {
            0 => Ok(UpdateStatus::Committed),
            1 => Ok(UpdateStatus::Failed(Box::<str>::bsatn_decode(buf)?)),
            2 => Ok(UpdateStatus::OutOfEnergy),
            tag => Err(DecodeError::UnknownVariantTag { tag, variant_count: 3 }),
        }
    }
}

/// Identifies the reducer call that produced a `TransactionUpdate`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReducerCallInfo {
    pub reducer_name: Box<str>,
    pub args: Bytes,
    pub request_id: u32,
}

impl Encode for ReducerCallInfo {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.reducer_name.bsatn_encode(out);
        self.args.bsatn_encode(out);
        self.request_id.bsatn_encode(out);
    }
}

impl Decode for ReducerCallInfo {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(ReducerCallInfo {
            reducer_name: Box::<str>::bsatn_decode(buf)?,
            args: Bytes::bsatn_decode(buf)?,
            request_id: u32::bsatn_decode(buf)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionUpdate {
    pub status: UpdateStatus,
    pub timestamp: Timestamp,
    pub caller_identity: Identity,
    pub caller_connection_id: ConnectionId,
    pub reducer_call: ReducerCallInfo,
    pub energy_quanta_used: u64,
    pub host_duration_micros: u64,
    pub query_sets: Vec<QuerySetUpdate>,
}

impl Encode for TransactionUpdate {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.status.bsatn_encode(out);
        self.timestamp.bsatn_encode(out);
        self.caller_identity.bsatn_encode(out);
        self.caller_connection_id.bsatn_encode(out);
        self.reducer_call.bsatn_encode(out);
        self.energy_quanta_used.bsatn_encode(out);
        self.host_duration_micros.bsatn_encode(out);
        self.query_sets.bsatn_encode(out);
    }
}

impl Decode for TransactionUpdate {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(TransactionUpdate {
            status: UpdateStatus::bsatn_decode(buf)?,
            timestamp: Timestamp::bsatn_decode(buf)?,
            caller_identity: Identity::bsatn_decode(buf)?,
            caller_connection_id: ConnectionId::bsatn_decode(buf)?,
            reducer_call: ReducerCallInfo::bsatn_decode(buf)?,
            energy_quanta_used: u64::bsatn_decode(buf)?,
            host_duration_micros: u64::bsatn_decode(buf)?,
            query_sets: Vec::<QuerySetUpdate>::bsatn_decode(buf)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionUpdateLight {
    pub query_sets: Vec<QuerySetUpdate>,
}

impl Encode for TransactionUpdateLight {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.query_sets.bsatn_encode(out);
    }
}

impl Decode for TransactionUpdateLight {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(TransactionUpdateLight {
            query_sets: Vec::<QuerySetUpdate>::bsatn_decode(buf)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReducerOutcome {
    Ok { ret_value: Bytes, transaction_update: TransactionUpdate },
    Err(Bytes),
    InternalError(Box<str>),
}

impl Encode for ReducerOutcome {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        match self {
            ReducerOutcome::Ok {
                ret_value,
                transaction_update,
            } => {
                0u8.bsatn_encode(out);
                ret_value.bsatn_encode(out);
                transaction_update.bsatn_encode(out);
            }
            ReducerOutcome::Err(payload) => {
                1u8.bsatn_encode(out);
                payload.bsatn_encode(out);
            }
            ReducerOutcome::InternalError(msg) => {
                2u8.bsatn_encode(out);
                msg.bsatn_encode(out);
            }
        }
    }
}

impl Decode for ReducerOutcome {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::bsatn_decode(buf)? {
            0 => Ok(ReducerOutcome::Ok {
                ret_value: Bytes::bsatn_decode(buf)?,
                transaction_update: TransactionUpdate::bsatn_decode(buf)?,
            }),
            1 => Ok(ReducerOutcome::Err(Bytes::bsatn_decode(buf)?)),
            2 => Ok(ReducerOutcome::InternalError(Box::<str>::bsatn_decode(buf)?)),
            tag => Err(DecodeError::UnknownVariantTag { tag, variant_count: 3 }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryRows {
    pub tables: Vec<TableUpdate>,
}

impl Encode for QueryRows {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.tables.bsatn_encode(out);
    }
}

impl Decode for QueryRows {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(QueryRows {
            tables: Vec::<TableUpdate>::bsatn_decode(buf)?,
        })
    }
}

/// Everything the core must handle from the server (spec.md §4.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerMessage {
    InitialConnection {
        identity: Identity,
        token: Box<str>,
        connection_id: ConnectionId,
    },
    /// Legacy whole-connection subscription snapshot, for `subscribeToAllTables()`.
    InitialSubscription {
        query_sets: Vec<QuerySetUpdate>,
        request_id: u32,
    },
    SubscribeApplied {
        query_id: u64,
        request_id: u32,
        rows: QueryRows,
    },
    UnsubscribeApplied {
        query_id: u64,
        request_id: u32,
        rows: QueryRows,
    },
    SubscriptionError {
        query_id: Option<u64>,
        request_id: Option<u32>,
        error: Box<str>,
    },
    TransactionUpdate(TransactionUpdate),
    TransactionUpdateLight(TransactionUpdateLight),
    ReducerResult {
        request_id: u32,
        timestamp: Timestamp,
        result: ReducerOutcome,
    },
    OneOffQueryResponse {
        message_id: Box<[u8]>,
        tables: QueryRows,
        error: Option<Box<str>>,
    },
}

impl Encode for ServerMessage {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        match self {
            ServerMessage::InitialConnection {
                identity,
                token,
                connection_id,
            } => {
                0u8.bsatn_encode(out);
                identity.bsatn_encode(out);
                token.bsatn_encode(out);
                connection_id.bsatn_encode(out);
            }
            ServerMessage::InitialSubscription { query_sets, request_id } => {
                1u8.bsatn_encode(out);
                query_sets.bsatn_encode(out);
                request_id.bsatn_encode(out);
            }
            ServerMessage::SubscribeApplied {
                query_id,
                request_id,
                rows,
            } => {
                2u8.bsatn_encode(out);
                query_id.bsatn_encode(out);
                request_id.bsatn_encode(out);
                rows.bsatn_encode(out);
            }
            ServerMessage::UnsubscribeApplied {
                query_id,
                request_id,
                rows,
            } => {
                3u8.bsatn_encode(out);
                query_id.bsatn_encode(out);
                request_id.bsatn_encode(out);
                rows.bsatn_encode(out);
            }
            ServerMessage::SubscriptionError {
                query_id,
                request_id,
                error,
            } => {
                4u8.bsatn_encode(out);
                query_id.bsatn_encode(out);
                request_id.bsatn_encode(out);
                error.bsatn_encode(out);
            }
            ServerMessage::TransactionUpdate(update) => {
                5u8.bsatn_encode(out);
                update.bsatn_encode(out);
            }
            ServerMessage::TransactionUpdateLight(update) => {
                6u8.bsatn_encode(out);
                update.bsatn_encode(out);
            }
            ServerMessage::ReducerResult {
                request_id,
                timestamp,
                result,
            } => {
                7u8.bsatn_encode(out);
                request_id.bsatn_encode(out);
                timestamp.bsatn_encode(out);
                result.bsatn_encode(out);
            }
            ServerMessage::OneOffQueryResponse {
                message_id,
                tables,
                error,
            } => {
                8u8.bsatn_encode(out);
                message_id.bsatn_encode(out);
                tables.bsatn_encode(out);
                error.bsatn_encode(out);
            }
        }
    }
}

impl Decode for ServerMessage {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(match u8::bsatn_decode(buf)? {
            0 => ServerMessage::InitialConnection {
                identity: Identity::bsatn_decode(buf)?,
                token: Box::<str>::bsatn_decode(buf)?,
                connection_id: ConnectionId::bsatn_decode(buf)?,
            },
            1 => ServerMessage::InitialSubscription {
                query_sets: Vec::<QuerySetUpdate>::bsatn_decode(buf)?,
                request_id: u32::bsatn_decode(buf)?,
            },
            2 => ServerMessage::SubscribeApplied {
                query_id: u64::bsatn_decode(buf)?,
                request_id: u32::bsatn_decode(buf)?,
                rows: QueryRows::bsatn_decode(buf)?,
            },
            3 => ServerMessage::UnsubscribeApplied {
                query_id: u64::bsatn_decode(buf)?,
                request_id: u32::bsatn_decode(buf)?,
                rows: QueryRows::bsatn_decode(buf)?,
            },
            4 => ServerMessage::SubscriptionError {
                query_id: Option::<u64>::bsatn_decode(buf)?,
                request_id: Option::<u32>::bsatn_decode(buf)?,
                error: Box::<str>::bsatn_decode(buf)?,
            },
            5 => ServerMessage::TransactionUpdate(TransactionUpdate::bsatn_decode(buf)?),
            6 => ServerMessage::TransactionUpdateLight(TransactionUpdateLight::bsatn_decode(buf)?),
            7 => ServerMessage::ReducerResult {
                request_id: u32::bsatn_decode(buf)?,
                timestamp: Timestamp::bsatn_decode(buf)?,
                result: ReducerOutcome::bsatn_decode(buf)?,
            },
            8 => ServerMessage::OneOffQueryResponse {
                message_id: Box::<[u8]>::bsatn_decode(buf)?,
                tables: QueryRows::bsatn_decode(buf)?,
                error: Option::<Box<str>>::bsatn_decode(buf)?,
            },
            tag => return Err(DecodeError::UnknownVariantTag { tag, variant_count: 9 }),
        })
    }
}

/// Everything the core sends to the server (spec.md §4.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    /// Legacy whole-connection subscription, for `subscribeToAllTables()`.
    Subscribe {
        request_id: u32,
        query_strings: Vec<Box<str>>,
    },
    SubscribeSingle {
        request_id: u32,
        query: Box<str>,
        query_id: u64,
    },
    Unsubscribe { request_id: u32, query_id: u64 },
    CallReducer {
        reducer_name: Box<str>,
        arg_bytes: Bytes,
        request_id: u32,
        flags: u8,
    },
    OneOffQuery { message_id: Box<[u8]>, query: Box<str> },
}

impl Encode for ClientMessage {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        match self {
            ClientMessage::Subscribe { request_id, query_strings } => {
                0u8.bsatn_encode(out);
                request_id.bsatn_encode(out);
                query_strings.bsatn_encode(out);
            }
            ClientMessage::SubscribeSingle {
                request_id,
                query,
                query_id,
            } => {
                1u8.bsatn_encode(out);
                request_id.bsatn_encode(out);
                query.bsatn_encode(out);
                query_id.bsatn_encode(out);
            }
            ClientMessage::Unsubscribe { request_id, query_id } => {
                2u8.bsatn_encode(out);
                request_id.bsatn_encode(out);
                query_id.bsatn_encode(out);
            }
            ClientMessage::CallReducer {
                reducer_name,
                arg_bytes,
                request_id,
                flags,
            } => {
                3u8.bsatn_encode(out);
                reducer_name.bsatn_encode(out);
                arg_bytes.bsatn_encode(out);
                request_id.bsatn_encode(out);
                flags.bsatn_encode(out);
            }
            ClientMessage::OneOffQuery { message_id, query } => {
                4u8.bsatn_encode(out);
                message_id.bsatn_encode(out);
                query.bsatn_encode(out);
            }
        }
    }
}

impl Decode for ClientMessage {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(match u8::bsatn_decode(buf)? {
            0 => ClientMessage::Subscribe {
                request_id: u32::bsatn_decode(buf)?,
                query_strings: Vec::<Box<str>>::bsatn_decode(buf)?,
            },
            1 => ClientMessage::SubscribeSingle {
                request_id: u32::bsatn_decode(buf)?,
                query: Box::<str>::bsatn_decode(buf)?,
                query_id: u64::bsatn_decode(buf)?,
            },
            2 => ClientMessage::Unsubscribe {
                request_id: u32::bsatn_decode(buf)?,
                query_id: u64::bsatn_decode(buf)?,
            },
            3 => ClientMessage::CallReducer {
                reducer_name: Box::<str>::bsatn_decode(buf)?,
                arg_bytes: Bytes::bsatn_decode(buf)?,
                request_id: u32::bsatn_decode(buf)?,
                flags: u8::bsatn_decode(buf)?,
            },
            4 => ClientMessage::OneOffQuery {
                message_id: Box::<[u8]>::bsatn_decode(buf)?,
                query: Box::<str>::bsatn_decode(buf)?,
            },
            tag => return Err(DecodeError::UnknownVariantTag { tag, variant_count: 5 }),
        })
    }
}

/// Decode a whole inbound frame: a leading compression byte followed by a
/// `ServerMessage`. The frame-level compressor wraps everything after the
/// first byte; callers must decompress before calling this.
pub fn decode_frame_payload(compression: Compression, payload: &[u8]) -> Result<ServerMessage, DecodeError> {
    let _ = compression; // decompression already happened by the time we get here.
    let mut buf = payload;
    ServerMessage::bsatn_decode(&mut buf)
}

pub(crate) fn peek_compression(frame: &[u8]) -> Result<(Compression, &[u8]), DecodeError> {
    let mut buf = frame;
    let compression = Compression::bsatn_decode(&mut buf)?;
    Ok((compression, buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsatn::{from_slice, to_vec};

    #[test]
    fn client_message_call_reducer_round_trips() {
        let msg = ClientMessage::CallReducer {
            reducer_name: "say_hello".into(),
            arg_bytes: Bytes::from_static(b"\x00"),
            request_id: 7,
            flags: 0,
        };
        let bytes = to_vec(&msg);
        assert_eq!(from_slice::<ClientMessage>(&bytes).unwrap(), msg);
    }

    #[test]
    fn server_message_subscribe_applied_round_trips() {
        let msg = ServerMessage::SubscribeApplied {
            query_id: 42,
            request_id: 1,
            rows: QueryRows { tables: vec![] },
        };
        let bytes = to_vec(&msg);
        assert_eq!(from_slice::<ServerMessage>(&bytes).unwrap(), msg);
    }

    #[test]
    fn row_list_fixed_size_splits_rows() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let rows = RowList::split_rows(&data, &RowSizeHint::FixedSize(2)).unwrap();
        assert_eq!(rows, vec![&[1u8, 2][..], &[3, 4][..], &[5, 6][..]]);
    }

    #[test]
    fn row_list_offsets_splits_rows() {
        let data = [10u8, 20, 30, 40, 50];
        let rows = RowList::split_rows(&data, &RowSizeHint::RowOffsets(vec![0, 2, 5])).unwrap();
        assert_eq!(rows, vec![&[10u8, 20][..], &[30, 40, 50][..]]);
    }
}
