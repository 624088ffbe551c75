//! The distinguished newtype wrappers spec.md §3 calls out: `Identity`,
//! `ConnectionId`, `Uuid`, `Timestamp`, `TimeDuration`, `ScheduleAt`.
//!
//! Each is, per the data model, a `Product` of a single byte-array element
//! with a conventional inner field name; on the wire they encode and decode
//! exactly like that product. In Rust they're given real behavior (parsing,
//! display, arithmetic) rather than being left as raw byte arrays.

use crate::bsatn::{Decode, Encode};
use crate::error::DecodeError;
use std::fmt;
use std::time::{Duration, SystemTime};

/// The authenticated principal associated with a connection; 256-bit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(pub [u8; 32]);

impl Identity {
    /// Parse either conventional textual form: 64 lowercase hex digits, or
    /// the same prefixed with `0x`. Both parse to the same value.
    pub fn from_hex(s: &str) -> Result<Self, IdentityParseError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != 64 {
            return Err(IdentityParseError::WrongLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let byte_str = std::str::from_utf8(chunk).map_err(|_| IdentityParseError::NotHex)?;
            bytes[i] = u8::from_str_radix(byte_str, 16).map_err(|_| IdentityParseError::NotHex)?;
        }
        Ok(Identity(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityParseError {
    #[error("expected 64 hex digits, got {0}")]
    WrongLength(usize),
    #[error("identity string contains non-hex characters")]
    NotHex,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.to_hex())
    }
}
impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Encode for Identity {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.0.as_slice().bsatn_encode(out);
    }
}
impl Decode for Identity {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let bytes: Vec<u8> = Vec::bsatn_decode(buf)?;
        bytes
            .try_into()
            .map(Identity)
            .map_err(|v: Vec<u8>| DecodeError::TruncatedInput {
                expected: 32,
                actual: v.len(),
            })
    }
}

/// A per-connection identifier the server uses to attribute transactions
/// back to their caller; 128-bit random value, hex-formatted in URLs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub [u8; 16]);

impl ConnectionId {
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        ConnectionId(bytes)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.to_hex())
    }
}
impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Encode for ConnectionId {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.0.as_slice().bsatn_encode(out);
    }
}
impl Decode for ConnectionId {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let bytes: Vec<u8> = Vec::bsatn_decode(buf)?;
        bytes
            .try_into()
            .map(ConnectionId)
            .map_err(|v: Vec<u8>| DecodeError::TruncatedInput {
                expected: 16,
                actual: v.len(),
            })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uuid(pub [u8; 16]);

impl Encode for Uuid {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.0.as_slice().bsatn_encode(out);
    }
}
impl Decode for Uuid {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let bytes: Vec<u8> = Vec::bsatn_decode(buf)?;
        bytes
            .try_into()
            .map(Uuid)
            .map_err(|v: Vec<u8>| DecodeError::TruncatedInput {
                expected: 16,
                actual: v.len(),
            })
    }
}

/// Microseconds since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Timestamp {
    pub microseconds: i64,
}

impl Timestamp {
    pub fn from_micros_since_epoch(microseconds: i64) -> Self {
        Timestamp { microseconds }
    }

    pub fn now() -> Self {
        let dur = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("system clock is before the Unix epoch");
        Timestamp {
            microseconds: dur.as_micros() as i64,
        }
    }

    pub fn to_systemtime(self) -> SystemTime {
        if self.microseconds >= 0 {
            SystemTime::UNIX_EPOCH + Duration::from_micros(self.microseconds as u64)
        } else {
            SystemTime::UNIX_EPOCH - Duration::from_micros((-self.microseconds) as u64)
        }
    }
}

impl Encode for Timestamp {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.microseconds.bsatn_encode(out);
    }
}
impl Decode for Timestamp {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Timestamp {
            microseconds: i64::bsatn_decode(buf)?,
        })
    }
}

/// A signed duration in microseconds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct TimeDuration {
    pub microseconds: i64,
}

impl TimeDuration {
    pub fn from_micros(microseconds: i64) -> Self {
        TimeDuration { microseconds }
    }
}

impl Encode for TimeDuration {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.microseconds.bsatn_encode(out);
    }
}
impl Decode for TimeDuration {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(TimeDuration {
            microseconds: i64::bsatn_decode(buf)?,
        })
    }
}

/// When a scheduled reducer call should run: either at a fixed point in
/// time, or on a repeating interval starting now.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScheduleAt {
    Time(Timestamp),
    Interval(TimeDuration),
}

impl Encode for ScheduleAt {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        match self {
            ScheduleAt::Time(t) => {
                0u8.bsatn_encode(out);
                t.bsatn_encode(out);
            }
            ScheduleAt::Interval(d) => {
                1u8.bsatn_encode(out);
                d.bsatn_encode(out);
            }
        }
    }
}
impl Decode for ScheduleAt {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::bsatn_decode(buf)? {
            0 => Ok(ScheduleAt::Time(Timestamp::bsatn_decode(buf)?)),
            1 => Ok(ScheduleAt::Interval(TimeDuration::bsatn_decode(buf)?)),
            tag => Err(DecodeError::UnknownVariantTag { tag, variant_count: 2 }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hex_forms_parse_to_same_value() {
        let lower = "a".repeat(64);
        let prefixed = format!("0x{}", "a".repeat(64));
        assert_eq!(Identity::from_hex(&lower).unwrap(), Identity::from_hex(&prefixed).unwrap());
    }

    #[test]
    fn identity_round_trips_through_bsatn() {
        let id = Identity::from_hex(&"ab".repeat(32)).unwrap();
        let bytes = crate::bsatn::to_vec(&id);
        assert_eq!(crate::bsatn::from_slice::<Identity>(&bytes).unwrap(), id);
    }

    #[test]
    fn identity_rejects_wrong_length() {
        assert_eq!(Identity::from_hex("abcd"), Err(IdentityParseError::WrongLength(4)));
    }
}
