//! The binary, self-describing-by-schema codec (BSATN).
//!
//! Two codec paths share this module:
//!
//! - A handful of hand-written [`Encode`]/[`Decode`] impls for the
//!   statically-known wire message types (`ClientMessage`, `ServerMessage`,
//!   and friends) and for the Rust-native newtypes (`Identity`,
//!   `ConnectionId`, ...). These know their own shape at compile time and
//!   never consult an [`AlgebraicType`].
//! - The schema-driven [`AlgebraicValue`] codec in [`value`], used for row
//!   data whose shape is only known via a table's [`AlgebraicType`] schema
//!   fetched at connection time.
//!
//! Byte order is little-endian throughout. The codec is total: given a type
//! and enough bytes, it decodes exactly one value and returns the unused
//! tail; short input is a hard failure, never a panic.

pub mod value;

pub use crate::error::DecodeError;
pub use value::{AlgebraicType, AlgebraicValue, ArrayValue, ProductType, ProductValue, SumType, SumValue, F32, F64};

/// A type that knows how to append its own BSATN encoding to a byte buffer.
///
/// Implementors must write exactly the bytes specified by the wire format
/// for their type; there is no framing or length prefix beyond what the
/// format itself calls for (e.g. `String` writes its own `u32` length).
pub trait Encode {
    fn bsatn_encode(&self, out: &mut Vec<u8>);
}

/// A type that knows how to parse itself from the front of a byte slice,
/// leaving any trailing bytes in `buf` for the next field.
pub trait Decode: Sized {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError>;
}

/// Encode `value` into a fresh byte vector.
pub fn to_vec<T: Encode>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    value.bsatn_encode(&mut out);
    out
}

/// Decode a `T` from `bytes`, requiring that the entire slice be consumed.
///
/// This is the entry point used for row payloads and whole-message frames,
/// where the caller has already isolated exactly the bytes belonging to one
/// value. Internal nested decoding (fields within a `Product`, elements
/// within an `Array`) uses [`Decode::bsatn_decode`] directly and consumes
/// only as much of the buffer as its shape requires.
pub fn from_slice<T: Decode>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut buf = bytes;
    let value = T::bsatn_decode(&mut buf)?;
    if !buf.is_empty() {
        log::warn!(
            "bsatn::from_slice: {} unused byte(s) after decoding {}",
            buf.len(),
            std::any::type_name::<T>(),
        );
    }
    Ok(value)
}

pub(crate) fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], DecodeError> {
    if buf.len() < n {
        return Err(DecodeError::TruncatedInput {
            expected: n,
            actual: buf.len(),
        });
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

macro_rules! impl_int {
    ($($t:ty),* $(,)?) => {
        $(
            impl Encode for $t {
                fn bsatn_encode(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }
            impl Decode for $t {
                fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
                    let bytes = take(buf, std::mem::size_of::<$t>())?;
                    Ok(<$t>::from_le_bytes(bytes.try_into().expect("size checked by `take`")))
                }
            }
        )*
    };
}

impl_int!(i8, u8, i16, u16, i32, u32, i64, u64, i128, u128);

impl Encode for bool {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        out.push(if *self { 1 } else { 0 });
    }
}

impl Decode for bool {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let byte = take(buf, 1)?[0];
        Ok(byte != 0)
    }
}

impl Encode for f32 {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Decode for f32 {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let bytes = take(buf, 4)?;
        Ok(f32::from_le_bytes(bytes.try_into().expect("size checked by `take`")))
    }
}

impl Encode for f64 {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Decode for f64 {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let bytes = take(buf, 8)?;
        Ok(f64::from_le_bytes(bytes.try_into().expect("size checked by `take`")))
    }
}

/// 256-bit signed/unsigned integers, stored as their little-endian bytes.
/// Native Rust has no `i256`/`u256`, so these are thin newtypes.
macro_rules! impl_wide_int {
    ($name:ident, $width:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
        pub struct $name(pub [u8; $width]);

        impl Encode for $name {
            fn bsatn_encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.0);
            }
        }

        impl Decode for $name {
            fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
                let bytes = take(buf, $width)?;
                let mut arr = [0u8; $width];
                arr.copy_from_slice(bytes);
                Ok($name(arr))
            }
        }
    };
}

impl_wide_int!(I256, 32);
impl_wide_int!(U256, 32);

fn encode_len(len: usize, out: &mut Vec<u8>) {
    // Lengths beyond u32::MAX can't occur from anything this SDK itself
    // constructs; a caller handing us a value that large would already
    // have failed to allocate it.
    (len as u32).bsatn_encode(out);
}

pub(crate) fn decode_len(buf: &mut &[u8]) -> Result<usize, DecodeError> {
    let len = u32::bsatn_decode(buf)?;
    usize::try_from(len).map_err(|_| DecodeError::LengthOverflow(len))
}

impl Encode for str {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        encode_len(self.len(), out);
        out.extend_from_slice(self.as_bytes());
    }
}

impl Encode for String {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.as_str().bsatn_encode(out);
    }
}

impl Decode for String {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = decode_len(buf)?;
        let bytes = take(buf, len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }
}

impl Encode for Box<str> {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.as_ref().bsatn_encode(out);
    }
}

impl Decode for Box<str> {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        String::bsatn_decode(buf).map(String::into_boxed_str)
    }
}

impl<T: Encode> Encode for [T] {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        encode_len(self.len(), out);
        for item in self {
            item.bsatn_encode(out);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.as_slice().bsatn_encode(out);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = decode_len(buf)?;
        let mut items = Vec::with_capacity(len.min(1 << 16));
        for _ in 0..len {
            items.push(T::bsatn_decode(buf)?);
        }
        Ok(items)
    }
}

impl<T: Encode> Encode for Box<[T]> {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        self.as_ref().bsatn_encode(out);
    }
}

impl<T: Decode> Decode for Box<[T]> {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Vec::<T>::bsatn_decode(buf).map(Vec::into_boxed_slice)
    }
}

impl Encode for bytes::Bytes {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        encode_len(self.len(), out);
        out.extend_from_slice(self);
    }
}

impl Decode for bytes::Bytes {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = decode_len(buf)?;
        let bytes = take(buf, len)?;
        Ok(bytes::Bytes::copy_from_slice(bytes))
    }
}

/// `Option<T>` is encoded as a `Sum` of `{some: T} | {none: ()}`:
/// a `u8` discriminant (0 = Some, 1 = None) followed by the payload.
impl<T: Encode> Encode for Option<T> {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        match self {
            Some(value) => {
                0u8.bsatn_encode(out);
                value.bsatn_encode(out);
            }
            None => 1u8.bsatn_encode(out),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::bsatn_decode(buf)? {
            0 => Ok(Some(T::bsatn_decode(buf)?)),
            1 => Ok(None),
            tag => Err(DecodeError::UnknownVariantTag { tag, variant_count: 2 }),
        }
    }
}

/// `Result<T, E>` is encoded the same way as any other two-variant `Sum`:
/// `Ok` is variant 0, `Err` is variant 1.
impl<T: Encode, E: Encode> Encode for Result<T, E> {
    fn bsatn_encode(&self, out: &mut Vec<u8>) {
        match self {
            Ok(value) => {
                0u8.bsatn_encode(out);
                value.bsatn_encode(out);
            }
            Err(e) => {
                1u8.bsatn_encode(out);
                e.bsatn_encode(out);
            }
        }
    }
}

impl<T: Decode, E: Decode> Decode for Result<T, E> {
    fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::bsatn_decode(buf)? {
            0 => Ok(Ok(T::bsatn_decode(buf)?)),
            1 => Ok(Err(E::bsatn_decode(buf)?)),
            tag => Err(DecodeError::UnknownVariantTag { tag, variant_count: 2 }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // S1: Product{elements=[(foo, String)]}, value {foo: "foobar"}.
    #[test]
    fn s1_product_of_string_round_trips_to_spec_bytes() {
        #[derive(Debug, PartialEq, Eq, Clone)]
        struct Foo {
            foo: String,
        }
        impl Encode for Foo {
            fn bsatn_encode(&self, out: &mut Vec<u8>) {
                self.foo.bsatn_encode(out);
            }
        }
        impl Decode for Foo {
            fn bsatn_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
                Ok(Foo {
                    foo: String::bsatn_decode(buf)?,
                })
            }
        }

        let value = Foo { foo: "foobar".to_string() };
        let bytes = to_vec(&value);
        assert_eq!(bytes, [0x06, 0x00, 0x00, 0x00, b'f', b'o', b'o', b'b', b'a', b'r']);
        assert_eq!(from_slice::<Foo>(&bytes).unwrap(), value);
    }

    #[test]
    fn truncated_input_is_an_error_not_a_panic() {
        let bytes = [0x05, 0x00, 0x00]; // u32 length prefix cut short
        assert_eq!(
            u32::bsatn_decode(&mut &bytes[..]),
            Err(DecodeError::TruncatedInput { expected: 4, actual: 3 })
        );
    }

    #[test]
    fn option_round_trips() {
        let some = Some(5u32);
        let none: Option<u32> = None;
        assert_eq!(from_slice::<Option<u32>>(&to_vec(&some)).unwrap(), some);
        assert_eq!(from_slice::<Option<u32>>(&to_vec(&none)).unwrap(), none);
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let mut bytes = Vec::new();
        encode_len(1, &mut bytes);
        bytes.push(0xFF);
        assert_eq!(String::bsatn_decode(&mut &bytes[..]), Err(DecodeError::InvalidUtf8));
    }
}
