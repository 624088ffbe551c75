//! The schema-driven `AlgebraicType`/`AlgebraicValue` codec.
//!
//! Unlike the fixed wire-message types in the parent module, a value here
//! can only be encoded or decoded *given* its `AlgebraicType` — the bytes
//! carry no type tags of their own except a sum variant's `u8` index.
//! Structural, not nominal: two types are equal iff their shapes match.

use super::{Decode, Encode};
use crate::error::DecodeError;
use std::collections::BTreeMap;

/// A recursive tagged description of values. Acyclic: the type tree is
/// fully owned by its root and cycles in the type itself are never
/// constructed (a *value* may contain repeated sub-values, but not the
/// type describing it).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AlgebraicType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    I128,
    U128,
    I256,
    U256,
    F32,
    F64,
    String,
    Array(Box<AlgebraicType>),
    Product(ProductType),
    Sum(SumType),
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ProductType {
    pub elements: Vec<(String, AlgebraicType)>,
}

impl ProductType {
    pub fn new(elements: Vec<(String, AlgebraicType)>) -> Self {
        ProductType { elements }
    }
}

impl From<Vec<(&str, AlgebraicType)>> for ProductType {
    fn from(elements: Vec<(&str, AlgebraicType)>) -> Self {
        ProductType {
            elements: elements.into_iter().map(|(n, t)| (n.to_string(), t)).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SumType {
    pub variants: Vec<(String, AlgebraicType)>,
}

impl SumType {
    pub fn new(variants: Vec<(String, AlgebraicType)>) -> Self {
        SumType { variants }
    }
}

/// One of the distinguished newtype wrappers: a `Product` of a single
/// byte-array element with a conventional inner field name.
pub fn newtype_of(field_name: &str, width: NewtypeWidth) -> AlgebraicType {
    let inner = match width {
        NewtypeWidth::Bytes(_) => AlgebraicType::Array(Box::new(AlgebraicType::U8)),
        NewtypeWidth::U64 => AlgebraicType::U64,
        NewtypeWidth::I64 => AlgebraicType::I64,
    };
    AlgebraicType::Product(ProductType::from(vec![(field_name, inner)]))
}

pub enum NewtypeWidth {
    Bytes(usize),
    U64,
    I64,
}

/// A total-order wrapper around `f32` so it can be used as a `HashMap`/
/// `BTreeMap` key and compared for equality, matching the teacher's
/// `spacetimedb_sats::algebraic_value::F32`.
#[derive(Clone, Copy, Debug)]
pub struct F32(f32);

impl F32 {
    pub fn from_inner(v: f32) -> Self {
        F32(v)
    }
    pub fn into_inner(self) -> f32 {
        self.0
    }
}

impl PartialEq for F32 {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}
impl Eq for F32 {}
impl PartialOrd for F32 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for F32 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// See [`F32`].
#[derive(Clone, Copy, Debug)]
pub struct F64(f64);

impl F64 {
    pub fn from_inner(v: f64) -> Self {
        F64(v)
    }
    pub fn into_inner(self) -> f64 {
        self.0
    }
}

impl PartialEq for F64 {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}
impl Eq for F64 {}
impl PartialOrd for F64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for F64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// An instance of an `AlgebraicType`.
#[derive(Clone, Debug, PartialEq)]
pub enum AlgebraicValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    I128(i128),
    U128(u128),
    I256(super::I256),
    U256(super::U256),
    F32(F32),
    F64(F64),
    String(String),
    Array(ArrayValue),
    Product(ProductValue),
    Sum(SumValue),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProductValue {
    pub elements: Vec<AlgebraicValue>,
}

impl ProductValue {
    pub fn new(elements: Vec<AlgebraicValue>) -> Self {
        ProductValue { elements }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SumValue {
    /// Index into the `SumType::variants` this value belongs to.
    pub tag: u8,
    pub value: Box<AlgebraicValue>,
}

/// A homogeneous dynamic sequence. Stored element-typed (rather than as
/// `Vec<AlgebraicValue>`) so that e.g. a million-`U8` array doesn't carry a
/// discriminant per element; this mirrors the teacher's `ArrayValue` enum.
#[derive(Clone, Debug, PartialEq)]
pub enum ArrayValue {
    Bool(Vec<bool>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    I128(Vec<i128>),
    U128(Vec<u128>),
    F32(Vec<F32>),
    F64(Vec<F64>),
    String(Vec<String>),
    Product(Vec<ProductValue>),
    Sum(Vec<SumValue>),
}

impl ArrayValue {
    pub fn len(&self) -> usize {
        match self {
            ArrayValue::Bool(v) => v.len(),
            ArrayValue::I8(v) => v.len(),
            ArrayValue::U8(v) => v.len(),
            ArrayValue::I16(v) => v.len(),
            ArrayValue::U16(v) => v.len(),
            ArrayValue::I32(v) => v.len(),
            ArrayValue::U32(v) => v.len(),
            ArrayValue::I64(v) => v.len(),
            ArrayValue::U64(v) => v.len(),
            ArrayValue::I128(v) => v.len(),
            ArrayValue::U128(v) => v.len(),
            ArrayValue::F32(v) => v.len(),
            ArrayValue::F64(v) => v.len(),
            ArrayValue::String(v) => v.len(),
            ArrayValue::Product(v) => v.len(),
            ArrayValue::Sum(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `AlgebraicType` of this array's elements. For empty `Product`/
    /// `Sum` arrays there is no element to inspect; callers in that
    /// position must already know the element type from the table schema,
    /// so this is only relied on for the scalar variants.
    pub fn element_type(&self) -> AlgebraicType {
        match self {
            ArrayValue::Bool(_) => AlgebraicType::Bool,
            ArrayValue::I8(_) => AlgebraicType::I8,
            ArrayValue::U8(_) => AlgebraicType::U8,
            ArrayValue::I16(_) => AlgebraicType::I16,
            ArrayValue::U16(_) => AlgebraicType::U16,
            ArrayValue::I32(_) => AlgebraicType::I32,
            ArrayValue::U32(_) => AlgebraicType::U32,
            ArrayValue::I64(_) => AlgebraicType::I64,
            ArrayValue::U64(_) => AlgebraicType::U64,
            ArrayValue::I128(_) => AlgebraicType::I128,
            ArrayValue::U128(_) => AlgebraicType::U128,
            ArrayValue::F32(_) => AlgebraicType::F32,
            ArrayValue::F64(_) => AlgebraicType::F64,
            ArrayValue::String(_) => AlgebraicType::String,
            ArrayValue::Product(v) => v
                .first()
                .map(|p| AlgebraicType::Product(ProductType::new(
                    p.elements.iter().enumerate().map(|(i, e)| (i.to_string(), e.type_of())).collect(),
                )))
                .unwrap_or(AlgebraicType::Product(ProductType::default())),
            ArrayValue::Sum(v) => v
                .first()
                .map(|s| AlgebraicType::Sum(SumType::new(vec![(s.tag.to_string(), s.value.type_of())])))
                .unwrap_or(AlgebraicType::Sum(SumType::default())),
        }
    }
}

macro_rules! impl_array_value_from {
    ($variant:ident, $elem:ty) => {
        impl From<Vec<$elem>> for ArrayValue {
            fn from(v: Vec<$elem>) -> Self {
                ArrayValue::$variant(v)
            }
        }
    };
}

impl_array_value_from!(Bool, bool);
impl_array_value_from!(I8, i8);
impl_array_value_from!(U8, u8);
impl_array_value_from!(I16, i16);
impl_array_value_from!(U16, u16);
impl_array_value_from!(I32, i32);
impl_array_value_from!(U32, u32);
impl_array_value_from!(I64, i64);
impl_array_value_from!(U64, u64);
impl_array_value_from!(I128, i128);
impl_array_value_from!(U128, u128);
impl_array_value_from!(String, String);

impl AlgebraicValue {
    /// The smallest `AlgebraicType` this value validates against. Used by
    /// test code and by `intoMapKey` for primitives, where the type is
    /// evident from the value itself.
    pub fn type_of(&self) -> AlgebraicType {
        match self {
            AlgebraicValue::Bool(_) => AlgebraicType::Bool,
            AlgebraicValue::I8(_) => AlgebraicType::I8,
            AlgebraicValue::U8(_) => AlgebraicType::U8,
            AlgebraicValue::I16(_) => AlgebraicType::I16,
            AlgebraicValue::U16(_) => AlgebraicType::U16,
            AlgebraicValue::I32(_) => AlgebraicType::I32,
            AlgebraicValue::U32(_) => AlgebraicType::U32,
            AlgebraicValue::I64(_) => AlgebraicType::I64,
            AlgebraicValue::U64(_) => AlgebraicType::U64,
            AlgebraicValue::I128(_) => AlgebraicType::I128,
            AlgebraicValue::U128(_) => AlgebraicType::U128,
            AlgebraicValue::I256(_) => AlgebraicType::I256,
            AlgebraicValue::U256(_) => AlgebraicType::U256,
            AlgebraicValue::F32(_) => AlgebraicType::F32,
            AlgebraicValue::F64(_) => AlgebraicType::F64,
            AlgebraicValue::String(_) => AlgebraicType::String,
            AlgebraicValue::Array(arr) => AlgebraicType::Array(Box::new(arr.element_type())),
            AlgebraicValue::Product(p) => AlgebraicType::Product(ProductType::new(
                p.elements.iter().enumerate().map(|(i, v)| (i.to_string(), v.type_of())).collect(),
            )),
            AlgebraicValue::Sum(s) => AlgebraicType::Sum(SumType::new(vec![(
                s.tag.to_string(),
                s.value.type_of(),
            )])),
        }
    }

    /// Is this a primitive scalar (as opposed to a Product/Sum/Array)?
    pub fn is_primitive(&self) -> bool {
        !matches!(
            self,
            AlgebraicValue::Array(_) | AlgebraicValue::Product(_) | AlgebraicValue::Sum(_)
        )
    }

    pub fn product(elements: Vec<AlgebraicValue>) -> Self {
        AlgebraicValue::Product(ProductValue::new(elements))
    }

    /// Build a `Product` of `(key, value)` pairs, encoded as a sorted
    /// two-element product array — a convenience for constructing ad hoc
    /// maps in tests, matching the teacher's `AlgebraicValue::map`.
    pub fn map(entries: BTreeMap<AlgebraicValue, AlgebraicValue>) -> Self {
        AlgebraicValue::Array(ArrayValue::Product(
            entries
                .into_iter()
                .map(|(k, v)| ProductValue::new(vec![k, v]))
                .collect(),
        ))
    }
}

// A conservative `Eq`/`Ord`/`Hash` so `AlgebraicValue` can serve as a
// `BTreeMap` key for the `map` convenience constructor above; values that
// aren't well-ordered by spec (NaN floats) fall back to bit patterns via
// `F32`/`F64`, which are already total-order.
impl Eq for AlgebraicValue {}
impl PartialOrd for AlgebraicValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for AlgebraicValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        to_vec_untyped(self).cmp(&to_vec_untyped(other))
    }
}
impl std::hash::Hash for AlgebraicValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        to_vec_untyped(self).hash(state)
    }
}

/// Encode a value using its own `type_of()`, for use only where ordering/
/// hashing needs *some* canonical byte representation (the `map` helper,
/// and `Ord`/`Hash` above). Real wire encoding always goes through
/// `encode(ty, value, out)` with a schema fetched from the table.
pub(crate) fn to_vec_untyped(value: &AlgebraicValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode(&value.type_of(), value, &mut out);
    out
}

/// Encode `value` against `ty`, per the table in spec.md §4.1.
pub fn encode(ty: &AlgebraicType, value: &AlgebraicValue, out: &mut Vec<u8>) {
    match (ty, value) {
        (AlgebraicType::Bool, AlgebraicValue::Bool(v)) => v.bsatn_encode(out),
        (AlgebraicType::I8, AlgebraicValue::I8(v)) => v.bsatn_encode(out),
        (AlgebraicType::U8, AlgebraicValue::U8(v)) => v.bsatn_encode(out),
        (AlgebraicType::I16, AlgebraicValue::I16(v)) => v.bsatn_encode(out),
        (AlgebraicType::U16, AlgebraicValue::U16(v)) => v.bsatn_encode(out),
        (AlgebraicType::I32, AlgebraicValue::I32(v)) => v.bsatn_encode(out),
        (AlgebraicType::U32, AlgebraicValue::U32(v)) => v.bsatn_encode(out),
        (AlgebraicType::I64, AlgebraicValue::I64(v)) => v.bsatn_encode(out),
        (AlgebraicType::U64, AlgebraicValue::U64(v)) => v.bsatn_encode(out),
        (AlgebraicType::I128, AlgebraicValue::I128(v)) => v.bsatn_encode(out),
        (AlgebraicType::U128, AlgebraicValue::U128(v)) => v.bsatn_encode(out),
        (AlgebraicType::I256, AlgebraicValue::I256(v)) => v.bsatn_encode(out),
        (AlgebraicType::U256, AlgebraicValue::U256(v)) => v.bsatn_encode(out),
        (AlgebraicType::F32, AlgebraicValue::F32(v)) => v.into_inner().bsatn_encode(out),
        (AlgebraicType::F64, AlgebraicValue::F64(v)) => v.into_inner().bsatn_encode(out),
        (AlgebraicType::String, AlgebraicValue::String(v)) => v.bsatn_encode(out),
        (AlgebraicType::Array(elem_ty), AlgebraicValue::Array(arr)) => encode_array(elem_ty, arr, out),
        (AlgebraicType::Product(pt), AlgebraicValue::Product(pv)) => {
            debug_assert_eq!(pt.elements.len(), pv.elements.len());
            for ((_, elem_ty), elem_val) in pt.elements.iter().zip(pv.elements.iter()) {
                encode(elem_ty, elem_val, out);
            }
        }
        (AlgebraicType::Sum(st), AlgebraicValue::Sum(sv)) => {
            sv.tag.bsatn_encode(out);
            let (_, variant_ty) = &st.variants[sv.tag as usize];
            encode(variant_ty, &sv.value, out);
        }
        (ty, value) => {
            // Caller handed us a value/type pair whose shapes disagree.
            // Encoding is otherwise total; this is the one place a
            // malformed caller input surfaces, and we still produce
            // *something* deterministic rather than panicking.
            log::error!("encode: value {:?} does not match type {:?}", value, ty);
        }
    }
}

fn encode_array(elem_ty: &AlgebraicType, arr: &ArrayValue, out: &mut Vec<u8>) {
    encode_len_u32(arr.len(), out);
    match (elem_ty, arr) {
        (AlgebraicType::Bool, ArrayValue::Bool(v)) => v.iter().for_each(|x| x.bsatn_encode(out)),
        (AlgebraicType::I8, ArrayValue::I8(v)) => v.iter().for_each(|x| x.bsatn_encode(out)),
        (AlgebraicType::U8, ArrayValue::U8(v)) => out.extend_from_slice(v),
        (AlgebraicType::I16, ArrayValue::I16(v)) => v.iter().for_each(|x| x.bsatn_encode(out)),
        (AlgebraicType::U16, ArrayValue::U16(v)) => v.iter().for_each(|x| x.bsatn_encode(out)),
        (AlgebraicType::I32, ArrayValue::I32(v)) => v.iter().for_each(|x| x.bsatn_encode(out)),
        (AlgebraicType::U32, ArrayValue::U32(v)) => v.iter().for_each(|x| x.bsatn_encode(out)),
        (AlgebraicType::I64, ArrayValue::I64(v)) => v.iter().for_each(|x| x.bsatn_encode(out)),
        (AlgebraicType::U64, ArrayValue::U64(v)) => v.iter().for_each(|x| x.bsatn_encode(out)),
        (AlgebraicType::I128, ArrayValue::I128(v)) => v.iter().for_each(|x| x.bsatn_encode(out)),
        (AlgebraicType::U128, ArrayValue::U128(v)) => v.iter().for_each(|x| x.bsatn_encode(out)),
        (AlgebraicType::F32, ArrayValue::F32(v)) => v.iter().for_each(|x| x.into_inner().bsatn_encode(out)),
        (AlgebraicType::F64, ArrayValue::F64(v)) => v.iter().for_each(|x| x.into_inner().bsatn_encode(out)),
        (AlgebraicType::String, ArrayValue::String(v)) => v.iter().for_each(|x| x.bsatn_encode(out)),
        (AlgebraicType::Product(pt), ArrayValue::Product(v)) => {
            v.iter().for_each(|x| encode(&AlgebraicType::Product(pt.clone()), &AlgebraicValue::Product(x.clone()), out))
        }
        (AlgebraicType::Sum(st), ArrayValue::Sum(v)) => {
            v.iter().for_each(|x| encode(&AlgebraicType::Sum(st.clone()), &AlgebraicValue::Sum(x.clone()), out))
        }
        (ty, arr) => log::error!("encode_array: array {:?} does not match element type {:?}", arr, ty),
    }
}

fn encode_len_u32(len: usize, out: &mut Vec<u8>) {
    (len as u32).bsatn_encode(out);
}

/// Decode a value of type `ty` from the front of `buf`.
pub fn decode(ty: &AlgebraicType, buf: &mut &[u8]) -> Result<AlgebraicValue, DecodeError> {
    Ok(match ty {
        AlgebraicType::Bool => AlgebraicValue::Bool(bool::bsatn_decode(buf)?),
        AlgebraicType::I8 => AlgebraicValue::I8(i8::bsatn_decode(buf)?),
        AlgebraicType::U8 => AlgebraicValue::U8(u8::bsatn_decode(buf)?),
        AlgebraicType::I16 => AlgebraicValue::I16(i16::bsatn_decode(buf)?),
        AlgebraicType::U16 => AlgebraicValue::U16(u16::bsatn_decode(buf)?),
        AlgebraicType::I32 => AlgebraicValue::I32(i32::bsatn_decode(buf)?),
        AlgebraicType::U32 => AlgebraicValue::U32(u32::bsatn_decode(buf)?),
        AlgebraicType::I64 => AlgebraicValue::I64(i64::bsatn_decode(buf)?),
        AlgebraicType::U64 => AlgebraicValue::U64(u64::bsatn_decode(buf)?),
        AlgebraicType::I128 => AlgebraicValue::I128(i128::bsatn_decode(buf)?),
        AlgebraicType::U128 => AlgebraicValue::U128(u128::bsatn_decode(buf)?),
        AlgebraicType::I256 => AlgebraicValue::I256(super::I256::bsatn_decode(buf)?),
        AlgebraicType::U256 => AlgebraicValue::U256(super::U256::bsatn_decode(buf)?),
        AlgebraicType::F32 => AlgebraicValue::F32(F32::from_inner(f32::bsatn_decode(buf)?)),
        AlgebraicType::F64 => AlgebraicValue::F64(F64::from_inner(f64::bsatn_decode(buf)?)),
        AlgebraicType::String => AlgebraicValue::String(String::bsatn_decode(buf)?),
        AlgebraicType::Array(elem_ty) => AlgebraicValue::Array(decode_array(elem_ty, buf)?),
        AlgebraicType::Product(pt) => {
            let mut elements = Vec::with_capacity(pt.elements.len());
            for (_, elem_ty) in &pt.elements {
                elements.push(decode(elem_ty, buf)?);
            }
            AlgebraicValue::Product(ProductValue::new(elements))
        }
        AlgebraicType::Sum(st) => {
            let tag = u8::bsatn_decode(buf)?;
            let (_, variant_ty) = st.variants.get(tag as usize).ok_or(DecodeError::UnknownVariantTag {
                tag,
                variant_count: st.variants.len(),
            })?;
            let value = decode(variant_ty, buf)?;
            AlgebraicValue::Sum(SumValue {
                tag,
                value: Box::new(value),
            })
        }
    })
}

fn decode_array(elem_ty: &AlgebraicType, buf: &mut &[u8]) -> Result<ArrayValue, DecodeError> {
    let len = super::decode_len(buf)?;
    Ok(match elem_ty {
        AlgebraicType::Bool => ArrayValue::Bool(decode_n(buf, len)?),
        AlgebraicType::I8 => ArrayValue::I8(decode_n(buf, len)?),
        AlgebraicType::U8 => ArrayValue::U8(super::take(buf, len)?.to_vec()),
        AlgebraicType::I16 => ArrayValue::I16(decode_n(buf, len)?),
        AlgebraicType::U16 => ArrayValue::U16(decode_n(buf, len)?),
        AlgebraicType::I32 => ArrayValue::I32(decode_n(buf, len)?),
        AlgebraicType::U32 => ArrayValue::U32(decode_n(buf, len)?),
        AlgebraicType::I64 => ArrayValue::I64(decode_n(buf, len)?),
        AlgebraicType::U64 => ArrayValue::U64(decode_n(buf, len)?),
        AlgebraicType::I128 => ArrayValue::I128(decode_n(buf, len)?),
        AlgebraicType::U128 => ArrayValue::U128(decode_n(buf, len)?),
        AlgebraicType::F32 => {
            let mut v = Vec::with_capacity(len);
            for _ in 0..len {
                v.push(F32::from_inner(f32::bsatn_decode(buf)?));
            }
            ArrayValue::F32(v)
        }
        AlgebraicType::F64 => {
            let mut v = Vec::with_capacity(len);
            for _ in 0..len {
                v.push(F64::from_inner(f64::bsatn_decode(buf)?));
            }
            ArrayValue::F64(v)
        }
        AlgebraicType::String => ArrayValue::String(decode_n(buf, len)?),
        AlgebraicType::Product(pt) => {
            let mut v = Vec::with_capacity(len);
            for _ in 0..len {
                match decode(&AlgebraicType::Product(pt.clone()), buf)? {
                    AlgebraicValue::Product(pv) => v.push(pv),
                    _ => unreachable!("decode(Product(..)) always returns AlgebraicValue::Product"),
                }
            }
            ArrayValue::Product(v)
        }
        AlgebraicType::Sum(st) => {
            let mut v = Vec::with_capacity(len);
            for _ in 0..len {
                match decode(&AlgebraicType::Sum(st.clone()), buf)? {
                    AlgebraicValue::Sum(sv) => v.push(sv),
                    _ => unreachable!("decode(Sum(..)) always returns AlgebraicValue::Sum"),
                }
            }
            ArrayValue::Sum(v)
        }
        AlgebraicType::Array(_) => {
            return Err(DecodeError::TruncatedInput { expected: 0, actual: 0 });
        }
    })
}

fn decode_n<T: Decode>(buf: &mut &[u8], len: usize) -> Result<Vec<T>, DecodeError> {
    let mut v = Vec::with_capacity(len.min(1 << 16));
    for _ in 0..len {
        v.push(T::bsatn_decode(buf)?);
    }
    Ok(v)
}

/// `intoMapKey(type, value) -> string | primitive`: a stable hash-map key
/// for any value of any type. Primitive scalars pass through unchanged
/// (represented here as the `AlgebraicValue` itself, which already has a
/// value-based `Eq`/`Hash`); compound values are base64 of their own wire
/// encoding.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MapKey {
    Primitive(AlgebraicValue),
    Base64(String),
}

pub fn into_map_key(ty: &AlgebraicType, value: &AlgebraicValue) -> MapKey {
    if value.is_primitive() {
        MapKey::Primitive(value.clone())
    } else {
        let mut bytes = Vec::new();
        encode(ty, value, &mut bytes);
        {
            use base64::Engine;
            MapKey::Base64(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // S2: Sum{variants=[(bar,U32),(foo,String)]}, value {tag:"bar", value:5}.
    #[test]
    fn s2_sum_tag_round_trips_to_spec_bytes() {
        let ty = AlgebraicType::Sum(SumType::new(vec![
            ("bar".to_string(), AlgebraicType::U32),
            ("foo".to_string(), AlgebraicType::String),
        ]));
        let value = AlgebraicValue::Sum(SumValue {
            tag: 0,
            value: Box::new(AlgebraicValue::U32(5)),
        });

        let mut bytes = Vec::new();
        encode(&ty, &value, &mut bytes);
        assert_eq!(bytes, [0x00, 0x05, 0x00, 0x00, 0x00]);

        let mut buf = &bytes[..];
        assert_eq!(decode(&ty, &mut buf).unwrap(), value);
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_variant_tag_is_reported() {
        let ty = AlgebraicType::Sum(SumType::new(vec![("only".to_string(), AlgebraicType::Bool)]));
        let bytes = [0x01u8, 0x00]; // tag 1, but only one variant exists
        assert_eq!(
            decode(&ty, &mut &bytes[..]),
            Err(DecodeError::UnknownVariantTag { tag: 1, variant_count: 1 })
        );
    }

    #[test]
    fn into_map_key_is_identity_for_primitives() {
        let v = AlgebraicValue::U32(42);
        assert_eq!(into_map_key(&AlgebraicType::U32, &v), MapKey::Primitive(v));
    }

    #[test]
    fn into_map_key_is_base64_for_compound_values() {
        let ty = AlgebraicType::Product(ProductType::from(vec![("x", AlgebraicType::U8)]));
        let v = AlgebraicValue::product(vec![AlgebraicValue::U8(7)]);
        match into_map_key(&ty, &v) {
            MapKey::Base64(_) => {}
            other => panic!("expected Base64, got {:?}", other),
        }
    }

    #[test]
    fn product_round_trip() {
        let ty = AlgebraicType::Product(ProductType::from(vec![
            ("a", AlgebraicType::Bool),
            ("b", AlgebraicType::Array(Box::new(AlgebraicType::U8))),
        ]));
        let value = AlgebraicValue::product(vec![
            AlgebraicValue::Bool(true),
            AlgebraicValue::Array(ArrayValue::U8(vec![1, 2, 3])),
        ]);
        let mut bytes = Vec::new();
        encode(&ty, &value, &mut bytes);
        let mut buf = &bytes[..];
        assert_eq!(decode(&ty, &mut buf).unwrap(), value);
        assert!(buf.is_empty());
    }
}
