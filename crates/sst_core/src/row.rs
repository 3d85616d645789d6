//! Row and slot-value primitives shared by the table and the combinator DSL.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the storage layer, the builder DSL, and the transport crates alike.

use bytemuck::{Pod, Zeroable};

/// Bound for user row types.
///
/// A row must be a fixed-size, pointer-free value that can be copied bit for
/// bit between nodes. `Pod` gives exactly that guarantee; the blanket impl
/// means any `#[derive(Pod, Zeroable)]` struct qualifies.
pub trait Row: Pod + Zeroable + Send + Sync + 'static {}

impl<T: Pod + Zeroable + Send + Sync + 'static> Row for T {}

/// Storage type of one extension slot in the internal row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotType {
    Bool,
    I64,
    U64,
    F64,
}

impl SlotType {
    /// Encoded size of a slot of this type, in bytes.
    pub const fn size(self) -> usize {
        match self {
            SlotType::Bool => 1,
            SlotType::I64 | SlotType::U64 | SlotType::F64 => 8,
        }
    }
}

/// Runtime value of one extension slot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SlotValue {
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
}

impl SlotValue {
    pub const fn slot_type(self) -> SlotType {
        match self {
            SlotValue::Bool(_) => SlotType::Bool,
            SlotValue::I64(_) => SlotType::I64,
            SlotValue::U64(_) => SlotType::U64,
            SlotValue::F64(_) => SlotType::F64,
        }
    }

    /// Encode into `dst`, which must be exactly `slot_type().size()` long.
    pub fn encode(self, dst: &mut [u8]) {
        match self {
            SlotValue::Bool(v) => dst.copy_from_slice(&[v as u8]),
            SlotValue::I64(v) => dst.copy_from_slice(&v.to_le_bytes()),
            SlotValue::U64(v) => dst.copy_from_slice(&v.to_le_bytes()),
            SlotValue::F64(v) => dst.copy_from_slice(&v.to_le_bytes()),
        }
    }

    /// Decode a slot of type `ty` from `src`, which must be exactly
    /// `ty.size()` long.
    pub fn decode(ty: SlotType, src: &[u8]) -> SlotValue {
        match ty {
            SlotType::Bool => SlotValue::Bool(src[0] != 0),
            SlotType::I64 => SlotValue::I64(i64::from_le_bytes(src.try_into().expect("slot width"))),
            SlotType::U64 => SlotValue::U64(u64::from_le_bytes(src.try_into().expect("slot width"))),
            SlotType::F64 => SlotValue::F64(f64::from_le_bytes(src.try_into().expect("slot width"))),
        }
    }
}

/// Scalar types that can live in an extension slot.
///
/// The comparison bound is what lets `min_of` fold over rows; ties keep the
/// first row's value.
pub trait Scalar: Copy + PartialOrd + Send + Sync + 'static {
    const SLOT_TYPE: SlotType;

    fn into_slot(self) -> SlotValue;

    /// Inverse of [`Scalar::into_slot`].
    ///
    /// Panics on a slot of a different type; mixing slot types is a
    /// programmer error, not a runtime condition.
    fn from_slot(value: SlotValue) -> Self;
}

impl Scalar for bool {
    const SLOT_TYPE: SlotType = SlotType::Bool;

    fn into_slot(self) -> SlotValue {
        SlotValue::Bool(self)
    }

    fn from_slot(value: SlotValue) -> Self {
        match value {
            SlotValue::Bool(v) => v,
            other => panic!("expected a bool slot, found {other:?}"),
        }
    }
}

impl Scalar for i64 {
    const SLOT_TYPE: SlotType = SlotType::I64;

    fn into_slot(self) -> SlotValue {
        SlotValue::I64(self)
    }

    fn from_slot(value: SlotValue) -> Self {
        match value {
            SlotValue::I64(v) => v,
            other => panic!("expected an i64 slot, found {other:?}"),
        }
    }
}

impl Scalar for u64 {
    const SLOT_TYPE: SlotType = SlotType::U64;

    fn into_slot(self) -> SlotValue {
        SlotValue::U64(self)
    }

    fn from_slot(value: SlotValue) -> Self {
        match value {
            SlotValue::U64(v) => v,
            other => panic!("expected a u64 slot, found {other:?}"),
        }
    }
}

impl Scalar for f64 {
    const SLOT_TYPE: SlotType = SlotType::F64;

    fn into_slot(self) -> SlotValue {
        SlotValue::F64(self)
    }

    fn from_slot(value: SlotValue) -> Self {
        match value {
            SlotValue::F64(v) => v,
            other => panic!("expected an f64 slot, found {other:?}"),
        }
    }
}
