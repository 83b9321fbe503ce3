//! Read-only views of committed blocks.

use bytes::Bytes;

use crate::config::ByteOrder;
use crate::space::Scalar;

/// Location and record of a committed block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Reference (address / 16)
    pub reference: u32,
    /// Caller-defined kind tag
    pub kind: u32,
    /// Payload length in bytes
    pub length: u32,
    /// Address of the first payload byte
    pub address: u64,
}

/// Width of the elements a block payload is decoded into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementWidth {
    Int8,
    Int16,
    Int32,
    Int64,
}

impl ElementWidth {
    /// Width in bytes
    pub fn bytes(self) -> usize {
        match self {
            ElementWidth::Int8 => 1,
            ElementWidth::Int16 => 2,
            ElementWidth::Int32 => 4,
            ElementWidth::Int64 => 8,
        }
    }
}

/// A block payload seen as an array of signed fixed-width integers
///
/// Owns a snapshot of the payload, so it stays valid after the heap lock is
/// released.
#[derive(Debug, Clone)]
pub struct BlockArray {
    bytes: Bytes,
    width: ElementWidth,
    order: ByteOrder,
}

impl BlockArray {
    pub(crate) fn new(bytes: Bytes, width: ElementWidth, order: ByteOrder) -> Self {
        Self {
            bytes,
            width,
            order,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.bytes.len() / self.width.bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn width(&self) -> ElementWidth {
        self.width
    }

    /// Element at `index`, sign-extended
    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let at = index * self.width.bytes();
        let raw = &self.bytes[at..];
        let value = match self.width {
            ElementWidth::Int8 => i8::decode(raw, self.order) as i64,
            ElementWidth::Int16 => i16::decode(raw, self.order) as i64,
            ElementWidth::Int32 => i32::decode(raw, self.order) as i64,
            ElementWidth::Int64 => i64::decode(raw, self.order),
        };
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        (0..self.len()).filter_map(move |index| self.get(index))
    }

    /// Raw payload bytes
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }
}
