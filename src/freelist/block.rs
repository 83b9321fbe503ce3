//! Boundary tags and typed block views.
//!
//! The bytes of a block mean different things depending on the sign of its
//! tag: a [`UsedBlock`] payload is opaque caller data, a [`FreeNode`]
//! payload starts with the prev/next pointers of the free list. The views
//! are only ever built from a tag that was just read, so the two
//! interpretations never mix.

use crate::error::{HeapError, Result};
use crate::space::AddressSpace;

use super::{ALIGN, SENTINEL, TAG_OVERHEAD};

/// Decoded boundary tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tag {
    /// Allocated block with this payload size
    Used(u64),
    /// Free block with this payload size
    Free(u64),
    /// Zero tag at `heap_top - 8`
    End,
}

impl Tag {
    pub(crate) fn decode(raw: i64) -> Self {
        match raw {
            0 => Tag::End,
            n if n > 0 => Tag::Used(n as u64),
            n => Tag::Free(n.unsigned_abs()),
        }
    }

    /// Read the tag stored at `at`
    pub(crate) fn read(space: &AddressSpace, at: u64) -> Result<Self> {
        Ok(Self::decode(space.get_i64(at)?))
    }

    /// Leading tag of the block at `addr`
    pub(crate) fn leading(space: &AddressSpace, addr: u64) -> Result<Self> {
        Self::read(space, addr - 8)
    }

    /// Trailing tag of the block that ends right before `addr`
    pub(crate) fn preceding(space: &AddressSpace, addr: u64) -> Result<Self> {
        Self::read(space, addr - TAG_OVERHEAD)
    }

    /// Leading tag of the block that follows `addr` (payload `size`)
    pub(crate) fn following(space: &AddressSpace, addr: u64, size: u64) -> Result<Self> {
        Self::read(space, addr + size + 8)
    }
}

/// Address of the block that follows the block at `addr`
pub(crate) fn next_block(addr: u64, size: u64) -> u64 {
    addr + size + TAG_OVERHEAD
}

/// Address of the block of payload `size` that ends right before `addr`
pub(crate) fn prev_block(addr: u64, size: u64) -> u64 {
    addr - size - TAG_OVERHEAD
}

pub(crate) fn is_aligned(value: u64) -> bool {
    value % ALIGN == 0
}

// =============================================================================
// Used Block View
// =============================================================================

/// An allocated block: tags are `+size`, payload belongs to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UsedBlock {
    pub addr: u64,
    pub size: u64,
}

impl UsedBlock {
    /// Write both tags, turning `[addr, addr + size)` into a used block
    pub(crate) fn write(space: &mut AddressSpace, addr: u64, size: u64) -> Result<Self> {
        space.put_i64(addr - 8, size as i64)?;
        space.put_i64(addr + size, size as i64)?;
        Ok(Self { addr, size })
    }
}

// =============================================================================
// Free Node View
// =============================================================================

/// A free block seen as a node of the intrusive free list
///
/// `addr + 0` holds the previous node, `addr + 8` the next node. The
/// sentinel at address 16 is a node without tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeNode {
    pub addr: u64,
}

impl FreeNode {
    pub(crate) const SENTINEL: FreeNode = FreeNode { addr: SENTINEL };

    pub(crate) fn at(addr: u64) -> Self {
        Self { addr }
    }

    pub(crate) fn is_sentinel(&self) -> bool {
        self.addr == SENTINEL
    }

    /// Write both tags, turning `[addr, addr + size)` into a free block
    pub(crate) fn write(space: &mut AddressSpace, addr: u64, size: u64) -> Result<Self> {
        space.put_i64(addr - 8, -(size as i64))?;
        space.put_i64(addr + size, -(size as i64))?;
        Ok(Self { addr })
    }

    /// View the block at `addr` as a free node, checking both tags
    pub(crate) fn checked(space: &AddressSpace, addr: u64, size: u64) -> Result<Self> {
        let expected = Tag::Free(size);
        if Tag::leading(space, addr)? != expected || Tag::read(space, addr + size)? != expected {
            return Err(HeapError::invalid_argument(format!(
                "free block at {} (size {}) has inconsistent boundary tags",
                addr, size
            )));
        }
        Ok(Self { addr })
    }

    /// Payload size taken from the leading tag
    pub(crate) fn size(&self, space: &AddressSpace) -> Result<u64> {
        match Tag::leading(space, self.addr)? {
            Tag::Free(size) => Ok(size),
            tag => Err(HeapError::invalid_argument(format!(
                "free-list node at {} is not marked free ({:?})",
                self.addr, tag
            ))),
        }
    }

    pub(crate) fn prev(&self, space: &AddressSpace) -> Result<FreeNode> {
        Ok(Self::at(space.get_u64(self.addr)?))
    }

    pub(crate) fn next(&self, space: &AddressSpace) -> Result<FreeNode> {
        Ok(Self::at(space.get_u64(self.addr + 8)?))
    }

    pub(crate) fn set_prev(&self, space: &mut AddressSpace, prev: FreeNode) -> Result<()> {
        space.put_u64(self.addr, prev.addr)
    }

    pub(crate) fn set_next(&self, space: &mut AddressSpace, next: FreeNode) -> Result<()> {
        space.put_u64(self.addr + 8, next.addr)
    }
}
