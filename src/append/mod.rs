//! Append Heap Module
//!
//! Write-once, grow-only allocator over an
//! [`AddressSpace`](crate::space::AddressSpace). Blocks are appended at the
//! end of the space and, when deduplication is on, identical blocks share
//! one reference.
//!
//! ## Block Lifecycle
//! ```text
//!   NONE ──open_block()──▶ OPEN ──close_block()──▶ COMMITTED
//!                           │ ▲
//!                           └─┘ open_block() again replaces the reservation
//! ```
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (16 bytes = unit 0)                              │
//! │   Magic: u32 (4) | BlockCount: u32 (4) | Root: u64 (8)  │
//! ├─────────────────────────────────────────────────────────┤
//! │ Block at reference r (address 16 * r)                   │
//! │   Kind: u32 (4) | Length: u32 (4) | Payload | Zero pad  │
//! │   ... padded to a multiple of 16 bytes ...              │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! `BlockCount` counts 16-byte units including the header, so it is also the
//! reference the next block will get.

mod allocator;
mod array;
mod dedup;

pub use allocator::AppendAllocator;
pub use array::{BlockArray, BlockInfo, ElementWidth};

// =============================================================================
// Shared Constants
// =============================================================================

/// Magic value identifying an append heap file
pub(crate) const MAGIC: u32 = 0xABAD_1DEA;

/// Header size (one unit)
pub(crate) const HEADER_SIZE: u64 = 16;

/// Header field offsets
pub(crate) const COUNT_FIELD: u64 = 4;
pub(crate) const ROOT_FIELD: u64 = 8;

/// Allocation granularity; a reference is an address divided by this
pub(crate) const UNIT: u64 = 16;

/// Kind + length record in front of every payload
pub(crate) const RECORD_SIZE: u64 = 8;

/// Payload lengths with either of these bits set are rejected
pub(crate) const OVERSIZE_MASK: u32 = 0xC000_0000;

/// Units occupied by a block with a payload of `length` bytes
pub(crate) fn units_for(length: u32) -> u32 {
    // length < 2^30, so this cannot overflow
    ((length as u64 + RECORD_SIZE + UNIT - 1) / UNIT) as u32
}
