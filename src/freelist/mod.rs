//! Free-List Heap Module
//!
//! General-purpose allocator over an [`AddressSpace`](crate::space::AddressSpace):
//! blocks can be inserted, deleted and resized. Freed blocks are kept in a
//! doubly linked free list and coalesced with free neighbours.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (48 bytes)                                        │
//! │   [0,8)   Magic            [8,16)  Root address          │
//! │   [16,24) Sentinel prev    [24,32) Sentinel next         │
//! │   [32,40) Heap top         [40,48) First block's tag     │
//! ├──────────────────────────────────────────────────────────┤
//! │ Blocks [48, heap top)                                    │
//! │   [addr-8]  size tag  (negative = free)                  │
//! │   [addr..]  payload   (free: prev/next list pointers)    │
//! │   [addr+n]  mirrored size tag                            │
//! │   ... repeated ...                                       │
//! │   [top-8]   0 (end of heap)                              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The heap-top field sits where the trailing tag of a block before address
//! 48 would be. It is always positive, so the first block always sees a
//! "used" predecessor.

mod allocator;
mod block;
mod list;

pub use allocator::{FreeListAllocator, HeapReport};

// =============================================================================
// Shared Constants (used by allocator, block, list)
// =============================================================================

/// Magic value identifying a free-list heap file
pub(crate) const MAGIC: u64 = 0x474F_4F44_464F_4F44;

/// Header size, also the address of the first block
pub(crate) const HEADER_SIZE: u64 = 48;

/// Header field offsets
pub(crate) const ROOT_FIELD: u64 = 8;
pub(crate) const HEAP_TOP_FIELD: u64 = 32;

/// Address of the free-list sentinel node (its prev/next live at 16/24)
pub(crate) const SENTINEL: u64 = 16;

/// Block sizes and addresses are multiples of this
pub(crate) const ALIGN: u64 = 16;

/// Leading plus trailing boundary tag
pub(crate) const TAG_OVERHEAD: u64 = 16;

/// A split that would leave less than this stays with the allocation
pub(crate) const MIN_FRAGMENT: u64 = 32;
