//! # heapfile
//!
//! Persistent heaps inside memory-mapped files:
//! - A flat 64-bit address space over one growable file
//! - An append-only heap with content deduplication
//! - A free-list heap with boundary tags and coalescing
//!
//! ## Architecture Overview
//!
//! ```text
//!   ┌──────────────────────┐        ┌──────────────────────┐
//!   │   AppendAllocator    │        │  FreeListAllocator   │
//!   │ (open/close blocks,  │        │ (insert/delete/      │
//!   │  CRC-32 dedup index) │        │  update, free list)  │
//!   └──────────┬───────────┘        └──────────┬───────────┘
//!              │        Mutex<AddressSpace>    │
//!              └───────────────┬───────────────┘
//!                              ▼
//!                ┌──────────────────────────┐
//!                │       AddressSpace       │
//!                │ (typed access, windows,  │
//!                │  grow-only resize)       │
//!                └────────────┬─────────────┘
//!                             ▼
//!                ┌──────────────────────────┐
//!                │  mmap windows over file  │
//!                └──────────────────────────┘
//! ```
//!
//! Each allocator owns its address space; the two heaps never share a file.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod space;
pub mod append;
pub mod freelist;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{HeapError, Result};
pub use config::{ByteOrder, Config};
pub use space::AddressSpace;
pub use append::{AppendAllocator, BlockArray, BlockInfo, ElementWidth};
pub use freelist::{FreeListAllocator, HeapReport};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of heapfile
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
