//! Address Space Module
//!
//! A flat, randomly addressable 64-bit byte space over one growable file.
//!
//! ## Responsibilities
//! - Map the backing file through a sequence of fixed-stride windows
//! - Translate logical addresses into (window, offset) pairs
//! - Typed reads/writes in a configurable byte order
//! - Bulk copies that transparently cross window boundaries
//! - Grow-only resizing and best-effort flush to disk
//!
//! ## Window Layout
//! ```text
//!  logical:  0                 STRIDE              2*STRIDE            size
//!            ├───────────────────┼───────────────────┼──────────────────┤
//!  window 0: [═══════════════════╪═══]
//!  window 1:                     [═══════════════════╪═══]
//!  window 2:                                         [══════════════════]
//!                                 ↑ GUARD bytes mapped by both windows
//! ```
//!
//! Every window except the last maps `STRIDE + GUARD` bytes, so any value of
//! at most `GUARD` bytes that starts inside window `i` ends inside it too.
//! Only bulk transfers longer than `GUARD` need to be split per window.

mod address_space;
mod scalar;
mod window;

pub use address_space::AddressSpace;
pub use scalar::Scalar;

// =============================================================================
// Shared Constants
// =============================================================================

/// Bytes shared by two consecutive windows at their common boundary
pub const GUARD: u64 = 16 * 1024;

/// Production window stride (2^30 bytes)
pub const STRIDE: u64 = 1 << 30;

/// Round `value` up to the next multiple of `align` (a power of two).
/// Returns `None` on overflow.
pub(crate) fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}
