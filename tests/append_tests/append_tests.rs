//! Tests for AppendAllocator
//!
//! These tests verify:
//! - Header creation and validation
//! - The open_block/close_block protocol and its errors
//! - Content deduplication (on, off, and across equal checksums)
//! - Payload and array decoding
//! - Root reference handling and persistence

use std::path::{Path, PathBuf};

use heapfile::{AppendAllocator, ByteOrder, Config, ElementWidth, HeapError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_heap() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("append.heap");
    (temp_dir, path)
}

fn config() -> Config {
    Config::builder().window_shift(16).grow_step(4096).build()
}

fn open_heap(path: &Path) -> AppendAllocator {
    AppendAllocator::open(path, &config()).unwrap()
}

/// Append one block with the given payload and return its reference
fn append(heap: &AppendAllocator, kind: u32, payload: &[u8]) -> u32 {
    let address = heap.open_block(kind, payload.len() as u32).unwrap();
    heap.space().put_bytes(address, payload).unwrap();
    heap.close_block().unwrap()
}

// =============================================================================
// Open Tests
// =============================================================================

#[test]
fn test_open_initialises_header() {
    let (_temp, path) = setup_temp_heap();

    let heap = open_heap(&path);

    assert_eq!(heap.block_count(), 1);
    assert_eq!(heap.get_root(), 0);
    assert!(heap.is_deduplicating());

    let space = heap.space();
    assert_eq!(space.get_u32(0).unwrap(), 0xABAD_1DEA);
    assert_eq!(space.get_u32(4).unwrap(), 1);
    assert_eq!(space.get_u64(8).unwrap(), 0);
}

#[test]
fn test_open_bad_magic_leaves_file_unchanged() {
    let (_temp, path) = setup_temp_heap();
    let garbage: Vec<u8> = (0..64u8).collect();
    std::fs::write(&path, &garbage).unwrap();

    let result = AppendAllocator::open(&path, &config());

    assert!(matches!(result, Err(HeapError::InvalidArgument(_))));
    assert_eq!(std::fs::read(&path).unwrap(), garbage);
}

#[test]
fn test_open_truncated_file() {
    let (_temp, path) = setup_temp_heap();
    std::fs::write(&path, [0xEAu8, 0x1D, 0xAD, 0xAB]).unwrap();

    let result = AppendAllocator::open(&path, &config());

    assert!(matches!(result, Err(HeapError::InvalidArgument(_))));
}

#[test]
fn test_open_corrupt_block_count() {
    let (_temp, path) = setup_temp_heap();
    {
        let heap = open_heap(&path);
        append(&heap, 1, b"abc");
        heap.space().put_u32(4, 1 << 20).unwrap();
        heap.close().unwrap();
    }

    let result = AppendAllocator::open(&path, &config());

    assert!(matches!(result, Err(HeapError::InvalidArgument(_))));
}

#[test]
fn test_open_readonly_empty_file() {
    let (_temp, path) = setup_temp_heap();
    std::fs::write(&path, b"").unwrap();
    let config = Config::builder().readonly(true).build();

    let result = AppendAllocator::open(&path, &config);

    assert!(matches!(result, Err(HeapError::InvalidArgument(_))));
}

// =============================================================================
// Block Lifecycle Tests
// =============================================================================

#[test]
fn test_append_and_read_back() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);

    let a = append(&heap, 7, b"hello");
    let b = append(&heap, 8, b"a somewhat longer payload!");

    assert_eq!(a, 1);
    // 8-byte record + 5 bytes fits one unit
    assert_eq!(b, 2);
    // 8 + 26 bytes needs three units
    assert_eq!(heap.block_count(), 5);

    let info = heap.block(b).unwrap();
    assert_eq!(info.reference, b);
    assert_eq!(info.kind, 8);
    assert_eq!(info.length, 26);
    assert_eq!(info.address, 2 * 16 + 8);
    assert_eq!(AppendAllocator::address_of(b), 32);

    assert_eq!(&heap.payload(a).unwrap()[..], b"hello");
    assert_eq!(&heap.payload(b).unwrap()[..], b"a somewhat longer payload!");
}

#[test]
fn test_empty_payload() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);

    let reference = append(&heap, 3, b"");

    assert_eq!(heap.block_count(), reference + 1);
    assert!(heap.payload(reference).unwrap().is_empty());
}

#[test]
fn test_padding_is_zeroed() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);

    let reference = append(&heap, 1, b"xyz");

    let space = heap.space();
    let mut unit = [0xFFu8; 16];
    space.get_bytes(reference as u64 * 16, &mut unit).unwrap();
    assert_eq!(&unit[8..11], b"xyz");
    assert!(unit[11..].iter().all(|&b| b == 0));
}

#[test]
fn test_append_block_in_one_step() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);

    let a = heap.append_block(4, b"one step").unwrap();
    let b = append(&heap, 4, b"one step");

    assert_eq!(a, b);
    assert_eq!(&heap.payload(a).unwrap()[..], b"one step");
    assert!(matches!(heap.close_block(), Err(HeapError::InvalidState(_))));
}

#[test]
fn test_close_without_open() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);

    assert!(matches!(heap.close_block(), Err(HeapError::InvalidState(_))));

    append(&heap, 1, b"x");
    assert!(matches!(heap.close_block(), Err(HeapError::InvalidState(_))));
}

#[test]
fn test_reopen_block_replaces_reservation() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);

    heap.open_block(1, 100).unwrap();
    let address = heap.open_block(2, 4).unwrap();
    heap.space().put_bytes(address, b"last").unwrap();
    let reference = heap.close_block().unwrap();

    assert_eq!(reference, 1);
    assert_eq!(heap.block(reference).unwrap().kind, 2);
    assert_eq!(heap.block_count(), 2);
}

#[test]
fn test_open_block_oversized() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);

    assert!(matches!(
        heap.open_block(1, 0x4000_0000),
        Err(HeapError::InvalidArgument(_))
    ));
    assert!(matches!(
        heap.open_block(1, u32::MAX),
        Err(HeapError::InvalidArgument(_))
    ));
    assert_eq!(heap.block_count(), 1);
}

#[test]
fn test_readonly_open_block() {
    let (_temp, path) = setup_temp_heap();
    {
        let heap = open_heap(&path);
        append(&heap, 1, b"data");
        heap.close().unwrap();
    }
    let config = Config::builder().readonly(true).build();

    let heap = AppendAllocator::open(&path, &config).unwrap();

    assert!(matches!(heap.open_block(1, 4), Err(HeapError::InvalidState(_))));
    assert!(matches!(heap.set_root(1), Err(HeapError::InvalidState(_))));
    assert!(!heap.is_deduplicating());
    heap.set_deduplicating(true);
    assert!(!heap.is_deduplicating());
    assert_eq!(&heap.payload(1).unwrap()[..], b"data");
}

#[test]
fn test_invalid_references() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);
    let reference = append(&heap, 1, b"0123456789abcdef");

    assert!(matches!(heap.block(0), Err(HeapError::InvalidArgument(_))));
    assert!(matches!(
        heap.block(heap.block_count()),
        Err(HeapError::InvalidArgument(_))
    ));
    assert!(heap.payload(reference).is_ok());
}

// =============================================================================
// Deduplication Tests
// =============================================================================

#[test]
fn test_dedup_returns_same_reference() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);

    let first = append(&heap, 5, b"shared payload");
    let count = heap.block_count();
    let second = append(&heap, 5, b"shared payload");

    assert_eq!(first, second);
    assert_eq!(heap.block_count(), count);
}

#[test]
fn test_dedup_discarded_space_is_reused() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);

    let first = append(&heap, 5, b"same");
    append(&heap, 5, b"same");
    let next = append(&heap, 5, b"different");

    assert_eq!(first, 1);
    assert_eq!(next, 2);
    assert_eq!(&heap.payload(next).unwrap()[..], b"different");
    assert_eq!(&heap.payload(first).unwrap()[..], b"same");
}

#[test]
fn test_dedup_distinguishes_kind_and_length() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);

    let a = append(&heap, 1, b"abc");
    let b = append(&heap, 2, b"abc");
    let c = append(&heap, 1, b"abc\0");

    assert_ne!(a, b);
    assert_ne!(a, c);
    assert_ne!(b, c);
}

#[test]
fn test_dedup_disabled() {
    let (_temp, path) = setup_temp_heap();
    let config = Config::builder().deduplicate(false).build();
    let heap = AppendAllocator::open(&path, &config).unwrap();

    let first = append(&heap, 5, b"payload");
    let second = append(&heap, 5, b"payload");

    assert!(!heap.is_deduplicating());
    assert_ne!(first, second);
}

#[test]
fn test_dedup_toggle() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);

    heap.set_deduplicating(false);
    let unindexed = append(&heap, 1, b"toggle");
    heap.set_deduplicating(true);
    let indexed = append(&heap, 1, b"toggle");
    let again = append(&heap, 1, b"toggle");

    // Blocks committed without the index are never shared later
    assert_ne!(unindexed, indexed);
    assert_eq!(indexed, again);
}

#[test]
fn test_dedup_is_session_local() {
    let (_temp, path) = setup_temp_heap();
    let first = {
        let heap = open_heap(&path);
        let reference = append(&heap, 1, b"across sessions");
        heap.close().unwrap();
        reference
    };

    let heap = open_heap(&path);
    let second = append(&heap, 1, b"across sessions");

    assert_ne!(first, second);
}

#[test]
fn test_dedup_large_blocks() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);
    let big: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    let mut other = big.clone();
    other[99_999] ^= 1;

    let a = append(&heap, 9, &big);
    let b = append(&heap, 9, &other);
    let c = append(&heap, 9, &big);

    assert_ne!(a, b);
    assert_eq!(a, c);
    assert_eq!(heap.payload(b).unwrap().len(), 100_000);
}

// =============================================================================
// Array Tests
// =============================================================================

#[test]
fn test_get_array_decodes_signed_values() {
    let (_temp, path) = setup_temp_heap();
    let config = Config::builder().byte_order(ByteOrder::BigEndian).build();
    let heap = AppendAllocator::open(&path, &config).unwrap();

    let address = heap.open_block(4, 12).unwrap();
    heap.space().put_array::<i32>(address, &[1, -2, i32::MAX]).unwrap();
    let reference = heap.close_block().unwrap();

    let array = heap.get_array(reference, ElementWidth::Int32).unwrap();
    assert_eq!(array.len(), 3);
    assert_eq!(array.iter().collect::<Vec<_>>(), vec![1, -2, i32::MAX as i64]);

    let halves = heap.get_array(reference, ElementWidth::Int16).unwrap();
    assert_eq!(halves.len(), 6);
    assert_eq!(halves.get(3), Some(-2));

    let bytes = heap.get_array(reference, ElementWidth::Int8).unwrap();
    assert_eq!(bytes.get(3), Some(1));
}

#[test]
fn test_get_array_width_mismatch() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);
    let reference = append(&heap, 1, &[0u8; 12]);

    assert!(matches!(
        heap.get_array(reference, ElementWidth::Int64),
        Err(HeapError::InvalidArgument(_))
    ));
    assert_eq!(heap.get_array(reference, ElementWidth::Int32).unwrap().len(), 3);
}

// =============================================================================
// Root and Persistence Tests
// =============================================================================

#[test]
fn test_set_root_validation() {
    let (_temp, path) = setup_temp_heap();
    let heap = open_heap(&path);
    let reference = append(&heap, 1, b"root");

    assert!(matches!(
        heap.set_root(heap.block_count()),
        Err(HeapError::InvalidArgument(_))
    ));
    heap.set_root(reference).unwrap();
    assert_eq!(heap.get_root(), reference);
    heap.set_root(0).unwrap();
    assert_eq!(heap.get_root(), 0);
}

#[test]
fn test_reopen_persists_blocks_and_root() {
    let (_temp, path) = setup_temp_heap();
    let (a, b) = {
        let heap = open_heap(&path);
        let a = append(&heap, 1, b"first");
        let b = append(&heap, 2, b"second block");
        heap.set_root(b).unwrap();
        heap.close().unwrap();
        (a, b)
    };

    let heap = open_heap(&path);

    assert_eq!(heap.get_root(), b);
    assert_eq!(&heap.payload(a).unwrap()[..], b"first");
    assert_eq!(heap.block(b).unwrap().kind, 2);

    // Appending continues after the last committed block
    let c = append(&heap, 3, b"third");
    assert!(c > b);
}

#[test]
fn test_uncommitted_block_is_not_persisted() {
    let (_temp, path) = setup_temp_heap();
    {
        let heap = open_heap(&path);
        append(&heap, 1, b"kept");
        heap.open_block(1, 32).unwrap();
        heap.close().unwrap();
    }

    let heap = open_heap(&path);

    assert_eq!(heap.block_count(), 2);
    assert!(matches!(heap.block(2), Err(HeapError::InvalidArgument(_))));
}
