//! Free-List Allocator
//!
//! First-fit allocation with boundary-tag coalescing on free.

use std::collections::HashSet;
use std::path::Path;

use parking_lot::{Mutex, MutexGuard};

use crate::config::Config;
use crate::error::{HeapError, Result};
use crate::space::{align_up, AddressSpace};

use super::block::{is_aligned, next_block, prev_block, FreeNode, Tag, UsedBlock};
use super::list::{self, FreeNodes};
use super::{
    ALIGN, HEADER_SIZE, HEAP_TOP_FIELD, MAGIC, MIN_FRAGMENT, ROOT_FIELD, SENTINEL, TAG_OVERHEAD,
};

/// Largest payload a boundary tag can describe
const MAX_BLOCK_SIZE: u64 = (i64::MAX as u64) & !(ALIGN - 1);

/// Summary of a heap walk, produced by [`FreeListAllocator::verify`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapReport {
    /// First unused byte
    pub heap_top: u64,
    /// Number of allocated blocks
    pub used_blocks: u64,
    /// Payload bytes in allocated blocks
    pub used_bytes: u64,
    /// Number of free blocks (all of them on the free list)
    pub free_blocks: u64,
    /// Payload bytes in free blocks
    pub free_bytes: u64,
}

/// Heap with insert/delete/update over a memory-mapped file
///
/// ## Concurrency
/// Every operation runs under one allocator-wide lock, so the heap behaves
/// as a single sequential state machine. [`space()`](Self::space) hands out
/// that same lock; calling another allocator method while holding the guard
/// on the same thread deadlocks.
///
/// ## Failure
/// An error returned after a call started rewriting boundary tags (an I/O
/// failure while growing, for instance) leaves the heap inconsistent. There
/// is no rollback.
pub struct FreeListAllocator {
    space: Mutex<AddressSpace>,
}

impl FreeListAllocator {
    /// Open or create a heap file
    ///
    /// An empty file opened read-write is initialised with a fresh header.
    pub fn open(path: &Path, config: &Config) -> Result<Self> {
        let space = AddressSpace::open_with_config(path, None, config)?;
        Self::from_space(space)
    }

    /// Open with default config (convenience method)
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(path, &Config::default())
    }

    /// Build the allocator on an already mapped space
    pub fn from_space(mut space: AddressSpace) -> Result<Self> {
        if !space.is_readonly() && space.size() == 0 {
            space.grow(HEADER_SIZE)?;
            space.put_array::<u64>(0, &[MAGIC, 0, SENTINEL, SENTINEL, HEADER_SIZE, 0])?;
            tracing::debug!("Initialised free-list heap in {}", space.path().display());
        } else {
            Self::validate_header(&space)?;
        }

        Ok(Self {
            space: Mutex::new(space),
        })
    }

    /// Check magic value, sentinel links and heap top of an existing file
    fn validate_header(space: &AddressSpace) -> Result<()> {
        if space.size() < HEADER_SIZE {
            return Err(HeapError::invalid_argument(format!(
                "free-list heap {} is {} bytes, smaller than its header",
                space.path().display(),
                space.size()
            )));
        }

        let magic = space.get_u64(0)?;
        if magic != MAGIC {
            tracing::warn!(
                "Rejecting {}: bad free-list magic {:#018x}",
                space.path().display(),
                magic
            );
            return Err(HeapError::invalid_argument(format!(
                "invalid free-list heap magic: expected {:#018x}, got {:#018x}",
                MAGIC, magic
            )));
        }

        let heap_top = space.get_u64(HEAP_TOP_FIELD)?;
        if heap_top < HEADER_SIZE || heap_top > space.size() || !is_aligned(heap_top) {
            return Err(HeapError::invalid_argument(format!(
                "corrupt heap top {} (file size {})",
                heap_top,
                space.size()
            )));
        }

        let sentinel = FreeNode::SENTINEL;
        for link in [sentinel.prev(space)?, sentinel.next(space)?] {
            if !link.is_sentinel() && (link.addr < HEADER_SIZE || link.addr >= heap_top) {
                return Err(HeapError::invalid_argument(format!(
                    "corrupt free-list sentinel link {}",
                    link.addr
                )));
            }
        }

        Ok(())
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a block of at least `size` bytes and return its address
    ///
    /// The size is rounded up to a multiple of 16. A size of 0 allocates
    /// nothing and returns the null address 0.
    pub fn insert(&self, size: u64) -> Result<u64> {
        let size = align_size(size)?;
        if size == 0 {
            return Ok(0);
        }

        let mut space = self.space.lock();
        space.check_writable()?;
        let block = Self::insert_locked(&mut space, size)?;

        tracing::trace!("insert({}) -> {} (capacity {})", size, block.addr, block.size);
        Ok(block.addr)
    }

    /// Free the block at `address`; the null address is ignored
    pub fn delete(&self, address: u64) -> Result<()> {
        if address == 0 {
            return Ok(());
        }

        let mut space = self.space.lock();
        space.check_writable()?;
        let block = Self::region_locked(&space, address)?;
        Self::delete_locked(&mut space, block)?;

        tracing::trace!("delete({}) freed {} bytes", address, block.size);
        Ok(())
    }

    /// Resize the block at `address` to hold at least `size` bytes
    ///
    /// - `address == 0` allocates like [`insert`](Self::insert)
    /// - `size == 0` frees like [`delete`](Self::delete) and returns 0
    /// - a block that is already large enough is kept as is
    /// - otherwise the complete old payload moves to a new block and the old
    ///   block is freed
    ///
    /// Returns the (possibly new) address of the block.
    pub fn update(&self, address: u64, size: u64) -> Result<u64> {
        if address == 0 {
            return self.insert(size);
        }
        if size == 0 {
            self.delete(address)?;
            return Ok(0);
        }

        let new_size = align_size(size)?;
        let mut space = self.space.lock();
        space.check_writable()?;
        let old = Self::region_locked(&space, address)?;
        if new_size <= old.size {
            return Ok(address);
        }

        let new = Self::insert_locked(&mut space, new_size)?;
        space.copy(new.addr, old.addr, old.size)?;
        Self::delete_locked(&mut space, old)?;

        tracing::trace!("update({}, {}) moved block to {}", address, new_size, new.addr);
        Ok(new.addr)
    }

    /// Allocate a block of `size` bytes holding a copy of the block at
    /// `address` (truncated when `size` is smaller)
    pub fn clone_region(&self, address: u64, size: u64) -> Result<u64> {
        let new_size = align_size(size)?;
        let mut space = self.space.lock();
        space.check_writable()?;
        let old = Self::region_locked(&space, address)?;
        if new_size == 0 {
            return Ok(0);
        }

        let new = Self::insert_locked(&mut space, new_size)?;
        space.copy(new.addr, old.addr, old.size.min(new_size))?;
        Ok(new.addr)
    }

    /// Payload capacity of the used block at `address`
    pub fn region_size(&self, address: u64) -> Result<u64> {
        let space = self.space.lock();
        Ok(Self::region_locked(&space, address)?.size)
    }

    // =========================================================================
    // Payload Access
    // =========================================================================

    /// Read `target.len()` bytes at `offset` inside the block at `address`
    pub fn read_region(&self, address: u64, offset: u64, target: &mut [u8]) -> Result<()> {
        let space = self.space.lock();
        let block = Self::region_locked(&space, address)?;
        check_within(block, offset, target.len() as u64)?;
        space.get_bytes(address + offset, target)
    }

    /// Write `source` at `offset` inside the block at `address`
    pub fn write_region(&self, address: u64, offset: u64, source: &[u8]) -> Result<()> {
        let mut space = self.space.lock();
        space.check_writable()?;
        let block = Self::region_locked(&space, address)?;
        check_within(block, offset, source.len() as u64)?;
        space.put_bytes(address + offset, source)
    }

    /// Lock the heap and access its address space directly
    pub fn space(&self) -> MutexGuard<'_, AddressSpace> {
        self.space.lock()
    }

    // =========================================================================
    // Header Fields
    // =========================================================================

    /// Address of the root block (0 = none)
    pub fn get_root(&self) -> Result<u64> {
        self.space.lock().get_u64(ROOT_FIELD)
    }

    /// Record the address of the root block (0 = none)
    pub fn set_root(&self, address: u64) -> Result<()> {
        if address != 0 && (address < HEADER_SIZE || !is_aligned(address)) {
            return Err(HeapError::invalid_argument(format!(
                "root address {} is not a block address",
                address
            )));
        }
        let mut space = self.space.lock();
        space.check_writable()?;
        space.put_u64(ROOT_FIELD, address)
    }

    /// First unused byte of the heap
    pub fn heap_top(&self) -> Result<u64> {
        self.space.lock().get_u64(HEAP_TOP_FIELD)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Sizes of up to `limit` free blocks, in free-list order
    pub fn reuse_sizes(&self, limit: usize) -> Result<Vec<u64>> {
        let space = self.space.lock();
        let mut sizes = Vec::new();
        for node in FreeNodes::new(&space)?.take(limit) {
            sizes.push(node?.size(&space)?);
        }
        Ok(sizes)
    }

    /// Signed tags of up to `limit` blocks in address order (negative = free)
    pub fn region_sizes(&self, limit: usize) -> Result<Vec<i64>> {
        let space = self.space.lock();
        let heap_top = space.get_u64(HEAP_TOP_FIELD)?;
        let mut sizes = Vec::new();
        let mut addr = HEADER_SIZE;
        while addr < heap_top && sizes.len() < limit {
            let raw = space.get_i64(addr - 8)?;
            if raw == 0 {
                return Err(HeapError::invalid_argument(format!(
                    "zero tag at {} below heap top {}",
                    addr, heap_top
                )));
            }
            sizes.push(raw);
            addr = next_block(addr, raw.unsigned_abs());
        }
        Ok(sizes)
    }

    /// Walk every block and the free list, checking all heap invariants
    ///
    /// Fails with `InvalidArgument` on mismatched tags, gaps or overlaps,
    /// adjacent free blocks, or a free list that disagrees with the tags.
    pub fn verify(&self) -> Result<HeapReport> {
        let space = self.space.lock();
        let heap_top = space.get_u64(HEAP_TOP_FIELD)?;
        let mut report = HeapReport {
            heap_top,
            ..HeapReport::default()
        };

        let mut free = HashSet::new();
        let mut prev_free = false;
        let mut addr = HEADER_SIZE;
        while addr < heap_top {
            let (size, is_free) = match Tag::leading(&space, addr)? {
                Tag::Used(size) => (size, false),
                Tag::Free(size) => (size, true),
                Tag::End => {
                    return Err(HeapError::invalid_argument(format!(
                        "end tag at block {} below heap top {}",
                        addr, heap_top
                    )))
                }
            };
            if size == 0 || !is_aligned(size) || next_block(addr, size) > heap_top {
                return Err(HeapError::invalid_argument(format!(
                    "block at {} has invalid size {}",
                    addr, size
                )));
            }
            if Tag::read(&space, addr + size)? != Tag::leading(&space, addr)? {
                return Err(HeapError::invalid_argument(format!(
                    "block at {} has mismatched boundary tags",
                    addr
                )));
            }
            if is_free {
                if prev_free {
                    return Err(HeapError::invalid_argument(format!(
                        "free block at {} follows another free block",
                        addr
                    )));
                }
                free.insert(addr);
                report.free_blocks += 1;
                report.free_bytes += size;
            } else {
                report.used_blocks += 1;
                report.used_bytes += size;
            }
            prev_free = is_free;
            addr = next_block(addr, size);
        }
        if addr != heap_top || Tag::read(&space, heap_top - 8)? != Tag::End {
            return Err(HeapError::invalid_argument(format!(
                "heap walk ended at {} instead of heap top {}",
                addr, heap_top
            )));
        }

        let mut prev = FreeNode::SENTINEL;
        for node in FreeNodes::new(&space)? {
            let node = node?;
            if !free.remove(&node.addr) {
                return Err(HeapError::invalid_argument(format!(
                    "free-list node {} is not a free block",
                    node.addr
                )));
            }
            if node.prev(&space)? != prev {
                return Err(HeapError::invalid_argument(format!(
                    "free-list node {} has a broken back link",
                    node.addr
                )));
            }
            prev = node;
        }
        if FreeNode::SENTINEL.prev(&space)? != prev {
            return Err(HeapError::invalid_argument(
                "free-list sentinel has a broken back link".to_string(),
            ));
        }
        if let Some(missing) = free.iter().min() {
            return Err(HeapError::invalid_argument(format!(
                "free block at {} is missing from the free list",
                missing
            )));
        }

        Ok(report)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Flush the whole heap to disk
    pub fn force(&self) -> Result<()> {
        self.space.lock().force()
    }

    /// Close the heap gracefully, flushing pending writes
    pub fn close(self) -> Result<()> {
        let space = self.space.into_inner();
        space.force()?;
        tracing::debug!("Closed free-list heap {}", space.path().display());
        Ok(())
    }

    // =========================================================================
    // Private Helpers (called with the lock held)
    // =========================================================================

    /// Validate the used block at `addr` and return its view
    fn region_locked(space: &AddressSpace, addr: u64) -> Result<UsedBlock> {
        let heap_top = space.get_u64(HEAP_TOP_FIELD)?;
        if addr < HEADER_SIZE || addr >= heap_top || !is_aligned(addr) {
            return Err(HeapError::invalid_argument(format!(
                "address {} is not a block address (heap top {})",
                addr, heap_top
            )));
        }
        let size = match Tag::leading(space, addr)? {
            Tag::Used(size) => size,
            Tag::Free(_) => {
                return Err(HeapError::invalid_argument(format!(
                    "block at {} is already free",
                    addr
                )))
            }
            Tag::End => {
                return Err(HeapError::invalid_argument(format!(
                    "no block at {}",
                    addr
                )))
            }
        };
        if !is_aligned(size) || next_block(addr, size) > heap_top {
            return Err(HeapError::invalid_argument(format!(
                "block at {} has corrupt size tag {}",
                addr, size
            )));
        }
        if Tag::read(space, addr + size)? != Tag::Used(size) {
            return Err(HeapError::invalid_argument(format!(
                "block at {} has mismatched boundary tags",
                addr
            )));
        }
        Ok(UsedBlock { addr, size })
    }

    /// Take the first free block that fits, or carve a new one at the top
    fn insert_locked(space: &mut AddressSpace, size: u64) -> Result<UsedBlock> {
        match Self::reuse_locked(space, size)? {
            Some(block) => Ok(block),
            None => Self::create_locked(space, size),
        }
    }

    /// First-fit search in free-list order
    fn reuse_locked(space: &mut AddressSpace, size: u64) -> Result<Option<UsedBlock>> {
        let mut found = None;
        for node in FreeNodes::new(space)? {
            let node = node?;
            let capacity = node.size(space)?;
            if capacity >= size {
                found = Some((node, capacity));
                break;
            }
        }
        let Some((node, capacity)) = found else {
            return Ok(None);
        };

        let left = capacity - size;
        let used = if left < MIN_FRAGMENT {
            list::unlink(space, node)?;
            capacity
        } else {
            // Head becomes the allocation, tail stays free in node's place
            let tail = FreeNode::at(next_block(node.addr, size));
            list::replace(space, node, tail)?;
            FreeNode::write(space, tail.addr, left - TAG_OVERHEAD)?;
            size
        };
        UsedBlock::write(space, node.addr, used).map(Some)
    }

    /// Append a block at the heap top, growing the space as needed
    fn create_locked(space: &mut AddressSpace, size: u64) -> Result<UsedBlock> {
        let addr = space.get_u64(HEAP_TOP_FIELD)?;
        let top = addr
            .checked_add(size + TAG_OVERHEAD)
            .ok_or_else(|| HeapError::invalid_argument(format!("heap overflow at {}", addr)))?;
        space.grow(top)?;
        space.put_u64(HEAP_TOP_FIELD, top)?;
        space.put_i64(top - 8, 0)?;
        UsedBlock::write(space, addr, size)
    }

    /// Free `block`, merging it with free neighbours
    fn delete_locked(space: &mut AddressSpace, block: UsedBlock) -> Result<()> {
        let UsedBlock { addr, size } = block;
        let heap_top = space.get_u64(HEAP_TOP_FIELD)?;
        let prev = Tag::preceding(space, addr)?;
        let next = Tag::following(space, addr, size)?;

        if (next == Tag::End) != (next_block(addr, size) == heap_top) {
            return Err(HeapError::invalid_argument(format!(
                "end-of-heap tag disagrees with heap top {} at block {}",
                heap_top, addr
            )));
        }

        match (prev, next) {
            // Previous free, block at the top: both fall off the heap
            (Tag::Free(prev_size), Tag::End) => {
                let prev_addr = preceding_addr(addr, prev_size)?;
                let prev_node = FreeNode::checked(space, prev_addr, prev_size)?;
                list::unlink(space, prev_node)?;
                space.put_i64(prev_node.addr - 8, 0)?;
                space.put_u64(HEAP_TOP_FIELD, prev_node.addr)?;
            }
            // Previous and next free: one block, next leaves the list
            (Tag::Free(prev_size), Tag::Free(next_size)) => {
                let prev_addr = preceding_addr(addr, prev_size)?;
                let prev_node = FreeNode::checked(space, prev_addr, prev_size)?;
                let next_node = FreeNode::checked(space, next_block(addr, size), next_size)?;
                list::unlink(space, next_node)?;
                FreeNode::write(
                    space,
                    prev_node.addr,
                    prev_size + size + next_size + 2 * TAG_OVERHEAD,
                )?;
            }
            // Previous free, next used: grow the previous block
            (Tag::Free(prev_size), Tag::Used(_)) => {
                let prev_addr = preceding_addr(addr, prev_size)?;
                let prev_node = FreeNode::checked(space, prev_addr, prev_size)?;
                FreeNode::write(space, prev_node.addr, prev_size + size + TAG_OVERHEAD)?;
            }
            // Previous used, block at the top: lower the heap top
            (Tag::Used(_), Tag::End) => {
                space.put_i64(addr - 8, 0)?;
                space.put_u64(HEAP_TOP_FIELD, addr)?;
            }
            // Previous used, next free: absorb next and take its list slot
            (Tag::Used(_), Tag::Free(next_size)) => {
                let next_node = FreeNode::checked(space, next_block(addr, size), next_size)?;
                let node = FreeNode::at(addr);
                list::replace(space, next_node, node)?;
                FreeNode::write(space, addr, size + next_size + TAG_OVERHEAD)?;
            }
            // Both neighbours used: new node at the head of the list
            (Tag::Used(_), Tag::Used(_)) => {
                let node = FreeNode::write(space, addr, size)?;
                list::link_after(space, FreeNode::SENTINEL, node)?;
            }
            (Tag::End, _) => {
                return Err(HeapError::invalid_argument(format!(
                    "end-of-heap tag in front of block {}",
                    addr
                )));
            }
        }
        Ok(())
    }
}

/// Round a requested size up to the block alignment
fn align_size(size: u64) -> Result<u64> {
    match align_up(size, ALIGN) {
        Some(aligned) if aligned <= MAX_BLOCK_SIZE => Ok(aligned),
        _ => Err(HeapError::invalid_argument(format!(
            "block size {} exceeds the maximum of {}",
            size, MAX_BLOCK_SIZE
        ))),
    }
}

/// Address of the free block of `prev_size` bytes that ends before `addr`
fn preceding_addr(addr: u64, prev_size: u64) -> Result<u64> {
    match addr.checked_sub(prev_size + TAG_OVERHEAD) {
        Some(prev) if prev >= HEADER_SIZE => Ok(prev_block(addr, prev_size)),
        _ => Err(HeapError::invalid_argument(format!(
            "free block of {} bytes cannot precede block {}",
            prev_size, addr
        ))),
    }
}

/// `[offset, offset + len)` must lie inside the payload of `block`
fn check_within(block: UsedBlock, offset: u64, len: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= block.size => Ok(()),
        _ => Err(HeapError::invalid_argument(format!(
            "range [{}, +{}) outside block at {} of {} bytes",
            offset, len, block.addr, block.size
        ))),
    }
}
