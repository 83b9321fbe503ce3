//! Append Allocator
//!
//! Appends blocks at the end of the space, optionally sharing identical
//! blocks through the [`DedupIndex`].

use std::path::Path;

use bytes::Bytes;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::config::Config;
use crate::error::{HeapError, Result};
use crate::space::AddressSpace;

use super::array::{BlockArray, BlockInfo, ElementWidth};
use super::dedup::DedupIndex;
use super::{
    units_for, COUNT_FIELD, HEADER_SIZE, MAGIC, OVERSIZE_MASK, RECORD_SIZE, ROOT_FIELD, UNIT,
};

/// The block between `open_block` and `close_block`
#[derive(Debug, Clone, Copy)]
struct OpenBlock {
    reference: u32,
    units: u32,
}

/// Everything guarded by the allocator lock
struct AppendState {
    space: AddressSpace,
    /// Units in use, including the header; also the next reference
    block_count: u32,
    root: u32,
    open: Option<OpenBlock>,
    deduplicate: bool,
    index: DedupIndex,
}

/// Write-once heap over a memory-mapped file
///
/// ## Usage
/// ```no_run
/// # use heapfile::{AppendAllocator, Config};
/// # fn main() -> heapfile::Result<()> {
/// let heap = AppendAllocator::open(std::path::Path::new("tree.heap"), &Config::default())?;
/// let address = heap.open_block(7, 5)?;
/// heap.space().put_bytes(address, b"hello")?;
/// let reference = heap.close_block()?;
/// assert_eq!(&heap.payload(reference)?[..], b"hello");
/// # Ok(())
/// # }
/// ```
///
/// ## Concurrency
/// `open_block`/`close_block` and every other method run under one lock.
/// Only one block can be open at a time, across all threads.
pub struct AppendAllocator {
    state: Mutex<AppendState>,
}

impl AppendAllocator {
    /// Open or create an append heap file
    ///
    /// An empty file opened read-write gets a fresh header.
    pub fn open(path: &Path, config: &Config) -> Result<Self> {
        let space = AddressSpace::open_with_config(path, None, config)?;
        Self::from_space(space, config.deduplicate)
    }

    /// Open with default config (convenience method)
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(path, &Config::default())
    }

    /// Build the allocator on an already mapped space
    pub fn from_space(mut space: AddressSpace, deduplicate: bool) -> Result<Self> {
        if !space.is_readonly() && space.size() == 0 {
            space.grow(HEADER_SIZE)?;
            space.put_u32(0, MAGIC)?;
            space.put_u32(COUNT_FIELD, 1)?;
            space.put_u64(ROOT_FIELD, 0)?;
            tracing::debug!("Initialised append heap in {}", space.path().display());
        }

        let (block_count, root) = Self::validate_header(&space)?;
        let deduplicate = deduplicate && !space.is_readonly();

        Ok(Self {
            state: Mutex::new(AppendState {
                space,
                block_count,
                root,
                open: None,
                deduplicate,
                index: DedupIndex::new(),
            }),
        })
    }

    /// Check the header and return (block count, root)
    fn validate_header(space: &AddressSpace) -> Result<(u32, u32)> {
        if space.size() < HEADER_SIZE {
            return Err(HeapError::invalid_argument(format!(
                "append heap {} is {} bytes, smaller than its header",
                space.path().display(),
                space.size()
            )));
        }

        let magic = space.get_u32(0)?;
        if magic != MAGIC {
            tracing::warn!(
                "Rejecting {}: bad append-heap magic {:#010x}",
                space.path().display(),
                magic
            );
            return Err(HeapError::invalid_argument(format!(
                "invalid append heap magic: expected {:#010x}, got {:#010x}",
                MAGIC, magic
            )));
        }

        let block_count = space.get_u32(COUNT_FIELD)?;
        if block_count == 0 || block_count as u64 * UNIT > space.size() {
            return Err(HeapError::invalid_argument(format!(
                "corrupt block count {} (file size {})",
                block_count,
                space.size()
            )));
        }

        let root = space.get_u64(ROOT_FIELD)?;
        if root >= block_count as u64 {
            return Err(HeapError::invalid_argument(format!(
                "corrupt root reference {} (block count {})",
                root, block_count
            )));
        }

        Ok((block_count, root as u32))
    }

    // =========================================================================
    // Block Lifecycle
    // =========================================================================

    /// Reserve a block for `length` payload bytes and return the payload
    /// address
    ///
    /// The caller writes the payload through [`space()`](Self::space) and then
    /// calls [`close_block`](Self::close_block). Opening again before closing
    /// replaces the pending reservation. The reservation is shared by all
    /// threads; concurrent writers should use
    /// [`append_block`](Self::append_block).
    pub fn open_block(&self, kind: u32, length: u32) -> Result<u64> {
        let mut state = self.state.lock();
        Self::open_locked(&mut state, kind, length)
    }

    /// Commit the open block and return its reference
    ///
    /// With deduplication on, a block identical to an earlier one returns
    /// the earlier reference and its bytes are discarded (the next
    /// `open_block` reuses the space).
    pub fn close_block(&self) -> Result<u32> {
        let mut state = self.state.lock();
        Self::close_locked(&mut state)
    }

    /// Open, fill and close a block in one step
    pub fn append_block(&self, kind: u32, payload: &[u8]) -> Result<u32> {
        let length = u32::try_from(payload.len()).map_err(|_| {
            HeapError::invalid_argument(format!("block length {} is too large", payload.len()))
        })?;
        let mut state = self.state.lock();
        let address = Self::open_locked(&mut state, kind, length)?;
        state.space.put_bytes(address, payload)?;
        Self::close_locked(&mut state)
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Record of the committed block at `reference`
    pub fn block(&self, reference: u32) -> Result<BlockInfo> {
        let state = self.state.lock();
        Self::block_locked(&state, reference)
    }

    /// Copy of the payload of the block at `reference`
    pub fn payload(&self, reference: u32) -> Result<Bytes> {
        let state = self.state.lock();
        let info = Self::block_locked(&state, reference)?;
        let mut bytes = vec![0u8; info.length as usize];
        state.space.get_bytes(info.address, &mut bytes)?;
        Ok(Bytes::from(bytes))
    }

    /// Payload of the block at `reference` as an array of `width` elements
    ///
    /// Fails with `InvalidArgument` when the payload length is not a
    /// multiple of the element width.
    pub fn get_array(&self, reference: u32, width: ElementWidth) -> Result<BlockArray> {
        let state = self.state.lock();
        let info = Self::block_locked(&state, reference)?;
        if info.length as usize % width.bytes() != 0 {
            return Err(HeapError::invalid_argument(format!(
                "block {} has {} bytes, not a multiple of {:?}",
                reference, info.length, width
            )));
        }
        let mut bytes = vec![0u8; info.length as usize];
        state.space.get_bytes(info.address, &mut bytes)?;
        Ok(BlockArray::new(Bytes::from(bytes), width, state.space.order()))
    }

    /// Address of the block at `reference`
    pub fn address_of(reference: u32) -> u64 {
        reference as u64 * UNIT
    }

    /// Lock the heap and access its address space directly
    pub fn space(&self) -> MappedMutexGuard<'_, AddressSpace> {
        MutexGuard::map(self.state.lock(), |state| &mut state.space)
    }

    // =========================================================================
    // Header Fields and Settings
    // =========================================================================

    /// Reference of the root block (0 = none)
    pub fn get_root(&self) -> u32 {
        self.state.lock().root
    }

    /// Record the reference of the root block (0 = none)
    pub fn set_root(&self, reference: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.space.check_writable()?;
        if reference >= state.block_count {
            return Err(HeapError::invalid_argument(format!(
                "root reference {} beyond block count {}",
                reference, state.block_count
            )));
        }
        state.space.put_u64(ROOT_FIELD, reference as u64)?;
        state.root = reference;
        Ok(())
    }

    /// Units in use including the header (the next reference)
    pub fn block_count(&self) -> u32 {
        self.state.lock().block_count
    }

    pub fn is_deduplicating(&self) -> bool {
        self.state.lock().deduplicate
    }

    /// Turn deduplication on or off (always off for read-only heaps)
    ///
    /// Blocks committed while it is off are never shared later.
    pub fn set_deduplicating(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.deduplicate = enabled && !state.space.is_readonly();
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Flush the whole heap to disk
    pub fn force(&self) -> Result<()> {
        self.state.lock().space.force()
    }

    /// Close the heap gracefully, flushing pending writes
    ///
    /// A block that is still open is discarded.
    pub fn close(self) -> Result<()> {
        let state = self.state.into_inner();
        if state.open.is_some() {
            tracing::debug!("Discarding open block on close");
        }
        state.space.force()?;
        tracing::debug!(
            "Closed append heap {} ({} units, {} indexed blocks)",
            state.space.path().display(),
            state.block_count,
            state.index.len()
        );
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn open_locked(state: &mut AppendState, kind: u32, length: u32) -> Result<u64> {
        state.space.check_writable()?;
        if length & OVERSIZE_MASK != 0 {
            return Err(HeapError::invalid_argument(format!(
                "block length {} is too large",
                length
            )));
        }

        let reference = state.block_count;
        let units = units_for(length);
        if reference.checked_add(units).is_none() {
            return Err(HeapError::invalid_state(format!(
                "append heap is full ({} units used)",
                reference
            )));
        }

        let address = reference as u64 * UNIT;
        let end = address + units as u64 * UNIT;
        let payload = address + RECORD_SIZE;
        let space = &mut state.space;
        space.grow(end)?;
        space.put_u32(address, kind)?;
        space.put_u32(address + 4, length)?;
        let padding_start = payload + length as u64;
        space.fill(padding_start, end - padding_start, 0)?;

        state.open = Some(OpenBlock { reference, units });
        tracing::trace!("open_block(kind={}, length={}) at {}", kind, length, address);
        Ok(payload)
    }

    fn close_locked(state: &mut AppendState) -> Result<u32> {
        let open = state
            .open
            .take()
            .ok_or_else(|| HeapError::invalid_state("no block is open"))?;

        if state.deduplicate {
            let checksum = DedupIndex::checksum(&state.space, open.reference, open.units)?;
            if let Some(existing) =
                state
                    .index
                    .find(&state.space, checksum, open.reference, open.units)?
            {
                tracing::trace!("close_block() deduplicated to {}", existing);
                return Ok(existing);
            }
            state.index.insert(checksum, open.reference, open.units);
        }

        let block_count = open.reference + open.units;
        state.space.put_u32(COUNT_FIELD, block_count)?;
        state.block_count = block_count;

        tracing::trace!("close_block() committed {}", open.reference);
        Ok(open.reference)
    }

    fn block_locked(state: &AppendState, reference: u32) -> Result<BlockInfo> {
        if reference == 0 || reference >= state.block_count {
            return Err(HeapError::invalid_argument(format!(
                "reference {} outside committed blocks 1..{}",
                reference, state.block_count
            )));
        }
        let address = reference as u64 * UNIT;
        let kind = state.space.get_u32(address)?;
        let length = state.space.get_u32(address + 4)?;
        let end = reference as u64 + units_for(length) as u64;
        if length & OVERSIZE_MASK != 0 || end > state.block_count as u64 {
            return Err(HeapError::invalid_argument(format!(
                "block {} has corrupt length {}",
                reference, length
            )));
        }
        Ok(BlockInfo {
            reference,
            kind,
            length,
            address: address + RECORD_SIZE,
        })
    }
}
