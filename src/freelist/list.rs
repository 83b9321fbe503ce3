//! Intrusive doubly linked free list
//!
//! The list lives inside the mapped file: nodes are free blocks, links are
//! 64-bit addresses, and the sentinel at address 16 closes the ring. An empty
//! list is a sentinel that points at itself.

use crate::error::{HeapError, Result};
use crate::space::AddressSpace;

use super::block::{is_aligned, FreeNode};
use super::{HEADER_SIZE, HEAP_TOP_FIELD};

/// Link `node` directly after `anchor`
pub(crate) fn link_after(space: &mut AddressSpace, anchor: FreeNode, node: FreeNode) -> Result<()> {
    let next = anchor.next(space)?;
    node.set_prev(space, anchor)?;
    node.set_next(space, next)?;
    next.set_prev(space, node)?;
    anchor.set_next(space, node)
}

/// Remove `node` from the list
pub(crate) fn unlink(space: &mut AddressSpace, node: FreeNode) -> Result<()> {
    let prev = node.prev(space)?;
    let next = node.next(space)?;
    prev.set_next(space, next)?;
    next.set_prev(space, prev)
}

/// Put `new` at the list position of `old`
///
/// `new` may overlap the payload of `old`; both links are read first.
pub(crate) fn replace(space: &mut AddressSpace, old: FreeNode, new: FreeNode) -> Result<()> {
    let prev = old.prev(space)?;
    let next = old.next(space)?;
    new.set_prev(space, prev)?;
    new.set_next(space, next)?;
    prev.set_next(space, new)?;
    next.set_prev(space, new)
}

/// Walks the free list in link order, starting after the sentinel
///
/// Every link is checked to stay inside the heap, and the walk is bounded by
/// the number of blocks the heap can hold, so a corrupt ring surfaces as
/// `InvalidArgument` instead of an endless loop.
pub(crate) struct FreeNodes<'a> {
    space: &'a AddressSpace,
    current: FreeNode,
    heap_top: u64,
    budget: u64,
    failed: bool,
}

impl<'a> FreeNodes<'a> {
    pub(crate) fn new(space: &'a AddressSpace) -> Result<Self> {
        let heap_top = space.get_u64(HEAP_TOP_FIELD)?;
        Ok(Self {
            space,
            current: FreeNode::SENTINEL,
            heap_top,
            // Smallest block is 16 bytes of payload plus 16 bytes of tags
            budget: heap_top.saturating_sub(HEADER_SIZE) / 32 + 1,
            failed: false,
        })
    }

    fn advance(&mut self) -> Result<Option<FreeNode>> {
        let next = self.current.next(self.space)?;
        if next.is_sentinel() {
            return Ok(None);
        }
        if next.addr < HEADER_SIZE || next.addr >= self.heap_top || !is_aligned(next.addr) {
            return Err(HeapError::invalid_argument(format!(
                "free-list link {} -> {} points outside the heap",
                self.current.addr, next.addr
            )));
        }
        if self.budget == 0 {
            return Err(HeapError::invalid_argument(
                "free list does not return to its sentinel".to_string(),
            ));
        }
        self.budget -= 1;
        self.current = next;
        Ok(Some(next))
    }
}

impl<'a> Iterator for FreeNodes<'a> {
    type Item = Result<FreeNode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(node) => node.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
