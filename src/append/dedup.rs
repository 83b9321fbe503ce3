//! Content index for block deduplication
//!
//! Maps the CRC-32 of a block's full unit span to every committed block with
//! that checksum. A checksum hit is only a candidate: blocks are compared
//! byte for byte before a reference is shared.

use std::collections::HashMap;

use crate::error::Result;
use crate::space::AddressSpace;

use super::UNIT;

/// Bytes hashed/compared per step
const CHUNK: usize = 4096;

/// A committed block known to the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    reference: u32,
    units: u32,
}

/// In-memory, session-local content index
#[derive(Debug, Default)]
pub(crate) struct DedupIndex {
    entries: HashMap<u32, Vec<Entry>>,
}

impl DedupIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// CRC-32 over the `units` units starting at `reference`
    pub(crate) fn checksum(space: &AddressSpace, reference: u32, units: u32) -> Result<u32> {
        let mut hasher = crc32fast::Hasher::new();
        let mut buffer = [0u8; CHUNK];
        let start = reference as u64 * UNIT;
        let total = units as u64 * UNIT;
        let mut done = 0;
        while done < total {
            let n = (total - done).min(CHUNK as u64) as usize;
            space.get_bytes(start + done, &mut buffer[..n])?;
            hasher.update(&buffer[..n]);
            done += n as u64;
        }
        Ok(hasher.finalize())
    }

    /// Reference of a committed block whose bytes equal the candidate's
    pub(crate) fn find(
        &self,
        space: &AddressSpace,
        checksum: u32,
        reference: u32,
        units: u32,
    ) -> Result<Option<u32>> {
        let Some(entries) = self.entries.get(&checksum) else {
            return Ok(None);
        };
        for entry in entries {
            if entry.units == units && same_content(space, entry.reference, reference, units)? {
                return Ok(Some(entry.reference));
            }
        }
        Ok(None)
    }

    /// Remember a newly committed block
    pub(crate) fn insert(&mut self, checksum: u32, reference: u32, units: u32) {
        self.entries
            .entry(checksum)
            .or_default()
            .push(Entry { reference, units });
    }

    /// Number of indexed blocks
    pub(crate) fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// Byte-for-byte comparison of two unit spans
fn same_content(space: &AddressSpace, left: u32, right: u32, units: u32) -> Result<bool> {
    if left == right {
        return Ok(true);
    }
    let mut a = [0u8; CHUNK];
    let mut b = [0u8; CHUNK];
    let (left, right) = (left as u64 * UNIT, right as u64 * UNIT);
    let total = units as u64 * UNIT;
    let mut done = 0;
    while done < total {
        let n = (total - done).min(CHUNK as u64) as usize;
        space.get_bytes(left + done, &mut a[..n])?;
        space.get_bytes(right + done, &mut b[..n])?;
        if a[..n] != b[..n] {
            return Ok(false);
        }
        done += n as u64;
    }
    Ok(true)
}
