//! Window
//!
//! One native memory mapping over a slice of the backing file.

use std::fs::File;
use std::io;

use memmap2::{Mmap, MmapMut, MmapOptions};

/// A single mapping, read-only or read-write depending on the space
pub(crate) enum Window {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Window {
    /// Map `len` bytes of `file` starting at `offset` (page aligned)
    pub(crate) fn map(file: &File, offset: u64, len: usize, readonly: bool) -> io::Result<Self> {
        let mut options = MmapOptions::new();
        options.offset(offset).len(len);

        // SAFETY: the file stays open for the lifetime of the space and is
        // never truncated by this process. Concurrent modification by other
        // processes is unsupported.
        let window = if readonly {
            Window::ReadOnly(unsafe { options.map(file)? })
        } else {
            Window::ReadWrite(unsafe { options.map_mut(file)? })
        };
        Ok(window)
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes().len()
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            Window::ReadOnly(map) => &map[..],
            Window::ReadWrite(map) => &map[..],
        }
    }

    /// Writable view, `None` for read-only windows
    pub(crate) fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Window::ReadOnly(_) => None,
            Window::ReadWrite(map) => Some(&mut map[..]),
        }
    }

    /// Synchronously flush `len` bytes at `offset` (no-op when read-only)
    pub(crate) fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match self {
            Window::ReadOnly(_) => Ok(()),
            Window::ReadWrite(map) => map.flush_range(offset, len),
        }
    }

    pub(crate) fn flush(&self) -> io::Result<()> {
        match self {
            Window::ReadOnly(_) => Ok(()),
            Window::ReadWrite(map) => map.flush(),
        }
    }
}
