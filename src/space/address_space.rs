//! Address Space
//!
//! Maps a growable file as a flat byte space addressed by `u64`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{ByteOrder, Config};
use crate::error::{HeapError, Result};

use super::window::Window;
use super::{align_up, Scalar, GUARD};

/// Scratch buffer size for in-space copies
const COPY_CHUNK: usize = 64 * 1024;

/// A contiguous part of a transfer that lies inside one window
#[derive(Debug, Clone, Copy)]
struct Span {
    window: usize,
    offset: usize,
    len: usize,
}

/// A flat 64-bit byte space over one memory-mapped file
///
/// ## Addressing
/// `window = address >> shift`, `offset = address & (stride - 1)`. Windows
/// overlap by [`GUARD`] bytes, so scalar accesses never straddle two
/// mappings.
///
/// ## Concurrency
/// Reads take `&self`, writes and remapping take `&mut self`. The space has
/// no lock of its own; the allocators wrap it in their mutex.
pub struct AddressSpace {
    /// Backing file (kept open for remapping)
    file: File,
    /// Absolute path of the backing file
    path: PathBuf,
    readonly: bool,
    order: ByteOrder,
    /// log2 of the window stride
    shift: u32,
    /// Growth granularity of `grow()`
    grow_step: u64,
    /// Logical size in bytes
    size: u64,
    /// Mappings, ordered by address; never removed
    windows: Vec<Window>,
}

impl AddressSpace {
    /// Map the first `size` bytes of `path` with default settings
    ///
    /// In read-write mode the file is created if missing and extended when it
    /// is shorter than `size`.
    pub fn open(path: &Path, size: u64, readonly: bool) -> Result<Self> {
        let config = Config::builder().readonly(readonly).build();
        Self::open_with_config(path, Some(size), &config)
    }

    /// Map `path` using `config`
    ///
    /// `size = None` maps the current length of the file.
    pub fn open_with_config(path: &Path, size: Option<u64>, config: &Config) -> Result<Self> {
        config.validate()?;

        let file = if config.readonly {
            File::open(path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?
        };

        let file_len = file.metadata()?.len();
        let size = size.unwrap_or(file_len);
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        let mut space = Self {
            file,
            path,
            readonly: config.readonly,
            order: config.byte_order,
            shift: config.window_shift,
            grow_step: config.grow_step,
            size: 0,
            windows: Vec::new(),
        };
        space.resize(size)?;

        tracing::debug!(
            "Opened address space {} (size={}, windows={}, readonly={})",
            space.path.display(),
            space.size,
            space.windows.len(),
            space.readonly
        );

        Ok(space)
    }

    // =========================================================================
    // Geometry
    // =========================================================================

    /// Logical size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Window stride in bytes
    pub fn stride(&self) -> u64 {
        1 << self.shift
    }

    /// Number of mapped windows
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Change the byte order of all subsequent typed accesses
    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    /// Fail with `InvalidState` unless the space is writable
    pub fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(HeapError::invalid_state(format!(
                "address space {} is read-only",
                self.path.display()
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Resizing
    // =========================================================================

    /// Grow the mapped region to exactly `new_size` bytes
    ///
    /// Windows whose physical length changes are remapped in place; all other
    /// windows are left untouched. A failure part way leaves the space
    /// unusable.
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        if new_size < self.size {
            return Err(HeapError::invalid_argument(format!(
                "cannot shrink address space from {} to {} bytes",
                self.size, new_size
            )));
        }
        if new_size == self.size {
            return Ok(());
        }

        let file_len = self.file.metadata()?.len();
        if file_len < new_size {
            if self.readonly {
                return Err(HeapError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "read-only file {} has {} bytes, {} requested",
                        self.path.display(),
                        file_len,
                        new_size
                    ),
                )));
            }
            self.file.set_len(new_size)?;
        }

        let stride = self.stride();
        let count = usize::try_from(((new_size - 1) >> self.shift) + 1).map_err(|_| {
            HeapError::invalid_argument(format!("address space size {} too large", new_size))
        })?;

        for index in 0..count {
            let offset = index as u64 * stride;
            let len = (stride + GUARD).min(new_size - offset) as usize;
            if index < self.windows.len() {
                if self.windows[index].len() != len {
                    self.windows[index] = Window::map(&self.file, offset, len, self.readonly)?;
                }
            } else {
                self.windows.push(Window::map(&self.file, offset, len, self.readonly)?);
            }
        }

        tracing::debug!(
            "Resized address space {} from {} to {} bytes ({} windows)",
            self.path.display(),
            self.size,
            new_size,
            self.windows.len()
        );

        self.size = new_size;
        Ok(())
    }

    /// Ensure at least `min_size` bytes are mapped
    ///
    /// Rounds up to the configured grow step to amortize remapping.
    pub fn grow(&mut self, min_size: u64) -> Result<()> {
        if min_size <= self.size {
            return Ok(());
        }
        let target = align_up(min_size, self.grow_step).ok_or_else(|| {
            HeapError::invalid_argument(format!("cannot grow address space to {} bytes", min_size))
        })?;
        self.resize(target)
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    /// Flush every window to disk
    pub fn force(&self) -> Result<()> {
        for window in &self.windows {
            window.flush()?;
        }
        Ok(())
    }

    /// Flush the bytes in `[start, end)` to disk
    pub fn force_range(&self, start: u64, end: u64) -> Result<()> {
        if end < start {
            return Err(HeapError::invalid_argument(format!(
                "invalid flush range [{}, {})",
                start, end
            )));
        }
        let total = self.transfer_len(start, end - start)?;
        self.check_range(start, total)?;

        let mut address = start;
        let mut done = 0;
        while done < total {
            let span = self.span(address, total - done, 1);
            self.windows[span.window].flush_range(span.offset, span.len)?;
            done += span.len;
            address += span.len as u64;
        }
        Ok(())
    }

    // =========================================================================
    // Scalar Access
    // =========================================================================

    /// Read a fixed-width value at `address`
    pub fn get<T: Scalar>(&self, address: u64) -> Result<T> {
        self.check_range(address, T::SIZE)?;
        let span = self.span(address, T::SIZE, T::SIZE);
        let bytes = &self.windows[span.window].bytes()[span.offset..span.offset + T::SIZE];
        Ok(T::decode(bytes, self.order))
    }

    /// Write a fixed-width value at `address`
    pub fn put<T: Scalar>(&mut self, address: u64, value: T) -> Result<()> {
        self.check_writable()?;
        self.check_range(address, T::SIZE)?;
        let span = self.span(address, T::SIZE, T::SIZE);
        let order = self.order;
        let bytes = self.window_mut(span.window)?;
        value.encode(&mut bytes[span.offset..span.offset + T::SIZE], order);
        Ok(())
    }

    // =========================================================================
    // Bulk Access
    // =========================================================================

    /// Read `target.len()` bytes starting at `address`
    pub fn get_bytes(&self, address: u64, target: &mut [u8]) -> Result<()> {
        self.check_range(address, target.len())?;
        let mut address = address;
        let mut done = 0;
        while done < target.len() {
            let span = self.span(address, target.len() - done, 1);
            let source = &self.windows[span.window].bytes()[span.offset..span.offset + span.len];
            target[done..done + span.len].copy_from_slice(source);
            done += span.len;
            address += span.len as u64;
        }
        Ok(())
    }

    /// Write `source` starting at `address`
    pub fn put_bytes(&mut self, address: u64, source: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.check_range(address, source.len())?;
        let mut address = address;
        let mut done = 0;
        while done < source.len() {
            let span = self.span(address, source.len() - done, 1);
            let target = self.window_mut(span.window)?;
            target[span.offset..span.offset + span.len]
                .copy_from_slice(&source[done..done + span.len]);
            done += span.len;
            address += span.len as u64;
        }
        Ok(())
    }

    /// Read consecutive values starting at `address` into `target`
    ///
    /// Runs of at most [`GUARD`] bytes are served by a single window; longer
    /// runs are split into one sub-copy per window.
    pub fn get_array<T: Scalar>(&self, address: u64, target: &mut [T]) -> Result<()> {
        let total = target.len() * T::SIZE;
        self.check_range(address, total)?;
        let order = self.order;
        let mut address = address;
        let mut done = 0;
        while done < total {
            let span = self.span(address, total - done, T::SIZE);
            let source = &self.windows[span.window].bytes()[span.offset..span.offset + span.len];
            let first = done / T::SIZE;
            for (slot, chunk) in target[first..].iter_mut().zip(source.chunks_exact(T::SIZE)) {
                *slot = T::decode(chunk, order);
            }
            done += span.len;
            address += span.len as u64;
        }
        Ok(())
    }

    /// Write consecutive values from `source` starting at `address`
    pub fn put_array<T: Scalar>(&mut self, address: u64, source: &[T]) -> Result<()> {
        self.check_writable()?;
        let total = source.len() * T::SIZE;
        self.check_range(address, total)?;
        let order = self.order;
        let mut address = address;
        let mut done = 0;
        while done < total {
            let span = self.span(address, total - done, T::SIZE);
            let first = done / T::SIZE;
            let target = self.window_mut(span.window)?;
            let target = &mut target[span.offset..span.offset + span.len];
            for (chunk, value) in target.chunks_exact_mut(T::SIZE).zip(&source[first..]) {
                value.encode(chunk, order);
            }
            done += span.len;
            address += span.len as u64;
        }
        Ok(())
    }

    /// Set `len` bytes starting at `address` to `value`
    pub fn fill(&mut self, address: u64, len: u64, value: u8) -> Result<()> {
        self.check_writable()?;
        let total = self.transfer_len(address, len)?;
        self.check_range(address, total)?;
        let mut address = address;
        let mut done = 0;
        while done < total {
            let span = self.span(address, total - done, 1);
            let target = self.window_mut(span.window)?;
            target[span.offset..span.offset + span.len].fill(value);
            done += span.len;
            address += span.len as u64;
        }
        Ok(())
    }

    /// Copy `len` bytes from `source` to `target` inside this space
    ///
    /// Overlapping ranges are handled like `memmove`.
    pub fn copy(&mut self, target: u64, source: u64, len: u64) -> Result<()> {
        self.check_writable()?;
        let total = self.transfer_len(source, len)?;
        self.check_range(source, total)?;
        self.check_range(target, total)?;
        if total == 0 || target == source {
            return Ok(());
        }

        let mut buffer = vec![0u8; total.min(COPY_CHUNK)];
        let backwards = target > source && target < source + len;
        let mut done = 0usize;
        while done < total {
            let n = (total - done).min(COPY_CHUNK);
            // Walk from the end when the target overlaps the source tail
            let at = (if backwards { total - done - n } else { done }) as u64;
            let chunk = &mut buffer[..n];
            self.get_bytes(source + at, chunk)?;
            self.put_bytes(target + at, chunk)?;
            done += n;
        }
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Convert a `u64` transfer length into `usize`
    fn transfer_len(&self, address: u64, len: u64) -> Result<usize> {
        usize::try_from(len).map_err(|_| {
            HeapError::invalid_argument(format!(
                "transfer of {} bytes at {} exceeds the platform word",
                len, address
            ))
        })
    }

    /// `[address, address + len)` must lie inside `[0, size)`
    fn check_range(&self, address: u64, len: usize) -> Result<()> {
        match address.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(HeapError::invalid_argument(format!(
                "range [{}, +{}) outside address space of {} bytes",
                address, len, self.size
            ))),
        }
    }

    /// The part of a checked transfer at `address` served by one window,
    /// rounded down to whole `unit`s.
    fn span(&self, address: u64, remaining: usize, unit: usize) -> Span {
        let window = (address >> self.shift) as usize;
        let offset = (address & (self.stride() - 1)) as usize;
        let available = self.windows[window].len() - offset;
        let len = remaining.min(available - available % unit);
        Span {
            window,
            offset,
            len,
        }
    }

    fn window_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let path = &self.path;
        self.windows[index].bytes_mut().ok_or_else(|| {
            HeapError::invalid_state(format!("address space {} is read-only", path.display()))
        })
    }
}

// =============================================================================
// Named Accessors
// =============================================================================

macro_rules! typed_accessors {
    ($($get:ident, $put:ident: $t:ty;)*) => {
        impl AddressSpace {
            $(
                #[doc = concat!("Read a `", stringify!($t), "` at `address`")]
                pub fn $get(&self, address: u64) -> Result<$t> {
                    self.get::<$t>(address)
                }

                #[doc = concat!("Write a `", stringify!($t), "` at `address`")]
                pub fn $put(&mut self, address: u64, value: $t) -> Result<()> {
                    self.put::<$t>(address, value)
                }
            )*
        }
    };
}

typed_accessors! {
    get_u8, put_u8: u8;
    get_i8, put_i8: i8;
    get_u16, put_u16: u16;
    get_i16, put_i16: i16;
    get_u32, put_u32: u32;
    get_i32, put_i32: i32;
    get_u64, put_u64: u64;
    get_i64, put_i64: i64;
    get_f32, put_f32: f32;
    get_f64, put_f64: f64;
}
