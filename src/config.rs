//! Configuration for heapfile
//!
//! Centralized configuration with sensible defaults.

use serde::{Deserialize, Serialize};

use crate::error::{HeapError, Result};

/// Byte order used by the typed accessors of an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    /// Byte order of the running platform
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        Self::native()
    }
}

/// Main configuration for an address space and the allocator built on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Mapping Configuration
    // -------------------------------------------------------------------------
    /// Map the backing file read-only. Every write fails with `InvalidState`.
    pub readonly: bool,

    /// Byte order of typed reads and writes (and of every on-disk header)
    pub byte_order: ByteOrder,

    /// log2 of the window stride. 30 gives the production 1 GiB windows;
    /// smaller values only change how the file is mapped, never its format.
    pub window_shift: u32,

    // -------------------------------------------------------------------------
    // Allocator Configuration
    // -------------------------------------------------------------------------
    /// Allocator-driven growth rounds the mapped size up to a multiple of
    /// this many bytes (in bytes, must be a power of two)
    pub grow_step: u64,

    /// Initial deduplication setting of an append heap
    pub deduplicate: bool,
}

impl Config {
    /// Smallest accepted `window_shift` (64 KiB windows)
    pub const MIN_WINDOW_SHIFT: u32 = 16;

    /// Largest accepted `window_shift` (1 GiB windows)
    pub const MAX_WINDOW_SHIFT: u32 = 30;

    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the values that cannot be expressed by the field types alone
    pub fn validate(&self) -> Result<()> {
        if !(Self::MIN_WINDOW_SHIFT..=Self::MAX_WINDOW_SHIFT).contains(&self.window_shift) {
            return Err(HeapError::invalid_argument(format!(
                "window_shift {} outside {}..={}",
                self.window_shift,
                Self::MIN_WINDOW_SHIFT,
                Self::MAX_WINDOW_SHIFT
            )));
        }
        if !self.grow_step.is_power_of_two() {
            return Err(HeapError::invalid_argument(format!(
                "grow_step {} is not a power of two",
                self.grow_step
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            readonly: false,
            byte_order: ByteOrder::native(),
            window_shift: Self::MAX_WINDOW_SHIFT,
            grow_step: 64 * 1024, // 64 KiB
            deduplicate: true,
        }
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Map the file read-only
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.config.readonly = readonly;
        self
    }

    /// Set the byte order of typed accessors
    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.config.byte_order = order;
        self
    }

    /// Set log2 of the window stride
    pub fn window_shift(mut self, shift: u32) -> Self {
        self.config.window_shift = shift;
        self
    }

    /// Set the growth granularity (in bytes)
    pub fn grow_step(mut self, step: u64) -> Self {
        self.config.grow_step = step;
        self
    }

    /// Enable or disable append-heap deduplication
    pub fn deduplicate(mut self, enabled: bool) -> Self {
        self.config.deduplicate = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
