//! # Runtime Configuration

use crate::hardware::{DEFAULT_HARDWARE_WINDOWS, HardwareWindow};
use crate::memory::{
    DMA_ZONE_END, HEAP_GROW_BYTES, HEAP_MAX_SIZE, HEAP_START, HHDM_BASE, MIN_PHYSICAL_MEMORY,
    PAGE_SIZE, TEMP_WINDOW_PML4_SLOT, VMALLOC_END, VMALLOC_START,
};

/// Tunables of the memory manager, fixed at boot.
///
/// ```rust
/// # use kernel_info::config::MemoryConfig;
/// let cfg = MemoryConfig {
///     dma_limit: 64 * 4096,
///     ..MemoryConfig::default()
/// };
/// assert!(cfg.validate().is_ok());
/// ```
#[derive(Copy, Clone, Debug)]
pub struct MemoryConfig {
    /// End of the DMA zone in bytes.
    pub dma_limit: u64,
    /// Boot fails below this much physical memory.
    pub min_memory: u64,
    /// Frames overlapping these windows become fixed-mapping.
    pub hardware_windows: &'static [HardwareWindow],
    pub heap_start: u64,
    pub heap_max_size: u64,
    pub heap_grow_bytes: u64,
    pub vmalloc_start: u64,
    pub vmalloc_end: u64,
    pub temp_window_slot: usize,
    /// Base of the direct map built at boot, or `None` to keep the loader's tables.
    pub direct_map_base: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dma_limit: DMA_ZONE_END,
            min_memory: MIN_PHYSICAL_MEMORY,
            hardware_windows: &DEFAULT_HARDWARE_WINDOWS,
            heap_start: HEAP_START,
            heap_max_size: HEAP_MAX_SIZE,
            heap_grow_bytes: HEAP_GROW_BYTES,
            vmalloc_start: VMALLOC_START,
            vmalloc_end: VMALLOC_END,
            temp_window_slot: TEMP_WINDOW_PML4_SLOT,
            direct_map_base: Some(HHDM_BASE),
        }
    }
}

/// A configuration value that cannot work.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not page aligned")]
    Unaligned(&'static str),
    #[error("{0} window is empty")]
    EmptyWindow(&'static str),
    #[error("temporary window slot is not a PML4 index")]
    SlotOutOfRange,
}

impl MemoryConfig {
    /// Checks alignment and ordering of the configured windows.
    ///
    /// # Errors
    /// Names the first offending field.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.dma_limit % PAGE_SIZE != 0 {
            return Err(ConfigError::Unaligned("dma_limit"));
        }
        if self.heap_start % PAGE_SIZE != 0 || self.heap_max_size % PAGE_SIZE != 0 {
            return Err(ConfigError::Unaligned("heap"));
        }
        if self.heap_grow_bytes == 0 || self.heap_grow_bytes % PAGE_SIZE != 0 {
            return Err(ConfigError::Unaligned("heap_grow_bytes"));
        }
        if self.vmalloc_start % PAGE_SIZE != 0 || self.vmalloc_end % PAGE_SIZE != 0 {
            return Err(ConfigError::Unaligned("vmalloc"));
        }
        if self.heap_max_size == 0 {
            return Err(ConfigError::EmptyWindow("heap"));
        }
        if self.vmalloc_end <= self.vmalloc_start {
            return Err(ConfigError::EmptyWindow("vmalloc"));
        }
        if self.temp_window_slot >= 512 {
            return Err(ConfigError::SlotOutOfRange);
        }
        Ok(())
    }
}
