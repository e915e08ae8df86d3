//! Error types of the allocators.
//!
//! Only exhaustion and refused requests are values. Misuse (misaligned
//! mappings, double frees, foreign pointers) halts with a panic instead.

use kernel_info::config::ConfigError;
use kernel_vmem::MapError;

/// Outcome of a failed [`FreeAreas::find`](crate::buddy::FreeAreas::find).
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BuddyError {
    #[error("order {order} exceeds the maximum order {max}")]
    OrderTooLarge { order: usize, max: usize },
    #[error("no free block of order {order} or above")]
    OutOfMemory { order: usize },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AllocError {
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("{size} bytes exceed the largest heap block")]
    TooLarge { size: usize },
    #[error("order {order} exceeds the maximum order {max}")]
    OrderTooLarge { order: usize, max: usize },
    #[error("out of memory")]
    OutOfMemory,
    #[error("heap window exhausted")]
    HeapExhausted,
    #[error(transparent)]
    Map(#[from] MapError),
}

impl From<BuddyError> for AllocError {
    fn from(e: BuddyError) -> Self {
        match e {
            BuddyError::OrderTooLarge { order, max } => Self::OrderTooLarge { order, max },
            BuddyError::OutOfMemory { .. } => Self::OutOfMemory,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootError {
    #[error("{found} bytes of RAM, at least {needed} required")]
    NotEnoughMemory { found: u64, needed: u64 },
    #[error("no conventional region can hold the {frames}-frame boot bitmap")]
    NoRoomForBitmap { frames: u64 },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("page tables: {0}")]
    Map(#[from] MapError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmallocError {
    #[error("zero-sized area")]
    ZeroSize,
    #[error("no gap of {bytes} bytes left in the vmalloc window")]
    NoVirtualSpace { bytes: u64 },
    #[error("{pages} pages requested, zone NORMAL has {free} free")]
    OutOfMemory { pages: u64, free: u64 },
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Map(#[from] MapError),
}
