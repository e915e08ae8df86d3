//! # Kernel synchronization primitives
//!
//! The memory manager protects each of its free-list structures (the
//! node/zone table, the kmalloc heap, the vmalloc area list and the page
//! tables) with its own [`SpinLock`]. Nothing here sleeps; every critical
//! section is a bounded walk over in-memory structures.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
