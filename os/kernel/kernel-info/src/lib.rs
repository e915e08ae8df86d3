//! # Memory Manager Configuration and Boot Interface
//!
//! Layout constants, boot-time inputs and the runtime configuration consumed
//! by the kernel's memory manager.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! Virtual address windows, the zone split point and allocator order limits.
//!
//! ### Boot Inputs ([`boot`])
//! The raw physical memory map handed over by the loader and the physical
//! layout of the kernel image's sections.
//!
//! ### Hardware Windows ([`hardware`])
//! Physical MMIO windows (APIC, IOAPIC, HPET) that must never be handed out
//! as ordinary RAM.
//!
//! ### Runtime Configuration ([`config`])
//! [`MemoryConfig`](config::MemoryConfig) collects every tunable in one
//! struct whose `Default` is built from the constants above.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Low identity / unused         │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Direct map of physical RAM    │
//! HEAP_START            ├─────────────────────────────────┤ 0xffff_c880_0000_0000
//!                       │   kmalloc heap (grows upward)   │
//! VMALLOC_START         ├─────────────────────────────────┤ 0xffff_c900_0000_0000
//!                       │   vmalloc / ioremap areas       │
//! VMALLOC_END           ├─────────────────────────────────┤ 0xffff_e900_0000_0000
//!                       │                                 │
//! TEMP_WINDOW_BASE      ├─────────────────────────────────┤ 0xffff_fe80_0000_0000
//!                       │   Temporary frame window        │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │   Kernel text, rodata, data     │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Physical Zones
//!
//! ```text
//! 0x0000_0000 ┌───────────────┐
//!             │ DMA zone      │  pfn 0 is never handed out
//! DMA_ZONE_END├───────────────┤ 0x0100_0000 (16 MiB)
//!             │ Normal zone   │
//!             └───────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod config;
pub mod hardware;
pub mod memory;
