//! # Hardware-Reserved Physical Windows
//!
//! MMIO ranges that overlap the physical address space. Frames inside these
//! windows are marked fixed-mapping and never enter a free-list.

use crate::boot::PhysRange;
use crate::memory::PAGE_SIZE;

/// Local APIC register page.
pub const APIC_BASE: u64 = 0xFEE0_0000;

/// I/O APIC register page.
pub const IOAPIC_BASE: u64 = 0xFEC0_0000;

/// HPET register page.
pub const HPET_BASE: u64 = 0xFED0_0000;

/// A named physical window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HardwareWindow {
    pub name: &'static str,
    pub range: PhysRange,
}

impl HardwareWindow {
    #[must_use]
    pub const fn page(name: &'static str, base: u64) -> Self {
        Self {
            name,
            range: PhysRange::new(base, base + PAGE_SIZE),
        }
    }
}

/// The windows every x86-64 machine has.
pub const DEFAULT_HARDWARE_WINDOWS: [HardwareWindow; 3] = [
    HardwareWindow::page("APIC", APIC_BASE),
    HardwareWindow::page("IOAPIC", IOAPIC_BASE),
    HardwareWindow::page("HPET", HPET_BASE),
];
