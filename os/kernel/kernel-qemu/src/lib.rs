//! # QEMU debug console
//!
//! A [`log`] backend that writes to QEMU's `isa-debugcon` port (`0x402`).
//! Start QEMU with `-debugcon file:debug.log -global isa-debugcon.iobase=0x402`
//! to capture the output.
//!
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::LevelFilter;
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//!
//! LOGGER.init().expect("logger already installed");
//! log::info!("memory manager online");
//! ```
//!
//! Without the `enabled` feature the sink discards everything, so release
//! images can keep their `log` calls.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{QemuLogger, write_record};

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    const QEMU_DEBUG_PORT: u16 = 0x402;

    #[inline]
    pub fn dbg_putc(c: u8) {
        // SAFETY: the debug console port has no side effects beyond the byte written.
        unsafe { outb(QEMU_DEBUG_PORT, c) }
    }

    #[cfg(target_arch = "x86_64")]
    #[inline]
    unsafe fn outb(port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") port,
                in("al") val,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    #[inline]
    unsafe fn outb(_port: u16, _val: u8) {}

    /// [`Write`] adapter over the debug port.
    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(dbg_putc);
            Ok(())
        }
    }

    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort: the port cannot fail.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[inline]
    pub fn qemu_write(_: fmt::Arguments) {}
}

/// `format!`-style write to the debug port, bypassing `log`.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
