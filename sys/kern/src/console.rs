// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel console plumbing.
//!
//! The kernel itself has no idea how to talk to a UART; a board package
//! installs three hooks instead. The defaults are no-ops so a board that
//! forgets to install them still boots -- output just goes nowhere and input
//! never arrives.
//!
//! `klog!` is the kernel's logging macro and writes through the same hooks.

/// The three installable console hooks.
#[derive(Copy, Clone)]
pub struct ConsoleHooks {
    /// Emits one byte.
    pub putchar: fn(u8),
    /// Returns the next input byte, or a negative value if none is pending.
    pub getchar: fn() -> i32,
    /// Returns non-zero if input is ready.
    pub poll: fn() -> i32,
}

fn putchar_none(_c: u8) {}

fn getchar_none() -> i32 {
    -1
}

fn poll_none() -> i32 {
    0
}

const NO_HOOKS: ConsoleHooks = ConsoleHooks {
    putchar: putchar_none,
    getchar: getchar_none,
    poll: poll_none,
};

static mut HOOKS: ConsoleHooks = NO_HOOKS;

/// Installs console hooks. Normally called once by the board package before
/// `start_kernel`; calling it again replaces the previous hooks.
///
/// # Safety
///
/// Must not race a concurrent console operation. In practice this means
/// "call it from kernel context," which is the only context there is.
pub unsafe fn set_hooks(hooks: ConsoleHooks) {
    unsafe {
        HOOKS = hooks;
    }
}

pub fn putchar(c: u8) {
    // Safety: hook replacement only happens from kernel context, which is
    // serialized with this read.
    let f = unsafe { HOOKS.putchar };
    f(c)
}

pub fn getchar() -> i32 {
    let f = unsafe { HOOKS.getchar };
    f()
}

pub fn poll() -> i32 {
    let f = unsafe { HOOKS.poll };
    f()
}

/// `core::fmt` adapter over the putchar hook, so `klog!` can format.
pub struct ConsoleWriter;

impl core::fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for b in s.bytes() {
            putchar(b);
        }
        Ok(())
    }
}

/// Kernel log line. Compiled out entirely when the `klog-console` feature is
/// disabled.
#[cfg(feature = "klog-console")]
#[macro_export]
macro_rules! klog {
    ($s:expr) => {
        {
            use core::fmt::Write;
            let _ = writeln!($crate::console::ConsoleWriter, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        {
            use core::fmt::Write;
            let _ = writeln!($crate::console::ConsoleWriter, $s, $($tt)*);
        }
    };
}

#[cfg(not(feature = "klog-console"))]
#[macro_export]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}
