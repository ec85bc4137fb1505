// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Terminal kernel failure, recorded where a debugger can dig it out.
//!
//! Two symbols make up the debugger contract:
//!
//! - `kern::fail::KERNEL_HAS_FAILED`, a `bool` that is false until the
//!   kernel reaches `die` (whether called directly or via `panic!`). One
//!   word to check to triage a wedged board.
//!
//! - `kern::fail::KERNEL_EPITAPH`, a byte buffer that `die` fills with as
//!   much UTF-8 of the failure description as fits, NUL-padded; trim the
//!   trailing NULs when printing.
//!
//! On the host (unit tests) `die` simply panics, so tests can observe it.

use core::fmt::Display;

use abi::Kerr;

/// Flag that gets set to `true` by all failure reporting functions, giving
/// tools a one-stop-shop for doing kernel triage.
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

#[cfg(target_os = "none")]
const EPITAPH_LEN: usize = 128;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description of
/// the event that caused the kernel to fail, padded with NULs.
#[cfg(target_os = "none")]
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

#[cfg(target_os = "none")]
fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: we only access this flag from this one site, and only zero or
    // one times in practice -- and never from a context where concurrency or
    // interrupts are enabled.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // A second arrival here means we panicked while reporting a panic.
        // Park quietly; anything fancier just digs the hole deeper.
        loop {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }
    }

    // Safety: we can get a mutable reference to the epitaph because only one
    // execution of this function will successfully set that flag.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

/// Terminal failure with a one-word code, used for trap escalation where the
/// cause and PC are all we know.
pub fn die_with_code(code: Kerr, cause: u32, epc: u32) -> ! {
    struct TrapEpitaph(Kerr, u32, u32);
    impl Display for TrapEpitaph {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            write!(
                f,
                "kernel died: {:?} cause={:#010x} epc={:#010x}",
                self.0, self.1, self.2
            )
        }
    }
    die(TrapEpitaph(code, cause, epc))
}

#[cfg(not(target_os = "none"))]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    unsafe {
        KERNEL_HAS_FAILED = true;
    }
    panic!("{}", msg);
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    use core::fmt::Write;

    klog!("{}", msg);

    let buf = begin_epitaph();
    let mut writer = EpitaphWriter { dest: buf };
    write!(writer, "{}", msg).ok();

    loop {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// `fmt::Write` sink that fills the epitaph buffer and silently discards
/// whatever doesn't fit.
#[cfg(target_os = "none")]
struct EpitaphWriter {
    dest: &'static mut [u8],
}

#[cfg(target_os = "none")]
impl core::fmt::Write for EpitaphWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, rest) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = rest;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
