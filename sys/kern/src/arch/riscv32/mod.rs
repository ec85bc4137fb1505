// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for RISC-V.
//!
//! Written against riscv32imac (qemu's `virt` machine); riscv32imc should
//! also work. Supervisor mode is not used at all: the kernel owns Machine
//! mode, and tasks run either alongside it in M-mode (trusted) or in User
//! mode behind the PMP.
//!
//! Boot is delegated to `riscv-rt`: it sets up the stack and memory image,
//! parks secondary harts through `_mp_hook`, installs the trap vector, and
//! calls the application's entry, which calls `start_kernel`. We override
//! the `_start_trap` symbol `riscv-rt` would otherwise provide; see `trap`.

use core::arch::asm;

use crate::time::Timestamp;

extern crate riscv_rt;

mod csr;
pub use csr::*;

mod mtimer;
pub use mtimer::*;

mod trap;
pub use trap::*;

mod saved_state;
pub use saved_state::*;

mod task;
pub use task::*;

/// Tick divisor (mtime counts per kernel tick), kept in a named global so
/// a debugger can read the tick rate straight out of memory.
#[no_mangle]
pub static mut CLOCK_FREQ_KHZ: u32 = 0;

/// Because debuggers may want to know the tick rate early, this should be
/// set as early in boot as it can be.
pub fn set_clock_freq(tick_divisor: u32) {
    // Safety: one hart, no interrupts yet; nothing can race this store.
    unsafe {
        CLOCK_FREQ_KHZ = tick_divisor;
    }
}

/// Kernel tick counter, advanced by the timer interrupt.
#[used]
pub static mut TICKS: u64 = 0;

/// Reads the tick counter.
pub fn now() -> Timestamp {
    // Safety: updated only from the (non-reentrant) timer path, read
    // anywhere in kernel context; single hart, so no data race.
    Timestamp::from(unsafe { TICKS })
}

/// Index of the currently-running task in the task table.
///
/// On RISC-V we use a global to record this; `mscratch` is already spoken
/// for by the stack-isolation handshake in the trap vector.
#[no_mangle]
static mut CURRENT_TASK_INDEX: usize = 0;

pub fn current_task_index() -> usize {
    unsafe { CURRENT_TASK_INDEX }
}

/// Records the current task. The caller is the scheduler's switch path; the
/// value must index the live task table.
pub fn set_current_task_index(index: usize) {
    unsafe {
        CURRENT_TASK_INDEX = index;
    }
}

/// Parks every hart but the boot hart. `riscv-rt` calls this before running
/// any Rust initialization on a hart; returning `true` elects the hart to
/// run `main`.
#[export_name = "_mp_hook"]
pub extern "Rust" fn mp_hook(hartid: usize) -> bool {
    if hartid == 0 {
        return true;
    }
    loop {
        unsafe { asm!("wfi") };
    }
}
