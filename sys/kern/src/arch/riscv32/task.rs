// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::arch::{reset_timer, SavedState, CLOCK_FREQ_KHZ};
use crate::task;
use crate::task::ArchState;

use abi::{RegionPriority, TaskFlags};
use riscv::register;

use super::trap::{_task_resume, KERNEL_STACK_TOP};
use super::{MTIME, MTIMECMP};

// mstatus bits we fabricate into initial frames. MPIE set so mret enables
// interrupts in the task; MPP selects the task's privilege.
const MSTATUS_MPIE: u32 = 1 << 7;
const MSTATUS_MPP_MACHINE: u32 = 0b11 << 11;

/// Pattern written over fresh task stacks, so a debugger can tell how much
/// was ever used.
const STACK_ZAP: u32 = 0xbadd_cafe;

/// Launches the first task (by convention the idle task, which immediately
/// yields into whatever real work is ready).
///
/// This arms the machine timer for the periodic kernel tick, records the
/// kernel stack top for the trap engine's `mscratch` handshake, and runs
/// the ordinary context-restore path on the task's initial frame.
pub fn start_first_task(tick_divisor: u32, task: &mut task::Task) -> ! {
    unsafe {
        CLOCK_FREQ_KHZ = tick_divisor;

        // Seed the compare register from the running counter, then push it
        // one tick into the future; anything stale here would fire the
        // first tick immediately.
        let mtime = core::ptr::read_volatile(MTIME as *mut u64);
        core::ptr::write_volatile(MTIMECMP as *mut u64, mtime);
        reset_timer();

        // Unmask the machine timer; it stays the kernel's only interrupt
        // source.
        register::mie::set_mtimer();

        // The trap engine needs the kernel stack top: it goes into
        // mscratch whenever a U-mode task runs, and traps switch to it.
        // riscv-rt's link script provides the symbol.
        extern "C" {
            static _stack_start: u32;
        }
        KERNEL_STACK_TOP = &_stack_start as *const u32 as u32;

        // M-mode convention outside a trap: mscratch is zero. The restore
        // path re-arms it if the first task is U-mode.
        register::mscratch::write(0);

        // From here this is just a context restore of a frame that has
        // never run. mret inside does the privilege switch.
        _task_resume(task.save_mut() as *mut SavedState)
    }
}

/// Rebuilds a task's register frame from its descriptor: entry point,
/// initial stack, and a status word whose `MPP` matches the task's
/// privilege flag. Also zaps the task's stack region with a recognizable
/// pattern.
pub fn reinitialize(task: &mut task::Task) {
    *task.save_mut() = SavedState::default();

    // The descriptor's stack top becomes the initial sp; the ABI wants it
    // 16-byte aligned and nothing later rechecks this.
    let initial_stack = task.descriptor().initial_stack;
    uassert!(initial_stack & 0xf == 0);
    task.save_mut().set_sp(initial_stack);

    let status = if task.descriptor().flags.contains(TaskFlags::USER_MODE) {
        MSTATUS_MPIE
    } else {
        MSTATUS_MPIE | MSTATUS_MPP_MACHINE
    };
    task.save_mut().set_status(status);

    // Tasks are linked into the kernel image and share its global pointer;
    // a zero gp would break every relaxed global access in task code.
    extern "C" {
        #[link_name = "__global_pointer$"]
        static GLOBAL_POINTER: u8;
    }
    // Safety: address-of only; the symbol is never dereferenced.
    let gp = unsafe { &GLOBAL_POINTER as *const u8 as u32 };
    task.save_mut().set_gp(gp);

    // Paint the unused stack so high-water marks show up in a debugger.
    for region in task.region_table().iter() {
        if region.priority != RegionPriority::Stack {
            continue;
        }
        if initial_stack < region.base
            || initial_stack > region.base.wrapping_add(region.size)
        {
            continue;
        }
        let mut addr = region.base;
        while addr < initial_stack {
            // Safety: the range is this task's own stack region, which the
            // task is not yet running on.
            unsafe {
                core::ptr::write_volatile(addr as *mut u32, STACK_ZAP);
            }
            addr += 4;
        }
    }

    // Set the initial program counter
    let pc = task.descriptor().entry_point;
    task.save_mut().set_pc(pc);
}
