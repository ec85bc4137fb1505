// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trap entry, exit, and the C-level dispatcher.
//!
//! We provide our own trap vector, overriding the weak `_start_trap` symbol
//! set up by `riscv-rt`. The entry sequence builds the canonical 34-word
//! frame on the kernel stack and calls `trap_handler`; the handler returns
//! the frame to restore, which is the same frame to resume the interrupted
//! context or a suspended task's frame to context-switch.
//!
//! # The `mscratch` handshake
//!
//! The same vector serves traps out of M-mode kernel tasks and U-mode user
//! tasks, and the two arrive on different stacks. The discriminator is
//! `mscratch`:
//!
//! - while M-mode code runs outside a trap, `mscratch` holds zero;
//! - while U-mode code runs, `mscratch` holds the kernel stack top.
//!
//! Entry does an atomic `csrrw` swap of `sp` with `mscratch`. Seeing zero
//! means the trap came from M-mode: swap back and keep using the stack we
//! already had. Non-zero means the trap came from U-mode: `sp` is now the
//! kernel stack, and the swapped-out user `sp` is parked in `mscratch`
//! until it is stored into the frame. Either way `mscratch` is zeroed
//! before the handler runs, and the exit path re-arms it according to the
//! `MPP` bits of the status word being restored. A U-mode task is thus
//! free to destroy its own stack pointer; the next trap still lands on the
//! kernel stack (and the kernel never dereferences the user `sp`).
//!
//! The entry sequence touches only registers it has already saved (plus
//! `sp`), and writes nothing outside the frame it allocates.

use abi::Kerr;

use crate::startup::{with_kcb, with_task_table};
use crate::syscalls;
use crate::task::{self, NextTask};
use crate::time::Timestamp;

use super::{
    current_task_index, reset_timer, SavedState, TICKS,
};

/// Kernel stack top, re-armed into `mscratch` whenever the restore path
/// returns to U-mode. Written once during boot, read by assembly.
#[no_mangle]
pub static mut KERNEL_STACK_TOP: u32 = 0;

/// Frame size in bytes: 34 words of state, padded to keep the stack
/// pointer 16-byte aligned as the ABI demands.
pub const FRAME_SIZE: usize = 144;

extern "C" {
    /// Restores a saved context and leaves the trap (`mret`). Never
    /// returns; also used to launch the first task.
    pub fn _task_resume(frame: *mut SavedState) -> !;
}

// Frame word offsets are fixed by `SavedState`; the stores/loads below and
// that struct must change together.
core::arch::global_asm!(
    "
    .section .trap.rust, \"ax\"
    .globl _start_trap
    .p2align 2
_start_trap:
        #
        # Stack-isolation swap: M-mode entry sees zero and swaps back,
        # U-mode entry has just picked up the kernel stack and left the
        # user sp in mscratch.
        #
        csrrw sp, mscratch, sp
        bnez sp, 1f
        csrrw sp, mscratch, sp
1:
        addi sp, sp, -144

        sw ra,   0*4(sp)
        sw gp,   1*4(sp)
        sw tp,   2*4(sp)
        sw t0,   3*4(sp)
        sw t1,   4*4(sp)
        sw t2,   5*4(sp)
        sw s0,   6*4(sp)
        sw s1,   7*4(sp)
        sw a0,   8*4(sp)
        sw a1,   9*4(sp)
        sw a2,  10*4(sp)
        sw a3,  11*4(sp)
        sw a4,  12*4(sp)
        sw a5,  13*4(sp)
        sw a6,  14*4(sp)
        sw a7,  15*4(sp)
        sw s2,  16*4(sp)
        sw s3,  17*4(sp)
        sw s4,  18*4(sp)
        sw s5,  19*4(sp)
        sw s6,  20*4(sp)
        sw s7,  21*4(sp)
        sw s8,  22*4(sp)
        sw s9,  23*4(sp)
        sw s10, 24*4(sp)
        sw s11, 25*4(sp)
        sw t3,  26*4(sp)
        sw t4,  27*4(sp)
        sw t5,  28*4(sp)
        sw t6,  29*4(sp)

        csrr a0, mcause
        sw a0,  30*4(sp)
        csrr a1, mepc
        sw a1,  31*4(sp)
        csrr t0, mstatus
        sw t0,  32*4(sp)

        #
        # Interrupted stack pointer: the mscratch-held user sp for a U-mode
        # entry, or the pre-frame kernel sp for an M-mode entry.
        #
        csrr t1, mscratch
        bnez t1, 2f
        addi t1, sp, 144
2:
        sw t1,  33*4(sp)

        # M-mode convention: mscratch is zero while the kernel runs.
        csrw mscratch, zero

        #
        # Jump to our main rust handler: a0 = cause, a1 = epc, a2 = frame.
        # It hands back the frame to restore in a0.
        #
        mv a2, sp
        jal ra, trap_handler
        j _task_resume

    .globl _task_resume
    .p2align 2
_task_resume:
        #
        # On the way out we may have been handed a different task's frame;
        # walk it through t6 as that's restored last.
        #
        mv t6, a0

        lw t0,  32*4(t6)
        csrw mstatus, t0

        #
        # Re-arm the mscratch handshake for wherever we're headed: kernel
        # stack top if MPP says U-mode, zero if M-mode.
        #
        srli t1, t0, 11
        andi t1, t1, 3
        bnez t1, 3f
        la t2, KERNEL_STACK_TOP
        lw t2, 0(t2)
        csrw mscratch, t2
        j 4f
3:
        csrw mscratch, zero
4:
        lw t0,  31*4(t6)
        csrw mepc, t0

        lw ra,   0*4(t6)
        lw gp,   1*4(t6)
        lw tp,   2*4(t6)
        lw t0,   3*4(t6)
        lw t1,   4*4(t6)
        lw t2,   5*4(t6)
        lw s0,   6*4(t6)
        lw s1,   7*4(t6)
        lw a0,   8*4(t6)
        lw a1,   9*4(t6)
        lw a2,  10*4(t6)
        lw a3,  11*4(t6)
        lw a4,  12*4(t6)
        lw a5,  13*4(t6)
        lw a6,  14*4(t6)
        lw a7,  15*4(t6)
        lw s2,  16*4(t6)
        lw s3,  17*4(t6)
        lw s4,  18*4(t6)
        lw s5,  19*4(t6)
        lw s6,  20*4(t6)
        lw s7,  21*4(t6)
        lw s8,  22*4(t6)
        lw s9,  23*4(t6)
        lw s10, 24*4(t6)
        lw s11, 25*4(t6)
        lw t3,  26*4(t6)
        lw t4,  27*4(t6)
        lw t5,  28*4(t6)
        lw sp,  33*4(t6)
        lw t6,  29*4(t6)

        mret
    "
);

// mcause numbers we route on.
const INT_MACHINE_SOFT: u32 = 3;
const INT_MACHINE_TIMER: u32 = 7;
const INT_MACHINE_EXTERNAL: u32 = 11;
const EXC_ECALL_FROM_U: u32 = 8;
const EXC_ECALL_FROM_M: u32 = 11;

//
// The Rust side of our trap handler, entered with the canonical frame fully
// written. Returns the frame to restore: handing back a different task's
// frame is what a context switch is.
//
#[no_mangle]
extern "C" fn trap_handler(
    cause: u32,
    epc: u32,
    frame: *mut SavedState,
) -> *mut SavedState {
    const INTERRUPT_BIT: u32 = 1 << 31;
    let is_interrupt = cause & INTERRUPT_BIT != 0;
    let code = cause & !INTERRUPT_BIT;

    // Safety: single hart, and the trap handler is serialized with respect
    // to every other mutator of the task table (there are none while we're
    // in here, interrupts being disabled).
    unsafe {
        with_task_table(|tasks| {
            let current = current_task_index();

            // Snapshot the live frame into the TCB. The scheduler and the
            // syscall layer work exclusively on task-resident state, and
            // the restore path below always resumes out of a TCB.
            //
            // Safety: the frame was fully written by the entry sequence
            // and does not alias the task table (it lives on a stack).
            *tasks[current].save_mut() = unsafe { core::ptr::read(frame) };

            let hint = if is_interrupt {
                match code {
                    INT_MACHINE_TIMER => timer_interrupt(tasks),
                    INT_MACHINE_SOFT | INT_MACHINE_EXTERNAL => {
                        // No IPI users and no external-interrupt driver
                        // stack; note it and move on.
                        klog!("spurious interrupt {}", code);
                        NextTask::Same
                    }
                    _ => crate::fail::die_with_code(Kerr::Unknown, cause, epc),
                }
            } else {
                match code {
                    // Both ecall flavors route to the gate, so M-mode
                    // kernel tasks use the identical ABI as user tasks.
                    //
                    // Safety: kcb access is serialized by being in the
                    // trap handler.
                    EXC_ECALL_FROM_U | EXC_ECALL_FROM_M => unsafe {
                        with_kcb(|kcb| {
                            syscalls::syscall(tasks, &mut kcb.realm, current)
                        })
                    },
                    // Illegal instruction, access faults, misalignment:
                    // terminal, with cause and PC in the epitaph.
                    _ => crate::fail::die_with_code(Kerr::Fail, cause, epc),
                }
            };

            let mut next = match hint {
                NextTask::Same => current,
                NextTask::Specific(i) => i,
                NextTask::Other => task::select(current, tasks),
            };
            if !tasks[next].is_runnable() {
                next = task::select(current, tasks);
            }
            if next != current {
                // Safety: `next` is runnable and we are on the path that
                // resumes it.
                unsafe { syscalls::switch_to(tasks, next) };
            }
            tasks[next].save_mut() as *mut SavedState
        })
    }
}

fn timer_interrupt(tasks: &mut [task::Task]) -> NextTask {
    // Safety: we are the only writer of TICKS, and we cannot preempt
    // ourselves.
    let now = unsafe {
        TICKS += 1;
        Timestamp::from(TICKS)
    };

    // Safety: kcb access is serialized by being in the trap handler.
    let hint = unsafe {
        with_kcb(|kcb| {
            let hint = task::process_timers(tasks, &mut kcb.realm, now);
            if kcb.preemption {
                // Preemptive round-robin: give the scheduler a chance to
                // rotate within the current priority band.
                hint.combine(NextTask::Other)
            } else {
                hint
            }
        })
    };

    // Rearm mtimecmp; this also retires the interrupt we are handling.
    reset_timer();
    hint
}
