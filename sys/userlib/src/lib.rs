// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task-side support library.
//!
//! This contains syscall wrappers and re-exports the contents of the `abi`
//! crate that gets shared with the kernel.
//!
//! # Syscall stub implementations
//!
//! The kernel ABI deliberately confines every syscall to the registers
//! inline `asm!` can bind directly -- the number in `a7`, up to three
//! arguments in `a0..a2`, and the result in `a0` -- so the stubs here are
//! ordinary functions wrapping a single `ecall`. The kernel restores all
//! other registers on the way out, so nothing else is clobbered.
//!
//! Tasks are functions linked into the kernel image; there is no separate
//! task runtime or startup shim. A task entry point is a `fn() -> !` named
//! by its `TaskDesc`.

#![no_std]

pub use abi::*;

pub mod arch;

use arch::syscall_raw;

/// Decodes a raw create-style result: a non-negative object index, or a
/// negative `Kerr`.
fn decode_create(raw: u32) -> Result<ObjIndex, Kerr> {
    if (raw as i32) < 0 {
        Err(Kerr::from_u32(raw))
    } else {
        Ok(ObjIndex(raw as u16))
    }
}

/// Gives up the CPU, letting the scheduler rotate to another runnable task
/// of equal (or better) priority.
#[inline(always)]
pub fn sys_yield() {
    syscall_raw(Sysnum::Yield as u32, 0, 0, 0);
}

/// Returns the caller's task id. Always positive.
#[inline(always)]
pub fn sys_get_task_id() -> TaskId {
    TaskId(syscall_raw(Sysnum::GetTaskId as u32, 0, 0, 0) as u16)
}

/// Kernel tick count since boot, truncated to 32 bits.
#[inline(always)]
pub fn sys_uptime() -> u32 {
    syscall_raw(Sysnum::Uptime as u32, 0, 0, 0)
}

/// Sleeps for at least `ticks` kernel ticks. Zero is an ordinary yield.
#[inline(always)]
pub fn sys_sleep(ticks: u32) -> Kerr {
    Kerr::from_u32(syscall_raw(Sysnum::Sleep as u32, ticks, 0, 0))
}

/// Writes one byte to the kernel console.
#[inline(always)]
pub fn sys_putc(c: u8) {
    syscall_raw(Sysnum::ConsolePutc as u32, u32::from(c), 0, 0);
}

/// Reads one byte from the kernel console; negative means none pending.
#[inline(always)]
pub fn sys_getc() -> i32 {
    syscall_raw(Sysnum::ConsoleGetc as u32, 0, 0, 0) as i32
}

/// Aborts the calling task. The kernel records a panic fault and never
/// schedules the task again.
pub fn sys_panic() -> ! {
    syscall_raw(Sysnum::Panic as u32, 0, 0, 0);
    // The kernel does not return from a panic syscall; make that visible
    // to the compiler.
    loop {
        core::hint::spin_loop();
    }
}

pub fn sys_mutex_create() -> Result<ObjIndex, Kerr> {
    decode_create(syscall_raw(Sysnum::MutexCreate as u32, 0, 0, 0))
}

pub fn sys_mutex_lock(m: ObjIndex) -> Kerr {
    Kerr::from_u32(syscall_raw(Sysnum::MutexLock as u32, m.0.into(), 0, 0))
}

pub fn sys_mutex_trylock(m: ObjIndex) -> Kerr {
    Kerr::from_u32(syscall_raw(Sysnum::MutexTryLock as u32, m.0.into(), 0, 0))
}

/// Like `sys_mutex_lock`, but gives up with `Kerr::Timeout` after `ticks`
/// kernel ticks.
pub fn sys_mutex_timedlock(m: ObjIndex, ticks: u32) -> Kerr {
    Kerr::from_u32(syscall_raw(
        Sysnum::MutexTimedLock as u32,
        m.0.into(),
        ticks,
        0,
    ))
}

pub fn sys_mutex_unlock(m: ObjIndex) -> Kerr {
    Kerr::from_u32(syscall_raw(Sysnum::MutexUnlock as u32, m.0.into(), 0, 0))
}

pub fn sys_mutex_destroy(m: ObjIndex) -> Kerr {
    Kerr::from_u32(syscall_raw(Sysnum::MutexDestroy as u32, m.0.into(), 0, 0))
}

pub fn sys_cond_create() -> Result<ObjIndex, Kerr> {
    decode_create(syscall_raw(Sysnum::CondCreate as u32, 0, 0, 0))
}

/// Atomically releases `m` and waits on `c`; re-acquires `m` before
/// returning. The caller must hold `m`.
pub fn sys_cond_wait(c: ObjIndex, m: ObjIndex) -> Kerr {
    Kerr::from_u32(syscall_raw(
        Sysnum::CondWait as u32,
        c.0.into(),
        m.0.into(),
        0,
    ))
}

/// As `sys_cond_wait`, but returns `Kerr::Timeout` -- still holding `m` --
/// if nothing signals within `ticks`.
pub fn sys_cond_timedwait(c: ObjIndex, m: ObjIndex, ticks: u32) -> Kerr {
    Kerr::from_u32(syscall_raw(
        Sysnum::CondTimedWait as u32,
        c.0.into(),
        m.0.into(),
        ticks,
    ))
}

pub fn sys_cond_signal(c: ObjIndex) -> Kerr {
    Kerr::from_u32(syscall_raw(Sysnum::CondSignal as u32, c.0.into(), 0, 0))
}

pub fn sys_cond_broadcast(c: ObjIndex) -> Kerr {
    Kerr::from_u32(syscall_raw(Sysnum::CondBroadcast as u32, c.0.into(), 0, 0))
}

pub fn sys_cond_destroy(c: ObjIndex) -> Kerr {
    Kerr::from_u32(syscall_raw(Sysnum::CondDestroy as u32, c.0.into(), 0, 0))
}

pub fn sys_sem_create(initial: u32, max: u32) -> Result<ObjIndex, Kerr> {
    decode_create(syscall_raw(Sysnum::SemCreate as u32, initial, max, 0))
}

pub fn sys_sem_wait(s: ObjIndex) -> Kerr {
    Kerr::from_u32(syscall_raw(Sysnum::SemWait as u32, s.0.into(), 0, 0))
}

pub fn sys_sem_trywait(s: ObjIndex) -> Kerr {
    Kerr::from_u32(syscall_raw(Sysnum::SemTryWait as u32, s.0.into(), 0, 0))
}

pub fn sys_sem_post(s: ObjIndex) -> Kerr {
    Kerr::from_u32(syscall_raw(Sysnum::SemPost as u32, s.0.into(), 0, 0))
}

pub fn sys_sem_destroy(s: ObjIndex) -> Kerr {
    Kerr::from_u32(syscall_raw(Sysnum::SemDestroy as u32, s.0.into(), 0, 0))
}

pub fn sys_queue_create(capacity: u32) -> Result<ObjIndex, Kerr> {
    decode_create(syscall_raw(Sysnum::QueueCreate as u32, capacity, 0, 0))
}

pub fn sys_queue_destroy(q: ObjIndex) -> Kerr {
    Kerr::from_u32(syscall_raw(Sysnum::QueueDestroy as u32, q.0.into(), 0, 0))
}

/// Posts one message word; `Kerr::Fail` when the queue is full.
pub fn sys_queue_send(q: ObjIndex, message: u32) -> Kerr {
    Kerr::from_u32(syscall_raw(
        Sysnum::QueueSend as u32,
        q.0.into(),
        message,
        0,
    ))
}

/// Takes the head message word, or zero when the queue is empty.
pub fn sys_queue_recv(q: ObjIndex) -> u32 {
    syscall_raw(Sysnum::QueueRecv as u32, q.0.into(), 0, 0)
}

/// Reads the head message word without consuming it; zero when empty.
pub fn sys_queue_peek(q: ObjIndex) -> u32 {
    syscall_raw(Sysnum::QueuePeek as u32, q.0.into(), 0, 0)
}
