// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! By the time control gets here the trap entry has parked the caller's
//! registers in its `SavedState`; everything below works on task-resident
//! state and dispatches on the saved syscall-descriptor register.
//!
//! # ABI
//!
//! The syscall number travels in `a7`, up to three arguments in `a0..a2`,
//! and the result comes back in `a0`. The saved PC is advanced past the
//! `ecall` before dispatch, so the task resumes at the next instruction
//! whatever else happens.
//!
//! # Syscall implementations
//!
//! Each service has the shape
//!
//! ```ignore
//! fn syscall(tasks: &mut [Task], realm: &mut Realm, caller: usize)
//!     -> Result<NextTask, UserError>;
//! ```
//!
//! so a service only states its outcome -- a scheduling hint on success, a
//! `UserError` otherwise -- and the single wrapper in `syscall` turns
//! errors into response codes or faults. Individual services never write
//! error registers themselves.

use core::convert::TryFrom;

use abi::{FaultInfo, Kerr, SchedState, Sysnum, UsageError};

use crate::err::UserError;
use crate::sync::Realm;
use crate::task::{self, ArchState, NextTask, Task};

/// Entry point from the trap dispatcher.
///
/// Before calling this, the caller's register state must be stored into the
/// `SavedState` struct of its `Task`.
pub fn syscall(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
) -> NextTask {
    // Advance the program counter past the ecall instruction first, so the
    // task never re-executes it -- even if this call ends in a fault.
    tasks[caller].save_mut().advance_pc();

    let nr = tasks[caller].save().syscall_descriptor();
    match safe_syscall(tasks, realm, caller, nr) {
        Ok(nt) => nt,
        Err(UserError::Recoverable(code, hint)) => {
            tasks[caller].save_mut().set_result(code);
            hint
        }
        Err(UserError::Unrecoverable(fault)) => {
            task::force_fault(tasks, caller, fault)
        }
    }
}

fn safe_syscall(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    nr: u32,
) -> Result<NextTask, UserError> {
    let (a0, a1, a2) = {
        let save = tasks[caller].save();
        (save.arg0(), save.arg1(), save.arg2())
    };
    let now = crate::arch::now();

    match Sysnum::try_from(nr) {
        Ok(Sysnum::Yield) => {
            tasks[caller].save_mut().set_result(Kerr::Ok);
            Ok(NextTask::Other)
        }
        Ok(Sysnum::GetTaskId) => {
            let id = task::current_id(caller);
            tasks[caller].save_mut().ret0(u32::from(id.0));
            Ok(NextTask::Same)
        }
        Ok(Sysnum::Uptime) => {
            // Tick count, truncated to the register. Callers needing the
            // full width sample twice.
            tasks[caller].save_mut().ret0(u64::from(now) as u32);
            Ok(NextTask::Same)
        }
        Ok(Sysnum::Sleep) => {
            if a0 == 0 {
                tasks[caller].save_mut().set_result(Kerr::Ok);
                return Ok(NextTask::Other);
            }
            tasks[caller].set_deadline(Some(now.after(a0)));
            tasks[caller].set_healthy_state(SchedState::Delayed);
            Ok(NextTask::Other)
        }
        Ok(Sysnum::ConsolePutc) => {
            crate::console::putchar(a0 as u8);
            tasks[caller].save_mut().set_result(Kerr::Ok);
            Ok(NextTask::Same)
        }
        Ok(Sysnum::ConsoleGetc) => {
            tasks[caller].save_mut().ret0(crate::console::getchar() as u32);
            Ok(NextTask::Same)
        }

        Ok(Sysnum::MutexCreate) => {
            create_result(tasks, caller, crate::mutex::create(realm))
        }
        Ok(Sysnum::MutexLock) => {
            crate::mutex::lock(tasks, realm, caller, a0, None, now)
        }
        Ok(Sysnum::MutexTryLock) => {
            crate::mutex::trylock(tasks, realm, caller, a0)
        }
        Ok(Sysnum::MutexTimedLock) => {
            crate::mutex::lock(tasks, realm, caller, a0, Some(a1), now)
        }
        Ok(Sysnum::MutexUnlock) => {
            crate::mutex::unlock(tasks, realm, caller, a0)
        }
        Ok(Sysnum::MutexDestroy) => {
            crate::mutex::destroy(tasks, realm, caller, a0)
        }

        Ok(Sysnum::CondCreate) => {
            create_result(tasks, caller, crate::cond::create(realm))
        }
        Ok(Sysnum::CondWait) => {
            crate::cond::wait(tasks, realm, caller, a0, a1, None, now)
        }
        Ok(Sysnum::CondTimedWait) => {
            crate::cond::wait(tasks, realm, caller, a0, a1, Some(a2), now)
        }
        Ok(Sysnum::CondSignal) => {
            crate::cond::signal(tasks, realm, caller, a0)
        }
        Ok(Sysnum::CondBroadcast) => {
            crate::cond::broadcast(tasks, realm, caller, a0)
        }
        Ok(Sysnum::CondDestroy) => {
            crate::cond::destroy(tasks, realm, caller, a0)
        }

        Ok(Sysnum::SemCreate) => {
            create_result(tasks, caller, crate::sem::create(realm, a0, a1))
        }
        Ok(Sysnum::SemWait) => crate::sem::wait(tasks, realm, caller, a0),
        Ok(Sysnum::SemTryWait) => {
            crate::sem::trywait(tasks, realm, caller, a0)
        }
        Ok(Sysnum::SemPost) => crate::sem::post(tasks, realm, caller, a0),
        Ok(Sysnum::SemDestroy) => {
            crate::sem::destroy(tasks, realm, caller, a0)
        }

        Ok(Sysnum::QueueCreate) => {
            create_result(tasks, caller, crate::mqueue::create(realm, a0))
        }
        Ok(Sysnum::QueueDestroy) => {
            crate::mqueue::destroy(tasks, realm, caller, a0)
        }
        Ok(Sysnum::QueueSend) => {
            crate::mqueue::send(tasks, realm, caller, a0, a1)
        }
        Ok(Sysnum::QueueRecv) => {
            crate::mqueue::recv(tasks, realm, caller, a0)
        }
        Ok(Sysnum::QueuePeek) => {
            crate::mqueue::peek(tasks, realm, caller, a0)
        }

        Ok(Sysnum::Panic) => {
            // Task has explicitly aborted itself. The fault sidelines it;
            // everyone else keeps running.
            Err(FaultInfo::Panic.into())
        }
        Err(_) => {
            // A number we never assigned; the caller is confused enough to
            // be stopped.
            Err(UsageError::BadSyscallNumber.into())
        }
    }
}

/// Common tail for the `*Create` calls: hand the new object index to the
/// caller, or surface the allocation failure as a recoverable code.
fn create_result(
    tasks: &mut [Task],
    caller: usize,
    res: Result<u16, Kerr>,
) -> Result<NextTask, UserError> {
    match res {
        Ok(idx) => {
            tasks[caller].save_mut().ret0(u32::from(idx));
            Ok(NextTask::Same)
        }
        Err(code) => Err(UserError::code(code)),
    }
}

/// Makes `tasks[index]` the current task: applies its memory protection and
/// records it as current.
///
/// # Safety
///
/// `index` must refer to a runnable task in the live task table, and the
/// caller must be on a path that actually resumes the designated task
/// (i.e. the trap return path).
pub unsafe fn switch_to(tasks: &mut [Task], index: usize) {
    crate::startup::apply_memory_protection(&tasks[index]);
    crate::arch::set_current_task_index(index);
}
