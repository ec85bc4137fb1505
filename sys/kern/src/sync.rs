// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared state and plumbing for the blocking primitives.
//!
//! All synchronization objects live in the `Realm`: fixed arenas of slots,
//! one arena per object kind. A slot is free when its magic word is zero,
//! live when it carries the kind's magic tag, and poisoned after destroy --
//! so use-after-destroy trips the magic check instead of corrupting a
//! recycled slot silently.
//!
//! Every operation here executes inside the trap handler with machine
//! interrupts disabled, which is the subsystem critical section: list
//! manipulation and state flips cannot be preempted.

use abi::{Kerr, SchedState, TaskState, UsageError};

use crate::cond::CondSlot;
use crate::err::UserError;
use crate::mqueue::QueueSlot;
use crate::mutex::MutexSlot;
use crate::sem::SemSlot;
use crate::task::{ArchState, NextTask, Task};

pub const MUTEX_COUNT: usize = 16;
pub const COND_COUNT: usize = 16;
pub const SEM_COUNT: usize = 16;
pub const QUEUE_COUNT: usize = 8;

/// All synchronization object arenas, owned process-wide by the kernel.
pub struct Realm {
    pub mutexes: [MutexSlot; MUTEX_COUNT],
    pub conds: [CondSlot; COND_COUNT],
    pub sems: [SemSlot; SEM_COUNT],
    pub queues: [QueueSlot; QUEUE_COUNT],
}

impl Realm {
    pub const fn new() -> Self {
        Realm {
            mutexes: [MutexSlot::FREE; MUTEX_COUNT],
            conds: [CondSlot::FREE; COND_COUNT],
            sems: [SemSlot::FREE; SEM_COUNT],
            queues: [QueueSlot::FREE; QUEUE_COUNT],
        }
    }
}

/// Converts a user-supplied object index into an in-bounds `usize`, or the
/// fault that ends the offender. Magic validation is the caller's job, since
/// only it knows which arena it is reaching into.
pub(crate) fn obj_index(arg: u32, limit: usize) -> Result<usize, UserError> {
    let idx = arg as usize;
    if idx < limit {
        Ok(idx)
    } else {
        Err(UsageError::InvalidObject.into())
    }
}

/// Timeout cancellation: task `index`'s deadline fired. Pulls the task out
/// of whatever it is blocked on and resumes it with the appropriate result.
///
/// For a plain sleep the result is `Ok`; for a timed mutex or semaphore wait
/// it is `Timeout`; a timed condition wait must first re-acquire its paired
/// mutex, so the task either resumes immediately (mutex free) or migrates to
/// the mutex's queue carrying `Timeout` as the result to deliver on grant.
pub(crate) fn cancel_blocked_wait(
    tasks: &mut [Task],
    realm: &mut Realm,
    index: usize,
) -> NextTask {
    let state = *tasks[index].state();
    match state {
        TaskState::Healthy(SchedState::Delayed) => {
            tasks[index].save_mut().set_result(Kerr::Ok);
            tasks[index].set_healthy_state(SchedState::Runnable);
            NextTask::Specific(index)
        }
        TaskState::Healthy(SchedState::InMutexWait(m)) => {
            let removed = realm.mutexes[usize::from(m.0)]
                .waiters
                .remove(tasks, index as u16);
            uassert!(removed);
            tasks[index].save_mut().set_result(Kerr::Timeout);
            tasks[index].set_healthy_state(SchedState::Runnable);
            NextTask::Specific(index)
        }
        TaskState::Healthy(SchedState::InCondWait(c, m)) => {
            let removed = realm.conds[usize::from(c.0)]
                .waiters
                .remove(tasks, index as u16);
            uassert!(removed);
            crate::mutex::grant_or_enqueue(
                tasks,
                realm,
                index,
                usize::from(m.0),
                Kerr::Timeout,
            )
        }
        TaskState::Healthy(SchedState::InSemWait(s)) => {
            let removed = realm.sems[usize::from(s.0)]
                .waiters
                .remove(tasks, index as u16);
            uassert!(removed);
            tasks[index].save_mut().set_result(Kerr::Timeout);
            tasks[index].set_healthy_state(SchedState::Runnable);
            NextTask::Specific(index)
        }
        // A deadline left over from an earlier wait that already completed;
        // nothing to do.
        _ => NextTask::Same,
    }
}
