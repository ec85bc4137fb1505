// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Non-recursive mutexes with FIFO ownership transfer.
//!
//! Contended locks queue strictly first-come-first-served, and `unlock`
//! hands the mutex *directly* to the head waiter: by the time that task runs
//! again it already owns the mutex and does not re-contend. First to block
//! is therefore first to own, which is the fairness property the rest of the
//! system leans on.
//!
//! Blocking works by flipping the caller to `InMutexWait` and returning a
//! reschedule hint; the state flip happens inside the trap critical section,
//! before anyone else can run, so there is no window in which an unlock
//! could miss the waiter.

use abi::{Kerr, SchedState, TaskId, TaskState, UsageError};

use crate::err::UserError;
use crate::list::WaitQueue;
use crate::sync::{obj_index, Realm, MUTEX_COUNT};
use crate::task::{ArchState, NextTask, Task};
use crate::time::Timestamp;

pub const MUTEX_MAGIC: u32 = 0x4d55_5458;
const POISONED: u32 = 0xdead_4d58;

/// One mutex arena slot.
#[derive(Clone, Debug)]
pub struct MutexSlot {
    pub magic: u32,
    /// Owning task id; `TaskId::NONE` when free, `TaskId(!0)` once the slot
    /// has been destroyed.
    pub owner: TaskId,
    pub waiters: WaitQueue,
}

impl MutexSlot {
    pub const FREE: Self = MutexSlot {
        magic: 0,
        owner: TaskId::NONE,
        waiters: WaitQueue::EMPTY,
    };
}

/// Allocates a mutex slot. Fails with `Fail` when the arena is exhausted.
pub fn create(realm: &mut Realm) -> Result<u16, Kerr> {
    let idx = realm
        .mutexes
        .iter()
        .position(|m| m.magic == 0)
        .ok_or(Kerr::Fail)?;
    realm.mutexes[idx] = MutexSlot {
        magic: MUTEX_MAGIC,
        owner: TaskId::NONE,
        waiters: WaitQueue::EMPTY,
    };
    Ok(idx as u16)
}

fn slot(realm: &mut Realm, arg: u32) -> Result<usize, UserError> {
    let idx = obj_index(arg, MUTEX_COUNT)?;
    if realm.mutexes[idx].magic != MUTEX_MAGIC {
        return Err(UsageError::InvalidObject.into());
    }
    Ok(idx)
}

/// Acquires the mutex for `caller`, blocking FIFO if it is held.
///
/// With `timeout` set this is the timed variant: the caller's deadline is
/// armed before it blocks, and expiry hands it `Timeout` instead of
/// ownership (see `sync::cancel_blocked_wait`).
///
/// Taking a mutex you already hold is refused with `TaskBusy` -- these locks
/// are non-recursive, and queueing behind yourself would be a deadlock no
/// timeout could be relied on to break.
pub fn lock(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
    timeout: Option<u32>,
    now: Timestamp,
) -> Result<NextTask, UserError> {
    let m = slot(realm, arg)?;
    let me = TaskId::for_index(caller);

    if realm.mutexes[m].owner == TaskId::NONE {
        realm.mutexes[m].owner = me;
        tasks[caller].save_mut().set_result(Kerr::Ok);
        return Ok(NextTask::Same);
    }
    if realm.mutexes[m].owner == me {
        return Err(UserError::code(Kerr::TaskBusy));
    }

    realm.mutexes[m].waiters.push_back(tasks, caller as u16);
    tasks[caller].set_wake_code(Kerr::Ok);
    tasks[caller]
        .set_healthy_state(SchedState::InMutexWait(abi::ObjIndex(m as u16)));
    if let Some(ticks) = timeout {
        tasks[caller].set_deadline(Some(now.after(ticks)));
    }
    Ok(NextTask::Other)
}

/// Acquires the mutex only if it is free right now; `TaskBusy` otherwise
/// (including when the caller already owns it).
pub fn trylock(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
) -> Result<NextTask, UserError> {
    let m = slot(realm, arg)?;
    if realm.mutexes[m].owner != TaskId::NONE {
        return Err(UserError::code(Kerr::TaskBusy));
    }
    realm.mutexes[m].owner = TaskId::for_index(caller);
    tasks[caller].save_mut().set_result(Kerr::Ok);
    Ok(NextTask::Same)
}

/// Releases the mutex held by `caller`.
pub fn unlock(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
) -> Result<NextTask, UserError> {
    let m = slot(realm, arg)?;
    if realm.mutexes[m].owner != TaskId::for_index(caller) {
        return Err(UserError::code(Kerr::NotOwner));
    }
    let hint = release(tasks, realm, m, caller);
    tasks[caller].save_mut().set_result(Kerr::Ok);
    Ok(hint)
}

/// Ownership hand-off guts, shared with the condition-variable code (which
/// releases a mutex on a waiter's behalf).
///
/// Pops the head of the FIFO, transfers ownership to it, clears its
/// deadline, delivers its recorded wake code, and makes it runnable. With no
/// waiters the mutex simply becomes free.
pub(crate) fn release(
    tasks: &mut [Task],
    realm: &mut Realm,
    m: usize,
    caller: usize,
) -> NextTask {
    let woken = match realm.mutexes[m].waiters.pop_front(tasks) {
        None => {
            realm.mutexes[m].owner = TaskId::NONE;
            return NextTask::Same;
        }
        Some(w) => usize::from(w),
    };

    // The waiter must still be parked on this exact mutex; anything else
    // means the wait queues are corrupt.
    uassert!(
        *tasks[woken].state()
            == TaskState::Healthy(SchedState::InMutexWait(abi::ObjIndex(
                m as u16
            )))
    );

    realm.mutexes[m].owner = TaskId::for_index(woken);
    tasks[woken].set_deadline(None);
    let code = tasks[woken].wake_code();
    tasks[woken].save_mut().set_result(code);
    tasks[woken].set_healthy_state(SchedState::Runnable);

    if tasks[woken]
        .priority()
        .is_more_important_than(tasks[caller].priority())
    {
        NextTask::Specific(woken)
    } else {
        NextTask::Same
    }
}

/// Hands the mutex to `index` if it is free, or queues `index` on it.
/// `code` is the syscall result the task receives once it owns the mutex;
/// this is how a timed-out or signalled condition wait resumes already
/// holding the lock.
pub(crate) fn grant_or_enqueue(
    tasks: &mut [Task],
    realm: &mut Realm,
    index: usize,
    m: usize,
    code: Kerr,
) -> NextTask {
    if realm.mutexes[m].magic != MUTEX_MAGIC {
        // The mutex died while we waited on the condition. Resume the task
        // with an error rather than strand it.
        tasks[index].save_mut().set_result(Kerr::Fail);
        tasks[index].set_healthy_state(SchedState::Runnable);
        return NextTask::Specific(index);
    }

    if realm.mutexes[m].owner == TaskId::NONE {
        realm.mutexes[m].owner = TaskId::for_index(index);
        tasks[index].save_mut().set_result(code);
        tasks[index].set_healthy_state(SchedState::Runnable);
        return NextTask::Specific(index);
    }

    realm.mutexes[m].waiters.push_back(tasks, index as u16);
    tasks[index].set_wake_code(code);
    tasks[index]
        .set_healthy_state(SchedState::InMutexWait(abi::ObjIndex(m as u16)));
    NextTask::Same
}

/// Destroys the mutex. Refused with `TaskBusy` while it is owned or
/// contended; afterwards the slot is poisoned so stale handles fault.
pub fn destroy(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
) -> Result<NextTask, UserError> {
    let m = slot(realm, arg)?;
    if realm.mutexes[m].owner != TaskId::NONE
        || !realm.mutexes[m].waiters.is_empty()
    {
        return Err(UserError::code(Kerr::TaskBusy));
    }
    realm.mutexes[m].magic = POISONED;
    realm.mutexes[m].owner = TaskId(!0);
    tasks[caller].save_mut().set_result(Kerr::Ok);
    Ok(NextTask::Same)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testutil::make_tasks;
    use crate::task::Task;

    fn owner_of(realm: &Realm, m: u16) -> TaskId {
        realm.mutexes[usize::from(m)].owner
    }

    fn lock_now(
        tasks: &mut [Task],
        realm: &mut Realm,
        caller: usize,
        m: u16,
    ) -> Result<NextTask, UserError> {
        lock(
            tasks,
            realm,
            caller,
            u32::from(m),
            None,
            Timestamp::from(0),
        )
    }

    #[test]
    fn uncontended_lock_unlock_restores_initial_state() {
        let mut tasks = make_tasks(2);
        let mut realm = Realm::new();
        let m = create(&mut realm).unwrap();

        let hint = lock_now(&mut tasks, &mut realm, 0, m).unwrap();
        assert_eq!(hint, NextTask::Same);
        assert_eq!(owner_of(&realm, m), TaskId::for_index(0));

        let hint = unlock(&mut tasks, &mut realm, 0, u32::from(m)).unwrap();
        assert_eq!(hint, NextTask::Same);
        // observably identical to just-created: free and no waiters
        assert_eq!(owner_of(&realm, m), TaskId::NONE);
        assert!(realm.mutexes[usize::from(m)].waiters.is_empty());
    }

    #[test]
    fn lock_is_not_recursive() {
        let mut tasks = make_tasks(1);
        let mut realm = Realm::new();
        let m = create(&mut realm).unwrap();

        lock_now(&mut tasks, &mut realm, 0, m).unwrap();
        match lock_now(&mut tasks, &mut realm, 0, m) {
            Err(UserError::Recoverable(Kerr::TaskBusy, _)) => (),
            other => panic!("expected TaskBusy, got {:?}", other),
        }
        match trylock(&mut tasks, &mut realm, 0, u32::from(m)) {
            Err(UserError::Recoverable(Kerr::TaskBusy, _)) => (),
            other => panic!("expected TaskBusy, got {:?}", other),
        }
    }

    #[test]
    fn unlock_requires_ownership() {
        let mut tasks = make_tasks(2);
        let mut realm = Realm::new();
        let m = create(&mut realm).unwrap();

        lock_now(&mut tasks, &mut realm, 0, m).unwrap();
        match unlock(&mut tasks, &mut realm, 1, u32::from(m)) {
            Err(UserError::Recoverable(Kerr::NotOwner, _)) => (),
            other => panic!("expected NotOwner, got {:?}", other),
        }
    }

    #[test]
    fn contended_unlock_transfers_fifo() {
        // Task 3 holds the mutex; 0, 1, 2 block on it in that order. Each
        // unlock must hand ownership to exactly the next in line, with each
        // waiter owning exactly once.
        let mut tasks = make_tasks(4);
        let mut realm = Realm::new();
        let m = create(&mut realm).unwrap();

        lock_now(&mut tasks, &mut realm, 3, m).unwrap();
        for caller in 0..3usize {
            let hint = lock_now(&mut tasks, &mut realm, caller, m).unwrap();
            assert_eq!(hint, NextTask::Other);
            assert!(!tasks[caller].is_runnable());
        }

        let mut owners = Vec::new();
        let mut holder = 3usize;
        for _ in 0..3 {
            unlock(&mut tasks, &mut realm, holder, u32::from(m)).unwrap();
            let next = owner_of(&realm, m).index().unwrap();
            // direct transfer: new owner is runnable and saw Ok
            assert!(tasks[next].is_runnable());
            assert_eq!(Kerr::from_u32(tasks[next].save().result0()), Kerr::Ok);
            owners.push(next);
            holder = next;
        }
        assert_eq!(owners, vec![0, 1, 2]);

        unlock(&mut tasks, &mut realm, holder, u32::from(m)).unwrap();
        assert_eq!(owner_of(&realm, m), TaskId::NONE);
    }

    #[test]
    fn waiters_are_blocked_and_owner_is_not() {
        let mut tasks = make_tasks(3);
        let mut realm = Realm::new();
        let m = create(&mut realm).unwrap();

        lock_now(&mut tasks, &mut realm, 0, m).unwrap();
        lock_now(&mut tasks, &mut realm, 1, m).unwrap();
        lock_now(&mut tasks, &mut realm, 2, m).unwrap();

        assert!(tasks[0].is_runnable());
        for i in 1..3 {
            assert_eq!(
                *tasks[i].state(),
                TaskState::Healthy(SchedState::InMutexWait(abi::ObjIndex(
                    u16::from(m)
                )))
            );
        }
    }

    #[test]
    fn timed_lock_expires_with_timeout() {
        let mut tasks = make_tasks(2);
        let mut realm = Realm::new();
        let m = create(&mut realm).unwrap();

        lock_now(&mut tasks, &mut realm, 0, m).unwrap();
        let hint = lock(
            &mut tasks,
            &mut realm,
            1,
            u32::from(m),
            Some(3),
            Timestamp::from(10),
        )
        .unwrap();
        assert_eq!(hint, NextTask::Other);
        assert_eq!(tasks[1].deadline(), Some(Timestamp::from(13)));

        // Tick past the deadline with no unlock in sight.
        let hint = crate::task::process_timers(
            &mut tasks,
            &mut realm,
            Timestamp::from(13),
        );
        assert_eq!(hint, NextTask::Specific(1));
        assert!(tasks[1].is_runnable());
        assert_eq!(
            Kerr::from_u32(tasks[1].save().result0()),
            Kerr::Timeout
        );
        // The queue no longer mentions the quitter; a later unlock frees
        // the mutex outright.
        unlock(&mut tasks, &mut realm, 0, u32::from(m)).unwrap();
        assert_eq!(owner_of(&realm, m), TaskId::NONE);
    }

    #[test]
    fn timed_lock_wins_race_when_granted_before_expiry() {
        let mut tasks = make_tasks(2);
        let mut realm = Realm::new();
        let m = create(&mut realm).unwrap();

        lock_now(&mut tasks, &mut realm, 0, m).unwrap();
        lock(
            &mut tasks,
            &mut realm,
            1,
            u32::from(m),
            Some(5),
            Timestamp::from(0),
        )
        .unwrap();

        unlock(&mut tasks, &mut realm, 0, u32::from(m)).unwrap();
        assert_eq!(owner_of(&realm, m), TaskId::for_index(1));
        // The grant disarmed the deadline; the tick must not disturb the
        // new owner.
        assert_eq!(tasks[1].deadline(), None);
        let hint = crate::task::process_timers(
            &mut tasks,
            &mut realm,
            Timestamp::from(100),
        );
        assert_eq!(hint, NextTask::Same);
        assert!(tasks[1].is_runnable());
    }

    #[test]
    fn destroy_refuses_busy_and_poisons_when_free() {
        let mut tasks = make_tasks(2);
        let mut realm = Realm::new();
        let m = create(&mut realm).unwrap();

        lock_now(&mut tasks, &mut realm, 0, m).unwrap();
        match destroy(&mut tasks, &mut realm, 1, u32::from(m)) {
            Err(UserError::Recoverable(Kerr::TaskBusy, _)) => (),
            other => panic!("expected TaskBusy, got {:?}", other),
        }
        // ...and the mutex remains usable.
        unlock(&mut tasks, &mut realm, 0, u32::from(m)).unwrap();
        lock_now(&mut tasks, &mut realm, 1, m).unwrap();
        unlock(&mut tasks, &mut realm, 1, u32::from(m)).unwrap();

        destroy(&mut tasks, &mut realm, 0, u32::from(m)).unwrap();
        assert_eq!(realm.mutexes[usize::from(m)].owner, TaskId(!0));
        // stale handle now faults
        match lock_now(&mut tasks, &mut realm, 0, m) {
            Err(UserError::Unrecoverable(_)) => (),
            other => panic!("expected fault, got {:?}", other),
        }
        // the poisoned slot is not handed out again either
        assert_ne!(create(&mut realm).unwrap(), m);
    }
}
