// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Condition variables.
//!
//! `wait` is the classic atomic unlock-wait-relock: the caller is appended
//! to the condition's FIFO and marked blocked *before* its mutex is
//! released, all inside the trap critical section. A signal arriving in the
//! instant after the release therefore still finds the waiter on the list --
//! the lost-wakeup window does not exist here.
//!
//! A woken (or timed-out) waiter does not return until it holds the mutex
//! again. The re-acquisition rides the mutex's own FIFO, carrying the wait's
//! result code along, so even a timeout comes back with the lock held.

use abi::{Kerr, ObjIndex, SchedState, TaskId, UsageError};

use crate::err::UserError;
use crate::list::WaitQueue;
use crate::sync::{obj_index, Realm, COND_COUNT, MUTEX_COUNT};
use crate::task::{ArchState, NextTask, Task};
use crate::time::Timestamp;

pub const COND_MAGIC: u32 = 0x434f_4e44;
const POISONED: u32 = 0xdead_4344;

/// One condition-variable arena slot.
#[derive(Clone, Debug)]
pub struct CondSlot {
    pub magic: u32,
    pub waiters: WaitQueue,
}

impl CondSlot {
    pub const FREE: Self = CondSlot {
        magic: 0,
        waiters: WaitQueue::EMPTY,
    };
}

/// Allocates a condition-variable slot.
pub fn create(realm: &mut Realm) -> Result<u16, Kerr> {
    let idx = realm
        .conds
        .iter()
        .position(|c| c.magic == 0)
        .ok_or(Kerr::Fail)?;
    realm.conds[idx] = CondSlot {
        magic: COND_MAGIC,
        waiters: WaitQueue::EMPTY,
    };
    Ok(idx as u16)
}

fn slot(realm: &mut Realm, arg: u32) -> Result<usize, UserError> {
    let idx = obj_index(arg, COND_COUNT)?;
    if realm.conds[idx].magic != COND_MAGIC {
        return Err(UsageError::InvalidObject.into());
    }
    Ok(idx)
}

/// Atomically releases the mutex and sleeps on the condition; re-acquires
/// the mutex before the caller resumes. Precondition: the caller owns the
/// mutex (`NotOwner` otherwise).
///
/// With `timeout` set, expiry resumes the caller with `Timeout` -- after
/// re-acquiring the mutex, per the contract above.
pub fn wait(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    cond_arg: u32,
    mutex_arg: u32,
    timeout: Option<u32>,
    now: Timestamp,
) -> Result<NextTask, UserError> {
    let c = slot(realm, cond_arg)?;
    let m = obj_index(mutex_arg, MUTEX_COUNT)?;
    if realm.mutexes[m].magic != crate::mutex::MUTEX_MAGIC {
        return Err(UsageError::InvalidObject.into());
    }
    if realm.mutexes[m].owner != TaskId::for_index(caller) {
        return Err(UserError::code(Kerr::NotOwner));
    }

    // Enqueue and block first; only then let the mutex go. This ordering is
    // the whole point (see module docs).
    realm.conds[c].waiters.push_back(tasks, caller as u16);
    tasks[caller].set_wake_code(Kerr::Ok);
    tasks[caller].set_healthy_state(SchedState::InCondWait(
        ObjIndex(c as u16),
        ObjIndex(m as u16),
    ));
    if let Some(ticks) = timeout {
        tasks[caller].set_deadline(Some(now.after(ticks)));
    }

    let hint = crate::mutex::release(tasks, realm, m, caller);
    Ok(hint.combine(NextTask::Other))
}

/// Wakes the head waiter, if any. The waiter resumes once it re-owns its
/// paired mutex: immediately if the mutex is free, otherwise after riding
/// the mutex FIFO.
pub fn signal(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
) -> Result<NextTask, UserError> {
    let c = slot(realm, arg)?;
    let hint = signal_one(tasks, realm, c);
    tasks[caller].save_mut().set_result(Kerr::Ok);
    Ok(hint)
}

/// Repeats `signal` until the wait list is empty.
pub fn broadcast(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
) -> Result<NextTask, UserError> {
    let c = slot(realm, arg)?;
    let mut hint = NextTask::Same;
    while !realm.conds[c].waiters.is_empty() {
        hint = hint.combine(signal_one(tasks, realm, c));
    }
    tasks[caller].save_mut().set_result(Kerr::Ok);
    Ok(hint)
}

fn signal_one(tasks: &mut [Task], realm: &mut Realm, c: usize) -> NextTask {
    let woken = match realm.conds[c].waiters.pop_front(tasks) {
        None => return NextTask::Same,
        Some(w) => usize::from(w),
    };

    let m = match *tasks[woken].state() {
        abi::TaskState::Healthy(SchedState::InCondWait(cc, m)) => {
            uassert!(usize::from(cc.0) == c);
            usize::from(m.0)
        }
        // Wait queues and task states move together; disagreement is
        // corruption.
        _ => crate::fail::die_with_code(Kerr::Unknown, 0, 0),
    };

    tasks[woken].set_deadline(None);
    crate::mutex::grant_or_enqueue(tasks, realm, woken, m, Kerr::Ok)
}

/// Destroys the condition variable. Refused with `TaskBusy` while anything
/// waits on it.
pub fn destroy(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
) -> Result<NextTask, UserError> {
    let c = slot(realm, arg)?;
    if !realm.conds[c].waiters.is_empty() {
        return Err(UserError::code(Kerr::TaskBusy));
    }
    realm.conds[c].magic = POISONED;
    tasks[caller].save_mut().set_result(Kerr::Ok);
    Ok(NextTask::Same)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex;
    use crate::task::testutil::make_tasks;
    use abi::TaskState;

    fn locked_mutex(
        tasks: &mut [crate::task::Task],
        realm: &mut Realm,
        holder: usize,
    ) -> u16 {
        let m = mutex::create(realm).unwrap();
        mutex::lock(
            tasks,
            realm,
            holder,
            u32::from(m),
            None,
            Timestamp::from(0),
        )
        .unwrap();
        m
    }

    #[test]
    fn wait_requires_mutex_ownership() {
        let mut tasks = make_tasks(2);
        let mut realm = Realm::new();
        let c = create(&mut realm).unwrap();
        let m = locked_mutex(&mut tasks, &mut realm, 0);

        match wait(
            &mut tasks,
            &mut realm,
            1,
            u32::from(c),
            u32::from(m),
            None,
            Timestamp::from(0),
        ) {
            Err(UserError::Recoverable(Kerr::NotOwner, _)) => (),
            other => panic!("expected NotOwner, got {:?}", other),
        }
    }

    #[test]
    fn wait_releases_mutex_and_signal_reacquires() {
        let mut tasks = make_tasks(2);
        let mut realm = Realm::new();
        let c = create(&mut realm).unwrap();
        let m = locked_mutex(&mut tasks, &mut realm, 0);

        wait(
            &mut tasks,
            &mut realm,
            0,
            u32::from(c),
            u32::from(m),
            None,
            Timestamp::from(0),
        )
        .unwrap();
        // mutex released atomically with the block
        assert_eq!(realm.mutexes[usize::from(m)].owner, TaskId::NONE);
        assert_eq!(
            *tasks[0].state(),
            TaskState::Healthy(SchedState::InCondWait(
                ObjIndex(c),
                ObjIndex(m),
            ))
        );

        let hint = signal(&mut tasks, &mut realm, 1, u32::from(c)).unwrap();
        // waiter resumes owning the mutex, with Ok
        assert_eq!(hint, NextTask::Specific(0));
        assert!(tasks[0].is_runnable());
        assert_eq!(
            realm.mutexes[usize::from(m)].owner,
            TaskId::for_index(0)
        );
        assert_eq!(Kerr::from_u32(tasks[0].save().result0()), Kerr::Ok);
    }

    #[test]
    fn signalled_waiter_queues_on_busy_mutex() {
        let mut tasks = make_tasks(3);
        let mut realm = Realm::new();
        let c = create(&mut realm).unwrap();
        let m = locked_mutex(&mut tasks, &mut realm, 0);

        wait(
            &mut tasks,
            &mut realm,
            0,
            u32::from(c),
            u32::from(m),
            None,
            Timestamp::from(0),
        )
        .unwrap();
        // Task 1 grabs the mutex before the signal lands.
        mutex::lock(
            &mut tasks,
            &mut realm,
            1,
            u32::from(m),
            None,
            Timestamp::from(0),
        )
        .unwrap();

        signal(&mut tasks, &mut realm, 2, u32::from(c)).unwrap();
        // The waiter has migrated to the mutex queue, still blocked.
        assert!(!tasks[0].is_runnable());
        assert_eq!(
            *tasks[0].state(),
            TaskState::Healthy(SchedState::InMutexWait(ObjIndex(m)))
        );

        // When the interloper unlocks, the waiter finally owns the mutex.
        mutex::unlock(&mut tasks, &mut realm, 1, u32::from(m)).unwrap();
        assert!(tasks[0].is_runnable());
        assert_eq!(
            realm.mutexes[usize::from(m)].owner,
            TaskId::for_index(0)
        );
        assert_eq!(Kerr::from_u32(tasks[0].save().result0()), Kerr::Ok);
    }

    #[test]
    fn signals_wake_in_fifo_order() {
        let mut tasks = make_tasks(4);
        let mut realm = Realm::new();
        let c = create(&mut realm).unwrap();

        // Three waiters on three distinct mutexes, queued 0, 1, 2.
        let mut ms = Vec::new();
        for i in 0..3usize {
            let m = locked_mutex(&mut tasks, &mut realm, i);
            ms.push(m);
            wait(
                &mut tasks,
                &mut realm,
                i,
                u32::from(c),
                u32::from(m),
                None,
                Timestamp::from(0),
            )
            .unwrap();
        }

        for expected in 0..3usize {
            signal(&mut tasks, &mut realm, 3, u32::from(c)).unwrap();
            assert!(tasks[expected].is_runnable());
            // later waiters still asleep
            for later in expected + 1..3 {
                assert!(!tasks[later].is_runnable());
            }
        }
    }

    #[test]
    fn broadcast_empties_the_wait_list() {
        let mut tasks = make_tasks(4);
        let mut realm = Realm::new();
        let c = create(&mut realm).unwrap();

        for i in 0..3usize {
            let m = locked_mutex(&mut tasks, &mut realm, i);
            wait(
                &mut tasks,
                &mut realm,
                i,
                u32::from(c),
                u32::from(m),
                None,
                Timestamp::from(0),
            )
            .unwrap();
        }

        broadcast(&mut tasks, &mut realm, 3, u32::from(c)).unwrap();
        assert!(realm.conds[usize::from(c)].waiters.is_empty());
        for i in 0..3 {
            assert!(tasks[i].is_runnable());
        }
    }

    #[test]
    fn timed_wait_expires_owning_the_mutex() {
        let mut tasks = make_tasks(2);
        let mut realm = Realm::new();
        let c = create(&mut realm).unwrap();
        let m = locked_mutex(&mut tasks, &mut realm, 0);

        wait(
            &mut tasks,
            &mut realm,
            0,
            u32::from(c),
            u32::from(m),
            Some(3),
            Timestamp::from(0),
        )
        .unwrap();

        // Nobody signals. Three ticks later the wait gives up...
        let hint = crate::task::process_timers(
            &mut tasks,
            &mut realm,
            Timestamp::from(3),
        );
        assert_eq!(hint, NextTask::Specific(0));
        assert!(tasks[0].is_runnable());
        // ...with Timeout as the result, and the mutex back in hand.
        assert_eq!(
            Kerr::from_u32(tasks[0].save().result0()),
            Kerr::Timeout
        );
        assert_eq!(
            realm.mutexes[usize::from(m)].owner,
            TaskId::for_index(0)
        );
    }

    #[test]
    fn timed_wait_expiry_rides_mutex_fifo_when_contended() {
        let mut tasks = make_tasks(3);
        let mut realm = Realm::new();
        let c = create(&mut realm).unwrap();
        let m = locked_mutex(&mut tasks, &mut realm, 0);

        wait(
            &mut tasks,
            &mut realm,
            0,
            u32::from(c),
            u32::from(m),
            Some(2),
            Timestamp::from(0),
        )
        .unwrap();
        // Mutex snapped up by task 1 in the meantime.
        mutex::lock(
            &mut tasks,
            &mut realm,
            1,
            u32::from(m),
            None,
            Timestamp::from(0),
        )
        .unwrap();

        let _ = crate::task::process_timers(
            &mut tasks,
            &mut realm,
            Timestamp::from(2),
        );
        // Timed out, but the lock is busy: parked on the mutex now.
        assert_eq!(
            *tasks[0].state(),
            TaskState::Healthy(SchedState::InMutexWait(ObjIndex(m)))
        );

        mutex::unlock(&mut tasks, &mut realm, 1, u32::from(m)).unwrap();
        assert!(tasks[0].is_runnable());
        // Timeout still reported, mutex still owned: both halves of the
        // contract survive the detour.
        assert_eq!(
            Kerr::from_u32(tasks[0].save().result0()),
            Kerr::Timeout
        );
        assert_eq!(
            realm.mutexes[usize::from(m)].owner,
            TaskId::for_index(0)
        );
    }

    #[test]
    fn destroy_refuses_waiters() {
        let mut tasks = make_tasks(2);
        let mut realm = Realm::new();
        let c = create(&mut realm).unwrap();
        let m = locked_mutex(&mut tasks, &mut realm, 0);

        wait(
            &mut tasks,
            &mut realm,
            0,
            u32::from(c),
            u32::from(m),
            None,
            Timestamp::from(0),
        )
        .unwrap();
        match destroy(&mut tasks, &mut realm, 1, u32::from(c)) {
            Err(UserError::Recoverable(Kerr::TaskBusy, _)) => (),
            other => panic!("expected TaskBusy, got {:?}", other),
        }

        signal(&mut tasks, &mut realm, 1, u32::from(c)).unwrap();
        destroy(&mut tasks, &mut realm, 1, u32::from(c)).unwrap();
        // stale handle faults
        match signal(&mut tasks, &mut realm, 1, u32::from(c)) {
            Err(UserError::Unrecoverable(_)) => (),
            other => panic!("expected fault, got {:?}", other),
        }
    }
}
