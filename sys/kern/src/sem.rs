// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores.
//!
//! Same blocking discipline as the mutex: waiters queue FIFO inside the trap
//! critical section, and `post` wakes the head waiter directly instead of
//! bumping the count, so a post can never be consumed by a late arrival
//! racing past a queued waiter.

use abi::{Kerr, ObjIndex, SchedState, TaskState, UsageError};

use crate::err::UserError;
use crate::list::WaitQueue;
use crate::sync::{obj_index, Realm, SEM_COUNT};
use crate::task::{ArchState, NextTask, Task};

pub const SEM_MAGIC: u32 = 0x5345_4d41;
const POISONED: u32 = 0xdead_534d;

/// One semaphore arena slot.
#[derive(Clone, Debug)]
pub struct SemSlot {
    pub magic: u32,
    pub count: u32,
    pub max_count: u32,
    pub waiters: WaitQueue,
}

impl SemSlot {
    pub const FREE: Self = SemSlot {
        magic: 0,
        count: 0,
        max_count: 0,
        waiters: WaitQueue::EMPTY,
    };
}

/// Allocates a semaphore with the given initial and maximum counts.
pub fn create(
    realm: &mut Realm,
    initial: u32,
    max_count: u32,
) -> Result<u16, Kerr> {
    if max_count == 0 || initial > max_count {
        return Err(Kerr::SemOperation);
    }
    let idx = realm
        .sems
        .iter()
        .position(|s| s.magic == 0)
        .ok_or(Kerr::Fail)?;
    realm.sems[idx] = SemSlot {
        magic: SEM_MAGIC,
        count: initial,
        max_count,
        waiters: WaitQueue::EMPTY,
    };
    Ok(idx as u16)
}

fn slot(realm: &mut Realm, arg: u32) -> Result<usize, UserError> {
    let idx = obj_index(arg, SEM_COUNT)?;
    if realm.sems[idx].magic != SEM_MAGIC {
        return Err(UsageError::InvalidObject.into());
    }
    Ok(idx)
}

/// Takes one unit, blocking FIFO when the count is exhausted.
pub fn wait(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
) -> Result<NextTask, UserError> {
    let s = slot(realm, arg)?;
    if realm.sems[s].count > 0 {
        realm.sems[s].count -= 1;
        tasks[caller].save_mut().set_result(Kerr::Ok);
        return Ok(NextTask::Same);
    }
    realm.sems[s].waiters.push_back(tasks, caller as u16);
    tasks[caller].set_wake_code(Kerr::Ok);
    tasks[caller]
        .set_healthy_state(SchedState::InSemWait(ObjIndex(s as u16)));
    Ok(NextTask::Other)
}

/// Takes one unit only if available right now; `SemOperation` otherwise.
pub fn trywait(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
) -> Result<NextTask, UserError> {
    let s = slot(realm, arg)?;
    if realm.sems[s].count == 0 {
        return Err(UserError::code(Kerr::SemOperation));
    }
    realm.sems[s].count -= 1;
    tasks[caller].save_mut().set_result(Kerr::Ok);
    Ok(NextTask::Same)
}

/// Returns one unit. Hands it straight to the head waiter when someone is
/// queued; otherwise bumps the count, refusing to exceed the maximum.
pub fn post(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
) -> Result<NextTask, UserError> {
    let s = slot(realm, arg)?;

    let woken = match realm.sems[s].waiters.pop_front(tasks) {
        None => {
            if realm.sems[s].count == realm.sems[s].max_count {
                return Err(UserError::code(Kerr::SemOperation));
            }
            realm.sems[s].count += 1;
            tasks[caller].save_mut().set_result(Kerr::Ok);
            return Ok(NextTask::Same);
        }
        Some(w) => usize::from(w),
    };

    uassert!(
        *tasks[woken].state()
            == TaskState::Healthy(SchedState::InSemWait(ObjIndex(s as u16)))
    );
    tasks[woken].set_deadline(None);
    let code = tasks[woken].wake_code();
    tasks[woken].save_mut().set_result(code);
    tasks[woken].set_healthy_state(SchedState::Runnable);
    tasks[caller].save_mut().set_result(Kerr::Ok);

    if tasks[woken]
        .priority()
        .is_more_important_than(tasks[caller].priority())
    {
        Ok(NextTask::Specific(woken))
    } else {
        Ok(NextTask::Same)
    }
}

/// Destroys the semaphore. Refused with `TaskBusy` while anything waits.
pub fn destroy(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
) -> Result<NextTask, UserError> {
    let s = slot(realm, arg)?;
    if !realm.sems[s].waiters.is_empty() {
        return Err(UserError::code(Kerr::TaskBusy));
    }
    realm.sems[s].magic = POISONED;
    tasks[caller].save_mut().set_result(Kerr::Ok);
    Ok(NextTask::Same)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testutil::make_tasks;

    #[test]
    fn create_validates_counts() {
        let mut realm = Realm::new();
        assert_eq!(create(&mut realm, 0, 0), Err(Kerr::SemOperation));
        assert_eq!(create(&mut realm, 5, 4), Err(Kerr::SemOperation));
        assert!(create(&mut realm, 2, 4).is_ok());
    }

    #[test]
    fn wait_decrements_then_blocks() {
        let mut tasks = make_tasks(3);
        let mut realm = Realm::new();
        let s = create(&mut realm, 1, 4).unwrap();

        let hint = wait(&mut tasks, &mut realm, 0, u32::from(s)).unwrap();
        assert_eq!(hint, NextTask::Same);
        assert_eq!(realm.sems[usize::from(s)].count, 0);

        let hint = wait(&mut tasks, &mut realm, 1, u32::from(s)).unwrap();
        assert_eq!(hint, NextTask::Other);
        assert!(!tasks[1].is_runnable());

        // post goes straight to the queued waiter; the count stays at 0
        post(&mut tasks, &mut realm, 0, u32::from(s)).unwrap();
        assert!(tasks[1].is_runnable());
        assert_eq!(realm.sems[usize::from(s)].count, 0);
    }

    #[test]
    fn trywait_never_blocks() {
        let mut tasks = make_tasks(1);
        let mut realm = Realm::new();
        let s = create(&mut realm, 0, 4).unwrap();
        match trywait(&mut tasks, &mut realm, 0, u32::from(s)) {
            Err(UserError::Recoverable(Kerr::SemOperation, _)) => (),
            other => panic!("expected SemOperation, got {:?}", other),
        }
    }

    #[test]
    fn post_respects_max_count() {
        let mut tasks = make_tasks(1);
        let mut realm = Realm::new();
        let s = create(&mut realm, 1, 1).unwrap();
        match post(&mut tasks, &mut realm, 0, u32::from(s)) {
            Err(UserError::Recoverable(Kerr::SemOperation, _)) => (),
            other => panic!("expected SemOperation, got {:?}", other),
        }
    }

    #[test]
    fn posts_wake_fifo() {
        let mut tasks = make_tasks(4);
        let mut realm = Realm::new();
        let s = create(&mut realm, 0, 4).unwrap();

        for i in 0..3usize {
            wait(&mut tasks, &mut realm, i, u32::from(s)).unwrap();
        }
        for expected in 0..3usize {
            post(&mut tasks, &mut realm, 3, u32::from(s)).unwrap();
            assert!(tasks[expected].is_runnable());
            for later in expected + 1..3 {
                assert!(!tasks[later].is_runnable());
            }
        }
    }

    #[test]
    fn destroy_refuses_waiters_then_poisons() {
        let mut tasks = make_tasks(2);
        let mut realm = Realm::new();
        let s = create(&mut realm, 0, 4).unwrap();

        wait(&mut tasks, &mut realm, 0, u32::from(s)).unwrap();
        match destroy(&mut tasks, &mut realm, 1, u32::from(s)) {
            Err(UserError::Recoverable(Kerr::TaskBusy, _)) => (),
            other => panic!("expected TaskBusy, got {:?}", other),
        }

        post(&mut tasks, &mut realm, 1, u32::from(s)).unwrap();
        destroy(&mut tasks, &mut realm, 1, u32::from(s)).unwrap();
        match wait(&mut tasks, &mut realm, 0, u32::from(s)) {
            Err(UserError::Unrecoverable(_)) => (),
            other => panic!("expected fault, got {:?}", other),
        }
    }
}
