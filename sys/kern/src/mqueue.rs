// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message queues: a thin envelope over a bounded FIFO of message words.
//!
//! Messages are single words -- by convention pointers into memory the
//! sender and receiver have agreed on. None of the operations block: send
//! fails on a full queue, receive and peek come back empty-handed (zero) on
//! an empty one. Tasks wanting to block pair a queue with a semaphore.

use abi::{Kerr, UsageError};

use crate::err::UserError;
use crate::sync::{obj_index, Realm, QUEUE_COUNT};
use crate::task::{ArchState, NextTask, Task};

pub const MQ_MAGIC: u32 = 0x4d51_5545;
const POISONED: u32 = 0xdead_4d51;

/// Storage depth of every queue slot; `create` may ask for any capacity up
/// to this.
pub const QUEUE_DEPTH: usize = 32;

/// One message-queue arena slot: a circular buffer of message words.
#[derive(Clone, Debug)]
pub struct QueueSlot {
    pub magic: u32,
    capacity: u16,
    head: u16,
    len: u16,
    items: [u32; QUEUE_DEPTH],
}

impl QueueSlot {
    pub const FREE: Self = QueueSlot {
        magic: 0,
        capacity: 0,
        head: 0,
        len: 0,
        items: [0; QUEUE_DEPTH],
    };

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Allocates a queue of the given capacity (1..=`QUEUE_DEPTH` messages).
pub fn create(realm: &mut Realm, capacity: u32) -> Result<u16, Kerr> {
    if capacity == 0 || capacity > QUEUE_DEPTH as u32 {
        return Err(Kerr::Fail);
    }
    let idx = realm
        .queues
        .iter()
        .position(|q| q.magic == 0)
        .ok_or(Kerr::Fail)?;
    realm.queues[idx] = QueueSlot {
        magic: MQ_MAGIC,
        capacity: capacity as u16,
        ..QueueSlot::FREE
    };
    Ok(idx as u16)
}

fn slot(realm: &mut Realm, arg: u32) -> Result<usize, UserError> {
    let idx = obj_index(arg, QUEUE_COUNT)?;
    if realm.queues[idx].magic != MQ_MAGIC {
        return Err(UsageError::InvalidObject.into());
    }
    Ok(idx)
}

/// Appends a message word; `Fail` when the queue is at capacity.
pub fn send(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
    message: u32,
) -> Result<NextTask, UserError> {
    let q = slot(realm, arg)?;
    let queue = &mut realm.queues[q];
    if queue.len == queue.capacity {
        return Err(UserError::code(Kerr::Fail));
    }
    let tail = (queue.head + queue.len) % queue.capacity;
    queue.items[usize::from(tail)] = message;
    queue.len += 1;
    tasks[caller].save_mut().set_result(Kerr::Ok);
    Ok(NextTask::Same)
}

/// Removes and returns the head message word, or zero when empty.
pub fn recv(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
) -> Result<NextTask, UserError> {
    let q = slot(realm, arg)?;
    let queue = &mut realm.queues[q];
    let message = if queue.len == 0 {
        0
    } else {
        let m = queue.items[usize::from(queue.head)];
        queue.head = (queue.head + 1) % queue.capacity;
        queue.len -= 1;
        m
    };
    tasks[caller].save_mut().ret0(message);
    Ok(NextTask::Same)
}

/// Returns the head message word without removing it, or zero when empty.
pub fn peek(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
) -> Result<NextTask, UserError> {
    let q = slot(realm, arg)?;
    let queue = &realm.queues[q];
    let message = if queue.len == 0 {
        0
    } else {
        queue.items[usize::from(queue.head)]
    };
    tasks[caller].save_mut().ret0(message);
    Ok(NextTask::Same)
}

/// Destroys the queue. A queue still holding messages is refused with
/// `MqNotEmpty`; drain it first.
pub fn destroy(
    tasks: &mut [Task],
    realm: &mut Realm,
    caller: usize,
    arg: u32,
) -> Result<NextTask, UserError> {
    let q = slot(realm, arg)?;
    if realm.queues[q].len != 0 {
        return Err(UserError::code(Kerr::MqNotEmpty));
    }
    realm.queues[q].magic = POISONED;
    tasks[caller].save_mut().set_result(Kerr::Ok);
    Ok(NextTask::Same)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testutil::make_tasks;

    fn recv_value(
        tasks: &mut [Task],
        realm: &mut Realm,
        q: u16,
    ) -> u32 {
        recv(tasks, realm, 0, u32::from(q)).unwrap();
        tasks[0].save().result0()
    }

    #[test]
    fn create_validates_capacity() {
        let mut realm = Realm::new();
        assert_eq!(create(&mut realm, 0), Err(Kerr::Fail));
        assert_eq!(
            create(&mut realm, QUEUE_DEPTH as u32 + 1),
            Err(Kerr::Fail)
        );
        assert!(create(&mut realm, QUEUE_DEPTH as u32).is_ok());
    }

    #[test]
    fn fifo_send_recv_peek() {
        let mut tasks = make_tasks(1);
        let mut realm = Realm::new();
        let q = create(&mut realm, 4).unwrap();

        for m in [0x100u32, 0x200, 0x300] {
            send(&mut tasks, &mut realm, 0, u32::from(q), m).unwrap();
        }
        peek(&mut tasks, &mut realm, 0, u32::from(q)).unwrap();
        assert_eq!(tasks[0].save().result0(), 0x100);
        // peek did not consume
        assert_eq!(recv_value(&mut tasks, &mut realm, q), 0x100);
        assert_eq!(recv_value(&mut tasks, &mut realm, q), 0x200);
        assert_eq!(recv_value(&mut tasks, &mut realm, q), 0x300);
        // empty queue hands back null
        assert_eq!(recv_value(&mut tasks, &mut realm, q), 0);
    }

    #[test]
    fn send_fails_when_full() {
        let mut tasks = make_tasks(1);
        let mut realm = Realm::new();
        let q = create(&mut realm, 2).unwrap();

        send(&mut tasks, &mut realm, 0, u32::from(q), 1).unwrap();
        send(&mut tasks, &mut realm, 0, u32::from(q), 2).unwrap();
        match send(&mut tasks, &mut realm, 0, u32::from(q), 3) {
            Err(UserError::Recoverable(Kerr::Fail, _)) => (),
            other => panic!("expected Fail, got {:?}", other),
        }
        // wrap-around keeps order after a drain
        assert_eq!(recv_value(&mut tasks, &mut realm, q), 1);
        send(&mut tasks, &mut realm, 0, u32::from(q), 3).unwrap();
        assert_eq!(recv_value(&mut tasks, &mut realm, q), 2);
        assert_eq!(recv_value(&mut tasks, &mut realm, q), 3);
    }

    #[test]
    fn destroy_refuses_non_empty() {
        let mut tasks = make_tasks(1);
        let mut realm = Realm::new();
        let q = create(&mut realm, 2).unwrap();

        send(&mut tasks, &mut realm, 0, u32::from(q), 7).unwrap();
        match destroy(&mut tasks, &mut realm, 0, u32::from(q)) {
            Err(UserError::Recoverable(Kerr::MqNotEmpty, _)) => (),
            other => panic!("expected MqNotEmpty, got {:?}", other),
        }
        // still usable afterwards
        assert_eq!(recv_value(&mut tasks, &mut realm, q), 7);
        destroy(&mut tasks, &mut realm, 0, u32::from(q)).unwrap();
        match peek(&mut tasks, &mut realm, 0, u32::from(q)) {
            Err(UserError::Unrecoverable(_)) => (),
            other => panic!("expected fault, got {:?}", other),
        }
    }
}
