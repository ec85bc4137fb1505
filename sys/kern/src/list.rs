// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! FIFO wait queues.
//!
//! A `WaitQueue` strings suspended tasks together through the `wait_next`
//! link embedded in each task control block, so the queue itself is two
//! `u16` indices and owns no storage. A task can sit on at most one queue at
//! a time, which is what makes the embedded link sufficient.
//!
//! Push-back and pop-front are O(1); `remove` (timeout cancellation of a
//! waiter buried mid-queue) walks the chain and is O(n) in queue length.

use crate::task::Task;

/// FIFO queue of task-table indices.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct WaitQueue {
    head: Option<u16>,
    tail: Option<u16>,
}

impl WaitQueue {
    pub const EMPTY: Self = WaitQueue {
        head: None,
        tail: None,
    };

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Appends the task at `index` to the back of the queue.
    ///
    /// The task must not currently be on any queue; its link must be clear.
    pub fn push_back(&mut self, tasks: &mut [Task], index: u16) {
        uassert!(tasks[usize::from(index)].wait_next().is_none());
        match self.tail {
            None => {
                self.head = Some(index);
            }
            Some(t) => {
                tasks[usize::from(t)].set_wait_next(Some(index));
            }
        }
        self.tail = Some(index);
    }

    /// Detaches and returns the index at the front of the queue, preserving
    /// the FIFO order of the rest.
    pub fn pop_front(&mut self, tasks: &mut [Task]) -> Option<u16> {
        let index = self.head?;
        let next = tasks[usize::from(index)].wait_next();
        self.head = next;
        if next.is_none() {
            self.tail = None;
        }
        tasks[usize::from(index)].set_wait_next(None);
        Some(index)
    }

    /// Unlinks `index` from wherever it sits in the queue. Returns `true` if
    /// it was found.
    ///
    /// This is the timeout-cancellation path; the queue order of the
    /// remaining waiters is unchanged.
    pub fn remove(&mut self, tasks: &mut [Task], index: u16) -> bool {
        let mut prev: Option<u16> = None;
        let mut cursor = self.head;
        while let Some(c) = cursor {
            let next = tasks[usize::from(c)].wait_next();
            if c == index {
                match prev {
                    None => self.head = next,
                    Some(p) => tasks[usize::from(p)].set_wait_next(next),
                }
                if self.tail == Some(c) {
                    self.tail = prev;
                }
                tasks[usize::from(c)].set_wait_next(None);
                return true;
            }
            prev = cursor;
            cursor = next;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testutil::make_tasks;

    #[test]
    fn fifo_order() {
        let mut tasks = make_tasks(4);
        let mut q = WaitQueue::EMPTY;
        for i in [2u16, 0, 3] {
            q.push_back(&mut tasks, i);
        }
        assert_eq!(q.pop_front(&mut tasks), Some(2));
        assert_eq!(q.pop_front(&mut tasks), Some(0));
        assert_eq!(q.pop_front(&mut tasks), Some(3));
        assert_eq!(q.pop_front(&mut tasks), None);
        assert!(q.is_empty());
    }

    #[test]
    fn remove_midst_preserves_order() {
        let mut tasks = make_tasks(5);
        let mut q = WaitQueue::EMPTY;
        for i in 0..5u16 {
            q.push_back(&mut tasks, i);
        }
        assert!(q.remove(&mut tasks, 2));
        assert!(!q.remove(&mut tasks, 2));
        let mut order = Vec::new();
        while let Some(i) = q.pop_front(&mut tasks) {
            order.push(i);
        }
        assert_eq!(order, vec![0, 1, 3, 4]);
    }

    #[test]
    fn remove_tail_then_push() {
        let mut tasks = make_tasks(3);
        let mut q = WaitQueue::EMPTY;
        q.push_back(&mut tasks, 0);
        q.push_back(&mut tasks, 1);
        assert!(q.remove(&mut tasks, 1));
        // tail must have been rewound for this push to link correctly
        q.push_back(&mut tasks, 2);
        assert_eq!(q.pop_front(&mut tasks), Some(0));
        assert_eq!(q.pop_front(&mut tasks), Some(2));
        assert_eq!(q.pop_front(&mut tasks), None);
    }
}
