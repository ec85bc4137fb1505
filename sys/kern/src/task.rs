// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.

use abi::{
    FaultInfo, Kerr, Priority, RegionDesc, SchedState, TaskDesc, TaskFlags,
    TaskId, TaskState,
};

use crate::time::Timestamp;

/// Internal representation of a task.
///
/// Fields stay private so that scheduling state, timer state, and
/// wait-queue membership only ever change together, through this module's
/// methods.
#[repr(C)] // so location of SavedState is predictable
#[derive(Debug)]
pub struct Task {
    /// Saved machine state of the task. Must remain the first field: the
    /// context-restore path is handed a pointer to it.
    save: crate::arch::SavedState,
    /// Current priority of the task.
    priority: Priority,
    /// State used to make status and scheduling decisions.
    state: TaskState,
    /// State for tracking the task's timeout deadline.
    timer: TimerState,
    /// Restart count for this task. We increment this whenever we
    /// reinitialize the task.
    generation: u32,
    /// Link used while this task sits on a primitive's wait queue. `None`
    /// when not enqueued.
    wait_next: Option<u16>,
    /// Result to hand this task when a primitive it is blocked on is granted
    /// to it (direct ownership transfer writes this into its result
    /// register).
    wake_code: Kerr,
    /// Memory space (flexpage collection) index describing this task's view
    /// of memory, once startup has built it.
    memspace: Option<u16>,

    /// Static table defining this task's memory regions.
    region_table: &'static [&'static RegionDesc],

    /// Pointer to the descriptor used to create this task, so it can be
    /// restarted.
    descriptor: &'static TaskDesc,
}

impl Task {
    /// Builds a fresh `Task` around `descriptor`; register state is zeroed
    /// until `reinitialize` fabricates the first frame.
    pub fn from_descriptor(
        descriptor: &'static TaskDesc,
        region_table: &'static [&'static RegionDesc],
    ) -> Self {
        Task {
            priority: Priority(descriptor.priority as u8),
            state: if descriptor.flags.contains(TaskFlags::START_AT_BOOT) {
                TaskState::Healthy(SchedState::Runnable)
            } else {
                TaskState::default()
            },

            descriptor,
            region_table,

            generation: 0,
            wait_next: None,
            wake_code: Kerr::Ok,
            memspace: None,
            save: crate::arch::SavedState::default(),
            timer: TimerState::default(),
        }
    }

    /// Checks if this task is in a potentially schedulable state.
    pub fn is_runnable(&self) -> bool {
        self.state == TaskState::Healthy(SchedState::Runnable)
    }

    /// Configures this task's timeout deadline, in kernel time. `None`
    /// disables the timer.
    pub fn set_deadline(&mut self, deadline: Option<Timestamp>) {
        self.timer.deadline = deadline;
    }

    /// Reads out this task's timeout deadline.
    pub fn deadline(&self) -> Option<Timestamp> {
        self.timer.deadline
    }

    /// Restarts this task from scratch: bumps the generation, wipes kernel
    /// bookkeeping, and rebuilds the initial register frame. Application
    /// memory other than the stack paint is untouched.
    ///
    /// The task comes out `Stopped` regardless of `START_AT_BOOT`; that
    /// flag speaks only to system boot, and whoever restarts a task decides
    /// separately when it runs.
    pub fn reinitialize(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.timer = TimerState::default();
        self.wait_next = None;
        self.wake_code = Kerr::Ok;
        self.state = TaskState::default();

        crate::arch::reinitialize(self);
    }

    /// Returns a reference to the `TaskDesc` that was used to initially
    /// create this task.
    pub fn descriptor(&self) -> &'static TaskDesc {
        self.descriptor
    }

    /// Returns a reference to the task's memory region descriptor table.
    pub fn region_table(&self) -> &'static [&'static RegionDesc] {
        self.region_table
    }

    /// Returns this task's current generation number.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns this task's priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns a reference to this task's current state, for inspection.
    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Moves this task between healthy scheduling states. Faults travel a
    /// different road (`force_fault`), and faulted tasks don't come back
    /// this way.
    ///
    /// # Panics
    ///
    /// If the task is currently faulted.
    pub fn set_healthy_state(&mut self, s: SchedState) {
        let last = core::mem::replace(&mut self.state, s.into());
        if let TaskState::Faulted { .. } = last {
            panic!();
        }
    }

    /// Reads the wait-queue link. Used by `list::WaitQueue` only.
    pub fn wait_next(&self) -> Option<u16> {
        self.wait_next
    }

    /// Writes the wait-queue link. Used by `list::WaitQueue` only.
    pub fn set_wait_next(&mut self, next: Option<u16>) {
        self.wait_next = next;
    }

    /// Records the result a blocking primitive should deliver when this task
    /// is eventually granted the object it waits for.
    pub fn set_wake_code(&mut self, code: Kerr) {
        self.wake_code = code;
    }

    pub fn wake_code(&self) -> Kerr {
        self.wake_code
    }

    /// Associates this task with a memory space.
    pub fn set_memspace(&mut self, space: Option<u16>) {
        self.memspace = space;
    }

    pub fn memspace(&self) -> Option<u16> {
        self.memspace
    }

    /// Returns a reference to the saved machine state for the task.
    pub fn save(&self) -> &crate::arch::SavedState {
        &self.save
    }

    /// Returns a mutable reference to the saved machine state for the task.
    pub fn save_mut(&mut self) -> &mut crate::arch::SavedState {
        &mut self.save
    }
}

/// Interface that must be implemented by the `arch::SavedState` type. This
/// gives architecture-independent access to task state for the rest of the
/// kernel.
pub trait ArchState: Default {
    /// Reads the program counter at which the task resumes.
    fn pc(&self) -> u32;
    /// Writes the program counter at which the task resumes.
    fn set_pc(&mut self, pc: u32);
    /// Reads the stack pointer the task will resume with.
    fn stack_pointer(&self) -> u32;

    /// Reads syscall argument register 0.
    fn arg0(&self) -> u32;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> u32;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> u32;

    /// Reads the syscall descriptor (number).
    fn syscall_descriptor(&self) -> u32;

    /// Writes the syscall result register.
    fn ret0(&mut self, _: u32);
    /// Reads back the syscall result register.
    fn result0(&self) -> u32;

    /// Skips over the `ecall` instruction that raised the current trap, so
    /// the task resumes at the next instruction.
    fn advance_pc(&mut self) {
        self.set_pc(self.pc().wrapping_add(4));
    }

    /// Sets a `Kerr` result using the generic ABI.
    fn set_result(&mut self, k: Kerr) {
        self.ret0(k.as_u32());
    }
}

/// State for a task timeout timer.
///
/// Task timers are used to multiplex the hardware timer across sleeping and
/// timed-blocking tasks.
#[derive(Debug, Default)]
pub struct TimerState {
    /// Deadline, in kernel time, at which this timer should fire. If `None`,
    /// the timer is disabled.
    deadline: Option<Timestamp>,
}

/// Scheduling hint produced by operations that can unblock, sideline, or
/// hand resources to tasks. Marked `must_use`: a dropped hint is a wakeup
/// the scheduler never hears about.
#[derive(Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// The task that trapped can simply continue.
    Same,
    /// Somebody else should run, but which one is the scheduler's call; a
    /// selection pass is needed.
    Other,
    /// One task just became the obvious choice -- typically because a
    /// primitive was handed to it directly.
    Specific(usize),
}

impl NextTask {
    /// Merges the hints from two successive operations into the strongest
    /// single answer.
    pub fn combine(self, other: Self) -> Self {
        use NextTask::*;

        match (self, other) {
            (x, y) if x == y => x,
            // Two different concrete nominations cancel each other out;
            // let a selection pass sort it out.
            (Specific(_), Specific(_)) => Other,
            // A lone concrete nomination outranks the vaguer hints.
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            // Any surviving request to reschedule is kept.
            (Other, _) | (_, Other) => Other,
            (Same, Same) => Same,
        }
    }
}

/// Produces the user-visible `TaskId` for `tasks[index]`.
pub fn current_id(index: usize) -> TaskId {
    TaskId::for_index(index)
}

/// Processes all enabled timers in the task table, waking tasks whose
/// deadline has arrived by `current_time` (and disabling the timer
/// atomically with the wake).
///
/// A task whose deadline fires while it is enqueued on a blocking primitive
/// is cancelled out of that primitive's wait queue and handed
/// `Kerr::Timeout`; a plainly sleeping task just becomes runnable. Ties
/// between tasks waking on the same tick are broken later, by priority, in
/// `select`.
pub fn process_timers(
    tasks: &mut [Task],
    realm: &mut crate::sync::Realm,
    current_time: Timestamp,
) -> NextTask {
    let mut sched_hint = NextTask::Same;
    for index in 0..tasks.len() {
        match tasks[index].timer.deadline {
            Some(d) if d <= current_time => (),
            _ => continue,
        }
        tasks[index].timer.deadline = None;

        let task_hint =
            crate::sync::cancel_blocked_wait(tasks, realm, index);
        sched_hint = sched_hint.combine(task_hint);
    }
    sched_hint
}

/// Picks the task to run after `previous`: highest priority wins, equals
/// take turns.
///
/// If no tasks are runnable, the kernel dies with `NoTasks`: there is
/// nothing left to do and no idle task was configured, which is a
/// configuration error.
pub fn select(previous: usize, tasks: &[Task]) -> usize {
    match priority_scan(previous, tasks, |t| t.is_runnable()) {
        Some(i) => i,
        None => crate::fail::die_with_code(Kerr::NoTasks, 0, 0),
    }
}

/// Finds the best candidate among the tasks satisfying `pred`: the most
/// important one, and among tasks of equal importance, the first met when
/// walking the table starting just past `previous` and wrapping around.
/// Beginning the walk after the outgoing task is what rotates peers of the
/// same priority round-robin.
///
/// # Panics
///
/// If `previous` is out of bounds for `tasks`.
pub fn priority_scan(
    previous: usize,
    tasks: &[Task],
    pred: impl Fn(&Task) -> bool,
) -> Option<usize> {
    uassert!(previous < tasks.len());
    let mut choice: Option<(usize, Priority)> = None;
    for i in (previous + 1..tasks.len()).chain(0..previous + 1) {
        if !pred(&tasks[i]) {
            continue;
        }
        match choice {
            // A candidate must strictly beat the incumbent; a tie keeps
            // whoever was found first in walk order.
            Some((_, best))
                if !tasks[i].priority.is_more_important_than(best) => {}
            _ => choice = Some((i, tasks[i].priority)),
        }
    }

    choice.map(|(idx, _)| idx)
}

/// Delivers a fault to `tasks[index]`, taking it out of scheduling until
/// someone reinitializes it; faults never clear on their own.
///
/// Faulting an already-faulted task keeps the record of the healthy state
/// it originally fell out of but overwrites the fault description itself.
/// Nothing reads the older fault at that point, and the case should be
/// vanishingly rare anyway.
///
/// The returned hint forces a selection pass, since the task being faulted
/// is usually the one currently running.
pub fn force_fault(
    tasks: &mut [Task],
    index: usize,
    fault: FaultInfo,
) -> NextTask {
    let task = &mut tasks[index];
    task.state = match task.state {
        TaskState::Healthy(sched) => TaskState::Faulted {
            original_state: sched,
            fault,
        },
        TaskState::Faulted { original_state, .. } => TaskState::Faulted {
            fault,
            original_state,
        },
    };
    NextTask::Other
}
