// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side architecture simulation, used by the unit tests.
//!
//! Register state is an ordinary struct, time is an atomic the tests can
//! wind forward, and the PMP "hardware" forgets everything it is told. No
//! simulation of traps is attempted; tests drive the dispatcher and syscall
//! layers directly.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::pmp::PmpSink;
use crate::task;
use crate::time::Timestamp;

/// Stand-in for the saved register frame: just the slots the portable
/// kernel actually reads and writes, as plain fields so tests can set up
/// syscall arguments directly.
#[derive(Clone, Debug, Default)]
pub struct SavedState {
    pub pc: u32,
    pub sp: u32,
    pub a0: u32,
    pub a1: u32,
    pub a2: u32,
    pub a7: u32,
}

impl task::ArchState for SavedState {
    fn pc(&self) -> u32 {
        self.pc
    }
    fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }
    fn stack_pointer(&self) -> u32 {
        self.sp
    }

    fn arg0(&self) -> u32 {
        self.a0
    }
    fn arg1(&self) -> u32 {
        self.a1
    }
    fn arg2(&self) -> u32 {
        self.a2
    }

    fn syscall_descriptor(&self) -> u32 {
        self.a7
    }

    fn ret0(&mut self, x: u32) {
        self.a0 = x;
    }
    fn result0(&self) -> u32 {
        self.a0
    }
}

static CLOCK_FREQ: AtomicUsize = AtomicUsize::new(0);
static TICKS: AtomicU64 = AtomicU64::new(0);
static CURRENT_TASK: AtomicUsize = AtomicUsize::new(0);

pub fn set_clock_freq(tick_divisor: u32) {
    CLOCK_FREQ.store(tick_divisor as usize, Ordering::Relaxed);
}

/// Reads the tick counter.
pub fn now() -> Timestamp {
    Timestamp::from(TICKS.load(Ordering::Relaxed))
}

/// Test hook: winds the clock to an absolute tick count.
pub fn set_ticks(t: u64) {
    TICKS.store(t, Ordering::Relaxed);
}

pub fn reset_timer() {}

pub fn current_task_index() -> usize {
    CURRENT_TASK.load(Ordering::Relaxed)
}

pub fn set_current_task_index(index: usize) {
    CURRENT_TASK.store(index, Ordering::Relaxed);
}

/// Rebuilds a task's initial frame from its descriptor. The fake skips the
/// stack zap; there is no stack to scribble on.
pub fn reinitialize(task: &mut task::Task) {
    *task.save_mut() = SavedState {
        pc: task.descriptor().entry_point,
        sp: task.descriptor().initial_stack,
        ..SavedState::default()
    };
}

pub fn start_first_task(_tick_divisor: u32, _task: &mut task::Task) -> ! {
    panic!("cannot enter userland on the host");
}

/// PMP "hardware" for the host: accepts and discards writes. Tests that
/// care about CSR traffic use their own recording sink against `PmpBank`
/// directly.
pub struct PmpCsr;

impl PmpSink for PmpCsr {
    fn read_cfg(&self, _csr: usize) -> u32 {
        0
    }
    fn write_cfg(&mut self, _csr: usize, _v: u32) {}
    fn write_addr(&mut self, _slot: usize, _end: u32) {}
}
