// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared across the kernel/application boundary: error codes, task
//! identity and state, descriptors, and the syscall numbering.

#![no_std]

use serde::{Deserialize, Serialize};

/// Region slots per `TaskDesc` record. Must not exceed what the PMP can
/// hold for one task, and shrinking it cheapens context switches -- but
/// either way the value is part of the ABI.
pub const REGIONS_PER_TASK: usize = 8;

/// One-word kernel error code.
///
/// Every fallible kernel operation, and every syscall, reduces to one of
/// these. `Ok` is zero; failures are negative so user code can test a raw
/// syscall result with a sign check before decoding it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Kerr {
    Ok = 0,
    Fail = -1,
    Timeout = -2,
    TaskBusy = -3,
    NotOwner = -4,
    SemOperation = -5,
    MqNotEmpty = -6,
    PmpInvalidRegion = -7,
    PmpAddrRange = -8,
    PmpLocked = -9,
    NoTasks = -10,
    Unknown = -11,
}

impl Kerr {
    /// Encodes this code for transport in a 32-bit result register.
    pub const fn as_u32(self) -> u32 {
        self as i32 as u32
    }

    /// Decodes a result register. Values that aren't valid codes come back as
    /// `Unknown` rather than panicking, since the register contents may be
    /// attacker- (or merely bug-) controlled.
    pub fn from_u32(v: u32) -> Self {
        match v as i32 {
            0 => Kerr::Ok,
            -1 => Kerr::Fail,
            -2 => Kerr::Timeout,
            -3 => Kerr::TaskBusy,
            -4 => Kerr::NotOwner,
            -5 => Kerr::SemOperation,
            -6 => Kerr::MqNotEmpty,
            -7 => Kerr::PmpInvalidRegion,
            -8 => Kerr::PmpAddrRange,
            -9 => Kerr::PmpLocked,
            -10 => Kerr::NoTasks,
            _ => Kerr::Unknown,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Kerr::Ok
    }
}

impl From<Kerr> for u32 {
    fn from(e: Kerr) -> Self {
        e.as_u32()
    }
}

/// Names a task as seen by other tasks.
///
/// Task identifiers are 1-based: id `N` designates the task at index `N - 1`
/// of the task table. Zero is reserved as the "no task" sentinel used by
/// synchronization objects to mean "unowned," and `!0` marks a destroyed
/// object's owner slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TaskId(pub u16);

impl TaskId {
    /// Sentinel meaning "no task" / "unowned."
    pub const NONE: Self = Self(0);

    /// Fabricates the id of the task at `index` in the task table.
    pub const fn for_index(index: usize) -> Self {
        TaskId(index as u16 + 1)
    }

    /// Extracts the task-table index, or `None` for the sentinel values.
    pub fn index(&self) -> Option<usize> {
        if self.0 == 0 || self.0 == !0 {
            None
        } else {
            Some(usize::from(self.0) - 1)
        }
    }
}

/// Indicates priority of a task.
///
/// Small numbers starting at zero, with zero the most important -- the
/// scheduler reaches for the numerically lowest runnable priority first.
///
/// There is intentionally no `PartialOrd`/`Ord` here: with the scale
/// inverted like this, a bare `<` would invite exactly the off-by-polarity
/// bugs the named method avoids.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`, hiding
    /// the inverted numeric scale from callers.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Index of a kernel synchronization object slot (mutex, condition variable,
/// semaphore, or message queue), as handed to user code by the `*Create`
/// syscalls.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ObjIndex(pub u16);

/// State used to make scheduling decisions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskState {
    /// Task is healthy and can be scheduled subject to the `SchedState`
    /// requirements.
    Healthy(SchedState),
    /// Task has been stopped by a fault and must not be scheduled without
    /// intervention.
    Faulted {
        /// Information about the fault.
        fault: FaultInfo,
        /// Record of the previous healthy state at the time the fault was
        /// taken.
        original_state: SchedState,
    },
}

impl TaskState {
    /// Checks whether a task in this state is parked on some blocking
    /// primitive or delay, i.e. eligible for timeout cancellation.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            TaskState::Healthy(SchedState::Delayed)
                | TaskState::Healthy(SchedState::InMutexWait(_))
                | TaskState::Healthy(SchedState::InCondWait(_, _))
                | TaskState::Healthy(SchedState::InSemWait(_))
        )
    }
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::Healthy(SchedState::Stopped)
    }
}

/// Scheduler parameters for a healthy task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SchedState {
    /// This task is ignored for scheduling purposes.
    Stopped,
    /// This task could be scheduled on the CPU.
    Runnable,
    /// This task is sleeping until its timer deadline passes.
    Delayed,
    /// This task is enqueued waiting for ownership of the given mutex.
    InMutexWait(ObjIndex),
    /// This task is enqueued on the given condition variable, paired with
    /// the mutex it released atomically before sleeping.
    InCondWait(ObjIndex, ObjIndex),
    /// This task is enqueued waiting on the given semaphore.
    InSemWait(ObjIndex),
}

impl From<SchedState> for TaskState {
    fn from(s: SchedState) -> Self {
        Self::Healthy(s)
    }
}

/// A record describing a fault taken by a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultInfo {
    /// The task has violated memory access rules. This may have come from a
    /// PMP violation while executing the task (in the case of `source`
    /// `User`), or from checks on kernel syscall arguments (`source`
    /// `Kernel`).
    MemoryAccess {
        /// Problematic address that the task accessed, or asked the kernel
        /// to access. This is `Option` because there are cases of protection
        /// faults that don't provide a precise address.
        address: Option<u32>,
        /// Origin of the fault.
        source: FaultSource,
    },
    /// A task has overflowed its stack. We can always determine the bad
    /// stack address, but we can't determine the PC.
    StackOverflow { address: u32 },
    /// Attempt to execute non-executable memory.
    IllegalText,
    /// Execution of an illegal instruction, such as a privileged CSR access
    /// from U-mode.
    IllegalInstruction,
    /// Arguments passed to a syscall were invalid.
    SyscallUsage(UsageError),
    /// A task has explicitly aborted itself with a panic.
    Panic,
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// A kernel-defined fault, arising from how a user task behaved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UsageError {
    /// A program used an undefined syscall number.
    BadSyscallNumber,
    /// A program named a synchronization object slot that does not hold a
    /// live object of the expected kind. This is how use-after-destroy is
    /// caught: destroyed slots fail their magic check and land here.
    InvalidObject,
    /// A program named a task id that will never be valid, as it's out of
    /// range.
    TaskOutOfRange,
    /// A wakeup operation found the designated task in a state other than
    /// blocked-on-this-primitive, indicating kernel state corruption.
    NotBlocked,
}

/// Origin of a memory access fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultSource {
    /// User code did it directly.
    User,
    /// Kernel code did it on behalf of the user.
    Kernel,
}

/// Eviction priority of a memory region / flexpage.
///
/// Numerically lower is more important and thus *least* eligible for
/// eviction when hardware protection slots run out. Kernel-priority regions
/// are never evicted while the kernel is live.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[repr(u8)]
pub enum RegionPriority {
    Kernel = 0,
    Stack = 1,
    Shared = 2,
    Temporary = 3,
}

bitflags::bitflags! {
    /// Flags describing what can be done with a memory region.
    #[derive(Serialize, Deserialize)]
    #[repr(transparent)]
    pub struct RegionAttributes: u32 {
        /// Region can be read by tasks that include it.
        const READ = 1 << 0;
        /// Region can be written by tasks that include it.
        const WRITE = 1 << 1;
        /// Region can contain executable code for tasks that include it.
        const EXECUTE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Collection of boolean flags controlling task behavior.
    #[derive(Serialize, Deserialize)]
    #[repr(transparent)]
    pub struct TaskFlags: u32 {
        /// Task is marked Runnable at boot rather than Stopped.
        const START_AT_BOOT = 1 << 0;
        /// Task executes in U-mode behind the PMP, rather than M-mode.
        const USER_MODE = 1 << 1;
    }
}

/// Description of one memory region.
///
/// Several tasks may name the same region: every task points its unused
/// descriptor slots at the no-access filler region (entry 0 by
/// convention), and genuinely shared RAM works the same way.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[repr(C)]
pub struct RegionDesc {
    /// Address of start of region.
    pub base: u32,
    /// Size of region, in bytes.
    pub size: u32,
    /// Flags describing what can be done with this region.
    pub attributes: RegionAttributes,
    /// How reluctantly this region gives up its hardware protection slot.
    pub priority: RegionPriority,
}

/// Record describing a single task.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[repr(C)]
pub struct TaskDesc {
    /// Indices into the `RegionDesc` table naming the memory this task may
    /// touch. All `REGIONS_PER_TASK` slots are always meaningful; point
    /// the spares at the no-access filler region (entry 0 by convention).
    pub regions: [u8; REGIONS_PER_TASK],
    /// Address of the task's entry point. This is the first instruction that
    /// will be executed whenever the task is (re)started.
    pub entry_point: u32,
    /// Address of the task's initial stack pointer, to be loaded at
    /// (re)start. Must be 16-byte aligned per the RISC-V calling convention.
    pub initial_stack: u32,
    /// Initial priority of this task.
    pub priority: u32,
    /// Collection of boolean flags controlling task behavior.
    pub flags: TaskFlags,
}

/// Description of one statically-declared memory pool, used to prime the
/// PMP at boot. The standard five pools cover kernel text, data, bss, heap,
/// and stack, all at `Kernel` priority.
#[derive(Clone, Debug)]
pub struct MemoryPool {
    /// Human-readable tag, for logging only.
    pub name: &'static str,
    /// Inclusive start address.
    pub start: u32,
    /// Exclusive end address; this is the value a Top-Of-Range protection
    /// slot actually holds.
    pub end: u32,
    /// Access permitted within the pool.
    pub attributes: RegionAttributes,
    /// Eviction priority; boot pools are `Kernel`.
    pub priority: RegionPriority,
}

/// Syscall numbers, as passed in register `a7`.
///
/// Arguments travel in `a0..a2` and the result comes back in `a0`; see the
/// kernel's syscall gate for per-call signatures.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Yield = 0,
    GetTaskId = 1,
    Uptime = 2,
    Sleep = 3,
    ConsolePutc = 4,
    ConsoleGetc = 5,
    MutexCreate = 6,
    MutexLock = 7,
    MutexTryLock = 8,
    MutexTimedLock = 9,
    MutexUnlock = 10,
    MutexDestroy = 11,
    CondCreate = 12,
    CondWait = 13,
    CondTimedWait = 14,
    CondSignal = 15,
    CondBroadcast = 16,
    CondDestroy = 17,
    SemCreate = 18,
    SemWait = 19,
    SemTryWait = 20,
    SemPost = 21,
    SemDestroy = 22,
    QueueCreate = 23,
    QueueDestroy = 24,
    QueueSend = 25,
    QueueRecv = 26,
    QueuePeek = 27,
    Panic = 28,
}

/// Decoding is a spelled-out `TryFrom` rather than a `FromPrimitive`
/// derive; pulling `num-traits` into the kernel for one match arm per call
/// wasn't worth it.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Yield),
            1 => Ok(Self::GetTaskId),
            2 => Ok(Self::Uptime),
            3 => Ok(Self::Sleep),
            4 => Ok(Self::ConsolePutc),
            5 => Ok(Self::ConsoleGetc),
            6 => Ok(Self::MutexCreate),
            7 => Ok(Self::MutexLock),
            8 => Ok(Self::MutexTryLock),
            9 => Ok(Self::MutexTimedLock),
            10 => Ok(Self::MutexUnlock),
            11 => Ok(Self::MutexDestroy),
            12 => Ok(Self::CondCreate),
            13 => Ok(Self::CondWait),
            14 => Ok(Self::CondTimedWait),
            15 => Ok(Self::CondSignal),
            16 => Ok(Self::CondBroadcast),
            17 => Ok(Self::CondDestroy),
            18 => Ok(Self::SemCreate),
            19 => Ok(Self::SemWait),
            20 => Ok(Self::SemTryWait),
            21 => Ok(Self::SemPost),
            22 => Ok(Self::SemDestroy),
            23 => Ok(Self::QueueCreate),
            24 => Ok(Self::QueueDestroy),
            25 => Ok(Self::QueueSend),
            26 => Ok(Self::QueueRecv),
            27 => Ok(Self::QueuePeek),
            28 => Ok(Self::Panic),
            _ => Err(()),
        }
    }
}
