// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The application hands us its static configuration -- task descriptors,
//! the region table they index, and the standard kernel memory pools -- and
//! we build the live kernel out of it: the task table, one memory space per
//! task, the PMP shadow primed with the kernel pools, and finally the first
//! dispatch into the idle task.
//!
//! This module also owns the kernel's singletons: the task table pointer and
//! the kernel control block (`KernelState`), reachable from trap context via
//! `with_task_table` / `with_kcb`.

use core::mem::MaybeUninit;
use core::ptr::NonNull;

use abi::{MemoryPool, RegionDesc, TaskDesc, REGIONS_PER_TASK};

use crate::fpage::FpagePool;
use crate::pmp::PmpBank;
use crate::sync::Realm;
use crate::syscalls;
use crate::task::Task;

/// Capacity of the static task table; applications may configure fewer.
pub const MAX_TASKS: usize = 8;

/// Static application configuration, assembled by the board/application
/// crate and handed to `start_kernel`.
pub struct AppDef {
    /// One descriptor per task. Entry 0 is the idle task by convention: it
    /// must be `START_AT_BOOT` and should carry the numerically largest
    /// (least important) priority.
    pub tasks: &'static [TaskDesc],
    /// The region descriptors the tasks index into.
    pub regions: &'static [RegionDesc],
    /// The standard kernel pools (text, data, bss, heap, stack), used to
    /// prime the PMP at boot.
    pub pools: &'static [MemoryPool],
}

/// The kernel control block: every singleton the trap paths need, in one
/// place so borrow splitting stays easy.
pub struct KernelState {
    pub pmp: PmpBank,
    pub fpages: FpagePool,
    pub realm: Realm,
    /// When clear, the timer tick still wakes sleepers but never forces a
    /// round-robin switch.
    pub preemption: bool,
}

static mut KCB: KernelState = KernelState {
    pmp: PmpBank::new(),
    fpages: FpagePool::new(),
    realm: Realm::new(),
    preemption: true,
};

/// Grants access to the kernel control block.
///
/// # Safety
///
/// Only call from kernel context (startup or trap handling), where access
/// is serialized. Do not call reentrantly from within `body`.
pub unsafe fn with_kcb<R>(body: impl FnOnce(&mut KernelState) -> R) -> R {
    // Safety: per the contract above there is exactly one live reference.
    body(unsafe { &mut *core::ptr::addr_of_mut!(KCB) })
}

/// Enables or disables preemptive rescheduling on the timer tick.
pub fn set_preemption(enabled: bool) {
    // Safety: single-word write from kernel context.
    unsafe { with_kcb(|kcb| kcb.preemption = enabled) }
}

static mut TASK_TABLE_BASE: Option<NonNull<Task>> = None;
static mut TASK_TABLE_SIZE: usize = 0;

/// Records the live task table for `with_task_table`.
///
/// # Safety
///
/// Call once, from startup, with the table that will stay alive for the
/// rest of the boot. After this, the table must only be touched through
/// `with_task_table`.
pub unsafe fn set_task_table(tasks: &mut [Task]) {
    unsafe {
        TASK_TABLE_BASE = Some(NonNull::from(&mut tasks[0]));
        TASK_TABLE_SIZE = tasks.len();
    }
}

/// Grants access to the task table.
///
/// # Safety
///
/// Only call from kernel context, where access is serialized, and not
/// reentrantly from within `body` -- that would alias the table.
pub unsafe fn with_task_table<R>(body: impl FnOnce(&mut [Task]) -> R) -> R {
    // Safety: per the contract above there is exactly one live reference.
    let tasks = unsafe {
        core::slice::from_raw_parts_mut(
            TASK_TABLE_BASE.expect("kernel not started").as_ptr(),
            TASK_TABLE_SIZE,
        )
    };
    body(tasks)
}

/// Loads the PMP with `task`'s memory space. Called on every context switch
/// by `syscalls::switch_to`; quietly a no-op for tasks without a memory
/// space and on hosts where the PMP was never brought up.
pub fn apply_memory_protection(task: &Task) {
    let space = match task.memspace() {
        Some(s) => s,
        None => return,
    };
    // Safety: called from kernel context only (startup and trap paths).
    unsafe {
        with_kcb(|kcb| {
            if !kcb.pmp.is_initialized() {
                return;
            }
            let mut sink = crate::arch::PmpCsr;
            let KernelState { pmp, fpages, .. } = kcb;
            if let Err(e) = fpages.activate(pmp, &mut sink, space) {
                klog!("memprot: activate failed: {:?}", e);
            }
        })
    }
}

static mut TASK_TABLE_SPACE: MaybeUninit<[Task; MAX_TASKS]> =
    MaybeUninit::uninit();
static mut REGION_TABLE_SPACE: MaybeUninit<
    [[&'static RegionDesc; REGIONS_PER_TASK]; MAX_TASKS],
> = MaybeUninit::uninit();

/// The main kernel entry point.
///
/// The application provides its own `main`-equivalent function, which does
/// basic hardware setup (console hooks, mostly) and then calls this.
///
/// `tick_divisor` is the platform's way of converting machine time into
/// kernel ticks: mtime counts per tick.
///
/// # Safety
///
/// This can be called exactly once per boot.
pub unsafe fn start_kernel(tick_divisor: u32, app: &'static AppDef) -> ! {
    klog!("boot: begin");

    // Record the tick rate first; debuggers fish it out of memory even
    // when boot goes sideways later.
    crate::arch::set_clock_freq(tick_divisor);

    // Everything past this point works on ordinary references; the unsafe
    // part is conjuring them out of the statics exactly once.
    unsafe {
        safe_start_kernel(
            app,
            &mut *core::ptr::addr_of_mut!(TASK_TABLE_SPACE),
            &mut *core::ptr::addr_of_mut!(REGION_TABLE_SPACE),
            tick_divisor,
        )
    }
}

fn safe_start_kernel(
    app: &'static AppDef,
    task_space: &'static mut MaybeUninit<[Task; MAX_TASKS]>,
    region_space: &'static mut MaybeUninit<
        [[&'static RegionDesc; REGIONS_PER_TASK]; MAX_TASKS],
    >,
    tick_divisor: u32,
) -> ! {
    klog!("boot: building tables");

    uassert!(!app.tasks.is_empty());
    uassert!(app.tasks.len() <= MAX_TASKS);
    let n = app.tasks.len();

    // Each task gets a flat array of region references up front, so the
    // hot paths never chase descriptor indices.

    // Safety: viewing MaybeUninit of an array as an array of MaybeUninit
    // changes nothing about validity.
    let region_tables: &mut [[MaybeUninit<&'static RegionDesc>;
             REGIONS_PER_TASK]; MAX_TASKS] =
        unsafe { &mut *(region_space as *mut _ as *mut _) };

    for (i, table) in region_tables[..n].iter_mut().enumerate() {
        for (slot, &index) in table.iter_mut().zip(app.tasks[i].regions.iter())
        {
            *slot = MaybeUninit::new(&app.regions[usize::from(index)]);
        }
    }

    // Safety: we have fully initialized the first `n` rows and only expose
    // those. We're also dropping &mut.
    let region_tables: &'static [[&'static RegionDesc; REGIONS_PER_TASK]] = unsafe {
        core::slice::from_raw_parts(
            region_tables.as_ptr() as *const [&'static RegionDesc;
                 REGIONS_PER_TASK],
            n,
        )
    };

    // Now the task table itself.
    // Safety: same MaybeUninit-of-array to array-of-MaybeUninit view as
    // above.
    let task_table: &mut [MaybeUninit<Task>; MAX_TASKS] =
        unsafe { &mut *(task_space as *mut _ as *mut _) };
    for (i, task) in task_table[..n].iter_mut().enumerate() {
        *task = MaybeUninit::new(Task::from_descriptor(
            &app.tasks[i],
            &region_tables[i],
        ));
    }

    // Safety: we have fully initialized the first `n` and expose only
    // those.
    let task_table: &'static mut [Task] = unsafe {
        core::slice::from_raw_parts_mut(
            task_table.as_mut_ptr() as *mut Task,
            n,
        )
    };

    // With that done, set up initial register state etc.
    for task in task_table.iter_mut() {
        crate::arch::reinitialize(task);
    }

    // Bring up memory protection: the kernel pools go straight into the
    // PMP, and each task gets a memory space populated from its region
    // table.
    //
    // Safety: startup is kernel context; nothing else runs yet.
    unsafe {
        with_kcb(|kcb| {
            let mut sink = crate::arch::PmpCsr;
            if let Err(e) = kcb.pmp.init_kernel(&mut sink, app.pools) {
                crate::fail::die_with_code(e, 0, 0);
            }
            for (i, task) in task_table.iter_mut().enumerate() {
                let space = match kcb.fpages.memspace_create(i as u16, false)
                {
                    Ok(s) => s,
                    Err(e) => crate::fail::die_with_code(e, 0, 0),
                };
                for region in task.region_table() {
                    // The null region (shared "no access" filler) doesn't
                    // become a flexpage.
                    if region.size == 0 || region.attributes.is_empty() {
                        continue;
                    }
                    let page = match kcb.fpages.create(
                        region.base,
                        region.size,
                        region.attributes,
                        region.priority,
                    ) {
                        Ok(p) => p,
                        Err(e) => crate::fail::die_with_code(e, 0, 0),
                    };
                    if let Err(e) = kcb.fpages.attach(space, page) {
                        crate::fail::die_with_code(e, 0, 0);
                    }
                }
                task.set_memspace(Some(space));
            }
        })
    };

    // Stash the table extents somewhere that we can get them later,
    // cheaply, from trap context.
    //
    // Safety: as long as we don't call `with_task_table` before switching
    // to user code, we can't alias, and we'll be okay.
    unsafe {
        set_task_table(task_table);
    }

    // Task 0 is the idle task by convention; it seeds the current-task
    // pointer so the first dispatch has somewhere to come "from," and it
    // immediately yields into the highest-priority ready task.
    uassert!(task_table[0].is_runnable());

    // Safety: we are on the path that resumes the designated task.
    unsafe {
        syscalls::switch_to(task_table, 0);
    }
    klog!("boot: first dispatch");
    crate::arch::start_first_task(tick_divisor, &mut task_table[0])
}
