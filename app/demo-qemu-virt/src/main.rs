// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Demo application for `qemu-system-riscv32 -M virt`.
//!
//! Three tasks: the idle task (index 0, by kernel convention), a Machine
//! mode heartbeat task that exercises the mutex and queue syscalls, and a
//! User mode task that runs behind the PMP. The 16550 UART is wired into
//! the kernel console hooks.
//!
//! Run with:
//!
//! ```text
//! qemu-system-riscv32 -M virt -nographic -bios none \
//!     -kernel target/riscv32imac-unknown-none-elf/release/demo-qemu-virt
//! ```

#![no_std]
#![no_main]

extern crate riscv_rt;

use core::mem::MaybeUninit;

use kern::console::ConsoleHooks;
use kern::startup::AppDef;
use riscv_rt::entry;
use userlib::{
    sys_get_task_id, sys_mutex_create, sys_mutex_lock, sys_mutex_unlock,
    sys_queue_create, sys_queue_recv, sys_queue_send, sys_sleep, sys_yield,
    MemoryPool, ObjIndex, RegionAttributes, RegionDesc, RegionPriority,
    TaskDesc, TaskFlags, REGIONS_PER_TASK,
};

/// qemu virt's CLINT ticks mtime at 10 MHz; one kernel tick per
/// millisecond.
const CYCLES_PER_MS: u32 = 10_000;

/// Must agree with `_heap_size` in memory.x.
const KERNEL_HEAP_SIZE: u32 = 0x10000;

const KERNEL_STACK_SIZE: u32 = 0x4000;

// ---------------------------------------------------------------------
// Console: the virt machine's 16550 UART.

const UART_BASE: usize = 0x1000_0000;
const UART_THR: usize = UART_BASE;
const UART_RBR: usize = UART_BASE;
const UART_LSR: usize = UART_BASE + 5;
const LSR_DATA_READY: u8 = 1 << 0;
const LSR_THR_EMPTY: u8 = 1 << 5;

fn uart_putchar(c: u8) {
    unsafe {
        while core::ptr::read_volatile(UART_LSR as *const u8) & LSR_THR_EMPTY
            == 0
        {}
        core::ptr::write_volatile(UART_THR as *mut u8, c);
    }
}

fn uart_getchar() -> i32 {
    unsafe {
        if core::ptr::read_volatile(UART_LSR as *const u8) & LSR_DATA_READY
            == 0
        {
            return -1;
        }
        i32::from(core::ptr::read_volatile(UART_RBR as *const u8))
    }
}

fn uart_poll() -> i32 {
    unsafe {
        i32::from(
            core::ptr::read_volatile(UART_LSR as *const u8) & LSR_DATA_READY,
        )
    }
}

fn puts(s: &str) {
    for b in s.bytes() {
        userlib::sys_putc(b);
    }
}

// ---------------------------------------------------------------------
// Tasks.

#[repr(align(16))]
struct Stack<const N: usize>([u8; N]);

static mut IDLE_STACK: Stack<1024> = Stack([0; 1024]);
static mut HEARTBEAT_STACK: Stack<2048> = Stack([0; 2048]);
static mut UMODE_STACK: Stack<2048> = Stack([0; 2048]);

/// Index 0: the idle task. Lowest priority, always runnable; parks the core
/// until the next interrupt, then lets the scheduler look around.
fn idle_main() -> ! {
    loop {
        unsafe { core::arch::asm!("wfi") };
        sys_yield();
    }
}

/// Machine-mode heartbeat: ships tick counts through a queue to itself and
/// squeezes them out under a mutex, mostly to prove the sync syscalls end
/// to end.
fn heartbeat_main() -> ! {
    let m = sys_mutex_create().unwrap_or(ObjIndex(0));
    let q = sys_queue_create(8).unwrap_or(ObjIndex(0));
    let mut beats: u32 = 0;
    loop {
        beats = beats.wrapping_add(1);
        sys_queue_send(q, beats);
        sys_mutex_lock(m);
        let got = sys_queue_recv(q);
        if got % 1000 == 0 {
            puts("heartbeat\r\n");
        }
        sys_mutex_unlock(m);
        sys_sleep(1);
    }
}

/// User-mode task: runs behind the PMP with only its own stack, the text
/// segment, and the data image visible. A positive answer from
/// `sys_get_task_id` proves traps climb onto the kernel stack properly.
fn umode_main() -> ! {
    loop {
        let id = sys_get_task_id();
        if id.0 == 0 {
            // The kernel would never say this; stop rather than spin on
            // corrupt state.
            userlib::sys_panic();
        }
        sys_sleep(10);
    }
}

// ---------------------------------------------------------------------
// Static configuration, filled in at boot.
//
// Entry points and stack tops are runtime addresses (function pointers and
// linker symbols), so the tables are materialized in `main` rather than as
// initialized statics.

static mut REGIONS: MaybeUninit<[RegionDesc; 6]> = MaybeUninit::uninit();
static mut TASKS: MaybeUninit<[TaskDesc; 3]> = MaybeUninit::uninit();
static mut POOLS: MaybeUninit<[MemoryPool; 5]> = MaybeUninit::uninit();
static mut APP: MaybeUninit<AppDef> = MaybeUninit::uninit();

fn region_index_table(used: &[u8]) -> [u8; REGIONS_PER_TASK] {
    let mut table = [0u8; REGIONS_PER_TASK];
    table[..used.len()].copy_from_slice(used);
    table
}

fn stack_extent<const N: usize>(stack: &Stack<N>) -> (u32, u32) {
    let base = stack as *const _ as u32;
    (base, base + N as u32)
}

#[entry]
fn main() -> ! {
    // Linker-script landmarks, provided by riscv-rt's link.x.
    extern "C" {
        static _stext: u8;
        static _etext: u8;
        static _sdata: u8;
        static _edata: u8;
        static _sbss: u8;
        static _ebss: u8;
        static _sheap: u8;
        static _stack_start: u8;
    }

    unsafe {
        kern::console::set_hooks(ConsoleHooks {
            putchar: uart_putchar,
            getchar: uart_getchar,
            poll: uart_poll,
        });

        let stext = &_stext as *const u8 as u32;
        let etext = &_etext as *const u8 as u32;
        let sdata = &_sdata as *const u8 as u32;
        let edata = &_edata as *const u8 as u32;
        let sbss = &_sbss as *const u8 as u32;
        let ebss = &_ebss as *const u8 as u32;
        let sheap = &_sheap as *const u8 as u32;
        let stack_top = &_stack_start as *const u8 as u32;

        let rw = RegionAttributes::READ | RegionAttributes::WRITE;
        let rx = RegionAttributes::READ | RegionAttributes::EXECUTE;

        POOLS.write([
            MemoryPool {
                name: "kernel_text",
                start: stext,
                end: etext,
                attributes: rx,
                priority: RegionPriority::Kernel,
            },
            MemoryPool {
                name: "kernel_data",
                start: sdata,
                end: edata,
                attributes: rw,
                priority: RegionPriority::Kernel,
            },
            MemoryPool {
                name: "kernel_bss",
                start: sbss,
                end: ebss,
                attributes: rw,
                priority: RegionPriority::Kernel,
            },
            MemoryPool {
                name: "kernel_heap",
                start: sheap,
                end: sheap + KERNEL_HEAP_SIZE,
                attributes: rw,
                priority: RegionPriority::Kernel,
            },
            MemoryPool {
                name: "kernel_stack",
                start: stack_top - KERNEL_STACK_SIZE,
                end: stack_top,
                attributes: rw,
                priority: RegionPriority::Kernel,
            },
        ]);

        let (idle_lo, idle_hi) = stack_extent(&*core::ptr::addr_of!(IDLE_STACK));
        let (hb_lo, hb_hi) =
            stack_extent(&*core::ptr::addr_of!(HEARTBEAT_STACK));
        let (um_lo, um_hi) = stack_extent(&*core::ptr::addr_of!(UMODE_STACK));

        REGIONS.write([
            // 0: the null region, shared filler for unused slots
            RegionDesc {
                base: 0,
                size: 0,
                attributes: RegionAttributes::empty(),
                priority: RegionPriority::Temporary,
            },
            // 1: application text
            RegionDesc {
                base: stext,
                size: etext - stext,
                attributes: rx,
                priority: RegionPriority::Shared,
            },
            // 2: data + bss image
            RegionDesc {
                base: sdata,
                size: ebss - sdata,
                attributes: rw,
                priority: RegionPriority::Shared,
            },
            // 3..5: per-task stacks
            RegionDesc {
                base: idle_lo,
                size: idle_hi - idle_lo,
                attributes: rw,
                priority: RegionPriority::Stack,
            },
            RegionDesc {
                base: hb_lo,
                size: hb_hi - hb_lo,
                attributes: rw,
                priority: RegionPriority::Stack,
            },
            RegionDesc {
                base: um_lo,
                size: um_hi - um_lo,
                attributes: rw,
                priority: RegionPriority::Stack,
            },
        ]);

        TASKS.write([
            TaskDesc {
                regions: region_index_table(&[1, 2, 3]),
                entry_point: idle_main as usize as u32,
                initial_stack: idle_hi,
                priority: 7,
                flags: TaskFlags::START_AT_BOOT,
            },
            TaskDesc {
                regions: region_index_table(&[1, 2, 4]),
                entry_point: heartbeat_main as usize as u32,
                initial_stack: hb_hi,
                priority: 2,
                flags: TaskFlags::START_AT_BOOT,
            },
            TaskDesc {
                regions: region_index_table(&[1, 2, 5]),
                entry_point: umode_main as usize as u32,
                initial_stack: um_hi,
                priority: 3,
                flags: TaskFlags::START_AT_BOOT | TaskFlags::USER_MODE,
            },
        ]);

        let tasks: &'static [TaskDesc] =
            (*core::ptr::addr_of!(TASKS)).assume_init_ref();
        let regions: &'static [RegionDesc] =
            (*core::ptr::addr_of!(REGIONS)).assume_init_ref();
        let pools: &'static [MemoryPool] =
            (*core::ptr::addr_of!(POOLS)).assume_init_ref();
        APP.write(AppDef {
            tasks,
            regions,
            pools,
        });

        kern::startup::start_kernel(
            CYCLES_PER_MS,
            (*core::ptr::addr_of!(APP)).assume_init_ref(),
        )
    }
}
