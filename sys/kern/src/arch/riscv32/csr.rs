// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runtime-indexed access to the PMP configuration CSRs.
//!
//! The CSR number is encoded in the instruction, so "write `pmpaddr[i]`"
//! cannot be a single instruction with `i` in a register. Each accessor
//! below is a small jump table over compile-time-constant `csrr`/`csrw`
//! instructions, one per register, generated by macro.
//!
//! Named CSRs (`mstatus`, `mie`, `mepc`, `mscratch`) go through the `riscv`
//! crate; only the indexed files live here.

use core::arch::asm;

macro_rules! indexed_csr_write {
    ($(#[$attr:meta])* $name:ident: $($i:literal => $csr:literal),+ $(,)?) => {
        $(#[$attr])*
        pub fn $name(index: usize, value: u32) {
            match index {
                $(
                    $i => unsafe {
                        asm!(concat!("csrw ", $csr, ", {v}"), v = in(reg) value)
                    },
                )+
                _ => panic!("csr index out of range"),
            }
        }
    };
}

macro_rules! indexed_csr_read {
    ($(#[$attr:meta])* $name:ident: $($i:literal => $csr:literal),+ $(,)?) => {
        $(#[$attr])*
        pub fn $name(index: usize) -> u32 {
            let value: u32;
            match index {
                $(
                    $i => unsafe {
                        asm!(concat!("csrr {v}, ", $csr), v = out(reg) value)
                    },
                )+
                _ => panic!("csr index out of range"),
            }
            value
        }
    };
}

indexed_csr_read! {
    /// Reads `pmpcfg{index}`.
    pmpcfg_read:
    0 => "pmpcfg0", 1 => "pmpcfg1", 2 => "pmpcfg2", 3 => "pmpcfg3",
}

indexed_csr_write! {
    /// Writes `pmpcfg{index}`.
    pmpcfg_write:
    0 => "pmpcfg0", 1 => "pmpcfg1", 2 => "pmpcfg2", 3 => "pmpcfg3",
}

indexed_csr_write! {
    /// Writes `pmpaddr{index}`. The value is the raw CSR encoding, i.e.
    /// already shifted to the PMP grain.
    pmpaddr_write:
    0 => "pmpaddr0", 1 => "pmpaddr1", 2 => "pmpaddr2", 3 => "pmpaddr3",
    4 => "pmpaddr4", 5 => "pmpaddr5", 6 => "pmpaddr6", 7 => "pmpaddr7",
    8 => "pmpaddr8", 9 => "pmpaddr9", 10 => "pmpaddr10", 11 => "pmpaddr11",
    12 => "pmpaddr12", 13 => "pmpaddr13", 14 => "pmpaddr14", 15 => "pmpaddr15",
}

/// The real PMP hardware sink: CSR traffic for the [`crate::pmp::PmpBank`].
pub struct PmpCsr;

impl crate::pmp::PmpSink for PmpCsr {
    fn read_cfg(&self, csr: usize) -> u32 {
        pmpcfg_read(csr)
    }

    fn write_cfg(&mut self, csr: usize, v: u32) {
        pmpcfg_write(csr, v);
    }

    fn write_addr(&mut self, slot: usize, end: u32) {
        // TOR bound registers hold bits 33:2 of the address.
        pmpaddr_write(slot, end >> 2);
    }
}
