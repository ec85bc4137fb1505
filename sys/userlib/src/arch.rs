// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific syscall entry.
//!
//! The non-RISC-V fallback exists so host builds (and the kernel's unit
//! tests, which pull this workspace in) keep compiling; actually invoking a
//! syscall there is a programming error.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv32")] {
        mod riscv32;
        pub use riscv32::*;
    } else {
        /// Host stub; tasks only exist on the target.
        pub fn syscall_raw(_nr: u32, _a0: u32, _a1: u32, _a2: u32) -> u32 {
            unimplemented!("syscalls require a RISC-V target");
        }
    }
}
