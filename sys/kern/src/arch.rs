// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! One nested module per target family, selected by `cfg_if` and re-exported
//! flat, so the rest of the kernel just says `arch::whatever` and gets the
//! right implementation for the build target. Every implementation has to
//! supply the same surface: `SavedState`, the current-task index accessors,
//! `reinitialize`, `start_first_task`, the timer plumbing, and the `PmpCsr`
//! hardware sink.
//!
//! The `fake` module is the host-side simulation used by the unit tests; it
//! keeps the portable kernel compiling and testable on a development
//! machine.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv32")] {
        pub mod riscv32;
        pub use riscv32::*;
    } else {
        pub mod fake;
        pub use fake::*;
    }
}
