// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Hardware agnostic interfaces for counter-like resources.

/// A free-running counter ticking once per microsecond.
///
/// The counter wraps at `u32::MAX`; callers measure intervals with wrapping
/// subtraction, so intervals up to about 71 minutes are representable.
pub trait Time {
    /// Returns the current time in microseconds.
    fn now(&self) -> u32;

    /// Microseconds elapsed since `start`, an earlier value of `now()`.
    fn elapsed_since(&self, start: u32) -> u32 {
        self.now().wrapping_sub(start)
    }

    /// Busy-wait for at least `us` microseconds.
    fn delay_us(&self, us: u32) {
        let start = self.now();
        while self.elapsed_since(start) < us {
            core::hint::spin_loop();
        }
    }
}
