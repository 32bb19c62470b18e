// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Interface for reading GPIO pins.

/// A pin configured as an input.
pub trait Input {
    /// Get the current state of an input GPIO pin. For an output pin, return
    /// the output; for an input pin, return the input; for disabled or
    /// function pins the value is undefined.
    fn read(&self) -> bool;
}

/// An input whose electrical level is inverted with respect to its logical
/// state, such as a button that pulls its line to ground when pressed.
pub struct ActiveLow<'a, P: Input + ?Sized> {
    pin: &'a P,
}

impl<'a, P: Input + ?Sized> ActiveLow<'a, P> {
    pub fn new(pin: &'a P) -> Self {
        ActiveLow { pin }
    }
}

impl<P: Input + ?Sized> Input for ActiveLow<'_, P> {
    fn read(&self) -> bool {
        !self.pin.read()
    }
}

#[cfg(test)]
mod tests {
    use super::{ActiveLow, Input};
    use core::cell::Cell;

    struct Level(Cell<bool>);

    impl Input for Level {
        fn read(&self) -> bool {
            self.0.get()
        }
    }

    #[test]
    fn active_low_inverts() {
        let pin = Level(Cell::new(true));
        let button = ActiveLow::new(&pin);
        assert!(!button.read());
        pin.0.set(false);
        assert!(button.read());
    }
}
