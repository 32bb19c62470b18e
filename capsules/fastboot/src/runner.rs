// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The board-facing fastboot loop.
//!
//! The runner polls the controller, reports a failed session to the person
//! at the console, and watches the buttons. It returns once either the
//! session or a button press has decided what the board does next.
//!
//! | Button | Outcome                                 |
//! |--------|-----------------------------------------|
//! | VOL+   | reboot into RCM                         |
//! | VOL-   | leave fastboot and boot normally        |
//! | POWER  | reboot                                  |

use core::cell::Cell;

use kernel::debug_raw;
use kernel::hil::gpio::Input;
use kernel::hil::time::Time;
use tegra210::xusb::Xusb;

use crate::fastboot::{FastbootGadget, State};

/// What the board should do once fastboot returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Continue with the normal boot flow.
    LoadStage2,
    RebootToRcm,
    RebootToSelf,
    /// Run the chainload table filled in by `boot`.
    Chainload,
}

/// Logical button inputs; `true` means pressed.
pub struct Buttons<'a> {
    pub vol_up: &'a dyn Input,
    pub vol_down: &'a dyn Input,
    /// Not every board can read the power button without the PMIC.
    pub power: Option<&'a dyn Input>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Pressed {
    vol_up: bool,
    vol_down: bool,
    power: bool,
}

impl Buttons<'_> {
    fn sample(&self) -> Pressed {
        Pressed {
            vol_up: self.vol_up.read(),
            vol_down: self.vol_down.read(),
            power: self.power.is_some_and(|power| power.read()),
        }
    }
}

/// Whether VOL- is held at any point during the next `window_us`
/// microseconds.
pub fn wait_for_entry(buttons: &Buttons, time: &dyn Time, window_us: u32) -> bool {
    let start = time.now();
    loop {
        if buttons.vol_down.read() {
            return true;
        }
        if time.elapsed_since(start) >= window_us {
            return false;
        }
    }
}

pub struct Runner<'a> {
    xusb: &'a Xusb<'a>,
    gadget: &'a FastbootGadget<'a>,
    buttons: Buttons<'a>,
    previous: Cell<Pressed>,
    error_reported: Cell<bool>,
}

impl<'a> Runner<'a> {
    /// Buttons already held when the runner is created, such as VOL- from
    /// the entry window, only count once they have been released.
    pub fn new(
        xusb: &'a Xusb<'a>,
        gadget: &'a FastbootGadget<'a>,
        buttons: Buttons<'a>,
    ) -> Runner<'a> {
        let previous = Cell::new(buttons.sample());
        Runner {
            xusb,
            gadget,
            buttons,
            previous,
            error_reported: Cell::new(false),
        }
    }

    /// Run one iteration of the loop.
    pub fn poll(&self) -> Option<Outcome> {
        self.xusb.process();

        match self.gadget.state() {
            State::Exit => return Some(Outcome::LoadStage2),
            State::Reboot => return Some(Outcome::RebootToSelf),
            State::Chainload => return Some(Outcome::Chainload),
            State::UsbError => {
                if !self.error_reported.get() {
                    self.error_reported.set(true);
                    debug_raw!(
                        "\nFastboot encountered a USB error (0x{:x}).\nPress one of the buttons listed above to continue.\n",
                        self.gadget.usb_error().map_or(0, usize::from)
                    );
                }
            }
            _ => self.error_reported.set(false),
        }

        let pressed = self.buttons.sample();
        let previous = self.previous.replace(pressed);
        if pressed.vol_up && !previous.vol_up {
            Some(Outcome::RebootToRcm)
        } else if pressed.vol_down && !previous.vol_down {
            debug_raw!("Booting normally.\n");
            Some(Outcome::LoadStage2)
        } else if pressed.power && !previous.power {
            Some(Outcome::RebootToSelf)
        } else {
            None
        }
    }

    pub fn run(&self) -> Outcome {
        loop {
            if let Some(outcome) = self.poll() {
                return outcome;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tegra210::xusb::testing::HostSim;

    use crate::fastboot::tests::{assert_response, send_command, Memory};

    struct Level(Cell<bool>);

    impl Input for Level {
        fn read(&self) -> bool {
            self.0.get()
        }
    }

    /// Advances by `step` microseconds every time it is read.
    struct SteppingClock {
        now: Cell<u32>,
        step: u32,
    }

    impl Time for SteppingClock {
        fn now(&self) -> u32 {
            let now = self.now.get();
            self.now.set(now.wrapping_add(self.step));
            now
        }
    }

    #[test]
    fn entry_window() {
        let up = Level(Cell::new(false));
        let down = Level(Cell::new(false));
        let buttons = Buttons {
            vol_up: &up,
            vol_down: &down,
            power: None,
        };
        let clock = SteppingClock {
            now: Cell::new(u32::MAX - 100),
            step: 10,
        };
        assert!(!wait_for_entry(&buttons, &clock, 1000));
        assert!(clock.now.get() >= (u32::MAX - 100).wrapping_add(1000));

        down.0.set(true);
        assert!(wait_for_entry(&buttons, &clock, 1000));
    }

    #[test]
    fn buttons_count_on_press_only() {
        let memory = Memory::new();
        let xusb = memory.xusb();
        let gadget = memory.gadget(&xusb);
        xusb.enable_device(&gadget);

        let up = Level(Cell::new(false));
        let down = Level(Cell::new(true));
        let power = Level(Cell::new(false));
        let runner = Runner::new(
            &xusb,
            &gadget,
            Buttons {
                vol_up: &up,
                vol_down: &down,
                power: Some(&power),
            },
        );

        // Still held from the entry window.
        assert_eq!(runner.poll(), None);
        down.0.set(false);
        assert_eq!(runner.poll(), None);
        down.0.set(true);
        assert_eq!(runner.poll(), Some(Outcome::LoadStage2));

        up.0.set(true);
        assert_eq!(runner.poll(), Some(Outcome::RebootToRcm));
        assert_eq!(runner.poll(), None);

        power.0.set(true);
        assert_eq!(runner.run(), Outcome::RebootToSelf);
    }

    #[test]
    fn session_end_maps_to_outcome() {
        let memory = Memory::new();
        let xusb = memory.xusb();
        let gadget = memory.gadget(&xusb);
        xusb.enable_device(&gadget);
        let host = HostSim::new(&memory.controller, &xusb, &memory.events);

        let up = Level(Cell::new(false));
        let down = Level(Cell::new(false));
        let runner = Runner::new(
            &xusb,
            &gadget,
            Buttons {
                vol_up: &up,
                vol_down: &down,
                power: None,
            },
        );

        host.enumerate(1);
        assert_eq!(runner.poll(), None);
        send_command(&host, "reboot");
        assert_eq!(runner.poll(), None);
        assert_response(&host, "OKAY");
        assert_eq!(runner.run(), Outcome::RebootToSelf);
    }

    #[test]
    fn usb_error_is_reported_once() {
        let memory = Memory::new();
        let xusb = memory.xusb();
        let gadget = memory.gadget(&xusb);
        xusb.enable_device(&gadget);
        let host = HostSim::new(&memory.controller, &xusb, &memory.events);

        let up = Level(Cell::new(false));
        let down = Level(Cell::new(false));
        let runner = Runner::new(
            &xusb,
            &gadget,
            Buttons {
                vol_up: &up,
                vol_down: &down,
                power: None,
            },
        );

        host.enumerate(1);
        // Babble on the pending command read.
        host.transfer_event(2, memory.bulk_out[0].address(), 3, 0);
        assert_eq!(gadget.state(), State::UsbError);

        assert_eq!(runner.poll(), None);
        assert!(runner.error_reported.get());
        assert_eq!(runner.poll(), None);
        assert!(runner.error_reported.get());

        // Re-enumeration starts a new session and re-arms the report.
        host.enumerate(1);
        assert_eq!(runner.poll(), None);
        assert!(!runner.error_reported.get());
        assert_eq!(gadget.state(), State::WaitingForHostCommand);
    }
}
