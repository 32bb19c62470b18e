// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! GPIO controller, input side only.
//!
//! The T210 controller has eight banks of four 8-pin ports. Each register
//! exists once per port, with the ports of a bank interleaved at 4-byte
//! strides, so a port's view of the bank starts at `bank * 0x100 + port * 4`.

use kernel::hil;
use kernel::utilities::registers::interfaces::{Readable, Writeable};
use kernel::utilities::registers::{register_structs, ReadOnly, ReadWrite};
use kernel::utilities::StaticRef;

register_structs! {
    pub GpioPortRegisters {
        /// 1 for GPIO mode, 0 for the pin's special function.
        (0x00 => cnf: ReadWrite<u32>),
        (0x04 => _reserved0),
        (0x10 => oe: ReadWrite<u32>),
        (0x14 => _reserved1),
        (0x20 => out: ReadWrite<u32>),
        (0x24 => _reserved2),
        (0x30 => input: ReadOnly<u32>),
        (0x34 => _reserved3),
        /// Masked writes: bits 15..8 select which of bits 7..0 are written.
        (0x80 => msk_cnf: ReadWrite<u32>),
        (0x84 => _reserved4),
        (0x90 => msk_oe: ReadWrite<u32>),
        (0x94 => @END),
    }
}

pub const GPIO_BASE: usize = 0x6000_D000;

/// Port letters in controller order, `A` = 0 through `FF` = 31.
pub mod port {
    pub const X: usize = 23;
}

/// Volume up: X6, active low.
pub const BUTTON_VOL_UP: (usize, usize) = (port::X, 6);
/// Volume down: X7, active low.
pub const BUTTON_VOL_DOWN: (usize, usize) = (port::X, 7);

pub struct GpioPin {
    registers: StaticRef<GpioPortRegisters>,
    pin: usize,
}

impl GpioPin {
    /// # Safety
    ///
    /// `base` must be the GPIO controller, or memory laid out like it.
    pub const unsafe fn new(base: usize, port: usize, pin: usize) -> GpioPin {
        let offset = (port / 4) * 0x100 + (port % 4) * 4;
        GpioPin {
            registers: StaticRef::new((base + offset) as *const GpioPortRegisters),
            pin,
        }
    }

    /// Put the pin in GPIO mode with its output driver off.
    pub fn make_input(&self) {
        let bit = 1 << self.pin;
        self.registers.msk_cnf.set((bit << 8) | bit);
        self.registers.msk_oe.set(bit << 8);
    }
}

impl hil::gpio::Input for GpioPin {
    fn read(&self) -> bool {
        self.registers.input.get() & (1 << self.pin) != 0
    }
}
