// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! TIMERUS, the free-running microsecond counter.

use kernel::hil::time::Time;
use kernel::utilities::registers::interfaces::{Readable, Writeable};
use kernel::utilities::registers::{register_bitfields, register_structs, ReadOnly, ReadWrite};
use kernel::utilities::StaticRef;

register_structs! {
    pub TimerUsRegisters {
        /// Counts up once per microsecond once USEC_CFG matches the
        /// oscillator.
        (0x00 => cntr_1us: ReadOnly<u32>),
        (0x04 => usec_cfg: ReadWrite<u32, USEC_CFG::Register>),
        (0x08 => _reserved0),
        (0x3c => cntr_freeze: ReadWrite<u32>),
        (0x40 => @END),
    }
}

register_bitfields![u32,
    USEC_CFG [
        /// Divisor applied to the oscillator, minus one.
        USEC_DIVISOR OFFSET(0) NUMBITS(8) [],
        /// Dividend applied to the oscillator, minus one.
        USEC_DIVIDEND OFFSET(8) NUMBITS(8) []
    ]
];

pub const TIMERUS_BASE: StaticRef<TimerUsRegisters> =
    unsafe { StaticRef::new(0x6000_5010 as *const TimerUsRegisters) };

pub struct TimerUs {
    registers: StaticRef<TimerUsRegisters>,
}

impl TimerUs {
    pub const fn new(registers: StaticRef<TimerUsRegisters>) -> TimerUs {
        TimerUs { registers }
    }

    /// Derive 1 MHz from the 19.2 MHz clk_m (x 5 / 96) and let the counter
    /// run.
    pub fn configure(&self) {
        self.registers
            .usec_cfg
            .write(USEC_CFG::USEC_DIVISOR.val(0x5f) + USEC_CFG::USEC_DIVIDEND.val(0x04));
        self.registers.cntr_freeze.set(0);
    }
}

impl Time for TimerUs {
    fn now(&self) -> u32 {
        self.registers.cntr_1us.get()
    }
}
