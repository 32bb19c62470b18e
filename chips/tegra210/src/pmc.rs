// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Power management controller: full-chip reset, optionally into the boot
//! ROM's recovery mode.

use kernel::utilities::registers::interfaces::{ReadWriteable, Readable};
use kernel::utilities::registers::{register_bitfields, register_structs, ReadWrite};
use kernel::utilities::StaticRef;

register_structs! {
    pub PmcRegisters {
        (0x00 => cntrl: ReadWrite<u32, CNTRL::Register>),
        (0x04 => _reserved0),
        /// Survives a PMC reset; read by the boot ROM.
        (0x50 => scratch0: ReadWrite<u32, SCRATCH0::Register>),
        (0x54 => @END),
    }
}

register_bitfields![u32,
    CNTRL [
        MAIN_RST OFFSET(4) NUMBITS(1) []
    ],
    SCRATCH0 [
        /// Force the boot ROM into RCM on the next boot.
        FORCE_RECOVERY OFFSET(1) NUMBITS(1) []
    ]
];

pub const PMC_BASE: StaticRef<PmcRegisters> =
    unsafe { StaticRef::new(0x7000_E400 as *const PmcRegisters) };

pub struct Pmc {
    registers: StaticRef<PmcRegisters>,
}

impl Pmc {
    pub const fn new(registers: StaticRef<PmcRegisters>) -> Pmc {
        Pmc { registers }
    }

    /// Whether the next reset will stop in recovery mode.
    pub fn recovery_requested(&self) -> bool {
        self.registers.scratch0.is_set(SCRATCH0::FORCE_RECOVERY)
    }

    /// Assert the main reset. On hardware this does not return.
    pub fn reset(&self, into_recovery: bool) {
        self.registers
            .scratch0
            .modify(SCRATCH0::FORCE_RECOVERY.val(into_recovery as u32));
        self.registers.cntrl.modify(CNTRL::MAIN_RST::SET);
    }
}
