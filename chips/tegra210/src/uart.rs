// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Polled transmit on the 16550-compatible UARTs, for debug output.
//!
//! Clocks, pinmux and the baud rate divisor are set up by the boot stage
//! that loaded us.

use kernel::debug::IoWrite;
use kernel::utilities::registers::interfaces::{Readable, Writeable};
use kernel::utilities::registers::{register_bitfields, register_structs, ReadOnly, ReadWrite};
use kernel::utilities::StaticRef;

register_structs! {
    pub UartRegisters {
        /// Transmit holding register when written, receive buffer when read.
        (0x00 => thr_dlab: ReadWrite<u32>),
        (0x04 => ier_dlab: ReadWrite<u32>),
        (0x08 => iir_fcr: ReadWrite<u32>),
        (0x0c => lcr: ReadWrite<u32>),
        (0x10 => mcr: ReadWrite<u32>),
        (0x14 => lsr: ReadOnly<u32, LSR::Register>),
        (0x18 => @END),
    }
}

register_bitfields![u32,
    LSR [
        RDR OFFSET(0) NUMBITS(1) [],
        /// Transmit holding register empty.
        THRE OFFSET(5) NUMBITS(1) [],
        /// Transmitter completely idle.
        TMTY OFFSET(6) NUMBITS(1) []
    ]
];

pub const UART_A_BASE: StaticRef<UartRegisters> =
    unsafe { StaticRef::new(0x7000_6000 as *const UartRegisters) };

pub struct Uart {
    registers: StaticRef<UartRegisters>,
}

impl Uart {
    pub const fn new(registers: StaticRef<UartRegisters>) -> Uart {
        Uart { registers }
    }

    fn send_byte(&self, byte: u8) {
        while !self.registers.lsr.is_set(LSR::THRE) {}
        self.registers.thr_dlab.set(byte as u32);
    }

    /// Wait until everything written has left the shift register.
    pub fn flush(&self) {
        while !self.registers.lsr.is_set(LSR::TMTY) {}
    }
}

impl IoWrite for Uart {
    fn write(&mut self, buf: &[u8]) -> usize {
        for &byte in buf {
            if byte == b'\n' {
                self.send_byte(b'\r');
            }
            self.send_byte(byte);
        }
        buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[test]
    fn writes_expand_newlines() {
        let words: [Cell<u32>; 0x18 / 4] = core::array::from_fn(|_| Cell::new(0));
        words[0x14 / 4].set((1 << 5) | (1 << 6));
        let mut uart = Uart::new(unsafe { StaticRef::new(words.as_ptr() as *const UartRegisters) });

        assert_eq!(uart.write(b"ok\n"), 3);
        assert_eq!(words[0].get(), b'\n' as u32);
        uart.flush();
    }
}
