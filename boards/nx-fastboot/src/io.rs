// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

use core::panic::PanicInfo;
use core::ptr::addr_of_mut;

use kernel::debug::{self, LogLevel};
use kernel::debug_raw;
use tegra210::pmc::{Pmc, PMC_BASE};
use tegra210::uart::{Uart, UART_A_BASE};

/// UART-A, wired to the right Joy-Con rail.
static mut UART: Uart = Uart::new(UART_A_BASE);

/// Route `debug!` output to UART-A.
///
/// # Safety
///
/// Call once, before anything logs.
pub unsafe fn install_debug_writer() {
    debug::set_debug_writer(&mut *addr_of_mut!(UART), LogLevel::Info);
}

/// Print the panic, wait for it to leave the UART, and reboot.
#[cfg(not(test))]
#[panic_handler]
fn panic_fmt(info: &PanicInfo) -> ! {
    debug_raw!("\nfastboot panicked: {}\n", info);
    // Safety: nothing else runs once we have panicked.
    unsafe { (*addr_of_mut!(UART)).flush() };
    Pmc::new(PMC_BASE).reset(false);
    loop {}
}
