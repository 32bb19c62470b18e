// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Fastboot loader for the Nintendo Switch, run on the BPMP as an RCM
//! payload.
//!
//! Clocks, pinmux, SDRAM and the XUSB pads are brought up by the stage that
//! loaded us. This board only wires the peripherals together, offers the
//! entry window, and acts on whatever the fastboot session decided.

#![no_std]
// Disable this attribute when documenting, as a workaround for
// https://github.com/rust-lang/rust/issues/62184.
#![cfg_attr(not(doc), no_main)]

use core::cell::Cell;
use core::ptr::addr_of;

use capsules_fastboot::chainload::ChainloadTable;
use capsules_fastboot::command::CommandProcessor;
use capsules_fastboot::fastboot::BULK_RING_SIZE;
use capsules_fastboot::runner::{self, Buttons, Outcome, Runner};
use capsules_fastboot::{FastbootConfig, FastbootGadget};
use kernel::{debug_error, debug_raw};
use kernel::hil::gpio::ActiveLow;
use tegra210::gpio::{GpioPin, BUTTON_VOL_DOWN, BUTTON_VOL_UP, GPIO_BASE};
use tegra210::pmc::{Pmc, PMC_BASE};
use tegra210::timer::{TimerUs, TIMERUS_BASE};
use tegra210::xusb::dev::{XusbDev, PADCTL_BASE, XUSB_DEV_BASE};
use tegra210::xusb::{
    EndpointContext, Trb, Xusb, EP0_RING_SIZE, EVENT_RING_SIZE, NUM_ENDPOINTS,
};

mod io;

core::arch::global_asm!(
    ".section .text.start, \"ax\"",
    ".global _start",
    ".arm",
    "_start:",
    "    ldr sp, =_estack",
    "    ldr r0, =_sbss",
    "    ldr r1, =_ebss",
    "    mov r2, #0",
    "1:  cmp r0, r1",
    "    strlo r2, [r0], #4",
    "    blo 1b",
    "    bl main",
    "2:  b 2b",
);

/// How long VOL- has to be held after power-on to enter fastboot.
const ENTRY_WINDOW_US: u32 = 2_000_000;

/// Downloads land in SDRAM, above anything a kernel image is loaded to.
const DOWNLOAD_BUFFER_ADDRESS: usize = 0xC000_0000;
const DOWNLOAD_BUFFER_SIZE: usize = 0x3000_0000;

// Memory the controller reads and writes by DMA.
static mut ENDPOINT_CONTEXTS: [EndpointContext; NUM_ENDPOINTS] =
    [const { EndpointContext::new() }; NUM_ENDPOINTS];
static mut EVENT_TRBS: [Trb; EVENT_RING_SIZE] = [const { Trb::new() }; EVENT_RING_SIZE];
static mut EP0_TRBS: [Trb; EP0_RING_SIZE] = [const { Trb::new() }; EP0_RING_SIZE];
static mut BULK_IN_TRBS: [Trb; BULK_RING_SIZE] = [const { Trb::new() }; BULK_RING_SIZE];
static mut BULK_OUT_TRBS: [Trb; BULK_RING_SIZE] = [const { Trb::new() }; BULK_RING_SIZE];

static mut CHAINLOAD_TABLE: ChainloadTable = ChainloadTable::new();

/// Copy every chainload entry into place and jump to the entry point.
///
/// # Safety
///
/// The table must describe a valid image whose copies do not overwrite this
/// loader.
unsafe fn chainload(table: &ChainloadTable) -> ! {
    for entry in table.iter() {
        debug_raw!(
            "chainload {}: {:#x} bytes from {:#x} to {:#x}\n",
            entry.num,
            entry.size,
            entry.src_address,
            entry.load_address
        );
        core::ptr::copy(
            entry.src_address as *const u8,
            entry.load_address as *mut u8,
            entry.size,
        );
    }
    let entry_point: extern "C" fn() -> ! = core::mem::transmute(table.entry_point());
    entry_point()
}

/// Entry point, called from `_start` with a stack and zeroed `.bss`.
#[no_mangle]
pub unsafe extern "C" fn main() -> ! {
    io::install_debug_writer();

    let timer = TimerUs::new(TIMERUS_BASE);
    timer.configure();
    let pmc = Pmc::new(PMC_BASE);

    let vol_up_pin = GpioPin::new(GPIO_BASE, BUTTON_VOL_UP.0, BUTTON_VOL_UP.1);
    let vol_down_pin = GpioPin::new(GPIO_BASE, BUTTON_VOL_DOWN.0, BUTTON_VOL_DOWN.1);
    vol_up_pin.make_input();
    vol_down_pin.make_input();
    let vol_up = ActiveLow::new(&vol_up_pin);
    let vol_down = ActiveLow::new(&vol_down_pin);
    // TODO: read the power button from the MAX77620 ONOFFSTAT register over
    // I2C5 once there is an I2C driver for it.
    let buttons = Buttons {
        vol_up: &vol_up,
        vol_down: &vol_down,
        power: None,
    };

    debug_raw!("Hold VOL- to enter fastboot.\n");
    if !runner::wait_for_entry(&buttons, &timer, ENTRY_WINDOW_US) {
        debug_raw!("Booting normally.\n");
        pmc.reset(false);
        loop {}
    }

    let download_buffer: &'static [Cell<u8>] = core::slice::from_raw_parts(
        DOWNLOAD_BUFFER_ADDRESS as *const Cell<u8>,
        DOWNLOAD_BUFFER_SIZE,
    );
    let chainload_table = &*addr_of!(CHAINLOAD_TABLE);

    let controller = XusbDev::new(XUSB_DEV_BASE, PADCTL_BASE, &timer);
    let xusb = Xusb::new(&controller, &*addr_of!(ENDPOINT_CONTEXTS));
    if let Err(err) = xusb.initialize(&*addr_of!(EVENT_TRBS), &*addr_of!(EP0_TRBS)) {
        // The host may still enumerate us once endpoint 0 recovers on reset.
        debug_error!("xusb initialization failed: {:#x}", usize::from(err));
    }
    let gadget = FastbootGadget::new(
        &xusb,
        CommandProcessor::new(FastbootConfig::default(), chainload_table),
        &*addr_of!(BULK_IN_TRBS),
        &*addr_of!(BULK_OUT_TRBS),
        download_buffer,
    );
    xusb.enable_device(&gadget);

    debug_raw!(
        "\nFastboot\n  VOL+   reboot to RCM\n  VOL-   boot normally\n  POWER  reboot\n\n"
    );
    let runner = Runner::new(&xusb, &gadget, buttons);
    match runner.run() {
        Outcome::LoadStage2 => pmc.reset(false),
        Outcome::RebootToRcm => pmc.reset(true),
        Outcome::RebootToSelf => pmc.reset(false),
        Outcome::Chainload => chainload(chainload_table),
    }
    loop {}
}
