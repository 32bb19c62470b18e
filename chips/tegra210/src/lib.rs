// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Peripheral implementations for the NVIDIA Tegra X1 (T210) SoC.
//!
//! Only the blocks a USB recovery loader needs are covered: the XUSB device
//! controller, the microsecond timer, GPIO inputs, the PMC reset path, and a
//! polled debug UART.

#![no_std]
#![crate_name = "tegra210"]
#![crate_type = "rlib"]

pub mod gpio;
pub mod pmc;
pub mod timer;
pub mod uart;
pub mod xusb;
