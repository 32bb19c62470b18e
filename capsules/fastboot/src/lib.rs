// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Fastboot over the XUSB device controller.
//!
//! [`fastboot::FastbootGadget`] is the USB function: it answers descriptor
//! requests, owns the bulk endpoint pair and runs the fastboot session
//! state machine. Command lines it receives are handed to
//! [`command::CommandProcessor`]. [`runner::Runner`] drives both from the
//! board's main loop and decides what the board does once fastboot is done.

#![forbid(unsafe_code)]
#![no_std]

#[cfg(test)]
extern crate std;

pub mod bootimg;
pub mod chainload;
pub mod command;
pub mod crc32;
pub mod descriptors;
pub mod fastboot;
pub mod runner;

pub use crate::command::FastbootConfig;
pub use crate::fastboot::FastbootGadget;
