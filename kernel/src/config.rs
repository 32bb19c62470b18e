// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Data structure for storing compile-time configuration options.
//!
//! Configuration lives in a typed `const` rather than behind `#[cfg]`
//! attributes so that every code path is type-checked even when it is
//! disabled. After type-checking, the compiler folds the constant and removes
//! the dead branches, so a disabled option costs nothing in the binary.

/// Data structure holding compile-time configuration options.
///
/// To change the configuration, enable the matching cargo feature of the
/// kernel crate from the board crate.
pub struct Config {
    /// Whether the USB device driver should dump the state of a transfer ring
    /// to the debug output after a transfer on that ring failed.
    ///
    /// The dump lists every descriptor in the ring with its raw words, the
    /// cycle bit, and markers for the enqueue and dequeue cursors. It is large
    /// and slow over a UART, so it is off by default.
    pub debug_xusb_rings: bool,

    /// Whether every received USB setup packet is logged at `Info` level.
    pub trace_setup_packets: bool,
}

/// A unique instance of `Config` where compile-time configuration options are
/// defined. This is the only location where `#[cfg(x)]`-style configuration
/// based on Cargo features is permitted.
pub const CONFIG: Config = Config {
    debug_xusb_rings: cfg!(feature = "debug_xusb_rings"),
    trace_setup_packets: cfg!(feature = "trace_setup_packets"),
};
