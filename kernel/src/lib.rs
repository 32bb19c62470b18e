// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Core kernel crate.
//!
//! The kernel crate holds the code shared by the chip drivers, capsules, and
//! boards of this tree: the Hardware Interface Layer (HIL) definitions, the
//! debug output facility, compile-time configuration, and small utilities
//! such as the register interface and the Tock cell types.
//!
//! There is no scheduler and no process support. Boards run a single polled
//! loop, and drivers expose `&self` methods with interior mutability so the
//! components can hold shared references to one another.

#![no_std]

#[macro_use]
pub mod debug;
pub mod config;
pub mod errorcode;
pub mod hil;
pub mod utilities;

pub use crate::errorcode::ErrorCode;
