// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Software CRC-32.
//!
//! __Polynomial__: `0x04C11DB7`, processed bit-reflected (`0xEDB88320`), with
//! the register inverted before and after, as used by Ethernet, zlib and
//! `fastboot oem crc32`.

const POLYNOMIAL_REFLECTED: u32 = 0xedb8_8320;

/// Extend `crc`, the CRC of some earlier bytes (0 for none), over `bytes`.
pub fn crc32<I: IntoIterator<Item = u8>>(crc: u32, bytes: I) -> u32 {
    let mut crc = !crc;
    for byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLYNOMIAL_REFLECTED
            } else {
                crc >> 1
            };
        }
    }
    !crc
}
