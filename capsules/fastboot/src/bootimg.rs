// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Android boot image header, version 2.
//!
//! Only the fields `fastboot boot` looks at are decoded. All multi-byte
//! fields are little endian and the header is packed:
//!
//! ```text
//!    0  magic "ANDROID!"       36  page_size
//!    8  kernel_size            40  header_version
//!   12  kernel_addr            ...
//!   16  ramdisk_size         1644  header_size
//!   24  second_size          1648  dtb_size
//! ```

use core::cell::Cell;

pub const BOOT_MAGIC: &[u8; 8] = b"ANDROID!";
pub const BOOT_IMAGE_HEADER_VERSION: u32 = 2;
/// Size of a version 2 header, which it also records in `header_size`.
pub const BOOT_IMAGE_HEADER_V2_SIZE: usize = 1660;

pub(crate) mod offset {
    pub const KERNEL_SIZE: usize = 8;
    pub const KERNEL_ADDR: usize = 12;
    pub const RAMDISK_SIZE: usize = 16;
    pub const SECOND_SIZE: usize = 24;
    pub const PAGE_SIZE: usize = 36;
    pub const HEADER_VERSION: usize = 40;
    pub const HEADER_SIZE: usize = 1644;
    pub const DTB_SIZE: usize = 1648;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootImageError {
    TooSmall,
    InvalidMagic,
    InvalidVersion,
    InvalidSize,
    /// The image carries a ramdisk, a second stage or a DTB.
    UnexpectedPayload,
    /// The kernel the header describes extends past the end of the image.
    KernelOutOfBounds,
}

impl BootImageError {
    /// Text sent to the host with the `FAIL` response.
    pub fn message(self) -> &'static str {
        match self {
            BootImageError::TooSmall => "received boot image is too small",
            BootImageError::InvalidMagic => "received boot image has invalid magic",
            BootImageError::InvalidVersion => "received boot image has invalid version",
            BootImageError::InvalidSize => "received boot image has invalid size",
            BootImageError::UnexpectedPayload => {
                "received boot image has unexpected ramdisk, second stage bootloader, or dtb"
            }
            BootImageError::KernelOutOfBounds => "received boot image kernel is out of bounds",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootImageHeader {
    pub kernel_size: u32,
    pub kernel_addr: u32,
    pub ramdisk_size: u32,
    pub second_size: u32,
    pub page_size: u32,
    pub header_version: u32,
    pub header_size: u32,
    pub dtb_size: u32,
}

fn read_u32(image: &[Cell<u8>], offset: usize) -> u32 {
    u32::from_le_bytes([
        image[offset].get(),
        image[offset + 1].get(),
        image[offset + 2].get(),
        image[offset + 3].get(),
    ])
}

impl BootImageHeader {
    /// Decode and check the header at the start of `image`.
    pub fn parse(image: &[Cell<u8>]) -> Result<BootImageHeader, BootImageError> {
        if image.len() < BOOT_IMAGE_HEADER_V2_SIZE {
            return Err(BootImageError::TooSmall);
        }
        if image
            .iter()
            .zip(BOOT_MAGIC.iter())
            .any(|(byte, magic)| byte.get() != *magic)
        {
            return Err(BootImageError::InvalidMagic);
        }

        let header = BootImageHeader {
            kernel_size: read_u32(image, offset::KERNEL_SIZE),
            kernel_addr: read_u32(image, offset::KERNEL_ADDR),
            ramdisk_size: read_u32(image, offset::RAMDISK_SIZE),
            second_size: read_u32(image, offset::SECOND_SIZE),
            page_size: read_u32(image, offset::PAGE_SIZE),
            header_version: read_u32(image, offset::HEADER_VERSION),
            header_size: read_u32(image, offset::HEADER_SIZE),
            dtb_size: read_u32(image, offset::DTB_SIZE),
        };
        if header.header_version != BOOT_IMAGE_HEADER_VERSION {
            return Err(BootImageError::InvalidVersion);
        }
        if header.header_size as usize != BOOT_IMAGE_HEADER_V2_SIZE {
            return Err(BootImageError::InvalidSize);
        }
        Ok(header)
    }

    /// Only images holding nothing but a kernel can be booted. The kernel
    /// starts one page into the image and must end within its `image_len`
    /// bytes.
    pub fn check_kernel_only(&self, image_len: usize) -> Result<(), BootImageError> {
        if self.ramdisk_size != 0 || self.second_size != 0 || self.dtb_size != 0 {
            return Err(BootImageError::UnexpectedPayload);
        }
        let kernel_end = (self.page_size as usize).checked_add(self.kernel_size as usize);
        if !kernel_end.is_some_and(|end| end <= image_len) {
            return Err(BootImageError::KernelOutOfBounds);
        }
        Ok(())
    }
}
