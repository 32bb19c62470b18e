// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The fastboot command set.
//!
//! A command line is `name` or `name:argument`. Every command answers with
//! exactly one response through the [`Session`]; the disposition attached to
//! it tells the session what to do once the host has read the response.
//!
//! | Command             | Reply                                             |
//! |---------------------|---------------------------------------------------|
//! | `getvar:<name>`     | `OKAY<value>` or `FAILunknown variable`           |
//! | `download:<size>`   | `DATA<size>`, then the data phase, then `OKAY`    |
//! | `flash:<partition>` | `FAILunknown partition`                           |
//! | `reboot`            | `OKAY`, then the device reboots                   |
//! | `boot`              | `OKAY`, then the downloaded kernel is chainloaded |
//! | `oem crc32`         | `INFO<crc>`, then `OKAY`                          |

use core::cell::Cell;
use core::fmt;

use kernel::debug;
use kernel::hil::usb::UsbError;

use crate::bootimg::BootImageHeader;
use crate::chainload::{ChainloadEntry, ChainloadTable};
use crate::crc32::crc32;

/// The four-character prefix of every response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseToken {
    Okay,
    Info,
    Fail,
    Data,
}

impl ResponseToken {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseToken::Okay => "OKAY",
            ResponseToken::Info => "INFO",
            ResponseToken::Fail => "FAIL",
            ResponseToken::Data => "DATA",
        }
    }
}

/// What the session does once a response has been sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Wait for the next command line.
    ReadHostCommand,
    /// Receive the data announced by a `DATA` response.
    Download,
    /// Follow up with an empty `OKAY`.
    Okay,
    /// Call [`CommandProcessor::continue_action`].
    Continue,
    Reboot,
    Chainload,
}

/// What the command processor needs from the USB session.
pub trait Session {
    /// Format and queue a response. `message` is truncated to fit.
    fn send_response(
        &self,
        disposition: Disposition,
        token: ResponseToken,
        message: fmt::Arguments,
    ) -> Result<(), UsbError>;

    /// Reset the download buffer for `size` bytes of data.
    fn prepare_download(&self, size: usize) -> Result<(), UsbError>;

    fn max_download_size(&self) -> usize;

    /// The buffer of the most recent download, as long as that download
    /// was declared to be.
    fn last_download(&self) -> &[Cell<u8>];
}

/// Values reported through `getvar`.
#[derive(Clone, Copy, Debug)]
pub struct FastbootConfig<'a> {
    pub version: &'a str,
    pub product: &'a str,
}

impl Default for FastbootConfig<'static> {
    fn default() -> Self {
        FastbootConfig {
            version: "0.4",
            product: "Fusée Fastboot",
        }
    }
}

/// Download sizes are always eight hex digits.
fn parse_download_size(argument: &str) -> Option<usize> {
    if argument.len() != 8 || !argument.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(argument, 16).ok().map(|size| size as usize)
}

pub struct CommandProcessor<'a> {
    config: FastbootConfig<'a>,
    chainload: &'a ChainloadTable,
}

impl<'a> CommandProcessor<'a> {
    pub fn new(config: FastbootConfig<'a>, chainload: &'a ChainloadTable) -> CommandProcessor<'a> {
        CommandProcessor { config, chainload }
    }

    /// Run the command in `line`, which holds the bytes the host sent, up to
    /// an optional NUL.
    pub fn process_command(&self, session: &dyn Session, line: &[u8]) -> Result<(), UsbError> {
        let line = match line.iter().position(|&b| b == 0) {
            Some(end) => &line[..end],
            None => line,
        };
        let line = match core::str::from_utf8(line) {
            Ok(line) => line,
            Err(err) => core::str::from_utf8(&line[..err.valid_up_to()]).unwrap_or(""),
        };
        debug!("got host command: '{}'", line);

        let (name, argument) = match line.split_once(':') {
            Some((name, argument)) => (name, Some(argument)),
            None => (line, None),
        };
        match name {
            "getvar" => self.getvar(session, argument.unwrap_or("")),
            "download" => self.download(session, argument.unwrap_or("")),
            "flash" => self.flash(session),
            "reboot" => self.reboot(session),
            "boot" => self.boot(session),
            "oem crc32" => self.oem_crc32(session),
            _ => session.send_response(
                Disposition::ReadHostCommand,
                ResponseToken::Fail,
                format_args!("unknown command: {}", name),
            ),
        }
    }

    /// Resume a multi-step command after an intermediate `INFO` response.
    pub fn continue_action(&self, session: &dyn Session) -> Result<(), UsbError> {
        session.send_response(
            Disposition::ReadHostCommand,
            ResponseToken::Fail,
            format_args!("no pending action"),
        )
    }

    fn fail(&self, session: &dyn Session, message: &str) -> Result<(), UsbError> {
        session.send_response(
            Disposition::ReadHostCommand,
            ResponseToken::Fail,
            format_args!("{}", message),
        )
    }

    fn getvar(&self, session: &dyn Session, name: &str) -> Result<(), UsbError> {
        match name {
            "version" => session.send_response(
                Disposition::ReadHostCommand,
                ResponseToken::Okay,
                format_args!("{}", self.config.version),
            ),
            "product" => session.send_response(
                Disposition::ReadHostCommand,
                ResponseToken::Okay,
                format_args!("{}", self.config.product),
            ),
            "max-download-size" => session.send_response(
                Disposition::ReadHostCommand,
                ResponseToken::Okay,
                format_args!("{:08X}", session.max_download_size()),
            ),
            _ => self.fail(session, "unknown variable"),
        }
    }

    fn download(&self, session: &dyn Session, argument: &str) -> Result<(), UsbError> {
        let size = match parse_download_size(argument) {
            Some(size) => size,
            None => return self.fail(session, "failed to parse download size"),
        };

        match session.prepare_download(size) {
            Ok(()) => {}
            Err(UsbError::DownloadTooLarge) => {
                return self.fail(session, "download size too large");
            }
            Err(err) => return Err(err),
        }

        session.send_response(
            Disposition::Download,
            ResponseToken::Data,
            format_args!("{:08X}", size),
        )
    }

    fn flash(&self, session: &dyn Session) -> Result<(), UsbError> {
        self.fail(session, "unknown partition")
    }

    fn reboot(&self, session: &dyn Session) -> Result<(), UsbError> {
        session.send_response(Disposition::Reboot, ResponseToken::Okay, format_args!(""))
    }

    fn boot(&self, session: &dyn Session) -> Result<(), UsbError> {
        let image = session.last_download();
        if image.len() == 0 {
            return self.fail(session, "no image has been downloaded");
        }

        let header = match BootImageHeader::parse(image)
            .and_then(|header| header.check_kernel_only(image.len()).map(|()| header))
        {
            Ok(header) => header,
            Err(err) => {
                debug!("rejecting boot image: {:?}", err);
                return self.fail(session, err.message());
            }
        };

        debug!("loading kernel to {:#x}", header.kernel_addr);
        self.chainload.clear();
        let entry = ChainloadEntry {
            load_address: header.kernel_addr as usize,
            src_address: image.as_ptr() as usize + header.page_size as usize,
            size: header.kernel_size as usize,
            num: 0,
        };
        if self.chainload.push(entry).is_err() {
            return self.fail(session, "chainload table is full");
        }
        self.chainload.set_entry_point(header.kernel_addr as usize);

        session.send_response(Disposition::Chainload, ResponseToken::Okay, format_args!(""))
    }

    fn oem_crc32(&self, session: &dyn Session) -> Result<(), UsbError> {
        let crc = crc32(0, session.last_download().iter().map(Cell::get));
        session.send_response(
            Disposition::Okay,
            ResponseToken::Info,
            format_args!("{:08x}", crc),
        )
    }
}
