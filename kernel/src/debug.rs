// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Support for logging debug messages from the kernel, chips, and capsules.
//!
//! There is no scheduler and no deferred calls on the boards this kernel runs
//! on, so messages are written synchronously to a single board-provided
//! writer. Until the board installs one with [`set_debug_writer`], every
//! message is discarded. This is also what happens in host-side unit tests.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! debug!("Yes the code gets here with value {}", i);
//! debug_warn!("setup request failed: {:?}", err);
//! ```
//!
//! Each message carries a [`LogLevel`]. The board chooses the most verbose
//! level it wants to see; anything more verbose than that is dropped before
//! it is formatted.

use core::fmt::{write, Arguments, Result, Write};
use core::ptr::addr_of_mut;

/// Severity of a debug message, from most to least important.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warning = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn prefix(self) -> &'static str {
        match self {
            LogLevel::Error => "[E] ",
            LogLevel::Warning => "[W] ",
            LogLevel::Info => "[I] ",
            LogLevel::Debug => "[D] ",
        }
    }
}

/// Raw output sink for debug messages, usually a polled UART.
pub trait IoWrite {
    /// Write `buf` in its entirety, returning the number of bytes written.
    fn write(&mut self, buf: &[u8]) -> usize;
}

struct DebugWriter {
    writer: Option<&'static mut dyn IoWrite>,
    max_level: LogLevel,
}

static mut DEBUG_WRITER: DebugWriter = DebugWriter {
    writer: None,
    max_level: LogLevel::Info,
};

impl Write for DebugWriter {
    fn write_str(&mut self, s: &str) -> Result {
        if let Some(writer) = self.writer.as_mut() {
            writer.write(s.as_bytes());
        }
        Ok(())
    }
}

/// Install the board's output sink and the most verbose level to print.
///
/// # Safety
///
/// Must be called once during board setup, before any other code that may log
/// is running. The debug writer is a global without any locking.
pub unsafe fn set_debug_writer(writer: &'static mut dyn IoWrite, max_level: LogLevel) {
    let debug_writer = &mut *addr_of_mut!(DEBUG_WRITER);
    debug_writer.writer = Some(writer);
    debug_writer.max_level = max_level;
}

/// Whether a message at `level` would be printed.
pub fn level_enabled(level: LogLevel) -> bool {
    // Safety: the writer is only replaced during single-threaded board setup.
    let debug_writer = unsafe { &*addr_of_mut!(DEBUG_WRITER) };
    debug_writer.writer.is_some() && level <= debug_writer.max_level
}

fn with_writer<F: FnOnce(&mut DebugWriter)>(f: F) {
    // Safety: all code runs in the single polled main loop, so there is never
    // more than one active reference to the writer.
    let debug_writer = unsafe { &mut *addr_of_mut!(DEBUG_WRITER) };
    if debug_writer.writer.is_some() {
        f(debug_writer);
    }
}

/// Write a leveled, newline-terminated message. Used by the `debug!` family.
pub fn debug_println(level: LogLevel, args: Arguments) {
    if !level_enabled(level) {
        return;
    }
    with_writer(|writer| {
        let _ = writer.write_str(level.prefix());
        let _ = write(writer, args);
        let _ = writer.write_str("\r\n");
    });
}

/// Write a message verbatim, without prefix, newline, or level filtering.
///
/// Meant for operator-facing prompts.
pub fn debug_print_raw(args: Arguments) {
    with_writer(|writer| {
        let _ = write(writer, args);
    });
}

/// In-kernel `println()` debugging at `Debug` level.
#[macro_export]
macro_rules! debug {
    () => ({
        // Allow an empty debug!() to print the location when hit
        $crate::debug!("{}:{}", file!(), line!())
    });
    ($($arg:tt)+) => ({
        $crate::debug::debug_println($crate::debug::LogLevel::Debug, format_args!($($arg)+))
    });
}

/// Log at `Info` level.
#[macro_export]
macro_rules! debug_info {
    ($($arg:tt)+) => ({
        $crate::debug::debug_println($crate::debug::LogLevel::Info, format_args!($($arg)+))
    });
}

/// Log at `Warning` level.
#[macro_export]
macro_rules! debug_warn {
    ($($arg:tt)+) => ({
        $crate::debug::debug_println($crate::debug::LogLevel::Warning, format_args!($($arg)+))
    });
}

/// Log at `Error` level.
#[macro_export]
macro_rules! debug_error {
    ($($arg:tt)+) => ({
        $crate::debug::debug_println($crate::debug::LogLevel::Error, format_args!($($arg)+))
    });
}

/// Print without a prefix or trailing newline, regardless of level.
#[macro_export]
macro_rules! debug_raw {
    ($($arg:tt)+) => ({
        $crate::debug::debug_print_raw(format_args!($($arg)+))
    });
}

#[cfg(test)]
mod tests {
    use super::LogLevel;

    #[test]
    fn levels_order_by_verbosity() {
        assert!(LogLevel::Error < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
    }

    #[test]
    fn logging_without_writer_is_discarded() {
        assert!(!super::level_enabled(LogLevel::Error));
        crate::debug!("value {}", 1);
        crate::debug_error!("still {}", "fine");
        crate::debug_raw!("raw");
    }
}
