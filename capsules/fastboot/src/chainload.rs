// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The chainload table: what to copy where before jumping to the next stage.
//!
//! Fastboot only fills the table in. Once the run loop reports
//! [`crate::runner::Outcome::Chainload`], the board copies every entry, in
//! order and with overlap-safe semantics, then jumps to the entry point.

use core::cell::Cell;

use kernel::ErrorCode;

pub const MAX_CHAINLOAD_ENTRIES: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainloadEntry {
    pub load_address: usize,
    pub src_address: usize,
    pub size: usize,
    pub num: usize,
}

impl ChainloadEntry {
    const EMPTY: ChainloadEntry = ChainloadEntry {
        load_address: 0,
        src_address: 0,
        size: 0,
        num: 0,
    };
}

pub struct ChainloadTable {
    entries: [Cell<ChainloadEntry>; MAX_CHAINLOAD_ENTRIES],
    num_entries: Cell<usize>,
    entry_point: Cell<usize>,
}

impl ChainloadTable {
    pub const fn new() -> ChainloadTable {
        const EMPTY: Cell<ChainloadEntry> = Cell::new(ChainloadEntry::EMPTY);
        ChainloadTable {
            entries: [EMPTY; MAX_CHAINLOAD_ENTRIES],
            num_entries: Cell::new(0),
            entry_point: Cell::new(0),
        }
    }

    pub fn clear(&self) {
        self.num_entries.set(0);
        self.entry_point.set(0);
    }

    pub fn push(&self, entry: ChainloadEntry) -> Result<(), ErrorCode> {
        let count = self.num_entries.get();
        let slot = self.entries.get(count).ok_or(ErrorCode::NOMEM)?;
        slot.set(entry);
        self.num_entries.set(count + 1);
        Ok(())
    }

    pub fn set_entry_point(&self, address: usize) {
        self.entry_point.set(address);
    }

    pub fn entry_point(&self) -> usize {
        self.entry_point.get()
    }

    pub fn len(&self) -> usize {
        self.num_entries.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<ChainloadEntry> {
        if index < self.len() {
            self.entries.get(index).map(Cell::get)
        } else {
            None
        }
    }

    /// Entries in the order they must be copied.
    pub fn iter(&self) -> impl Iterator<Item = ChainloadEntry> + '_ {
        self.entries[..self.len()].iter().map(Cell::get)
    }
}
