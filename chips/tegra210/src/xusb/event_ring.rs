// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The event ring, written by the controller and read by software.
//!
//! Events are never handed back to the controller slot by slot. Instead the
//! dequeue pointer register tells the controller how far software has read,
//! and it is updated after every consumed event so the controller can keep
//! producing while software drains the ring.

use core::cell::Cell;

use kernel::utilities::cells::OptionalCell;

use super::trb::{Event, Trb};
use super::XusbController;

pub struct EventRing<'a> {
    controller: &'a dyn XusbController,
    trbs: OptionalCell<&'a [Trb]>,
    dequeue_index: Cell<usize>,
    consumer_cycle: Cell<bool>,
}

impl<'a> EventRing<'a> {
    pub fn new(controller: &'a dyn XusbController) -> EventRing<'a> {
        EventRing {
            controller,
            trbs: OptionalCell::empty(),
            dequeue_index: Cell::new(0),
            consumer_cycle: Cell::new(true),
        }
    }

    fn storage(&self) -> &'a [Trb] {
        self.trbs.map(|trbs| *trbs).unwrap_or(&[])
    }

    /// Zero `trbs` and hand it to the controller as the single event ring
    /// segment.
    pub fn install(&self, trbs: &'a [Trb]) {
        for trb in trbs {
            trb.clear(false);
        }
        self.trbs.set(trbs);
        self.dequeue_index.set(0);
        self.consumer_cycle.set(true);
        let base = trbs.first().map_or(0, |trb| trb.address());
        self.controller.install_event_ring(base, trbs.len());
    }

    pub fn dequeue_index(&self) -> usize {
        self.dequeue_index.get()
    }

    pub fn consumer_cycle(&self) -> bool {
        self.consumer_cycle.get()
    }

    /// Take the next event, if the controller has written one.
    pub fn pop(&self) -> Option<Event> {
        let trbs = self.storage();
        let trb = trbs.get(self.dequeue_index.get())?;
        if !trb.is_ready(self.consumer_cycle.get()) {
            return None;
        }
        let event = trb.decode_event();

        let mut next = self.dequeue_index.get() + 1;
        if next == trbs.len() {
            next = 0;
            self.consumer_cycle.set(!self.consumer_cycle.get());
        }
        self.dequeue_index.set(next);
        self.controller.set_event_dequeue(trbs[next].address());

        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xusb::testing::MockController;
    use crate::xusb::trb::trb_type;

    fn port_event(trb: &Trb, cycle: bool) {
        trb.write_event(0, 0, trb_type::PORT_STATUS_CHANGE_EVENT << 10, cycle);
    }

    #[test]
    fn install_programs_segment() {
        let controller = MockController::new();
        let trbs: [Trb; 4] = core::array::from_fn(|_| Trb::new());
        let ring = EventRing::new(&controller);
        ring.install(&trbs);
        assert_eq!(controller.event_ring(), (trbs[0].address(), 4));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn pop_advances_and_publishes_dequeue_pointer() {
        let controller = MockController::new();
        let trbs: [Trb; 4] = core::array::from_fn(|_| Trb::new());
        let ring = EventRing::new(&controller);
        ring.install(&trbs);

        port_event(&trbs[0], true);
        assert_eq!(ring.pop(), Some(Event::PortStatusChange));
        assert_eq!(controller.event_dequeue(), trbs[1].address());
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn wraparound_flips_consumer_cycle() {
        let controller = MockController::new();
        let trbs: [Trb; 4] = core::array::from_fn(|_| Trb::new());
        let ring = EventRing::new(&controller);
        ring.install(&trbs);

        for trb in trbs.iter() {
            port_event(trb, true);
        }
        for _ in 0..4 {
            assert_eq!(ring.pop(), Some(Event::PortStatusChange));
        }
        assert_eq!(ring.dequeue_index(), 0);
        assert!(!ring.consumer_cycle());
        assert_eq!(controller.event_dequeue(), trbs[0].address());
        // Stale first-pass events are not consumed again.
        assert_eq!(ring.pop(), None);

        port_event(&trbs[0], false);
        assert_eq!(ring.pop(), Some(Event::PortStatusChange));
    }
}
