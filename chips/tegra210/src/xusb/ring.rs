// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Transfer rings and the ownership tokens for their TRBs.
//!
//! A transfer ring is a circular array of [`Trb`]s. Software produces TRBs at
//! the enqueue cursor and the controller consumes them; software learns about
//! consumed TRBs from transfer events and moves its dequeue cursor past them.
//! The last physical slot is reserved for a link TRB pointing back to slot 0,
//! so a ring of `n` slots holds at most `n - 1` outstanding TRBs.
//!
//! Every slot handed out by the ring is wrapped in a [`TrbBorrow`]. A borrow
//! obtained from [`TransferRing::enqueue`] publishes its TRB to the controller
//! when it is released; a borrow obtained from
//! [`TransferRing::borrow_completed`] returns the slot to the ring when it is
//! released. Dropping a borrow releases it, so a slot can never be leaked or
//! released twice.

use core::cell::Cell;
use core::ops::Deref;

use kernel::hil::usb::UsbError;
use kernel::utilities::cells::OptionalCell;
use kernel::{config, debug};

use super::trb::Trb;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Intent {
    /// Publish the TRB with this cycle bit.
    Publish(bool),
    /// Return the slot to the ring.
    Recycle,
}

/// Exclusive access to one TRB slot of a [`TransferRing`].
#[must_use = "dropping a TrbBorrow immediately publishes or recycles its TRB"]
pub struct TrbBorrow<'r, 'a> {
    ring: &'r TransferRing<'a>,
    trb: &'a Trb,
    index: usize,
    intent: Option<Intent>,
}

impl<'r, 'a> TrbBorrow<'r, 'a> {
    /// Slot index of the borrowed TRB within its ring.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn trb(&self) -> &'a Trb {
        self.trb
    }

    /// Whether releasing this borrow publishes the TRB, as opposed to
    /// recycling a completed one.
    pub fn is_enqueue(&self) -> bool {
        matches!(self.intent, Some(Intent::Publish(_)))
    }

    /// Publish an enqueued TRB to the controller, or return a completed TRB
    /// to the ring.
    pub fn release(mut self) {
        self.resolve();
    }

    /// Give up a completed TRB without returning its slot to the ring, for
    /// completions that do not belong to the transfer being tracked.
    pub fn forget(mut self) {
        if self.intent == Some(Intent::Recycle) {
            self.intent = None;
        }
    }

    fn resolve(&mut self) {
        match self.intent.take() {
            Some(Intent::Publish(cycle)) => self.trb.publish(cycle),
            Some(Intent::Recycle) => self.ring.recycle(self.index),
            None => {}
        }
    }
}

impl Deref for TrbBorrow<'_, '_> {
    type Target = Trb;

    fn deref(&self) -> &Trb {
        self.trb
    }
}

impl Drop for TrbBorrow<'_, '_> {
    fn drop(&mut self) {
        self.resolve();
    }
}

pub struct TransferRing<'a> {
    trbs: OptionalCell<&'a [Trb]>,
    enqueue_index: Cell<usize>,
    dequeue_index: Cell<usize>,
    producer_cycle: Cell<bool>,
    full: Cell<bool>,
}

impl<'a> TransferRing<'a> {
    pub const fn new() -> TransferRing<'a> {
        TransferRing {
            trbs: OptionalCell::empty(),
            enqueue_index: Cell::new(0),
            dequeue_index: Cell::new(0),
            producer_cycle: Cell::new(true),
            full: Cell::new(false),
        }
    }

    /// Attach backing storage and reset the ring. `trbs` needs at least two
    /// slots, one of which is taken by the link TRB.
    pub fn install(&self, trbs: &'a [Trb]) {
        self.trbs.set(trbs);
        self.reset();
    }

    fn storage(&self) -> &'a [Trb] {
        self.trbs.map(|trbs| *trbs).unwrap_or(&[])
    }

    /// Zero every TRB and rewind both cursors to slot 0.
    pub fn reset(&self) {
        for trb in self.storage() {
            trb.clear(false);
        }
        self.producer_cycle.set(true);
        self.enqueue_index.set(0);
        self.dequeue_index.set(0);
        self.full.set(false);
    }

    /// Bus address of slot 0.
    pub fn base_address(&self) -> u64 {
        self.storage().first().map_or(0, |trb| trb.address())
    }

    pub fn capacity(&self) -> usize {
        self.storage().len()
    }

    /// Cycle bit the next enqueued TRB will be published with.
    pub fn producer_cycle(&self) -> bool {
        self.producer_cycle.get()
    }

    pub fn enqueue_index(&self) -> usize {
        self.enqueue_index.get()
    }

    pub fn dequeue_index(&self) -> usize {
        self.dequeue_index.get()
    }

    /// Number of TRBs that can be enqueued before the ring is full.
    pub fn free_count(&self) -> usize {
        let capacity = self.capacity();
        if capacity < 2 || self.full.get() {
            return 0;
        }
        let usable = capacity - 1;
        usable - ((self.enqueue_index.get() + usable - self.dequeue_index.get()) % usable)
    }

    /// Claim the next free slot.
    ///
    /// When the claimed slot is the last one before the link TRB, the link
    /// is rewritten with `chain` as its chain bit and the producer cycle
    /// state flips.
    pub fn enqueue(&self, chain: bool) -> Result<TrbBorrow<'_, 'a>, UsbError> {
        let trbs = self.storage();
        if trbs.len() < 2 {
            return Err(UsbError::InvalidDeviceState);
        }
        if self.full.get() {
            return Err(UsbError::RingFull);
        }

        let cycle = self.producer_cycle.get();
        let index = self.enqueue_index.get();
        let link_index = trbs.len() - 1;

        let mut next = index + 1;
        if next == link_index {
            trbs[link_index].init_link(trbs[0].address(), chain, cycle);
            next = 0;
            self.producer_cycle.set(!cycle);
        }
        self.enqueue_index.set(next);
        if next == self.dequeue_index.get() {
            self.full.set(true);
        }

        let trb = &trbs[index];
        trb.clear(!cycle);
        Ok(TrbBorrow {
            ring: self,
            trb,
            index,
            intent: Some(Intent::Publish(cycle)),
        })
    }

    /// Return every slot up to and including `index` to the ring.
    ///
    /// Completions arrive in ring order, and a transfer event is usually only
    /// requested for the last TRB of a batch, so recycling moves the dequeue
    /// cursor directly past the completed TRB.
    pub fn recycle(&self, index: usize) {
        let capacity = self.capacity();
        if capacity < 2 {
            return;
        }
        let mut next = index + 1;
        if next >= capacity - 1 {
            next = 0;
        }
        self.dequeue_index.set(next);
        self.full.set(false);
    }

    /// Slot index of the TRB at bus address `address`, if it belongs to this
    /// ring and is not the link TRB.
    pub fn index_of(&self, address: u64) -> Option<usize> {
        let base = self.base_address();
        let capacity = self.capacity();
        if capacity < 2 || address < base || (address - base) % 16 != 0 {
            return None;
        }
        let index = ((address - base) / 16) as usize;
        if index < capacity - 1 {
            Some(index)
        } else {
            None
        }
    }

    /// Take ownership of a TRB the controller reported as completed.
    pub fn borrow_completed(&self, address: u64) -> Result<TrbBorrow<'_, 'a>, UsbError> {
        let index = self.index_of(address).ok_or(UsbError::UnexpectedTrb)?;
        let trb = self.trb(index).ok_or(UsbError::UnexpectedTrb)?;
        Ok(TrbBorrow {
            ring: self,
            trb,
            index,
            intent: Some(Intent::Recycle),
        })
    }

    pub fn trb(&self, index: usize) -> Option<&'a Trb> {
        self.storage().get(index)
    }

    /// Print every slot of the ring when ring dumps are enabled.
    pub fn dump(&self, name: &str) {
        if !config::CONFIG.debug_xusb_rings {
            return;
        }
        debug!(
            "{} ring: enqueue {} dequeue {} pcs {} full {}",
            name,
            self.enqueue_index.get(),
            self.dequeue_index.get(),
            self.producer_cycle.get() as u8,
            self.full.get() as u8
        );
        let trbs = self.storage();
        for (i, trb) in trbs.iter().enumerate() {
            let words = trb.words();
            let enqueue = if i == self.enqueue_index.get() { 'E' } else { ' ' };
            let dequeue = if i == self.dequeue_index.get() { 'D' } else { ' ' };
            let link = if i + 1 == trbs.len() { 'L' } else { ' ' };
            debug!(
                "  [{:2}]{}{}{} c={} {:08x} {:08x} {:08x} {:08x}",
                i,
                enqueue,
                dequeue,
                link,
                trb.cycle() as u8,
                words[0],
                words[1],
                words[2],
                words[3]
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xusb::trb::trb_type;

    fn storage<const N: usize>() -> [Trb; N] {
        core::array::from_fn(|_| Trb::new())
    }

    #[test]
    fn fresh_ring_has_capacity_minus_one_free() {
        let trbs = storage::<5>();
        let ring = TransferRing::new();
        ring.install(&trbs);
        assert_eq!(ring.free_count(), 4);
        assert!(ring.producer_cycle());
        assert_eq!(ring.enqueue_index(), 0);
        assert_eq!(ring.dequeue_index(), 0);
    }

    #[test]
    fn uninstalled_ring_refuses_enqueue() {
        let ring = TransferRing::new();
        assert_eq!(ring.free_count(), 0);
        assert_eq!(ring.enqueue(false).err(), Some(UsbError::InvalidDeviceState));
    }

    #[test]
    fn release_publishes_cycle_bit() {
        let trbs = storage::<5>();
        let ring = TransferRing::new();
        ring.install(&trbs);
        let borrow = ring.enqueue(false).unwrap();
        borrow.init_normal(0x1000, 64);
        // Not visible to the controller until released.
        assert!(!trbs[0].cycle());
        borrow.release();
        assert!(trbs[0].cycle());
        assert_eq!(ring.free_count(), 3);
    }

    #[test]
    fn dropping_a_borrow_publishes_it() {
        let trbs = storage::<5>();
        let ring = TransferRing::new();
        ring.install(&trbs);
        {
            let _borrow = ring.enqueue(false).unwrap();
        }
        assert!(trbs[0].cycle());
    }

    #[test]
    fn fills_after_capacity_minus_one() {
        let trbs = storage::<5>();
        let ring = TransferRing::new();
        ring.install(&trbs);
        for expected_free in (0..4).rev() {
            ring.enqueue(false).unwrap().release();
            assert_eq!(ring.free_count(), expected_free);
        }
        assert_eq!(ring.enqueue(false).err(), Some(UsbError::RingFull));
    }

    #[test]
    fn wraparound_writes_link_and_flips_cycle_once() {
        let trbs = storage::<5>();
        let ring = TransferRing::new();
        ring.install(&trbs);
        for _ in 0..3 {
            ring.enqueue(false).unwrap().release();
        }
        assert!(ring.producer_cycle());
        let last = ring.enqueue(true).unwrap();
        assert_eq!(last.index(), 3);
        last.release();
        assert!(!ring.producer_cycle());

        let link = &trbs[4];
        assert_eq!(link.trb_type(), trb_type::LINK);
        assert!(link.toggles_cycle());
        assert!(link.is_chained());
        assert!(link.cycle());
        assert_eq!(link.parameter(), trbs[0].address());
        // Every TRB of the first pass carries the first-pass cycle bit.
        assert!(trbs[..4].iter().all(|trb| trb.cycle()));
    }

    #[test]
    fn second_pass_uses_inverted_cycle() {
        let trbs = storage::<5>();
        let ring = TransferRing::new();
        ring.install(&trbs);
        for _ in 0..4 {
            ring.enqueue(false).unwrap().release();
        }
        ring.recycle(3);
        assert_eq!(ring.dequeue_index(), 0);
        assert_eq!(ring.free_count(), 4);

        let borrow = ring.enqueue(false).unwrap();
        assert_eq!(borrow.index(), 0);
        // Cleared to the software-owned value until released.
        assert!(trbs[0].cycle());
        borrow.release();
        assert!(!trbs[0].cycle());
    }

    #[test]
    fn recycle_frees_everything_up_to_the_completed_trb() {
        let trbs = storage::<8>();
        let ring = TransferRing::new();
        ring.install(&trbs);
        for _ in 0..5 {
            ring.enqueue(false).unwrap().release();
        }
        assert_eq!(ring.free_count(), 2);
        ring.recycle(1);
        assert_eq!(ring.free_count(), 4);
        let completed = ring.borrow_completed(trbs[4].address()).unwrap();
        assert!(!completed.is_enqueue());
        completed.release();
        assert_eq!(ring.free_count(), 7);
    }

    #[test]
    fn forgotten_completion_keeps_its_slot() {
        let trbs = storage::<5>();
        let ring = TransferRing::new();
        ring.install(&trbs);
        ring.enqueue(false).unwrap().release();
        ring.enqueue(false).unwrap().release();

        ring.borrow_completed(trbs[1].address()).unwrap().forget();
        assert_eq!(ring.dequeue_index(), 0);
        assert_eq!(ring.free_count(), 2);

        // An enqueued TRB is still published.
        ring.enqueue(false).unwrap().forget();
        assert!(trbs[2].cycle());
    }

    #[test]
    fn free_count_tracks_outstanding_trbs_across_many_passes() {
        let trbs = storage::<6>();
        let ring = TransferRing::new();
        ring.install(&trbs);
        let mut outstanding: usize = 0;
        let mut cycle_flips = 0;
        let mut last_cycle = ring.producer_cycle();
        for step in 0..200usize {
            if step % 3 != 2 && ring.free_count() > 0 {
                let borrow = ring.enqueue(false).unwrap();
                // The controller must not already own the slot.
                assert_ne!(borrow.cycle(), ring_cycle_for(&borrow, last_cycle));
                borrow.release();
                outstanding += 1;
            } else if outstanding > 0 {
                let index = ring.dequeue_index();
                ring.recycle(index);
                outstanding -= 1;
            }
            assert_eq!(ring.free_count(), 5 - outstanding);
            if ring.producer_cycle() != last_cycle {
                cycle_flips += 1;
                last_cycle = ring.producer_cycle();
            }
        }
        assert!(cycle_flips > 2);
    }

    fn ring_cycle_for(borrow: &TrbBorrow, cycle_before: bool) -> bool {
        match borrow.intent {
            Some(Intent::Publish(cycle)) => cycle,
            _ => cycle_before,
        }
    }

    #[test]
    fn reset_restores_initial_state() {
        let trbs = storage::<5>();
        let ring = TransferRing::new();
        ring.install(&trbs);
        for _ in 0..4 {
            ring.enqueue(false).unwrap().release();
        }
        assert!(!ring.producer_cycle());
        ring.reset();
        assert!(ring.producer_cycle());
        assert_eq!(ring.free_count(), 4);
        assert!(trbs.iter().all(|trb| trb.words() == [0; 4]));
    }

    #[test]
    fn completed_addresses_outside_the_ring_are_rejected() {
        let trbs = storage::<5>();
        let ring = TransferRing::new();
        ring.install(&trbs);
        assert_eq!(
            ring.borrow_completed(trbs[4].address()).err(),
            Some(UsbError::UnexpectedTrb)
        );
        assert_eq!(
            ring.borrow_completed(trbs[0].address() + 8).err(),
            Some(UsbError::UnexpectedTrb)
        );
        assert_eq!(ring.index_of(trbs[2].address()), Some(2));
    }
}
