// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Endpoint contexts and the per-endpoint operations built on them.
//!
//! The controller reads one 64-byte context per endpoint from an array whose
//! address is programmed into ECPLO/ECPHI. Index 0 is the bidirectional
//! control endpoint; every other endpoint `n` lives at `n * 2` (OUT) and
//! `n * 2 + 1` (IN). Changes to a context only take effect after the
//! endpoint is reloaded.

use kernel::hil::usb::{EndpointAddress, EndpointDirection, TransferType, UsbError};
use kernel::utilities::registers::interfaces::{ReadWriteable, Readable, Writeable};
use kernel::utilities::registers::{register_bitfields, InMemoryRegister};
use kernel::ErrorCode;

use super::ring::{TransferRing, TrbBorrow};
use super::trb::Trb;
use super::XusbController;

register_bitfields![u32,
    EP_INFO0 [
        STATE OFFSET(0) NUMBITS(3) [
            Disabled = 0,
            Running = 1,
            Halted = 2,
            Stopped = 3,
            Error = 4
        ],
        MULT OFFSET(8) NUMBITS(2) [],
        MAX_PSTREAMS OFFSET(10) NUMBITS(5) [],
        LSA OFFSET(15) NUMBITS(1) [],
        INTERVAL OFFSET(16) NUMBITS(8) []
    ],
    EP_INFO1 [
        CERR OFFSET(1) NUMBITS(2) [],
        EP_TYPE OFFSET(3) NUMBITS(3) [
            IsochronousOut = 1,
            BulkOut = 2,
            InterruptOut = 3,
            Control = 4,
            IsochronousIn = 5,
            BulkIn = 6,
            InterruptIn = 7
        ],
        HID OFFSET(7) NUMBITS(1) [],
        MAX_BURST OFFSET(8) NUMBITS(8) [],
        MAX_PACKET_SIZE OFFSET(16) NUMBITS(16) []
    ],
    EP_DEQ_LO [
        /// Dequeue cycle state.
        DCS OFFSET(0) NUMBITS(1) [],
        /// TR dequeue pointer, bits 4..32 of the address.
        POINTER OFFSET(4) NUMBITS(28) []
    ],
    EP_TX_INFO [
        AVG_TRB_LENGTH OFFSET(0) NUMBITS(16) [],
        MAX_ESIT_PAYLOAD OFFSET(16) NUMBITS(16) []
    ],
    EP_WORD5 [
        EDTLA OFFSET(0) NUMBITS(24) [],
        SEQ_NUM OFFSET(24) NUMBITS(8) []
    ],
    EP_WORD6 [
        CEC OFFSET(18) NUMBITS(2) []
    ],
    EP_WORD11 [
        DEVICE_ADDRESS OFFSET(0) NUMBITS(7) []
    ]
];

/// Hardware endpoint context.
#[repr(C, align(64))]
pub struct EndpointContext {
    info0: InMemoryRegister<u32, EP_INFO0::Register>,
    info1: InMemoryRegister<u32, EP_INFO1::Register>,
    deq_lo: InMemoryRegister<u32, EP_DEQ_LO::Register>,
    deq_hi: InMemoryRegister<u32>,
    tx_info: InMemoryRegister<u32, EP_TX_INFO::Register>,
    word5: InMemoryRegister<u32, EP_WORD5::Register>,
    word6: InMemoryRegister<u32, EP_WORD6::Register>,
    reserved0: [InMemoryRegister<u32>; 4],
    word11: InMemoryRegister<u32, EP_WORD11::Register>,
    reserved1: [InMemoryRegister<u32>; 4],
}

impl EndpointContext {
    pub const fn new() -> EndpointContext {
        EndpointContext {
            info0: InMemoryRegister::new(0),
            info1: InMemoryRegister::new(0),
            deq_lo: InMemoryRegister::new(0),
            deq_hi: InMemoryRegister::new(0),
            tx_info: InMemoryRegister::new(0),
            word5: InMemoryRegister::new(0),
            word6: InMemoryRegister::new(0),
            reserved0: [
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
            ],
            word11: InMemoryRegister::new(0),
            reserved1: [
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
            ],
        }
    }

    pub fn address(&self) -> u64 {
        self as *const EndpointContext as usize as u64
    }

    pub fn clear(&self) {
        self.info0.set(0);
        self.info1.set(0);
        self.deq_lo.set(0);
        self.deq_hi.set(0);
        self.tx_info.set(0);
        self.word5.set(0);
        self.word6.set(0);
        for word in self.reserved0.iter() {
            word.set(0);
        }
        self.word11.set(0);
        for word in self.reserved1.iter() {
            word.set(0);
        }
    }

    /// Set up the bidirectional control endpoint context.
    pub fn initialize_control(&self) {
        self.clear();
        self.info0.write(EP_INFO0::STATE::Running);
        self.info1.write(
            EP_INFO1::CERR.val(3) + EP_INFO1::EP_TYPE::Control + EP_INFO1::MAX_PACKET_SIZE.val(64),
        );
        self.deq_lo.write(EP_DEQ_LO::DCS::SET);
        self.tx_info.write(EP_TX_INFO::AVG_TRB_LENGTH.val(8));
        self.word6.write(EP_WORD6::CEC.val(3));
        self.word5.write(EP_WORD5::SEQ_NUM.val(0));
    }

    /// Set up a bulk or interrupt endpoint context. IN endpoints other than
    /// control use the endpoint type offset by four.
    pub fn initialize(
        &self,
        direction: EndpointDirection,
        transfer_type: TransferType,
        max_packet_size: u16,
    ) {
        self.clear();
        self.info0.write(EP_INFO0::STATE::Running);
        let mut ep_type = transfer_type as u32;
        if transfer_type != TransferType::Control && direction == EndpointDirection::In {
            ep_type += 4;
        }
        self.info1.write(
            EP_INFO1::EP_TYPE.val(ep_type)
                + EP_INFO1::CERR.val(3)
                + EP_INFO1::MAX_PACKET_SIZE.val(max_packet_size as u32)
                + EP_INFO1::MAX_BURST.val(0),
        );
        self.word6.write(EP_WORD6::CEC.val(3));
    }

    /// Point the controller at the first TRB to consume.
    pub fn set_dequeue(&self, address: u64, cycle: bool) {
        self.deq_lo.write(
            EP_DEQ_LO::POINTER.val((address as u32) >> 4) + EP_DEQ_LO::DCS.val(cycle as u32),
        );
        self.deq_hi.set((address >> 32) as u32);
    }

    pub fn dequeue_pointer(&self) -> u64 {
        ((self.deq_hi.get() as u64) << 32) | ((self.deq_lo.read(EP_DEQ_LO::POINTER) as u64) << 4)
    }

    pub fn dequeue_cycle(&self) -> bool {
        self.deq_lo.is_set(EP_DEQ_LO::DCS)
    }

    pub fn set_device_address(&self, address: u8) {
        self.word11.modify(EP_WORD11::DEVICE_ADDRESS.val(address as u32));
    }

    pub fn device_address(&self) -> u8 {
        self.word11.read(EP_WORD11::DEVICE_ADDRESS) as u8
    }

    pub fn disable(&self) {
        self.info0.modify(EP_INFO0::STATE::Disabled);
    }

    pub fn state(&self) -> u32 {
        self.info0.read(EP_INFO0::STATE)
    }

    pub fn endpoint_type(&self) -> u32 {
        self.info1.read(EP_INFO1::EP_TYPE)
    }

    pub fn max_packet_size(&self) -> u16 {
        self.info1.read(EP_INFO1::MAX_PACKET_SIZE) as u16
    }

    pub fn error_count(&self) -> u32 {
        self.info1.read(EP_INFO1::CERR)
    }

    pub fn average_trb_length(&self) -> u32 {
        self.tx_info.read(EP_TX_INFO::AVG_TRB_LENGTH)
    }
}

/// One endpoint: its hardware context, its transfer ring, and the controller
/// registers that act on it.
pub struct Endpoint<'a> {
    index: usize,
    controller: &'a dyn XusbController,
    context: &'a EndpointContext,
    ring: TransferRing<'a>,
}

/// Map a state change the controller never acknowledged to the USB error
/// the caller reports.
fn acknowledged(result: Result<(), ErrorCode>) -> Result<(), UsbError> {
    result.map_err(|_| UsbError::EndpointStateTimeout)
}

impl<'a> Endpoint<'a> {
    pub fn new(
        index: usize,
        controller: &'a dyn XusbController,
        context: &'a EndpointContext,
    ) -> Endpoint<'a> {
        Endpoint {
            index,
            controller,
            context,
            ring: TransferRing::new(),
        }
    }

    /// Context index, also the doorbell target.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn context(&self) -> &'a EndpointContext {
        self.context
    }

    pub fn ring(&self) -> &TransferRing<'a> {
        &self.ring
    }

    fn install_ring(&self, trbs: &'a [Trb]) {
        self.ring.install(trbs);
        self.context
            .set_dequeue(self.ring.base_address(), self.ring.producer_cycle());
    }

    /// Bring up endpoint 0. The controller picks up the context on the reload
    /// issued once the context array has been installed.
    pub fn initialize_control(&self, trbs: &'a [Trb]) {
        self.context.initialize_control();
        self.install_ring(trbs);
    }

    /// Bring up a non-control endpoint and start it running.
    pub fn initialize(
        &self,
        address: EndpointAddress,
        transfer_type: TransferType,
        max_packet_size: u16,
        trbs: &'a [Trb],
    ) -> Result<(), UsbError> {
        self.context
            .initialize(address.direction, transfer_type, max_packet_size);
        self.install_ring(trbs);
        self.reload()?;
        acknowledged(self.controller.set_pause(self.index, false))?;
        acknowledged(self.controller.set_halt(self.index, false))
    }

    /// Stop the endpoint and return it to a clean, unpaused, unhalted state.
    pub fn disable(&self) -> Result<(), UsbError> {
        self.context.disable();
        self.reload()?;
        self.clear_pause()?;
        self.clear_halt()?;
        if self.controller.is_stopped(self.index) {
            self.controller.clear_stopped(self.index);
        }
        Ok(())
    }

    pub fn enqueue(&self, chain: bool) -> Result<TrbBorrow<'_, 'a>, UsbError> {
        self.ring.enqueue(chain)
    }

    pub fn free_count(&self) -> usize {
        self.ring.free_count()
    }

    /// Queue a single normal TRB for `length` bytes at `buffer`, request a
    /// completion event for it, and ring the doorbell. Returns the slot index
    /// of the TRB so the caller can match the completion.
    pub fn transfer_normal(&self, buffer: usize, length: usize) -> Result<usize, UsbError> {
        let trb = self.ring.enqueue(false)?;
        trb.init_normal(buffer, length);
        trb.set_interrupt_on_completion();
        let index = trb.index();
        trb.release();
        self.ring_doorbell(0);
        Ok(index)
    }

    pub fn ring_doorbell(&self, stream_id: u16) {
        self.controller.ring_doorbell(self.index, stream_id);
    }

    pub fn halt(&self) -> Result<(), UsbError> {
        if self.controller.is_halted(self.index) {
            return Ok(());
        }
        acknowledged(self.controller.set_halt(self.index, true))
    }

    pub fn clear_halt(&self) -> Result<(), UsbError> {
        if !self.controller.is_halted(self.index) {
            return Ok(());
        }
        acknowledged(self.controller.set_halt(self.index, false))
    }

    pub fn is_halted(&self) -> bool {
        self.controller.is_halted(self.index)
    }

    pub fn pause(&self) -> Result<(), UsbError> {
        if self.controller.is_paused(self.index) {
            return Ok(());
        }
        acknowledged(self.controller.set_pause(self.index, true))
    }

    pub fn clear_pause(&self) -> Result<(), UsbError> {
        if !self.controller.is_paused(self.index) {
            return Ok(());
        }
        acknowledged(self.controller.set_pause(self.index, false))
    }

    /// Make the controller re-read the endpoint context.
    pub fn reload(&self) -> Result<(), UsbError> {
        acknowledged(self.controller.reload(self.index))
    }

    /// Take ownership of the TRB at `trb_address`, which the controller
    /// reported as completed.
    pub fn accept_completed(&self, trb_address: u64) -> Result<TrbBorrow<'_, 'a>, UsbError> {
        self.ring.borrow_completed(trb_address)
    }

    /// Slot index of the TRB at `trb_address` in this endpoint's ring.
    pub fn trb_index(&self, trb_address: u64) -> Option<usize> {
        self.ring.index_of(trb_address)
    }

    /// Discard everything queued on the ring and point the context back at
    /// its first slot.
    pub fn reset_and_reload_ring(&self) -> Result<(), UsbError> {
        self.ring.reset();
        self.context
            .set_dequeue(self.ring.base_address(), self.ring.producer_cycle());
        self.reload()
    }

    pub fn dump_ring(&self) {
        self.ring.dump("endpoint");
    }
}
