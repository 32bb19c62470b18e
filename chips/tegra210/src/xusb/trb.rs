// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Transfer Request Blocks.
//!
//! A TRB is the 16-byte unit of every ring the XUSB device controller shares
//! with software. Transfer rings hold TRBs written by software and consumed by
//! the controller. The event ring holds TRBs written by the controller and
//! consumed by software.
//!
//! Ownership of a TRB is encoded in its cycle bit. The producer writes every
//! other field first and flips the cycle bit last; the consumer checks the
//! cycle bit first and only then reads the other fields. Both sides of that
//! handshake go through this module, which pairs them with release and
//! acquire fences so neither the compiler nor the CPU can reorder the field
//! accesses around the cycle bit.

use core::sync::atomic::{fence, Ordering};

use kernel::hil::usb::SetupPacket;
use kernel::utilities::registers::interfaces::{ReadWriteable, Readable, Writeable};
use kernel::utilities::registers::{register_bitfields, InMemoryRegister, LocalRegisterCopy};

register_bitfields![u32,
    /// Status word of a transfer TRB.
    pub TRB_STATUS [
        TRANSFER_LENGTH OFFSET(0) NUMBITS(17) [],
        TD_SIZE OFFSET(17) NUMBITS(5) [],
        INTERRUPTER OFFSET(22) NUMBITS(10) []
    ],
    /// Status word of an event TRB.
    pub EVENT_STATUS [
        /// Residual length of a transfer event.
        LENGTH OFFSET(0) NUMBITS(24) [],
        /// Sequence number of a setup event.
        SEQUENCE_NUMBER OFFSET(0) NUMBITS(16) [],
        COMPLETION_CODE OFFSET(24) NUMBITS(8) []
    ],
    pub TRB_CONTROL [
        CYCLE OFFSET(0) NUMBITS(1) [],
        /// Link TRBs: toggle the consumer cycle state when following the link.
        TOGGLE_CYCLE OFFSET(1) NUMBITS(1) [],
        INTERRUPT_ON_SHORT_PACKET OFFSET(2) NUMBITS(1) [],
        NO_SNOOP OFFSET(3) NUMBITS(1) [],
        CHAIN OFFSET(4) NUMBITS(1) [],
        INTERRUPT_ON_COMPLETION OFFSET(5) NUMBITS(1) [],
        IMMEDIATE_DATA OFFSET(6) NUMBITS(1) [],
        TRB_TYPE OFFSET(10) NUMBITS(6) [
            Normal = 1,
            SetupStage = 2,
            DataStage = 3,
            StatusStage = 4,
            Link = 6,
            TransferEvent = 32,
            PortStatusChangeEvent = 34,
            SetupEvent = 63
        ],
        /// Data and status stage TRBs: set for the IN direction.
        DIRECTION_IN OFFSET(16) NUMBITS(1) [],
        /// Event TRBs: the endpoint context index the event is about.
        ENDPOINT_ID OFFSET(16) NUMBITS(5) []
    ]
];

pub mod trb_type {
    pub const NORMAL: u32 = 1;
    pub const DATA_STAGE: u32 = 3;
    pub const STATUS_STAGE: u32 = 4;
    pub const LINK: u32 = 6;
    pub const TRANSFER_EVENT: u32 = 32;
    pub const PORT_STATUS_CHANGE_EVENT: u32 = 34;
    pub const SETUP_EVENT: u32 = 63;
}

pub mod completion_code {
    pub const SUCCESS: u8 = 1;
    pub const SHORT_PACKET: u8 = 13;
    /// A control transfer was superseded by a newer setup packet.
    pub const SEQUENCE_NUMBER_ERROR: u8 = 223;
}

/// One 16-byte TRB in memory shared with the controller.
#[repr(C, align(16))]
pub struct Trb {
    parameter_lo: InMemoryRegister<u32>,
    parameter_hi: InMemoryRegister<u32>,
    status: InMemoryRegister<u32, TRB_STATUS::Register>,
    control: InMemoryRegister<u32, TRB_CONTROL::Register>,
}

impl Trb {
    pub const fn new() -> Trb {
        Trb {
            parameter_lo: InMemoryRegister::new(0),
            parameter_hi: InMemoryRegister::new(0),
            status: InMemoryRegister::new(0),
            control: InMemoryRegister::new(0),
        }
    }

    /// Bus address of this TRB, as the controller sees it.
    pub fn address(&self) -> u64 {
        self as *const Trb as usize as u64
    }

    pub fn parameter(&self) -> u64 {
        ((self.parameter_hi.get() as u64) << 32) | self.parameter_lo.get() as u64
    }

    fn set_parameter(&self, parameter: u64) {
        self.parameter_lo.set(parameter as u32);
        self.parameter_hi.set((parameter >> 32) as u32);
    }

    pub fn trb_type(&self) -> u32 {
        self.control.read(TRB_CONTROL::TRB_TYPE)
    }

    pub fn cycle(&self) -> bool {
        self.control.is_set(TRB_CONTROL::CYCLE)
    }

    /// Buffer length programmed into a transfer TRB.
    pub fn transfer_length(&self) -> u32 {
        self.status.read(TRB_STATUS::TRANSFER_LENGTH)
    }

    pub fn td_size(&self) -> u32 {
        self.status.read(TRB_STATUS::TD_SIZE)
    }

    pub fn is_chained(&self) -> bool {
        self.control.is_set(TRB_CONTROL::CHAIN)
    }

    pub fn interrupts_on_completion(&self) -> bool {
        self.control.is_set(TRB_CONTROL::INTERRUPT_ON_COMPLETION)
    }

    pub fn toggles_cycle(&self) -> bool {
        self.control.is_set(TRB_CONTROL::TOGGLE_CYCLE)
    }

    pub fn is_direction_in(&self) -> bool {
        self.control.is_set(TRB_CONTROL::DIRECTION_IN)
    }

    /// Raw contents, in memory order.
    pub fn words(&self) -> [u32; 4] {
        [
            self.parameter_lo.get(),
            self.parameter_hi.get(),
            self.status.get(),
            self.control.get(),
        ]
    }

    /// Zero the TRB, leaving the cycle bit at `cycle`.
    pub(crate) fn clear(&self, cycle: bool) {
        self.control.write(TRB_CONTROL::CYCLE.val(cycle as u32));
        self.parameter_lo.set(0);
        self.parameter_hi.set(0);
        self.status.set(0);
    }

    /// Describe a bulk or interrupt transfer of `length` bytes at `buffer`.
    pub fn init_normal(&self, buffer: usize, length: usize) {
        self.set_parameter(buffer as u64);
        self.status
            .write(TRB_STATUS::TRANSFER_LENGTH.val(length as u32));
        self.control.modify(TRB_CONTROL::TRB_TYPE::Normal);
    }

    /// Describe the data stage of a control transfer.
    pub fn init_data_stage(&self, direction_in: bool, buffer: usize, length: usize) {
        self.set_parameter(buffer as u64);
        self.status
            .write(TRB_STATUS::TRANSFER_LENGTH.val(length as u32));
        self.control.modify(
            TRB_CONTROL::TRB_TYPE::DataStage + TRB_CONTROL::DIRECTION_IN.val(direction_in as u32),
        );
    }

    /// Describe the status stage of a control transfer.
    pub fn init_status_stage(&self, direction_in: bool) {
        self.control.modify(
            TRB_CONTROL::TRB_TYPE::StatusStage
                + TRB_CONTROL::DIRECTION_IN.val(direction_in as u32),
        );
    }

    /// Turn this TRB into a link back to `target`, owned by the controller
    /// when its cycle bit equals `cycle`.
    pub(crate) fn init_link(&self, target: u64, chain: bool, cycle: bool) {
        self.set_parameter(target);
        self.status.set(0);
        self.control.write(
            TRB_CONTROL::TRB_TYPE::Link
                + TRB_CONTROL::TOGGLE_CYCLE::SET
                + TRB_CONTROL::CHAIN.val(chain as u32)
                + TRB_CONTROL::CYCLE.val(!cycle as u32),
        );
        self.publish(cycle);
    }

    /// Mark this TRB as part of a multi-TRB transfer descriptor with
    /// `td_size` packets still to come after it.
    pub fn set_chain(&self, td_size: u32) {
        self.control.modify(TRB_CONTROL::CHAIN::SET);
        self.status.modify(TRB_STATUS::TD_SIZE.val(td_size));
    }

    /// Request a transfer event when this TRB completes or ends short.
    pub fn set_interrupt_on_completion(&self) {
        self.control.modify(
            TRB_CONTROL::INTERRUPT_ON_COMPLETION::SET + TRB_CONTROL::INTERRUPT_ON_SHORT_PACKET::SET,
        );
    }

    /// Hand the TRB to the controller.
    pub(crate) fn publish(&self, cycle: bool) {
        fence(Ordering::Release);
        self.control.modify(TRB_CONTROL::CYCLE.val(cycle as u32));
    }

    /// Whether the controller has written this event TRB for a consumer
    /// expecting `cycle`. On success the rest of the TRB is safe to read.
    pub(crate) fn is_ready(&self, cycle: bool) -> bool {
        if self.cycle() != cycle {
            return false;
        }
        fence(Ordering::Acquire);
        true
    }

    /// Decode an event TRB the controller produced.
    pub fn decode_event(&self) -> Event {
        let status: LocalRegisterCopy<u32, EVENT_STATUS::Register> =
            LocalRegisterCopy::new(self.status.get());
        match self.trb_type() {
            trb_type::TRANSFER_EVENT => Event::Transfer(TransferEvent {
                endpoint: self.control.read(TRB_CONTROL::ENDPOINT_ID) as usize,
                completion_code: status.read(EVENT_STATUS::COMPLETION_CODE) as u8,
                residual_length: status.read(EVENT_STATUS::LENGTH),
                trb_address: self.parameter(),
            }),
            trb_type::SETUP_EVENT => {
                let mut raw = [0u8; 8];
                raw[..4].copy_from_slice(&self.parameter_lo.get().to_le_bytes());
                raw[4..].copy_from_slice(&self.parameter_hi.get().to_le_bytes());
                Event::Setup {
                    packet: SetupPacket::from_bytes(raw),
                    sequence_number: status.read(EVENT_STATUS::SEQUENCE_NUMBER) as u16,
                }
            }
            trb_type::PORT_STATUS_CHANGE_EVENT => Event::PortStatusChange,
            other => Event::Other(other as u8),
        }
    }

    /// Write an event TRB the way the controller does. Used by the host-side
    /// controller model.
    pub(crate) fn write_event(&self, parameter: u64, status: u32, control: u32, cycle: bool) {
        self.set_parameter(parameter);
        self.status.set(status);
        self.control.set((control & !1) | !cycle as u32);
        self.publish(cycle);
    }
}

/// Completion of a transfer TRB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferEvent {
    /// Endpoint context index.
    pub endpoint: usize,
    pub completion_code: u8,
    /// Bytes of the TRB that were not transferred.
    pub residual_length: u32,
    /// Address of the TRB that completed.
    pub trb_address: u64,
}

impl TransferEvent {
    /// Success or short packet.
    pub fn succeeded(&self) -> bool {
        self.completion_code == completion_code::SUCCESS
            || self.completion_code == completion_code::SHORT_PACKET
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Transfer(TransferEvent),
    Setup {
        packet: SetupPacket,
        sequence_number: u16,
    },
    PortStatusChange,
    Other(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_sixteen_bytes() {
        assert_eq!(core::mem::size_of::<Trb>(), 16);
        assert_eq!(core::mem::align_of::<Trb>(), 16);
    }

    #[test]
    fn normal_trb_fields() {
        let trb = Trb::new();
        trb.clear(false);
        trb.init_normal(0x8000_1000, 0x200);
        trb.set_chain(3);
        trb.set_interrupt_on_completion();
        assert_eq!(trb.trb_type(), trb_type::NORMAL);
        assert_eq!(trb.parameter(), 0x8000_1000);
        assert_eq!(trb.transfer_length(), 0x200);
        assert_eq!(trb.td_size(), 3);
        assert!(trb.is_chained());
        assert!(trb.interrupts_on_completion());
        assert!(!trb.cycle());
        trb.publish(true);
        assert!(trb.cycle());
        // Publishing only touches the cycle bit.
        assert_eq!(trb.transfer_length(), 0x200);
        assert_eq!(trb.words()[3] & 0x3f, 0x35);
    }

    #[test]
    fn link_trb_is_published_with_cycle() {
        let trb = Trb::new();
        trb.init_link(0x1000, true, false);
        assert_eq!(trb.trb_type(), trb_type::LINK);
        assert!(trb.toggles_cycle());
        assert!(trb.is_chained());
        assert!(!trb.cycle());
        assert_eq!(trb.parameter(), 0x1000);
    }

    #[test]
    fn decode_transfer_event() {
        let trb = Trb::new();
        let control = (trb_type::TRANSFER_EVENT << 10) | (3 << 16);
        let status = ((completion_code::SHORT_PACKET as u32) << 24) | 0x1c0;
        trb.write_event(0xdead_bee0, status, control, true);
        assert!(trb.is_ready(true));
        assert!(!trb.is_ready(false));
        assert_eq!(
            trb.decode_event(),
            Event::Transfer(TransferEvent {
                endpoint: 3,
                completion_code: completion_code::SHORT_PACKET,
                residual_length: 0x1c0,
                trb_address: 0xdead_bee0,
            })
        );
    }

    #[test]
    fn decode_setup_event() {
        let trb = Trb::new();
        let raw = [0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00];
        trb.write_event(u64::from_le_bytes(raw), 0x42, trb_type::SETUP_EVENT << 10, false);
        match trb.decode_event() {
            Event::Setup {
                packet,
                sequence_number,
            } => {
                assert_eq!(packet.request_code, 5);
                assert_eq!(packet.value, 7);
                assert_eq!(sequence_number, 0x42);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
