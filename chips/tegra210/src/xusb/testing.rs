// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Host-side model of the controller for unit tests.
//!
//! [`MockController`] keeps the controller registers in memory. [`HostSim`]
//! plays the role of the controller's DMA engine and of the USB host: it
//! writes events into the event ring, consumes TRBs from transfer rings
//! following the cycle bit, and copies data in and out of the buffers they
//! describe.

use core::cell::Cell;

use kernel::hil::usb::{request, SetupPacket};
use kernel::utilities::cells::OptionalCell;
use kernel::ErrorCode;

use super::dev::PortStatus;
use super::trb::{completion_code, trb_type, Trb};
use super::{PortChange, Xusb, XusbController, NUM_ENDPOINTS};

const PORTSC_CCS: u32 = 1 << 0;
const PORTSC_CSC: u32 = 1 << 17;
const PORTSC_WRC: u32 = 1 << 19;
const PORTSC_PRC: u32 = 1 << 21;
const PORTSC_PLC: u32 = 1 << 22;
const PORTSC_CEC: u32 = 1 << 23;

pub struct MockController {
    halted: Cell<u32>,
    paused: Cell<u32>,
    stopped: Cell<u32>,
    /// Halt, pause and reload requests time out without taking effect.
    wedged: Cell<bool>,
    halt_writes: [Cell<usize>; NUM_ENDPOINTS],
    reload_counts: [Cell<usize>; NUM_ENDPOINTS],
    last_doorbell: OptionalCell<(usize, u16)>,
    doorbells: Cell<usize>,

    device_address: Cell<u8>,
    running: Cell<bool>,
    run_change_clears: Cell<usize>,

    portsc: Cell<u32>,
    port_halt_request: Cell<bool>,
    ltssm_releases: Cell<usize>,

    event_ring: Cell<(u64, usize)>,
    event_dequeue: Cell<u64>,
    contexts: Cell<u64>,
    events_enabled: Cell<bool>,
    device_enabled: Cell<bool>,
}

impl MockController {
    pub fn new() -> MockController {
        MockController {
            halted: Cell::new(0),
            paused: Cell::new(0),
            stopped: Cell::new(0),
            wedged: Cell::new(false),
            halt_writes: core::array::from_fn(|_| Cell::new(0)),
            reload_counts: core::array::from_fn(|_| Cell::new(0)),
            last_doorbell: OptionalCell::empty(),
            doorbells: Cell::new(0),
            device_address: Cell::new(0),
            running: Cell::new(false),
            run_change_clears: Cell::new(0),
            portsc: Cell::new(0),
            port_halt_request: Cell::new(false),
            ltssm_releases: Cell::new(0),
            event_ring: Cell::new((0, 0)),
            event_dequeue: Cell::new(0),
            contexts: Cell::new(0),
            events_enabled: Cell::new(false),
            device_enabled: Cell::new(false),
        }
    }

    pub fn halt_writes(&self, endpoint: usize) -> usize {
        self.halt_writes[endpoint].get()
    }

    pub fn reload_count(&self, endpoint: usize) -> usize {
        self.reload_counts[endpoint].get()
    }

    pub fn last_doorbell(&self) -> Option<(usize, u16)> {
        self.last_doorbell.map(|doorbell| *doorbell)
    }

    pub fn doorbells(&self) -> usize {
        self.doorbells.get()
    }

    /// Stop acknowledging endpoint halt, pause and reload requests.
    pub fn wedge(&self, wedged: bool) {
        self.wedged.set(wedged);
    }

    fn acknowledge_state_change(&self) -> Result<(), ErrorCode> {
        if self.wedged.get() {
            Err(ErrorCode::BUSY)
        } else {
            Ok(())
        }
    }

    pub fn mark_stopped(&self, endpoint: usize) {
        self.stopped.set(self.stopped.get() | (1 << endpoint));
    }

    pub fn device_address(&self) -> u8 {
        self.device_address.get()
    }

    pub fn running(&self) -> bool {
        self.running.get()
    }

    pub fn run_change_clears(&self) -> usize {
        self.run_change_clears.get()
    }

    /// Overwrite the port status register, as the link layer would.
    pub fn set_port_status(&self, value: u32) {
        self.portsc.set(value);
    }

    pub fn request_port_halt_change(&self) {
        self.port_halt_request.set(true);
    }

    pub fn ltssm_releases(&self) -> usize {
        self.ltssm_releases.get()
    }

    /// Base address and size of the installed event ring segment.
    pub fn event_ring(&self) -> (u64, usize) {
        self.event_ring.get()
    }

    pub fn event_dequeue(&self) -> u64 {
        self.event_dequeue.get()
    }

    pub fn contexts(&self) -> u64 {
        self.contexts.get()
    }

    pub fn events_enabled(&self) -> bool {
        self.events_enabled.get()
    }

    pub fn device_enabled(&self) -> bool {
        self.device_enabled.get()
    }

    fn set_bit(cell: &Cell<u32>, endpoint: usize, value: bool) {
        if value {
            cell.set(cell.get() | (1 << endpoint));
        } else {
            cell.set(cell.get() & !(1 << endpoint));
        }
    }
}

impl XusbController for MockController {
    fn install_event_ring(&self, base: u64, len: usize) {
        self.event_ring.set((base, len));
        self.event_dequeue.set(base);
    }

    fn set_event_dequeue(&self, address: u64) {
        self.event_dequeue.set(address);
    }

    fn install_endpoint_contexts(&self, address: u64) {
        self.contexts.set(address);
    }

    fn enable_events(&self) {
        self.events_enabled.set(true);
    }

    fn enable_device(&self) {
        self.device_enabled.set(true);
    }

    fn ring_doorbell(&self, endpoint: usize, stream_id: u16) {
        self.last_doorbell.set((endpoint, stream_id));
        self.doorbells.set(self.doorbells.get() + 1);
    }

    fn is_halted(&self, endpoint: usize) -> bool {
        self.halted.get() & (1 << endpoint) != 0
    }

    fn set_halt(&self, endpoint: usize, halt: bool) -> Result<(), ErrorCode> {
        let writes = &self.halt_writes[endpoint];
        writes.set(writes.get() + 1);
        self.acknowledge_state_change()?;
        MockController::set_bit(&self.halted, endpoint, halt);
        Ok(())
    }

    fn is_paused(&self, endpoint: usize) -> bool {
        self.paused.get() & (1 << endpoint) != 0
    }

    fn set_pause(&self, endpoint: usize, pause: bool) -> Result<(), ErrorCode> {
        self.acknowledge_state_change()?;
        MockController::set_bit(&self.paused, endpoint, pause);
        Ok(())
    }

    fn reload(&self, endpoint: usize) -> Result<(), ErrorCode> {
        let count = &self.reload_counts[endpoint];
        count.set(count.get() + 1);
        self.acknowledge_state_change()
    }

    fn is_stopped(&self, endpoint: usize) -> bool {
        self.stopped.get() & (1 << endpoint) != 0
    }

    fn clear_stopped(&self, endpoint: usize) {
        MockController::set_bit(&self.stopped, endpoint, false);
    }

    fn set_device_address(&self, address: u8) {
        self.device_address.set(address);
    }

    fn set_run(&self, run: bool) {
        self.running.set(run);
    }

    fn clear_run_change(&self) {
        self.run_change_clears.set(self.run_change_clears.get() + 1);
    }

    fn port_status(&self) -> PortStatus {
        PortStatus::new(self.portsc.get())
    }

    fn acknowledge_port_change(&self, change: PortChange) {
        let bit = match change {
            PortChange::ConnectStatus => PORTSC_CSC,
            PortChange::PortReset => PORTSC_PRC,
            PortChange::WarmReset => PORTSC_WRC,
            PortChange::LinkState => PORTSC_PLC,
            PortChange::ConfigError => PORTSC_CEC,
        };
        self.portsc.set(self.portsc.get() & !bit);
    }

    fn port_halt_change_requested(&self) -> bool {
        self.port_halt_request.get()
    }

    fn release_link_state_machine(&self) {
        self.port_halt_request.set(false);
        self.ltssm_releases.set(self.ltssm_releases.get() + 1);
    }

    fn delay_us(&self, _us: u32) {}
}

/// What the host saw when a control stage TRB completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlStage {
    /// TRB type, data or status stage.
    pub kind: u32,
    pub direction_in: bool,
    /// Bytes described by the TRB.
    pub length: usize,
}

/// The controller's position in one transfer ring.
struct Cursor {
    index: Cell<usize>,
    cycle: Cell<bool>,
    reloads: Cell<usize>,
}

pub struct HostSim<'a> {
    controller: &'a MockController,
    xusb: &'a Xusb<'a>,
    events: &'a [Trb],
    event_index: Cell<usize>,
    event_cycle: Cell<bool>,
    next_sequence: Cell<u16>,
    cursors: [Cursor; NUM_ENDPOINTS],
}

impl<'a> HostSim<'a> {
    /// `events` must be the storage the driver's event ring was initialized
    /// with, and no event may have been written to it yet.
    pub fn new(
        controller: &'a MockController,
        xusb: &'a Xusb<'a>,
        events: &'a [Trb],
    ) -> HostSim<'a> {
        HostSim {
            controller,
            xusb,
            events,
            event_index: Cell::new(0),
            event_cycle: Cell::new(true),
            next_sequence: Cell::new(0),
            cursors: core::array::from_fn(|_| Cursor {
                index: Cell::new(usize::MAX),
                cycle: Cell::new(true),
                reloads: Cell::new(usize::MAX),
            }),
        }
    }

    /// Write one event TRB and let the driver process it.
    fn post(&self, parameter: u64, status: u32, control: u32) {
        let index = self.event_index.get();
        self.events[index].write_event(parameter, status, control, self.event_cycle.get());
        if index + 1 == self.events.len() {
            self.event_index.set(0);
            self.event_cycle.set(!self.event_cycle.get());
        } else {
            self.event_index.set(index + 1);
        }
        self.xusb.process();
    }

    pub fn port_status_change(&self, portsc: u32) {
        self.controller.set_port_status(portsc);
        self.post(0, 0, trb_type::PORT_STATUS_CHANGE_EVENT << 10);
    }

    /// A completed port reset with a device connected.
    pub fn bus_reset(&self) {
        self.port_status_change(PORTSC_PRC | PORTSC_CCS);
    }

    pub fn setup_with_sequence(&self, packet: SetupPacket, sequence_number: u16) {
        let raw = packet.to_bytes();
        let parameter = u64::from_le_bytes(raw);
        self.post(
            parameter,
            sequence_number as u32,
            trb_type::SETUP_EVENT << 10,
        );
    }

    pub fn setup(&self, request_type: u8, request_code: u8, value: u16, index: u16, length: u16) {
        let sequence_number = self.next_sequence.get();
        self.next_sequence.set(sequence_number.wrapping_add(1) % 0xfffe);
        let value = value.to_le_bytes();
        let index = index.to_le_bytes();
        let length = length.to_le_bytes();
        self.setup_with_sequence(
            SetupPacket::from_bytes([
                request_type,
                request_code,
                value[0],
                value[1],
                index[0],
                index[1],
                length[0],
                length[1],
            ]),
            sequence_number,
        );
    }

    pub fn transfer_event(&self, endpoint: usize, trb_address: u64, code: u8, residual: u32) {
        self.post(
            trb_address,
            ((code as u32) << 24) | (residual & 0xff_ffff),
            (trb_type::TRANSFER_EVENT << 10) | ((endpoint as u32) << 16),
        );
    }

    /// Follow the controller's view of `endpoint`'s ring to the next TRB
    /// software has handed over, without consuming it.
    fn next_trb(&self, endpoint: usize) -> Option<&'a Trb> {
        let ep = self.xusb.endpoint(endpoint)?;
        let cursor = &self.cursors[endpoint];
        let reloads = self.controller.reload_count(endpoint);
        if cursor.reloads.get() != reloads {
            cursor.reloads.set(reloads);
            let context = ep.context();
            cursor
                .index
                .set(ep.trb_index(context.dequeue_pointer()).unwrap_or(usize::MAX));
            cursor.cycle.set(context.dequeue_cycle());
        }

        // Bounded so a ring of nothing but links cannot spin forever.
        for _ in 0..2 {
            let trb = ep.ring().trb(cursor.index.get())?;
            if trb.cycle() != cursor.cycle.get() {
                return None;
            }
            if trb.trb_type() != trb_type::LINK {
                return Some(trb);
            }
            if trb.toggles_cycle() {
                cursor.cycle.set(!cursor.cycle.get());
            }
            cursor.index.set(0);
        }
        None
    }

    fn advance(&self, endpoint: usize) {
        let cursor = &self.cursors[endpoint];
        cursor.index.set(cursor.index.get() + 1);
    }

    fn complete(&self, endpoint: usize, trb: &Trb, code: u8, residual: u32) {
        self.advance(endpoint);
        if trb.interrupts_on_completion() || code == completion_code::SHORT_PACKET {
            self.transfer_event(endpoint, trb.address(), code, residual);
        }
    }

    /// Execute the next endpoint 0 stage. IN data is copied into `buf`.
    pub fn complete_control(&self, buf: &mut [u8]) -> Option<ControlStage> {
        let trb = self.next_trb(0)?;
        let stage = ControlStage {
            kind: trb.trb_type(),
            direction_in: trb.is_direction_in(),
            length: trb.transfer_length() as usize,
        };
        if stage.kind == trb_type::DATA_STAGE && stage.direction_in {
            let count = stage.length.min(buf.len());
            // Safety: the driver handed this buffer to the controller for
            // at least `length` bytes.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    trb.parameter() as usize as *const u8,
                    buf.as_mut_ptr(),
                    count,
                );
            }
        }
        self.complete(0, trb, completion_code::SUCCESS, 0);
        Some(stage)
    }

    /// Run a control read. Returns the length of the data stage if the
    /// device completed both stages.
    pub fn control_in(
        &self,
        request_type: u8,
        request_code: u8,
        value: u16,
        index: u16,
        length: u16,
        buf: &mut [u8],
    ) -> Option<usize> {
        self.setup(request_type, request_code, value, index, length);
        let data = self.complete_control(buf)?;
        if data.kind != trb_type::DATA_STAGE {
            return None;
        }
        let status = self.complete_control(&mut [])?;
        if status.kind != trb_type::STATUS_STAGE || status.direction_in {
            return None;
        }
        Some(data.length)
    }

    /// Run a control request without a data stage. Returns whether the
    /// device acknowledged it.
    pub fn control_no_data(
        &self,
        request_type: u8,
        request_code: u8,
        value: u16,
        index: u16,
    ) -> bool {
        self.setup(request_type, request_code, value, index, 0);
        match self.complete_control(&mut []) {
            Some(status) => status.kind == trb_type::STATUS_STAGE && status.direction_in,
            None => false,
        }
    }

    /// Reset, address, and configure the device.
    pub fn enumerate(&self, configuration: u16) {
        let mut descriptor = [0u8; 18];
        self.bus_reset();
        self.control_in(0x80, request::GET_DESCRIPTOR, 0x0100, 0, 18, &mut descriptor);
        self.control_no_data(0x00, request::SET_ADDRESS, 1, 0);
        self.control_no_data(0x00, request::SET_CONFIGURATION, configuration, 0);
    }

    /// Send `data` to OUT endpoint `endpoint` as one host write, filling
    /// queued TRBs in order. Ends at a short packet, or once `data` is used
    /// up at the end of a TD. An empty `data` sends a zero-length packet.
    /// Returns the number of bytes the device accepted.
    pub fn send_out(&self, endpoint: usize, data: &[u8]) -> usize {
        let mut offset = 0;
        while let Some(trb) = self.next_trb(endpoint) {
            let capacity = trb.transfer_length() as usize;
            let count = capacity.min(data.len() - offset);
            // Safety: the driver handed this buffer to the controller for
            // `capacity` bytes.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data[offset..].as_ptr(),
                    trb.parameter() as usize as *mut u8,
                    count,
                );
            }
            offset += count;

            if count < capacity {
                self.complete(
                    endpoint,
                    trb,
                    completion_code::SHORT_PACKET,
                    (capacity - count) as u32,
                );
                break;
            }
            let chained = trb.is_chained();
            self.complete(endpoint, trb, completion_code::SUCCESS, 0);
            if offset == data.len() && !chained {
                break;
            }
        }
        offset
    }

    /// Read the next TRB queued on IN endpoint `endpoint` into `buf`.
    /// Returns the length of the TRB.
    pub fn take_in(&self, endpoint: usize, buf: &mut [u8]) -> Option<usize> {
        let trb = self.next_trb(endpoint)?;
        let length = trb.transfer_length() as usize;
        // Safety: the driver handed this buffer to the controller for
        // `length` bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                trb.parameter() as usize as *const u8,
                buf.as_mut_ptr(),
                length.min(buf.len()),
            );
        }
        self.complete(endpoint, trb, completion_code::SUCCESS, 0);
        Some(length)
    }
}
