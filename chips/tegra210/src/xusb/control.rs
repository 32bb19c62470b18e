// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Endpoint 0: setup requests, control transfer stages, and the device state
//! changes they and the port status events cause.
//!
//! Every control transfer is a setup event followed by an optional data stage
//! and a status stage, each a single TRB on the endpoint 0 ring. Only one
//! stage is ever outstanding; its slot index is kept in `control_trb` and the
//! completion of any other TRB is a protocol error. Errors stall endpoint 0,
//! which the host recovers from with the next setup packet or a bus reset.

use kernel::config::CONFIG;
use kernel::hil::usb::{
    request, DescriptorType, DeviceState, EndpointAddress, FeatureSelector, Recipient,
    RequestType, SetupPacket, TransferDirection, UsbError,
};
use kernel::{debug, debug_error, debug_info, debug_warn};

use super::dev::PORTSC;
use super::endpoint::Endpoint;
use super::gadget::SetupReply;
use super::trb::{completion_code, TransferEvent};
use super::{PortChange, Xusb};

/// Delay between queueing a control stage and ringing the doorbell for it.
const CONTROL_DOORBELL_DELAY_US: u32 = 1000;

/// Sequence numbers the controller never assigns to a valid setup packet.
const INVALID_SEQUENCE_NUMBERS: [u16; 2] = [0xfffe, 0xffff];

const MAX_DEVICE_ADDRESS: u16 = 127;

/// Stage of the control transfer in progress on endpoint 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    DataInStage,
    DataOutStage,
    StatusStage,
}

fn truncate(data: &[u8], length: u16) -> &[u8] {
    &data[..data.len().min(length as usize)]
}

fn require_language_zero(packet: &SetupPacket) -> Result<(), UsbError> {
    if packet.index != 0 {
        return Err(UsbError::MalformedSetupRequest);
    }
    Ok(())
}

impl<'a> Xusb<'a> {
    fn ep0(&self) -> &Endpoint<'a> {
        &self.endpoints[0]
    }

    /// Forget any control transfer in progress.
    fn abort_control_transfer(&self) {
        self.control_state.set(ControlState::Idle);
        self.control_trb.clear();
    }

    /// Stall endpoint 0 after a failed request or transfer. The host
    /// recovers with its next setup packet or a bus reset.
    fn stall(&self) {
        // A halt the controller does not acknowledge has been logged already
        // and leaves nothing else to undo.
        let _ = self.ep0().halt();
    }

    fn reset_control_endpoint(&self) -> Result<(), UsbError> {
        self.abort_control_transfer();
        let ep0 = self.ep0();
        ep0.pause()?;
        ep0.reset_and_reload_ring()?;
        ep0.clear_pause()
    }

    pub(super) fn set_device_state(&self, state: DeviceState) {
        let was_configured = self.device_state.get() == DeviceState::Configured;
        let configured = state == DeviceState::Configured;
        self.device_state.set(state);

        if was_configured != configured {
            self.controller.set_run(configured);
            if configured {
                self.controller.clear_run_change();
                if let Ok(gadget) = self.gadget() {
                    gadget.post_configure();
                }
            }
        }

        if state == DeviceState::Default {
            debug!("usb device reset");
            if let Err(err) = self.reset_control_endpoint() {
                debug_error!("failed to reset endpoint 0: {:#x}", usize::from(err));
            }
            if let Ok(gadget) = self.gadget() {
                gadget.bus_reset();
            }
        }
    }

    /// Queue an IN data stage carrying `data`.
    pub fn send_control_data(&self, data: &'a [u8]) -> Result<(), UsbError> {
        let ep0 = self.ep0();
        let trb = ep0.enqueue(false)?;
        trb.init_data_stage(true, data.as_ptr() as usize, data.len());
        trb.set_interrupt_on_completion();
        let index = trb.index();
        trb.release();

        self.controller.delay_us(CONTROL_DOORBELL_DELAY_US);
        ep0.ring_doorbell(self.setup_sequence.get());

        self.control_state.set(ControlState::DataInStage);
        self.control_trb.set(index);
        Ok(())
    }

    /// Queue the status stage, IN when `direction_in` is set.
    pub fn send_control_status(&self, direction_in: bool) -> Result<(), UsbError> {
        let ep0 = self.ep0();
        let trb = ep0.enqueue(false)?;
        trb.init_status_stage(direction_in);
        trb.set_interrupt_on_completion();
        let index = trb.index();
        trb.release();

        self.controller.delay_us(CONTROL_DOORBELL_DELAY_US);
        ep0.ring_doorbell(self.setup_sequence.get());

        self.control_state.set(ControlState::StatusStage);
        self.control_trb.set(index);
        Ok(())
    }

    pub(super) fn process_setup_event(&self, packet: &SetupPacket, sequence_number: u16) {
        if CONFIG.trace_setup_packets {
            debug_info!(
                "setup #{}: {:?} request {} value {:#06x} index {:#06x} length {}",
                sequence_number,
                packet.request_type,
                packet.request_code,
                packet.value,
                packet.index,
                packet.length
            );
        }

        if let Err(err) = self.setup_request(packet, sequence_number) {
            let raw = packet.to_bytes();
            debug_warn!(
                "failed to handle setup request {:02x} {:02x} {:02x} {:02x} {:02x} {:02x} {:02x} {:02x}: {:#x}",
                raw[0],
                raw[1],
                raw[2],
                raw[3],
                raw[4],
                raw[5],
                raw[6],
                raw[7],
                usize::from(err)
            );
            self.stall();
        }
    }

    fn setup_request(&self, packet: &SetupPacket, sequence_number: u16) -> Result<(), UsbError> {
        if INVALID_SEQUENCE_NUMBERS.contains(&sequence_number) {
            return Err(UsbError::InvalidSetupPacketSequenceNumber);
        }
        if self.device_state.get() == DeviceState::Powered {
            return Err(UsbError::InvalidDeviceState);
        }
        if self.control_state.get() != ControlState::Idle {
            self.abort_control_transfer();
            return Err(UsbError::ControlEndpointBusy);
        }

        self.setup_sequence.set(sequence_number);
        self.ep0().clear_halt()?;

        match self.gadget()?.handle_setup_request(packet) {
            Ok(SetupReply::Data(data)) => {
                return self.send_control_data(truncate(data, packet.length));
            }
            Ok(SetupReply::Status) => return self.send_control_status(true),
            Err(UsbError::UnknownSetupRequest) => {}
            Err(err) => return Err(err),
        }

        match packet.request_code {
            request::CLEAR_FEATURE => self.clear_feature(packet),
            request::SET_ADDRESS => self.set_address(packet),
            request::GET_DESCRIPTOR => self.get_descriptor(packet),
            request::SET_CONFIGURATION => self.set_configuration(packet),
            _ => Err(UsbError::UnknownSetupRequest),
        }
    }

    fn clear_feature(&self, packet: &SetupPacket) -> Result<(), UsbError> {
        if !packet.request_type.is(
            TransferDirection::HostToDevice,
            RequestType::Standard,
            Recipient::Endpoint,
        ) || FeatureSelector::from_u16(packet.value) != Some(FeatureSelector::EndpointHalt)
        {
            return Err(UsbError::UnknownSetupRequest);
        }
        if packet.length != 0 || packet.index > 0xff {
            return Err(UsbError::MalformedSetupRequest);
        }

        let address = EndpointAddress::from_usb(packet.index as u8);
        debug!("clear halt on endpoint {:#04x}", address.to_usb());
        let endpoint = self
            .endpoints
            .get(address.context_index())
            .ok_or(UsbError::MalformedSetupRequest)?;
        endpoint.clear_halt()?;
        self.send_control_status(true)
    }

    fn set_address(&self, packet: &SetupPacket) -> Result<(), UsbError> {
        if !packet.request_type.is(
            TransferDirection::HostToDevice,
            RequestType::Standard,
            Recipient::Device,
        ) || packet.index != 0
            || packet.length != 0
        {
            return Err(UsbError::MalformedSetupRequest);
        }
        if self.device_state.get() == DeviceState::Configured {
            return Err(UsbError::InvalidDeviceState);
        }
        if packet.value > MAX_DEVICE_ADDRESS {
            return Err(UsbError::InvalidAddress);
        }

        let address = packet.value as u8;
        debug!("set address {}", address);
        self.controller.set_device_address(address);
        self.contexts[0].set_device_address(address);
        self.set_device_state(DeviceState::Address);
        self.send_control_status(true)
    }

    fn get_descriptor(&self, packet: &SetupPacket) -> Result<(), UsbError> {
        if !packet.request_type.is(
            TransferDirection::DeviceToHost,
            RequestType::Standard,
            Recipient::Device,
        ) {
            return Err(UsbError::MalformedSetupRequest);
        }

        let gadget = self.gadget()?;
        let index = packet.descriptor_index();
        let descriptor = match DescriptorType::from_u8(packet.descriptor_type()) {
            Some(DescriptorType::Device) => {
                require_language_zero(packet)?;
                gadget.device_descriptor(index)?
            }
            Some(DescriptorType::Configuration) => {
                require_language_zero(packet)?;
                gadget.configuration_descriptor(index)?
            }
            Some(DescriptorType::DeviceQualifier) => {
                require_language_zero(packet)?;
                gadget.device_qualifier_descriptor(index)?
            }
            Some(DescriptorType::Bos) => {
                if index != 0 {
                    return Err(UsbError::InvalidDescriptorIndex);
                }
                require_language_zero(packet)?;
                gadget.bos_descriptor()?
            }
            Some(DescriptorType::String) => gadget.string_descriptor(index, packet.index)?,
            _ => return Err(UsbError::UnknownDescriptorType),
        };

        debug!(
            "get descriptor type {} index {}: {} of {} bytes",
            packet.descriptor_type(),
            index,
            descriptor.len().min(packet.length as usize),
            descriptor.len()
        );
        self.send_control_data(truncate(descriptor, packet.length))
    }

    fn set_configuration(&self, packet: &SetupPacket) -> Result<(), UsbError> {
        if !packet.request_type.is(
            TransferDirection::HostToDevice,
            RequestType::Standard,
            Recipient::Device,
        ) || packet.index != 0
            || packet.length != 0
        {
            return Err(UsbError::MalformedSetupRequest);
        }
        let state = self.device_state.get();
        if state != DeviceState::Address && state != DeviceState::Configured {
            return Err(UsbError::InvalidDeviceState);
        }

        debug!("set configuration {}", packet.value);
        let gadget = self.gadget()?;
        if state == DeviceState::Configured {
            gadget.deconfigure()?;
            self.set_device_state(DeviceState::Address);
        }
        if packet.value != 0 {
            gadget.set_configuration(packet.value)?;
            self.set_device_state(DeviceState::Configured);
        }
        self.send_control_status(true)
    }

    pub(super) fn process_ep0_transfer_event(&self, event: &TransferEvent) {
        if let Err(err) = self.complete_control_stage(event) {
            debug!(
                "failed to process control transfer event (code {}, trb {:#x}): {:#x}",
                event.completion_code,
                event.trb_address,
                usize::from(err)
            );
            self.stall();
        }
    }

    fn complete_control_stage(&self, event: &TransferEvent) -> Result<(), UsbError> {
        let trb = self.ep0().accept_completed(event.trb_address)?;
        // Only the outstanding stage gives its slot back to the ring.
        let trb = if self.control_trb.map_or(false, |index| *index == trb.index()) {
            Some(trb)
        } else {
            trb.forget();
            None
        };

        match event.completion_code {
            completion_code::SUCCESS | completion_code::SHORT_PACKET => {}
            completion_code::SEQUENCE_NUMBER_ERROR => {
                // A newer setup packet superseded this transfer.
                self.abort_control_transfer();
                return Ok(());
            }
            _ => {
                self.abort_control_transfer();
                return Err(UsbError::UnexpectedCompletionCode);
            }
        }

        let trb = trb.ok_or(UsbError::UnexpectedTrb)?;
        self.control_trb.clear();
        trb.release();

        match self.control_state.get() {
            ControlState::Idle => Err(UsbError::InvalidControlEndpointState),
            ControlState::DataInStage => self.send_control_status(false),
            ControlState::DataOutStage => self.send_control_status(true),
            ControlState::StatusStage => {
                self.control_state.set(ControlState::Idle);
                Ok(())
            }
        }
    }

    pub(super) fn process_port_status_change(&self) {
        let status = self.controller.port_status();
        debug!("port status changed: {:#010x}", status.get());

        if status.is_set(PORTSC::CSC) {
            debug!("port connect status changed, speed {}", status.read(PORTSC::PS));
            self.controller
                .acknowledge_port_change(PortChange::ConnectStatus);
        }

        if status.is_set(PORTSC::PRC) {
            if !status.is_set(PORTSC::PR) {
                self.set_device_state(DeviceState::Default);
            }
            self.controller.acknowledge_port_change(PortChange::PortReset);
        }

        if status.is_set(PORTSC::WRC) {
            self.controller.release_link_state_machine();
            debug!("warm port reset changed, WPR {}", status.read(PORTSC::WPR));
            self.controller.acknowledge_port_change(PortChange::WarmReset);
        }

        if self.controller.port_halt_change_requested() {
            self.controller.release_link_state_machine();
        }

        if status.is_set(PORTSC::PLC) {
            if status.matches_all(PORTSC::PLS::U3) {
                self.set_device_state(DeviceState::Default);
            }
            self.controller.acknowledge_port_change(PortChange::LinkState);
        }

        if status.is_set(PORTSC::CEC) {
            self.controller.acknowledge_port_change(PortChange::ConfigError);
        }
    }
}
