// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Interface to USB device-mode controllers.
//!
//! This module holds the controller-independent pieces of USB 2.0 device
//! support: the setup packet received on endpoint 0, the standard request
//! codes and descriptor types, endpoint addressing, the device state, and the
//! error taxonomy shared by controller drivers and the gadgets built on them.

use core::fmt;

/// Standard request codes (`bRequest`) from chapter 9 of the USB 2.0
/// specification.
pub mod request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_DESCRIPTOR: u8 = 7;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
    pub const SYNCH_FRAME: u8 = 12;
}

/// Errors reported by the USB device stack.
///
/// Control-endpoint failures are answered by stalling endpoint 0. Failures in
/// a gadget's own transfers are latched by the gadget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum UsbError {
    /// A setup packet had fields that are not valid for its request.
    MalformedSetupRequest = 0x101,
    /// Neither the gadget nor the core recognized the request.
    UnknownSetupRequest = 0x102,
    /// A GET_DESCRIPTOR request named a descriptor type that is not served.
    UnknownDescriptorType = 0x103,
    /// A GET_DESCRIPTOR request named an index that does not exist.
    InvalidDescriptorIndex = 0x104,
    /// SET_ADDRESS with an address above 127.
    InvalidAddress = 0x105,
    /// SET_CONFIGURATION with a configuration value the gadget does not have.
    InvalidConfiguration = 0x106,
    /// A setup event carried a reserved sequence number.
    InvalidSetupPacketSequenceNumber = 0x107,
    /// A transfer event completed a descriptor other than the one awaited.
    UnexpectedTrb = 0x201,
    /// A transfer event arrived for the wrong endpoint.
    UnexpectedEndpoint = 0x202,
    /// A transfer event reported a completion code other than success or
    /// short packet.
    UnexpectedCompletionCode = 0x203,
    /// No free descriptor slot is left in a transfer ring.
    RingFull = 0x301,
    /// A download was larger than the download buffer.
    DownloadTooLarge = 0x302,
    /// The request is not allowed in the current device state.
    InvalidDeviceState = 0x401,
    /// A setup packet arrived while a control transfer was still running.
    ControlEndpointBusy = 0x402,
    /// An endpoint 0 transfer completed while no control transfer was active.
    InvalidControlEndpointState = 0x403,
    /// The controller did not acknowledge an endpoint halt, pause or reload
    /// in time.
    EndpointStateTimeout = 0x404,
}

impl From<UsbError> for usize {
    fn from(err: UsbError) -> usize {
        err as usize
    }
}

/// USB device state, as seen from the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Powered,
    Default,
    Address,
    Configured,
}

/// The eight-byte packet sent in the setup stage of a control transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: DeviceRequestType,
    pub request_code: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Create a `SetupPacket` from the bytes received from the wire.
    pub fn from_bytes(p: [u8; 8]) -> Self {
        SetupPacket {
            request_type: DeviceRequestType(p[0]),
            request_code: p[1],
            value: u16::from_le_bytes([p[2], p[3]]),
            index: u16::from_le_bytes([p[4], p[5]]),
            length: u16::from_le_bytes([p[6], p[7]]),
        }
    }

    /// The bytes of this packet as they appear on the wire.
    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type.0,
            self.request_code,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Descriptor type in the high byte of `wValue` of a GET_DESCRIPTOR.
    pub fn descriptor_type(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Descriptor index in the low byte of `wValue` of a GET_DESCRIPTOR.
    pub fn descriptor_index(&self) -> u8 {
        (self.value & 0xff) as u8
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DeviceRequestType(u8);

impl DeviceRequestType {
    pub const fn new(
        direction: TransferDirection,
        request_type: RequestType,
        recipient: Recipient,
    ) -> Self {
        DeviceRequestType(((direction as u8) << 7) | ((request_type as u8) << 5) | recipient as u8)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn transfer_direction(self) -> TransferDirection {
        match self.0 & (1 << 7) {
            0 => TransferDirection::HostToDevice,
            _ => TransferDirection::DeviceToHost,
        }
    }

    pub fn request_type(self) -> RequestType {
        match (self.0 & (0b11 << 5)) >> 5 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(self) -> Recipient {
        match self.0 & 0b11111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Whether this request type is exactly the given combination.
    pub fn is(
        self,
        direction: TransferDirection,
        request_type: RequestType,
        recipient: Recipient,
    ) -> bool {
        self == DeviceRequestType::new(direction, request_type, recipient)
    }
}

impl fmt::Debug for DeviceRequestType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{{:?}, {:?}, {:?}}}",
            self.transfer_direction(),
            self.request_type(),
            self.recipient()
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice = 0,
    DeviceToHost = 1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
    Reserved = 31,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    Bos = 15,
    DeviceCapability = 16,
}

impl DescriptorType {
    pub fn from_u8(byte: u8) -> Option<DescriptorType> {
        match byte {
            1 => Some(DescriptorType::Device),
            2 => Some(DescriptorType::Configuration),
            3 => Some(DescriptorType::String),
            4 => Some(DescriptorType::Interface),
            5 => Some(DescriptorType::Endpoint),
            6 => Some(DescriptorType::DeviceQualifier),
            7 => Some(DescriptorType::OtherSpeedConfiguration),
            8 => Some(DescriptorType::InterfacePower),
            15 => Some(DescriptorType::Bos),
            16 => Some(DescriptorType::DeviceCapability),
            _ => None,
        }
    }
}

/// Feature selectors for CLEAR_FEATURE and SET_FEATURE.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FeatureSelector {
    EndpointHalt = 0,
    DeviceRemoteWakeup = 1,
    TestMode = 2,
}

impl FeatureSelector {
    pub fn from_u16(value: u16) -> Option<FeatureSelector> {
        match value {
            0 => Some(FeatureSelector::EndpointHalt),
            1 => Some(FeatureSelector::DeviceRemoteWakeup),
            2 => Some(FeatureSelector::TestMode),
            _ => None,
        }
    }
}

/// Transfer types from the `bmAttributes` field of an endpoint descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    pub fn from_attributes(attributes: u8) -> TransferType {
        match attributes & 0b11 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndpointDirection {
    Out = 0,
    In = 1,
}

/// A USB endpoint number together with its direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EndpointAddress {
    pub number: u8,
    pub direction: EndpointDirection,
}

impl EndpointAddress {
    pub const fn new(number: u8, direction: EndpointDirection) -> Self {
        EndpointAddress { number, direction }
    }

    /// Decode a `bEndpointAddress` byte (bit 7 set for IN).
    pub const fn from_usb(address: u8) -> Self {
        EndpointAddress {
            number: address & 0xf,
            direction: if address & 0x80 != 0 {
                EndpointDirection::In
            } else {
                EndpointDirection::Out
            },
        }
    }

    /// Encode as a `bEndpointAddress` byte.
    pub const fn to_usb(self) -> u8 {
        match self.direction {
            EndpointDirection::In => self.number | 0x80,
            EndpointDirection::Out => self.number,
        }
    }

    /// Device context index used by xHCI-style controllers: endpoint 0 is
    /// index 0 in both directions, every other endpoint sits at
    /// `number * 2 + (1 if IN)`.
    pub const fn context_index(self) -> usize {
        if self.number == 0 {
            0
        } else {
            self.number as usize * 2
                + match self.direction {
                    EndpointDirection::In => 1,
                    EndpointDirection::Out => 0,
                }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_fields() {
        // GET_DESCRIPTOR(Device), 18 bytes.
        let packet = SetupPacket::from_bytes([0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert_eq!(
            packet.request_type.transfer_direction(),
            TransferDirection::DeviceToHost
        );
        assert_eq!(packet.request_type.request_type(), RequestType::Standard);
        assert_eq!(packet.request_type.recipient(), Recipient::Device);
        assert_eq!(packet.request_code, request::GET_DESCRIPTOR);
        assert_eq!(packet.descriptor_type(), DescriptorType::Device as u8);
        assert_eq!(packet.descriptor_index(), 0);
        assert_eq!(packet.length, 18);
        assert_eq!(
            packet.to_bytes(),
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        );
    }

    #[test]
    fn request_type_composition() {
        let vendor = DeviceRequestType::new(
            TransferDirection::DeviceToHost,
            RequestType::Vendor,
            Recipient::Device,
        );
        assert_eq!(vendor.raw(), 0xc0);
        let clear_halt = DeviceRequestType::new(
            TransferDirection::HostToDevice,
            RequestType::Standard,
            Recipient::Endpoint,
        );
        assert_eq!(clear_halt.raw(), 0x02);
        assert!(clear_halt.is(
            TransferDirection::HostToDevice,
            RequestType::Standard,
            Recipient::Endpoint
        ));
    }

    #[test]
    fn endpoint_context_index() {
        assert_eq!(EndpointAddress::from_usb(0x00).context_index(), 0);
        assert_eq!(EndpointAddress::from_usb(0x80).context_index(), 0);
        assert_eq!(EndpointAddress::from_usb(0x01).context_index(), 2);
        assert_eq!(EndpointAddress::from_usb(0x81).context_index(), 3);
        assert_eq!(EndpointAddress::from_usb(0x8f).context_index(), 31);
        assert_eq!(
            EndpointAddress::new(1, EndpointDirection::In).to_usb(),
            0x81
        );
    }
}
