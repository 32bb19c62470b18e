// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! USB descriptors of the fastboot device.
//!
//! Every descriptor is serialized at compile time into a `static` byte array,
//! so the control endpoint can point the controller straight at it.
//!
//! The device has one configuration with one vendor-specific interface
//! (class 0xff, subclass 0x42, protocol 0x03, what the fastboot host tool
//! looks for) and a bulk endpoint pair. A BOS descriptor advertises a
//! Microsoft OS 2.0 descriptor set, which makes Windows bind WinUSB without
//! a driver package.

use kernel::hil::usb::{DescriptorType, EndpointAddress, EndpointDirection, TransferType};

pub const VENDOR_ID: u16 = 0x18d1;
pub const PRODUCT_ID: u16 = 0x4ee0;

pub const LANGUAGE_EN_US: u16 = 0x0409;

/// `bRequest` of the vendor request that fetches the MS OS 2.0 set.
pub const MS_VENDOR_CODE: u8 = 0x20;
/// `wIndex` of that request.
pub const MS_OS_20_DESCRIPTOR_INDEX: u16 = 0x07;
pub const NTDDI_WIN8_1: u32 = 0x0603_0000;

/// Identifies the MS OS 2.0 platform capability,
/// {D8DD60DF-4589-4CC7-9CD2-659D9E648A9F}.
const MS_OS_20_PLATFORM_UUID: [u8; 16] = [
    0xdf, 0x60, 0xdd, 0xd8, 0x89, 0x45, 0xc7, 0x4c, 0x9c, 0xd2, 0x65, 0x9d, 0x9e, 0x64, 0x8a, 0x9f,
];

const DEVICE_INTERFACE_GUID: &str = "{F72FE0D4-CBCB-407D-8814-9ED673D0DD6B}";

pub const BULK_MAX_PACKET_SIZE: u16 = 512;

// Little helpers for building descriptors in const context.

const fn put_u8<const N: usize>(mut buf: [u8; N], at: usize, value: u8) -> [u8; N] {
    buf[at] = value;
    buf
}

const fn put_u16<const N: usize>(buf: [u8; N], at: usize, value: u16) -> [u8; N] {
    let bytes = value.to_le_bytes();
    put_bytes(buf, at, &bytes)
}

const fn put_u32<const N: usize>(buf: [u8; N], at: usize, value: u32) -> [u8; N] {
    let bytes = value.to_le_bytes();
    put_bytes(buf, at, &bytes)
}

const fn put_bytes<const N: usize>(mut buf: [u8; N], at: usize, bytes: &[u8]) -> [u8; N] {
    let mut i = 0;
    while i < bytes.len() {
        buf[at + i] = bytes[i];
        i += 1;
    }
    buf
}

/// Decode the UTF-8 character starting at `bytes[i]`, returning it and its
/// encoded length. Only the Basic Multilingual Plane is supported.
const fn decode_utf8(bytes: &[u8], i: usize) -> (u16, usize) {
    let b0 = bytes[i] as u16;
    if b0 < 0x80 {
        (b0, 1)
    } else if b0 < 0xe0 {
        (((b0 & 0x1f) << 6) | (bytes[i + 1] as u16 & 0x3f), 2)
    } else {
        assert!(b0 < 0xf0, "string outside the basic multilingual plane");
        (
            ((b0 & 0x0f) << 12)
                | ((bytes[i + 1] as u16 & 0x3f) << 6)
                | (bytes[i + 2] as u16 & 0x3f),
            3,
        )
    }
}

/// Number of UTF-16 code units in `s`.
pub const fn utf16_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut units = 0;
    while i < bytes.len() {
        let (_, len) = decode_utf8(bytes, i);
        i += len;
        units += 1;
    }
    units
}

/// Write `s` as UTF-16LE at `at`.
const fn put_utf16<const N: usize>(mut buf: [u8; N], at: usize, s: &str) -> [u8; N] {
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut out = at;
    while i < bytes.len() {
        let (unit, len) = decode_utf8(bytes, i);
        buf = put_u16(buf, out, unit);
        i += len;
        out += 2;
    }
    buf
}

pub struct DeviceDescriptor {
    /// BCD, 0x0210 for USB 2.1 (needed for the host to ask for the BOS).
    pub usb_release: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size_ep0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_release: u16,
    pub manufacturer_string: u8,
    pub product_string: u8,
    pub serial_number_string: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;
    pub const QUALIFIER_SIZE: usize = 10;

    pub const fn to_bytes(&self) -> [u8; Self::SIZE] {
        let buf = [0; Self::SIZE];
        let buf = put_u8(buf, 0, Self::SIZE as u8);
        let buf = put_u8(buf, 1, DescriptorType::Device as u8);
        let buf = put_u16(buf, 2, self.usb_release);
        let buf = put_u8(buf, 4, self.class);
        let buf = put_u8(buf, 5, self.subclass);
        let buf = put_u8(buf, 6, self.protocol);
        let buf = put_u8(buf, 7, self.max_packet_size_ep0);
        let buf = put_u16(buf, 8, self.vendor_id);
        let buf = put_u16(buf, 10, self.product_id);
        let buf = put_u16(buf, 12, self.device_release);
        let buf = put_u8(buf, 14, self.manufacturer_string);
        let buf = put_u8(buf, 15, self.product_string);
        let buf = put_u8(buf, 16, self.serial_number_string);
        put_u8(buf, 17, self.num_configurations)
    }

    /// The device qualifier: what the device would look like at the other
    /// speed, which for this device is the same.
    pub const fn qualifier_bytes(&self) -> [u8; Self::QUALIFIER_SIZE] {
        let buf = [0; Self::QUALIFIER_SIZE];
        let buf = put_u8(buf, 0, Self::QUALIFIER_SIZE as u8);
        let buf = put_u8(buf, 1, DescriptorType::DeviceQualifier as u8);
        let buf = put_u16(buf, 2, self.usb_release);
        let buf = put_u8(buf, 4, self.class);
        let buf = put_u8(buf, 5, self.subclass);
        let buf = put_u8(buf, 6, self.protocol);
        let buf = put_u8(buf, 7, self.max_packet_size_ep0);
        // The last byte is reserved.
        put_u8(buf, 8, self.num_configurations)
    }
}

pub struct ConfigurationDescriptor {
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub string_index: u8,
    pub attributes: u8,
    /// In 2 mA units.
    pub max_power: u8,
}

impl ConfigurationDescriptor {
    pub const SIZE: usize = 9;
}

pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub string_index: u8,
}

impl InterfaceDescriptor {
    pub const SIZE: usize = 9;
}

pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const SIZE: usize = 7;
}

/// Size of the configuration descriptor together with its interface and both
/// endpoints.
pub const CONFIGURATION_TOTAL_SIZE: usize =
    ConfigurationDescriptor::SIZE + InterfaceDescriptor::SIZE + 2 * EndpointDescriptor::SIZE;

/// Serialize a configuration with one interface and two endpoints, in the
/// order the host expects them.
pub const fn configuration_bytes(
    configuration: &ConfigurationDescriptor,
    interface: &InterfaceDescriptor,
    endpoints: [&EndpointDescriptor; 2],
) -> [u8; CONFIGURATION_TOTAL_SIZE] {
    let buf = [0; CONFIGURATION_TOTAL_SIZE];
    let buf = put_u8(buf, 0, ConfigurationDescriptor::SIZE as u8);
    let buf = put_u8(buf, 1, DescriptorType::Configuration as u8);
    let buf = put_u16(buf, 2, CONFIGURATION_TOTAL_SIZE as u16);
    let buf = put_u8(buf, 4, configuration.num_interfaces);
    let buf = put_u8(buf, 5, configuration.configuration_value);
    let buf = put_u8(buf, 6, configuration.string_index);
    let buf = put_u8(buf, 7, configuration.attributes);
    let buf = put_u8(buf, 8, configuration.max_power);

    let at = ConfigurationDescriptor::SIZE;
    let buf = put_u8(buf, at, InterfaceDescriptor::SIZE as u8);
    let buf = put_u8(buf, at + 1, DescriptorType::Interface as u8);
    let buf = put_u8(buf, at + 2, interface.interface_number);
    let buf = put_u8(buf, at + 3, interface.alternate_setting);
    let buf = put_u8(buf, at + 4, interface.num_endpoints);
    let buf = put_u8(buf, at + 5, interface.interface_class);
    let buf = put_u8(buf, at + 6, interface.interface_subclass);
    let buf = put_u8(buf, at + 7, interface.interface_protocol);
    let mut buf = put_u8(buf, at + 8, interface.string_index);

    let mut at = at + InterfaceDescriptor::SIZE;
    let mut i = 0;
    while i < endpoints.len() {
        let endpoint = endpoints[i];
        buf = put_u8(buf, at, EndpointDescriptor::SIZE as u8);
        buf = put_u8(buf, at + 1, DescriptorType::Endpoint as u8);
        buf = put_u8(buf, at + 2, endpoint.address.to_usb());
        buf = put_u8(buf, at + 3, endpoint.transfer_type as u8);
        buf = put_u16(buf, at + 4, endpoint.max_packet_size & 0x7ff);
        buf = put_u8(buf, at + 6, endpoint.interval);
        at += EndpointDescriptor::SIZE;
        i += 1;
    }
    buf
}

/// Size of a string descriptor holding `s`.
pub const fn string_descriptor_size(s: &str) -> usize {
    2 + 2 * utf16_len(s)
}

pub const fn string_descriptor<const N: usize>(s: &str) -> [u8; N] {
    assert!(N == string_descriptor_size(s));
    let buf = [0; N];
    let buf = put_u8(buf, 0, N as u8);
    let buf = put_u8(buf, 1, DescriptorType::String as u8);
    put_utf16(buf, 2, s)
}

mod capability {
    pub const USB_2_0_EXTENSION: u8 = 0x02;
    pub const PLATFORM: u8 = 0x05;
}

/// USB 2.0 extension attributes: link power management supported.
const USB_2_0_EXTENSION_LPM: u32 = 1 << 1;

const BOS_HEADER_SIZE: usize = 5;
const USB_2_0_EXTENSION_SIZE: usize = 7;
const PLATFORM_CAPABILITY_SIZE: usize = 28;
pub const BOS_TOTAL_SIZE: usize =
    BOS_HEADER_SIZE + USB_2_0_EXTENSION_SIZE + PLATFORM_CAPABILITY_SIZE;

mod ms_os_20 {
    pub const SET_HEADER_DESCRIPTOR: u16 = 0;
    pub const FEATURE_COMPATIBLE_ID: u16 = 3;
    pub const FEATURE_REG_PROPERTY: u16 = 4;

    pub const REG_SZ: u16 = 1;

    pub const SET_HEADER_SIZE: usize = 10;
    pub const COMPATIBLE_ID_SIZE: usize = 20;
}

const PROPERTY_NAME: &str = "DeviceInterfaceGUID";
/// Both registry strings are NUL terminated.
const PROPERTY_NAME_SIZE: usize = 2 * (utf16_len(PROPERTY_NAME) + 1);
const PROPERTY_DATA_SIZE: usize = 2 * (utf16_len(DEVICE_INTERFACE_GUID) + 1);
const REGISTRY_PROPERTY_SIZE: usize = 10 + PROPERTY_NAME_SIZE + PROPERTY_DATA_SIZE;

pub const MS_OS_20_SET_SIZE: usize =
    ms_os_20::SET_HEADER_SIZE + ms_os_20::COMPATIBLE_ID_SIZE + REGISTRY_PROPERTY_SIZE;

const fn bos_bytes() -> [u8; BOS_TOTAL_SIZE] {
    let buf = [0; BOS_TOTAL_SIZE];
    let buf = put_u8(buf, 0, BOS_HEADER_SIZE as u8);
    let buf = put_u8(buf, 1, DescriptorType::Bos as u8);
    let buf = put_u16(buf, 2, BOS_TOTAL_SIZE as u16);
    let buf = put_u8(buf, 4, 2);

    let at = BOS_HEADER_SIZE;
    let buf = put_u8(buf, at, USB_2_0_EXTENSION_SIZE as u8);
    let buf = put_u8(buf, at + 1, DescriptorType::DeviceCapability as u8);
    let buf = put_u8(buf, at + 2, capability::USB_2_0_EXTENSION);
    let buf = put_u32(buf, at + 3, USB_2_0_EXTENSION_LPM);

    let at = at + USB_2_0_EXTENSION_SIZE;
    let buf = put_u8(buf, at, PLATFORM_CAPABILITY_SIZE as u8);
    let buf = put_u8(buf, at + 1, DescriptorType::DeviceCapability as u8);
    let buf = put_u8(buf, at + 2, capability::PLATFORM);
    // at + 3 is reserved
    let buf = put_bytes(buf, at + 4, &MS_OS_20_PLATFORM_UUID);
    let buf = put_u32(buf, at + 20, NTDDI_WIN8_1);
    let buf = put_u16(buf, at + 24, MS_OS_20_SET_SIZE as u16);
    let buf = put_u8(buf, at + 26, MS_VENDOR_CODE);
    // No alternate enumeration.
    put_u8(buf, at + 27, 0)
}

const fn ms_os_20_set_bytes() -> [u8; MS_OS_20_SET_SIZE] {
    let buf = [0; MS_OS_20_SET_SIZE];
    let buf = put_u16(buf, 0, ms_os_20::SET_HEADER_SIZE as u16);
    let buf = put_u16(buf, 2, ms_os_20::SET_HEADER_DESCRIPTOR);
    let buf = put_u32(buf, 4, NTDDI_WIN8_1);
    let buf = put_u16(buf, 8, MS_OS_20_SET_SIZE as u16);

    let at = ms_os_20::SET_HEADER_SIZE;
    let buf = put_u16(buf, at, ms_os_20::COMPATIBLE_ID_SIZE as u16);
    let buf = put_u16(buf, at + 2, ms_os_20::FEATURE_COMPATIBLE_ID);
    // Compatible id, then an all-zero sub-compatible id.
    let buf = put_bytes(buf, at + 4, b"WINUSB\0\0");

    let at = at + ms_os_20::COMPATIBLE_ID_SIZE;
    let buf = put_u16(buf, at, REGISTRY_PROPERTY_SIZE as u16);
    let buf = put_u16(buf, at + 2, ms_os_20::FEATURE_REG_PROPERTY);
    let buf = put_u16(buf, at + 4, ms_os_20::REG_SZ);
    let buf = put_u16(buf, at + 6, PROPERTY_NAME_SIZE as u16);
    let buf = put_utf16(buf, at + 8, PROPERTY_NAME);
    let at = at + 8 + PROPERTY_NAME_SIZE;
    let buf = put_u16(buf, at, PROPERTY_DATA_SIZE as u16);
    put_utf16(buf, at + 2, DEVICE_INTERFACE_GUID)
}

// The fastboot device.

pub const ENDPOINT_OUT: EndpointDescriptor = EndpointDescriptor {
    address: EndpointAddress::new(1, EndpointDirection::Out),
    transfer_type: TransferType::Bulk,
    max_packet_size: BULK_MAX_PACKET_SIZE,
    interval: 0,
};

pub const ENDPOINT_IN: EndpointDescriptor = EndpointDescriptor {
    address: EndpointAddress::new(1, EndpointDirection::In),
    transfer_type: TransferType::Bulk,
    max_packet_size: BULK_MAX_PACKET_SIZE,
    interval: 0,
};

const DEVICE: DeviceDescriptor = DeviceDescriptor {
    usb_release: 0x0210,
    class: 0,
    subclass: 0,
    protocol: 0,
    max_packet_size_ep0: 64,
    vendor_id: VENDOR_ID,
    product_id: PRODUCT_ID,
    device_release: 0x0100,
    manufacturer_string: 1,
    product_string: 2,
    serial_number_string: 0,
    num_configurations: 1,
};

const CONFIGURATION: ConfigurationDescriptor = ConfigurationDescriptor {
    num_interfaces: 1,
    configuration_value: 1,
    string_index: 0,
    // Bus powered.
    attributes: 0x80,
    max_power: 0,
};

const INTERFACE: InterfaceDescriptor = InterfaceDescriptor {
    interface_number: 0,
    alternate_setting: 0,
    num_endpoints: 2,
    interface_class: 0xff,
    interface_subclass: 0x42,
    interface_protocol: 0x03,
    string_index: 3,
};

pub static DEVICE_DESCRIPTOR: [u8; DeviceDescriptor::SIZE] = DEVICE.to_bytes();
pub static DEVICE_QUALIFIER_DESCRIPTOR: [u8; DeviceDescriptor::QUALIFIER_SIZE] =
    DEVICE.qualifier_bytes();
pub static CONFIGURATION_DESCRIPTOR: [u8; CONFIGURATION_TOTAL_SIZE] =
    configuration_bytes(&CONFIGURATION, &INTERFACE, [&ENDPOINT_IN, &ENDPOINT_OUT]);
pub static BOS_DESCRIPTOR: [u8; BOS_TOTAL_SIZE] = bos_bytes();
pub static MS_OS_20_DESCRIPTOR_SET: [u8; MS_OS_20_SET_SIZE] = ms_os_20_set_bytes();

const MANUFACTURER: &str = "Atmosphère-NX";
const PRODUCT: &str = "Fusée Fastboot";
const INTERFACE_NAME: &str = "fastboot";

static LANGUAGES: [u8; 4] = [
    4,
    DescriptorType::String as u8,
    LANGUAGE_EN_US.to_le_bytes()[0],
    LANGUAGE_EN_US.to_le_bytes()[1],
];
static MANUFACTURER_STRING: [u8; string_descriptor_size(MANUFACTURER)] =
    string_descriptor(MANUFACTURER);
static PRODUCT_STRING: [u8; string_descriptor_size(PRODUCT)] = string_descriptor(PRODUCT);
static INTERFACE_STRING: [u8; string_descriptor_size(INTERFACE_NAME)] =
    string_descriptor(INTERFACE_NAME);

/// String descriptors by index; index 0 lists the supported languages.
pub static STRINGS: [&[u8]; 4] = [
    &LANGUAGES,
    &MANUFACTURER_STRING,
    &PRODUCT_STRING,
    &INTERFACE_STRING,
];
