// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Interface between the device controller driver and a USB function.
//!
//! The driver owns endpoint 0 and the standard requests; a gadget supplies
//! the descriptors those requests return, sets up its own endpoints when the
//! host selects a configuration, and handles every transfer completion on
//! those endpoints. Exactly one gadget is installed, before the device is
//! enabled.

use kernel::hil::usb::{SetupPacket, UsbError};

use super::ring::TrbBorrow;
use super::trb::TransferEvent;

/// How a gadget answers a setup request it recognized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupReply<'a> {
    /// Send `data` in an IN data stage, truncated to `wLength`.
    Data(&'a [u8]),
    /// No data stage; acknowledge with a status stage.
    Status,
}

pub trait Gadget<'a> {
    fn device_descriptor(&self, index: u8) -> Result<&'a [u8], UsbError>;

    /// The configuration descriptor followed by every interface and endpoint
    /// descriptor of the configuration.
    fn configuration_descriptor(&self, index: u8) -> Result<&'a [u8], UsbError>;

    /// The BOS descriptor together with its device capabilities.
    fn bos_descriptor(&self) -> Result<&'a [u8], UsbError>;

    fn string_descriptor(&self, index: u8, language_id: u16) -> Result<&'a [u8], UsbError>;

    fn device_qualifier_descriptor(&self, index: u8) -> Result<&'a [u8], UsbError>;

    /// Offered every setup request before the driver's own handling. Return
    /// `Err(UsbError::UnknownSetupRequest)` to let the driver handle it.
    fn handle_setup_request(&self, _packet: &SetupPacket) -> Result<SetupReply<'a>, UsbError> {
        Err(UsbError::UnknownSetupRequest)
    }

    /// The host selected configuration `configuration` (never 0). Set up
    /// the gadget's endpoints.
    fn set_configuration(&self, configuration: u16) -> Result<(), UsbError>;

    /// Tear down the endpoints set up by `set_configuration`.
    fn deconfigure(&self) -> Result<(), UsbError>;

    /// The device has entered the configured state and endpoints are
    /// running.
    fn post_configure(&self);

    /// The host reset the bus. Any session the gadget was running is over;
    /// a new one starts with the next [`Gadget::post_configure`].
    fn bus_reset(&self);

    /// A TRB on one of the gadget's endpoints completed. Dropping `trb`
    /// returns it, and every TRB queued before it, to the ring.
    fn transfer_event(&self, event: &TransferEvent, trb: TrbBorrow<'_, 'a>);
}
