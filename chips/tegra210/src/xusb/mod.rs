// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Driver for the XUSB device-mode controller.
//!
//! The controller is an xHCI-style device: software hands it transfer rings
//! of TRBs through per-endpoint contexts and learns about everything that
//! happens on the bus from a single event ring. Nothing here is interrupt
//! driven; the board calls [`Xusb::process`] from its main loop.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! let xusb = Xusb::new(&xusb_dev, &CONTEXTS);
//! xusb.initialize(&EVENT_TRBS, &EP0_TRBS)?;
//! xusb.enable_device(gadget);
//! loop {
//!     xusb.process();
//! }
//! ```
//!
//! Layering, from the bottom up:
//!
//! - [`trb`]: the 16-byte TRB and the cycle-bit handshake.
//! - [`ring`]: transfer rings and [`TrbBorrow`] ownership tokens.
//! - [`endpoint`]: endpoint contexts and per-endpoint operations.
//! - [`event_ring`]: the controller-written event ring.
//! - `control`: the endpoint 0 state machine and port status handling.
//! - [`gadget`]: the trait a USB function implements on top of the driver.
//! - [`dev`]: the T210 register bank behind [`XusbController`].

use core::cell::Cell;

use kernel::hil::usb::{DeviceState, UsbError};
use kernel::utilities::cells::OptionalCell;
use kernel::{debug, debug_error, ErrorCode};

pub mod dev;
pub mod endpoint;
pub mod event_ring;
pub mod gadget;
pub mod ring;
pub mod testing;
pub mod trb;

mod control;

pub use self::control::ControlState;
pub use self::dev::PortStatus;
pub use self::endpoint::{Endpoint, EndpointContext};
pub use self::event_ring::EventRing;
pub use self::gadget::{Gadget, SetupReply};
pub use self::ring::{TransferRing, TrbBorrow};
pub use self::trb::{Event, TransferEvent, Trb};

/// Number of endpoint contexts the controller reads.
pub const NUM_ENDPOINTS: usize = 32;
/// TRBs in the endpoint 0 transfer ring.
pub const EP0_RING_SIZE: usize = 16;
/// TRBs in the event ring.
pub const EVENT_RING_SIZE: usize = 32;

/// Change bits in the port status register, acknowledged one at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortChange {
    ConnectStatus,
    PortReset,
    WarmReset,
    LinkState,
    ConfigError,
}

/// Register-level operations the driver performs on the controller.
///
/// [`dev::XusbDev`] implements this on top of the memory-mapped registers;
/// [`testing::MockController`] implements it in memory for host tests.
pub trait XusbController {
    /// Program the single event ring segment and reset the controller's
    /// enqueue and dequeue pointers to its start.
    fn install_event_ring(&self, base: u64, len: usize);
    /// Tell the controller how far software has consumed the event ring.
    fn set_event_dequeue(&self, address: u64);
    fn install_endpoint_contexts(&self, address: u64);
    /// Enable link state and event generation.
    fn enable_events(&self);
    /// Take the port out of reset and start looking for a host.
    fn enable_device(&self);

    fn ring_doorbell(&self, endpoint: usize, stream_id: u16);
    fn is_halted(&self, endpoint: usize) -> bool;
    /// Set or clear an endpoint halt. Fails with `BUSY` when the controller
    /// does not acknowledge the change.
    fn set_halt(&self, endpoint: usize, halt: bool) -> Result<(), ErrorCode>;
    fn is_paused(&self, endpoint: usize) -> bool;
    fn set_pause(&self, endpoint: usize, pause: bool) -> Result<(), ErrorCode>;
    /// Make the controller re-read an endpoint context.
    fn reload(&self, endpoint: usize) -> Result<(), ErrorCode>;
    fn is_stopped(&self, endpoint: usize) -> bool;
    fn clear_stopped(&self, endpoint: usize);

    fn set_device_address(&self, address: u8);
    fn set_run(&self, run: bool);
    /// Clear the run-change status bit.
    fn clear_run_change(&self);

    fn port_status(&self) -> PortStatus;
    fn acknowledge_port_change(&self, change: PortChange);
    /// Whether the port halted its link state machine to request a state
    /// change.
    fn port_halt_change_requested(&self) -> bool;
    fn release_link_state_machine(&self);

    fn delay_us(&self, us: u32);
}

/// The device controller driver: endpoints, event ring, and the control
/// endpoint state machine, serving one [`Gadget`].
pub struct Xusb<'a> {
    controller: &'a dyn XusbController,
    contexts: &'a [EndpointContext; NUM_ENDPOINTS],
    endpoints: [Endpoint<'a>; NUM_ENDPOINTS],
    event_ring: EventRing<'a>,
    gadget: OptionalCell<&'a dyn Gadget<'a>>,

    device_state: Cell<DeviceState>,
    control_state: Cell<ControlState>,
    /// Slot index of the endpoint 0 TRB whose completion is awaited.
    control_trb: OptionalCell<usize>,
    /// Sequence number of the setup packet being served, used as the stream
    /// id when ringing endpoint 0.
    setup_sequence: Cell<u16>,
}

impl<'a> Xusb<'a> {
    pub fn new(
        controller: &'a dyn XusbController,
        contexts: &'a [EndpointContext; NUM_ENDPOINTS],
    ) -> Xusb<'a> {
        Xusb {
            controller,
            contexts,
            endpoints: core::array::from_fn(|i| Endpoint::new(i, controller, &contexts[i])),
            event_ring: EventRing::new(controller),
            gadget: OptionalCell::empty(),
            device_state: Cell::new(DeviceState::Powered),
            control_state: Cell::new(ControlState::Idle),
            control_trb: OptionalCell::empty(),
            setup_sequence: Cell::new(0),
        }
    }

    /// Set up the event ring and endpoint 0 and enable events. Clocks,
    /// resets and pads must already be configured.
    pub fn initialize(&self, event_trbs: &'a [Trb], ep0_trbs: &'a [Trb]) -> Result<(), UsbError> {
        self.event_ring.install(event_trbs);
        self.endpoints[0].initialize_control(ep0_trbs);
        self.controller
            .install_endpoint_contexts(self.contexts[0].address());
        self.endpoints[0].reload()?;
        self.controller.enable_events();
        Ok(())
    }

    /// Install `gadget` and connect to the host.
    pub fn enable_device(&self, gadget: &'a dyn Gadget<'a>) {
        self.gadget.set(gadget);
        self.controller.enable_device();
    }

    fn gadget(&self) -> Result<&'a dyn Gadget<'a>, UsbError> {
        self.gadget
            .map(|gadget| *gadget)
            .ok_or(UsbError::InvalidDeviceState)
    }

    pub fn endpoint(&self, index: usize) -> Option<&Endpoint<'a>> {
        self.endpoints.get(index)
    }

    pub fn device_state(&self) -> DeviceState {
        self.device_state.get()
    }

    pub fn control_state(&self) -> ControlState {
        self.control_state.get()
    }

    /// Zero every context other than endpoint 0's.
    pub fn clear_non_control_endpoints(&self) {
        for context in self.contexts[2..].iter() {
            context.clear();
        }
    }

    /// Drain the event ring, dispatching every event.
    pub fn process(&self) {
        while let Some(event) = self.event_ring.pop() {
            self.dispatch(event);
        }
    }

    fn dispatch(&self, event: Event) {
        match event {
            Event::Setup {
                packet,
                sequence_number,
            } => self.process_setup_event(&packet, sequence_number),
            Event::PortStatusChange => self.process_port_status_change(),
            Event::Transfer(transfer) => self.process_transfer_event(&transfer),
            Event::Other(trb_type) => {
                debug!("ignoring event of type {}", trb_type);
            }
        }
    }

    fn process_transfer_event(&self, event: &TransferEvent) {
        match event.endpoint {
            0 => self.process_ep0_transfer_event(event),
            index if index >= 2 && index < NUM_ENDPOINTS => {
                let endpoint = &self.endpoints[event.endpoint];
                let result = endpoint
                    .accept_completed(event.trb_address)
                    .and_then(|trb| {
                        let gadget = self.gadget()?;
                        gadget.transfer_event(event, trb);
                        Ok(())
                    });
                if let Err(err) = result {
                    debug_error!(
                        "transfer event on endpoint {} for unknown TRB {:#x}: {:#x}",
                        event.endpoint,
                        event.trb_address,
                        usize::from(err)
                    );
                    endpoint.dump_ring();
                }
            }
            _ => {
                debug_error!(
                    "transfer event for unexpected endpoint {}: {:#x}",
                    event.endpoint,
                    usize::from(UsbError::UnexpectedEndpoint)
                );
            }
        }
    }
}
