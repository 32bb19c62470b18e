// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! T_XUSB_DEV_XHCI register bank and the XUSB pad controller bits the
//! device controller needs.

use kernel::hil::time::Time;
use kernel::utilities::registers::interfaces::{ReadWriteable, Readable, Writeable};
use kernel::utilities::registers::{
    register_bitfields, register_structs, LocalRegisterCopy, ReadWrite,
};
use kernel::utilities::StaticRef;
use kernel::{debug_error, ErrorCode};

use super::{PortChange, XusbController};

/// Upper bound on how long the controller may take to acknowledge an
/// endpoint halt, pause or reload.
pub const XUSB_STATE_CHANGE_TIMEOUT_US: u32 = 100_000;

register_structs! {
    pub XusbDevRegisters {
        (0x000 => _reserved0),
        (0x004 => db: ReadWrite<u32, DB::Register>),
        (0x008 => erstsz: ReadWrite<u32, ERSTSZ::Register>),
        (0x00c => _reserved1),
        (0x010 => erst0balo: ReadWrite<u32>),
        (0x014 => erst0bahi: ReadWrite<u32>),
        (0x018 => erst1balo: ReadWrite<u32>),
        (0x01c => erst1bahi: ReadWrite<u32>),
        (0x020 => erdplo: ReadWrite<u32, ERDPLO::Register>),
        (0x024 => erdphi: ReadWrite<u32>),
        (0x028 => ereplo: ReadWrite<u32, EREPLO::Register>),
        (0x02c => erephi: ReadWrite<u32>),
        (0x030 => ctrl: ReadWrite<u32, CTRL::Register>),
        (0x034 => st: ReadWrite<u32, ST::Register>),
        (0x038 => rt_imod: ReadWrite<u32>),
        (0x03c => portsc: ReadWrite<u32, PORTSC::Register>),
        (0x040 => ecplo: ReadWrite<u32>),
        (0x044 => ecphi: ReadWrite<u32>),
        (0x048 => mfindex: ReadWrite<u32>),
        (0x04c => _reserved2),
        /// One bit per endpoint context in each of the endpoint registers.
        (0x050 => ep_halt: ReadWrite<u32>),
        (0x054 => ep_pause: ReadWrite<u32>),
        (0x058 => ep_reload: ReadWrite<u32>),
        (0x05c => ep_stchg: ReadWrite<u32>),
        (0x060 => _reserved3),
        (0x064 => devnotif_lo: ReadWrite<u32>),
        (0x068 => devnotif_hi: ReadWrite<u32>),
        (0x06c => porthalt: ReadWrite<u32, PORTHALT::Register>),
        (0x070 => port_tm: ReadWrite<u32>),
        (0x074 => ep_thread_active: ReadWrite<u32>),
        (0x078 => ep_stopped: ReadWrite<u32>),
        (0x07c => _reserved4),
        (0x85c => cfg_dev_fe: ReadWrite<u32, CFG_DEV_FE::Register>),
        (0x860 => @END),
    }
}

register_structs! {
    pub PadctlRegisters {
        (0x000 => _reserved0),
        (0x020 => elpg_program_0: ReadWrite<u32>),
        (0x024 => elpg_program_1: ReadWrite<u32>),
        (0x028 => _reserved1),
        (0xc60 => usb2_vbus_id: ReadWrite<u32, USB2_VBUS_ID::Register>),
        (0xc64 => @END),
    }
}

register_bitfields![u32,
    DB [
        TARGET OFFSET(8) NUMBITS(8) [],
        STREAMID OFFSET(16) NUMBITS(16) []
    ],
    ERSTSZ [
        ERST0SZ OFFSET(0) NUMBITS(16) [],
        ERST1SZ OFFSET(16) NUMBITS(16) []
    ],
    ERDPLO [
        /// Event handler busy, write 1 to clear.
        EHB OFFSET(3) NUMBITS(1) [],
        ADDRLO OFFSET(4) NUMBITS(28) []
    ],
    EREPLO [
        /// Enqueue cycle state.
        ECS OFFSET(0) NUMBITS(1) [],
        SEGI OFFSET(1) NUMBITS(1) [],
        ADDRLO OFFSET(4) NUMBITS(28) []
    ],
    CTRL [
        RUN OFFSET(0) NUMBITS(1) [],
        LSE OFFSET(1) NUMBITS(1) [],
        IE OFFSET(4) NUMBITS(1) [],
        SMI_EVT OFFSET(5) NUMBITS(1) [],
        SMI_DSE OFFSET(6) NUMBITS(1) [],
        EWE OFFSET(7) NUMBITS(1) [],
        DEVADR OFFSET(24) NUMBITS(7) [],
        ENABLE OFFSET(31) NUMBITS(1) []
    ],
    ST [
        /// Run change, write 1 to clear.
        RC OFFSET(0) NUMBITS(1) [],
        IP OFFSET(4) NUMBITS(1) []
    ],
    pub PORTSC [
        CCS OFFSET(0) NUMBITS(1) [],
        PED OFFSET(1) NUMBITS(1) [],
        PR OFFSET(4) NUMBITS(1) [],
        PLS OFFSET(5) NUMBITS(4) [
            U0 = 0,
            U3 = 3,
            Disabled = 4,
            RxDetect = 5,
            Inactive = 6,
            Polling = 7,
            Recovery = 8,
            HotReset = 9,
            Resume = 15
        ],
        PS OFFSET(10) NUMBITS(4) [],
        /// Link write strobe: PLS is only written when this is set.
        LWS OFFSET(16) NUMBITS(1) [],
        CSC OFFSET(17) NUMBITS(1) [],
        WRC OFFSET(19) NUMBITS(1) [],
        PRC OFFSET(21) NUMBITS(1) [],
        PLC OFFSET(22) NUMBITS(1) [],
        CEC OFFSET(23) NUMBITS(1) [],
        WPR OFFSET(30) NUMBITS(1) []
    ],
    PORTHALT [
        HALT_LTSSM OFFSET(0) NUMBITS(1) [],
        HALT_REJECT OFFSET(1) NUMBITS(1) [],
        STCHG_REQ OFFSET(20) NUMBITS(1) [],
        STCHG_INTR_EN OFFSET(24) NUMBITS(1) []
    ],
    CFG_DEV_FE [
        /// Which port register bank PORTSC accesses are routed to.
        PORTREGSEL OFFSET(0) NUMBITS(2) [
            Init = 0,
            SuperSpeed = 1,
            HighFullSpeed = 2
        ]
    ],
    USB2_VBUS_ID [
        VBUS_SOURCE_SELECT OFFSET(12) NUMBITS(2) [
            VbusWakeup = 0,
            Override = 1
        ],
        VBUS_OVERRIDE OFFSET(14) NUMBITS(1) [],
        ID_SOURCE_SELECT OFFSET(16) NUMBITS(2) [
            IdWakeup = 0,
            Override = 1
        ],
        ID_OVERRIDE OFFSET(18) NUMBITS(4) [
            Grounded = 0,
            Float = 8
        ]
    ]
];

/// A snapshot of the port status register.
pub type PortStatus = LocalRegisterCopy<u32, PORTSC::Register>;

pub const XUSB_DEV_BASE: StaticRef<XusbDevRegisters> =
    unsafe { StaticRef::new(0x700D_0000 as *const XusbDevRegisters) };

pub const PADCTL_BASE: StaticRef<PadctlRegisters> =
    unsafe { StaticRef::new(0x7009_F000 as *const PadctlRegisters) };

/// Every write-1-to-clear bit in PORTSC. A write must leave all of them at 0
/// except the one being acknowledged.
const PORTSC_CHANGE_MASK: u32 =
    (1 << 1) | (1 << 17) | (1 << 19) | (1 << 21) | (1 << 22) | (1 << 23);

pub struct XusbDev<'a> {
    registers: StaticRef<XusbDevRegisters>,
    padctl: StaticRef<PadctlRegisters>,
    time: &'a dyn Time,
}

impl<'a> XusbDev<'a> {
    pub const fn new(
        registers: StaticRef<XusbDevRegisters>,
        padctl: StaticRef<PadctlRegisters>,
        time: &'a dyn Time,
    ) -> XusbDev<'a> {
        XusbDev {
            registers,
            padctl,
            time,
        }
    }

    /// Spin until `done` returns true or the state change timeout expires.
    fn wait_for<F: Fn() -> bool>(&self, what: &str, done: F) -> Result<(), ErrorCode> {
        let start = self.time.now();
        while !done() {
            if self.time.elapsed_since(start) > XUSB_STATE_CHANGE_TIMEOUT_US {
                debug_error!("xusb: timed out waiting for {}", what);
                return Err(ErrorCode::BUSY);
            }
        }
        Ok(())
    }

    /// Write an endpoint bit of EP_HALT or EP_PAUSE and wait for the
    /// controller to report the state change.
    fn change_endpoint_bit(
        &self,
        register: &ReadWrite<u32>,
        endpoint: usize,
        set: bool,
        what: &str,
    ) -> Result<(), ErrorCode> {
        let bit = 1u32 << endpoint;
        let value = register.get();
        register.set(if set { value | bit } else { value & !bit });
        self.wait_for(what, || self.registers.ep_stchg.get() & bit != 0)?;
        self.registers.ep_stchg.set(bit);
        Ok(())
    }

    /// Write PORTSC without acknowledging any change bit other than those in
    /// `acknowledge`.
    fn write_portsc(&self, mut value: PortStatus, acknowledge: u32) {
        value.set((value.get() & !PORTSC_CHANGE_MASK) | acknowledge);
        self.registers.portsc.set(value.get());
    }

    /// Start link training towards RxDetect on the port bank currently
    /// selected by CFG_DEV_FE.
    fn start_rx_detect(&self) {
        let mut portsc = self.registers.portsc.extract();
        portsc.modify(PORTSC::LWS::SET + PORTSC::PLS::RxDetect);
        self.write_portsc(portsc, 0);
    }
}

impl XusbController for XusbDev<'_> {
    fn install_event_ring(&self, base: u64, len: usize) {
        let regs = self.registers;
        regs.erstsz
            .write(ERSTSZ::ERST0SZ.val(len as u32) + ERSTSZ::ERST1SZ.val(0));
        regs.erst0balo.set(base as u32);
        regs.erst0bahi.set((base >> 32) as u32);
        regs.erst1balo.set(0);
        regs.erst1bahi.set(0);

        regs.erdplo
            .write(ERDPLO::ADDRLO.val((base as u32) >> 4) + ERDPLO::EHB::SET);
        regs.erdphi.set((base >> 32) as u32);

        regs.ereplo.write(
            EREPLO::ADDRLO.val((base as u32) >> 4) + EREPLO::ECS::SET + EREPLO::SEGI::CLEAR,
        );
        regs.erephi.set((base >> 32) as u32);
    }

    fn set_event_dequeue(&self, address: u64) {
        self.registers
            .erdplo
            .write(ERDPLO::ADDRLO.val((address as u32) >> 4) + ERDPLO::EHB::SET);
        self.registers.erdphi.set((address >> 32) as u32);
    }

    fn install_endpoint_contexts(&self, address: u64) {
        self.registers.ecplo.set(address as u32);
        self.registers.ecphi.set((address >> 32) as u32);
    }

    fn enable_events(&self) {
        self.registers.ctrl.modify(CTRL::LSE::SET + CTRL::IE::SET);
    }

    fn enable_device(&self) {
        let regs = self.registers;
        self.padctl.elpg_program_0.set(0);
        self.padctl.elpg_program_1.set(0);
        self.padctl.usb2_vbus_id.modify(
            USB2_VBUS_ID::VBUS_SOURCE_SELECT::Override + USB2_VBUS_ID::ID_SOURCE_SELECT::Override,
        );

        regs.porthalt.modify(PORTHALT::HALT_LTSSM::CLEAR);
        regs.ctrl.modify(CTRL::ENABLE::SET);

        regs.cfg_dev_fe.modify(CFG_DEV_FE::PORTREGSEL::HighFullSpeed);
        self.start_rx_detect();
        regs.cfg_dev_fe.modify(CFG_DEV_FE::PORTREGSEL::SuperSpeed);
        self.start_rx_detect();
        // Route PORTSC to whichever bank matches the current link speed.
        regs.cfg_dev_fe.modify(CFG_DEV_FE::PORTREGSEL::Init);

        self.padctl
            .usb2_vbus_id
            .modify(USB2_VBUS_ID::VBUS_OVERRIDE::SET + USB2_VBUS_ID::ID_OVERRIDE::Float);
    }

    fn ring_doorbell(&self, endpoint: usize, stream_id: u16) {
        self.registers
            .db
            .write(DB::TARGET.val(endpoint as u32) + DB::STREAMID.val(stream_id as u32));
    }

    fn is_halted(&self, endpoint: usize) -> bool {
        self.registers.ep_halt.get() & (1 << endpoint) != 0
    }

    fn set_halt(&self, endpoint: usize, halt: bool) -> Result<(), ErrorCode> {
        self.change_endpoint_bit(&self.registers.ep_halt, endpoint, halt, "EP_HALT")
    }

    fn is_paused(&self, endpoint: usize) -> bool {
        self.registers.ep_pause.get() & (1 << endpoint) != 0
    }

    fn set_pause(&self, endpoint: usize, pause: bool) -> Result<(), ErrorCode> {
        self.change_endpoint_bit(&self.registers.ep_pause, endpoint, pause, "EP_PAUSE")
    }

    fn reload(&self, endpoint: usize) -> Result<(), ErrorCode> {
        let bit = 1u32 << endpoint;
        self.registers.ep_reload.set(self.registers.ep_reload.get() | bit);
        self.wait_for("EP_RELOAD", || self.registers.ep_reload.get() & bit == 0)
    }

    fn is_stopped(&self, endpoint: usize) -> bool {
        self.registers.ep_stopped.get() & (1 << endpoint) != 0
    }

    fn clear_stopped(&self, endpoint: usize) {
        self.registers.ep_stopped.set(1 << endpoint);
    }

    fn set_device_address(&self, address: u8) {
        self.registers
            .ctrl
            .modify(CTRL::DEVADR.val(address as u32));
    }

    fn set_run(&self, run: bool) {
        self.registers.ctrl.modify(CTRL::RUN.val(run as u32));
    }

    fn clear_run_change(&self) {
        self.registers.st.write(ST::RC::SET);
    }

    fn port_status(&self) -> PortStatus {
        self.registers.portsc.extract()
    }

    fn acknowledge_port_change(&self, change: PortChange) {
        let bit = match change {
            PortChange::ConnectStatus => PORTSC::CSC::SET,
            PortChange::PortReset => PORTSC::PRC::SET,
            PortChange::WarmReset => PORTSC::WRC::SET,
            PortChange::LinkState => PORTSC::PLC::SET,
            PortChange::ConfigError => PORTSC::CEC::SET,
        };
        self.write_portsc(self.registers.portsc.extract(), bit.value);
    }

    fn port_halt_change_requested(&self) -> bool {
        self.registers.porthalt.is_set(PORTHALT::STCHG_REQ)
    }

    fn release_link_state_machine(&self) {
        self.registers.porthalt.modify(PORTHALT::HALT_LTSSM::CLEAR);
    }

    fn delay_us(&self, us: u32) {
        self.time.delay_us(us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    const XUSB_WORDS: usize = 0x860 / 4;
    const PADCTL_WORDS: usize = 0xc64 / 4;

    struct SteppingClock(Cell<u32>);

    impl Time for SteppingClock {
        fn now(&self) -> u32 {
            let now = self.0.get();
            self.0.set(now.wrapping_add(1000));
            now
        }
    }

    struct Bank {
        xusb: [u32; XUSB_WORDS],
        padctl: [u32; PADCTL_WORDS],
    }

    impl Bank {
        fn new() -> Bank {
            Bank {
                xusb: [0; XUSB_WORDS],
                padctl: [0; PADCTL_WORDS],
            }
        }

        fn dev<'a>(&mut self, clock: &'a SteppingClock) -> XusbDev<'a> {
            unsafe {
                XusbDev::new(
                    StaticRef::new(self.xusb.as_mut_ptr() as *const XusbDevRegisters),
                    StaticRef::new(self.padctl.as_mut_ptr() as *const PadctlRegisters),
                    clock,
                )
            }
        }
    }

    #[test]
    fn register_offsets() {
        assert_eq!(core::mem::size_of::<XusbDevRegisters>(), 0x860);
        assert_eq!(core::mem::size_of::<PadctlRegisters>(), 0xc64);
    }

    #[test]
    fn doorbell_encodes_target_and_stream() {
        let clock = SteppingClock(Cell::new(0));
        let mut bank = Bank::new();
        let dev = bank.dev(&clock);
        dev.ring_doorbell(3, 0x1234);
        assert_eq!(dev.registers.db.get(), 0x1234_0300);
    }

    #[test]
    fn acknowledging_one_change_leaves_the_others_pending() {
        let clock = SteppingClock(Cell::new(0));
        let mut bank = Bank::new();
        let dev = bank.dev(&clock);
        dev.registers
            .portsc
            .write(PORTSC::CSC::SET + PORTSC::PRC::SET + PORTSC::PED::SET + PORTSC::CCS::SET);
        dev.acknowledge_port_change(PortChange::PortReset);
        // Memory keeps what was written; the hardware would clear PRC.
        let written = dev.registers.portsc.extract();
        assert!(written.is_set(PORTSC::PRC));
        assert!(!written.is_set(PORTSC::CSC));
        assert!(!written.is_set(PORTSC::PED));
        assert!(written.is_set(PORTSC::CCS));
    }

    #[test]
    fn event_ring_registers() {
        let clock = SteppingClock(Cell::new(0));
        let mut bank = Bank::new();
        let dev = bank.dev(&clock);
        dev.install_event_ring(0x8010_0000, 32);
        assert_eq!(dev.registers.erstsz.get(), 32);
        assert_eq!(dev.registers.erst0balo.get(), 0x8010_0000);
        assert!(dev.registers.ereplo.is_set(EREPLO::ECS));
        dev.set_event_dequeue(0x8010_0040);
        assert_eq!(dev.registers.erdplo.read(ERDPLO::ADDRLO), 0x0801_0004);
    }

    #[test]
    fn enable_device_overrides_vbus_and_id() {
        let clock = SteppingClock(Cell::new(0));
        let mut bank = Bank::new();
        let dev = bank.dev(&clock);
        dev.registers.porthalt.write(PORTHALT::HALT_LTSSM::SET);
        dev.enable_device();
        assert!(dev.registers.ctrl.is_set(CTRL::ENABLE));
        assert!(!dev.registers.porthalt.is_set(PORTHALT::HALT_LTSSM));
        assert_eq!(dev.registers.cfg_dev_fe.read(CFG_DEV_FE::PORTREGSEL), 0);
        assert!(dev.registers.portsc.is_set(PORTSC::LWS));
        assert_eq!(dev.registers.portsc.read(PORTSC::PLS), 5);
        let vbus_id = dev.padctl.usb2_vbus_id.extract();
        assert!(vbus_id.is_set(USB2_VBUS_ID::VBUS_OVERRIDE));
        assert_eq!(vbus_id.read(USB2_VBUS_ID::ID_OVERRIDE), 8);
        assert_eq!(vbus_id.read(USB2_VBUS_ID::VBUS_SOURCE_SELECT), 1);
    }

    #[test]
    fn state_change_wait_is_bounded() {
        let clock = SteppingClock(Cell::new(0));
        let mut bank = Bank::new();
        let dev = bank.dev(&clock);
        // Nothing ever sets EP_STCHG in plain memory.
        assert_eq!(
            dev.change_endpoint_bit(&dev.registers.ep_halt, 2, true, "EP_HALT"),
            Err(ErrorCode::BUSY)
        );
        assert!(dev.is_halted(2));
    }

    #[test]
    fn state_change_is_acknowledged() {
        let clock = SteppingClock(Cell::new(0));
        let mut bank = Bank::new();
        let dev = bank.dev(&clock);
        dev.registers.ep_stchg.set(1 << 4);
        assert_eq!(
            dev.change_endpoint_bit(&dev.registers.ep_pause, 4, true, "EP_PAUSE"),
            Ok(())
        );
        assert!(dev.is_paused(4));
        // Write-1-to-clear; plain memory keeps the written bit.
        assert_eq!(dev.registers.ep_stchg.get(), 1 << 4);
    }

    #[test]
    fn device_address_and_run() {
        let clock = SteppingClock(Cell::new(0));
        let mut bank = Bank::new();
        let dev = bank.dev(&clock);
        dev.enable_events();
        dev.set_device_address(0x55);
        dev.set_run(true);
        assert_eq!(dev.registers.ctrl.read(CTRL::DEVADR), 0x55);
        assert!(dev.registers.ctrl.is_set(CTRL::RUN));
        assert!(dev.registers.ctrl.is_set(CTRL::LSE));
        assert!(dev.registers.ctrl.is_set(CTRL::IE));
    }
}
