//! Expected status values observed on known-good boards.
//!
//! These values depend on where the target sits in the chain and on whether
//! a Zynq ARM debug port is present. They are kept as literal tables rather
//! than derived, and anything outside them is logged for investigation.

use std::fmt;

/// STAT readback after a completed configuration, as read during final status readout.
pub const FINAL_STATUS: u32 = 0xF079_1040;

/// STAT readback of an unconfigured device.
pub const IDLE_STATUS: u32 = 0x3019_0040;

/// Every IR capture byte any table row can produce.
pub const KNOWN_IR_VALUES: &[u8] = &[0x8A, 0x20, 0x10, 0x88, 0xAE, 0xBC, 0x5C, 0xAC];

/// Every register readback any table row can produce.
pub const KNOWN_REGISTER_VALUES: &[u32] = &[
    0x0100_0000, 0x0300_0000, 0xF87F_1046, 0xFC79_1040, FINAL_STATUS, IDLE_STATUS,
];

/// Expected IR capture bytes and register values for one target.
///
/// IR values are compared against the bit-reversed first captured byte;
/// register values against the 32-bit readback as returned by
/// `X7::read_config_reg`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StatusTable {
    /// BYPASS capture of a device that was not yet configured.
    pub first_time: u8,
    /// ISC_NOOP capture once JPROGRAM has cleared the device.
    pub in_programming: u8,
    /// BYPASS capture of a device that was already configured.
    pub programmed: u8,
    /// BYPASS capture after JSTART completes.
    pub finished: u8,
    pub bootsts: u32,
    pub stat: u32,
}

impl StatusTable {
    /// Look up the table for the device at `index` (0 nearest TDO) in a chain
    /// of `chain_len` devices.
    pub fn new(chain_len: usize, index: usize, debug_core: bool) -> Self {
        let multi = chain_len > 1;
        let nearest_tdo = index == 0;
        let nearest_tdi = index + 1 == chain_len;
        StatusTable {
            first_time: if debug_core || !nearest_tdo { 0x8A } else { 0x20 },
            in_programming: if multi && nearest_tdo { 0x10 } else { 0x88 },
            programmed: if multi { 0xAE } else { 0xBC },
            finished: if multi && nearest_tdo { 0x5C } else { 0xAC },
            bootsts: if nearest_tdi { 0x0100_0000 } else { 0x0300_0000 },
            stat: if debug_core { 0xF87F_1046 } else { 0xFC79_1040 },
        }
    }

    /// Classify the BYPASS capture byte read once programming is done.
    pub fn classify_bypass(&self, value: u8) -> BypassStatus {
        if value == self.first_time {
            BypassStatus::FirstTime
        } else if value == self.programmed {
            BypassStatus::Programmed
        } else {
            BypassStatus::Unknown(value)
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BypassStatus {
    FirstTime,
    Programmed,
    Unknown(u8),
}

impl fmt::Display for BypassStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BypassStatus::FirstTime => write!(f, "bypass first time"),
            BypassStatus::Programmed => write!(f, "bypass already programmed"),
            BypassStatus::Unknown(v) => write!(f, "bypass unknown 0x{:02X}", v),
        }
    }
}

/// Decoded configuration STAT register (UG470 table 5-25).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StatusRegister(pub u32);

impl StatusRegister {
    /// Decode from a readback value, whose bytes arrive in reverse order.
    pub fn from_readback(readback: u32) -> Self {
        StatusRegister(readback.swap_bytes())
    }

    /// The value as it was read back.
    pub fn readback(&self) -> u32 {
        self.0.swap_bytes()
    }

    pub fn done(&self) -> bool {
        self.0 & (1 << 14) != 0
    }

    pub fn release_done(&self) -> bool {
        self.0 & (1 << 13) != 0
    }

    pub fn eos(&self) -> bool {
        self.0 & (1 << 4) != 0
    }

    pub fn startup_state(&self) -> u8 {
        ((self.0 >> 18) & 0x7) as u8
    }
}

impl fmt::Display for StatusRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "STATUS 0x{:08X} done {} release_done {} eos {} startup_state {}",
               self.0, self.done() as u8, self.release_done() as u8,
               self.eos() as u8, self.startup_state())
    }
}

#[test]
fn test_single_device_table() {
    let table = StatusTable::new(1, 0, false);
    assert_eq!(table.first_time, 0x20);
    assert_eq!(table.in_programming, 0x88);
    assert_eq!(table.programmed, 0xBC);
    assert_eq!(table.finished, 0xAC);
    assert_eq!(table.bootsts, 0x0100_0000);
    assert_eq!(table.stat, 0xFC79_1040);
}

#[test]
fn test_zynq_table() {
    // Programmable logic nearest TDO with the ARM debug port after it.
    let table = StatusTable::new(2, 0, true);
    assert_eq!(table.first_time, 0x8A);
    assert_eq!(table.in_programming, 0x10);
    assert_eq!(table.programmed, 0xAE);
    assert_eq!(table.finished, 0x5C);
    assert_eq!(table.bootsts, 0x0300_0000);
    assert_eq!(table.stat, 0xF87F_1046);
}

#[test]
fn test_last_of_three_table() {
    let table = StatusTable::new(3, 2, false);
    assert_eq!(table.first_time, 0x8A);
    assert_eq!(table.in_programming, 0x88);
    assert_eq!(table.finished, 0xAC);
    assert_eq!(table.bootsts, 0x0100_0000);
}

#[test]
fn test_classify_bypass() {
    let table = StatusTable::new(2, 1, false);
    assert_eq!(table.classify_bypass(0x8A), BypassStatus::FirstTime);
    assert_eq!(table.classify_bypass(0xAE), BypassStatus::Programmed);
    assert_eq!(table.classify_bypass(0x12), BypassStatus::Unknown(0x12));
}

#[test]
fn test_status_register() {
    let status = StatusRegister::from_readback(0xFC79_1040);
    assert_eq!(status.0, 0x4010_79FC);
    assert!(status.done());
    assert!(status.release_done());
    assert!(status.eos());
    assert_eq!(status.startup_state(), 4);

    let idle = StatusRegister::from_readback(IDLE_STATUS);
    assert!(!idle.done());
    assert_eq!(idle.startup_state(), 0);
}
