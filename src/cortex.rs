//! Fixed access sequence against the Zynq ARM CoreSight debug port.
//!
//! After configuration the DAP is powered up and a known series of DP, MEM-AP
//! and CPU debug register accesses is made, comparing every read against the
//! values seen on working boards. The walk has no effect on the programmable
//! logic; it only exercises the debug path.
//!
//! DPACC and APACC are 35-bit scan chains (ADIv5 section 3.4): three request
//! bits (RnW and A[3:2]) followed by 32 data bits. Every read returns the
//! result of the previous access, together with a 3-bit ACK.

use thiserror::Error;
use num_enum::IntoPrimitive;
use crate::buffer::Transport;
use crate::jtag::{Jtag, Error as JTAGError};
use crate::tap::TapState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Device {0} is not the ARM debug port.")]
    NotDebugPort(usize),
    #[error("JTAG error")]
    JTAG(#[from] JTAGError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// ARM JTAG-DP instructions, 4 bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum DapInstruction {
    Abort = 0x8,
    Dpacc = 0xA,
    Apacc = 0xB,
    Idcode = 0xE,
    Bypass = 0xF,
}

/// Read-not-write bit of a DPACC/APACC request.
pub const RNW: u8 = 0x1;

// DP register addresses, already shifted into request bits 2:1.
pub const DP_CTRL: u8 = 1 << 1;
pub const DP_SELECT: u8 = 2 << 1;
pub const DP_RDBUFF: u8 = 3 << 1;

// MEM-AP register addresses.
pub const AP_CSW: u8 = 0;
pub const AP_TAR: u8 = 2;
pub const AP_DRW: u8 = 6;

/// OK/FAULT ACK returned with every transfer.
pub const ACK_OK: u8 = 0b010;

const ACK_BITS: usize = 3;
const TRANSFER_BITS: usize = 32 + ACK_BITS;
const TRANSFER_BYTES: usize = (TRANSFER_BITS + 7) / 8;

/// Only these bits of a read are compared.
const COMPARE_MASK: u32 = 0x1FFF_FFFF;

pub const DEFAULT_STATUS: u32 = 0xF000_0001;
pub const DEFAULT_CSW: u32 = 0xE000_0042;
pub const SELECT_DEBUG: u32 = 0x0100_0000;
pub const DEBUG_REGISTER_BASE: u32 = 0x8009_0000;

/// CTRL/STAT write requesting debug and system power-up, clearing sticky flags.
const POWER_UP: u32 = 0x5000_0033;

// CPU debug registers (ARM ARM C10).
pub const DBGDIDR: u32 = 0x000;
pub const DBGPCSR: u32 = 0x028;
pub const DBGITR: u32 = 0x084;
pub const DBGDSCR_EXT: u32 = 0x088;
pub const DBGPRSR: u32 = 0x314;

/// Offset of the second CPU's debug registers.
const CPU1: u32 = 0x2000;

const ADDRESS_DEVCFG_MCTRL: u32 = 0xF800_7080;
const ADDRESS_SLCR_ARM_PLL_CTRL: u32 = 0xF800_0100;
const ADDRESS_SLCR_ARM_CLK_CTRL: u32 = 0xF800_0120;

/// `MOVW R12, #2`, passed through DRW.
const INSTR_MOVW: u32 = 0x0300_C002;
const DEBUGID_VAL1: u32 = 0x0310_C002;
const VALC: u32 = 0x1513_7030;
const VAL3: u32 = 0x1F00_0200;
const VAL5: u32 = 0x0002_8000;
const VAL6: u32 = 0xE001_B400;
const SPI_STATUS: u32 = 0x0080_0042;

/// The debug walk against the ARM DP at one chain position.
pub struct DebugWalk<'a, T: Transport> {
    jtag: &'a mut Jtag<T>,
    index: usize,
}

impl<'a, T: Transport> DebugWalk<'a, T> {
    pub fn new(jtag: &'a mut Jtag<T>, index: usize) -> Result<Self> {
        if !jtag.chain()?.get(index)?.debug_core {
            return Err(Error::NotDebugPort(index));
        }
        Ok(DebugWalk { jtag, index })
    }

    /// Run the full walk.
    ///
    /// With `nowait` set, the first pass skips the idle clocks between
    /// accesses and the waiting passes are left out.
    pub fn run(&mut self, nowait: bool) -> Result<()> {
        log::info!("Running ARM debug port checks");
        self.csw(!nowait, false)?;
        if !nowait {
            self.read_csw(true, 0)?;
            self.csw(false, true)?;
        }
        self.read_csw(false, VAL3)?;

        self.load_ir(DapInstruction::Apacc)?;
        self.pair(CPU1 | DBGDSCR_EXT)?;
        self.tar_read(DBGPRSR)?;
        self.tar_read(DBGDSCR_EXT)?;
        self.check_read(&[0, 0, 0, 0, 1, 1, DEBUGID_VAL1, DEFAULT_STATUS], true)?;

        self.tar_write(DEBUG_REGISTER_BASE | DBGITR)?;
        self.check_read(&[DEBUGID_VAL1, VAL6, DEFAULT_STATUS], true)?;
        self.tar_write(DEBUG_REGISTER_BASE | CPU1 | DBGPRSR)?;
        self.tar_read(CPU1 | DBGDSCR_EXT)?;
        self.check_read(&[VAL6, 1, 1, DEBUGID_VAL1, DEFAULT_STATUS], true)?;
        self.tar_write(DEBUG_REGISTER_BASE | CPU1 | DBGITR)?;
        self.check_read(&[DEBUGID_VAL1, VAL6, DEFAULT_STATUS], true)?;
        self.jtag.flush()?;
        Ok(())
    }

    /// Select a JTAG-DP scan chain, leaving the TAP in Update-IR.
    pub fn load_ir(&mut self, instruction: DapInstruction) -> Result<()> {
        self.jtag.load_instruction_register(false, instruction.into(), self.index, TapState::Update)?;
        Ok(())
    }

    /// One 35-bit access: `value` with the 3 request bits `request` below it.
    ///
    /// Nothing is flushed; read results accumulate until `check_read()`.
    pub fn transfer(&mut self, read: bool, value: u32, request: u8) -> Result<()> {
        let word = ((value as u64) << ACK_BITS) | (request & 0x7) as u64;
        self.jtag.shift_dr_value(self.index, word, TRANSFER_BITS, read)?;
        Ok(())
    }

    fn read_rdbuff(&mut self) -> Result<()> {
        self.transfer(true, 0, DP_RDBUFF | RNW)
    }

    /// Finish with a CTRL/STAT and RDBUFF read, then compare every read
    /// queued since the last check against `expected`.
    pub fn check_read(&mut self, expected: &[u32], load: bool) -> Result<()> {
        if load {
            self.load_ir(DapInstruction::Dpacc)?;
        }
        self.transfer(true, 0, DP_CTRL | RNW)?;
        self.read_rdbuff()?;
        let data = self.jtag.read_data()?;
        let items: Vec<&[u8]> = data.chunks(TRANSFER_BYTES).collect();
        self.jtag.check("ARM debug read count", expected.len() as u64, items.len() as u64);
        for (i, (item, &expected)) in items.iter().zip(expected.iter()).enumerate() {
            let word = item.iter().enumerate()
                .fold(0u64, |acc, (j, &b)| acc | ((b as u64) << (8 * j)));
            let ack = (word & 0x7) as u8;
            if ack != ACK_OK {
                log::info!("ARM debug response {} has ACK 0x{:x}", i, ack);
            }
            let value = (word >> ACK_BITS) as u32;
            if !self.jtag.check("ARM debug read", (expected & COMPARE_MASK) as u64,
                                (value & COMPARE_MASK) as u64)
            {
                log::debug!("ARM debug read {}: {:02X?}", i, item);
            }
        }
        Ok(())
    }

    /// Write a CPU debug register address to TAR and read DRW twice.
    fn pair(&mut self, register: u32) -> Result<()> {
        self.transfer(false, DEBUG_REGISTER_BASE | register, AP_TAR)?;
        self.transfer(true, INSTR_MOVW, AP_DRW)?;
        self.transfer(true, DEBUGID_VAL1, AP_DRW)
    }

    /// Select the debug bus AP if `debug_bus`, otherwise the system bus AP.
    fn write_select(&mut self, debug_bus: bool) -> Result<()> {
        self.load_ir(DapInstruction::Dpacc)?;
        self.transfer(false, if debug_bus { SELECT_DEBUG } else { 0 }, DP_SELECT)?;
        self.load_ir(DapInstruction::Apacc)
    }

    fn tar_read(&mut self, register: u32) -> Result<()> {
        self.transfer(true, DEBUG_REGISTER_BASE | register, AP_TAR)?;
        self.read_rdbuff()
    }

    fn tar_write(&mut self, address: u32) -> Result<()> {
        self.load_ir(DapInstruction::Apacc)?;
        self.transfer(false, address, AP_TAR)?;
        self.read_rdbuff()
    }

    /// Power up the debug port and read CSW from both APs.
    fn csw(&mut self, wait: bool, clear_wait: bool) -> Result<()> {
        self.load_ir(DapInstruction::Abort)?;
        self.transfer(false, 1, 0)?;
        self.load_ir(DapInstruction::Dpacc)?;
        self.transfer(false, POWER_UP, DP_CTRL)?;
        let first: &[u32] = if clear_wait {
            self.load_ir(DapInstruction::Apacc)?;
            self.pair(CPU1 | DBGDSCR_EXT)?;
            &[0, 0, 0, DEFAULT_STATUS, DEFAULT_STATUS]
        } else {
            &[DEFAULT_STATUS, DEFAULT_STATUS]
        };
        let responses: [&[u32]; 2] = [first, &[0, SPI_STATUS, DEFAULT_STATUS]];
        self.load_ir(DapInstruction::Dpacc)?;
        self.transfer(clear_wait, 0, DP_CTRL | RNW)?;
        for (i, expected) in responses.iter().enumerate() {
            self.check_read(expected, i == 1)?;
            self.write_select(i == 1)?;
            self.transfer(true, 0, AP_CSW | RNW)?;
            if wait {
                self.jtag.idle_clocks(3, 3 - i)?;
            }
        }
        self.check_read(&[SELECT_DEBUG, DEFAULT_CSW, DEFAULT_STATUS], true)
    }

    /// Read back CSW, the Zynq clock registers and the CPU debug registers.
    fn read_csw(&mut self, wait: bool, val3: u32) -> Result<()> {
        const CSW_WRITES: [u32; 2] = [0x0000_0002, 0x8000_0002];
        let csw_responses: [&[u32]; 2] = [
            &[0, DEFAULT_CSW, DEFAULT_STATUS],
            &[SELECT_DEBUG, DEFAULT_CSW, DEFAULT_STATUS],
        ];
        for i in 0..2 {
            self.write_select(i == 1)?;
            self.transfer(true, CSW_WRITES[i], AP_CSW)?;
            if wait {
                self.jtag.idle_clocks(3, 3 - i)?;
            }
            self.check_read(csw_responses[i], true)?;
        }

        self.write_select(false)?;
        for &address in &[ADDRESS_SLCR_ARM_PLL_CTRL, ADDRESS_SLCR_ARM_CLK_CTRL] {
            self.transfer(true, address, AP_TAR)?;
            if wait {
                self.jtag.idle_clocks(3, 3)?;
            }
            self.read_rdbuff()?;
            if wait {
                self.jtag.idle_clocks(3, 3)?;
            } else {
                self.jtag.idle_clocks(0, 1)?;
            }
        }
        self.check_read(&[0, DEFAULT_CSW, VAL5, VAL5, VAL3, DEFAULT_STATUS], true)?;
        if wait {
            self.tar_write(ADDRESS_DEVCFG_MCTRL)?;
            self.jtag.idle_clocks(0, 1)?;
            self.check_read(&[VAL3, 0, DEFAULT_STATUS], true)?;
        }

        let cpu_responses: [&[u32]; 2] = [
            &[SELECT_DEBUG, val3, VALC, VALC, 1, 1, DEBUGID_VAL1, DEBUGID_VAL1, 0,
              DEFAULT_STATUS],
            &[0, 0, 0, 0, VALC, VALC, 1, 1, DEBUGID_VAL1, DEBUGID_VAL1, 0, DEFAULT_STATUS],
        ];
        self.write_select(true)?;
        for (i, expected) in cpu_responses.iter().enumerate() {
            let cpu = i as u32 * CPU1;
            if i == 1 {
                self.load_ir(DapInstruction::Apacc)?;
                self.pair(DBGDSCR_EXT)?;
            }
            self.tar_read(cpu | DBGDIDR)?;
            self.tar_read(cpu | DBGPRSR)?;
            self.tar_read(cpu | DBGDSCR_EXT)?;
            self.tar_read(cpu | DBGPCSR)?;
            self.check_read(expected, true)?;
        }
        Ok(())
    }
}
