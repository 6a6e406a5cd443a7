//! This module implements Xilinx 7-series configuration on top of a JTAG session.
//!
//! Configuration follows the JTAG procedure in UG470 chapter 6: the device is
//! cleared with JPROGRAM, the bitstream is shifted into CFG_IN, and startup is
//! triggered with JSTART. Status readbacks along the way are compared against
//! the literal tables in `status`; deviations are recorded on the session but
//! never abort programming.

use std::convert::TryFrom;
use std::fmt;
use std::io::Write;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use indicatif::{ProgressBar, ProgressStyle};
use crate::bitvec;
use crate::buffer::Transport;
use crate::jtag::{Jtag, IDCODE, ShiftBytes, TailMode, Error as JTAGError, MAX_SINGLE_TRANSFER};
use crate::mpsse::{Command, MAX_BYTES_PER_COMMAND};
use crate::tap::TapState;

pub mod packet;
pub mod status;

use packet::{ConfigRegister, Packets};
use status::{BypassStatus, StatusRegister, StatusTable, FINAL_STATUS, IDLE_STATUS,
             KNOWN_IR_VALUES, KNOWN_REGISTER_VALUES};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Device {0} is the ARM debug port, not a 7-series device.")]
    NotConfigurable(usize),
    #[error("JTAG error")]
    JTAG(#[from] JTAGError),
    #[error("I/O error")]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Bitstream bytes shifted per chunk before the buffer is flushed.
pub const STREAM_CHUNK: usize = 6464;

/// Readback is fetched in segments of this many bytes.
pub const READBACK_SEGMENT: usize = 256;

/// Bytes of pipeline delay (one frame, 101 words) before readback data.
pub const READBACK_SKIP: usize = 404;

/// Number of ISC_NOOP captures taken while waiting for the device to clear.
const READY_POLLS: usize = 8;

const DATA_PROGRESS_TPL: &str =
    " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
const DATA_PROGRESS_CHARS: &str = "=> ";

/// Low GPIO byte value and direction used for the board reset pulse.
const GPIO_VALUE: u8 = 0xE0;
const GPIO_DIRECTION: u8 = 0xEA;
const GPIO_DONE: u8 = 0x10;
const GPIO_01: u8 = 0x01;

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u32)]
pub enum X7IDCODE {
    XC7S6 = 0x3622093,
    XC7S15 = 0x3620093,
    XC7S25 = 0x37C4093,
    XC7S50 = 0x362F093,
    XC7S75 = 0x37C8093,
    XC7S100 = 0x37C7093,
    XC7A12T = 0x37C3093,
    XC7A15T = 0x362E093,
    XC7A25T = 0x37C2093,
    XC7A35T = 0x362D093,
    XC7A50T = 0x362C093,
    XC7A75T = 0x3632093,
    XC7A100T = 0x3631093,
    XC7A200T = 0x3636093,
    XC7K70T = 0x3647093,
    XC7K160T = 0x364C093,
    XC7K325T = 0x3651093,
    XC7K410T = 0x3656093,
    XC7Z010 = 0x3722093,
    XC7Z020 = 0x3727093,
    XC7Z030 = 0x372C093,
    XC7Z045 = 0x3731093,
}

impl X7IDCODE {
    pub fn try_from_idcode(idcode: &IDCODE) -> Option<Self> {
        Self::try_from(idcode.0 & 0x0FFF_FFFF).ok()
    }

    pub fn name(&self) -> &'static str {
        match self {
            X7IDCODE::XC7S6 => "XC7S6",
            X7IDCODE::XC7S15 => "XC7S15",
            X7IDCODE::XC7S25 => "XC7S25",
            X7IDCODE::XC7S50 => "XC7S50",
            X7IDCODE::XC7S75 => "XC7S75",
            X7IDCODE::XC7S100 => "XC7S100",
            X7IDCODE::XC7A12T => "XC7A12T",
            X7IDCODE::XC7A15T => "XC7A15T",
            X7IDCODE::XC7A25T => "XC7A25T",
            X7IDCODE::XC7A35T => "XC7A35T",
            X7IDCODE::XC7A50T => "XC7A50T",
            X7IDCODE::XC7A75T => "XC7A75T",
            X7IDCODE::XC7A100T => "XC7A100T",
            X7IDCODE::XC7A200T => "XC7A200T",
            X7IDCODE::XC7K70T => "XC7K70T",
            X7IDCODE::XC7K160T => "XC7K160T",
            X7IDCODE::XC7K325T => "XC7K325T",
            X7IDCODE::XC7K410T => "XC7K410T",
            X7IDCODE::XC7Z010 => "XC7Z010",
            X7IDCODE::XC7Z020 => "XC7Z020",
            X7IDCODE::XC7Z030 => "XC7Z030",
            X7IDCODE::XC7Z045 => "XC7Z045",
        }
    }
}

/// 7-series JTAG instructions (UG470 table 6-3).
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[repr(u8)]
pub enum Instruction {
    SAMPLE = 0x01,
    USER2 = 0x03,
    CFG_OUT = 0x04,
    CFG_IN = 0x05,
    USERCODE = 0x08,
    IDCODE = 0x09,
    HIGHZ_IO = 0x0A,
    JPROGRAM = 0x0B,
    JSTART = 0x0C,
    JSHUTDOWN = 0x0D,
    ISC_NOOP = 0x14,
    XSC_DNA = 0x17,
    FUSE_DNA = 0x32,
    BYPASS = 0x3F,
}

/// Length of the board GPIO pulse issued around configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GpioPulse {
    /// 1.25ms.
    Short,
    /// 12.5ms.
    Long,
}

impl GpioPulse {
    /// Number of CLK_BYTES bytes giving this pulse length at TCK frequency `clock`.
    pub fn clock_bytes(&self, clock: u32) -> usize {
        let bytes = match self {
            GpioPulse::Short => clock / 800,
            GpioPulse::Long => clock / 80,
        };
        (bytes as usize).max(1)
    }
}

/// Steps of a configuration run, in order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProgramState {
    Idle,
    ValidateIdcode,
    ResetDevice,
    AwaitReady,
    StreamBitstream,
    Startup,
    Verify,
    Bypass,
    Done,
}

impl ProgramState {
    pub fn next(self) -> Self {
        match self {
            ProgramState::Idle => ProgramState::ValidateIdcode,
            ProgramState::ValidateIdcode => ProgramState::ResetDevice,
            ProgramState::ResetDevice => ProgramState::AwaitReady,
            ProgramState::AwaitReady => ProgramState::StreamBitstream,
            ProgramState::StreamBitstream => ProgramState::Startup,
            ProgramState::Startup => ProgramState::Verify,
            ProgramState::Verify => ProgramState::Bypass,
            ProgramState::Bypass => ProgramState::Done,
            ProgramState::Done => ProgramState::Done,
        }
    }
}

/// Diagnostic status of one configurable device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceStatus {
    pub index: usize,
    /// USERCODE, unless it reads as all ones.
    pub usercode: Option<u32>,
    pub status: StatusRegister,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.index)?;
        if let Some(usercode) = self.usercode {
            write!(f, "USERCODE 0x{:08X}, ", usercode)?;
        }
        write!(f, "{}", self.status)
    }
}

/// Outcome of a completed configuration run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProgramReport {
    pub bypass: BypassStatus,
    pub status: StatusRegister,
}

fn progress_bar(len: usize, message: &'static str) -> ProgressBar {
    let style = ProgressStyle::with_template(DATA_PROGRESS_TPL)
        .map(|style| style.progress_chars(DATA_PROGRESS_CHARS))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let pb = ProgressBar::new(len as u64).with_style(style);
    pb.set_message(message);
    pb
}

/// A 7-series device at one position of a discovered chain.
pub struct X7<'a, T: Transport> {
    jtag: &'a mut Jtag<T>,
    index: usize,
    table: StatusTable,
    state: ProgramState,
}

impl<'a, T: Transport> X7<'a, T> {
    pub fn new(jtag: &'a mut Jtag<T>, index: usize) -> Result<Self> {
        let chain = jtag.chain()?;
        let entry = chain.get(index)?;
        if entry.debug_core {
            return Err(Error::NotConfigurable(index));
        }
        let table = StatusTable::new(chain.len(), index, chain.debug_core().is_some());
        log::debug!("Status table for device {}: {:X?}", index, table);
        Ok(X7 { jtag, index, table, state: ProgramState::Idle })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> ProgramState {
        self.state
    }

    pub fn table(&self) -> &StatusTable {
        &self.table
    }

    pub fn jtag(&mut self) -> &mut Jtag<T> {
        self.jtag
    }

    /// Configure the device with the raw bitstream `data`.
    pub fn program(&mut self, data: &[u8]) -> Result<ProgramReport> {
        self.program_cb(data, |_| {})
    }

    /// Configure the device, drawing a progress bar while the bitstream is sent.
    pub fn program_progress(&mut self, data: &[u8]) -> Result<ProgramReport> {
        let pb = progress_bar(data.len(), "Programming");
        let result = self.program_cb(data, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Configure the device, calling `cb` with the number of bitstream
    /// bytes sent so far.
    pub fn program_cb<F: Fn(usize)>(&mut self, data: &[u8], cb: F) -> Result<ProgramReport> {
        let mut bypass = BypassStatus::Unknown(0);
        let mut status = StatusRegister(0);
        self.state = ProgramState::Idle;
        loop {
            self.advance();
            match self.state {
                ProgramState::Idle => (),
                ProgramState::ValidateIdcode => {
                    self.jtag.validate_chain()?;
                },
                ProgramState::ResetDevice => {
                    self.jtag.mark_reset(0)?;
                    for device in self.readout_status()? {
                        log::debug!("{}", device);
                        if device.status.readback() != IDLE_STATUS {
                            log::debug!("Device {} is not idle before programming", device.index);
                        }
                    }
                    self.jtag.mark_reset(0)?;
                    self.load(Instruction::JPROGRAM)?;
                    self.load(Instruction::ISC_NOOP)?;
                    self.pulse_gpio(GpioPulse::Long)?;
                },
                ProgramState::AwaitReady => self.await_ready()?,
                ProgramState::StreamBitstream => {
                    log::info!("Starting to send bitstream");
                    self.stream(data, &cb)?;
                    log::info!("Done sending bitstream");
                },
                ProgramState::Startup => {
                    self.pulse_gpio(GpioPulse::Short)?;
                    self.load(Instruction::JSTART)?;
                    self.jtag.idle_clocks(14, 1)?;
                    let finished = self.ir_status(Instruction::BYPASS)?;
                    let expected = self.table.finished;
                    self.check_ir("JSTART finished", expected, finished);
                },
                ProgramState::Verify => {
                    let bootsts = self.read_config_reg(ConfigRegister::Bootsts)?;
                    let expected = self.table.bootsts;
                    self.check_register("BOOTSTS", expected, bootsts);
                    let stat = self.read_config_reg(ConfigRegister::Stat)?;
                    let expected = self.table.stat;
                    self.check_register("STAT", expected, stat);
                },
                ProgramState::Bypass => {
                    self.jtag.mark_reset(0)?;
                    let captured = self.jtag.bypass_all(true)?;
                    let value = captured.first().map(|&b| bitvec::bitswap(b)).unwrap_or(0);
                    bypass = self.table.classify_bypass(value);
                    log::info!("{}", bypass);
                    self.jtag.mark_reset(0)?;
                    status = self.read_status()?;
                    if status.readback() != FINAL_STATUS {
                        log::debug!("Final status 0x{:08X}, usually 0x{:08X}",
                                    status.readback(), FINAL_STATUS);
                    }
                    log::info!("{}", status);
                },
                ProgramState::Done => break,
            }
        }
        Ok(ProgramReport { bypass, status })
    }

    fn advance(&mut self) {
        let next = self.state.next();
        log::debug!("Configuration state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Poll ISC_NOOP until the device reports it is clearing configuration memory.
    fn await_ready(&mut self) -> Result<()> {
        let expected = self.table.in_programming;
        let mut value = 0;
        for _ in 0..READY_POLLS {
            value = self.ir_status(Instruction::ISC_NOOP)?;
            if value == expected {
                return Ok(());
            }
            self.jtag.idle_clocks(1, 0)?;
        }
        self.check_ir("ISC_NOOP in programming", expected, value);
        Ok(())
    }

    fn check_ir(&mut self, context: &'static str, expected: u8, actual: u8) {
        if !self.jtag.check(context, expected as u64, actual as u64)
            && !KNOWN_IR_VALUES.contains(&actual)
        {
            log::warn!("{}: 0x{:02X} is not a known status value, please report this board",
                       context, actual);
        }
    }

    fn check_register(&mut self, context: &'static str, expected: u32, actual: u32) {
        if !self.jtag.check(context, expected as u64, actual as u64)
            && !KNOWN_REGISTER_VALUES.contains(&actual)
        {
            log::warn!("{}: 0x{:08X} is not a known status value, please report this board",
                       context, actual);
        }
    }

    /// Load `instruction` into this device, everything else in BYPASS.
    fn load(&mut self, instruction: Instruction) -> Result<()> {
        self.load_at(self.index, instruction)
    }

    fn load_at(&mut self, index: usize, instruction: Instruction) -> Result<()> {
        self.jtag.load_instruction_register(false, instruction.into(), index, TapState::Idle)?;
        Ok(())
    }

    /// Load `instruction` and return the captured IR status, bit-reversed.
    pub fn ir_status(&mut self, instruction: Instruction) -> Result<u8> {
        let captured = self.jtag.load_instruction_register(
            true, instruction.into(), self.index, TapState::Idle)?;
        Ok(captured.first().map(|&b| bitvec::bitswap(b)).unwrap_or(0))
    }

    /// Shift `data` into CFG_IN as a bitstream: a zero word, then the data
    /// bit-reversed in chunks of `STREAM_CHUNK` bytes.
    ///
    /// Calls `cb` with the number of data bytes sent after each chunk.
    pub fn stream<F: Fn(usize)>(&mut self, data: &[u8], cb: F) -> Result<()> {
        let (tdo_side, tdi_side) = self.jtag.chain()?.dr_padding(self.index)?;
        let final_exit = if tdi_side == 0 { Some(TapState::Exit1) } else { None };
        self.load(Instruction::CFG_IN)?;
        self.jtag.enter_shift(TapState::ShiftDr)?;
        self.jtag.fill_ones(false, tdo_side, None)?;

        let prefix = ShiftBytes {
            exit: if data.is_empty() { final_exit } else { None },
            ..Default::default()
        };
        self.jtag.shift_bytes(&[0; 4], &prefix)?;

        cb(0);
        let nchunks = (data.len() + STREAM_CHUNK - 1) / STREAM_CHUNK;
        let mut sent = 0;
        for (i, chunk) in data.chunks(STREAM_CHUNK).enumerate() {
            let last = i + 1 == nchunks;
            if self.jtag.state() == TapState::Pause {
                self.jtag.require(TapState::ShiftDr)?;
            }
            let opts = ShiftBytes {
                read: false,
                exit: if last { final_exit } else { Some(TapState::Pause) },
                max_frame: MAX_SINGLE_TRANSFER,
                tail: TailMode::LastByte,
                swap: true,
            };
            self.jtag.shift_bytes(chunk, &opts)?;
            self.jtag.flush()?;
            sent += chunk.len();
            cb(sent);
        }
        if tdi_side > 0 {
            self.jtag.fill_ones(false, tdi_side, Some(TapState::Exit1))?;
        }
        self.jtag.require(TapState::Idle)?;
        self.jtag.flush()?;
        Ok(())
    }

    /// Pulse the board GPIO line, holding it for the duration of `pulse`.
    pub fn pulse_gpio(&mut self, pulse: GpioPulse) -> Result<()> {
        self.jtag.require(TapState::Idle)?;
        let mut delay = pulse.clock_bytes(self.jtag.clock());
        log::debug!("GPIO pulse {:?}: {} clock bytes", pulse, delay);
        self.jtag.push(&Command::set_bits_low(GPIO_VALUE, GPIO_DIRECTION | GPIO_DONE | GPIO_01))?;
        self.jtag.push(&Command::set_bits_low(GPIO_VALUE, GPIO_DIRECTION | GPIO_DONE))?;
        while delay > MAX_BYTES_PER_COMMAND {
            self.jtag.push(&Command::clock_bytes(MAX_BYTES_PER_COMMAND))?;
            delay -= MAX_BYTES_PER_COMMAND;
        }
        self.jtag.push(&Command::clock_bytes(delay))?;
        self.jtag.push(&Command::set_bits_low(GPIO_VALUE, GPIO_DIRECTION | GPIO_DONE | GPIO_01))?;
        self.jtag.push(&Command::set_bits_low(GPIO_VALUE, GPIO_DIRECTION | GPIO_01))?;
        self.jtag.flush()?;
        Ok(())
    }

    fn send_packets(&mut self, index: usize, packets: &Packets) -> Result<()> {
        self.load_at(index, Instruction::CFG_IN)?;
        self.jtag.shift_dr(index, &packets.to_bytes(), false, false)?;
        Ok(())
    }

    /// Read one word from CFG_OUT, then put the device back in BYPASS.
    fn read_cfg_out(&mut self, index: usize) -> Result<u32> {
        self.load_at(index, Instruction::CFG_OUT)?;
        let data = self.jtag.read_dr(index, 4)?;
        self.load_at(index, Instruction::BYPASS)?;
        Ok(bitvec::swapped_value(&data) as u32)
    }

    fn read_config_reg_at(&mut self, index: usize, register: ConfigRegister) -> Result<u32> {
        self.send_packets(index, &Packets::register_read(register))?;
        let value = self.read_cfg_out(index)?;
        log::debug!("Device {} {:?} = 0x{:08X}", index, register, value);
        Ok(value)
    }

    /// Read a configuration register (UG470 table 6-4).
    ///
    /// The value is returned in readback order: first byte most significant,
    /// which for STAT is the register with its bytes reversed.
    pub fn read_config_reg(&mut self, register: ConfigRegister) -> Result<u32> {
        self.read_config_reg_at(self.index, register)
    }

    /// Read STAT with the short status request used after configuration.
    pub fn read_status(&mut self) -> Result<StatusRegister> {
        self.send_packets(self.index, &Packets::status_read())?;
        let value = self.read_cfg_out(self.index)?;
        Ok(StatusRegister::from_readback(value))
    }

    fn usercode_at(&mut self, index: usize) -> Result<u32> {
        self.load_at(index, Instruction::USERCODE)?;
        let data = self.jtag.read_dr(index, 4)?;
        Ok(data.iter().take(4).enumerate().fold(0, |acc, (i, &b)| acc | ((b as u32) << (8 * i))))
    }

    pub fn usercode(&mut self) -> Result<u32> {
        self.usercode_at(self.index)
    }

    /// Read the 64-bit device DNA via FUSE_DNA.
    pub fn dna(&mut self) -> Result<u64> {
        self.load(Instruction::FUSE_DNA)?;
        let data = self.jtag.read_dr(self.index, 8)?;
        let dna = data.iter().take(8).enumerate()
            .fold(0u64, |acc, (i, &b)| acc | ((b as u64) << (8 * i)));
        log::debug!("DNA: {:02X?}", data);
        Ok(dna)
    }

    /// Capture `nbits` of the boundary-scan register with SAMPLE.
    pub fn sample_boundary(&mut self, nbits: usize) -> Result<Vec<bool>> {
        self.load(Instruction::SAMPLE)?;
        let data = self.jtag.read_dr(self.index, (nbits + 7) / 8)?;
        bitvec::bytes_to_bits(&data, nbits).map_err(|e| Error::Other(e.into()))
    }

    /// Read USERCODE and STAT from every configurable device in the chain.
    ///
    /// Nothing is compared; the values are for display.
    pub fn readout_status(&mut self) -> Result<Vec<DeviceStatus>> {
        let entries = self.jtag.chain()?.entries().to_vec();
        let mut devices = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            if entry.debug_core {
                continue;
            }
            let usercode = match self.usercode_at(index)? {
                0xFFFF_FFFF => None,
                usercode => Some(usercode),
            };
            let stat = self.read_config_reg_at(index, ConfigRegister::Stat)?;
            devices.push(DeviceStatus { index, usercode, status: StatusRegister::from_readback(stat) });
        }
        Ok(devices)
    }

    /// Read `words` words of configuration memory into `sink`.
    ///
    /// The device is shut down first and stays shut down afterwards.
    /// Returns the number of bytes written.
    pub fn read_config_memory<W: Write>(&mut self, words: u32, sink: &mut W) -> Result<usize> {
        self.read_config_memory_cb(words, sink, |_| {})
    }

    /// Read configuration memory, drawing a progress bar.
    pub fn read_config_memory_progress<W: Write>(&mut self, words: u32, sink: &mut W)
        -> Result<usize>
    {
        let pb = progress_bar(words as usize * 4, "Reading");
        let result = self.read_config_memory_cb(words, sink, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Read configuration memory, calling `cb` with the number of bytes
    /// written to `sink` so far.
    pub fn read_config_memory_cb<W: Write, F: Fn(usize)>(
        &mut self, words: u32, sink: &mut W, cb: F
    ) -> Result<usize> {
        self.load(Instruction::JSHUTDOWN)?;
        self.jtag.idle_clocks(6, 0)?;
        self.send_packets(self.index, &Packets::readback(words))?;

        let (tdo_side, _) = self.jtag.chain()?.dr_padding(self.index)?;
        self.load(Instruction::CFG_OUT)?;
        self.jtag.enter_shift(TapState::ShiftDr)?;
        self.jtag.fill_ones(false, tdo_side, None)?;

        let mut remaining = words as usize * 4 + READBACK_SKIP;
        let mut skip = READBACK_SKIP;
        let mut written = 0;
        cb(written);
        while remaining > 0 {
            let size = remaining.min(READBACK_SEGMENT);
            remaining -= size;
            let exit = if remaining == 0 { Some(TapState::Idle) } else { None };
            self.jtag.read_bytes(size, exit)?;
            let mut data = self.jtag.read_data()?;
            bitvec::bitswap_all(&mut data);
            let start = skip.min(data.len());
            skip -= start;
            sink.write_all(&data[start..])?;
            written += data.len() - start;
            cb(written);
        }
        log::debug!("Read {} bytes of configuration memory", written);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use crate::jtag::CORTEX_IDCODE;
    use crate::sim::{SimChain, SimDevice};
    use packet::{ConfigCommand, Opcode};

    const XC7A200T: u32 = 0x1363_6093;
    const XC7Z020: u32 = 0x1372_7093;

    fn session(devices: Vec<SimDevice>) -> Jtag<SimChain> {
        let mut jtag = Jtag::new(SimChain::new(devices));
        jtag.init(false).unwrap();
        jtag.discover_chain(true).unwrap();
        jtag
    }

    fn msb_bits(bytes: &[u8]) -> Vec<bool> {
        bytes.iter().flat_map(|b| (0..8).rev().map(move |i| (b >> i) & 1 == 1)).collect()
    }

    /// A minimal bitstream in file byte order: FDRI data then START.
    fn bitstream(fdri: &[u32]) -> Vec<u8> {
        let mut words = Packets::new()
            .dummy()
            .sync()
            .nop()
            .word(packet::type1(Opcode::Write, ConfigRegister::Fdri.into(), 0))
            .type2(fdri.len() as u32)
            .words()
            .to_vec();
        words.extend_from_slice(fdri);
        let tail = Packets::new().command(ConfigCommand::Start).command(ConfigCommand::Desync);
        words.extend_from_slice(tail.words());
        words.iter().flat_map(|w| w.to_be_bytes().to_vec()).collect()
    }

    #[test]
    fn test_x7idcode() {
        let id = X7IDCODE::try_from_idcode(&IDCODE(XC7A200T)).unwrap();
        assert_eq!(id, X7IDCODE::XC7A200T);
        assert_eq!(id.name(), "XC7A200T");
        assert!(X7IDCODE::try_from_idcode(&IDCODE(CORTEX_IDCODE)).is_none());
    }

    #[test]
    fn test_program_state_order() {
        let mut state = ProgramState::Idle;
        let mut seen = vec![state];
        while state != ProgramState::Done {
            state = state.next();
            seen.push(state);
        }
        assert_eq!(seen.len(), 9);
        assert_eq!(seen[4], ProgramState::StreamBitstream);
        assert_eq!(ProgramState::Done.next(), ProgramState::Done);
    }

    #[test]
    fn test_not_configurable() {
        let mut jtag = session(vec![SimDevice::xilinx(XC7Z020), SimDevice::cortex()]);
        assert!(matches!(X7::new(&mut jtag, 1), Err(Error::NotConfigurable(1))));
        assert!(matches!(X7::new(&mut jtag, 2), Err(Error::JTAG(_))));
    }

    #[test]
    fn test_stream_reverses_payload_bits() {
        let payload: Vec<u8> = (0..16).map(|i| 0x01 + i * 0x11).collect();
        let mut jtag = session(vec![SimDevice::xilinx(XC7A200T)]);
        let sent = Cell::new(0);
        {
            let mut x7 = X7::new(&mut jtag, 0).unwrap();
            x7.stream(&payload, |n| sent.set(n)).unwrap();
        }
        assert_eq!(sent.get(), 16);
        assert_eq!(jtag.state(), TapState::Idle);

        let swapped: Vec<u8> = payload[..15].iter().map(|&b| bitvec::bitswap(b)).collect();
        let written = jtag.transport().written();
        assert!(written.windows(15).any(|w| w == &swapped[..]));

        let mut expected = vec![false; 32];
        expected.extend(msb_bits(&payload));
        assert_eq!(jtag.transport().devices()[0].cfg_in_bits(), &expected[..]);
    }

    #[test]
    fn test_stream_multiple_chunks_with_padding() {
        let fdri: Vec<u32> = (0..4000).collect();
        let data = bitstream(&fdri);
        assert!(data.len() > 2 * STREAM_CHUNK);
        let mut jtag = session(vec![
            SimDevice::cortex(), SimDevice::xilinx(XC7Z020), SimDevice::xilinx(XC7A200T),
        ]);
        X7::new(&mut jtag, 1).unwrap().stream(&data, |_| {}).unwrap();
        let device = &jtag.transport().devices()[1];
        assert_eq!(device.fdri_words(), 4000);
        assert_eq!(device.commands(), &[ConfigCommand::Start as u32, ConfigCommand::Desync as u32]);
        assert_eq!(jtag.transport().devices()[2].fdri_words(), 0);
    }

    #[test]
    fn test_program_single_device() {
        let data = bitstream(&[0x1234_5678, 0x9ABC_DEF0]);
        let mut jtag = session(vec![SimDevice::xilinx(XC7A200T)]);
        let report = X7::new(&mut jtag, 0).unwrap().program(&data).unwrap();
        assert!(jtag.mismatches().is_empty(), "{:?}", jtag.mismatches());
        assert_eq!(report.status, StatusRegister::from_readback(0xFC79_1040));
        assert_eq!(report.bypass, BypassStatus::Programmed);

        let device = &jtag.transport().devices()[0];
        assert_eq!(device.fdri_words(), 2);
        assert!(device.commands().contains(&(ConfigCommand::Start as u32)));
        let loaded = device.loaded_instructions();
        let position = |op: Instruction| loaded.iter().position(|&i| i == u8::from(op)).unwrap();
        assert!(position(Instruction::JPROGRAM) < position(Instruction::JSTART));
        // Adapter setup, then the reset and startup pulses.
        assert_eq!(jtag.transport().gpio().len(), 2 + 8);
    }

    #[test]
    fn test_reprogram_reports_programmed() {
        let data = bitstream(&[0x0000_0001]);
        let mut jtag = session(vec![SimDevice::xilinx(XC7A200T)]);
        for _ in 0..2 {
            let report = X7::new(&mut jtag, 0).unwrap().program(&data).unwrap();
            assert_eq!(report.bypass, BypassStatus::Programmed);
        }
        assert!(jtag.mismatches().is_empty(), "{:?}", jtag.mismatches());
        assert_eq!(jtag.transport().devices()[0].fdri_words(), 2);
    }

    #[test]
    fn test_program_records_mismatch() {
        let data = bitstream(&[0]);
        let mut jtag = session(vec![SimDevice::xilinx(XC7A200T)]);
        jtag.transport_mut().devices_mut()[0].set_register(ConfigRegister::Bootsts, 0x0300_0000);
        let mut x7 = X7::new(&mut jtag, 0).unwrap();
        x7.program(&data).unwrap();
        assert_eq!(x7.state(), ProgramState::Done);
        let mismatches = jtag.take_mismatches();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].context, "BOOTSTS");
        assert_eq!(mismatches[0].expected, 0x0100_0000);
        assert_eq!(mismatches[0].actual, 0x0300_0000);
    }

    #[test]
    fn test_read_config_reg_with_padding() {
        let mut jtag = session(vec![SimDevice::xilinx(XC7Z020), SimDevice::cortex()]);
        jtag.transport_mut().devices_mut()[0].set_register(ConfigRegister::Bootsts, 0x1234_5678);
        let mut x7 = X7::new(&mut jtag, 0).unwrap();
        assert_eq!(x7.read_config_reg(ConfigRegister::Bootsts).unwrap(), 0x1234_5678);
        assert_eq!(x7.read_config_reg(ConfigRegister::Stat).unwrap(), 0xFC79_1040);
        let device = &jtag.transport().devices()[0];
        assert_eq!(device.commands(), &[ConfigCommand::Desync as u32; 2]);
        assert_eq!(device.instruction(), u8::from(Instruction::BYPASS));
    }

    #[test]
    fn test_readout_status() {
        let mut jtag = session(vec![
            SimDevice::cortex(), SimDevice::xilinx(XC7Z020), SimDevice::xilinx(XC7A200T),
        ]);
        jtag.transport_mut().devices_mut()[2].set_usercode(0xFFFF_FFFF);
        let devices = X7::new(&mut jtag, 1).unwrap().readout_status().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].index, 1);
        assert_eq!(devices[0].usercode, Some(SimDevice::USERCODE));
        assert_eq!(devices[1].index, 2);
        assert_eq!(devices[1].usercode, None);
        assert_eq!(devices[1].status.readback(), 0xFC79_1040);
        assert!(devices[0].to_string().starts_with("1: USERCODE 0x5EED0001, STATUS 0x401079FC"));
    }

    #[test]
    fn test_usercode_and_dna() {
        let mut jtag = session(vec![SimDevice::cortex(), SimDevice::xilinx(XC7Z020)]);
        let mut x7 = X7::new(&mut jtag, 1).unwrap();
        assert_eq!(x7.usercode().unwrap(), SimDevice::USERCODE);
        assert_eq!(x7.dna().unwrap(), SimDevice::DNA);
    }

    #[test]
    fn test_sample_boundary() {
        let bits: Vec<bool> = (0..20).map(|i| i % 3 == 0).collect();
        let mut jtag = session(vec![SimDevice::xilinx(XC7A200T)]);
        jtag.transport_mut().devices_mut()[0].set_boundary(bits.clone());
        assert_eq!(X7::new(&mut jtag, 0).unwrap().sample_boundary(20).unwrap(), bits);
    }

    #[test]
    fn test_read_config_memory() {
        let memory: Vec<u8> = (0..600u32).map(|i| (i * 7) as u8).collect();
        let mut jtag = session(vec![SimDevice::xilinx(XC7Z020), SimDevice::cortex()]);
        jtag.transport_mut().devices_mut()[0].set_memory(memory.clone());
        let mut sink = Vec::new();
        let total = Cell::new(0);
        let n = X7::new(&mut jtag, 0).unwrap()
            .read_config_memory_cb(150, &mut sink, |n| total.set(n)).unwrap();
        assert_eq!(n, 600);
        assert_eq!(total.get(), 600);
        assert_eq!(sink, memory);
        let device = &jtag.transport().devices()[0];
        assert!(device.loaded_instructions().contains(&u8::from(Instruction::JSHUTDOWN)));
        assert_eq!(device.commands(), &[ConfigCommand::Rcfg as u32]);
    }

    #[test]
    fn test_pulse_gpio() {
        let mut jtag = session(vec![SimDevice::xilinx(XC7A200T)]);
        let clock = jtag.clock();
        X7::new(&mut jtag, 0).unwrap().pulse_gpio(GpioPulse::Long).unwrap();
        let sim = jtag.transport();
        assert_eq!(sim.idle_clocks(), 8 * (clock as usize / 80));
        let gpio: Vec<u8> = sim.gpio().iter().filter(|g| g.0 == 0x80).map(|g| g.2).collect();
        assert_eq!(&gpio[gpio.len() - 4..], &[0xFB, 0xFA, 0xFB, 0xEB]);
    }
}
