//! JTAG session: shift primitives, chain discovery and chain addressing.
//!
//! A `Jtag` owns the command buffer in front of the adapter, the tracked TAP
//! state, the discovered `Chain`, and a log of every expectation mismatch seen
//! during the session. Higher layers borrow it to address individual devices.

use std::fmt;
use thiserror::Error;
use crate::bitvec;
use crate::buffer::{self, CommandBuffer, Transport, BUFFER_CAPACITY};
use crate::mpsse::{Command, MAX_BYTES_PER_COMMAND};
use crate::tap::{TapController, TapState};

#[derive(Error, Debug)]
pub enum Error {
    #[error("JTAG chain has not been scanned yet.")]
    NoChain,
    #[error("JTAG chain contains no devices.")]
    EmptyChain,
    #[error("Device index {index} is out of range for a chain of {len} devices.")]
    InvalidIndex { index: usize, len: usize },
    #[error("No device in the JTAG chain matches IDCODE 0x{0:08X}.")]
    NoMatchingDevice(u32),
    #[error("Cannot shift {0} bits in a single bit operation.")]
    TooManyBits(usize),
    #[error("TAP is in {0:?}, which is not a shift state.")]
    NotShifting(TapState),
    #[error("Cannot leave a shift state to {0:?} without shifting a bit.")]
    EmptyExit(TapState),
    #[error("{0}")]
    Mismatch(Mismatch),
    #[error("Command buffer error")]
    Buffer(#[from] buffer::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// IDCODE of the ARM CoreSight debug port found on Zynq-7000 parts.
pub const CORTEX_IDCODE: u32 = 0x4BA0_0477;

/// IR length of the ARM debug port.
pub const CORTEX_IR_LEN: usize = 4;

/// IR length of Xilinx 7-series devices.
pub const XILINX_IR_LEN: usize = 6;

/// Bitstream IDCODE value which matches any device.
pub const ANY_IDCODE: u32 = 0xFFFF_FFFF;

/// Xilinx IDCODEs carry a 4-bit version field in their top bits.
pub const IDCODE_VERSION_MASK: u32 = 0x0FFF_FFFF;

/// Maximum number of devices discovery will look for.
pub const MAX_CHAIN_LENGTH: usize = 20;

/// Largest amount of data sent to the adapter in one USB transfer.
pub const MAX_SINGLE_TRANSFER: usize = 4046;

/// Default TCK frequency.
pub const DEFAULT_CLOCK: u32 = 15_000_000;

/// Base clock from which TCK is divided.
const BASE_CLOCK: u32 = 30_000_000;

/// IDCODE instruction for the ARM debug port.
const CORTEX_IR_IDCODE: u8 = 0x0E;

/// IDCODE instruction for Xilinx 7-series devices.
const XILINX_IR_IDCODE: u8 = 0x09;

/// Words shifted through DR to find the IDCODEs.
const PRESENCE_WORDS: usize = MAX_CHAIN_LENGTH;

/// Words shifted through DR to check the chain is unchanged.
const VALIDATE_WORDS: usize = 32;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IDCODE(pub u32);

impl IDCODE {
    pub fn version(&self) -> u8 {
        (self.0 >> 28) as u8
    }

    pub fn part_number(&self) -> u16 {
        ((self.0 >> 12) & 0xFFFF) as u16
    }

    pub fn manufacturer(&self) -> u16 {
        ((self.0 >> 1) & 0x7FF) as u16
    }
}

impl fmt::Display for IDCODE {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// A single device on the JTAG chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChainEntry {
    /// IDCODE, with the version nibble removed for Xilinx parts.
    pub idcode: IDCODE,
    /// Instruction register length in bits.
    pub ir_len: usize,
    /// Whether this is the chain's ARM debug port.
    pub debug_core: bool,
}

impl ChainEntry {
    /// Opcode which selects the IDCODE register on this device.
    fn idcode_instruction(&self) -> u8 {
        if self.ir_len == CORTEX_IR_LEN { CORTEX_IR_IDCODE } else { XILINX_IR_IDCODE }
    }
}

impl fmt::Display for ChainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IDCODE: {}, IR length {}", self.idcode, self.ir_len)?;
        if self.debug_core {
            write!(f, " (ARM debug port)")?;
        }
        Ok(())
    }
}

/// Devices on the JTAG chain, index 0 closest to TDO.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Chain {
    entries: Vec<ChainEntry>,
}

impl Chain {
    /// Build a chain from IDCODEs in the order they were shifted out of TDO.
    ///
    /// The first ARM debug port IDCODE becomes the chain's debug core.
    pub fn from_idcodes(idcodes: &[u32]) -> Self {
        let mut entries = Vec::with_capacity(idcodes.len());
        let mut found_debug_core = false;
        for &idcode in idcodes {
            if idcode == CORTEX_IDCODE {
                if found_debug_core {
                    log::warn!("Found a second ARM debug port, treating it as an ordinary device");
                }
                entries.push(ChainEntry {
                    idcode: IDCODE(idcode),
                    ir_len: CORTEX_IR_LEN,
                    debug_core: !found_debug_core,
                });
                found_debug_core = true;
            } else {
                entries.push(ChainEntry {
                    idcode: IDCODE(idcode & IDCODE_VERSION_MASK),
                    ir_len: XILINX_IR_LEN,
                    debug_core: false,
                });
            }
        }
        Chain { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Result<&ChainEntry> {
        self.entries.get(index).ok_or(Error::InvalidIndex { index, len: self.entries.len() })
    }

    pub fn idcodes(&self) -> Vec<IDCODE> {
        self.entries.iter().map(|e| e.idcode).collect()
    }

    pub fn ir_lengths(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.ir_len).collect()
    }

    pub fn total_ir_len(&self) -> usize {
        self.entries.iter().map(|e| e.ir_len).sum()
    }

    /// Index of the ARM debug port, if present.
    pub fn debug_core(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.debug_core)
    }

    /// IR bits belonging to devices on the TDO side and on the TDI side of `index`.
    pub fn ir_padding(&self, index: usize) -> Result<(usize, usize)> {
        self.get(index)?;
        let tdo_side = self.entries[..index].iter().map(|e| e.ir_len).sum();
        let tdi_side = self.entries[index + 1..].iter().map(|e| e.ir_len).sum();
        Ok((tdo_side, tdi_side))
    }

    /// Number of bypassed devices on the TDO side and on the TDI side of `index`.
    pub fn dr_padding(&self, index: usize) -> Result<(usize, usize)> {
        self.get(index)?;
        Ok((index, self.entries.len() - index - 1))
    }

    /// Pick the device to operate on.
    ///
    /// A device is a candidate if its IDCODE matches `idcode` (version nibble
    /// ignored), if `idcode` is `ANY_IDCODE`, or if `match_any` is set. The
    /// first `skip` candidates are passed over when further ones exist.
    pub fn select_target(&self, idcode: u32, skip: usize, match_any: bool) -> Result<usize> {
        if self.is_empty() {
            return Err(Error::EmptyChain);
        }
        let wanted = idcode & IDCODE_VERSION_MASK;
        let mut selected = None;
        let mut skip = skip;
        for (index, entry) in self.entries.iter().enumerate() {
            if match_any || idcode == ANY_IDCODE || entry.idcode.0 == wanted {
                selected = Some(index);
                if skip == 0 {
                    break;
                }
                skip -= 1;
            }
        }
        match selected {
            Some(index) => {
                log::debug!("Selected device {} of {}", index, self.len());
                Ok(index)
            },
            None => {
                let first = self.entries[0].idcode;
                log::error!("IDCODE 0x{:08X} does not match first device {}", idcode, first);
                Err(Error::NoMatchingDevice(idcode))
            },
        }
    }

    pub fn to_lines(&self) -> Vec<String> {
        self.entries.iter().enumerate().map(|(i, e)| format!("{}: {}", i, e)).collect()
    }
}

/// A readback value which did not match what the protocol expects.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mismatch {
    pub context: &'static str,
    pub expected: u64,
    pub actual: u64,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mismatch: {}: expected 0x{:X} actual 0x{:X}",
               self.context, self.expected, self.actual)
    }
}

/// How the final byte of a byte shift is handled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TailMode {
    /// Shift the last data byte bit-wise so its final bit rides on the exit
    /// transition.
    LastByte,
    /// Shift all data as whole bytes; the exit transition shifts one extra
    /// filler bit of the given value.
    Fill(bool),
}

/// Options for `Jtag::shift_bytes`.
#[derive(Copy, Clone, Debug)]
pub struct ShiftBytes {
    /// Capture TDO for every data bit.
    pub read: bool,
    /// TAP state to leave Shift through, or stay shifting if None.
    pub exit: Option<TapState>,
    /// Largest amount of data sent per USB transfer; the buffer is flushed
    /// between frames.
    pub max_frame: usize,
    pub tail: TailMode,
    /// Reverse the bit order of every byte before shifting.
    pub swap: bool,
}

impl Default for ShiftBytes {
    fn default() -> Self {
        ShiftBytes {
            read: false,
            exit: None,
            max_frame: MAX_SINGLE_TRANSFER,
            tail: TailMode::LastByte,
            swap: false,
        }
    }
}

/// Expected discovery responses, set up on the first scan.
#[derive(Clone, Debug)]
struct Patterns {
    presence: Vec<u8>,
    validate: Vec<u8>,
}

/// JTAG session over an MPSSE adapter.
pub struct Jtag<T> {
    buffer: CommandBuffer<T>,
    tap: TapController,
    clock: u32,
    chain: Option<Chain>,
    patterns: Option<Patterns>,
    readback: Vec<u8>,
    mismatches: Vec<Mismatch>,
}

impl<T: Transport> Jtag<T> {
    pub fn new(transport: T) -> Self {
        Jtag {
            buffer: CommandBuffer::new(transport),
            tap: TapController::new(),
            clock: DEFAULT_CLOCK,
            chain: None,
            patterns: None,
            readback: Vec::new(),
            mismatches: Vec::new(),
        }
    }

    /// Use a TCK frequency other than `DEFAULT_CLOCK`, applied by `init()`.
    pub fn with_clock(mut self, freq: u32) -> Self {
        self.clock = freq;
        self
    }

    /// Configure the adapter for JTAG and force the TAP into Test-Logic-Reset.
    ///
    /// `high_gpio` performs the additional high-byte GPIO initialisation
    /// needed by some adapter revisions.
    pub fn init(&mut self, high_gpio: bool) -> Result<()> {
        log::debug!("Initialising adapter for JTAG at {} Hz", self.clock);
        self.push(&Command::loopback_off())?;
        self.push(&Command::disable_div5())?;
        self.set_clock(self.clock)?;
        self.push(&Command::set_bits_low(0xE8, 0xEB))?;
        self.push(&Command::set_bits_high(0x20, 0x30))?;
        if high_gpio {
            self.push(&Command::set_bits_high(0x30, 0x00))?;
            self.push(&Command::set_bits_high(0x00, 0x00))?;
        }
        self.tap.invalidate();
        self.reset(0)
    }

    /// Set the TCK frequency.
    pub fn set_clock(&mut self, freq: u32) -> Result<()> {
        let divisor = (BASE_CLOCK / freq.max(1)).saturating_sub(1).min(0xFFFF);
        self.clock = BASE_CLOCK / (divisor + 1);
        if self.clock != freq {
            log::info!("Requested {} Hz TCK, using {} Hz", freq, self.clock);
        }
        self.push(&Command::clock_divisor(divisor as u16))?;
        self.flush()
    }

    /// Current TCK frequency in Hz.
    pub fn clock(&self) -> u32 {
        self.clock
    }

    pub fn state(&self) -> TapState {
        self.tap.state()
    }

    pub fn transport(&self) -> &T {
        self.buffer.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.buffer.transport_mut()
    }

    /// Queue a raw adapter command.
    pub fn push(&mut self, command: &Command) -> Result<()> {
        Ok(self.buffer.push(command)?)
    }

    /// Send all queued commands, keeping any returned data for `read_data()`.
    pub fn flush(&mut self) -> Result<()> {
        let data = self.buffer.flush()?;
        self.readback.extend_from_slice(&data);
        Ok(())
    }

    /// Flush and return all data captured since the last call.
    pub fn read_data(&mut self) -> Result<Vec<u8>> {
        self.flush()?;
        Ok(std::mem::take(&mut self.readback))
    }

    /// Move the TAP to `state` if it is not already there.
    pub fn require(&mut self, state: TapState) -> Result<()> {
        Ok(self.tap.require(&mut self.buffer, state)?)
    }

    /// Enter Test-Logic-Reset, hold TMS high for `hold` more clocks, and flush.
    pub fn reset(&mut self, hold: usize) -> Result<()> {
        self.tap.reset(&mut self.buffer, hold)?;
        self.flush()
    }

    /// Reset marker: enter Test-Logic-Reset and clock `hold + 1` more TMS-high cycles.
    ///
    /// The distinctive run lengths make each phase easy to find in a USB trace.
    pub fn mark_reset(&mut self, hold: usize) -> Result<()> {
        self.reset(hold + 1)
    }

    /// Trace marker: three TMS-high clocks with TDI high, from Test-Logic-Reset.
    pub fn marker(&mut self) -> Result<()> {
        self.tap.reset(&mut self.buffer, 0)?;
        self.push(&Command::tms(3, 0x67, true, false))?;
        self.flush()
    }

    /// Clock in Run-Test/Idle: one clock if `extra` is non-zero, then
    /// `groups` runs of seven clocks, then `extra + 1` clocks if `extra` is non-zero.
    pub fn idle_clocks(&mut self, groups: usize, extra: usize) -> Result<()> {
        self.require(TapState::Idle)?;
        if extra > 0 {
            self.push(&Command::tms(1, 0, false, false))?;
        }
        for _ in 0..groups {
            self.push(&Command::tms(7, 0, false, false))?;
        }
        if extra > 0 {
            self.push(&Command::tms(extra + 1, 0, false, false))?;
        }
        Ok(())
    }

    /// Clock `n` cycles in Run-Test/Idle.
    pub fn run_test_idle(&mut self, n: usize) -> Result<()> {
        self.require(TapState::Idle)?;
        let mut remaining = n;
        while remaining > 0 {
            let clocks = remaining.min(7);
            self.push(&Command::tms(clocks, 0, false, false))?;
            remaining -= clocks;
        }
        self.flush()
    }

    fn ensure_shifting(&self) -> Result<()> {
        match self.state() {
            TapState::ShiftDr | TapState::ShiftIr | TapState::Unknown => Ok(()),
            state => Err(Error::NotShifting(state)),
        }
    }

    /// Enter `target` (Shift-DR or Shift-IR), going through Run-Test/Idle
    /// unless a direct transition exists.
    pub fn enter_shift(&mut self, target: TapState) -> Result<()> {
        match self.state() {
            state if state == target => return Ok(()),
            TapState::Idle | TapState::Reset | TapState::Update | TapState::Unknown => (),
            _ => self.require(TapState::Idle)?,
        }
        self.require(target)
    }

    /// Shift up to 8 bits of `value`, LSB first.
    ///
    /// With an `exit`, the last bit is shifted by the clock which leaves the
    /// Shift state. When reading, only that first clock captures TDO, so the
    /// result holds exactly `nbits` bits. An exit with `nbits == 0` performs
    /// the transition alone, shifting bit 0 of `value` on its first clock.
    pub fn shift_bits(&mut self, read: bool, nbits: usize, value: u8, exit: Option<TapState>)
        -> Result<()>
    {
        if nbits > 8 {
            return Err(Error::TooManyBits(nbits));
        }
        if nbits == 0 && exit.is_none() {
            return Ok(());
        }
        self.ensure_shifting()?;
        let data_bits = match exit {
            Some(_) if nbits > 0 => nbits - 1,
            _ => nbits,
        };
        if data_bits > 0 {
            self.push(&Command::bits(read, data_bits as u8, value))?;
        }
        if let Some(exit) = exit {
            let last = if nbits > 0 { (value >> (nbits - 1)) & 1 == 1 } else { value & 1 == 1 };
            if read && exit != TapState::Exit1 {
                self.tap.transition(&mut self.buffer, TapState::Exit1, last, true)?;
                self.require(exit)?;
            } else {
                self.tap.transition(&mut self.buffer, exit, last, read)?;
            }
        }
        Ok(())
    }

    /// Shift exactly `width` one bits.
    ///
    /// Leaving the shift state clocks a bit, so a zero-width fill cannot
    /// take an `exit`.
    pub fn fill_ones(&mut self, read: bool, width: usize, exit: Option<TapState>) -> Result<()> {
        match (width, exit) {
            (0, None) => return Ok(()),
            (0, Some(exit)) => return Err(Error::EmptyExit(exit)),
            _ => (),
        }
        self.ensure_shifting()?;
        let mut bytes = width / 8;
        let mut bits = width % 8;
        if exit.is_some() && bits == 0 && bytes > 0 {
            bytes -= 1;
            bits = 8;
        }
        while bytes > 0 {
            let n = bytes.min(1024);
            self.push_data(read, &vec![0xFF; n])?;
            bytes -= n;
        }
        self.shift_bits(read, bits, 0xFF, exit)
    }

    /// Queue whole data bytes, flushing first if they would not fit in the buffer.
    fn push_data(&mut self, read: bool, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(MAX_BYTES_PER_COMMAND.min(MAX_SINGLE_TRANSFER)) {
            if self.buffer.len() + chunk.len() + 8 > BUFFER_CAPACITY {
                self.flush()?;
            }
            self.push(&Command::bytes(read, chunk))?;
        }
        Ok(())
    }

    /// Shift a byte sequence, each byte LSB first.
    pub fn shift_bytes(&mut self, data: &[u8], opts: &ShiftBytes) -> Result<()> {
        self.ensure_shifting()?;
        let fill = match opts.tail {
            TailMode::Fill(fill) => fill,
            TailMode::LastByte => false,
        };
        if data.is_empty() {
            if opts.exit.is_some() {
                self.shift_bits(opts.read, 0, fill as u8, opts.exit)?;
            }
            return Ok(());
        }

        let frames: Vec<&[u8]> = data.chunks(opts.max_frame.max(1)).collect();
        let nframes = frames.len();
        for (i, frame) in frames.into_iter().enumerate() {
            let last = i + 1 == nframes;
            let (body, tail) = match opts.tail {
                TailMode::LastByte if last => {
                    let (tail, body) = frame.split_last().ok_or(Error::NotShifting(self.state()))?;
                    (body, Some(*tail))
                },
                _ => (frame, None),
            };
            if !body.is_empty() {
                if opts.swap {
                    let mut swapped = body.to_vec();
                    bitvec::bitswap_all(&mut swapped);
                    self.push_data(opts.read, &swapped)?;
                } else {
                    self.push_data(opts.read, body)?;
                }
            }
            if !last {
                self.flush()?;
                continue;
            }
            match tail {
                Some(byte) => {
                    let byte = if opts.swap { bitvec::bitswap(byte) } else { byte };
                    self.shift_bits(opts.read, 8, byte, opts.exit)?;
                },
                None => if opts.exit.is_some() {
                    self.shift_bits(opts.read, 0, fill as u8, opts.exit)?;
                },
            }
        }
        Ok(())
    }

    /// Capture `n` bytes of TDO without driving TDI, leaving through `exit` on the last bit.
    pub fn read_bytes(&mut self, n: usize, exit: Option<TapState>) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        self.ensure_shifting()?;
        let mut whole = if exit.is_some() { n - 1 } else { n };
        while whole > 0 {
            let size = whole.min(MAX_SINGLE_TRANSFER);
            if self.buffer.len() + 8 > BUFFER_CAPACITY {
                self.flush()?;
            }
            self.push(&Command::read_bytes(size))?;
            whole -= size;
        }
        if exit.is_some() {
            self.shift_bits(true, 8, 0xFF, exit)?;
        }
        Ok(())
    }

    /// Go from Run-Test/Idle to Shift-DR and shift `pad` one bits.
    pub fn idle_to_shift_dr(&mut self, pad: usize) -> Result<()> {
        self.require(TapState::Idle)?;
        self.require(TapState::ShiftDr)?;
        self.fill_ones(false, pad, None)
    }

    /// Shift `pattern` through DR after `pad` bits, returning what was captured.
    pub fn write_pattern(&mut self, pad: usize, pattern: &[u8], exit: TapState)
        -> Result<Vec<u8>>
    {
        self.idle_to_shift_dr(pad)?;
        let opts = ShiftBytes { read: true, exit: Some(exit), ..Default::default() };
        self.shift_bytes(pattern, &opts)?;
        self.read_data()
    }

    /// The discovered chain.
    pub fn chain(&self) -> Result<&Chain> {
        self.chain.as_ref().ok_or(Error::NoChain)
    }

    /// Use `chain` instead of discovering one.
    pub fn set_chain(&mut self, chain: Chain) {
        self.chain = Some(chain);
    }

    /// Load `opcode` into the IR of device `index`, filling every other IR with ones.
    ///
    /// If `read` is set, returns the bits captured from the device's own IR,
    /// right-aligned. The TAP is left in `exit`.
    pub fn load_instruction_register(
        &mut self, read: bool, opcode: u8, index: usize, exit: TapState
    ) -> Result<Vec<u8>> {
        let (own, (tdo_side, tdi_side)) = {
            let chain = self.chain()?;
            (chain.get(index)?.ir_len, chain.ir_padding(index)?)
        };
        log::trace!("IR 0x{:02X} -> device {} (padding {}+{})", opcode, index, tdo_side, tdi_side);
        self.require(TapState::Idle)?;
        self.require(TapState::ShiftIr)?;
        self.fill_ones(false, tdo_side, None)?;
        let mut data = Vec::new();
        if tdi_side == 0 {
            self.shift_bits(read, own, opcode, Some(exit))?;
            if read {
                data = self.read_data()?;
            }
        } else if read {
            self.shift_bits(true, own, opcode, Some(TapState::Pause))?;
            data = self.read_data()?;
            self.require(TapState::ShiftIr)?;
            self.fill_ones(false, tdi_side, Some(exit))?;
        } else {
            self.shift_bits(false, own, opcode, None)?;
            self.fill_ones(false, tdi_side, Some(exit))?;
        }
        Ok(data)
    }

    /// Put every device into BYPASS, returning the captured IR bits if `read`.
    pub fn bypass_all(&mut self, read: bool) -> Result<Vec<u8>> {
        let total = self.chain()?.total_ir_len();
        self.require(TapState::Idle)?;
        self.require(TapState::ShiftIr)?;
        self.fill_ones(read, total, Some(TapState::Idle))?;
        if read {
            self.read_data()
        } else {
            self.flush()?;
            Ok(Vec::new())
        }
    }

    /// Load BYPASS into device `index` and shift one bit through its DR.
    pub fn load_data_register_bypass(&mut self, read: bool, index: usize) -> Result<Vec<u8>> {
        let (tdo_side, _) = self.chain()?.dr_padding(index)?;
        self.load_instruction_register(false, 0xFF, index, TapState::Idle)?;
        self.enter_shift(TapState::ShiftDr)?;
        self.fill_ones(false, tdo_side, None)?;
        self.shift_bits(read, 1, 0x01, Some(TapState::Idle))?;
        if read {
            self.read_data()
        } else {
            self.flush()?;
            Ok(Vec::new())
        }
    }

    /// Shift `data` through the DR of device `index`, all other devices in BYPASS.
    ///
    /// Returns the captured DR contents if `read` is set. Ends in Run-Test/Idle.
    pub fn shift_dr(&mut self, index: usize, data: &[u8], read: bool, swap: bool)
        -> Result<Vec<u8>>
    {
        let (tdo_side, tdi_side) = self.chain()?.dr_padding(index)?;
        self.enter_shift(TapState::ShiftDr)?;
        self.fill_ones(false, tdo_side, None)?;
        let exit = if tdi_side == 0 { Some(TapState::Idle) } else { None };
        let opts = ShiftBytes { read, exit, swap, ..Default::default() };
        self.shift_bytes(data, &opts)?;
        if tdi_side > 0 {
            self.fill_ones(false, tdi_side, Some(TapState::Idle))?;
        }
        if read {
            self.read_data()
        } else {
            self.flush()?;
            Ok(Vec::new())
        }
    }

    /// Shift the low `nbits` of `value` through the DR of device `index`.
    ///
    /// Nothing is flushed, so several transfers can share one USB write; any
    /// captured bits (whole bytes, then one right-aligned partial byte) are
    /// collected by the next `read_data()`. Ends in Run-Test/Idle.
    pub fn shift_dr_value(&mut self, index: usize, value: u64, nbits: usize, read: bool)
        -> Result<()>
    {
        if nbits == 0 || nbits > 64 {
            return Err(Error::TooManyBits(nbits));
        }
        let (tdo_side, tdi_side) = self.chain()?.dr_padding(index)?;
        self.enter_shift(TapState::ShiftDr)?;
        self.fill_ones(false, tdo_side, None)?;
        let exit = if tdi_side == 0 { Some(TapState::Idle) } else { None };
        let bytes = value.to_le_bytes();
        let mut whole = nbits / 8;
        let mut tail = nbits % 8;
        if tail == 0 && exit.is_some() {
            whole -= 1;
            tail = 8;
        }
        if whole > 0 {
            self.push_data(read, &bytes[..whole])?;
        }
        self.shift_bits(read, tail, bytes[whole.min(7)], exit)?;
        if tdi_side > 0 {
            self.fill_ones(false, tdi_side, Some(TapState::Idle))?;
        }
        Ok(())
    }

    /// Read `nbytes` from the DR of device `index`, shifting in ones.
    pub fn read_dr(&mut self, index: usize, nbytes: usize) -> Result<Vec<u8>> {
        self.shift_dr(index, &vec![0xFF; nbytes], true, false)
    }

    /// Scan the chain for IDCODEs.
    ///
    /// The first call builds the chain and remembers the expected responses;
    /// later calls reuse them and record a mismatch if the chain has changed.
    pub fn discover_chain(&mut self, pre_reset: bool) -> Result<&Chain> {
        if pre_reset {
            self.reset(1)?;
        }
        self.mark_reset(4)?;
        if self.chain.as_ref().map(|c| !c.is_empty()).unwrap_or(false) {
            self.load_idcode_instructions()?;
        }

        let pattern = vec![0xFF; PRESENCE_WORDS * 4];
        let response = self.write_pattern(0, &pattern, TapState::Idle)?;

        if self.patterns.is_none() {
            let mut presence = pattern.clone();
            let mut idcodes = Vec::new();
            let mut offset = 0;
            while response != presence && offset < 4 * (MAX_CHAIN_LENGTH - 1) {
                let word = &response[offset..offset + 4];
                let idcode = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                if idcode == 0xFFFF_FFFF {
                    break;
                } else if idcode == 0 {
                    log::warn!("Read an all-zero IDCODE, is TDO connected?");
                    break;
                }
                log::debug!("Read IDCODE 0x{:08X}", idcode);
                idcodes.push(idcode);
                presence[offset..offset + 4].copy_from_slice(word);
                offset += 4;
            }
            let mut validate = vec![0xFF; VALIDATE_WORDS * 4];
            validate[..offset].copy_from_slice(&presence[..offset]);
            self.patterns = Some(Patterns { presence, validate });
            let chain = Chain::from_idcodes(&idcodes);
            if chain.is_empty() {
                log::warn!("No devices found on JTAG chain");
            }
            self.chain = Some(chain);
        }

        if let Some(patterns) = self.patterns.clone() {
            self.check_pattern("IDCODE presence", &patterns.presence, &response);
        }
        self.chain()
    }

    /// Select IDCODE in every device of the known chain.
    fn load_idcode_instructions(&mut self) -> Result<()> {
        let entries = self.chain()?.entries().to_vec();
        self.require(TapState::Idle)?;
        self.require(TapState::ShiftIr)?;
        for (i, entry) in entries.iter().enumerate() {
            let exit = if i + 1 == entries.len() { Some(TapState::Idle) } else { None };
            self.shift_bits(false, entry.ir_len, entry.idcode_instruction(), exit)?;
        }
        self.flush()
    }

    /// Re-shift the all-ones validate pattern and check the chain still
    /// returns the IDCODEs found at discovery.
    ///
    /// Returns whether the chain matched. Leaves the TAP in Pause-DR.
    pub fn validate_chain(&mut self) -> Result<bool> {
        let expected = match &self.patterns {
            Some(patterns) => patterns.validate.clone(),
            None => return Err(Error::NoChain),
        };
        self.mark_reset(0)?;
        self.require(TapState::Idle)?;
        let pattern = vec![0xFF; VALIDATE_WORDS * 4];
        let response = self.write_pattern(0, &pattern, TapState::Pause)?;
        Ok(self.check_pattern("IDCODE validate", &expected, &response))
    }

    /// Compare a readback value, logging and recording any mismatch.
    ///
    /// Returns whether the values matched.
    pub fn check(&mut self, context: &'static str, expected: u64, actual: u64) -> bool {
        if expected == actual {
            return true;
        }
        self.record(Mismatch { context, expected, actual });
        false
    }

    /// Compare a readback pattern, logging both in full and recording the
    /// first differing 32-bit word.
    pub fn check_pattern(&mut self, context: &'static str, expected: &[u8], actual: &[u8])
        -> bool
    {
        if expected == actual {
            return true;
        }
        log::debug!("{} expected: {:02X?}", context, expected);
        log::debug!("{} actual:   {:02X?}", context, actual);
        let word = |data: &[u8], i: usize| -> u64 {
            data.iter().skip(i * 4).take(4).enumerate()
                .fold(0, |acc, (j, &b)| acc | ((b as u64) << (8 * j)))
        };
        let words = (expected.len().max(actual.len()) + 3) / 4;
        let first = (0..words).find(|&i| word(expected, i) != word(actual, i)).unwrap_or(0);
        self.record(Mismatch { context, expected: word(expected, first), actual: word(actual, first) });
        false
    }

    /// Log and record a mismatch.
    pub fn record(&mut self, mismatch: Mismatch) {
        log::warn!("{}", mismatch);
        self.mismatches.push(mismatch);
    }

    /// All mismatches recorded this session.
    pub fn mismatches(&self) -> &[Mismatch] {
        &self.mismatches
    }

    pub fn take_mismatches(&mut self) -> Vec<Mismatch> {
        std::mem::take(&mut self.mismatches)
    }

    /// Fail with the first recorded mismatch, for callers treating any
    /// protocol deviation as fatal.
    pub fn ensure_no_mismatches(&self) -> Result<()> {
        match self.mismatches.first() {
            Some(mismatch) => Err(Error::Mismatch(mismatch.clone())),
            None => Ok(()),
        }
    }
}
