//! Simulated MPSSE adapter with a chain of TAP controllers behind it.
//!
//! `SimChain` decodes every command written to it, clocks a full IEEE 1149.1
//! controller, and queues the bytes a real adapter would return. Device 0 is
//! nearest TDO and TDI enters the last device.

use std::collections::{HashMap, VecDeque};
use crate::buffer::Transport;
use crate::xilinx::packet::{ConfigCommand, ConfigRegister, SYNC_WORD};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    TestLogicReset, RunTestIdle,
    SelectDr, CaptureDr, ShiftDr, Exit1Dr, PauseDr, Exit2Dr, UpdateDr,
    SelectIr, CaptureIr, ShiftIr, Exit1Ir, PauseIr, Exit2Ir, UpdateIr,
}

impl State {
    fn next(self, tms: bool) -> State {
        use State::*;
        match (self, tms) {
            (TestLogicReset, true) => TestLogicReset,
            (TestLogicReset, false) => RunTestIdle,
            (RunTestIdle, true) => SelectDr,
            (RunTestIdle, false) => RunTestIdle,
            (SelectDr, true) => SelectIr,
            (SelectDr, false) => CaptureDr,
            (CaptureDr, true) => Exit1Dr,
            (CaptureDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (Exit1Dr, true) => UpdateDr,
            (Exit1Dr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (PauseDr, false) => PauseDr,
            (Exit2Dr, true) => UpdateDr,
            (Exit2Dr, false) => ShiftDr,
            (UpdateDr, true) => SelectDr,
            (UpdateDr, false) => RunTestIdle,
            (SelectIr, true) => TestLogicReset,
            (SelectIr, false) => CaptureIr,
            (CaptureIr, true) => Exit1Ir,
            (CaptureIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (Exit1Ir, true) => UpdateIr,
            (Exit1Ir, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (PauseIr, false) => PauseIr,
            (Exit2Ir, true) => UpdateIr,
            (Exit2Ir, false) => ShiftIr,
            (UpdateIr, true) => SelectDr,
            (UpdateIr, false) => RunTestIdle,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Kind {
    Xilinx,
    Cortex,
}

/// One access to a 35-bit ARM debug port register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DapAccess {
    pub instruction: u8,
    pub request: u8,
    pub value: u32,
}

/// Least significant bit first.
fn lsb_bits(value: u64, n: usize) -> VecDeque<bool> {
    (0..n).map(|i| (value >> i) & 1 == 1).collect()
}

/// Each byte most significant bit first, as Xilinx configuration logic shifts.
fn msb_bits(bytes: &[u8]) -> VecDeque<bool> {
    bytes.iter().flat_map(|b| (0..8).rev().map(move |i| (b >> i) & 1 == 1)).collect()
}

#[derive(Clone, Debug)]
pub struct SimDevice {
    kind: Kind,
    idcode: u32,
    ir_len: usize,
    ir_capture: u8,
    ir_shift: u32,
    started: bool,
    instruction: u8,
    dr: VecDeque<bool>,
    loaded: Vec<u8>,

    usercode: u32,
    dna: u64,
    boundary: Vec<bool>,
    registers: HashMap<u32, u32>,
    memory: Vec<u8>,
    cfg_pending: Vec<bool>,
    cfg_received: Vec<bool>,
    cfg_readback: Vec<u8>,
    commands: Vec<u32>,
    fdri_words: usize,

    dap_responses: VecDeque<u32>,
    dap_log: Vec<DapAccess>,
}

impl SimDevice {
    pub const XILINX_IR_CAPTURE: u8 = 0x35;
    pub const XILINX_IR_PROGRAMMING: u8 = 0x11;
    /// IR capture of a configured device once it has been through Test-Logic-Reset.
    pub const XILINX_IR_PROGRAMMED: u8 = 0x3D;
    pub const CORTEX_IR_CAPTURE: u8 = 0x01;
    pub const USERCODE: u32 = 0x5EED_0001;
    pub const DNA: u64 = 0x0123_4567_89AB_CDEF;
    /// Words of pipeline delay before configuration readback data.
    pub const READBACK_DELAY: usize = 404;

    fn new(kind: Kind, idcode: u32, ir_len: usize, ir_capture: u8) -> Self {
        let mut device = SimDevice {
            kind, idcode, ir_len, ir_capture,
            ir_shift: 0,
            started: false,
            instruction: 0,
            dr: VecDeque::new(),
            loaded: Vec::new(),
            usercode: Self::USERCODE,
            dna: Self::DNA,
            boundary: Vec::new(),
            registers: HashMap::new(),
            memory: Vec::new(),
            cfg_pending: Vec::new(),
            cfg_received: Vec::new(),
            cfg_readback: Vec::new(),
            commands: Vec::new(),
            fdri_words: 0,
            dap_responses: VecDeque::new(),
            dap_log: Vec::new(),
        };
        device.registers.insert(ConfigRegister::Stat as u32, 0xFC79_1040);
        device.registers.insert(ConfigRegister::Bootsts as u32, 0x0100_0000);
        device.reset();
        device
    }

    pub fn xilinx(idcode: u32) -> Self {
        Self::new(Kind::Xilinx, idcode, 6, Self::XILINX_IR_CAPTURE)
    }

    pub fn cortex() -> Self {
        Self::new(Kind::Cortex, crate::jtag::CORTEX_IDCODE, 4, Self::CORTEX_IR_CAPTURE)
    }

    /// Instruction currently loaded.
    pub fn instruction(&self) -> u8 {
        self.instruction
    }

    /// Every instruction loaded by an Update-IR, in order.
    pub fn loaded_instructions(&self) -> &[u8] {
        &self.loaded
    }

    pub fn bypass_instruction(&self) -> u8 {
        ((1u32 << self.ir_len) - 1) as u8
    }

    pub fn set_ir_capture(&mut self, capture: u8) {
        self.ir_capture = capture;
    }

    pub fn set_usercode(&mut self, usercode: u32) {
        self.usercode = usercode;
    }

    pub fn set_boundary(&mut self, bits: Vec<bool>) {
        self.boundary = bits;
    }

    pub fn set_register(&mut self, register: ConfigRegister, value: u32) {
        self.registers.insert(register as u32, value);
    }

    pub fn set_memory(&mut self, memory: Vec<u8>) {
        self.memory = memory;
    }

    /// Values returned by successive captures of the ARM DPACC/APACC/ABORT registers.
    pub fn queue_dap_responses(&mut self, values: &[u32]) {
        self.dap_responses.extend(values);
    }

    pub fn dap_log(&self) -> &[DapAccess] {
        &self.dap_log
    }

    /// Every bit shifted into CFG_IN, in shift order.
    pub fn cfg_in_bits(&self) -> &[bool] {
        &self.cfg_received
    }

    /// Values written to the CMD configuration register.
    pub fn commands(&self) -> &[u32] {
        &self.commands
    }

    /// Words delivered to FDRI by Type-2 writes.
    pub fn fdri_words(&self) -> usize {
        self.fdri_words
    }

    fn idcode_instruction(&self) -> u8 {
        match self.kind {
            Kind::Xilinx => 0x09,
            Kind::Cortex => 0x0E,
        }
    }

    fn reset(&mut self) {
        self.instruction = self.idcode_instruction();
        if self.started {
            self.ir_capture = Self::XILINX_IR_PROGRAMMED;
        }
    }

    fn capture_ir(&mut self) {
        self.ir_shift = self.ir_capture as u32;
    }

    fn update_ir(&mut self) {
        self.instruction = (self.ir_shift & ((1 << self.ir_len) - 1)) as u8;
        self.loaded.push(self.instruction);
        if self.kind == Kind::Xilinx {
            match self.instruction {
                0x0B => {
                    self.started = false;
                    self.ir_capture = Self::XILINX_IR_PROGRAMMING;
                },
                0x0C => {
                    self.started = true;
                    self.ir_capture = Self::XILINX_IR_CAPTURE;
                },
                _ => (),
            }
        }
    }

    fn capture_dr(&mut self) {
        self.dr = match (self.kind, self.instruction) {
            (Kind::Xilinx, 0x09) | (Kind::Cortex, 0x0E) => lsb_bits(self.idcode as u64, 32),
            (Kind::Xilinx, 0x08) => lsb_bits(self.usercode as u64, 32),
            (Kind::Xilinx, 0x32) => lsb_bits(self.dna, 64),
            (Kind::Xilinx, 0x01) if !self.boundary.is_empty() => self.boundary.iter().copied().collect(),
            (Kind::Xilinx, 0x04) => {
                let data = std::mem::take(&mut self.cfg_readback);
                if data.is_empty() { lsb_bits(0, 32) } else { msb_bits(&data) }
            },
            (Kind::Xilinx, 0x05) => {
                self.cfg_pending.clear();
                lsb_bits(0, 1)
            },
            (Kind::Cortex, 0x08) | (Kind::Cortex, 0x0A) | (Kind::Cortex, 0x0B) => {
                let value = self.dap_responses.pop_front().unwrap_or(0);
                lsb_bits(((value as u64) << 3) | 0b010, 35)
            },
            _ => lsb_bits(0, 1),
        };
    }

    fn update_dr(&mut self) {
        match (self.kind, self.instruction) {
            (Kind::Xilinx, 0x05) => self.process_config(),
            (Kind::Cortex, 0x08) | (Kind::Cortex, 0x0A) | (Kind::Cortex, 0x0B) => {
                let word = self.dr.iter().enumerate()
                    .fold(0u64, |acc, (i, &b)| acc | ((b as u64) << i));
                self.dap_log.push(DapAccess {
                    instruction: self.instruction,
                    request: (word & 7) as u8,
                    value: (word >> 3) as u32,
                });
            },
            _ => (),
        }
    }

    fn shift(&mut self, state: State, tdi: bool) -> bool {
        match state {
            State::ShiftIr => {
                let out = self.ir_shift & 1 == 1;
                self.ir_shift = (self.ir_shift >> 1) | ((tdi as u32) << (self.ir_len - 1));
                out
            },
            State::ShiftDr => {
                if self.kind == Kind::Xilinx && self.instruction == 0x05 {
                    self.cfg_pending.push(tdi);
                }
                self.dr.push_back(tdi);
                self.dr.pop_front().unwrap_or(tdi)
            },
            _ => true,
        }
    }

    /// Interpret the bits shifted into CFG_IN as configuration packets.
    fn process_config(&mut self) {
        let bits = std::mem::take(&mut self.cfg_pending);
        self.cfg_received.extend_from_slice(&bits);
        let word_at = |i: usize| bits[i..i + 32].iter().fold(0u32, |acc, &b| (acc << 1) | b as u32);
        let mut synced = false;
        let mut last_op = 0;
        let mut last_reg = 0;
        let mut i = 0;
        while i + 32 <= bits.len() {
            let word = word_at(i);
            if !synced {
                if word == SYNC_WORD {
                    synced = true;
                    i += 32;
                } else {
                    i += 1;
                }
                continue;
            }
            i += 32;
            match word >> 29 {
                1 => {
                    let op = (word >> 27) & 3;
                    let reg = (word >> 13) & 0x3FFF;
                    let count = (word & 0x7FF) as usize;
                    last_op = op;
                    last_reg = reg;
                    if op == 1 && count > 0 {
                        let value = self.registers.get(&reg).copied().unwrap_or(0);
                        self.cfg_readback = value.to_be_bytes().to_vec();
                    } else if op == 2 {
                        for _ in 0..count {
                            if i + 32 > bits.len() {
                                break;
                            }
                            let value = word_at(i);
                            i += 32;
                            if reg == ConfigRegister::Cmd as u32 {
                                self.commands.push(value);
                                if value == ConfigCommand::Desync as u32 {
                                    synced = false;
                                }
                            }
                        }
                    }
                },
                2 => {
                    let count = (word & 0x07FF_FFFF) as usize;
                    if last_op == 1 && last_reg == ConfigRegister::Fdro as u32 {
                        let mut data = vec![0; Self::READBACK_DELAY];
                        let mut memory = self.memory.clone();
                        memory.resize(count * 4, 0);
                        data.extend_from_slice(&memory);
                        self.cfg_readback = data;
                    } else if last_op == 2 {
                        let available = (bits.len() - i) / 32;
                        self.fdri_words += count.min(available);
                        i += 32 * count.min(available);
                    }
                },
                _ => (),
            }
        }
    }
}

/// Simulated adapter implementing `Transport`.
pub struct SimChain {
    devices: Vec<SimDevice>,
    state: State,
    loopback: bool,
    reg: u8,
    output: VecDeque<u8>,
    written: Vec<u8>,
    ir_bits: usize,
    idle_clocks: usize,
    gpio: Vec<(u8, u8, u8)>,
}

impl SimChain {
    pub fn new(devices: Vec<SimDevice>) -> Self {
        SimChain {
            devices,
            state: State::TestLogicReset,
            loopback: false,
            reg: 0,
            output: VecDeque::new(),
            written: Vec::new(),
            ir_bits: 0,
            idle_clocks: 0,
            gpio: Vec::new(),
        }
    }

    /// TDO wired straight to TDI.
    pub fn loopback() -> Self {
        SimChain { loopback: true, ..Self::new(Vec::new()) }
    }

    pub fn devices(&self) -> &[SimDevice] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut Vec<SimDevice> {
        &mut self.devices
    }

    /// Every byte written to the adapter.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    pub fn reset_shift_count(&mut self) {
        self.ir_bits = 0;
    }

    /// Clocks spent in Shift-IR since the last `reset_shift_count()`.
    pub fn ir_bits_shifted(&self) -> usize {
        self.ir_bits
    }

    /// TCK cycles clocked by CLK_BYTES commands.
    pub fn idle_clocks(&self) -> usize {
        self.idle_clocks
    }

    /// GPIO commands as (opcode, value, direction).
    pub fn gpio(&self) -> &[(u8, u8, u8)] {
        &self.gpio
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        if self.loopback {
            return tdi;
        }
        let state = self.state;
        let tdo = match state {
            State::ShiftDr | State::ShiftIr => {
                let mut bit = tdi;
                for device in self.devices.iter_mut().rev() {
                    bit = device.shift(state, bit);
                }
                bit
            },
            _ => true,
        };
        if state == State::ShiftIr {
            self.ir_bits += 1;
        }
        for device in self.devices.iter_mut() {
            match state {
                State::CaptureIr => device.capture_ir(),
                State::CaptureDr => device.capture_dr(),
                _ => (),
            }
        }
        self.state = state.next(tms);
        for device in self.devices.iter_mut() {
            match self.state {
                State::UpdateIr if state != State::UpdateIr => device.update_ir(),
                State::UpdateDr if state != State::UpdateDr => device.update_dr(),
                State::TestLogicReset => device.reset(),
                _ => (),
            }
        }
        tdo
    }

    fn capture(&mut self, tdo: bool) {
        self.reg = (self.reg >> 1) | ((tdo as u8) << 7);
    }

    fn execute(&mut self, data: &[u8]) {
        let mut i = 0;
        while i < data.len() {
            let op = data[i];
            i += 1;
            match op {
                0x4B | 0x6F => {
                    let clocks = data[i] as usize + 1;
                    let operand = data[i + 1];
                    i += 2;
                    let tdi = operand & 0x80 != 0;
                    for bit in 0..clocks {
                        let tdo = self.clock((operand >> bit) & 1 == 1, tdi);
                        if op == 0x6F {
                            self.capture(tdo);
                        }
                    }
                    if op == 0x6F {
                        self.output.push_back(self.reg);
                    }
                },
                0x19 | 0x3D | 0x2C => {
                    let n = u16::from_le_bytes([data[i], data[i + 1]]) as usize + 1;
                    i += 2;
                    let bytes = if op == 0x2C {
                        vec![0; n]
                    } else {
                        let bytes = data[i..i + n].to_vec();
                        i += n;
                        bytes
                    };
                    for byte in bytes {
                        let mut out = 0u8;
                        for bit in 0..8 {
                            let tdo = self.clock(false, (byte >> bit) & 1 == 1);
                            out |= (tdo as u8) << bit;
                        }
                        if op != 0x19 {
                            self.output.push_back(out);
                        }
                    }
                },
                0x1B | 0x3F | 0x2E => {
                    let n = data[i] as usize + 1;
                    let value = if op == 0x2E { 0 } else { data[i + 1] };
                    i += if op == 0x2E { 1 } else { 2 };
                    for bit in 0..n {
                        let tdo = self.clock(false, (value >> bit) & 1 == 1);
                        if op != 0x1B {
                            self.capture(tdo);
                        }
                    }
                    if op != 0x1B {
                        self.output.push_back(self.reg);
                    }
                },
                0x80 | 0x82 => {
                    self.gpio.push((op, data[i], data[i + 1]));
                    i += 2;
                },
                0x86 => i += 2,
                0x8F => {
                    let n = u16::from_le_bytes([data[i], data[i + 1]]) as usize + 1;
                    i += 2;
                    self.idle_clocks += 8 * n;
                },
                0x85 | 0x87 | 0x8A => (),
                bad => {
                    self.output.push_back(0xFA);
                    self.output.push_back(bad);
                },
            }
        }
    }
}

impl Transport for SimChain {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        self.written.extend_from_slice(data);
        self.execute(data);
        Ok(data.len())
    }

    fn read(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        let n = len.min(self.output.len());
        Ok(self.output.drain(..n).collect())
    }
}

#[test]
fn test_sim_reads_idcodes() {
    let mut sim = SimChain::new(vec![SimDevice::xilinx(0x1372_7093), SimDevice::cortex()]);
    // Reset, then to Shift-DR and read 8 bytes.
    sim.write(&[0x4B, 0x04, 0x1F, 0x4B, 0x03, 0x02, 0x2C, 0x07, 0x00]).unwrap();
    let data = sim.read(8).unwrap();
    assert_eq!(&data[..4], &0x1372_7093u32.to_le_bytes());
    assert_eq!(&data[4..], &0x4BA0_0477u32.to_le_bytes());
}

#[test]
fn test_sim_sync_echo() {
    let mut sim = SimChain::loopback();
    sim.write(&[0xAA, 0x87]).unwrap();
    assert_eq!(sim.read(2).unwrap(), vec![0xFA, 0xAA]);
}
