//! Encoding of the FTDI MPSSE command set.
//!
//! Every command is a single opcode byte followed by a fixed-size or
//! length-prefixed operand. Lengths are sent as `len - 1`, 16-bit lengths
//! little-endian. A `Command` bundles those bytes with a description of the
//! response the adapter will send back for it, if any.
//!
//! Builders take lengths that callers have already chunked to the limits
//! below; out-of-range lengths are only checked in debug builds.

use num_enum::IntoPrimitive;

/// Clock data out on the negative TCK edge.
pub const WRITE_NEG: u8 = 0x01;
/// Lengths count bits rather than bytes.
pub const BITMODE: u8 = 0x02;
/// Sample data in on the negative TCK edge.
pub const READ_NEG: u8 = 0x04;
/// Shift least significant bit first.
pub const LSB: u8 = 0x08;
/// Drive TDI.
pub const DO_WRITE: u8 = 0x10;
/// Sample TDO.
pub const DO_READ: u8 = 0x20;
/// Drive TMS instead of TDI.
pub const WRITE_TMS: u8 = 0x40;

/// Flags added to a write opcode to also capture TDO.
pub const READ_FLAGS: u8 = DO_READ | LSB | READ_NEG;

/// Maximum number of clocks in one TMS command.
pub const MAX_TMS_CLOCKS: usize = 7;

/// Maximum number of bytes in one byte-shift command.
pub const MAX_BYTES_PER_COMMAND: usize = 65536;

#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum Opcode {
    TmsWrite            = WRITE_TMS | LSB | WRITE_NEG | BITMODE,
    TmsReadWrite        = WRITE_TMS | LSB | WRITE_NEG | BITMODE | READ_FLAGS,
    DataBytesWrite      = DO_WRITE | LSB | WRITE_NEG,
    DataBytesReadWrite  = DO_WRITE | LSB | WRITE_NEG | READ_FLAGS,
    DataBytesRead       = READ_FLAGS,
    DataBitsWrite       = DO_WRITE | LSB | WRITE_NEG | BITMODE,
    DataBitsReadWrite   = DO_WRITE | LSB | WRITE_NEG | BITMODE | READ_FLAGS,
    DataBitsRead        = READ_FLAGS | BITMODE,
    SetBitsLow          = 0x80,
    SetBitsHigh         = 0x82,
    LoopbackOff         = 0x85,
    ClockDivisor        = 0x86,
    SendImmediate       = 0x87,
    DisableDiv5         = 0x8A,
    ClockBytes          = 0x8F,
}

/// Shape of the adapter's reply to one queued command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Response {
    /// `n` whole bytes.
    Bytes(usize),
    /// `n` bits (1 to 8), returned as one byte with the captured bits in
    /// its most significant positions.
    Bits(u8),
}

impl Response {
    /// Number of bytes the adapter sends for this response.
    pub fn raw_len(&self) -> usize {
        match self {
            Response::Bytes(n) => *n,
            Response::Bits(_) => 1,
        }
    }
}

/// One encoded adapter command plus its expected response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Command {
    bytes: Vec<u8>,
    response: Option<Response>,
}

impl Command {
    fn new(opcode: Opcode) -> Self {
        Command { bytes: vec![opcode.into()], response: None }
    }

    fn push_u8(mut self, value: u8) -> Self {
        self.bytes.push(value);
        self
    }

    fn push_u16(mut self, value: u16) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn expect(mut self, response: Response) -> Self {
        self.response = Some(response);
        self
    }

    /// Clock `clocks` TMS bits from `tms` (LSB first) while holding TDI at `tdi`.
    ///
    /// If `read` is set, TDO is sampled on every clock and one byte is returned.
    pub fn tms(clocks: usize, tms: u8, tdi: bool, read: bool) -> Self {
        debug_assert!(clocks >= 1 && clocks <= MAX_TMS_CLOCKS);
        let opcode = if read { Opcode::TmsReadWrite } else { Opcode::TmsWrite };
        let operand = (tms & 0x7F) | ((tdi as u8) << 7);
        let cmd = Command::new(opcode).push_u8(clocks as u8 - 1).push_u8(operand);
        if read {
            cmd.expect(Response::Bits(clocks as u8))
        } else {
            cmd
        }
    }

    /// Shift up to 8 bits of `value` out on TDI, LSB first.
    pub fn bits(read: bool, nbits: u8, value: u8) -> Self {
        debug_assert!(nbits >= 1 && nbits <= 8);
        let opcode = if read { Opcode::DataBitsReadWrite } else { Opcode::DataBitsWrite };
        let cmd = Command::new(opcode).push_u8(nbits - 1).push_u8(value);
        if read {
            cmd.expect(Response::Bits(nbits))
        } else {
            cmd
        }
    }

    /// Capture `nbits` bits of TDO without driving TDI.
    pub fn read_bits(nbits: u8) -> Self {
        debug_assert!(nbits >= 1 && nbits <= 8);
        Command::new(Opcode::DataBitsRead).push_u8(nbits - 1).expect(Response::Bits(nbits))
    }

    /// Shift whole bytes out on TDI, each LSB first.
    pub fn bytes(read: bool, data: &[u8]) -> Self {
        debug_assert!(!data.is_empty() && data.len() <= MAX_BYTES_PER_COMMAND);
        let opcode = if read { Opcode::DataBytesReadWrite } else { Opcode::DataBytesWrite };
        let mut cmd = Command::new(opcode).push_u16((data.len() - 1) as u16);
        cmd.bytes.extend_from_slice(data);
        if read {
            cmd.expect(Response::Bytes(data.len()))
        } else {
            cmd
        }
    }

    /// Capture `n` whole bytes of TDO without driving TDI.
    pub fn read_bytes(n: usize) -> Self {
        debug_assert!(n >= 1 && n <= MAX_BYTES_PER_COMMAND);
        Command::new(Opcode::DataBytesRead).push_u16((n - 1) as u16).expect(Response::Bytes(n))
    }

    /// Set the low GPIO byte to `value` with direction mask `direction`.
    pub fn set_bits_low(value: u8, direction: u8) -> Self {
        Command::new(Opcode::SetBitsLow).push_u8(value).push_u8(direction)
    }

    /// Set the high GPIO byte to `value` with direction mask `direction`.
    pub fn set_bits_high(value: u8, direction: u8) -> Self {
        Command::new(Opcode::SetBitsHigh).push_u8(value).push_u8(direction)
    }

    /// Set the TCK divisor, giving TCK = 30MHz / (divisor + 1).
    pub fn clock_divisor(divisor: u16) -> Self {
        Command::new(Opcode::ClockDivisor).push_u16(divisor)
    }

    /// Toggle TCK for `n` bytes worth of clocks (8n cycles), no data transferred.
    pub fn clock_bytes(n: usize) -> Self {
        debug_assert!(n >= 1 && n <= MAX_BYTES_PER_COMMAND);
        Command::new(Opcode::ClockBytes).push_u16((n - 1) as u16)
    }

    pub fn loopback_off() -> Self {
        Command::new(Opcode::LoopbackOff)
    }

    pub fn disable_div5() -> Self {
        Command::new(Opcode::DisableDiv5)
    }

    pub fn send_immediate() -> Self {
        Command::new(Opcode::SendImmediate)
    }

    /// Encoded command bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Response the adapter sends for this command, if any.
    pub fn response(&self) -> Option<Response> {
        self.response
    }
}
