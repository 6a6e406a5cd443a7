//! Xilinx 7-series configuration packets, per UG470 chapter 5.
//!
//! Packets are built as a list of 32-bit words and only converted to the
//! bit-reversed wire encoding when they are shifted out.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::bitvec;

pub const SYNC_WORD: u32 = 0xAA99_5566;
pub const DUMMY_WORD: u32 = 0xFFFF_FFFF;
pub const NOP_WORD: u32 = 0x2000_0000;

const TYPE1: u32 = 0b001 << 29;
const TYPE2: u32 = 0b010 << 29;
const OPCODE_SHIFT: u32 = 27;
const REGISTER_SHIFT: u32 = 13;
const REGISTER_MASK: u32 = 0x3FFF;
const TYPE1_COUNT_MASK: u32 = 0x7FF;
const TYPE2_COUNT_MASK: u32 = 0x07FF_FFFF;

#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum Opcode {
    Nop = 0,
    Read = 1,
    Write = 2,
}

/// Configuration registers (UG470 table 5-23).
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ConfigRegister {
    Crc = 0x00,
    Far = 0x01,
    Fdri = 0x02,
    Fdro = 0x03,
    Cmd = 0x04,
    Ctl0 = 0x05,
    Mask = 0x06,
    Stat = 0x07,
    Lout = 0x08,
    Cor0 = 0x09,
    Mfwr = 0x0A,
    Cbc = 0x0B,
    Idcode = 0x0C,
    Axss = 0x0D,
    Cor1 = 0x0E,
    Wbstar = 0x10,
    Timer = 0x11,
    Bootsts = 0x16,
    Ctl1 = 0x18,
    Bspi = 0x1F,
}

/// CMD register values (UG470 table 5-24).
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ConfigCommand {
    Null = 0x00,
    Wcfg = 0x01,
    Mfw = 0x02,
    Dghigh = 0x03,
    Rcfg = 0x04,
    Start = 0x05,
    Rcap = 0x06,
    Rcrc = 0x07,
    Aghigh = 0x08,
    Switch = 0x09,
    Grestore = 0x0A,
    Shutdown = 0x0B,
    Gcapture = 0x0C,
    Desync = 0x0D,
    Iprog = 0x0F,
    Crcc = 0x10,
    Ltimer = 0x11,
}

/// Encode a Type 1 packet header.
pub fn type1(op: Opcode, register: u32, count: u32) -> u32 {
    TYPE1
        | (u32::from(op) << OPCODE_SHIFT)
        | ((register & REGISTER_MASK) << REGISTER_SHIFT)
        | (count & TYPE1_COUNT_MASK)
}

/// Encode a Type 2 packet header, which extends the preceding Type 1 packet
/// with a large word count.
pub fn type2(count: u32) -> u32 {
    TYPE2 | (count & TYPE2_COUNT_MASK)
}

/// A sequence of configuration words.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Packets {
    words: Vec<u32>,
}

impl Packets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn word(mut self, word: u32) -> Self {
        self.words.push(word);
        self
    }

    pub fn dummy(self) -> Self {
        self.word(DUMMY_WORD)
    }

    pub fn sync(self) -> Self {
        self.word(SYNC_WORD)
    }

    pub fn nop(self) -> Self {
        self.word(NOP_WORD)
    }

    /// Request `count` words from `register`.
    pub fn read(self, register: ConfigRegister, count: u32) -> Self {
        self.word(type1(Opcode::Read, register.into(), count))
    }

    /// Write `data` to `register`.
    pub fn write(mut self, register: ConfigRegister, data: &[u32]) -> Self {
        self.words.push(type1(Opcode::Write, register.into(), data.len() as u32));
        self.words.extend_from_slice(data);
        self
    }

    /// Write one command to the CMD register.
    pub fn command(self, command: ConfigCommand) -> Self {
        self.write(ConfigRegister::Cmd, &[command.into()])
    }

    pub fn type2(self, count: u32) -> Self {
        self.word(type2(count))
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Wire encoding: each word most significant bit first.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|&w| bitvec::swapped_word(w)).collect()
    }

    /// Register read procedure (UG470 table 6-4), followed by a DESYNC.
    pub fn register_read(register: ConfigRegister) -> Self {
        Packets::new()
            .dummy()
            .sync()
            .nop()
            .read(register, 1)
            .nop()
            .nop()
            .command(ConfigCommand::Desync)
            .nop()
            .nop()
    }

    /// Short STAT read used for status readout.
    pub fn status_read() -> Self {
        Packets::new()
            .dummy()
            .sync()
            .type2(0)
            .read(ConfigRegister::Stat, 1)
            .word(0)
    }

    /// Configuration memory readback of `words` words starting at frame 0.
    pub fn readback(words: u32) -> Self {
        Packets::new()
            .dummy()
            .sync()
            .nop()
            .command(ConfigCommand::Rcfg)
            .write(ConfigRegister::Far, &[0])
            .read(ConfigRegister::Fdro, 0)
            .type2(words)
            .nop()
            .nop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;
    use proptest::prelude::*;

    /// Decoded packet header, following the UG470 field layout bit by bit.
    #[derive(Debug, Eq, PartialEq)]
    enum Header {
        Type1 { op: u32, register: u32, count: u32 },
        Type2 { op: u32, count: u32 },
    }

    fn field(word: u32, hi: u32, lo: u32) -> u32 {
        (lo..=hi).fold(0, |acc, bit| acc | (((word >> bit) & 1) << (bit - lo)))
    }

    fn decode(word: u32) -> Option<Header> {
        match field(word, 31, 29) {
            0b001 => Some(Header::Type1 {
                op: field(word, 28, 27),
                register: field(word, 26, 13),
                count: field(word, 10, 0),
            }),
            0b010 => Some(Header::Type2 { op: field(word, 28, 27), count: field(word, 26, 0) }),
            _ => None,
        }
    }

    #[test]
    fn test_known_words() {
        assert_eq!(type1(Opcode::Nop, 0, 0), NOP_WORD);
        assert_eq!(type1(Opcode::Write, ConfigRegister::Cmd.into(), 1), 0x3000_8001);
        assert_eq!(type1(Opcode::Read, ConfigRegister::Stat.into(), 1), 0x2800_E001);
        assert_eq!(type2(0x000F_6C78), 0x400F_6C78);
    }

    #[test]
    fn test_register_read_sequence() {
        let packets = Packets::register_read(ConfigRegister::Bootsts);
        assert_eq!(packets.words(), &[
            DUMMY_WORD, SYNC_WORD, NOP_WORD, 0x2802_C001, NOP_WORD, NOP_WORD,
            0x3000_8001, 0x0000_000D, NOP_WORD, NOP_WORD,
        ]);
        let bytes = packets.to_bytes();
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[4..8], &[0x55, 0x99, 0xAA, 0x66]);
    }

    #[test]
    fn test_readback_sequence() {
        let packets = Packets::readback(0x1234);
        assert_eq!(packets.len(), 12);
        assert_eq!(packets.words()[3], 0x3000_8001);
        assert_eq!(packets.words()[4], ConfigCommand::Rcfg as u32);
        assert_eq!(packets.words()[7], 0x2800_6000);
        assert_eq!(packets.words()[8], 0x4000_1234);
    }

    #[test]
    fn test_enum_values() {
        assert_eq!(ConfigRegister::try_from(0x16).unwrap(), ConfigRegister::Bootsts);
        assert_eq!(u32::from(ConfigCommand::Desync), 0x0D);
        assert!(ConfigCommand::try_from(0x0E).is_err());
    }

    proptest! {
        #[test]
        fn type1_round_trip(op in 0u32..3, register in 0u32..0x4000, count in 0u32..0x800) {
            let opcode = Opcode::try_from(op).unwrap();
            let word = type1(opcode, register, count);
            prop_assert_eq!(decode(word), Some(Header::Type1 { op, register, count }));
        }

        #[test]
        fn type2_round_trip(count in 0u32..0x0800_0000) {
            prop_assert_eq!(decode(type2(count)), Some(Header::Type2 { op: 0, count }));
        }
    }
}
