//! This module contains convenience functions for bit ordering and for
//! manipulating Vec<bool> and &[bool].
//!
//! JTAG shifts every byte least-significant-bit first, while Xilinx
//! configuration words are defined most-significant-bit first, so most of
//! the conversions between the two live here.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Not enough bits to extract required data.")]
    NotEnoughBits,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reverse the bit order of a single byte.
pub fn bitswap(byte: u8) -> u8 {
    byte.reverse_bits()
}

/// Reverse the bit order of every byte in `data`, in place.
pub fn bitswap_all(data: &mut [u8]) {
    for byte in data.iter_mut() {
        *byte = bitswap(*byte);
    }
}

/// Encode a 32-bit word for shifting LSB-first such that the device
/// receives it MSB-first.
///
/// The word's bytes are taken most significant first and each byte
/// has its bit order reversed.
pub fn swapped_word(word: u32) -> [u8; 4] {
    word.reverse_bits().to_le_bytes()
}

/// Decode up to 8 bytes of readback into an integer, with the first
/// byte most significant and every byte bit-reversed.
///
/// This is the inverse of `swapped_word` for 4-byte inputs, and is how
/// Xilinx status values are compared against their documented constants.
pub fn swapped_value(data: &[u8]) -> u64 {
    data.iter().take(8).fold(0, |acc, &b| (acc << 8) | bitswap(b) as u64)
}

/// Convert a slice of u8 to a Vec of bool, least-significant-bit first.
/// Reads exactly `n` bits; returns an error if n>bytes.len()*8.
pub fn bytes_to_bits(bytes: &[u8], mut n: usize) -> Result<Vec<bool>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut bits = Vec::with_capacity(n);
    for byte in bytes {
        for i in 0..8 {
            bits.push((byte >> i) & 1 == 1);
            n -= 1;

            if n == 0 {
                return Ok(bits);
            }
        }
    }
    Err(Error::NotEnoughBits)
}

/// Convenience macro for creating a &[bool] from &[u8] of 0/1.
#[cfg(test)]
macro_rules! bv {
    ($($x:expr),*) => {
        &[ $(($x != 0),)* ] as &[bool]
    }
}

#[test]
fn test_bitswap() {
    assert_eq!(bitswap(0x01), 0x80);
    assert_eq!(bitswap(0xAA), 0x55);
    assert_eq!(bitswap(0x0F), 0xF0);
    assert_eq!(bitswap(0x35), 0xAC);
}

#[test]
fn test_bitswap_involution() {
    for x in 0..=255u8 {
        assert_eq!(bitswap(bitswap(x)), x);
    }
}

#[test]
fn test_swapped_word() {
    // SYNC word, as it must appear on the wire.
    assert_eq!(swapped_word(0xAA99_5566), [0x55, 0x99, 0xAA, 0x66]);
    assert_eq!(swapped_word(0x2000_0000), [0x04, 0x00, 0x00, 0x00]);
}

#[test]
fn test_swapped_value() {
    assert_eq!(swapped_value(&swapped_word(0xFC79_1040)), 0xFC79_1040);
    assert_eq!(swapped_value(&[0x35]), 0xAC);
    assert_eq!(swapped_value(&[]), 0);
}

#[test]
fn test_bytes_to_bits() {
    assert_eq!(bytes_to_bits(&[0xFF], 1).unwrap(), bv![1]);
    assert_eq!(bytes_to_bits(&[0xFF], 8).unwrap(), bv![1, 1, 1, 1, 1, 1, 1, 1]);
    assert_eq!(bytes_to_bits(&[0xFF, 0x01], 10).unwrap(), bv![1, 1, 1, 1, 1, 1, 1, 1, 1, 0]);
    assert!(bytes_to_bits(&[0xFF], 9).is_err());
}
