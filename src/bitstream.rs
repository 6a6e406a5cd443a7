// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use std::{fs::File, path::Path, io::Read};
use thiserror::Error;
use crate::jtag::IDCODE_VERSION_MASK;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported file format: {0}. Provide a raw .bin bitstream.")]
    UnsupportedFormat(&'static str),
    #[error("Bitstream too short: {0} bytes, no IDCODE present.")]
    TooShort(usize),
    #[error("I/O error")]
    IO(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Byte offset of the IDCODE word in a raw bitstream.
const IDCODE_OFFSET: usize = 0x80;

const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
const ELF_MAGIC: &[u8] = &[0x7F, b'E', b'L', b'F'];

/// Start of the header Vivado writes at the front of a `.bit` file.
const BIT_HEADER: &[u8] = &[0x00, 0x09, 0x0F, 0xF0, 0x0F, 0xF0, 0x0F, 0xF0, 0x0F, 0xF0,
                            0x00, 0x00, 0x01, b'a'];

/// Raw 7-series configuration bitstream in memory.
///
/// Only headerless `.bin` payloads are accepted; the bytes are streamed to
/// the device as-is.
pub struct Bitstream {
    data: Vec<u8>,
    idcode: u32,
}

impl Bitstream {
    /// Open a bitstream from the provided path, or stdin if the path is `-`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut data = Vec::new();
        if path.as_ref() == Path::new("-") {
            std::io::stdin().read_to_end(&mut data)?;
        } else {
            let mut file = File::open(path)?;
            if let Ok(metadata) = file.metadata() {
                data.reserve(metadata.len() as usize);
            }
            file.read_to_end(&mut data)?;
        }
        Self::new(data)
    }

    /// Load a bitstream directly from a `Vec<u8>`.
    ///
    /// Containers which would need unwrapping are rejected.
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.starts_with(GZIP_MAGIC) {
            return Err(Error::UnsupportedFormat("gzip"));
        } else if data.starts_with(ELF_MAGIC) {
            return Err(Error::UnsupportedFormat("ELF"));
        } else if data.starts_with(BIT_HEADER) {
            return Err(Error::UnsupportedFormat(".bit header"));
        }
        let idcode = match data.get(IDCODE_OFFSET..IDCODE_OFFSET + 4) {
            Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]) & IDCODE_VERSION_MASK,
            None => return Err(Error::TooShort(data.len())),
        };
        log::debug!("Loaded {} byte bitstream with IDCODE 0x{:08X}", data.len(), idcode);
        Ok(Self { data, idcode })
    }

    /// Get the underlying bitstream data.
    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// IDCODE embedded in the bitstream, with the version nibble masked off.
    pub fn idcode(&self) -> u32 {
        self.idcode
    }
}

#[cfg(test)]
fn raw(idcode: u32) -> Vec<u8> {
    let mut data = vec![0xFF; 0x100];
    data[IDCODE_OFFSET..IDCODE_OFFSET + 4].copy_from_slice(&idcode.to_be_bytes());
    data
}

#[test]
fn test_idcode() {
    let bitstream = Bitstream::new(raw(0x4362_D093)).unwrap();
    assert_eq!(bitstream.idcode(), 0x0362_D093);
    assert_eq!(bitstream.len(), 0x100);
    assert_eq!(bitstream.data()[IDCODE_OFFSET], 0x43);
}

#[test]
fn test_too_short() {
    assert!(matches!(Bitstream::new(vec![0xFF; 0x83]), Err(Error::TooShort(0x83))));
    assert!(matches!(Bitstream::new(Vec::new()), Err(Error::TooShort(0))));
}

#[test]
fn test_unsupported_formats() {
    let mut gz = raw(0x0362_D093);
    gz[..2].copy_from_slice(GZIP_MAGIC);
    assert!(matches!(Bitstream::new(gz), Err(Error::UnsupportedFormat("gzip"))));

    let mut elf = raw(0x0362_D093);
    elf[..4].copy_from_slice(ELF_MAGIC);
    assert!(matches!(Bitstream::new(elf), Err(Error::UnsupportedFormat("ELF"))));

    let mut bit = BIT_HEADER.to_vec();
    bit.extend(raw(0x0362_D093));
    assert!(matches!(Bitstream::new(bit), Err(Error::UnsupportedFormat(".bit header"))));
}
