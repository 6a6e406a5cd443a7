//! Outbound command buffering and response de-interleaving.
//!
//! Commands are queued into a single bounded buffer together with a queue
//! describing the reply each one produces. `flush()` sends the whole buffer
//! in one write, performs at most one read, and unpacks bit-granularity
//! replies into byte-aligned results.

use crate::mpsse::{Command, Response};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Command buffer overflow: {queued} bytes queued, capacity is {capacity} bytes.")]
    Overflow { queued: usize, capacity: usize },
    #[error("Short write to adapter: wrote {written} of {expected} bytes.")]
    ShortWrite { written: usize, expected: usize },

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Capacity of the outbound command buffer in bytes.
pub const BUFFER_CAPACITY: usize = 4096;

/// Trait for byte-stream connections to an MPSSE adapter.
///
/// `write()` must send all of `data` as one transfer and return how many
/// bytes were accepted. `read()` returns up to `len` bytes of adapter
/// reply with any USB status bytes already removed; returning fewer bytes
/// than requested indicates the adapter did not answer in time.
pub trait Transport {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<usize>;
    fn read(&mut self, len: usize) -> anyhow::Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        (**self).write(data)
    }

    fn read(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        (**self).read(len)
    }
}

/// Bounded command buffer in front of a `Transport`.
pub struct CommandBuffer<T> {
    transport: T,
    buffer: Vec<u8>,
    pending: Vec<Response>,
    capacity: usize,
}

impl<T: Transport> CommandBuffer<T> {
    pub fn new(transport: T) -> Self {
        Self::with_capacity(transport, BUFFER_CAPACITY)
    }

    pub fn with_capacity(transport: T, capacity: usize) -> Self {
        CommandBuffer {
            transport,
            buffer: Vec::with_capacity(capacity),
            pending: Vec::new(),
            capacity,
        }
    }

    /// Queue command bytes which produce no reply.
    pub fn enqueue(&mut self, bytes: &[u8]) -> Result<()> {
        // Leave room for the SEND_IMMEDIATE appended by flush().
        let queued = self.buffer.len() + bytes.len() + 1;
        if queued > self.capacity {
            log::error!("Command buffer overflow: {} > {}", queued, self.capacity);
            return Err(Error::Overflow { queued, capacity: self.capacity });
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Queue command bytes whose reply is described by `response`.
    pub fn enqueue_with_response(&mut self, bytes: &[u8], response: Response) -> Result<()> {
        self.enqueue(bytes)?;
        self.pending.push(response);
        Ok(())
    }

    /// Queue an encoded `Command`.
    pub fn push(&mut self, command: &Command) -> Result<()> {
        match command.response() {
            Some(response) => self.enqueue_with_response(command.as_bytes(), response),
            None => self.enqueue(command.as_bytes()),
        }
    }

    /// Number of bytes currently queued.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of raw reply bytes the queued commands will produce.
    pub fn expected_read_len(&self) -> usize {
        self.pending.iter().map(Response::raw_len).sum()
    }

    /// Send everything queued, read back any replies, and return the
    /// de-interleaved reply data (empty if no replies were pending).
    pub fn flush(&mut self) -> Result<Vec<u8>> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }
        let expected = self.expected_read_len();
        if expected > 0 {
            self.buffer.push(Command::send_immediate().as_bytes()[0]);
        }

        log::trace!("TX: {:02X?}", self.buffer);
        let written = self.transport.write(&self.buffer)?;
        let sent = self.buffer.len();
        self.buffer.clear();
        let pending = std::mem::take(&mut self.pending);
        if written != sent {
            return Err(Error::ShortWrite { written, expected: sent });
        }
        if expected == 0 {
            return Ok(Vec::new());
        }

        let raw = self.transport.read(expected)?;
        log::trace!("RX: {:02X?}", raw);
        Ok(deinterleave(&pending, &raw))
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the buffer, discarding anything not yet flushed.
    pub fn into_inner(self) -> T {
        self.transport
    }
}

/// Unpack raw adapter reply bytes according to the queued response descriptors.
///
/// Whole-byte replies are copied through. Bit replies arrive with the
/// captured bits in the top of a byte; consecutive bit replies are merged
/// into a single byte, and the result is shifted down so the captured bits
/// are right-aligned.
pub fn deinterleave(pending: &[Response], raw: &[u8]) -> Vec<u8> {
    let expected: usize = pending.iter().map(Response::raw_len).sum();
    let mut raw = raw.to_vec();
    if raw.len() != expected {
        log::warn!("Adapter returned {} bytes, expected {}", raw.len(), expected);
        raw.resize(expected, 0);
    }

    let mut out = Vec::with_capacity(expected);
    let mut raw = raw.into_iter();
    let mut validbits = 0u8;
    let mut previous_bits = false;
    for response in pending {
        match *response {
            Response::Bytes(n) => {
                out.extend(raw.by_ref().take(n));
                validbits = 0;
                previous_bits = false;
            },
            Response::Bits(n) => {
                let byte = raw.next().unwrap_or(0);
                validbits += n;
                if validbits > 8 {
                    log::warn!("Bit response overflows one byte ({} bits), clamping", validbits);
                    validbits = 8;
                }
                let mask = (0xFFu16 << (8 - validbits)) as u8;
                let value = (byte & mask) >> (8 - validbits);
                match out.last_mut() {
                    Some(last) if previous_bits => *last = value,
                    _ => out.push(value),
                }
                previous_bits = true;
            },
        }
    }
    out
}
