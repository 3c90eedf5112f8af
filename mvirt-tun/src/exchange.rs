//! Exchange buffer framing
//!
//! Packets travel between the adapter and its consumer packed into flat
//! exchange buffers. Every packet occupies one record:
//!
//! ```text
//! +----------------+------------------+-----------+
//! | header (16 B)  | packet data      | padding   |
//! | u32 LE length  | `length` bytes   | to 16 B   |
//! | + 12 reserved  |                  |           |
//! +----------------+------------------+-----------+
//! ```
//!
//! The constants below are fixed protocol values shared with the consumer;
//! nothing here is negotiated.

use crate::error::FrameError;

/// Maximum number of records in a single exchange buffer
pub const EXCH_MAX_PACKETS: usize = 256;

/// Maximum size of one record (header + data)
pub const EXCH_MAX_PACKET_SIZE: usize = 0xF000;

/// Record alignment in exchange buffers
pub const EXCH_ALIGNMENT: usize = 16;

/// Size of the record header. Packet data starts at the first aligned offset.
pub const PACKET_HEADER_SIZE: usize = 16;

/// Maximum IP packet size (headers + payload)
pub const MAX_IP_PACKET_SIZE: usize = EXCH_MAX_PACKET_SIZE - PACKET_HEADER_SIZE;

/// Maximum size of a read or write exchange buffer
pub const EXCH_MAX_BUFFER_SIZE: usize = EXCH_MAX_PACKETS * EXCH_MAX_PACKET_SIZE;

/// Minimum size of a read exchange buffer (one maximum-sized record)
pub const EXCH_MIN_BUFFER_SIZE_READ: usize = EXCH_MAX_PACKET_SIZE;

/// Minimum size of a write exchange buffer
pub const EXCH_MIN_BUFFER_SIZE_WRITE: usize = PACKET_HEADER_SIZE;

/// Round `size` up to the exchange alignment.
#[inline]
pub const fn packet_align(size: usize) -> usize {
    (size + (EXCH_ALIGNMENT - 1)) & !(EXCH_ALIGNMENT - 1)
}

/// Number of buffer bytes a packet of `len` bytes occupies, padding included.
#[inline]
pub const fn record_size(len: usize) -> usize {
    packet_align(PACKET_HEADER_SIZE + len)
}

/// Write one record at the start of `dst`.
///
/// Returns the number of bytes consumed (always a multiple of the alignment).
/// Padding bytes are zeroed so no stale buffer content leaks to the consumer.
pub fn write_record(dst: &mut [u8], data: &[u8]) -> Result<usize, FrameError> {
    if data.len() > MAX_IP_PACKET_SIZE {
        return Err(FrameError::PacketTooLarge(data.len()));
    }
    let size = record_size(data.len());
    if dst.len() < size {
        return Err(FrameError::WontFit {
            needed: size,
            available: dst.len(),
        });
    }

    let record = &mut dst[..size];
    record[..4].copy_from_slice(&(data.len() as u32).to_le_bytes());
    record[4..PACKET_HEADER_SIZE].fill(0);
    record[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + data.len()].copy_from_slice(data);
    record[PACKET_HEADER_SIZE + data.len()..].fill(0);
    Ok(size)
}

/// Iterator over the records of an exchange buffer.
///
/// Yields packet data slices borrowed from the buffer. Iteration stops at the
/// end of the buffer or at the first record that cannot be framed; in the
/// latter case a single `Err` is yielded and the iterator is fused.
///
/// The record count is not capped here. [`EXCH_MAX_PACKETS`] bounds what the
/// adapter packs into a read buffer; a write buffer is framed only by its
/// size.
pub struct Records<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Records<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            failed: false,
        }
    }

    /// Bytes consumed by the records yielded so far
    pub fn consumed(&self) -> usize {
        self.offset
    }

    fn fail(&mut self, err: FrameError) -> Option<Result<&'a [u8], FrameError>> {
        self.failed = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<&'a [u8], FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buf.len() {
            return None;
        }

        let remaining = &self.buf[self.offset..];
        if remaining.len() < PACKET_HEADER_SIZE {
            return self.fail(FrameError::Truncated {
                offset: self.offset,
                needed: PACKET_HEADER_SIZE,
                available: remaining.len(),
            });
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&remaining[..4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_IP_PACKET_SIZE {
            return self.fail(FrameError::PacketTooLarge(len));
        }

        // Padding counts, the final record included.
        let size = record_size(len);
        if remaining.len() < size {
            return self.fail(FrameError::Truncated {
                offset: self.offset,
                needed: size,
                available: remaining.len(),
            });
        }

        let data = &remaining[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + len];
        self.offset += size;
        Some(Ok(data))
    }
}

/// Builder for exchange buffers on the consumer side.
///
/// Used by consumers to prepare write buffers, and by the bridge and tests.
#[derive(Debug, Default, Clone)]
pub struct ExchangeBuilder {
    buf: Vec<u8>,
    count: usize,
}

impl ExchangeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet record.
    pub fn push(&mut self, data: &[u8]) -> Result<&mut Self, FrameError> {
        if self.count >= EXCH_MAX_PACKETS {
            return Err(FrameError::TooManyPackets);
        }
        let size = record_size(data.len());
        if self.buf.len() + size > EXCH_MAX_BUFFER_SIZE {
            return Err(FrameError::WontFit {
                needed: size,
                available: EXCH_MAX_BUFFER_SIZE - self.buf.len(),
            });
        }
        let start = self.buf.len();
        self.buf.resize(start + size, 0);
        write_record(&mut self.buf[start..], data)?;
        self.count += 1;
        Ok(self)
    }

    /// Number of records in the buffer
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
