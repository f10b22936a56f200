//! Bounds-checked cursor over a borrowed byte slice.
//!
//! Tracks the read location so that [`DemuxError`] variants can report a
//! useful offset, the same role `mpegts-io`'s `SliceReader` plays.

use crate::error::{DemuxError, Result};

/// Simple reader state for extracting data from a `&[u8]` slice.
///
/// Unlike `std::io::Read` for `&[u8]`, this keeps track of the location
/// within the packet for more informative errors.
#[derive(Debug)]
pub struct SliceReader<'a> {
    slice: &'a [u8],
    location: usize,
}

impl<'a> SliceReader<'a> {
    /// Initializes a reader from any byte slice.
    pub fn new(slice: &'a [u8]) -> Self {
        Self { slice, location: 0 }
    }

    /// Creates a fixed `length` sub-reader at the current position, then advances this
    /// reader past it.
    pub fn new_sub_reader(&mut self, length: usize) -> Result<Self> {
        let location = self.location;
        let slice = self.read(length)?;
        Ok(Self { slice, location })
    }

    /// Byte offset of the cursor within the original slice.
    pub fn location(&self) -> usize {
        self.location
    }

    /// Number of bytes remaining in the slice reader.
    pub fn remaining_len(&self) -> usize {
        self.slice.len()
    }

    /// Advances the reader without extracting any data.
    pub fn skip(&mut self, length: usize) -> Result<()> {
        self.read(length).map(|_| ())
    }

    /// Extracts a fixed `length` sub-slice from this reader and advances.
    pub fn read(&mut self, length: usize) -> Result<&'a [u8]> {
        if length > self.slice.len() {
            return Err(DemuxError::PacketOverrun(self.location, length));
        }
        let (left, right) = self.slice.split_at(length);
        self.location += length;
        self.slice = right;
        Ok(left)
    }

    /// Extracts a sub-slice of all data remaining to be read.
    pub fn read_to_end(&mut self) -> &'a [u8] {
        let all = self.slice;
        self.location += all.len();
        self.slice = &[];
        all
    }

    /// Same as [`SliceReader::read`] but also converts the slice to an array reference.
    pub fn read_array_ref<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.read(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array_ref::<1>()?[0])
    }

    /// Reads two bytes, big-endian.
    pub fn read_be_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array_ref::<2>()?))
    }

    /// Reads three bytes, big-endian, into the low 24 bits of a `u32`.
    pub fn read_be_u24(&mut self) -> Result<u32> {
        let b = self.read_array_ref::<3>()?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    /// Reads four bytes, big-endian.
    pub fn read_be_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array_ref::<4>()?))
    }

    /// Reads five bytes, interpreting them as a 33-bit big-endian timestamp
    /// field of the shape used by PTS/DTS/PCR-base: the top bit of the first
    /// byte is a marker, not data.
    pub fn read_be_u33(&mut self) -> Result<u64> {
        let b = self.read_array_ref::<5>()?;
        Ok(u64::from_be_bytes([
            0,
            0,
            0,
            b[0] & 0x1,
            b[1],
            b[2],
            b[3],
            b[4],
        ]))
    }

    /// Extracts a fixed `length` sub-slice without advancing the cursor.
    pub fn peek(&self, length: usize) -> Result<&'a [u8]> {
        if length > self.slice.len() {
            return Err(DemuxError::PacketOverrun(self.location, length));
        }
        Ok(&self.slice[..length])
    }

    /// Same as [`SliceReader::peek`] but returns an array reference.
    pub fn peek_array_ref<const N: usize>(&self) -> Result<[u8; N]> {
        let slice = self.peek(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }
}
