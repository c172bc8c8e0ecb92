//! Bounds checked little endian decoding.
use crate::error::Error;

/// Reads consecutive little endian fields out of a byte slice. Every read
/// is checked against the end of the slice before any byte is touched.
pub struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self { Self { bytes, position: 0 } }

    pub fn position(&self) -> usize { self.position }
    pub fn remaining(&self) -> usize { self.bytes.len() - self.position }

    pub fn take(&mut self, length: usize) -> Result<&'a [u8], Error> {
        let end = self.position.checked_add(length).ok_or(Error::BadImage("field overflow"))?;
        let slice = self.bytes.get(self.position..end).ok_or(Error::BadImage("truncated field"))?;
        self.position = end;
        Ok(slice)
    }

    pub fn skip(&mut self, length: usize) -> Result<(), Error> { self.take(length).map(|_| ()) }

    pub fn read_u8(&mut self) -> Result<u8, Error> { Ok(self.take(1)?[0]) }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
