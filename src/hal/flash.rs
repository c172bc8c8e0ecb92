//! Flash device interfaces.
//!
//! Offsets are byte offsets from the start of the device. Drivers are
//! raw: writes do not erase first, and the caller is responsible for
//! only programming erased cells with chunks that respect the device's
//! write granularity.
use core::fmt;

/// Physical sector (smallest erasable unit) of a flash device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub start: u32,
    pub size: u32,
}

impl Region {
    pub fn end(&self) -> u32 { self.start + self.size }
    pub fn contains(&self, offset: u32) -> bool { offset >= self.start && offset < self.end() }
}

/// Reads a range of bytes.
pub trait Read {
    type Error: Clone + Copy + fmt::Debug;
    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> nb::Result<(), Self::Error>;
}

/// Programs a range of previously erased bytes.
pub trait Write: Read {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> nb::Result<(), Self::Error>;
}

/// Erases every sector in a sector aligned range.
pub trait Erase: Read {
    fn erase(&mut self, offset: u32, length: u32) -> nb::Result<(), Self::Error>;
}

/// Static properties of the device, queried rather than assumed.
pub trait Geometry {
    /// Total size in bytes.
    fn size(&self) -> u32;
    /// Minimum write granularity in bytes.
    fn write_size(&self) -> usize;
    /// Byte pattern read back from erased cells.
    fn erased_value(&self) -> u8;
    /// Sector containing `offset`, if any.
    fn sector_at(&self, offset: u32) -> Option<Region>;
}

/// A device the boot core can drive.
pub trait ReadWrite: Read + Write + Erase + Geometry {}
impl<F> ReadWrite for F where F: Read + Write + Erase + Geometry {}
