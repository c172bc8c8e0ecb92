//! RAM the boot core may copy images into before running them.
//!
//! Board code hands a [`LoadRegion`] to the RAM loading policy. While an
//! image is being checked, the part of the region it occupies is driven
//! through the flash interfaces as a [`RamWindow`], so the validator reads
//! the copy exactly the way it reads a slot.
use crate::hal::flash::{self, Region};
use core::ops::Range;

/// Executable RAM, addressed the way the images' load addresses are.
pub struct LoadRegion<'r> {
    start: u32,
    memory: &'r mut [u8],
}

impl<'r> LoadRegion<'r> {
    /// `memory` is mapped at bus address `start`.
    pub fn new(start: u32, memory: &'r mut [u8]) -> Self { Self { start, memory } }

    pub fn start(&self) -> u32 { self.start }
    pub fn size(&self) -> u32 { self.memory.len() as u32 }

    /// Indices of `[address, address + length)` within the region, if the
    /// whole range lies inside it.
    pub fn window(&self, address: u32, length: u32) -> Option<Range<usize>> {
        let offset = address.checked_sub(self.start)?;
        let end = offset.checked_add(length)?;
        (end <= self.size()).then_some(offset as usize..end as usize)
    }

    pub fn memory(&mut self) -> &mut [u8] { &mut self.memory[..] }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RamError {
    OutOfBounds,
}

/// A slice of RAM posing as a single sector device. Erasing fills zeros.
pub struct RamWindow<'a>(pub &'a mut [u8]);

impl RamWindow<'_> {
    fn range(&self, offset: u32, length: usize) -> Result<Range<usize>, RamError> {
        let start = offset as usize;
        let end = start.checked_add(length).ok_or(RamError::OutOfBounds)?;
        if end > self.0.len() {
            return Err(RamError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl flash::Read for RamWindow<'_> {
    type Error = RamError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> nb::Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.0[range]);
        Ok(())
    }
}

impl flash::Write for RamWindow<'_> {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> nb::Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        self.0[range].copy_from_slice(bytes);
        Ok(())
    }
}

impl flash::Erase for RamWindow<'_> {
    fn erase(&mut self, offset: u32, length: u32) -> nb::Result<(), Self::Error> {
        let range = self.range(offset, length as usize)?;
        self.0[range].iter_mut().for_each(|b| *b = 0);
        Ok(())
    }
}

impl flash::Geometry for RamWindow<'_> {
    fn size(&self) -> u32 { self.0.len() as u32 }
    fn write_size(&self) -> usize { 1 }
    fn erased_value(&self) -> u8 { 0 }
    fn sector_at(&self, offset: u32) -> Option<Region> {
        ((offset as usize) < self.0.len()).then_some(Region { start: 0, size: self.0.len() as u32 })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hal::flash::{Erase, Read, Write};
    use nb::block;

    #[test]
    fn windows_must_lie_inside_the_region() {
        let mut memory = [0u8; 0x100];
        let region = LoadRegion::new(0x2000_0000, &mut memory);

        assert_eq!(region.window(0x2000_0010, 0x20), Some(0x10..0x30));
        assert_eq!(region.window(0x2000_00F0, 0x10), Some(0xF0..0x100));
        assert_eq!(region.window(0x2000_00F0, 0x11), None);
        assert_eq!(region.window(0x1FFF_FFF0, 0x20), None);
        assert_eq!(region.window(u32::MAX, 2), None);
    }

    #[test]
    fn a_window_reads_back_what_was_written_and_erases_to_zero() {
        // Given
        let mut memory = [0xAAu8; 16];
        let mut window = RamWindow(&mut memory[4..12]);

        // When
        block!(window.write(2, &[1, 2, 3])).unwrap();
        let mut bytes = [0u8; 4];
        block!(window.read(1, &mut bytes)).unwrap();

        // Then
        assert_eq!(bytes, [0xAA, 1, 2, 3]);
        assert_eq!(block!(window.read(6, &mut bytes)), Err(RamError::OutOfBounds));
        block!(window.erase(0, 8)).unwrap();
        assert_eq!(memory, [0xAA, 0xAA, 0xAA, 0xAA, 0, 0, 0, 0, 0, 0, 0, 0, 0xAA, 0xAA, 0xAA, 0xAA]);
    }
}
