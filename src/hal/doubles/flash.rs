use super::error::FakeError;
use crate::hal::flash::{self, Region};

/// RAM backed NOR flash emulation.
///
/// Enforces what a real part would: writes must be aligned to the write
/// size and may only program erased cells, erases must cover whole
/// sectors. Mutating operations are counted so tests can inject a power
/// loss at any point of a longer sequence.
#[derive(Clone)]
pub struct FakeFlash {
    data: Vec<u8>,
    sectors: Vec<Region>,
    write_size: usize,
    erased_value: u8,
    operations: usize,
    power_loss_at: Option<usize>,
    powered: bool,
}

impl FakeFlash {
    /// Builds a device from an ordered list of sector sizes.
    pub fn new(sector_sizes: &[u32]) -> Self {
        let mut start = 0u32;
        let sectors = sector_sizes
            .iter()
            .map(|&size| {
                let region = Region { start, size };
                start += size;
                region
            })
            .collect();
        FakeFlash {
            data: vec![0xFF; start as usize],
            sectors,
            write_size: 8,
            erased_value: 0xFF,
            operations: 0,
            power_loss_at: None,
            powered: true,
        }
    }

    pub fn uniform(count: usize, sector_size: u32) -> Self {
        Self::new(&vec![sector_size; count])
    }

    pub fn with_write_size(mut self, write_size: usize) -> Self {
        self.write_size = write_size;
        self
    }

    pub fn with_erased_value(mut self, erased_value: u8) -> Self {
        self.erased_value = erased_value;
        self.data.iter_mut().for_each(|b| *b = erased_value);
        self
    }

    /// Number of writes and erases that reached the array so far.
    pub fn operations(&self) -> usize { self.operations }

    /// The `n`th mutating operation from now (1-based) and every later one fail.
    pub fn lose_power_after(&mut self, n: usize) { self.power_loss_at = Some(self.operations + n) }

    pub fn power_cycle(&mut self) {
        self.power_loss_at = None;
        self.powered = true;
    }

    pub fn contents(&self) -> &[u8] { &self.data }

    /// Places bytes without any programming rules, the way a debugger or
    /// the application's download path would.
    pub fn load(&mut self, offset: u32, bytes: &[u8]) {
        let start = offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn check_power(&mut self) -> Result<(), FakeError> {
        if !self.powered {
            return Err(FakeError::PowerLoss);
        }
        if self.power_loss_at.map_or(false, |n| self.operations + 1 >= n) {
            self.powered = false;
            return Err(FakeError::PowerLoss);
        }
        Ok(())
    }

    fn range(&self, offset: u32, length: usize) -> Result<core::ops::Range<usize>, FakeError> {
        let start = offset as usize;
        let end = start.checked_add(length).ok_or(FakeError::OutOfBounds)?;
        if end > self.data.len() {
            return Err(FakeError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl flash::Read for FakeFlash {
    type Error = FakeError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> nb::Result<(), Self::Error> {
        if !self.powered {
            return Err(nb::Error::Other(FakeError::PowerLoss));
        }
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[range]);
        Ok(())
    }
}

impl flash::Write for FakeFlash {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> nb::Result<(), Self::Error> {
        if !self.powered {
            return Err(nb::Error::Other(FakeError::PowerLoss));
        }
        let range = self.range(offset, bytes.len())?;
        if offset as usize % self.write_size != 0 || bytes.len() % self.write_size != 0 {
            return Err(nb::Error::Other(FakeError::Misaligned));
        }
        if self.data[range.clone()].iter().any(|b| *b != self.erased_value) {
            return Err(nb::Error::Other(FakeError::NotErased));
        }
        self.check_power()?;
        self.data[range].copy_from_slice(bytes);
        self.operations += 1;
        Ok(())
    }
}

impl flash::Erase for FakeFlash {
    fn erase(&mut self, offset: u32, length: u32) -> nb::Result<(), Self::Error> {
        if !self.powered {
            return Err(nb::Error::Other(FakeError::PowerLoss));
        }
        let range = self.range(offset, length as usize)?;
        let end = offset + length;
        let aligned_start = self.sectors.iter().any(|s| s.start == offset);
        let aligned_end = self.sectors.iter().any(|s| s.end() == end);
        if !aligned_start || !aligned_end {
            return Err(nb::Error::Other(FakeError::Misaligned));
        }
        self.check_power()?;
        let erased_value = self.erased_value;
        self.data[range].iter_mut().for_each(|b| *b = erased_value);
        self.operations += 1;
        Ok(())
    }
}

impl flash::Geometry for FakeFlash {
    fn size(&self) -> u32 { self.data.len() as u32 }
    fn write_size(&self) -> usize { self.write_size }
    fn erased_value(&self) -> u8 { self.erased_value }
    fn sector_at(&self, offset: u32) -> Option<Region> {
        self.sectors.iter().copied().find(|s| s.contains(offset))
    }
}
