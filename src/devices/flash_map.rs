//! Logical flash areas.
//!
//! The flash map is a static table translating logical ids (the primary
//! and secondary slot of each image, the scratch area, the counter store)
//! into a region of a physical device. Opening an area walks the device's
//! sector map once, and every later access is bounds checked against the
//! area before any device call is issued.
use crate::{
    error::Error,
    hal::flash::{Erase, Geometry, Read, ReadWrite, Write},
    logging::error,
    utilities::memory::is_erased,
};
use heapless::Vec;
use nb::block;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Upper bound on sectors per area, which also bounds the swap status log.
pub const MAX_IMG_SECTORS: usize = 128;
pub const MAX_AREAS: usize = 16;
pub const MAX_IMAGES: u8 = 4;

pub type DeviceId = u8;

/// One of the two slots every image owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Slot {
    Primary,
    Secondary,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::Primary, Slot::Secondary];

    pub fn index(self) -> usize {
        match self {
            Slot::Primary => 0,
            Slot::Secondary => 1,
        }
    }

    pub fn from_index(index: usize) -> Result<Self, Error> {
        match index {
            0 => Ok(Slot::Primary),
            1 => Ok(Slot::Secondary),
            _ => Err(Error::BadArgs("slot index out of range")),
        }
    }

    pub fn other(self) -> Self {
        match self {
            Slot::Primary => Slot::Secondary,
            Slot::Secondary => Slot::Primary,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Slot::Primary => "primary",
            Slot::Secondary => "secondary",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AreaId {
    Bootloader,
    Primary(u8),
    Secondary(u8),
    Scratch,
    SecurityCounters,
}

impl AreaId {
    pub fn for_slot(image_index: u8, slot: Slot) -> Self {
        match slot {
            Slot::Primary => AreaId::Primary(image_index),
            Slot::Secondary => AreaId::Secondary(image_index),
        }
    }
}

/// Static description of one area: where it lives, not what it contains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AreaDescriptor {
    pub id: AreaId,
    pub device: DeviceId,
    pub offset: u32,
    pub size: u32,
}

/// Access to every flash device the map refers to, by id.
pub trait FlashDevices {
    type Device: ReadWrite;
    fn device(&mut self, id: DeviceId) -> Option<&mut Self::Device>;
}

impl<F: ReadWrite, const N: usize> FlashDevices for [F; N] {
    type Device = F;
    fn device(&mut self, id: DeviceId) -> Option<&mut F> { self.get_mut(id as usize) }
}

#[derive(Clone, Debug)]
pub struct FlashMap {
    areas: Vec<AreaDescriptor, MAX_AREAS>,
    image_count: u8,
}

impl FlashMap {
    pub fn new(areas: &[AreaDescriptor], image_count: u8) -> Result<Self, Error> {
        if image_count == 0 || image_count > MAX_IMAGES {
            return Err(Error::BadArgs("unsupported image count"));
        }
        let mut table = Vec::new();
        for (index, area) in areas.iter().enumerate() {
            if area.size == 0 {
                return Err(Error::BadArgs("empty flash area"));
            }
            if areas[..index].iter().any(|a| a.id == area.id) {
                return Err(Error::BadArgs("flash area defined twice"));
            }
            if area.offset.checked_add(area.size).is_none() {
                return Err(Error::BadArgs("flash area wraps around"));
            }
            table.push(*area).map_err(|_| Error::BadArgs("too many flash areas"))?;
        }
        Ok(Self { areas: table, image_count })
    }

    pub fn image_count(&self) -> u8 { self.image_count }

    pub fn descriptor(&self, id: AreaId) -> Result<&AreaDescriptor, Error> {
        self.areas.iter().find(|a| a.id == id).ok_or(Error::AreaNotFound)
    }

    /// Resolves an `(image, slot)` pair coming from untrusted indices.
    pub fn slot_area(&self, image_index: u8, slot_index: usize) -> Result<AreaId, Error> {
        if image_index >= self.image_count {
            return Err(Error::BadArgs("image index out of range"));
        }
        Ok(AreaId::for_slot(image_index, Slot::from_index(slot_index)?))
    }

    pub fn contains(&self, id: AreaId) -> bool { self.areas.iter().any(|a| a.id == id) }

    /// Opens an area, discovering its sectors from the backing device.
    pub fn open<D: FlashDevices>(&self, devices: &mut D, id: AreaId) -> Result<FlashArea, Error> {
        let descriptor = *self.descriptor(id)?;
        let device =
            devices.device(descriptor.device).ok_or(Error::BadArgs("flash device missing"))?;
        let end = descriptor.offset + descriptor.size;
        if end > device.size() {
            return Err(Error::BadArgs("flash area exceeds its device"));
        }

        let mut sectors = Vec::new();
        let mut offset = descriptor.offset;
        while offset < end {
            let region = device
                .sector_at(offset)
                .ok_or(Error::BadArgs("flash area outside the sector map"))?;
            if region.start != offset || region.end() > end {
                return Err(Error::BadArgs("flash area not sector aligned"));
            }
            sectors
                .push(Sector { offset: offset - descriptor.offset, size: region.size })
                .map_err(|_| Error::BadArgs("too many sectors in flash area"))?;
            offset = region.end();
        }

        Ok(FlashArea {
            id,
            device: descriptor.device,
            offset: descriptor.offset,
            size: descriptor.size,
            write_size: device.write_size(),
            erased_value: device.erased_value(),
            sectors,
        })
    }
}

/// Sector of an open area, with its offset relative to the area start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sector {
    pub offset: u32,
    pub size: u32,
}

impl Sector {
    pub fn end(&self) -> u32 { self.offset + self.size }
}

/// An open flash area. Offsets passed to its methods are relative to the
/// start of the area.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashArea {
    id: AreaId,
    device: DeviceId,
    offset: u32,
    size: u32,
    write_size: usize,
    erased_value: u8,
    sectors: Vec<Sector, MAX_IMG_SECTORS>,
}

impl FlashArea {
    pub fn id(&self) -> AreaId { self.id }
    pub fn device_id(&self) -> DeviceId { self.device }
    /// Offset of the area within its device.
    pub fn offset(&self) -> u32 { self.offset }
    pub fn size(&self) -> u32 { self.size }
    /// Minimum write granularity of the backing device.
    pub fn align(&self) -> usize { self.write_size }
    pub fn erased_value(&self) -> u8 { self.erased_value }
    pub fn sectors(&self) -> &[Sector] { &self.sectors }
    pub fn sector_count(&self) -> usize { self.sectors.len() }

    pub fn sector(&self, index: usize) -> Result<Sector, Error> {
        self.sectors.get(index).copied().ok_or(Error::BadArgs("sector index out of range"))
    }

    pub fn is_erased(&self, bytes: &[u8]) -> bool { is_erased(bytes, self.erased_value) }

    fn check_bounds(&self, offset: u32, length: usize) -> Result<(), Error> {
        let end = offset as u64 + length as u64;
        if end > self.size as u64 {
            return Err(Error::OutOfBounds);
        }
        Ok(())
    }

    pub fn read<D: FlashDevices>(
        &self,
        devices: &mut D,
        offset: u32,
        bytes: &mut [u8],
    ) -> Result<(), Error> {
        self.check_bounds(offset, bytes.len())?;
        let device = devices.device(self.device).ok_or(Error::AreaNotFound)?;
        block!(device.read(self.offset + offset, bytes)).map_err(|_| {
            error!("Flash read failed at offset {}", self.offset + offset);
            Error::FlashIo("read failed")
        })
    }

    /// Programs erased cells. Both `offset` and the length must be
    /// multiples of the device write size.
    pub fn write<D: FlashDevices>(
        &self,
        devices: &mut D,
        offset: u32,
        bytes: &[u8],
    ) -> Result<(), Error> {
        self.check_bounds(offset, bytes.len())?;
        if offset as usize % self.write_size != 0 || bytes.len() % self.write_size != 0 {
            return Err(Error::Misaligned);
        }
        let device = devices.device(self.device).ok_or(Error::AreaNotFound)?;
        block!(device.write(self.offset + offset, bytes)).map_err(|_| {
            error!("Flash write failed at offset {}", self.offset + offset);
            Error::FlashIo("write failed")
        })
    }

    /// Erases every sector touched by `[offset, offset + length)`.
    pub fn erase<D: FlashDevices>(
        &self,
        devices: &mut D,
        offset: u32,
        length: u32,
    ) -> Result<(), Error> {
        self.check_bounds(offset, length as usize)?;
        if length == 0 {
            return Ok(());
        }
        let end = offset + length;
        let first = self
            .sectors
            .iter()
            .rev()
            .find(|s| s.offset <= offset)
            .ok_or(Error::OutOfBounds)?;
        let last = self.sectors.iter().find(|s| s.end() >= end).ok_or(Error::OutOfBounds)?;
        let device = devices.device(self.device).ok_or(Error::AreaNotFound)?;
        block!(device.erase(self.offset + first.offset, last.end() - first.offset)).map_err(|_| {
            error!("Flash erase failed at offset {}", self.offset + first.offset);
            Error::FlashIo("erase failed")
        })
    }

    /// Checks that a range reads back as erased.
    pub fn range_is_erased<D: FlashDevices>(
        &self,
        devices: &mut D,
        offset: u32,
        length: u32,
    ) -> Result<bool, Error> {
        const CHUNK: usize = 64;
        let mut buffer = [0u8; CHUNK];
        let mut position = 0u32;
        while position < length {
            let chunk = core::cmp::min(CHUNK as u32, length - position) as usize;
            self.read(devices, offset + position, &mut buffer[..chunk])?;
            if !self.is_erased(&buffer[..chunk]) {
                return Ok(false);
            }
            position += chunk as u32;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hal::doubles::flash::FakeFlash;

    fn map() -> FlashMap {
        FlashMap::new(
            &[
                AreaDescriptor { id: AreaId::Primary(0), device: 0, offset: 0, size: 0x4000 },
                AreaDescriptor { id: AreaId::Secondary(0), device: 0, offset: 0x4000, size: 0x4000 },
                AreaDescriptor { id: AreaId::Scratch, device: 1, offset: 0x0, size: 0x1000 },
            ],
            1,
        )
        .unwrap()
    }

    fn devices() -> [FakeFlash; 2] {
        [FakeFlash::uniform(8, 0x1000), FakeFlash::uniform(2, 0x1000).with_write_size(16)]
    }

    #[test]
    fn opening_an_area_discovers_its_sectors() {
        let mut devices = devices();
        let secondary = map().open(&mut devices, AreaId::Secondary(0)).unwrap();
        assert_eq!(secondary.sector_count(), 4);
        assert_eq!(secondary.sector(1).unwrap(), Sector { offset: 0x1000, size: 0x1000 });
        assert_eq!(secondary.offset(), 0x4000);

        let scratch = map().open(&mut devices, AreaId::Scratch).unwrap();
        assert_eq!(scratch.align(), 16);
        assert_eq!(scratch.device_id(), 1);
    }

    #[test]
    fn unknown_ids_and_indices_are_errors() {
        let mut devices = devices();
        assert_eq!(map().open(&mut devices, AreaId::Primary(1)), Err(Error::AreaNotFound));
        assert_eq!(map().slot_area(1, 0), Err(Error::BadArgs("image index out of range")));
        assert_eq!(map().slot_area(0, 2), Err(Error::BadArgs("slot index out of range")));
        assert_eq!(map().slot_area(0, 1), Ok(AreaId::Secondary(0)));
    }

    #[test]
    fn duplicate_or_misaligned_areas_are_rejected() {
        let primary = AreaDescriptor { id: AreaId::Primary(0), device: 0, offset: 0, size: 0x4000 };
        assert!(FlashMap::new(&[primary, primary], 1).is_err());

        let skewed = AreaDescriptor { id: AreaId::Primary(0), device: 0, offset: 0x800, size: 0x1000 };
        let mut devices = devices();
        let result = FlashMap::new(&[skewed], 1).unwrap().open(&mut devices, AreaId::Primary(0));
        assert_eq!(result, Err(Error::BadArgs("flash area not sector aligned")));
    }

    #[test]
    fn accesses_past_the_area_end_never_reach_the_device() {
        // Given
        let mut devices = devices();
        let primary = map().open(&mut devices, AreaId::Primary(0)).unwrap();
        let mut buffer = [0u8; 16];

        // When
        let read = primary.read(&mut devices, 0x4000 - 8, &mut buffer);
        let write = primary.write(&mut devices, 0x4000 - 8, &buffer);
        let erase = primary.erase(&mut devices, 0x3000, 0x1001);
        let overflowing = primary.read(&mut devices, u32::MAX, &mut buffer);

        // Then
        assert_eq!(read, Err(Error::OutOfBounds));
        assert_eq!(write, Err(Error::OutOfBounds));
        assert_eq!(erase, Err(Error::OutOfBounds));
        assert_eq!(overflowing, Err(Error::OutOfBounds));
        assert_eq!(devices[0].operations(), 0);
        assert!(devices[0].contents()[0x4000..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn erase_rounds_to_sector_boundaries() {
        let mut devices = devices();
        let secondary = map().open(&mut devices, AreaId::Secondary(0)).unwrap();
        secondary.write(&mut devices, 0x0, &[0u8; 8]).unwrap();
        secondary.write(&mut devices, 0x1FF8, &[0u8; 8]).unwrap();

        secondary.erase(&mut devices, 0x10, 0x1000).unwrap();

        assert!(secondary.range_is_erased(&mut devices, 0, 0x2000).unwrap());
        assert_eq!(secondary.write(&mut devices, 0x3, &[0u8; 8]), Err(Error::Misaligned));
    }
}
