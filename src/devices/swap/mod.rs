//! Power-loss safe exchange of the two slots of an image.
//!
//! Two strategies share the plumbing in this module: the scratch assisted
//! swap and the scratch-free move swap. Both persist a status entry after
//! every completed phase and never persist one before, so rerunning the
//! phase a reboot lands in is always safe.
use crate::{
    config::SwapMethod,
    devices::{
        crypto::encryption::ImageKey,
        flash_map::{AreaId, FlashArea, FlashDevices, Slot, MAX_IMG_SECTORS},
        image::ImageHeader,
        status::{self, BootStatus, StatusSource},
        trailer::{Flag, SwapType, Trailer, STATUS_STATE_COUNT},
    },
    error::Error,
    logging::{error, warn},
};
use core::cmp::min;

pub mod moving;
pub mod scratch;

const COPY_CHUNK: usize = 512;

/// Swaps the slots of one image with a fixed strategy.
pub struct Swapper<'a> {
    method: SwapMethod,
    image_index: u8,
    trailer: Trailer,
    primary: &'a FlashArea,
    secondary: &'a FlashArea,
    scratch: Option<&'a FlashArea>,
}

impl<'a> Swapper<'a> {
    pub fn new(
        method: SwapMethod,
        image_index: u8,
        trailer: Trailer,
        primary: &'a FlashArea,
        secondary: &'a FlashArea,
        scratch: Option<&'a FlashArea>,
    ) -> Result<Self, Error> {
        trailer.check(primary)?;
        trailer.check(secondary)?;
        match (method, scratch) {
            (SwapMethod::Scratch, None) => return Err(Error::BadArgs("scratch swap without a scratch area")),
            (SwapMethod::Scratch, Some(scratch)) => trailer.check(scratch)?,
            (SwapMethod::Move, _) => (),
        }
        Ok(Self { method, image_index, trailer, primary, secondary, scratch })
    }

    pub fn method(&self) -> SwapMethod { self.method }
    pub fn trailer(&self) -> &Trailer { &self.trailer }
    pub fn primary(&self) -> &'a FlashArea { self.primary }
    pub fn secondary(&self) -> &'a FlashArea { self.secondary }

    pub fn area(&self, slot: Slot) -> &'a FlashArea {
        match slot {
            Slot::Primary => self.primary,
            Slot::Secondary => self.secondary,
        }
    }

    fn scratch(&self) -> Result<&'a FlashArea, Error> {
        self.scratch.ok_or(Error::BadArgs("scratch swap without a scratch area"))
    }

    /// Whether the two slots (and scratch) can be exchanged at all.
    pub fn check_layout(&self) -> Result<(), Error> {
        match self.method {
            SwapMethod::Scratch => scratch::check_layout(self).map(|_| ()),
            SwapMethod::Move => moving::check_layout(self),
        }
    }

    pub fn status_source<D: FlashDevices>(&self, devices: &mut D) -> Result<StatusSource, Error> {
        match self.method {
            SwapMethod::Scratch => scratch::status_source(self, devices),
            SwapMethod::Move => moving::status_source(self, devices),
        }
    }

    fn status_area(&self, source: StatusSource) -> Result<Option<&'a FlashArea>, Error> {
        Ok(match source {
            StatusSource::None => None,
            StatusSource::Primary => Some(self.primary),
            StatusSource::Scratch => Some(self.scratch()?),
        })
    }

    fn log_capacity(&self, area: &FlashArea) -> usize {
        match area.id() {
            AreaId::Scratch => STATUS_STATE_COUNT,
            _ => MAX_IMG_SECTORS * STATUS_STATE_COUNT,
        }
    }

    /// Rebuilds the progress of an interrupted swap from flash. A status
    /// that is still reset means no swap is in flight.
    pub fn read_status<D: FlashDevices>(
        &self,
        devices: &mut D,
        validate_primary: bool,
    ) -> Result<BootStatus, Error> {
        let mut status = BootStatus::reset();
        status.source = self.status_source(devices)?;
        let area = match self.status_area(status.source)? {
            Some(area) => area,
            None => return Ok(status),
        };

        let scan = match self.method {
            SwapMethod::Scratch => status::scan_log(devices, area, &self.trailer, 0, self.log_capacity(area))?,
            SwapMethod::Move => moving::scan_log(self, devices)?,
        };
        if scan.inconsistent {
            error!("Detected inconsistent status in the {} trailer", status.source.as_str());
            if !validate_primary {
                return Err(Error::Panic("inconsistent swap status"));
            }
            warn!("Resuming from the first gap, the primary image will be re-validated");
        }
        if let Some(written) = scan.written {
            match self.method {
                SwapMethod::Scratch => scratch::decode_progress(written, &mut status),
                SwapMethod::Move => moving::decode_progress(written, &mut status),
            }
        }

        status.swap_type = self.trailer.read_swap_state(devices, area)?.swap_type;
        if !status.is_reset() {
            status.swap_size = self.trailer.read_swap_size(devices, area)?;
            if self.trailer.encryption() {
                for slot in Slot::ALL {
                    status.keys[slot.index()] = self.trailer.read_image_key(devices, area, slot)?;
                }
            }
        }
        Ok(status)
    }

    /// Headers of both images as they were before the swap started,
    /// wherever an interrupted swap left them.
    pub fn read_headers<D: FlashDevices>(
        &self,
        devices: &mut D,
        status: &BootStatus,
    ) -> Result<[ImageHeader; 2], Error> {
        let mut headers = [ImageHeader::read(devices, self.primary)?, ImageHeader::read(devices, self.secondary)?];
        if self.method == SwapMethod::Move && !status.is_reset() {
            for slot in Slot::ALL {
                let (source, offset) = moving::header_location(self, slot, status)?;
                headers[slot.index()] = ImageHeader::read_at(devices, self.area(source), offset)?;
            }
        }
        Ok(headers)
    }

    /// Exchanges the first `status.swap_size` bytes of both slots, picking
    /// up from wherever `status` says a previous attempt stopped. Layout
    /// problems are reported before anything is written.
    pub fn run<D: FlashDevices>(
        &self,
        devices: &mut D,
        status: &mut BootStatus,
        headers: &[ImageHeader; 2],
    ) -> Result<(), Error> {
        match self.method {
            SwapMethod::Scratch => scratch::run(self, devices, status, headers),
            SwapMethod::Move => moving::run(self, devices, status, headers),
        }
    }

    fn log_entry(&self, status: &BootStatus) -> usize {
        match self.method {
            SwapMethod::Scratch => scratch::log_entry(status),
            SwapMethod::Move => moving::log_entry(status),
        }
    }

    /// Logs the phase `status` just completed.
    pub(crate) fn write_status<D: FlashDevices>(
        &self,
        devices: &mut D,
        status: &BootStatus,
    ) -> Result<(), Error> {
        let area = if status.use_scratch { self.scratch()? } else { self.primary };
        status::write_entry(devices, area, &self.trailer, self.log_entry(status), status.state)
    }

    /// Creates the trailer describing a starting swap, magic last.
    pub(crate) fn status_init<D: FlashDevices>(
        &self,
        devices: &mut D,
        area: &FlashArea,
        status: &BootStatus,
    ) -> Result<(), Error> {
        let secondary = self.trailer.read_swap_state(devices, self.secondary)?;
        if status.swap_type != SwapType::None {
            self.trailer.write_swap_info(devices, area, self.image_index, status.swap_type)?;
        }
        if secondary.image_ok == Flag::Set {
            self.trailer.write_image_ok(devices, area)?;
        }
        self.trailer.write_swap_size(devices, area, status.swap_size)?;
        self.write_keys(devices, area, status)?;
        self.trailer.write_magic(devices, area)
    }

    pub(crate) fn write_keys<D: FlashDevices>(
        &self,
        devices: &mut D,
        area: &FlashArea,
        status: &BootStatus,
    ) -> Result<(), Error> {
        if !self.trailer.encryption() {
            return Ok(());
        }
        for slot in Slot::ALL {
            if let Some(key) = &status.keys[slot.index()] {
                self.trailer.write_image_key(devices, area, slot, key)?;
            }
        }
        Ok(())
    }

    /// Erases sectors from the end of `area` until the trailer is gone.
    pub(crate) fn erase_trailer_sectors<D: FlashDevices>(
        &self,
        devices: &mut D,
        area: &FlashArea,
    ) -> Result<(), Error> {
        let trailer_size = self.trailer.size_in(area);
        let mut erased = 0;
        for sector in area.sectors().iter().rev() {
            area.erase(devices, sector.offset, sector.size)?;
            erased += sector.size;
            if erased >= trailer_size {
                break;
            }
        }
        Ok(())
    }

    /// Picks the key a copy between `source` and `destination` runs
    /// through. Bytes leaving the secondary slot are decrypted with its
    /// key, bytes entering it are encrypted with the primary image's key.
    fn copy_key(
        &self,
        source: &FlashArea,
        destination: &FlashArea,
        headers: &[ImageHeader; 2],
        keys: &[Option<ImageKey>; 2],
    ) -> Result<Option<(ImageKey, ImageHeader, Slot)>, Error> {
        let secondary = self.secondary.id();
        let (from_secondary, to_secondary) = (source.id() == secondary, destination.id() == secondary);
        if from_secondary == to_secondary {
            return Ok(None);
        }
        let slot = if to_secondary { Slot::Primary } else { Slot::Secondary };
        let header = headers[slot.index()];
        if !header.has_magic() || !header.is_encrypted() {
            return Ok(None);
        }
        let key = keys[slot.index()].ok_or(Error::BadImage("encrypted image without a key"))?;
        Ok(Some((key, header, slot)))
    }

    /// Copies `size` bytes into previously erased flash, applying the
    /// image keystream where the copy crosses into or out of the
    /// secondary slot.
    pub(crate) fn copy_region<D: FlashDevices>(
        &self,
        devices: &mut D,
        source: &FlashArea,
        destination: &FlashArea,
        source_offset: u32,
        destination_offset: u32,
        size: u32,
        headers: &[ImageHeader; 2],
        keys: &[Option<ImageKey>; 2],
    ) -> Result<(), Error> {
        let crypt = self.copy_key(source, destination, headers, keys)?;
        let mut buffer = [0u8; COPY_CHUNK];
        let mut copied = 0u32;
        while copied < size {
            let chunk = &mut buffer[..min(COPY_CHUNK as u32, size - copied) as usize];
            source.read(devices, source_offset + copied, chunk)?;
            if let Some((key, header, slot)) = &crypt {
                let image_offset = match slot {
                    Slot::Primary => destination_offset,
                    Slot::Secondary => source_offset,
                };
                key.apply_to_image(header, image_offset + copied, chunk)?;
            }
            destination.write(devices, destination_offset + copied, chunk)?;
            copied += chunk.len() as u32;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Flash layouts and helpers shared by the engine tests.
    use super::*;
    use crate::{
        devices::flash_map::{AreaDescriptor, FlashMap},
        hal::doubles::flash::FakeFlash,
    };

    pub const SECTOR: u32 = 0x1000;

    pub struct Layout {
        pub devices: [FakeFlash; 1],
        pub primary: FlashArea,
        pub secondary: FlashArea,
        pub scratch: FlashArea,
    }

    /// Both slots followed by a 2 sector scratch, all on one device.
    pub fn layout(slot_sectors: u32, secondary_sectors: u32) -> Layout {
        let total = slot_sectors + secondary_sectors + 2;
        let mut devices = [FakeFlash::uniform(total as usize, SECTOR)];
        let map = FlashMap::new(
            &[
                AreaDescriptor { id: AreaId::Primary(0), device: 0, offset: 0, size: slot_sectors * SECTOR },
                AreaDescriptor {
                    id: AreaId::Secondary(0),
                    device: 0,
                    offset: slot_sectors * SECTOR,
                    size: secondary_sectors * SECTOR,
                },
                AreaDescriptor {
                    id: AreaId::Scratch,
                    device: 0,
                    offset: (slot_sectors + secondary_sectors) * SECTOR,
                    size: 2 * SECTOR,
                },
            ],
            1,
        )
        .unwrap();
        let primary = map.open(&mut devices, AreaId::Primary(0)).unwrap();
        let secondary = map.open(&mut devices, AreaId::Secondary(0)).unwrap();
        let scratch = map.open(&mut devices, AreaId::Scratch).unwrap();
        Layout { devices, primary, secondary, scratch }
    }

    pub fn pattern(seed: u8, length: usize) -> Vec<u8> {
        (0..length).map(|i| seed.wrapping_add((i / 7) as u8) ^ (i as u8)).collect()
    }

    pub fn erased_headers() -> [ImageHeader; 2] {
        let erased = ImageHeader::decode(&[0xFF; 32]);
        [erased, erased]
    }
}

#[cfg(test)]
mod test {
    use super::{test_support::*, *};
    use crate::devices::{
        image::{flags, ImageVersion, IMAGE_MAGIC},
        trailer::Magic,
    };

    fn trailer() -> Trailer { Trailer::new(8, true).unwrap() }

    #[test]
    fn scratch_method_requires_a_scratch_area() {
        let layout = layout(8, 8);
        let result =
            Swapper::new(SwapMethod::Scratch, 0, trailer(), &layout.primary, &layout.secondary, None);
        assert_eq!(result.err(), Some(Error::BadArgs("scratch swap without a scratch area")));
    }

    #[test]
    fn status_init_writes_every_field_before_the_magic() {
        // Given a pending permanent update in the secondary slot
        let mut layout = layout(8, 8);
        let trailer = trailer();
        trailer.mark_pending(&mut layout.devices, &layout.secondary, true).unwrap();
        let swapper = Swapper::new(
            SwapMethod::Move,
            0,
            trailer,
            &layout.primary,
            &layout.secondary,
            Some(&layout.scratch),
        )
        .unwrap();
        let mut status = BootStatus::reset();
        status.swap_type = SwapType::Perm;
        status.swap_size = 0x2345;
        status.keys[1] = Some(ImageKey::new([9; 16]));

        // When power fails right before the last write
        let before = layout.devices[0].operations();
        swapper.status_init(&mut layout.devices, &layout.primary, &status).unwrap();
        let writes = layout.devices[0].operations() - before;
        layout.primary.erase(&mut layout.devices, 7 * SECTOR, SECTOR).unwrap();
        layout.devices[0].lose_power_after(writes);
        assert!(swapper.status_init(&mut layout.devices, &layout.primary, &status).is_err());
        layout.devices[0].power_cycle();

        // Then the trailer is not valid yet
        let state = trailer.read_swap_state(&mut layout.devices, &layout.primary).unwrap();
        assert_eq!(state.magic, Magic::Unset);
        assert_eq!(state.image_ok, Flag::Set);
        assert_eq!(state.swap_type, SwapType::Perm);
        assert_eq!(trailer.read_swap_size(&mut layout.devices, &layout.primary), Ok(0x2345));
        assert_eq!(writes, 5);
    }

    #[test]
    fn copies_into_the_secondary_encrypt_with_the_primary_key() {
        // Given an encrypted image header for the primary slot
        let mut layout = layout(8, 8);
        let swapper = Swapper::new(
            SwapMethod::Scratch,
            0,
            trailer(),
            &layout.primary,
            &layout.secondary,
            Some(&layout.scratch),
        )
        .unwrap();
        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            load_address: 0,
            header_size: 0x100,
            protected_tlv_size: 0,
            image_size: 0x1800,
            flags: flags::ENCRYPTED_AES128,
            version: ImageVersion::default(),
        };
        let key = ImageKey::new([0x5C; 16]);
        let plain = pattern(3, 2 * SECTOR as usize);
        layout.devices[0].load(0, &plain);
        let headers = [header, erased_headers()[1]];

        // When copying the second sector across
        swapper
            .copy_region(
                &mut layout.devices,
                &layout.primary,
                &layout.secondary,
                SECTOR,
                SECTOR,
                SECTOR,
                &headers,
                &[Some(key), None],
            )
            .unwrap();

        // Then it holds the keystream for the same image offsets
        let mut expected = plain[SECTOR as usize..].to_vec();
        key.apply_to_image(&header, SECTOR, &mut expected).unwrap();
        let copied = &layout.devices[0].contents()[9 * SECTOR as usize..10 * SECTOR as usize];
        assert_eq!(copied, &expected[..]);
        assert_ne!(copied, &plain[SECTOR as usize..]);
    }

    #[test]
    fn encrypted_copies_without_a_key_are_refused() {
        let mut layout = layout(8, 8);
        let swapper =
            Swapper::new(SwapMethod::Move, 0, trailer(), &layout.primary, &layout.secondary, None).unwrap();
        let mut header = ImageHeader::decode(&[0u8; 32]);
        header.magic = IMAGE_MAGIC;
        header.header_size = 0x20;
        header.image_size = 0x100;
        header.flags = flags::ENCRYPTED_AES128;

        let result = swapper.copy_region(
            &mut layout.devices,
            &layout.secondary,
            &layout.primary,
            0,
            0,
            SECTOR,
            &[header, header],
            &[None, None],
        );

        assert_eq!(result, Err(Error::BadImage("encrypted image without a key")));
    }
}
