use super::{direct::newest_slot, *};
use crate::{
    devices::{flash_map::AreaDescriptor, image::flags},
    hal::ram::{LoadRegion, RamWindow},
};
use core::ops::Range;

type LoadedWindows = Vec<Range<usize>, { MAX_IMAGES as usize }>;

impl<'k, D: FlashDevices, V: SignatureVerifier, C: SecurityCounters> Bootloader<'k, D, V, C> {
    /// RAM loading policy: the newest version of every image, from either
    /// slot, is copied to its load address inside `ram` and validated
    /// there. Flash is never written. The response describes image 0.
    pub fn boot_to_ram(&mut self, ram: &mut LoadRegion) -> Result<BootResponse, Error> {
        if self.config.mode != UpgradeMode::RamLoad {
            return Err(Error::BadArgs("boot policy doesn't load into RAM"));
        }
        info!("Boot policy: {}", self.config.mode.as_str());
        let mut loaded = LoadedWindows::new();
        let mut response = None;
        for image_index in 0..self.map.image_count() {
            let (selected, window) = self.select_ram(image_index, ram, &loaded)?;
            loaded.push(window).map_err(|_| Error::BadArgs("too many images"))?;
            response.get_or_insert(selected);
        }
        response.ok_or(Error::NoBootableImage)
    }

    fn select_ram(
        &mut self,
        image_index: u8,
        ram: &mut LoadRegion,
        loaded: &[Range<usize>],
    ) -> Result<(BootResponse, Range<usize>), Error> {
        let areas = [self.open_slot(image_index, Slot::Primary)?, self.open_slot(image_index, Slot::Secondary)?];
        let headers = self.read_headers(&areas[0], &areas[1])?;
        let mut usable = [true, true];

        loop {
            let slot = newest_slot(&headers, &usable).ok_or_else(|| {
                error!("Image {}: no slot left to load into RAM", image_index);
                Error::NoBootableImage
            })?;
            let (area, header) = (&areas[slot.index()], &headers[slot.index()]);
            match self.load_to_ram(image_index, area, header, ram, loaded) {
                Ok((valid, window)) => {
                    self.raise_counter(image_index, &valid)?;
                    info!(
                        "Image {}: running version {}.{} from RAM at {}",
                        image_index,
                        header.version.major,
                        header.version.minor,
                        header.load_address
                    );
                    let response = BootResponse {
                        image_index,
                        device: area.device_id(),
                        offset: area.offset(),
                        header: *header,
                        load_address: Some(header.load_address),
                    };
                    return Ok((response, window));
                }
                Err(Error::NoBootableImage) => usable[slot.index()] = false,
                Err(e) => return Err(e),
            }
        }
    }

    /// Copies the image in `area` to its load address and validates the
    /// copy. A copy that fails validation is wiped from RAM.
    fn load_to_ram(
        &mut self,
        image_index: u8,
        area: &FlashArea,
        header: &ImageHeader,
        ram: &mut LoadRegion,
        loaded: &[Range<usize>],
    ) -> Result<(ValidImage, Range<usize>), Error> {
        let reject = |e: Error| {
            if e.is_untrusted() {
                warn!("Image {}: can't load the {} slot ({})", image_index, slot_name(area), e.as_str());
                Error::NoBootableImage
            } else {
                e
            }
        };
        if header.flags & flags::RAM_LOAD == 0 {
            return Err(reject(Error::BadImage("image not built for RAM")));
        }
        header.check(area.size()).map_err(reject)?;
        let total = image_total_size(&mut self.devices, header, area).map_err(reject)?;
        let window = ram
            .window(header.load_address, total)
            .filter(|window| !loaded.iter().any(|other| overlaps(other, window)))
            .ok_or_else(|| reject(Error::BadImage("load address outside RAM or over another image")))?;
        let key = self.validator.image_key(&mut self.devices, header, area).map_err(reject)?;
        let min_counter = self.counters.read(image_index)?;

        let memory = &mut ram.memory()[window.clone()];
        area.read(&mut self.devices, 0, memory)?;
        if let Some(key) = key {
            key.apply_to_image(header, 0, memory)?;
        }

        let copy_id = AreaId::Primary(image_index);
        let map = FlashMap::new(&[AreaDescriptor { id: copy_id, device: 0, offset: 0, size: total }], MAX_IMAGES)?;
        let mut devices = [RamWindow(memory)];
        let copy = map.open(&mut devices, copy_id)?;
        let result = match ImageHeader::read(&mut devices, &copy)? {
            copied if copied == *header => {
                decide(&self.validator, self.config.fault_hardening, &mut devices, image_index, &copy, header, min_counter)
            }
            _ => Err(reject(Error::BadImage("header changed while loading"))),
        };
        if result.is_err() {
            devices[0].0.fill(0);
        }
        Ok((result?, window))
    }
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool { a.start < b.end && b.start < a.end }

#[cfg(test)]
mod test {
    use super::{super::test_support::*, *};
    use crate::devices::{
        crypto::{
            encryption::{DecryptionKey, ImageKey},
            HashOnly, KeyRing,
        },
        image::{builder::ImageBuilder, ImageVersion},
    };
    use p256::SecretKey;

    const RAM_START: u32 = 0x2000_0000;
    const RAM_SIZE: usize = 0x8000;

    fn ram_image(seed: u8, major: u8, counter: u32, load_address: u32) -> ImageBuilder {
        let body: std::vec::Vec<u8> = (0..BODY).map(|i| seed.wrapping_add(i as u8)).collect();
        ImageBuilder::new(&body)
            .flags(flags::RAM_LOAD)
            .load_address(load_address)
            .version(ImageVersion::new(major, 0, 0, 0))
            .security_counter(counter)
    }

    fn staged(images: u8, contents: &[(u32, std::vec::Vec<u8>)]) -> TestBootloader {
        let config = config(UpgradeMode::RamLoad, images);
        let (mut devices, counters) = board(images);
        for (offset, image) in contents {
            devices[0].load(*offset, image);
        }
        bootloader(&config, devices, counters)
    }

    fn window(memory: &[u8], address: u32, length: usize) -> &[u8] {
        let start = (address - RAM_START) as usize;
        &memory[start..start + length]
    }

    #[test]
    fn newest_image_is_copied_to_its_load_address() {
        // Given
        let older = ram_image(0x11, 1, 1, RAM_START).build().unwrap();
        let newer = ram_image(0x77, 2, 2, RAM_START + 0x4000).build().unwrap();
        let mut bootloader = staged(1, &[(primary(0), older.clone()), (secondary(0), newer.clone())]);
        let mut memory = vec![0u8; RAM_SIZE];

        // When
        let response = bootloader.boot_to_ram(&mut LoadRegion::new(RAM_START, &mut memory)).unwrap();

        // Then
        assert_eq!(response.load_address, Some(RAM_START + 0x4000));
        assert_eq!(response.offset, secondary(0));
        assert_eq!(response.header.version, ImageVersion::new(2, 0, 0, 0));
        assert_eq!(window(&memory, RAM_START + 0x4000, newer.len()), &newer[..]);
        assert!(window(&memory, RAM_START, 0x4000).iter().all(|b| *b == 0));
        assert_eq!(bootloader.counters.read(0), Ok(2));
        // Flash is left as it was
        assert!(starts_with(bootloader.devices(), primary(0), &older));
        assert!(starts_with(bootloader.devices(), secondary(0), &newer));
    }

    #[test]
    fn images_not_loadable_into_this_ram_fall_back_to_the_older_slot() {
        // Given a newer image without the RAM flag, then one loading past the end of RAM
        let older = ram_image(0x11, 1, 1, RAM_START).build().unwrap();
        let candidates = [image(0x77, 2, 2), ram_image(0x77, 2, 2, RAM_START + RAM_SIZE as u32 - 0x100).build().unwrap()];

        for candidate in candidates {
            let mut bootloader = staged(1, &[(primary(0), older.clone()), (secondary(0), candidate)]);
            let mut memory = vec![0u8; RAM_SIZE];

            // When
            let response = bootloader.boot_to_ram(&mut LoadRegion::new(RAM_START, &mut memory)).unwrap();

            // Then
            assert_eq!(response.offset, primary(0));
            assert_eq!(response.load_address, Some(RAM_START));
            assert_eq!(window(&memory, RAM_START, older.len()), &older[..]);
            assert_eq!(bootloader.counters.read(0), Ok(1));
        }
    }

    #[test]
    fn a_tampered_copy_is_wiped_from_ram() {
        // Given
        let older = ram_image(0x11, 1, 1, RAM_START).build().unwrap();
        let mut tampered = ram_image(0x77, 2, 2, RAM_START + 0x4000).build().unwrap();
        tampered[0x300] ^= 0xFF;
        let mut bootloader = staged(1, &[(primary(0), older), (secondary(0), tampered.clone())]);
        let mut memory = vec![0u8; RAM_SIZE];

        // When
        let response = bootloader.boot_to_ram(&mut LoadRegion::new(RAM_START, &mut memory)).unwrap();

        // Then the older image runs, and the rejected one survives in flash only
        assert_eq!(response.offset, primary(0));
        assert!(window(&memory, RAM_START + 0x4000, tampered.len()).iter().all(|b| *b == 0));
        assert!(starts_with(bootloader.devices(), secondary(0), &tampered));
    }

    #[test]
    fn images_may_not_overlap_in_ram() {
        // Given image 1's newest version loads over image 0
        let first = ram_image(0x11, 1, 1, RAM_START).build().unwrap();
        let overlapping = ram_image(0x22, 3, 3, RAM_START + 0x100).build().unwrap();
        let apart = ram_image(0x33, 2, 2, RAM_START + 0x4000).build().unwrap();
        let mut bootloader =
            staged(2, &[(primary(0), first), (primary(1), overlapping), (secondary(1), apart.clone())]);
        let mut memory = vec![0u8; RAM_SIZE];

        // When
        let response = bootloader.boot_to_ram(&mut LoadRegion::new(RAM_START, &mut memory)).unwrap();

        // Then
        assert_eq!(response.image_index, 0);
        assert_eq!(window(&memory, RAM_START + 0x4000, apart.len()), &apart[..]);
        assert_eq!(bootloader.counters.read(1), Ok(2));

        // And with nowhere else to go the boot fails
        let lone = ram_image(0x22, 3, 3, RAM_START + 0x100).build().unwrap();
        let first = ram_image(0x11, 1, 1, RAM_START).build().unwrap();
        let mut bootloader = staged(2, &[(primary(0), first), (primary(1), lone)]);
        let mut memory = vec![0u8; RAM_SIZE];
        assert_eq!(
            bootloader.boot_to_ram(&mut LoadRegion::new(RAM_START, &mut memory)),
            Err(Error::NoBootableImage)
        );
    }

    #[test]
    fn encrypted_candidates_are_decrypted_into_ram() {
        // Given
        let device_key = DecryptionKey::from_bytes(&[0x5A; 32]).unwrap();
        let plain = ram_image(0x77, 2, 2, RAM_START).build().unwrap();
        let encrypted = ram_image(0x77, 2, 2, RAM_START)
            .encrypt(device_key.public_key(), SecretKey::from_slice(&[0x3C; 32]).unwrap(), ImageKey::new([0x11; 16]))
            .build()
            .unwrap();
        let config = config(UpgradeMode::RamLoad, 1).with_encryption();
        let (mut devices, counters) = board(1);
        devices[0].load(secondary(0), &encrypted);
        let validator = Validator::new(HashOnly, KeyRing::empty()).with_decryption(device_key);
        let mut bootloader = Bootloader::new(config, devices, validator, counters).unwrap();
        let mut memory = vec![0u8; RAM_SIZE];

        // When
        let response = bootloader.boot_to_ram(&mut LoadRegion::new(RAM_START, &mut memory)).unwrap();

        // Then the body in RAM is the plaintext
        assert_eq!(response.offset, secondary(0));
        let body = 0x200..0x200 + BODY;
        assert_eq!(&memory[body.clone()], &plain[body]);
    }

    #[test]
    fn ram_loading_and_flash_policies_are_not_mixed() {
        let mut memory = vec![0u8; RAM_SIZE];
        let mut ram_build = staged(1, &[(primary(0), ram_image(0x11, 1, 1, RAM_START).build().unwrap())]);
        assert_eq!(ram_build.boot(), Err(Error::BadArgs("RAM loading needs a load region")));

        let config = config(UpgradeMode::DirectXip { revert: false }, 1);
        let (devices, counters) = board(1);
        let mut xip_build = bootloader(&config, devices, counters);
        assert_eq!(
            xip_build.boot_to_ram(&mut LoadRegion::new(RAM_START, &mut memory)),
            Err(Error::BadArgs("boot policy doesn't load into RAM"))
        );
    }
}
