use super::*;
use crate::utilities::memory::align_up;
use core::cmp::Ordering;

impl<'k, D: FlashDevices, V: SignatureVerifier, C: SecurityCounters> Bootloader<'k, D, V, C> {
    /// Overwrite policy: a pending candidate replaces the primary image
    /// outright. There is no way back, so every upgrade is permanent.
    pub(super) fn boot_overwrite(&mut self, downgrade_prevention: bool) -> Result<BootResponse, Error> {
        let mut states = ImageStates::new();
        for image_index in 0..self.map.image_count() {
            let state = self.prepare_overwrite(image_index, downgrade_prevention)?;
            states.push(state).map_err(|_| Error::BadArgs("too many images"))?;
        }
        if states.len() > 1 {
            self.check_dependencies(&mut states)?;
        }

        for (image_index, state) in states.iter_mut().enumerate() {
            if matches!(state.swap_type, SwapType::Test | SwapType::Perm) {
                self.overwrite(image_index as u8, state)?;
            }
        }

        let mut response = None;
        for (image_index, state) in states.iter().enumerate() {
            let selected = self.select_primary(image_index as u8, state, true)?;
            response.get_or_insert(selected);
        }
        response.ok_or(Error::NoBootableImage)
    }

    fn prepare_overwrite(&mut self, image_index: u8, downgrade_prevention: bool) -> Result<ImageState, Error> {
        let primary = self.open_slot(image_index, Slot::Primary)?;
        let secondary = self.open_slot(image_index, Slot::Secondary)?;
        let mut state = ImageState::new(self.read_headers(&primary, &secondary)?);
        state.swap_type = match self.validated_swap_type(image_index, &primary, &secondary, &state.headers[1])? {
            SwapType::Revert => SwapType::None,
            swap_type => swap_type,
        };
        if state.swap_type == SwapType::None && self.needs_bootstrap(image_index, &primary, &secondary, &state.headers)? {
            state.swap_type = SwapType::Perm;
            state.bootstrap = true;
        }

        let [running, candidate] = &state.headers;
        if downgrade_prevention
            && !state.bootstrap
            && state.swap_type.is_upgrade()
            && running.has_magic()
            && candidate.version.semantic_cmp(&running.version) == Ordering::Less
        {
            warn!(
                "Image {}: refusing downgrade from {}.{} to {}.{}",
                image_index,
                running.version.major,
                running.version.minor,
                candidate.version.major,
                candidate.version.minor
            );
            secondary.erase(&mut self.devices, 0, secondary.size())?;
            state.swap_type = SwapType::Fail;
        }
        info!("Image {}: swap type {}", image_index, state.swap_type.as_str());
        Ok(state)
    }

    /// Copies the candidate over the primary slot, then erases its header
    /// and trailer so it is never installed twice. A reset in between
    /// starts the copy over.
    fn overwrite(&mut self, image_index: u8, state: &mut ImageState) -> Result<(), Error> {
        let primary = self.open_slot(image_index, Slot::Primary)?;
        let secondary = self.open_slot(image_index, Slot::Secondary)?;
        let swapper = Swapper::new(SwapMethod::Move, image_index, self.trailer, &primary, &secondary, None)?;
        if !self.copy_candidate(image_index, &swapper, &state.headers)? {
            state.swap_type = SwapType::None;
            return Ok(());
        }
        let first = secondary.sector(0)?;
        secondary.erase(&mut self.devices, first.offset, first.size)?;
        swapper.erase_trailer_sectors(&mut self.devices, &secondary)?;

        state.swapped = true;
        state.headers = self.read_headers(&primary, &secondary)?;
        Ok(())
    }

    /// Erases the primary slot and copies the candidate image into it,
    /// decrypted. Returns false, with both slots untouched, when the image
    /// would run into the primary trailer.
    pub(super) fn copy_candidate(
        &mut self,
        image_index: u8,
        swapper: &Swapper,
        headers: &[ImageHeader; 2],
    ) -> Result<bool, Error> {
        let (primary, secondary) = (swapper.primary(), swapper.secondary());
        let total = image_total_size(&mut self.devices, &headers[1], secondary)?;
        let size = align_up(total as usize, primary.align()) as u32;
        if size > primary.size() - self.trailer.size_in(primary) {
            warn!("Image {}: candidate doesn't fit the primary slot", image_index);
            return Ok(false);
        }
        let keys = [None, self.validator.image_key(&mut self.devices, &headers[1], secondary)?];
        info!("Image {}: overwriting the primary slot with {} bytes", image_index, size);

        primary.erase(&mut self.devices, 0, primary.size())?;
        swapper.copy_region(&mut self.devices, secondary, primary, 0, 0, size, headers, &keys)?;
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::{super::test_support::*, *};
    use crate::devices::image::ImageVersion;

    fn staged(downgrade_prevention: bool, running: u8, candidate: u8) -> TestBootloader {
        let config = config(UpgradeMode::Overwrite { downgrade_prevention }, 1);
        let (mut devices, counters) = board(1);
        devices[0].load(primary(0), &image(0x11, running, running as u32));
        devices[0].load(secondary(0), &image(0x77, candidate, candidate as u32));
        let mut bootloader = bootloader(&config, devices, counters);
        let trailer = bootloader.trailer;
        let candidate = area(&mut bootloader, AreaId::Secondary(0));
        trailer.mark_pending(bootloader.devices(), &candidate, false).unwrap();
        bootloader
    }

    #[test]
    fn candidate_replaces_the_primary_image() {
        // Given
        let mut bootloader = staged(false, 1, 2);

        // When
        let response = bootloader.boot().unwrap();

        // Then
        assert_eq!(response.header.version, ImageVersion::new(2, 0, 0, 0));
        assert!(starts_with(bootloader.devices(), primary(0), &image(0x77, 2, 2)));
        let secondary = area(&mut bootloader, AreaId::Secondary(0));
        assert_eq!(secondary.range_is_erased(bootloader.devices(), 0, SECTOR), Ok(true));
        assert_eq!(secondary.range_is_erased(bootloader.devices(), SLOT - SECTOR, SECTOR), Ok(true));
        assert_eq!(bootloader.counters.read(0), Ok(2));
    }

    #[test]
    fn downgrades_are_allowed_unless_prevented() {
        let mut bootloader = staged(false, 3, 2);
        assert_eq!(bootloader.boot().unwrap().header.version, ImageVersion::new(2, 0, 0, 0));

        let mut bootloader = staged(true, 3, 2);
        assert_eq!(bootloader.boot().unwrap().header.version, ImageVersion::new(3, 0, 0, 0));
        assert!(starts_with(bootloader.devices(), primary(0), &image(0x11, 3, 3)));
        let secondary = area(&mut bootloader, AreaId::Secondary(0));
        assert_eq!(secondary.range_is_erased(bootloader.devices(), 0, SLOT), Ok(true));
    }

    #[test]
    fn bootstrap_replaces_a_corrupt_primary_even_with_an_older_image() {
        // Given a damaged newer image in the primary slot and no upgrade requested
        let config = config(UpgradeMode::Overwrite { downgrade_prevention: true }, 1).with_bootstrap();
        let (mut devices, counters) = board(1);
        let mut corrupt = image(0x11, 3, 3);
        corrupt[0x400] ^= 0xFF;
        devices[0].load(primary(0), &corrupt);
        devices[0].load(secondary(0), &image(0x77, 2, 2));
        let mut bootloader = bootloader(&config, devices, counters);

        // When
        let response = bootloader.boot().unwrap();

        // Then
        assert_eq!(response.header.version, ImageVersion::new(2, 0, 0, 0));
        assert!(starts_with(bootloader.devices(), primary(0), &image(0x77, 2, 2)));
        assert_eq!(bootloader.counters.read(0), Ok(2));
    }

    #[test]
    fn an_interrupted_overwrite_is_redone() {
        for cut in 1..64 {
            // Given power fails partway through
            let mut bootloader = staged(false, 1, 2);
            bootloader.devices()[0].lose_power_after(cut);
            let interrupted = bootloader.boot();
            bootloader.devices()[0].power_cycle();

            // When
            let config = bootloader.config.clone();
            let (devices, counters) = bootloader.into_parts();
            let mut bootloader = super::super::test_support::bootloader(&config, devices, counters);

            // Then
            assert_eq!(bootloader.boot().unwrap().header.version, ImageVersion::new(2, 0, 0, 0));
            assert!(starts_with(bootloader.devices(), primary(0), &image(0x77, 2, 2)));
            if interrupted.is_ok() {
                break;
            }
        }
    }
}
