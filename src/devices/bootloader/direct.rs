use super::*;

impl<'k, D: FlashDevices, V: SignatureVerifier, C: SecurityCounters> Bootloader<'k, D, V, C> {
    /// Direct-XIP policy: nothing is copied. Each image runs from whichever
    /// of its slots holds the newest valid version.
    pub(super) fn boot_direct(&mut self, revert: bool) -> Result<BootResponse, Error> {
        let mut response = None;
        for image_index in 0..self.map.image_count() {
            let selected = self.select_direct(image_index, revert)?;
            response.get_or_insert(selected);
        }
        response.ok_or(Error::NoBootableImage)
    }

    fn select_direct(&mut self, image_index: u8, revert: bool) -> Result<BootResponse, Error> {
        let areas = [self.open_slot(image_index, Slot::Primary)?, self.open_slot(image_index, Slot::Secondary)?];
        let mut usable = [true, true];

        loop {
            let headers = self.read_headers(&areas[0], &areas[1])?;
            let slot = newest_slot(&headers, &usable).ok_or_else(|| {
                error!("Image {}: no slot left to boot from", image_index);
                Error::NoBootableImage
            })?;
            let (area, header) = (&areas[slot.index()], &headers[slot.index()]);

            let mut confirmed = true;
            if revert {
                let state = self.trailer.read_swap_state(&mut self.devices, area)?;
                if state.magic != Magic::Good || (state.copy_done == Flag::Set && state.image_ok != Flag::Set) {
                    // Either never marked for booting, or a test run that
                    // was never confirmed.
                    warn!("Image {}: erasing unconfirmed {} slot", image_index, slot.as_str());
                    area.erase(&mut self.devices, 0, area.size())?;
                    usable[slot.index()] = false;
                    continue;
                }
                match state.copy_done {
                    Flag::Unset => self.trailer.write_copy_done(&mut self.devices, area)?,
                    Flag::Bad => warn!("Image {}: {} trailer is corrupt", image_index, slot.as_str()),
                    Flag::Set => (),
                }
                confirmed = state.image_ok == Flag::Set;
            }

            match self.validate_for_boot(image_index, area, header) {
                Ok(valid) => {
                    if confirmed {
                        self.raise_counter(image_index, &valid)?;
                    }
                    info!(
                        "Image {}: running version {}.{} in place from the {} slot",
                        image_index,
                        header.version.major,
                        header.version.minor,
                        slot.as_str()
                    );
                    return Ok(BootResponse {
                        image_index,
                        device: area.device_id(),
                        offset: area.offset(),
                        header: *header,
                        load_address: None,
                    });
                }
                Err(Error::NoBootableImage) => {
                    if slot == Slot::Secondary {
                        area.erase(&mut self.devices, 0, area.size())?;
                    }
                    usable[slot.index()] = false;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Usable slot holding the highest version; the primary slot wins ties.
pub(super) fn newest_slot(headers: &[ImageHeader; 2], usable: &[bool; 2]) -> Option<Slot> {
    Slot::ALL
        .into_iter()
        .filter(|slot| usable[slot.index()])
        .filter(|slot| headers[slot.index()].has_magic() && headers[slot.index()].is_bootable())
        .fold(None, |newest: Option<Slot>, slot| match newest {
            Some(best)
                if headers[slot.index()].version.semantic_cmp(&headers[best.index()].version)
                    != core::cmp::Ordering::Greater =>
            {
                Some(best)
            }
            _ => Some(slot),
        })
}
