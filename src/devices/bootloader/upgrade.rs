use super::*;

impl<'k, D: FlashDevices, V: SignatureVerifier, C: SecurityCounters> Bootloader<'k, D, V, C> {
    /// Swap policy: every image is prepared (an interrupted swap is
    /// finished first), dependencies are checked across images, pending
    /// swaps run and the resulting primary images are selected.
    pub(super) fn boot_swap(&mut self, method: SwapMethod) -> Result<BootResponse, Error> {
        let mut states = ImageStates::new();
        for image_index in 0..self.map.image_count() {
            let (state, resumed) = self.prepare_image(method, image_index)?;
            states.push(state).map_err(|_| Error::BadArgs("too many images"))?;
            review_swap_types(&mut states, resumed);
        }
        if states.len() > 1 {
            self.check_dependencies(&mut states)?;
        }

        for (image_index, state) in states.iter_mut().enumerate() {
            let image_index = image_index as u8;
            match state.swap_type {
                SwapType::Panic => return Err(Error::Panic("unrecoverable swap state")),
                SwapType::Fail => {
                    // Pretend we just reverted, so the erased candidate is
                    // not looked for again.
                    let primary = self.open_slot(image_index, Slot::Primary)?;
                    self.trailer.mark_confirmed(&mut self.devices, &primary)?;
                }
                _ => self.perform_swap(method, image_index, state)?,
            }
        }

        let mut response = None;
        for (image_index, state) in states.iter().enumerate() {
            let image_index = image_index as u8;
            let confirmed = self.primary_confirmed(image_index)?;
            let selected = self.select_primary(image_index, state, confirmed)?;
            response.get_or_insert(selected);
        }
        response.ok_or(Error::NoBootableImage)
    }

    /// Only a confirmed image may move the rollback counter, otherwise a
    /// revert to the previous image would be refused.
    fn primary_confirmed(&mut self, image_index: u8) -> Result<bool, Error> {
        let primary = self.open_slot(image_index, Slot::Primary)?;
        let state = self.trailer.read_swap_state(&mut self.devices, &primary)?;
        Ok(state.image_ok == Flag::Set)
    }

    fn swapper<'a>(
        &self,
        method: SwapMethod,
        image_index: u8,
        primary: &'a FlashArea,
        secondary: &'a FlashArea,
        scratch: Option<&'a FlashArea>,
    ) -> Result<Swapper<'a>, Error> {
        Swapper::new(method, image_index, self.trailer, primary, secondary, scratch)
    }

    fn open_scratch(&mut self, method: SwapMethod) -> Result<Option<FlashArea>, Error> {
        match method {
            SwapMethod::Scratch => self.open(AreaId::Scratch).map(Some),
            SwapMethod::Move => Ok(None),
        }
    }

    /// Works out the swap type of one image. A swap a reset interrupted is
    /// completed here, before anything else is decided. Returns whether
    /// that happened.
    fn prepare_image(&mut self, method: SwapMethod, image_index: u8) -> Result<(ImageState, bool), Error> {
        let primary = self.open_slot(image_index, Slot::Primary)?;
        let secondary = self.open_slot(image_index, Slot::Secondary)?;
        let scratch = self.open_scratch(method)?;
        let swapper = self.swapper(method, image_index, &primary, &secondary, scratch.as_ref())?;
        let mut state = ImageState::new(self.read_headers(&primary, &secondary)?);

        if swapper.check_layout().is_err() {
            warn!("Image {}: slots can't be swapped, booting the primary slot", image_index);
            return Ok((state, false));
        }

        let mut status = match swapper.read_status(&mut self.devices, self.config.validate_primary) {
            Ok(status) => status,
            Err(Error::Panic(reason)) => {
                error!("Image {}: {}", image_index, reason);
                state.swap_type = SwapType::Panic;
                return Ok((state, false));
            }
            Err(e) => {
                warn!("Image {}: failed reading the boot status ({})", image_index, e.as_str());
                return Ok((state, false));
            }
        };
        state.headers = swapper.read_headers(&mut self.devices, &status)?;

        if !status.is_reset() {
            info!(
                "Image {}: resuming {} swap from {}",
                image_index,
                status.swap_type.as_str(),
                status.source.as_str()
            );
            swapper.run(&mut self.devices, &mut status, &state.headers)?;
            self.finish_swap(&swapper, status.swap_type)?;
            state.swap_type = status.swap_type;
            state.swapped = true;
            state.headers = self.read_headers(&primary, &secondary)?;
            return Ok((state, true));
        }

        state.swap_type = if status.swap_type.is_upgrade() {
            // The swap initialised its trailer, and possibly erased the
            // candidate's, but logged no progress yet.
            match self.check_candidate(image_index, &secondary, &state.headers[1])? {
                Candidate::Valid => status.swap_type,
                Candidate::Missing => SwapType::None,
                Candidate::Rejected => SwapType::Fail,
            }
        } else {
            self.validated_swap_type(image_index, &primary, &secondary, &state.headers[1])?
        };
        if state.swap_type == SwapType::None && self.needs_bootstrap(image_index, &primary, &secondary, &state.headers)? {
            state.swap_type = SwapType::Perm;
            state.bootstrap = true;
        }
        info!("Image {}: swap type {}", image_index, state.swap_type.as_str());
        state.status = status;
        Ok((state, false))
    }

    /// Runs the swap `state` asks for, if any. Layout problems leave the
    /// slots untouched and the primary image is booted instead.
    fn perform_swap(&mut self, method: SwapMethod, image_index: u8, state: &mut ImageState) -> Result<(), Error> {
        if state.swapped || !state.swap_type.is_upgrade() {
            return Ok(());
        }
        if state.bootstrap {
            return self.bootstrap(image_index, state);
        }
        let primary = self.open_slot(image_index, Slot::Primary)?;
        let secondary = self.open_slot(image_index, Slot::Secondary)?;
        let scratch = self.open_scratch(method)?;
        let swapper = self.swapper(method, image_index, &primary, &secondary, scratch.as_ref())?;

        let mut status = state.status;
        status.swap_type = state.swap_type;
        status.swap_size = self.copy_size(&primary, &secondary, &state.headers)?;
        status.keys = self.load_keys(&primary, &secondary, &state.headers)?;
        info!("Image {}: starting {} swap of {} bytes", image_index, state.swap_type.as_str(), status.swap_size);

        match swapper.run(&mut self.devices, &mut status, &state.headers) {
            Ok(()) => (),
            Err(e @ (Error::InsufficientSpace | Error::IncompatibleLayout)) => {
                warn!("Image {}: swap refused ({}), booting the primary slot", image_index, e.as_str());
                state.swap_type = SwapType::None;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.finish_swap(&swapper, state.swap_type)?;
        state.swapped = true;
        state.headers = self.read_headers(&primary, &secondary)?;
        Ok(())
    }

    /// Copies the candidate into a primary slot holding nothing bootable.
    /// The candidate stays in place, so a reset midway starts the copy over.
    fn bootstrap(&mut self, image_index: u8, state: &mut ImageState) -> Result<(), Error> {
        let primary = self.open_slot(image_index, Slot::Primary)?;
        let secondary = self.open_slot(image_index, Slot::Secondary)?;
        let swapper = self.swapper(SwapMethod::Move, image_index, &primary, &secondary, None)?;
        if !self.copy_candidate(image_index, &swapper, &state.headers)? {
            state.swap_type = SwapType::None;
            return Ok(());
        }
        self.finish_swap(&swapper, SwapType::Perm)?;
        state.swapped = true;
        state.headers = self.read_headers(&primary, &secondary)?;
        Ok(())
    }

    /// Records a completed swap in the primary trailer. A permanent swap or
    /// a revert is confirmed on the spot; a test swap is left for the
    /// application to confirm.
    fn finish_swap(&mut self, swapper: &Swapper, swap_type: SwapType) -> Result<(), Error> {
        let primary = swapper.primary();
        let state = self.trailer.read_swap_state(&mut self.devices, primary)?;
        if matches!(swap_type, SwapType::Perm | SwapType::Revert) && state.image_ok == Flag::Unset {
            self.trailer.write_image_ok(&mut self.devices, primary)?;
        }
        if swap_type.is_upgrade() && state.copy_done == Flag::Unset {
            self.trailer.write_copy_done(&mut self.devices, primary)?;
        }
        Ok(())
    }
}

/// A reset between the swaps of two images makes the trailers of the
/// earlier, already swapped images read as pending reverts. Those are
/// dropped once the latest image shows an upgrade was under way.
fn review_swap_types(states: &mut ImageStates, aborted_swap: bool) {
    let Some((current, earlier)) = states.split_last_mut() else {
        return;
    };
    if !aborted_swap && matches!(current.swap_type, SwapType::None | SwapType::Revert) {
        return;
    }
    for state in earlier.iter_mut().filter(|s| s.swap_type == SwapType::Revert) {
        state.swap_type = SwapType::None;
    }
}
