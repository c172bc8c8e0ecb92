//! Boot orchestrator.
//!
//! Runs once per reset. For every image it works out what the trailers ask
//! for, finishes or starts the slot exchange the configured policy calls
//! for, validates what ended up in the slot it is going to boot and raises
//! the rollback counter once that image is trusted. The result is the flash
//! location of the image to jump to; jumping is left to the caller.
//!
//! All state lives in the [`Bootloader`] context, threaded by reference
//! through the policy specific submodules.
use crate::{
    config::{BootConfig, SwapMethod, UpgradeMode},
    devices::{
        crypto::{
            encryption::{load_image_key, ImageKey},
            SignatureVerifier,
        },
        fih::{self, FihBool},
        flash_map::{AreaId, DeviceId, FlashArea, FlashDevices, FlashMap, Slot, MAX_IMAGES},
        image::{tlv::image_total_size, ImageHeader},
        security_counter::SecurityCounters,
        status::BootStatus,
        swap::Swapper,
        trailer::{swap_type_for, Flag, Magic, SwapType, Trailer},
        validator::{ValidImage, Validator},
    },
    error::Error,
    logging::{error, info, warn},
};
use heapless::Vec;

mod dependencies;
mod direct;
mod overwrite;
mod primary_only;
mod ram_load;
mod upgrade;

type ImageStates = Vec<ImageState, { MAX_IMAGES as usize }>;

/// Where the image to run lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootResponse {
    pub image_index: u8,
    pub device: DeviceId,
    /// Start of the image header on `device`.
    pub offset: u32,
    pub header: ImageHeader,
    /// RAM address the image was copied to, when it runs from RAM.
    pub load_address: Option<u32>,
}

/// What the orchestrator knows about one image while deciding.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ImageState {
    pub swap_type: SwapType,
    pub status: BootStatus,
    /// Headers of the primary and secondary slot.
    pub headers: [ImageHeader; 2],
    /// The slots were exchanged (or overwritten) during this boot.
    pub swapped: bool,
    /// The pending upgrade installs a candidate into a primary slot that
    /// held nothing bootable, without keeping the old contents.
    pub bootstrap: bool,
}

impl ImageState {
    fn new(headers: [ImageHeader; 2]) -> Self {
        Self { swap_type: SwapType::None, status: BootStatus::reset(), headers, swapped: false, bootstrap: false }
    }

    /// Slot holding the image that will be in the primary slot once this
    /// boot is done.
    fn upcoming_slot(&self) -> Slot {
        if self.swap_type.is_upgrade() && !self.swapped {
            Slot::Secondary
        } else {
            Slot::Primary
        }
    }
}

/// Outcome of checking the image in a candidate slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Candidate {
    Valid,
    /// No image header, or the image is flagged as not bootable.
    Missing,
    /// Failed validation and was erased.
    Rejected,
}

pub struct Bootloader<'k, D: FlashDevices, V: SignatureVerifier, C: SecurityCounters> {
    pub(crate) devices: D,
    pub(crate) config: BootConfig,
    pub(crate) map: FlashMap,
    pub(crate) trailer: Trailer,
    pub(crate) validator: Validator<'k, V>,
    pub(crate) counters: C,
}

impl<'k, D: FlashDevices, V: SignatureVerifier, C: SecurityCounters> Bootloader<'k, D, V, C> {
    pub fn new(
        config: BootConfig,
        devices: D,
        validator: Validator<'k, V>,
        counters: C,
    ) -> Result<Self, Error> {
        config.check()?;
        let map = config.flash_map()?;
        let trailer = config.trailer()?;
        let mut validator = validator;
        if config.check_erased_tail {
            validator = validator.with_erased_tail(trailer);
        }
        if config.mode == UpgradeMode::PrimaryOnly {
            validator = validator.masking_encrypted_flag();
        }
        Ok(Self { devices, config, map, trailer, validator, counters })
    }

    pub fn devices(&mut self) -> &mut D { &mut self.devices }

    /// Hands back the flash devices and counter store, e.g. to build the
    /// context of the next boot.
    pub fn into_parts(self) -> (D, C) { (self.devices, self.counters) }

    /// Decides which image to run, completing or starting any pending
    /// upgrade on the way. The response describes image 0; every other
    /// image has been prepared and validated in its own primary slot.
    pub fn boot(&mut self) -> Result<BootResponse, Error> {
        info!("Boot policy: {}", self.config.mode.as_str());
        match self.config.mode {
            UpgradeMode::Swap(method) => self.boot_swap(method),
            UpgradeMode::Overwrite { downgrade_prevention } => self.boot_overwrite(downgrade_prevention),
            UpgradeMode::DirectXip { revert } => self.boot_direct(revert),
            UpgradeMode::PrimaryOnly => self.boot_primary_only(),
            UpgradeMode::RamLoad => Err(Error::BadArgs("RAM loading needs a load region")),
        }
    }

    /// Like [`boot`](Self::boot), but never returns without an image to run.
    pub fn boot_or_halt(&mut self) -> BootResponse {
        match self.boot() {
            Ok(response) => response,
            Err(e) => halt(e),
        }
    }

    fn open(&mut self, id: AreaId) -> Result<FlashArea, Error> { self.map.open(&mut self.devices, id) }

    fn open_slot(&mut self, image_index: u8, slot: Slot) -> Result<FlashArea, Error> {
        self.open(AreaId::for_slot(image_index, slot))
    }

    fn read_headers(&mut self, primary: &FlashArea, secondary: &FlashArea) -> Result<[ImageHeader; 2], Error> {
        Ok([ImageHeader::read(&mut self.devices, primary)?, ImageHeader::read(&mut self.devices, secondary)?])
    }

    /// Swap type the trailers ask for, confirmed against the candidate.
    fn validated_swap_type(
        &mut self,
        image_index: u8,
        primary: &FlashArea,
        secondary: &FlashArea,
        candidate: &ImageHeader,
    ) -> Result<SwapType, Error> {
        let swap_type = swap_type_for(
            &self.trailer.read_swap_state(&mut self.devices, primary)?,
            &self.trailer.read_swap_state(&mut self.devices, secondary)?,
        );
        if !swap_type.is_upgrade() {
            return Ok(swap_type);
        }
        Ok(match self.check_candidate(image_index, secondary, candidate)? {
            Candidate::Valid => swap_type,
            Candidate::Missing => SwapType::None,
            Candidate::Rejected => SwapType::Fail,
        })
    }

    /// Validates the image in a slot we may copy from or run. An untrusted
    /// image is erased so it is never considered again.
    fn check_candidate(
        &mut self,
        image_index: u8,
        area: &FlashArea,
        header: &ImageHeader,
    ) -> Result<Candidate, Error> {
        if !header.has_magic() || !header.is_bootable() {
            info!("Image {}: no bootable image in the {} slot", image_index, slot_name(area));
            return Ok(Candidate::Missing);
        }
        let min_counter = self.counters.read(image_index)?;
        match self.validator.validate(&mut self.devices, image_index, area, header, min_counter) {
            Ok(_) => Ok(Candidate::Valid),
            Err(e) if e.is_untrusted() => {
                warn!("Image {}: erasing rejected {} slot ({})", image_index, slot_name(area), e.as_str());
                area.erase(&mut self.devices, 0, area.size())?;
                Ok(Candidate::Rejected)
            }
            Err(e) => Err(e),
        }
    }

    /// With bootstrapping enabled, a valid candidate is installed when the
    /// primary slot holds nothing that would boot.
    fn needs_bootstrap(
        &mut self,
        image_index: u8,
        primary: &FlashArea,
        secondary: &FlashArea,
        headers: &[ImageHeader; 2],
    ) -> Result<bool, Error> {
        if !self.config.bootstrap {
            return Ok(false);
        }
        let [running, candidate] = headers;
        if running.has_magic() && running.is_bootable() {
            let min_counter = self.counters.read(image_index)?;
            match self.validator.validate(&mut self.devices, image_index, primary, running, min_counter) {
                Ok(_) => return Ok(false),
                Err(e) if e.is_untrusted() => (),
                Err(e) => return Err(e),
            }
        }
        if self.check_candidate(image_index, secondary, candidate)? != Candidate::Valid {
            return Ok(false);
        }
        info!("Image {}: nothing bootable in the primary slot, installing the secondary image", image_index);
        Ok(true)
    }

    /// Validation the boot decision rests on.
    fn validate_for_boot(
        &mut self,
        image_index: u8,
        area: &FlashArea,
        header: &ImageHeader,
    ) -> Result<ValidImage, Error> {
        let min_counter = self.counters.read(image_index)?;
        let Self { devices, validator, config, .. } = self;
        decide(validator, config.fault_hardening, devices, image_index, area, header, min_counter)
    }

    /// Validates the image that is going to run from the primary slot and,
    /// if `update_counter`, raises its rollback counter.
    fn select_primary(
        &mut self,
        image_index: u8,
        state: &ImageState,
        update_counter: bool,
    ) -> Result<BootResponse, Error> {
        let primary = self.open_slot(image_index, Slot::Primary)?;
        let header = ImageHeader::read(&mut self.devices, &primary)?;
        if !header.has_magic() {
            error!("Image {}: primary slot is empty", image_index);
            return Err(Error::NoBootableImage);
        }
        if self.config.validate_primary || state.swapped {
            let valid = self.validate_for_boot(image_index, &primary, &header)?;
            if update_counter {
                self.raise_counter(image_index, &valid)?;
            }
        }
        info!(
            "Image {}: booting version {}.{} from the primary slot",
            image_index,
            header.version.major,
            header.version.minor
        );
        Ok(BootResponse {
            image_index,
            device: primary.device_id(),
            offset: primary.offset(),
            header,
            load_address: None,
        })
    }

    fn raise_counter(&mut self, image_index: u8, valid: &ValidImage) -> Result<(), Error> {
        match valid.security_counter {
            Some(value) => self.counters.update(image_index, value),
            None => Ok(()),
        }
    }

    /// Bytes that must move for both images to change places.
    fn copy_size(
        &mut self,
        primary: &FlashArea,
        secondary: &FlashArea,
        headers: &[ImageHeader; 2],
    ) -> Result<u32, Error> {
        let mut size = 0u32;
        for (area, header) in [(primary, &headers[0]), (secondary, &headers[1])] {
            if header.has_magic() {
                size = size.max(image_total_size(&mut self.devices, header, area)?);
            }
        }
        Ok(size)
    }

    /// Image keys of both slots, for swaps crossing the secondary slot.
    fn load_keys(
        &mut self,
        primary: &FlashArea,
        secondary: &FlashArea,
        headers: &[ImageHeader; 2],
    ) -> Result<[Option<ImageKey>; 2], Error> {
        let mut keys = [None, None];
        for (slot, area) in [(Slot::Primary, primary), (Slot::Secondary, secondary)] {
            let header = &headers[slot.index()];
            if header.has_magic() && header.is_encrypted() {
                keys[slot.index()] =
                    load_image_key(&mut self.devices, header, area, self.validator.decryption())?;
            }
        }
        Ok(keys)
    }
}

/// Validates `area` for booting. With fault hardening the check runs twice
/// and both runs must agree on the digest. Untrusted images come back as
/// [`Error::NoBootableImage`].
fn decide<E: FlashDevices, V: SignatureVerifier>(
    validator: &Validator<'_, V>,
    fault_hardening: bool,
    devices: &mut E,
    image_index: u8,
    area: &FlashArea,
    header: &ImageHeader,
    min_counter: u32,
) -> Result<ValidImage, Error> {
    let result = if fault_hardening {
        fih::check_twice(|| validator.validate(&mut *devices, image_index, area, header, min_counter)).and_then(
            |(valid, verdict)| {
                let decision = verdict.and(FihBool::new(valid.header == *header))?;
                if decision.is_true()? {
                    Ok(valid)
                } else {
                    Err(Error::Panic("boot decision disagrees with validation"))
                }
            },
        )
    } else {
        validator.validate(devices, image_index, area, header, min_counter)
    };
    result.map_err(|e| {
        error!("Image {}: {} slot is not valid ({})", image_index, slot_name(area), e.as_str());
        if e.is_untrusted() {
            Error::NoBootableImage
        } else {
            e
        }
    })
}

fn slot_name(area: &FlashArea) -> &'static str {
    match area.id() {
        AreaId::Primary(_) => Slot::Primary.as_str(),
        AreaId::Secondary(_) => Slot::Secondary.as_str(),
        _ => "other",
    }
}

/// Last resort when no image can be trusted: report and spin. Running
/// anything from here could mean running unverified code.
pub fn halt(error: Error) -> ! {
    error!("Unable to boot: {}", error.as_str());
    loop {
        core::hint::spin_loop();
    }
}
