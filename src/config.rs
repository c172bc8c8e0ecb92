//! Boot policy and flash layout, chosen once at startup.
//!
//! A [`BootConfig`] is usually written by hand in the board support code,
//! or deserialized from RON with the `serde` feature (see
//! `sample_configurations/`). Nothing in it changes while the boot core
//! runs.
use crate::{
    devices::{
        flash_map::{AreaDescriptor, AreaId, FlashMap, MAX_AREAS, MAX_IMAGES},
        trailer::Trailer,
    },
    error::Error,
    logging::error,
};
use core::fmt::{self, Display};
use heapless::Vec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How a swap exchanges the two slots of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SwapMethod {
    /// Spans go through a dedicated scratch area.
    Scratch,
    /// Primary sectors are shifted up by one, then swapped sector by sector.
    Move,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UpgradeMode {
    /// Power-loss safe exchange with test, confirm and revert.
    Swap(SwapMethod),
    /// The candidate replaces the primary image, which is lost.
    Overwrite { downgrade_prevention: bool },
    /// Images run from whichever slot holds the newest valid one.
    DirectXip { revert: bool },
    /// A single slot per image, decrypted in place if needed.
    PrimaryOnly,
    /// The newest valid image is copied into RAM and runs from there.
    RamLoad,
}

impl UpgradeMode {
    pub fn needs_secondary(&self) -> bool { !matches!(self, UpgradeMode::PrimaryOnly) }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeMode::Swap(SwapMethod::Scratch) => "swap using scratch",
            UpgradeMode::Swap(SwapMethod::Move) => "swap using move",
            UpgradeMode::Overwrite { .. } => "overwrite only",
            UpgradeMode::DirectXip { .. } => "direct xip",
            UpgradeMode::PrimaryOnly => "primary only",
            UpgradeMode::RamLoad => "ram load",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BootConfig {
    pub mode: UpgradeMode,
    pub image_count: u8,
    /// Alignment of every trailer field, at least the largest write size
    /// among the devices holding slots.
    pub max_align: usize,
    /// Reserve key fields in trailers and accept encrypted images.
    pub encryption: bool,
    /// Validate the primary image on every boot, not just after a swap.
    pub validate_primary: bool,
    /// Require the flash between a candidate image and its trailer to be erased.
    pub check_erased_tail: bool,
    /// Take the final boot decision on doubled, integrity tagged checks.
    pub fault_hardening: bool,
    /// Install a valid secondary image when the primary slot holds
    /// nothing bootable, even though no upgrade was requested.
    pub bootstrap: bool,
    pub areas: Vec<AreaDescriptor, MAX_AREAS>,
}

impl BootConfig {
    pub fn new(mode: UpgradeMode) -> Self {
        Self {
            mode,
            image_count: 1,
            max_align: 8,
            encryption: false,
            validate_primary: true,
            check_erased_tail: false,
            fault_hardening: false,
            bootstrap: false,
            areas: Vec::new(),
        }
    }

    pub fn with_images(mut self, image_count: u8) -> Self {
        self.image_count = image_count;
        self
    }

    pub fn with_max_align(mut self, max_align: usize) -> Self {
        self.max_align = max_align;
        self
    }

    pub fn with_encryption(mut self) -> Self {
        self.encryption = true;
        self
    }

    pub fn validating_primary(mut self, validate_primary: bool) -> Self {
        self.validate_primary = validate_primary;
        self
    }

    pub fn checking_erased_tail(mut self) -> Self {
        self.check_erased_tail = true;
        self
    }

    pub fn with_fault_hardening(mut self) -> Self {
        self.fault_hardening = true;
        self
    }

    pub fn with_bootstrap(mut self) -> Self {
        self.bootstrap = true;
        self
    }

    pub fn with_areas(mut self, areas: &[AreaDescriptor]) -> Result<Self, Error> {
        for area in areas {
            self.areas.push(*area).map_err(|_| Error::BadArgs("too many flash areas"))?;
        }
        Ok(self)
    }

    fn has(&self, id: AreaId) -> bool { self.areas.iter().any(|a| a.id == id) }

    pub fn trailer(&self) -> Result<Trailer, Error> { Trailer::new(self.max_align, self.encryption) }

    pub fn flash_map(&self) -> Result<FlashMap, Error> { FlashMap::new(&self.areas, self.image_count) }

    pub fn complete(&self) -> bool { self.required_configuration_steps().next().is_none() }

    pub fn required_configuration_steps(&self) -> impl Iterator<Item = RequiredConfigurationStep> + '_ {
        let slots = (0..self.image_count.min(MAX_IMAGES)).flat_map(move |image| {
            #[rustfmt::skip]
            let steps = [
                (!self.has(AreaId::Primary(image)))
                    .then_some(RequiredConfigurationStep::PrimarySlot(image)),
                (self.mode.needs_secondary() && !self.has(AreaId::Secondary(image)))
                    .then_some(RequiredConfigurationStep::SecondarySlot(image)),
            ];
            steps.into_iter().flatten()
        });

        #[rustfmt::skip]
        let global = [
            (self.image_count == 0 || self.image_count > MAX_IMAGES)
                .then_some(RequiredConfigurationStep::ImageCount),

            self.trailer().is_err().then_some(RequiredConfigurationStep::TrailerAlignment),

            (self.mode == UpgradeMode::Swap(SwapMethod::Scratch) && !self.has(AreaId::Scratch))
                .then_some(RequiredConfigurationStep::ScratchArea),

            // Images run in place, so there is nowhere to decrypt them to
            (matches!(self.mode, UpgradeMode::DirectXip { .. }) && self.encryption)
                .then_some(RequiredConfigurationStep::DisableEncryption),

            // Only swap and overwrite builds copy between slots
            (self.bootstrap && !matches!(self.mode, UpgradeMode::Swap(_) | UpgradeMode::Overwrite { .. }))
                .then_some(RequiredConfigurationStep::DisableBootstrap),
        ];
        global.into_iter().flatten().chain(slots)
    }

    /// Fails with the first missing step, if any.
    pub fn check(&self) -> Result<(), Error> {
        match self.required_configuration_steps().next() {
            None => Ok(()),
            Some(step) => {
                error!("Boot configuration incomplete: {}", step.as_str());
                Err(Error::BadArgs("incomplete boot configuration"))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequiredConfigurationStep {
    ImageCount,
    TrailerAlignment,
    PrimarySlot(u8),
    SecondarySlot(u8),
    ScratchArea,
    DisableEncryption,
    DisableBootstrap,
}

impl RequiredConfigurationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequiredConfigurationStep::ImageCount => "[Images] Use between one and four images",
            RequiredConfigurationStep::TrailerAlignment => {
                "[Trailer] Use a power of two alignment of at most 32 bytes"
            }
            RequiredConfigurationStep::PrimarySlot(_) => "[Memory Map] Define a primary slot",
            RequiredConfigurationStep::SecondarySlot(_) => "[Memory Map] Define a secondary slot",
            RequiredConfigurationStep::ScratchArea => "[Memory Map] Define a scratch area",
            RequiredConfigurationStep::DisableEncryption => {
                "[Security] Encrypted images can't run in place"
            }
            RequiredConfigurationStep::DisableBootstrap => {
                "[Policy] Bootstrapping needs a swap or overwrite policy"
            }
        }
    }
}

impl Display for RequiredConfigurationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequiredConfigurationStep::PrimarySlot(image)
            | RequiredConfigurationStep::SecondarySlot(image) => {
                write!(f, "{} for image {}", self.as_str(), image)
            }
            _ => f.write_str(self.as_str()),
        }
    }
}
