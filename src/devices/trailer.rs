//! Slot trailer: the commit record at the end of every slot.
//!
//! Fields are laid out backwards from the end of the area, each one padded
//! to `max_align` so that it can be programmed on its own:
//!
//! ```text
//!   [status log][key 1][key 0][swap_size][swap_info][copy_done][image_ok][magic]
//! ```
//!
//! The magic is always the last field written when a trailer is created,
//! so an interrupted sequence reads back as an unset trailer.
use crate::{
    devices::{
        crypto::encryption::{ImageKey, IMAGE_KEY_SIZE},
        flash_map::{AreaId, FlashArea, FlashDevices, Slot, MAX_IMG_SECTORS},
    },
    error::Error,
    logging::{debug, warn},
    utilities::memory::align_up,
};

pub const BOOT_MAGIC: [u8; MAGIC_SIZE] = [
    0x77, 0xc2, 0x95, 0xf3, 0x60, 0xd2, 0xef, 0x7f, 0x35, 0x52, 0x50, 0x0f, 0x2c, 0xb6, 0x79, 0x80,
];
pub const MAGIC_SIZE: usize = 16;
/// Largest supported trailer alignment.
pub const MAX_ALIGN_LIMIT: usize = 32;
/// Status log entries per swap step.
pub const STATUS_STATE_COUNT: usize = 3;
const FLAG_SET: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Magic {
    Good,
    Unset,
    Bad,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Flag {
    Set,
    Unset,
    Bad,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SwapType {
    /// Nothing to do, boot the primary slot.
    None = 1,
    /// Swap, and revert on the next boot unless confirmed.
    Test = 2,
    /// Swap for good.
    Perm = 3,
    /// Undo an unconfirmed test swap.
    Revert = 4,
    /// The candidate failed validation.
    Fail = 5,
    /// Unrecoverable state.
    Panic = 0xff,
}

impl SwapType {
    /// Decodes the low nibble of a `swap_info` byte. Values past `Revert`
    /// are never persisted.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(SwapType::None),
            2 => Some(SwapType::Test),
            3 => Some(SwapType::Perm),
            4 => Some(SwapType::Revert),
            _ => None,
        }
    }

    /// Types that move images between slots.
    pub fn is_upgrade(self) -> bool {
        matches!(self, SwapType::Test | SwapType::Perm | SwapType::Revert)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapType::None => "none",
            SwapType::Test => "test",
            SwapType::Perm => "perm",
            SwapType::Revert => "revert",
            SwapType::Fail => "fail",
            SwapType::Panic => "panic",
        }
    }
}

/// Decoded trailer of one area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapState {
    pub magic: Magic,
    pub swap_type: SwapType,
    pub image_num: u8,
    pub copy_done: Flag,
    pub image_ok: Flag,
}

/// Trailer geometry shared by every area of a build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trailer {
    max_align: usize,
    encryption: bool,
}

impl Trailer {
    pub fn new(max_align: usize, encryption: bool) -> Result<Self, Error> {
        if max_align == 0 || max_align > MAX_ALIGN_LIMIT || !max_align.is_power_of_two() {
            return Err(Error::BadArgs("unsupported trailer alignment"));
        }
        Ok(Self { max_align, encryption })
    }

    pub fn max_align(&self) -> usize { self.max_align }
    pub fn encryption(&self) -> bool { self.encryption }

    fn field_size(&self) -> u32 { self.max_align as u32 }
    pub fn magic_size(&self) -> u32 { align_up(MAGIC_SIZE, self.max_align) as u32 }
    pub fn key_size(&self) -> u32 { align_up(IMAGE_KEY_SIZE, self.max_align) as u32 }

    /// Everything but the status log.
    pub fn info_size(&self) -> u32 {
        let keys = if self.encryption { 2 * self.key_size() } else { 0 };
        keys + 4 * self.field_size() + self.magic_size()
    }

    /// Trailer of a slot whose device programs `write_size` bytes at a time.
    pub fn slot_size(&self, write_size: usize) -> u32 {
        (MAX_IMG_SECTORS * STATUS_STATE_COUNT * write_size) as u32 + self.info_size()
    }

    /// The scratch area only ever logs one step.
    pub fn scratch_size(&self, write_size: usize) -> u32 {
        (STATUS_STATE_COUNT * write_size) as u32 + self.info_size()
    }

    /// Bytes the trailer occupies at the end of `area`.
    pub fn size_in(&self, area: &FlashArea) -> u32 {
        match area.id() {
            AreaId::Scratch => self.scratch_size(area.align()),
            _ => self.slot_size(area.align()),
        }
    }

    /// Checks that `area` can hold a trailer at all. Offsets below are
    /// only meaningful for areas passing this check.
    pub fn check(&self, area: &FlashArea) -> Result<(), Error> {
        if area.align() > self.max_align {
            return Err(Error::BadArgs("device write size exceeds trailer alignment"));
        }
        if self.size_in(area) > area.size() {
            return Err(Error::InsufficientSpace);
        }
        Ok(())
    }

    pub fn magic_offset(&self, area: &FlashArea) -> u32 { area.size() - self.magic_size() }
    pub fn image_ok_offset(&self, area: &FlashArea) -> u32 {
        self.magic_offset(area) - self.field_size()
    }
    pub fn copy_done_offset(&self, area: &FlashArea) -> u32 {
        self.image_ok_offset(area) - self.field_size()
    }
    pub fn swap_info_offset(&self, area: &FlashArea) -> u32 {
        self.copy_done_offset(area) - self.field_size()
    }
    pub fn swap_size_offset(&self, area: &FlashArea) -> u32 {
        self.swap_info_offset(area) - self.field_size()
    }
    pub fn key_offset(&self, area: &FlashArea, slot: Slot) -> u32 {
        self.swap_size_offset(area) - (slot.index() as u32 + 1) * self.key_size()
    }
    pub fn status_offset(&self, area: &FlashArea) -> u32 { area.size() - self.size_in(area) }

    pub fn read_magic<D: FlashDevices>(&self, devices: &mut D, area: &FlashArea) -> Result<Magic, Error> {
        self.check(area)?;
        let mut magic = [0u8; MAGIC_SIZE];
        area.read(devices, area.size() - MAGIC_SIZE as u32, &mut magic)?;
        Ok(if magic == BOOT_MAGIC {
            Magic::Good
        } else if area.is_erased(&magic) {
            Magic::Unset
        } else {
            Magic::Bad
        })
    }

    fn read_byte<D: FlashDevices>(devices: &mut D, area: &FlashArea, offset: u32) -> Result<u8, Error> {
        let mut byte = [0u8];
        area.read(devices, offset, &mut byte)?;
        Ok(byte[0])
    }

    fn read_flag<D: FlashDevices>(devices: &mut D, area: &FlashArea, offset: u32) -> Result<Flag, Error> {
        let raw = Self::read_byte(devices, area, offset)?;
        Ok(if raw == FLAG_SET {
            Flag::Set
        } else if raw == area.erased_value() {
            Flag::Unset
        } else {
            Flag::Bad
        })
    }

    pub fn read_swap_state<D: FlashDevices>(
        &self,
        devices: &mut D,
        area: &FlashArea,
    ) -> Result<SwapState, Error> {
        let magic = self.read_magic(devices, area)?;
        let info = Self::read_byte(devices, area, self.swap_info_offset(area))?;
        let (swap_type, image_num) = if info == area.erased_value() {
            (SwapType::None, 0)
        } else {
            match SwapType::from_u8(info & 0x0F) {
                Some(swap_type) => (swap_type, info >> 4),
                None => (SwapType::None, 0),
            }
        };
        Ok(SwapState {
            magic,
            swap_type,
            image_num,
            copy_done: Self::read_flag(devices, area, self.copy_done_offset(area))?,
            image_ok: Self::read_flag(devices, area, self.image_ok_offset(area))?,
        })
    }

    pub fn read_swap_size<D: FlashDevices>(&self, devices: &mut D, area: &FlashArea) -> Result<u32, Error> {
        self.check(area)?;
        let mut raw = [0u8; 4];
        area.read(devices, self.swap_size_offset(area), &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Image key persisted for an in-flight swap. `None` when the field
    /// was never written.
    pub fn read_image_key<D: FlashDevices>(
        &self,
        devices: &mut D,
        area: &FlashArea,
        slot: Slot,
    ) -> Result<Option<ImageKey>, Error> {
        self.check(area)?;
        let mut key = [0u8; IMAGE_KEY_SIZE];
        area.read(devices, self.key_offset(area, slot), &mut key)?;
        Ok(if area.is_erased(&key) { None } else { Some(ImageKey::new(key)) })
    }

    /// Programs one field, padded with the erased value up to the device
    /// write size.
    fn write_field<D: FlashDevices>(
        &self,
        devices: &mut D,
        area: &FlashArea,
        offset: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        self.check(area)?;
        let mut buffer = [area.erased_value(); MAX_ALIGN_LIMIT];
        let length = align_up(data.len(), area.align());
        let padded = buffer.get_mut(..length).ok_or(Error::BadArgs("trailer field too large"))?;
        padded[..data.len()].copy_from_slice(data);
        area.write(devices, offset, padded)
    }

    pub fn write_magic<D: FlashDevices>(&self, devices: &mut D, area: &FlashArea) -> Result<(), Error> {
        self.check(area)?;
        let mut buffer = [area.erased_value(); align_up(MAGIC_SIZE, MAX_ALIGN_LIMIT)];
        let size = self.magic_size() as usize;
        let magic = &mut buffer[..size];
        magic[size - MAGIC_SIZE..].copy_from_slice(&BOOT_MAGIC);
        area.write(devices, self.magic_offset(area), magic)
    }

    pub fn write_image_ok<D: FlashDevices>(&self, devices: &mut D, area: &FlashArea) -> Result<(), Error> {
        self.write_field(devices, area, self.image_ok_offset(area), &[FLAG_SET])
    }

    pub fn write_copy_done<D: FlashDevices>(&self, devices: &mut D, area: &FlashArea) -> Result<(), Error> {
        self.write_field(devices, area, self.copy_done_offset(area), &[FLAG_SET])
    }

    pub fn write_swap_info<D: FlashDevices>(
        &self,
        devices: &mut D,
        area: &FlashArea,
        image_num: u8,
        swap_type: SwapType,
    ) -> Result<(), Error> {
        let info = (image_num << 4) | (swap_type as u8 & 0x0F);
        self.write_field(devices, area, self.swap_info_offset(area), &[info])
    }

    pub fn write_swap_size<D: FlashDevices>(
        &self,
        devices: &mut D,
        area: &FlashArea,
        swap_size: u32,
    ) -> Result<(), Error> {
        self.write_field(devices, area, self.swap_size_offset(area), &swap_size.to_le_bytes())
    }

    pub fn write_image_key<D: FlashDevices>(
        &self,
        devices: &mut D,
        area: &FlashArea,
        slot: Slot,
        key: &ImageKey,
    ) -> Result<(), Error> {
        if !self.encryption {
            return Err(Error::BadArgs("trailer has no key fields"));
        }
        self.write_field(devices, area, self.key_offset(area, slot), key.as_bytes())
    }

    /// Schedules the image in a secondary slot for a swap on the next boot,
    /// for testing or, with `permanent`, for good. Fields already written
    /// by an interrupted earlier call are left alone.
    pub fn mark_pending<D: FlashDevices>(
        &self,
        devices: &mut D,
        secondary: &FlashArea,
        permanent: bool,
    ) -> Result<(), Error> {
        let state = self.read_swap_state(devices, secondary)?;
        match state.magic {
            Magic::Good => Ok(()),
            Magic::Bad => {
                warn!("Secondary trailer is corrupt, erasing the slot");
                secondary.erase(devices, 0, secondary.size())?;
                Err(Error::BadImage("corrupt secondary trailer"))
            }
            Magic::Unset => {
                if permanent && state.image_ok == Flag::Unset {
                    self.write_image_ok(devices, secondary)?;
                }
                let info = Self::read_byte(devices, secondary, self.swap_info_offset(secondary))?;
                if info == secondary.erased_value() {
                    let swap_type = if permanent { SwapType::Perm } else { SwapType::Test };
                    self.write_swap_info(devices, secondary, 0, swap_type)?;
                }
                self.write_magic(devices, secondary)
            }
        }
    }

    /// Confirms the image running from a primary slot, so it is kept
    /// instead of reverted on the next boot.
    pub fn mark_confirmed<D: FlashDevices>(&self, devices: &mut D, primary: &FlashArea) -> Result<(), Error> {
        let state = self.read_swap_state(devices, primary)?;
        match (state.magic, state.image_ok) {
            (Magic::Bad, _) => Err(Error::BadImage("corrupt primary trailer")),
            (Magic::Unset, _) | (Magic::Good, Flag::Set) => {
                debug!("Primary image already confirmed");
                Ok(())
            }
            (Magic::Good, _) => self.write_image_ok(devices, primary),
        }
    }
}

#[derive(Clone, Copy)]
enum MagicPattern {
    Any,
    Good,
    Unset,
}

#[derive(Clone, Copy)]
enum FlagPattern {
    Any,
    Set,
    Unset,
}

impl MagicPattern {
    fn matches(self, magic: Magic) -> bool {
        match self {
            MagicPattern::Any => true,
            MagicPattern::Good => magic == Magic::Good,
            MagicPattern::Unset => magic == Magic::Unset,
        }
    }
}

impl FlagPattern {
    fn matches(self, flag: Flag) -> bool {
        match self {
            FlagPattern::Any => true,
            FlagPattern::Set => flag == Flag::Set,
            FlagPattern::Unset => flag == Flag::Unset,
        }
    }
}

struct SwapRule {
    primary_magic: MagicPattern,
    secondary_magic: MagicPattern,
    primary_image_ok: FlagPattern,
    secondary_image_ok: FlagPattern,
    primary_copy_done: FlagPattern,
    swap_type: SwapType,
}

#[rustfmt::skip]
const SWAP_RULES: [SwapRule; 3] = [
    SwapRule {
        primary_magic: MagicPattern::Any,   secondary_magic: MagicPattern::Good,
        primary_image_ok: FlagPattern::Any, secondary_image_ok: FlagPattern::Unset,
        primary_copy_done: FlagPattern::Any,
        swap_type: SwapType::Test,
    },
    SwapRule {
        primary_magic: MagicPattern::Any,   secondary_magic: MagicPattern::Good,
        primary_image_ok: FlagPattern::Any, secondary_image_ok: FlagPattern::Set,
        primary_copy_done: FlagPattern::Any,
        swap_type: SwapType::Perm,
    },
    SwapRule {
        primary_magic: MagicPattern::Good,    secondary_magic: MagicPattern::Unset,
        primary_image_ok: FlagPattern::Unset, secondary_image_ok: FlagPattern::Any,
        primary_copy_done: FlagPattern::Set,
        swap_type: SwapType::Revert,
    },
];

/// Decides what to do from the two trailers alone. First matching rule
/// wins, anything undocumented means there is nothing to do.
pub fn swap_type_for(primary: &SwapState, secondary: &SwapState) -> SwapType {
    SWAP_RULES
        .iter()
        .find(|rule| {
            rule.primary_magic.matches(primary.magic)
                && rule.secondary_magic.matches(secondary.magic)
                && rule.primary_image_ok.matches(primary.image_ok)
                && rule.secondary_image_ok.matches(secondary.image_ok)
                && rule.primary_copy_done.matches(primary.copy_done)
        })
        .map_or(SwapType::None, |rule| rule.swap_type)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        devices::flash_map::{AreaDescriptor, FlashMap},
        hal::doubles::flash::FakeFlash,
    };

    fn open(devices: &mut [FakeFlash; 1], id: AreaId) -> FlashArea {
        FlashMap::new(
            &[
                AreaDescriptor { id: AreaId::Primary(0), device: 0, offset: 0, size: 0x8000 },
                AreaDescriptor { id: AreaId::Scratch, device: 0, offset: 0x8000, size: 0x1000 },
            ],
            1,
        )
        .unwrap()
        .open(devices, id)
        .unwrap()
    }

    fn state(magic: Magic, image_ok: Flag, copy_done: Flag) -> SwapState {
        SwapState { magic, swap_type: SwapType::None, image_num: 0, copy_done, image_ok }
    }

    #[test]
    fn field_offsets_follow_the_alignment() {
        let mut devices = [FakeFlash::uniform(9, 0x1000)];
        let slot = open(&mut devices, AreaId::Primary(0));
        let trailer = Trailer::new(8, true).unwrap();

        assert_eq!(trailer.magic_offset(&slot), 0x8000 - 16);
        assert_eq!(trailer.image_ok_offset(&slot), 0x8000 - 24);
        assert_eq!(trailer.copy_done_offset(&slot), 0x8000 - 32);
        assert_eq!(trailer.swap_info_offset(&slot), 0x8000 - 40);
        assert_eq!(trailer.swap_size_offset(&slot), 0x8000 - 48);
        assert_eq!(trailer.key_offset(&slot, Slot::Primary), 0x8000 - 64);
        assert_eq!(trailer.key_offset(&slot, Slot::Secondary), 0x8000 - 80);
        assert_eq!(trailer.info_size(), 80);
        assert_eq!(trailer.size_in(&slot), 128 * 3 * 8 + 80);
        assert_eq!(trailer.status_offset(&slot), 0x8000 - 3152);

        let scratch = open(&mut devices, AreaId::Scratch);
        assert_eq!(trailer.size_in(&scratch), 3 * 8 + 80);
        assert_eq!(Trailer::new(32, false).unwrap().magic_size(), 32);
        assert!(Trailer::new(12, false).is_err());
    }

    #[test]
    fn erased_trailers_read_as_unset() {
        let mut devices = [FakeFlash::uniform(9, 0x1000).with_erased_value(0x00)];
        let slot = open(&mut devices, AreaId::Primary(0));
        let trailer = Trailer::new(8, false).unwrap();

        let state = trailer.read_swap_state(&mut devices, &slot).unwrap();

        assert_eq!(state.magic, Magic::Unset);
        assert_eq!(state.image_ok, Flag::Unset);
        assert_eq!(state.copy_done, Flag::Unset);
        assert_eq!(state.swap_type, SwapType::None);
    }

    #[test]
    fn written_fields_read_back() {
        // Given
        let mut devices = [FakeFlash::uniform(9, 0x1000)];
        let slot = open(&mut devices, AreaId::Primary(0));
        let trailer = Trailer::new(8, true).unwrap();
        let key = ImageKey::new([0x24; 16]);

        // When
        trailer.write_swap_info(&mut devices, &slot, 2, SwapType::Perm).unwrap();
        trailer.write_swap_size(&mut devices, &slot, 0x1234).unwrap();
        trailer.write_image_key(&mut devices, &slot, Slot::Secondary, &key).unwrap();
        trailer.write_copy_done(&mut devices, &slot).unwrap();
        trailer.write_magic(&mut devices, &slot).unwrap();

        // Then
        let state = trailer.read_swap_state(&mut devices, &slot).unwrap();
        assert_eq!(state.magic, Magic::Good);
        assert_eq!(state.swap_type, SwapType::Perm);
        assert_eq!(state.image_num, 2);
        assert_eq!(state.copy_done, Flag::Set);
        assert_eq!(state.image_ok, Flag::Unset);
        assert_eq!(trailer.read_swap_size(&mut devices, &slot), Ok(0x1234));
        assert_eq!(trailer.read_image_key(&mut devices, &slot, Slot::Secondary), Ok(Some(key)));
        assert_eq!(trailer.read_image_key(&mut devices, &slot, Slot::Primary), Ok(None));
    }

    #[test]
    fn garbage_magic_and_flags_read_as_bad() {
        let mut devices = [FakeFlash::uniform(9, 0x1000)];
        let slot = open(&mut devices, AreaId::Primary(0));
        let trailer = Trailer::new(8, false).unwrap();
        devices[0].load(0x8000 - 16, &[0x12; 16]);
        devices[0].load(trailer.image_ok_offset(&slot), &[0x7E]);
        devices[0].load(trailer.swap_info_offset(&slot), &[0x09]);

        let state = trailer.read_swap_state(&mut devices, &slot).unwrap();
        assert_eq!(state.magic, Magic::Bad);
        assert_eq!(state.image_ok, Flag::Bad);
        assert_eq!(state.swap_type, SwapType::None);
    }

    #[test]
    fn swap_table_covers_the_documented_rows() {
        use Flag::{Set, Unset};
        let confirmed = state(Magic::Good, Set, Set);
        let pending = state(Magic::Good, Unset, Unset);
        let pending_perm = state(Magic::Good, Set, Unset);
        let empty = state(Magic::Unset, Unset, Unset);
        let swapped = state(Magic::Good, Unset, Set);

        assert_eq!(swap_type_for(&confirmed, &pending), SwapType::Test);
        assert_eq!(swap_type_for(&empty, &pending), SwapType::Test);
        assert_eq!(swap_type_for(&confirmed, &pending_perm), SwapType::Perm);
        assert_eq!(swap_type_for(&swapped, &empty), SwapType::Revert);
        assert_eq!(swap_type_for(&confirmed, &empty), SwapType::None);
        assert_eq!(swap_type_for(&empty, &empty), SwapType::None);
        assert_eq!(swap_type_for(&swapped, &state(Magic::Bad, Unset, Unset)), SwapType::None);
    }

    #[test]
    fn interrupted_mark_pending_can_be_repeated() {
        // Given a power loss right before the magic is written
        let mut devices = [FakeFlash::uniform(9, 0x1000)];
        let slot = open(&mut devices, AreaId::Primary(0));
        let trailer = Trailer::new(8, false).unwrap();
        devices[0].lose_power_after(2);
        assert!(trailer.mark_pending(&mut devices, &slot, true).is_err());
        devices[0].power_cycle();
        assert_eq!(trailer.read_magic(&mut devices, &slot), Ok(Magic::Unset));

        // When
        trailer.mark_pending(&mut devices, &slot, true).unwrap();

        // Then
        let state = trailer.read_swap_state(&mut devices, &slot).unwrap();
        assert_eq!(state.magic, Magic::Good);
        assert_eq!(state.image_ok, Flag::Set);
        assert_eq!(state.swap_type, SwapType::Perm);
        assert_eq!(trailer.mark_pending(&mut devices, &slot, false), Ok(()));
    }

    #[test]
    fn confirming_is_idempotent() {
        let mut devices = [FakeFlash::uniform(9, 0x1000)];
        let slot = open(&mut devices, AreaId::Primary(0));
        let trailer = Trailer::new(8, false).unwrap();

        trailer.mark_confirmed(&mut devices, &slot).unwrap();
        assert_eq!(trailer.read_swap_state(&mut devices, &slot).unwrap().image_ok, Flag::Unset);

        trailer.write_magic(&mut devices, &slot).unwrap();
        trailer.mark_confirmed(&mut devices, &slot).unwrap();
        trailer.mark_confirmed(&mut devices, &slot).unwrap();
        assert_eq!(trailer.read_swap_state(&mut devices, &slot).unwrap().image_ok, Flag::Set);
    }
}
