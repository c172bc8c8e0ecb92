//! Firmware image format.
//!
//! An image is laid out as
//! `[header][body][protected TLV info + TLVs][TLV info + TLVs]` from the
//! start of its slot. The header is a fixed 32 byte little endian record;
//! everything describing the image beyond its size (hash, signature, key
//! material, security counter, dependencies) lives in the TLV area.

use crate::{
    devices::flash_map::{FlashArea, FlashDevices},
    error::Error,
    utilities::cursor::Cursor,
};
use core::cmp::Ordering;

pub mod tlv;

#[cfg(not(target_arch = "arm"))]
pub mod builder;

pub const IMAGE_MAGIC: u32 = 0x96f3_b83d;
pub const HEADER_SIZE: usize = 32;

/// Header flag bits.
pub mod flags {
    /// Position independent image.
    pub const PIC: u32 = 0x0000_0001;
    pub const ENCRYPTED_AES128: u32 = 0x0000_0004;
    pub const ENCRYPTED_AES256: u32 = 0x0000_0008;
    /// Image is only meant to be consumed by another image.
    pub const NON_BOOTABLE: u32 = 0x0000_0010;
    /// Image is copied to RAM before it runs.
    pub const RAM_LOAD: u32 = 0x0000_0020;

    pub const ENCRYPTED: u32 = ENCRYPTED_AES128 | ENCRYPTED_AES256;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build_num: u32,
}

impl ImageVersion {
    pub const SIZE: usize = 8;

    pub const fn new(major: u8, minor: u8, revision: u16, build_num: u32) -> Self {
        Self { major, minor, revision, build_num }
    }

    /// Orders versions by major, minor and revision. The build number is
    /// informative only and never makes an image newer.
    pub fn semantic_cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.revision).cmp(&(other.major, other.minor, other.revision))
    }

    pub(crate) fn decode(cursor: &mut Cursor) -> Result<Self, Error> {
        Ok(Self {
            major: cursor.read_u8()?,
            minor: cursor.read_u8()?,
            revision: cursor.read_u16()?,
            build_num: cursor.read_u32()?,
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.major;
        bytes[1] = self.minor;
        bytes[2..4].copy_from_slice(&self.revision.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.build_num.to_le_bytes());
        bytes
    }
}

/// Image header, decoded verbatim. Decoding never fails on content, so
/// erased or garbage headers can still be inspected; [`ImageHeader::check`]
/// decides whether the header describes a plausible image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: u32,
    pub load_address: u32,
    pub header_size: u16,
    pub protected_tlv_size: u16,
    pub image_size: u32,
    pub flags: u32,
    pub version: ImageVersion,
}

impl ImageHeader {
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let half = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        Self {
            magic: word(0),
            load_address: word(4),
            header_size: half(8),
            protected_tlv_size: half(10),
            image_size: word(12),
            flags: word(16),
            version: ImageVersion {
                major: bytes[20],
                minor: bytes[21],
                revision: half(22),
                build_num: word(24),
            },
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.load_address.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.header_size.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.protected_tlv_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.image_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.flags.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.version.encode());
        bytes
    }

    /// Reads the raw header at the start of an area.
    pub fn read<D: FlashDevices>(devices: &mut D, area: &FlashArea) -> Result<Self, Error> {
        Self::read_at(devices, area, 0)
    }

    pub fn read_at<D: FlashDevices>(
        devices: &mut D,
        area: &FlashArea,
        offset: u32,
    ) -> Result<Self, Error> {
        let mut bytes = [0u8; HEADER_SIZE];
        area.read(devices, offset, &mut bytes)?;
        Ok(Self::decode(&bytes))
    }

    pub fn has_magic(&self) -> bool { self.magic == IMAGE_MAGIC }

    /// Whether the magic reads as erased flash, i.e. the slot holds no image.
    pub fn is_erased(&self, erased_value: u8) -> bool {
        self.magic == u32::from_le_bytes([erased_value; 4])
    }

    pub fn is_encrypted(&self) -> bool { self.flags & flags::ENCRYPTED != 0 }
    pub fn is_bootable(&self) -> bool { self.flags & flags::NON_BOOTABLE == 0 }

    /// Offset of the first TLV info record.
    pub fn tlv_offset(&self) -> Result<u32, Error> {
        (self.header_size as u32)
            .checked_add(self.image_size)
            .ok_or(Error::BadImage("image size overflows"))
    }

    /// Checks the magic and that header and body fit in `area_size`.
    pub fn check(&self, area_size: u32) -> Result<(), Error> {
        if !self.has_magic() {
            return Err(Error::BadImage("bad header magic"));
        }
        if (self.header_size as usize) < HEADER_SIZE {
            return Err(Error::BadImage("header size too small"));
        }
        if self.tlv_offset()? >= area_size {
            return Err(Error::BadImage("image larger than its slot"));
        }
        Ok(())
    }
}

/// Reads and checks the header of the image stored in `area`.
pub fn parse_header<D: FlashDevices>(devices: &mut D, area: &FlashArea) -> Result<ImageHeader, Error> {
    let header = ImageHeader::read(devices, area)?;
    header.check(area.size())?;
    Ok(header)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        devices::flash_map::{AreaDescriptor, AreaId, FlashMap},
        hal::doubles::flash::FakeFlash,
    };

    fn header() -> ImageHeader {
        ImageHeader {
            magic: IMAGE_MAGIC,
            load_address: 0,
            header_size: 0x200,
            protected_tlv_size: 0,
            image_size: 0x1000,
            flags: 0,
            version: ImageVersion::new(1, 2, 3, 4),
        }
    }

    fn slot(devices: &mut [FakeFlash; 1]) -> FlashArea {
        FlashMap::new(&[AreaDescriptor { id: AreaId::Primary(0), device: 0, offset: 0, size: 0x2000 }], 1)
            .unwrap()
            .open(devices, AreaId::Primary(0))
            .unwrap()
    }

    #[rustfmt::skip]
    const RAW_HEADER: [u8; HEADER_SIZE] = [
        0x3d, 0xb8, 0xf3, 0x96, // magic
        0x00, 0x00, 0x00, 0x00, // load address
        0x00, 0x02,             // header size
        0x00, 0x00,             // protected TLV size
        0x00, 0x10, 0x00, 0x00, // image size
        0x00, 0x00, 0x00, 0x00, // flags
        0x01, 0x02, 0x03, 0x00, // major, minor, revision
        0x04, 0x00, 0x00, 0x00, // build number
        0x00, 0x00, 0x00, 0x00, // padding
    ];

    #[test]
    fn header_decodes_from_little_endian_bytes() {
        assert_eq!(ImageHeader::decode(&RAW_HEADER), header());
        assert_eq!(header().encode(), RAW_HEADER);
    }

    #[test]
    fn size_invariant_is_overflow_safe() {
        let mut oversized = header();
        oversized.image_size = u32::MAX - 0x10;
        assert_eq!(oversized.check(0x2000), Err(Error::BadImage("image size overflows")));

        let mut exact = header();
        exact.image_size = 0x2000 - 0x200;
        assert_eq!(exact.check(0x2000), Err(Error::BadImage("image larger than its slot")));
        exact.image_size -= 1;
        assert_eq!(exact.check(0x2000), Ok(()));
    }

    #[test]
    fn parsing_an_erased_slot_reports_a_bad_image() {
        let mut devices = [FakeFlash::uniform(2, 0x1000)];
        let area = slot(&mut devices);
        let raw = ImageHeader::read(&mut devices, &area).unwrap();
        assert!(raw.is_erased(0xFF));
        assert_eq!(parse_header(&mut devices, &area), Err(Error::BadImage("bad header magic")));

        devices[0].load(0, &RAW_HEADER);
        assert_eq!(parse_header(&mut devices, &area), Ok(header()));
    }

    #[test]
    fn build_number_does_not_order_versions() {
        let older = ImageVersion::new(1, 2, 3, 100);
        let newer = ImageVersion::new(1, 3, 0, 0);
        assert_eq!(older.semantic_cmp(&newer), Ordering::Less);
        assert_eq!(
            ImageVersion::new(1, 2, 3, 1).semantic_cmp(&ImageVersion::new(1, 2, 3, 9)),
            Ordering::Equal
        );
    }
}
