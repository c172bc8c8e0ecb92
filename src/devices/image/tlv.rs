//! Type-length-value metadata following the image body.
//!
//! The TLV area holds up to two sub-regions: an optional protected one,
//! covered by the image hash, followed by the unprotected one. Each starts
//! with a 4 byte info record `{magic: u16, total: u16}` where `total`
//! includes the info record itself.
use super::ImageHeader;
use crate::{
    devices::flash_map::{FlashArea, FlashDevices},
    error::Error,
    utilities::cursor::Cursor,
};

pub const TLV_INFO_MAGIC: u16 = 0x6907;
pub const TLV_PROT_INFO_MAGIC: u16 = 0x6908;
pub const TLV_INFO_SIZE: u32 = 4;
pub const TLV_ENTRY_SIZE: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TlvType {
    KeyHash,
    PublicKey,
    Sha256,
    Rsa2048Pss,
    Ecdsa224,
    EcdsaSig,
    Rsa3072Pss,
    Ed25519,
    EncRsa2048,
    EncKw,
    EncEc256,
    EncX25519,
    Dependency,
    SecurityCounter,
    BootRecord,
    Unknown(u16),
}

impl TlvType {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0x01 => TlvType::KeyHash,
            0x02 => TlvType::PublicKey,
            0x10 => TlvType::Sha256,
            0x20 => TlvType::Rsa2048Pss,
            0x21 => TlvType::Ecdsa224,
            0x22 => TlvType::EcdsaSig,
            0x23 => TlvType::Rsa3072Pss,
            0x24 => TlvType::Ed25519,
            0x30 => TlvType::EncRsa2048,
            0x31 => TlvType::EncKw,
            0x32 => TlvType::EncEc256,
            0x33 => TlvType::EncX25519,
            0x40 => TlvType::Dependency,
            0x50 => TlvType::SecurityCounter,
            0x60 => TlvType::BootRecord,
            other => TlvType::Unknown(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            TlvType::KeyHash => 0x01,
            TlvType::PublicKey => 0x02,
            TlvType::Sha256 => 0x10,
            TlvType::Rsa2048Pss => 0x20,
            TlvType::Ecdsa224 => 0x21,
            TlvType::EcdsaSig => 0x22,
            TlvType::Rsa3072Pss => 0x23,
            TlvType::Ed25519 => 0x24,
            TlvType::EncRsa2048 => 0x30,
            TlvType::EncKw => 0x31,
            TlvType::EncEc256 => 0x32,
            TlvType::EncX25519 => 0x33,
            TlvType::Dependency => 0x40,
            TlvType::SecurityCounter => 0x50,
            TlvType::BootRecord => 0x60,
            TlvType::Unknown(raw) => raw,
        }
    }

    pub fn is_signature(self) -> bool {
        matches!(
            self,
            TlvType::Rsa2048Pss
                | TlvType::Ecdsa224
                | TlvType::EcdsaSig
                | TlvType::Rsa3072Pss
                | TlvType::Ed25519
        )
    }

    pub fn is_key_transport(self) -> bool {
        matches!(
            self,
            TlvType::EncRsa2048 | TlvType::EncKw | TlvType::EncEc256 | TlvType::EncX25519
        )
    }

    /// Types that are only meaningful when covered by the image hash.
    pub fn requires_protection(self) -> bool {
        matches!(self, TlvType::SecurityCounter | TlvType::Dependency | TlvType::BootRecord)
    }
}

/// A TLV located by the iterator. `offset` points at the payload and is
/// relative to the start of the area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlvEntry {
    pub kind: TlvType,
    pub offset: u32,
    pub length: u16,
    pub protected: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct InfoRecord {
    magic: u16,
    total: u16,
}

fn read_info<D: FlashDevices>(
    devices: &mut D,
    area: &FlashArea,
    offset: u32,
) -> Result<InfoRecord, Error> {
    let mut bytes = [0u8; TLV_INFO_SIZE as usize];
    read_bounded(devices, area, offset, &mut bytes)?;
    let mut cursor = Cursor::new(&bytes);
    Ok(InfoRecord { magic: cursor.read_u16()?, total: cursor.read_u16()? })
}

/// Reads metadata bytes, reporting a region running off the area as a
/// malformed image rather than a caller error.
fn read_bounded<D: FlashDevices>(
    devices: &mut D,
    area: &FlashArea,
    offset: u32,
    bytes: &mut [u8],
) -> Result<(), Error> {
    area.read(devices, offset, bytes).map_err(|e| match e {
        Error::OutOfBounds => Error::BadImage("TLV area out of bounds"),
        other => other,
    })
}

/// Walks the TLV area of one image.
///
/// Region boundaries are established once from the info records; every
/// entry header and payload is then checked against the end of the region
/// it belongs to before the cursor moves past it.
#[derive(Clone, Debug)]
pub struct TlvIter {
    wanted: Option<TlvType>,
    protected_only: bool,
    cursor: u32,
    protected_end: u32,
    end: u32,
    has_protected: bool,
}

impl TlvIter {
    pub fn begin<D: FlashDevices>(
        devices: &mut D,
        header: &ImageHeader,
        area: &FlashArea,
        wanted: Option<TlvType>,
        protected_only: bool,
    ) -> Result<Self, Error> {
        let start = header.tlv_offset()?;
        let first = read_info(devices, area, start)?;

        let (has_protected, protected_end) = if first.magic == TLV_PROT_INFO_MAGIC {
            if first.total != header.protected_tlv_size {
                return Err(Error::BadImage("protected TLV size mismatch"));
            }
            if (first.total as u32) < TLV_INFO_SIZE {
                return Err(Error::BadImage("protected TLV info truncated"));
            }
            (true, start + first.total as u32)
        } else {
            if header.protected_tlv_size != 0 {
                return Err(Error::BadImage("protected TLV area missing"));
            }
            (false, start)
        };

        let info = read_info(devices, area, protected_end)?;
        if info.magic != TLV_INFO_MAGIC {
            return Err(Error::BadImage("bad TLV info magic"));
        }
        if (info.total as u32) < TLV_INFO_SIZE {
            return Err(Error::BadImage("TLV info truncated"));
        }
        let end = protected_end
            .checked_add(info.total as u32)
            .filter(|end| *end <= area.size())
            .ok_or(Error::BadImage("TLV area exceeds its slot"))?;

        Ok(Self {
            wanted,
            protected_only,
            cursor: start + TLV_INFO_SIZE,
            protected_end,
            end,
            has_protected,
        })
    }

    /// Offset one past the last TLV byte, i.e. the total image footprint.
    pub fn end(&self) -> u32 { self.end }
    pub fn protected_end(&self) -> u32 { self.protected_end }

    pub fn next<D: FlashDevices>(
        &mut self,
        devices: &mut D,
        area: &FlashArea,
    ) -> Result<Option<TlvEntry>, Error> {
        loop {
            if self.has_protected && self.cursor == self.protected_end {
                // Unprotected info record.
                self.cursor += TLV_INFO_SIZE;
            }
            if self.cursor >= self.end {
                return Ok(None);
            }
            let protected = self.cursor < self.protected_end;
            if self.protected_only && !protected {
                return Ok(None);
            }
            let region_end = if protected { self.protected_end } else { self.end };

            if region_end - self.cursor < TLV_ENTRY_SIZE {
                return Err(Error::BadImage("TLV header crosses its region"));
            }
            let mut raw = [0u8; TLV_ENTRY_SIZE as usize];
            read_bounded(devices, area, self.cursor, &mut raw)?;
            let mut fields = Cursor::new(&raw);
            let kind = TlvType::from_u16(fields.read_u16()?);
            let length = fields.read_u16()?;

            let payload = self.cursor + TLV_ENTRY_SIZE;
            if region_end - payload < length as u32 {
                return Err(Error::BadImage("TLV length exceeds its region"));
            }
            self.cursor = payload + length as u32;

            if self.wanted.map_or(true, |wanted| wanted == kind) {
                return Ok(Some(TlvEntry { kind, offset: payload, length, protected }));
            }
        }
    }
}

/// First TLV of a given type, if any.
pub fn find<D: FlashDevices>(
    devices: &mut D,
    header: &ImageHeader,
    area: &FlashArea,
    kind: TlvType,
    protected_only: bool,
) -> Result<Option<TlvEntry>, Error> {
    TlvIter::begin(devices, header, area, Some(kind), protected_only)?.next(devices, area)
}

/// Copies a TLV payload into `buffer`, which must be at least as large.
pub fn read_payload<'b, D: FlashDevices>(
    devices: &mut D,
    area: &FlashArea,
    entry: &TlvEntry,
    buffer: &'b mut [u8],
) -> Result<&'b [u8], Error> {
    let payload = buffer
        .get_mut(..entry.length as usize)
        .ok_or(Error::BadImage("TLV payload larger than expected"))?;
    read_bounded(devices, area, entry.offset, payload)?;
    Ok(payload)
}

/// Reads a fixed size TLV payload, rejecting any other length.
pub fn read_exact<const N: usize, D: FlashDevices>(
    devices: &mut D,
    area: &FlashArea,
    entry: &TlvEntry,
) -> Result<[u8; N], Error> {
    if entry.length as usize != N {
        return Err(Error::BadImage("unexpected TLV length"));
    }
    let mut payload = [0u8; N];
    read_bounded(devices, area, entry.offset, &mut payload)?;
    Ok(payload)
}

/// Bytes occupied by header, body and both TLV regions.
pub fn image_total_size<D: FlashDevices>(
    devices: &mut D,
    header: &ImageHeader,
    area: &FlashArea,
) -> Result<u32, Error> {
    Ok(TlvIter::begin(devices, header, area, None, false)?.end())
}
