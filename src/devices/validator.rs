//! Image validation.
//!
//! Hashes the image (header, body and protected TLVs) and walks the whole
//! TLV area against an allow-list: the embedded hash must match, the
//! signing key must resolve against our trust anchors, the signature must
//! verify and a protected security counter must not be below the stored
//! one. Nothing here writes to flash; callers decide what happens to a
//! slot that fails.
use crate::{
    devices::{
        crypto::{
            encryption::{load_image_key, DecryptionKey, ImageKey},
            KeyRing, SignatureVerifier, DIGEST_SIZE,
        },
        flash_map::{AreaId, FlashArea, FlashDevices},
        image::{
            flags,
            tlv::{self, TlvIter, TlvType},
            ImageHeader, ImageVersion, HEADER_SIZE,
        },
        trailer::Trailer,
    },
    error::Error,
    logging::{debug, warn},
    utilities::cursor::Cursor,
};
use sha2::{Digest, Sha256};

const HASH_CHUNK: usize = 256;
const FLAGS_OFFSET: usize = 16;
/// Largest signature or key TLV we read into RAM.
const MAX_TLV_PAYLOAD: usize = 512;
pub const DEPENDENCY_TLV_SIZE: usize = 12;

/// What validation learned about an image it accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidImage {
    pub header: ImageHeader,
    pub digest: [u8; DIGEST_SIZE],
    /// Header, body and both TLV regions.
    pub total_size: u32,
    pub security_counter: Option<u32>,
}

pub struct Validator<'k, V: SignatureVerifier> {
    verifier: V,
    keys: KeyRing<'k>,
    decryption: Option<DecryptionKey>,
    erased_tail: Option<Trailer>,
    mask_encrypted_flag: bool,
}

impl<'k, V: SignatureVerifier> Validator<'k, V> {
    pub fn new(verifier: V, keys: KeyRing<'k>) -> Self {
        Self { verifier, keys, decryption: None, erased_tail: None, mask_encrypted_flag: false }
    }

    /// Accepts encrypted images whose key is wrapped for `key`.
    pub fn with_decryption(mut self, key: DecryptionKey) -> Self {
        self.decryption = Some(key);
        self
    }

    /// Requires the flash between the end of a secondary image and its
    /// trailer to be erased.
    pub fn with_erased_tail(mut self, trailer: Trailer) -> Self {
        self.erased_tail = Some(trailer);
        self
    }

    /// Hashes headers as if the encrypted flags were clear, so an image
    /// decrypted in place keeps its digest.
    pub fn masking_encrypted_flag(mut self) -> Self {
        self.mask_encrypted_flag = true;
        self
    }

    pub fn decryption(&self) -> Option<&DecryptionKey> { self.decryption.as_ref() }

    /// Key needed to read the plaintext of the image in `area`. Images are
    /// only stored encrypted in secondary slots, and in the primary slot
    /// before a primary-only build decrypts them.
    pub fn image_key<D: FlashDevices>(
        &self,
        devices: &mut D,
        header: &ImageHeader,
        area: &FlashArea,
    ) -> Result<Option<ImageKey>, Error> {
        let stored_encrypted = matches!(area.id(), AreaId::Secondary(_)) || self.mask_encrypted_flag;
        if !stored_encrypted || !header.is_encrypted() {
            return Ok(None);
        }
        load_image_key(devices, header, area, self.decryption.as_ref())
    }

    /// Validates the image described by `header` in `area`.
    /// `min_counter` is the stored security counter of `image_index`.
    pub fn validate<D: FlashDevices>(
        &self,
        devices: &mut D,
        image_index: u8,
        area: &FlashArea,
        header: &ImageHeader,
        min_counter: u32,
    ) -> Result<ValidImage, Error> {
        header.check(area.size())?;
        let image_key = self.image_key(devices, header, area)?;
        let digest = self.hash(devices, area, header, image_key.as_ref())?;

        let mut iter = TlvIter::begin(devices, header, area, None, false)?;
        let total_size = iter.end();
        let mut hash_found = false;
        let mut signature_found = false;
        let mut key: Option<&'k [u8]> = None;
        let mut security_counter = None;
        let mut payload = [0u8; MAX_TLV_PAYLOAD];

        while let Some(entry) = iter.next(devices, area)? {
            if entry.kind.requires_protection() && !entry.protected {
                warn!("Image {}: TLV {} outside the protected area", image_index, entry.kind.as_u16());
                return Err(Error::BadImage("TLV must be protected"));
            }
            match entry.kind {
                TlvType::Sha256 => {
                    let expected = tlv::read_exact::<DIGEST_SIZE, _>(devices, area, &entry)?;
                    if expected != digest {
                        warn!("Image {}: hash mismatch", image_index);
                        return Err(Error::HashMismatch);
                    }
                    hash_found = true;
                }
                TlvType::KeyHash => {
                    let hash = tlv::read_payload(devices, area, &entry, &mut payload)?;
                    key = self.keys.by_hash(image_index, hash);
                }
                TlvType::PublicKey => {
                    let embedded = tlv::read_payload(devices, area, &entry, &mut payload)?;
                    key = self.keys.by_key(image_index, embedded);
                }
                kind if kind.is_signature() => {
                    if self.verifier.signature_tlv() != Some(kind) {
                        warn!("Image {}: unsupported signature TLV {}", image_index, kind.as_u16());
                        return Err(Error::BadImage("unsupported signature type"));
                    }
                    if !hash_found {
                        return Err(Error::BadImage("signature precedes the hash"));
                    }
                    let key = key.ok_or_else(|| {
                        warn!("Image {}: signing key not found", image_index);
                        Error::KeyNotFound
                    })?;
                    let signature = tlv::read_payload(devices, area, &entry, &mut payload)?;
                    self.verifier.verify(key, &digest, signature).map_err(|e| {
                        warn!("Image {}: signature rejected", image_index);
                        e
                    })?;
                    signature_found = true;
                }
                TlvType::SecurityCounter => {
                    let value = u32::from_le_bytes(tlv::read_exact::<4, _>(devices, area, &entry)?);
                    if value < min_counter {
                        warn!("Image {}: security counter {} below {}", image_index, value, min_counter);
                        return Err(Error::CounterRollback);
                    }
                    security_counter = Some(value);
                }
                TlvType::Dependency => {
                    if entry.length as usize != DEPENDENCY_TLV_SIZE {
                        return Err(Error::BadImage("malformed dependency TLV"));
                    }
                }
                TlvType::BootRecord => (),
                kind if kind.is_key_transport() => (),
                other => {
                    warn!("Image {}: unexpected TLV {}", image_index, other.as_u16());
                    return Err(Error::BadImage("unrecognised TLV"));
                }
            }
        }

        if !hash_found {
            return Err(Error::BadImage("missing hash TLV"));
        }
        if self.verifier.signature_tlv().is_some() && !signature_found {
            warn!("Image {}: no valid signature", image_index);
            return Err(Error::SignatureInvalid);
        }
        if let (Some(trailer), AreaId::Secondary(_)) = (&self.erased_tail, area.id()) {
            let tail_end = area.size() - trailer.size_in(area);
            if total_size > tail_end || !area.range_is_erased(devices, total_size, tail_end - total_size)? {
                warn!("Image {}: data found past the end of the image", image_index);
                return Err(Error::BadImage("slot tail not erased"));
            }
        }

        debug!("Image {} in {} is valid", image_index, total_size);
        Ok(ValidImage { header: *header, digest, total_size, security_counter })
    }

    /// SHA-256 over `[0, tlv_offset + protected_tlv_size)`, decrypting the
    /// body on the fly when `key` is given.
    fn hash<D: FlashDevices>(
        &self,
        devices: &mut D,
        area: &FlashArea,
        header: &ImageHeader,
        key: Option<&ImageKey>,
    ) -> Result<[u8; DIGEST_SIZE], Error> {
        let end = header
            .tlv_offset()?
            .checked_add(header.protected_tlv_size as u32)
            .ok_or(Error::BadImage("image size overflows"))?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; HASH_CHUNK];
        let mut position = 0u32;
        while position < end {
            let chunk = &mut buffer[..core::cmp::min(HASH_CHUNK as u32, end - position) as usize];
            area.read(devices, position, chunk).map_err(|e| match e {
                Error::OutOfBounds => Error::BadImage("image exceeds its slot"),
                other => other,
            })?;
            if position == 0 && self.mask_encrypted_flag && chunk.len() >= HEADER_SIZE {
                let field = &mut chunk[FLAGS_OFFSET..FLAGS_OFFSET + 4];
                let raw = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);
                field.copy_from_slice(&(raw & !flags::ENCRYPTED).to_le_bytes());
            }
            if let Some(key) = key {
                key.apply_to_image(header, position, chunk)?;
            }
            hasher.update(&chunk[..]);
            position += chunk.len() as u32;
        }
        Ok(hasher.finalize().into())
    }
}

/// A protected `DEPENDENCY` TLV.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dependency {
    pub image_id: u8,
    pub min_version: ImageVersion,
}

impl Dependency {
    /// Image id, three bytes of padding, then the minimum version.
    pub fn decode(bytes: &[u8; DEPENDENCY_TLV_SIZE]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(bytes);
        let image_id = cursor.read_u8()?;
        cursor.skip(3)?;
        Ok(Self { image_id, min_version: ImageVersion::decode(&mut cursor)? })
    }

    pub fn encode(&self) -> [u8; DEPENDENCY_TLV_SIZE] {
        let mut bytes = [0u8; DEPENDENCY_TLV_SIZE];
        bytes[0] = self.image_id;
        bytes[4..].copy_from_slice(&self.min_version.encode());
        bytes
    }
}

/// Calls `visit` with every protected dependency of the image.
pub fn for_each_dependency<D, F>(
    devices: &mut D,
    header: &ImageHeader,
    area: &FlashArea,
    mut visit: F,
) -> Result<(), Error>
where
    D: FlashDevices,
    F: FnMut(Dependency) -> Result<(), Error>,
{
    let mut iter = TlvIter::begin(devices, header, area, Some(TlvType::Dependency), true)?;
    while let Some(entry) = iter.next(devices, area)? {
        let raw = tlv::read_exact::<DEPENDENCY_TLV_SIZE, _>(devices, area, &entry)?;
        visit(Dependency::decode(&raw)?)?;
    }
    Ok(())
}
