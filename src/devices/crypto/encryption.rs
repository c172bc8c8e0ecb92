//! Encrypted image support.
//!
//! Image bodies are encrypted with AES-128-CTR under a random per-image
//! key (zero nonce, the counter being the byte offset into the body). The
//! image key travels in an `ENC_EC256` TLV, wrapped with ECIES-P256 for the
//! device key: an ephemeral public key, an HMAC-SHA256 tag and the
//! AES-CTR encrypted image key.
use crate::{
    devices::{
        flash_map::{FlashArea, FlashDevices},
        image::{
            tlv::{self, TlvType},
            ImageHeader,
        },
    },
    error::Error,
    logging::warn,
};
use core::fmt;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::{ecdh, PublicKey, SecretKey};
use sha2::Sha256;

pub const IMAGE_KEY_SIZE: usize = 16;
pub const EC256_PUBLIC_KEY_SIZE: usize = 65;
pub const EC256_TAG_SIZE: usize = 32;
pub const EC256_TLV_SIZE: usize = EC256_PUBLIC_KEY_SIZE + EC256_TAG_SIZE + IMAGE_KEY_SIZE;
const ECIES_INFO: &[u8] = b"MCUBoot_ECIES_v1";
const DERIVED_SIZE: usize = IMAGE_KEY_SIZE + EC256_TAG_SIZE;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Per-image symmetric key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ImageKey([u8; IMAGE_KEY_SIZE]);

impl fmt::Debug for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ImageKey(..)") }
}

impl ImageKey {
    pub const fn new(bytes: [u8; IMAGE_KEY_SIZE]) -> Self { Self(bytes) }
    pub fn as_bytes(&self) -> &[u8; IMAGE_KEY_SIZE] { &self.0 }

    /// XORs the keystream starting at `body_offset` bytes into the image
    /// body. Applying it twice restores the input.
    pub fn apply_keystream(&self, body_offset: u32, bytes: &mut [u8]) {
        let mut cipher = Aes128Ctr::new(&self.0.into(), &[0u8; 16].into());
        cipher.seek(body_offset as u64);
        cipher.apply_keystream(bytes);
    }

    /// Applies the keystream to whatever part of `bytes` falls inside the
    /// body of the image described by `header`. `image_offset` is the
    /// position of `bytes[0]` from the start of the image; header and TLV
    /// bytes pass through untouched.
    pub fn apply_to_image(
        &self,
        header: &ImageHeader,
        image_offset: u32,
        bytes: &mut [u8],
    ) -> Result<(), Error> {
        let body_start = header.header_size as u64;
        let body_end = header.tlv_offset()? as u64;
        let start = image_offset as u64;
        let end = start + bytes.len() as u64;
        let (from, to) = (start.max(body_start), end.min(body_end));
        if from < to {
            let range = (from - start) as usize..(to - start) as usize;
            self.apply_keystream((from - body_start) as u32, &mut bytes[range]);
        }
        Ok(())
    }
}

fn derive(shared: &[u8]) -> Result<[u8; DERIVED_SIZE], Error> {
    let mut derived = [0u8; DERIVED_SIZE];
    Hkdf::<Sha256>::new(None, shared)
        .expand(ECIES_INFO, &mut derived)
        .map_err(|_| Error::BadImage("key derivation failed"))?;
    Ok(derived)
}

fn tag(mac_key: &[u8], wrapped: &[u8]) -> Result<HmacSha256, Error> {
    let mut mac = HmacSha256::new_from_slice(mac_key).map_err(|_| Error::BadImage("bad MAC key"))?;
    mac.update(wrapped);
    Ok(mac)
}

/// Device private key used to unwrap image keys.
#[derive(Clone)]
pub struct DecryptionKey(SecretKey);

impl DecryptionKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        SecretKey::from_slice(bytes).map(Self).map_err(|_| Error::BadArgs("invalid decryption key"))
    }

    pub fn public_key(&self) -> PublicKey { self.0.public_key() }

    /// Recovers the image key from an `ENC_EC256` TLV payload.
    pub fn unwrap_ec256(&self, payload: &[u8; EC256_TLV_SIZE]) -> Result<ImageKey, Error> {
        let (ephemeral, rest) = payload.split_at(EC256_PUBLIC_KEY_SIZE);
        let (expected_tag, wrapped) = rest.split_at(EC256_TAG_SIZE);

        let ephemeral =
            PublicKey::from_sec1_bytes(ephemeral).map_err(|_| Error::BadImage("bad ephemeral key"))?;
        let shared = ecdh::diffie_hellman(self.0.to_nonzero_scalar(), ephemeral.as_affine());
        let derived = derive(shared.raw_secret_bytes())?;

        tag(&derived[IMAGE_KEY_SIZE..], wrapped)?
            .verify_slice(expected_tag)
            .map_err(|_| Error::BadImage("image key tag mismatch"))?;

        let mut key = [0u8; IMAGE_KEY_SIZE];
        key.copy_from_slice(wrapped);
        let mut kek = [0u8; IMAGE_KEY_SIZE];
        kek.copy_from_slice(&derived[..IMAGE_KEY_SIZE]);
        ImageKey(kek).apply_keystream(0, &mut key);
        Ok(ImageKey(key))
    }
}

/// Wraps an image key for `recipient`, the inverse of
/// [`DecryptionKey::unwrap_ec256`].
#[cfg(not(target_arch = "arm"))]
pub fn wrap_ec256(
    recipient: &PublicKey,
    ephemeral: &SecretKey,
    key: &ImageKey,
) -> Result<[u8; EC256_TLV_SIZE], Error> {
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    let shared = ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), recipient.as_affine());
    let derived = derive(shared.raw_secret_bytes())?;

    let mut wrapped = *key.as_bytes();
    let mut kek = [0u8; IMAGE_KEY_SIZE];
    kek.copy_from_slice(&derived[..IMAGE_KEY_SIZE]);
    ImageKey(kek).apply_keystream(0, &mut wrapped);
    let mac = tag(&derived[IMAGE_KEY_SIZE..], &wrapped)?.finalize().into_bytes();

    let mut payload = [0u8; EC256_TLV_SIZE];
    payload[..EC256_PUBLIC_KEY_SIZE]
        .copy_from_slice(ephemeral.public_key().to_encoded_point(false).as_bytes());
    payload[EC256_PUBLIC_KEY_SIZE..EC256_PUBLIC_KEY_SIZE + EC256_TAG_SIZE].copy_from_slice(&mac);
    payload[EC256_PUBLIC_KEY_SIZE + EC256_TAG_SIZE..].copy_from_slice(&wrapped);
    Ok(payload)
}

/// Recovers the key of the image in `area`. `Ok(None)` for plaintext
/// images; an encrypted image we can't unwrap is treated as malformed.
pub fn load_image_key<D: FlashDevices>(
    devices: &mut D,
    header: &ImageHeader,
    area: &FlashArea,
    decryption: Option<&DecryptionKey>,
) -> Result<Option<ImageKey>, Error> {
    if !header.is_encrypted() {
        return Ok(None);
    }
    let decryption = decryption.ok_or_else(|| {
        warn!("Encrypted image found but encryption support is disabled");
        Error::BadImage("encrypted image without a decryption key")
    })?;
    let entry = tlv::find(devices, header, area, TlvType::EncEc256, false)?
        .ok_or(Error::BadImage("encrypted image without key TLV"))?;
    let payload = tlv::read_exact::<EC256_TLV_SIZE, _>(devices, area, &entry)?;
    decryption.unwrap_ec256(&payload).map(Some)
}
