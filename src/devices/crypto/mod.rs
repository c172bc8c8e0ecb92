//! Hashing, signature verification and trust anchor resolution.
use crate::{devices::image::tlv::TlvType, error::Error};
use sha2::{Digest, Sha256};

#[cfg(feature = "ecdsa-verify")]
pub mod ecdsa;
pub mod encryption;

pub const DIGEST_SIZE: usize = 32;

pub fn sha256(bytes: &[u8]) -> [u8; DIGEST_SIZE] { Sha256::digest(bytes).into() }

/// Signature scheme the build accepts. Exactly one is injected into the
/// validator at startup.
pub trait SignatureVerifier {
    /// TLV type carrying signatures for this scheme, or `None` for builds
    /// that only check the image hash.
    fn signature_tlv(&self) -> Option<TlvType>;

    fn verify(&self, key: &[u8], digest: &[u8; DIGEST_SIZE], signature: &[u8]) -> Result<(), Error>;
}

/// Integrity only. Any signature TLV in an image is rejected.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashOnly;

impl SignatureVerifier for HashOnly {
    fn signature_tlv(&self) -> Option<TlvType> { None }

    fn verify(&self, _: &[u8], _: &[u8; DIGEST_SIZE], _: &[u8]) -> Result<(), Error> {
        Err(Error::SignatureInvalid)
    }
}

/// A public key images may be signed with, optionally restricted to one
/// image index.
#[derive(Clone, Copy, Debug)]
pub struct TrustAnchor<'k> {
    pub key: &'k [u8],
    pub image: Option<u8>,
}

impl<'k> TrustAnchor<'k> {
    fn applies_to(&self, image: u8) -> bool { self.image.map_or(true, |i| i == image) }
}

/// Set of trust anchors, never mutated after startup.
#[derive(Clone, Copy, Debug)]
pub struct KeyRing<'k> {
    anchors: &'k [TrustAnchor<'k>],
}

impl<'k> KeyRing<'k> {
    pub const fn new(anchors: &'k [TrustAnchor<'k>]) -> Self { Self { anchors } }
    pub const fn empty() -> Self { Self { anchors: &[] } }

    /// Resolves a `KEYHASH` TLV: the SHA-256 of one of our keys.
    pub fn by_hash(&self, image: u8, hash: &[u8]) -> Option<&'k [u8]> {
        self.anchors
            .iter()
            .filter(|a| a.applies_to(image))
            .find(|a| sha256(a.key)[..] == *hash)
            .map(|a| a.key)
    }

    /// Resolves a `PUBKEY` TLV, which is only trusted if it is one of ours.
    pub fn by_key(&self, image: u8, key: &[u8]) -> Option<&'k [u8]> {
        self.anchors.iter().filter(|a| a.applies_to(image)).find(|a| a.key == key).map(|a| a.key)
    }
}
