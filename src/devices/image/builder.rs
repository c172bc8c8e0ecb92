//! Host side image assembly, shared by the test suite and the image tool.
use super::{flags, tlv::TlvType, ImageHeader, ImageVersion, HEADER_SIZE, IMAGE_MAGIC};
use crate::{
    devices::{
        crypto::{
            encryption::{wrap_ec256, ImageKey},
            sha256,
        },
        validator::Dependency,
    },
    error::Error,
};
use p256::{
    ecdsa::{signature::hazmat::PrehashSigner, Signature, SigningKey},
    PublicKey, SecretKey,
};

struct RawTlv {
    kind: u16,
    payload: Vec<u8>,
    protected: bool,
}

/// How the signing key is referenced from the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyReference {
    /// `KEYHASH`: SHA-256 of the SEC1 public key.
    Hash,
    /// `PUBKEY`: the SEC1 public key itself.
    Embedded,
}

struct Encryption {
    recipient: PublicKey,
    ephemeral: SecretKey,
    key: ImageKey,
}

/// Builds an image in the on-flash format:
/// `[header][body][protected TLVs][TLVs]`.
pub struct ImageBuilder {
    body: Vec<u8>,
    header_size: u16,
    load_address: u32,
    flags: u32,
    version: ImageVersion,
    security_counter: Option<(u32, bool)>,
    dependencies: Vec<Dependency>,
    signing: Option<(SigningKey, KeyReference)>,
    encryption: Option<Encryption>,
    extra: Vec<RawTlv>,
    mask_encrypted_flag: bool,
}

impl ImageBuilder {
    pub fn new(body: &[u8]) -> Self {
        Self {
            body: body.to_vec(),
            header_size: 0x200,
            load_address: 0,
            flags: 0,
            version: ImageVersion::default(),
            security_counter: None,
            dependencies: Vec::new(),
            signing: None,
            encryption: None,
            extra: Vec::new(),
            mask_encrypted_flag: false,
        }
    }

    pub fn header_size(mut self, size: u16) -> Self {
        self.header_size = size;
        self
    }

    pub fn load_address(mut self, address: u32) -> Self {
        self.load_address = address;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    pub fn version(mut self, version: ImageVersion) -> Self {
        self.version = version;
        self
    }

    /// Protected `SEC_CNT` TLV.
    pub fn security_counter(mut self, value: u32) -> Self {
        self.security_counter = Some((value, true));
        self
    }

    /// A `SEC_CNT` TLV outside the protected region, which no valid image has.
    pub fn unprotected_security_counter(mut self, value: u32) -> Self {
        self.security_counter = Some((value, false));
        self
    }

    pub fn dependency(mut self, image_id: u8, min_version: ImageVersion) -> Self {
        self.dependencies.push(Dependency { image_id, min_version });
        self
    }

    pub fn sign(mut self, key: SigningKey, reference: KeyReference) -> Self {
        self.signing = Some((key, reference));
        self
    }

    /// Encrypts the body with `key` and wraps it for `recipient`.
    pub fn encrypt(mut self, recipient: PublicKey, ephemeral: SecretKey, key: ImageKey) -> Self {
        self.encryption = Some(Encryption { recipient, ephemeral, key });
        self.flags |= flags::ENCRYPTED_AES128;
        self
    }

    pub fn raw_tlv(mut self, kind: u16, payload: &[u8], protected: bool) -> Self {
        self.extra.push(RawTlv { kind, payload: payload.to_vec(), protected });
        self
    }

    /// Hashes the header with the encrypted flags cleared, as primary-only
    /// builds expect.
    pub fn masking_encrypted_flag(mut self) -> Self {
        self.mask_encrypted_flag = true;
        self
    }

    pub fn build(self) -> Result<Vec<u8>, Error> {
        if (self.header_size as usize) < HEADER_SIZE {
            return Err(Error::BadArgs("header size too small"));
        }
        let mut protected = Vec::new();
        let mut unprotected = Vec::new();
        if let Some((value, is_protected)) = self.security_counter {
            let target = if is_protected { &mut protected } else { &mut unprotected };
            push_tlv(target, TlvType::SecurityCounter.as_u16(), &value.to_le_bytes())?;
        }
        for dependency in &self.dependencies {
            push_tlv(&mut protected, TlvType::Dependency.as_u16(), &dependency.encode())?;
        }
        for raw in self.extra.iter().filter(|raw| raw.protected) {
            push_tlv(&mut protected, raw.kind, &raw.payload)?;
        }
        let protected_tlv_size = if protected.is_empty() {
            0
        } else {
            u16::try_from(protected.len() + 4).map_err(|_| Error::BadArgs("protected TLVs too large"))?
        };

        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            load_address: self.load_address,
            header_size: self.header_size,
            protected_tlv_size,
            image_size: u32::try_from(self.body.len()).map_err(|_| Error::BadArgs("body too large"))?,
            flags: self.flags,
            version: self.version,
        };
        let mut image = vec![0u8; self.header_size as usize];
        image[..HEADER_SIZE].copy_from_slice(&header.encode());
        image.extend_from_slice(&self.body);
        if protected_tlv_size != 0 {
            image.extend_from_slice(&super::tlv::TLV_PROT_INFO_MAGIC.to_le_bytes());
            image.extend_from_slice(&protected_tlv_size.to_le_bytes());
            image.extend_from_slice(&protected);
        }

        // The digest covers the plaintext.
        let digest = if self.mask_encrypted_flag {
            let mut masked = image.clone();
            let clear = header.flags & !flags::ENCRYPTED;
            masked[16..20].copy_from_slice(&clear.to_le_bytes());
            sha256(&masked)
        } else {
            sha256(&image)
        };
        push_tlv(&mut unprotected, TlvType::Sha256.as_u16(), &digest)?;

        if let Some((key, reference)) = &self.signing {
            let public = key.verifying_key().to_encoded_point(false);
            match reference {
                KeyReference::Hash => push_tlv(&mut unprotected, TlvType::KeyHash.as_u16(), &sha256(public.as_bytes()))?,
                KeyReference::Embedded => push_tlv(&mut unprotected, TlvType::PublicKey.as_u16(), public.as_bytes())?,
            }
            let signature: Signature =
                key.sign_prehash(&digest).map_err(|_| Error::BadArgs("signing failed"))?;
            push_tlv(&mut unprotected, TlvType::EcdsaSig.as_u16(), signature.to_der().as_bytes())?;
        }

        if let Some(encryption) = &self.encryption {
            let body = self.header_size as usize..self.header_size as usize + self.body.len();
            encryption.key.apply_keystream(0, &mut image[body]);
            let wrapped = wrap_ec256(&encryption.recipient, &encryption.ephemeral, &encryption.key)?;
            push_tlv(&mut unprotected, TlvType::EncEc256.as_u16(), &wrapped)?;
        }

        for raw in self.extra.iter().filter(|raw| !raw.protected) {
            push_tlv(&mut unprotected, raw.kind, &raw.payload)?;
        }
        let total = u16::try_from(unprotected.len() + 4).map_err(|_| Error::BadArgs("TLVs too large"))?;
        image.extend_from_slice(&super::tlv::TLV_INFO_MAGIC.to_le_bytes());
        image.extend_from_slice(&total.to_le_bytes());
        image.extend_from_slice(&unprotected);
        Ok(image)
    }
}

fn push_tlv(region: &mut Vec<u8>, kind: u16, payload: &[u8]) -> Result<(), Error> {
    let length = u16::try_from(payload.len()).map_err(|_| Error::BadArgs("TLV too large"))?;
    region.extend_from_slice(&kind.to_le_bytes());
    region.extend_from_slice(&length.to_le_bytes());
    region.extend_from_slice(payload);
    Ok(())
}

/// Decodes the header at the start of a built image.
pub fn header_of(image: &[u8]) -> Result<ImageHeader, Error> {
    let bytes: &[u8; HEADER_SIZE] = image
        .get(..HEADER_SIZE)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(Error::BadImage("image shorter than a header"))?;
    Ok(ImageHeader::decode(bytes))
}
