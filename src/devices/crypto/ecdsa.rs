//! ECDSA-P256 over SHA-256 digests, DER encoded signatures.
use super::{SignatureVerifier, DIGEST_SIZE};
use crate::{devices::image::tlv::TlvType, error::Error};
use p256::ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey};

/// Keys are SEC1 encoded points, signatures live in the `ECDSA_SIG` TLV.
#[derive(Clone, Copy, Debug, Default)]
pub struct EcdsaP256Verifier;

impl SignatureVerifier for EcdsaP256Verifier {
    fn signature_tlv(&self) -> Option<TlvType> { Some(TlvType::EcdsaSig) }

    fn verify(&self, key: &[u8], digest: &[u8; DIGEST_SIZE], signature: &[u8]) -> Result<(), Error> {
        let key = VerifyingKey::from_sec1_bytes(key).map_err(|_| Error::KeyNotFound)?;
        let signature = Signature::from_der(signature).map_err(|_| Error::SignatureInvalid)?;
        key.verify_prehash(digest, &signature).map_err(|_| Error::SignatureInvalid)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::devices::crypto::sha256;
    use p256::ecdsa::{signature::hazmat::PrehashSigner, SigningKey};

    fn signing_key() -> SigningKey { SigningKey::from_slice(&[0x42; 32]).unwrap() }

    fn public_key() -> Vec<u8> {
        signing_key().verifying_key().to_encoded_point(false).as_bytes().to_vec()
    }

    fn sign(digest: &[u8; 32]) -> Vec<u8> {
        let signature: Signature = signing_key().sign_prehash(digest).unwrap();
        signature.to_der().as_bytes().to_vec()
    }

    #[test]
    fn accepts_a_signature_over_the_digest() {
        let digest = sha256(b"firmware");
        assert_eq!(EcdsaP256Verifier.verify(&public_key(), &digest, &sign(&digest)), Ok(()));
    }

    #[test]
    fn rejects_other_digests_keys_and_garbage() {
        let digest = sha256(b"firmware");
        let signature = sign(&digest);
        let other = sha256(b"malware");

        assert_eq!(
            EcdsaP256Verifier.verify(&public_key(), &other, &signature),
            Err(Error::SignatureInvalid)
        );
        assert_eq!(EcdsaP256Verifier.verify(&[0x04; 65], &digest, &signature), Err(Error::KeyNotFound));
        assert_eq!(
            EcdsaP256Verifier.verify(&public_key(), &digest, &[0x30, 0x02, 0x00]),
            Err(Error::SignatureInvalid)
        );
    }
}
