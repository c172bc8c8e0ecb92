use crate::error::{self, Error};
use p256::{ecdsa::SigningKey, PublicKey, SecretKey};
use std::{fs, str::FromStr};

fn read_to_string(path: &str, file: error::File) -> Result<String, Error> {
    fs::read_to_string(path).map_err(|_| Error::FileReadFailed(file))
}

/// Body of a PEM file, or of a file holding nothing but base64.
fn armored_bytes(string: &str) -> Option<Vec<u8>> {
    let encoded = string.lines().filter(|l| !l.starts_with('-')).fold(String::new(), |mut data, line| {
        data.push_str(line.trim());
        data
    });
    base64::decode(encoded).ok()
}

/// PKCS#8 PEM, or a base64 encoded raw scalar.
pub fn read_signing_key(path: &str) -> Result<SigningKey, Error> {
    let string = read_to_string(path, error::File::Key)?;
    SigningKey::from_str(&string)
        .ok()
        .or_else(|| armored_bytes(&string).and_then(|raw| SigningKey::from_slice(&raw).ok()))
        .ok_or(Error::KeyParseFailed(error::File::Key))
}

/// SPKI PEM, or a base64 encoded SEC1 point.
pub fn read_recipient(path: &str) -> Result<PublicKey, Error> {
    let string = read_to_string(path, error::File::Recipient)?;
    PublicKey::from_str(&string)
        .ok()
        .or_else(|| armored_bytes(&string).and_then(|raw| PublicKey::from_sec1_bytes(&raw).ok()))
        .ok_or(Error::KeyParseFailed(error::File::Recipient))
}

pub fn random_bytes<const N: usize>() -> Result<[u8; N], Error> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|_| Error::RandomnessUnavailable)?;
    Ok(bytes)
}

/// Fresh ephemeral key for one key exchange.
pub fn ephemeral_key() -> Result<SecretKey, Error> {
    loop {
        // Out of range scalars are rare enough to just draw again
        if let Ok(key) = SecretKey::from_slice(&random_bytes::<32>()?) {
            return Ok(key);
        }
    }
}
