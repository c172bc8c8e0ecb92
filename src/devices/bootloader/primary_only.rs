use super::*;
use crate::devices::image::flags;

/// Largest sector that can be decrypted in place.
const DECRYPT_BUFFER: usize = 4096;
/// Position of the flags word in the image header.
const FLAGS_OFFSET: usize = 16;

impl<'k, D: FlashDevices, V: SignatureVerifier, C: SecurityCounters> Bootloader<'k, D, V, C> {
    /// Single slot policy: the primary image runs if it validates. An
    /// encrypted image is decrypted where it sits on its first boot.
    pub(super) fn boot_primary_only(&mut self) -> Result<BootResponse, Error> {
        let mut response = None;
        for image_index in 0..self.map.image_count() {
            let primary = self.open_slot(image_index, Slot::Primary)?;
            let mut header = ImageHeader::read(&mut self.devices, &primary)?;
            if !header.has_magic() {
                error!("Image {}: primary slot is empty", image_index);
                return Err(Error::NoBootableImage);
            }
            let mut valid = self.validate_for_boot(image_index, &primary, &header)?;
            if header.is_encrypted() {
                self.decrypt_in_place(image_index, &primary, &header)?;
                header = ImageHeader::read(&mut self.devices, &primary)?;
                valid = self.validate_for_boot(image_index, &primary, &header)?;
            }
            self.raise_counter(image_index, &valid)?;
            info!(
                "Image {}: booting version {}.{}",
                image_index,
                header.version.major,
                header.version.minor
            );
            response.get_or_insert(BootResponse {
                image_index,
                device: primary.device_id(),
                offset: primary.offset(),
                header,
                load_address: None,
            });
        }
        response.ok_or(Error::NoBootableImage)
    }

    /// Rewrites every sector holding the header or body of the image with
    /// its plaintext, and clears the encryption flags of the header. The
    /// digest is taken over the header with those flags masked, so it
    /// still matches afterwards.
    fn decrypt_in_place(&mut self, image_index: u8, area: &FlashArea, header: &ImageHeader) -> Result<(), Error> {
        let key = self
            .validator
            .image_key(&mut self.devices, header, area)?
            .ok_or(Error::BadImage("encrypted image without a key"))?;
        let end = header.tlv_offset()?;
        let sectors = || area.sectors().iter().take_while(move |sector| sector.offset < end);
        if sectors().any(|sector| sector.size as usize > DECRYPT_BUFFER) {
            error!("Image {}: sectors too large to decrypt in place", image_index);
            return Err(Error::IncompatibleLayout);
        }

        info!("Image {}: decrypting in place", image_index);
        let mut buffer = [0u8; DECRYPT_BUFFER];
        for sector in sectors() {
            let bytes = &mut buffer[..sector.size as usize];
            area.read(&mut self.devices, sector.offset, bytes)?;
            key.apply_to_image(header, sector.offset, bytes)?;
            if sector.offset == 0 {
                let clear = header.flags & !flags::ENCRYPTED;
                bytes[FLAGS_OFFSET..FLAGS_OFFSET + 4].copy_from_slice(&clear.to_le_bytes());
            }
            area.erase(&mut self.devices, sector.offset, sector.size)?;
            area.write(&mut self.devices, sector.offset, bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{super::test_support::*, *};
    use crate::devices::{
        crypto::{
            encryption::{DecryptionKey, ImageKey},
            HashOnly, KeyRing,
        },
        image::{builder::ImageBuilder, ImageVersion},
    };
    use p256::SecretKey;

    fn device_key() -> DecryptionKey { DecryptionKey::from_bytes(&[0x5A; 32]).unwrap() }

    fn body() -> std::vec::Vec<u8> { (0..BODY).map(|i| (i * 7) as u8).collect() }

    fn encrypted_image() -> std::vec::Vec<u8> {
        ImageBuilder::new(&body())
            .version(ImageVersion::new(4, 2, 0, 0))
            .security_counter(3)
            .encrypt(device_key().public_key(), SecretKey::from_slice(&[0x3C; 32]).unwrap(), ImageKey::new([0x11; 16]))
            .masking_encrypted_flag()
            .build()
            .unwrap()
    }

    fn single_slot(image: &[u8]) -> TestBootloader {
        let config = config(UpgradeMode::PrimaryOnly, 1).with_encryption();
        let (mut devices, counters) = board(1);
        devices[0].load(primary(0), image);
        let validator = Validator::new(HashOnly, KeyRing::empty()).with_decryption(device_key());
        Bootloader::new(config, devices, validator, counters).unwrap()
    }

    #[test]
    fn encrypted_image_is_decrypted_on_its_first_boot() {
        // Given
        let mut bootloader = single_slot(&encrypted_image());

        // When
        let response = bootloader.boot().unwrap();

        // Then the slot holds the plaintext under a clear header
        assert!(!response.header.is_encrypted());
        assert_eq!(response.header.version, ImageVersion::new(4, 2, 0, 0));
        assert!(starts_with(bootloader.devices(), primary(0) + 0x200, &body()));
        assert_eq!(bootloader.counters.read(0), Ok(3));

        // And it keeps validating on later boots
        let contents = bootloader.devices()[0].contents().to_vec();
        assert!(bootloader.boot().unwrap().header.version == ImageVersion::new(4, 2, 0, 0));
        assert_eq!(bootloader.devices()[0].contents(), &contents[..]);
    }

    #[test]
    fn plain_images_boot_as_they_are() {
        let plain = image(0x42, 1, 1);
        let mut bootloader = single_slot(&plain);

        assert_eq!(bootloader.boot().unwrap().offset, primary(0));
        assert!(starts_with(bootloader.devices(), primary(0), &plain));
    }

    #[test]
    fn there_is_nothing_to_fall_back_to() {
        let mut empty = single_slot(&[]);
        assert_eq!(empty.boot(), Err(Error::NoBootableImage));

        let mut tampered = image(0x42, 1, 1);
        tampered[0x280] ^= 0xFF;
        let mut bootloader = single_slot(&tampered);
        assert_eq!(bootloader.boot(), Err(Error::NoBootableImage));
        // A lone image is never erased
        assert!(starts_with(bootloader.devices(), primary(0), &tampered));
    }
}
