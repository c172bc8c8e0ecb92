//! Rollback protection counters.
//!
//! One monotonic value per image index, kept outside the swapped slots.
//! Values only ever go up, and only once the image that carries them has
//! been confirmed.
use crate::{
    devices::flash_map::MAX_IMAGES,
    error::Error,
    hal::flash::{self, Region},
    logging::{info, warn},
    utilities::memory::align_up,
};
use crc::crc32;
use nb::block;
use static_assertions::const_assert;

pub trait SecurityCounters {
    /// Current minimum counter an image must carry.
    fn read(&mut self, image_index: u8) -> Result<u32, Error>;

    /// Raises the counter of `image_index` to `value`. Lower values are
    /// ignored.
    fn update(&mut self, image_index: u8, value: u32) -> Result<(), Error>;
}

/// Builds without a counter store. Every image passes the rollback check.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRollbackProtection;

impl SecurityCounters for NoRollbackProtection {
    fn read(&mut self, _: u8) -> Result<u32, Error> { Ok(0) }
    fn update(&mut self, _: u8, _: u32) -> Result<(), Error> { Ok(()) }
}

const RECORD_MAGIC: u32 = 0x5ec0_c047;
const VALUES: usize = MAX_IMAGES as usize;
/// magic, generation, values, crc
const RECORD_SIZE: usize = 4 + 4 + 4 * VALUES + 4;
const BUFFER_SIZE: usize = 64;
const_assert!(RECORD_SIZE <= BUFFER_SIZE);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Record {
    generation: u32,
    values: [u32; VALUES],
}

impl Record {
    fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.generation.to_le_bytes());
        for (chunk, value) in bytes[8..8 + 4 * VALUES].chunks_exact_mut(4).zip(self.values.iter()) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        let crc = crc32::checksum_ieee(&bytes[..RECORD_SIZE - 4]);
        bytes[RECORD_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8; RECORD_SIZE]) -> Option<Self> {
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        if word(0) != RECORD_MAGIC || word(RECORD_SIZE - 4) != crc32::checksum_ieee(&bytes[..RECORD_SIZE - 4]) {
            return None;
        }
        let mut values = [0u32; VALUES];
        for (index, value) in values.iter_mut().enumerate() {
            *value = word(8 + 4 * index);
        }
        Some(Self { generation: word(4), values })
    }
}

/// Counter store on a dedicated flash device.
///
/// The first two sectors of the device are used as banks, each holding one
/// checksummed record. An update writes the next generation to the bank
/// not holding the current one, so losing power mid-update leaves the
/// previous record in place.
pub struct FlashSecurityCounters<F: flash::ReadWrite> {
    flash: F,
    banks: [Region; 2],
    current: Option<(usize, Record)>,
}

impl<F: flash::ReadWrite> FlashSecurityCounters<F> {
    pub fn new(mut flash: F) -> Result<Self, Error> {
        let first = flash.sector_at(0).ok_or(Error::BadArgs("counter device has no sectors"))?;
        let second = flash.sector_at(first.end()).ok_or(Error::BadArgs("counter device needs two sectors"))?;
        let padded = align_up(RECORD_SIZE, flash.write_size());
        if padded > BUFFER_SIZE || padded as u32 > first.size.min(second.size) {
            return Err(Error::BadArgs("counter record does not fit a sector"));
        }
        let banks = [first, second];
        let mut current = None;
        for (index, bank) in banks.iter().enumerate() {
            let mut bytes = [0u8; RECORD_SIZE];
            block!(flash.read(bank.start, &mut bytes)).map_err(|_| Error::FlashIo("counter read failed"))?;
            if let Some(record) = Record::decode(&bytes) {
                let newer = match current {
                    Some((_, Record { generation, .. })) => record.generation > generation,
                    None => true,
                };
                if newer {
                    current = Some((index, record));
                }
            }
        }
        if current.is_none() {
            warn!("No valid security counter record found, starting from zero");
        }
        Ok(Self { flash, banks, current })
    }

    fn values(&self) -> [u32; VALUES] { self.current.map_or([0; VALUES], |(_, record)| record.values) }

    pub fn into_inner(self) -> F { self.flash }
}

impl<F: flash::ReadWrite> SecurityCounters for FlashSecurityCounters<F> {
    fn read(&mut self, image_index: u8) -> Result<u32, Error> {
        self.values().get(image_index as usize).copied().ok_or(Error::BadArgs("image index out of range"))
    }

    fn update(&mut self, image_index: u8, value: u32) -> Result<(), Error> {
        let mut values = self.values();
        let slot = values.get_mut(image_index as usize).ok_or(Error::BadArgs("image index out of range"))?;
        if value <= *slot {
            return Ok(());
        }
        *slot = value;

        let (target, generation) = match self.current {
            Some((index, record)) => (1 - index, record.generation.wrapping_add(1)),
            None => (0, 1),
        };
        let record = Record { generation, values };
        let mut buffer = [self.flash.erased_value(); BUFFER_SIZE];
        let padded = align_up(RECORD_SIZE, self.flash.write_size());
        buffer[..RECORD_SIZE].copy_from_slice(&record.encode());

        let bank = self.banks[target];
        block!(self.flash.erase(bank.start, bank.size)).map_err(|_| Error::FlashIo("counter erase failed"))?;
        block!(self.flash.write(bank.start, &buffer[..padded]))
            .map_err(|_| Error::FlashIo("counter write failed"))?;
        self.current = Some((target, record));
        info!("Security counter of image {} raised to {}", image_index, value);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hal::doubles::flash::FakeFlash;

    #[test]
    fn fresh_store_reads_zero_and_only_grows() {
        let mut counters = FlashSecurityCounters::new(FakeFlash::uniform(2, 0x400)).unwrap();
        assert_eq!(counters.read(0), Ok(0));

        counters.update(0, 5).unwrap();
        counters.update(0, 3).unwrap();
        counters.update(1, 9).unwrap();

        assert_eq!(counters.read(0), Ok(5));
        assert_eq!(counters.read(1), Ok(9));
        assert_eq!(counters.read(MAX_IMAGES), Err(Error::BadArgs("image index out of range")));
    }

    #[test]
    fn values_survive_a_reboot() {
        let mut counters = FlashSecurityCounters::new(FakeFlash::uniform(2, 0x400)).unwrap();
        for value in 1..=3 {
            counters.update(2, value).unwrap();
        }

        let mut rebooted = FlashSecurityCounters::new(counters.into_inner()).unwrap();

        assert_eq!(rebooted.read(2), Ok(3));
        assert_eq!(rebooted.read(0), Ok(0));
    }

    #[test]
    fn interrupted_update_keeps_the_previous_values() {
        // Given a committed counter
        let mut counters = FlashSecurityCounters::new(FakeFlash::uniform(2, 0x400)).unwrap();
        counters.update(0, 4).unwrap();
        let mut flash = counters.into_inner();

        // When power fails after erasing the inactive bank
        flash.lose_power_after(2);
        let mut counters = FlashSecurityCounters::new(flash).unwrap();
        assert!(counters.update(0, 7).is_err());
        let mut flash = counters.into_inner();
        flash.power_cycle();

        // Then
        let mut rebooted = FlashSecurityCounters::new(flash).unwrap();
        assert_eq!(rebooted.read(0), Ok(4));
        rebooted.update(0, 7).unwrap();
        assert_eq!(rebooted.read(0), Ok(7));
    }

    #[test]
    fn a_corrupt_record_is_ignored() {
        let mut counters = FlashSecurityCounters::new(FakeFlash::uniform(2, 0x400)).unwrap();
        counters.update(0, 1).unwrap();
        counters.update(0, 2).unwrap();
        let mut flash = counters.into_inner();
        // The generation 2 record lives in the second bank.
        flash.load(0x400 + 8, &[0x00]);

        let mut rebooted = FlashSecurityCounters::new(flash).unwrap();

        assert_eq!(rebooted.read(0), Ok(1));
    }
}
