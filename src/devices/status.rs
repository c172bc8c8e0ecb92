//! Progress of an in-flight swap.
//!
//! [`BootStatus`] is the RAM copy; the durable copy is a log of one byte
//! entries (each padded to the device write size) in the status region of
//! a trailer. An entry is only written once the step it records is
//! complete, so the number of leading written entries is all a reboot
//! needs to resume.
use crate::{
    devices::{
        crypto::encryption::ImageKey,
        flash_map::{FlashArea, FlashDevices},
        trailer::{SwapType, Trailer, MAX_ALIGN_LIMIT},
    },
    error::Error,
};

/// First span index and first phase. Both count from one so an erased
/// byte can never be confused with a written entry.
pub const STATUS_IDX_0: u32 = 1;
pub const STATE_0: u8 = 1;
pub const STATE_1: u8 = 2;
pub const STATE_2: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Operation {
    /// Shifting primary sectors up by one (move strategy only).
    Move,
    /// Exchanging spans between the slots.
    Swap,
}

/// Where the status log of an interrupted swap was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusSource {
    None,
    Primary,
    Scratch,
}

impl StatusSource {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusSource::None => "none",
            StatusSource::Primary => "primary",
            StatusSource::Scratch => "scratch",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootStatus {
    /// One based index of the span being processed.
    pub idx: u32,
    /// One based phase within the span.
    pub state: u8,
    pub op: Operation,
    /// Whether status entries currently go to the scratch trailer.
    pub use_scratch: bool,
    pub swap_type: SwapType,
    /// Bytes being exchanged, persisted so a resumed swap covers the same range.
    pub swap_size: u32,
    pub source: StatusSource,
    /// Working image keys, indexed by slot.
    pub keys: [Option<ImageKey>; 2],
}

impl Default for BootStatus {
    fn default() -> Self { Self::reset() }
}

impl BootStatus {
    pub fn reset() -> Self {
        Self {
            idx: STATUS_IDX_0,
            state: STATE_0,
            op: Operation::Move,
            use_scratch: false,
            swap_type: SwapType::None,
            swap_size: 0,
            source: StatusSource::None,
            keys: [None, None],
        }
    }

    /// Nothing has been logged yet.
    pub fn is_reset(&self) -> bool {
        self.op == Operation::Move && self.idx == STATUS_IDX_0 && self.state == STATE_0
    }
}

/// Result of scanning a status log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogScan {
    /// Entries up to the first gap after the first written one, `None` if
    /// nothing was written.
    pub written: Option<usize>,
    /// A written entry was found after a gap.
    pub inconsistent: bool,
}

/// Scans `count` log entries of `area`, starting at entry `first`.
/// Positions in the result are relative to `first`.
pub fn scan_log<D: FlashDevices>(
    devices: &mut D,
    area: &FlashArea,
    trailer: &Trailer,
    first: usize,
    count: usize,
) -> Result<LogScan, Error> {
    let base = trailer.status_offset(area) + (first * area.align()) as u32;
    let write_size = area.align() as u32;
    let mut found = false;
    let mut gap = None;
    let mut inconsistent = false;

    for i in 0..count {
        let mut byte = [0u8];
        area.read(devices, base + i as u32 * write_size, &mut byte)?;
        if byte[0] == area.erased_value() {
            if found && gap.is_none() {
                gap = Some(i);
            }
        } else if !found {
            found = true;
        } else if gap.is_some() {
            inconsistent = true;
            break;
        }
    }

    Ok(LogScan { written: found.then(|| gap.unwrap_or(count)), inconsistent })
}

/// Appends the log entry at position `entry` of the status region.
pub fn write_entry<D: FlashDevices>(
    devices: &mut D,
    area: &FlashArea,
    trailer: &Trailer,
    entry: usize,
    state: u8,
) -> Result<(), Error> {
    let write_size = area.align();
    let mut buffer = [area.erased_value(); MAX_ALIGN_LIMIT];
    let padded = buffer.get_mut(..write_size).ok_or(Error::BadArgs("write size exceeds trailer alignment"))?;
    padded[0] = state;
    area.write(devices, trailer.status_offset(area) + (entry * write_size) as u32, padded)
}
