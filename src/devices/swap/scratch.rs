//! Scratch assisted swap.
//!
//! The slots are exchanged chunk by chunk, from the end of the swapped
//! region towards the start of the slots. A chunk is made of whole
//! groups (runs of sectors after which the cumulative sizes of both slots
//! line up again) and fits the scratch area. Each chunk takes three
//! phases:
//!
//! 1. secondary -> scratch
//! 2. primary -> secondary
//! 3. scratch -> primary
//!
//! The chunk reaching the end of the slots leaves their trailers behind.
//! While it is in flight, the status log lives in the scratch trailer and
//! the primary trailer is rebuilt from it in the last phase.
use super::Swapper;
use crate::{
    devices::{
        flash_map::{FlashDevices, MAX_IMG_SECTORS},
        image::ImageHeader,
        status::{self, BootStatus, StatusSource, STATE_0, STATE_1, STATE_2, STATUS_IDX_0},
        trailer::{Flag, Magic, SwapType, STATUS_STATE_COUNT},
    },
    error::Error,
    logging::{debug, info, warn},
};
use heapless::Vec;

type Boundaries = Vec<u32, { MAX_IMG_SECTORS + 1 }>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Chunk {
    pub offset: u32,
    pub size: u32,
}

/// Offsets, relative to the slot start, at which both sector maps line
/// up. Inside a group one of the slots must have a single sector, and no
/// group may be larger than the scratch area.
pub(super) fn check_layout(swapper: &Swapper) -> Result<Boundaries, Error> {
    let primary = swapper.primary().sectors();
    let secondary = swapper.secondary().sectors();
    let scratch_size = swapper.scratch()?.size();
    let incompatible = |reason: &str| {
        warn!("Cannot upgrade: {}", reason);
        Error::IncompatibleLayout
    };

    let mut boundaries = Boundaries::new();
    boundaries.push(0).map_err(|_| Error::IncompatibleLayout)?;
    let (mut i, mut j) = (0, 0);
    let (mut primary_size, mut secondary_size) = (0u32, 0u32);
    let mut offset = 0u32;
    // Which slot is currently being advanced sector by sector.
    let mut splitting = None;

    while i < primary.len() || j < secondary.len() {
        if primary_size == secondary_size {
            match (primary.get(i), secondary.get(j)) {
                (Some(p), Some(s)) => {
                    primary_size += p.size;
                    secondary_size += s.size;
                }
                _ => return Err(incompatible("slots are not compatible")),
            }
            i += 1;
            j += 1;
        } else if primary_size < secondary_size {
            let sector = primary.get(i).ok_or_else(|| incompatible("slots are not compatible"))?;
            if splitting == Some(false) {
                return Err(incompatible("slots have non-compatible sectors"));
            }
            splitting = Some(true);
            primary_size += sector.size;
            i += 1;
        } else {
            let sector = secondary.get(j).ok_or_else(|| incompatible("slots are not compatible"))?;
            if splitting == Some(true) {
                return Err(incompatible("slots have non-compatible sectors"));
            }
            splitting = Some(false);
            secondary_size += sector.size;
            j += 1;
        }

        if primary_size == secondary_size {
            if primary_size > scratch_size {
                return Err(incompatible("not all sectors fit inside scratch"));
            }
            offset += primary_size;
            boundaries.push(offset).map_err(|_| Error::IncompatibleLayout)?;
            primary_size = 0;
            secondary_size = 0;
            splitting = None;
        }
    }

    if primary_size != secondary_size {
        return Err(incompatible("slots are not compatible"));
    }
    Ok(boundaries)
}

/// Chunks covering the first `swap_size` bytes, in the order they are
/// swapped: the chunk with status index 1 comes first.
pub(super) fn plan(swapper: &Swapper, swap_size: u32) -> Result<Vec<Chunk, MAX_IMG_SECTORS>, Error> {
    let boundaries = check_layout(swapper)?;
    let primary = swapper.primary();
    let scratch = swapper.scratch()?;
    let trailer = swapper.trailer();

    let slot_size = primary.size();
    let trailer_size = trailer.size_in(primary);
    let trailer_start = slot_size - trailer_size;
    if swap_size > trailer_start {
        warn!("Cannot upgrade: {} bytes overlap the trailer at {}", swap_size, trailer_start);
        return Err(Error::InsufficientSpace);
    }
    let first_trailer_sector = primary
        .sectors()
        .iter()
        .rev()
        .find(|s| s.offset <= trailer_start)
        .map_or(0, |s| s.offset);

    let mut end = boundaries
        .iter()
        .position(|b| *b >= swap_size.max(1))
        .ok_or(Error::InsufficientSpace)?;
    if boundaries[end] > first_trailer_sector {
        // The swapped region reaches the trailer sectors, take them along.
        end = boundaries.len() - 1;
    }

    let scratch_room = scratch.size() - trailer.size_in(scratch);
    let mut chunks = Vec::new();
    while end > 0 {
        let tail = boundaries[end] == slot_size;
        let room = if tail { scratch_room + trailer_size } else { scratch.size() };
        let mut start = end - 1;
        while start > 0 && boundaries[end] - boundaries[start - 1] <= room {
            start -= 1;
        }
        let chunk = Chunk { offset: boundaries[start], size: boundaries[end] - boundaries[start] };
        if tail {
            if chunk.offset > first_trailer_sector {
                warn!("Cannot upgrade: trailer sectors do not fit in one scratch chunk");
                return Err(Error::IncompatibleLayout);
            }
            if chunk.size - trailer_size > scratch_room {
                warn!("Cannot upgrade: scratch too small for the last chunk");
                return Err(Error::IncompatibleLayout);
            }
        }
        chunks.push(chunk).map_err(|_| Error::IncompatibleLayout)?;
        end = start;
    }
    Ok(chunks)
}

pub(super) fn status_source<D: FlashDevices>(
    swapper: &Swapper,
    devices: &mut D,
) -> Result<StatusSource, Error> {
    let trailer = swapper.trailer();
    let primary = trailer.read_swap_state(devices, swapper.primary())?;
    let scratch = trailer.read_swap_state(devices, swapper.scratch()?)?;

    let source = match (primary.magic, scratch.magic, primary.copy_done) {
        (Magic::Good, s, Flag::Set) if s != Magic::Good => StatusSource::None,
        (Magic::Good, s, Flag::Unset) if s != Magic::Good => StatusSource::Primary,
        (_, Magic::Good, _) if scratch.image_num != swapper.image_index => {
            debug!("Scratch trailer belongs to image {}", scratch.image_num);
            StatusSource::None
        }
        (_, Magic::Good, _) => StatusSource::Scratch,
        (Magic::Unset, _, Flag::Unset) => StatusSource::Primary,
        _ => StatusSource::None,
    };
    debug!("Status source: {}", source.as_str());
    Ok(source)
}

pub(super) fn decode_progress(written: usize, status: &mut BootStatus) {
    status.idx = (written / STATUS_STATE_COUNT) as u32 + STATUS_IDX_0;
    status.state = (written % STATUS_STATE_COUNT) as u8 + STATE_0;
}

pub(super) fn log_entry(status: &BootStatus) -> usize {
    (status.idx - STATUS_IDX_0) as usize * STATUS_STATE_COUNT + (status.state - STATE_0) as usize
}

pub(super) fn run<D: FlashDevices>(
    swapper: &Swapper,
    devices: &mut D,
    status: &mut BootStatus,
    headers: &[ImageHeader; 2],
) -> Result<(), Error> {
    let chunks = plan(swapper, status.swap_size)?;
    info!("Swapping {} bytes in {} chunks", status.swap_size, chunks.len());
    for (position, chunk) in chunks.iter().enumerate() {
        if position as u32 + STATUS_IDX_0 >= status.idx {
            swap_chunk(swapper, devices, *chunk, status, headers)?;
        }
    }
    Ok(())
}

fn swap_chunk<D: FlashDevices>(
    swapper: &Swapper,
    devices: &mut D,
    chunk: Chunk,
    status: &mut BootStatus,
    headers: &[ImageHeader; 2],
) -> Result<(), Error> {
    let (primary, secondary, scratch) = (swapper.primary(), swapper.secondary(), swapper.scratch()?);
    let trailer = swapper.trailer();
    let copy_size = if chunk.offset + chunk.size == primary.size() {
        chunk.size - trailer.size_in(primary)
    } else {
        chunk.size
    };
    status.use_scratch = status.idx == STATUS_IDX_0 && copy_size != chunk.size;
    debug!("Chunk {} at {} ({} bytes), phase {}", status.idx, chunk.offset, copy_size, status.state);

    if status.state == STATE_0 {
        scratch.erase(devices, 0, scratch.size())?;
        if status.idx == STATUS_IDX_0 {
            swapper.status_init(devices, scratch, status)?;
            if !status.use_scratch {
                // The trailers are outside the swapped region, so the
                // primary one can be built in place.
                swapper.erase_trailer_sectors(devices, primary)?;
                swapper.status_init(devices, primary, status)?;
                scratch.erase(devices, 0, scratch.size())?;
            }
        }
        swapper.copy_region(devices, secondary, scratch, chunk.offset, 0, copy_size, headers, &status.keys)?;
        swapper.write_status(devices, status)?;
        status.state = STATE_1;
    }

    if status.state == STATE_1 {
        secondary.erase(devices, chunk.offset, chunk.size)?;
        swapper.copy_region(
            devices,
            primary,
            secondary,
            chunk.offset,
            chunk.offset,
            copy_size,
            headers,
            &status.keys,
        )?;
        if status.idx == STATUS_IDX_0 && !status.use_scratch {
            swapper.erase_trailer_sectors(devices, secondary)?;
        }
        swapper.write_status(devices, status)?;
        status.state = STATE_2;
    }

    if status.state == STATE_2 {
        primary.erase(devices, chunk.offset, chunk.size)?;
        swapper.copy_region(devices, scratch, primary, 0, chunk.offset, copy_size, headers, &status.keys)?;

        let scratch_used = status.use_scratch;
        if scratch_used {
            // Rebuild the primary trailer from the scratch one, magic last.
            status::write_entry(devices, primary, trailer, 0, STATE_0)?;
            status::write_entry(devices, primary, trailer, 1, STATE_1)?;
            let scratch_state = trailer.read_swap_state(devices, scratch)?;
            if scratch_state.image_ok == Flag::Set {
                trailer.write_image_ok(devices, primary)?;
            }
            if scratch_state.swap_type != SwapType::None {
                trailer.write_swap_info(devices, primary, swapper.image_index, scratch_state.swap_type)?;
            }
            trailer.write_swap_size(devices, primary, status.swap_size)?;
            swapper.write_keys(devices, primary, status)?;
            trailer.write_magic(devices, primary)?;
        }

        status.use_scratch = false;
        swapper.write_status(devices, status)?;
        status.idx += 1;
        status.state = STATE_0;

        if scratch_used {
            scratch.erase(devices, 0, scratch.size())?;
        }
    }
    Ok(())
}
