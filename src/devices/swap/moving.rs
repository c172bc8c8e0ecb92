//! Scratch-free swap.
//!
//! Every primary sector holding image data is first shifted up by one
//! sector, starting from the top. The slots are then exchanged sector by
//! sector through the hole this leaves:
//!
//! 1. secondary[i] -> primary[i]
//! 2. primary[i + 1] (the old primary[i]) -> secondary[i]
//!
//! Both slots need uniform sectors of the same size, and the primary slot
//! may have one sector more than the secondary. The status log lives in
//! the primary trailer: one entry per moved sector in its first
//! `MAX_IMG_SECTORS` positions, then two entries per swapped sector.
use super::Swapper;
use crate::{
    devices::{
        flash_map::{FlashArea, FlashDevices, Slot, MAX_IMG_SECTORS},
        image::ImageHeader,
        status::{self, BootStatus, LogScan, Operation, StatusSource, STATE_0, STATE_1, STATUS_IDX_0},
        trailer::{Flag, Magic},
    },
    error::Error,
    logging::{debug, info, warn},
};

const SWAP_STATES: usize = 2;

fn sector_size(swapper: &Swapper) -> Result<u32, Error> { Ok(swapper.primary().sector(0)?.size) }

/// Number of sectors `swap_size` bytes touch, at least one.
fn last_index(swap_size: u32, sector: u32) -> u32 { ((swap_size + sector - 1) / sector).max(1) }

fn first_trailer_index(swapper: &Swapper, sector: u32) -> Result<u32, Error> {
    let primary = swapper.primary();
    let trailer_sectors = (swapper.trailer().size_in(primary) + sector - 1) / sector;
    (primary.sector_count() as u32).checked_sub(trailer_sectors).ok_or(Error::InsufficientSpace)
}

pub(super) fn check_layout(swapper: &Swapper) -> Result<(), Error> {
    let (primary, secondary) = (swapper.primary(), swapper.secondary());
    let sector = sector_size(swapper)?;
    let uniform = |area: &FlashArea| area.sectors().iter().all(|s| s.size == sector);
    if !uniform(primary) || !uniform(secondary) {
        warn!("Cannot upgrade: slots need uniform sectors of the same size");
        return Err(Error::IncompatibleLayout);
    }
    let (primary_count, secondary_count) = (primary.sector_count(), secondary.sector_count());
    if primary_count != secondary_count && primary_count != secondary_count + 1 {
        warn!("Cannot upgrade: primary has {} sectors, secondary {}", primary_count, secondary_count);
        return Err(Error::IncompatibleLayout);
    }
    Ok(())
}

pub(super) fn status_source<D: FlashDevices>(
    swapper: &Swapper,
    devices: &mut D,
) -> Result<StatusSource, Error> {
    let trailer = swapper.trailer();
    let primary = trailer.read_swap_state(devices, swapper.primary())?;
    let secondary_magic = trailer.read_magic(devices, swapper.secondary())?;
    let source = if primary.magic == Magic::Good
        && primary.copy_done == Flag::Unset
        && secondary_magic != Magic::Good
    {
        StatusSource::Primary
    } else {
        StatusSource::None
    };
    debug!("Status source: {}", source.as_str());
    Ok(source)
}

/// Scans the move entries and the swap entries of the primary log.
pub(super) fn scan_log<D: FlashDevices>(swapper: &Swapper, devices: &mut D) -> Result<LogScan, Error> {
    let (primary, trailer) = (swapper.primary(), swapper.trailer());
    let moves = status::scan_log(devices, primary, trailer, 0, MAX_IMG_SECTORS)?;
    let swaps =
        status::scan_log(devices, primary, trailer, MAX_IMG_SECTORS, SWAP_STATES * MAX_IMG_SECTORS)?;

    let inconsistent = moves.inconsistent
        || swaps.inconsistent
        || (swaps.written.is_some() && moves.written.is_none());
    let written = match swaps.written {
        Some(swapped) => Some(MAX_IMG_SECTORS + swapped),
        None => moves.written,
    };
    Ok(LogScan { written, inconsistent })
}

pub(super) fn decode_progress(written: usize, status: &mut BootStatus) {
    if written < MAX_IMG_SECTORS {
        status.op = Operation::Move;
        status.idx = written as u32 + STATUS_IDX_0;
        status.state = STATE_0;
    } else {
        let swapped = written - MAX_IMG_SECTORS;
        status.op = Operation::Swap;
        status.idx = (swapped / SWAP_STATES) as u32 + STATUS_IDX_0;
        status.state = (swapped % SWAP_STATES) as u8 + STATE_0;
    }
}

pub(super) fn log_entry(status: &BootStatus) -> usize {
    let idx = (status.idx - STATUS_IDX_0) as usize;
    match status.op {
        Operation::Move => idx,
        Operation::Swap => MAX_IMG_SECTORS + idx * SWAP_STATES + (status.state - STATE_0) as usize,
    }
}

/// Where the header `slot` held before the swap is found, given how far
/// an interrupted swap got.
pub(super) fn header_location(
    swapper: &Swapper,
    slot: Slot,
    status: &BootStatus,
) -> Result<(Slot, u32), Error> {
    if status.is_reset() {
        return Ok((slot, 0));
    }
    let sector = sector_size(swapper)?;
    let last = last_index(status.swap_size, sector);
    Ok(match (status.op, slot) {
        (Operation::Move, Slot::Primary) if status.idx > last => (Slot::Primary, sector),
        (Operation::Swap, _) if status.idx > STATUS_IDX_0 && status.idx <= last => (slot.other(), 0),
        (Operation::Swap, Slot::Primary) if status.idx == STATUS_IDX_0 => (Slot::Primary, sector),
        (Operation::Swap, Slot::Secondary) if status.idx == STATUS_IDX_0 && status.state == STATE_1 => {
            (Slot::Primary, 0)
        }
        _ => (slot, 0),
    })
}

pub(super) fn run<D: FlashDevices>(
    swapper: &Swapper,
    devices: &mut D,
    status: &mut BootStatus,
    headers: &[ImageHeader; 2],
) -> Result<(), Error> {
    check_layout(swapper)?;
    let sector = sector_size(swapper)?;
    let last = last_index(status.swap_size, sector);
    if status.is_reset() && last >= first_trailer_index(swapper, sector)? {
        warn!("Cannot upgrade: {} bytes leave no room for the trailer", status.swap_size);
        return Err(Error::InsufficientSpace);
    }
    info!("Swapping {} sectors without scratch", last);

    if status.op == Operation::Move {
        for idx in (1..=last).rev() {
            if idx + status.idx <= last + 1 {
                move_sector_up(swapper, devices, idx, sector, status, headers)?;
            }
        }
        status.op = Operation::Swap;
        status.idx = STATUS_IDX_0;
        status.state = STATE_0;
    }

    for idx in 1..=last {
        if idx >= status.idx {
            swap_sectors(swapper, devices, idx, sector, status, headers)?;
        }
    }
    Ok(())
}

fn move_sector_up<D: FlashDevices>(
    swapper: &Swapper,
    devices: &mut D,
    idx: u32,
    sector: u32,
    status: &mut BootStatus,
    headers: &[ImageHeader; 2],
) -> Result<(), Error> {
    let (primary, secondary) = (swapper.primary(), swapper.secondary());
    if status.idx == STATUS_IDX_0 {
        if status.source != StatusSource::Primary {
            swapper.erase_trailer_sectors(devices, primary)?;
            swapper.status_init(devices, primary, status)?;
        }
        swapper.erase_trailer_sectors(devices, secondary)?;
    }

    primary.erase(devices, idx * sector, sector)?;
    swapper.copy_region(devices, primary, primary, (idx - 1) * sector, idx * sector, sector, headers, &status.keys)?;
    swapper.write_status(devices, status)?;
    status.idx += 1;
    Ok(())
}

fn swap_sectors<D: FlashDevices>(
    swapper: &Swapper,
    devices: &mut D,
    idx: u32,
    sector: u32,
    status: &mut BootStatus,
    headers: &[ImageHeader; 2],
) -> Result<(), Error> {
    let (primary, secondary) = (swapper.primary(), swapper.secondary());
    let offset = (idx - 1) * sector;

    if status.state == STATE_0 {
        primary.erase(devices, offset, sector)?;
        swapper.copy_region(devices, secondary, primary, offset, offset, sector, headers, &status.keys)?;
        swapper.write_status(devices, status)?;
        status.state = STATE_1;
    }

    if status.state == STATE_1 {
        secondary.erase(devices, offset, sector)?;
        swapper.copy_region(devices, primary, secondary, idx * sector, offset, sector, headers, &status.keys)?;
        swapper.write_status(devices, status)?;
        status.idx += 1;
        status.state = STATE_0;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{
        super::test_support::{erased_headers, layout, pattern, Layout, SECTOR},
        *,
    };
    use crate::{
        config::SwapMethod,
        devices::{
            flash_map::{AreaDescriptor, AreaId, FlashMap},
            image::{ImageVersion, IMAGE_MAGIC},
            trailer::{SwapType, Trailer},
        },
        hal::doubles::flash::FakeFlash,
    };

    const SWAP_SIZE: u32 = 0x4100;

    fn trailer() -> Trailer { Trailer::new(8, false).unwrap() }

    fn swapper<'a>(primary: &'a FlashArea, secondary: &'a FlashArea) -> Swapper<'a> {
        Swapper::new(SwapMethod::Move, 0, trailer(), primary, secondary, None).unwrap()
    }

    fn fresh(source: StatusSource) -> BootStatus {
        BootStatus { swap_type: SwapType::Test, swap_size: SWAP_SIZE, source, ..BootStatus::reset() }
    }

    fn header(major: u8) -> ImageHeader {
        ImageHeader {
            magic: IMAGE_MAGIC,
            load_address: 0,
            header_size: 0x20,
            protected_tlv_size: 0,
            image_size: SWAP_SIZE - 0x20,
            flags: 0,
            version: ImageVersion::new(major, 0, 0, 0),
        }
    }

    /// Version 1 in the primary slot, a pending version 2 in the secondary.
    fn seed(devices: &mut [FakeFlash; 1], secondary: &FlashArea) -> (Vec<u8>, Vec<u8>) {
        let mut old = pattern(0x21, SWAP_SIZE as usize);
        let mut new = pattern(0x93, SWAP_SIZE as usize);
        old[..32].copy_from_slice(&header(1).encode());
        new[..32].copy_from_slice(&header(2).encode());
        devices[0].load(0, &old);
        devices[0].load(secondary.offset(), &new);
        trailer().mark_pending(devices, secondary, false).unwrap();
        (old, new)
    }

    #[test]
    fn slots_need_matching_uniform_sectors() {
        let Layout { primary, secondary, .. } = layout(9, 8);
        assert_eq!(check_layout(&swapper(&primary, &secondary)), Ok(()));
        let Layout { primary, secondary, .. } = layout(8, 8);
        assert_eq!(check_layout(&swapper(&primary, &secondary)), Ok(()));
        let Layout { primary, secondary, .. } = layout(10, 8);
        assert_eq!(check_layout(&swapper(&primary, &secondary)), Err(Error::IncompatibleLayout));

        let mut devices = [FakeFlash::new(&[0x1000, 0x1000, 0x2000, 0x1000, 0x1000, 0x1000, 0x1000])];
        let map = FlashMap::new(
            &[
                AreaDescriptor { id: AreaId::Primary(0), device: 0, offset: 0, size: 0x4000 },
                AreaDescriptor { id: AreaId::Secondary(0), device: 0, offset: 0x4000, size: 0x4000 },
            ],
            1,
        )
        .unwrap();
        let primary = map.open(&mut devices, AreaId::Primary(0)).unwrap();
        let secondary = map.open(&mut devices, AreaId::Secondary(0)).unwrap();
        assert_eq!(check_layout(&swapper(&primary, &secondary)), Err(Error::IncompatibleLayout));
    }

    #[test]
    fn log_positions_decode_back_to_progress() {
        let mut status = BootStatus::reset();
        decode_progress(3, &mut status);
        assert_eq!((status.op, status.idx, status.state), (Operation::Move, 4, STATE_0));
        assert_eq!(log_entry(&BootStatus { idx: 3, ..status }), 2);

        decode_progress(MAX_IMG_SECTORS + 3, &mut status);
        assert_eq!((status.op, status.idx, status.state), (Operation::Swap, 2, STATE_1));
        assert_eq!(log_entry(&status), MAX_IMG_SECTORS + 3);
    }

    #[test]
    fn images_reaching_the_trailer_are_refused_before_any_write() {
        let Layout { mut devices, primary, secondary, .. } = layout(9, 8);
        seed(&mut devices, &secondary);
        let before = devices[0].operations();
        let mut status = BootStatus { swap_size: 0x7100, ..fresh(StatusSource::None) };

        let result = swapper(&primary, &secondary).run(&mut devices, &mut status, &erased_headers());

        assert_eq!(result, Err(Error::InsufficientSpace));
        assert_eq!(devices[0].operations(), before);
    }

    #[test]
    fn a_full_swap_exchanges_the_images() {
        // Given
        let Layout { mut devices, primary, secondary, .. } = layout(9, 8);
        let (old, new) = seed(&mut devices, &secondary);
        let swapper = swapper(&primary, &secondary);

        // When
        swapper.run(&mut devices, &mut fresh(StatusSource::None), &erased_headers()).unwrap();

        // Then
        let contents = devices[0].contents();
        assert_eq!(&contents[..SWAP_SIZE as usize], &new[..]);
        assert_eq!(&contents[9 * SECTOR as usize..][..SWAP_SIZE as usize], &old[..]);
        let state = trailer().read_swap_state(&mut devices, &primary).unwrap();
        assert_eq!((state.magic, state.swap_type), (Magic::Good, SwapType::Test));
        assert_eq!(trailer().read_magic(&mut devices, &secondary), Ok(Magic::Unset));
    }

    #[test]
    fn original_headers_are_found_wherever_the_swap_stopped() {
        let Layout { mut devices, primary, secondary, .. } = layout(9, 8);
        seed(&mut devices, &secondary);
        let swapper = swapper(&primary, &secondary);
        let start = devices[0].operations();
        swapper.run(&mut devices, &mut fresh(StatusSource::None), &erased_headers()).unwrap();
        let operations = devices[0].operations() - start;

        for n in 1..=operations {
            // Given a swap interrupted at the nth operation
            let Layout { mut devices, primary, secondary, .. } = layout(9, 8);
            seed(&mut devices, &secondary);
            let swapper = self::swapper(&primary, &secondary);
            devices[0].lose_power_after(n);
            assert!(swapper.run(&mut devices, &mut fresh(StatusSource::None), &erased_headers()).is_err());
            devices[0].power_cycle();

            // When
            let status = swapper.read_status(&mut devices, false).unwrap();
            if status.is_reset() {
                continue;
            }
            let headers = swapper.read_headers(&mut devices, &status).unwrap();

            // Then
            assert_eq!(headers[0].version.major, 1, "primary header lost at {}", n);
            assert_eq!(headers[1].version.major, 2, "secondary header lost at {}", n);
        }
    }

    #[test]
    fn power_loss_at_any_operation_resumes_to_the_same_result() {
        // Given an uninterrupted reference run
        let Layout { mut devices, primary, secondary, .. } = layout(9, 8);
        seed(&mut devices, &secondary);
        let start = devices[0].operations();
        swapper(&primary, &secondary).run(&mut devices, &mut fresh(StatusSource::None), &erased_headers()).unwrap();
        let operations = devices[0].operations() - start;
        let reference = devices[0].contents().to_vec();

        for n in 1..=operations {
            // When power is lost at the nth flash operation
            let Layout { mut devices, primary, secondary, .. } = layout(9, 8);
            seed(&mut devices, &secondary);
            let swapper = swapper(&primary, &secondary);
            devices[0].lose_power_after(n);
            assert!(swapper.run(&mut devices, &mut fresh(StatusSource::None), &erased_headers()).is_err());
            devices[0].power_cycle();

            // And the swap is resumed from flash
            let mut status = swapper.read_status(&mut devices, false).unwrap();
            if status.is_reset() {
                status = fresh(status.source);
            } else {
                assert_eq!((status.swap_size, status.swap_type), (SWAP_SIZE, SwapType::Test));
            }
            swapper.run(&mut devices, &mut status, &erased_headers()).unwrap();

            // Then
            assert!(devices[0].contents() == &reference[..], "diverged after losing power at {}", n);
        }
    }
}
