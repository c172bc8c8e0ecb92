use super::*;
use crate::devices::validator::for_each_dependency;
use core::cmp::Ordering;

impl<'k, D: FlashDevices, V: SignatureVerifier, C: SecurityCounters> Bootloader<'k, D, V, C> {
    /// Cancels pending upgrades whose image depends on a version another
    /// image won't have once this boot is over. Cancelling one upgrade can
    /// break what an earlier image relied on, so every cancellation starts
    /// the check over.
    pub(super) fn check_dependencies(&mut self, states: &mut [ImageState]) -> Result<(), Error> {
        let mut image_index = 0;
        while image_index < states.len() {
            let state = states[image_index];
            let slot = state.upcoming_slot();
            let header = state.headers[slot.index()];
            if header.has_magic() && !self.dependencies_met(image_index as u8, slot, &header, states)? {
                if matches!(state.swap_type, SwapType::Test | SwapType::Perm) && !state.swapped {
                    warn!("Image {}: dependencies not met, upgrade cancelled", image_index);
                    states[image_index].swap_type = SwapType::None;
                    image_index = 0;
                    continue;
                }
                warn!("Image {}: dependencies of the {} slot are not met", image_index, slot.as_str());
            }
            image_index += 1;
        }
        Ok(())
    }

    fn dependencies_met(
        &mut self,
        image_index: u8,
        slot: Slot,
        header: &ImageHeader,
        states: &[ImageState],
    ) -> Result<bool, Error> {
        let area = self.open_slot(image_index, slot)?;
        let mut met = true;
        let visited = for_each_dependency(&mut self.devices, header, &area, |dependency| {
            let satisfied = states
                .get(dependency.image_id as usize)
                .filter(|_| dependency.image_id != image_index)
                .map_or(false, |other| {
                    let upcoming = &other.headers[other.upcoming_slot().index()];
                    upcoming.has_magic() && upcoming.version.semantic_cmp(&dependency.min_version) != Ordering::Less
                });
            if !satisfied {
                info!(
                    "Image {} needs image {} at version {}.{} or later",
                    image_index,
                    dependency.image_id,
                    dependency.min_version.major,
                    dependency.min_version.minor
                );
                met = false;
            }
            Ok(())
        });
        match visited {
            Ok(()) => Ok(met),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Image {}: unreadable dependencies ({})", image_index, e.as_str());
                Ok(false)
            }
        }
    }
}
