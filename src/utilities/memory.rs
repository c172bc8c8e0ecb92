//! Utilities to manipulate generic memory

/// Rounds `value` up to the next multiple of `alignment` (a power of two
/// or any non zero value).
pub const fn align_up(value: usize, alignment: usize) -> usize {
    match value % alignment {
        0 => value,
        remainder => value + (alignment - remainder),
    }
}

/// Whether every byte of `bytes` reads as `erased_value`.
pub fn is_erased(bytes: &[u8], erased_value: u8) -> bool {
    bytes.iter().all(|b| *b == erased_value)
}
