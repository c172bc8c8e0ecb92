//! Hardware Abstraction Layer, containing the interfaces
//! the boot core expects from low level flash drivers.

pub mod flash;
pub mod ram;

#[cfg(not(target_arch = "arm"))]
#[doc(hidden)]
pub mod doubles;
