//! # Swapstone
//!
//! Image validation and power-loss safe slot management for MCU secure
//! bootloaders, in library form. Board support code provides the flash
//! drivers and key material, and jumps to whatever [`Bootloader::boot`]
//! picks.
//!
//! [`Bootloader::boot`]: devices::bootloader::Bootloader::boot
#![cfg_attr(test, allow(unused_imports))]
#![cfg_attr(target_arch = "arm", no_std)]

pub mod utilities {
    pub mod cursor;
    pub mod memory;
}

pub mod config;
pub mod devices;
pub mod error;
pub mod hal;
pub mod logging;
