//! Modules with business logic related to the problem domain, laying on
//! top of the abstract flash drivers in `hal`. Devices are generic; board
//! specifics (memory map, keys) are handed in through `config`.

pub mod bootloader;
pub mod crypto;
pub mod fih;
pub mod flash_map;
pub mod image;
pub mod security_counter;
pub mod status;
pub mod swap;
pub mod trailer;
pub mod validator;
