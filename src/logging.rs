//! Logging front end.
//!
//! Every module logs through these re-exports so the backend is picked
//! in one place: `defmt` on target builds that enable it, the `log`
//! facade otherwise. Call sites stick to `{}` with integers and string
//! slices, which both backends accept.

#[cfg(feature = "defmt")]
pub use defmt::{debug, error, info, trace, warn};

#[cfg(not(feature = "defmt"))]
pub use log::{debug, error, info, trace, warn};
