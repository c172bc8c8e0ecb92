//! Error type for the boot core as a whole.
use core::fmt::{self, Display, Formatter};

/// Top level error type for the boot core.
///
/// Module level failures (parsing, crypto, device drivers) are converted
/// into one of these categories before they reach the orchestrator, so the
/// decision of whether to erase a slot, fall back or halt only ever depends
/// on the variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A flash device reported a failure.
    FlashIo(&'static str),
    /// An access would reach past the end of a flash area.
    OutOfBounds,
    /// A write did not respect the device's write granularity.
    Misaligned,
    /// No flash area is mapped for the requested id.
    AreaNotFound,
    /// Caller supplied arguments that can never be satisfied.
    BadArgs(&'static str),
    /// Malformed header or TLV area. The slot is treated as empty.
    BadImage(&'static str),
    HashMismatch,
    KeyNotFound,
    SignatureInvalid,
    CounterRollback,
    /// The image does not fit the slot once the trailer is reserved.
    InsufficientSpace,
    /// Slot or scratch layouts can't be exchanged.
    IncompatibleLayout,
    /// No slot holds an image that can be booted.
    NoBootableImage,
    /// An invariant was violated; continuing could run unverified code.
    Panic(&'static str),
}

impl Error {
    /// Errors that mark an image as untrusted. A candidate slot failing
    /// with one of these may be erased.
    pub fn is_untrusted(&self) -> bool {
        matches!(
            self,
            Error::BadImage(_)
                | Error::HashMismatch
                | Error::KeyNotFound
                | Error::SignatureInvalid
                | Error::CounterRollback
        )
    }

    /// Errors that make the boot attempt unrecoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::FlashIo(_)
                | Error::OutOfBounds
                | Error::Misaligned
                | Error::NoBootableImage
                | Error::Panic(_)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Error::FlashIo(_) => "flash io",
            Error::OutOfBounds => "out of bounds",
            Error::Misaligned => "misaligned",
            Error::AreaNotFound => "area not found",
            Error::BadArgs(_) => "bad arguments",
            Error::BadImage(_) => "bad image",
            Error::HashMismatch => "hash mismatch",
            Error::KeyNotFound => "key not found",
            Error::SignatureInvalid => "signature invalid",
            Error::CounterRollback => "security counter rollback",
            Error::InsufficientSpace => "insufficient space",
            Error::IncompatibleLayout => "incompatible layout",
            Error::NoBootableImage => "no bootable image",
            Error::Panic(_) => "panic",
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::FlashIo(text) => write!(f, "[Flash Error] -> {}", text),
            Error::BadArgs(text) => write!(f, "[Configuration Error] -> {}", text),
            Error::BadImage(text) => write!(f, "[Image Error] -> Malformed image: {}", text),
            Error::Panic(text) => write!(f, "[Panic] -> {}", text),
            other => write!(f, "[Boot Error] -> {}", other.as_str()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_families_do_not_overlap() {
        let all = [
            Error::FlashIo("x"),
            Error::OutOfBounds,
            Error::Misaligned,
            Error::AreaNotFound,
            Error::BadArgs("x"),
            Error::BadImage("x"),
            Error::HashMismatch,
            Error::KeyNotFound,
            Error::SignatureInvalid,
            Error::CounterRollback,
            Error::InsufficientSpace,
            Error::IncompatibleLayout,
            Error::NoBootableImage,
            Error::Panic("x"),
        ];
        assert!(all.iter().all(|e| !(e.is_untrusted() && e.is_fatal())));
        assert_eq!(all.iter().filter(|e| e.is_untrusted()).count(), 5);
    }

    #[test]
    fn reports_carry_their_context() {
        assert_eq!(
            format!("{}", Error::BadImage("TLV out of bounds")),
            "[Image Error] -> Malformed image: TLV out of bounds"
        );
        assert_eq!(format!("{}", Error::HashMismatch), "[Boot Error] -> hash mismatch");
    }
}
