//! Fault injection hardening.
//!
//! A single glitched branch must not turn a failed check into a boot. A
//! [`FihInt`] stores its value twice, once masked; reading a value whose
//! copies disagree is a [`Panic`](Error::Panic). Security decisions are
//! taken on [`FihBool`]s that are built from several independent
//! observations and only read as true when every copy agrees.
use crate::error::Error;
use core::{hint::black_box, sync::atomic::{compiler_fence, Ordering}};

const MASK: u32 = 0xA5C3_5A3C;
/// Arbitrary, far from 0, 1 and all ones.
const TRUE_PATTERN: u32 = 0x3CA5_C35A;
const FALSE_PATTERN: u32 = 0x5A3C_A5C3;

/// An integer carrying its own integrity check.
#[derive(Clone, Copy, Debug)]
pub struct FihInt {
    value: u32,
    masked: u32,
}

impl FihInt {
    pub fn new(value: u32) -> Self { Self { value, masked: value ^ MASK } }

    fn is_intact(&self) -> bool {
        compiler_fence(Ordering::SeqCst);
        black_box(self.value) ^ MASK == black_box(self.masked)
    }

    pub fn value(&self) -> Result<u32, Error> {
        if self.is_intact() {
            Ok(self.value)
        } else {
            Err(Error::Panic("verified value corrupted"))
        }
    }

    /// Compares two hardened values, checking both integrity tags first.
    pub fn equals(&self, other: &FihInt) -> Result<bool, Error> {
        let (a, b) = (self.value()?, other.value()?);
        compiler_fence(Ordering::SeqCst);
        Ok(black_box(a) == black_box(b) && black_box(self.masked) == black_box(other.masked))
    }
}

/// A hardened boolean. Anything but the two reserved patterns is a fault.
#[derive(Clone, Copy, Debug)]
pub struct FihBool(FihInt);

impl FihBool {
    pub fn new(value: bool) -> Self { Self(FihInt::new(if value { TRUE_PATTERN } else { FALSE_PATTERN })) }
    pub fn success() -> Self { Self::new(true) }
    pub fn failure() -> Self { Self::new(false) }

    pub fn is_true(&self) -> Result<bool, Error> {
        match self.0.value()? {
            TRUE_PATTERN => Ok(true),
            FALSE_PATTERN => Ok(false),
            _ => Err(Error::Panic("verified flag corrupted")),
        }
    }

    /// True only if both are true. Each operand is checked separately so
    /// skipping one evaluation cannot produce a success.
    pub fn and(self, other: FihBool) -> Result<FihBool, Error> {
        let first = self.is_true()?;
        compiler_fence(Ordering::SeqCst);
        let second = other.is_true()?;
        Ok(FihBool::new(black_box(first) && black_box(second)))
    }
}

/// Runs a check twice and only reports success when both runs succeeded
/// with the same evidence (e.g. the image digest).
pub fn check_twice<T, F>(mut check: F) -> Result<(T, FihBool), Error>
where
    F: FnMut() -> Result<T, Error>,
    T: PartialEq,
{
    let first = check()?;
    compiler_fence(Ordering::SeqCst);
    let second = check()?;
    let agree = black_box(&first) == black_box(&second);
    if !agree {
        return Err(Error::Panic("repeated check disagrees"));
    }
    Ok((first, FihBool::success().and(FihBool::new(agree))?))
}
